//! Byte-level transfers over a bound endpoint pair.

use std::sync::Arc;
use std::time::Duration;

use crate::connection::EndpointBinding;
use crate::error::ConnectionError;
use crate::events::{ObserverSet, PrinterEvent};
use crate::transport::UsbTransport;

/// Status and handshake reads are requested in 64-byte chunks.
pub const DEFAULT_READ_LEN: usize = 64;

/// Handle and endpoints of an open connection.
///
/// Obtained from [`PrinterConnection::channel`](crate::PrinterConnection::channel).
/// The channel does not queue: callers serialize their transfers.
pub struct TransferChannel {
    handle: Arc<dyn UsbTransport>,
    binding: EndpointBinding,
    timeout: Duration,
    observers: Arc<ObserverSet>,
}

impl TransferChannel {
    pub(crate) fn new(
        handle: Arc<dyn UsbTransport>,
        binding: EndpointBinding,
        timeout: Duration,
        observers: Arc<ObserverSet>,
    ) -> Self {
        Self {
            handle,
            binding,
            timeout,
            observers,
        }
    }

    /// Write the whole buffer to the OUT endpoint.
    pub fn write(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.observers.emit(PrinterEvent::Data {
            bytes: data.to_vec(),
        });
        self.handle
            .write(self.binding.out, data, self.timeout)
            .map_err(ConnectionError::Transfer)
    }

    /// One transfer of at most `max_len` bytes from the IN endpoint.
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>, ConnectionError> {
        let endpoint = self.binding.input.ok_or(ConnectionError::NoInEndpoint)?;
        self.handle
            .read(endpoint, max_len, self.timeout)
            .map_err(ConnectionError::Transfer)
    }
}
