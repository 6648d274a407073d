//! USB backend abstraction.
//!
//! Defines the `UsbBackend` and `UsbTransport` traits that the connection
//! layer is written against, allowing different implementations (nusb, mock).

use std::sync::Arc;
use std::sync::mpsc::Receiver;
use std::time::Duration;

use thiserror::Error;

use crate::device::{DeviceDescriptor, DeviceKey, InterfaceDescriptor};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device enumeration failed: {0}")]
    EnumerationFailed(String),

    #[error("Device {key} is no longer attached")]
    DeviceGone { key: DeviceKey },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to read descriptors: {0}")]
    DescriptorUnreadable(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Interface {interface} is not claimed")]
    InterfaceNotClaimed { interface: u8 },

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Failed to release device: {0}")]
    ReleaseFailed(String),

    #[error("Hotplug watch failed: {0}")]
    WatchFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a kernel driver detach attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelDriver {
    /// A kernel driver held the interface and was detached.
    Detached,
    /// No kernel driver was bound.
    NotActive,
    /// The platform cannot detach kernel drivers (Windows).
    Unsupported,
}

/// Endpoint address together with the interface that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointRef {
    pub interface: u8,
    pub address: u8,
}

/// Per-device result of an enumeration pass.
pub type DeviceProbe = Result<DeviceDescriptor, TransportError>;

/// Access to the host's USB stack.
pub trait UsbBackend: Send + Sync {
    /// Enumerate attached devices.
    ///
    /// A device whose descriptors cannot be read shows up as an `Err` probe;
    /// only a failure of the enumeration itself is returned as `Err`.
    fn enumerate(&self) -> Result<Vec<DeviceProbe>, TransportError>;

    /// Open a device for exclusive use.
    fn open(&self, device: &DeviceDescriptor) -> Result<Arc<dyn UsbTransport>, TransportError>;

    /// Start watching for hot-unplug; yields the key of each removed device.
    fn watch_detach(&self) -> Result<Receiver<DeviceKey>, TransportError>;
}

/// An opened device.
///
/// All methods take `&self`; the handle is shared between the connection and
/// any transfer channel snapshot still in flight.
pub trait UsbTransport: Send + Sync {
    /// Interface descriptors of the active configuration.
    fn interfaces(&self) -> Result<Vec<InterfaceDescriptor>, TransportError>;

    /// Detach a kernel driver bound to the interface, if any.
    fn detach_kernel_driver(&self, interface: u8) -> Result<KernelDriver, TransportError>;

    /// Claim an interface. Must be called before using any of its endpoints.
    fn claim_interface(&self, interface: u8) -> Result<(), TransportError>;

    /// Write raw bytes to an OUT endpoint.
    fn write(
        &self,
        endpoint: EndpointRef,
        data: &[u8],
        timeout: Duration,
    ) -> Result<usize, TransportError>;

    /// Issue one bounded transfer on an IN endpoint.
    fn read(
        &self,
        endpoint: EndpointRef,
        max_len: usize,
        timeout: Duration,
    ) -> Result<Vec<u8>, TransportError>;

    /// Release all claimed interfaces.
    fn release(&self) -> Result<(), TransportError>;
}
