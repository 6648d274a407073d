//! Errors reported by the connection layer.

use thiserror::Error;

use crate::connection::ConnectionState;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Can not find printer: {target}")]
    DeviceNotFound { target: String },

    #[error("Can not find endpoint from printer ({interfaces} interfaces tried)")]
    NoEndpointFound {
        interfaces: usize,
        #[source]
        last_error: Option<TransportError>,
    },

    #[error("Connection is not open")]
    NotOpen,

    #[error("Printer has no IN endpoint")]
    NoInEndpoint,

    #[error("Connection is busy ({state})")]
    Busy { state: ConnectionState },

    #[error("Connection was closed or detached while opening")]
    Interrupted,

    #[error("Failed to open device: {0}")]
    Open(#[source] TransportError),

    #[error("Transfer failed: {0}")]
    Transfer(#[source] TransportError),

    #[error("Failed to close device: {0}")]
    Close(#[source] TransportError),

    #[error("Device enumeration failed: {0}")]
    Enumeration(#[from] TransportError),
}
