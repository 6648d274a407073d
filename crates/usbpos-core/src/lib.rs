//! usbpos-core: USB receipt printer connection lifecycle and job queue.
//!
//! This crate discovers printer-class USB devices, keeps one of them bound
//! across unplug/replug cycles, and feeds print jobs to it one at a time.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Transport**: USB backend abstraction (nusb, mock)
//! - **Device**: Discovery and bind-target resolution
//! - **Hotplug**: Removal notifications routed to connections
//! - **Connection**: Open/claim/close lifecycle and bulk transfers
//! - **Supervisor**: Rediscovery after a detach
//! - **Job**: FIFO queue, encoding contracts and the single worker
//! - **Events**: Observer pattern for callers
//! - **Service**: Wires everything together from a [`PrinterConfig`]
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use usbpos_core::{Job, JobEncoder, NusbBackend, PrintService, PrinterConfig, TracingObserver};
//!
//! let config = PrinterConfig {
//!     vendor_id: Some(0x0493),
//!     product_id: Some(0x8760),
//!     ..Default::default()
//! };
//!
//! let service = PrintService::start(
//!     &config,
//!     Arc::new(NusbBackend),
//!     JobEncoder::default(),
//!     Arc::new(TracingObserver),
//! )
//! .expect("service failed to start");
//! service.enqueue(Job::Text("Hello".into())).expect("queue closed");
//! service.drain().expect("worker failed");
//! ```

pub mod channel;
pub mod config;
pub mod connection;
pub mod device;
pub mod encode;
pub mod error;
pub mod events;
pub mod hotplug;
pub mod job;
pub mod processor;
pub mod service;
pub mod supervisor;
pub mod transport;

// Re-exports for convenience
pub use channel::TransferChannel;
pub use config::PrinterConfig;
pub use connection::{
    CloseOutcome, ConnectionSettings, ConnectionState, EndpointBinding, PrinterConnection,
};
pub use device::{BindTarget, DeviceDescriptor, DeviceKey, DeviceLocator, PRINTER_CLASS};
pub use encode::{
    Bitmap, Content, Dithering, EncodeError, EncodeOptions, Encoder, FontSettings, ImageMode,
    JobEncoder, NoRenderer, PlainTextEncoder, Renderer,
};
pub use error::ConnectionError;
pub use events::{ChannelObserver, PrinterEvent, PrinterObserver, TracingObserver};
pub use hotplug::HotplugMonitor;
pub use job::{Job, JobId, JobKind, JobQueue, QueueError, QueuedJob};
pub use processor::{JobError, JobProcessor};
pub use service::PrintService;
pub use supervisor::ReconnectSupervisor;
pub use transport::{MockBackend, MockDevice, NusbBackend, TransportError, UsbBackend, UsbTransport};
