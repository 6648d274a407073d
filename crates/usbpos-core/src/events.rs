//! Connection and job notifications.
//!
//! Collaborators subscribe a [`PrinterObserver`] to a connection instead of
//! listening on a global event bus.

use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, PoisonError};

use crate::connection::CloseOutcome;
use crate::device::DeviceDescriptor;
use crate::job::{JobId, JobKind};

/// Events emitted by a printer connection and the job processor.
#[derive(Debug, Clone)]
pub enum PrinterEvent {
    /// Connection opened and endpoints bound.
    Connect { device: DeviceDescriptor },
    /// Bound device was unplugged.
    Detach { device: DeviceDescriptor },
    /// Connection dropped because of a detach.
    Disconnect { device: DeviceDescriptor },
    /// `close()` completed.
    Close {
        device: Option<DeviceDescriptor>,
        outcome: CloseOutcome,
    },
    /// Bytes about to be written to the printer.
    Data { bytes: Vec<u8> },
    /// A device was rebound after a detach.
    Found { device: DeviceDescriptor },
    /// The processor picked up a job.
    JobStarted { id: JobId, kind: JobKind },
    /// The job's buffer was written.
    JobCompleted { id: JobId, bytes: usize },
    /// The job was dropped after a failure.
    JobFailed { id: JobId, error: String },
}

/// Observer trait for receiving printer events.
pub trait PrinterObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &PrinterEvent);
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl PrinterObserver for TracingObserver {
    fn on_event(&self, event: &PrinterEvent) {
        match event {
            PrinterEvent::Connect { device } => {
                tracing::info!(device = %device, "Printer connected");
            }
            PrinterEvent::Detach { device } => {
                tracing::warn!(device = %device, "Printer detached");
            }
            PrinterEvent::Disconnect { device } => {
                tracing::info!(device = %device, "Printer disconnected");
            }
            PrinterEvent::Close { device, outcome } => match device {
                Some(device) => tracing::debug!(device = %device, outcome = ?outcome, "Connection closed"),
                None => tracing::debug!(outcome = ?outcome, "Connection closed"),
            },
            PrinterEvent::Data { bytes } => {
                tracing::trace!(len = bytes.len(), head = ?&bytes[..bytes.len().min(32)], "Data");
            }
            PrinterEvent::Found { device } => {
                tracing::info!(device = %device, "Printer found");
            }
            PrinterEvent::JobStarted { id, kind } => {
                tracing::debug!(job = %id, kind = %kind, "Job started");
            }
            PrinterEvent::JobCompleted { id, bytes } => {
                tracing::debug!(job = %id, bytes, "Job completed");
            }
            PrinterEvent::JobFailed { id, error } => {
                tracing::debug!(job = %id, error = %error, "Job failed");
            }
        }
    }
}

/// Observer that forwards every event into a channel.
pub struct ChannelObserver {
    tx: Sender<PrinterEvent>,
}

impl ChannelObserver {
    pub fn new(tx: Sender<PrinterEvent>) -> Self {
        Self { tx }
    }
}

impl PrinterObserver for ChannelObserver {
    fn on_event(&self, event: &PrinterEvent) {
        // A dropped receiver just means nobody listens anymore.
        let _ = self.tx.send(event.clone());
    }
}

/// Fan-out to every subscribed observer.
#[derive(Default)]
pub struct ObserverSet {
    observers: Mutex<Vec<Arc<dyn PrinterObserver>>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, observer: Arc<dyn PrinterObserver>) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    pub fn emit(&self, event: PrinterEvent) {
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer.on_event(&event);
        }
    }
}
