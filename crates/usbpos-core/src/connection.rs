//! Printer connection lifecycle.
//!
//! A [`PrinterConnection`] owns at most one bound device and moves through
//! `Disconnected → Opening → Open`. The state lives behind a mutex that is
//! only held for bookkeeping, never across USB I/O, so a hot-unplug
//! notification can invalidate the binding while a claim or transfer is
//! still running.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::channel::{DEFAULT_READ_LEN, TransferChannel};
use crate::device::{BindTarget, DeviceDescriptor, DeviceKey, DeviceLocator, Direction};
use crate::error::ConnectionError;
use crate::events::{ObserverSet, PrinterEvent, PrinterObserver};
use crate::hotplug::{DetachRegistration, HotplugMonitor};
use crate::transport::{EndpointRef, KernelDriver, TransportError, UsbTransport};

/// Default bound on a single transfer.
pub const DEFAULT_TRANSFER_TIMEOUT: Duration = Duration::from_millis(5000);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Opening,
    Open,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Opening => write!(f, "Opening"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Error => write!(f, "Error"),
        }
    }
}

/// What a successful `close()` actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// A device handle was released.
    Closed,
    /// Nothing was open; no-op.
    AlreadyClosed,
}

/// Endpoints selected while opening.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointBinding {
    pub out: EndpointRef,
    pub input: Option<EndpointRef>,
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionSettings {
    pub transfer_timeout: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            transfer_timeout: DEFAULT_TRANSFER_TIMEOUT,
        }
    }
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    device: Option<DeviceDescriptor>,
    handle: Option<Arc<dyn UsbTransport>>,
    binding: Option<EndpointBinding>,
    /// Bumped by every detach and close; an `open()` that started under an
    /// older generation must not commit.
    generation: u64,
}

fn lock(inner: &Mutex<Inner>) -> MutexGuard<'_, Inner> {
    inner.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Exclusive connection to one USB printer.
pub struct PrinterConnection {
    locator: DeviceLocator,
    target: BindTarget,
    settings: ConnectionSettings,
    inner: Arc<Mutex<Inner>>,
    observers: Arc<ObserverSet>,
    _detach: DetachRegistration,
}

impl PrinterConnection {
    /// Create an unopened connection.
    ///
    /// A `BindTarget::Descriptor` is bound immediately; other targets are
    /// resolved on the first `open()`.
    pub fn new(
        locator: DeviceLocator,
        monitor: &HotplugMonitor,
        target: BindTarget,
        settings: ConnectionSettings,
    ) -> Self {
        let inner = Arc::new(Mutex::new(Inner::default()));
        if let BindTarget::Descriptor(device) = &target {
            lock(&inner).device = Some(device.clone());
        }
        let observers = Arc::new(ObserverSet::new());

        let detach = {
            let inner = inner.clone();
            let observers = observers.clone();
            monitor.register(move |key| on_detached(&inner, &observers, key))
        };

        Self {
            locator,
            target,
            settings,
            inner,
            observers,
            _detach: detach,
        }
    }

    pub fn subscribe(&self, observer: Arc<dyn PrinterObserver>) {
        self.observers.subscribe(observer);
    }

    pub(crate) fn emit(&self, event: PrinterEvent) {
        self.observers.emit(event);
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.inner).state
    }

    /// Currently bound device, if any.
    pub fn device(&self) -> Option<DeviceDescriptor> {
        lock(&self.inner).device.clone()
    }

    /// Endpoint binding; only present while open.
    pub fn binding(&self) -> Option<EndpointBinding> {
        lock(&self.inner).binding
    }

    /// Open the bound device, claim its interfaces and select endpoints.
    #[instrument(level = "debug", skip(self))]
    pub fn open(&self) -> Result<EndpointBinding, ConnectionError> {
        let (bound, generation) = {
            let mut inner = lock(&self.inner);
            if matches!(inner.state, ConnectionState::Opening | ConnectionState::Open) {
                warn!(state = %inner.state, "open() rejected, connection busy");
                return Err(ConnectionError::Busy { state: inner.state });
            }
            inner.state = ConnectionState::Opening;
            (inner.device.clone(), inner.generation)
        };

        let result = self.open_bound(bound, generation);
        if let Err(e) = &result {
            self.abort_open(generation, e);
        }
        result
    }

    fn open_bound(
        &self,
        bound: Option<DeviceDescriptor>,
        generation: u64,
    ) -> Result<EndpointBinding, ConnectionError> {
        let device = match bound {
            Some(device) => device,
            None => {
                let device = self.locator.bind(&self.target)?;
                let mut inner = lock(&self.inner);
                if inner.generation != generation {
                    return Err(ConnectionError::Interrupted);
                }
                inner.device = Some(device.clone());
                device
            }
        };

        let handle = self
            .locator
            .backend()
            .open(&device)
            .map_err(ConnectionError::Open)?;

        let binding = match self.claim_endpoints(handle.as_ref()) {
            Ok(binding) => binding,
            Err(e) => {
                if let Err(release) = handle.release() {
                    debug!(error = %release, "Release after failed open");
                }
                return Err(e);
            }
        };

        {
            let mut inner = lock(&self.inner);
            let same_device = inner.device.as_ref().map(|d| d.key) == Some(device.key);
            if inner.generation != generation || !same_device {
                drop(inner);
                if let Err(release) = handle.release() {
                    debug!(error = %release, "Release after interrupted open");
                }
                return Err(ConnectionError::Interrupted);
            }
            inner.state = ConnectionState::Open;
            inner.handle = Some(handle);
            inner.binding = Some(binding);
        }

        info!(
            device = %device,
            out_ep = %format!("0x{:02X}", binding.out.address),
            in_ep = ?binding.input.map(|ep| format!("0x{:02X}", ep.address)),
            "Printer opened"
        );
        self.emit(PrinterEvent::Connect { device });
        Ok(binding)
    }

    /// Claim every interface; the first OUT and first IN endpoint win.
    fn claim_endpoints(&self, handle: &dyn UsbTransport) -> Result<EndpointBinding, ConnectionError> {
        let interfaces = handle.interfaces().map_err(ConnectionError::Open)?;
        let total = interfaces.len();
        let mut completed = 0;
        let mut out: Option<EndpointRef> = None;
        let mut input: Option<EndpointRef> = None;
        let mut last_error: Option<TransportError> = None;

        for iface in &interfaces {
            match handle.detach_kernel_driver(iface.number) {
                Ok(KernelDriver::Detached) => {
                    debug!(interface = iface.number, "Detached kernel driver");
                }
                Ok(KernelDriver::NotActive | KernelDriver::Unsupported) => {}
                Err(e) => {
                    warn!(interface = iface.number, error = %e, "Could not detach kernel driver");
                }
            }

            match handle.claim_interface(iface.number) {
                Ok(()) => {
                    for ep in &iface.endpoints {
                        let ep_ref = EndpointRef {
                            interface: iface.number,
                            address: ep.address,
                        };
                        match ep.direction {
                            Direction::Out if out.is_none() => out = Some(ep_ref),
                            Direction::In if input.is_none() => input = Some(ep_ref),
                            _ => {}
                        }
                    }
                }
                Err(e) => {
                    // e.g. the interface is held by another process
                    warn!(interface = iface.number, error = %e, "Claim failed");
                    last_error = Some(e);
                }
            }
            completed += 1;
        }

        match out {
            Some(out) => Ok(EndpointBinding { out, input }),
            None => {
                debug_assert_eq!(completed, total);
                Err(ConnectionError::NoEndpointFound {
                    interfaces: completed,
                    last_error,
                })
            }
        }
    }

    fn abort_open(&self, generation: u64, error: &ConnectionError) {
        let mut inner = lock(&self.inner);
        if inner.generation != generation {
            // A detach or close already reset the state.
            return;
        }
        inner.state = match error {
            ConnectionError::NoEndpointFound { .. } | ConnectionError::Open(_) => {
                ConnectionState::Error
            }
            _ => ConnectionState::Disconnected,
        };
        if let ConnectionError::Open(TransportError::DeviceGone { .. }) = error {
            // Missed the unplug; rebind on the next attempt.
            inner.device = None;
        }
        warn!(state = %inner.state, error = %error, "Open failed");
    }

    /// Release the device handle and return to `Disconnected`.
    ///
    /// Safe from any state. Reports [`CloseOutcome::AlreadyClosed`] when no
    /// handle was held.
    #[instrument(level = "debug", skip(self))]
    pub fn close(&self) -> Result<CloseOutcome, ConnectionError> {
        let (handle, device) = {
            let mut inner = lock(&self.inner);
            inner.generation += 1;
            inner.state = ConnectionState::Disconnected;
            inner.binding = None;
            (inner.handle.take(), inner.device.clone())
        };

        let outcome = match handle {
            Some(handle) => {
                handle.release().map_err(ConnectionError::Close)?;
                CloseOutcome::Closed
            }
            None => CloseOutcome::AlreadyClosed,
        };

        self.emit(PrinterEvent::Close { device, outcome });
        Ok(outcome)
    }

    /// Bind a device if none is bound.
    ///
    /// Used after a detach; does not open anything.
    pub fn rebind(&self) -> Result<DeviceDescriptor, ConnectionError> {
        if let Some(device) = self.device() {
            return Ok(device);
        }
        let found = self.locator.bind(&self.target)?;
        let mut inner = lock(&self.inner);
        Ok(inner.device.get_or_insert(found).clone())
    }

    /// Snapshot of the open handle and binding.
    pub fn channel(&self) -> Result<TransferChannel, ConnectionError> {
        let inner = lock(&self.inner);
        match (&inner.state, &inner.handle, inner.binding) {
            (ConnectionState::Open, Some(handle), Some(binding)) => Ok(TransferChannel::new(
                handle.clone(),
                binding,
                self.settings.transfer_timeout,
                self.observers.clone(),
            )),
            _ => Err(ConnectionError::NotOpen),
        }
    }

    /// Write a buffer over the bound OUT endpoint.
    pub fn write(&self, data: &[u8]) -> Result<usize, ConnectionError> {
        self.channel()?.write(data)
    }

    /// One bounded read from the bound IN endpoint.
    pub fn read(&self, max_len: usize) -> Result<Vec<u8>, ConnectionError> {
        self.channel()?.read(max_len)
    }

    /// Read a status reply of up to 64 bytes.
    pub fn read_status(&self) -> Result<Vec<u8>, ConnectionError> {
        self.read(DEFAULT_READ_LEN)
    }
}

impl Drop for PrinterConnection {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.inner).handle.take()
            && let Err(e) = handle.release()
        {
            warn!(error = %e, "Release on drop failed");
        }
    }
}

fn on_detached(inner: &Mutex<Inner>, observers: &ObserverSet, key: DeviceKey) {
    let (device, handle) = {
        let mut inner = lock(inner);
        if inner.device.as_ref().map(|d| d.key) != Some(key) {
            return;
        }
        inner.generation += 1;
        inner.state = ConnectionState::Disconnected;
        inner.binding = None;
        (inner.device.take(), inner.handle.take())
    };
    // Transfers still in flight hold their own reference and fail on their own.
    drop(handle);

    if let Some(device) = device {
        observers.emit(PrinterEvent::Detach {
            device: device.clone(),
        });
        observers.emit(PrinterEvent::Disconnect { device });
    }
}
