//! Process-wide hot-unplug notifications.
//!
//! The backend produces one stream of removed device keys; the monitor fans
//! it out to registered listeners. Each registration is released when its
//! [`DetachRegistration`] guard is dropped, so a listener never outlives the
//! object that installed it.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::device::DeviceKey;
use crate::transport::{TransportError, UsbBackend};

/// How often an idle dispatcher checks whether its monitor is gone.
const DISPATCH_POLL: Duration = Duration::from_millis(200);

type DetachCallback = Arc<dyn Fn(DeviceKey) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: BTreeMap<u64, DetachCallback>,
}

/// Dispatches device removal to registered listeners.
#[derive(Clone, Default)]
pub struct HotplugMonitor {
    listeners: Arc<Mutex<Listeners>>,
}

impl HotplugMonitor {
    /// A monitor that is only fed through [`HotplugMonitor::dispatch`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch the backend for removals on a background thread.
    ///
    /// The dispatcher thread exits shortly after the last clone of the
    /// monitor is dropped. Dropping its receiver lets the backend's watch
    /// thread stop at the next removal it sees.
    pub fn start(backend: &dyn UsbBackend) -> Result<Self, TransportError> {
        let removals = backend.watch_detach()?;
        let monitor = Self::new();
        let listeners = Arc::downgrade(&monitor.listeners);

        thread::Builder::new()
            .name("hotplug-dispatch".into())
            .spawn(move || dispatch_loop(&removals, &listeners))?;

        info!("Hotplug monitor started");
        Ok(monitor)
    }

    /// Register a listener for device removals.
    pub fn register<F>(&self, callback: F) -> DetachRegistration
    where
        F: Fn(DeviceKey) + Send + Sync + 'static,
    {
        let mut listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.callbacks.insert(id, Arc::new(callback));
        DetachRegistration {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Deliver one removal to every listener.
    pub fn dispatch(&self, key: DeviceKey) {
        let callbacks: Vec<_> = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .values()
            .cloned()
            .collect();
        debug!(key = %key, listeners = callbacks.len(), "Dispatching removal");
        for callback in callbacks {
            callback(key);
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callbacks
            .len()
    }
}

fn dispatch_loop(removals: &Receiver<DeviceKey>, listeners: &Weak<Mutex<Listeners>>) {
    loop {
        match removals.recv_timeout(DISPATCH_POLL) {
            Ok(key) => match listeners.upgrade() {
                Some(listeners) => HotplugMonitor { listeners }.dispatch(key),
                None => break,
            },
            Err(RecvTimeoutError::Timeout) => {
                if listeners.strong_count() == 0 {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                debug!("Hotplug stream ended");
                return;
            }
        }
    }
    debug!("Hotplug monitor dropped, dispatcher stopped");
}

/// Keeps a detach listener registered until dropped.
pub struct DetachRegistration {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Drop for DetachRegistration {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .callbacks
                .remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockBackend, MockDevice};
    use std::sync::mpsc;
    use std::time::Instant;

    #[test]
    fn test_registration_released_on_drop() {
        let monitor = HotplugMonitor::new();
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let guard = monitor.register(move |key| {
            tx.lock().unwrap().send(key).unwrap();
        });
        assert_eq!(monitor.listener_count(), 1);

        monitor.dispatch(DeviceKey(5));
        assert_eq!(rx.recv().unwrap(), DeviceKey(5));

        drop(guard);
        assert_eq!(monitor.listener_count(), 0);
        monitor.dispatch(DeviceKey(6));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_started_monitor_forwards_backend_removals() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(3, 0x0493, 0x8760));
        let monitor = HotplugMonitor::start(&backend).unwrap();

        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let _guard = monitor.register(move |key| {
            let _ = tx.lock().unwrap().send(key);
        });

        backend.unplug(DeviceKey(3));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), DeviceKey(3));
    }

    #[test]
    fn test_dispatcher_stops_when_monitor_dropped() {
        let backend = MockBackend::new();
        let monitor = HotplugMonitor::start(&backend).unwrap();
        assert_eq!(backend.watcher_count(), 1);

        drop(monitor);

        // A finished dispatcher drops its receiver; the next unplug prunes it.
        let deadline = Instant::now() + Duration::from_secs(5);
        while backend.watcher_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
            backend.unplug(DeviceKey(99));
        }
        assert_eq!(backend.watcher_count(), 0);
    }
}
