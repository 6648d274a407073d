//! Rediscovery after a printer is unplugged.
//!
//! The supervisor only rebinds. The next job's `open()` picks up the new
//! device on its own.

use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::connection::PrinterConnection;
use crate::events::{PrinterEvent, PrinterObserver};

/// Wait between a detach and the rediscovery attempt.
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(5);

enum Signal {
    Detached(Instant),
    Stop,
}

struct DetachForwarder {
    tx: Sender<Signal>,
}

impl PrinterObserver for DetachForwarder {
    fn on_event(&self, event: &PrinterEvent) {
        if let PrinterEvent::Detach { .. } = event {
            let _ = self.tx.send(Signal::Detached(Instant::now()));
        }
    }
}

/// Background thread that rebinds the connection after detaches.
pub struct ReconnectSupervisor {
    tx: Sender<Signal>,
    worker: Option<JoinHandle<()>>,
}

impl ReconnectSupervisor {
    pub fn spawn(connection: Arc<PrinterConnection>, grace: Duration) -> std::io::Result<Self> {
        let (tx, rx) = mpsc::channel();
        connection.subscribe(Arc::new(DetachForwarder { tx: tx.clone() }));

        let worker = thread::Builder::new()
            .name("reconnect".into())
            .spawn(move || supervise(&connection, &rx, grace))?;

        debug!(grace_ms = grace.as_millis() as u64, "Reconnect supervisor started");
        Ok(Self {
            tx,
            worker: Some(worker),
        })
    }

    /// Interrupt any pending wait and join the thread.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(Signal::Stop);
        if let Some(worker) = self.worker.take()
            && worker.join().is_err()
        {
            warn!("Reconnect supervisor panicked");
        }
    }
}

impl Drop for ReconnectSupervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn supervise(connection: &PrinterConnection, rx: &Receiver<Signal>, grace: Duration) {
    while let Ok(Signal::Detached(at)) = rx.recv() {
        info!(
            grace_ms = grace.as_millis() as u64,
            "Device detached, waiting before rediscovery"
        );
        let mut deadline = at + grace;
        let mut attempt = 0u32;

        loop {
            let Some(next) = wait_until(rx, deadline, grace) else {
                debug!("Reconnect supervisor stopped");
                return;
            };
            deadline = next;
            if Instant::now() < deadline {
                continue;
            }

            attempt += 1;
            match connection.rebind() {
                Ok(device) => {
                    info!(attempt, device = %device, "Printer rebound");
                    connection.emit(PrinterEvent::Found { device });
                    break;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "Rediscovery failed, retrying");
                    deadline = Instant::now() + grace;
                }
            }
        }
    }
    debug!("Reconnect supervisor stopped");
}

/// Sleep until `deadline`, pushing it back for every further detach.
///
/// Returns the (possibly extended) deadline, or `None` when asked to stop.
fn wait_until(rx: &Receiver<Signal>, mut deadline: Instant, grace: Duration) -> Option<Instant> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Some(deadline);
        }
        match rx.recv_timeout(deadline - now) {
            Ok(Signal::Detached(at)) => deadline = deadline.max(at + grace),
            Ok(Signal::Stop) | Err(RecvTimeoutError::Disconnected) => return None,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{ConnectionSettings, ConnectionState};
    use crate::device::{BindTarget, DeviceKey, DeviceLocator};
    use crate::events::ChannelObserver;
    use crate::hotplug::HotplugMonitor;
    use crate::transport::{MockBackend, MockDevice};

    struct Fixture {
        backend: MockBackend,
        monitor: HotplugMonitor,
        connection: Arc<PrinterConnection>,
        events: Receiver<PrinterEvent>,
    }

    fn fixture() -> Fixture {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(1, 0x0493, 0x8760));
        let monitor = HotplugMonitor::new();
        let connection = Arc::new(PrinterConnection::new(
            DeviceLocator::new(Arc::new(backend.clone())),
            &monitor,
            BindTarget::AnyPrinter,
            ConnectionSettings::default(),
        ));
        let (tx, events) = mpsc::channel();
        connection.subscribe(Arc::new(ChannelObserver::new(tx)));
        Fixture {
            backend,
            monitor,
            connection,
            events,
        }
    }

    fn wait_for_found(events: &Receiver<PrinterEvent>, timeout: Duration) -> Option<PrinterEvent> {
        let deadline = Instant::now() + timeout;
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event @ PrinterEvent::Found { .. }) => return Some(event),
                Ok(_) => {}
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_rebind_not_before_grace_period() {
        let f = fixture();
        let grace = Duration::from_millis(80);
        let supervisor = ReconnectSupervisor::spawn(f.connection.clone(), grace).unwrap();
        f.connection.open().unwrap();

        let detached_at = Instant::now();
        f.backend.unplug(DeviceKey(1));
        f.monitor.dispatch(DeviceKey(1));
        f.backend.attach(MockDevice::printer(2, 0x0493, 0x8760));

        let found = wait_for_found(&f.events, Duration::from_secs(5)).expect("no Found event");
        assert!(detached_at.elapsed() >= grace);
        assert!(matches!(found, PrinterEvent::Found { device } if device.key == DeviceKey(2)));

        // Rebinding never opens the device.
        assert_eq!(f.connection.state(), ConnectionState::Disconnected);
        assert_eq!(f.connection.device().map(|d| d.key), Some(DeviceKey(2)));
        supervisor.stop();
    }

    #[test]
    fn test_detach_events_fire_once_and_found_waits_for_device() {
        let f = fixture();
        let supervisor =
            ReconnectSupervisor::spawn(f.connection.clone(), Duration::from_millis(20)).unwrap();
        f.connection.open().unwrap();
        let _ = f.events.try_iter().count();

        f.backend.unplug(DeviceKey(1));
        f.monitor.dispatch(DeviceKey(1));

        // Nothing to rebind to yet.
        thread::sleep(Duration::from_millis(150));
        let seen: Vec<_> = f.events.try_iter().collect();
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, PrinterEvent::Detach { .. }))
                .count(),
            1
        );
        assert_eq!(
            seen.iter()
                .filter(|e| matches!(e, PrinterEvent::Disconnect { .. }))
                .count(),
            1
        );
        assert!(!seen.iter().any(|e| matches!(e, PrinterEvent::Found { .. })));
        assert_eq!(f.connection.state(), ConnectionState::Disconnected);

        f.backend.attach(MockDevice::printer(3, 0x0493, 0x8760));
        assert!(wait_for_found(&f.events, Duration::from_secs(5)).is_some());
        supervisor.stop();
    }

    #[test]
    fn test_stop_interrupts_grace_wait() {
        let f = fixture();
        let supervisor =
            ReconnectSupervisor::spawn(f.connection.clone(), Duration::from_secs(30)).unwrap();
        f.connection.open().unwrap();
        f.backend.unplug(DeviceKey(1));
        f.monitor.dispatch(DeviceKey(1));

        let start = Instant::now();
        supervisor.stop();
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
