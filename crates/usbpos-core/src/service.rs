//! Wires the connection, reconnect supervisor, queue and worker together.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use tracing::{info, warn};

use crate::config::PrinterConfig;
use crate::connection::PrinterConnection;
use crate::device::DeviceLocator;
use crate::encode::JobEncoder;
use crate::events::PrinterObserver;
use crate::hotplug::HotplugMonitor;
use crate::job::{Job, JobId, JobQueue, QueueError};
use crate::processor::JobProcessor;
use crate::supervisor::ReconnectSupervisor;
use crate::transport::UsbBackend;

/// A running print pipeline for one printer.
pub struct PrintService {
    connection: Arc<PrinterConnection>,
    queue: Arc<JobQueue>,
    _monitor: HotplugMonitor,
    supervisor: Option<ReconnectSupervisor>,
    worker: Option<JoinHandle<()>>,
}

impl PrintService {
    /// Start the pipeline. No device is touched until the first job arrives.
    pub fn start(
        config: &PrinterConfig,
        backend: Arc<dyn UsbBackend>,
        encoder: JobEncoder,
        observer: Arc<dyn PrinterObserver>,
    ) -> Result<Self> {
        let monitor = match HotplugMonitor::start(backend.as_ref()) {
            Ok(monitor) => monitor,
            Err(e) => {
                warn!(error = %e, "Hotplug monitoring unavailable, unplugs will surface as transfer errors");
                HotplugMonitor::new()
            }
        };

        let target = config.bind_target();
        let connection = Arc::new(PrinterConnection::new(
            DeviceLocator::new(backend),
            &monitor,
            target.clone(),
            config.connection_settings(),
        ));
        connection.subscribe(observer);

        let supervisor = ReconnectSupervisor::spawn(connection.clone(), config.reconnect_grace())
            .context("Failed to start reconnect supervisor")?;

        let queue = Arc::new(JobQueue::with_capacity(config.queue_capacity));
        let encoder = encoder
            .with_options(config.encoding.clone())
            .with_font(config.font.clone());
        let processor = JobProcessor::new(connection.clone(), queue.clone(), encoder)
            .with_interval(config.job_interval());
        let worker = thread::Builder::new()
            .name("job-processor".into())
            .spawn(move || processor.run())
            .context("Failed to start job processor")?;

        info!(target = %target, "Print service started");
        Ok(Self {
            connection,
            queue,
            _monitor: monitor,
            supervisor: Some(supervisor),
            worker: Some(worker),
        })
    }

    pub fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        self.queue.enqueue(job)
    }

    pub fn connection(&self) -> &Arc<PrinterConnection> {
        &self.connection
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Stop accepting jobs, print what is queued, then stop.
    pub fn drain(mut self) -> Result<()> {
        self.queue.close();
        self.join()
    }

    /// Stop after the current job; pending jobs are discarded.
    pub fn shutdown(mut self) -> Result<()> {
        self.queue.cancel();
        self.join()
    }

    fn join(&mut self) -> Result<()> {
        let result = match self.worker.take() {
            Some(worker) => worker
                .join()
                .map_err(|_| anyhow!("Job processor panicked")),
            None => Ok(()),
        };
        if let Some(supervisor) = self.supervisor.take() {
            supervisor.stop();
        }
        if let Err(e) = self.connection.close() {
            warn!(error = %e, "Close on shutdown failed");
        }
        info!("Print service stopped");
        result
    }
}

impl Drop for PrintService {
    fn drop(&mut self) {
        if self.worker.is_some() {
            self.queue.cancel();
            let _ = self.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceKey;
    use crate::events::{ChannelObserver, PrinterEvent};
    use crate::transport::{MockBackend, MockDevice, MockOp};
    use std::sync::mpsc::{self, Receiver};
    use std::time::{Duration, Instant};

    fn config(job_interval_ms: u64, reconnect_grace_ms: u64) -> PrinterConfig {
        PrinterConfig {
            job_interval_ms,
            reconnect_grace_ms,
            ..Default::default()
        }
    }

    fn start(backend: &MockBackend, config: &PrinterConfig) -> (PrintService, Receiver<PrinterEvent>) {
        let (tx, events) = mpsc::channel();
        let service = PrintService::start(
            config,
            Arc::new(backend.clone()),
            JobEncoder::default(),
            Arc::new(ChannelObserver::new(tx)),
        )
        .unwrap();
        (service, events)
    }

    fn wait_for(events: &Receiver<PrinterEvent>, pred: impl Fn(&PrinterEvent) -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while let Some(left) = deadline.checked_duration_since(Instant::now()) {
            match events.recv_timeout(left) {
                Ok(event) if pred(&event) => return true,
                Ok(_) => {}
                Err(_) => return false,
            }
        }
        false
    }

    #[test]
    fn test_drain_prints_everything_queued() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(1, 0x0493, 0x8760));
        let (service, _events) = start(&backend, &config(0, 5000));

        service.enqueue(Job::Text("A".into())).unwrap();
        service.enqueue(Job::Text("B".into())).unwrap();
        service.drain().unwrap();

        assert_eq!(backend.writes(), vec![b"A\n".to_vec(), b"B\n".to_vec()]);
        assert_eq!(
            backend.count(|op| matches!(op, MockOp::Open(_))),
            backend.count(|op| matches!(op, MockOp::Release(_)))
        );
    }

    #[test]
    fn test_prints_to_replugged_printer() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(1, 0x0493, 0x8760));
        let (service, events) = start(&backend, &config(0, 20));

        service.enqueue(Job::Text("A".into())).unwrap();
        assert!(wait_for(&events, |e| matches!(e, PrinterEvent::JobCompleted { .. })));

        backend.unplug(DeviceKey(1));
        backend.attach(MockDevice::printer(2, 0x0493, 0x8760));
        assert!(wait_for(&events, |e| matches!(e, PrinterEvent::Found { .. })));

        service.enqueue(Job::Text("B".into())).unwrap();
        service.drain().unwrap();

        let writes: Vec<_> = backend
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                MockOp::Write(key, bytes) => Some((key, bytes)),
                _ => None,
            })
            .collect();
        assert_eq!(
            writes,
            vec![
                (DeviceKey(1), b"A\n".to_vec()),
                (DeviceKey(2), b"B\n".to_vec())
            ]
        );
    }

    #[test]
    fn test_shutdown_discards_pending_jobs() {
        let backend = MockBackend::new();
        backend.attach(MockDevice::printer(1, 0x0493, 0x8760));
        let (service, events) = start(&backend, &config(10_000, 5000));

        service.enqueue(Job::Text("A".into())).unwrap();
        service.enqueue(Job::Text("B".into())).unwrap();
        assert!(wait_for(&events, |e| matches!(e, PrinterEvent::JobCompleted { .. })));

        let start = Instant::now();
        service.shutdown().unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(backend.writes(), vec![b"A\n".to_vec()]);
    }

    #[test]
    fn test_enqueue_respects_capacity() {
        let backend = MockBackend::new();
        let config = PrinterConfig {
            queue_capacity: Some(0),
            ..Default::default()
        };
        let (service, _events) = start(&backend, &config);
        assert_eq!(
            service.enqueue(Job::Text("A".into())),
            Err(QueueError::Full { capacity: 0 })
        );
        service.shutdown().unwrap();
    }
}
