//! Single worker that serializes jobs through the printer connection.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::connection::PrinterConnection;
use crate::encode::{EncodeError, JobEncoder};
use crate::error::ConnectionError;
use crate::events::PrinterEvent;
use crate::job::{Job, JobQueue, QueuedJob};

/// Pause between two jobs.
pub const DEFAULT_JOB_INTERVAL: Duration = Duration::from_millis(1000);

#[derive(Error, Debug)]
pub enum JobError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("Encoding failed: {0}")]
    Encode(#[from] EncodeError),
}

/// Takes jobs off the queue one at a time: open, encode, write, close.
pub struct JobProcessor {
    connection: Arc<PrinterConnection>,
    queue: Arc<JobQueue>,
    encoder: JobEncoder,
    interval: Duration,
}

impl JobProcessor {
    pub fn new(connection: Arc<PrinterConnection>, queue: Arc<JobQueue>, encoder: JobEncoder) -> Self {
        Self {
            connection,
            queue,
            encoder,
            interval: DEFAULT_JOB_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Process jobs until the queue is cancelled or closed and drained.
    #[instrument(level = "info", name = "job_processor", skip(self))]
    pub fn run(&self) {
        info!(interval_ms = self.interval.as_millis() as u64, "Job processor started");
        let mut processed = 0u64;

        while let Some(job) = self.queue.next() {
            // Failures are logged and reported per job; the loop keeps going.
            let _ = self.process(job);
            processed += 1;
            if !self.queue.pause(self.interval) {
                break;
            }
        }

        info!(processed, "Job processor stopped");
    }

    /// Print one job. The connection is closed afterwards whatever happened.
    pub fn process(&self, queued: QueuedJob) -> Result<usize, JobError> {
        let QueuedJob { id, job } = queued;
        self.connection.emit(PrinterEvent::JobStarted {
            id,
            kind: job.kind(),
        });

        let result = self.print(&job);

        match self.connection.close() {
            Ok(outcome) => debug!(job = %id, outcome = ?outcome, "Connection closed"),
            Err(e) => warn!(job = %id, error = %e, "Close failed"),
        }

        match &result {
            Ok(bytes) => {
                info!(job = %id, kind = %job.kind(), bytes, "Job printed");
                self.connection.emit(PrinterEvent::JobCompleted { id, bytes: *bytes });
            }
            Err(e) => {
                error!(job = %id, kind = %job.kind(), error = %e, "Job dropped");
                self.connection.emit(PrinterEvent::JobFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    fn print(&self, job: &Job) -> Result<usize, JobError> {
        self.connection.open()?;
        let bytes = self.encoder.encode(job)?;
        Ok(self.connection.write(&bytes)?)
    }
}
