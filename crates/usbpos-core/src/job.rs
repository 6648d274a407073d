//! Print jobs and the FIFO queue feeding the processor.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::debug;

use crate::encode::Bitmap;

/// Identifier assigned at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Text,
    RenderedText,
    Image,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Text => write!(f, "text"),
            JobKind::RenderedText => write!(f, "rendered-text"),
            JobKind::Image => write!(f, "image"),
        }
    }
}

/// One unit of print work. The payload is not inspected by the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Job {
    /// Text printed with the printer's built-in font.
    Text(String),
    /// Text rasterized by the renderer before encoding.
    RenderedText(String),
    /// A ready bitmap.
    Image(Bitmap),
}

impl Job {
    pub fn kind(&self) -> JobKind {
        match self {
            Job::Text(_) => JobKind::Text,
            Job::RenderedText(_) => JobKind::RenderedText,
            Job::Image(_) => JobKind::Image,
        }
    }
}

/// A job together with its queue id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedJob {
    pub id: JobId,
    pub job: Job,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("Queue is full ({capacity} jobs)")]
    Full { capacity: usize },

    #[error("Queue no longer accepts jobs")]
    Closed,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<QueuedJob>,
    next_id: u64,
    intake_closed: bool,
    cancelled: bool,
}

/// FIFO job queue shared by producers and the single worker.
pub struct JobQueue {
    state: Mutex<QueueState>,
    changed: Condvar,
    capacity: Option<usize>,
}

impl Default for JobQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl JobQueue {
    /// Unbounded queue.
    pub fn new() -> Self {
        Self::with_capacity(None)
    }

    pub fn with_capacity(capacity: Option<usize>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a job to the tail. Never blocks.
    pub fn enqueue(&self, job: Job) -> Result<JobId, QueueError> {
        let mut state = self.lock();
        if state.intake_closed || state.cancelled {
            return Err(QueueError::Closed);
        }
        if let Some(capacity) = self.capacity
            && state.jobs.len() >= capacity
        {
            return Err(QueueError::Full { capacity });
        }
        let id = JobId(state.next_id);
        state.next_id += 1;
        debug!(job = %id, kind = %job.kind(), "Job queued");
        state.jobs.push_back(QueuedJob { id, job });
        drop(state);
        self.changed.notify_all();
        Ok(id)
    }

    /// Block until a job is available.
    ///
    /// Returns `None` once the queue is cancelled, or once intake is closed
    /// and every queued job has been handed out.
    pub fn next(&self) -> Option<QueuedJob> {
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return None;
            }
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.intake_closed {
                return None;
            }
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Sleep for `interval` unless cancelled first.
    ///
    /// Returns `false` if the queue was cancelled. Returns early, with `true`,
    /// when intake is closed and nothing is left to do.
    pub fn pause(&self, interval: Duration) -> bool {
        let deadline = Instant::now() + interval;
        let mut state = self.lock();
        loop {
            if state.cancelled {
                return false;
            }
            if state.intake_closed && state.jobs.is_empty() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            state = self
                .changed
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Stop accepting jobs; queued jobs are still handed out.
    pub fn close(&self) {
        self.lock().intake_closed = true;
        self.changed.notify_all();
    }

    /// Stop immediately and wake every waiter. Queued jobs are discarded.
    pub fn cancel(&self) {
        let dropped = {
            let mut state = self.lock();
            state.cancelled = true;
            std::mem::take(&mut state.jobs).len()
        };
        if dropped > 0 {
            debug!(dropped, "Queue cancelled with pending jobs");
        }
        self.changed.notify_all();
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn text(s: &str) -> Job {
        Job::Text(s.to_string())
    }

    #[test]
    fn test_fifo_order() {
        let queue = JobQueue::new();
        for s in ["A", "B", "C", "B"] {
            queue.enqueue(text(s)).unwrap();
        }
        queue.close();

        let mut out = Vec::new();
        while let Some(job) = queue.next() {
            out.push(job);
        }
        let ids: Vec<_> = out.iter().map(|j| j.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert_eq!(out[3].job, text("B"));
    }

    #[test]
    fn test_capacity() {
        let queue = JobQueue::with_capacity(Some(1));
        queue.enqueue(text("A")).unwrap();
        assert_eq!(queue.enqueue(text("B")), Err(QueueError::Full { capacity: 1 }));
    }

    #[test]
    fn test_closed_queue_rejects_and_drains() {
        let queue = JobQueue::new();
        queue.enqueue(text("A")).unwrap();
        queue.close();
        assert_eq!(queue.enqueue(text("B")), Err(QueueError::Closed));
        assert!(queue.next().is_some());
        assert!(queue.next().is_none());
    }

    #[test]
    fn test_cancel_wakes_blocked_consumer() {
        let queue = Arc::new(JobQueue::new());
        let consumer = {
            let queue = queue.clone();
            thread::spawn(move || queue.next())
        };
        thread::sleep(Duration::from_millis(50));
        queue.cancel();
        assert_eq!(consumer.join().unwrap(), None);
    }

    #[test]
    fn test_concurrent_producers() {
        let queue = Arc::new(JobQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|p| {
                let queue = queue.clone();
                thread::spawn(move || {
                    for i in 0..25 {
                        queue.enqueue(text(&format!("{p}-{i}"))).unwrap();
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }
        queue.close();

        let mut ids = Vec::new();
        while let Some(job) = queue.next() {
            ids.push(job.id.0);
        }
        assert_eq!(ids, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_pause_interrupted_by_cancel() {
        let queue = Arc::new(JobQueue::new());
        let canceller = {
            let queue = queue.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(30));
                queue.cancel();
            })
        };
        let start = Instant::now();
        assert!(!queue.pause(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
        canceller.join().unwrap();
    }

    #[test]
    fn test_pause_waits_full_interval() {
        let queue = JobQueue::new();
        queue.enqueue(text("A")).unwrap();
        let start = Instant::now();
        assert!(queue.pause(Duration::from_millis(40)));
        assert!(start.elapsed() >= Duration::from_millis(40));
    }
}
