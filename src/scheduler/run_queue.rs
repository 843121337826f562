//! Bounded-concurrency job runner.
//!
//! At most `concurrent_max` jobs run at once, each on a spawned tokio task.
//! Excess jobs wait in a FIFO queue. Every job's outcome (value, error or
//! panic) is delivered through its [`JobHandle`]; a failing job never stalls
//! the jobs queued behind it.

use futures::FutureExt;
use std::any::Any;
use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::oneshot;

/// Why a job produced no value.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum JobError {
    /// The job returned an error (full `anyhow` chain)
    #[error("job failed: {0}")]
    Failed(String),
    #[error("job panicked: {0}")]
    Panicked(String),
    /// The worker went away before reporting (runtime shutting down)
    #[error("job cancelled")]
    Cancelled,
}

type BoxedJob<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send>>;

struct PendingJob<T> {
    job: BoxedJob<T>,
    reply: oneshot::Sender<Result<T, JobError>>,
}

struct QueueState<T> {
    running: usize,
    queued: VecDeque<PendingJob<T>>,
}

struct Inner<T> {
    concurrent_max: usize,
    state: Mutex<QueueState<T>>,
}

impl<T> Inner<T> {
    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Hand the worker the next queued job, or release its slot.
    fn next_or_release(&self) -> Option<PendingJob<T>> {
        let mut state = self.lock();
        let next = state.queued.pop_front();
        if next.is_none() {
            state.running = state.running.saturating_sub(1);
        }
        next
    }
}

pub struct RunQueue<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for RunQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + 'static> RunQueue<T> {
    /// A queue running at most `concurrent_max` jobs at once (minimum 1).
    pub fn new(concurrent_max: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                concurrent_max: concurrent_max.max(1),
                state: Mutex::new(QueueState {
                    running: 0,
                    queued: VecDeque::new(),
                }),
            }),
        }
    }

    /// Submit a job. Must be called from within a tokio runtime.
    ///
    /// Starts immediately when a slot is free, otherwise waits behind the
    /// jobs already queued.
    pub fn push<F>(&self, job: F) -> JobHandle<T>
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        let pending = PendingJob {
            job: Box::pin(job),
            reply,
        };

        let start_now = {
            let mut state = self.inner.lock();
            if state.running < self.inner.concurrent_max {
                state.running += 1;
                Some(pending)
            } else {
                state.queued.push_back(pending);
                None
            }
        };

        if let Some(pending) = start_now {
            self.spawn_worker(pending);
        } else {
            tracing::debug!(queued = self.queued(), "Run queue busy, job queued");
        }
        JobHandle { rx }
    }

    fn spawn_worker(&self, first: PendingJob<T>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut next = Some(first);
            while let Some(PendingJob { job, reply }) = next.take() {
                let outcome = match AssertUnwindSafe(job).catch_unwind().await {
                    Ok(Ok(value)) => Ok(value),
                    Ok(Err(e)) => Err(JobError::Failed(format!("{e:#}"))),
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        tracing::error!(panic = %message, "Run queue job panicked");
                        Err(JobError::Panicked(message))
                    }
                };
                // Receiver may have been dropped; the job still counts as done.
                let _ = reply.send(outcome);
                next = inner.next_or_release();
            }
        });
    }

    /// Jobs currently executing.
    pub fn running(&self) -> usize {
        self.inner.lock().running
    }

    /// Jobs waiting for a free slot.
    pub fn queued(&self) -> usize {
        self.inner.lock().queued.len()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        return (*s).to_string();
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic payload".to_string()
}

/// Resolves to the job's value or the reason it has none.
#[must_use = "dropping a JobHandle discards the job's result"]
pub struct JobHandle<T> {
    rx: oneshot::Receiver<Result<T, JobError>>,
}

impl<T> Future for JobHandle<T> {
    type Output = Result<T, JobError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Cancelled)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_job_value_delivered() {
        let queue = RunQueue::new(1);
        let handle = queue.push(async { Ok(42) });
        assert_eq!(handle.await, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fifo_with_single_slot() {
        let queue = RunQueue::new(1);
        let log = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..5)
            .map(|i| {
                let log = Arc::clone(&log);
                queue.push(async move {
                    let start = Instant::now();
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    let end = Instant::now();
                    log.lock().unwrap().push((i, start, end));
                    Ok(i)
                })
            })
            .collect();

        assert_eq!(queue.running(), 1);
        assert_eq!(queue.queued(), 4);

        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.await, Ok(i));
        }

        let log = log.lock().unwrap();
        let order: Vec<usize> = log.iter().map(|(i, _, _)| *i).collect();
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
        for pair in log.windows(2) {
            let (_, _, prev_end) = pair[0];
            let (_, next_start, _) = pair[1];
            assert!(next_start >= prev_end);
        }
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn test_failing_job_does_not_block_queue() {
        let queue = RunQueue::new(1);
        let first = queue.push(async { Ok(1) });
        let second = queue.push(async { Err(anyhow::anyhow!("feed exploded")) });
        let third = queue.push(async { Ok(3) });

        assert_eq!(first.await, Ok(1));
        match second.await {
            Err(JobError::Failed(msg)) => assert!(msg.contains("feed exploded")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert_eq!(third.await, Ok(3));
    }

    #[tokio::test]
    async fn test_panicking_job_is_reported() {
        let queue: RunQueue<u32> = RunQueue::new(1);
        let bad = queue.push(async {
            if true {
                panic!("boom");
            }
            Ok(0)
        });
        let good = queue.push(async { Ok(7) });

        assert_eq!(bad.await, Err(JobError::Panicked("boom".to_string())));
        assert_eq!(good.await, Ok(7));
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrency_bound_respected() {
        let queue = RunQueue::new(2);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                queue.push(async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        for handle in handles {
            assert_eq!(handle.await, Ok(()));
        }
        assert_eq!(peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_handle_still_runs_next_job() {
        let queue = RunQueue::new(1);
        drop(queue.push(async { Ok(1) }));
        assert_eq!(queue.push(async { Ok(2) }).await, Ok(2));
    }

    #[test]
    fn test_zero_concurrency_clamped() {
        let queue: RunQueue<()> = RunQueue::new(0);
        assert_eq!(queue.inner.concurrent_max, 1);
    }
}
