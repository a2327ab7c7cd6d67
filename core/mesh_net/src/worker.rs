//! Bounded background worker pool
//!
//! The reactor thread must never block. Work that would (file I/O, CPU-heavy
//! jobs) is submitted here; the loop keeps the returned [`JobHandle`] and polls
//! it with [`JobHandle::try_take`] on a later tick.

use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender, TryRecvError, TrySendError};

use crate::error::{NetError, WorkerError};

/// Queued jobs allowed per worker thread
pub const QUEUE_PER_THREAD: usize = 256;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, NetError> {
        let threads = threads.max(1);
        Self::with_capacity(threads, threads * QUEUE_PER_THREAD)
    }

    /// `capacity` bounds the number of jobs waiting for a thread.
    pub fn with_capacity(threads: usize, capacity: usize) -> Result<Self, NetError> {
        let (sender, receiver) = channel::bounded::<Job>(capacity.max(1));
        let mut workers = Vec::with_capacity(threads);

        for n in 0..threads.max(1) {
            let receiver = receiver.clone();
            let handle = thread::Builder::new()
                .name(format!("mesh-worker-{}", n))
                .spawn(move || worker_loop(receiver))
                .map_err(NetError::Init)?;
            workers.push(handle);
        }

        log::debug!("worker pool started with {} threads", workers.len());
        Ok(WorkerPool {
            sender: Some(sender),
            workers,
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Queue `job` without blocking.
    pub fn submit<R, F>(&self, job: F) -> Result<JobHandle<R>, WorkerError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let sender = self.sender.as_ref().ok_or(WorkerError::Stopped)?;
        let (result_tx, result_rx) = channel::bounded(1);

        let wrapped: Job = Box::new(move || {
            let _ = result_tx.send(job());
        });

        match sender.try_send(wrapped) {
            Ok(()) => Ok(JobHandle {
                result: result_rx,
                lost: false,
            }),
            Err(TrySendError::Full(_)) => Err(WorkerError::QueueFull),
            Err(TrySendError::Disconnected(_)) => Err(WorkerError::Stopped),
        }
    }

    /// Stop accepting jobs, let queued ones finish and join the threads.
    pub fn shutdown(&mut self) {
        self.sender.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                log::error!("worker thread exited abnormally");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(receiver: Receiver<Job>) {
    while let Ok(job) = receiver.recv() {
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::error!("worker job panicked");
        }
    }
}

/// Pollable result of a submitted job.
#[derive(Debug)]
pub struct JobHandle<R> {
    result: Receiver<R>,
    lost: bool,
}

impl<R> JobHandle<R> {
    /// The result if the job has finished. Never blocks.
    pub fn try_take(&mut self) -> Option<R> {
        match self.result.try_recv() {
            Ok(value) => Some(value),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.lost = true;
                None
            }
        }
    }

    /// The job ended without a result (it panicked or the pool stopped
    /// before running it).
    pub fn is_lost(&self) -> bool {
        self.lost
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn wait_for<R>(handle: &mut JobHandle<R>) -> Option<R> {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if let Some(v) = handle.try_take() {
                return Some(v);
            }
            if handle.is_lost() {
                return None;
            }
            thread::sleep(Duration::from_millis(1));
        }
        None
    }

    #[test]
    fn test_submit_and_poll() {
        let pool = WorkerPool::new(2).unwrap();
        assert_eq!(pool.threads(), 2);

        let mut handles: Vec<_> = (0..8u64).map(|n| pool.submit(move || n * n).unwrap()).collect();
        let results: Vec<u64> = handles.iter_mut().map(|h| wait_for(h).unwrap()).collect();
        assert_eq!(results, vec![0, 1, 4, 9, 16, 25, 36, 49]);
    }

    #[test]
    fn test_try_take_does_not_block() {
        let pool = WorkerPool::new(1).unwrap();
        let (release_tx, release_rx) = channel::bounded::<()>(0);
        let mut handle = pool
            .submit(move || {
                let _ = release_rx.recv();
                7
            })
            .unwrap();

        let start = Instant::now();
        assert_eq!(handle.try_take(), None);
        assert!(start.elapsed() < Duration::from_millis(100));
        assert!(!handle.is_lost());

        release_tx.send(()).unwrap();
        assert_eq!(wait_for(&mut handle), Some(7));
    }

    #[test]
    fn test_queue_full() {
        let pool = WorkerPool::with_capacity(1, 2).unwrap();
        let (started_tx, started_rx) = channel::bounded::<()>(1);
        let (release_tx, release_rx) = channel::bounded::<()>(0);

        let _busy = pool
            .submit(move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
            })
            .unwrap();
        started_rx.recv().unwrap();

        let _a = pool.submit(|| ()).unwrap();
        let _b = pool.submit(|| ()).unwrap();
        assert_eq!(pool.submit(|| ()).unwrap_err(), WorkerError::QueueFull);

        release_tx.send(()).unwrap();
    }

    #[test]
    fn test_panicking_job_is_lost() {
        let pool = WorkerPool::new(1).unwrap();
        let mut bad = pool.submit(|| -> u32 { panic!("boom") }).unwrap();
        assert_eq!(wait_for(&mut bad), None);
        assert!(bad.is_lost());

        // The thread survives
        let mut good = pool.submit(|| 1u32).unwrap();
        assert_eq!(wait_for(&mut good), Some(1));
    }

    #[test]
    fn test_submit_after_shutdown() {
        let mut pool = WorkerPool::new(1).unwrap();
        pool.shutdown();
        assert_eq!(pool.threads(), 0);
        assert_eq!(pool.submit(|| ()).unwrap_err(), WorkerError::Stopped);
    }
}
