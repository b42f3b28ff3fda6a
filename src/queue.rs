//! Bounded worker-pool queues for background indexing
//!
//! An [`IndexQueue`] is a bounded multi-producer work buffer drained by N
//! worker threads. Producers block on append when the buffer is full
//! (implicit backpressure); workers are idempotent and per-item failures
//! are logged without disturbing the completion count.
//!
//! The queue reports progress as (done, pending) tuples; when pending
//! reaches zero the queue is quiescent and any `wait_until_done` callers
//! resolve. Closing the input drains the buffer: workers finish their
//! current item and exit.

use crate::error::Result;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

/// Capacity of the work buffer; producers block beyond this
const QUEUE_CAP: usize = 1024;

/// Progress snapshot of a queue
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueProgress {
    /// Items processed since the queue started
    pub done: u64,
    /// Items accepted but not yet processed (buffered + in flight)
    pub pending: u64,
}

struct QueueInner<T> {
    name: String,
    rx: Receiver<T>,
    done: AtomicU64,
    pending: AtomicU64,
    paused: Mutex<bool>,
    resume_cv: Condvar,
    idle_lock: Mutex<()>,
    idle_cv: Condvar,
}

impl<T> QueueInner<T> {
    fn item_finished(&self) {
        self.done.fetch_add(1, Ordering::SeqCst);
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            let _guard = self.idle_lock.lock();
            self.idle_cv.notify_all();
        }
    }

    fn wait_while_paused(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resume_cv.wait(&mut paused);
        }
    }
}

/// A bounded work buffer drained by a pool of worker threads
pub struct IndexQueue<T: Send + 'static> {
    inner: Arc<QueueInner<T>>,
    tx: Mutex<Option<Sender<T>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> IndexQueue<T> {
    /// Start a queue named `name` with `worker_count` workers running `work`
    pub fn start<F>(name: &str, worker_count: usize, work: F) -> Arc<Self>
    where
        F: Fn(T) -> Result<()> + Send + Sync + 'static,
    {
        let (tx, rx) = bounded(QUEUE_CAP);
        let inner = Arc::new(QueueInner {
            name: name.to_string(),
            rx,
            done: AtomicU64::new(0),
            pending: AtomicU64::new(0),
            paused: Mutex::new(false),
            resume_cv: Condvar::new(),
            idle_lock: Mutex::new(()),
            idle_cv: Condvar::new(),
        });

        let work = Arc::new(work);
        let mut workers = Vec::with_capacity(worker_count);
        for i in 0..worker_count {
            let inner = Arc::clone(&inner);
            let work = Arc::clone(&work);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", name, i))
                .spawn(move || loop {
                    let item = match inner.rx.recv() {
                        Ok(item) => item,
                        Err(_) => break,
                    };
                    // The gate sits between receive and work so a pause
                    // takes effect even for workers already blocked on the
                    // channel.
                    inner.wait_while_paused();
                    if let Err(e) = work(item) {
                        warn!(queue = %inner.name, "work item failed: {}", e);
                    }
                    inner.item_finished();
                })
                .expect("failed to spawn queue worker");
            workers.push(handle);
        }

        debug!(queue = name, workers = worker_count, "queue started");

        Arc::new(Self {
            inner,
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        })
    }

    /// Append every item of a lazy stream, blocking on backpressure
    ///
    /// Returns once the stream is exhausted, so a `wait_until_done` that
    /// follows sees every accepted item in the pending count. Callers that
    /// want fire-and-forget enqueueing spawn their own thread around this.
    pub fn append_items(&self, items: Receiver<T>) {
        for item in items {
            if !self.append_one(item) {
                break;
            }
        }
    }

    /// Append a single item; returns false when the queue is closed
    pub fn append_one(&self, item: T) -> bool {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => {
                self.inner.pending.fetch_add(1, Ordering::SeqCst);
                if tx.send(item).is_err() {
                    self.inner.pending.fetch_sub(1, Ordering::SeqCst);
                    return false;
                }
                true
            }
            None => false,
        }
    }

    /// Items accepted but not yet processed
    pub fn pending(&self) -> u64 {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Items processed since the queue started
    pub fn done(&self) -> u64 {
        self.inner.done.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> QueueProgress {
        QueueProgress {
            done: self.done(),
            pending: self.pending(),
        }
    }

    /// Stop handing out new items; in-flight items complete
    pub fn pause(&self) {
        *self.inner.paused.lock() = true;
    }

    pub fn resume(&self) {
        let mut paused = self.inner.paused.lock();
        *paused = false;
        self.inner.resume_cv.notify_all();
    }

    /// Block until the queue is quiescent (pending == 0)
    pub fn wait_until_done(&self) {
        let mut guard = self.inner.idle_lock.lock();
        while self.pending() > 0 {
            // Timed wait guards against a notify racing ahead of this
            // thread's pending() check.
            self.inner
                .idle_cv
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    /// Close the input and join the workers after the buffer drains
    pub fn close(&self) {
        self.resume();
        self.tx.lock().take();
        let handles: Vec<JoinHandle<()>> = self.workers.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl<T: Send + 'static> Drop for IndexQueue<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_queue_processes_items() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let queue = IndexQueue::start("test", 4, move |_item: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        for i in 0..100 {
            assert!(queue.append_one(i));
        }
        queue.wait_until_done();

        assert_eq!(processed.load(Ordering::SeqCst), 100);
        assert_eq!(queue.done(), 100);
        assert_eq!(queue.pending(), 0);
    }

    #[test]
    fn test_queue_counts_failures_as_done() {
        let queue = IndexQueue::start("failing", 2, |item: u32| {
            if item % 2 == 0 {
                Err(crate::error::PipelineError::ChannelClosed)
            } else {
                Ok(())
            }
        });

        for i in 0..10 {
            queue.append_one(i);
        }
        queue.wait_until_done();
        assert_eq!(queue.done(), 10);
    }

    #[test]
    fn test_queue_append_items_stream() {
        let (tx, rx) = bounded(16);
        let queue = IndexQueue::start("stream", 2, |_item: u32| Ok(()));

        let producer = thread::spawn(move || {
            for i in 0..50 {
                tx.send(i).unwrap();
            }
        });
        queue.append_items(rx);
        producer.join().unwrap();

        queue.wait_until_done();
        assert_eq!(queue.done(), 50);
    }

    #[test]
    fn test_queue_pause_resume() {
        let processed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&processed);
        let queue = IndexQueue::start("paused", 1, move |_item: u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        queue.pause();
        for i in 0..5 {
            queue.append_one(i);
        }
        thread::sleep(Duration::from_millis(50));
        // Paused worker never picked anything up.
        assert_eq!(processed.load(Ordering::SeqCst), 0);

        queue.resume();
        queue.wait_until_done();
        assert_eq!(processed.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_queue_close_rejects_appends() {
        let queue = IndexQueue::start("closed", 1, |_item: u32| Ok(()));
        queue.close();
        assert!(!queue.append_one(1));
    }
}
