use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore};
use tracing::warn;

use crate::metrics::{DISPATCH_ACTIVE, DISPATCH_BACKLOG, DISPATCH_DROPPED};

type BoxedTask = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Two backpressure policies, selected at construction.
#[derive(Debug, Clone, Copy)]
pub enum BackpressurePolicy {
    /// Default during steady state: the backlog grows without limit.
    Unbounded,
    /// Drop the oldest backlog task when free system memory is below
    /// `min_free_memory_mb` AND the backlog exceeds `high_water_mark`.
    MemoryTriggeredDrop {
        high_water_mark: usize,
        min_free_memory_mb: u64,
    },
}

struct Backlog {
    tasks: VecDeque<BoxedTask>,
}

/// Bounded-concurrency scheduler mediating between the firehose (unbounded
/// producer) and the event processor (bounded consumer). Grounded directly
/// in `rsky_indexer::stream_indexer::StreamIndexer::run`'s
/// `Arc<Semaphore>::acquire_owned` + `tokio::spawn`-per-item pattern, with
/// the Redis-backed backlog replaced by an in-process `VecDeque` since this
/// is a single-process in-memory scheduler with no external broker.
pub struct DispatchQueue {
    semaphore: Arc<Semaphore>,
    backlog: Mutex<Backlog>,
    active: AtomicUsize,
    policy: BackpressurePolicy,
}

impl DispatchQueue {
    pub fn new(max_concurrent: usize, policy: BackpressurePolicy) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            backlog: Mutex::new(Backlog {
                tasks: VecDeque::new(),
            }),
            active: AtomicUsize::new(0),
            policy,
        })
    }

    /// Submit a unit of work. Never blocks the caller: if a permit is free
    /// it spawns immediately, otherwise the task is appended to the FIFO
    /// backlog for a future completion to pick up.
    pub fn submit<F>(self: &Arc<Self>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let boxed: BoxedTask = Box::pin(task);
        match self.semaphore.clone().try_acquire_owned() {
            Ok(permit) => {
                let this = self.clone();
                self.active.fetch_add(1, Ordering::SeqCst);
                DISPATCH_ACTIVE.set(this.active.load(Ordering::SeqCst) as i64);
                tokio::spawn(async move {
                    boxed.await;
                    drop(permit);
                    this.on_complete().await;
                });
            }
            Err(_) => {
                self.enqueue_backlog(boxed);
            }
        }
    }

    fn enqueue_backlog(self: &Arc<Self>, task: BoxedTask) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut guard = this.backlog.lock().await;
            guard.tasks.push_back(task);
            let depth = guard.tasks.len();
            drop(guard);
            DISPATCH_BACKLOG.set(depth as i64);
            this.maybe_drop_oldest().await;
        });
    }

    async fn maybe_drop_oldest(self: &Arc<Self>) {
        let BackpressurePolicy::MemoryTriggeredDrop {
            high_water_mark,
            min_free_memory_mb,
        } = self.policy
        else {
            return;
        };
        let mut guard = self.backlog.lock().await;
        if guard.tasks.len() <= high_water_mark {
            return;
        }
        if !memory_below(min_free_memory_mb) {
            return;
        }
        if guard.tasks.pop_front().is_some() {
            DISPATCH_DROPPED.inc();
            let depth = guard.tasks.len();
            drop(guard);
            warn!(backlog_depth = depth, "dispatch queue dropped oldest task under memory pressure");
            DISPATCH_BACKLOG.set(depth as i64);
        }
    }

    async fn on_complete(self: Arc<Self>) {
        self.active.fetch_sub(1, Ordering::SeqCst);
        DISPATCH_ACTIVE.set(self.active.load(Ordering::SeqCst) as i64);

        let next = {
            let mut guard = self.backlog.lock().await;
            let task = guard.tasks.pop_front();
            DISPATCH_BACKLOG.set(guard.tasks.len() as i64);
            task
        };
        if let Some(task) = next {
            self.submit(task);
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// The queue is not drained on disconnect. In-flight tasks complete
    /// naturally; this only clears the backlog.
    pub async fn disconnect(&self) {
        let mut guard = self.backlog.lock().await;
        let dropped = guard.tasks.len();
        guard.tasks.clear();
        DISPATCH_BACKLOG.set(0);
        if dropped > 0 {
            warn!(dropped, "dispatch queue backlog dropped on disconnect");
        }
    }
}

/// Best-effort free-memory probe via `/proc/meminfo`. Returns `true`
/// (triggering the drop check) only when free memory can be determined and
/// is below the threshold; unreadable `/proc/meminfo` fails open (no drop),
/// matching the live-path principle that backpressure should never itself
/// become a source of instability.
fn memory_below(min_free_mb: u64) -> bool {
    let Ok(contents) = std::fs::read_to_string("/proc/meminfo") else {
        return false;
    };
    let available_kb = contents
        .lines()
        .find(|l| l.starts_with("MemAvailable:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|s| s.parse::<u64>().ok());
    match available_kb {
        Some(kb) => kb / 1024 < min_free_mb,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use tokio::sync::Notify;

    #[tokio::test]
    async fn runs_immediately_under_the_limit() {
        let q = DispatchQueue::new(4, BackpressurePolicy::Unbounded);
        let counter = Arc::new(StdAtomicUsize::new(0));
        let done = Arc::new(Notify::new());
        for _ in 0..3 {
            let counter = counter.clone();
            let done = done.clone();
            q.submit(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                done.notify_one();
            });
        }
        for _ in 0..3 {
            done.notified().await;
        }
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn backlogs_beyond_the_limit_and_drains() {
        let q = DispatchQueue::new(1, BackpressurePolicy::Unbounded);
        let counter = Arc::new(StdAtomicUsize::new(0));
        let gate = Arc::new(Notify::new());

        let gate_clone = gate.clone();
        let counter_clone = counter.clone();
        q.submit(async move {
            gate_clone.notified().await;
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        let counter_clone = counter.clone();
        q.submit(async move {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        tokio::task::yield_now().await;
        gate.notify_one();

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }
}
