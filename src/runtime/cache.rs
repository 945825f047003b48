//! Executor cache: keeps warm executors so continuation tasks can skip full
//! replay.
//!
//! Strictly an optimization — every miss falls back to a full task and a
//! fresh replay. Entries are keyed by `(instance_id, execution_id)` and hold
//! the executor behind an async mutex: `try_lock` gives per-key exclusivity,
//! and a busy entry reports a miss so the caller falls back instead of
//! queueing behind the in-flight task.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::runtime::executor::WorkflowExecutor;
use crate::WorkflowInstance;

type CacheKey = (String, String);

struct CacheEntry {
    executor: Arc<tokio::sync::Mutex<WorkflowExecutor>>,
    last_used: Instant,
}

/// Bounded LRU of warm executors with TTL eviction.
pub struct ExecutorCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
}

fn key_of(instance: &WorkflowInstance) -> CacheKey {
    (instance.instance_id.clone(), instance.execution_id.clone())
}

impl ExecutorCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check out the executor for `instance`, inserting a fresh one on miss.
    /// Returns `None` when the cached executor is busy with another task;
    /// the caller must then execute a full task on an uncached executor.
    pub fn checkout_or_insert(
        &self,
        instance: &WorkflowInstance,
        make: impl FnOnce() -> WorkflowExecutor,
    ) -> Option<OwnedMutexGuard<WorkflowExecutor>> {
        let executor = {
            let mut entries = self.entries.lock().expect("executor cache poisoned");
            let entry = entries.entry(key_of(instance)).or_insert_with(|| CacheEntry {
                executor: Arc::new(tokio::sync::Mutex::new(make())),
                last_used: Instant::now(),
            });
            entry.last_used = Instant::now();
            entry.executor.clone()
        };
        match executor.try_lock_owned() {
            Ok(guard) => Some(guard),
            Err(_) => {
                debug!(
                    instance_id = %instance.instance_id,
                    execution_id = %instance.execution_id,
                    "cached executor busy, reporting miss"
                );
                None
            }
        }
    }

    /// Drop the entry for `instance` (finished, or state diverged from the
    /// store after a failed commit).
    pub fn remove(&self, instance: &WorkflowInstance) {
        self.entries
            .lock()
            .expect("executor cache poisoned")
            .remove(&key_of(instance));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("executor cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One eviction pass: drop finished executors, entries idle beyond the
    /// TTL, and the least recently used entries above capacity. In-flight
    /// entries are never evicted.
    pub fn evict(&self) {
        let mut entries = self.entries.lock().expect("executor cache poisoned");
        let now = Instant::now();

        entries.retain(|_, entry| {
            let Ok(executor) = entry.executor.try_lock() else {
                // Busy: a task is running on it right now.
                return true;
            };
            if executor.is_finished() {
                return false;
            }
            now.duration_since(entry.last_used) < self.ttl
        });

        if entries.len() > self.capacity {
            let mut by_age: Vec<(CacheKey, Instant)> = entries
                .iter()
                .filter(|(_, e)| e.executor.try_lock().is_ok())
                .map(|(k, e)| (k.clone(), e.last_used))
                .collect();
            by_age.sort_by_key(|(_, used)| *used);
            let excess = entries.len().saturating_sub(self.capacity);
            for (key, _) in by_age.into_iter().take(excess) {
                entries.remove(&key);
            }
        }
    }

    /// Periodic eviction loop; stops when `shutdown` fires.
    pub fn start_eviction(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => self.evict(),
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::registry::WorkflowRegistry;

    fn workflows() -> Arc<WorkflowRegistry> {
        Arc::new(WorkflowRegistry::builder().build().unwrap())
    }

    fn instance(n: u32) -> WorkflowInstance {
        WorkflowInstance::new(format!("i{n}"), "e1")
    }

    #[test]
    fn checkout_is_exclusive_per_key() {
        let cache = ExecutorCache::new(8, Duration::from_secs(30));
        let inst = instance(1);
        let workflows = workflows();

        let first = cache.checkout_or_insert(&inst, || {
            WorkflowExecutor::new(workflows.clone(), inst.clone())
        });
        assert!(first.is_some());

        // Same key while busy: miss.
        let second = cache.checkout_or_insert(&inst, || {
            WorkflowExecutor::new(workflows.clone(), inst.clone())
        });
        assert!(second.is_none());

        drop(first);
        let third = cache.checkout_or_insert(&inst, || {
            WorkflowExecutor::new(workflows.clone(), inst.clone())
        });
        assert!(third.is_some());
    }

    #[test]
    fn eviction_honors_capacity() {
        let cache = ExecutorCache::new(2, Duration::from_secs(30));
        let workflows = workflows();
        for n in 0..5 {
            let inst = instance(n);
            let guard = cache.checkout_or_insert(&inst, || {
                WorkflowExecutor::new(workflows.clone(), inst.clone())
            });
            drop(guard);
        }
        assert_eq!(cache.len(), 5);
        cache.evict();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_skips_busy_entries() {
        let cache = ExecutorCache::new(0, Duration::from_secs(30));
        let inst = instance(1);
        let workflows = workflows();
        let guard = cache.checkout_or_insert(&inst, || {
            WorkflowExecutor::new(workflows.clone(), inst.clone())
        });
        cache.evict();
        assert_eq!(cache.len(), 1);
        drop(guard);
        cache.evict();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn idle_entries_expire() {
        let cache = ExecutorCache::new(8, Duration::from_millis(0));
        let inst = instance(1);
        let workflows = workflows();
        drop(cache.checkout_or_insert(&inst, || {
            WorkflowExecutor::new(workflows.clone(), inst.clone())
        }));
        cache.evict();
        assert!(cache.is_empty());
    }
}
