//! In-process runtime: worker pools over a shared backend.
//!
//! A [`Runtime`] owns one workflow poller pool, one activity poller pool and
//! the executor cache. All shared mutation crosses the backend; the runtime
//! only coordinates leases, heartbeats and executors.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::providers::Backend;

pub mod cache;
mod dispatchers;
pub mod executor;
pub mod registry;

pub use executor::{poison_task_effects, ExecutorError, TaskEffects, WorkflowExecutor};

use cache::ExecutorCache;
use registry::{ActivityRegistry, WorkflowRegistry};

/// Tunables for one runtime. Defaults follow the usual 25s heartbeat under a
/// 30s visibility timeout.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Concurrent workflow task pollers.
    pub workflow_poller_count: usize,
    /// Concurrent activity task pollers.
    pub activity_poller_count: usize,
    /// Long-poll timeout handed to the backend.
    pub poll_timeout: Duration,
    /// Lease renewal interval; must stay below the backend's visibility
    /// timeout.
    pub heartbeat_interval: Duration,
    /// Sleep between empty polls.
    pub idle_sleep: Duration,
    /// Executor cache capacity (entries).
    pub cache_capacity: usize,
    /// Idle executors are evicted after this long.
    pub cache_ttl: Duration,
    /// Interval of the cache eviction task.
    pub cache_evict_interval: Duration,
    /// Deliveries after which a task is dead-lettered by failing the
    /// workflow.
    pub max_task_attempts: u32,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            workflow_poller_count: 2,
            activity_poller_count: 2,
            poll_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(25),
            idle_sleep: Duration::from_millis(10),
            cache_capacity: 128,
            cache_ttl: Duration::from_secs(60),
            cache_evict_interval: Duration::from_secs(10),
            max_task_attempts: 10,
        }
    }
}

/// Worker runtime processing workflow and activity tasks against a backend.
pub struct Runtime {
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) workflows: Arc<WorkflowRegistry>,
    pub(crate) activities: Arc<ActivityRegistry>,
    pub(crate) cache: Arc<ExecutorCache>,
    pub(crate) options: RuntimeOptions,
    pub(crate) shutdown: CancellationToken,
    pub(crate) runtime_id: String,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Start the worker pools. Must be called from within a tokio runtime.
    pub fn start_with_backend(
        backend: Arc<dyn Backend>,
        activities: Arc<ActivityRegistry>,
        workflows: Arc<WorkflowRegistry>,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        let cache = Arc::new(ExecutorCache::new(options.cache_capacity, options.cache_ttl));
        let runtime = Arc::new(Self {
            backend,
            workflows,
            activities,
            cache: cache.clone(),
            shutdown: CancellationToken::new(),
            runtime_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            joins: Mutex::new(Vec::new()),
            options,
        });

        debug!(
            runtime_id = %runtime.runtime_id,
            backend = runtime.backend.name(),
            workflow_pollers = runtime.options.workflow_poller_count,
            activity_pollers = runtime.options.activity_poller_count,
            "starting runtime"
        );

        let mut joins = runtime.joins.lock().expect("runtime joins poisoned");
        joins.push(dispatchers::workflow::start(runtime.clone()));
        joins.push(dispatchers::activity::start(runtime.clone()));
        joins.push(cache.start_eviction(
            runtime.options.cache_evict_interval,
            runtime.shutdown.clone(),
        ));
        drop(joins);

        runtime
    }

    /// Signal shutdown and stop the pollers. In-flight polls return without
    /// a task; in-flight task handlers are aborted (their leases expire and
    /// the tasks are re-delivered).
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut joins = self.joins.lock().expect("runtime joins poisoned");
            joins.drain(..).collect()
        };
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        debug!(runtime_id = %self.runtime_id, "runtime stopped");
    }
}
