//! Single-GPU plan follower
//!
//! Consumes batch plans produced by the dispatcher, waits until each plan's
//! execution time, and hands the batch to the inference engine. One GPU,
//! one follower, one writer of the GPU timeline.

use crate::{ExecutorError, Result};
use lane_core::{now_ns, BatchPlan};
use parking_lot::Mutex;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Backoff before re-arming when the timer fires while an execution is
/// still in flight
const EXEC_RETRY: Duration = Duration::from_micros(100);

/// The seam to the inference engine. A forward call is synchronous and is
/// expected to complete before the plan's deadline; results are emitted
/// through the engine's own reply path, not through the follower.
pub trait ModelExecutor: Send + Sync {
    /// Canonical model session key this executor serves
    fn model_session_id(&self) -> &str;

    /// Run one batch
    fn forward(&self, plan: &BatchPlan);
}

/// Follower observations
#[derive(Debug, Default)]
pub struct FollowerStats {
    /// Plans handed to the engine
    pub plans_executed: AtomicU64,

    /// Plans dropped because their deadline passed before execution
    pub deadline_missed: AtomicU64,

    /// Plans dropped for any reason, deadline misses included
    pub plans_dropped: AtomicU64,
}

/// Batch plans ordered by execution time, earliest first. Plan id breaks
/// ties so ordering is total.
struct OrderedPlan(BatchPlan);

impl PartialEq for OrderedPlan {
    fn eq(&self, other: &Self) -> bool {
        self.0.exec_time_ns == other.0.exec_time_ns && self.0.plan_id == other.0.plan_id
    }
}

impl Eq for OrderedPlan {}

impl PartialOrd for OrderedPlan {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedPlan {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .exec_time_ns
            .cmp(&other.0.exec_time_ns)
            .then(self.0.plan_id.cmp(&other.0.plan_id))
    }
}

struct FollowerInner {
    gpu_device: String,
    models: Mutex<HashMap<String, Arc<dyn ModelExecutor>>>,
    plans: Mutex<BinaryHeap<Reverse<OrderedPlan>>>,
    executing: AtomicBool,
    running: AtomicBool,
    rearm: Notify,
    stats: FollowerStats,
}

/// Per-GPU event loop that executes batch plans at their scheduled times
pub struct PlanFollower {
    inner: Arc<FollowerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PlanFollower {
    /// Create a follower for one GPU
    pub fn new(gpu_device: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(FollowerInner {
                gpu_device: gpu_device.into(),
                models: Mutex::new(HashMap::new()),
                plans: Mutex::new(BinaryHeap::new()),
                executing: AtomicBool::new(false),
                running: AtomicBool::new(false),
                rearm: Notify::new(),
                stats: FollowerStats::default(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Start the event loop
    pub fn start(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return Err(ExecutorError::AlreadyStarted);
        }
        self.inner.running.store(true, AtomicOrdering::Release);
        let inner = self.inner.clone();
        info!("Starting plan follower for GPU {}", inner.gpu_device);
        *handle = Some(tokio::spawn(async move { run_loop(inner).await }));
        Ok(())
    }

    /// Stop the event loop. In-flight forwards are not cancelled.
    pub async fn stop(&self) {
        self.inner.running.store(false, AtomicOrdering::Release);
        self.inner.rearm.notify_one();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        info!("Stopped plan follower for GPU {}", self.inner.gpu_device);
    }

    /// Register an executor for a model session
    pub fn add_model(&self, executor: Arc<dyn ModelExecutor>) {
        let id = executor.model_session_id().to_string();
        self.inner.models.lock().insert(id, executor);
    }

    /// Remove the executor for a model session
    pub fn remove_model(&self, model_session_id: &str) {
        self.inner.models.lock().remove(model_session_id);
    }

    /// Enqueue a plan. Never blocks on execution; re-arms the timer when
    /// the new plan is now the earliest.
    pub fn add_plan(&self, plan: BatchPlan) {
        self.inner.plans.lock().push(Reverse(OrderedPlan(plan)));
        self.inner.rearm.notify_one();
    }

    /// Number of plans waiting for their execution time
    pub fn pending_plans(&self) -> usize {
        self.inner.plans.lock().len()
    }

    /// Follower observations
    pub fn stats(&self) -> &FollowerStats {
        &self.inner.stats
    }
}

async fn run_loop(inner: Arc<FollowerInner>) {
    while inner.running.load(AtomicOrdering::Acquire) {
        let next_exec_ns = inner
            .plans
            .lock()
            .peek()
            .map(|Reverse(OrderedPlan(plan))| plan.exec_time_ns);

        let Some(next_exec_ns) = next_exec_ns else {
            // Nothing pending. Sleep until a plan arrives or we shut down.
            inner.rearm.notified().await;
            continue;
        };

        let now = now_ns();
        if next_exec_ns > now {
            let wait = Duration::from_nanos(next_exec_ns - now);
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = inner.rearm.notified() => {
                    // An earlier plan may have arrived; recompute the timer
                    continue;
                }
            }
        }

        // At most one execution at a time. If one is still in flight the
        // timer comes back shortly.
        if inner.executing.swap(true, AtomicOrdering::AcqRel) {
            tokio::time::sleep(EXEC_RETRY).await;
            continue;
        }
        if let Some(Reverse(OrderedPlan(plan))) = inner.plans.lock().pop() {
            execute(&inner, plan);
        }
        inner.executing.store(false, AtomicOrdering::Release);
    }
}

fn execute(inner: &FollowerInner, plan: BatchPlan) {
    let now = now_ns();
    if now > plan.deadline_ns {
        warn!(
            "Dropping plan {} for {}: deadline passed {} us ago",
            plan.plan_id,
            plan.model_session_id,
            (now - plan.deadline_ns) / 1_000
        );
        inner.stats.deadline_missed.fetch_add(1, AtomicOrdering::Relaxed);
        inner.stats.plans_dropped.fetch_add(1, AtomicOrdering::Relaxed);
        return;
    }

    let executor = inner.models.lock().get(&plan.model_session_id).cloned();
    let Some(executor) = executor else {
        warn!(
            "Dropping plan {}: no executor for model {} on GPU {}",
            plan.plan_id, plan.model_session_id, inner.gpu_device
        );
        inner.stats.plans_dropped.fetch_add(1, AtomicOrdering::Relaxed);
        return;
    };

    debug!(
        "Executing plan {} for {} (batch {})",
        plan.plan_id,
        plan.model_session_id,
        plan.batch_size()
    );
    executor.forward(&plan);
    inner.stats.plans_executed.fetch_add(1, AtomicOrdering::Relaxed);
}
