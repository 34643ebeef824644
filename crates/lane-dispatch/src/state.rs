//! Dispatcher-owned tables
//!
//! Everything here lives under the dispatcher's single state mutex. Links
//! between sessions and backends are lookup keys into these maps, never
//! shared-ownership edges, so there are no reference cycles to manage.

use crate::delegate::{BackendDelegate, FrontendDelegate};
use crate::route::ModelRoute;
use lane_core::{
    BackendInfo, BackendRate, ModelProfile, ModelRouteUpdate, ModelSession, NodeId,
    ProfileRegistry, StaticWorkloadEntry,
};
use lane_metrics::{IntervalCounter, MovingAverage};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

/// Weights below this are treated as zero throughout the scheduler
pub(crate) const RATE_EPSILON: f64 = 1e-3;

/// One model loaded (or loadable) on one backend
#[derive(Debug, Clone)]
pub(crate) struct InstanceContext {
    pub model_session_id: String,
    pub profile: ModelProfile,
    /// Largest batch whose forward latency fits the full latency budget
    pub max_batch: u32,
    /// Saturation throughput of this model on this GPU under its SLA
    pub capacity_rps: f64,
    /// Throughput currently allocated to this instance
    pub weight_rps: f64,
}

impl InstanceContext {
    pub fn new(session: &ModelSession, profile: &ModelProfile) -> Self {
        Self {
            model_session_id: session.session_id(),
            profile: profile.clone(),
            max_batch: profile.max_batch_with_full_budget(session.latency_sla_us),
            capacity_rps: profile.saturation_throughput(session.latency_sla_us),
            weight_rps: 0.0,
        }
    }

    /// Fraction of the GPU this instance's allocation occupies
    pub fn occupancy(&self) -> f64 {
        if self.capacity_rps <= 0.0 {
            return 0.0;
        }
        self.weight_rps / self.capacity_rps
    }
}

/// Per-backend bookkeeping
#[derive(Debug)]
pub(crate) struct BackendContext {
    pub delegate: Arc<BackendDelegate>,
    /// session_id -> instance
    pub instances: HashMap<String, InstanceContext>,
    /// Soft hint for when the GPU frees up. Written on every dispatch,
    /// consulted by nobody for correctness.
    pub next_available_time_ns: u64,
    /// Index of the static workload slot fixed to this backend, if any.
    /// Static backends are excluded from epoch reallocation.
    pub workload_id: Option<usize>,
}

impl BackendContext {
    pub fn new(delegate: Arc<BackendDelegate>) -> Self {
        Self {
            delegate,
            instances: HashMap::new(),
            next_available_time_ns: 0,
            workload_id: None,
        }
    }

    /// Sum of per-instance GPU shares. Above 1.0 the backend is overloaded.
    pub fn occupancy(&self) -> f64 {
        self.instances.values().map(InstanceContext::occupancy).sum()
    }

    /// Whether no throughput is allocated here. Preloaded instances with
    /// zero weight do not count.
    pub fn is_idle(&self) -> bool {
        self.instances.values().all(|inst| inst.weight_rps < RATE_EPSILON)
    }

    /// Offer of (achievable throughput, occupancy after loading) for
    /// serving `required_rate` of the given session here. `None` when the
    /// SLA fits no batch on this GPU or no capacity remains.
    pub fn prepare_load_model(
        &self,
        session: &ModelSession,
        profile: &ModelProfile,
        required_rate: f64,
    ) -> Option<(f64, f64)> {
        let capacity = profile.saturation_throughput(session.latency_sla_us);
        if capacity <= 0.0 {
            return None;
        }
        let occupancy = self.occupancy();
        let free = 1.0 - occupancy;
        if free <= 0.0 {
            return None;
        }
        let available = free * capacity;
        let achievable = if required_rate.abs() < RATE_EPSILON {
            available
        } else {
            required_rate.min(available)
        };
        if achievable < RATE_EPSILON {
            return None;
        }
        Some((achievable, occupancy + achievable / capacity))
    }

    /// Set an instance's allocation toward `target_rate`, clamped to the
    /// instance's own capacity. Returns the new weight. A backend serving
    /// several sessions can end up past occupancy 1.0 and is spilled out
    /// by the epoch scheduler.
    pub fn update_model_throughput(&mut self, session_id: &str, target_rate: f64) -> f64 {
        let Some(inst) = self.instances.get_mut(session_id) else {
            return 0.0;
        };
        inst.weight_rps = target_rate.min(inst.capacity_rps).max(0.0);
        inst.weight_rps
    }

    /// Shed whole instances, smallest weight first, until occupancy fits.
    /// Returns the (session, rate) pairs that were shed.
    pub fn spill_out_workload(&mut self) -> Vec<(String, f64)> {
        let mut shed = Vec::new();
        while self.occupancy() > 1.0 {
            let victim = self
                .instances
                .values()
                .filter(|inst| inst.weight_rps >= RATE_EPSILON)
                .min_by(|a, b| a.weight_rps.total_cmp(&b.weight_rps))
                .map(|inst| inst.model_session_id.clone());
            let Some(session_id) = victim else {
                break;
            };
            if let Some(inst) = self.instances.remove(&session_id) {
                self.delegate.send_unload_model(session_id.as_str());
                shed.push((session_id, inst.weight_rps));
            }
        }
        shed
    }
}

/// Per-model-session bookkeeping
#[derive(Debug)]
pub(crate) struct SessionInfo {
    pub model_session: ModelSession,
    /// backend_id -> allocated throughput
    pub backend_weights: HashMap<NodeId, f64>,
    /// Standby backends designated by static workload slots
    pub backup_backends: HashSet<NodeId>,
    /// Frontends that subscribed to route updates for this session
    pub subscribers: HashSet<NodeId>,
    /// Per-beacon request-rate samples, oldest first
    pub rps_history: VecDeque<f64>,
    /// Throughput the epoch scheduler could not place anywhere yet
    pub unassigned_workload: f64,
    /// Counts dispatches into one-second buckets
    pub counter: IntervalCounter,
    /// Trailing-window request rate fed from the counter
    req_rate: MovingAverage,
    /// Sessions created by a static workload slot survive losing their
    /// last subscriber
    pub has_static_workload: bool,
}

impl SessionInfo {
    pub fn new(model_session: ModelSession, avg_interval: Duration) -> Self {
        let bucket = Duration::from_secs(1);
        Self {
            model_session,
            backend_weights: HashMap::new(),
            backup_backends: HashSet::new(),
            subscribers: HashSet::new(),
            rps_history: VecDeque::new(),
            unassigned_workload: 0.0,
            counter: IntervalCounter::new(bucket),
            req_rate: MovingAverage::new(bucket, avg_interval.max(bucket)),
            has_static_workload: false,
        }
    }

    /// Total throughput currently allocated across backends
    pub fn total_throughput(&self) -> f64 {
        self.backend_weights.values().sum()
    }

    /// Drain the interval counter into the moving average and report the
    /// current rate estimate. Leading idle buckets are skipped so a session
    /// is not measured before its first query.
    pub fn measure_rate(&mut self) -> f64 {
        for count in self.counter.history() {
            if self.req_rate.rate() < 0.0 && count == 0 {
                continue;
            }
            self.req_rate.add_sample(count);
        }
        self.req_rate.rate()
    }

    #[cfg(test)]
    pub fn seed_rate_samples(&mut self, samples: &[u64]) {
        for &sample in samples {
            self.req_rate.add_sample(sample);
        }
    }
}

/// Every table the dispatcher owns, guarded by one mutex
#[derive(Debug, Default)]
pub(crate) struct DispatcherState {
    pub frontends: HashMap<NodeId, Arc<FrontendDelegate>>,
    pub backends: HashMap<NodeId, BackendContext>,
    /// session_id -> session
    pub sessions: HashMap<String, SessionInfo>,
    /// session_id -> DRR route
    pub routes: HashMap<String, ModelRoute>,
    /// Preconfigured per-backend workload slots
    pub static_workloads: Vec<Vec<StaticWorkloadEntry>>,
    /// slot index -> backend currently holding it
    pub assigned_static_workloads: HashMap<usize, NodeId>,
}

impl DispatcherState {
    /// The current backend list, as pushed to frontends
    pub fn backend_list(&self) -> Vec<BackendInfo> {
        self.backends
            .values()
            .map(|ctx| ctx.delegate.backend_info())
            .collect()
    }

    /// Build the route update for a session from its current weights
    pub fn route_update_for(&self, session_id: &str) -> Option<ModelRouteUpdate> {
        let session = self.sessions.get(session_id)?;
        let mut backend_rates: Vec<BackendRate> = session
            .backend_weights
            .iter()
            .filter(|(_, weight)| **weight >= RATE_EPSILON)
            .filter_map(|(backend_id, weight)| {
                let ctx = self.backends.get(backend_id)?;
                Some(BackendRate {
                    info: ctx.delegate.backend_info(),
                    throughput: *weight,
                })
            })
            .collect();
        // Deterministic member order keeps DRR cursors meaningful
        backend_rates.sort_by(|a, b| a.info.node_id.cmp(&b.info.node_id));
        Some(ModelRouteUpdate {
            model_session_id: session_id.to_string(),
            backend_rates,
        })
    }

    /// Recompute a session's DRR route from its weights
    pub fn rebuild_route(&mut self, session_id: &str) {
        let Some(update) = self.route_update_for(session_id) else {
            return;
        };
        self.routes
            .entry(session_id.to_string())
            .or_insert_with(|| ModelRoute::new(session_id))
            .update(&update);
    }

    /// Push refreshed routes to each frontend subscribed to any changed
    /// session. Delegate channels are non-blocking, so calling this under
    /// the state mutex is safe.
    pub fn push_route_updates(&self, changed: &HashSet<String>) {
        let mut per_frontend: HashMap<NodeId, Vec<ModelRouteUpdate>> = HashMap::new();
        for session_id in changed {
            let Some(session) = self.sessions.get(session_id) else {
                continue;
            };
            let Some(update) = self.route_update_for(session_id) else {
                continue;
            };
            for frontend_id in &session.subscribers {
                per_frontend
                    .entry(frontend_id.clone())
                    .or_default()
                    .push(update.clone());
            }
        }
        for (frontend_id, updates) in per_frontend {
            if let Some(frontend) = self.frontends.get(&frontend_id) {
                frontend.update_model_routes(updates);
            }
        }
    }

    /// Add `weight` of a session onto a backend, creating the instance
    /// (and telling the backend to load the model) when needed. Returns
    /// false when the backend's GPU has no profile for the model.
    pub fn load_onto_backend(
        &mut self,
        profiles: &ProfileRegistry,
        session_id: &str,
        backend_id: &NodeId,
        weight: f64,
    ) -> bool {
        let Some(model_session) = self
            .sessions
            .get(session_id)
            .map(|s| s.model_session.clone())
        else {
            return false;
        };
        let Some(ctx) = self.backends.get_mut(backend_id) else {
            return false;
        };
        if !ctx.instances.contains_key(session_id) {
            let Some(profile) = profiles.get(
                ctx.delegate.gpu_device(),
                ctx.delegate.gpu_uuid(),
                &model_session.profile_id(),
            ) else {
                return false;
            };
            let inst = InstanceContext::new(&model_session, profile);
            if inst.max_batch == 0 {
                return false;
            }
            ctx.delegate.send_load_model(model_session, inst.max_batch);
            ctx.instances.insert(session_id.to_string(), inst);
        }
        if let Some(inst) = ctx.instances.get_mut(session_id) {
            inst.weight_rps += weight;
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            *session
                .backend_weights
                .entry(backend_id.clone())
                .or_insert(0.0) += weight;
        }
        true
    }

    /// Remove a session's instance from a backend and drop its weight,
    /// telling the backend to unload the model
    pub fn unload_from_backend(&mut self, session_id: &str, backend_id: &NodeId) {
        if let Some(ctx) = self.backends.get_mut(backend_id) {
            if ctx.instances.remove(session_id).is_some() {
                ctx.delegate.send_unload_model(session_id);
            }
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.backend_weights.remove(backend_id);
        }
    }
}
