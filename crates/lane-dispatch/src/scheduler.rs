//! Epoch scheduler
//!
//! A dedicated loop that wakes every beacon interval, folds measured
//! request rates into per-session histories, and periodically reshapes the
//! per-model backend-rate tables: shrinking over-provisioned sessions,
//! growing under-provisioned ones, spilling workload off overloaded
//! backends and bin-packing whatever is left onto backends with room.

use crate::allocator;
use crate::dispatcher::Dispatcher;
use crate::state::{DispatcherState, RATE_EPSILON};
use lane_core::{NodeId, NodeKind, UnregisterRequest};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Sessions whose measured rate drifts outside
/// [`LOW_WATERMARK`, `HIGH_WATERMARK`] of their allocated throughput
/// trigger an early epoch pass.
const LOW_WATERMARK: f64 = 0.8;
const HIGH_WATERMARK: f64 = 1.1;

/// Shrink only when the rate is meaningfully below the allocation, so the
/// scheduler does not thrash around the break-even point
const SHRINK_THRESHOLD: f64 = 0.97;

/// Backends past this occupancy after a grow pass spill workload out
const OVERLOAD_OCCUPANCY: f64 = 1.05;

/// Handle to the running beacon loop
pub struct SchedulerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the beacon loop and wait for it to exit
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

/// Spawn the scheduler beacon loop for a dispatcher
pub fn spawn(dispatcher: Arc<Dispatcher>) -> SchedulerHandle {
    let (shutdown, mut shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(async move {
        let beacon = Duration::from_secs(u64::from(dispatcher.config().beacon_interval_sec));
        if !dispatcher.config().epoch_schedule {
            info!("Epoch scheduling is off");
        }
        info!("Scheduler beacon loop running every {:?}", beacon);
        let mut last_epoch_schedule = Instant::now();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(beacon) => {
                    dispatcher.beacon_tick(&mut last_epoch_schedule);
                }
                _ = shutdown_rx.changed() => {
                    info!("Scheduler beacon loop stopped");
                    break;
                }
            }
        }
    });
    SchedulerHandle { shutdown, handle }
}

impl Dispatcher {
    /// One beacon iteration: liveness sweep, rate sampling, and an epoch
    /// pass when triggered or overdue
    pub fn beacon_tick(&self, last_epoch_schedule: &mut Instant) {
        let trigger = self.beacon_check();
        if !self.config.epoch_schedule {
            return;
        }
        let elapsed = last_epoch_schedule.elapsed();
        let min_epoch = Duration::from_secs(u64::from(self.config.min_epoch_sec));
        let epoch_interval = Duration::from_secs(u64::from(self.config.epoch_interval_sec));
        if (trigger && elapsed >= min_epoch) || elapsed >= epoch_interval {
            self.epoch_schedule();
            *last_epoch_schedule = Instant::now();
        }
    }

    /// Sweep dead nodes, push one request-rate sample per session, and
    /// report whether any session drifted far enough from its allocation
    /// to warrant an early epoch pass
    pub fn beacon_check(&self) -> bool {
        self.sweep_dead_nodes();

        let history_len = self.config.history_len();
        let mut state = self.state.lock();
        for (session_id, session) in state.sessions.iter_mut() {
            let rps = session.measure_rate().max(0.0);
            // A session that has never seen traffic stays unmeasured
            if !session.rps_history.is_empty() || rps > 0.0 {
                session.rps_history.push_back(rps);
            }
            while session.rps_history.len() > history_len {
                session.rps_history.pop_front();
            }
            debug!("Model {} rate sample: {:.1} rps", session_id, rps);
        }

        state.sessions.values().any(|session| {
            if session.rps_history.len() < history_len {
                return false;
            }
            let estimate = session.rps_history.back().copied().unwrap_or(0.0).max(0.1);
            let throughput = session.total_throughput();
            estimate < throughput * LOW_WATERMARK || estimate > throughput * HIGH_WATERMARK
        })
    }

    /// Unregister nodes whose keep-alives stopped arriving
    pub fn sweep_dead_nodes(&self) {
        let deadline = Duration::from_secs(u64::from(
            self.config.beacon_interval_sec * self.config.dead_beacon_count,
        ));
        let (dead_frontends, dead_backends): (Vec<NodeId>, Vec<NodeId>) = {
            let state = self.state.lock();
            (
                state
                    .frontends
                    .iter()
                    .filter(|(_, f)| f.since_tick() > deadline)
                    .map(|(id, _)| id.clone())
                    .collect(),
                state
                    .backends
                    .iter()
                    .filter(|(_, b)| b.delegate.since_tick() > deadline)
                    .map(|(id, _)| id.clone())
                    .collect(),
            )
        };
        for node_id in dead_frontends {
            warn!("Frontend {} missed its beacons, unregistering", node_id);
            self.unregister(&UnregisterRequest {
                node_kind: NodeKind::Frontend,
                node_id,
            });
        }
        for node_id in dead_backends {
            warn!("Backend {} missed its beacons, unregistering", node_id);
            self.unregister(&UnregisterRequest {
                node_kind: NodeKind::Backend,
                node_id,
            });
        }
    }

    /// Reshape every session's backend allocation from its measured rate.
    /// Idempotent for unchanged rate histories.
    pub fn epoch_schedule(&self) {
        let history_len = self.config.history_len();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        debug!("Epoch schedule");

        let mut changed: HashSet<String> = HashSet::new();
        let mut overloaded: Vec<NodeId> = Vec::new();

        let session_ids: Vec<String> = state.sessions.keys().cloned().collect();
        for session_id in &session_ids {
            let Some(session) = state.sessions.get_mut(session_id) else {
                continue;
            };
            if session.rps_history.len() < history_len {
                continue;
            }
            let estimate = session.rps_history.back().copied().unwrap_or(0.0).max(0.1);
            let throughput = session.total_throughput();
            session.unassigned_workload = (estimate - throughput).max(0.0);
            debug!(
                "{}: estimate {:.1} rps, allocated {:.1} rps",
                session_id, estimate, throughput
            );

            if estimate < throughput * SHRINK_THRESHOLD {
                shrink_session(state, session_id, estimate, &mut changed);
            } else if estimate > throughput {
                grow_session(state, session_id, estimate, &mut changed, &mut overloaded);
            }
        }

        // Overloaded backends shed whole sessions; the shed load joins the
        // unassigned pool
        overloaded.sort();
        overloaded.dedup();
        for backend_id in overloaded {
            let shed = match state.backends.get_mut(&backend_id) {
                Some(ctx) if ctx.occupancy() > OVERLOAD_OCCUPANCY => ctx.spill_out_workload(),
                _ => continue,
            };
            for (session_id, rate) in shed {
                info!(
                    "Spill {:.1} rps of {} out of backend {}",
                    rate, session_id, backend_id
                );
                if let Some(session) = state.sessions.get_mut(&session_id) {
                    session.backend_weights.remove(&backend_id);
                    session.unassigned_workload += rate;
                    changed.insert(session_id);
                }
            }
        }

        changed.extend(allocator::allocate_unassigned_workloads(state, &self.profiles));

        for session_id in &changed {
            state.rebuild_route(session_id);
        }
        state.push_route_updates(&changed);
    }
}

/// Release capacity from a session whose measured rate dropped below its
/// allocation. Static backends keep their share; the rest drain the
/// estimate biggest-first, and whoever comes after it hits zero unloads.
fn shrink_session(
    state: &mut DispatcherState,
    session_id: &str,
    mut remaining: f64,
    changed: &mut HashSet<String>,
) {
    let mut adjustable = partition_static(state, session_id, &mut remaining);
    adjustable.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (backend_id, weight) in adjustable {
        if remaining < RATE_EPSILON {
            state.unload_from_backend(session_id, &backend_id);
        } else if weight > remaining {
            let new_weight = state
                .backends
                .get_mut(&backend_id)
                .map(|ctx| ctx.update_model_throughput(session_id, remaining))
                .unwrap_or(0.0);
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.backend_weights.insert(backend_id, new_weight);
            }
            remaining -= new_weight;
        } else {
            remaining -= weight;
        }
    }
    changed.insert(session_id.to_string());
}

/// Grow a session whose measured rate outruns its allocation. Each
/// adjustable backend is pushed toward the remaining estimate; what no
/// backend can absorb becomes unassigned workload.
fn grow_session(
    state: &mut DispatcherState,
    session_id: &str,
    mut remaining: f64,
    changed: &mut HashSet<String>,
    overloaded: &mut Vec<NodeId>,
) {
    let mut adjustable = partition_static(state, session_id, &mut remaining);
    adjustable.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (backend_id, _) in adjustable {
        if remaining < RATE_EPSILON {
            state.unload_from_backend(session_id, &backend_id);
            continue;
        }
        let new_weight = state
            .backends
            .get_mut(&backend_id)
            .map(|ctx| ctx.update_model_throughput(session_id, remaining))
            .unwrap_or(0.0);
        if let Some(session) = state.sessions.get_mut(session_id) {
            session.backend_weights.insert(backend_id.clone(), new_weight);
        }
        remaining -= new_weight;
        if state
            .backends
            .get(&backend_id)
            .map_or(false, |ctx| ctx.occupancy() > OVERLOAD_OCCUPANCY)
        {
            overloaded.push(backend_id);
        }
    }

    if let Some(session) = state.sessions.get_mut(session_id) {
        session.unassigned_workload = if remaining > RATE_EPSILON { remaining } else { 0.0 };
    }
    changed.insert(session_id.to_string());
}

/// Split a session's members into static and adjustable. Static backends
/// keep serving their share, which is subtracted from the target up front.
fn partition_static(
    state: &DispatcherState,
    session_id: &str,
    remaining: &mut f64,
) -> Vec<(NodeId, f64)> {
    let Some(session) = state.sessions.get(session_id) else {
        return Vec::new();
    };
    let mut adjustable = Vec::new();
    for (backend_id, weight) in &session.backend_weights {
        let is_static = state
            .backends
            .get(backend_id)
            .map_or(false, |ctx| ctx.workload_id.is_some());
        if is_static {
            *remaining -= weight;
        } else {
            adjustable.push((backend_id.clone(), *weight));
        }
    }
    adjustable
}
