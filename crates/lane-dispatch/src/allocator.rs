//! Best-fit backend selection and unassigned-workload bin packing
//!
//! Used when a model session first loads, when the epoch scheduler leaves
//! throughput unplaced, and when a backend departs.

use crate::state::{DispatcherState, RATE_EPSILON};
use lane_core::{ModelSession, NodeId, ProfileRegistry};
use std::collections::HashSet;
use tracing::{debug, info};

/// A backend's offer to serve part of a workload
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub backend_id: NodeId,
    /// Throughput the backend can actually take on
    pub throughput: f64,
    /// Backend occupancy after accepting the offer
    pub occupancy: f64,
}

/// Find the backend to place `required_rate` of a session on.
///
/// Backends in `skips`, backends fixed to a static workload slot, and
/// (when `required_rate` is zero) busy backends are not considered.
/// Selection among the rest: a zero required rate picks the offer with the
/// highest throughput; when nobody achieves the required rate the highest
/// throughput still wins (take what we can get); otherwise the highest
/// occupancy wins, keeping the fit tight and leaving room for others.
pub(crate) fn find_best_backend(
    state: &DispatcherState,
    profiles: &ProfileRegistry,
    session: &ModelSession,
    required_rate: f64,
    skips: &HashSet<NodeId>,
) -> Option<Candidate> {
    let zero_rate = required_rate.abs() < RATE_EPSILON;
    let mut max_throughput: Option<Candidate> = None;
    let mut max_occupancy: Option<Candidate> = None;

    for (backend_id, ctx) in &state.backends {
        if skips.contains(backend_id) {
            continue;
        }
        if ctx.workload_id.is_some() {
            continue;
        }
        if zero_rate && !ctx.is_idle() {
            continue;
        }
        let Some(profile) = profiles.get(
            ctx.delegate.gpu_device(),
            ctx.delegate.gpu_uuid(),
            &session.profile_id(),
        ) else {
            continue;
        };
        let Some((throughput, occupancy)) = ctx.prepare_load_model(session, profile, required_rate)
        else {
            continue;
        };
        let candidate = Candidate {
            backend_id: backend_id.clone(),
            throughput,
            occupancy,
        };
        if max_throughput
            .as_ref()
            .map_or(true, |best| candidate.throughput > best.throughput)
        {
            max_throughput = Some(candidate.clone());
        }
        if max_occupancy
            .as_ref()
            .map_or(true, |best| candidate.occupancy > best.occupancy)
        {
            max_occupancy = Some(candidate);
        }
    }

    if zero_rate {
        max_throughput
    } else if max_throughput
        .as_ref()
        .map_or(true, |best| best.throughput < required_rate)
    {
        max_throughput
    } else {
        max_occupancy
    }
}

/// Place every session's unassigned workload onto backends with room,
/// biggest debts first. Returns the session ids whose routes changed.
pub(crate) fn allocate_unassigned_workloads(
    state: &mut DispatcherState,
    profiles: &ProfileRegistry,
) -> HashSet<String> {
    let mut changed = HashSet::new();

    let mut pending: Vec<(String, f64)> = state
        .sessions
        .iter()
        .filter(|(_, session)| session.unassigned_workload > RATE_EPSILON)
        .map(|(id, session)| (id.clone(), session.unassigned_workload))
        .collect();
    if pending.is_empty() {
        return changed;
    }
    pending.sort_by(|a, b| b.1.total_cmp(&a.1));

    for (session_id, mut request_rate) in pending {
        debug!(
            "Allocating unassigned workload for {}: {} rps",
            session_id, request_rate
        );
        let model_session = match state.sessions.get(&session_id) {
            Some(session) => session.model_session.clone(),
            None => continue,
        };
        while request_rate > RATE_EPSILON {
            let Some(candidate) = find_best_backend(
                state,
                profiles,
                &model_session,
                request_rate,
                &HashSet::new(),
            ) else {
                info!(
                    "Unassigned workload remains for {}: {} rps",
                    session_id, request_rate
                );
                break;
            };
            if state.load_onto_backend(profiles, &session_id, &candidate.backend_id, candidate.throughput)
            {
                request_rate -= candidate.throughput;
                changed.insert(session_id.clone());
            } else {
                break;
            }
        }
        if request_rate.abs() < RATE_EPSILON {
            request_rate = 0.0;
        }
        if let Some(session) = state.sessions.get_mut(&session_id) {
            session.unassigned_workload = request_rate.max(0.0);
        }
    }
    changed
}
