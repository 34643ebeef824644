//! Dispatcher core
//!
//! Registers frontends and backends, routes each incoming query to a
//! backend via deficit round robin, builds single-query batch plans with an
//! execution time and a deadline, and keeps the per-model routing tables
//! that the epoch scheduler reshapes.
//!
//! All tables live under one state mutex. The critical sections are pure
//! bookkeeping; outbound traffic goes through per-delegate channels with
//! non-blocking sends, so the lock is never held across network I/O.

use crate::allocator::{self, Candidate};
use crate::delegate::{BackendDelegate, FrontendDelegate};
use crate::state::{BackendContext, DispatcherState, InstanceContext, SessionInfo, RATE_EPSILON};
use lane_core::{
    now_ns, BackendCommand, BatchPlan, CtrlReply, CtrlStatus, DispatchReply, DispatcherConfig,
    FrontendNotice, GlobalId, KeepAliveRequest, LoadModelReply, LoadModelRequest,
    ModelRouteUpdate, NodeId, NodeKind, PlanId, ProfileRegistry, Query, RegisterReply,
    RegisterRequest, StaticWorkloadEntry, UnregisterRequest,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Budget for the dispatcher-to-backend hop. Every plan's execution time is
/// this far in the future so the plan arrives before it is due.
pub const NETWORK_LATENCY_NS: u64 = 5_000_000;

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct DispatcherStats {
    pub queries_dispatched: AtomicU64,
    pub model_not_found: AtomicU64,
    pub backend_unavailable: AtomicU64,
}

/// The receiving half of a freshly registered node's outbound channel. The
/// transport layer drains it toward the remote node.
pub enum NodeChannel {
    Frontend(mpsc::Receiver<FrontendNotice>),
    Backend(mpsc::Receiver<BackendCommand>),
}

/// The dispatcher/scheduler control plane
pub struct Dispatcher {
    pub(crate) config: DispatcherConfig,
    pub(crate) profiles: Arc<ProfileRegistry>,
    pub(crate) state: Mutex<DispatcherState>,
    next_global_id: AtomicU64,
    next_plan_id: AtomicU64,
    stats: DispatcherStats,
}

impl Dispatcher {
    /// Create a dispatcher over an injected profile registry and the static
    /// workload slots from configuration
    pub fn new(
        config: DispatcherConfig,
        profiles: Arc<ProfileRegistry>,
        static_workloads: Vec<Vec<StaticWorkloadEntry>>,
    ) -> Self {
        let state = DispatcherState {
            static_workloads,
            ..Default::default()
        };
        Self {
            config,
            profiles,
            state: Mutex::new(state),
            next_global_id: AtomicU64::new(1),
            next_plan_id: AtomicU64::new(1),
            stats: DispatcherStats::default(),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    fn avg_interval(&self) -> Duration {
        Duration::from_secs(u64::from(self.config.avg_interval_sec))
    }

    /// Register a frontend or backend. On success the caller receives the
    /// node's outbound channel to drain toward the remote side.
    pub fn register(
        &self,
        request: RegisterRequest,
        ip: IpAddr,
    ) -> (RegisterReply, Option<NodeChannel>) {
        match request.node_kind {
            NodeKind::Frontend => self.register_frontend(request, ip),
            NodeKind::Backend => self.register_backend(request, ip),
        }
    }

    fn register_frontend(
        &self,
        request: RegisterRequest,
        ip: IpAddr,
    ) -> (RegisterReply, Option<NodeChannel>) {
        let (delegate, rx) = FrontendDelegate::new(
            request.node_id.clone(),
            ip,
            request.server_port,
            request.rpc_port,
            self.config.delegate_channel_capacity,
        );
        let delegate = Arc::new(delegate);

        let mut state = self.state.lock();
        if state.frontends.contains_key(&request.node_id) {
            warn!("Frontend id conflict: {}", request.node_id);
            return (
                RegisterReply {
                    status: CtrlStatus::FrontendIdConflict,
                    beacon_interval_sec: self.config.beacon_interval_sec,
                },
                None,
            );
        }
        state.frontends.insert(request.node_id.clone(), delegate.clone());
        delegate.update_backend_list(state.backend_list());
        drop(state);

        info!("Registered frontend {} at {}", request.node_id, ip);
        (
            RegisterReply {
                status: CtrlStatus::Ok,
                beacon_interval_sec: self.config.beacon_interval_sec,
            },
            Some(NodeChannel::Frontend(rx)),
        )
    }

    fn register_backend(
        &self,
        request: RegisterRequest,
        ip: IpAddr,
    ) -> (RegisterReply, Option<NodeChannel>) {
        let (delegate, rx) = BackendDelegate::new(
            request.node_id.clone(),
            ip,
            request.server_port,
            request.rpc_port,
            request.gpu_device.clone(),
            request.gpu_uuid.clone(),
            request.gpu_available_memory,
            self.config.delegate_channel_capacity,
        );
        let delegate = Arc::new(delegate);

        let mut state = self.state.lock();
        if state.backends.contains_key(&request.node_id) {
            warn!("Backend id conflict: {}", request.node_id);
            return (
                RegisterReply {
                    status: CtrlStatus::BackendIdConflict,
                    beacon_interval_sec: self.config.beacon_interval_sec,
                },
                None,
            );
        }

        // Preload every known session whose profile exists on this GPU
        let mut ctx = BackendContext::new(delegate.clone());
        for (session_id, session) in &state.sessions {
            let Some(profile) = self.profiles.get(
                &request.gpu_device,
                &request.gpu_uuid,
                &session.model_session.profile_id(),
            ) else {
                debug!(
                    "No profile for {} on {} ({}), skipping preload",
                    session_id, request.gpu_device, request.gpu_uuid
                );
                continue;
            };
            let inst = InstanceContext::new(&session.model_session, profile);
            if inst.max_batch == 0 {
                debug!("SLA of {} fits no batch on {}, skipping", session_id, request.gpu_device);
                continue;
            }
            delegate.send_load_model(session.model_session.clone(), inst.max_batch);
            ctx.instances.insert(session_id.clone(), inst);
        }
        state.backends.insert(request.node_id.clone(), ctx);

        // A preconfigured workload slot fixes this backend; otherwise it
        // soaks up whatever the scheduler could not place so far
        let free_slot = (0..state.static_workloads.len())
            .find(|slot| !state.assigned_static_workloads.contains_key(slot));
        let changed = if let Some(slot) = free_slot {
            info!("Assign static workload slot {} to backend {}", slot, request.node_id);
            self.assign_static_workload(&mut state, &request.node_id, slot)
        } else {
            allocator::allocate_unassigned_workloads(&mut state, &self.profiles)
        };
        for session_id in &changed {
            state.rebuild_route(session_id);
        }
        state.push_route_updates(&changed);

        let backend_list = state.backend_list();
        for frontend in state.frontends.values() {
            frontend.update_backend_list(backend_list.clone());
        }
        drop(state);

        info!(
            "Registered backend {} at {} ({}, {})",
            request.node_id, ip, request.gpu_device, request.gpu_uuid
        );
        (
            RegisterReply {
                status: CtrlStatus::Ok,
                beacon_interval_sec: self.config.beacon_interval_sec,
            },
            Some(NodeChannel::Backend(rx)),
        )
    }

    fn assign_static_workload(
        &self,
        state: &mut DispatcherState,
        backend_id: &NodeId,
        slot: usize,
    ) -> HashSet<String> {
        let entries = state.static_workloads[slot].clone();
        state.assigned_static_workloads.insert(slot, backend_id.clone());
        if let Some(ctx) = state.backends.get_mut(backend_id) {
            ctx.workload_id = Some(slot);
        }

        let mut changed = HashSet::new();
        for entry in entries {
            let session_id = entry.session.session_id();
            let session = state
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| SessionInfo::new(entry.session.clone(), self.avg_interval()));
            session.has_static_workload = true;
            if entry.backup {
                session.backup_backends.insert(backend_id.clone());
                continue;
            }
            if state.load_onto_backend(&self.profiles, &session_id, backend_id, entry.rate) {
                changed.insert(session_id);
            } else {
                warn!(
                    "Static workload slot {}: cannot load {} on backend {}",
                    slot, session_id, backend_id
                );
            }
        }
        changed
    }

    /// Remove a node. Backend removal runs the backend-gone reallocation.
    pub fn unregister(&self, request: &UnregisterRequest) -> CtrlReply {
        let mut state = self.state.lock();
        match request.node_kind {
            NodeKind::Frontend => {
                let Some(frontend) = state.frontends.remove(&request.node_id) else {
                    return CtrlReply { status: CtrlStatus::NotRegistered };
                };
                info!("Remove frontend {}", request.node_id);
                self.remove_frontend_locked(&mut state, &frontend);
            }
            NodeKind::Backend => {
                let Some(ctx) = state.backends.remove(&request.node_id) else {
                    return CtrlReply { status: CtrlStatus::NotRegistered };
                };
                info!("Remove backend {}", request.node_id);
                self.remove_backend_locked(&mut state, &request.node_id, ctx);
            }
        }
        CtrlReply { status: CtrlStatus::Ok }
    }

    fn remove_frontend_locked(&self, state: &mut DispatcherState, frontend: &FrontendDelegate) {
        let frontend_id = frontend.node_id().clone();
        let mut orphaned = Vec::new();
        for (session_id, session) in state.sessions.iter_mut() {
            if session.subscribers.remove(&frontend_id)
                && session.subscribers.is_empty()
                && !session.has_static_workload
            {
                orphaned.push(session_id.clone());
            }
        }
        for session_id in orphaned {
            info!("Remove model session {}", session_id);
            for ctx in state.backends.values_mut() {
                if ctx.instances.remove(&session_id).is_some() {
                    ctx.delegate.send_unload_model(session_id.as_str());
                }
            }
            state.sessions.remove(&session_id);
            state.routes.remove(&session_id);
        }
    }

    pub(crate) fn remove_backend_locked(
        &self,
        state: &mut DispatcherState,
        backend_id: &NodeId,
        ctx: BackendContext,
    ) {
        for session in state.sessions.values_mut() {
            session.backup_backends.remove(backend_id);
        }

        let departing: Vec<(String, f64)> = ctx
            .instances
            .iter()
            .filter(|(_, inst)| inst.weight_rps >= RATE_EPSILON)
            .map(|(session_id, inst)| (session_id.clone(), inst.weight_rps))
            .collect();
        if departing.is_empty() {
            if let Some(slot) = ctx.workload_id {
                state.assigned_static_workloads.remove(&slot);
            }
            return;
        }

        let mut changed: HashSet<String> = HashSet::new();
        for (session_id, _) in &departing {
            if let Some(session) = state.sessions.get_mut(session_id) {
                session.backend_weights.remove(backend_id);
                changed.insert(session_id.clone());
            }
        }

        // Prefer reseating the whole workload on one idle backend
        let candidates: Vec<NodeId> = state
            .backends
            .iter()
            .filter(|(_, b)| b.is_idle() && b.workload_id.is_none())
            .map(|(id, _)| id.clone())
            .collect();
        let target = candidates
            .into_iter()
            .find(|id| self.can_assign(state, id, &departing));

        if let Some(target_id) = target {
            info!("Reassign workload of backend {} to {}", backend_id, target_id);
            for (session_id, weight) in &departing {
                state.load_onto_backend(&self.profiles, session_id, &target_id, *weight);
            }
            if let Some(slot) = ctx.workload_id {
                state.assigned_static_workloads.insert(slot, target_id.clone());
                if let Some(target_ctx) = state.backends.get_mut(&target_id) {
                    target_ctx.workload_id = Some(slot);
                }
            }
        } else if let Some(slot) = ctx.workload_id {
            info!("Static workload slot {} is unassigned again", slot);
            state.assigned_static_workloads.remove(&slot);
        } else {
            for (session_id, weight) in &departing {
                if let Some(session) = state.sessions.get_mut(session_id) {
                    session.unassigned_workload += weight;
                }
            }
            changed.extend(allocator::allocate_unassigned_workloads(state, &self.profiles));
        }

        for session_id in &changed {
            state.rebuild_route(session_id);
        }
        state.push_route_updates(&changed);
    }

    fn can_assign(
        &self,
        state: &DispatcherState,
        target_id: &NodeId,
        departing: &[(String, f64)],
    ) -> bool {
        let Some(target) = state.backends.get(target_id) else {
            return false;
        };
        let mut occupancy = target.occupancy();
        for (session_id, weight) in departing {
            let Some(session) = state.sessions.get(session_id) else {
                return false;
            };
            let Some(profile) = self.profiles.get(
                target.delegate.gpu_device(),
                target.delegate.gpu_uuid(),
                &session.model_session.profile_id(),
            ) else {
                return false;
            };
            let capacity = profile.saturation_throughput(session.model_session.latency_sla_us);
            if capacity <= 0.0 {
                return false;
            }
            occupancy += weight / capacity;
        }
        occupancy <= 1.0 + 1e-6
    }

    /// Refresh a node's liveness tick
    pub fn keep_alive(&self, request: &KeepAliveRequest) -> CtrlReply {
        let state = self.state.lock();
        let status = match request.node_kind {
            NodeKind::Frontend => match state.frontends.get(&request.node_id) {
                Some(frontend) => {
                    frontend.tick();
                    CtrlStatus::Ok
                }
                None => CtrlStatus::NotRegistered,
            },
            NodeKind::Backend => match state.backends.get(&request.node_id) {
                Some(ctx) => {
                    ctx.delegate.tick();
                    CtrlStatus::Ok
                }
                None => CtrlStatus::NotRegistered,
            },
        };
        CtrlReply { status }
    }

    /// Serve a frontend's request to load a model session. A new session
    /// gets backends assigned from `estimate_workload`; an existing one
    /// just gains a subscriber.
    pub fn load_model(&self, request: LoadModelRequest) -> LoadModelReply {
        let session = request.model_session;
        let session_id = session.session_id();
        if !self.profiles.knows_model(&session.profile_id()) {
            error!("LoadModel: no profile anywhere for model {}", session.profile_id());
            return LoadModelReply {
                status: CtrlStatus::ModelNotFound,
                model_route: None,
            };
        }

        let mut state = self.state.lock();
        if !state.frontends.contains_key(&request.node_id) {
            return LoadModelReply {
                status: CtrlStatus::NotRegistered,
                model_route: None,
            };
        }

        if state.sessions.contains_key(&session_id) {
            // Already served; subscribe and rely on epoch scheduling for
            // capacity adjustments
            if let Some(existing) = state.sessions.get_mut(&session_id) {
                existing.subscribers.insert(request.node_id.clone());
            }
            let model_route = state.route_update_for(&session_id);
            return LoadModelReply {
                status: CtrlStatus::Ok,
                model_route,
            };
        }

        // Pick backends for the estimated workload before committing state
        let mut assignments: Vec<Candidate> = Vec::new();
        let mut used: HashSet<NodeId> = HashSet::new();
        if request.estimate_workload.abs() < RATE_EPSILON {
            match allocator::find_best_backend(&state, &self.profiles, &session, 0.0, &used) {
                Some(candidate) => assignments.push(candidate),
                None => {
                    return LoadModelReply {
                        status: CtrlStatus::NotEnoughBackends,
                        model_route: None,
                    }
                }
            }
        } else {
            let mut workload = request.estimate_workload;
            while workload > RATE_EPSILON {
                match allocator::find_best_backend(&state, &self.profiles, &session, workload, &used)
                {
                    Some(candidate) => {
                        used.insert(candidate.backend_id.clone());
                        workload -= candidate.throughput;
                        assignments.push(candidate);
                    }
                    None => {
                        return LoadModelReply {
                            status: CtrlStatus::NotEnoughBackends,
                            model_route: None,
                        }
                    }
                }
            }
        }

        let mut info = SessionInfo::new(session.clone(), self.avg_interval());
        info.subscribers.insert(request.node_id.clone());
        state.sessions.insert(session_id.clone(), info);
        for candidate in assignments {
            state.load_onto_backend(
                &self.profiles,
                &session_id,
                &candidate.backend_id,
                candidate.throughput,
            );
        }
        state.rebuild_route(&session_id);
        info!(
            "Loaded model session {} ({} rps requested)",
            session_id, request.estimate_workload
        );

        let model_route = state.route_update_for(&session_id);
        LoadModelReply {
            status: CtrlStatus::Ok,
            model_route,
        }
    }

    /// Route one query: mint its global id, pick a backend via DRR, build a
    /// single-query batch plan and hand it to the backend delegate.
    ///
    /// `Ok` means the plan was enqueued locally; the execution result flows
    /// back over the backend's own reply path.
    pub fn dispatch(&self, mut query: Query) -> DispatchReply {
        let model_session_id = query.model_session_id.clone();
        let query_id = query.query_id;

        query.clock.dispatcher_sched_ns = now_ns();
        query.global_id = GlobalId(self.next_global_id.fetch_add(1, Ordering::Relaxed));

        let reply = |status: CtrlStatus| DispatchReply {
            status,
            model_session_id: model_session_id.clone(),
            query_id,
        };

        {
            let mut state = self.state.lock();
            let Some(route) = state.routes.get_mut(&model_session_id) else {
                self.stats.model_not_found.fetch_add(1, Ordering::Relaxed);
                return reply(CtrlStatus::ModelNotFound);
            };
            let backend_info = match route.get_backend() {
                Ok(info) => info,
                Err(_) => {
                    self.stats.backend_unavailable.fetch_add(1, Ordering::Relaxed);
                    return reply(CtrlStatus::BackendUnavailable);
                }
            };
            let latency_sla_us = match state.sessions.get_mut(&model_session_id) {
                Some(session) => {
                    session.counter.add(1);
                    session.model_session.latency_sla_us
                }
                None => {
                    self.stats.model_not_found.fetch_add(1, Ordering::Relaxed);
                    return reply(CtrlStatus::ModelNotFound);
                }
            };
            let Some(ctx) = state.backends.get_mut(&backend_info.node_id) else {
                error!("Cannot find delegate for backend {}", backend_info.node_id);
                self.stats.backend_unavailable.fetch_add(1, Ordering::Relaxed);
                return reply(CtrlStatus::BackendUnavailable);
            };
            let Some(inst) = ctx.instances.get(&model_session_id) else {
                error!(
                    "Backend {} has no instance of {}",
                    backend_info.node_id, model_session_id
                );
                self.stats.backend_unavailable.fetch_add(1, Ordering::Relaxed);
                return reply(CtrlStatus::BackendUnavailable);
            };

            let forward_latency_ns = (inst.profile.forward_latency_us(1) * 1_000.0) as u64;
            let dispatch_ns = now_ns();
            query.clock.dispatcher_dispatch_ns = dispatch_ns;
            let exec_time_ns = dispatch_ns + NETWORK_LATENCY_NS;
            let expected_finish_time_ns = exec_time_ns + forward_latency_ns;
            let deadline_ns = query.clock.frontend_recv_ns + latency_sla_us * 1_000;
            ctx.next_available_time_ns = expected_finish_time_ns;

            let plan = BatchPlan {
                plan_id: PlanId(self.next_plan_id.fetch_add(1, Ordering::Relaxed)),
                model_session_id: model_session_id.clone(),
                queries: vec![query],
                exec_time_ns,
                deadline_ns,
                expected_finish_time_ns,
            };
            // Enqueued under the lock so same-session plans reach the
            // backend in dispatch order; the channel send never blocks
            ctx.delegate.enqueue_batch_plan(plan);
        }

        self.stats.queries_dispatched.fetch_add(1, Ordering::Relaxed);
        reply(CtrlStatus::Ok)
    }

    /// Read back the current route for a session
    pub fn get_model_route(&self, session_id: &str) -> Option<ModelRouteUpdate> {
        self.state.lock().routes.get(session_id).map(|route| route.to_update())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lane_core::{ModelProfile, ModelSession, PunchClock};
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn model() -> ModelSession {
        ModelSession::new("tensorflow", "resnet50", 1, 50_000)
    }

    fn t4_profile() -> ModelProfile {
        // max batch 45, saturation 900 rps under the 50 ms SLA
        ModelProfile {
            profile_id: model().profile_id(),
            slope_us: 1000.0,
            intercept_us: 5000.0,
            static_memory_mb: 512,
        }
    }

    fn registry_for(backends: &[&str]) -> Arc<ProfileRegistry> {
        let mut registry = ProfileRegistry::new();
        for id in backends {
            registry.insert("tesla_t4", format!("GPU-{}", id), t4_profile());
        }
        Arc::new(registry)
    }

    fn dispatcher(backends: &[&str]) -> Dispatcher {
        Dispatcher::new(DispatcherConfig::default(), registry_for(backends), Vec::new())
    }

    fn register_backend(
        dispatcher: &Dispatcher,
        id: &str,
    ) -> mpsc::Receiver<BackendCommand> {
        let (reply, channel) = dispatcher.register(
            RegisterRequest {
                node_kind: NodeKind::Backend,
                node_id: NodeId::new(id),
                server_port: 7001,
                rpc_port: 7002,
                gpu_device: "tesla_t4".to_string(),
                gpu_uuid: format!("GPU-{}", id),
                gpu_available_memory: 16 << 30,
            },
            LOCALHOST,
        );
        assert_eq!(reply.status, CtrlStatus::Ok);
        match channel {
            Some(NodeChannel::Backend(rx)) => rx,
            _ => panic!("expected backend channel"),
        }
    }

    fn register_frontend(
        dispatcher: &Dispatcher,
        id: &str,
    ) -> mpsc::Receiver<FrontendNotice> {
        let (reply, channel) = dispatcher.register(
            RegisterRequest {
                node_kind: NodeKind::Frontend,
                node_id: NodeId::new(id),
                server_port: 8001,
                rpc_port: 8002,
                gpu_device: String::new(),
                gpu_uuid: String::new(),
                gpu_available_memory: 0,
            },
            LOCALHOST,
        );
        assert_eq!(reply.status, CtrlStatus::Ok);
        match channel {
            Some(NodeChannel::Frontend(rx)) => rx,
            _ => panic!("expected frontend channel"),
        }
    }

    fn drain_backend(rx: &mut mpsc::Receiver<BackendCommand>) -> Vec<BackendCommand> {
        let mut commands = Vec::new();
        while let Ok(command) = rx.try_recv() {
            commands.push(command);
        }
        commands
    }

    fn query(query_id: u64) -> Query {
        Query {
            query_id,
            global_id: GlobalId(0),
            model_session_id: model().session_id(),
            clock: PunchClock {
                frontend_recv_ns: now_ns(),
                dispatcher_recv_ns: now_ns(),
                ..Default::default()
            },
            payload: None,
        }
    }

    #[test]
    fn test_register_conflicts_are_reported() {
        let d = dispatcher(&["b1"]);
        let _rx = register_backend(&d, "b1");
        let (reply, channel) = d.register(
            RegisterRequest {
                node_kind: NodeKind::Backend,
                node_id: NodeId::new("b1"),
                server_port: 7001,
                rpc_port: 7002,
                gpu_device: "tesla_t4".to_string(),
                gpu_uuid: "GPU-b1".to_string(),
                gpu_available_memory: 16 << 30,
            },
            LOCALHOST,
        );
        assert_eq!(reply.status, CtrlStatus::BackendIdConflict);
        assert!(channel.is_none());
    }

    #[test]
    fn test_frontend_receives_backend_list_on_register() {
        let d = dispatcher(&["b1"]);
        let _backend_rx = register_backend(&d, "b1");
        let mut frontend_rx = register_frontend(&d, "f1");
        match frontend_rx.try_recv().unwrap() {
            FrontendNotice::UpdateBackendList(backends) => {
                assert_eq!(backends.len(), 1);
                assert_eq!(backends[0].node_id, NodeId::new("b1"));
            }
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    #[test]
    fn test_late_backend_is_announced_to_frontends() {
        let d = dispatcher(&["b1"]);
        let mut frontend_rx = register_frontend(&d, "f1");
        let _ = frontend_rx.try_recv(); // initial, empty list
        let _backend_rx = register_backend(&d, "b1");
        match frontend_rx.try_recv().unwrap() {
            FrontendNotice::UpdateBackendList(backends) => assert_eq!(backends.len(), 1),
            other => panic!("unexpected notice: {:?}", other),
        }
    }

    #[test]
    fn test_load_model_assigns_backend_and_returns_route() {
        let d = dispatcher(&["b1"]);
        let mut backend_rx = register_backend(&d, "b1");
        let _frontend_rx = register_frontend(&d, "f1");

        let reply = d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 100.0,
        });
        assert_eq!(reply.status, CtrlStatus::Ok);
        let route = reply.model_route.unwrap();
        assert_eq!(route.backend_rates.len(), 1);
        assert!((route.backend_rates[0].throughput - 100.0).abs() < 1e-6);

        let commands = drain_backend(&mut backend_rx);
        assert!(commands.iter().any(|command| matches!(
            command,
            BackendCommand::LoadModel { max_batch: 45, .. }
        )));
    }

    #[test]
    fn test_load_model_requires_registration_and_profile() {
        let d = dispatcher(&["b1"]);
        let _backend_rx = register_backend(&d, "b1");

        let reply = d.load_model(LoadModelRequest {
            node_id: NodeId::new("ghost"),
            model_session: model(),
            estimate_workload: 10.0,
        });
        assert_eq!(reply.status, CtrlStatus::NotRegistered);

        let _frontend_rx = register_frontend(&d, "f1");
        let unknown = ModelSession::new("tensorflow", "not_profiled", 1, 50_000);
        let reply = d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: unknown,
            estimate_workload: 10.0,
        });
        assert_eq!(reply.status, CtrlStatus::ModelNotFound);
    }

    #[test]
    fn test_dispatch_unknown_model_is_model_not_found() {
        let d = dispatcher(&["b1"]);
        let reply = d.dispatch(query(1));
        assert_eq!(reply.status, CtrlStatus::ModelNotFound);
        assert_eq!(reply.query_id, 1);
    }

    #[test]
    fn test_single_backend_serves_ten_queries_with_coherent_plans() {
        let d = dispatcher(&["b1"]);
        let mut backend_rx = register_backend(&d, "b1");
        let _frontend_rx = register_frontend(&d, "f1");
        assert_eq!(
            d.load_model(LoadModelRequest {
                node_id: NodeId::new("f1"),
                model_session: model(),
                estimate_workload: 100.0,
            })
            .status,
            CtrlStatus::Ok
        );
        drain_backend(&mut backend_rx);

        for i in 0..10 {
            let reply = d.dispatch(query(i));
            assert_eq!(reply.status, CtrlStatus::Ok);
        }

        let mut last_global_id = GlobalId(0);
        let mut plans = 0;
        for command in drain_backend(&mut backend_rx) {
            let BackendCommand::EnqueueBatchPlan(plan) = command else {
                panic!("unexpected command");
            };
            plans += 1;
            assert_eq!(plan.queries.len(), 1);
            let q = &plan.queries[0];

            // Deadline coherence
            assert_eq!(plan.deadline_ns, q.clock.frontend_recv_ns + 50_000_000);
            assert!(plan.exec_time_ns >= q.clock.dispatcher_dispatch_ns + NETWORK_LATENCY_NS);
            assert_eq!(
                plan.expected_finish_time_ns,
                plan.exec_time_ns + 6_000_000 // forward latency of batch 1 is 6 ms
            );
            assert!(plan.expected_finish_time_ns <= plan.deadline_ns);

            // Punch clock ordering
            assert!(q.clock.is_ordered());
            assert!(q.clock.frontend_recv_ns <= q.clock.dispatcher_recv_ns);
            assert!(q.clock.dispatcher_sched_ns <= q.clock.dispatcher_dispatch_ns);

            // Global ids are strictly monotonic in dispatch order
            assert!(q.global_id > last_global_id);
            last_global_id = q.global_id;
        }
        assert_eq!(plans, 10);
        assert_eq!(d.stats().queries_dispatched.load(Ordering::Relaxed), 10);
    }

    #[test]
    fn test_route_round_trip_through_dispatcher() {
        let d = dispatcher(&["b1"]);
        let _backend_rx = register_backend(&d, "b1");
        let _frontend_rx = register_frontend(&d, "f1");
        d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 200.0,
        });

        let route = d.get_model_route(&model().session_id()).unwrap();
        assert_eq!(route.model_session_id, model().session_id());
        assert_eq!(route.backend_rates.len(), 1);
        assert!((route.backend_rates[0].throughput - 200.0).abs() < 1e-6);
    }

    #[test]
    fn test_keep_alive_tracks_registration() {
        let d = dispatcher(&["b1"]);
        let _backend_rx = register_backend(&d, "b1");
        let reply = d.keep_alive(&KeepAliveRequest {
            node_kind: NodeKind::Backend,
            node_id: NodeId::new("b1"),
        });
        assert_eq!(reply.status, CtrlStatus::Ok);

        let reply = d.keep_alive(&KeepAliveRequest {
            node_kind: NodeKind::Backend,
            node_id: NodeId::new("ghost"),
        });
        assert_eq!(reply.status, CtrlStatus::NotRegistered);
    }

    #[test]
    fn test_backend_departure_moves_workload_to_idle_backend() {
        let d = dispatcher(&["b1", "b2"]);
        let _rx1 = register_backend(&d, "b1");
        let _rx2 = register_backend(&d, "b2");
        let _frontend_rx = register_frontend(&d, "f1");
        d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 450.0,
        });

        // One backend carries all 450 rps; find out which
        let session_id = model().session_id();
        let serving: NodeId = {
            let state = d.state.lock();
            state.sessions[&session_id]
                .backend_weights
                .iter()
                .find(|(_, w)| **w >= RATE_EPSILON)
                .map(|(id, _)| id.clone())
                .unwrap()
        };

        let reply = d.unregister(&UnregisterRequest {
            node_kind: NodeKind::Backend,
            node_id: serving.clone(),
        });
        assert_eq!(reply.status, CtrlStatus::Ok);

        // The idle survivor inherited the whole workload
        let state = d.state.lock();
        let session = &state.sessions[&session_id];
        assert!(!session.backend_weights.contains_key(&serving));
        assert!((session.total_throughput() - 450.0).abs() < 1e-6);
        assert!(session.unassigned_workload < RATE_EPSILON);
    }

    #[test]
    fn test_backend_departure_without_capacity_records_unassigned() {
        let d = dispatcher(&["b1", "b2"]);
        let _rx1 = register_backend(&d, "b1");
        let _rx2 = register_backend(&d, "b2");
        let _frontend_rx = register_frontend(&d, "f1");
        // 1200 rps fills one T4 (900) and part of the other (300)
        d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 1200.0,
        });

        let session_id = model().session_id();
        let lighter: NodeId = {
            let state = d.state.lock();
            state.sessions[&session_id]
                .backend_weights
                .iter()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(id, _)| id.clone())
                .unwrap()
        };

        d.unregister(&UnregisterRequest {
            node_kind: NodeKind::Backend,
            node_id: lighter,
        });

        // The survivor is full, so the lost 300 rps stays on the books
        let state = d.state.lock();
        let session = &state.sessions[&session_id];
        assert!((session.total_throughput() - 900.0).abs() < 1e-6);
        assert!((session.unassigned_workload - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_new_backend_soaks_up_unassigned_workload() {
        let d = dispatcher(&["b1", "b2", "b3"]);
        let _rx1 = register_backend(&d, "b1");
        let _rx2 = register_backend(&d, "b2");
        let _frontend_rx = register_frontend(&d, "f1");
        d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 1200.0,
        });
        let session_id = model().session_id();
        let lighter: NodeId = {
            let state = d.state.lock();
            state.sessions[&session_id]
                .backend_weights
                .iter()
                .min_by(|a, b| a.1.total_cmp(b.1))
                .map(|(id, _)| id.clone())
                .unwrap()
        };
        d.unregister(&UnregisterRequest {
            node_kind: NodeKind::Backend,
            node_id: lighter,
        });

        // Hot-add a third backend; registration runs the allocator
        let _rx3 = register_backend(&d, "b3");
        let state = d.state.lock();
        let session = &state.sessions[&session_id];
        assert!(session.unassigned_workload < RATE_EPSILON);
        assert!((session.total_throughput() - 1200.0).abs() < 1e-6);
    }

    #[test]
    fn test_static_workload_slot_fixes_first_backend() {
        let workloads = vec![vec![StaticWorkloadEntry {
            session: model(),
            rate: 120.0,
            backup: false,
        }]];
        let d = Dispatcher::new(DispatcherConfig::default(), registry_for(&["b1"]), workloads);
        let _rx = register_backend(&d, "b1");

        let state = d.state.lock();
        let ctx = &state.backends[&NodeId::new("b1")];
        assert_eq!(ctx.workload_id, Some(0));
        let session = &state.sessions[&model().session_id()];
        assert!(session.has_static_workload);
        assert!((session.backend_weights[&NodeId::new("b1")] - 120.0).abs() < 1e-6);
        assert_eq!(state.assigned_static_workloads[&0], NodeId::new("b1"));
    }

    #[test]
    fn test_static_backup_entry_registers_backup_backend() {
        let workloads = vec![vec![StaticWorkloadEntry {
            session: model(),
            rate: 0.0,
            backup: true,
        }]];
        let d = Dispatcher::new(DispatcherConfig::default(), registry_for(&["b1"]), workloads);
        let _rx = register_backend(&d, "b1");

        let state = d.state.lock();
        let session = &state.sessions[&model().session_id()];
        assert!(session.backup_backends.contains(&NodeId::new("b1")));
        assert!(session.backend_weights.is_empty());
    }

    #[test]
    fn test_frontend_departure_unloads_orphaned_sessions() {
        let d = dispatcher(&["b1"]);
        let mut backend_rx = register_backend(&d, "b1");
        let _frontend_rx = register_frontend(&d, "f1");
        d.load_model(LoadModelRequest {
            node_id: NodeId::new("f1"),
            model_session: model(),
            estimate_workload: 100.0,
        });
        drain_backend(&mut backend_rx);

        d.unregister(&UnregisterRequest {
            node_kind: NodeKind::Frontend,
            node_id: NodeId::new("f1"),
        });

        let commands = drain_backend(&mut backend_rx);
        assert!(commands
            .iter()
            .any(|command| matches!(command, BackendCommand::UnloadModel { .. })));
        let state = d.state.lock();
        assert!(state.sessions.is_empty());
        assert!(state.routes.is_empty());
    }
}
