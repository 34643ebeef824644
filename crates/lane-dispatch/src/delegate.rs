//! In-memory handles for remote frontends and backends
//!
//! A delegate owns the node's addressing info, its outbound message channel
//! and its last-seen tick. The transport layer drains the receiving half of
//! the channel; the dispatcher only ever does a non-blocking send, so no
//! network state leaks into the scheduler's critical sections.

use lane_core::{
    BackendCommand, BackendInfo, BatchPlan, FrontendNotice, ModelRouteUpdate, ModelSession,
    NodeId,
};
use parking_lot::Mutex;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

/// Handle for a registered frontend
#[derive(Debug)]
pub struct FrontendDelegate {
    node_id: NodeId,
    ip: IpAddr,
    server_port: u16,
    rpc_port: u16,
    tx: mpsc::Sender<FrontendNotice>,
    last_tick: Mutex<Instant>,
}

impl FrontendDelegate {
    /// Create the delegate and the receiving half of its outbound channel
    pub fn new(
        node_id: NodeId,
        ip: IpAddr,
        server_port: u16,
        rpc_port: u16,
        channel_capacity: usize,
    ) -> (Self, mpsc::Receiver<FrontendNotice>) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let delegate = Self {
            node_id,
            ip,
            server_port,
            rpc_port,
            tx,
            last_tick: Mutex::new(Instant::now()),
        };
        (delegate, rx)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn server_port(&self) -> u16 {
        self.server_port
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    /// Refresh the liveness tick
    pub fn tick(&self) {
        *self.last_tick.lock() = Instant::now();
    }

    /// Time since the last keep-alive
    pub fn since_tick(&self) -> Duration {
        self.last_tick.lock().elapsed()
    }

    /// Push the current backend list
    pub fn update_backend_list(&self, backends: Vec<BackendInfo>) {
        self.send(FrontendNotice::UpdateBackendList(backends));
    }

    /// Push routes for sessions this frontend subscribes to
    pub fn update_model_routes(&self, routes: Vec<ModelRouteUpdate>) {
        self.send(FrontendNotice::UpdateModelRoutes(routes));
    }

    fn send(&self, notice: FrontendNotice) {
        if let Err(err) = self.tx.try_send(notice) {
            warn!("Dropping notice to frontend {}: {}", self.node_id, err);
        }
    }
}

/// Handle for a registered backend and its GPU
#[derive(Debug)]
pub struct BackendDelegate {
    node_id: NodeId,
    ip: IpAddr,
    server_port: u16,
    rpc_port: u16,
    gpu_device: String,
    gpu_uuid: String,
    gpu_available_memory: u64,
    tx: mpsc::Sender<BackendCommand>,
    last_tick: Mutex<Instant>,
}

impl BackendDelegate {
    /// Create the delegate and the receiving half of its outbound channel
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: NodeId,
        ip: IpAddr,
        server_port: u16,
        rpc_port: u16,
        gpu_device: impl Into<String>,
        gpu_uuid: impl Into<String>,
        gpu_available_memory: u64,
        channel_capacity: usize,
    ) -> (Self, mpsc::Receiver<BackendCommand>) {
        let (tx, rx) = mpsc::channel(channel_capacity);
        let delegate = Self {
            node_id,
            ip,
            server_port,
            rpc_port,
            gpu_device: gpu_device.into(),
            gpu_uuid: gpu_uuid.into(),
            gpu_available_memory,
            tx,
            last_tick: Mutex::new(Instant::now()),
        };
        (delegate, rx)
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn gpu_device(&self) -> &str {
        &self.gpu_device
    }

    pub fn gpu_uuid(&self) -> &str {
        &self.gpu_uuid
    }

    pub fn gpu_available_memory(&self) -> u64 {
        self.gpu_available_memory
    }

    /// The routable description pushed to frontends
    pub fn backend_info(&self) -> BackendInfo {
        BackendInfo {
            node_id: self.node_id.clone(),
            ip: self.ip,
            server_port: self.server_port,
            rpc_port: self.rpc_port,
            gpu_device: self.gpu_device.clone(),
            gpu_uuid: self.gpu_uuid.clone(),
        }
    }

    /// Refresh the liveness tick
    pub fn tick(&self) {
        *self.last_tick.lock() = Instant::now();
    }

    /// Time since the last keep-alive
    pub fn since_tick(&self) -> Duration {
        self.last_tick.lock().elapsed()
    }

    /// Ask the backend to load a model session
    pub fn send_load_model(&self, model_session: ModelSession, max_batch: u32) {
        self.send(BackendCommand::LoadModel {
            model_session,
            max_batch,
        });
    }

    /// Ask the backend to unload a model session
    pub fn send_unload_model(&self, model_session_id: impl Into<String>) {
        self.send(BackendCommand::UnloadModel {
            model_session_id: model_session_id.into(),
        });
    }

    /// Hand a batch plan to the backend's plan follower
    pub fn enqueue_batch_plan(&self, plan: BatchPlan) {
        self.send(BackendCommand::EnqueueBatchPlan(plan));
    }

    fn send(&self, command: BackendCommand) {
        if let Err(err) = self.tx.try_send(command) {
            warn!("Dropping command to backend {}: {}", self.node_id, err);
        }
    }
}
