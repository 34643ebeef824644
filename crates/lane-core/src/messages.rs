//! Control-plane message types
//!
//! These are the messages the dispatcher exchanges with frontends and
//! backends. Wire framing and transport are external concerns; the datagram
//! RPC pair additionally carries a bincode codec because the ingress path
//! needs one to parse datagrams at all.

use crate::clock::PunchClock;
use crate::session::ModelSession;
use crate::types::{BackendInfo, GlobalId, NodeId, NodeKind, PlanId};
use serde::{Deserialize, Serialize};

/// Status carried in every control reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CtrlStatus {
    Ok,
    FrontendIdConflict,
    BackendIdConflict,
    ModelNotFound,
    BackendUnavailable,
    InvalidLoadModelRequest,
    NotRegistered,
    NotEnoughBackends,
}

impl CtrlStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, CtrlStatus::Ok)
    }
}

/// Opaque reference to query input held outside the control plane, e.g. in
/// a registered RDMA region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadDescriptor {
    pub handle: u64,
    pub len: u32,
}

/// A query stripped of its input payload. This is what travels through the
/// dispatcher and into batch plans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Frontend-scoped query id, echoed in the dispatch reply
    pub query_id: u64,

    /// Dispatcher-minted global id, zero until dispatch
    #[serde(default)]
    pub global_id: GlobalId,

    /// Canonical model session key
    pub model_session_id: String,

    /// Punch-clock tags collected along the way
    #[serde(default)]
    pub clock: PunchClock,

    /// Where the input bytes live
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<PayloadDescriptor>,
}

/// Datagram RPC request: frontend asks the dispatcher to route one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchRequest {
    pub model_session_id: String,
    pub query_id: u64,
    /// Port the reply datagram must be sent to. The reply goes to the
    /// request's source IP with this port, not the source port.
    pub udp_rpc_port: u16,
    pub query: Query,
}

impl DispatchRequest {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Datagram RPC reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchReply {
    pub status: CtrlStatus,
    pub model_session_id: String,
    pub query_id: u64,
}

impl DispatchReply {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

/// Stream control RPC: node announces itself to the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_kind: NodeKind,
    pub node_id: NodeId,
    pub server_port: u16,
    pub rpc_port: u16,
    /// GPU fields, meaningful for backends only
    #[serde(default)]
    pub gpu_device: String,
    #[serde(default)]
    pub gpu_uuid: String,
    #[serde(default)]
    pub gpu_available_memory: u64,
}

/// Reply to [`RegisterRequest`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterReply {
    pub status: CtrlStatus,
    /// Interval at which the node must send keep-alives
    pub beacon_interval_sec: u32,
}

/// Stream control RPC: node leaves the cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnregisterRequest {
    pub node_kind: NodeKind,
    pub node_id: NodeId,
}

/// Stream control RPC: liveness tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepAliveRequest {
    pub node_kind: NodeKind,
    pub node_id: NodeId,
}

/// Generic control reply carrying only a status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CtrlReply {
    pub status: CtrlStatus,
}

/// Stream control RPC: frontend asks for a model session to be served
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelRequest {
    pub node_id: NodeId,
    pub model_session: ModelSession,
    /// Expected request rate in queries per second. Zero means "pick the
    /// single best-fit backend".
    pub estimate_workload: f64,
}

/// Reply to [`LoadModelRequest`], carrying the current route on success
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadModelReply {
    pub status: CtrlStatus,
    pub model_route: Option<ModelRouteUpdate>,
}

/// One backend's share of a model route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendRate {
    pub info: BackendInfo,
    /// Allocated throughput in queries per second
    pub throughput: f64,
}

/// Full route for one model session, pushed to subscribing frontends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRouteUpdate {
    pub model_session_id: String,
    pub backend_rates: Vec<BackendRate>,
}

/// The unit of work handed to a backend: queries plus an execution time and
/// a deadline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    pub plan_id: PlanId,
    pub model_session_id: String,
    pub queries: Vec<Query>,
    /// Earliest time the GPU may start this batch
    pub exec_time_ns: u64,
    /// Latest acceptable completion time over all contained queries
    pub deadline_ns: u64,
    /// `exec_time_ns` plus the profiled forward latency of the batch
    pub expected_finish_time_ns: u64,
}

impl BatchPlan {
    pub fn batch_size(&self) -> u32 {
        self.queries.len() as u32
    }
}

/// Commands the dispatcher pushes to a backend delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackendCommand {
    /// Load a model session with the given max batch size
    LoadModel {
        model_session: ModelSession,
        max_batch: u32,
    },
    /// Unload a model session
    UnloadModel { model_session_id: String },
    /// Execute a batch plan
    EnqueueBatchPlan(BatchPlan),
}

/// Notices the dispatcher pushes to a frontend delegate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FrontendNotice {
    /// The set of live backends changed
    UpdateBackendList(Vec<BackendInfo>),
    /// Routes changed for sessions this frontend subscribes to
    UpdateModelRoutes(Vec<ModelRouteUpdate>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn query() -> Query {
        Query {
            query_id: 42,
            global_id: GlobalId(0),
            model_session_id: "tensorflow:resnet50:1:50000".to_string(),
            clock: PunchClock::at_frontend(1_000),
            payload: Some(PayloadDescriptor { handle: 7, len: 602_112 }),
        }
    }

    #[test]
    fn test_dispatch_request_codec() {
        let request = DispatchRequest {
            model_session_id: "tensorflow:resnet50:1:50000".to_string(),
            query_id: 42,
            udp_rpc_port: 9001,
            query: query(),
        };
        let bytes = request.to_bytes().unwrap();
        assert_eq!(DispatchRequest::from_bytes(&bytes).unwrap(), request);
    }

    #[test]
    fn test_dispatch_request_rejects_truncated_bytes() {
        let request = DispatchRequest {
            model_session_id: "tensorflow:resnet50:1:50000".to_string(),
            query_id: 1,
            udp_rpc_port: 9001,
            query: query(),
        };
        let bytes = request.to_bytes().unwrap();
        assert!(DispatchRequest::from_bytes(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn test_backend_command_serde() {
        let plan = BatchPlan {
            plan_id: PlanId(3),
            model_session_id: "tensorflow:resnet50:1:50000".to_string(),
            queries: vec![query()],
            exec_time_ns: 10_000_000,
            deadline_ns: 60_000_000,
            expected_finish_time_ns: 16_000_000,
        };
        assert_eq!(plan.batch_size(), 1);

        let command = BackendCommand::EnqueueBatchPlan(plan);
        let bytes = bincode::serialize(&command).unwrap();
        let decoded: BackendCommand = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, command);
    }

    #[test]
    fn test_backend_info_in_route_update() {
        let update = ModelRouteUpdate {
            model_session_id: "tensorflow:resnet50:1:50000".to_string(),
            backend_rates: vec![BackendRate {
                info: BackendInfo {
                    node_id: NodeId::new("backend-1"),
                    ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    server_port: 7001,
                    rpc_port: 7002,
                    gpu_device: "tesla_t4".to_string(),
                    gpu_uuid: "GPU-1234".to_string(),
                },
                throughput: 100.0,
            }],
        };
        let bytes = bincode::serialize(&update).unwrap();
        let decoded: ModelRouteUpdate = bincode::deserialize(&bytes).unwrap();
        assert_eq!(decoded, update);
    }
}
