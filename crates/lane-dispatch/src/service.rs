//! Stream control RPC handlers
//!
//! A thin, transport-agnostic seam over the dispatcher's public
//! operations. Whatever carries the stream control RPC (gRPC, a test
//! harness, a channel pair) decodes into [`ControlRequest`], calls
//! [`ControlService::handle`] with the peer's IP, and writes the response
//! back out.

use crate::dispatcher::{Dispatcher, NodeChannel};
use lane_core::{
    CtrlReply, KeepAliveRequest, LoadModelReply, LoadModelRequest, RegisterReply,
    RegisterRequest, UnregisterRequest,
};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;

/// All requests a node can make over the stream control RPC
#[derive(Debug, Clone)]
pub enum ControlRequest {
    Register(RegisterRequest),
    Unregister(UnregisterRequest),
    KeepAlive(KeepAliveRequest),
    LoadModel(LoadModelRequest),
}

/// Responses matching [`ControlRequest`]
#[derive(Debug)]
pub enum ControlResponse {
    Register(RegisterReply),
    Ctrl(CtrlReply),
    LoadModel(LoadModelReply),
}

/// Dispatcher-side endpoint of the stream control RPC
#[derive(Clone)]
pub struct ControlService {
    dispatcher: Arc<Dispatcher>,
}

impl ControlService {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Handle one control request from a peer at `peer_ip`. Registration
    /// additionally yields the node's outbound channel for the transport
    /// to drain.
    pub fn handle(
        &self,
        request: ControlRequest,
        peer_ip: IpAddr,
    ) -> (ControlResponse, Option<NodeChannel>) {
        debug!("Control request from {}: {:?}", peer_ip, request);
        match request {
            ControlRequest::Register(request) => {
                let (reply, channel) = self.dispatcher.register(request, peer_ip);
                (ControlResponse::Register(reply), channel)
            }
            ControlRequest::Unregister(request) => {
                (ControlResponse::Ctrl(self.dispatcher.unregister(&request)), None)
            }
            ControlRequest::KeepAlive(request) => {
                (ControlResponse::Ctrl(self.dispatcher.keep_alive(&request)), None)
            }
            ControlRequest::LoadModel(request) => {
                (ControlResponse::LoadModel(self.dispatcher.load_model(request)), None)
            }
        }
    }
}
