//! Core identifier types for inferlane

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use uuid::Uuid;

/// Unique identifier for a node in the cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Create a new NodeId from a string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a random NodeId
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Get the string representation of the NodeId
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// The two kinds of nodes that register with the dispatcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Frontend nodes admit user requests and submit dispatch queries
    Frontend,
    /// Backend nodes own one GPU each and execute batch plans
    Backend,
}

impl std::str::FromStr for NodeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "frontend" => Ok(NodeKind::Frontend),
            "backend" => Ok(NodeKind::Backend),
            _ => Err(format!("Unknown node kind: {}", s)),
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeKind::Frontend => write!(f, "frontend"),
            NodeKind::Backend => write!(f, "backend"),
        }
    }
}

/// Dispatcher-minted monotonic query identifier, unique across the process
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct GlobalId(pub u64);

impl fmt::Display for GlobalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dispatcher-minted batch plan identifier
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct PlanId(pub u64);

impl fmt::Display for PlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Routable description of a backend, pushed to frontends in backend lists
/// and model routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendInfo {
    /// Backend node id
    pub node_id: NodeId,

    /// Address the backend serves inference traffic on
    pub ip: IpAddr,

    /// Data-plane port
    pub server_port: u16,

    /// Control-plane port
    pub rpc_port: u16,

    /// GPU device name, e.g. "tesla_t4"
    pub gpu_device: String,

    /// GPU UUID in vendor format
    pub gpu_uuid: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_creation() {
        let id1 = NodeId::new("backend-1");
        assert_eq!(id1.as_str(), "backend-1");

        let id2 = NodeId::generate();
        assert!(!id2.as_str().is_empty());
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_node_kind_parsing() {
        assert_eq!("frontend".parse::<NodeKind>().unwrap(), NodeKind::Frontend);
        assert_eq!("Backend".parse::<NodeKind>().unwrap(), NodeKind::Backend);
        assert!("router".parse::<NodeKind>().is_err());
    }

    #[test]
    fn test_global_id_ordering() {
        assert!(GlobalId(1) < GlobalId(2));
        assert_eq!(GlobalId(7).to_string(), "7");
    }
}
