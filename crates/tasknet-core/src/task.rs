//! Task data structures carried inside protocol messages.
//!
//! These are plain values. Anything that must be binding (the task header,
//! the compute task definition) is wrapped in a signed message by the code
//! that creates it, never signed here.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::crypto::{hex_bytes, PublicKey};
use crate::message::explicit_null;

/// Generate a fresh task/subtask identifier (32 hex chars).
pub fn generate_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current unix time in seconds. Advisory only; never used for ordering.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Public description of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Ed25519 public key, hex on the wire.
    #[serde(with = "hex_bytes")]
    pub key: PublicKey,
    pub node_name: String,
    /// Address the node accepts connections on, if reachable.
    #[serde(deserialize_with = "explicit_null")]
    pub pub_addr: Option<String>,
    /// 0 means "not reachable".
    #[serde(deserialize_with = "explicit_null")]
    pub pub_port: Option<u16>,
}

impl NodeInfo {
    pub fn new(key: PublicKey, node_name: impl Into<String>) -> Self {
        Self {
            key,
            node_name: node_name.into(),
            pub_addr: None,
            pub_port: None,
        }
    }

    pub fn key_id(&self) -> String {
        hex::encode(self.key)
    }

    /// A node advertising no address, or port 0, cannot receive results.
    pub fn is_reachable(&self) -> bool {
        self.pub_addr.as_deref().is_some_and(|a| !a.is_empty())
            && self.pub_port.is_some_and(|p| p != 0)
    }
}

/// Docker image reference required by an environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DockerImage {
    pub repository: String,
    pub tag: String,
}

impl DockerImage {
    pub fn new(repository: impl Into<String>, tag: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            tag: tag.into(),
        }
    }
}

impl std::fmt::Display for DockerImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.repository, self.tag)
    }
}

/// Advertised by a requestor for each task it wants computed.
///
/// Signed by the requestor and carried verbatim inside every
/// `WantToComputeTask`, so a requestor can recognise its own offers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskHeader {
    pub task_id: String,
    pub task_owner: NodeInfo,
    pub environment: String,
    /// Seconds a provider has to finish one subtask.
    pub subtask_timeout: u64,
    /// Unix seconds after which the whole task is void.
    pub deadline: u64,
    /// Highest price per subtask the requestor will pay.
    pub max_price: u64,
    pub subtasks_count: u32,
    /// Bytes of input resources a provider must download.
    pub resource_size: u64,
}

/// The binding description of one subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComputeTaskDef {
    pub task_id: String,
    pub subtask_id: String,
    /// Unix seconds; a report arriving later is rejected.
    pub deadline: u64,
    pub environment: String,
    pub docker_images: Vec<DockerImage>,
    pub price: u64,
    /// Requestor's benchmark score for the environment.
    pub performance: f64,
    /// Free-form task parameters for the compute engine.
    pub extra_data: BTreeMap<String, serde_json::Value>,
}

/// Resource transfer hints attached to a `TaskToCompute`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourcesOptions {
    pub client_id: String,
    pub version: String,
    pub options: BTreeMap<String, serde_json::Value>,
}
