//! HTTP API handlers: exposes node state as JSON.

pub mod status;
pub mod subtasks;
pub mod tasks;

use std::sync::Arc;

use tokio::sync::mpsc;

use tasknet_core::crypto::Keypair;
use tasknet_core::task::{NodeInfo, TaskHeader};
use tasknet_core::Signed;
use tasknet_services::session::SessionConfig;
use tasknet_services::{Stores, TaskBoard};

#[derive(Clone)]
pub struct ApiState {
    pub keypair: Arc<Keypair>,
    pub config: Arc<SessionConfig>,
    pub stores: Stores,
    pub board: TaskBoard,
    /// Headers to offer for, picked up by the session initiator.
    pub offers: mpsc::UnboundedSender<Signed<TaskHeader>>,
}

impl ApiState {
    /// How this node presents itself as a task owner.
    fn owner_info(&self) -> NodeInfo {
        NodeInfo {
            key: self.keypair.public,
            node_name: self.config.node_name.clone(),
            pub_addr: self.config.public_addr.clone(),
            pub_port: self.config.public_port,
        }
    }
}

// Re-export handler functions for use in router setup.
pub use status::{handle_escalations, handle_sessions, handle_status};
pub use subtasks::{handle_subtask_inspect, handle_subtasks};
pub use tasks::{handle_offer, handle_task_create, handle_task_inspect, handle_tasks};
