//! State events published to the control surface

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeState;

/// A node entered a new lifecycle state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeEvent {
    pub uid: String,
    pub node_id: Option<String>,
    pub state: NodeState,
    pub at: DateTime<Utc>,
    /// Failure reason or other detail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl NodeEvent {
    pub fn new(uid: &str, node_id: Option<&str>, state: NodeState) -> Self {
        Self {
            uid: uid.to_string(),
            node_id: node_id.map(str::to_string),
            state,
            at: Utc::now(),
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}
