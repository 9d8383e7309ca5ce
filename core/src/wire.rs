//! Wire types shared between the controller and the node over the node's HTTP API
//! (spec.md §6 "Node HTTP API").

use crate::models::{NodeStatus, PipelineStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// `POST /queue` body. Built by merging the pipeline's resolved args into the task
/// identity (spec.md §4.7 `sendTask`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub repo_url: String,
    pub branch: String,
    pub task_path: String,
    pub args: HashMap<String, String>,
}

impl TaskRequest {
    /// The local path (relative to the node's workspace root) this request's repo
    /// checks out into: `<repoName>/<branch>`.
    pub fn repo_path(&self) -> String {
        format!("{}/{}", crate::git::repo_name(&self.repo_url), self.branch)
    }
}

/// `GET /status` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusResponse {
    pub status: NodeStatus,
    pub task_status: PipelineStatus,
}

/// Returned by `POST /queue` when the node already has a task in flight
/// (spec.md §4.6, §7 `BusyError`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusyResponse {
    pub msg: String,
}
