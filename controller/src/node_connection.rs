//! The controller's view of a single node: its reported status, the task it is
//! currently running (if any), and the machinery to dispatch/poll/download over
//! HTTP (spec.md §4.7).
//!
//! Grounded on `examples/original_source/tubular_controller/nodeConnection.py` for
//! the state machine and `gofer/src/scheduler/docker.rs` for the "blocking client,
//! background thread" shape of talking to an external worker over HTTP.

use crate::run_engine::TaskInstance;
use reqwest::blocking::Client;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use tubular_core::models::{NodeStatus, PipelineStatus};
use tubular_core::wire::NodeStatusResponse;

#[derive(Debug, Error)]
pub enum NodeConnectionError {
    #[error("node returned busy")]
    Busy,
    #[error("request to node failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("could not write downloaded artifact: {0}")]
    Io(#[from] std::io::Error),
}

struct Inner {
    status: NodeStatus,
    current_task: Option<Arc<TaskInstance>>,
    downloading: bool,
    download_handle: Option<JoinHandle<()>>,
}

pub struct NodeConnection {
    pub name: String,
    pub tags: HashSet<String>,
    base_url: String,
    client: Client,
    inner: Mutex<Inner>,
}

impl NodeConnection {
    pub fn new(name: impl Into<String>, host: &str, port: u16, tags: HashSet<String>) -> Arc<Self> {
        let client = Client::builder()
            .build()
            .expect("reqwest blocking client construction cannot fail with no TLS config");
        Arc::new(Self {
            name: name.into(),
            tags,
            base_url: format!("http://{host}:{port}"),
            client,
            inner: Mutex::new(Inner {
                status: NodeStatus::Offline,
                current_task: None,
                downloading: false,
                download_handle: None,
            }),
        })
    }

    pub fn status(&self) -> NodeStatus {
        self.inner.lock().expect("node connection lock poisoned").status
    }

    /// POSTs `instance`'s request to the node's `/queue`. On success, records
    /// `instance` as the node's current task and marks the node locally `Active`
    /// (spec.md §4.7 `sendTask`).
    pub fn send_task(&self, instance: Arc<TaskInstance>) -> Result<(), NodeConnectionError> {
        let resp = self
            .client
            .post(format!("{}/queue", self.base_url))
            .timeout(Duration::from_secs(5))
            .json(&instance.request)
            .send()?;

        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(NodeConnectionError::Busy);
        }
        resp.error_for_status_ref()?;

        let mut inner = self.inner.lock().expect("node connection lock poisoned");
        inner.current_task = Some(instance);
        inner.status = NodeStatus::Active;
        Ok(())
    }

    /// Refreshes this node's locally cached status (spec.md §4.7 `updateStatus`).
    pub fn update_status(self: &Arc<Self>, ask_config_reload: bool) {
        {
            let mut inner = self.inner.lock().expect("node connection lock poisoned");
            if inner.downloading {
                let finished = inner
                    .download_handle
                    .as_ref()
                    .map(|h| h.is_finished())
                    .unwrap_or(false);
                if finished {
                    if let Some(handle) = inner.download_handle.take() {
                        let _ = handle.join();
                    }
                    inner.downloading = false;
                } else {
                    return;
                }
            }
        }

        let result = self
            .client
            .get(format!("{}/status", self.base_url))
            .query(&[("updateConfig", ask_config_reload.to_string())])
            .timeout(Duration::from_secs(2))
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json::<NodeStatusResponse>());

        let mut inner = self.inner.lock().expect("node connection lock poisoned");
        let body = match result {
            Ok(body) => body,
            Err(err) => {
                warn!(node = %self.name, error = %err, "node status poll failed, marking offline");
                inner.status = NodeStatus::Offline;
                return;
            }
        };

        let Some(task) = inner.current_task.clone() else {
            inner.status = body.status;
            return;
        };

        if matches!(body.task_status, PipelineStatus::Running | PipelineStatus::NotRun) {
            inner.status = body.status;
            return;
        }

        info!(node = %self.name, status = %body.task_status, "task finished, starting artifact download");
        inner.status = NodeStatus::Archiving;
        inner.current_task = None;
        inner.downloading = true;
        let node = Arc::clone(self);
        let terminal = body.task_status;
        inner.download_handle = Some(std::thread::spawn(move || {
            node.download_and_complete(task, terminal);
        }));
    }

    /// Streams `/archive` and `/output` into the task instance's local paths, then
    /// signals its completion notifier. A node's status updates are paused (via the
    /// `downloading` flag) for the duration of this call.
    fn download_and_complete(&self, task: Arc<TaskInstance>, terminal: PipelineStatus) {
        let status = match self.download_artifacts(&task) {
            Ok(()) => terminal,
            Err(err) => {
                warn!(node = %self.name, error = %err, "artifact download failed");
                PipelineStatus::Error
            }
        };
        task.complete(status);
    }

    fn download_artifacts(&self, task: &TaskInstance) -> Result<(), NodeConnectionError> {
        let query = [
            ("repo_url", task.request.repo_url.as_str()),
            ("branch", task.request.branch.as_str()),
            ("task_path", task.request.task_path.as_str()),
        ];

        if let Some(parent) = task.archive_zip_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Some(parent) = task.output_zip_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        let archive_bytes = self
            .client
            .get(format!("{}/archive", self.base_url))
            .query(&query)
            .send()?
            .error_for_status()?
            .bytes()?;
        std::fs::write(&task.archive_zip_path, archive_bytes)?;

        let output_bytes = self
            .client
            .get(format!("{}/output", self.base_url))
            .query(&query)
            .send()?
            .error_for_status()?
            .bytes()?;
        std::fs::write(&task.output_zip_path, output_bytes)?;

        Ok(())
    }
}
