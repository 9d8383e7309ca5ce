//! Per-request pipeline run algorithm (spec.md §4.9): clone/pull the pipeline
//! repo, allocate a run number, dispatch each stage's tasks to the scheduler, and
//! wait on a stage barrier before finalizing the run record.
//!
//! Grounded on `examples/original_source/tubular_controller/controller.py` for the
//! eleven-step algorithm and `gofer/src/api/pipelines.rs` for the
//! "one background thread per inbound run request" pattern.

use crate::scheduler::QueuedTask;
use crate::state::ControllerState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;
use thiserror::Error;
use tracing::{error, info, warn};
use tubular_core::archive_zip;
use tubular_core::git::{self, Repo};
use tubular_core::models::pipeline::load_pipeline;
use tubular_core::models::{worse, PipelineDefError, PipelineStatus, TaskDef};
use tubular_core::wire::TaskRequest;

/// `POST /api/pipelines` body (spec.md §6).
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineReq {
    #[serde(default)]
    pub branch: String,
    pub pipeline_path: String,
    #[serde(default)]
    pub args: Vec<ArgKv>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArgKv {
    pub k: String,
    pub v: String,
}

#[derive(Debug, Error)]
pub enum RunEngineError {
    #[error(transparent)]
    PipelineDef(#[from] PipelineDefError),
    #[error(transparent)]
    Git(#[from] git::GitError),
    #[error(transparent)]
    Storage(#[from] crate::storage::StorageError),
    #[error("no eligible nodes for task '{0}' in stage '{1}'")]
    NoEligibleNodes(String, String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single task dispatched to the scheduler, with a completion notifier the run
/// engine's stage barrier waits on (spec.md §4.9 step 9b).
pub struct TaskInstance {
    pub request: TaskRequest,
    pub task_name: String,
    pub display: String,
    pub archive_zip_path: PathBuf,
    pub output_zip_path: PathBuf,
    result: Mutex<Option<PipelineStatus>>,
    cv: Condvar,
}

impl TaskInstance {
    fn new(request: TaskRequest, task_name: String, display: String, scratch_dir: &std::path::Path) -> Arc<Self> {
        Arc::new(Self {
            archive_zip_path: scratch_dir.join(format!("{task_name}.archive.zip")),
            output_zip_path: scratch_dir.join(format!("{task_name}.output.zip")),
            request,
            task_name,
            display,
            result: Mutex::new(None),
            cv: Condvar::new(),
        })
    }

    pub fn complete(&self, status: PipelineStatus) {
        let mut guard = self.result.lock().expect("task instance lock poisoned");
        *guard = Some(status);
        self.cv.notify_all();
    }

    fn wait(&self) -> PipelineStatus {
        let mut guard = self.result.lock().expect("task instance lock poisoned");
        while guard.is_none() {
            guard = self.cv.wait(guard).expect("task instance lock poisoned");
        }
        guard.expect("loop only exits once set")
    }
}

/// Spawns the per-request run-engine thread (spec.md §4.9: "running on its own
/// thread").
pub fn submit(state: Arc<ControllerState>, req: PipelineReq) {
    std::thread::spawn(move || {
        if let Err(err) = run(&state, req) {
            error!(error = %err, "pipeline run failed before a run record could be finalized");
        }
    });
}

fn run(state: &Arc<ControllerState>, req: PipelineReq) -> Result<(), RunEngineError> {
    let start = Instant::now();
    let start_ms = crate::storage::epoch_milli();

    let (repo_url, default_branch) = {
        let identity = state.pipeline_repo.read().expect("pipeline repo identity poisoned");
        (identity.url.clone(), identity.default_branch.clone())
    };
    let branch = if req.branch.is_empty() { default_branch } else { req.branch.clone() };

    let branch_lock = state.branch_lock(&branch);
    let _guard = branch_lock.lock().expect("branch lock poisoned");

    let branch_root = state.branch_root(&repo_url, &branch);
    let repo_dir = branch_root.join("repo");
    crate::state::ensure_dir(&repo_dir)?;

    let repo = Repo::new(repo_url.clone(), branch.clone(), repo_dir.clone());
    let mut sink = std::io::sink();
    git::clone_or_pull(&repo, &mut sink)?;

    let pipeline = load_pipeline(&repo_dir, &req.pipeline_path)?;

    let (pipeline_id, run_num) = state.db.allocate_next_run(&pipeline.file)?;

    let archive_path = branch_root.join("archive").join(format!("{}.{}", pipeline.name, run_num));
    let output_path = branch_root.join("output").join(format!("{}.{}", pipeline.name, run_num));
    crate::state::ensure_dir(&archive_path)?;
    crate::state::ensure_dir(&output_path)?;

    let mut merged_args: HashMap<String, String> = pipeline
        .args
        .iter()
        .map(|a| (a.key.clone(), a.value.clone()))
        .collect();
    for kv in &req.args {
        merged_args.insert(kv.k.clone(), kv.v.clone());
    }

    let max_runs = pipeline.max_runs as i64;
    let evicted = state.db.insert_run(pipeline_id, run_num, &branch, start_ms, max_runs)?;
    for evicted_run in evicted {
        let _ = std::fs::remove_dir_all(branch_root.join("archive").join(format!("{}.{}", pipeline.name, evicted_run)));
        let _ = std::fs::remove_dir_all(branch_root.join("output").join(format!("{}.{}", pipeline.name, evicted_run)));
    }

    let scratch_dir = branch_root.join(".tmp");
    crate::state::ensure_dir(&scratch_dir)?;

    let nodes = state.node_table();
    let mut overall_status = PipelineStatus::Running;
    let mut stage_meta = Vec::new();

    'stages: for stage in &pipeline.stages {
        let mut instances = Vec::with_capacity(stage.tasks.len());

        for task in &stage.tasks {
            let eligible_nodes = eligible_node_names(task, &nodes);
            if eligible_nodes.is_empty() {
                overall_status = PipelineStatus::Error;
                warn!(task = %task.name, stage = %stage.display, "no eligible nodes");
                break 'stages;
            }

            let request = TaskRequest {
                repo_url: repo_url.clone(),
                branch: branch.clone(),
                task_path: task.file.clone(),
                args: merged_args.clone(),
            };
            let instance = TaskInstance::new(request, task.name.clone(), task.display.clone(), &scratch_dir);
            state.scheduler.push(QueuedTask {
                instance: Arc::clone(&instance),
                eligible_nodes,
            });
            instances.push(instance);
        }

        let mut task_statuses = Vec::with_capacity(instances.len());
        for instance in &instances {
            let status = instance.wait();
            state.scheduler.task_completed();

            if instance.archive_zip_path.exists() {
                if let Err(e) = archive_zip::unzip(&instance.archive_zip_path, &archive_path) {
                    warn!(task = %instance.task_name, error = %e, "failed to unpack task archive");
                } else {
                    let _ = std::fs::remove_file(&instance.archive_zip_path);
                }
            }
            if instance.output_zip_path.exists() {
                if let Err(e) = archive_zip::unzip(&instance.output_zip_path, &output_path) {
                    warn!(task = %instance.task_name, error = %e, "failed to unpack task output");
                } else {
                    let _ = std::fs::remove_file(&instance.output_zip_path);
                }
            }

            task_statuses.push(serde_json::json!({ "task": instance.display, "status": status.to_string() }));
            if status != PipelineStatus::Success {
                overall_status = worse(overall_status, status);
            }
        }

        stage_meta.push(serde_json::json!({ "stage": stage.display, "tasks": task_statuses }));

        if overall_status != PipelineStatus::Running {
            break;
        }
    }

    if overall_status == PipelineStatus::Running {
        overall_status = PipelineStatus::Success;
    }

    let meta = serde_json::json!({
        "stages": stage_meta,
        "archived_files": count_files(&archive_path),
    })
    .to_string();

    let duration_ms = start.elapsed().as_millis() as u64;
    state.db.finalize_run(pipeline_id, run_num, duration_ms, overall_status, &meta)?;
    info!(pipeline = %pipeline.name, run = run_num, status = %overall_status, "run finished");

    Ok(())
}

fn eligible_node_names(task: &TaskDef, nodes: &HashMap<String, Arc<crate::node_connection::NodeConnection>>) -> Vec<String> {
    nodes
        .values()
        .filter(|node| task.eligible(&node.tags))
        .map(|node| node.name.clone())
        .collect()
}

fn count_files(dir: &std::path::Path) -> u64 {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .count() as u64
}
