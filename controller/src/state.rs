//! Shared controller state threaded through the scheduler, run engine, trigger
//! engine, config reload, and HTTP front end. Grounded on `gofer`'s `api::ApiState`
//! (a single struct of shared, internally-locked resources handed to every
//! request/thread).

use crate::node_connection::NodeConnection;
use crate::scheduler::Scheduler;
use crate::storage::Db;
use crate::trigger::Trigger;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use tubular_core::substitution::Constants;

/// The pipeline repo's identity, swapped as a unit on config reload (spec.md
/// §4.11 step 3: "new pipeline-repo identity").
#[derive(Debug, Clone)]
pub struct PipelineRepoIdentity {
    pub url: String,
    pub default_branch: String,
}

pub struct ControllerState {
    pub db: Db,
    pub scheduler: Arc<Scheduler>,
    pub workspace: PathBuf,
    pub constants: Arc<Constants>,
    pub pipeline_repo: RwLock<PipelineRepoIdentity>,
    pub triggers: RwLock<Vec<Trigger>>,
    /// Guards trigger list mutation and is held for the duration of each trigger's
    /// `check()` call (spec.md §4.10, §5 shared-resource policy item (d)).
    pub trigger_lock: Mutex<()>,
    branch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    pub config_repo_head: Mutex<Option<String>>,
}

impl ControllerState {
    pub fn new(
        db: Db,
        scheduler: Arc<Scheduler>,
        workspace: PathBuf,
        pipeline_repo: PipelineRepoIdentity,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            scheduler,
            workspace,
            constants: Arc::new(Constants::empty()),
            pipeline_repo: RwLock::new(pipeline_repo),
            triggers: RwLock::new(Vec::new()),
            trigger_lock: Mutex::new(()),
            branch_locks: Mutex::new(HashMap::new()),
            config_repo_head: Mutex::new(None),
        })
    }

    /// Returns (creating if necessary) the mutex serializing all repository
    /// mutation for `branch` (spec.md §4.9 step 2, §5 shared-resource policy item
    /// (b)).
    pub fn branch_lock(&self, branch: &str) -> Arc<Mutex<()>> {
        let mut locks = self.branch_locks.lock().expect("branch lock table poisoned");
        locks
            .entry(branch.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    pub fn node_table(&self) -> HashMap<String, Arc<NodeConnection>> {
        self.scheduler.nodes()
    }

    /// `<workspace>/<pipelineRepoName>/<branch>` per spec.md §6 "On-disk layout".
    pub fn branch_root(&self, repo_url: &str, branch: &str) -> PathBuf {
        let repo_name = tubular_core::git::repo_name(repo_url);
        self.workspace.join(repo_name).join(branch)
    }

    pub fn config_repo_path(&self) -> PathBuf {
        self.workspace.join("tubular-configs")
    }

    pub fn run_db_path(&self) -> PathBuf {
        self.workspace.join("tubular.db")
    }
}

pub fn ensure_dir(path: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(path)
}
