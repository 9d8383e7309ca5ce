//! In-memory parsed pipeline/stage/task definitions, plus the loader that turns a
//! pipeline YAML file (and the task YAML files it references) into them.
//!
//! Grounded on `examples/original_source/tubular/pipeline.py`,
//! `examples/original_source/tubular/task.py`, and `examples/original_source/tubular/stage.py`.

use super::step::{RawStep, StepDef, StepParseError};
use serde::Deserialize;
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use thiserror::Error;

/// A single `(key, value)` default argument, preserving YAML declaration order
/// (spec.md §3 "ordered list of (key,string-value) pairs").
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDef {
    pub key: String,
    pub value: String,
}

/// Fully parsed, immutable pipeline definition.
#[derive(Debug, Clone)]
pub struct PipelineDef {
    pub file: String,
    pub name: String,
    pub display: String,
    pub max_runs: u64,
    pub args: Vec<ArgDef>,
    pub stages: Vec<StageDef>,
}

#[derive(Debug, Clone)]
pub struct StageDef {
    pub display: String,
    pub tasks: Vec<TaskDef>,
}

#[derive(Debug, Clone)]
pub struct TaskDef {
    pub file: String,
    pub name: String,
    pub display: String,
    pub white_tags: HashSet<String>,
    pub black_tags: HashSet<String>,
    pub steps: Vec<StepDef>,
}

impl TaskDef {
    /// True iff `node_tags` satisfies this task's tag constraints
    /// (spec.md §3 invariant: `whiteTags ⊆ node.tags ∧ blackTags ∩ node.tags = ∅`).
    pub fn eligible(&self, node_tags: &HashSet<String>) -> bool {
        self.white_tags.is_subset(node_tags) && self.black_tags.is_disjoint(node_tags)
    }
}

/// File-path-derived name: strip the extension, replace path separators with dots.
/// `pipelines/nested/build.yaml` -> `pipelines.nested.build`.
pub fn derive_name(relative_file: &str) -> String {
    let without_ext = relative_file
        .strip_suffix(".yaml")
        .or_else(|| relative_file.strip_suffix(".yml"))
        .unwrap_or(relative_file);
    without_ext.replace(['/', '\\'], ".")
}

#[derive(Debug, Error)]
pub enum PipelineDefError {
    #[error("could not read pipeline file '{0}': {1}")]
    Io(String, #[source] std::io::Error),
    #[error("could not parse YAML in '{0}': {1}")]
    Yaml(String, #[source] serde_yaml::Error),
    #[error("task '{0}' referenced from stage '{1}' could not be parsed: {2}")]
    InvalidTask(String, String, #[source] StepParseError),
    #[error("pipeline '{0}' has no stages")]
    NoStages(String),
}

#[derive(Debug, Deserialize)]
struct RawArg {
    key: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawMeta {
    #[serde(rename = "maxRuns", default)]
    max_runs: u64,
}

#[derive(Debug, Deserialize)]
struct RawPipeline {
    display: Option<String>,
    #[serde(default)]
    meta: RawMeta,
    #[serde(default)]
    args: Vec<RawArg>,
    stages: Vec<RawStage>,
}

#[derive(Debug, Deserialize)]
struct RawStage {
    display: Option<String>,
    tasks: Vec<String>,
}

#[derive(Debug, Deserialize, Default)]
struct RawNodeConstraints {
    #[serde(default)]
    requires: Vec<String>,
    #[serde(default)]
    avoids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawTask {
    display: Option<String>,
    #[serde(default)]
    node: RawNodeConstraints,
    steps: Vec<RawStep>,
}

fn read_yaml<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, PipelineDefError> {
    let text = fs::read_to_string(path)
        .map_err(|e| PipelineDefError::Io(path.display().to_string(), e))?;
    serde_yaml::from_str(&text).map_err(|e| PipelineDefError::Yaml(path.display().to_string(), e))
}

/// Resolves a task reference (with or without a `.yaml` extension) to a file path
/// relative to the repo root.
fn resolve_task_file(task_ref: &str) -> String {
    if task_ref.ends_with(".yaml") || task_ref.ends_with(".yml") {
        task_ref.to_string()
    } else {
        format!("{task_ref}.yaml")
    }
}

/// Parses a single task YAML file, resolving `task_ref` (with or without a
/// `.yaml`/`.yml` extension) relative to `repo_root`. Exposed so the node worker can
/// load a task definition directly from a `TaskRequest` (spec.md §4.6 step 3).
pub fn load_task(repo_root: &Path, task_ref: &str) -> Result<TaskDef, PipelineDefError> {
    let file = resolve_task_file(task_ref);
    let path = repo_root.join(&file);
    let raw: RawTask = read_yaml(&path)?;

    let name = derive_name(&file);
    let display = raw.display.unwrap_or_else(|| name.clone());

    let mut steps = Vec::with_capacity(raw.steps.len());
    for raw_step in raw.steps {
        let step = StepDef::try_from(raw_step)
            .map_err(|e| PipelineDefError::InvalidTask(file.clone(), name.clone(), e))?;
        steps.push(step);
    }

    Ok(TaskDef {
        file,
        name,
        display,
        white_tags: raw.node.requires.into_iter().collect(),
        black_tags: raw.node.avoids.into_iter().collect(),
        steps,
    })
}

/// Parses `(repo_path, pipeline_file)` into a [`PipelineDef`], eagerly loading every
/// task file each stage references (spec.md §4.4).
pub fn load_pipeline(repo_root: &Path, pipeline_file: &str) -> Result<PipelineDef, PipelineDefError> {
    let path = repo_root.join(pipeline_file);
    let raw: RawPipeline = read_yaml(&path)?;

    let name = derive_name(pipeline_file);
    let display = raw.display.unwrap_or_else(|| name.clone());

    if raw.stages.is_empty() {
        return Err(PipelineDefError::NoStages(name));
    }

    let mut stages = Vec::with_capacity(raw.stages.len());
    for raw_stage in raw.stages {
        let stage_display = raw_stage.display.unwrap_or_default();
        let mut tasks = Vec::with_capacity(raw_stage.tasks.len());
        for task_ref in raw_stage.tasks {
            tasks.push(load_task(repo_root, &task_ref)?);
        }
        stages.push(StageDef {
            display: stage_display,
            tasks,
        });
    }

    let args = raw
        .args
        .into_iter()
        .map(|a| ArgDef {
            key: a.key,
            value: a.value,
        })
        .collect();

    Ok(PipelineDef {
        file: pipeline_file.to_string(),
        name,
        display,
        max_runs: raw.meta.max_runs,
        args,
        stages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn derive_name_strips_extension_and_dots_slashes() {
        assert_eq!(derive_name("build.yaml"), "build");
        assert_eq!(derive_name("pipelines/nested/build.yaml"), "pipelines.nested.build");
        assert_eq!(derive_name("build.yml"), "build");
    }

    #[test]
    fn task_eligible_checks_white_and_black_tags() {
        let task = TaskDef {
            file: "t.yaml".into(),
            name: "t".into(),
            display: "t".into(),
            white_tags: HashSet::from(["linux".to_string()]),
            black_tags: HashSet::from(["gpu".to_string()]),
            steps: vec![],
        };
        assert!(task.eligible(&HashSet::from(["linux".to_string()])));
        assert!(!task.eligible(&HashSet::from(["linux".to_string(), "gpu".to_string()])));
        assert!(!task.eligible(&HashSet::from(["mac".to_string()])));
    }

    #[test]
    fn load_pipeline_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("build.yaml"),
            r#"
display: "Build"
meta:
  maxRuns: 2
args:
  - key: msg
    value: hi
stages:
  - display: "Stage 1"
    tasks:
      - task1
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("task1.yaml"),
            r#"
display: "Task 1"
node:
  requires: [linux]
steps:
  - type: script
    lang: shell
    script: "echo @{msg} > out.txt"
  - type: archive
    target: out.txt
"#,
        )
        .unwrap();

        let def = load_pipeline(dir.path(), "build.yaml").unwrap();
        assert_eq!(def.name, "build");
        assert_eq!(def.max_runs, 2);
        assert_eq!(def.args, vec![ArgDef { key: "msg".into(), value: "hi".into() }]);
        assert_eq!(def.stages.len(), 1);
        let task = &def.stages[0].tasks[0];
        assert_eq!(task.name, "task1");
        assert_eq!(task.white_tags, HashSet::from(["linux".to_string()]));
        assert_eq!(task.steps.len(), 2);
    }

    #[test]
    fn load_pipeline_rejects_empty_stages() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("empty.yaml"), "stages: []\n").unwrap();
        let err = load_pipeline(dir.path(), "empty.yaml").unwrap_err();
        assert!(matches!(err, PipelineDefError::NoStages(_)));
    }
}
