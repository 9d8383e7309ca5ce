//! Step executors: the four step kinds (clone, script, exec, archive), each driving
//! side effects in a task's workspace.
//!
//! Grounded on `examples/original_source/tubular/step.py`.

mod archive;
mod clone;
mod exec;
mod script;

use crate::git::GitError;
use crate::models::StepDef;
use crate::substitution::Constants;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;
use thiserror::Error;

/// Per-task execution context passed to every step.
pub struct TaskEnv {
    pub workspace: PathBuf,
    pub archive_dir: PathBuf,
    pub output_file: PathBuf,
    pub args: HashMap<String, String>,
    pub step_index: usize,
    pub start_time: Instant,
}

impl TaskEnv {
    fn elapsed_label(&self) -> String {
        format!("{:.3}s", self.start_time.elapsed().as_secs_f64())
    }

    fn substitute(&self, text: &str, constants: &Constants) -> String {
        crate::substitution::replace(text, &self.args, constants)
    }
}

/// Writes the human-readable banner every executor prints before doing work, then
/// flushes (spec.md §4.5: `[ <kind> <arg> ] (T+<elapsed>)`).
fn write_banner(out: &mut dyn Write, kind: &str, arg: &str, env: &TaskEnv) {
    let _ = writeln!(out, "[ {kind} {arg} ] (T+{})", env.elapsed_label());
    let _ = out.flush();
}

#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("script exited with status {0:?}")]
    ScriptFailed(Option<i32>),
    #[error("exec exited with status {0:?}")]
    ExecFailed(Option<i32>),
    #[error("exec target is empty after substitution")]
    EmptyExecTarget,
    #[error("archive target '{0}' escapes the task workspace")]
    PathTraversal(String),
    #[error("archive target '{0}' does not exist")]
    MissingTarget(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Spawns `cmd` with piped stdout/stderr, draining both concurrently so a chatty
/// process can't deadlock the pipe buffers, and returns its exit status plus the
/// interleaved-by-stream (stdout fully, then stderr) captured bytes.
fn run_capturing(cmd: &mut std::process::Command) -> std::io::Result<(std::process::ExitStatus, Vec<u8>)> {
    use std::io::Read;
    use std::process::Stdio;

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = cmd.spawn()?;
    let mut stdout = child.stdout.take().expect("stdout was piped");
    let mut stderr = child.stderr.take().expect("stderr was piped");

    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = stdout.read_to_end(&mut buf);
        buf
    });
    let mut stderr_buf = Vec::new();
    let _ = stderr.read_to_end(&mut stderr_buf);

    let status = child.wait()?;
    let mut combined = stdout_thread.join().unwrap_or_default();
    combined.extend(stderr_buf);
    Ok((status, combined))
}

/// Runs one step in `env`, streaming its banner and any subprocess output into
/// `out`. Non-zero subprocess exit or a filesystem failure yields a `StepError`.
pub fn run_step(
    step: &StepDef,
    env: &TaskEnv,
    constants: &Constants,
    out: &mut dyn Write,
) -> Result<(), StepError> {
    match step {
        StepDef::Clone { url, branch, .. } => clone::run(url, branch, env, constants, out),
        StepDef::Script { lang, body, .. } => script::run(*lang, body, env, constants, out),
        StepDef::Exec { command_line, .. } => exec::run(command_line, env, constants, out),
        StepDef::Archive { target, .. } => archive::run(target, env, constants, out),
    }
}
