//! Repo cache & git driver: clone/pull/ls-remote/diff over a repository identified by
//! (url, branch, local path), capturing combined stdout/stderr into a caller-supplied
//! sink.
//!
//! Grounded on `examples/original_source/tubular/git_cmds.py` and the subprocess
//! capture pattern in `gofer/src/scheduler/docker.rs`.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;

#[derive(Debug, Error)]
#[error("git {args:?} failed (exit {code:?}): {output}")]
pub struct GitError {
    pub args: Vec<String>,
    pub code: Option<i32>,
    pub output: String,
}

/// Identifies a repository: its remote url, the branch it tracks, and where it is
/// (or will be) checked out locally.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Repo {
    pub url: String,
    pub branch: String,
    pub local_path: PathBuf,
}

impl Repo {
    pub fn new(url: impl Into<String>, branch: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            branch: branch.into(),
            local_path: local_path.into(),
        }
    }
}

/// The directory name git would check a url out into, e.g.
/// `https://example.org/org/repo.git` -> `repo`.
pub fn repo_name(url: &str) -> String {
    let trimmed = url.trim_end_matches('/').trim_end_matches(".git");
    trimmed
        .rsplit('/')
        .next()
        .unwrap_or(trimmed)
        .to_string()
}

fn run(dir: Option<&Path>, args: &[&str]) -> Result<String, GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = dir {
        cmd.current_dir(dir);
    }

    let output = cmd.output().map_err(|e| GitError {
        args: args.iter().map(|s| s.to_string()).collect(),
        code: None,
        output: e.to_string(),
    })?;

    let combined = format!(
        "{}{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    if !output.status.success() {
        return Err(GitError {
            args: args.iter().map(|s| s.to_string()).collect(),
            code: output.status.code(),
            output: combined,
        });
    }

    Ok(combined)
}

fn run_sink(dir: Option<&Path>, args: &[&str], sink: &mut dyn Write) -> Result<(), GitError> {
    let out = run(dir, args)?;
    let _ = sink.write_all(out.as_bytes());
    let _ = sink.flush();
    Ok(())
}

/// Clones `repo.url`@`repo.branch` into `repo.local_path`, which must not yet exist.
pub fn clone(repo: &Repo, sink: &mut dyn Write) -> Result<(), GitError> {
    let path = repo.local_path.to_string_lossy().to_string();
    run_sink(
        None,
        &[
            "clone",
            "--branch",
            &repo.branch,
            "--single-branch",
            &repo.url,
            &path,
        ],
        sink,
    )
}

/// A sparse, blobless, checkout-free clone used for diff-only inspection
/// (`changed_files`), per spec.md §4.2.
pub fn clone_empty(repo: &Repo) -> Result<(), GitError> {
    let path = repo.local_path.to_string_lossy().to_string();
    run(
        None,
        &[
            "clone",
            "--branch",
            &repo.branch,
            "--single-branch",
            "--no-checkout",
            "--filter=blob:none",
            &repo.url,
            &path,
        ],
    )?;
    Ok(())
}

/// Fetches depth-1 and hard-resets to `origin/<branch>`.
pub fn pull(repo: &Repo, sink: &mut dyn Write) -> Result<(), GitError> {
    run_sink(
        Some(&repo.local_path),
        &["fetch", "--depth", "1", "origin", &repo.branch],
        sink,
    )?;
    run_sink(
        Some(&repo.local_path),
        &["reset", "--hard", &format!("origin/{}", repo.branch)],
        sink,
    )
}

/// Clones if `repo.local_path` doesn't exist yet, else pulls. Caller is responsible
/// for holding the per-path branch lock (spec.md §4.9 step 2, §4.2 note).
pub fn clone_or_pull(repo: &Repo, sink: &mut dyn Write) -> Result<(), GitError> {
    if repo.local_path.join(".git").is_dir() {
        pull(repo, sink)
    } else {
        clone(repo, sink)
    }
}

/// Lists all remote branch names for `url`.
pub fn ls_branches(url: &str) -> Result<Vec<String>, GitError> {
    let out = run(None, &["ls-remote", "--heads", url])?;
    Ok(out
        .lines()
        .filter_map(|line| line.rsplit('/').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

/// Returns the commit sha `url`@`branch` currently points to on the remote.
pub fn remote_head(url: &str, branch: &str) -> Result<String, GitError> {
    let out = run(None, &["ls-remote", url, &format!("refs/heads/{branch}")])?;
    out.split_whitespace()
        .next()
        .map(|s| s.to_string())
        .ok_or_else(|| GitError {
            args: vec!["ls-remote".into()],
            code: None,
            output: format!("no ref found for branch '{branch}' on {url}"),
        })
}

/// Returns every branch->sha pair currently on the remote.
pub fn remote_heads(url: &str) -> Result<HashMap<String, String>, GitError> {
    let out = run(None, &["ls-remote", "--heads", url])?;
    let mut map = HashMap::new();
    for line in out.lines() {
        if let Some((sha, ref_name)) = line.split_once('\t') {
            if let Some(branch) = ref_name.strip_prefix("refs/heads/") {
                map.insert(branch.to_string(), sha.trim().to_string());
            }
        }
    }
    Ok(map)
}

/// Returns the commit sha `repo.local_path`'s `HEAD` currently points to.
pub fn local_head(repo: &Repo) -> Result<String, GitError> {
    Ok(run(Some(&repo.local_path), &["rev-parse", "HEAD"])?
        .trim()
        .to_string())
}

/// Returns the set of file paths that changed between `sha_a` and `sha_b`.
pub fn changed_files(repo: &Repo, sha_a: &str, sha_b: &str) -> Result<Vec<String>, GitError> {
    if sha_a == sha_b {
        return Ok(Vec::new());
    }
    let out = run(
        Some(&repo.local_path),
        &["diff", "--name-only", sha_a, sha_b],
    )?;
    Ok(out.lines().map(|s| s.to_string()).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_name_strips_dotgit_and_slashes() {
        assert_eq!(repo_name("https://example.org/org/repo.git"), "repo");
        assert_eq!(repo_name("git@example.org:org/repo.git"), "repo");
        assert_eq!(repo_name("https://example.org/org/repo"), "repo");
        assert_eq!(repo_name("https://example.org/org/repo/"), "repo");
    }

    #[test]
    fn changed_files_short_circuits_on_equal_shas() {
        let repo = Repo::new("unused", "main", "/does/not/exist");
        assert_eq!(changed_files(&repo, "abc", "abc").unwrap(), Vec::<String>::new());
    }
}
