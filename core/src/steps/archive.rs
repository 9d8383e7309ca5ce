use super::{write_banner, StepError, TaskEnv};
use crate::substitution::Constants;
use std::fs;
use std::io::Write;
use std::path::Path;

pub fn run(
    target: &str,
    env: &TaskEnv,
    constants: &Constants,
    out: &mut dyn Write,
) -> Result<(), StepError> {
    let target = env.substitute(target, constants);
    write_banner(out, "Archive", &target, env);

    let workspace_real = fs::canonicalize(&env.workspace)?;
    let requested = env.workspace.join(&target);

    let real = fs::canonicalize(&requested).map_err(|_| StepError::MissingTarget(target.clone()))?;
    if !real.starts_with(&workspace_real) {
        return Err(StepError::PathTraversal(target));
    }

    let rel = real
        .strip_prefix(&workspace_real)
        .expect("canonicalized target is under workspace")
        .to_path_buf();
    let dest = env.archive_dir.join(&rel);

    if real.is_dir() {
        let _ = writeln!(out, "Archiving directory: {}", real.display());
        copy_tree(&real, &dest)?;
    } else {
        let _ = writeln!(out, "Archiving file: {}", real.display());
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&real, &dest)?;
    }
    let _ = out.flush();

    Ok(())
}

/// Recursively copies `src` into `dest`, preserving directory structure and
/// symlinks (spec.md §4.5, §9(b)).
fn copy_tree(src: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dest)?;

    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::Other, e.to_string())
        })?;
        let rel = entry.path().strip_prefix(src).expect("entry is under src");
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link_target = fs::read_link(entry.path())?;
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link_target, &target)?;
            #[cfg(windows)]
            {
                if entry.path().is_dir() {
                    std::os::windows::fs::symlink_dir(&link_target, &target)?;
                } else {
                    std::os::windows::fs::symlink_file(&link_target, &target)?;
                }
            }
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::substitution::Constants;
    use std::collections::HashMap;
    use std::time::Instant;

    fn env_for(workspace: &Path, archive_dir: &Path) -> TaskEnv {
        TaskEnv {
            workspace: workspace.to_path_buf(),
            archive_dir: archive_dir.to_path_buf(),
            output_file: workspace.join("out.output"),
            args: HashMap::new(),
            step_index: 0,
            start_time: Instant::now(),
        }
    }

    #[test]
    fn archive_copies_single_file() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let archive_dir = dir.path().join("archive");
        fs::create_dir_all(&workspace).unwrap();
        fs::create_dir_all(&archive_dir).unwrap();
        fs::write(workspace.join("out.txt"), "hello\n").unwrap();

        let env = env_for(&workspace, &archive_dir);
        let constants = Constants::empty();
        let mut sink = Vec::new();
        run("out.txt", &env, &constants, &mut sink).unwrap();

        assert_eq!(fs::read_to_string(archive_dir.join("out.txt")).unwrap(), "hello\n");
    }

    #[test]
    fn archive_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let archive_dir = dir.path().join("archive");
        fs::create_dir_all(&workspace).unwrap();
        fs::create_dir_all(&archive_dir).unwrap();
        fs::write(dir.path().join("secret.txt"), "nope\n").unwrap();

        let env = env_for(&workspace, &archive_dir);
        let constants = Constants::empty();
        let mut sink = Vec::new();
        let err = run("../secret.txt", &env, &constants, &mut sink).unwrap_err();
        assert!(matches!(err, StepError::PathTraversal(_)));
        assert!(!archive_dir.join("secret.txt").exists());
    }

    #[test]
    fn archive_preserves_directory_structure() {
        let dir = tempfile::tempdir().unwrap();
        let workspace = dir.path().join("ws");
        let archive_dir = dir.path().join("archive");
        fs::create_dir_all(workspace.join("nested")).unwrap();
        fs::create_dir_all(&archive_dir).unwrap();
        fs::write(workspace.join("nested/file.txt"), "x").unwrap();

        let env = env_for(&workspace, &archive_dir);
        let constants = Constants::empty();
        let mut sink = Vec::new();
        run("nested", &env, &constants, &mut sink).unwrap();

        assert!(archive_dir.join("nested/file.txt").exists());
    }
}
