//! Recursive directory-to-tree listing, used by the controller to expose the
//! `archive_list`/`output_list` contract (spec.md §6).
//!
//! Grounded on `examples/original_source/tubular_controller/archiveLister.py`.

use serde::Serialize;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize)]
pub struct DirEntry {
    pub label: String,
    /// `Some(relative_path)` for a file leaf, `None` for a directory node.
    pub path: Option<String>,
    pub children: Vec<DirEntry>,
}

/// Builds a tree of `root`'s contents, with each file's `path` recorded relative to
/// `root` (so callers can turn it into a download link).
pub fn list(root: &Path) -> std::io::Result<DirEntry> {
    build(root, root)
}

fn build(root: &Path, cur: &Path) -> std::io::Result<DirEntry> {
    let label = cur
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| cur.display().to_string());

    let mut children = Vec::new();
    let mut read_dir: Vec<_> = fs::read_dir(cur)?.filter_map(|e| e.ok()).collect();
    read_dir.sort_by_key(|e| e.file_name());

    for entry in read_dir {
        let path = entry.path();
        if path.is_dir() {
            children.push(build(root, &path)?);
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            children.push(DirEntry {
                label: entry.file_name().to_string_lossy().to_string(),
                path: Some(rel),
                children: Vec::new(),
            });
        }
    }

    Ok(DirEntry {
        label,
        path: None,
        children,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_nested_files_with_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("a.txt"), "a").unwrap();
        fs::write(dir.path().join("nested/b.txt"), "b").unwrap();

        let tree = list(dir.path()).unwrap();
        assert_eq!(tree.children.len(), 2);
        let nested = tree.children.iter().find(|c| c.label == "nested").unwrap();
        assert_eq!(nested.children[0].path.as_deref(), Some("nested/b.txt"));
    }
}
