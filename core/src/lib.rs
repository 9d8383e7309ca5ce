//! Shared pipeline model, substitution engine, git driver, step executors and
//! config/wire types used by both `tubular-controller` and `tubular-node`.

pub mod archive_zip;
pub mod config;
pub mod fs_tree;
pub mod git;
pub mod models;
pub mod steps;
pub mod substitution;
pub mod wire;

pub use substitution::Constants;
