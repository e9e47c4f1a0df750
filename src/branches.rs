//! Branch configuration for a union mount.
//!
//! A mount is described by a branch specification of the form
//! `PATH[=RO|=RW]:PATH[=RO|=RW]`. Exactly one read-only and one
//! read-write branch must result. When only one side carries a tag the
//! other side takes the remaining kind; when neither is tagged the first
//! path is the read-only branch and the second the read-write branch.

use std::path::{Path, PathBuf};

use crate::error::{MallornError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchKind {
    ReadOnly,
    ReadWrite,
}

/// The two resolved branch roots of a union mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchConfig {
    /// Root of the read-only branch, without trailing slash.
    pub ro: PathBuf,
    /// Root of the read-write branch, without trailing slash.
    pub rw: PathBuf,
}

/// Parse a single branch element `PATH[=RO|=RW]`.
///
/// Relative paths are rejected and trailing slashes are stripped.
fn parse_branch(element: &str) -> Result<(PathBuf, Option<BranchKind>)> {
    let (raw_path, kind) = match element.rsplit_once('=') {
        Some((path, "RO")) => (path, Some(BranchKind::ReadOnly)),
        Some((path, "RW")) => (path, Some(BranchKind::ReadWrite)),
        Some((_, tag)) => {
            return Err(MallornError::Config(format!(
                "Unrecognized branch type: {}",
                tag
            )));
        }
        None => (element, None),
    };

    if raw_path.is_empty() {
        return Err(MallornError::Config("Empty branch path".to_string()));
    }

    if !raw_path.starts_with('/') {
        return Err(MallornError::Config(format!(
            "Relative branch path is forbidden: {}",
            raw_path
        )));
    }

    let trimmed = if raw_path.len() > 1 {
        raw_path.trim_end_matches('/')
    } else {
        raw_path
    };

    Ok((PathBuf::from(trimmed), kind))
}

/// Parse a full branch specification into a [`BranchConfig`].
pub fn parse_branch_spec(spec: &str) -> Result<BranchConfig> {
    let (first, second) = spec.split_once(':').ok_or_else(|| {
        MallornError::Config(format!("Expected two branches separated by ':': {}", spec))
    })?;

    let (first_path, first_kind) = parse_branch(first)?;
    let (second_path, second_kind) = parse_branch(second)?;

    let (ro, rw) = match (first_kind, second_kind) {
        (Some(a), Some(b)) if a == b => {
            return Err(MallornError::Config(
                "Both branches carry the same type; need one RO and one RW".to_string(),
            ));
        }
        (Some(BranchKind::ReadOnly), _) => (first_path, second_path),
        (Some(BranchKind::ReadWrite), _) => (second_path, first_path),
        (None, Some(BranchKind::ReadOnly)) => (second_path, first_path),
        (None, Some(BranchKind::ReadWrite)) => (first_path, second_path),
        // Untagged pair: first is RO, second is RW.
        (None, None) => (first_path, second_path),
    };

    if ro == rw {
        return Err(MallornError::Config(
            "Read-only and read-write branches must differ".to_string(),
        ));
    }

    Ok(BranchConfig { ro, rw })
}

/// Verify that both branch roots exist and are directories.
pub fn validate_branches(config: &BranchConfig) -> Result<()> {
    for (path, label) in [(&config.ro, "read-only"), (&config.rw, "read-write")] {
        let meta = std::fs::metadata(path).map_err(|e| {
            MallornError::Branch(format!(
                "Failed opening {} branch {}: {}",
                label,
                path.display(),
                e
            ))
        })?;
        if !meta.is_dir() {
            return Err(MallornError::Branch(format!(
                "{} branch {} is not a directory",
                label,
                path.display()
            )));
        }
    }
    Ok(())
}

#[allow(dead_code)]
pub fn branch_kind_of(config: &BranchConfig, path: &Path) -> Option<BranchKind> {
    if path.starts_with(&config.ro) {
        Some(BranchKind::ReadOnly)
    } else if path.starts_with(&config.rw) {
        Some(BranchKind::ReadWrite)
    } else {
        None
    }
}
