//! Union directory listings.
//!
//! A listing merges both branches: read-write entries win over read-only
//! ones with the same name, whiteouts suppress the read-only entries
//! they hide, and the marker files themselves never appear. Every
//! visible entry carries the inode number of its union-relative path.

use fuser::FileType;
use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::io;
use std::path::Path;

use super::branch;
use super::ino::ino_for_path;
use super::mount::MountState;
use super::paths;

/// One visible entry of a union directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnionDirEntry {
    pub name: OsString,
    pub ino: u64,
    pub kind: FileType,
}

fn entry_kind(entry: &fs::DirEntry) -> FileType {
    match entry.file_type() {
        Ok(ft) if ft.is_dir() => FileType::Directory,
        Ok(ft) if ft.is_symlink() => FileType::Symlink,
        Ok(ft) if ft.is_file() => FileType::RegularFile,
        // Device, FIFO and socket nodes need the full metadata.
        _ => entry
            .metadata()
            .map(|m| {
                use std::os::unix::fs::MetadataExt;
                super::convert::mode_to_filetype(m.mode())
            })
            .unwrap_or(FileType::RegularFile),
    }
}

/// Build the union listing of the directory at `rel`.
///
/// The read-write branch is scanned first: sidecars are skipped,
/// whiteout markers are consumed into a hidden-name set, everything else
/// is recorded. The read-only branch then contributes the entries that
/// are neither hidden nor already present. Output is name-sorted.
pub(crate) fn read_dir_union(state: &MountState, rel: &Path) -> io::Result<Vec<UnionDirEntry>> {
    let rw_dir = state.rw_path(rel);
    let ro_dir = state.ro_path(rel);
    paths::check_path_len(&rw_dir)?;
    paths::check_path_len(&ro_dir)?;

    let mut entries: Vec<UnionDirEntry> = Vec::new();
    let mut names: HashSet<OsString> = HashSet::new();
    let mut whiteouts: HashSet<OsString> = HashSet::new();

    if branch::exists(&rw_dir) {
        for entry in branch::read_dir(&rw_dir)? {
            let name = entry.file_name();

            if paths::is_sidecar_name(&name) {
                continue;
            }
            if let Some(hidden) = paths::whiteout_target(&name) {
                whiteouts.insert(hidden);
                continue;
            }

            let ino = ino_for_path(&rel.join(&name));
            entries.push(UnionDirEntry {
                kind: entry_kind(&entry),
                ino,
                name: name.clone(),
            });
            names.insert(name);
        }
    }

    if branch::exists(&ro_dir) {
        for entry in branch::read_dir(&ro_dir)? {
            let name = entry.file_name();

            if whiteouts.contains(&name) || names.contains(&name) {
                continue;
            }

            let ino = ino_for_path(&rel.join(&name));
            entries.push(UnionDirEntry {
                kind: entry_kind(&entry),
                ino,
                name,
            });
        }
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(entries)
}
