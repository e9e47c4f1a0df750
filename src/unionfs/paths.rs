//! Path and name utilities for the union namespace.
//!
//! A relative path `P` is `/`-rooted within the union and never carries a
//! branch prefix; concatenating a branch root with `P` yields the branch
//! path handed to branch I/O. The `.wh.` and `.me.` prefixes form the
//! reserved marker namespace on the read-write branch.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::ffi::OsStrExt;

/// Prefix of whiteout marker files.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Prefix of metadata sidecar files.
pub const SIDECAR_PREFIX: &str = ".me.";

pub(crate) fn errno(code: i32) -> io::Error {
    io::Error::from_raw_os_error(code)
}

/// Check if a filename is a whiteout marker.
pub fn is_whiteout_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(WHITEOUT_PREFIX.as_bytes())
}

/// Check if a filename is a metadata sidecar.
pub fn is_sidecar_name(name: &OsStr) -> bool {
    name.as_bytes().starts_with(SIDECAR_PREFIX.as_bytes())
}

/// Check if a filename is `.` or `..`.
pub fn is_special_name(name: &OsStr) -> bool {
    let bytes = name.as_bytes();
    bytes == b"." || bytes == b".."
}

/// Check if a filename lies in the reserved marker namespace.
pub fn is_reserved_name(name: &OsStr) -> bool {
    is_whiteout_name(name) || is_sidecar_name(name)
}

/// Build the whiteout marker name for a file: `foo` becomes `.wh.foo`.
pub fn whiteout_name(name: &OsStr) -> OsString {
    let mut marker = OsString::from(WHITEOUT_PREFIX);
    marker.push(name);
    marker
}

/// Build the sidecar name for a file: `foo` becomes `.me.foo`.
pub fn sidecar_name(name: &OsStr) -> OsString {
    let mut marker = OsString::from(SIDECAR_PREFIX);
    marker.push(name);
    marker
}

/// Extract the hidden filename from a whiteout marker name.
///
/// Returns `None` if the name is not a whiteout marker.
pub fn whiteout_target(marker: &OsStr) -> Option<OsString> {
    let bytes = marker.as_bytes();
    let prefix = WHITEOUT_PREFIX.as_bytes();
    if bytes.starts_with(prefix) {
        Some(OsString::from(OsStr::from_bytes(&bytes[prefix.len()..])))
    } else {
        None
    }
}

/// Fail with `ENAMETOOLONG` when a composed branch path exceeds the
/// system maximum.
pub fn check_path_len(path: &Path) -> io::Result<()> {
    if path.as_os_str().len() >= libc::PATH_MAX as usize {
        return Err(errno(libc::ENAMETOOLONG));
    }
    Ok(())
}

/// Concatenate a branch root with a union-relative path.
pub fn branch_path(root: &Path, rel: &Path) -> PathBuf {
    match rel.strip_prefix("/") {
        Ok(stripped) if stripped.as_os_str().is_empty() => root.to_path_buf(),
        Ok(stripped) => root.join(stripped),
        Err(_) => root.join(rel),
    }
}

/// Build the branch path of the marker (`.wh.` or `.me.`) associated
/// with a union-relative path.
///
/// Fails with `EINVAL` when the path has no parent component (the union
/// root cannot carry a marker) and `ENAMETOOLONG` when the composed path
/// exceeds the system maximum.
pub fn marker_path(rw_root: &Path, rel: &Path, prefix: &str) -> io::Result<PathBuf> {
    let name = rel.file_name().ok_or_else(|| errno(libc::EINVAL))?;
    let parent = rel.parent().ok_or_else(|| errno(libc::EINVAL))?;

    let mut marker = OsString::from(prefix);
    marker.push(name);

    let path = branch_path(rw_root, parent).join(marker);
    check_path_len(&path)?;
    Ok(path)
}
