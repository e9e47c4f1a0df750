//! Permission checks against the merged view.
//!
//! All checks evaluate the effective attributes, so a sidecar carrying a
//! mode or ownership override decides access for the read-only entry it
//! shadows.

use std::io;
use std::path::{Component, Path, PathBuf};

use super::branch;
use super::mount::MountState;
use super::paths::errno;
use super::sidecar;
use super::types::Cred;

pub(crate) const MAY_EXEC: u32 = 1;
pub(crate) const MAY_WRITE: u32 = 2;
#[allow(dead_code)]
pub(crate) const MAY_READ: u32 = 4;

/// Check an access mask against the effective attributes of `rel`.
///
/// Root is granted everything except execute on an entry with no execute
/// bit at all. Other callers are checked against the owner, group or
/// other permission triad selected by their identity.
pub(crate) fn can_access(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    real_path: &Path,
    mask: u32,
) -> io::Result<()> {
    let attr = sidecar::effective_attrs(state, rel, real_path)?;
    let mode = attr.perm as u32;

    if cred.uid == 0 {
        if mask & MAY_EXEC != 0 && mode & 0o111 == 0 {
            return Err(errno(libc::EACCES));
        }
        return Ok(());
    }

    // Requested rwx bits start in the "other" position; shift them onto
    // the owner or group triad when the caller matches.
    let wanted = if cred.uid == attr.uid {
        mask << 6
    } else if cred.gid == attr.gid {
        mask << 3
    } else {
        mask
    };

    if mode & wanted == wanted {
        Ok(())
    } else {
        Err(errno(libc::EACCES))
    }
}

/// Resolve the branch path of `rel`'s parent: the read-write copy when
/// one exists, the read-only one otherwise.
fn parent_real_path(state: &MountState, rel: &Path) -> io::Result<(PathBuf, PathBuf)> {
    let parent_rel = rel.parent().ok_or_else(|| errno(libc::EACCES))?;
    let rw = state.rw_path(parent_rel);
    let real = if branch::exists(&rw) {
        rw
    } else {
        state.ro_path(parent_rel)
    };
    Ok((parent_rel.to_path_buf(), real))
}

/// Creating an entry requires write permission on its parent directory.
pub(crate) fn can_create(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<()> {
    let (parent_rel, parent_real) = parent_real_path(state, rel)?;
    can_access(state, cred, &parent_rel, &parent_real, MAY_WRITE)
}

/// Removing an entry requires the same rights as creating it.
pub(crate) fn can_remove(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<()> {
    can_create(state, cred, rel)
}

/// Require execute permission on every directory between the union root
/// and `rel`, exclusive of `rel` itself. Traversing the root is always
/// possible.
pub(crate) fn can_traverse(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<()> {
    let Some(parent) = rel.parent() else {
        return Ok(());
    };

    let mut prefix = PathBuf::from("/");
    for comp in parent.components() {
        let Component::Normal(name) = comp else {
            continue;
        };
        prefix.push(name);

        let rw = state.rw_path(&prefix);
        let real = if branch::exists(&rw) {
            rw
        } else {
            state.ro_path(&prefix)
        };
        can_access(state, cred, &prefix, &real, MAY_EXEC)?;
    }

    Ok(())
}
