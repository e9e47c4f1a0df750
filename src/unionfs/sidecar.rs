//! Metadata sidecars: attribute overrides for read-only entries.
//!
//! Changing the owner, mode or times of a read-only entry must not cost
//! a file copy. Instead a zero-length `.me.`-prefixed file is created
//! next to where a copy-up would land, and the sidecar's own attributes
//! carry the overrides. A sidecar is only valid while no copy-up exists;
//! creating a copy-up retires it, and whiting out the read-only original
//! deletes it.

use fuser::FileAttr;
use std::fs;
use std::io;
use std::os::unix::prelude::MetadataExt;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::branch;
use super::convert::{metadata_to_fileattr, timestamp};
use super::cow;
use super::ino::ino_for_path;
use super::mount::MountState;
use super::types::{AttrDelta, Cred};

/// The permission bits a sidecar may override: setuid, setgid, sticky,
/// and rwx for user, group and other. Bits outside this mask always come
/// from the resolved file.
pub(crate) const PERM_MASK: u32 = 0o7777;

/// Attributes captured from a sidecar (or a copy-up about to be
/// deleted), sufficient to reconstruct the marker.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SidecarAttrs {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
}

impl SidecarAttrs {
    pub fn from_metadata(meta: &fs::Metadata) -> SidecarAttrs {
        SidecarAttrs {
            mode: meta.mode() & PERM_MASK,
            uid: meta.uid(),
            gid: meta.gid(),
            atime: timestamp(meta.atime(), meta.atime_nsec()),
            mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        }
    }
}

/// Locate the sidecar of `rel`, returning its path and attributes.
///
/// The union root cannot carry a sidecar; that case reads as not-found.
pub(crate) fn find_sidecar(
    state: &MountState,
    rel: &Path,
) -> io::Result<Option<(PathBuf, fs::Metadata)>> {
    let me_path = match state.sidecar_path(rel) {
        Ok(p) => p,
        Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(None),
        Err(e) => return Err(e),
    };

    match branch::lstat(&me_path) {
        Ok(meta) => Ok(Some((me_path, meta))),
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Effective attributes of `rel` resolved at `real_path`.
///
/// Size, blocks, link count and the type bits come from the resolved
/// file; a sidecar, when present, overrides ownership, times and the
/// permission-mask bits.
pub(crate) fn effective_attrs(
    state: &MountState,
    rel: &Path,
    real_path: &Path,
) -> io::Result<FileAttr> {
    let meta = branch::lstat(real_path)?;
    let mut attr = metadata_to_fileattr(&meta, ino_for_path(rel));

    if let Some((_, me_meta)) = find_sidecar(state, rel)? {
        attr.uid = me_meta.uid();
        attr.gid = me_meta.gid();
        attr.atime = timestamp(me_meta.atime(), me_meta.atime_nsec());
        attr.mtime = timestamp(me_meta.mtime(), me_meta.mtime_nsec());
        attr.ctime = timestamp(me_meta.ctime(), me_meta.ctime_nsec());
        attr.perm = (me_meta.mode() & PERM_MASK) as u16;
    }

    Ok(attr)
}

/// Apply an attribute delta to a read-only entry by creating or updating
/// its sidecar. `real_path` is the resolved read-only branch path.
pub(crate) fn set_metadata(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    real_path: &Path,
    delta: &AttrDelta,
) -> io::Result<()> {
    let delta = delta.metadata_only();

    match find_sidecar(state, rel)? {
        Some((me_path, _)) => {
            if delta.has_metadata() {
                let _root = state.push_root();
                branch::set_attr(state, &me_path, &delta)?;
            }
            Ok(())
        }
        None => {
            let ro_meta = branch::lstat(real_path)?;

            // The marker lands where a copy-up would; make sure the
            // parent chain exists on the read-write branch.
            cow::find_path(state, cred, rel)?;

            let me_path = state.sidecar_path(rel)?;
            let mode = delta.mode.unwrap_or_else(|| ro_meta.mode()) & PERM_MASK;

            let _root = state.push_root();
            branch::create_excl(state, &me_path, mode)?;

            // Unset fields inherit the read-only entry's values so the
            // merge is total from the first probe on.
            let fill = AttrDelta {
                mode: None,
                uid: Some(delta.uid.unwrap_or_else(|| ro_meta.uid())),
                gid: Some(delta.gid.unwrap_or_else(|| ro_meta.gid())),
                atime: Some(delta.atime.unwrap_or_else(|| {
                    timestamp(ro_meta.atime(), ro_meta.atime_nsec())
                })),
                mtime: Some(delta.mtime.unwrap_or_else(|| {
                    timestamp(ro_meta.mtime(), ro_meta.mtime_nsec())
                })),
                size: None,
            };

            if let Err(e) = branch::set_attr(state, &me_path, &fill) {
                let _ = branch::unlink(state, &me_path);
                return Err(e);
            }
            Ok(())
        }
    }
}

/// Bare sidecar construction from saved attributes. Used when a copy-up
/// is deleted while the read-only original survives, and to restore a
/// sidecar after a failed whiteout.
pub(crate) fn create_sidecar(
    state: &MountState,
    me_path: &Path,
    attrs: &SidecarAttrs,
) -> io::Result<()> {
    let _root = state.push_root();
    branch::create_excl(state, me_path, attrs.mode & PERM_MASK)?;

    let fill = AttrDelta {
        mode: None,
        uid: Some(attrs.uid),
        gid: Some(attrs.gid),
        atime: Some(attrs.atime),
        mtime: Some(attrs.mtime),
        size: None,
    };
    if let Err(e) = branch::set_attr(state, me_path, &fill) {
        let _ = branch::unlink(state, me_path);
        return Err(e);
    }
    Ok(())
}

/// Remove the sidecar of `rel` if one exists, returning its attributes
/// so a failed follow-up step can restore it.
pub(crate) fn remove_sidecar(
    state: &MountState,
    rel: &Path,
) -> io::Result<Option<(PathBuf, SidecarAttrs)>> {
    match find_sidecar(state, rel)? {
        Some((me_path, meta)) => {
            let saved = SidecarAttrs::from_metadata(&meta);
            let _root = state.push_root();
            branch::unlink(state, &me_path)?;
            Ok(Some((me_path, saved)))
        }
        None => Ok(None),
    }
}
