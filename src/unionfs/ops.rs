//! The operation surface of the union: one function per filesystem
//! operation, orchestrating resolver, copy-up, whiteouts and sidecars.
//!
//! Every operation follows the same shape: resolve the path, enforce
//! permissions, perform the branch-level mutation, then maintain the
//! whiteout and sidecar state. Observable side effects are limited to
//! the two branches.

use fuser::FileAttr;
use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::access;
use super::branch;
use super::convert::metadata_to_fileattr;
use super::cow;
use super::ino::ino_for_path;
use super::mount::{MountState, UnionStatfs};
use super::paths::{self, errno};
use super::readdir::{self, UnionDirEntry};
use super::resolver;
use super::sidecar;
use super::types::{AttrDelta, Cred, Resolution, ResolveFlags};
use super::whiteout;

/// Fail with `EINVAL` when the final component lies in the reserved
/// marker namespace. Whiteouts and sidecars are not creatable through
/// the union surface.
fn reject_reserved(rel: &Path) -> io::Result<()> {
    match rel.file_name() {
        Some(name) if paths::is_reserved_name(name) => Err(errno(libc::EINVAL)),
        _ => Ok(()),
    }
}

/// Fail with `EEXIST` when the path resolves anywhere in the union.
fn ensure_absent(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<()> {
    match resolver::resolve(state, cred, rel, ResolveFlags::NONE) {
        Ok(_) => Err(errno(libc::EEXIST)),
        Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
        Err(e) => Err(e),
    }
}

/// The fixed attributes of the union root: a read-only directory whose
/// times come from the read-only branch root.
fn root_attr(state: &MountState) -> io::Result<FileAttr> {
    let meta = branch::lstat(state.ro_root())?;
    let mut attr = metadata_to_fileattr(&meta, ino_for_path(Path::new("/")));
    attr.kind = fuser::FileType::Directory;
    attr.perm = 0o555;
    attr.nlink = 2;
    Ok(attr)
}

/// Effective attributes of the entry at `rel`, as observed through the
/// union.
pub fn getattr(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<FileAttr> {
    if rel == Path::new("/") {
        return root_attr(state);
    }
    let resolved = resolver::resolve(state, cred, rel, ResolveFlags::NONE)?;
    sidecar::effective_attrs(state, rel, &resolved.branch_path)
}

/// Locate `rel` and return its effective attributes.
pub fn lookup(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<FileAttr> {
    getattr(state, cred, rel)
}

/// Check an access mask against the effective attributes of `rel`.
pub fn access(state: &MountState, cred: &Cred, rel: &Path, mask: u32) -> io::Result<()> {
    let resolved = resolver::resolve(state, cred, rel, ResolveFlags::NONE)?;
    if mask == 0 {
        // Existence probe.
        return Ok(());
    }
    access::can_access(state, cred, rel, &resolved.branch_path, mask)
}

/// Apply a partial attribute update.
///
/// A size change is a content change: it forces copy-up and truncates
/// the replica. Attribute-only changes on a read-only entry go through
/// the sidecar; on a read-write entry they apply directly.
pub fn setattr(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    delta: &AttrDelta,
) -> io::Result<FileAttr> {
    let flags = if delta.size.is_some() {
        ResolveFlags::CREATE_COPYUP
    } else {
        ResolveFlags::NONE
    };
    let resolved = resolver::resolve(state, cred, rel, flags)?;

    if resolved.is_rw() {
        branch::set_attr(state, &resolved.branch_path, delta)?;
    } else {
        sidecar::set_metadata(state, cred, rel, &resolved.branch_path, delta)?;
    }

    getattr(state, cred, rel)
}

/// Create an empty regular file owned by the caller and return an open
/// read-write handle on it.
pub fn create(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    mode: u32,
) -> io::Result<(FileAttr, File)> {
    reject_reserved(rel)?;
    ensure_absent(state, cred, rel)?;

    let rw_path = cow::find_path(state, cred, rel)?;
    access::can_create(state, cred, rel)?;

    let file = branch::create_excl(state, &rw_path, mode & 0o7777)?;

    {
        let _root = state.push_root();
        if let Err(e) = branch::chown(state, &rw_path, cred.uid, cred.gid) {
            drop(file);
            let _ = branch::unlink(state, &rw_path);
            return Err(e);
        }
    }

    whiteout::unlink_whiteout(state, rel)?;

    drop(file);
    let handle = OpenOptions::new().read(true).write(true).open(&rw_path)?;
    let meta = branch::lstat(&rw_path)?;
    Ok((metadata_to_fileattr(&meta, ino_for_path(rel)), handle))
}

/// Create a directory. A read-only directory previously visible at the
/// same path stays suppressed: its contents are hidden entry by entry.
pub fn mkdir(state: &MountState, cred: &Cred, rel: &Path, mode: u32) -> io::Result<FileAttr> {
    reject_reserved(rel)?;
    ensure_absent(state, cred, rel)?;
    access::can_create(state, cred, rel)?;

    let rw_path = cow::find_path(state, cred, rel)?;
    branch::mkdir(state, &rw_path, mode & 0o7777)?;

    if let Err(e) = whiteout::hide_directory_contents(state, rel) {
        let _ = branch::rmdir(state, &rw_path);
        return Err(e);
    }

    whiteout::unlink_whiteout(state, rel)?;

    let meta = branch::lstat(&rw_path)?;
    Ok(metadata_to_fileattr(&meta, ino_for_path(rel)))
}

/// Create a node: FIFO, device, socket, or (for a plain mode) a regular
/// file.
pub fn mknod(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    mode: u32,
    rdev: u64,
) -> io::Result<FileAttr> {
    reject_reserved(rel)?;
    ensure_absent(state, cred, rel)?;
    access::can_create(state, cred, rel)?;

    let rw_path = cow::find_path(state, cred, rel)?;

    match mode & libc::S_IFMT as u32 {
        x if x == libc::S_IFIFO as u32 => branch::mkfifo(state, &rw_path, mode & 0o7777)?,
        0 => {
            branch::create_excl(state, &rw_path, mode & 0o7777)?;
        }
        x if x == libc::S_IFREG as u32 => {
            branch::create_excl(state, &rw_path, mode & 0o7777)?;
        }
        _ => branch::mknod(state, &rw_path, mode, rdev)?,
    }

    whiteout::unlink_whiteout(state, rel)?;

    let meta = branch::lstat(&rw_path)?;
    Ok(metadata_to_fileattr(&meta, ino_for_path(rel)))
}

/// Create a symbolic link at `rel` pointing at `target`.
pub fn symlink(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    target: &Path,
) -> io::Result<FileAttr> {
    reject_reserved(rel)?;
    ensure_absent(state, cred, rel)?;
    access::can_create(state, cred, rel)?;

    let rw_path = cow::find_path(state, cred, rel)?;
    branch::symlink(state, target, &rw_path)?;

    whiteout::unlink_whiteout(state, rel)?;

    let meta = branch::lstat(&rw_path)?;
    Ok(metadata_to_fileattr(&meta, ino_for_path(rel)))
}

/// Hard-link `dst` to `src`. When the source resolves read-only the
/// branches cannot share an inode, so the link degrades to a symlink
/// whose target is the read-only branch path of the source.
pub fn link(
    state: &MountState,
    cred: &Cred,
    src_rel: &Path,
    dst_rel: &Path,
) -> io::Result<FileAttr> {
    reject_reserved(dst_rel)?;

    let origin = resolver::resolve(state, cred, src_rel, ResolveFlags::NONE)?;

    ensure_absent(state, cred, dst_rel)?;
    access::can_create(state, cred, dst_rel)?;

    let dst_rw = cow::find_path(state, cred, dst_rel)?;

    if origin.place == Resolution::FoundInRo {
        branch::symlink(state, &origin.branch_path, &dst_rw)?;
    } else {
        branch::hard_link(state, &origin.branch_path, &dst_rw)?;
    }

    whiteout::unlink_whiteout(state, dst_rel)?;

    let meta = branch::lstat(&dst_rw)?;
    Ok(metadata_to_fileattr(&meta, ino_for_path(dst_rel)))
}

/// Remove a non-directory entry from the union.
pub fn unlink(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<()> {
    let resolved = resolver::resolve(state, cred, rel, ResolveFlags::NONE)?;

    match resolved.place {
        Resolution::FoundInRw | Resolution::CopiedUp => {
            let has_ro = resolver::resolve(state, cred, rel, ResolveFlags::MUST_RO).is_ok();

            access::can_remove(state, cred, rel)?;
            branch::unlink(state, &resolved.branch_path)?;

            // The read-only twin reappears unless hidden.
            if has_ro {
                whiteout::create_whiteout(state, cred, rel)?;
            }
            Ok(())
        }
        Resolution::FoundInRo => {
            access::can_remove(state, cred, rel)?;

            let saved = sidecar::remove_sidecar(state, rel)?;
            match whiteout::create_whiteout(state, cred, rel) {
                Ok(_) => Ok(()),
                Err(e) => {
                    if let Some((me_path, attrs)) = saved {
                        let _ = sidecar::create_sidecar(state, &me_path, &attrs);
                    }
                    Err(e)
                }
            }
        }
    }
}

/// Remove a directory that is empty in the union view.
pub fn rmdir(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<()> {
    let resolved = resolver::resolve(state, cred, rel, ResolveFlags::NONE)?;

    let meta = branch::lstat(&resolved.branch_path)?;
    if !meta.is_dir() {
        return Err(errno(libc::ENOTDIR));
    }

    match resolved.place {
        Resolution::FoundInRw | Resolution::CopiedUp => {
            let has_ro = resolver::resolve(state, cred, rel, ResolveFlags::MUST_RO).is_ok();

            access::can_remove(state, cred, rel)?;

            let ro_dir = state.ro_path(rel);
            whiteout::is_empty_dir(
                state,
                rel,
                has_ro.then_some(ro_dir.as_path()),
                Some(resolved.branch_path.as_path()),
            )?;

            if has_ro {
                whiteout::create_whiteout(state, cred, rel)?;
            }

            if let Err(e) = branch::rmdir(state, &resolved.branch_path) {
                if has_ro {
                    let _ = whiteout::unlink_whiteout(state, rel);
                }
                return Err(e);
            }
            Ok(())
        }
        Resolution::FoundInRo => {
            access::can_remove(state, cred, rel)?;
            whiteout::is_empty_dir(state, rel, Some(&resolved.branch_path), None)?;

            let saved = sidecar::remove_sidecar(state, rel)?;
            match whiteout::create_whiteout(state, cred, rel) {
                Ok(_) => Ok(()),
                Err(e) => {
                    if let Some((me_path, attrs)) = saved {
                        let _ = sidecar::create_sidecar(state, &me_path, &attrs);
                    }
                    Err(e)
                }
            }
        }
    }
}

/// Open the entry at `rel` and return the underlying branch handle.
///
/// Write access forces copy-up; the handle then lands on the replica.
pub fn open(state: &MountState, cred: &Cred, rel: &Path, flags: i32) -> io::Result<File> {
    let want_write = (flags & libc::O_ACCMODE) != libc::O_RDONLY;

    let resolve_flags = if want_write {
        ResolveFlags::CREATE_COPYUP
    } else {
        ResolveFlags::NONE
    };
    let resolved = resolver::resolve(state, cred, rel, resolve_flags)?;

    if resolved.place == Resolution::CopiedUp {
        if let Err(e) = access::can_create(state, cred, rel) {
            let _ = cow::unlink_copyup(state, cred, rel, &resolved.branch_path);
            return Err(e);
        }
    }

    let mut opts = OpenOptions::new();
    match flags & libc::O_ACCMODE {
        libc::O_RDONLY => {
            opts.read(true);
        }
        libc::O_WRONLY => {
            opts.write(true);
        }
        libc::O_RDWR => {
            opts.read(true).write(true);
        }
        _ => return Err(errno(libc::EINVAL)),
    }
    if want_write && (flags & libc::O_APPEND) != 0 {
        opts.append(true);
    }
    if want_write && (flags & libc::O_TRUNC) != 0 {
        opts.truncate(true);
    }

    match opts.open(&resolved.branch_path) {
        Ok(file) => Ok(file),
        Err(e) => {
            if resolved.place == Resolution::CopiedUp {
                let _ = cow::unlink_copyup(state, cred, rel, &resolved.branch_path);
            }
            Err(e)
        }
    }
}

/// Read the target of the symlink at `rel`.
pub fn readlink(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<PathBuf> {
    let resolved = resolver::resolve(state, cred, rel, ResolveFlags::NONE)?;
    branch::readlink(&resolved.branch_path)
}

/// Union listing of the directory at `rel`.
pub fn read_dir(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<Vec<UnionDirEntry>> {
    if rel != Path::new("/") {
        resolver::resolve(state, cred, rel, ResolveFlags::NONE)?;
    }
    readdir::read_dir_union(state, rel)
}

/// Statfs record of the union.
pub fn statfs(state: &MountState) -> io::Result<UnionStatfs> {
    state.statfs()
}
