//! Branch I/O: the only module that touches the underlying directory
//! trees. Every path handed in is a full branch path produced by the
//! mount state; write-side calls verify in debug builds that the target
//! is not under the read-only root.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use super::mount::MountState;
use super::paths::errno;
use super::types::AttrDelta;

fn cstr(path: &Path) -> io::Result<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| errno(libc::EINVAL))
}

fn cvt(ret: libc::c_int) -> io::Result<()> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Stat without following a final symlink.
pub(crate) fn lstat(path: &Path) -> io::Result<fs::Metadata> {
    fs::symlink_metadata(path)
}

pub(crate) fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

pub(crate) fn open_read(path: &Path) -> io::Result<File> {
    File::open(path)
}

/// Exclusive create with the given permission bits.
pub(crate) fn create_excl(state: &MountState, path: &Path, mode: u32) -> io::Result<File> {
    state.debug_check_writable(path);
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(mode)
        .open(path)
}

pub(crate) fn mkdir(state: &MountState, path: &Path, mode: u32) -> io::Result<()> {
    state.debug_check_writable(path);
    let cpath = cstr(path)?;
    // SAFETY: cpath is NUL-terminated and outlives the call.
    cvt(unsafe { libc::mkdir(cpath.as_ptr(), mode as libc::mode_t) })
}

pub(crate) fn rmdir(state: &MountState, path: &Path) -> io::Result<()> {
    state.debug_check_writable(path);
    fs::remove_dir(path)
}

pub(crate) fn unlink(state: &MountState, path: &Path) -> io::Result<()> {
    state.debug_check_writable(path);
    fs::remove_file(path)
}

/// Create a device, socket or regular node. `mode` carries both the
/// `S_IFMT` bits and the permissions.
pub(crate) fn mknod(state: &MountState, path: &Path, mode: u32, rdev: u64) -> io::Result<()> {
    state.debug_check_writable(path);
    let cpath = cstr(path)?;
    // SAFETY: cpath is NUL-terminated and outlives the call.
    cvt(unsafe { libc::mknod(cpath.as_ptr(), mode as libc::mode_t, rdev as libc::dev_t) })
}

pub(crate) fn mkfifo(state: &MountState, path: &Path, mode: u32) -> io::Result<()> {
    state.debug_check_writable(path);
    let cpath = cstr(path)?;
    // SAFETY: cpath is NUL-terminated and outlives the call.
    cvt(unsafe { libc::mkfifo(cpath.as_ptr(), mode as libc::mode_t) })
}

pub(crate) fn symlink(state: &MountState, target: &Path, link: &Path) -> io::Result<()> {
    state.debug_check_writable(link);
    std::os::unix::fs::symlink(target, link)
}

pub(crate) fn readlink(path: &Path) -> io::Result<PathBuf> {
    fs::read_link(path)
}

pub(crate) fn hard_link(state: &MountState, src: &Path, dst: &Path) -> io::Result<()> {
    state.debug_check_writable(dst);
    fs::hard_link(src, dst)
}

pub(crate) fn truncate(state: &MountState, path: &Path, size: u64) -> io::Result<()> {
    state.debug_check_writable(path);
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(size)
}

/// Directory entries of a branch directory, `.` and `..` excluded.
pub(crate) fn read_dir(path: &Path) -> io::Result<Vec<fs::DirEntry>> {
    Ok(fs::read_dir(path)?.flatten().collect())
}

fn timespec_of(time: SystemTime) -> libc::timespec {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => libc::timespec {
            tv_sec: d.as_secs() as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        },
        Err(e) => libc::timespec {
            tv_sec: -(e.duration().as_secs() as libc::time_t),
            tv_nsec: 0,
        },
    }
}

/// Apply a partial attribute update to a branch path, without following
/// a final symlink. Times and ownership use the `*at` family so symlink
/// replicas keep their own attributes.
pub(crate) fn set_attr(state: &MountState, path: &Path, delta: &AttrDelta) -> io::Result<()> {
    state.debug_check_writable(path);
    let cpath = cstr(path)?;

    if let Some(mode) = delta.mode {
        // chmod follows symlinks; symlink modes are immutable on Linux
        // so a mode update on a symlink replica is skipped.
        if !lstat(path)?.file_type().is_symlink() {
            // SAFETY: cpath is NUL-terminated and outlives the call.
            cvt(unsafe { libc::chmod(cpath.as_ptr(), (mode & 0o7777) as libc::mode_t) })?;
        }
    }

    if delta.uid.is_some() || delta.gid.is_some() {
        let uid = delta.uid.map(|u| u as libc::uid_t).unwrap_or(u32::MAX);
        let gid = delta.gid.map(|g| g as libc::gid_t).unwrap_or(u32::MAX);
        // SAFETY: cpath is NUL-terminated; -1 leaves a field unchanged.
        cvt(unsafe { libc::lchown(cpath.as_ptr(), uid, gid) })?;
    }

    if delta.atime.is_some() || delta.mtime.is_some() {
        let omit = libc::timespec {
            tv_sec: 0,
            tv_nsec: libc::UTIME_OMIT,
        };
        let times = [
            delta.atime.map(timespec_of).unwrap_or(omit),
            delta.mtime.map(timespec_of).unwrap_or(omit),
        ];
        // SAFETY: cpath is NUL-terminated and times is a two-element
        // array as utimensat requires.
        cvt(unsafe {
            libc::utimensat(
                libc::AT_FDCWD,
                cpath.as_ptr(),
                times.as_ptr(),
                libc::AT_SYMLINK_NOFOLLOW,
            )
        })?;
    }

    if let Some(size) = delta.size {
        truncate(state, path, size)?;
    }

    Ok(())
}

/// Set ownership on a branch path, leaving other attributes alone.
pub(crate) fn chown(state: &MountState, path: &Path, uid: u32, gid: u32) -> io::Result<()> {
    state.debug_check_writable(path);
    let cpath = cstr(path)?;
    // SAFETY: cpath is NUL-terminated and outlives the call.
    cvt(unsafe { libc::lchown(cpath.as_ptr(), uid as libc::uid_t, gid as libc::gid_t) })
}
