//! Per-mount state: the owned branch roots, the reentrant
//! privilege-escalation primitive, and the statfs record.

use parking_lot::{Condvar, Mutex};
use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::thread::{self, ThreadId};

use super::ino::INO_SEED;
use super::paths;

/// Filesystem magic reported through statfs for a union mount.
pub const MALLORN_MAGIC: u64 = 0x9F510;

/// Mount-scoped state shared by every operation.
pub struct MountState {
    ro_root: PathBuf,
    rw_root: PathBuf,
    root_lock: RootLock,
}

impl MountState {
    pub fn new(ro_root: PathBuf, rw_root: PathBuf) -> MountState {
        MountState {
            ro_root,
            rw_root,
            root_lock: RootLock::new(),
        }
    }

    pub fn ro_root(&self) -> &Path {
        &self.ro_root
    }

    pub fn rw_root(&self) -> &Path {
        &self.rw_root
    }

    /// Branch path of a union-relative path on the read-only branch.
    pub fn ro_path(&self, rel: &Path) -> PathBuf {
        paths::branch_path(&self.ro_root, rel)
    }

    /// Branch path of a union-relative path on the read-write branch.
    pub fn rw_path(&self, rel: &Path) -> PathBuf {
        paths::branch_path(&self.rw_root, rel)
    }

    /// Path of the whiteout marker hiding `rel`, whether or not it exists.
    pub fn whiteout_path(&self, rel: &Path) -> io::Result<PathBuf> {
        paths::marker_path(&self.rw_root, rel, paths::WHITEOUT_PREFIX)
    }

    /// Path of the metadata sidecar of `rel`, whether or not it exists.
    pub fn sidecar_path(&self, rel: &Path) -> io::Result<PathBuf> {
        paths::marker_path(&self.rw_root, rel, paths::SIDECAR_PREFIX)
    }

    /// Enter the root-identity critical section. Reentrant within a
    /// thread; concurrent entries from other threads serialize.
    pub fn push_root(&self) -> RootGuard<'_> {
        self.root_lock.enter()
    }

    /// Verify a write-side branch path does not land on the read-only
    /// branch. Only active in debug builds.
    #[inline]
    pub(crate) fn debug_check_writable(&self, path: &Path) {
        debug_assert!(
            !path.starts_with(&self.ro_root),
            "attempted to write on RO branch: {}",
            path.display()
        );
    }

    /// The statfs record for the union: the read-only branch's figures
    /// with the union's own magic and the seed-derived fsid.
    pub fn statfs(&self) -> io::Result<UnionStatfs> {
        let cpath = CString::new(self.ro_root.as_os_str().as_bytes())
            .map_err(|_| paths::errno(libc::EINVAL))?;

        let mut st: libc::statvfs = unsafe { std::mem::zeroed() };
        // SAFETY: cpath is a valid NUL-terminated string and st is a
        // properly sized out-parameter.
        let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(UnionStatfs {
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            bsize: st.f_bsize as u32,
            namelen: st.f_namemax as u32,
            frsize: st.f_frsize as u32,
            magic: MALLORN_MAGIC,
            fsid: (INO_SEED as u32, (INO_SEED >> 32) as u32),
        })
    }
}

/// Statfs figures for the union. The adaptor forwards the counts; the
/// magic and fsid are exposed here because the kernel reply cannot carry
/// them through FUSE.
#[derive(Debug, Clone, Copy)]
pub struct UnionStatfs {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
    pub magic: u64,
    pub fsid: (u32, u32),
}

struct EscalationState {
    owner: Option<ThreadId>,
    depth: u32,
    saved_uid: libc::uid_t,
    saved_gid: libc::gid_t,
}

/// Reentrant critical section that swaps the filesystem identity to root
/// for the duration of a guarded region.
///
/// Entries by the owning thread only increment the depth; the final exit
/// restores the saved identity and wakes waiters. The identity switch is
/// a no-op when the process does not hold root.
struct RootLock {
    state: Mutex<EscalationState>,
    cond: Condvar,
}

impl RootLock {
    fn new() -> RootLock {
        RootLock {
            state: Mutex::new(EscalationState {
                owner: None,
                depth: 0,
                saved_uid: 0,
                saved_gid: 0,
            }),
            cond: Condvar::new(),
        }
    }

    fn enter(&self) -> RootGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();

        while state.owner.is_some() && state.owner != Some(me) {
            self.cond.wait(&mut state);
        }

        if state.owner == Some(me) {
            state.depth += 1;
        } else {
            state.owner = Some(me);
            state.depth = 1;
            let (uid, gid) = raise_to_root();
            state.saved_uid = uid;
            state.saved_gid = gid;
        }

        RootGuard { lock: self }
    }

    fn exit(&self) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(thread::current().id()));
        debug_assert!(state.depth > 0);

        state.depth -= 1;
        if state.depth == 0 {
            restore_identity(state.saved_uid, state.saved_gid);
            state.owner = None;
            self.cond.notify_one();
        }
    }
}

/// RAII guard for the root-identity critical section.
pub struct RootGuard<'a> {
    lock: &'a RootLock,
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.lock.exit();
    }
}

#[cfg(target_os = "linux")]
fn raise_to_root() -> (libc::uid_t, libc::gid_t) {
    // SAFETY: setfsuid/setfsgid never fail; passing the current value
    // back restores it. Without root privilege the kernel refuses the
    // switch and the calls degrade to reads of the current ids.
    unsafe {
        if libc::geteuid() != 0 {
            return (libc::getuid(), libc::getgid());
        }
        let uid = libc::setfsuid(0) as libc::uid_t;
        let gid = libc::setfsgid(0) as libc::gid_t;
        (uid, gid)
    }
}

#[cfg(not(target_os = "linux"))]
fn raise_to_root() -> (libc::uid_t, libc::gid_t) {
    // No per-thread filesystem identity outside Linux.
    unsafe { (libc::getuid(), libc::getgid()) }
}

#[cfg(target_os = "linux")]
fn restore_identity(uid: libc::uid_t, gid: libc::gid_t) {
    // SAFETY: restoring previously observed ids.
    unsafe {
        if libc::geteuid() == 0 {
            libc::setfsuid(uid);
            libc::setfsgid(gid);
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn restore_identity(_uid: libc::uid_t, _gid: libc::gid_t) {}
