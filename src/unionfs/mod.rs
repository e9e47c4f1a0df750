//! The union filesystem core: two underlying directory trees, one
//! read-only and one read-write, presented as a single writable
//! namespace.
//!
//! The modules below split along the protocol: `resolver` picks the
//! effective branch for a path, `whiteout` simulates deletion of
//! read-only entries, `cow` materialises read-write replicas on first
//! write, `sidecar` carries attribute overrides without copy-up,
//! `readdir` merges listings, and `ops` ties them into the operation
//! surface. `MallornFs` in this module is the adaptor glue binding that
//! surface to the kernel via fuser.

mod access;
mod branch;
mod convert;
mod cow;
mod file_handle;
pub mod ino;
pub mod mount;
pub mod ops;
pub mod paths;
pub mod readdir;
mod resolver;
mod sidecar;
pub mod types;
mod whiteout;

use fuser::{
    FileAttr, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory,
    ReplyEmpty, ReplyEntry, ReplyLseek, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error::{MallornError, Result};
use convert::io_error_to_libc;
use file_handle::{DirHandle, FileHandle};
use mount::MountState;
use types::{AttrDelta, Cred, InodeTable};

pub use readdir::UnionDirEntry;

/// The synthetic filesystem presented to the kernel adaptor.
pub struct MallornFs {
    state: Arc<MountState>,
    inodes: Mutex<InodeTable>,
    file_handles: RwLock<HashMap<u64, FileHandle>>,
    dir_handles: RwLock<HashMap<u64, DirHandle>>,
    next_fh: Mutex<u64>,
    /// Attribute and entry cache timeout handed to the kernel.
    ttl: Duration,
}

impl MallornFs {
    pub fn new(ro_root: PathBuf, rw_root: PathBuf, ttl_secs: u64) -> Result<MallornFs> {
        for (path, label) in [(&ro_root, "read-only"), (&rw_root, "read-write")] {
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

        Ok(MallornFs {
            state: Arc::new(MountState::new(ro_root, rw_root)),
            inodes: Mutex::new(InodeTable::new()),
            file_handles: RwLock::new(HashMap::new()),
            dir_handles: RwLock::new(HashMap::new()),
            next_fh: Mutex::new(1),
            ttl: Duration::from_secs(ttl_secs),
        })
    }

    /// The shared mount state, for adaptors that drive the operation
    /// surface directly.
    pub fn state(&self) -> Arc<MountState> {
        Arc::clone(&self.state)
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        // File handles are ephemeral; wrapping is harmless.
        *next = next.wrapping_add(1);
        fh
    }

    fn path_for(&self, ino: u64) -> std::result::Result<PathBuf, i32> {
        self.inodes.lock().path_for(ino).ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> std::result::Result<PathBuf, i32> {
        let parent_rel = self.path_for(parent)?;
        Ok(parent_rel.join(name))
    }

    fn remember(&self, attr: &FileAttr, rel: PathBuf) {
        self.inodes.lock().insert(attr.ino, rel);
    }

    fn forget_path(&self, rel: &std::path::Path) {
        self.inodes.lock().remove_path(rel);
    }

    fn file_arc(&self, fh: u64) -> std::result::Result<Arc<Mutex<std::fs::File>>, i32> {
        self.file_handles
            .read()
            .get(&fh)
            .map(|h| Arc::clone(&h.file))
            .ok_or(libc::EBADF)
    }
}

fn cred_of(req: &Request<'_>) -> Cred {
    Cred {
        uid: req.uid(),
        gid: req.gid(),
    }
}

fn time_of(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

impl Filesystem for MallornFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!(
            "union initialized: {} (RO) over {} (RW)",
            self.state.ro_root().display(),
            self.state.rw_root().display()
        );
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("union destroyed");
    }

    fn forget(&mut self, _req: &Request, ino: u64, _nlookup: u64) {
        // Inode numbers are path hashes; a forgotten binding is rebuilt
        // by the next lookup of the same path.
        self.inodes.lock().remove(ino);
    }

    fn lookup(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::lookup(&self.state, &cred_of(req), &rel) {
            Ok(attr) => {
                self.remember(&attr, rel);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn getattr(&mut self, req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        let rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::getattr(&self.state, &cred_of(req), &rel) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        let delta = AttrDelta {
            mode,
            uid,
            gid,
            atime: atime.map(time_of),
            mtime: mtime.map(time_of),
            size,
        };

        match ops::setattr(&self.state, &cred_of(req), &rel, &delta) {
            Ok(attr) => reply.attr(&self.ttl, &attr),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn mknod(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::mknod(&self.state, &cred_of(req), &rel, mode, rdev as u64) {
            Ok(attr) => {
                self.remember(&attr, rel);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::mkdir(&self.state, &cred_of(req), &rel, mode) {
            Ok(attr) => {
                self.remember(&attr, rel);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::unlink(&self.state, &cred_of(req), &rel) {
            Ok(()) => {
                self.forget_path(&rel);
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::rmdir(&self.state, &cred_of(req), &rel) {
            Ok(()) => {
                self.forget_path(&rel);
                reply.ok();
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        let rel = match self.child_path(parent, link_name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::symlink(&self.state, &cred_of(req), &rel, target) {
            Ok(attr) => {
                self.remember(&attr, rel);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn readlink(&mut self, req: &Request, ino: u64, reply: ReplyData) {
        let rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::readlink(&self.state, &cred_of(req), &rel) {
            Ok(target) => reply.data(target.as_os_str().as_bytes()),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn link(
        &mut self,
        req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let src_rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };
        let dst_rel = match self.child_path(newparent, newname) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::link(&self.state, &cred_of(req), &src_rel, &dst_rel) {
            Ok(attr) => {
                self.remember(&attr, dst_rel);
                reply.entry(&self.ttl, &attr, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let rel = match self.child_path(parent, name) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::create(&self.state, &cred_of(req), &rel, mode) {
            Ok((attr, file)) => {
                self.remember(&attr, rel);
                let fh = self.alloc_fh();
                self.file_handles.write().insert(
                    fh,
                    FileHandle {
                        file: Arc::new(Mutex::new(file)),
                    },
                );
                reply.created(&self.ttl, &attr, 0, fh, flags as u32);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        let rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::open(&self.state, &cred_of(req), &rel, flags) {
            Ok(file) => {
                let fh = self.alloc_fh();
                self.file_handles.write().insert(
                    fh,
                    FileHandle {
                        file: Arc::new(Mutex::new(file)),
                    },
                );
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let file_arc = match self.file_arc(fh) {
            Ok(arc) => arc,
            Err(e) => return reply.error(e),
        };
        let mut file = file_arc.lock();

        let mut buf = vec![0u8; size as usize];
        if let Err(e) = file.seek(SeekFrom::Start(offset as u64)) {
            return reply.error(io_error_to_libc(&e));
        }

        // Fill the buffer up to EOF; a short read mid-buffer would read
        // as end-of-file to the kernel.
        let mut filled = 0;
        loop {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => {
                    filled += n;
                    if filled == buf.len() {
                        break;
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return reply.error(io_error_to_libc(&e)),
            }
        }

        reply.data(&buf[..filled]);
    }

    fn write(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let file_arc = match self.file_arc(fh) {
            Ok(arc) => arc,
            Err(e) => return reply.error(e),
        };
        let mut file = file_arc.lock();

        if let Err(e) = file.seek(SeekFrom::Start(offset as u64)) {
            return reply.error(io_error_to_libc(&e));
        }
        match file.write_all(data) {
            Ok(()) => reply.written(data.len() as u32),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        let file_arc = match self.file_arc(fh) {
            Ok(arc) => arc,
            Err(e) => return reply.error(e),
        };
        let mut file = file_arc.lock();

        let seek_from = match whence {
            libc::SEEK_SET => SeekFrom::Start(offset as u64),
            libc::SEEK_CUR => SeekFrom::Current(offset),
            libc::SEEK_END => SeekFrom::End(offset),
            _ => return reply.error(libc::EINVAL),
        };

        match file.seek(seek_from) {
            Ok(pos) => reply.offset(pos as i64),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        if self.file_handles.read().contains_key(&fh) {
            reply.ok();
        } else {
            reply.error(libc::EBADF);
        }
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        let file_arc = match self.file_arc(fh) {
            Ok(arc) => arc,
            Err(e) => return reply.error(e),
        };
        let file = file_arc.lock();

        let res = if datasync {
            file.sync_data()
        } else {
            file.sync_all()
        };
        match res {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.file_handles.write().remove(&fh);
        reply.ok();
    }

    fn opendir(&mut self, req: &Request, ino: u64, _flags: i32, reply: ReplyOpen) {
        let rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        // The directory must resolve now; the listing itself is built
        // lazily on the first read and then pinned to the handle.
        if rel != std::path::Path::new("/") {
            if let Err(e) = ops::getattr(&self.state, &cred_of(req), &rel) {
                return reply.error(io_error_to_libc(&e));
            }
        }

        let fh = self.alloc_fh();
        self.dir_handles
            .write()
            .insert(fh, DirHandle { rel, entries: None });
        reply.opened(fh, 0);
    }

    fn readdir(&mut self, req: &Request, ino: u64, fh: u64, offset: i64, mut reply: ReplyDirectory) {
        tracing::debug!("readdir(ino={}, fh={}, offset={})", ino, fh, offset);

        let needs_scan = {
            let handles = self.dir_handles.read();
            match handles.get(&fh) {
                Some(h) => h.entries.is_none(),
                None => return reply.error(libc::EBADF),
            }
        };

        if needs_scan {
            let rel = self.dir_handles.read().get(&fh).unwrap().rel.clone();
            match ops::read_dir(&self.state, &cred_of(req), &rel) {
                Ok(entries) => {
                    if let Some(h) = self.dir_handles.write().get_mut(&fh) {
                        h.entries = Some(entries);
                    }
                }
                Err(e) => return reply.error(io_error_to_libc(&e)),
            }
        }

        let handles = self.dir_handles.read();
        let Some(DirHandle {
            entries: Some(entries),
            ..
        }) = handles.get(&fh)
        else {
            return reply.error(libc::EBADF);
        };

        for (i, entry) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(entry.ino, (i + 1) as i64, entry.kind, &entry.name) {
                break;
            }
        }
        reply.ok();
    }

    fn releasedir(&mut self, _req: &Request, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        self.dir_handles.write().remove(&fh);
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request, _ino: u64, reply: ReplyStatfs) {
        match ops::statfs(&self.state) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let rel = match self.path_for(ino) {
            Ok(rel) => rel,
            Err(e) => return reply.error(e),
        };

        match ops::access(&self.state, &cred_of(req), &rel, mask as u32) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(io_error_to_libc(&e)),
        }
    }
}
