//! Core types of the union resolver and mutation protocol.

use fuser::FUSE_ROOT_ID;
use lru::LruCache;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

const DEFAULT_INODE_CACHE_CAPACITY: usize = 10000;

/// Where the resolver located the effective entry for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The entry lives on the read-only branch.
    FoundInRo,
    /// The entry lives on the read-write branch.
    FoundInRw,
    /// The entry lived on the read-only branch and a copy-up was just
    /// created; the returned path is the read-write replica.
    CopiedUp,
}

/// A successful resolution: the effective branch path and where it came from.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub place: Resolution,
    pub branch_path: PathBuf,
}

impl Resolved {
    pub fn is_rw(&self) -> bool {
        matches!(self.place, Resolution::FoundInRw | Resolution::CopiedUp)
    }
}

/// Flags steering the resolver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolveFlags {
    /// The entry must already exist on the read-write branch.
    pub must_rw: bool,
    /// Only the read-only branch is considered.
    pub must_ro: bool,
    /// If the entry is found on the read-only branch, copy it up.
    pub create_copyup: bool,
    /// Do not let a whiteout hide the read-only entry.
    pub ignore_whiteout: bool,
}

impl ResolveFlags {
    pub const NONE: ResolveFlags = ResolveFlags {
        must_rw: false,
        must_ro: false,
        create_copyup: false,
        ignore_whiteout: false,
    };

    pub const MUST_RW: ResolveFlags = ResolveFlags {
        must_rw: true,
        must_ro: false,
        create_copyup: false,
        ignore_whiteout: false,
    };

    pub const MUST_RO: ResolveFlags = ResolveFlags {
        must_rw: false,
        must_ro: true,
        create_copyup: false,
        ignore_whiteout: false,
    };

    pub const CREATE_COPYUP: ResolveFlags = ResolveFlags {
        must_rw: false,
        must_ro: false,
        create_copyup: true,
        ignore_whiteout: false,
    };
}

/// Caller identity, as delivered by the adaptor with each operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
}

impl Cred {
    pub fn root() -> Cred {
        Cred { uid: 0, gid: 0 }
    }

    pub fn is_root(&self) -> bool {
        self.uid == 0
    }

    /// The identity of the current process.
    pub fn current() -> Cred {
        // SAFETY: getuid/getgid cannot fail.
        unsafe {
            Cred {
                uid: libc::getuid(),
                gid: libc::getgid(),
            }
        }
    }
}

/// A partial attribute update. Only the set fields are applied.
///
/// `size` is a content change and is never carried by a sidecar; a set
/// `size` forces copy-up of a read-only entry before truncation.
#[derive(Debug, Clone, Copy, Default)]
pub struct AttrDelta {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub size: Option<u64>,
}

impl AttrDelta {
    pub fn is_empty(&self) -> bool {
        self.mode.is_none()
            && self.uid.is_none()
            && self.gid.is_none()
            && self.atime.is_none()
            && self.mtime.is_none()
            && self.size.is_none()
    }

    /// The delta restricted to the fields a sidecar may carry.
    pub fn metadata_only(&self) -> AttrDelta {
        AttrDelta {
            size: None,
            ..*self
        }
    }

    /// Whether any sidecar-eligible field is set.
    pub fn has_metadata(&self) -> bool {
        self.mode.is_some()
            || self.uid.is_some()
            || self.gid.is_some()
            || self.atime.is_some()
            || self.mtime.is_some()
    }
}

/// Cache binding synthetic inode numbers to union-relative paths.
///
/// Inode numbers are `H(P)`, so the cache is purely an ino -> path map
/// for the benefit of the adaptor, which addresses entries by number.
/// Entries are evicted by ordinary cache pressure; an evicted number
/// resolves again on the next lookup of its path.
pub(crate) struct InodeTable {
    inodes: LruCache<u64, PathBuf>,
}

impl InodeTable {
    pub fn new() -> Self {
        InodeTable {
            inodes: LruCache::new(NonZeroUsize::new(DEFAULT_INODE_CACHE_CAPACITY).unwrap()),
        }
    }

    pub fn insert(&mut self, ino: u64, rel: PathBuf) {
        if ino != FUSE_ROOT_ID {
            self.inodes.put(ino, rel);
        }
    }

    /// The union-relative path bound to an inode number.
    ///
    /// The adaptor's root id always denotes `/`.
    pub fn path_for(&mut self, ino: u64) -> Option<PathBuf> {
        if ino == FUSE_ROOT_ID {
            return Some(PathBuf::from("/"));
        }
        self.inodes.get(&ino).cloned()
    }

    pub fn remove(&mut self, ino: u64) {
        self.inodes.pop(&ino);
    }

    /// Rebind paths after a successful mutation so stale entries do not
    /// linger past their deletion.
    pub fn remove_path(&mut self, rel: &Path) {
        let ino = super::ino::ino_for_path(rel);
        self.inodes.pop(&ino);
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.inodes.len()
    }
}
