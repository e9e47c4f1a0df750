use fuser::{FileAttr, FileType};
use libc::S_IFMT;
use std::fs::Metadata;
use std::io;
use std::os::unix::prelude::MetadataExt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Map std::io::Error to the libc error code reported to the adaptor.
pub(crate) fn io_error_to_libc(e: &io::Error) -> i32 {
    // The raw OS error is the most accurate when present.
    if let Some(code) = e.raw_os_error() {
        return code;
    }

    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::WriteZero => libc::ENOSPC,
        io::ErrorKind::OutOfMemory => libc::ENOMEM,
        io::ErrorKind::Unsupported => libc::ENOTSUP,
        _ => libc::EIO,
    }
}

pub(crate) fn mode_to_filetype(mode: u32) -> FileType {
    match mode & (S_IFMT as u32) {
        x if x == libc::S_IFREG as u32 => FileType::RegularFile,
        x if x == libc::S_IFDIR as u32 => FileType::Directory,
        x if x == libc::S_IFLNK as u32 => FileType::Symlink,
        x if x == libc::S_IFBLK as u32 => FileType::BlockDevice,
        x if x == libc::S_IFCHR as u32 => FileType::CharDevice,
        x if x == libc::S_IFIFO as u32 => FileType::NamedPipe,
        x if x == libc::S_IFSOCK as u32 => FileType::Socket,
        _ => FileType::RegularFile,
    }
}

/// The `S_IFMT` bits for a file type, used when recreating nodes.
pub(crate) fn filetype_to_mode(kind: FileType) -> u32 {
    match kind {
        FileType::RegularFile => libc::S_IFREG as u32,
        FileType::Directory => libc::S_IFDIR as u32,
        FileType::Symlink => libc::S_IFLNK as u32,
        FileType::BlockDevice => libc::S_IFBLK as u32,
        FileType::CharDevice => libc::S_IFCHR as u32,
        FileType::NamedPipe => libc::S_IFIFO as u32,
        FileType::Socket => libc::S_IFSOCK as u32,
    }
}

/// Unix seconds/nanoseconds to SystemTime, tolerating pre-epoch stamps.
pub(crate) fn timestamp(secs: i64, nsecs: i64) -> SystemTime {
    let nanos = nsecs.clamp(0, 999_999_999) as u32;
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::new(secs.unsigned_abs(), 0)
    }
}

/// Branch metadata to the attribute record handed to the adaptor.
///
/// The permission field carries the full 0o7777 mask: setuid, setgid and
/// sticky ride along because the sidecar merge covers them.
pub(crate) fn metadata_to_fileattr(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.len(),
        blocks: meta.blocks(),
        atime: timestamp(meta.atime(), meta.atime_nsec()),
        mtime: timestamp(meta.mtime(), meta.mtime_nsec()),
        ctime: timestamp(meta.ctime(), meta.ctime_nsec()),
        crtime: UNIX_EPOCH,
        kind: mode_to_filetype(meta.mode()),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: meta.blksize() as u32,
        flags: 0,
    }
}
