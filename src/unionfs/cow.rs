//! Copy-up: materialising read-write replicas of read-only entries.
//!
//! The first write to a read-only entry clones it onto the read-write
//! branch; later resolution then finds the replica. Directories are
//! copied recursively, symlinks keep their target, device and FIFO nodes
//! are recreated. A copy-up carries the entry's effective attributes, so
//! any sidecar is retired once the replica exists.

use fuser::FileType;
use std::io::{self, Read, Write};
use std::os::unix::prelude::MetadataExt;
use std::path::{Component, Path, PathBuf};

use super::branch;
use super::convert::{filetype_to_mode, timestamp};
use super::mount::MountState;
use super::paths::{self, errno};
use super::resolver;
use super::sidecar::{self, SidecarAttrs};
use super::types::{AttrDelta, Cred, ResolveFlags, Resolution};

/// Size of the bounded buffer used when streaming file contents.
const COPY_BUF_LEN: usize = 4096;

/// Copy the entry at `rel` up to the read-write branch and return the
/// replica's path. The caller has verified that the read-only entry
/// exists and no read-write entry does.
pub(crate) fn copy_up(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<PathBuf> {
    let ro_path = state.ro_path(rel);
    paths::check_path_len(&ro_path)?;

    let rw_path = find_path(state, cred, rel)?;
    paths::check_path_len(&rw_path)?;

    tracing::debug!("copy_up: {:?} -> {}", rel, rw_path.display());
    copy_entry(state, cred, rel, &ro_path, &rw_path)?;
    Ok(rw_path)
}

fn remove_replica(state: &MountState, path: &Path) {
    let _ = branch::unlink(state, path).or_else(|_| branch::rmdir(state, path));
}

fn copy_entry(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    ro_path: &Path,
    rw_path: &Path,
) -> io::Result<()> {
    let attr = sidecar::effective_attrs(state, rel, ro_path)?;
    let perm = attr.perm as u32;

    match attr.kind {
        FileType::Symlink => {
            let target = branch::readlink(ro_path)?;
            branch::symlink(state, &target, rw_path)?;
        }
        FileType::RegularFile => {
            copy_regular(state, ro_path, rw_path, perm)?;
        }
        FileType::Directory => {
            branch::mkdir(state, rw_path, perm)?;
            if let Err(e) = copy_children(state, cred, rel, ro_path, rw_path) {
                remove_tree(state, rw_path);
                return Err(e);
            }
        }
        FileType::NamedPipe => {
            branch::mkfifo(state, rw_path, perm)?;
        }
        FileType::CharDevice | FileType::BlockDevice => {
            branch::mknod(
                state,
                rw_path,
                filetype_to_mode(attr.kind) | perm,
                attr.rdev as u64,
            )?;
        }
        FileType::Socket => {
            branch::mknod(state, rw_path, libc::S_IFSOCK as u32 | perm, 0)?;
        }
    }

    // The replica carries the entry's effective attributes.
    let fill = AttrDelta {
        mode: Some(perm),
        uid: Some(attr.uid),
        gid: Some(attr.gid),
        atime: Some(attr.atime),
        mtime: Some(attr.mtime),
        size: None,
    };
    {
        let _root = state.push_root();
        if let Err(e) = branch::set_attr(state, rw_path, &fill) {
            remove_replica(state, rw_path);
            return Err(e);
        }
    }

    // The copy-up is now authoritative; a sidecar would be stale.
    if let Some((me_path, _)) = sidecar::find_sidecar(state, rel)? {
        let _root = state.push_root();
        branch::unlink(state, &me_path)?;
    }

    Ok(())
}

fn copy_children(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    ro_path: &Path,
    rw_path: &Path,
) -> io::Result<()> {
    for entry in branch::read_dir(ro_path)? {
        let name = entry.file_name();
        copy_entry(
            state,
            cred,
            &rel.join(&name),
            &ro_path.join(&name),
            &rw_path.join(&name),
        )?;
    }
    Ok(())
}

fn copy_regular(
    state: &MountState,
    ro_path: &Path,
    rw_path: &Path,
    perm: u32,
) -> io::Result<()> {
    let mut src = branch::open_read(ro_path)?;
    let mut dst = {
        let _root = state.push_root();
        branch::create_excl(state, rw_path, perm)?
    };

    let mut buf = [0u8; COPY_BUF_LEN];
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                drop(dst);
                remove_replica(state, rw_path);
                return Err(e);
            }
        };
        if let Err(e) = dst.write_all(&buf[..n]) {
            drop(dst);
            remove_replica(state, rw_path);
            return Err(e);
        }
    }

    Ok(())
}

fn remove_tree(state: &MountState, path: &Path) {
    state.debug_check_writable(path);
    let _ = std::fs::remove_dir_all(path);
}

/// Ensure the read-write branch holds every directory component of
/// `rel`, copying each missing one up shallowly (own attributes only),
/// and return the read-write path of `rel` itself.
pub(crate) fn find_path(state: &MountState, cred: &Cred, rel: &Path) -> io::Result<PathBuf> {
    let parent = rel.parent().ok_or_else(|| errno(libc::EINVAL))?;

    // The parent must at least resolve; if it already lives on the
    // read-write branch there is nothing to materialise.
    let resolved = resolver::resolve(state, cred, parent, ResolveFlags::NONE)?;
    if resolved.place == Resolution::FoundInRw {
        return Ok(state.rw_path(rel));
    }

    let mut ro_acc = state.ro_root().to_path_buf();
    let mut rw_acc = state.rw_root().to_path_buf();

    let _root = state.push_root();
    for comp in parent.components() {
        let Component::Normal(name) = comp else {
            continue;
        };
        ro_acc.push(name);
        rw_acc.push(name);
        paths::check_path_len(&rw_acc)?;

        if branch::exists(&rw_acc) {
            continue;
        }

        let meta = branch::lstat(&ro_acc)?;
        if let Err(e) = branch::mkdir(state, &rw_acc, meta.mode() & 0o7777) {
            // A concurrent copy-up materialised this component already.
            if e.raw_os_error() == Some(libc::EEXIST) {
                continue;
            }
            return Err(e);
        }

        let fill = AttrDelta {
            mode: None,
            uid: Some(meta.uid()),
            gid: Some(meta.gid()),
            atime: Some(timestamp(meta.atime(), meta.atime_nsec())),
            mtime: Some(timestamp(meta.mtime(), meta.mtime_nsec())),
            size: None,
        };
        if let Err(e) = branch::set_attr(state, &rw_acc, &fill) {
            let _ = branch::rmdir(state, &rw_acc);
            return Err(e);
        }
    }

    Ok(state.rw_path(rel))
}

/// Delete a copy-up. When the read-only original survives with
/// customised attributes, carry them over into a fresh sidecar so the
/// observable attributes do not snap back.
pub(crate) fn unlink_copyup(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
    copyup_path: &Path,
) -> io::Result<()> {
    let meta = branch::lstat(copyup_path)?;
    let saved = SidecarAttrs::from_metadata(&meta);

    {
        let _root = state.push_root();
        branch::unlink(state, copyup_path)?;
    }

    let ro_meta = match resolver::resolve(state, cred, rel, ResolveFlags::NONE) {
        Ok(resolved) => branch::lstat(&resolved.branch_path)?,
        // The original is gone as well; nothing to carry.
        Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => return Ok(()),
        Err(e) => return Err(e),
    };

    let unchanged = saved.mode == ro_meta.mode() & sidecar::PERM_MASK
        && saved.uid == ro_meta.uid()
        && saved.gid == ro_meta.gid();
    if unchanged {
        return Ok(());
    }

    let me_path = state.sidecar_path(rel)?;
    sidecar::create_sidecar(state, &me_path, &saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, MountState) {
        let tmp = tempdir().unwrap();
        let ro = tmp.path().join("ro");
        let rw = tmp.path().join("rw");
        fs::create_dir_all(&ro).unwrap();
        fs::create_dir_all(&rw).unwrap();
        (tmp, MountState::new(ro, rw))
    }

    #[test]
    fn test_copy_up_regular_file() {
        let (_tmp, state) = setup();
        let rel = Path::new("/f");
        fs::write(state.ro_path(rel), b"payload").unwrap();
        fs::set_permissions(state.ro_path(rel), fs::Permissions::from_mode(0o640)).unwrap();

        let rw_path = copy_up(&state, &Cred::current(), rel).unwrap();
        assert_eq!(rw_path, state.rw_path(rel));
        assert_eq!(fs::read(&rw_path).unwrap(), b"payload");
        assert_eq!(
            fs::metadata(&rw_path).unwrap().mode() & 0o7777,
            0o640
        );
        // The original is untouched.
        assert_eq!(fs::read(state.ro_path(rel)).unwrap(), b"payload");
    }

    #[test]
    fn test_copy_up_streams_large_file() {
        let (_tmp, state) = setup();
        let rel = Path::new("/big");
        let payload: Vec<u8> = (0..3 * COPY_BUF_LEN + 17).map(|i| i as u8).collect();
        fs::write(state.ro_path(rel), &payload).unwrap();

        copy_up(&state, &Cred::current(), rel).unwrap();
        assert_eq!(fs::read(state.rw_path(rel)).unwrap(), payload);
    }

    #[test]
    fn test_copy_up_symlink_keeps_target() {
        let (_tmp, state) = setup();
        let rel = Path::new("/link");
        std::os::unix::fs::symlink("some/target", state.ro_path(rel)).unwrap();

        copy_up(&state, &Cred::current(), rel).unwrap();
        let target = fs::read_link(state.rw_path(rel)).unwrap();
        assert_eq!(target, PathBuf::from("some/target"));
    }

    #[test]
    fn test_copy_up_directory_recurses() {
        let (_tmp, state) = setup();
        fs::create_dir_all(state.ro_path(Path::new("/d/sub"))).unwrap();
        fs::write(state.ro_path(Path::new("/d/a")), b"1").unwrap();
        fs::write(state.ro_path(Path::new("/d/sub/b")), b"2").unwrap();

        copy_up(&state, &Cred::current(), Path::new("/d")).unwrap();

        assert!(state.rw_path(Path::new("/d")).is_dir());
        assert_eq!(fs::read(state.rw_path(Path::new("/d/a"))).unwrap(), b"1");
        assert_eq!(fs::read(state.rw_path(Path::new("/d/sub/b"))).unwrap(), b"2");
    }

    #[test]
    fn test_copy_up_fifo() {
        let (_tmp, state) = setup();
        let rel = Path::new("/pipe");
        branch::mkfifo(&state_for_fixture(&state), &state.ro_path(rel), 0o600).unwrap();

        copy_up(&state, &Cred::current(), rel).unwrap();
        let meta = fs::symlink_metadata(state.rw_path(rel)).unwrap();
        assert_eq!(meta.mode() & libc::S_IFMT as u32, libc::S_IFIFO as u32);
    }

    // The write guard keys off the RO root; fixtures on the RO side are
    // staged through a state whose RO root points elsewhere.
    fn state_for_fixture(state: &MountState) -> MountState {
        MountState::new(PathBuf::from("/nonexistent"), state.ro_root().to_path_buf())
    }

    #[test]
    fn test_copy_up_retires_sidecar() {
        let (_tmp, state) = setup();
        let rel = Path::new("/f");
        fs::write(state.ro_path(rel), b"x").unwrap();

        sidecar::set_metadata(
            &state,
            &Cred::current(),
            rel,
            &state.ro_path(rel),
            &AttrDelta {
                mode: Some(0o600),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(sidecar::find_sidecar(&state, rel).unwrap().is_some());

        copy_up(&state, &Cred::current(), rel).unwrap();

        assert!(sidecar::find_sidecar(&state, rel).unwrap().is_none());
        // The replica took the sidecar's mode.
        assert_eq!(
            fs::metadata(state.rw_path(rel)).unwrap().mode() & 0o7777,
            0o600
        );
    }

    #[test]
    fn test_find_path_materialises_shallow_parents() {
        let (_tmp, state) = setup();
        fs::create_dir_all(state.ro_path(Path::new("/a/b"))).unwrap();
        fs::write(state.ro_path(Path::new("/a/sibling")), b"x").unwrap();
        fs::write(state.ro_path(Path::new("/a/b/f")), b"x").unwrap();

        let rw = find_path(&state, &Cred::current(), Path::new("/a/b/f")).unwrap();
        assert_eq!(rw, state.rw_path(Path::new("/a/b/f")));

        assert!(state.rw_path(Path::new("/a")).is_dir());
        assert!(state.rw_path(Path::new("/a/b")).is_dir());
        // Shallow: directory contents are not copied.
        assert!(!state.rw_path(Path::new("/a/sibling")).exists());
        // The target itself is not created either.
        assert!(!rw.exists());
    }

    #[test]
    fn test_unlink_copyup_restores_sidecar() {
        let (_tmp, state) = setup();
        let rel = Path::new("/f");
        fs::write(state.ro_path(rel), b"x").unwrap();
        fs::set_permissions(state.ro_path(rel), fs::Permissions::from_mode(0o644)).unwrap();

        let rw_path = copy_up(&state, &Cred::current(), rel).unwrap();
        // Customize the replica, then delete it.
        fs::set_permissions(&rw_path, fs::Permissions::from_mode(0o600)).unwrap();
        unlink_copyup(&state, &Cred::current(), rel, &rw_path).unwrap();

        assert!(!rw_path.exists());
        let (_, meta) = sidecar::find_sidecar(&state, rel).unwrap().unwrap();
        assert_eq!(meta.mode() & 0o7777, 0o600);
    }

    #[test]
    fn test_unlink_copyup_skips_sidecar_when_unchanged() {
        let (_tmp, state) = setup();
        let rel = Path::new("/f");
        fs::write(state.ro_path(rel), b"x").unwrap();
        fs::set_permissions(state.ro_path(rel), fs::Permissions::from_mode(0o644)).unwrap();

        let rw_path = copy_up(&state, &Cred::current(), rel).unwrap();
        unlink_copyup(&state, &Cred::current(), rel, &rw_path).unwrap();

        assert!(!rw_path.exists());
        assert!(sidecar::find_sidecar(&state, rel).unwrap().is_none());
    }
}
