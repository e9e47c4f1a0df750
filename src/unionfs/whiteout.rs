//! Whiteouts: simulated deletion of read-only entries.
//!
//! A whiteout for `foo` is a zero-length, root-owned file named
//! `.wh.foo` in the matching read-write directory. Its mere existence
//! asserts that the entry is deleted from the union even though the
//! read-only branch still holds it; deleting the whiteout recovers the
//! entry.

use std::io;
use std::path::{Path, PathBuf};

use super::branch;
use super::cow;
use super::mount::MountState;
use super::paths::{self, errno};
use super::types::Cred;

/// Mode of a whiteout marker file.
const WHITEOUT_MODE: u32 = 0o400;

/// Locate the whiteout hiding `rel`, if any.
///
/// The union root cannot be whited out; that case reads as not-found.
pub(crate) fn find_whiteout(state: &MountState, rel: &Path) -> io::Result<Option<PathBuf>> {
    let wh_path = match state.whiteout_path(rel) {
        Ok(p) => p,
        Err(ref e) if e.raw_os_error() == Some(libc::EINVAL) => return Ok(None),
        Err(e) => return Err(e),
    };

    if branch::exists(&wh_path) {
        Ok(Some(wh_path))
    } else {
        Ok(None)
    }
}

/// Create the marker file itself: zero length, mode 0400, owned by root
/// when the process holds the privilege.
fn create_whiteout_worker(state: &MountState, wh_path: &Path) -> io::Result<()> {
    let _root = state.push_root();

    branch::create_excl(state, wh_path, WHITEOUT_MODE)?;

    // The on-disk contract gives markers to root; without the privilege
    // the escalation primitive is inert and the marker keeps the
    // daemon's identity.
    if unsafe { libc::geteuid() } == 0 {
        if let Err(e) = branch::chown(state, wh_path, 0, 0) {
            let _ = branch::unlink(state, wh_path);
            return Err(e);
        }
    }

    Ok(())
}

/// Delete `rel` from the union by whiteout. Materialises the read-write
/// parent chain first.
pub(crate) fn create_whiteout(
    state: &MountState,
    cred: &Cred,
    rel: &Path,
) -> io::Result<PathBuf> {
    let wh_path = state.whiteout_path(rel)?;

    cow::find_path(state, cred, rel)?;

    create_whiteout_worker(state, &wh_path)?;
    Ok(wh_path)
}

/// Remove the whiteout hiding `rel`. Succeeds silently when none exists.
pub(crate) fn unlink_whiteout(state: &MountState, rel: &Path) -> io::Result<()> {
    match find_whiteout(state, rel)? {
        Some(wh_path) => {
            let _root = state.push_root();
            branch::unlink(state, &wh_path)
        }
        None => Ok(()),
    }
}

/// Install a whiteout for every entry of the read-only directory at
/// `rel`, hiding its contents from the union. Used when a fresh
/// directory is created over a pre-existing read-only one.
///
/// A missing read-only directory is a success: there is nothing to hide.
pub(crate) fn hide_directory_contents(state: &MountState, rel: &Path) -> io::Result<()> {
    let ro_dir = state.ro_path(rel);
    paths::check_path_len(&ro_dir)?;

    match branch::lstat(&ro_dir) {
        Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
        Ok(_) => {}
    }

    let rw_dir = state.rw_path(rel);
    paths::check_path_len(&rw_dir)?;

    for entry in branch::read_dir(&ro_dir)? {
        let name = entry.file_name();
        if paths::is_special_name(&name) {
            continue;
        }
        let wh_path = rw_dir.join(paths::whiteout_name(&name));
        paths::check_path_len(&wh_path)?;
        create_whiteout_worker(state, &wh_path)?;
    }

    Ok(())
}

/// Union emptiness test for `rmdir`.
///
/// The directory is empty in the union iff every read-only entry is
/// whited out and the read-write directory holds nothing but whiteouts.
/// Once both halves pass, the matching whiteouts are deleted in the same
/// pass so the `rmdir` that follows finds a truly empty directory.
pub(crate) fn is_empty_dir(
    state: &MountState,
    rel: &Path,
    ro_dir: Option<&Path>,
    rw_dir: Option<&Path>,
) -> io::Result<()> {
    if let Some(ro_dir) = ro_dir {
        for entry in branch::read_dir(ro_dir)? {
            let name = entry.file_name();
            if paths::is_special_name(&name) {
                continue;
            }
            if find_whiteout(state, &rel.join(&name))?.is_none() {
                return Err(errno(libc::ENOTEMPTY));
            }
        }
    }

    if let Some(rw_dir) = rw_dir {
        let entries = branch::read_dir(rw_dir)?;
        for entry in &entries {
            let name = entry.file_name();
            if paths::is_special_name(&name) || paths::is_whiteout_name(&name) {
                continue;
            }
            return Err(errno(libc::ENOTEMPTY));
        }

        // Both halves passed: consume the whiteouts.
        let _root = state.push_root();
        for entry in entries {
            let name = entry.file_name();
            if paths::is_whiteout_name(&name) {
                branch::unlink(state, &rw_dir.join(name))?;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::MetadataExt;
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
    fn test_create_and_find_whiteout() {
        let (_tmp, state) = setup();
        let rel = Path::new("/gone.txt");
        fs::write(state.ro_path(rel), b"x").unwrap();

        assert!(find_whiteout(&state, rel).unwrap().is_none());

        let wh_path = create_whiteout(&state, &Cred::current(), rel).unwrap();
        assert_eq!(wh_path, state.rw_path(Path::new("/")).join(".wh.gone.txt"));

        let meta = fs::metadata(&wh_path).unwrap();
        assert_eq!(meta.len(), 0);
        assert_eq!(meta.mode() & 0o7777, 0o400);
        if unsafe { libc::geteuid() } == 0 {
            assert_eq!(meta.uid(), 0);
            assert_eq!(meta.gid(), 0);
        }

        assert!(find_whiteout(&state, rel).unwrap().is_some());
    }

    #[test]
    fn test_whiteout_materialises_parents() {
        let (_tmp, state) = setup();
        fs::create_dir_all(state.ro_path(Path::new("/a/b"))).unwrap();
        fs::write(state.ro_path(Path::new("/a/b/f")), b"x").unwrap();

        create_whiteout(&state, &Cred::current(), Path::new("/a/b/f")).unwrap();

        assert!(state.rw_path(Path::new("/a/b")).is_dir());
        assert!(state.rw_path(Path::new("/a/b")).join(".wh.f").exists());
    }

    #[test]
    fn test_unlink_whiteout_is_silent_when_absent() {
        let (_tmp, state) = setup();
        assert!(unlink_whiteout(&state, Path::new("/nothing")).is_ok());
    }

    #[test]
    fn test_unlink_whiteout_removes_marker() {
        let (_tmp, state) = setup();
        let rel = Path::new("/f");
        fs::write(state.ro_path(rel), b"x").unwrap();
        create_whiteout(&state, &Cred::current(), rel).unwrap();

        unlink_whiteout(&state, rel).unwrap();
        assert!(find_whiteout(&state, rel).unwrap().is_none());
    }

    #[test]
    fn test_hide_directory_contents() {
        let (_tmp, state) = setup();
        let rel = Path::new("/d");
        fs::create_dir_all(state.ro_path(rel)).unwrap();
        fs::write(state.ro_path(rel).join("x"), b"1").unwrap();
        fs::write(state.ro_path(rel).join("y"), b"2").unwrap();
        fs::create_dir_all(state.rw_path(rel)).unwrap();

        hide_directory_contents(&state, rel).unwrap();

        assert!(state.rw_path(rel).join(".wh.x").exists());
        assert!(state.rw_path(rel).join(".wh.y").exists());
    }

    #[test]
    fn test_hide_contents_of_missing_ro_dir_is_ok() {
        let (_tmp, state) = setup();
        assert!(hide_directory_contents(&state, Path::new("/no-such-dir")).is_ok());
    }

    #[test]
    fn test_is_empty_dir_requires_whiteouts() {
        let (_tmp, state) = setup();
        let rel = Path::new("/d");
        let ro_dir = state.ro_path(rel);
        fs::create_dir_all(&ro_dir).unwrap();
        fs::write(ro_dir.join("x"), b"1").unwrap();

        // Not whited out: non-empty.
        let err = is_empty_dir(&state, rel, Some(&ro_dir), None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));

        // Whiteout installed: empty.
        let rw_dir = state.rw_path(rel);
        fs::create_dir_all(&rw_dir).unwrap();
        fs::File::create(rw_dir.join(".wh.x")).unwrap();
        is_empty_dir(&state, rel, Some(&ro_dir), None).unwrap();
    }

    #[test]
    fn test_is_empty_dir_consumes_whiteouts() {
        let (_tmp, state) = setup();
        let rel = Path::new("/d");
        let ro_dir = state.ro_path(rel);
        let rw_dir = state.rw_path(rel);
        fs::create_dir_all(&ro_dir).unwrap();
        fs::create_dir_all(&rw_dir).unwrap();
        fs::write(ro_dir.join("x"), b"1").unwrap();
        fs::File::create(rw_dir.join(".wh.x")).unwrap();

        is_empty_dir(&state, rel, Some(&ro_dir), Some(&rw_dir)).unwrap();

        // The matching whiteout was deleted in the same pass.
        assert!(!rw_dir.join(".wh.x").exists());
    }

    #[test]
    fn test_is_empty_dir_rejects_rw_content() {
        let (_tmp, state) = setup();
        let rel = Path::new("/d");
        let rw_dir = state.rw_path(rel);
        fs::create_dir_all(&rw_dir).unwrap();
        fs::write(rw_dir.join("kept"), b"1").unwrap();

        let err = is_empty_dir(&state, rel, None, Some(&rw_dir)).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTEMPTY));
    }
}
