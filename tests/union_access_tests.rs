//! Permission checks evaluated against the merged view.

mod common;

use common::{cred, ro_file, set_mode, setup};
use mallorn::unionfs::ops;
use mallorn::unionfs::types::{AttrDelta, Cred};
use std::path::Path;

const R_OK: u32 = 4;
const W_OK: u32 = 2;
const X_OK: u32 = 1;

fn stranger() -> Cred {
    let me = Cred::current();
    Cred {
        uid: me.uid.wrapping_add(4242),
        gid: me.gid.wrapping_add(4242),
    }
}

#[test]
fn test_access_existence_probe() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"x");

    ops::access(&state, &cred(), Path::new("/f"), 0).unwrap();
    let err = ops::access(&state, &cred(), Path::new("/missing"), 0).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn test_access_other_triad_for_strangers() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"x");
    set_mode(&state.ro_path(Path::new("/f")), 0o640);

    let err = ops::access(&state, &stranger(), Path::new("/f"), R_OK).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));

    set_mode(&state.ro_path(Path::new("/f")), 0o644);
    ops::access(&state, &stranger(), Path::new("/f"), R_OK).unwrap();
    let err = ops::access(&state, &stranger(), Path::new("/f"), W_OK).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
}

#[test]
fn test_access_honours_sidecar_override() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"x");
    set_mode(&state.ro_path(Path::new("/f")), 0o600);

    // The stranger cannot read the file as the branch records it.
    let err = ops::access(&state, &stranger(), Path::new("/f"), R_OK).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));

    // Open it up through the sidecar; the merged view now grants read.
    ops::setattr(
        &state,
        &cred(),
        Path::new("/f"),
        &AttrDelta {
            mode: Some(0o644),
            ..Default::default()
        },
    )
    .unwrap();

    ops::access(&state, &stranger(), Path::new("/f"), R_OK).unwrap();
}

#[test]
fn test_root_cred_bypasses_triads_except_exec() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"x");
    set_mode(&state.ro_path(Path::new("/f")), 0o600);

    let root = Cred::root();
    ops::access(&state, &root, Path::new("/f"), R_OK | W_OK).unwrap();

    // Execute needs at least one x bit even for root.
    let err = ops::access(&state, &root, Path::new("/f"), X_OK).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));

    set_mode(&state.ro_path(Path::new("/f")), 0o100);
    ops::access(&state, &root, Path::new("/f"), X_OK).unwrap();
}

#[test]
fn test_resolution_requires_traversal_permission() {
    let (_tmp, state) = setup();
    ro_file(&state, "/locked/f", b"x");
    set_mode(&state.ro_path(Path::new("/locked")), 0o600);

    // A stranger cannot resolve beyond the untraversable directory.
    let err = ops::getattr(&state, &stranger(), Path::new("/locked/f")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));

    // Root may pass: directories keep an execute bit for the check.
    set_mode(&state.ro_path(Path::new("/locked")), 0o700);
    if Cred::current().is_root() {
        ops::getattr(&state, &Cred::current(), Path::new("/locked/f")).unwrap();
    }
}

#[test]
fn test_remove_denied_without_parent_write() {
    let (_tmp, state) = setup();
    ro_file(&state, "/d/f", b"x");
    set_mode(&state.ro_path(Path::new("/d")), 0o555);

    let err = ops::unlink(&state, &stranger(), Path::new("/d/f")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    // No whiteout was installed by the failed attempt.
    assert!(!state.rw_path(Path::new("/d")).exists());
}
