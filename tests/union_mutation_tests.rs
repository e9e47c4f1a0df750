//! Mutation round-trips: create, unlink, mkdir, rmdir, link, setattr.

mod common;

use common::{cred, mode_of, ro_file, rw_file, setup};
use mallorn::unionfs::ops;
use mallorn::unionfs::types::AttrDelta;
use std::fs;
use std::io::{Read, Write};
use std::path::Path;

#[test]
fn test_mkdir_rmdir_round_trip_leaves_no_artifacts() {
    let (_tmp, state) = setup();

    ops::mkdir(&state, &cred(), Path::new("/fresh"), 0o755).unwrap();
    assert!(state.rw_path(Path::new("/fresh")).is_dir());

    ops::rmdir(&state, &cred(), Path::new("/fresh")).unwrap();

    assert!(!state.rw_path(Path::new("/fresh")).exists());
    assert!(!state.rw_path(Path::new("/")).join(".wh.fresh").exists());
}

#[test]
fn test_unlink_create_round_trip_on_rw_path() {
    let (_tmp, state) = setup();
    rw_file(&state, "/f", b"old");

    ops::unlink(&state, &cred(), Path::new("/f")).unwrap();
    // No read-only twin, so no whiteout.
    assert!(!state.rw_path(Path::new("/")).join(".wh.f").exists());

    let (attr, mut file) = ops::create(&state, &cred(), Path::new("/f"), 0o644).unwrap();
    file.write_all(b"new").unwrap();
    drop(file);

    assert_eq!(attr.kind, fuser::FileType::RegularFile);
    let attr = ops::getattr(&state, &cred(), Path::new("/f")).unwrap();
    assert_eq!(attr.size, 3);
    assert!(!state.rw_path(Path::new("/")).join(".wh.f").exists());
}

#[test]
fn test_setattr_then_write_round_trip() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"");
    common::set_mode(&state.ro_path(Path::new("/f")), 0o644);

    // Attribute change rides a sidecar.
    ops::setattr(
        &state,
        &cred(),
        Path::new("/f"),
        &AttrDelta {
            mode: Some(0o600),
            ..Default::default()
        },
    )
    .unwrap();
    let attr = ops::getattr(&state, &cred(), Path::new("/f")).unwrap();
    assert_eq!(attr.perm, 0o600);
    assert!(!state.rw_path(Path::new("/f")).exists());

    // Content change copies up and retires the sidecar.
    let mut file = ops::open(&state, &cred(), Path::new("/f"), libc::O_WRONLY).unwrap();
    file.write_all(b"x").unwrap();
    drop(file);

    assert!(!state.rw_path(Path::new("/")).join(".me.f").exists());
    assert_eq!(mode_of(&state.rw_path(Path::new("/f"))), 0o600);
}

#[test]
fn test_unlink_of_ro_file_in_nested_dir() {
    let (_tmp, state) = setup();
    ro_file(&state, "/a/b/f", b"x");

    ops::unlink(&state, &cred(), Path::new("/a/b/f")).unwrap();

    // The parent chain was materialised shallowly to hold the marker.
    assert!(state.rw_path(Path::new("/a/b")).is_dir());
    assert!(state.rw_path(Path::new("/a/b")).join(".wh.f").exists());

    let err = ops::getattr(&state, &cred(), Path::new("/a/b/f")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn test_unlink_rw_file_with_ro_twin_leaves_whiteout() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"ro");
    rw_file(&state, "/f", b"rw");

    ops::unlink(&state, &cred(), Path::new("/f")).unwrap();

    assert!(!state.rw_path(Path::new("/f")).exists());
    assert!(state.rw_path(Path::new("/")).join(".wh.f").exists());
    let err = ops::getattr(&state, &cred(), Path::new("/f")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn test_unlink_of_ro_file_removes_sidecar_too() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"x");

    ops::setattr(
        &state,
        &cred(),
        Path::new("/f"),
        &AttrDelta {
            mode: Some(0o600),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(state.rw_path(Path::new("/")).join(".me.f").exists());

    ops::unlink(&state, &cred(), Path::new("/f")).unwrap();

    assert!(!state.rw_path(Path::new("/")).join(".me.f").exists());
    assert!(state.rw_path(Path::new("/")).join(".wh.f").exists());
}

#[test]
fn test_rmdir_consumes_child_whiteouts() {
    let (_tmp, state) = setup();
    ro_file(&state, "/d/x", b"1");
    ro_file(&state, "/d/y", b"2");

    ops::unlink(&state, &cred(), Path::new("/d/x")).unwrap();
    ops::unlink(&state, &cred(), Path::new("/d/y")).unwrap();
    ops::rmdir(&state, &cred(), Path::new("/d")).unwrap();

    assert!(!state.rw_path(Path::new("/d")).exists());
    assert!(state.rw_path(Path::new("/")).join(".wh.d").exists());
    let err = ops::getattr(&state, &cred(), Path::new("/d")).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
}

#[test]
fn test_rmdir_of_ro_dir_drops_sidecar() {
    let (_tmp, state) = setup();
    // A directory resolved read-only with a sidecar: removing it must
    // drop the sidecar along with installing the whiteout.
    fs::create_dir_all(state.ro_path(Path::new("/d"))).unwrap();
    ops::setattr(
        &state,
        &cred(),
        Path::new("/d"),
        &AttrDelta {
            mode: Some(0o700),
            ..Default::default()
        },
    )
    .unwrap();
    assert!(state.rw_path(Path::new("/")).join(".me.d").exists());

    ops::rmdir(&state, &cred(), Path::new("/d")).unwrap();

    assert!(!state.rw_path(Path::new("/")).join(".me.d").exists());
    assert!(state.rw_path(Path::new("/")).join(".wh.d").exists());
}

#[test]
fn test_symlink_and_mknod_drop_stale_whiteouts() {
    let (_tmp, state) = setup();
    ro_file(&state, "/s", b"x");
    ro_file(&state, "/p", b"x");

    ops::unlink(&state, &cred(), Path::new("/s")).unwrap();
    ops::unlink(&state, &cred(), Path::new("/p")).unwrap();

    ops::symlink(&state, &cred(), Path::new("/s"), Path::new("elsewhere")).unwrap();
    ops::mknod(
        &state,
        &cred(),
        Path::new("/p"),
        libc::S_IFIFO as u32 | 0o600,
        0,
    )
    .unwrap();

    assert!(!state.rw_path(Path::new("/")).join(".wh.s").exists());
    assert!(!state.rw_path(Path::new("/")).join(".wh.p").exists());

    let attr = ops::getattr(&state, &cred(), Path::new("/s")).unwrap();
    assert_eq!(attr.kind, fuser::FileType::Symlink);
    let attr = ops::getattr(&state, &cred(), Path::new("/p")).unwrap();
    assert_eq!(attr.kind, fuser::FileType::NamedPipe);
}

#[test]
fn test_write_through_open_handle_updates_replica_only() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"original");

    let mut file = ops::open(&state, &cred(), Path::new("/f"), libc::O_RDWR).unwrap();
    let mut content = String::new();
    file.read_to_string(&mut content).unwrap();
    assert_eq!(content, "original");

    file.write_all(b"!").unwrap();
    drop(file);

    assert_eq!(fs::read(state.ro_path(Path::new("/f"))).unwrap(), b"original");
    assert_eq!(
        fs::read(state.rw_path(Path::new("/f"))).unwrap(),
        b"original!"
    );
}

#[test]
fn test_create_in_directory_that_exists_only_ro() {
    let (_tmp, state) = setup();
    fs::create_dir_all(state.ro_path(Path::new("/deep/nested"))).unwrap();

    let (_, file) = ops::create(&state, &cred(), Path::new("/deep/nested/new"), 0o644).unwrap();
    drop(file);

    assert!(state.rw_path(Path::new("/deep/nested/new")).exists());
    let attr = ops::getattr(&state, &cred(), Path::new("/deep/nested/new")).unwrap();
    assert_eq!(attr.size, 0);
}

#[test]
fn test_truncate_ro_entry() {
    let (_tmp, state) = setup();
    ro_file(&state, "/f", b"0123456789");

    ops::setattr(
        &state,
        &cred(),
        Path::new("/f"),
        &AttrDelta {
            size: Some(3),
            ..Default::default()
        },
    )
    .unwrap();

    // Content change: the replica carries the truncation, the original
    // is untouched, and no sidecar exists.
    assert_eq!(fs::read(state.rw_path(Path::new("/f"))).unwrap(), b"012");
    assert_eq!(
        fs::read(state.ro_path(Path::new("/f"))).unwrap(),
        b"0123456789"
    );
    assert!(!state.rw_path(Path::new("/")).join(".me.f").exists());
}

#[test]
fn test_link_between_rw_entries() {
    let (_tmp, state) = setup();
    rw_file(&state, "/src", b"shared");

    ops::link(&state, &cred(), Path::new("/src"), Path::new("/dst")).unwrap();

    use std::os::unix::fs::MetadataExt;
    let src = fs::metadata(state.rw_path(Path::new("/src"))).unwrap();
    let dst = fs::metadata(state.rw_path(Path::new("/dst"))).unwrap();
    assert_eq!(src.ino(), dst.ino());
    assert_eq!(src.nlink(), 2);
}

#[test]
fn test_operations_reject_reserved_prefixes() {
    let (_tmp, state) = setup();
    ro_file(&state, "/real", b"x");

    let err = ops::link(&state, &cred(), Path::new("/real"), Path::new("/.wh.real"))
        .unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));

    let err = ops::mknod(&state, &cred(), Path::new("/.me.node"), 0o644, 0).unwrap_err();
    assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
}
