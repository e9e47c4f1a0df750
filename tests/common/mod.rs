use std::fs;
use std::path::Path;
use std::sync::Arc;

use mallorn::unionfs::mount::MountState;
use mallorn::unionfs::types::Cred;
use tempfile::TempDir;

/// Build an empty RO/RW branch pair inside a tempdir.
pub fn setup() -> (TempDir, Arc<MountState>) {
    let tmp = tempfile::tempdir().unwrap();
    let ro = tmp.path().join("ro");
    let rw = tmp.path().join("rw");
    fs::create_dir_all(&ro).unwrap();
    fs::create_dir_all(&rw).unwrap();
    (tmp, Arc::new(MountState::new(ro, rw)))
}

pub fn cred() -> Cred {
    Cred::current()
}

/// Write a fixture file on the read-only branch.
#[allow(dead_code)]
pub fn ro_file(state: &MountState, rel: &str, content: &[u8]) {
    let path = state.ro_path(Path::new(rel));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Write a fixture file on the read-write branch.
#[allow(dead_code)]
pub fn rw_file(state: &MountState, rel: &str, content: &[u8]) {
    let path = state.rw_path(Path::new(rel));
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

/// Set permission bits on a fixture path.
#[allow(dead_code)]
pub fn set_mode(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode)).unwrap();
}

/// Permission bits of a path.
#[allow(dead_code)]
pub fn mode_of(path: &Path) -> u32 {
    use std::os::unix::fs::MetadataExt;
    fs::symlink_metadata(path).unwrap().mode() & 0o7777
}
