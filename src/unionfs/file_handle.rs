use parking_lot::Mutex;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use super::readdir::UnionDirEntry;

/// An open file: a handle on the resolved branch file.
#[derive(Debug)]
pub(crate) struct FileHandle {
    pub file: Arc<Mutex<File>>,
}

/// An open directory. The union listing is materialised on the first
/// read and served positionally until the handle is released.
#[derive(Debug)]
pub(crate) struct DirHandle {
    pub rel: PathBuf,
    pub entries: Option<Vec<UnionDirEntry>>,
}
