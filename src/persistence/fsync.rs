//! fsync helpers.
//!
//! A rename or a newly created file is only durable once its parent
//! directory entry is synced as well, so callers that create or rename
//! files pair [`fsync_file`] with [`fsync_dir`].

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

/// Flushes a file's data and metadata to disk.
pub fn fsync_file(file: &File) -> io::Result<()> {
    file.sync_all()
}

/// Flushes a directory's entries to disk.
///
/// Fails if `dir_path` does not exist.
pub fn fsync_dir(dir_path: &Path) -> io::Result<()> {
    OpenOptions::new().read(true).open(dir_path)?.sync_all()
}
