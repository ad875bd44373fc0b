use manila_core::path::AbsDirPath;
use tempfile::TempDir;

pub mod fs;
pub mod scenarios;

/// A fresh temporary directory plus its handle, torn down on drop.
#[track_caller]
pub fn temporary_directory() -> (TempDir, AbsDirPath) {
    let dir = TempDir::new().expect("create temporary directory");
    let path = AbsDirPath::try_from(dir.path()).expect("read temp dir as abs dir");
    (dir, path)
}
