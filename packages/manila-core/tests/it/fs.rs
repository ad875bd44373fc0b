use manila_core::{
    fs,
    path::{AbsFilePath, TryJoinWith as _},
};
use pretty_assertions::assert_eq;

use crate::temporary_directory;

#[test_log::test(tokio::test)]
async fn lock_file_guards_the_cache_root_for_the_run() {
    let (_dir, root) = temporary_directory();
    let lock_path = root.as_std_path().join("cache.json.lock");
    let lock_path = AbsFilePath::try_from(lock_path).unwrap();

    let unlocked = fs::LockFile::open(lock_path).await.unwrap();
    let locked = unlocked.lock().await.unwrap();
    locked.unlock().await.unwrap();
}

#[test_log::test(tokio::test)]
async fn create_dir_all_then_remove_dir_all_round_trips() {
    let (_dir, root) = temporary_directory();
    let nested = root.try_join_dirs(["a", "b", "c"]).unwrap();

    fs::create_dir_all(&nested).await.unwrap();
    assert!(fs::is_dir(nested.as_std_path()).await);

    fs::remove_dir_all(&root).await.unwrap();
    assert!(!fs::exists(nested.as_std_path()).await);
}

#[test_log::test(tokio::test)]
async fn read_buffered_distinguishes_missing_from_present() {
    let (dir, root) = temporary_directory();
    let missing = AbsFilePath::try_from(root.as_std_path().join("missing.json")).unwrap();
    assert_eq!(fs::read_buffered(&missing).await.unwrap(), None);

    let present = dir.path().join("present.json");
    std::fs::write(&present, b"{}").unwrap();
    let present = AbsFilePath::try_from(present).unwrap();
    assert_eq!(fs::read_buffered(&present).await.unwrap(), Some(b"{}".to_vec()));
}
