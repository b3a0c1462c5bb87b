// Local operation provider tests

use hardlink_backup::providers::{LocalProvider, OperationProvider};
use std::fs;
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Directories are writable, files and missing paths are not
#[tokio::test]
async fn test_dir_writable() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("file.txt");
    fs::write(&file, b"not a directory").unwrap();

    assert!(LocalProvider.dir_writable(temp_dir.path()).await);
    assert!(!LocalProvider.dir_writable(&file).await);
    assert!(!LocalProvider.dir_writable(&temp_dir.path().join("missing")).await);
}

/// make_dir creates missing parents and tolerates existing directories
#[tokio::test]
async fn test_make_dir() {
    let temp_dir = TempDir::new().unwrap();
    let nested = temp_dir.path().join("a/b/BACKUP-srv1-2024-03-01");

    LocalProvider.make_dir(&nested).await.unwrap();
    assert!(nested.is_dir());
    LocalProvider.make_dir(&nested).await.unwrap();
}

/// make_dir under a regular file fails with a create error
#[tokio::test]
async fn test_make_dir_failure() {
    let temp_dir = TempDir::new().unwrap();
    let file = temp_dir.path().join("blocker");
    fs::write(&file, b"").unwrap();

    assert!(LocalProvider.make_dir(&file.join("child")).await.is_err());
}

/// Only this host's generation directories are listed, in both orders
#[tokio::test]
async fn test_list_generations() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    let mtimes = [
        ("BACKUP-srv1-2024-03-02", 100),
        ("BACKUP-srv1-2024-03-01", 300),
        ("BACKUP-srv1-2024-02-15", 200),
    ];
    for (name, secs) in mtimes {
        let dir = root.join(name);
        fs::create_dir(&dir).unwrap();
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000 + secs);
        fs::File::open(&dir).unwrap().set_modified(t).unwrap();
    }
    // noise that must be ignored
    fs::create_dir(root.join("lost+found")).unwrap();
    fs::create_dir(root.join("BACKUP-srv1-extra-2024-03-05")).unwrap();
    fs::create_dir(root.join("BACKUP-other-2024-03-05")).unwrap();
    fs::write(root.join("BACKUP-srv1-2024-03-04"), b"a file").unwrap();

    let listing = LocalProvider.list_generations(root, "srv1").await;

    let names = |v: &Vec<std::path::PathBuf>| -> Vec<String> {
        v.iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().into_owned())
            .collect()
    };
    assert_eq!(
        names(&listing.by_name),
        vec![
            "BACKUP-srv1-2024-02-15",
            "BACKUP-srv1-2024-03-01",
            "BACKUP-srv1-2024-03-02",
        ]
    );
    assert_eq!(
        names(&listing.by_recency),
        vec![
            "BACKUP-srv1-2024-03-02",
            "BACKUP-srv1-2024-02-15",
            "BACKUP-srv1-2024-03-01",
        ]
    );
}

/// A missing root lists nothing instead of failing
#[tokio::test]
async fn test_list_missing_root() {
    let temp_dir = TempDir::new().unwrap();
    let listing = LocalProvider
        .list_generations(&temp_dir.path().join("nope"), "srv1")
        .await;
    assert!(listing.is_empty());
}
