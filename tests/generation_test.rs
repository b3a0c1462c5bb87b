// Prior-generation discovery tests

use async_trait::async_trait;
use chrono::NaiveDate;
use hardlink_backup::error::CreateError;
use hardlink_backup::generation::{GenerationName, Resolver};
use hardlink_backup::providers::{GenerationListing, LocalProvider, OperationProvider};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct Listing(GenerationListing);

#[async_trait]
impl OperationProvider for Listing {
    async fn dir_writable(&self, _path: &Path) -> bool {
        true
    }

    async fn make_dir(&self, _path: &Path) -> Result<(), CreateError> {
        Ok(())
    }

    async fn list_generations(&self, _root: &Path, _host: &str) -> GenerationListing {
        self.0.clone()
    }
}

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn gens(names: &[&str]) -> Vec<PathBuf> {
    names
        .iter()
        .map(|n| Path::new("/backup").join(n))
        .collect()
}

/// Generation paths are formatted from root, host and date
#[tokio::test]
async fn test_today_path_format() {
    let provider = Listing(GenerationListing::default());
    for (host, day) in [("srv1", "2024-03-01"), ("web-02.lan", "1999-12-31")] {
        let res = Resolver::new(&provider)
            .resolve(Path::new("/backup"), host, date(day), None)
            .await;
        assert_eq!(res.today, PathBuf::from(format!("/backup/BACKUP-{host}-{day}")));

        let name = res.today.file_name().unwrap().to_str().unwrap();
        let parsed: GenerationName = name.parse().unwrap();
        assert_eq!(parsed.host, host);
        assert_eq!(parsed.date, date(day));
    }
}

/// No generations means no prior reference
#[tokio::test]
async fn test_no_prior_generation() {
    let provider = Listing(GenerationListing::default());
    let res = Resolver::new(&provider)
        .resolve(Path::new("/backup"), "srv1", date("2024-03-01"), None)
        .await;
    assert_eq!(res.prior, None);
    assert_eq!(res.disagreement, None);
}

/// Today's own generation is never its baseline
#[tokio::test]
async fn test_today_is_excluded() {
    let listing = gens(&["BACKUP-srv1-2024-03-01", "BACKUP-srv1-2024-03-02"]);
    let provider = Listing(GenerationListing {
        by_recency: listing.clone(),
        by_name: listing,
    });
    let res = Resolver::new(&provider)
        .resolve(Path::new("/backup"), "srv1", date("2024-03-02"), None)
        .await;
    assert_eq!(res.prior, Some(PathBuf::from("../BACKUP-srv1-2024-03-01")));

    let only_today = gens(&["BACKUP-srv1-2024-03-02"]);
    let provider = Listing(GenerationListing {
        by_recency: only_today.clone(),
        by_name: only_today,
    });
    let res = Resolver::new(&provider)
        .resolve(Path::new("/backup"), "srv1", date("2024-03-02"), None)
        .await;
    assert_eq!(res.prior, None);
}

/// Name order wins over mtime order, with the conflict reported
#[tokio::test]
async fn test_disagreement_prefers_name_order() {
    let provider = Listing(GenerationListing {
        by_recency: gens(&["BACKUP-srv1-2024-02-28", "BACKUP-srv1-2024-02-29", "BACKUP-srv1-2024-02-27"]),
        by_name: gens(&["BACKUP-srv1-2024-02-27", "BACKUP-srv1-2024-02-28", "BACKUP-srv1-2024-02-29"]),
    });
    let res = Resolver::new(&provider)
        .resolve(Path::new("/backup"), "srv1", date("2024-03-01"), None)
        .await;

    assert_eq!(res.prior, Some(PathBuf::from("../BACKUP-srv1-2024-02-29")));
    let d = res.disagreement.expect("orderings disagree");
    assert_eq!(d.by_recency, PathBuf::from("/backup/BACKUP-srv1-2024-02-27"));
    assert_eq!(d.by_name, PathBuf::from("/backup/BACKUP-srv1-2024-02-29"));
    let msg = d.to_string();
    assert!(msg.contains("BACKUP-srv1-2024-02-27"));
    assert!(msg.contains("BACKUP-srv1-2024-02-29"));
}

/// One empty ordering falls back to the other without a warning
#[tokio::test]
async fn test_single_ordering_available() {
    let provider = Listing(GenerationListing {
        by_recency: Vec::new(),
        by_name: gens(&["BACKUP-srv1-2024-02-29"]),
    });
    let res = Resolver::new(&provider)
        .resolve(Path::new("/backup"), "srv1", date("2024-03-01"), None)
        .await;
    assert_eq!(res.prior, Some(PathBuf::from("../BACKUP-srv1-2024-02-29")));
    assert_eq!(res.disagreement, None);
}

/// Explicit prior is rewritten relative to today's directory
#[tokio::test]
async fn test_explicit_prior_is_relative() {
    let provider = Listing(GenerationListing {
        by_recency: gens(&["BACKUP-srv1-2024-02-29"]),
        by_name: gens(&["BACKUP-srv1-2024-02-29"]),
    });
    let res = Resolver::new(&provider)
        .resolve(
            Path::new("/backup"),
            "srv1",
            date("2024-03-01"),
            Some(Path::new("/elsewhere/BACKUP-srv1-2024-01-01/")),
        )
        .await;
    let prior = res.prior.unwrap();
    assert_eq!(prior, PathBuf::from("../BACKUP-srv1-2024-01-01"));
    assert!(prior.is_relative());
}

fn set_mtime(dir: &Path, secs: u64) {
    let t = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
    fs::File::open(dir).unwrap().set_modified(t).unwrap();
}

/// End to end on disk: a touched old generation triggers the name-order policy
#[tokio::test]
async fn test_local_disagreement_on_disk() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path();
    for (name, secs) in [
        ("BACKUP-srv1-2024-02-27", 1_700_000_300),
        ("BACKUP-srv1-2024-02-28", 1_700_000_100),
        ("BACKUP-srv1-2024-02-29", 1_700_000_200),
    ] {
        let dir = root.join(name);
        fs::create_dir(&dir).unwrap();
        set_mtime(&dir, secs);
    }

    let res = Resolver::new(&LocalProvider)
        .resolve(root, "srv1", date("2024-03-01"), None)
        .await;

    assert_eq!(res.prior, Some(PathBuf::from("../BACKUP-srv1-2024-02-29")));
    let d = res.disagreement.unwrap();
    assert_eq!(d.by_recency, root.join("BACKUP-srv1-2024-02-27"));
}
