//! Generation naming and prior-generation discovery.
//!
//! A generation is the directory `BACKUP-<host>-<YYYY-MM-DD>` under the
//! destination root. Names sort chronologically, so the lexicographically last
//! generation before today's is normally the hard-link baseline. Directory
//! mtimes are consulted as a second opinion only.

use crate::providers::OperationProvider;
use chrono::NaiveDate;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::debug;

const PREFIX: &str = "BACKUP-";
const DATE_FORMAT: &str = "%Y-%m-%d";
const DATE_LEN: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationName {
    pub host: String,
    pub date: NaiveDate,
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("'{0}' is not a generation name")]
pub struct ParseGenerationError(String);

impl GenerationName {
    pub fn new(host: impl Into<String>, date: NaiveDate) -> Self {
        Self {
            host: host.into(),
            date,
        }
    }

    /// Leading part shared by all generations of `host`.
    pub fn prefix(host: &str) -> String {
        format!("{PREFIX}{host}-")
    }

    pub fn path_under(&self, root: &Path) -> PathBuf {
        root.join(self.to_string())
    }
}

impl fmt::Display for GenerationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{PREFIX}{}-{}", self.host, self.date.format(DATE_FORMAT))
    }
}

impl FromStr for GenerationName {
    type Err = ParseGenerationError;

    // Host names may contain '-', so the date is taken from the end.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseGenerationError(s.to_string());
        let rest = s.strip_prefix(PREFIX).ok_or_else(err)?;
        if rest.len() < DATE_LEN + 2 || !rest.is_char_boundary(rest.len() - DATE_LEN) {
            return Err(err());
        }
        let (head, date) = rest.split_at(rest.len() - DATE_LEN);
        let host = head.strip_suffix('-').ok_or_else(err)?;
        if host.is_empty() {
            return Err(err());
        }
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).map_err(|_| err())?;
        Ok(Self::new(host, date))
    }
}

/// Both candidates for the prior generation, when the orderings disagree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Disagreement {
    pub by_recency: PathBuf,
    pub by_name: PathBuf,
}

impl fmt::Display for Disagreement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "most recently modified generation {} differs from latest by name {}; using {} (pass --prior to override)",
            self.by_recency.display(),
            self.by_name.display(),
            self.by_name.display()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    /// Today's generation directory.
    pub today: PathBuf,
    /// Prior generation as `../<basename>`, or `None` for a full backup.
    pub prior: Option<PathBuf>,
    pub disagreement: Option<Disagreement>,
}

/// Rewrites a generation path relative to a sibling generation directory.
pub fn relative_to_sibling(path: &Path) -> Option<PathBuf> {
    let base = Path::new(path.as_os_str().to_str()?.trim_end_matches('/')).file_name()?;
    Some(Path::new("..").join(base))
}

pub struct Resolver<'a> {
    provider: &'a dyn OperationProvider,
}

impl<'a> Resolver<'a> {
    pub fn new(provider: &'a dyn OperationProvider) -> Self {
        Self { provider }
    }

    pub async fn resolve(
        &self,
        root: &Path,
        host: &str,
        date: NaiveDate,
        explicit_prior: Option<&Path>,
    ) -> Resolution {
        let today_name = GenerationName::new(host, date);
        let today = today_name.path_under(root);

        if let Some(prior) = explicit_prior {
            debug!("using explicit prior generation {}", prior.display());
            return Resolution {
                today,
                prior: relative_to_sibling(prior),
                disagreement: None,
            };
        }

        let listing = self.provider.list_generations(root, host).await;
        let today_str = today_name.to_string();
        let not_today = |p: &&PathBuf| {
            p.file_name()
                .map(|n| n.to_string_lossy() != today_str.as_str())
                .unwrap_or(false)
        };
        let by_recency = listing.by_recency.iter().filter(not_today).last().cloned();
        let by_name = listing.by_name.iter().filter(not_today).last().cloned();

        let (chosen, disagreement) = match (by_recency, by_name) {
            (None, None) => (None, None),
            (Some(r), None) => (Some(r), None),
            (None, Some(n)) => (Some(n), None),
            (Some(r), Some(n)) if r == n => (Some(n), None),
            (Some(r), Some(n)) => (
                Some(n.clone()),
                Some(Disagreement {
                    by_recency: r,
                    by_name: n,
                }),
            ),
        };

        Resolution {
            today,
            prior: chosen.as_deref().and_then(relative_to_sibling),
            disagreement,
        }
    }
}
