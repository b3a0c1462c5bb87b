//! Include/exclude rules handed to rsync.
//!
//! rsync applies the rules in order and the first match wins, so exclusions
//! that must hold everywhere come first and the list ends with a catch-all
//! exclude of every other top-level entry.

use crate::error::WriteError;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Include,
    Exclude,
}

impl Action {
    fn symbol(self) -> char {
        match self {
            Action::Include => '+',
            Action::Exclude => '-',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRule {
    pub action: Action,
    pub pattern: String,
}

impl FilterRule {
    pub fn include(pattern: &str) -> Self {
        Self {
            action: Action::Include,
            pattern: pattern.to_string(),
        }
    }

    pub fn exclude(pattern: &str) -> Self {
        Self {
            action: Action::Exclude,
            pattern: pattern.to_string(),
        }
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action.symbol(), self.pattern)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("invalid filter rule '{0}': expected '+ PATTERN' or '- PATTERN'")]
pub struct ParseRuleError(String);

impl FromStr for FilterRule {
    type Err = ParseRuleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseRuleError(s.to_string());
        let (action, pattern) = s.split_once(' ').ok_or_else(err)?;
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(err());
        }
        match action {
            "+" => Ok(FilterRule::include(pattern)),
            "-" => Ok(FilterRule::exclude(pattern)),
            _ => Err(err()),
        }
    }
}

/// The built-in capture set.
pub fn default_rules() -> Vec<FilterRule> {
    vec![
        // version control and caches, anywhere in the tree
        FilterRule::exclude(".git/"),
        FilterRule::exclude(".svn/"),
        FilterRule::exclude(".hg/"),
        FilterRule::exclude(".cache/"),
        // home directories, minus desktop trash
        FilterRule::exclude("/home/*/.local/share/Trash/"),
        FilterRule::include("/home/"),
        FilterRule::include("/home/**"),
        // mount points only, never the media behind them
        FilterRule::include("/media/"),
        FilterRule::include("/media/*/"),
        FilterRule::exclude("/media/*/*"),
        FilterRule::include("/etc/"),
        FilterRule::include("/etc/**"),
        FilterRule::include("/usr/"),
        FilterRule::include("/usr/local/"),
        FilterRule::include("/usr/local/**"),
        FilterRule::exclude("/usr/*"),
        FilterRule::include("/var/"),
        FilterRule::include("/var/**"),
        FilterRule::exclude("/*"),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRules {
    rules: Vec<FilterRule>,
}

impl Default for FilterRules {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

impl FilterRules {
    /// Built-in rules preceded by `extra`, which therefore take precedence.
    pub fn with_extra(extra: Vec<FilterRule>) -> Self {
        let mut rules = extra;
        rules.extend(default_rules());
        Self { rules }
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// Reads the rule file format back. Blank and `#` lines are skipped.
    pub fn parse(text: &str) -> Result<Self, ParseRuleError> {
        let rules = text
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::parse)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn render(&self) -> String {
        let mut out = String::from("# rsync filter rules written by hardlink-backup\n");
        for rule in &self.rules {
            out.push_str(&rule.to_string());
            out.push('\n');
        }
        out
    }

    /// Writes the rules to a fresh temporary file and returns its path.
    ///
    /// The file outlives this process; removing it is up to the caller.
    pub fn materialize(&self) -> Result<PathBuf, WriteError> {
        self.materialize_in(&std::env::temp_dir())
    }

    /// Like [`materialize`](Self::materialize), in `dir`.
    pub fn materialize_in(&self, dir: &Path) -> Result<PathBuf, WriteError> {
        let mut file = tempfile::Builder::new()
            .prefix("hardlink-backup-")
            .suffix(".rules")
            .tempfile_in(dir)
            .map_err(|source| WriteError {
                path: dir.to_path_buf(),
                source,
            })?;

        let path = file.path().to_path_buf();
        file.write_all(self.render().as_bytes())
            .and_then(|_| file.flush())
            .map_err(|source| WriteError {
                path: path.clone(),
                source,
            })?;

        file.keep().map(|(_, path)| path).map_err(|e| WriteError {
            path,
            source: e.error,
        })
    }
}
