//! Session configuration.
//!
//! An optional TOML file supplies defaults; command-line values override it.
//! The merged result is a [`SessionConfig`] built once and then only read.

use crate::filter::FilterRule;
use crate::providers::RemoteTarget;
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ENGINE: &str = "rsync";
pub const DEFAULT_REMOTE_USER: &str = "root";
pub const DEFAULT_TAG: &str = env!("CARGO_PKG_NAME");

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub destination: Option<PathBuf>,
    pub host_name: Option<String>,
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteConfig {
    pub host: String,
    pub user: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransferConfig {
    pub program: Option<String>,
    pub max_size: Option<String>,
    pub ionice: Option<bool>,
    pub strict: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilterConfig {
    #[serde(default)]
    pub extra: Vec<String>,
    /// Where the rule file is written. Defaults to the system temp directory.
    pub rules_dir: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub syslog: Option<bool>,
    pub tag: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Operator rules from `[filter] extra`.
    pub fn extra_rules(&self) -> Result<Vec<FilterRule>> {
        self.filter
            .extra
            .iter()
            .map(|r| r.parse::<FilterRule>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .context("Invalid rule in [filter] extra")
    }
}

/// Values given on the command line. `None`/`false` means "not given".
#[derive(Debug, Default, Clone)]
pub struct Overrides {
    pub destination: Option<PathBuf>,
    pub host_name: Option<String>,
    pub remote_host: Option<String>,
    pub remote_user: Option<String>,
    pub port: Option<u16>,
    pub prior: Option<PathBuf>,
    pub assume_yes: bool,
    pub dry_run: bool,
    pub max_size: Option<String>,
    pub strict: bool,
    pub no_syslog: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub destination: PathBuf,
    pub host_name: String,
    pub remote: Option<RemoteTarget>,
    pub prior: Option<PathBuf>,
    pub assume_yes: bool,
    pub dry_run: bool,
    pub max_size: Option<String>,
    pub engine: String,
    pub ionice: bool,
    pub strict: bool,
    pub extra_rules: Vec<FilterRule>,
    pub rules_dir: Option<PathBuf>,
    pub log_level: String,
    pub syslog: bool,
    pub log_tag: String,
}

impl SessionConfig {
    /// Merges file and command line. `system_host` is consulted only when
    /// neither names the host.
    pub fn merge(
        file: FileConfig,
        cli: Overrides,
        system_host: impl FnOnce() -> Result<String>,
    ) -> Result<Self> {
        let extra_rules = file.extra_rules()?;

        let Some(destination) = cli.destination.or(file.destination) else {
            bail!("no destination given (pass DESTINATION or set 'destination' in the config file)");
        };

        let host_name = match cli.host_name.or(file.host_name) {
            Some(h) => h,
            None => system_host()?,
        };
        if host_name.is_empty() || host_name.contains('/') {
            bail!("invalid host name '{}'", host_name);
        }

        let file_remote = file.remote;
        let remote_host = cli
            .remote_host
            .or_else(|| file_remote.as_ref().map(|r| r.host.clone()));
        let remote = remote_host.map(|host| RemoteTarget {
            host,
            port: cli
                .port
                .or_else(|| file_remote.as_ref().and_then(|r| r.port)),
            user: cli
                .remote_user
                .or_else(|| file_remote.as_ref().and_then(|r| r.user.clone()))
                .unwrap_or_else(|| DEFAULT_REMOTE_USER.to_string()),
        });

        Ok(Self {
            destination,
            host_name,
            remote,
            prior: cli.prior,
            assume_yes: cli.assume_yes,
            dry_run: cli.dry_run,
            max_size: cli.max_size.or(file.transfer.max_size),
            engine: file
                .transfer
                .program
                .unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
            ionice: file.transfer.ionice.unwrap_or(true),
            strict: cli.strict || file.transfer.strict.unwrap_or(false),
            extra_rules,
            rules_dir: file.filter.rules_dir,
            log_level: file.logging.level.unwrap_or_else(|| "info".to_string()),
            syslog: !cli.no_syslog && file.logging.syslog.unwrap_or(true),
            log_tag: file
                .logging
                .tag
                .unwrap_or_else(|| DEFAULT_TAG.to_string()),
        })
    }

    pub fn is_remote(&self) -> bool {
        self.remote.is_some()
    }
}

/// Host name of this machine.
pub fn system_host_name() -> Result<String> {
    let name = hostname::get().context("Failed to determine host name")?;
    name.into_string()
        .map_err(|n| anyhow::anyhow!("host name {:?} is not valid UTF-8", n))
}
