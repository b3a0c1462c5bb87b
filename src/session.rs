//! One backup session: from destination checks to the finished transfer.

use crate::config::SessionConfig;
use crate::error::{BackupError, Result};
use crate::filter::FilterRules;
use crate::generation::Resolver;
use crate::providers::OperationProvider;
use crate::sink::{LogSink, Severity};
use crate::transfer::{InvocationBuilder, TransferEngine, TransferOutcome};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// Asks the operator a yes/no question.
#[async_trait]
pub trait Confirm: Send + Sync {
    async fn confirm(&self, question: &str) -> bool;
}

/// Prompts on stderr and reads the answer from stdin. End of input is "no".
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, question: &str) -> bool {
        let mut stderr = tokio::io::stderr();
        let prompt = format!("{question} [y/N] ");
        if stderr.write_all(prompt.as_bytes()).await.is_err() || stderr.flush().await.is_err() {
            return false;
        }

        let mut answer = String::new();
        match BufReader::new(tokio::io::stdin()).read_line(&mut answer).await {
            Ok(0) | Err(_) => false,
            Ok(_) => is_yes(&answer),
        }
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub today: PathBuf,
    pub prior: Option<PathBuf>,
    /// Whether today's generation already existed and was updated in place.
    pub updated: bool,
    pub rules_file: PathBuf,
    pub outcome: TransferOutcome,
}

pub struct Session<'a> {
    config: &'a SessionConfig,
    provider: &'a dyn OperationProvider,
    engine: &'a dyn TransferEngine,
    confirm: &'a dyn Confirm,
    sink: &'a dyn LogSink,
    date: NaiveDate,
    ionice: Option<PathBuf>,
}

impl<'a> Session<'a> {
    pub fn new(
        config: &'a SessionConfig,
        provider: &'a dyn OperationProvider,
        engine: &'a dyn TransferEngine,
        confirm: &'a dyn Confirm,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            config,
            provider,
            engine,
            confirm,
            sink,
            date: chrono::Local::now().date_naive(),
            ionice: None,
        }
    }

    /// Calendar date naming today's generation. Defaults to the local date.
    pub fn on(mut self, date: NaiveDate) -> Self {
        self.date = date;
        self
    }

    pub fn ionice(mut self, ionice: Option<PathBuf>) -> Self {
        self.ionice = ionice;
        self
    }

    fn fail(&self, err: BackupError) -> BackupError {
        self.sink.log(&err.to_string(), Severity::Error);
        err
    }

    pub async fn run(&self) -> Result<SessionReport> {
        let cfg = self.config;
        let root = &cfg.destination;

        // Remote roots are checked implicitly when the generation is created.
        if !cfg.is_remote() && !self.provider.dir_writable(root).await {
            return Err(self.fail(BackupError::DestinationUnwritable(root.clone())));
        }

        let resolution = Resolver::new(self.provider)
            .resolve(root, &cfg.host_name, self.date, cfg.prior.as_deref())
            .await;
        if let Some(disagreement) = &resolution.disagreement {
            self.sink.log(&disagreement.to_string(), Severity::Warning);
        }
        if let (Some(explicit), None) = (&cfg.prior, &resolution.prior) {
            self.sink.log(
                &format!(
                    "Prior generation {} has no usable directory name, falling back to a full copy",
                    explicit.display()
                ),
                Severity::Warning,
            );
        }
        let today = resolution.today;
        match &resolution.prior {
            Some(prior) => self.sink.log(
                &format!("Backing up to {} linked against {}", today.display(), prior.display()),
                Severity::Info,
            ),
            None => self.sink.log(
                &format!("Backing up to {} (no prior generation, full copy)", today.display()),
                Severity::Info,
            ),
        }

        let updated = self.provider.dir_writable(&today).await;
        if updated {
            if !cfg.assume_yes {
                let question = format!("Generation {} already exists. Update it?", today.display());
                if !self.confirm.confirm(&question).await {
                    return Err(self.fail(BackupError::Declined(today)));
                }
            }
            self.sink.log(
                &format!("Updating existing generation {}", today.display()),
                Severity::Info,
            );
        } else if cfg.dry_run {
            self.sink.log(
                &format!("Dry run, not creating {}", today.display()),
                Severity::Info,
            );
        } else if let Err(e) = self.provider.make_dir(&today).await {
            return Err(self.fail(e.into()));
        }

        let rules = FilterRules::with_extra(cfg.extra_rules.clone());
        let rules_file = match &cfg.rules_dir {
            Some(dir) => rules.materialize_in(dir),
            None => rules.materialize(),
        }
        .map_err(|e| self.fail(e.into()))?;

        let invocation = InvocationBuilder::new(&cfg.engine, &today)
            .remote(cfg.remote.as_ref())
            .link_dest(resolution.prior.as_deref())
            .rules_file(&rules_file)
            .max_size(cfg.max_size.as_deref())
            .dry_run(cfg.dry_run)
            .ionice(self.ionice.clone())
            .build();
        self.sink.log(
            &format!("Running {}", invocation.command_line()),
            Severity::Info,
        );

        let outcome = self
            .engine
            .run(&invocation, self.sink)
            .await
            .map_err(|e| self.fail(e))?;

        if outcome.success() {
            self.sink.log(
                &format!("Backup to {} completed", today.display()),
                Severity::Info,
            );
        } else {
            let err = BackupError::Transfer {
                code: outcome.code,
                destination: today.clone(),
            };
            if cfg.strict {
                return Err(self.fail(err));
            }
            self.sink.log(&err.to_string(), Severity::Error);
        }

        Ok(SessionReport {
            today,
            prior: resolution.prior,
            updated,
            rules_file,
            outcome,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yes_answers() {
        for a in ["y\n", "Y", " yes ", "YES\r\n"] {
            assert!(is_yes(a), "{a:?}");
        }
        for a in ["", "\n", "n", "no", "yep", "sure"] {
            assert!(!is_yes(a), "{a:?}");
        }
    }
}
