//! The rsync invocation: how it is assembled and how it is run.

use crate::error::BackupError;
use crate::providers::RemoteTarget;
use crate::sink::{LogSink, Severity};
use async_trait::async_trait;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::signal::unix::{signal, SignalKind};
use tracing::warn;

pub const SOURCE_ROOT: &str = "/";

/// Archive mode plus hard links, ACLs and extended attributes.
const PRESERVE_FLAGS: [&str; 5] = ["-a", "-H", "-A", "-X", "--numeric-ids"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
}

impl Invocation {
    /// Program and arguments as one line, for the audit log.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.program.clone()];
        parts.extend(self.args.iter().cloned());
        parts.join(" ")
    }

    pub fn has_arg(&self, prefix: &str) -> bool {
        self.args.iter().any(|a| a.starts_with(prefix))
    }
}

#[derive(Debug, Clone)]
pub struct InvocationBuilder {
    engine: String,
    destination: PathBuf,
    remote: Option<RemoteTarget>,
    link_dest: Option<PathBuf>,
    rules_file: Option<PathBuf>,
    max_size: Option<String>,
    dry_run: bool,
    ionice: Option<PathBuf>,
}

impl InvocationBuilder {
    pub fn new(engine: &str, destination: &Path) -> Self {
        Self {
            engine: engine.to_string(),
            destination: destination.to_path_buf(),
            remote: None,
            link_dest: None,
            rules_file: None,
            max_size: None,
            dry_run: false,
            ionice: None,
        }
    }

    pub fn remote(mut self, remote: Option<&RemoteTarget>) -> Self {
        self.remote = remote.cloned();
        self
    }

    pub fn link_dest(mut self, prior: Option<&Path>) -> Self {
        self.link_dest = prior.map(Path::to_path_buf);
        self
    }

    pub fn rules_file(mut self, path: &Path) -> Self {
        self.rules_file = Some(path.to_path_buf());
        self
    }

    pub fn max_size(mut self, size: Option<&str>) -> Self {
        self.max_size = size.map(str::to_string);
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Runs the engine under `ionice -c3` when given the path to ionice.
    pub fn ionice(mut self, ionice: Option<PathBuf>) -> Self {
        self.ionice = ionice;
        self
    }

    /// Destination with exactly one trailing separator, prefixed with
    /// `user@host:` for remote targets.
    fn destination_arg(&self) -> String {
        let path = self.destination.to_string_lossy();
        let trimmed = path.trim_end_matches('/');
        let prefix = self
            .remote
            .as_ref()
            .map(RemoteTarget::rsync_prefix)
            .unwrap_or_default();
        format!("{prefix}{trimmed}/")
    }

    pub fn build(self) -> Invocation {
        let mut args: Vec<String> = Vec::new();
        let program = match &self.ionice {
            Some(ionice) => {
                args.push("-c3".to_string());
                args.push(self.engine.clone());
                ionice.to_string_lossy().into_owned()
            }
            None => self.engine.clone(),
        };

        args.extend(PRESERVE_FLAGS.iter().map(|f| f.to_string()));
        if let Some(remote) = &self.remote {
            args.push("-e".to_string());
            args.push(remote.remote_shell());
        }
        if let Some(rules) = &self.rules_file {
            args.push(format!("--filter=merge {}", rules.display()));
        }
        if let Some(prior) = &self.link_dest {
            args.push(format!("--link-dest={}", prior.display()));
        }
        if let Some(size) = &self.max_size {
            args.push(format!("--max-size={size}"));
        }
        if self.dry_run {
            args.push("--dry-run".to_string());
        }
        args.push(SOURCE_ROOT.to_string());
        args.push(self.destination_arg());

        Invocation { program, args }
    }
}

/// `ionice` on PATH, if any.
pub fn find_ionice() -> Option<PathBuf> {
    which::which("ionice").ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub code: Option<i32>,
}

impl TransferOutcome {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for TransferOutcome {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    async fn run(
        &self,
        invocation: &Invocation,
        sink: &dyn LogSink,
    ) -> Result<TransferOutcome, BackupError>;
}

/// Resolves with the signal's name once the process is told to stop:
/// SIGTERM, SIGINT or SIGHUP.
pub async fn termination() -> &'static str {
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
        signal(SignalKind::hangup()),
    ) {
        (Ok(mut term), Ok(mut int), Ok(mut hup)) => tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = hup.recv() => "SIGHUP",
        },
        _ => {
            warn!("Failed to install signal handlers, the transfer engine will not be stopped on termination");
            std::future::pending().await
        }
    }
}

async fn forward_and_wait(child: &mut Child, sink: &dyn LogSink) -> std::io::Result<ExitStatus> {
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => sink.log(&line, Severity::Error),
                Ok(None) => break,
                Err(e) => {
                    sink.log(
                        &format!("Failed to read transfer engine output: {e}"),
                        Severity::Error,
                    );
                    break;
                }
            }
        }
    }
    child.wait().await
}

/// Runs the invocation as a child process. Stdout is discarded; every stderr
/// line goes to the sink at error severity.
///
/// The child never outlives the run: dropping the future kills it, and so
/// does a termination signal, after which the child is reaped and
/// [`BackupError::Interrupted`] is returned.
pub struct ProcessEngine;

impl ProcessEngine {
    /// Like [`TransferEngine::run`], but stops the child when `stop` resolves
    /// instead of on a termination signal.
    pub async fn run_until<F>(
        &self,
        invocation: &Invocation,
        sink: &dyn LogSink,
        stop: F,
    ) -> Result<TransferOutcome, BackupError>
    where
        F: Future<Output = &'static str> + Send,
    {
        let spawn_err = |source| BackupError::Spawn {
            program: invocation.program.clone(),
            source,
        };

        let mut child = Command::new(&invocation.program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(spawn_err)?;

        let received = tokio::select! {
            status = forward_and_wait(&mut child, sink) => {
                return status.map(TransferOutcome::from).map_err(spawn_err);
            }
            received = stop => received,
        };

        sink.log(
            &format!("Received {received}, stopping {}", invocation.program),
            Severity::Error,
        );
        if let Err(e) = child.kill().await {
            sink.log(
                &format!("Failed to stop {}: {e}", invocation.program),
                Severity::Error,
            );
        }
        Err(BackupError::Interrupted(received))
    }
}

#[async_trait]
impl TransferEngine for ProcessEngine {
    async fn run(
        &self,
        invocation: &Invocation,
        sink: &dyn LogSink,
    ) -> Result<TransferOutcome, BackupError> {
        self.run_until(invocation, sink, termination()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn destination_gets_single_trailing_slash() {
        for dest in ["/backup/BACKUP-a-2024-01-01", "/backup/BACKUP-a-2024-01-01//"] {
            let inv = InvocationBuilder::new("rsync", Path::new(dest)).build();
            assert_eq!(
                inv.args.last().map(String::as_str),
                Some("/backup/BACKUP-a-2024-01-01/")
            );
        }
    }

    #[test]
    fn source_root_precedes_destination() {
        let inv = InvocationBuilder::new("rsync", Path::new("/b/x")).build();
        let n = inv.args.len();
        assert_eq!(inv.args[n - 2], SOURCE_ROOT);
    }

    #[test]
    fn ionice_wraps_engine() {
        let inv = InvocationBuilder::new("rsync", Path::new("/b/x"))
            .ionice(Some(PathBuf::from("/usr/bin/ionice")))
            .build();
        assert_eq!(inv.program, "/usr/bin/ionice");
        assert_eq!(&inv.args[..2], &["-c3".to_string(), "rsync".to_string()]);
    }

    #[test]
    fn optional_flags() {
        let inv = InvocationBuilder::new("rsync", Path::new("/b/x"))
            .max_size(Some("2G"))
            .dry_run(true)
            .build();
        assert!(inv.args.contains(&"--max-size=2G".to_string()));
        assert!(inv.args.contains(&"--dry-run".to_string()));
        assert!(!inv.has_arg("--link-dest"));
        assert!(!inv.has_arg("-e"));
    }

    #[test]
    fn remote_destination_uses_ssh() {
        let remote = RemoteTarget {
            host: "vault".to_string(),
            port: Some(2222),
            user: "backup".to_string(),
        };
        let inv = InvocationBuilder::new("rsync", Path::new("/srv/b/BACKUP-a-2024-01-01"))
            .remote(Some(&remote))
            .link_dest(Some(Path::new("../BACKUP-a-2023-12-31")))
            .build();
        assert_eq!(
            inv.args.last().map(String::as_str),
            Some("backup@vault:/srv/b/BACKUP-a-2024-01-01/")
        );
        let e = inv.args.iter().position(|a| a == "-e").unwrap();
        assert_eq!(inv.args[e + 1], remote.remote_shell());
        assert!(inv
            .args
            .contains(&"--link-dest=../BACKUP-a-2023-12-31".to_string()));
    }
}
