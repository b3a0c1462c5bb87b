use crate::error::CreateError;
use crate::generation::GenerationName;
use async_trait::async_trait;
use nix::unistd::{access, AccessFlags};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::SystemTime;
use tokio::process::Command;
use tracing::{debug, warn};

/// Filesystem operations the session needs at the destination.
///
/// Everything except `make_dir` is read-only and safe to repeat.
#[async_trait]
pub trait OperationProvider: Send + Sync {
    /// True iff `path` exists, is a directory and is writable by us.
    async fn dir_writable(&self, path: &Path) -> bool;
    /// Creates `path` and any missing parents.
    async fn make_dir(&self, path: &Path) -> Result<(), CreateError>;
    /// Generation directories for `host` under `root`, in both orderings.
    async fn list_generations(&self, root: &Path, host: &str) -> GenerationListing;
}

/// Existing generations, each ordering ascending: the last element is the most
/// recently modified (resp. the lexicographically greatest) directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GenerationListing {
    pub by_recency: Vec<PathBuf>,
    pub by_name: Vec<PathBuf>,
}

impl GenerationListing {
    pub fn is_empty(&self) -> bool {
        self.by_recency.is_empty() && self.by_name.is_empty()
    }
}

fn is_generation_of(path: &Path, host: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .and_then(|n| n.parse::<GenerationName>().ok())
        .map(|g| g.host == host)
        .unwrap_or(false)
}

// Direct filesystem access
pub struct LocalProvider;

#[async_trait]
impl OperationProvider for LocalProvider {
    async fn dir_writable(&self, path: &Path) -> bool {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => access(path, AccessFlags::W_OK).is_ok(),
            _ => false,
        }
    }

    async fn make_dir(&self, path: &Path) -> Result<(), CreateError> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|source| CreateError::Local {
                path: path.to_path_buf(),
                source,
            })
    }

    async fn list_generations(&self, root: &Path, host: &str) -> GenerationListing {
        let mut dir = match tokio::fs::read_dir(root).await {
            Ok(dir) => dir,
            Err(e) => {
                warn!("Failed to read {}: {}", root.display(), e);
                return GenerationListing::default();
            }
        };

        let mut found: Vec<(PathBuf, SystemTime)> = Vec::new();
        loop {
            let entry = match dir.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read directory entry in {}: {}", root.display(), e);
                    break;
                }
            };
            let path = entry.path();
            if !is_generation_of(&path, host) {
                continue;
            }
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_dir() {
                continue;
            }
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            found.push((path, modified));
        }

        let mut by_name: Vec<PathBuf> = found.iter().map(|(p, _)| p.clone()).collect();
        by_name.sort();

        found.sort_by(|(pa, ta), (pb, tb)| ta.cmp(tb).then_with(|| pa.cmp(pb)));
        let by_recency = found.into_iter().map(|(p, _)| p).collect();

        GenerationListing {
            by_recency,
            by_name,
        }
    }
}

/// Connection details for an ssh-reachable destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub host: String,
    pub port: Option<u16>,
    pub user: String,
}

impl RemoteTarget {
    /// Options shared by every ssh invocation, including the one rsync makes.
    pub fn ssh_options(&self) -> Vec<String> {
        let mut opts = vec![
            "-C".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-l".to_string(),
            self.user.clone(),
        ];
        if let Some(port) = self.port {
            opts.push("-p".to_string());
            opts.push(port.to_string());
        }
        opts
    }

    /// Remote shell command line for rsync's `-e`.
    pub fn remote_shell(&self) -> String {
        let mut cmd = vec!["ssh".to_string()];
        cmd.extend(self.ssh_options());
        cmd.join(" ")
    }

    /// `user@host:` prefix for rsync destinations.
    pub fn rsync_prefix(&self) -> String {
        format!("{}@{}:", self.user, self.host)
    }
}

/// Quotes a string for a POSIX shell.
pub fn sh_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

// Each operation is one ssh round trip
pub struct RemoteProvider {
    target: RemoteTarget,
    ssh: PathBuf,
}

struct RemoteOutput {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl RemoteOutput {
    fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl RemoteProvider {
    pub fn new(target: RemoteTarget) -> Self {
        Self {
            target,
            ssh: PathBuf::from("ssh"),
        }
    }

    /// Runs `ssh` instead of the `ssh` found on `PATH`.
    pub fn with_ssh(mut self, ssh: impl Into<PathBuf>) -> Self {
        self.ssh = ssh.into();
        self
    }

    pub fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// The full ssh argument vector for running `remote_cmd` on the target.
    pub fn ssh_args(&self, remote_cmd: &str) -> Vec<String> {
        let mut args = self.target.ssh_options();
        args.push(self.target.host.clone());
        args.push(remote_cmd.to_string());
        args
    }

    async fn run(&self, remote_cmd: &str) -> std::io::Result<RemoteOutput> {
        debug!("ssh {}: {}", self.target.host, remote_cmd);
        let output = Command::new(&self.ssh)
            .args(self.ssh_args(remote_cmd))
            .stdin(Stdio::null())
            .output()
            .await?;
        Ok(RemoteOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }

    async fn list(&self, pattern: &str, flags: &str, host: &str) -> Vec<PathBuf> {
        let cmd = format!("ls {} -- {}*", flags, sh_quote(pattern));
        match self.run(&cmd).await {
            Ok(out) if out.success() => out
                .stdout
                .lines()
                .map(|l| PathBuf::from(l.trim_end_matches('/')))
                .filter(|p| is_generation_of(p, host))
                .collect(),
            Ok(out) => {
                debug!(
                    "remote listing {} returned {:?}: {}",
                    pattern, out.code, out.stderr
                );
                Vec::new()
            }
            Err(e) => {
                warn!("Failed to run ssh to {}: {}", self.target.host, e);
                Vec::new()
            }
        }
    }
}

#[async_trait]
impl OperationProvider for RemoteProvider {
    async fn dir_writable(&self, path: &Path) -> bool {
        let p = sh_quote(&path.to_string_lossy());
        let cmd = format!("test -d {p} -a -w {p}");
        match self.run(&cmd).await {
            Ok(out) => out.success(),
            Err(e) => {
                warn!("Failed to run ssh to {}: {}", self.target.host, e);
                false
            }
        }
    }

    async fn make_dir(&self, path: &Path) -> Result<(), CreateError> {
        let cmd = format!("mkdir -p {}", sh_quote(&path.to_string_lossy()));
        let out = self.run(&cmd).await.map_err(|source| CreateError::Shell {
            path: path.to_path_buf(),
            source,
        })?;
        if out.success() {
            Ok(())
        } else {
            Err(CreateError::Remote {
                path: path.to_path_buf(),
                code: out.code,
                stderr: out.stderr,
            })
        }
    }

    async fn list_generations(&self, root: &Path, host: &str) -> GenerationListing {
        let pattern = format!(
            "{}/{}",
            root.to_string_lossy().trim_end_matches('/'),
            GenerationName::prefix(host)
        );
        let by_recency = self.list(&pattern, "-1dtr", host).await;
        let mut by_name = self.list(&pattern, "-1d", host).await;
        by_name.sort();
        GenerationListing {
            by_recency,
            by_name,
        }
    }
}

pub enum Provider {
    Local(LocalProvider),
    Remote(RemoteProvider),
}

impl Provider {
    pub fn for_destination(remote: Option<&RemoteTarget>) -> Self {
        match remote {
            Some(target) => Provider::Remote(RemoteProvider::new(target.clone())),
            None => Provider::Local(LocalProvider),
        }
    }

    pub fn remote(&self) -> Option<&RemoteTarget> {
        match self {
            Provider::Local(_) => None,
            Provider::Remote(p) => Some(p.target()),
        }
    }
}

#[async_trait]
impl OperationProvider for Provider {
    async fn dir_writable(&self, path: &Path) -> bool {
        match self {
            Provider::Local(p) => p.dir_writable(path).await,
            Provider::Remote(p) => p.dir_writable(path).await,
        }
    }

    async fn make_dir(&self, path: &Path) -> Result<(), CreateError> {
        match self {
            Provider::Local(p) => p.make_dir(path).await,
            Provider::Remote(p) => p.make_dir(path).await,
        }
    }

    async fn list_generations(&self, root: &Path, host: &str) -> GenerationListing {
        match self {
            Provider::Local(p) => p.list_generations(root, host).await,
            Provider::Remote(p) => p.list_generations(root, host).await,
        }
    }
}
