//! Fatal session errors and the process exit codes they map to.

use std::path::PathBuf;
use thiserror::Error;

/// Exit codes follow the BSD `sysexits.h` values, except `INTERRUPTED`.
pub mod exit {
    pub const OK: i32 = 0;
    pub const UNAVAILABLE: i32 = 69;
    pub const SOFTWARE: i32 = 70;
    pub const OSERR: i32 = 71;
    pub const CANTCREAT: i32 = 73;
    pub const IOERR: i32 = 74;
    pub const TEMPFAIL: i32 = 75;
    pub const NOPERM: i32 = 77;
    pub const CONFIG: i32 = 78;
    /// Shell convention for death by SIGINT; used for any termination signal.
    pub const INTERRUPTED: i32 = 130;
}

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("logging utility '{0}' not found on PATH")]
    LoggerUnavailable(String),

    #[error("destination root {} is not a writable directory", .0.display())]
    DestinationUnwritable(PathBuf),

    #[error("update of existing generation {} declined", .0.display())]
    Declined(PathBuf),

    #[error(transparent)]
    Create(#[from] CreateError),

    #[error(transparent)]
    Write(#[from] WriteError),

    #[error("failed to start transfer engine '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("transfer engine exited with status {code:?} for {}", .destination.display())]
    Transfer {
        code: Option<i32>,
        destination: PathBuf,
    },

    #[error("interrupted by {0}, transfer engine stopped")]
    Interrupted(&'static str),
}

impl BackupError {
    pub fn exit_code(&self) -> i32 {
        match self {
            BackupError::LoggerUnavailable(_) => exit::UNAVAILABLE,
            BackupError::DestinationUnwritable(_) => exit::NOPERM,
            BackupError::Declined(_) => exit::TEMPFAIL,
            BackupError::Create(_) => exit::CANTCREAT,
            BackupError::Write(_) => exit::IOERR,
            BackupError::Spawn { .. } => exit::OSERR,
            BackupError::Transfer { .. } => exit::SOFTWARE,
            BackupError::Interrupted(_) => exit::INTERRUPTED,
        }
    }
}

/// Creating a generation directory failed, locally or on the remote host.
#[derive(Error, Debug)]
pub enum CreateError {
    #[error("failed to create {}: {source}", .path.display())]
    Local {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("remote mkdir of {} failed (status {code:?}): {stderr}", .path.display())]
    Remote {
        path: PathBuf,
        code: Option<i32>,
        stderr: String,
    },

    #[error("failed to run remote shell for {}: {source}", .path.display())]
    Shell {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The filter rule file could not be written. `path` is the temporary
/// directory when the file itself could not be created.
#[derive(Error, Debug)]
#[error("failed to write filter rule file {}: {source}", .path.display())]
pub struct WriteError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

pub type Result<T> = std::result::Result<T, BackupError>;
