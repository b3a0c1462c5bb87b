//! Severity-tagged log sink.
//!
//! Orchestrator messages and the transfer engine's error stream end up here.
//! The production sink feeds messages to the system `logger` utility so they
//! land in syslog under the configured tag, and mirrors them to `tracing`.

use crate::error::BackupError;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl Severity {
    /// Priority suffix understood by `logger -p`.
    pub fn syslog_level(self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "err",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        })
    }
}

pub trait LogSink: Send + Sync {
    fn log(&self, message: &str, severity: Severity);
}

fn trace(message: &str, severity: Severity) {
    match severity {
        Severity::Info => info!("{}", message),
        Severity::Warning => warn!("{}", message),
        Severity::Error => error!("{}", message),
    }
}

/// Writes to `tracing` only.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, message: &str, severity: Severity) {
        trace(message, severity);
    }
}

/// Forwards messages to syslog through `logger -t <tag> -p user.<level>`.
///
/// One `logger` process is started per severity on first use and fed one
/// message per line on its stdin, so a chatty transfer engine costs a pipe
/// write per line. The processes are closed and reaped on drop.
#[derive(Debug)]
pub struct SyslogSink {
    logger: PathBuf,
    tag: String,
    streams: Mutex<HashMap<Severity, Child>>,
}

impl SyslogSink {
    /// Locates `logger` on `PATH`. Its absence is the "missing logging
    /// capability" precondition failure.
    pub fn new(tag: &str) -> Result<Self, BackupError> {
        let logger = which::which("logger")
            .map_err(|_| BackupError::LoggerUnavailable("logger".to_string()))?;
        Ok(Self::with_logger(logger, tag))
    }

    /// Uses `logger` as the syslog client instead of searching `PATH`.
    pub fn with_logger(logger: impl Into<PathBuf>, tag: &str) -> Self {
        Self {
            logger: logger.into(),
            tag: tag.to_string(),
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn spawn(&self, severity: Severity) -> std::io::Result<Child> {
        Command::new(&self.logger)
            .arg("-t")
            .arg(&self.tag)
            .arg("-p")
            .arg(format!("user.{}", severity.syslog_level()))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }

    fn send(&self, message: &str, severity: Severity) -> std::io::Result<()> {
        let mut streams = self
            .streams
            .lock()
            .map_err(|_| std::io::Error::new(std::io::ErrorKind::Other, "syslog sink poisoned"))?;
        let child = match streams.entry(severity) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert(self.spawn(severity)?),
        };

        let line = format!("{}\n", message.replace('\n', " "));
        let written = match child.stdin.as_mut() {
            Some(stdin) => stdin.write_all(line.as_bytes()).and_then(|_| stdin.flush()),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "logger stdin closed",
            )),
        };
        if written.is_err() {
            // restarted on the next message
            if let Some(mut dead) = streams.remove(&severity) {
                let _ = dead.kill();
                let _ = dead.wait();
            }
        }
        written
    }
}

impl LogSink for SyslogSink {
    fn log(&self, message: &str, severity: Severity) {
        trace(message, severity);
        if let Err(e) = self.send(message, severity) {
            warn!("Failed to pass message to {}: {}", self.logger.display(), e);
        }
    }
}

impl Drop for SyslogSink {
    fn drop(&mut self) {
        let streams = match self.streams.get_mut() {
            Ok(streams) => streams,
            Err(poisoned) => poisoned.into_inner(),
        };
        for (_, mut child) in streams.drain() {
            drop(child.stdin.take());
            if let Err(e) = child.wait() {
                warn!("Failed to wait for {}: {}", self.logger.display(), e);
            }
        }
    }
}

/// Keeps every message in memory. Used by tests and by callers that want to
/// inspect what a session reported.
#[derive(Debug, Default)]
pub struct MemorySink {
    entries: Mutex<Vec<(Severity, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<(Severity, String)> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    pub fn with_severity(&self, severity: Severity) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter(|(s, _)| *s == severity)
            .map(|(_, m)| m)
            .collect()
    }
}

impl LogSink for MemorySink {
    fn log(&self, message: &str, severity: Severity) {
        trace(message, severity);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push((severity, message.to_string()));
        }
    }
}
