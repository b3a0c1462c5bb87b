//! Incremental, hard-link chained system backups driven through rsync.
//!
//! Each day gets one generation directory per host. Unchanged files are
//! hard-linked against the previous generation, so every generation is a full
//! tree while only changed files take new space. Destinations may be local or
//! reached over ssh; see [`providers`] for the operations that differ.

pub mod config;
pub mod error;
pub mod filter;
pub mod generation;
pub mod providers;
pub mod session;
pub mod sink;
pub mod transfer;

pub use config::SessionConfig;
pub use error::BackupError;
pub use session::{Session, SessionReport};
