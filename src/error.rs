//! Error taxonomy for a rotation attempt
//!
//! Errors up to and including [`AcquisitionError`] are raised before anything
//! destructive has happened and abort the attempt. Everything from
//! [`RotationError::ServiceTransitionTimeout`] onward triggers exactly one
//! rollback. [`RestoreError`] is terminal.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Snapshot could not be created
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("source path is not accessible: {path}: {source}")]
    SourceInaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write backup {id}: {source}")]
    Write {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write backup manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

/// Rollback itself failed
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no backup found in {0}")]
    NoBackup(PathBuf),

    #[error("backup {0} does not exist")]
    UnknownBackup(String),

    #[error("backup {id} is incomplete: missing {missing}")]
    Incomplete { id: String, missing: &'static str },

    #[error("failed to restore backup {id}: {source}")]
    Extract {
        id: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot restore now: {0}")]
    Busy(String),

    #[error("failed to read backup directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Certificate issuance or its confirmation failed
#[derive(Debug, Error)]
pub enum AcquisitionError {
    #[error("certificate tool failed: {0}")]
    Tool(String),

    #[error("issued certificate is invalid: {0}")]
    InvalidBundle(String),

    #[error("certificate authority does not list a valid certificate for {0}")]
    NotConfirmed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A service manager command failed to run or returned non-zero
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("`{command}` failed: {detail}")]
    Command { command: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Writing certificate material or regenerating the configuration failed
#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to clean {path}: {source}")]
    Clean {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration generator failed: {0}")]
    Generator(String),
}

/// Why a rotation attempt did not end in plain success
#[derive(Debug, Error)]
pub enum RotationError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("certificate is still valid for {days_remaining} days; no rotation performed")]
    NotDue { days_remaining: i64 },

    #[error("rotation cancelled by operator")]
    Cancelled,

    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),

    #[error("certificate acquisition failed: {0}")]
    Acquisition(#[from] AcquisitionError),

    #[error("service did not become {desired} within {timeout:?}")]
    ServiceTransitionTimeout {
        desired: &'static str,
        timeout: Duration,
    },

    #[error("service control failed: {0}")]
    ServiceControl(#[from] ServiceError),

    #[error("installation failed: {0}")]
    Installation(#[from] InstallError),

    #[error("rollback failed after {cause}: {source}")]
    Restore {
        cause: Box<RotationError>,
        #[source]
        source: RestoreError,
    },
}

impl RotationError {
    /// Whether the error is raised after the point of no return
    pub fn requires_rollback(&self) -> bool {
        matches!(
            self,
            RotationError::ServiceTransitionTimeout { .. }
                | RotationError::ServiceControl(_)
                | RotationError::Installation(_)
        )
    }

    /// Operator declines and not-due gates are not failures
    pub fn is_benign(&self) -> bool {
        matches!(self, RotationError::NotDue { .. } | RotationError::Cancelled)
    }
}
