//! Certificate rotation state machine
//!
//! ```text
//! Start -> Validated -> BackedUp -> CertAcquired -> ServiceStopped
//!       -> Installed -> ServiceStarted -> Verified
//! ```
//!
//! Failures before `CertAcquired` end in `AbortedBeforeChange`. Failures from
//! the stop onward go through `RollingBack` to `RolledBack` or
//! `RollbackFailed`.

pub mod lock;
pub mod orchestrator;
pub mod request;

pub use lock::RotationLock;
pub use orchestrator::{Collaborators, RotationOrchestrator};
pub use request::{validate_domain, RotationRequest};

use crate::error::RotationError;

/// Log marker attached to the one failure that needs an operator
pub const ROLLBACK_FAILED_MARKER: &str = "ROLLBACK_FAILED";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationState {
    Start,
    Validated,
    BackedUp,
    CertAcquired,
    ServiceStopped,
    Installed,
    ServiceStarted,
    Verified,
    AbortedBeforeChange,
    RollingBack,
    RolledBack,
    RollbackFailed,
}

impl RotationState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RotationState::Verified
                | RotationState::AbortedBeforeChange
                | RotationState::RolledBack
                | RotationState::RollbackFailed
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationOutcome {
    Success,
    AbortedBeforeChange,
    RolledBack,
    RollbackFailed,
}

/// Non-fatal findings attached to an otherwise successful rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationWarning {
    /// The service started locally but the external probe failed
    Unreachable { endpoint: String },
}

impl std::fmt::Display for RotationWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RotationWarning::Unreachable { endpoint } => {
                write!(f, "service is running but {} is not reachable", endpoint)
            }
        }
    }
}

#[derive(Debug)]
pub struct RotationResult {
    pub outcome: RotationOutcome,
    /// Why the rotation did not succeed
    pub reason: Option<RotationError>,
    /// State the machine was in when the failure happened
    pub failed_at: Option<RotationState>,
    /// Snapshot taken for this attempt, if any
    pub backup_id: Option<String>,
    pub warnings: Vec<RotationWarning>,
}

impl RotationResult {
    pub fn is_success(&self) -> bool {
        self.outcome == RotationOutcome::Success
    }

    /// Process exit code: 0 for success and benign aborts, 1 otherwise
    pub fn exit_code(&self) -> i32 {
        match self.outcome {
            RotationOutcome::Success => 0,
            RotationOutcome::AbortedBeforeChange
                if self.reason.as_ref().is_some_and(RotationError::is_benign) =>
            {
                0
            }
            _ => 1,
        }
    }
}

/// Answers the interactive questions raised mid-rotation
pub trait Operator: Send + Sync {
    /// The certificate still has `days_remaining` days left. Renew anyway?
    fn confirm_force_renewal(&self, domain: &str, days_remaining: i64) -> bool;
}

/// Non-interactive operator: never forces a renewal that is not due
#[derive(Debug, Clone, Copy, Default)]
pub struct DeclineForce;

impl Operator for DeclineForce {
    fn confirm_force_renewal(&self, _domain: &str, _days_remaining: i64) -> bool {
        false
    }
}
