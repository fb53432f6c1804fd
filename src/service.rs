//! Service supervision through the host's service manager

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::ServiceError;
use crate::system;

/// Liveness of the managed service, derived from a single live check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Not yet observed
    Unknown,
    Active,
    Inactive,
    /// A bounded wait ended before the desired state was observed
    TransitionTimeout,
}

impl ServiceState {
    pub fn from_active(active: bool) -> Self {
        if active {
            ServiceState::Active
        } else {
            ServiceState::Inactive
        }
    }
}

/// Drives the managed service
///
/// `stop` and `start` request a transition and return once the request is
/// accepted; they do not wait for the service to settle.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn stop(&self) -> Result<(), ServiceError>;

    async fn force_stop(&self) -> Result<(), ServiceError>;

    async fn start(&self) -> Result<(), ServiceError>;

    async fn is_active(&self) -> bool;

    /// Whether the service manager and the service binary are installed
    fn is_available(&self) -> bool;
}

/// `systemctl`-backed controller for one unit
#[derive(Debug, Clone)]
pub struct SystemdController {
    systemctl: String,
    unit: String,
    service_binary: String,
}

impl SystemdController {
    pub fn new(
        systemctl: impl Into<String>,
        unit: impl Into<String>,
        service_binary: impl Into<String>,
    ) -> Self {
        Self {
            systemctl: systemctl.into(),
            unit: unit.into(),
            service_binary: service_binary.into(),
        }
    }

    async fn systemctl(&self, args: &[&str]) -> Result<(), ServiceError> {
        let mut full: Vec<&str> = args.to_vec();
        full.push(&self.unit);
        let command = system::display_command(&self.systemctl, &full);
        debug!(command = %command, "Invoking service manager");

        let output = system::run(&self.systemctl, &full).await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(ServiceError::Command {
                command,
                detail: system::failure_detail(&output),
            })
        }
    }
}

#[async_trait]
impl ServiceController for SystemdController {
    async fn stop(&self) -> Result<(), ServiceError> {
        info!(unit = %self.unit, "Stopping service");
        self.systemctl(&["stop"]).await
    }

    async fn force_stop(&self) -> Result<(), ServiceError> {
        warn!(unit = %self.unit, "Force-stopping service");
        self.systemctl(&["kill", "--signal=SIGKILL"]).await
    }

    async fn start(&self) -> Result<(), ServiceError> {
        info!(unit = %self.unit, "Starting service");
        self.systemctl(&["start"]).await
    }

    async fn is_active(&self) -> bool {
        self.systemctl(&["is-active", "--quiet"]).await.is_ok()
    }

    fn is_available(&self) -> bool {
        let manager = system::find_program(&self.systemctl).is_some();
        let binary = system::find_program(&self.service_binary).is_some();
        if !manager {
            warn!(program = %self.systemctl, "Service manager not found");
        }
        if !binary {
            warn!(program = %self.service_binary, "Service binary not found");
        }
        manager && binary
    }
}
