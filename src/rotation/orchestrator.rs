use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use super::lock::RotationLock;
use super::request::{validate_domain, RotationRequest};
use super::{
    Operator, RotationOutcome, RotationResult, RotationState, RotationWarning,
    ROLLBACK_FAILED_MARKER,
};
use crate::backup::{Backup, BackupStore};
use crate::config::Config;
use crate::error::{AcquisitionError, RestoreError, RotationError};
use crate::health_check::{HealthVerifier, HttpsProbe, ReachabilityProbe};
use crate::install::{CommandGenerator, ConfigGenerator, ConfigInstaller};
use crate::service::{ServiceController, ServiceState, SystemdController};
use crate::tls::{CertbotAcquirer, CertificateAcquirer, CertificateBundle, Expiry, ExpiryEvaluator};

/// External systems the orchestrator drives
#[derive(Clone)]
pub struct Collaborators {
    pub acquirer: Arc<dyn CertificateAcquirer>,
    pub service: Arc<dyn ServiceController>,
    pub generator: Arc<dyn ConfigGenerator>,
    pub probe: Arc<dyn ReachabilityProbe>,
    pub operator: Arc<dyn Operator>,
}

impl Collaborators {
    /// certbot, systemd, the configured generator command and an HTTPS probe
    pub fn system(config: &Config, operator: Arc<dyn Operator>) -> Self {
        Self {
            acquirer: Arc::new(CertbotAcquirer::new(&config.certificates)),
            service: Arc::new(SystemdController::new(
                config.rotation.systemctl.clone(),
                config.service.unit.clone(),
                config.service.binary.clone(),
            )),
            generator: Arc::new(CommandGenerator::new(&config.generator)),
            probe: Arc::new(HttpsProbe::new(Duration::from_secs(config.probe.timeout_secs))),
            operator,
        }
    }
}

/// Progress of a single attempt
struct Attempt<'a> {
    domain: &'a str,
    state: RotationState,
    backup_id: Option<String>,
    warnings: Vec<RotationWarning>,
}

impl<'a> Attempt<'a> {
    fn new(domain: &'a str) -> Self {
        Self {
            domain,
            state: RotationState::Start,
            backup_id: None,
            warnings: Vec::new(),
        }
    }

    fn advance(&mut self, next: RotationState) {
        info!(domain = self.domain, from = ?self.state, to = ?next, "Rotation state transition");
        self.state = next;
    }

    fn finish(
        mut self,
        outcome: RotationOutcome,
        reason: Option<RotationError>,
        failed_at: Option<RotationState>,
    ) -> RotationResult {
        let terminal = match outcome {
            RotationOutcome::Success => RotationState::Verified,
            RotationOutcome::AbortedBeforeChange => RotationState::AbortedBeforeChange,
            RotationOutcome::RolledBack => RotationState::RolledBack,
            RotationOutcome::RollbackFailed => RotationState::RollbackFailed,
        };
        if self.state != terminal {
            self.advance(terminal);
        }
        RotationResult {
            outcome,
            reason,
            failed_at,
            backup_id: self.backup_id,
            warnings: self.warnings,
        }
    }

    /// Exit without touching anything
    fn abort(self, reason: RotationError) -> RotationResult {
        let failed_at = self.state;
        if reason.is_benign() {
            info!(domain = self.domain, state = ?failed_at, "No rotation performed: {}", reason);
        } else {
            error!(domain = self.domain, state = ?failed_at, "Rotation aborted before any change: {}", reason);
        }
        self.finish(RotationOutcome::AbortedBeforeChange, Some(reason), Some(failed_at))
    }
}

/// Sequences expiry gate, backup, acquisition, stop, install, start and
/// verification, rolling back on any failure after the stop
pub struct RotationOrchestrator {
    threshold_days: i64,
    service_timeout: Duration,
    lock_dir: PathBuf,
    unit: String,
    expiry: ExpiryEvaluator,
    backups: BackupStore,
    installer: ConfigInstaller,
    health: HealthVerifier,
    acquirer: Arc<dyn CertificateAcquirer>,
    service: Arc<dyn ServiceController>,
    operator: Arc<dyn Operator>,
}

impl RotationOrchestrator {
    pub fn new(config: &Config, collaborators: Collaborators) -> Self {
        let Collaborators {
            acquirer,
            service,
            generator,
            probe,
            operator,
        } = collaborators;

        Self {
            threshold_days: config.rotation.threshold_days,
            service_timeout: config.rotation.service_timeout(),
            lock_dir: config.rotation.lock_dir.clone(),
            unit: config.service.unit.clone(),
            expiry: ExpiryEvaluator::new(&config.service.cert_file),
            backups: BackupStore::new(
                &config.rotation.backup_dir,
                &config.service.state_dir,
                &config.service.config_path,
            ),
            installer: ConfigInstaller::new(&config.service, generator),
            health: HealthVerifier::new(
                service.clone(),
                probe,
                config.rotation.poll_interval(),
                config.service.secure_port,
                config.probe.path.clone(),
            ),
            acquirer,
            service,
            operator,
        }
    }

    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Read-only expiry check with the configured threshold
    pub fn check_expiry(&self, domain: &str) -> Expiry {
        self.expiry.evaluate(domain, self.threshold_days)
    }

    pub async fn service_state(&self) -> ServiceState {
        self.health.observe().await
    }

    /// Run one rotation attempt to a terminal state
    pub async fn rotate(&self, request: &RotationRequest) -> RotationResult {
        let domain = request.domain();
        let mut attempt = Attempt::new(domain);

        // Held until this function returns
        let _lock = match self.validate(request) {
            Ok(lock) => lock,
            Err(e) => return attempt.abort(e),
        };
        attempt.advance(RotationState::Validated);

        match self.expiry.evaluate(domain, self.threshold_days) {
            Expiry::NeedsRenewal => {
                info!(domain, threshold_days = self.threshold_days, "Certificate needs renewal");
            }
            Expiry::StillValid { days_remaining } if request.force_renewal() => {
                info!(domain, days_remaining, "Certificate still valid; renewal forced");
            }
            Expiry::StillValid { days_remaining } => {
                if !self.operator.confirm_force_renewal(domain, days_remaining) {
                    return attempt.abort(RotationError::NotDue { days_remaining });
                }
                info!(domain, days_remaining, "Operator confirmed forced renewal");
            }
        }

        let backup = match self.backups.snapshot(domain) {
            Ok(backup) => backup,
            Err(e) => return attempt.abort(e.into()),
        };
        attempt.backup_id = Some(backup.id.clone());
        attempt.advance(RotationState::BackedUp);

        let bundle = match self.acquire(domain).await {
            Ok(bundle) => bundle,
            Err(e) => return attempt.abort(e.into()),
        };
        attempt.advance(RotationState::CertAcquired);

        // Point of no return: every failure from here on rolls back
        if let Err(cause) = self.swap(&mut attempt, &backup, bundle).await {
            return self.roll_back(attempt, &backup, cause).await;
        }

        if !self.health.probe_reachable(domain).await {
            let endpoint = self.health.endpoint(domain);
            warn!(domain, endpoint = %endpoint, "Rotation succeeded but the service is not externally reachable");
            attempt.warnings.push(RotationWarning::Unreachable { endpoint });
        }

        info!(domain, backup_id = %backup.id, "Certificate rotation complete");
        attempt.finish(RotationOutcome::Success, None, None)
    }

    /// Domain format and collaborator presence, then the per-domain lock
    fn validate(&self, request: &RotationRequest) -> Result<RotationLock, RotationError> {
        validate_domain(request.domain())?;

        let mut missing = Vec::new();
        if !self.acquirer.is_available() {
            missing.push(format!("certificate tool ({})", self.acquirer.tool_name()));
        }
        if !self.service.is_available() {
            missing.push("service manager or service binary".to_string());
        }
        if !self.installer.generator_available() {
            missing.push("configuration generator".to_string());
        }
        if !missing.is_empty() {
            return Err(RotationError::Validation(format!(
                "missing dependencies: {}",
                missing.join(", ")
            )));
        }

        RotationLock::acquire(&self.lock_dir, &self.unit)
    }

    async fn acquire(&self, domain: &str) -> Result<CertificateBundle, AcquisitionError> {
        let bundle = self.acquirer.acquire(domain).await?;
        if !self.acquirer.confirm(domain).await {
            return Err(AcquisitionError::NotConfirmed(domain.to_string()));
        }
        info!(domain, not_after = %bundle.not_after, "New certificate acquired and confirmed");
        Ok(bundle)
    }

    /// Stop, clean, install, start
    async fn swap(
        &self,
        attempt: &mut Attempt<'_>,
        backup: &Backup,
        bundle: CertificateBundle,
    ) -> Result<(), RotationError> {
        self.stop_service().await?;
        attempt.advance(RotationState::ServiceStopped);

        self.installer.clean(backup)?;
        self.installer.install(&bundle, attempt.domain).await?;
        drop(bundle);
        attempt.advance(RotationState::Installed);

        self.service.start().await?;
        if !self.health.await_state(true, self.service_timeout).await.reached() {
            return Err(RotationError::ServiceTransitionTimeout {
                desired: "active",
                timeout: self.service_timeout,
            });
        }
        attempt.advance(RotationState::ServiceStarted);
        Ok(())
    }

    /// Graceful stop, escalating to a single force stop
    async fn stop_service(&self) -> Result<(), RotationError> {
        let mut forced = false;
        if let Err(e) = self.service.stop().await {
            warn!("Stop command failed: {}; forcing", e);
            self.service.force_stop().await?;
            forced = true;
        }
        if self.health.await_state(false, self.service_timeout).await.reached() {
            return Ok(());
        }

        if !forced {
            warn!("Service still active after graceful stop; forcing");
            self.service.force_stop().await?;
            if self.health.await_state(false, self.service_timeout).await.reached() {
                return Ok(());
            }
        }

        Err(RotationError::ServiceTransitionTimeout {
            desired: "inactive",
            timeout: self.service_timeout,
        })
    }

    async fn roll_back(
        &self,
        mut attempt: Attempt<'_>,
        backup: &Backup,
        cause: RotationError,
    ) -> RotationResult {
        debug_assert!(cause.requires_rollback(), "{:?}", cause);
        let failed_at = attempt.state;
        error!(
            domain = attempt.domain,
            state = ?failed_at,
            backup_id = ?attempt.backup_id,
            "Rotation failed: {}; rolling back",
            cause
        );
        attempt.advance(RotationState::RollingBack);

        // This attempt's own snapshot, never whatever happens to be newest
        match self.restore_locked(Some(&backup.id)).await {
            Ok(backup) => {
                warn!(domain = attempt.domain, backup_id = %backup.id, "Rolled back to previous certificate");
                attempt.finish(RotationOutcome::RolledBack, Some(cause), Some(failed_at))
            }
            Err(source) => {
                error!(
                    marker = ROLLBACK_FAILED_MARKER,
                    domain = attempt.domain,
                    state = ?failed_at,
                    "ROLLBACK FAILED: {}; the service may have no valid certificate, manual intervention required",
                    source
                );
                attempt.finish(
                    RotationOutcome::RollbackFailed,
                    Some(RotationError::Restore {
                        cause: Box::new(cause),
                        source,
                    }),
                    Some(failed_at),
                )
            }
        }
    }

    /// Restore a backup (latest by default) and bring the service back up
    ///
    /// Takes the service lock, so it cannot run while a rotation is in
    /// progress. Stopping and starting are best-effort: only the restore
    /// itself can fail.
    pub async fn restore_and_restart(&self, id: Option<&str>) -> Result<Backup, RestoreError> {
        let _lock = RotationLock::acquire(&self.lock_dir, &self.unit)
            .map_err(|e| RestoreError::Busy(e.to_string()))?;
        self.restore_locked(id).await
    }

    /// Caller holds the service lock
    async fn restore_locked(&self, id: Option<&str>) -> Result<Backup, RestoreError> {
        if let Err(e) = self.service.stop().await {
            warn!("Best-effort stop before restore failed: {}", e);
        } else {
            let stopped = self.health.await_state(false, self.service_timeout).await;
            if !stopped.reached() {
                warn!(state = ?stopped.state(), "Service still active; restoring anyway");
            }
        }

        let backup = match id {
            Some(id) => self.backups.restore(id)?,
            None => self.backups.restore_latest()?,
        };

        match self.service.start().await {
            Ok(()) => {
                let started = self.health.await_state(true, self.service_timeout).await;
                if !started.reached() {
                    warn!(backup_id = %backup.id, state = ?started.state(), "Service did not come back after restore");
                }
            }
            Err(e) => warn!(backup_id = %backup.id, "Best-effort start after restore failed: {}", e),
        }

        Ok(backup)
    }
}
