use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::service::{ServiceController, ServiceState};

/// Result of waiting for the service to settle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AwaitOutcome {
    Reached(ServiceState),
    TimedOut {
        /// Last state observed before giving up
        last_observed: ServiceState,
    },
}

impl AwaitOutcome {
    pub fn reached(&self) -> bool {
        matches!(self, AwaitOutcome::Reached(_))
    }

    /// The settled state, or `TransitionTimeout` when the wait ran out
    pub fn state(&self) -> ServiceState {
        match self {
            AwaitOutcome::Reached(state) => *state,
            AwaitOutcome::TimedOut { .. } => ServiceState::TransitionTimeout,
        }
    }
}

/// One-shot external reachability check
#[async_trait]
pub trait ReachabilityProbe: Send + Sync {
    /// `true` only on an explicit OK response
    async fn probe(&self, endpoint: &str) -> bool;
}

/// HTTPS GET, reachable only on `200 OK`
#[derive(Debug, Clone)]
pub struct HttpsProbe {
    timeout: Duration,
}

impl HttpsProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ReachabilityProbe for HttpsProbe {
    async fn probe(&self, endpoint: &str) -> bool {
        let client = match reqwest::Client::builder().timeout(self.timeout).build() {
            Ok(client) => client,
            Err(e) => {
                debug!("Failed to build HTTP client: {}", e);
                return false;
            }
        };

        match client.get(endpoint).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                debug!(endpoint, status = %response.status(), "Endpoint did not answer OK");
                false
            }
            Err(e) => {
                debug!(endpoint, "Failed to reach endpoint: {}", e);
                false
            }
        }
    }
}

/// Polls service liveness within a bounded window and runs the final
/// reachability probe
#[derive(Clone)]
pub struct HealthVerifier {
    service: Arc<dyn ServiceController>,
    probe: Arc<dyn ReachabilityProbe>,
    poll_interval: Duration,
    secure_port: u16,
    probe_path: String,
}

impl HealthVerifier {
    pub fn new(
        service: Arc<dyn ServiceController>,
        probe: Arc<dyn ReachabilityProbe>,
        poll_interval: Duration,
        secure_port: u16,
        probe_path: impl Into<String>,
    ) -> Self {
        Self {
            service,
            probe,
            poll_interval,
            secure_port,
            probe_path: probe_path.into(),
        }
    }

    /// Current liveness, read once; `Unknown` when the service manager is missing
    pub async fn observe(&self) -> ServiceState {
        if !self.service.is_available() {
            return ServiceState::Unknown;
        }
        ServiceState::from_active(self.service.is_active().await)
    }

    /// Poll until the service's liveness matches `desired_active` or
    /// `timeout` elapses
    ///
    /// The state is always checked at least once, and once more at the
    /// deadline.
    pub async fn await_state(&self, desired_active: bool, timeout: Duration) -> AwaitOutcome {
        let deadline = Instant::now() + timeout;

        loop {
            let active = self.service.is_active().await;
            let last_observed = ServiceState::from_active(active);
            if active == desired_active {
                debug!(state = ?last_observed, "Service reached desired state");
                return AwaitOutcome::Reached(last_observed);
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(
                    desired = ?ServiceState::from_active(desired_active),
                    last_observed = ?last_observed,
                    timeout_secs = timeout.as_secs_f64(),
                    "Service did not settle in time"
                );
                return AwaitOutcome::TimedOut { last_observed };
            }

            sleep(self.poll_interval.min(deadline - now)).await;
        }
    }

    pub fn endpoint(&self, domain: &str) -> String {
        format!("https://{}:{}{}", domain, self.secure_port, self.probe_path)
    }

    /// Single external check against the service's secure endpoint. Not retried.
    pub async fn probe_reachable(&self, domain: &str) -> bool {
        let endpoint = self.endpoint(domain);
        let reachable = self.probe.probe(&endpoint).await;
        if reachable {
            info!(endpoint = %endpoint, "Service is reachable");
        } else {
            warn!(endpoint = %endpoint, "Service is not reachable from here");
        }
        reachable
    }
}
