// Shared fixtures for integration tests: a temp service layout and fake
// collaborators that record what the orchestrator asked of them.
#![allow(dead_code)]

use async_trait::async_trait;
use cert_rotate::backup::BackupStore;
use cert_rotate::config::Config;
use cert_rotate::error::{AcquisitionError, InstallError, ServiceError};
use cert_rotate::health_check::ReachabilityProbe;
use cert_rotate::install::{ConfigGenerator, GenerateParams};
use cert_rotate::rotation::{Collaborators, Operator, RotationOrchestrator};
use cert_rotate::service::ServiceController;
use cert_rotate::tls::{CertificateAcquirer, CertificateBundle};
use chrono::{Datelike, Duration, Utc};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

pub const DOMAIN: &str = "example.com";
pub const ORIGINAL_CONFIG: &str = "teleport:\n  nodename: example.com\nproxy_service:\n  public_addr: example.com:443\n";

/// Self-signed (cert PEM, key PEM) for `domain` valid for about `days` more days
pub fn self_signed(domain: &str, days: i64) -> (String, String) {
    let not_after = Utc::now() + Duration::days(days);
    let mut params = rcgen::CertificateParams::new(vec![domain.to_string()]).unwrap();
    params.not_before = rcgen::date_time_ymd(2020, 1, 1);
    params.not_after = rcgen::date_time_ymd(
        not_after.year(),
        not_after.month() as u8,
        not_after.day() as u8,
    );
    let key = rcgen::KeyPair::generate().unwrap();
    let cert = params.self_signed(&key).unwrap();
    (cert.pem(), key.serialize_pem())
}

/// A service layout rooted in a temp directory
pub struct Harness {
    pub root: TempDir,
    pub config: Config,
}

impl Harness {
    /// Running service whose installed certificate expires in `days`
    pub fn with_installed_cert(days: i64) -> Self {
        let harness = Self::without_cert();
        let (cert, key) = self_signed(DOMAIN, days);
        std::fs::create_dir_all(harness.config.service.cert_file.parent().unwrap()).unwrap();
        std::fs::write(&harness.config.service.cert_file, cert).unwrap();
        std::fs::write(&harness.config.service.key_file, key).unwrap();
        harness
    }

    /// Service state and configuration exist, but no certificate is installed
    pub fn without_cert() -> Self {
        let root = TempDir::new().unwrap();
        let base = root.path();

        let mut config = Config::default();
        config.service.state_dir = base.join("var/lib/teleport");
        config.service.config_path = base.join("etc/teleport.yaml");
        config.service.cert_file = base.join("var/lib/teleport/tls/fullchain.pem");
        config.service.key_file = base.join("var/lib/teleport/tls/privkey.pem");
        config.certificates.live_dir = base.join("etc/letsencrypt/live");
        config.rotation.backup_dir = base.join("var/backups/cert-rotate");
        config.rotation.lock_dir = base.join("run/cert-rotate");
        config.rotation.require_root = false;
        config.logging.file_path = None;

        std::fs::create_dir_all(config.service.state_dir.join("proc")).unwrap();
        std::fs::write(config.service.state_dir.join("proc/sqlite.db"), [7u8; 64]).unwrap();
        std::fs::create_dir_all(config.service.config_path.parent().unwrap()).unwrap();
        std::fs::write(&config.service.config_path, ORIGINAL_CONFIG).unwrap();

        Self { root, config }
    }

    pub fn backup_store(&self) -> BackupStore {
        BackupStore::new(
            &self.config.rotation.backup_dir,
            &self.config.service.state_dir,
            &self.config.service.config_path,
        )
    }

    pub fn orchestrator(&self, fakes: &Fakes) -> RotationOrchestrator {
        RotationOrchestrator::new(&self.config, fakes.collaborators())
    }

    pub fn config_contents(&self) -> Vec<u8> {
        std::fs::read(&self.config.service.config_path).unwrap_or_default()
    }

    pub fn cert_contents(&self) -> Vec<u8> {
        std::fs::read(&self.config.service.cert_file).unwrap_or_default()
    }

    pub fn backup_count(&self) -> usize {
        match std::fs::read_dir(&self.config.rotation.backup_dir) {
            Ok(entries) => entries.count(),
            Err(_) => 0,
        }
    }
}

/// Scripted service: records every call and flips liveness as configured
pub struct FakeService {
    active: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
    pub available: bool,
    pub stop_fails: bool,
    pub stop_settles: bool,
    pub force_stop_settles: bool,
    /// Number of leading `start` calls that fail
    pub failing_starts: usize,
    pub start_activates: bool,
    starts: AtomicUsize,
}

impl FakeService {
    pub fn running() -> Self {
        Self {
            active: AtomicBool::new(true),
            calls: Mutex::new(Vec::new()),
            available: true,
            stop_fails: false,
            stop_settles: true,
            force_stop_settles: true,
            failing_starts: 0,
            start_activates: true,
            starts: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| **c == call).count()
    }

    pub fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    fn record(&self, call: &'static str) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ServiceController for FakeService {
    async fn stop(&self) -> Result<(), ServiceError> {
        self.record("stop");
        if self.stop_fails {
            return Err(ServiceError::Command {
                command: "systemctl stop teleport".to_string(),
                detail: "Job for teleport.service canceled".to_string(),
            });
        }
        if self.stop_settles {
            self.active.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn force_stop(&self) -> Result<(), ServiceError> {
        self.record("force_stop");
        if self.force_stop_settles {
            self.active.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.record("start");
        if self.starts.fetch_add(1, Ordering::SeqCst) < self.failing_starts {
            return Err(ServiceError::Command {
                command: "systemctl start teleport".to_string(),
                detail: "exit status 1".to_string(),
            });
        }
        if self.start_activates {
            self.active.store(true, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn is_active(&self) -> bool {
        self.active()
    }

    fn is_available(&self) -> bool {
        self.available
    }
}

/// Issues a fresh certificate for the requested domain, or fails
pub struct FakeAcquirer {
    pub issue: bool,
    pub confirm: bool,
    pub available: bool,
    pub issued_chain: Mutex<Option<Vec<u8>>>,
    pub acquisitions: AtomicUsize,
}

impl FakeAcquirer {
    pub fn issuing() -> Self {
        Self {
            issue: true,
            confirm: true,
            available: true,
            issued_chain: Mutex::new(None),
            acquisitions: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            issue: false,
            ..Self::issuing()
        }
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateAcquirer for FakeAcquirer {
    async fn acquire(&self, domain: &str) -> Result<CertificateBundle, AcquisitionError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        if !self.issue {
            return Err(AcquisitionError::Tool(
                "too many certificates already issued".to_string(),
            ));
        }
        let (cert, key) = self_signed(domain, 90);
        *self.issued_chain.lock().unwrap() = Some(cert.clone().into_bytes());
        CertificateBundle::from_pem(domain, cert.into_bytes(), key.into_bytes())
            .map_err(|e| AcquisitionError::InvalidBundle(e.to_string()))
    }

    async fn confirm(&self, _domain: &str) -> bool {
        self.confirm
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn tool_name(&self) -> &str {
        "fake-certbot"
    }
}

/// Writes a configuration naming the domain, or fails
pub struct FakeGenerator {
    pub fail: bool,
    /// Directory removed before failing, to make the rollback fail too
    pub destroy_backups: Option<PathBuf>,
    /// Another run's snapshot, taken over `config` while this one is installing
    pub interleaved_snapshot: Option<(BackupStore, String)>,
    pub calls: Mutex<Vec<GenerateParams>>,
}

impl FakeGenerator {
    pub fn working() -> Self {
        Self {
            fail: false,
            destroy_backups: None,
            interleaved_snapshot: None,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::working()
        }
    }

    pub fn generated_config(params: &GenerateParams) -> String {
        format!(
            "teleport:\n  nodename: {}\nproxy_service:\n  public_addr: {}\n  https_cert_file: {}\n",
            params.domain,
            params.public_addr,
            params.cert_file.display()
        )
    }
}

#[async_trait]
impl ConfigGenerator for FakeGenerator {
    async fn generate(&self, params: &GenerateParams) -> Result<(), InstallError> {
        self.calls.lock().unwrap().push(params.clone());
        if let Some(dir) = &self.destroy_backups {
            std::fs::remove_dir_all(dir).unwrap();
        }
        if let Some((store, config)) = &self.interleaved_snapshot {
            std::fs::write(&params.config_file, config).unwrap();
            store.snapshot("b.example.com").unwrap();
        }
        if self.fail {
            return Err(InstallError::Generator("teleport configure: exit status 1".to_string()));
        }
        std::fs::write(&params.config_file, Self::generated_config(params)).unwrap();
        Ok(())
    }

    fn is_available(&self) -> bool {
        true
    }
}

pub struct FakeProbe {
    pub reachable: bool,
    pub probes: AtomicUsize,
}

#[async_trait]
impl ReachabilityProbe for FakeProbe {
    async fn probe(&self, _endpoint: &str) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.reachable
    }
}

pub struct FixedOperator {
    pub force: bool,
    pub asked: AtomicUsize,
}

impl Operator for FixedOperator {
    fn confirm_force_renewal(&self, _domain: &str, _days_remaining: i64) -> bool {
        self.asked.fetch_add(1, Ordering::SeqCst);
        self.force
    }
}

/// One of each fake, shared with the orchestrator under test
pub struct Fakes {
    pub service: Arc<FakeService>,
    pub acquirer: Arc<FakeAcquirer>,
    pub generator: Arc<FakeGenerator>,
    pub probe: Arc<FakeProbe>,
    pub operator: Arc<FixedOperator>,
}

impl Default for Fakes {
    fn default() -> Self {
        Self {
            service: Arc::new(FakeService::running()),
            acquirer: Arc::new(FakeAcquirer::issuing()),
            generator: Arc::new(FakeGenerator::working()),
            probe: Arc::new(FakeProbe {
                reachable: true,
                probes: AtomicUsize::new(0),
            }),
            operator: Arc::new(FixedOperator {
                force: false,
                asked: AtomicUsize::new(0),
            }),
        }
    }
}

impl Fakes {
    pub fn with_service(service: FakeService) -> Self {
        Self {
            service: Arc::new(service),
            ..Self::default()
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            acquirer: self.acquirer.clone(),
            service: self.service.clone(),
            generator: self.generator.clone(),
            probe: self.probe.clone(),
            operator: self.operator.clone(),
        }
    }
}
