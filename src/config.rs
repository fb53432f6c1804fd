use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize, Serialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub certificates: CertificatesConfig,
    #[serde(default)]
    pub rotation: RotationConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// The managed service and the files it reads at startup
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServiceConfig {
    /// systemd unit name
    #[serde(default = "default_unit")]
    pub unit: String,
    /// Service binary that must be present on PATH
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Persisted-state directory (archived before any destructive step)
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Configuration file (copied before any destructive step)
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// Where the full chain is installed
    #[serde(default = "default_cert_file")]
    pub cert_file: PathBuf,
    /// Where the private key is installed
    #[serde(default = "default_key_file")]
    pub key_file: PathBuf,
    #[serde(default = "default_secure_port")]
    pub secure_port: u16,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            unit: default_unit(),
            binary: default_binary(),
            state_dir: default_state_dir(),
            config_path: default_config_path(),
            cert_file: default_cert_file(),
            key_file: default_key_file(),
            secure_port: default_secure_port(),
        }
    }
}

fn default_unit() -> String { "teleport".to_string() }
fn default_binary() -> String { "teleport".to_string() }
fn default_state_dir() -> PathBuf { PathBuf::from("/var/lib/teleport") }
fn default_config_path() -> PathBuf { PathBuf::from("/etc/teleport.yaml") }
fn default_cert_file() -> PathBuf { PathBuf::from("/var/lib/teleport/tls/fullchain.pem") }
fn default_key_file() -> PathBuf { PathBuf::from("/var/lib/teleport/tls/privkey.pem") }
fn default_secure_port() -> u16 { 443 }

/// Certificate authority client settings
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CertificatesConfig {
    #[serde(default = "default_certbot")]
    pub certbot: String,
    /// certbot's `live/` directory
    #[serde(default = "default_live_dir")]
    pub live_dir: PathBuf,
    #[serde(default)]
    pub email: Option<String>,
}

impl Default for CertificatesConfig {
    fn default() -> Self {
        Self {
            certbot: default_certbot(),
            live_dir: default_live_dir(),
            email: None,
        }
    }
}

fn default_certbot() -> String { "certbot".to_string() }
fn default_live_dir() -> PathBuf { PathBuf::from("/etc/letsencrypt/live") }

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RotationConfig {
    /// Renew when this many days (or fewer) of validity remain
    #[serde(default = "default_threshold_days")]
    pub threshold_days: i64,
    #[serde(default = "default_service_timeout")]
    pub service_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    #[serde(default = "default_systemctl")]
    pub systemctl: String,
    #[serde(default = "default_require_root")]
    pub require_root: bool,
}

impl RotationConfig {
    pub fn service_timeout(&self) -> Duration {
        Duration::from_secs(self.service_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            threshold_days: default_threshold_days(),
            service_timeout_secs: default_service_timeout(),
            poll_interval_ms: default_poll_interval(),
            backup_dir: default_backup_dir(),
            lock_dir: default_lock_dir(),
            systemctl: default_systemctl(),
            require_root: default_require_root(),
        }
    }
}

fn default_threshold_days() -> i64 { 30 }
fn default_service_timeout() -> u64 { 30 }
fn default_poll_interval() -> u64 { 1000 }
fn default_backup_dir() -> PathBuf { PathBuf::from("/var/backups/cert-rotate") }
fn default_lock_dir() -> PathBuf { PathBuf::from("/run/cert-rotate") }
fn default_systemctl() -> String { "systemctl".to_string() }
fn default_require_root() -> bool { true }

/// External reachability check run once after a successful start
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_path")]
    pub path: String,
    #[serde(default = "default_probe_timeout")]
    pub timeout_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            path: default_probe_path(),
            timeout_secs: default_probe_timeout(),
        }
    }
}

fn default_probe_path() -> String { "/webapi/ping".to_string() }
fn default_probe_timeout() -> u64 { 10 }

/// The service's own "generate configuration" command
///
/// Arguments may contain `{domain}`, `{public_addr}`, `{cert_file}`,
/// `{key_file}` and `{config_file}` placeholders.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GeneratorConfig {
    #[serde(default = "default_generator_program")]
    pub program: String,
    #[serde(default = "default_generator_args")]
    pub args: Vec<String>,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            program: default_generator_program(),
            args: default_generator_args(),
        }
    }
}

fn default_generator_program() -> String { "teleport".to_string() }
fn default_generator_args() -> Vec<String> {
    vec![
        "configure".to_string(),
        "--output=file://{config_file}".to_string(),
        "--cluster-name={domain}".to_string(),
        "--public-addr={public_addr}".to_string(),
        "--cert-file={cert_file}".to_string(),
        "--key-file={key_file}".to_string(),
    ]
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Append-only log file, written in addition to the console
    #[serde(default = "default_log_file")]
    pub file_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            file_path: default_log_file(),
        }
    }
}

fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "text".to_string() }
fn default_log_file() -> Option<PathBuf> { Some(PathBuf::from("/var/log/cert-rotate.log")) }

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
    validate_config(&config)?;
    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    let paths = [
        ("service.state_dir", &config.service.state_dir),
        ("service.config_path", &config.service.config_path),
        ("service.cert_file", &config.service.cert_file),
        ("service.key_file", &config.service.key_file),
        ("certificates.live_dir", &config.certificates.live_dir),
        ("rotation.backup_dir", &config.rotation.backup_dir),
        ("rotation.lock_dir", &config.rotation.lock_dir),
    ];
    for (name, path) in paths {
        if !path.is_absolute() {
            anyhow::bail!("{} must be an absolute path: {}", name, path.display());
        }
    }

    if config.rotation.backup_dir.starts_with(&config.service.state_dir) {
        anyhow::bail!("rotation.backup_dir must not live inside service.state_dir");
    }
    // Backups archive only the state directory
    for (name, path) in [
        ("service.cert_file", &config.service.cert_file),
        ("service.key_file", &config.service.key_file),
    ] {
        if !path.starts_with(&config.service.state_dir) {
            anyhow::bail!(
                "{} must live inside service.state_dir ({}): {}",
                name,
                config.service.state_dir.display(),
                path.display()
            );
        }
    }
    if config.service.unit.trim().is_empty() {
        anyhow::bail!("service.unit must not be empty");
    }
    if config.service.secure_port == 0 {
        anyhow::bail!("service.secure_port must be non-zero");
    }
    if config.rotation.service_timeout_secs == 0 {
        anyhow::bail!("rotation.service_timeout_secs must be greater than zero");
    }
    if config.rotation.poll_interval_ms == 0 {
        anyhow::bail!("rotation.poll_interval_ms must be greater than zero");
    }
    if config.probe.timeout_secs == 0 {
        anyhow::bail!("probe.timeout_secs must be greater than zero");
    }
    if !config.probe.path.starts_with('/') {
        anyhow::bail!("probe.path must start with '/': {}", config.probe.path);
    }

    Ok(())
}
