//! Installs new certificate material and regenerates the service configuration
//!
//! Nothing here cleans up after a failure. Recovery is the orchestrator's
//! job, through the backup taken before [`ConfigInstaller::clean`] runs.

use async_trait::async_trait;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::backup::Backup;
use crate::config::{GeneratorConfig, ServiceConfig};
use crate::error::InstallError;
use crate::system;
use crate::tls::CertificateBundle;

/// Inputs to the service's configuration generator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateParams {
    /// Cluster/service identity
    pub domain: String,
    /// `domain:port`
    pub public_addr: String,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    pub config_file: PathBuf,
}

/// The managed service's own "write a configuration from these inputs" step
#[async_trait]
pub trait ConfigGenerator: Send + Sync {
    async fn generate(&self, params: &GenerateParams) -> Result<(), InstallError>;

    fn is_available(&self) -> bool;
}

/// Runs a program with placeholder-expanded arguments
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
}

impl CommandGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    pub fn render_args(&self, params: &GenerateParams) -> Vec<String> {
        self.args
            .iter()
            .map(|arg| {
                arg.replace("{domain}", &params.domain)
                    .replace("{public_addr}", &params.public_addr)
                    .replace("{cert_file}", &params.cert_file.to_string_lossy())
                    .replace("{key_file}", &params.key_file.to_string_lossy())
                    .replace("{config_file}", &params.config_file.to_string_lossy())
            })
            .collect()
    }
}

#[async_trait]
impl ConfigGenerator for CommandGenerator {
    async fn generate(&self, params: &GenerateParams) -> Result<(), InstallError> {
        let args = self.render_args(params);
        let command = system::display_command(&self.program, &args);
        info!(command = %command, "Generating service configuration");

        let output = system::run(&self.program, &args)
            .await
            .map_err(|e| InstallError::Generator(format!("{}: {}", command, e)))?;
        if !output.status.success() {
            return Err(InstallError::Generator(format!(
                "{}: {}",
                command,
                system::failure_detail(&output)
            )));
        }
        if !params.config_file.is_file() {
            return Err(InstallError::Generator(format!(
                "{} did not produce {}",
                command,
                params.config_file.display()
            )));
        }
        Ok(())
    }

    fn is_available(&self) -> bool {
        system::find_program(&self.program).is_some()
    }
}

pub struct ConfigInstaller {
    state_dir: PathBuf,
    config_path: PathBuf,
    cert_file: PathBuf,
    key_file: PathBuf,
    secure_port: u16,
    generator: Arc<dyn ConfigGenerator>,
}

impl ConfigInstaller {
    pub fn new(service: &ServiceConfig, generator: Arc<dyn ConfigGenerator>) -> Self {
        Self {
            state_dir: service.state_dir.clone(),
            config_path: service.config_path.clone(),
            cert_file: service.cert_file.clone(),
            key_file: service.key_file.clone(),
            secure_port: service.secure_port,
            generator,
        }
    }

    pub fn generator_available(&self) -> bool {
        self.generator.is_available()
    }

    /// Remove the prior state directory contents and configuration file
    ///
    /// Takes the snapshot as proof that one exists.
    pub fn clean(&self, backup: &Backup) -> Result<(), InstallError> {
        info!(
            backup_id = %backup.id,
            state_dir = %self.state_dir.display(),
            config = %self.config_path.display(),
            "Cleaning previous service state"
        );

        let clean_err = |path: &Path| {
            let path = path.to_path_buf();
            move |source| InstallError::Clean { path, source }
        };

        match fs::read_dir(&self.state_dir) {
            Ok(entries) => {
                for entry in entries {
                    let path = entry.map_err(clean_err(&self.state_dir))?.path();
                    let removed = if path.is_dir() && !path.is_symlink() {
                        fs::remove_dir_all(&path)
                    } else {
                        fs::remove_file(&path)
                    };
                    removed.map_err(clean_err(&path))?;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::create_dir_all(&self.state_dir).map_err(clean_err(&self.state_dir))?;
            }
            Err(e) => return Err(clean_err(&self.state_dir)(e)),
        }

        match fs::remove_file(&self.config_path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(clean_err(&self.config_path)(e)),
        }
    }

    /// Write the bundle where the service reads it, then regenerate the
    /// configuration around it
    pub async fn install(&self, bundle: &CertificateBundle, domain: &str) -> Result<(), InstallError> {
        write_file(&self.cert_file, &bundle.full_chain, 0o644)?;
        write_file(&self.key_file, &bundle.private_key, 0o600)?;
        debug!(
            cert_file = %self.cert_file.display(),
            key_file = %self.key_file.display(),
            "Certificate material written"
        );

        let params = self.generate_params(domain);
        self.generator.generate(&params).await?;

        info!(domain, config = %self.config_path.display(), "Service configuration installed");
        Ok(())
    }

    pub fn generate_params(&self, domain: &str) -> GenerateParams {
        GenerateParams {
            domain: domain.to_string(),
            public_addr: format!("{}:{}", domain, self.secure_port),
            cert_file: self.cert_file.clone(),
            key_file: self.key_file.clone(),
            config_file: self.config_path.clone(),
        }
    }
}

fn write_file(path: &Path, contents: &[u8], mode: u32) -> Result<(), InstallError> {
    let write_err = |source| InstallError::Write {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(write_err)?;
    }

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(path).map_err(write_err)?;
    file.write_all(contents).map_err(write_err)?;
    file.sync_all().map_err(write_err)
}
