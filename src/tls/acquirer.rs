//! Certificate issuance through an external certificate authority client

use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use tracing::{debug, info};

use super::certificate::CertificateBundle;
use crate::config::CertificatesConfig;
use crate::error::AcquisitionError;
use crate::system;

/// Obtains certificate material for a domain
///
/// `acquire` is all-or-nothing: it either returns a complete, parsed bundle
/// or an error, never a partial result.
#[async_trait]
pub trait CertificateAcquirer: Send + Sync {
    async fn acquire(&self, domain: &str) -> Result<CertificateBundle, AcquisitionError>;

    /// Independent check that the authority's store lists a valid
    /// certificate for `domain`
    async fn confirm(&self, domain: &str) -> bool;

    /// Whether the client tool is installed
    fn is_available(&self) -> bool;

    /// Tool name for logging
    fn tool_name(&self) -> &str;
}

/// `certbot` in standalone mode
#[derive(Debug, Clone)]
pub struct CertbotAcquirer {
    program: String,
    live_dir: PathBuf,
    email: Option<String>,
}

impl CertbotAcquirer {
    pub fn new(config: &CertificatesConfig) -> Self {
        Self {
            program: config.certbot.clone(),
            live_dir: config.live_dir.clone(),
            email: config.email.clone(),
        }
    }

    fn issue_args(&self, domain: &str) -> Vec<String> {
        let mut args = vec![
            "certonly".to_string(),
            "--standalone".to_string(),
            "--non-interactive".to_string(),
            "--agree-tos".to_string(),
            "--force-renewal".to_string(),
            "-d".to_string(),
            domain.to_string(),
        ];
        match &self.email {
            Some(email) => {
                args.push("--email".to_string());
                args.push(email.clone());
            }
            None => args.push("--register-unsafely-without-email".to_string()),
        }
        args
    }

    /// Read the freshly issued chain and key from certbot's live directory
    pub fn load_bundle(&self, domain: &str) -> Result<CertificateBundle, AcquisitionError> {
        let live = self.live_dir.join(domain);
        let full_chain = std::fs::read(live.join("fullchain.pem"))?;
        let private_key = std::fs::read(live.join("privkey.pem"))?;

        let bundle = CertificateBundle::from_pem(domain, full_chain, private_key)
            .map_err(|e| AcquisitionError::InvalidBundle(format!("{:#}", e)))?;

        if bundle.not_after <= Utc::now() {
            return Err(AcquisitionError::InvalidBundle(format!(
                "certificate expired at {}",
                bundle.not_after
            )));
        }

        Ok(bundle)
    }
}

#[async_trait]
impl CertificateAcquirer for CertbotAcquirer {
    async fn acquire(&self, domain: &str) -> Result<CertificateBundle, AcquisitionError> {
        let args = self.issue_args(domain);
        info!(domain, command = %system::display_command(&self.program, &args), "Requesting certificate");

        let output = system::run(&self.program, &args).await?;
        if !output.status.success() {
            return Err(AcquisitionError::Tool(system::failure_detail(&output)));
        }

        let bundle = self.load_bundle(domain)?;
        info!(domain, not_after = %bundle.not_after, "Certificate issued");
        Ok(bundle)
    }

    async fn confirm(&self, domain: &str) -> bool {
        let args = ["certificates", "--cert-name", domain];
        match system::run(&self.program, args).await {
            Ok(output) if output.status.success() => {
                listing_confirms(&String::from_utf8_lossy(&output.stdout), domain)
            }
            Ok(output) => {
                debug!(domain, "certbot certificates failed: {}", system::failure_detail(&output));
                false
            }
            Err(e) => {
                debug!(domain, "Failed to run certbot: {}", e);
                false
            }
        }
    }

    fn is_available(&self) -> bool {
        system::find_program(&self.program).is_some()
    }

    fn tool_name(&self) -> &str {
        &self.program
    }
}

/// Whether `certbot certificates` output lists a valid certificate for `domain`
///
/// Looks for the certificate block whose name or domain list matches and
/// requires its expiry line to be marked `VALID`.
pub fn listing_confirms(listing: &str, domain: &str) -> bool {
    let mut in_block = false;
    let mut matches_domain = false;

    for line in listing.lines().map(str::trim) {
        if let Some(name) = line.strip_prefix("Certificate Name:") {
            in_block = true;
            matches_domain = name.trim().eq_ignore_ascii_case(domain);
        } else if !in_block {
            continue;
        } else if let Some(names) = line.strip_prefix("Domains:") {
            matches_domain |= names
                .split_whitespace()
                .any(|n| n.eq_ignore_ascii_case(domain));
        } else if let Some(expiry) = line.strip_prefix("Expiry Date:") {
            if matches_domain && expiry.contains("(VALID") {
                return true;
            }
        }
    }

    false
}
