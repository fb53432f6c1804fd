use crate::error::RotationError;

const MAX_DOMAIN_LEN: usize = 253;

/// A validated, immutable request to rotate the certificate for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    domain: String,
    force_renewal: bool,
}

impl RotationRequest {
    pub fn new(domain: impl Into<String>, force_renewal: bool) -> Result<Self, RotationError> {
        let domain = domain.into();
        validate_domain(&domain)?;
        Ok(Self {
            domain,
            force_renewal,
        })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Bypass the expiry gate
    pub fn force_renewal(&self) -> bool {
        self.force_renewal
    }
}

/// Hostname-like: non-empty, `[a-zA-Z0-9.-]+`
pub fn validate_domain(domain: &str) -> Result<(), RotationError> {
    if domain.is_empty() {
        return Err(RotationError::Validation("domain is empty".to_string()));
    }
    if domain.len() > MAX_DOMAIN_LEN {
        return Err(RotationError::Validation(format!(
            "domain is longer than {} characters",
            MAX_DOMAIN_LEN
        )));
    }
    if let Some(bad) = domain
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || *c == '.' || *c == '-'))
    {
        return Err(RotationError::Validation(format!(
            "domain {:?} contains invalid character {:?}",
            domain, bad
        )));
    }
    Ok(())
}
