//! Renewal gate based on the remaining validity of the installed certificate

use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{debug, warn};

use super::certificate::CertificateInfo;

const SECONDS_PER_DAY: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    NeedsRenewal,
    StillValid { days_remaining: i64 },
}

/// Reads the certificate the service currently serves. Read-only.
#[derive(Debug, Clone)]
pub struct ExpiryEvaluator {
    cert_file: PathBuf,
}

impl ExpiryEvaluator {
    pub fn new(cert_file: impl Into<PathBuf>) -> Self {
        Self {
            cert_file: cert_file.into(),
        }
    }

    pub fn evaluate(&self, domain: &str, threshold_days: i64) -> Expiry {
        self.evaluate_at(domain, threshold_days, Utc::now())
    }

    pub fn evaluate_at(&self, domain: &str, threshold_days: i64, now: DateTime<Utc>) -> Expiry {
        match self.days_remaining_at(domain, now) {
            Some(days) if days > threshold_days => Expiry::StillValid {
                days_remaining: days,
            },
            Some(days) => {
                debug!(domain, days_remaining = days, threshold_days, "Certificate is due for renewal");
                Expiry::NeedsRenewal
            }
            None => Expiry::NeedsRenewal,
        }
    }

    /// Whole days of validity left, or `None` when there is no usable
    /// certificate for `domain`
    pub fn days_remaining_at(&self, domain: &str, now: DateTime<Utc>) -> Option<i64> {
        if !self.cert_file.exists() {
            debug!(domain, path = %self.cert_file.display(), "No installed certificate");
            return None;
        }

        let info = match CertificateInfo::from_pem_file(&self.cert_file) {
            Ok(info) => info,
            Err(e) => {
                warn!(domain, path = %self.cert_file.display(), "Installed certificate is unreadable: {:#}", e);
                return None;
            }
        };

        if !info.covers(domain) {
            warn!(domain, names = ?info.domains, "Installed certificate does not cover domain");
            return None;
        }

        Some(days_between(now, info.expires_at))
    }
}

/// `floor((not_after - now) / 1 day)`
pub fn days_between(now: DateTime<Utc>, not_after: DateTime<Utc>) -> i64 {
    (not_after - now).num_seconds().div_euclid(SECONDS_PER_DAY)
}
