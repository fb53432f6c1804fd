//! Certificate parsing, expiry evaluation and issuance

pub mod acquirer;
pub mod certificate;
pub mod expiry;

pub use acquirer::{CertbotAcquirer, CertificateAcquirer};
pub use certificate::{CertificateBundle, CertificateInfo};
pub use expiry::{Expiry, ExpiryEvaluator};
