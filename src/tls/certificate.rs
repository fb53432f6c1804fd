use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::io::BufReader;
use std::path::Path;

/// Certificate material for one domain, as issued
///
/// Consumed once by the installer; never retained past the rotation.
#[derive(Clone)]
pub struct CertificateBundle {
    /// PEM-encoded full chain (leaf first)
    pub full_chain: Vec<u8>,
    /// PEM-encoded private key
    pub private_key: Vec<u8>,
    /// Expiry of the leaf certificate
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("full_chain_len", &self.full_chain.len())
            .field("private_key", &"<redacted>")
            .field("not_after", &self.not_after)
            .finish()
    }
}

impl CertificateBundle {
    /// Build a bundle from PEM payloads, checking that the chain and key parse
    /// and that the leaf covers `domain`
    pub fn from_pem(domain: &str, full_chain: Vec<u8>, private_key: Vec<u8>) -> Result<Self> {
        let chain = parse_certificate_chain(&full_chain).context("Invalid full chain")?;
        parse_private_key(&private_key).context("Invalid private key")?;

        let info = CertificateInfo::from_der(&chain[0])?;
        if !info.covers(domain) {
            anyhow::bail!(
                "Certificate does not cover {} (names: {:?})",
                domain,
                info.domains
            );
        }

        Ok(Self {
            full_chain,
            private_key,
            not_after: info.expires_at,
        })
    }
}

/// Metadata extracted from a leaf certificate
#[derive(Debug, Clone)]
pub struct CertificateInfo {
    pub expires_at: DateTime<Utc>,
    /// Common name and DNS subject alternative names
    pub domains: Vec<String>,
}

impl CertificateInfo {
    /// Read the leaf certificate of a PEM file on disk
    pub fn from_pem_file(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("Failed to read certificate file: {}", path.display()))?;
        let chain = parse_certificate_chain(&pem)?;
        Self::from_der(&chain[0])
    }

    /// Extract expiration date and domains from a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        use x509_parser::extensions::{GeneralName, ParsedExtension};
        use x509_parser::parse_x509_certificate;

        let (_, x509) = parse_x509_certificate(der)
            .map_err(|e| anyhow::anyhow!("Failed to parse X.509 certificate: {}", e))?;

        let expires_at = Utc
            .timestamp_opt(x509.validity().not_after.timestamp(), 0)
            .single()
            .ok_or_else(|| anyhow::anyhow!("Failed to convert ASN.1 time to DateTime"))?;

        let mut domains = Vec::new();

        if let Some(cn) = x509.subject().iter_common_name().next() {
            if let Ok(cn_str) = cn.as_str() {
                domains.push(cn_str.to_string());
            }
        }

        for ext in x509.extensions() {
            if let ParsedExtension::SubjectAlternativeName(san) = ext.parsed_extension() {
                for name in &san.general_names {
                    if let GeneralName::DNSName(dns) = name {
                        domains.push(dns.to_string());
                    }
                }
            }
        }

        domains.sort();
        domains.dedup();

        Ok(Self {
            expires_at,
            domains,
        })
    }

    /// Exact, case-insensitive name match. Wildcards cover one label.
    pub fn covers(&self, domain: &str) -> bool {
        self.domains.iter().any(|name| {
            if name.eq_ignore_ascii_case(domain) {
                return true;
            }
            match (name.strip_prefix("*."), domain.split_once('.')) {
                (Some(suffix), Some((_, rest))) => suffix.eq_ignore_ascii_case(rest),
                _ => false,
            }
        })
    }
}

/// Parse every certificate in a PEM chain, leaf first
pub fn parse_certificate_chain(pem: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut reader = BufReader::new(pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse PEM certificate: {}", e))?;

    if certs.is_empty() {
        anyhow::bail!("No certificates found in PEM data");
    }

    Ok(certs)
}

/// Parse a PEM-encoded private key (PKCS8, RSA or SEC1)
pub fn parse_private_key(pem: &[u8]) -> Result<Vec<u8>> {
    use rustls_pemfile::{ec_private_keys, pkcs8_private_keys, rsa_private_keys};

    let mut reader = BufReader::new(pem);
    let keys = pkcs8_private_keys(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse PKCS8 key: {}", e))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(key);
    }

    let mut reader = BufReader::new(pem);
    let keys = rsa_private_keys(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse RSA key: {}", e))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(key);
    }

    let mut reader = BufReader::new(pem);
    let keys = ec_private_keys(&mut reader)
        .map_err(|e| anyhow::anyhow!("Failed to parse ECDSA key: {}", e))?;
    if let Some(key) = keys.into_iter().next() {
        return Ok(key);
    }

    anyhow::bail!("Failed to parse private key (tried PKCS8, RSA, ECDSA)");
}


#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_parse_invalid_certificate() {
        assert!(parse_certificate_chain(b"NOT A PEM FILE").is_err());
    }

    #[test]
    fn test_parse_empty_certificate() {
        assert!(parse_certificate_chain(b"").is_err());
    }

    #[test]
    fn test_parse_invalid_private_key() {
        assert!(parse_private_key(b"NOT A KEY").is_err());
    }

    #[test]
    fn test_bundle_from_generated_certificate() {
        let expiry = Utc::now() + Duration::days(90);
        let (cert, key) = testing::self_signed("example.com", expiry);

        let bundle =
            CertificateBundle::from_pem("example.com", cert.into_bytes(), key.into_bytes())
                .unwrap();
        assert_eq!(bundle.not_after.date_naive(), expiry.date_naive());
    }

    #[test]
    fn test_bundle_rejects_other_domain() {
        let (cert, key) = testing::self_signed("example.com", Utc::now() + Duration::days(90));
        let result = CertificateBundle::from_pem("other.org", cert.into_bytes(), key.into_bytes());
        assert!(result.unwrap_err().to_string().contains("does not cover"));
    }

    #[test]
    fn test_bundle_debug_redacts_key() {
        let (cert, key) = testing::self_signed("example.com", Utc::now() + Duration::days(90));
        let bundle =
            CertificateBundle::from_pem("example.com", cert.into_bytes(), key.into_bytes())
                .unwrap();
        let rendered = format!("{:?}", bundle);
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("PRIVATE KEY"));
    }

    #[test]
    fn test_covers_wildcard() {
        let info = CertificateInfo {
            expires_at: Utc::now(),
            domains: vec!["*.example.com".to_string()],
        };
        assert!(info.covers("www.example.com"));
        assert!(info.covers("WWW.Example.com"));
        assert!(!info.covers("example.com"));
        assert!(!info.covers("a.b.example.com"));
    }
}
