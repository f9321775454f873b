//! PEM checks for Secret material referenced by ingress objects.
//!
//! Secrets are validated before they are handed to Envoy so a broken
//! certificate surfaces as a condition instead of a rejected xDS update.

use thiserror::Error;
use x509_parser::pem::Pem;

pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";
pub const CRL_KEY: &str = "crl.pem";

const PRIVATE_KEY_LABELS: &[&str] = &["PRIVATE KEY", "RSA PRIVATE KEY", "EC PRIVATE KEY"];

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CertificateError {
    #[error("missing {0} in secret data")]
    MissingKey(&'static str),

    #[error("{key} contains no {label} PEM block")]
    NoPemBlock { key: &'static str, label: &'static str },

    #[error("{key} contains invalid PEM data: {reason}")]
    InvalidPem { key: &'static str, reason: String },

    #[error("{key} contains an unparseable certificate: {reason}")]
    InvalidCertificate { key: &'static str, reason: String },
}

/// Decode all PEM blocks in a buffer.
fn pem_blocks(key: &'static str, data: &[u8]) -> Result<Vec<Pem>, CertificateError> {
    Pem::iter_from_buffer(data)
        .map(|block| {
            block.map_err(|e| CertificateError::InvalidPem { key, reason: e.to_string() })
        })
        .collect()
}

/// Count the certificates in a PEM bundle, failing if any do not parse.
pub fn validate_certificate_bundle(
    key: &'static str,
    data: &[u8],
) -> Result<usize, CertificateError> {
    let certificates: Vec<Pem> =
        pem_blocks(key, data)?.into_iter().filter(|p| p.label == "CERTIFICATE").collect();
    if certificates.is_empty() {
        return Err(CertificateError::NoPemBlock { key, label: "CERTIFICATE" });
    }
    for pem in &certificates {
        pem.parse_x509()
            .map_err(|e| CertificateError::InvalidCertificate { key, reason: e.to_string() })?;
    }
    Ok(certificates.len())
}

/// A serving certificate needs a parseable chain and a private key.
pub fn validate_tls_secret(
    cert: Option<&[u8]>,
    private_key: Option<&[u8]>,
) -> Result<(), CertificateError> {
    let cert = cert.ok_or(CertificateError::MissingKey(TLS_CERT_KEY))?;
    let private_key = private_key.ok_or(CertificateError::MissingKey(TLS_PRIVATE_KEY_KEY))?;

    validate_certificate_bundle(TLS_CERT_KEY, cert)?;

    let has_key = pem_blocks(TLS_PRIVATE_KEY_KEY, private_key)?
        .iter()
        .any(|p| PRIVATE_KEY_LABELS.contains(&p.label.as_str()));
    if !has_key {
        return Err(CertificateError::NoPemBlock {
            key: TLS_PRIVATE_KEY_KEY,
            label: "PRIVATE KEY",
        });
    }
    Ok(())
}

/// CA bundles used for client or upstream validation.
pub fn validate_ca_bundle(ca: Option<&[u8]>) -> Result<(), CertificateError> {
    let ca = ca.ok_or(CertificateError::MissingKey(CA_CERT_KEY))?;
    validate_certificate_bundle(CA_CERT_KEY, ca).map(|_| ())
}

/// Certificate revocation lists.
pub fn validate_crl(crl: Option<&[u8]>) -> Result<(), CertificateError> {
    let crl = crl.ok_or(CertificateError::MissingKey(CRL_KEY))?;
    let blocks: Vec<Pem> =
        pem_blocks(CRL_KEY, crl)?.into_iter().filter(|p| p.label == "X509 CRL").collect();
    if blocks.is_empty() {
        return Err(CertificateError::NoPemBlock { key: CRL_KEY, label: "X509 CRL" });
    }
    for pem in &blocks {
        x509_parser::parse_x509_crl(&pem.contents).map_err(|e| {
            CertificateError::InvalidCertificate { key: CRL_KEY, reason: e.to_string() }
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const CA: &str = include_str!("../../tests/fixtures/ca.crt");
    const CERT: &str = include_str!("../../tests/fixtures/server.crt");
    const KEY: &str = include_str!("../../tests/fixtures/server.key");
    const CRL: &str = include_str!("../../tests/fixtures/crl.pem");

    #[test]
    fn accepts_valid_tls_secret() {
        assert!(validate_tls_secret(Some(CERT.as_bytes()), Some(KEY.as_bytes())).is_ok());
    }

    #[test]
    fn rejects_missing_key() {
        assert_eq!(
            validate_tls_secret(Some(CERT.as_bytes()), None),
            Err(CertificateError::MissingKey(TLS_PRIVATE_KEY_KEY))
        );
    }

    #[test]
    fn rejects_key_in_cert_slot() {
        let err = validate_tls_secret(Some(KEY.as_bytes()), Some(KEY.as_bytes())).unwrap_err();
        assert!(matches!(err, CertificateError::NoPemBlock { key: TLS_CERT_KEY, .. }));
    }

    #[test]
    fn rejects_garbage_certificate() {
        let bogus = "-----BEGIN CERTIFICATE-----\nZm9vYmFy\n-----END CERTIFICATE-----\n";
        let err = validate_certificate_bundle(TLS_CERT_KEY, bogus.as_bytes()).unwrap_err();
        assert!(matches!(err, CertificateError::InvalidCertificate { .. }));
    }

    #[test]
    fn ca_and_crl() {
        assert!(validate_ca_bundle(Some(CA.as_bytes())).is_ok());
        assert!(validate_crl(Some(CRL.as_bytes())).is_ok());
        assert!(validate_crl(Some(CA.as_bytes())).is_err());
    }

    #[test]
    fn bundle_counts_certificates() {
        let bundle = format!("{}{}", CERT, CA);
        assert_eq!(validate_certificate_bundle(CA_CERT_KEY, bundle.as_bytes()).unwrap(), 2);
    }
}
