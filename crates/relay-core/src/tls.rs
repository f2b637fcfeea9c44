//! TLS trust material for the outbound ASR uplink.
//!
//! The configured value may be either PEM text or a filesystem path; PEM is
//! tried first and the value falls back to being read as a path. An absent
//! value falls back to the standard web PKI root set.

use std::io::Cursor;
use std::sync::Arc;

use rustls::{ClientConfig, RootCertStore};

use crate::error::{RelayError, RelayResult};

fn install_crypto_provider() {
    // Safe to call more than once; only the first installation wins.
    let _ = rustls::crypto::ring::default_provider().install_default();
}

fn parse_pem_certs(pem: &str) -> Vec<rustls::pki_types::CertificateDer<'static>> {
    rustls_pemfile::certs(&mut Cursor::new(pem.as_bytes()))
        .filter_map(Result::ok)
        .collect()
}

fn load_root_store(trust: Option<&str>) -> RelayResult<RootCertStore> {
    let mut roots = RootCertStore::empty();

    match trust {
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
        Some(value) => {
            let mut certs = parse_pem_certs(value);
            if certs.is_empty() {
                let contents = std::fs::read_to_string(value).map_err(|e| {
                    RelayError::Tls(format!(
                        "trust material is neither valid PEM nor a readable file path: {e}"
                    ))
                })?;
                certs = parse_pem_certs(&contents);
            }
            if certs.is_empty() {
                return Err(RelayError::Tls(
                    "trust material did not contain any PEM certificates".into(),
                ));
            }
            for cert in certs {
                roots
                    .add(cert)
                    .map_err(|e| RelayError::Tls(format!("invalid CA certificate: {e}")))?;
            }
        }
    }

    Ok(roots)
}

/// Builds a rustls client configuration trusting either the configured CA
/// material or, if none is configured, the standard web PKI roots.
pub fn build_client_config(trust: Option<&str>) -> RelayResult<Arc<ClientConfig>> {
    install_crypto_provider();
    let roots = load_root_store(trust)?;
    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_uses_webpki_roots() {
        let cfg = build_client_config(None);
        assert!(cfg.is_ok());
    }

    #[test]
    fn unparseable_trust_material_is_an_error() {
        let err = build_client_config(Some("not pem and not a path"));
        assert!(err.is_err());
    }

    #[test]
    fn nonexistent_path_is_an_error() {
        let err = load_root_store(Some("/nonexistent/path/to/ca.pem"));
        assert!(err.is_err());
    }
}
