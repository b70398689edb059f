//! TLS configuration: PEM-loaded identities with a self-signed fallback.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use tracing::warn;

use crate::error::StartupError;

type Identity = (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>);

/// Build the rustls server configuration from the configured PEM files, or
/// generate a self-signed certificate when neither is supplied.
pub fn build_server_config(
    cert: Option<&Path>,
    key: Option<&Path>,
) -> Result<ServerConfig, StartupError> {
    let (certs, key) = match (cert, key) {
        (Some(cert_path), Some(key_path)) => load_pem_identity(cert_path, key_path)?,
        (None, None) => {
            warn!(
                "no certificate or key configured; generating a self-signed certificate. \
                 Browsers will not trust this server until real TLS material is supplied"
            );
            self_signed_identity()?
        }
        _ => {
            return Err(StartupError::InvalidConfig(
                "--cert and --key must be provided together".to_string(),
            ))
        }
    };

    ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|error| StartupError::Tls(error.to_string()))
}

fn load_pem_identity(cert_path: &Path, key_path: &Path) -> Result<Identity, StartupError> {
    let cert_file = File::open(cert_path).map_err(|source| StartupError::CertificateRead {
        path: cert_path.to_path_buf(),
        source,
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StartupError::CertificateRead {
            path: cert_path.to_path_buf(),
            source,
        })?;
    if certs.is_empty() {
        return Err(StartupError::Tls(format!(
            "no certificates found in {}",
            cert_path.display()
        )));
    }

    let key_file = File::open(key_path).map_err(|source| StartupError::CertificateRead {
        path: key_path.to_path_buf(),
        source,
    })?;
    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|source| StartupError::CertificateRead {
            path: key_path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| {
            StartupError::Tls(format!("no private key found in {}", key_path.display()))
        })?;

    Ok((certs, key))
}

fn self_signed_identity() -> Result<Identity, StartupError> {
    let certified =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string(), "127.0.0.1".to_string()])
            .map_err(|error| StartupError::Tls(error.to_string()))?;

    let cert = certified.cert.der().clone();
    let key = PrivatePkcs8KeyDer::from(certified.key_pair.serialize_der());
    Ok((vec![cert], PrivateKeyDer::Pkcs8(key)))
}

// =============================================================================
// Tests
// =============================================================================
