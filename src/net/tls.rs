//! TLS configuration and certificate loading.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use super::io::{TlsContext, TlsTransport, Transport};
use super::tcp::{TcpTransport, TlsTcpTransport};
use crate::error::NetError;

/// Server-side rustls context shared by every connection.
#[derive(Clone)]
pub struct RustlsContext {
    acceptor: TlsAcceptor,
}

impl RustlsContext {
    /// Load a PEM certificate chain and private key.
    pub fn from_pem_files(cert_path: &Path, key_path: &Path) -> io::Result<Self> {
        if !cert_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Certificate file not found: {:?}", cert_path),
            ));
        }
        if !key_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("Private key file not found: {:?}", key_path),
            ));
        }

        let certs = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;

        let config = rustls::ServerConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        tracing::info!(cert = %cert_path.display(), "TLS context loaded");
        Ok(Self::from_config(Arc::new(config)))
    }

    pub fn from_config(config: Arc<rustls::ServerConfig>) -> Self {
        Self {
            acceptor: TlsAcceptor::from(config),
        }
    }
}

impl TlsContext for RustlsContext {
    fn wrap(&self, raw: Box<dyn Transport>) -> Result<Box<dyn TlsTransport>, NetError> {
        let tcp = raw
            .into_any()
            .downcast::<TcpTransport>()
            .map_err(|_| NetError::Tls("transport cannot be upgraded by rustls".into()))?;
        Ok(Box::new(TlsTcpTransport::new(*tcp, self.acceptor.clone())))
    }
}

fn load_certs(path: &Path) -> io::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates found in {}", path.display()),
        ));
    }
    Ok(certs)
}

/// First RSA, PKCS#8 or SEC1 key in the file.
fn load_private_key(path: &Path) -> io::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    loop {
        match rustls_pemfile::read_one(&mut reader)? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(PrivateKeyDer::Pkcs1(key)),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(PrivateKeyDer::Pkcs8(key)),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(PrivateKeyDer::Sec1(key)),
            Some(_) => continue,
            None => break,
        }
    }

    Err(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("no private key found in {}", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_certificate_is_reported() {
        let err = match RustlsContext::from_pem_files(
            Path::new("/nonexistent/cert.pem"),
            Path::new("/nonexistent/key.pem"),
        ) {
            Ok(_) => panic!("loading a missing certificate succeeded"),
            Err(e) => e,
        };
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
        assert!(err.to_string().contains("Certificate file not found"));
    }

    #[test]
    fn pem_without_key_is_rejected() {
        let dir = std::env::temp_dir().join(format!("rdp-listener-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let empty = dir.join("empty.pem");
        std::fs::write(&empty, "").unwrap();

        let err = load_private_key(&empty).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        let err = load_certs(&empty).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        std::fs::remove_dir_all(&dir).ok();
    }
}
