//! Mutual-TLS client configuration for the plan server channel.
//!
//! Trust is anchored only in the CA chain shipped with the bootstrap
//! credentials; the system trust store is never consulted. The server
//! certificate is checked against the configured server name, not the
//! dialed address, since inside the VM network the two rarely match.

use std::io::Cursor;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::credentials::BootstrapCredentials;
use crate::error::{BootstrapError, Result};

/// A ready-to-dial mutual-TLS channel description. Building one performs no
/// network I/O.
#[derive(Debug, Clone)]
pub struct SecureChannel {
    /// Address to dial.
    pub host_port: String,

    /// Identity the server certificate is verified against.
    pub server_name: ServerName<'static>,

    config: Arc<ClientConfig>,
}

impl SecureChannel {
    /// Build the client configuration from PEM credentials.
    pub fn build(credentials: &BootstrapCredentials) -> Result<Self> {
        let ca_certs = parse_certificates(&credentials.ca_chain, "CA chain")?;
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots.add(cert).map_err(|e| {
                BootstrapError::Configuration(format!("failed to add CA certificate: {}", e))
            })?;
        }

        let client_chain = parse_certificates(&credentials.certificate, "client certificate")?;
        let client_key = parse_private_key(&credentials.key)?;

        let server_name = ServerName::try_from(credentials.server_name.clone()).map_err(|e| {
            BootstrapError::Configuration(format!(
                "invalid server name '{}': {}",
                credentials.server_name, e
            ))
        })?;

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| BootstrapError::Configuration(format!("TLS protocol versions: {}", e)))?
            .with_root_certificates(roots)
            .with_client_auth_cert(client_chain, client_key)
            .map_err(|e| {
                BootstrapError::Configuration(format!("invalid client certificate or key: {}", e))
            })?;

        debug!(
            host_port = %credentials.host_port,
            server_name = %credentials.server_name,
            "secure channel configured"
        );

        Ok(Self {
            host_port: credentials.host_port.clone(),
            server_name,
            config: Arc::new(config),
        })
    }

    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(Arc::clone(&self.config))
    }
}

/// Parse every certificate block in `pem`; at least one is required.
fn parse_certificates(pem: &str, what: &str) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = Cursor::new(pem.as_bytes());
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| BootstrapError::Configuration(format!("failed to parse {}: {}", what, e)))?;

    if certs.is_empty() {
        return Err(BootstrapError::Configuration(format!(
            "no certificates found in {}",
            what
        )));
    }

    Ok(certs)
}

/// Parse the first private key block (PKCS#8, PKCS#1 or SEC1).
fn parse_private_key(pem: &str) -> Result<PrivateKeyDer<'static>> {
    let mut reader = Cursor::new(pem.as_bytes());
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| BootstrapError::Configuration(format!("failed to parse client key: {}", e)))?
        .ok_or_else(|| BootstrapError::Configuration("no private key found in client key".to_string()))
}
