//! Bootstrap credentials: where the plan server is and how to trust it.
//!
//! The host injects these before boot, either as a JSON file on the guest
//! filesystem or through the Firecracker metadata service (MMDS).

use std::fmt;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{BootstrapError, Result};

/// MMDS session token lifetime requested by the agent.
const MMDS_TOKEN_TTL_SECS: u32 = 60;

/// Everything needed to reach and authenticate against the plan server.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct BootstrapCredentials {
    /// `host:port` of the plan server.
    pub host_port: String,

    /// One or more PEM certificates, newline-joined.
    pub ca_chain: String,

    /// PEM client certificate.
    pub certificate: String,

    /// PEM client private key.
    pub key: String,

    /// Name the server certificate must be valid for. Usually differs from
    /// the address in `host_port`.
    pub server_name: String,
}

impl fmt::Debug for BootstrapCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BootstrapCredentials")
            .field("host_port", &self.host_port)
            .field("server_name", &self.server_name)
            .field("ca_chain_bytes", &self.ca_chain.len())
            .field("certificate_bytes", &self.certificate.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

impl BootstrapCredentials {
    /// Load credentials from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            BootstrapError::Configuration(format!(
                "failed to read bootstrap file {}: {}",
                path.display(),
                e
            ))
        })?;

        let credentials: Self = serde_json::from_str(&raw).map_err(|e| {
            BootstrapError::Configuration(format!("invalid bootstrap file JSON: {}", e))
        })?;
        credentials.validate()?;

        info!(path = %path.display(), host_port = %credentials.host_port, "bootstrap credentials loaded");
        Ok(credentials)
    }

    /// Fetch credentials from the metadata service at `base_url`.
    ///
    /// Uses the token-based flow: `PUT /latest/api/token`, then
    /// `GET /latest/meta-data/bootstrap` with the token attached.
    pub async fn from_mmds(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim_end_matches('/');
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| BootstrapError::Configuration(format!("mmds client: {}", e)))?;

        let token = client
            .put(format!("{}/latest/api/token", base_url))
            .header(
                "X-metadata-token-ttl-seconds",
                MMDS_TOKEN_TTL_SECS.to_string(),
            )
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BootstrapError::Configuration(format!("mmds token request: {}", e)))?
            .text()
            .await
            .map_err(|e| BootstrapError::Configuration(format!("mmds token body: {}", e)))?;
        debug!("mmds session token acquired");

        let credentials: Self = client
            .get(format!("{}/latest/meta-data/bootstrap", base_url))
            .header("X-metadata-token", token.trim())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| BootstrapError::Configuration(format!("mmds bootstrap request: {}", e)))?
            .json()
            .await
            .map_err(|e| BootstrapError::Configuration(format!("invalid mmds bootstrap: {}", e)))?;
        credentials.validate()?;

        info!(host_port = %credentials.host_port, "bootstrap credentials fetched from mmds");
        Ok(credentials)
    }

    /// Reject credentials that cannot possibly be used.
    pub fn validate(&self) -> Result<()> {
        if self.host_port.trim().is_empty() {
            return Err(BootstrapError::Configuration(
                "host_port is empty".to_string(),
            ));
        }
        if self.server_name.trim().is_empty() {
            return Err(BootstrapError::Configuration(
                "server_name is empty".to_string(),
            ));
        }
        Ok(())
    }
}
