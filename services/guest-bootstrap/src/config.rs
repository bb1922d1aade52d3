//! Agent configuration from the environment.
//!
//! | Variable | Default |
//! |---|---|
//! | `VMBUILD_BOOTSTRAP_FILE` | unset: credentials come from MMDS |
//! | `VMBUILD_MMDS_URL` | `http://169.254.169.254` |
//! | `VMBUILD_CONNECT_TIMEOUT_SECS` | `10` |
//! | `VMBUILD_BOOT_LOG` | `/var/log/vmbuild-bootstrap.log` |

use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::bootstrap::{BootstrapOptions, DEFAULT_DRAIN_TIMEOUT};
use crate::client::DEFAULT_CONNECT_TIMEOUT;
use crate::credentials::BootstrapCredentials;
use crate::error::Result;

/// Default Firecracker metadata service address.
pub const DEFAULT_MMDS_URL: &str = "http://169.254.169.254";

/// Default boot log location.
pub const DEFAULT_BOOT_LOG: &str = "/var/log/vmbuild-bootstrap.log";

/// Boot log location from the environment. Read on its own so logging can
/// be up before the rest of the configuration is parsed.
pub fn boot_log_path_from_env() -> PathBuf {
    boot_log_path(&|key: &str| std::env::var(key).ok())
}

fn boot_log_path(lookup: &impl Fn(&str) -> Option<String>) -> PathBuf {
    lookup("VMBUILD_BOOT_LOG")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_BOOT_LOG))
}

/// Where the bootstrap credentials are read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CredentialsSource {
    /// A JSON file on the guest filesystem.
    File(PathBuf),
    /// The metadata service at this base URL.
    Mmds { url: String },
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub credentials_source: CredentialsSource,
    pub connect_timeout: Duration,
    pub drain_timeout: Duration,
    pub boot_log_path: PathBuf,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let credentials_source = match non_empty("VMBUILD_BOOTSTRAP_FILE") {
            Some(path) => CredentialsSource::File(PathBuf::from(path)),
            None => CredentialsSource::Mmds {
                url: non_empty("VMBUILD_MMDS_URL").unwrap_or_else(|| DEFAULT_MMDS_URL.to_string()),
            },
        };

        let connect_timeout = match non_empty("VMBUILD_CONNECT_TIMEOUT_SECS") {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => Duration::from_secs(secs),
                _ => {
                    warn!(value = %raw, "invalid VMBUILD_CONNECT_TIMEOUT_SECS, using default");
                    DEFAULT_CONNECT_TIMEOUT
                }
            },
            None => DEFAULT_CONNECT_TIMEOUT,
        };

        Self {
            credentials_source,
            connect_timeout,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            boot_log_path: boot_log_path(&lookup),
        }
    }

    pub fn bootstrap_options(&self) -> BootstrapOptions {
        BootstrapOptions {
            connect_timeout: self.connect_timeout,
            drain_timeout: self.drain_timeout,
        }
    }

    /// Read the bootstrap credentials from the configured source.
    pub async fn load_credentials(&self) -> Result<BootstrapCredentials> {
        match &self.credentials_source {
            CredentialsSource::File(path) => BootstrapCredentials::from_file(path),
            CredentialsSource::Mmds { url } => {
                BootstrapCredentials::from_mmds(url, self.connect_timeout).await
            }
        }
    }
}
