//! `guest-bootstrap`: replays the host-provided build plan inside the VM.
//!
//! Exit code 0 when every plan entry succeeded, 1 otherwise.

use std::process::ExitCode;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use vmbuild_guest_bootstrap::{config, logging, AgentConfig, Bootstrapper, VERSION};
use vmbuild_plan::protocol::PROTOCOL_VERSION;

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let boot_log = config::boot_log_path_from_env();
    if let Err(e) = logging::init(&boot_log) {
        // Still logging to stderr.
        warn!(path = %boot_log.display(), error = %e, "boot log unavailable");
    }

    let config = AgentConfig::from_env();

    info!(
        version = VERSION,
        protocol = PROTOCOL_VERSION,
        "guest-bootstrap starting"
    );

    match run(&config).await {
        Ok(()) => {
            info!("guest-bootstrap finished");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "guest-bootstrap failed");
            for cause in e.chain().skip(1) {
                error!(cause = %cause, "caused by");
            }
            ExitCode::from(1)
        }
    }
}

async fn run(config: &AgentConfig) -> Result<()> {
    let credentials = config
        .load_credentials()
        .await
        .context("loading bootstrap credentials")?;

    let mut bootstrapper = Bootstrapper::new(credentials, config.bootstrap_options());
    bootstrapper.execute().await?;

    Ok(())
}
