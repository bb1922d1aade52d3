//! vmbuild guest bootstrap agent.
//!
//! Runs once inside a freshly booted build microVM:
//! - Loads bootstrap credentials (file or MMDS)
//! - Connects to the host plan server over mutual TLS
//! - Retrieves the resolved build plan in a single exchange
//! - Replays RUN and ADD/COPY entries in order against the guest filesystem
//! - Streams command output and the final status back to the host
//!
//! The first failing entry ends the run. Nothing is retried or rolled back.

pub mod bootstrap;
pub mod client;
pub mod config;
pub mod credentials;
pub mod deployer;
pub mod error;
pub mod logging;
pub mod reporter;
pub mod runner;
pub mod tls;
pub mod user;

pub use bootstrap::{BootstrapOptions, BootstrapState, Bootstrapper};
pub use client::{PlanClient, PlanSession};
pub use config::{AgentConfig, CredentialsSource};
pub use credentials::BootstrapCredentials;
pub use deployer::{FsResourceDeployer, ResourceDeployer};
pub use error::{BootstrapError, Result};
pub use reporter::{HostReporter, MemorySink, OutputSink};
pub use runner::{CommandRunner, ShellCommandRunner};
pub use tls::SecureChannel;

/// Agent version (semver), sent to the host in the hello message.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
