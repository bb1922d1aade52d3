//! Bootstrap orchestration.
//!
//! ```text
//! Idle -> Connecting -> Fetching -> Executing(0..n) -> Succeeded
//!            |              |             |
//!            +--------------+-------------+--> Failed
//! ```
//!
//! Entries run strictly in plan order. The first failing entry stops the
//! run; applied filesystem changes are not rolled back, the caller is
//! expected to discard the VM.

use std::fmt;
use std::time::Duration;

use tracing::{error, info};
use vmbuild_plan::protocol::StatusReport;
use vmbuild_plan::{BuildPlan, PlanEntry};

use crate::client::{PlanClient, PlanSession, DEFAULT_CONNECT_TIMEOUT};
use crate::credentials::BootstrapCredentials;
use crate::deployer::{FsResourceDeployer, ResourceDeployer};
use crate::error::{BootstrapError, Result};
use crate::reporter::OutputSink;
use crate::runner::{CommandRunner, ShellCommandRunner};
use crate::tls::SecureChannel;

/// How long to wait for queued reports to reach the host at the end of a run.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Bootstrapper lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    Connecting,
    Fetching,
    /// Executing the entry at this index.
    Executing { entry: usize },
    Succeeded,
    Failed,
}

impl fmt::Display for BootstrapState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BootstrapState::Idle => write!(f, "idle"),
            BootstrapState::Connecting => write!(f, "connecting"),
            BootstrapState::Fetching => write!(f, "fetching"),
            BootstrapState::Executing { entry } => write!(f, "executing({})", entry),
            BootstrapState::Succeeded => write!(f, "succeeded"),
            BootstrapState::Failed => write!(f, "failed"),
        }
    }
}

/// Transport timeouts for a run.
#[derive(Debug, Clone, Copy)]
pub struct BootstrapOptions {
    /// Bound on TCP connect plus TLS handshake.
    pub connect_timeout: Duration,
    /// Bound on flushing reports after the last entry.
    pub drain_timeout: Duration,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        }
    }
}

/// Fetches the build plan and replays it through the injected capabilities.
pub struct Bootstrapper {
    credentials: BootstrapCredentials,
    options: BootstrapOptions,
    runner: Box<dyn CommandRunner>,
    deployer: Box<dyn ResourceDeployer>,
    state: BootstrapState,
}

impl Bootstrapper {
    /// Create a bootstrapper with the shell runner and filesystem deployer.
    pub fn new(credentials: BootstrapCredentials, options: BootstrapOptions) -> Self {
        Self {
            credentials,
            options,
            runner: Box::new(ShellCommandRunner::new()),
            deployer: Box::new(FsResourceDeployer::new()),
            state: BootstrapState::Idle,
        }
    }

    pub fn with_command_runner(mut self, runner: impl CommandRunner + 'static) -> Self {
        self.runner = Box::new(runner);
        self
    }

    pub fn with_resource_deployer(mut self, deployer: impl ResourceDeployer + 'static) -> Self {
        self.deployer = Box::new(deployer);
        self
    }

    pub fn state(&self) -> BootstrapState {
        self.state
    }

    /// Run the whole bootstrap: build the channel, fetch the plan, execute
    /// it, report the outcome. Can only be called once.
    pub async fn execute(&mut self) -> Result<()> {
        if self.state != BootstrapState::Idle {
            return Err(BootstrapError::Configuration(format!(
                "bootstrapper already ran (state: {})",
                self.state
            )));
        }

        self.transition(BootstrapState::Connecting);
        let channel = match SecureChannel::build(&self.credentials) {
            Ok(channel) => channel,
            Err(e) => return Err(self.fail(e)),
        };

        self.transition(BootstrapState::Fetching);
        let client = PlanClient::new(channel, self.options.connect_timeout);
        let PlanSession { plan, reporter } = match client.fetch().await {
            Ok(session) => session,
            Err(e) => return Err(self.fail(e)),
        };

        let result = self.execute_plan(&plan, &reporter).await;
        match &result {
            Ok(()) => reporter.report_status(StatusReport::succeeded()),
            Err(e) => reporter.report_status(StatusReport::failed(
                e.entry_index(),
                e.reason_code(),
                &e.to_string(),
            )),
        }
        reporter.finish(self.options.drain_timeout).await;

        result
    }

    /// Execute an already retrieved plan, in order, stopping at the first
    /// failure. Output of RUN entries goes to `output`.
    pub async fn execute_plan(&mut self, plan: &BuildPlan, output: &dyn OutputSink) -> Result<()> {
        if !matches!(self.state, BootstrapState::Idle | BootstrapState::Fetching) {
            return Err(BootstrapError::Configuration(format!(
                "cannot execute a plan in state {}",
                self.state
            )));
        }

        let unresolved = plan.unresolved_sources();
        if !unresolved.is_empty() {
            // Still replayed in order; the first such entry fails the run.
            info!(sources = ?unresolved, "plan references sources missing from the manifest");
        }

        let total = plan.len();
        for (index, entry) in plan.entries.iter().enumerate() {
            self.transition(BootstrapState::Executing { entry: index });
            info!(
                entry = index,
                total,
                kind = entry.kind(),
                command = %entry,
                "executing plan entry"
            );

            let result = match entry {
                PlanEntry::Run(run) => self.runner.run(index, run, output).await,
                PlanEntry::Transfer(transfer) => {
                    self.deployer.deploy(transfer, &plan.resources).await
                }
            };

            if let Err(e) = result {
                return Err(self.fail(e.in_entry(index, &entry.to_string())));
            }
        }

        self.transition(BootstrapState::Succeeded);
        info!(entries = total, "build plan applied");
        Ok(())
    }

    fn transition(&mut self, next: BootstrapState) {
        tracing::debug!(from = %self.state, to = %next, "bootstrap state change");
        self.state = next;
    }

    fn fail(&mut self, err: BootstrapError) -> BootstrapError {
        error!(
            reason = err.reason_code(),
            entry = ?err.entry_index(),
            error = %err,
            "bootstrap failed"
        );
        self.transition(BootstrapState::Failed);
        err
    }
}
