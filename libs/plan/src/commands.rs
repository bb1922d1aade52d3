//! Plan entry definitions.
//!
//! Entries are produced on the host from build instructions after argument
//! substitution and resource resolution. Field values are final: the guest
//! never consults the original build file.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Shell used for RUN entries when the build file does not override it.
pub const DEFAULT_SHELL: &[&str] = &["/bin/sh", "-c"];

/// User commands run as when the build file does not set one.
pub const DEFAULT_USER: &str = "0:0";

/// Working directory used when the build file does not set one.
pub const DEFAULT_WORKDIR: &str = "/";

// =============================================================================
// Context Types
// =============================================================================

/// Shell invocation descriptor: the argv prefix a command string is
/// appended to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Shell(pub Vec<String>);

impl Shell {
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(argv.into_iter().map(Into::into).collect())
    }

    /// Full argv for running `command` under this shell.
    pub fn argv(&self, command: &str) -> Vec<String> {
        let mut argv = self.0.clone();
        argv.push(command.to_string());
        argv
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Default for Shell {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL.iter().copied())
    }
}

/// Effective user, in `user[:group]` form where either side is a name or a
/// numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct User(pub String);

impl User {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Split into the user part and the optional group part.
    pub fn parts(&self) -> (&str, Option<&str>) {
        match self.0.split_once(':') {
            Some((user, group)) if !group.is_empty() => (user, Some(group)),
            Some((user, _)) => (user, None),
            None => (self.0.as_str(), None),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for User {
    fn default() -> Self {
        Self::new(DEFAULT_USER)
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Effective working directory inside the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workdir(pub String);

impl Workdir {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Workdir {
    fn default() -> Self {
        Self::new(DEFAULT_WORKDIR)
    }
}

impl fmt::Display for Workdir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// Plan Entries
// =============================================================================

/// One step of a build plan.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanEntry {
    /// Run a shell command.
    Run(RunEntry),
    /// Materialize resolved resources on disk.
    Transfer(TransferEntry),
}

impl PlanEntry {
    /// The instruction text this entry was derived from.
    pub fn original_command(&self) -> &str {
        match self {
            PlanEntry::Run(run) => &run.original_command,
            PlanEntry::Transfer(transfer) => &transfer.original_command,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PlanEntry::Run(_) => "run",
            PlanEntry::Transfer(transfer) => transfer.kind.as_str(),
        }
    }
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.original_command() {
            "" => match self {
                PlanEntry::Run(run) => write!(f, "RUN {}", run.command),
                PlanEntry::Transfer(transfer) => write!(
                    f,
                    "{} {} {}",
                    transfer.kind.as_str().to_uppercase(),
                    transfer.source,
                    transfer.target
                ),
            },
            original => f.write_str(original),
        }
    }
}

/// A RUN instruction with build arguments already substituted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEntry {
    /// Instruction as written in the build file (diagnostics only).
    #[serde(default)]
    pub original_command: String,

    /// Build arguments visible to the command.
    #[serde(default)]
    pub args: HashMap<String, String>,

    /// Command string passed to the shell.
    pub command: String,

    /// Environment variables visible to the command.
    #[serde(default)]
    pub env: HashMap<String, String>,

    #[serde(default)]
    pub shell: Shell,

    #[serde(default)]
    pub user: User,

    #[serde(default)]
    pub workdir: Workdir,
}

impl RunEntry {
    /// Run `command` with the default shell, user and workdir.
    pub fn new(command: impl Into<String>) -> Self {
        let command = command.into();
        Self {
            original_command: format!("RUN {}", command),
            args: HashMap::new(),
            command,
            env: HashMap::new(),
            shell: Shell::default(),
            user: User::default(),
            workdir: Workdir::default(),
        }
    }
}

/// Whether a transfer came from an ADD or a COPY instruction. Only the
/// host-side resolution differs; the guest deploys both the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Add,
    Copy,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Add => "add",
            TransferKind::Copy => "copy",
        }
    }
}

/// An ADD or COPY instruction. Its resources are looked up in the plan's
/// manifest by `source`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferEntry {
    #[serde(default)]
    pub original_command: String,

    pub kind: TransferKind,

    /// Original source identifier, the manifest key.
    pub source: String,

    /// Target path inside the guest.
    pub target: String,

    #[serde(default)]
    pub user: User,

    #[serde(default)]
    pub workdir: Workdir,
}

impl TransferEntry {
    pub fn new(kind: TransferKind, source: impl Into<String>, target: impl Into<String>) -> Self {
        let source = source.into();
        let target = target.into();
        Self {
            original_command: format!("{} {} {}", kind.as_str().to_uppercase(), source, target),
            kind,
            source,
            target,
            user: User::default(),
            workdir: Workdir::default(),
        }
    }
}
