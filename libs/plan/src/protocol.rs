//! Guest/host wire protocol.
//!
//! Newline-delimited JSON over a mutually authenticated TLS stream:
//! 1. Guest connects and sends `hello`
//! 2. Host sends `plan` (entries and manifest, in one message)
//! 3. Guest sends `ack`
//! 4. Guest sends `output` lines while RUN entries execute
//! 5. Guest sends a final `status`, then closes the stream

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::PlanError;
use crate::BuildPlan;

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

// =============================================================================
// Guest -> Host
// =============================================================================

/// Messages sent by the guest agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuestMessage {
    Hello {
        agent_version: String,
        protocol: u32,
        boot_id: String,
    },
    Ack {
        entries: usize,
    },
    Output {
        /// Index of the plan entry that produced the line.
        entry: usize,
        stream: OutputStream,
        line: String,
    },
    Status(StatusReport),
}

impl GuestMessage {
    pub fn name(&self) -> &'static str {
        match self {
            GuestMessage::Hello { .. } => "hello",
            GuestMessage::Ack { .. } => "ack",
            GuestMessage::Output { .. } => "output",
            GuestMessage::Status(_) => "status",
        }
    }
}

/// Which child stream an output line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl fmt::Display for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Terminal state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Succeeded,
    Failed,
}

/// Final status of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: RunState,
    pub timestamp: String,
    /// Index of the failing entry, when a plan entry failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StatusReport {
    pub fn succeeded() -> Self {
        Self {
            state: RunState::Succeeded,
            timestamp: chrono::Utc::now().to_rfc3339(),
            entry: None,
            reason: None,
            detail: None,
        }
    }

    pub fn failed(entry: Option<usize>, reason: &str, detail: &str) -> Self {
        Self {
            state: RunState::Failed,
            timestamp: chrono::Utc::now().to_rfc3339(),
            entry,
            reason: Some(reason.to_string()),
            detail: Some(detail.to_string()),
        }
    }
}

// =============================================================================
// Host -> Guest
// =============================================================================

/// Messages sent by the host plan server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMessage {
    Plan(BuildPlan),
}

impl HostMessage {
    pub fn into_plan(self) -> BuildPlan {
        match self {
            HostMessage::Plan(plan) => plan,
        }
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Serialize a message as one NDJSON line, newline included.
pub fn encode_line<T: Serialize>(msg: &T) -> Result<Vec<u8>, PlanError> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

/// Decode one NDJSON line. An empty line means the peer hung up.
pub fn decode_line<T: DeserializeOwned>(line: &str) -> Result<T, PlanError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(PlanError::ConnectionClosed);
    }
    Ok(serde_json::from_str(line)?)
}

/// Decode a line that must carry the build plan.
pub fn decode_plan(line: &str) -> Result<BuildPlan, PlanError> {
    if line.is_empty() {
        return Err(PlanError::ConnectionClosed);
    }

    let value: serde_json::Value = decode_line(line)?;
    let msg_type = value
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or_default()
        .to_string();
    if msg_type != "plan" {
        return Err(PlanError::UnexpectedMessage {
            expected: "plan",
            actual: msg_type,
        });
    }

    let msg: HostMessage = serde_json::from_value(value)?;
    Ok(msg.into_plan())
}
