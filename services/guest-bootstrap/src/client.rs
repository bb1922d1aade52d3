//! Plan retrieval over the mutual-TLS channel.
//!
//! Protocol (see `vmbuild_plan::protocol`):
//! 1. Guest connects and completes the TLS handshake
//! 2. Guest sends hello
//! 3. Host sends the whole plan in one message
//! 4. Guest sends ack
//!
//! The stream stays open afterwards for progress reporting only. There is
//! no retry: the plan server serves exactly one guest for one boot.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tracing::{debug, info};
use uuid::Uuid;
use vmbuild_plan::protocol::{decode_plan, encode_line, GuestMessage, PROTOCOL_VERSION};
use vmbuild_plan::BuildPlan;

use crate::error::{BootstrapError, Result};
use crate::reporter::HostReporter;
use crate::tls::SecureChannel;
use crate::VERSION;

/// Default bound on TCP connect plus TLS handshake.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A retrieved plan plus the reporter bound to the same connection.
pub struct PlanSession {
    pub plan: BuildPlan,
    pub reporter: HostReporter,
}

/// One-shot client for the host plan server.
#[derive(Debug, Clone)]
pub struct PlanClient {
    channel: SecureChannel,
    connect_timeout: Duration,
}

impl PlanClient {
    pub fn new(channel: SecureChannel, connect_timeout: Duration) -> Self {
        Self {
            channel,
            connect_timeout,
        }
    }

    /// Connect, exchange hello/plan/ack, and hand the write half of the
    /// stream to a [`HostReporter`].
    pub async fn fetch(&self) -> Result<PlanSession> {
        let stream = tokio::time::timeout(self.connect_timeout, self.connect())
            .await
            .map_err(|_| {
                BootstrapError::Connection(format!(
                    "timed out after {}ms connecting to {}",
                    self.connect_timeout.as_millis(),
                    self.channel.host_port
                ))
            })??;

        let (read_half, mut write_half) = tokio::io::split(stream);

        let hello = GuestMessage::Hello {
            agent_version: VERSION.to_string(),
            protocol: PROTOCOL_VERSION,
            boot_id: Uuid::new_v4().to_string(),
        };
        send(&mut write_half, &hello).await?;
        debug!("sent hello");

        let mut reader = BufReader::new(read_half);
        let mut line = String::new();
        reader.read_line(&mut line).await.map_err(|e| {
            BootstrapError::Connection(format!("connection lost before plan was received: {}", e))
        })?;

        let plan = decode_plan(&line)?;
        info!(
            entries = plan.len(),
            sources = plan.resources.len(),
            "build plan received"
        );

        send(&mut write_half, &GuestMessage::Ack { entries: plan.len() }).await?;
        debug!("sent ack");

        Ok(PlanSession {
            plan,
            reporter: HostReporter::spawn(write_half),
        })
    }

    async fn connect(&self) -> Result<TlsStream<TcpStream>> {
        let host_port = &self.channel.host_port;
        info!(host_port = %host_port, "connecting to plan server");

        let tcp = TcpStream::connect(host_port).await.map_err(|e| {
            BootstrapError::Connection(format!("failed to connect to {}: {}", host_port, e))
        })?;
        if let Err(e) = tcp.set_nodelay(true) {
            debug!(error = %e, "failed to set TCP_NODELAY");
        }

        let stream = self
            .channel
            .connector()
            .connect(self.channel.server_name.clone(), tcp)
            .await
            .map_err(|e| {
                BootstrapError::Connection(format!("TLS handshake with {} failed: {}", host_port, e))
            })?;

        info!("connected to plan server");
        Ok(stream)
    }
}

async fn send<W>(writer: &mut W, msg: &GuestMessage) -> Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let line = encode_line(msg)?;
    writer
        .write_all(&line)
        .await
        .map_err(|e| BootstrapError::Connection(format!("failed to send {}: {}", msg.name(), e)))?;
    writer
        .flush()
        .await
        .map_err(|e| BootstrapError::Connection(format!("failed to send {}: {}", msg.name(), e)))
}
