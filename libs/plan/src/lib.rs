//! # vmbuild-plan
//!
//! Types shared between the host-side plan server and the in-guest
//! bootstrap agent.
//!
//! ## Build plans
//!
//! A [`BuildPlan`] is a fully resolved, already ordered list of
//! [`PlanEntry`] values plus a [`ResourceManifest`]. The host resolves
//! globs, remote sources and layer composition ahead of time; the guest
//! only replays the plan:
//!
//! - [`PlanEntry::Run`] executes a shell command
//! - [`PlanEntry::Transfer`] materializes one or more resolved resources
//!   (`ADD` and `COPY` both map here)
//!
//! ## Wire protocol
//!
//! Guest and host exchange newline-delimited JSON messages, see
//! [`protocol`].

mod commands;
mod error;
pub mod protocol;
mod resources;

pub use commands::*;
pub use error::PlanError;
pub use resources::*;

use serde::{Deserialize, Serialize};

/// A fully resolved build plan delivered to a guest in a single exchange.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    /// Entries in execution order.
    #[serde(default)]
    pub entries: Vec<PlanEntry>,

    /// Resolved resources keyed by original source identifier.
    #[serde(default)]
    pub resources: ResourceManifest,
}

impl BuildPlan {
    pub fn new(entries: Vec<PlanEntry>, resources: ResourceManifest) -> Self {
        Self { entries, resources }
    }

    /// Number of entries in the plan.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Source identifiers referenced by transfer entries that have no
    /// manifest match. The guest still replays the plan in order and fails
    /// when it reaches the first of these.
    pub fn unresolved_sources(&self) -> Vec<&str> {
        self.entries
            .iter()
            .filter_map(|entry| match entry {
                PlanEntry::Transfer(transfer) => Some(transfer.source.as_str()),
                PlanEntry::Run(_) => None,
            })
            .filter(|source| !self.resources.contains(source))
            .collect()
    }
}
