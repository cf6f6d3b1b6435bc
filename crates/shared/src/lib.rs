use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

mod model;

pub use model::*;

/// Crate version, reported in audit metadata and the operator binary.
pub const SDK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Unique identifier of one exploration cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

// Tagged so errors survive a round-trip through audit metadata
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "detail")]
pub enum ForkError {
    #[error("Insufficient candidates: {survivors} survived filtering, {required} required")]
    InsufficientCandidates { survivors: usize, required: usize },
    #[error("Insufficient results: {evaluated} evaluated successfully, {required} required")]
    InsufficientResults { evaluated: usize, required: usize },
    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),
    #[error("Evaluation failed for {fingerprint}: {message}")]
    Evaluation { fingerprint: String, message: String },
    #[error("Timeout occurred: {0}")]
    Timeout(String),
    #[error("Storage error: {0}")]
    Storage(String),
    #[error("Run lease lost: lease taken at {0} is no longer held")]
    LeaseLost(String),
}

impl ForkError {
    /// Fatal errors abort the whole cycle before any state mutation.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCandidates { .. } | Self::InsufficientResults { .. }
        )
    }
}

// ══════════════════════════════════════════════════════════════
// Storage abstraction
// ══════════════════════════════════════════════════════════════

/// JSON key/value storage scoped by owner id.
#[async_trait]
pub trait DataStore: Send + Sync {
    async fn set_json(&self, owner_id: &str, key: &str, value: serde_json::Value) -> anyhow::Result<()>;
    async fn get_json(&self, owner_id: &str, key: &str) -> anyhow::Result<Option<serde_json::Value>>;
    async fn delete_json(&self, owner_id: &str, key: &str) -> anyhow::Result<()>;
}

/// Typed helpers over [`DataStore`].
#[async_trait]
pub trait SALExt: DataStore {
    async fn save<T: Serialize + Sync>(&self, owner_id: &str, key: &str, value: &T) -> anyhow::Result<()> {
        self.set_json(owner_id, key, serde_json::to_value(value)?).await
    }

    async fn load<T: for<'de> Deserialize<'de>>(&self, owner_id: &str, key: &str) -> anyhow::Result<Option<T>> {
        if let Some(json) = self.get_json(owner_id, key).await? {
            Ok(Some(serde_json::from_value(json)?))
        } else {
            Ok(None)
        }
    }
}

impl<T: DataStore + ?Sized> SALExt for T {}

// ══════════════════════════════════════════════════════════════
// Collaborators
// ══════════════════════════════════════════════════════════════

/// Scores one candidate. Implementations must be safe to call concurrently
/// for different candidates.
#[async_trait]
pub trait Evaluator: Send + Sync {
    fn name(&self) -> &str;
    async fn evaluate(&self, config: &ForkConfig) -> anyhow::Result<ForkResult>;
}

/// Durable record of which fingerprints were evaluated, and when.
#[async_trait]
pub trait RecentFingerprintStore: Send + Sync {
    async fn get(&self) -> anyhow::Result<HashMap<Fingerprint, DateTime<Utc>>>;
    /// Upserts `entries` and drops every entry last seen before `prune_before`.
    async fn merge(
        &self,
        entries: &[(Fingerprint, DateTime<Utc>)],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()>;
}

/// Persisted cooldown state with single-writer lease semantics.
///
/// `try_acquire` must be atomic with respect to every other caller of the
/// same backing store: at most one caller observes `Granted` while a lease
/// is live.
#[async_trait]
pub trait RunStateStore: RecentFingerprintStore {
    async fn load(&self) -> anyhow::Result<RunState>;

    async fn try_acquire(
        &self,
        now: DateTime<Utc>,
        cooldown_secs: u64,
        lease_ttl_secs: u64,
    ) -> anyhow::Result<AcquireOutcome>;

    /// RUNNING → IDLE after a completed cycle: stamps `last_run`, merges the
    /// run's fingerprints and prunes expired ones in one step.
    ///
    /// `lease` is the `now` the lease was granted at. Fails with
    /// [`ForkError::LeaseLost`] and changes nothing if another caller has
    /// since taken the lease over.
    async fn complete(
        &self,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
        fingerprints: &[Fingerprint],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// RUNNING → IDLE without recording a run (fatal abort). Same fencing
    /// as [`RunStateStore::complete`].
    async fn release(&self, lease: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Append-only per-phase record writer.
#[async_trait]
pub trait AuditTrail: Send + Sync {
    async fn write(&self, run_id: RunId, phase: &str, payload: serde_json::Value) -> anyhow::Result<()>;
}

/// The single "current instruction" slot.
#[async_trait]
pub trait DirectiveSink: Send + Sync {
    async fn read_previous(&self) -> anyhow::Result<Option<String>>;
    async fn write(&self, directive: &str) -> anyhow::Result<()>;
    /// Empties the slot.
    async fn clear(&self) -> anyhow::Result<()>;
}
