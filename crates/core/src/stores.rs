//! SQLite- and DataStore-backed implementations of the loop's collaborators.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forkloop_shared::{
    AcquireOutcome, AuditTrail, DataStore, DirectiveSink, Fingerprint, RecentFingerprintStore,
    RunId, RunState, RunStateStore, SALExt,
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::db::{self, AuditLogEntry};
use crate::selection::FORKLOOP_STORE_ID;

/// Key of the current directive in the `DataStore`.
pub const DIRECTIVE_KEY: &str = "directive:current";

pub struct SqliteRunStateStore {
    pool: SqlitePool,
}

impl SqliteRunStateStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RecentFingerprintStore for SqliteRunStateStore {
    async fn get(&self) -> anyhow::Result<HashMap<Fingerprint, DateTime<Utc>>> {
        db::load_recent_fingerprints(&self.pool).await
    }

    async fn merge(
        &self,
        entries: &[(Fingerprint, DateTime<Utc>)],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        db::merge_recent_fingerprints(&self.pool, entries, prune_before).await
    }
}

#[async_trait]
impl RunStateStore for SqliteRunStateStore {
    async fn load(&self) -> anyhow::Result<RunState> {
        db::load_run_state(&self.pool).await
    }

    async fn try_acquire(
        &self,
        now: DateTime<Utc>,
        cooldown_secs: u64,
        lease_ttl_secs: u64,
    ) -> anyhow::Result<AcquireOutcome> {
        db::try_acquire_run_lease(&self.pool, now, cooldown_secs, lease_ttl_secs).await
    }

    async fn complete(
        &self,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
        fingerprints: &[Fingerprint],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        db::complete_run(&self.pool, lease, now, fingerprints, prune_before).await
    }

    async fn release(&self, lease: DateTime<Utc>) -> anyhow::Result<()> {
        db::release_run_lease(&self.pool, lease).await
    }
}

/// Writes one `audit_logs` row per phase; the run id goes in `trace_id`.
pub struct SqliteAuditTrail {
    pool: SqlitePool,
}

impl SqliteAuditTrail {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditTrail for SqliteAuditTrail {
    async fn write(&self, run_id: RunId, phase: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        let result = match phase {
            "abort" => "ABORTED",
            "gate_block" => "BLOCKED",
            _ => "RECORDED",
        };
        db::write_audit_log(
            &self.pool,
            AuditLogEntry {
                timestamp: Utc::now(),
                event_type: phase.to_string(),
                actor_id: Some("forkloop".to_string()),
                target_id: None,
                result: result.to_string(),
                reason: format!("{} phase", phase),
                metadata: Some(payload),
                trace_id: Some(run_id.to_string()),
            },
        )
        .await
    }
}

/// The directive slot, stored under [`DIRECTIVE_KEY`].
pub struct StoreDirectiveSink {
    store: Arc<dyn DataStore>,
}

impl StoreDirectiveSink {
    pub fn new(store: Arc<dyn DataStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl DirectiveSink for StoreDirectiveSink {
    async fn read_previous(&self) -> anyhow::Result<Option<String>> {
        self.store.load(FORKLOOP_STORE_ID, DIRECTIVE_KEY).await
    }

    async fn write(&self, directive: &str) -> anyhow::Result<()> {
        self.store.save(FORKLOOP_STORE_ID, DIRECTIVE_KEY, &directive).await
    }

    async fn clear(&self) -> anyhow::Result<()> {
        self.store.delete_json(FORKLOOP_STORE_ID, DIRECTIVE_KEY).await
    }
}
