use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forkloop_shared::{AcquireOutcome, DataStore, Fingerprint, ForkError, RunState};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::future::Future;
use std::str::FromStr;
use tokio::time::{timeout, Duration};
use tracing::info;

// Database operation timeout to prevent indefinite hangs on locks
const DB_TIMEOUT_SECS: u64 = 10;

/// Await a sqlx future under [`DB_TIMEOUT_SECS`], flattening both failure modes.
async fn with_timeout<T, F>(what: &str, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let result = timeout(Duration::from_secs(DB_TIMEOUT_SECS), fut)
        .await
        .map_err(|_| ForkError::Timeout(format!("{} after {}s", what, DB_TIMEOUT_SECS)))?;
    result.map_err(|e| ForkError::Storage(format!("{} failed: {}", what, e)).into())
}

fn millis_to_utc(ms: i64) -> anyhow::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| anyhow::anyhow!("Stored timestamp {} is out of range", ms))
}

/// Open (creating if necessary) the SQLite database behind `database_url`.
///
/// In-memory databases are pinned to a single connection: every new
/// connection to `sqlite::memory:` would otherwise see an empty database.
pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    if let Some(path_str) = database_url.strip_prefix("sqlite:") {
        let db_path = std::path::Path::new(path_str);
        if !path_str.starts_with(":memory:") {
            if let Some(parent) = db_path.parent() {
                if !parent.as_os_str().is_empty() && parent != std::path::Path::new(".") {
                    std::fs::create_dir_all(parent)?;
                    info!("📁 Data directory: {}", parent.display());
                }
            }
        }
    }

    let opts = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(opts)
        .await?;
    Ok(pool)
}

pub async fn init_db(pool: &SqlitePool) -> anyhow::Result<()> {
    info!("Running database migrations...");

    // 30s for schema changes
    const MIGRATION_TIMEOUT_SECS: u64 = 30;
    let migration_future = sqlx::migrate!("./migrations").run(pool);
    timeout(
        Duration::from_secs(MIGRATION_TIMEOUT_SECS),
        migration_future,
    )
    .await
    .map_err(|_| {
        anyhow::anyhow!(
            "Database migrations timed out after {}s",
            MIGRATION_TIMEOUT_SECS
        )
    })?
    .map_err(|e| anyhow::anyhow!("Database migration failed: {}", e))?;

    Ok(())
}

// ============================================================
// Key/value storage
// ============================================================

fn validate_key(owner_id: &str, key: &str) -> anyhow::Result<()> {
    if owner_id.contains('\0') || owner_id.len() > 255 {
        return Err(anyhow::anyhow!(
            "owner_id must not contain null bytes and must be <= 255 chars"
        ));
    }
    if key.contains('\0') {
        return Err(anyhow::anyhow!("Key must not contain null bytes"));
    }
    if key.len() > 255 {
        return Err(anyhow::anyhow!(
            "Key exceeds maximum length (255 characters)"
        ));
    }
    Ok(())
}

pub struct SqliteDataStore {
    pool: SqlitePool,
}

impl SqliteDataStore {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DataStore for SqliteDataStore {
    async fn set_json(
        &self,
        owner_id: &str,
        key: &str,
        value: serde_json::Value,
    ) -> anyhow::Result<()> {
        validate_key(owner_id, key)?;
        let val_str = serde_json::to_string(&value)?;

        let query_future = sqlx::query(
            "INSERT OR REPLACE INTO kv_data (owner_id, key, value) VALUES (?, ?, ?)",
        )
        .bind(owner_id)
        .bind(key)
        .bind(val_str)
        .execute(&self.pool);

        with_timeout(&format!("Saving key '{}' for '{}'", key, owner_id), query_future).await?;
        Ok(())
    }

    async fn get_json(
        &self,
        owner_id: &str,
        key: &str,
    ) -> anyhow::Result<Option<serde_json::Value>> {
        validate_key(owner_id, key)?;

        let query_future = sqlx::query_as::<_, (String,)>(
            "SELECT value FROM kv_data WHERE owner_id = ? AND key = ?",
        )
        .bind(owner_id)
        .bind(key)
        .fetch_optional(&self.pool);

        let row = with_timeout(&format!("Reading key '{}' for '{}'", key, owner_id), query_future).await?;

        if let Some((val_str,)) = row {
            let val = serde_json::from_str(&val_str)?;
            Ok(Some(val))
        } else {
            Ok(None)
        }
    }

    async fn delete_json(&self, owner_id: &str, key: &str) -> anyhow::Result<()> {
        validate_key(owner_id, key)?;

        let query_future = sqlx::query("DELETE FROM kv_data WHERE owner_id = ? AND key = ?")
            .bind(owner_id)
            .bind(key)
            .execute(&self.pool);

        with_timeout(&format!("Deleting key '{}' for '{}'", key, owner_id), query_future).await?;
        Ok(())
    }
}

// ============================================================
// Audit log
// ============================================================

/// One append-only audit record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub actor_id: Option<String>,
    pub target_id: Option<String>,
    pub result: String,
    pub reason: String,
    pub metadata: Option<serde_json::Value>,
    pub trace_id: Option<String>,
}

pub async fn write_audit_log(pool: &SqlitePool, entry: AuditLogEntry) -> anyhow::Result<()> {
    let timestamp = entry.timestamp.to_rfc3339();
    let metadata_str = entry.metadata.map(|v| v.to_string());

    let query_future = sqlx::query(
        "INSERT INTO audit_logs (timestamp, event_type, actor_id, target_id, result, reason, metadata, trace_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    )
    .bind(&timestamp)
    .bind(&entry.event_type)
    .bind(&entry.actor_id)
    .bind(&entry.target_id)
    .bind(&entry.result)
    .bind(&entry.reason)
    .bind(&metadata_str)
    .bind(&entry.trace_id)
    .execute(pool);

    with_timeout("Writing audit log", query_future).await?;
    Ok(())
}

/// Most recent audit records first.
pub async fn query_audit_logs(pool: &SqlitePool, limit: i64) -> anyhow::Result<Vec<AuditLogEntry>> {
    #[allow(clippy::type_complexity)]
    let query_future = sqlx::query_as::<_, (String, String, Option<String>, Option<String>, String, String, Option<String>, Option<String>)>(
            "SELECT timestamp, event_type, actor_id, target_id, result, reason, metadata, trace_id
             FROM audit_logs
             ORDER BY id DESC
             LIMIT ?"
        )
        .bind(limit)
        .fetch_all(pool);

    let rows = with_timeout("Querying audit logs", query_future).await?;

    let mut logs = Vec::new();
    for (timestamp, event_type, actor, target, result, reason, metadata, trace) in rows {
        logs.push(AuditLogEntry {
            timestamp: DateTime::parse_from_rfc3339(&timestamp)?.with_timezone(&Utc),
            event_type,
            actor_id: actor,
            target_id: target,
            result,
            reason,
            metadata: metadata.and_then(|s| serde_json::from_str(&s).ok()),
            trace_id: trace,
        });
    }

    Ok(logs)
}

// ============================================================
// Run state (cooldown lease + recent fingerprints)
// ============================================================

async fn ensure_run_state_row(pool: &SqlitePool) -> anyhow::Result<()> {
    let query_future = sqlx::query(
        "INSERT OR IGNORE INTO run_state (id, last_run_ms, lease_started_ms) VALUES (1, NULL, NULL)",
    )
    .execute(pool);
    with_timeout("Seeding run state", query_future).await?;
    Ok(())
}

pub async fn load_recent_fingerprints(
    pool: &SqlitePool,
) -> anyhow::Result<HashMap<Fingerprint, DateTime<Utc>>> {
    let query_future = sqlx::query_as::<_, (String, i64)>(
        "SELECT fingerprint, seen_ms FROM recent_fingerprints",
    )
    .fetch_all(pool);

    let rows = with_timeout("Loading recent fingerprints", query_future).await?;
    let mut recent = HashMap::with_capacity(rows.len());
    for (fingerprint, seen_ms) in rows {
        recent.insert(Fingerprint::from_hex(fingerprint), millis_to_utc(seen_ms)?);
    }
    Ok(recent)
}

pub async fn load_run_state(pool: &SqlitePool) -> anyhow::Result<RunState> {
    ensure_run_state_row(pool).await?;

    let query_future = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
        "SELECT last_run_ms, lease_started_ms FROM run_state WHERE id = 1",
    )
    .fetch_one(pool);

    let (last_run_ms, lease_started_ms) = with_timeout("Loading run state", query_future).await?;

    Ok(RunState {
        last_run_timestamp: last_run_ms.map(millis_to_utc).transpose()?,
        recent_fingerprints: load_recent_fingerprints(pool).await?,
        lease_started_at: lease_started_ms.map(millis_to_utc).transpose()?,
    })
}

/// Atomically take the run lease if the cooldown has elapsed and no live
/// lease exists. The single conditional UPDATE is the mutual-exclusion
/// point: SQLite serialises writers, so only one caller can see
/// `rows_affected == 1`.
pub async fn try_acquire_run_lease(
    pool: &SqlitePool,
    now: DateTime<Utc>,
    cooldown_secs: u64,
    lease_ttl_secs: u64,
) -> anyhow::Result<AcquireOutcome> {
    ensure_run_state_row(pool).await?;

    let now_ms = now.timestamp_millis();
    let cooldown_ms = i64::try_from(cooldown_secs.saturating_mul(1000)).unwrap_or(i64::MAX);
    let lease_ttl_ms = i64::try_from(lease_ttl_secs.saturating_mul(1000)).unwrap_or(i64::MAX);

    let query_future = sqlx::query(
        "UPDATE run_state SET lease_started_ms = ?
         WHERE id = 1
           AND (lease_started_ms IS NULL OR lease_started_ms <= ? - ?)
           AND (last_run_ms IS NULL OR ? - last_run_ms >= ?)",
    )
    .bind(now_ms)
    .bind(now_ms)
    .bind(lease_ttl_ms)
    .bind(now_ms)
    .bind(cooldown_ms)
    .execute(pool);

    let result = with_timeout("Acquiring run lease", query_future).await?;
    if result.rows_affected() == 1 {
        return Ok(AcquireOutcome::Granted);
    }

    // Rejected: work out why for the caller.
    let query_future = sqlx::query_as::<_, (Option<i64>, Option<i64>)>(
        "SELECT last_run_ms, lease_started_ms FROM run_state WHERE id = 1",
    )
    .fetch_one(pool);
    let (last_run_ms, lease_started_ms) = with_timeout("Loading run state", query_future).await?;

    if let Some(started) = lease_started_ms {
        if started > now_ms.saturating_sub(lease_ttl_ms) {
            return Ok(AcquireOutcome::Busy {
                since: millis_to_utc(started)?,
            });
        }
    }

    let remaining_ms = last_run_ms
        .map(|last| cooldown_ms.saturating_sub(now_ms.saturating_sub(last)))
        .unwrap_or(0)
        .max(0);
    let remaining_secs = u64::try_from((remaining_ms + 999) / 1000).unwrap_or(0);
    Ok(AcquireOutcome::CoolingDown { remaining_secs })
}

fn lease_lost(lease: DateTime<Utc>) -> anyhow::Error {
    ForkError::LeaseLost(lease.to_rfc3339()).into()
}

/// Clear the lease taken at `lease` without recording a run.
pub async fn release_run_lease(pool: &SqlitePool, lease: DateTime<Utc>) -> anyhow::Result<()> {
    let query_future = sqlx::query(
        "UPDATE run_state SET lease_started_ms = NULL WHERE id = 1 AND lease_started_ms = ?",
    )
    .bind(lease.timestamp_millis())
    .execute(pool);
    let result = with_timeout("Releasing run lease", query_future).await?;
    if result.rows_affected() == 0 {
        return Err(lease_lost(lease));
    }
    Ok(())
}

async fn upsert_fingerprints(
    conn: &mut sqlx::SqliteConnection,
    entries: &[(Fingerprint, DateTime<Utc>)],
    prune_before: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    for (fingerprint, seen_at) in entries {
        sqlx::query(
            "INSERT INTO recent_fingerprints (fingerprint, seen_ms) VALUES (?, ?)
             ON CONFLICT(fingerprint) DO UPDATE SET seen_ms = MAX(seen_ms, excluded.seen_ms)",
        )
        .bind(fingerprint.as_str())
        .bind(seen_at.timestamp_millis())
        .execute(&mut *conn)
        .await?;
    }
    sqlx::query("DELETE FROM recent_fingerprints WHERE seen_ms < ?")
        .bind(prune_before.timestamp_millis())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn merge_recent_fingerprints(
    pool: &SqlitePool,
    entries: &[(Fingerprint, DateTime<Utc>)],
    prune_before: DateTime<Utc>,
) -> anyhow::Result<()> {
    let tx_future = async {
        let mut tx = pool.begin().await?;
        upsert_fingerprints(&mut *tx, entries, prune_before).await?;
        tx.commit().await
    };
    with_timeout("Merging recent fingerprints", tx_future).await
}

/// RUNNING → IDLE for a completed cycle, in a single transaction. Nothing
/// is written unless the lease taken at `lease` is still held.
pub async fn complete_run(
    pool: &SqlitePool,
    lease: DateTime<Utc>,
    now: DateTime<Utc>,
    fingerprints: &[Fingerprint],
    prune_before: DateTime<Utc>,
) -> anyhow::Result<()> {
    let entries: Vec<(Fingerprint, DateTime<Utc>)> =
        fingerprints.iter().map(|fp| (fp.clone(), now)).collect();

    let tx_future = async {
        let mut tx = pool.begin().await?;
        let updated = sqlx::query(
            "UPDATE run_state SET last_run_ms = ?, lease_started_ms = NULL
             WHERE id = 1 AND lease_started_ms = ?",
        )
        .bind(now.timestamp_millis())
        .bind(lease.timestamp_millis())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok::<bool, sqlx::Error>(false);
        }
        upsert_fingerprints(&mut *tx, &entries, prune_before).await?;
        tx.commit().await?;
        Ok(true)
    };
    if !with_timeout("Completing run", tx_future).await? {
        return Err(lease_lost(lease));
    }
    Ok(())
}
