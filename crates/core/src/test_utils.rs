//! In-memory collaborators and fixtures shared by unit and integration tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use forkloop_shared::{
    AcquireOutcome, AuditTrail, DirectiveSink, Evaluator, Fingerprint, ForkConfig, ForkError, ForkKpis,
    ForkResult, ParamValue, ParameterAssignment, RecentFingerprintStore, RunId, RunState,
    RunStateStore,
};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

pub async fn create_test_pool() -> SqlitePool {
    let pool = crate::db::connect("sqlite::memory:").await.unwrap();
    crate::db::init_db(&pool).await.unwrap();
    pool
}

/// A result whose assignment is `{id: <id>}`, so every id has its own fingerprint.
pub fn result_with(id: &str, quality: f64, stability: f64, novelty: f64, latency: f64) -> ForkResult {
    let mut assignment = ParameterAssignment::new();
    assignment.insert("id".to_string(), ParamValue::Text(id.to_string()));
    ForkResult::new(
        ForkConfig::new(id, assignment),
        ForkKpis::new(quality, stability, novelty, latency),
    )
}

// ============================================================
// Run state
// ============================================================

#[derive(Default)]
pub struct MemoryRunStateStore {
    state: Mutex<RunState>,
    fail_complete: AtomicBool,
}

impl MemoryRunStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Mutex::new(state),
            fail_complete: AtomicBool::new(false),
        }
    }

    /// Every later `complete` fails with a storage error and changes nothing.
    pub fn fail_complete(&self) {
        self.fail_complete.store(true, Ordering::SeqCst);
    }

    fn check_lease(state: &RunState, lease: DateTime<Utc>) -> anyhow::Result<()> {
        if state.lease_started_at != Some(lease) {
            return Err(ForkError::LeaseLost(lease.to_rfc3339()).into());
        }
        Ok(())
    }

    pub fn snapshot(&self) -> RunState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecentFingerprintStore for MemoryRunStateStore {
    async fn get(&self) -> anyhow::Result<HashMap<Fingerprint, DateTime<Utc>>> {
        Ok(self.state.lock().unwrap().recent_fingerprints.clone())
    }

    async fn merge(
        &self,
        entries: &[(Fingerprint, DateTime<Utc>)],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        for (fp, seen) in entries {
            let slot = state.recent_fingerprints.entry(fp.clone()).or_insert(*seen);
            if *seen > *slot {
                *slot = *seen;
            }
        }
        state.recent_fingerprints.retain(|_, seen| *seen >= prune_before);
        Ok(())
    }
}

#[async_trait]
impl RunStateStore for MemoryRunStateStore {
    async fn load(&self) -> anyhow::Result<RunState> {
        Ok(self.snapshot())
    }

    async fn try_acquire(
        &self,
        now: DateTime<Utc>,
        cooldown_secs: u64,
        lease_ttl_secs: u64,
    ) -> anyhow::Result<AcquireOutcome> {
        let mut state = self.state.lock().unwrap();
        let ttl = chrono::Duration::seconds(lease_ttl_secs as i64);
        if let Some(since) = state.lease_started_at {
            if now - since < ttl {
                return Ok(AcquireOutcome::Busy { since });
            }
        }
        if let Some(last) = state.last_run_timestamp {
            let cooldown_ms = (cooldown_secs as i64) * 1000;
            let elapsed_ms = (now - last).num_milliseconds();
            if elapsed_ms < cooldown_ms {
                let remaining_ms = cooldown_ms - elapsed_ms;
                return Ok(AcquireOutcome::CoolingDown {
                    remaining_secs: ((remaining_ms + 999) / 1000) as u64,
                });
            }
        }
        state.lease_started_at = Some(now);
        Ok(AcquireOutcome::Granted)
    }

    async fn complete(
        &self,
        lease: DateTime<Utc>,
        now: DateTime<Utc>,
        fingerprints: &[Fingerprint],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        if self.fail_complete.load(Ordering::SeqCst) {
            return Err(ForkError::Storage("run state unavailable".to_string()).into());
        }
        {
            let mut state = self.state.lock().unwrap();
            Self::check_lease(&state, lease)?;
            state.last_run_timestamp = Some(now);
            state.lease_started_at = None;
        }
        let entries: Vec<_> = fingerprints.iter().map(|fp| (fp.clone(), now)).collect();
        self.merge(&entries, prune_before).await
    }

    async fn release(&self, lease: DateTime<Utc>) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        Self::check_lease(&state, lease)?;
        state.lease_started_at = None;
        Ok(())
    }
}

// ============================================================
// Audit trail & directive slot
// ============================================================

#[derive(Default)]
pub struct MemoryAuditTrail {
    records: Mutex<Vec<(RunId, String, serde_json::Value)>>,
}

impl MemoryAuditTrail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phases(&self) -> Vec<String> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .map(|(_, phase, _)| phase.clone())
            .collect()
    }

    pub fn payload(&self, phase: &str) -> Option<serde_json::Value> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .find(|(_, p, _)| p == phase)
            .map(|(_, _, payload)| payload.clone())
    }
}

#[async_trait]
impl AuditTrail for MemoryAuditTrail {
    async fn write(&self, run_id: RunId, phase: &str, payload: serde_json::Value) -> anyhow::Result<()> {
        self.records
            .lock()
            .unwrap()
            .push((run_id, phase.to_string(), payload));
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryDirectiveSink {
    current: Mutex<Option<String>>,
    writes: AtomicUsize,
}

impl MemoryDirectiveSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_previous(text: &str) -> Self {
        Self {
            current: Mutex::new(Some(text.to_string())),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DirectiveSink for MemoryDirectiveSink {
    async fn read_previous(&self) -> anyhow::Result<Option<String>> {
        Ok(self.current())
    }

    async fn write(&self, directive: &str) -> anyhow::Result<()> {
        *self.current.lock().unwrap() = Some(directive.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn clear(&self) -> anyhow::Result<()> {
        *self.current.lock().unwrap() = None;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================
// Scripted evaluator
// ============================================================

#[derive(Clone)]
enum Script {
    Kpis(ForkKpis),
    Fail(String),
    Delay(Duration, ForkKpis),
}

/// Returns `default_kpis` unless a fingerprint has its own script.
pub struct ScriptedEvaluator {
    default_kpis: ForkKpis,
    scripts: HashMap<Fingerprint, Script>,
    calls: AtomicUsize,
}

impl ScriptedEvaluator {
    pub fn new(default_kpis: ForkKpis) -> Self {
        Self {
            default_kpis,
            scripts: HashMap::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn with_kpis(mut self, fingerprint: &Fingerprint, kpis: ForkKpis) -> Self {
        self.scripts.insert(fingerprint.clone(), Script::Kpis(kpis));
        self
    }

    pub fn failing(mut self, fingerprint: &Fingerprint, message: &str) -> Self {
        self.scripts
            .insert(fingerprint.clone(), Script::Fail(message.to_string()));
        self
    }

    pub fn delayed(mut self, fingerprint: &Fingerprint, delay: Duration) -> Self {
        let kpis = self.default_kpis.clone();
        self.scripts.insert(fingerprint.clone(), Script::Delay(delay, kpis));
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Evaluator for ScriptedEvaluator {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn evaluate(&self, config: &ForkConfig) -> anyhow::Result<ForkResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .get(&config.fingerprint)
            .cloned()
            .unwrap_or_else(|| Script::Kpis(self.default_kpis.clone()));
        match script {
            Script::Kpis(kpis) => Ok(ForkResult::new(config.clone(), kpis)),
            Script::Fail(message) => anyhow::bail!(message),
            Script::Delay(delay, kpis) => {
                tokio::time::sleep(delay).await;
                Ok(ForkResult::new(config.clone(), kpis))
            }
        }
    }
}
