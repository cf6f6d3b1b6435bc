use chrono::{DateTime, Utc};
use forkloop_shared::{AcquireOutcome, Fingerprint, RunStateStore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// The previous run finished less than `cooldown_secs` ago.
    CoolingDown,
    /// Another run holds a live lease.
    Busy,
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CoolingDown => write!(f, "cooling down"),
            Self::Busy => write!(f, "another run in progress"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    pub reason: RejectReason,
    /// Seconds until a new attempt could succeed.
    pub remaining_secs: u64,
}

pub enum GuardDecision {
    Granted(RunLease),
    Rejected(Rejection),
}

/// IDLE/RUNNING gate over a persisted [`RunStateStore`].
pub struct CooldownGuard {
    store: Arc<dyn RunStateStore>,
    cooldown_secs: u64,
    lease_ttl_secs: u64,
}

impl CooldownGuard {
    pub fn new(store: Arc<dyn RunStateStore>, cooldown_secs: u64, lease_ttl_secs: u64) -> Self {
        Self {
            store,
            cooldown_secs,
            lease_ttl_secs,
        }
    }

    /// Attempts IDLE → RUNNING. Rejections mutate nothing.
    pub async fn acquire(&self, now: DateTime<Utc>) -> anyhow::Result<GuardDecision> {
        let outcome = self
            .store
            .try_acquire(now, self.cooldown_secs, self.lease_ttl_secs)
            .await?;

        Ok(match outcome {
            AcquireOutcome::Granted => {
                info!(acquired_at = %now, "🔒 Run lease acquired");
                GuardDecision::Granted(RunLease {
                    store: self.store.clone(),
                    acquired_at: now,
                    finished: false,
                })
            }
            AcquireOutcome::CoolingDown { remaining_secs } => {
                info!(remaining_secs, "⏳ Run rejected: cooling down");
                GuardDecision::Rejected(Rejection {
                    reason: RejectReason::CoolingDown,
                    remaining_secs,
                })
            }
            AcquireOutcome::Busy { since } => {
                let expires = since + chrono::Duration::seconds(self.lease_ttl_secs as i64);
                let remaining_secs = u64::try_from((expires - now).num_seconds()).unwrap_or(0);
                info!(lease_since = %since, remaining_secs, "⏳ Run rejected: lease held");
                GuardDecision::Rejected(Rejection {
                    reason: RejectReason::Busy,
                    remaining_secs,
                })
            }
        })
    }
}

/// A held RUNNING state. Must be ended with [`RunLease::complete`] or
/// [`RunLease::release`]; a dropped lease stays held until its TTL expires.
pub struct RunLease {
    store: Arc<dyn RunStateStore>,
    acquired_at: DateTime<Utc>,
    finished: bool,
}

impl RunLease {
    #[must_use]
    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    /// RUNNING → IDLE after a finished cycle: stamps `last_run`, records the
    /// run's fingerprints and prunes entries seen before `prune_before`.
    ///
    /// On error the lease is still held by `self` and should be released.
    pub async fn complete(
        &mut self,
        now: DateTime<Utc>,
        fingerprints: &[Fingerprint],
        prune_before: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.store
            .complete(self.acquired_at, now, fingerprints, prune_before)
            .await?;
        self.finished = true;
        Ok(())
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// RUNNING → IDLE without recording a run.
    pub async fn release(mut self) -> anyhow::Result<()> {
        self.finished = true;
        self.store.release(self.acquired_at).await
    }
}

impl Drop for RunLease {
    fn drop(&mut self) {
        if !self.finished {
            warn!(
                acquired_at = %self.acquired_at,
                "Run lease dropped without complete/release; it stays held until the TTL expires"
            );
        }
    }
}
