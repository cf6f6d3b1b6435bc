use chrono::{DateTime, Utc};
use forkloop_shared::{
    AuditTrail, DirectiveSink, Evaluator, Fingerprint, ForkError, RunId, RunStateStore, SDK_VERSION,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::config::PolicyConfig;
use crate::cooldown::{CooldownGuard, GuardDecision, Rejection, RunLease};
use crate::evaluator::evaluate_all;
use crate::selection::{
    dialectic, gate, generate, CompositeRanker, Directive, DirectiveGenerator, DirectiveReason,
    EvaluationFailure, FilterReport, FingerprintFilter, GateDecision, HashNoveltyScorer,
    NoveltyScorer, SelectionResult, Synthesis, TextDistance, TokenOverlap,
};

/// Everything one completed cycle produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub evaluator: String,
    pub filter: FilterReport,
    pub evaluated: usize,
    pub failures: Vec<EvaluationFailure>,
    pub selection: SelectionResult,
    pub gate: GateDecision,
    pub synthesis: Option<Synthesis>,
    pub directive: Directive,
    /// Wall-clock time per phase.
    pub phase_millis: BTreeMap<String, u64>,
}

impl RunReport {
    /// True when the directive is a conservative fallback.
    #[must_use]
    pub fn is_blocked(&self) -> bool {
        matches!(
            self.directive.reason,
            DirectiveReason::Gated | DirectiveReason::StopListed
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    Completed(Box<RunReport>),
    Rejected(Rejection),
}

/// Operator view of the persisted loop state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub last_run: Option<DateTime<Utc>>,
    pub cooldown_remaining_secs: u64,
    pub lease_started_at: Option<DateTime<Utc>>,
    pub recent_fingerprints: usize,
    pub current_directive: Option<String>,
}

/// A finished cycle that has not been published or committed yet.
struct StagedRun {
    report: RunReport,
    /// Fingerprints to record as recently seen.
    fingerprints: Vec<Fingerprint>,
    previous_directive: Option<String>,
}

/// Drives one exploration-evaluation-selection cycle across its collaborators.
pub struct ForkOrchestrator {
    policy: PolicyConfig,
    run_state: Arc<dyn RunStateStore>,
    evaluator: Arc<dyn Evaluator>,
    audit: Arc<dyn AuditTrail>,
    directive_sink: Arc<dyn DirectiveSink>,
    novelty: Arc<dyn NoveltyScorer>,
    distance: Arc<dyn TextDistance>,
    eval_workers: usize,
    eval_timeout: Duration,
    lease_ttl_secs: u64,
}

impl ForkOrchestrator {
    pub fn new(
        policy: PolicyConfig,
        run_state: Arc<dyn RunStateStore>,
        evaluator: Arc<dyn Evaluator>,
        audit: Arc<dyn AuditTrail>,
        directive_sink: Arc<dyn DirectiveSink>,
    ) -> Self {
        Self {
            policy,
            run_state,
            evaluator,
            audit,
            directive_sink,
            novelty: Arc::new(HashNoveltyScorer::default()),
            distance: Arc::new(TokenOverlap),
            eval_workers: 16,
            eval_timeout: Duration::from_secs(30),
            lease_ttl_secs: 3600,
        }
    }

    #[must_use]
    pub fn with_novelty_scorer(mut self, scorer: Arc<dyn NoveltyScorer>) -> Self {
        self.novelty = scorer;
        self
    }

    #[must_use]
    pub fn with_text_distance(mut self, distance: Arc<dyn TextDistance>) -> Self {
        self.distance = distance;
        self
    }

    #[must_use]
    pub fn with_eval_limits(mut self, workers: usize, timeout: Duration) -> Self {
        self.eval_workers = workers;
        self.eval_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_lease_ttl(mut self, lease_ttl_secs: u64) -> Self {
        self.lease_ttl_secs = lease_ttl_secs;
        self
    }

    #[must_use]
    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Runs one cycle at `now`.
    ///
    /// A cooldown or lease rejection is `Ok(CycleOutcome::Rejected)` and
    /// mutates nothing. Any error aborts the cycle: the lease is released,
    /// an `abort` record is written, and run state plus the directive slot
    /// are left as they were.
    pub async fn run_cycle(&self, now: DateTime<Utc>) -> anyhow::Result<CycleOutcome> {
        let guard = CooldownGuard::new(
            self.run_state.clone(),
            self.policy.cooldown_seconds,
            self.lease_ttl_secs,
        );
        let lease = match guard.acquire(now).await? {
            GuardDecision::Granted(lease) => lease,
            GuardDecision::Rejected(rejection) => return Ok(CycleOutcome::Rejected(rejection)),
        };

        let run_id = RunId::new();
        info!(run_id = %run_id, evaluator = self.evaluator.name(), "🚀 Fork cycle started");

        match self.execute(run_id, now).await {
            Ok(staged) => self.finish(lease, staged, now).await,
            Err(e) => {
                self.abort(lease, run_id, &e).await;
                Err(e)
            }
        }
    }

    /// Publishes the directive and commits run state as one unit: if the
    /// commit fails the previous directive is put back and the run aborts.
    async fn finish(
        &self,
        mut lease: RunLease,
        staged: StagedRun,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CycleOutcome> {
        let StagedRun {
            report,
            fingerprints,
            previous_directive,
        } = staged;
        let run_id = report.run_id;

        if let Err(e) = self.directive_sink.write(&report.directive.text).await {
            self.abort(lease, run_id, &e).await;
            return Err(e);
        }

        let prune_before = self.policy.dedup_window_start(now);
        if let Err(e) = lease.complete(now, &fingerprints, prune_before).await {
            self.restore_directive(run_id, previous_directive.as_deref()).await;
            self.abort(lease, run_id, &e).await;
            return Err(e);
        }

        // State is committed; the run stands even if this record fails.
        let recorded = self
            .audit
            .write(
                run_id,
                "complete",
                serde_json::json!({
                    "fingerprints_recorded": fingerprints.len(),
                    "reason": report.directive.reason,
                    "version": SDK_VERSION,
                }),
            )
            .await;
        if let Err(audit_err) = recorded {
            error!(run_id = %run_id, "Failed to record completed run: {:#}", audit_err);
        }

        info!(
            run_id = %report.run_id,
            chosen = report.selection.chosen.len(),
            reason = %report.directive.reason,
            "🏁 Fork cycle completed"
        );
        Ok(CycleOutcome::Completed(Box::new(report)))
    }

    async fn restore_directive(&self, run_id: RunId, previous: Option<&str>) {
        let restored = match previous {
            Some(text) => self.directive_sink.write(text).await,
            None => self.directive_sink.clear().await,
        };
        match restored {
            Ok(()) => info!(run_id = %run_id, "↩️ Previous directive restored"),
            Err(e) => error!(run_id = %run_id, "Failed to restore previous directive: {:#}", e),
        }
    }

    async fn abort(&self, lease: RunLease, run_id: RunId, e: &anyhow::Error) {
        let fatal = e.downcast_ref::<ForkError>().is_some_and(ForkError::is_fatal);
        error!(run_id = %run_id, fatal, "🛑 Fork cycle aborted: {:#}", e);

        let payload = serde_json::json!({
            "error": format!("{:#}", e),
            "fatal": fatal,
        });
        if let Err(audit_err) = self.audit.write(run_id, "abort", payload).await {
            warn!(run_id = %run_id, "Failed to record abort: {:#}", audit_err);
        }
        if let Err(release_err) = lease.release().await {
            warn!(run_id = %run_id, "Failed to release run lease: {:#}", release_err);
        }
    }

    /// All phases up to the directive decision. Nothing outside the audit
    /// trail is written here.
    async fn execute(&self, run_id: RunId, now: DateTime<Utc>) -> anyhow::Result<StagedRun> {
        let policy = &self.policy;
        let mut phase_millis = BTreeMap::new();

        // ── Generate + filter ──
        let started = Instant::now();
        let recent = self.run_state.get().await?;
        let filter = FingerprintFilter {
            window: policy.dedup_window(),
            novelty_floor: policy.novelty_floor,
            min_candidates: policy.min_candidates,
            scorer: self.novelty.as_ref(),
        };
        let (survivors, filter_report) = filter.filter_snapshot(generate(&policy.axes), &recent, now)?;
        phase_millis.insert("filter".to_string(), elapsed_ms(started));
        self.audit
            .write(run_id, "filter", serde_json::to_value(&filter_report)?)
            .await?;
        info!(
            run_id = %run_id,
            generated = filter_report.generated,
            survivors = filter_report.survivors,
            "🔎 Candidates filtered"
        );

        // ── Evaluate ──
        let started = Instant::now();
        let round = evaluate_all(
            self.evaluator.clone(),
            &survivors,
            self.eval_workers,
            self.eval_timeout,
        )
        .await;
        phase_millis.insert("evaluate".to_string(), elapsed_ms(started));
        self.audit
            .write(
                run_id,
                "evaluate",
                serde_json::json!({
                    "evaluator": self.evaluator.name(),
                    "dispatched": survivors.len(),
                    "evaluated": round.results.len(),
                    "failures": round.failures,
                }),
            )
            .await?;

        if round.results.len() < policy.selection_band.min {
            return Err(ForkError::InsufficientResults {
                evaluated: round.results.len(),
                required: policy.selection_band.min,
            }
            .into());
        }

        // ── Select ──
        let started = Instant::now();
        let ranker = CompositeRanker::new(policy.composite_weights.clone(), policy.latency_cap_seconds);
        let selection = ranker.select(&round.results, policy.selection_band);
        phase_millis.insert("select".to_string(), elapsed_ms(started));
        let front_ids: Vec<&str> = selection.pareto_front.iter().map(|r| r.config.id.as_str()).collect();
        let chosen: Vec<serde_json::Value> = selection
            .chosen
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.config.id,
                    "fingerprint": r.fingerprint(),
                    "score": ranker.score(r),
                })
            })
            .collect();
        self.audit
            .write(
                run_id,
                "select",
                serde_json::json!({ "pareto_front": front_ids, "chosen": chosen }),
            )
            .await?;

        // ── Gate ──
        let gate = gate::check(&selection.chosen, &policy.gate_thresholds);
        self.audit
            .write(run_id, "gate", serde_json::to_value(&gate)?)
            .await?;
        if !gate.passed {
            warn!(run_id = %run_id, reasons = ?gate.reasons, "🚧 Safety gate blocked selection");
        }

        // ── Synthesize ──
        let synthesis = dialectic::synthesize(&selection.chosen);
        self.audit
            .write(run_id, "synthesize", serde_json::to_value(&synthesis)?)
            .await?;

        // ── Directive ──
        let started = Instant::now();
        let previous = self.directive_sink.read_previous().await?;
        let generator = DirectiveGenerator {
            retries: policy.directive_retries,
            distance: self.distance.as_ref(),
        };
        let directive = generator.next(
            selection.best(),
            previous.as_deref(),
            &policy.stop_substrings,
            policy.novelty_floor,
            &gate,
        );
        phase_millis.insert("directive".to_string(), elapsed_ms(started));
        self.audit
            .write(run_id, "directive", serde_json::to_value(&directive)?)
            .await?;

        if matches!(directive.reason, DirectiveReason::Gated | DirectiveReason::StopListed) {
            self.audit
                .write(
                    run_id,
                    "gate_block",
                    serde_json::json!({
                        "reason": directive.reason,
                        "gate_reasons": gate.reasons,
                        "fallback": directive.text,
                    }),
                )
                .await?;
        }

        info!(
            run_id = %run_id,
            reason = %directive.reason,
            novelty_distance = directive.novelty_distance,
            mode_hint = %directive.mode_hint,
            "🧭 Directive composed"
        );

        let fingerprints = survivors.iter().map(|c| c.fingerprint.clone()).collect();
        let report = RunReport {
            run_id,
            started_at: now,
            finished_at: Utc::now(),
            evaluator: self.evaluator.name().to_string(),
            filter: filter_report,
            evaluated: round.results.len(),
            failures: round.failures,
            selection,
            gate,
            synthesis,
            directive,
            phase_millis,
        };
        Ok(StagedRun {
            report,
            fingerprints,
            previous_directive: previous,
        })
    }

    /// Snapshot of run state, cooldown and the current directive at `now`.
    pub async fn status(&self, now: DateTime<Utc>) -> anyhow::Result<StatusReport> {
        let state = self.run_state.load().await?;
        let cooldown_remaining_secs = state
            .last_run_timestamp
            .map(|last| {
                let cooldown_ms =
                    i64::try_from(self.policy.cooldown_seconds.saturating_mul(1000)).unwrap_or(i64::MAX);
                let remaining = cooldown_ms
                    .saturating_sub((now - last).num_milliseconds())
                    .max(0);
                u64::try_from(remaining.saturating_add(999) / 1000).unwrap_or(0)
            })
            .unwrap_or(0);

        Ok(StatusReport {
            last_run: state.last_run_timestamp,
            cooldown_remaining_secs,
            lease_started_at: state.lease_started_at,
            recent_fingerprints: state.recent_fingerprints.len(),
            current_directive: self.directive_sink.read_previous().await?,
        })
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
