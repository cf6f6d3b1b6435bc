#![allow(dead_code)]

use forkloop_core::config::PolicyConfig;
use forkloop_core::selection::{generate, Axis, ConstantNoveltyScorer};
use forkloop_core::test_utils::{
    MemoryAuditTrail, MemoryDirectiveSink, MemoryRunStateStore, ScriptedEvaluator,
};
use forkloop_core::ForkOrchestrator;
use forkloop_shared::{ForkConfig, ForkKpis};
use std::sync::Arc;
use std::time::Duration;

/// `{mode: [A, B], ratio: [0.4, 0.8]}`; yields fork-0000 (A, 0.4),
/// fork-0001 (A, 0.8), fork-0002 (B, 0.4), fork-0003 (B, 0.8).
pub fn example_axes() -> Vec<Axis> {
    vec![Axis::new("mode", ["A", "B"]), Axis::new("ratio", [0.4, 0.8])]
}

pub fn example_configs() -> Vec<ForkConfig> {
    generate(&example_axes()).collect()
}

pub fn example_policy() -> PolicyConfig {
    PolicyConfig {
        axes: example_axes(),
        min_candidates: 3,
        ..PolicyConfig::default()
    }
}

/// A-0.8 dominates A-0.4 and B-0.4; B-0.8 survives on novelty.
pub fn example_evaluator() -> ScriptedEvaluator {
    let configs = example_configs();
    ScriptedEvaluator::new(ForkKpis::new(0.5, 0.5, 0.5, 1.0))
        .with_kpis(&configs[0].fingerprint, ForkKpis::new(0.60, 0.70, 0.30, 4.0))
        .with_kpis(&configs[1].fingerprint, ForkKpis::new(0.85, 0.90, 0.50, 2.0))
        .with_kpis(&configs[2].fingerprint, ForkKpis::new(0.50, 0.60, 0.40, 5.0))
        .with_kpis(&configs[3].fingerprint, ForkKpis::new(0.55, 0.65, 0.90, 3.0))
}

pub struct Harness {
    pub run_state: Arc<MemoryRunStateStore>,
    pub audit: Arc<MemoryAuditTrail>,
    pub sink: Arc<MemoryDirectiveSink>,
    pub evaluator: Arc<ScriptedEvaluator>,
    pub orchestrator: ForkOrchestrator,
}

pub fn harness(policy: PolicyConfig, evaluator: ScriptedEvaluator) -> Harness {
    harness_with_sink(policy, evaluator, MemoryDirectiveSink::new())
}

pub fn harness_with_sink(
    policy: PolicyConfig,
    evaluator: ScriptedEvaluator,
    sink: MemoryDirectiveSink,
) -> Harness {
    let run_state = Arc::new(MemoryRunStateStore::new());
    let audit = Arc::new(MemoryAuditTrail::new());
    let sink = Arc::new(sink);
    let evaluator = Arc::new(evaluator);
    let orchestrator = ForkOrchestrator::new(
        policy,
        run_state.clone(),
        evaluator.clone(),
        audit.clone(),
        sink.clone(),
    )
    .with_novelty_scorer(Arc::new(ConstantNoveltyScorer(1.0)))
    .with_eval_limits(4, Duration::from_millis(500));

    Harness {
        run_state,
        audit,
        sink,
        evaluator,
        orchestrator,
    }
}
