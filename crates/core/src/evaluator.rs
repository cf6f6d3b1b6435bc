use async_trait::async_trait;
use forkloop_shared::{Evaluator, Fingerprint, ForkConfig, ForkError, ForkKpis, ForkResult};
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::selection::{EvaluationFailure, FailureKind};

// ══════════════════════════════════════════════════════════════
// Implementations
// ══════════════════════════════════════════════════════════════

/// Deterministic pseudo-evaluator: the same `(seed, fingerprint)` always
/// yields the same KPIs.
#[derive(Debug, Clone, Copy, Default)]
pub struct SeededEvaluator {
    seed: u64,
}

impl SeededEvaluator {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    fn rng_for(&self, fingerprint: &Fingerprint) -> StdRng {
        let mut hasher = Sha256::new();
        hasher.update(self.seed.to_be_bytes());
        hasher.update(fingerprint.as_str().as_bytes());
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&hasher.finalize());
        StdRng::from_seed(seed)
    }
}

#[async_trait]
impl Evaluator for SeededEvaluator {
    fn name(&self) -> &str {
        "seeded"
    }

    async fn evaluate(&self, config: &ForkConfig) -> anyhow::Result<ForkResult> {
        let mut rng = self.rng_for(&config.fingerprint);
        let kpis = ForkKpis::new(
            rng.gen_range(0.3..=1.0),
            rng.gen_range(0.3..=1.0),
            rng.gen_range(0.0..=1.0),
            rng.gen_range(0.5..30.0),
        );
        Ok(ForkResult::new(config.clone(), kpis))
    }
}

#[derive(Deserialize)]
struct EvaluationResponse {
    /// Echoed by well-behaved endpoints; checked when present.
    #[serde(default)]
    fingerprint: Option<Fingerprint>,
    #[serde(flatten)]
    kpis: ForkKpis,
}

/// Posts each candidate as JSON to an external scoring service.
///
/// Request: `{"fingerprint", "id", "parameters"}`. Response: a KPI object
/// (`quality_rate`, `stability_rate`, `novelty`, `latency_seconds`, plus any
/// extra numeric metrics), optionally echoing `fingerprint`.
pub struct HttpEvaluator {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEvaluator {
    pub fn new(endpoint: impl Into<String>, request_timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .user_agent(format!("forkloop/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl Evaluator for HttpEvaluator {
    fn name(&self) -> &str {
        "http"
    }

    async fn evaluate(&self, config: &ForkConfig) -> anyhow::Result<ForkResult> {
        let body = serde_json::json!({
            "fingerprint": config.fingerprint,
            "id": config.id,
            "parameters": config.parameter_assignment,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to reach evaluator at {}: {}", self.endpoint, e))?;

        if !response.status().is_success() {
            return Err(ForkError::Evaluation {
                fingerprint: config.fingerprint.to_string(),
                message: format!("evaluator returned status {}", response.status()),
            }
            .into());
        }

        let parsed: EvaluationResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to parse evaluator response: {}", e))?;

        if let Some(echoed) = parsed.fingerprint {
            if echoed != config.fingerprint {
                return Err(ForkError::Evaluation {
                    fingerprint: config.fingerprint.to_string(),
                    message: format!("evaluator answered for {}", echoed.short(12)),
                }
                .into());
            }
        }

        Ok(ForkResult::new(config.clone(), parsed.kpis))
    }
}

// ══════════════════════════════════════════════════════════════
// Bounded concurrent dispatch
// ══════════════════════════════════════════════════════════════

/// Outcome of evaluating one batch of candidates.
#[derive(Debug, Default)]
pub struct EvaluationRound {
    /// Valid results, in candidate order.
    pub results: Vec<ForkResult>,
    pub failures: Vec<EvaluationFailure>,
}

fn check_result(config: &ForkConfig, result: ForkResult) -> Result<ForkResult, (FailureKind, String)> {
    if result.fingerprint() != &config.fingerprint {
        return Err((
            FailureKind::Invalid,
            format!("result fingerprint {} does not match request", result.fingerprint().short(12)),
        ));
    }
    result
        .kpis
        .validate()
        .map_err(|e| (FailureKind::Invalid, e.to_string()))?;
    Ok(result)
}

/// Evaluates `configs` with at most `workers` calls in flight, each bounded
/// by `timeout`. Failed, timed-out or invalid candidates are logged and
/// reported in `failures`; they never abort the round.
pub async fn evaluate_all(
    evaluator: Arc<dyn Evaluator>,
    configs: &[ForkConfig],
    workers: usize,
    timeout: Duration,
) -> EvaluationRound {
    let mut outcomes: Vec<(usize, ForkConfig, Result<ForkResult, (FailureKind, String)>)> =
        stream::iter(configs.iter().cloned().enumerate())
            .map(|(idx, config)| {
                let evaluator = evaluator.clone();
                let task_config = config.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::timeout(timeout, evaluator.evaluate(&task_config)).await
                });
                async move {
                    let outcome = match handle.await {
                        Ok(Ok(Ok(result))) => check_result(&config, result),
                        Ok(Ok(Err(e))) => Err((FailureKind::Error, format!("{:#}", e))),
                        Ok(Err(_)) => Err((
                            FailureKind::Timeout,
                            format!("no result within {}s", timeout.as_secs_f64()),
                        )),
                        Err(e) => Err((FailureKind::Error, format!("evaluation task failed: {}", e))),
                    };
                    (idx, config, outcome)
                }
            })
            .buffer_unordered(workers.max(1))
            .collect()
            .await;

    outcomes.sort_by_key(|(idx, _, _)| *idx);

    let mut round = EvaluationRound::default();
    for (_, config, outcome) in outcomes {
        match outcome {
            Ok(result) => round.results.push(result),
            Err((kind, message)) => {
                warn!(
                    evaluator = evaluator.name(),
                    config_id = %config.id,
                    fingerprint = %config.fingerprint.short(12),
                    kind = ?kind,
                    "⚠️ Candidate dropped: {}",
                    message
                );
                round.failures.push(EvaluationFailure {
                    config_id: config.id,
                    fingerprint: config.fingerprint,
                    kind,
                    message,
                });
            }
        }
    }

    debug!(
        evaluated = round.results.len(),
        failed = round.failures.len(),
        "Evaluation round finished"
    );
    round
}
