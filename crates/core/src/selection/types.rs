use forkloop_shared::{Fingerprint, ForkResult, ParamValue};
use serde::{Deserialize, Serialize};

/// Owner id for forkloop data in the `DataStore`.
pub const FORKLOOP_STORE_ID: &str = "core.forkloop";

// ══════════════════════════════════════════════════════════════
// Policy building blocks
// ══════════════════════════════════════════════════════════════

/// One tunable axis of the parameter space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Axis {
    pub name: String,
    pub values: Vec<ParamValue>,
}

impl Axis {
    pub fn new<V: Into<ParamValue>>(name: &str, values: impl IntoIterator<Item = V>) -> Self {
        Self {
            name: name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// Per-axis weights for the composite score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeWeights {
    pub quality: f64,
    pub stability: f64,
    pub novelty: f64,
    pub latency: f64,
}

impl CompositeWeights {
    pub fn validate(&self) -> anyhow::Result<()> {
        let fields = [
            ("quality", self.quality),
            ("stability", self.stability),
            ("novelty", self.novelty),
            ("latency", self.latency),
        ];
        for (name, val) in fields {
            if !val.is_finite() || val < 0.0 {
                anyhow::bail!("{} weight must be >= 0 and finite, got {}", name, val);
            }
        }
        let sum: f64 = fields.iter().map(|(_, v)| v).sum();
        if (sum - 1.0).abs() > 0.01 {
            anyhow::bail!("weights must sum to ~1.0, got {:.4}", sum);
        }
        Ok(())
    }
}

impl Default for CompositeWeights {
    fn default() -> Self {
        Self {
            quality: 0.35,
            stability: 0.35,
            novelty: 0.20,
            latency: 0.10,
        }
    }
}

/// Bounds on how many results a cycle selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectionBand {
    pub min: usize,
    pub max: usize,
}

impl SelectionBand {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.min == 0 {
            anyhow::bail!("selection_band.min must be > 0");
        }
        if self.min > self.max {
            anyhow::bail!(
                "selection_band.min ({}) must not exceed selection_band.max ({})",
                self.min,
                self.max
            );
        }
        Ok(())
    }
}

impl Default for SelectionBand {
    fn default() -> Self {
        Self { min: 3, max: 5 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateThresholds {
    pub min_avg_stability: f64,
    pub min_avg_quality: f64,
}

impl GateThresholds {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, val) in [
            ("min_avg_stability", self.min_avg_stability),
            ("min_avg_quality", self.min_avg_quality),
        ] {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                anyhow::bail!("{} must be in [0.0, 1.0] and finite, got {}", name, val);
            }
        }
        Ok(())
    }
}

impl Default for GateThresholds {
    fn default() -> Self {
        Self {
            min_avg_stability: 0.70,
            min_avg_quality: 0.60,
        }
    }
}

// ══════════════════════════════════════════════════════════════
// Per-run artifacts
// ══════════════════════════════════════════════════════════════

/// Counts from the fingerprint filter, recorded in the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterReport {
    pub generated: usize,
    pub recently_seen: usize,
    pub below_novelty: usize,
    pub duplicates: usize,
    pub survivors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Error,
    Timeout,
    Invalid,
}

/// A candidate dropped during evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvaluationFailure {
    pub config_id: String,
    pub fingerprint: Fingerprint,
    pub kind: FailureKind,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionResult {
    pub pareto_front: Vec<ForkResult>,
    /// The front, sorted by composite score.
    pub ranked: Vec<ForkResult>,
    pub chosen: Vec<ForkResult>,
}

impl SelectionResult {
    /// Highest-ranked chosen result.
    #[must_use]
    pub fn best(&self) -> Option<&ForkResult> {
        self.chosen.first()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateDecision {
    pub passed: bool,
    pub avg_stability: f64,
    pub avg_quality: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Synthesis {
    pub tension: String,
    pub resolution: String,
    /// Most stable chosen result.
    pub thesis: Fingerprint,
    /// Most novel chosen result.
    pub antithesis: Fingerprint,
    pub dominant_axis: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectiveReason {
    /// Composed from the best result and far enough from the previous directive.
    Fused,
    /// Safety gate blocked; conservative fallback.
    Gated,
    /// Candidate matched the stop list; conservative fallback.
    StopListed,
    /// Composed from the best result but still too close to the previous
    /// directive after all disambiguation attempts.
    NoveltyShortfall,
}

impl std::fmt::Display for DirectiveReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fused => write!(f, "fused"),
            Self::Gated => write!(f, "gated"),
            Self::StopListed => write!(f, "stop_listed"),
            Self::NoveltyShortfall => write!(f, "novelty_shortfall"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Directive {
    pub text: String,
    pub novelty_distance: f64,
    pub mode_hint: String,
    pub reason: DirectiveReason,
}

impl Directive {
    /// True when the directive either clears the floor or says why it does not.
    #[must_use]
    pub fn honors_floor(&self, novelty_floor: f64) -> bool {
        self.novelty_distance >= novelty_floor || self.reason != DirectiveReason::Fused
    }
}
