use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};

// ══════════════════════════════════════════════════════════════
// Parameter values & fingerprints
// ══════════════════════════════════════════════════════════════

/// A single value on a tunable axis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ParamValue {
    /// Type-tagged form used for hashing, so that `1`, `1.0` and `"1"`
    /// never collide.
    #[must_use]
    pub fn canonical(&self) -> String {
        match self {
            Self::Bool(v) => format!("b:{}", v),
            Self::Int(v) => format!("i:{}", v),
            Self::Float(v) => format!("f:{:?}", v),
            Self::Text(v) => format!("s:{}", v),
        }
    }
}

impl std::fmt::Display for ParamValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bool(v) => write!(f, "{}", v),
            Self::Int(v) => write!(f, "{}", v),
            Self::Float(v) => write!(f, "{}", v),
            Self::Text(v) => write!(f, "{}", v),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<bool> for ParamValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

/// Full parameter assignment of one candidate. Ordered by axis name so the
/// fingerprint does not depend on axis declaration order.
pub type ParameterAssignment = BTreeMap<String, ParamValue>;

/// Deterministic SHA-256 identifier of a parameter assignment (lowercase hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    #[must_use]
    pub fn of(assignment: &ParameterAssignment) -> Self {
        let mut hasher = Sha256::new();
        for (axis, value) in assignment {
            hasher.update(axis.as_bytes());
            hasher.update([0x1f]);
            hasher.update(value.canonical().as_bytes());
            hasher.update([0x1e]);
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Wraps an already-computed fingerprint (e.g. read back from storage).
    #[must_use]
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First `n` hex characters, for log lines and directive suffixes.
    #[must_use]
    pub fn short(&self, n: usize) -> &str {
        self.0.get(..n).unwrap_or(&self.0)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ══════════════════════════════════════════════════════════════
// Candidates & results
// ══════════════════════════════════════════════════════════════

/// One candidate configuration. Only `ConfigSpace` constructs these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkConfig {
    pub id: String,
    pub parameter_assignment: ParameterAssignment,
    pub fingerprint: Fingerprint,
}

impl ForkConfig {
    #[must_use]
    pub fn new(id: impl Into<String>, parameter_assignment: ParameterAssignment) -> Self {
        let fingerprint = Fingerprint::of(&parameter_assignment);
        Self {
            id: id.into(),
            parameter_assignment,
            fingerprint,
        }
    }

    #[must_use]
    pub fn param(&self, axis: &str) -> Option<&ParamValue> {
        self.parameter_assignment.get(axis)
    }
}

/// KPI vector reported by an evaluator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkKpis {
    pub quality_rate: f64,
    pub stability_rate: f64,
    pub novelty: f64,
    pub latency_seconds: f64,
    /// Any additional metrics the evaluator reports; carried through untouched.
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, f64>,
}

impl ForkKpis {
    #[must_use]
    pub fn new(quality_rate: f64, stability_rate: f64, novelty: f64, latency_seconds: f64) -> Self {
        Self {
            quality_rate,
            stability_rate,
            novelty,
            latency_seconds,
            extra: BTreeMap::new(),
        }
    }

    /// Rates must be finite and within [0.0, 1.0]; latency finite and >= 0.
    pub fn validate(&self) -> anyhow::Result<()> {
        let rates = [
            ("quality_rate", self.quality_rate),
            ("stability_rate", self.stability_rate),
            ("novelty", self.novelty),
        ];
        for (name, val) in rates {
            if !val.is_finite() || !(0.0..=1.0).contains(&val) {
                anyhow::bail!("{} must be in [0.0, 1.0], got {}", name, val);
            }
        }
        if !self.latency_seconds.is_finite() || self.latency_seconds < 0.0 {
            anyhow::bail!(
                "latency_seconds must be >= 0 and finite, got {}",
                self.latency_seconds
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForkResult {
    pub config: ForkConfig,
    pub kpis: ForkKpis,
    pub evaluated_at: DateTime<Utc>,
}

impl ForkResult {
    #[must_use]
    pub fn new(config: ForkConfig, kpis: ForkKpis) -> Self {
        Self {
            config,
            kpis,
            evaluated_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.config.fingerprint
    }
}

// ══════════════════════════════════════════════════════════════
// Persisted run state
// ══════════════════════════════════════════════════════════════

/// Process-wide state shared between cycles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunState {
    pub last_run_timestamp: Option<DateTime<Utc>>,
    pub recent_fingerprints: HashMap<Fingerprint, DateTime<Utc>>,
    /// Set while a cycle holds the run lease.
    #[serde(default)]
    pub lease_started_at: Option<DateTime<Utc>>,
}

impl RunState {
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.lease_started_at.is_some()
    }
}

/// Result of an attempt to move the guard from IDLE to RUNNING.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum AcquireOutcome {
    Granted,
    CoolingDown { remaining_secs: u64 },
    Busy { since: DateTime<Utc> },
}
