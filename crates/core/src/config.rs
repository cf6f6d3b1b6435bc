use anyhow::Context;
use chrono::{DateTime, Utc};
use forkloop_shared::{ForkError, ParamValue};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::{Path, PathBuf};

use crate::selection::{Axis, CompositeWeights, GateThresholds, SelectionBand};

/// Upper bound for `dedup_window_secs` and `cooldown_seconds` (365 days).
pub const MAX_WINDOW_SECS: u64 = 365 * 86_400;

/// Returns the directory containing the running executable.
/// Falls back to CWD if the exe path cannot be determined.
#[must_use]
pub fn exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(std::path::Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

// ============================================================
// Process configuration (environment)
// ============================================================

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    /// TOML policy file; built-in defaults when absent.
    pub policy_path: Option<PathBuf>,
    /// External evaluator endpoint; the seeded evaluator is used when absent.
    pub evaluator_url: Option<String>,
    pub evaluator_seed: u64,
    pub eval_timeout_secs: u64,
    pub eval_workers: usize,
    pub lease_ttl_secs: u64,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            let db_path = exe_dir().join("data").join("forkloop.db");
            format!("sqlite:{}", db_path.display())
        });

        let policy_path = env::var("FORKLOOP_POLICY")
            .ok()
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from);

        let evaluator_url = env::var("FORKLOOP_EVALUATOR_URL")
            .ok()
            .filter(|u| !u.trim().is_empty());
        if let Some(ref url) = evaluator_url {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                anyhow::bail!(
                    "FORKLOOP_EVALUATOR_URL must start with http:// or https:// (got '{}')",
                    url
                );
            }
        }

        let evaluator_seed = env::var("FORKLOOP_EVALUATOR_SEED")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .context("Failed to parse FORKLOOP_EVALUATOR_SEED")?;

        let eval_timeout_secs = env::var("FORKLOOP_EVAL_TIMEOUT_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse::<u64>()
            .context("Failed to parse FORKLOOP_EVAL_TIMEOUT_SECS")?;

        if eval_timeout_secs == 0 || eval_timeout_secs > 300 {
            anyhow::bail!(
                "FORKLOOP_EVAL_TIMEOUT_SECS must be between 1 and 300 (got {})",
                eval_timeout_secs
            );
        }

        let eval_workers = env::var("FORKLOOP_EVAL_WORKERS")
            .unwrap_or_else(|_| "16".to_string())
            .parse::<usize>()
            .context("Failed to parse FORKLOOP_EVAL_WORKERS")?;

        if eval_workers == 0 || eval_workers > 64 {
            anyhow::bail!(
                "FORKLOOP_EVAL_WORKERS must be between 1 and 64 (got {})",
                eval_workers
            );
        }

        let lease_ttl_secs = env::var("FORKLOOP_LEASE_TTL_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse::<u64>()
            .context("Failed to parse FORKLOOP_LEASE_TTL_SECS")?;

        if !(60..=86_400).contains(&lease_ttl_secs) {
            anyhow::bail!(
                "FORKLOOP_LEASE_TTL_SECS must be between 60 and 86400 (got {})",
                lease_ttl_secs
            );
        }

        Ok(Self {
            database_url,
            policy_path,
            evaluator_url,
            evaluator_seed,
            eval_timeout_secs,
            eval_workers,
            lease_ttl_secs,
        })
    }

    /// The policy file named by `FORKLOOP_POLICY`, or the validated defaults.
    pub fn load_policy(&self) -> anyhow::Result<PolicyConfig> {
        match &self.policy_path {
            Some(path) => PolicyConfig::load_from_path(path),
            None => {
                let policy = PolicyConfig::default();
                policy.validate()?;
                Ok(policy)
            }
        }
    }
}

// ============================================================
// Loop policy (TOML)
// ============================================================

fn default_axes() -> Vec<Axis> {
    vec![
        Axis::new("mode", ["conservative", "balanced", "exploratory"]),
        Axis::new("ratio", [0.4, 0.6, 0.8]),
        Axis::new("horizon", ["short", "long"]),
        Axis::new("batch", [ParamValue::Int(8), ParamValue::Int(16)]),
    ]
}

/// Tunables for one fork cycle. Every field has a default, so a policy file
/// only needs the keys it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyConfig {
    pub axes: Vec<Axis>,
    pub novelty_floor: f64,
    pub dedup_window_secs: u64,
    pub selection_band: SelectionBand,
    pub composite_weights: CompositeWeights,
    pub latency_cap_seconds: f64,
    pub gate_thresholds: GateThresholds,
    pub stop_substrings: Vec<String>,
    pub cooldown_seconds: u64,
    pub min_candidates: usize,
    pub directive_retries: usize,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            axes: default_axes(),
            novelty_floor: 0.25,
            dedup_window_secs: 86_400,
            selection_band: SelectionBand::default(),
            composite_weights: CompositeWeights::default(),
            latency_cap_seconds: 60.0,
            gate_thresholds: GateThresholds::default(),
            stop_substrings: Vec::new(),
            cooldown_seconds: 1_800,
            min_candidates: 12,
            directive_retries: 3,
        }
    }
}

impl PolicyConfig {
    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let policy: Self = toml::from_str(raw).context("Failed to parse policy TOML")?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn load_from_path(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read policy file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid policy file {}", path.display()))
    }

    #[must_use]
    pub fn dedup_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(
            i64::try_from(self.dedup_window_secs.min(MAX_WINDOW_SECS)).unwrap_or(i64::MAX / 1_000),
        )
    }

    /// Start of the dedup window ending at `now`, clamped to the earliest
    /// representable instant.
    #[must_use]
    pub fn dedup_window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_sub_signed(self.dedup_window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Range and consistency checks. Failures surface as [`ForkError::InvalidPolicy`].
    pub fn validate(&self) -> anyhow::Result<()> {
        self.check().map_err(|e| ForkError::InvalidPolicy(format!("{:#}", e)).into())
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.axes.is_empty() {
            anyhow::bail!("at least one axis is required");
        }
        let mut names = HashSet::new();
        for axis in &self.axes {
            if axis.name.trim().is_empty() {
                anyhow::bail!("axis names must not be empty");
            }
            if axis.values.is_empty() {
                anyhow::bail!("axis '{}' has no values", axis.name);
            }
            if !names.insert(axis.name.as_str()) {
                anyhow::bail!("axis '{}' is defined more than once", axis.name);
            }
        }

        if !self.novelty_floor.is_finite() || !(0.0..=1.0).contains(&self.novelty_floor) {
            anyhow::bail!("novelty_floor must be in [0.0, 1.0], got {}", self.novelty_floor);
        }
        if self.dedup_window_secs == 0 || self.dedup_window_secs > MAX_WINDOW_SECS {
            anyhow::bail!(
                "dedup_window_secs must be in 1..={}, got {}",
                MAX_WINDOW_SECS,
                self.dedup_window_secs
            );
        }
        if self.cooldown_seconds > MAX_WINDOW_SECS {
            anyhow::bail!(
                "cooldown_seconds must be at most {}, got {}",
                MAX_WINDOW_SECS,
                self.cooldown_seconds
            );
        }
        if !self.latency_cap_seconds.is_finite() || self.latency_cap_seconds <= 0.0 {
            anyhow::bail!("latency_cap_seconds must be > 0, got {}", self.latency_cap_seconds);
        }

        self.selection_band.validate()?;
        self.composite_weights.validate().context("composite_weights")?;
        self.gate_thresholds.validate()?;

        if self.min_candidates < self.selection_band.min {
            anyhow::bail!(
                "min_candidates ({}) must be at least selection_band.min ({})",
                self.min_candidates,
                self.selection_band.min
            );
        }
        if self.directive_retries > 10 {
            anyhow::bail!("directive_retries must be at most 10, got {}", self.directive_retries);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    // Guard to ensure env var cleanup even on panic
    struct EnvGuard(&'static str);

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            std::env::remove_var(self.0);
        }
    }

    #[test]
    fn test_app_config_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard("FORKLOOP_EVAL_WORKERS");
        std::env::remove_var("FORKLOOP_EVAL_WORKERS");

        let config = AppConfig::load().unwrap();
        assert_eq!(config.eval_workers, 16);
        assert_eq!(config.eval_timeout_secs, 30);
        assert_eq!(config.lease_ttl_secs, 3600);
    }

    #[test]
    fn test_eval_workers_range_is_enforced() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("FORKLOOP_EVAL_WORKERS", "0");
        let _guard = EnvGuard("FORKLOOP_EVAL_WORKERS");
        assert!(AppConfig::load().is_err());

        std::env::set_var("FORKLOOP_EVAL_WORKERS", "not-a-number");
        let err = AppConfig::load().unwrap_err();
        assert!(err.to_string().contains("FORKLOOP_EVAL_WORKERS"));
    }

    #[test]
    fn test_evaluator_url_scheme_is_checked() {
        let _lock = ENV_LOCK.lock().unwrap();
        std::env::set_var("FORKLOOP_EVALUATOR_URL", "ftp://scores.local");
        let _guard = EnvGuard("FORKLOOP_EVALUATOR_URL");
        assert!(AppConfig::load().is_err());

        std::env::set_var("FORKLOOP_EVALUATOR_URL", "http://127.0.0.1:9000/score");
        let config = AppConfig::load().unwrap();
        assert_eq!(config.evaluator_url.as_deref(), Some("http://127.0.0.1:9000/score"));
    }

    #[test]
    fn test_default_policy_is_valid() {
        let policy = PolicyConfig::default();
        assert!(policy.validate().is_ok());
        assert_eq!(crate::selection::space_size(&policy.axes), 36);
    }

    #[test]
    fn test_policy_toml_overrides_and_defaults() {
        let policy = PolicyConfig::from_toml_str(
            r#"
            novelty_floor = 0.1
            stop_substrings = ["rollback"]
            min_candidates = 3

            [selection_band]
            min = 2
            max = 4

            [[axes]]
            name = "mode"
            values = ["A", "B"]

            [[axes]]
            name = "ratio"
            values = [0.4, 0.8]

            [[axes]]
            name = "batch"
            values = [8, 16]
            "#,
        )
        .unwrap();

        assert_eq!(policy.axes.len(), 3);
        assert_eq!(policy.axes[1].values[0], ParamValue::Float(0.4));
        assert_eq!(policy.axes[2].values[1], ParamValue::Int(16));
        assert_eq!(policy.selection_band, SelectionBand { min: 2, max: 4 });
        assert_eq!(policy.cooldown_seconds, 1_800);
        assert_eq!(policy.stop_substrings, vec!["rollback".to_string()]);
    }

    #[test]
    fn test_policy_validation_failures() {
        let cases = [
            "novelty_floor = 1.5",
            "min_candidates = 1",
            "[selection_band]\nmin = 6\nmax = 5",
            "[composite_weights]\nquality = 0.9\nstability = 0.9\nnovelty = 0.0\nlatency = 0.0",
            "[[axes]]\nname = \"mode\"\nvalues = [\"A\"]\n[[axes]]\nname = \"mode\"\nvalues = [\"B\"]",
            "[[axes]]\nname = \"mode\"\nvalues = []",
            "dedup_window_secs = 100000000000000",
            "dedup_window_secs = 0",
            "cooldown_seconds = 100000000000000",
        ];
        for raw in cases {
            let err = PolicyConfig::from_toml_str(raw).unwrap_err();
            assert!(
                err.downcast_ref::<ForkError>().is_some(),
                "expected InvalidPolicy for {:?}, got {:#}",
                raw,
                err
            );
        }
    }

    #[test]
    fn test_dedup_window_start_never_overflows() {
        let policy = PolicyConfig {
            dedup_window_secs: u64::MAX,
            ..PolicyConfig::default()
        };
        let earliest = DateTime::<Utc>::MIN_UTC + chrono::Duration::seconds(10);
        assert_eq!(policy.dedup_window_start(earliest), DateTime::<Utc>::MIN_UTC);

        let now = Utc::now();
        let policy = PolicyConfig::default();
        assert_eq!(policy.dedup_window_start(now), now - chrono::Duration::days(1));
    }

    #[test]
    fn test_unknown_policy_keys_are_rejected() {
        assert!(PolicyConfig::from_toml_str("novelty_flor = 0.3").is_err());
    }
}
