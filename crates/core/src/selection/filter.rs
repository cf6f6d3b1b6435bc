use chrono::{DateTime, Utc};
use forkloop_shared::{Fingerprint, ForkConfig, ForkError, RecentFingerprintStore};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use super::types::FilterReport;

/// Novelty score in [0.0, 1.0] for a candidate, deterministic per fingerprint.
pub trait NoveltyScorer: Send + Sync {
    fn score(&self, fingerprint: &Fingerprint) -> f64;
}

/// Derives a uniform score from a salted SHA-256 of the fingerprint.
#[derive(Debug, Clone, Default)]
pub struct HashNoveltyScorer {
    salt: String,
}

impl HashNoveltyScorer {
    #[must_use]
    pub fn with_salt(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }
}

impl NoveltyScorer for HashNoveltyScorer {
    fn score(&self, fingerprint: &Fingerprint) -> f64 {
        let mut hasher = Sha256::new();
        hasher.update(b"novelty:");
        hasher.update(self.salt.as_bytes());
        hasher.update(fingerprint.as_str().as_bytes());
        let digest = hasher.finalize();
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) as f64 / u64::MAX as f64
    }
}

/// Every candidate scores the same; useful when novelty filtering is
/// handled elsewhere.
#[derive(Debug, Clone, Copy)]
pub struct ConstantNoveltyScorer(pub f64);

impl NoveltyScorer for ConstantNoveltyScorer {
    fn score(&self, _fingerprint: &Fingerprint) -> f64 {
        self.0
    }
}

/// Drops recently evaluated, low-novelty and duplicate candidates.
pub struct FingerprintFilter<'a> {
    pub window: chrono::Duration,
    pub novelty_floor: f64,
    pub min_candidates: usize,
    pub scorer: &'a dyn NoveltyScorer,
}

impl FingerprintFilter<'_> {
    /// Filters against the current contents of `recent`.
    pub async fn filter(
        &self,
        candidates: impl IntoIterator<Item = ForkConfig>,
        recent: &dyn RecentFingerprintStore,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Vec<ForkConfig>, FilterReport)> {
        let snapshot = recent.get().await?;
        self.filter_snapshot(candidates, &snapshot, now)
    }

    /// Pure variant over an already-loaded fingerprint map.
    ///
    /// Fails with [`ForkError::InsufficientCandidates`] when fewer than
    /// `min_candidates` survive.
    pub fn filter_snapshot(
        &self,
        candidates: impl IntoIterator<Item = ForkConfig>,
        recent: &HashMap<Fingerprint, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<(Vec<ForkConfig>, FilterReport)> {
        let mut report = FilterReport::default();
        let mut seen: HashSet<Fingerprint> = HashSet::new();
        let mut survivors = Vec::new();

        for candidate in candidates {
            report.generated += 1;

            if let Some(&last_seen) = recent.get(&candidate.fingerprint) {
                if now.signed_duration_since(last_seen) < self.window {
                    report.recently_seen += 1;
                    continue;
                }
            }

            if self.scorer.score(&candidate.fingerprint) < self.novelty_floor {
                report.below_novelty += 1;
                continue;
            }

            if !seen.insert(candidate.fingerprint.clone()) {
                report.duplicates += 1;
                continue;
            }

            survivors.push(candidate);
        }

        report.survivors = survivors.len();
        debug!(
            generated = report.generated,
            recently_seen = report.recently_seen,
            below_novelty = report.below_novelty,
            duplicates = report.duplicates,
            survivors = report.survivors,
            "Fingerprint filter applied"
        );

        if survivors.len() < self.min_candidates {
            return Err(ForkError::InsufficientCandidates {
                survivors: survivors.len(),
                required: self.min_candidates,
            }
            .into());
        }

        Ok((survivors, report))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::space::generate;
    use crate::selection::types::Axis;
    use forkloop_shared::ParamValue;

    fn axes() -> Vec<Axis> {
        vec![
            Axis::new("mode", ["A", "B", "C"]),
            Axis::new("batch", [ParamValue::Int(8), ParamValue::Int(16)]),
        ]
    }

    fn filter(scorer: &dyn NoveltyScorer, min_candidates: usize) -> FingerprintFilter<'_> {
        FingerprintFilter {
            window: chrono::Duration::hours(24),
            novelty_floor: 0.25,
            min_candidates,
            scorer,
        }
    }

    #[test]
    fn test_hash_scorer_is_deterministic_and_bounded() {
        let scorer = HashNoveltyScorer::default();
        for config in generate(&axes()) {
            let a = scorer.score(&config.fingerprint);
            let b = scorer.score(&config.fingerprint);
            assert!((a - b).abs() < f64::EPSILON);
            assert!((0.0..=1.0).contains(&a));
        }
    }

    #[test]
    fn test_recent_fingerprints_inside_window_are_dropped() {
        let scorer = ConstantNoveltyScorer(1.0);
        let now = Utc::now();
        let configs: Vec<_> = generate(&axes()).collect();
        let mut recent = HashMap::new();
        recent.insert(configs[0].fingerprint.clone(), now - chrono::Duration::hours(1));
        recent.insert(configs[1].fingerprint.clone(), now - chrono::Duration::hours(25));

        let (survivors, report) = filter(&scorer, 1)
            .filter_snapshot(configs.clone(), &recent, now)
            .unwrap();
        assert_eq!(report.recently_seen, 1);
        assert_eq!(survivors.len(), 5);
        assert!(survivors.iter().all(|c| c.fingerprint != configs[0].fingerprint));
        assert!(survivors.iter().any(|c| c.fingerprint == configs[1].fingerprint));
    }

    #[test]
    fn test_low_novelty_candidates_are_dropped() {
        let scorer = ConstantNoveltyScorer(0.1);
        let err = filter(&scorer, 1)
            .filter_snapshot(generate(&axes()), &HashMap::new(), Utc::now())
            .unwrap_err();
        let fork_err = err.downcast_ref::<ForkError>().unwrap();
        assert!(matches!(
            fork_err,
            ForkError::InsufficientCandidates { survivors: 0, required: 1 }
        ));
    }

    #[test]
    fn test_duplicate_values_are_evaluated_once() {
        let scorer = ConstantNoveltyScorer(1.0);
        let dup_axes = vec![Axis::new("mode", ["A", "A", "B"])];
        let (survivors, report) = filter(&scorer, 1)
            .filter_snapshot(generate(&dup_axes), &HashMap::new(), Utc::now())
            .unwrap();
        assert_eq!(survivors.len(), 2);
        assert_eq!(report.duplicates, 1);
    }

    #[test]
    fn test_too_few_survivors_is_fatal() {
        let scorer = ConstantNoveltyScorer(1.0);
        let err = filter(&scorer, 12)
            .filter_snapshot(generate(&axes()), &HashMap::new(), Utc::now())
            .unwrap_err();
        let fork_err = err.downcast_ref::<ForkError>().unwrap();
        assert!(fork_err.is_fatal());
    }

    #[test]
    fn test_immediate_rerun_yields_no_repeat_candidates() {
        let scorer = ConstantNoveltyScorer(1.0);
        let now = Utc::now();
        let (first, _) = filter(&scorer, 1)
            .filter_snapshot(generate(&axes()), &HashMap::new(), now)
            .unwrap();
        let recent: HashMap<_, _> = first.iter().map(|c| (c.fingerprint.clone(), now)).collect();

        let (second, report) = filter(&scorer, 0)
            .filter_snapshot(generate(&axes()), &recent, now)
            .unwrap();
        assert!(second.is_empty());
        assert_eq!(report.recently_seen, first.len());
    }
}
