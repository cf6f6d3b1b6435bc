use forkloop_shared::{ForkKpis, ForkResult};
use std::cmp::Ordering;
use std::collections::HashSet;

use super::pareto;
use super::types::{CompositeWeights, SelectionBand, SelectionResult};

/// Weighted scalar used for ranking. Latency is normalised against
/// `latency_cap` and inverted so that faster is better.
#[must_use]
pub fn composite_score(kpis: &ForkKpis, weights: &CompositeWeights, latency_cap: f64) -> f64 {
    let normalized_latency = if latency_cap > 0.0 {
        (kpis.latency_seconds / latency_cap).min(1.0)
    } else {
        1.0
    };
    weights.quality * kpis.quality_rate
        + weights.stability * kpis.stability_rate
        + weights.novelty * kpis.novelty
        + weights.latency * (1.0 - normalized_latency)
}

/// Orders results by composite score.
pub struct CompositeRanker {
    pub weights: CompositeWeights,
    pub latency_cap: f64,
}

impl CompositeRanker {
    #[must_use]
    pub fn new(weights: CompositeWeights, latency_cap: f64) -> Self {
        Self { weights, latency_cap }
    }

    #[must_use]
    pub fn score(&self, result: &ForkResult) -> f64 {
        composite_score(&result.kpis, &self.weights, self.latency_cap)
    }

    fn compare(&self, a: &ForkResult, b: &ForkResult) -> Ordering {
        self.score(b)
            .partial_cmp(&self.score(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| {
                a.kpis
                    .latency_seconds
                    .partial_cmp(&b.kpis.latency_seconds)
                    .unwrap_or(Ordering::Equal)
            })
            .then_with(|| a.fingerprint().cmp(b.fingerprint())) // deterministic tiebreaker
    }

    /// Descending by score; ties by lower latency, then fingerprint.
    #[must_use]
    pub fn rank(&self, results: &[ForkResult]) -> Vec<ForkResult> {
        let mut ranked = results.to_vec();
        ranked.sort_by(|a, b| self.compare(a, b));
        ranked
    }

    /// Pareto front → ranking → band clamp.
    ///
    /// `chosen` is the top `band.max` of the ranked front. When the front is
    /// smaller than `band.min`, it is padded with the best-scoring non-front
    /// results until `band.min` is reached or `results` is exhausted.
    #[must_use]
    pub fn select(&self, results: &[ForkResult], band: SelectionBand) -> SelectionResult {
        let pareto_front = pareto::select(results);
        let ranked = self.rank(&pareto_front);

        let mut chosen: Vec<ForkResult> = ranked.iter().take(band.max).cloned().collect();

        if chosen.len() < band.min {
            let on_front: HashSet<_> = pareto_front.iter().map(|r| r.fingerprint().clone()).collect();
            let rest: Vec<ForkResult> = results
                .iter()
                .filter(|r| !on_front.contains(r.fingerprint()))
                .cloned()
                .collect();
            let padding = band.min - chosen.len();
            chosen.extend(self.rank(&rest).into_iter().take(padding));
        }

        SelectionResult {
            pareto_front,
            ranked,
            chosen,
        }
    }
}
