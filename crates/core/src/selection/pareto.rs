use forkloop_shared::{ForkKpis, ForkResult};

/// `a` dominates `b` iff it is no worse on every tracked KPI and strictly
/// better on at least one. Quality, stability and novelty are maximised;
/// latency is minimised.
#[must_use]
pub fn dominates(a: &ForkKpis, b: &ForkKpis) -> bool {
    let no_worse = a.quality_rate >= b.quality_rate
        && a.stability_rate >= b.stability_rate
        && a.novelty >= b.novelty
        && a.latency_seconds <= b.latency_seconds;
    let strictly_better = a.quality_rate > b.quality_rate
        || a.stability_rate > b.stability_rate
        || a.novelty > b.novelty
        || a.latency_seconds < b.latency_seconds;
    no_worse && strictly_better
}

/// Non-dominated subset of `results`, in input order.
///
/// Pairwise O(n²); results tied on every axis do not dominate each other and
/// are all retained.
#[must_use]
pub fn select(results: &[ForkResult]) -> Vec<ForkResult> {
    results
        .iter()
        .enumerate()
        .filter(|(i, candidate)| {
            !results
                .iter()
                .enumerate()
                .any(|(j, other)| *i != j && dominates(&other.kpis, &candidate.kpis))
        })
        .map(|(_, r)| r.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::result_with;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn test_dominance_requires_strict_improvement() {
        let a = ForkKpis::new(0.8, 0.8, 0.5, 2.0);
        let same = a.clone();
        assert!(!dominates(&a, &same));

        let faster = ForkKpis::new(0.8, 0.8, 0.5, 1.0);
        assert!(dominates(&faster, &a));
        assert!(!dominates(&a, &faster));
    }

    #[test]
    fn test_tradeoffs_are_mutually_non_dominating() {
        let stable = ForkKpis::new(0.7, 0.95, 0.2, 3.0);
        let novel = ForkKpis::new(0.7, 0.60, 0.9, 3.0);
        assert!(!dominates(&stable, &novel));
        assert!(!dominates(&novel, &stable));
    }

    #[test]
    fn test_select_drops_dominated_and_keeps_ties() {
        let results = vec![
            result_with("A-0.4", 0.6, 0.7, 0.3, 4.0),
            result_with("A-0.8", 0.8, 0.9, 0.5, 2.0),
            result_with("B-0.4", 0.5, 0.6, 0.9, 6.0),
            result_with("B-0.8", 0.5, 0.6, 0.9, 6.0),
        ];
        let front = select(&results);
        let ids: Vec<_> = front.iter().map(|r| r.config.id.as_str()).collect();
        assert_eq!(ids, vec!["A-0.8", "B-0.4", "B-0.8"]);
    }

    #[test]
    fn test_select_empty_and_singleton() {
        assert!(select(&[]).is_empty());
        let one = vec![result_with("solo", 0.1, 0.1, 0.1, 100.0)];
        assert_eq!(select(&one).len(), 1);
    }

    #[test]
    fn test_front_members_are_never_dominated_by_any_input() {
        let mut rng = StdRng::seed_from_u64(7);
        for round in 0..50 {
            let n = rng.gen_range(1..40);
            let results: Vec<_> = (0..n)
                .map(|i| {
                    result_with(
                        &format!("r{}-{}", round, i),
                        f64::from(rng.gen_range(0..5u8)) / 4.0,
                        f64::from(rng.gen_range(0..5u8)) / 4.0,
                        f64::from(rng.gen_range(0..5u8)) / 4.0,
                        f64::from(rng.gen_range(0..5u8)),
                    )
                })
                .collect();

            let front = select(&results);
            assert!(!front.is_empty());
            for member in &front {
                assert!(results.iter().all(|r| !dominates(&r.kpis, &member.kpis)));
            }
            // Every excluded result is dominated by someone.
            for r in &results {
                if !front.iter().any(|f| f.config.id == r.config.id) {
                    assert!(results.iter().any(|o| dominates(&o.kpis, &r.kpis)));
                }
            }
        }
    }
}
