use forkloop_shared::ForkResult;
use std::cmp::Ordering;

use super::types::Synthesis;

/// Picks the result maximising `key`; ties go to the lexicographically
/// smaller fingerprint.
fn max_by_key<'a>(chosen: &'a [ForkResult], key: impl Fn(&ForkResult) -> f64) -> Option<&'a ForkResult> {
    chosen.iter().min_by(|a, b| {
        key(b)
            .partial_cmp(&key(a))
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.fingerprint().cmp(b.fingerprint()))
    })
}

fn spread(values: impl Iterator<Item = f64>) -> f64 {
    let (lo, hi) = values.fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    if hi >= lo {
        hi - lo
    } else {
        0.0
    }
}

/// KPI axis with the widest spread across `chosen`. Latency is normalised by
/// the slowest chosen result so all four axes share the [0, 1] scale.
/// Earlier axes win ties.
#[must_use]
pub fn dominant_axis(chosen: &[ForkResult]) -> &'static str {
    let max_latency = chosen
        .iter()
        .map(|r| r.kpis.latency_seconds)
        .fold(0.0_f64, f64::max);
    let latency_scale = if max_latency > 0.0 { max_latency } else { 1.0 };

    let spreads = [
        ("quality", spread(chosen.iter().map(|r| r.kpis.quality_rate))),
        ("stability", spread(chosen.iter().map(|r| r.kpis.stability_rate))),
        ("novelty", spread(chosen.iter().map(|r| r.kpis.novelty))),
        (
            "latency",
            spread(chosen.iter().map(|r| r.kpis.latency_seconds / latency_scale)),
        ),
    ];

    let mut best = spreads[0];
    for candidate in &spreads[1..] {
        if candidate.1 > best.1 {
            best = *candidate;
        }
    }
    best.0
}

/// Parameters on which `to` differs from `from`, as `axis=value` pairs.
fn parameter_shift(from: &ForkResult, to: &ForkResult) -> Vec<String> {
    to.config
        .parameter_assignment
        .iter()
        .filter(|(axis, value)| from.config.param(axis) != Some(*value))
        .map(|(axis, value)| format!("{}={}", axis, value))
        .collect()
}

/// Templated contrast between the most stable and the most novel chosen
/// results. Returns `None` for an empty selection.
#[must_use]
pub fn synthesize(chosen: &[ForkResult]) -> Option<Synthesis> {
    let thesis = max_by_key(chosen, |r| r.kpis.stability_rate)?;
    let antithesis = max_by_key(chosen, |r| r.kpis.novelty)?;
    let axis = dominant_axis(chosen);

    let (tension, resolution) = if thesis.fingerprint() == antithesis.fingerprint() {
        (
            format!(
                "no tension: {} leads on both stability ({:.2}) and novelty ({:.2})",
                thesis.config.id, thesis.kpis.stability_rate, thesis.kpis.novelty
            ),
            format!(
                "hold {} as baseline and widen exploration along {}",
                thesis.config.id, axis
            ),
        )
    } else {
        let shift = parameter_shift(thesis, antithesis);
        let shift = if shift.is_empty() {
            "no parameter change".to_string()
        } else {
            shift.join(", ")
        };
        (
            format!(
                "stability vs novelty: {} (stability {:.2}, novelty {:.2}) against {} (stability {:.2}, novelty {:.2})",
                thesis.config.id,
                thesis.kpis.stability_rate,
                thesis.kpis.novelty,
                antithesis.config.id,
                antithesis.kpis.stability_rate,
                antithesis.kpis.novelty
            ),
            format!(
                "keep {} as baseline, trade on {} and move toward {}",
                thesis.config.id, axis, shift
            ),
        )
    };

    Some(Synthesis {
        tension,
        resolution,
        thesis: thesis.fingerprint().clone(),
        antithesis: antithesis.fingerprint().clone(),
        dominant_axis: axis.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::result_with;

    #[test]
    fn test_synthesis_contrasts_stable_and_novel() {
        let chosen = vec![
            result_with("steady", 0.8, 0.95, 0.2, 2.0),
            result_with("wild", 0.7, 0.60, 0.9, 2.5),
            result_with("middle", 0.75, 0.80, 0.5, 2.2),
        ];
        let s = synthesize(&chosen).unwrap();
        assert_eq!(&s.thesis, chosen[0].fingerprint());
        assert_eq!(&s.antithesis, chosen[1].fingerprint());
        assert_eq!(s.dominant_axis, "novelty");
        assert!(s.tension.starts_with("stability vs novelty: steady"));
        assert!(s.resolution.contains("id=wild"));
    }

    #[test]
    fn test_synthesis_is_reproducible() {
        let chosen = vec![
            result_with("a", 0.8, 0.9, 0.2, 2.0),
            result_with("b", 0.7, 0.6, 0.9, 8.0),
        ];
        let first = synthesize(&chosen).unwrap();
        let second = synthesize(&chosen).unwrap();
        assert_eq!(first.tension, second.tension);
        assert_eq!(first.resolution, second.resolution);
    }

    #[test]
    fn test_single_leader_has_no_tension() {
        let chosen = vec![
            result_with("champ", 0.9, 0.9, 0.9, 1.0),
            result_with("other", 0.5, 0.5, 0.5, 1.0),
        ];
        let s = synthesize(&chosen).unwrap();
        assert_eq!(s.thesis, s.antithesis);
        assert!(s.tension.starts_with("no tension"));
    }

    #[test]
    fn test_ties_resolve_by_fingerprint() {
        let a = result_with("a", 0.5, 0.7, 0.7, 1.0);
        let b = result_with("b", 0.5, 0.7, 0.7, 1.0);
        let s = synthesize(&[a.clone(), b.clone()]).unwrap();
        let expected = a.fingerprint().min(b.fingerprint());
        assert_eq!(&s.thesis, expected);
        assert_eq!(&s.antithesis, expected);
    }

    #[test]
    fn test_latency_spread_is_normalised() {
        let chosen = vec![
            result_with("fast", 0.50, 0.50, 0.50, 1.0),
            result_with("slow", 0.55, 0.55, 0.55, 10.0),
        ];
        assert_eq!(dominant_axis(&chosen), "latency");
    }

    #[test]
    fn test_empty_selection_has_no_synthesis() {
        assert!(synthesize(&[]).is_none());
    }
}
