use forkloop_shared::ForkResult;

use super::types::{GateDecision, GateThresholds};

/// Averages stability and quality across `chosen` and compares them with
/// `thresholds`. An empty selection never passes.
#[must_use]
pub fn check(chosen: &[ForkResult], thresholds: &GateThresholds) -> GateDecision {
    if chosen.is_empty() {
        return GateDecision {
            passed: false,
            avg_stability: 0.0,
            avg_quality: 0.0,
            reasons: vec!["no results selected".to_string()],
        };
    }

    let n = chosen.len() as f64;
    let avg_stability = chosen.iter().map(|r| r.kpis.stability_rate).sum::<f64>() / n;
    let avg_quality = chosen.iter().map(|r| r.kpis.quality_rate).sum::<f64>() / n;

    let mut reasons = Vec::new();
    if avg_stability < thresholds.min_avg_stability {
        reasons.push(format!(
            "avg_stability {:.3} < required {:.3}",
            avg_stability, thresholds.min_avg_stability
        ));
    }
    if avg_quality < thresholds.min_avg_quality {
        reasons.push(format!(
            "avg_quality {:.3} < required {:.3}",
            avg_quality, thresholds.min_avg_quality
        ));
    }

    GateDecision {
        passed: reasons.is_empty(),
        avg_stability,
        avg_quality,
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::result_with;

    #[test]
    fn test_gate_passes_on_healthy_selection() {
        let chosen = vec![
            result_with("a", 0.8, 0.9, 0.3, 2.0),
            result_with("b", 0.7, 0.8, 0.6, 3.0),
        ];
        let decision = check(&chosen, &GateThresholds::default());
        assert!(decision.passed);
        assert!(decision.reasons.is_empty());
        assert!((decision.avg_stability - 0.85).abs() < 1e-9);
        assert!((decision.avg_quality - 0.75).abs() < 1e-9);
    }

    #[test]
    fn test_gate_reports_each_violation() {
        let chosen = vec![
            result_with("a", 0.4, 0.5, 0.3, 2.0),
            result_with("b", 0.5, 0.6, 0.6, 3.0),
        ];
        let decision = check(&chosen, &GateThresholds::default());
        assert!(!decision.passed);
        assert_eq!(decision.reasons.len(), 2);
        assert!(decision.reasons[0].contains("avg_stability 0.550 < required 0.700"));
        assert!(decision.reasons[1].contains("avg_quality 0.450 < required 0.600"));
    }

    #[test]
    fn test_gate_fails_on_empty_selection() {
        let decision = check(&[], &GateThresholds::default());
        assert!(!decision.passed);
        assert_eq!(decision.reasons.len(), 1);
    }

    #[test]
    fn test_gate_is_monotone_under_degradation() {
        let thresholds = GateThresholds::default();
        let mut chosen = vec![
            result_with("a", 0.9, 0.9, 0.3, 2.0),
            result_with("b", 0.5, 0.5, 0.6, 3.0),
            result_with("c", 0.5, 0.6, 0.6, 3.0),
        ];
        let before = check(&chosen, &thresholds);
        assert!(!before.passed);

        // Lowering any member's stability or quality keeps a failing gate failing.
        for idx in 0..chosen.len() {
            chosen[idx].kpis.stability_rate = (chosen[idx].kpis.stability_rate - 0.2).max(0.0);
            assert!(!check(&chosen, &thresholds).passed);
            chosen[idx].kpis.quality_rate = (chosen[idx].kpis.quality_rate - 0.2).max(0.0);
            assert!(!check(&chosen, &thresholds).passed);
        }
    }
}
