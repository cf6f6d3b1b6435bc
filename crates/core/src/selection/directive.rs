use forkloop_shared::ForkResult;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use tracing::debug;

use super::types::{Directive, DirectiveReason, GateDecision};

/// Issued when a stop substring matches the composed directive.
pub const STOP_LIST_FALLBACK: &str = "hold and audit";
/// Issued when the safety gate blocks the selection.
pub const GATED_FALLBACK: &str = "hold current configuration and audit: safety gate blocked promotion";

const DEFAULT_MODE_HINT: &str = "balanced";
const GATED_MODE_HINT: &str = "conservative";

/// Normalised dissimilarity between two directive texts, in [0.0, 1.0].
pub trait TextDistance: Send + Sync {
    fn distance(&self, candidate: &str, previous: &str) -> f64;
}

/// `1 - |candidate ∩ previous| / |candidate|` over lowercase word tokens.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenOverlap;

fn tokens(text: &str) -> HashSet<String> {
    text.split_whitespace()
        .map(|t| t.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|t| !t.is_empty())
        .collect()
}

impl TextDistance for TokenOverlap {
    fn distance(&self, candidate: &str, previous: &str) -> f64 {
        let cand = tokens(candidate);
        if cand.is_empty() {
            return 0.0;
        }
        let prev = tokens(previous);
        if prev.is_empty() {
            return 1.0;
        }
        let shared = cand.intersection(&prev).count();
        1.0 - shared as f64 / cand.len() as f64
    }
}

pub struct DirectiveGenerator<'a> {
    /// Disambiguation attempts before a shortfall is reported.
    pub retries: usize,
    pub distance: &'a dyn TextDistance,
}

impl DirectiveGenerator<'_> {
    fn mode_hint(best: &ForkResult) -> String {
        best.config
            .param("mode")
            .map(|v| v.to_string())
            .unwrap_or_else(|| DEFAULT_MODE_HINT.to_string())
    }

    fn compose(best: &ForkResult, mode_hint: &str) -> String {
        let params: Vec<String> = best
            .config
            .parameter_assignment
            .iter()
            .filter(|(axis, _)| axis.as_str() != "mode")
            .map(|(axis, value)| format!("{}={}", axis, value))
            .collect();
        if params.is_empty() {
            format!("adopt {} profile from {}", mode_hint, best.config.id)
        } else {
            format!(
                "adopt {} profile from {} with {}",
                mode_hint,
                best.config.id,
                params.join(" ")
            )
        }
    }

    /// Eight hex chars tied to the best result, the previous directive and the
    /// attempt, so a repeated winner gets fresh suffixes on every run.
    fn revision_tag(best: &ForkResult, previous: Option<&str>, attempt: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(best.fingerprint().as_str().as_bytes());
        hasher.update([0x1f]);
        hasher.update(previous.unwrap_or_default().as_bytes());
        hasher.update([0x1f]);
        hasher.update(attempt.to_le_bytes());
        format!("{:x}", hasher.finalize()).chars().take(8).collect()
    }

    fn measure(&self, text: &str, previous: Option<&str>) -> f64 {
        match previous {
            Some(prev) => self.distance.distance(text, prev),
            None => 1.0,
        }
    }

    fn fallback(&self, text: &str, mode_hint: &str, reason: DirectiveReason, previous: Option<&str>) -> Directive {
        Directive {
            text: text.to_string(),
            novelty_distance: self.measure(text, previous),
            mode_hint: mode_hint.to_string(),
            reason,
        }
    }

    /// Next directive for `best`.
    ///
    /// A failed gate (or a missing `best`) short-circuits to the gated
    /// fallback. Otherwise the composed text is suffixed up to `retries`
    /// times until it clears `novelty_floor`, then checked against the
    /// case-insensitive stop list.
    #[must_use]
    pub fn next(
        &self,
        best: Option<&ForkResult>,
        previous: Option<&str>,
        stop_substrings: &[String],
        novelty_floor: f64,
        gate: &GateDecision,
    ) -> Directive {
        let best = match best {
            Some(best) if gate.passed => best,
            _ => return self.fallback(GATED_FALLBACK, GATED_MODE_HINT, DirectiveReason::Gated, previous),
        };

        let mode_hint = Self::mode_hint(best);
        let mut text = Self::compose(best, &mode_hint);
        let mut novelty_distance = self.measure(&text, previous);

        let mut attempt = 0;
        while novelty_distance < novelty_floor && attempt < self.retries {
            attempt += 1;
            let tag = Self::revision_tag(best, previous, attempt);
            text.push_str(&format!(" revision-{}-{}", attempt, tag));
            novelty_distance = self.measure(&text, previous);
        }

        let lowered = text.to_lowercase();
        if let Some(hit) = stop_substrings
            .iter()
            .find(|s| !s.is_empty() && lowered.contains(&s.to_lowercase()))
        {
            debug!(stop_substring = %hit, "Directive matched stop list");
            return self.fallback(STOP_LIST_FALLBACK, GATED_MODE_HINT, DirectiveReason::StopListed, previous);
        }

        let reason = if novelty_distance >= novelty_floor {
            DirectiveReason::Fused
        } else {
            DirectiveReason::NoveltyShortfall
        };
        debug!(attempts = attempt, novelty_distance, %reason, "Directive composed");

        Directive {
            text,
            novelty_distance,
            mode_hint,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::result_with;

    fn passed() -> GateDecision {
        GateDecision {
            passed: true,
            avg_stability: 0.9,
            avg_quality: 0.9,
            reasons: vec![],
        }
    }

    fn generator(retries: usize) -> DirectiveGenerator<'static> {
        DirectiveGenerator {
            retries,
            distance: &TokenOverlap,
        }
    }

    #[test]
    fn test_token_overlap_bounds() {
        let d = TokenOverlap;
        assert_eq!(d.distance("a b c", ""), 1.0);
        assert_eq!(d.distance("a b c", "A, B. c!"), 0.0);
        assert!((d.distance("a b c d", "a b") - 0.5).abs() < 1e-9);
        assert_eq!(d.distance("", "a"), 0.0);
    }

    #[test]
    fn test_first_directive_is_fused() {
        let best = result_with("fork-0001", 0.8, 0.8, 0.5, 2.0);
        let directive = generator(3).next(Some(&best), None, &[], 0.25, &passed());
        assert_eq!(directive.reason, DirectiveReason::Fused);
        assert_eq!(directive.novelty_distance, 1.0);
        assert_eq!(directive.mode_hint, "balanced");
        assert!(directive.text.contains("id=fork-0001"));
    }

    #[test]
    fn test_repeat_directive_is_disambiguated() {
        let best = result_with("fork-0001", 0.8, 0.8, 0.5, 2.0);
        let gen = generator(3);
        let first = gen.next(Some(&best), None, &[], 0.1, &passed());
        let second = gen.next(Some(&best), Some(&first.text), &[], 0.1, &passed());
        assert_eq!(second.reason, DirectiveReason::Fused);
        assert!(second.novelty_distance >= 0.1);
        assert!(second.text.contains("revision-1-"));
        assert!(second.honors_floor(0.1));
    }

    #[test]
    fn test_same_winner_three_runs_in_a_row_stays_novel() {
        let best = result_with("fork-0001", 0.8, 0.8, 0.5, 2.0);
        let gen = generator(1);
        let first = gen.next(Some(&best), None, &[], 0.1, &passed());
        let second = gen.next(Some(&best), Some(&first.text), &[], 0.1, &passed());
        let third = gen.next(Some(&best), Some(&second.text), &[], 0.1, &passed());

        assert_eq!(second.reason, DirectiveReason::Fused);
        assert_eq!(third.reason, DirectiveReason::Fused);
        assert_ne!(second.text, third.text);
        assert!(third.novelty_distance >= 0.1);

        // Same inputs, same directive.
        let again = gen.next(Some(&best), Some(&second.text), &[], 0.1, &passed());
        assert_eq!(again.text, third.text);
    }

    #[test]
    fn test_unreachable_floor_flags_shortfall() {
        let best = result_with("fork-0001", 0.8, 0.8, 0.5, 2.0);
        let gen = generator(3);
        let first = gen.next(Some(&best), None, &[], 0.25, &passed());
        let second = gen.next(Some(&best), Some(&first.text), &[], 0.99, &passed());
        assert_eq!(second.reason, DirectiveReason::NoveltyShortfall);
        assert!(second.novelty_distance < 0.99);
        assert!(second.text.contains("revision-3-"));
        assert!(second.honors_floor(0.99));
    }

    #[test]
    fn test_stop_list_is_case_insensitive() {
        let best = result_with("Fork-Danger", 0.8, 0.8, 0.5, 2.0);
        let stop = vec!["DANGER".to_string()];
        let directive = generator(3).next(Some(&best), None, &stop, 0.25, &passed());
        assert_eq!(directive.reason, DirectiveReason::StopListed);
        assert_eq!(directive.text, STOP_LIST_FALLBACK);
    }

    #[test]
    fn test_failed_gate_short_circuits() {
        let best = result_with("fork-0001", 0.2, 0.2, 0.5, 2.0);
        let gate = GateDecision {
            passed: false,
            avg_stability: 0.2,
            avg_quality: 0.2,
            reasons: vec!["avg_stability 0.200 < required 0.700".into()],
        };
        let stop = vec!["fork".to_string()];
        let directive = generator(3).next(Some(&best), None, &stop, 0.25, &gate);
        assert_eq!(directive.reason, DirectiveReason::Gated);
        assert_eq!(directive.text, GATED_FALLBACK);
        assert_eq!(directive.mode_hint, "conservative");
    }

    #[test]
    fn test_missing_best_is_gated() {
        let directive = generator(3).next(None, None, &[], 0.25, &passed());
        assert_eq!(directive.reason, DirectiveReason::Gated);
    }
}
