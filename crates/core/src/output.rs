use colored::Colorize;
use comfy_table::{presets::NOTHING, ContentArrangement, Table};

use crate::config::PolicyConfig;
use crate::cooldown::{RejectReason, Rejection};
use crate::db::AuditLogEntry;
use crate::orchestrator::{RunReport, StatusReport};
use crate::selection::{composite_score, DirectiveReason};

/// Print a decorated section header.
pub fn print_header(title: &str) {
    let line = "─".repeat(36);
    println!();
    println!("  {}", title.bold());
    println!("  {}", line.dimmed());
}

fn plain_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Reason dot: ● fused (green), ◐ shortfall (yellow), ○ fallback (red).
pub fn reason_badge(reason: DirectiveReason) -> String {
    match reason {
        DirectiveReason::Fused => format!("{} {}", "●".green(), reason),
        DirectiveReason::NoveltyShortfall => format!("{} {}", "◐".yellow(), reason),
        DirectiveReason::Gated | DirectiveReason::StopListed => format!("{} {}", "○".red(), reason),
    }
}

pub fn print_run_report(report: &RunReport, policy: &PolicyConfig) {
    print_header(&format!("Fork cycle {}", report.run_id));
    println!(
        "  {} generated, {} recent, {} low novelty, {} duplicate → {} candidates",
        report.filter.generated,
        report.filter.recently_seen,
        report.filter.below_novelty,
        report.filter.duplicates,
        report.filter.survivors.to_string().bold()
    );
    println!(
        "  {} evaluated by {}, {} dropped",
        report.evaluated.to_string().bold(),
        report.evaluator.cyan(),
        report.failures.len()
    );
    for failure in &report.failures {
        println!(
            "    {} {} {:?}: {}",
            "✗".red(),
            failure.config_id,
            failure.kind,
            failure.message.dimmed()
        );
    }

    print_header("Selection");
    let mut table = plain_table();
    table.set_header(vec!["", "id", "score", "quality", "stability", "novelty", "latency"]);
    for (idx, result) in report.selection.chosen.iter().enumerate() {
        let on_front = report
            .selection
            .pareto_front
            .iter()
            .any(|r| r.fingerprint() == result.fingerprint());
        let marker = if idx == 0 {
            "★".yellow().to_string()
        } else if on_front {
            "●".green().to_string()
        } else {
            "○".dimmed().to_string()
        };
        let score = composite_score(&result.kpis, &policy.composite_weights, policy.latency_cap_seconds);
        table.add_row(vec![
            format!("  {}", marker),
            result.config.id.clone().bold().to_string(),
            format!("{:.3}", score),
            format!("{:.2}", result.kpis.quality_rate),
            format!("{:.2}", result.kpis.stability_rate),
            format!("{:.2}", result.kpis.novelty),
            format!("{:.1}s", result.kpis.latency_seconds),
        ]);
    }
    println!("{table}");

    print_header("Safety gate");
    if report.gate.passed {
        println!(
            "  {} stability {:.3}, quality {:.3}",
            "PASS".green().bold(),
            report.gate.avg_stability,
            report.gate.avg_quality
        );
    } else {
        println!("  {}", "BLOCK".red().bold());
        for reason in &report.gate.reasons {
            println!("    {}", reason.dimmed());
        }
    }

    if let Some(synthesis) = &report.synthesis {
        print_header("Synthesis");
        println!("  {}", synthesis.tension);
        println!("  {} {}", "→".cyan(), synthesis.resolution);
    }

    print_header("Directive");
    println!("  {}", report.directive.text.bold());
    println!(
        "  {}  novelty {:.2}  mode {}",
        reason_badge(report.directive.reason),
        report.directive.novelty_distance,
        report.directive.mode_hint.cyan()
    );
    println!();
}

pub fn print_rejection(rejection: &Rejection) {
    let label = match rejection.reason {
        RejectReason::CoolingDown => "Cooling down".yellow(),
        RejectReason::Busy => "Busy".red(),
    };
    println!(
        "  {} {}: retry in {}s",
        "⏳".dimmed(),
        label.bold(),
        rejection.remaining_secs
    );
}

pub fn print_status(status: &StatusReport) {
    print_header("Forkloop status");
    let mut table = plain_table();
    let last_run = status
        .last_run
        .map_or_else(|| "never".dimmed().to_string(), |t| t.to_rfc3339());
    let lease = status
        .lease_started_at
        .map_or_else(|| "idle".green().to_string(), |t| format!("{} since {}", "running".yellow(), t.to_rfc3339()));
    let cooldown = if status.cooldown_remaining_secs == 0 {
        "ready".green().to_string()
    } else {
        format!("{}s remaining", status.cooldown_remaining_secs)
    };
    table.add_row(vec!["  last run".to_string(), last_run]);
    table.add_row(vec!["  cooldown".to_string(), cooldown]);
    table.add_row(vec!["  lease".to_string(), lease]);
    table.add_row(vec![
        "  recent fingerprints".to_string(),
        status.recent_fingerprints.to_string(),
    ]);
    table.add_row(vec![
        "  directive".to_string(),
        status
            .current_directive
            .clone()
            .unwrap_or_else(|| "-".dimmed().to_string()),
    ]);
    println!("{table}");
}

pub fn print_audit_table(entries: &[AuditLogEntry]) {
    if entries.is_empty() {
        println!("  {}", "No audit records.".dimmed());
        return;
    }

    let mut table = plain_table();
    for entry in entries {
        let result = match entry.result.as_str() {
            "ABORTED" => entry.result.red().to_string(),
            "BLOCKED" => entry.result.yellow().to_string(),
            _ => entry.result.dimmed().to_string(),
        };
        let run = entry
            .trace_id
            .as_deref()
            .map_or("-", |t| &t[..8.min(t.len())])
            .to_string();
        table.add_row(vec![
            format!("  {}", entry.timestamp.format("%Y-%m-%d %H:%M:%S")),
            run.dimmed().to_string(),
            entry.event_type.clone().bold().to_string(),
            result,
        ]);
    }
    println!("{table}");
}

pub fn print_policy(policy: &PolicyConfig) {
    print_header("Axes");
    let mut table = plain_table();
    for axis in &policy.axes {
        let values: Vec<String> = axis.values.iter().map(ToString::to_string).collect();
        table.add_row(vec![format!("  {}", axis.name.bold()), values.join(", ")]);
    }
    println!("{table}");

    print_header("Policy");
    let mut table = plain_table();
    let w = &policy.composite_weights;
    let rows = [
        ("novelty_floor", format!("{}", policy.novelty_floor)),
        ("dedup_window_secs", policy.dedup_window_secs.to_string()),
        (
            "selection_band",
            format!("{}..={}", policy.selection_band.min, policy.selection_band.max),
        ),
        (
            "composite_weights",
            format!("q {} / s {} / n {} / l {}", w.quality, w.stability, w.novelty, w.latency),
        ),
        ("latency_cap_seconds", format!("{}", policy.latency_cap_seconds)),
        (
            "gate_thresholds",
            format!(
                "stability ≥ {} / quality ≥ {}",
                policy.gate_thresholds.min_avg_stability, policy.gate_thresholds.min_avg_quality
            ),
        ),
        ("stop_substrings", policy.stop_substrings.join(", ")),
        ("cooldown_seconds", policy.cooldown_seconds.to_string()),
        ("min_candidates", policy.min_candidates.to_string()),
        ("directive_retries", policy.directive_retries.to_string()),
    ];
    for (key, value) in rows {
        table.add_row(vec![format!("  {}", key), value]);
    }
    println!("{table}");
}
