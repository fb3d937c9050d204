use std::collections::HashMap;
use std::fmt::Write;

use uuid::Uuid;

use crate::models::{Assessment, ExplainabilityRecord, RiskAlert, RiskTier};
use crate::monitor::{BatchReport, BatchStatus, PatientOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct TierSummary {
    pub tier: RiskTier,
    pub count: usize,
    pub avg_score: f64,
}

/// Count and mean composite score per tier, highest tier first.
pub fn summarize_by_tier<'a>(
    assessments: impl IntoIterator<Item = &'a Assessment>,
) -> Vec<TierSummary> {
    let mut map: HashMap<RiskTier, (usize, f64)> = HashMap::new();

    for assessment in assessments {
        let entry = map.entry(assessment.risk_tier).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += assessment.composite_risk_score;
    }

    let mut summaries: Vec<TierSummary> = map
        .into_iter()
        .map(|(tier, (count, total))| TierSummary {
            tier,
            count,
            avg_score: if count == 0 { 0.0 } else { total / count as f64 },
        })
        .collect();

    summaries.sort_by(|a, b| b.tier.cmp(&a.tier));
    summaries
}

pub fn build_batch_report(report: &BatchReport) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Risk Monitoring Run");
    let _ = writeln!(
        output,
        "Started {} and finished {} (every {} weeks{})",
        report.run_started_at.format("%Y-%m-%d %H:%M UTC"),
        report.run_finished_at.format("%Y-%m-%d %H:%M UTC"),
        report.interval_weeks,
        if report.dry_run { ", dry run" } else { "" }
    );
    if let Some(who) = &report.performed_by {
        let _ = writeln!(output, "Run by {who}");
    }
    let _ = writeln!(output);

    if report.status == BatchStatus::Disabled {
        let _ = writeln!(output, "Risk monitoring is disabled; no patients were evaluated.");
        return output;
    }

    let _ = writeln!(output, "## Totals");
    let _ = writeln!(output, "- patients: {}", report.patients_seen);
    let _ = writeln!(output, "- assessed: {}", report.succeeded());
    let _ = writeln!(output, "- skipped: {}", report.skipped());
    let _ = writeln!(output, "- failed: {}", report.failed());
    let _ = writeln!(output, "- not due: {}", report.not_due);
    let _ = writeln!(output, "- deferred: {}", report.deferred);
    let _ = writeln!(output, "- alerts raised: {}", report.alerts_created());

    let assessed: Vec<&Assessment> = report
        .outcomes
        .iter()
        .filter_map(|o| match o {
            PatientOutcome::Success { result, .. } => Some(&result.event.assessment),
            _ => None,
        })
        .collect();

    let _ = writeln!(output);
    let _ = writeln!(output, "## Tier Mix");
    let summaries = summarize_by_tier(assessed.iter().copied());
    if summaries.is_empty() {
        let _ = writeln!(output, "No assessments in this run.");
    } else {
        for summary in summaries.iter() {
            let _ = writeln!(
                output,
                "- {}: {} patients (avg score {:.3})",
                summary.tier, summary.count, summary.avg_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## New Alerts");
    let mut raised = 0usize;
    for outcome in &report.outcomes {
        if let PatientOutcome::Success { patient_id, result } = outcome {
            for alert in &result.event.new_alerts {
                raised += 1;
                let _ = writeln!(
                    output,
                    "- {} {} ({}) score {:.3} vs threshold {:.3}",
                    patient_id,
                    alert.alert_type,
                    alert.severity.as_str(),
                    alert.score,
                    alert.threshold
                );
            }
        }
    }
    if raised == 0 {
        let _ = writeln!(output, "No new alerts.");
    }

    let problems: Vec<&PatientOutcome> = report
        .outcomes
        .iter()
        .filter(|o| !matches!(o, PatientOutcome::Success { .. }))
        .collect();
    let _ = writeln!(output);
    let _ = writeln!(output, "## Skipped and Failed");
    if problems.is_empty() {
        let _ = writeln!(output, "None.");
    } else {
        for outcome in problems {
            match outcome {
                PatientOutcome::Skipped { patient_id, reason } => {
                    let _ = writeln!(output, "- {} skipped: {}", patient_id, reason.as_str());
                }
                PatientOutcome::Failed { patient_id, reason } => {
                    let _ = writeln!(output, "- {} failed: {}", patient_id, reason);
                }
                PatientOutcome::Success { .. } => {}
            }
        }
    }

    output
}

pub fn build_patient_report(
    patient_id: Uuid,
    history: &[Assessment],
    alerts: &[RiskAlert],
    latest_explanation: Option<&ExplainabilityRecord>,
) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# Liver Risk History");
    let _ = writeln!(output, "Patient {}", patient_id);
    let _ = writeln!(output);
    let _ = writeln!(output, "## Assessments");

    if history.is_empty() {
        let _ = writeln!(output, "No assessments recorded.");
    } else {
        let _ = writeln!(
            output,
            "| # | date | score | tier | progression 12m | decomp 12m | stiffness |"
        );
        let _ = writeln!(output, "|---|---|---|---|---|---|---|");
        for (idx, row) in history.iter().enumerate() {
            let snapshot = &row.feature_snapshot;
            let _ = writeln!(
                output,
                "| {} | {} | {:.3} | {} | {:.3} | {:.3} | {:.1} kPa ({}) |",
                idx + 1,
                row.created_at.format("%Y-%m-%d"),
                row.composite_risk_score,
                row.risk_tier,
                row.progression_risk_12m,
                row.decomp_risk_12m,
                snapshot.stiffness_kpa,
                snapshot.stiffness_source.as_str().to_ascii_lowercase()
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Main Drivers");
    match latest_explanation {
        Some(record) if !record.positive.is_empty() || !record.negative.is_empty() => {
            for c in &record.positive {
                let _ = writeln!(output, "- {} raised risk by {:+.3}", c.feature, c.contribution);
            }
            for c in &record.negative {
                let _ = writeln!(output, "- {} lowered risk by {:+.3}", c.feature, c.contribution);
            }
            let _ = writeln!(output, "Reference: {}", record.reference_version);
        }
        _ => {
            let _ = writeln!(output, "No explanation available.");
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Alerts");
    if alerts.is_empty() {
        let _ = writeln!(output, "No alerts raised.");
    } else {
        for alert in alerts {
            let _ = writeln!(
                output,
                "- {} {} ({}, {}) score {:.3}{}",
                alert.created_at.format("%Y-%m-%d"),
                alert.alert_type,
                alert.severity.as_str(),
                alert.status,
                alert.score,
                alert
                    .last_seen_score
                    .map(|s| format!(", last seen {s:.3}"))
                    .unwrap_or_default()
            );
        }
    }

    output
}
