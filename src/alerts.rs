//! Alert decision pass: which rules fire for a new assessment, which firings
//! are swallowed by an already-open alert, and what severity new alerts get.
//!
//! The engine only ever creates alerts in `open`. Acknowledging and closing go
//! through [`apply_status_action`], and nothing moves an alert back to `open`;
//! a rule firing after its alert was acked or closed yields a fresh record.

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::AlertThresholds;
use crate::error::{MonitorError, Result};
use crate::models::{
    AlertAction, AlertRefresh, AlertSeverity, AlertStatus, AlertType, Assessment, RiskAlert,
    RiskTier,
};
use crate::store::MonitoringStore;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuleError {
    #[error("non-finite {field} on assessment {assessment_id}")]
    NonFiniteScore {
        field: &'static str,
        assessment_id: Uuid,
    },
    #[error("assessment history is not in creation order")]
    HistoryOutOfOrder,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleFailure {
    pub alert_type: AlertType,
    pub error: RuleError,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Firing {
    pub alert_type: AlertType,
    pub score: f64,
    pub threshold: f64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertDecision {
    pub created: Vec<RiskAlert>,
    pub refreshed: Vec<AlertRefresh>,
    pub suppressed: Vec<AlertType>,
    pub rule_failures: Vec<RuleFailure>,
}

/// `prior` is the patient's earlier assessments, oldest first, excluding
/// `assessment`. `existing` is every alert on record for the patient.
pub fn evaluate(
    thresholds: &AlertThresholds,
    assessment: &Assessment,
    prior: &[Assessment],
    existing: &[RiskAlert],
    now: DateTime<Utc>,
) -> AlertDecision {
    let mut decision = AlertDecision::default();

    for alert_type in AlertType::ALL {
        let firing = match evaluate_rule(alert_type, thresholds, assessment, prior) {
            Ok(Some(firing)) => firing,
            Ok(None) => continue,
            Err(error) => {
                warn!(
                    patient_id = %assessment.patient_id,
                    alert_type = %alert_type,
                    error = %error,
                    "alert rule evaluation failed"
                );
                decision.rule_failures.push(RuleFailure { alert_type, error });
                continue;
            }
        };

        let dedup_since = now - thresholds.dedup_window;
        let open_duplicate = existing.iter().find(|alert| {
            alert.patient_id == assessment.patient_id
                && alert.alert_type == alert_type
                && alert.status == AlertStatus::Open
                && alert.created_at >= dedup_since
        });

        if let Some(open) = open_duplicate {
            info!(
                patient_id = %assessment.patient_id,
                alert_id = %open.id,
                alert_type = %alert_type,
                score = firing.score,
                "duplicate alert suppressed"
            );
            decision.suppressed.push(alert_type);
            decision.refreshed.push(AlertRefresh {
                alert_id: open.id,
                last_seen_score: firing.score,
                seen_at: now,
            });
            continue;
        }

        decision.created.push(RiskAlert {
            id: Uuid::new_v4(),
            patient_id: assessment.patient_id,
            assessment_id: Some(assessment.id),
            alert_type,
            severity: severity_for(firing.score, firing.threshold, thresholds.critical_margin),
            status: AlertStatus::Open,
            score: firing.score,
            threshold: firing.threshold,
            last_seen_score: None,
            created_by: assessment.performed_by.clone(),
            created_at: now,
            updated_at: now,
            status_changed_at: None,
        });
    }

    decision
}

pub fn evaluate_rule(
    alert_type: AlertType,
    thresholds: &AlertThresholds,
    assessment: &Assessment,
    prior: &[Assessment],
) -> std::result::Result<Option<Firing>, RuleError> {
    match alert_type {
        AlertType::RapidProgression => rapid_progression(thresholds, assessment, prior),
        AlertType::HighDecompRisk => {
            let score = finite(assessment.decomp_risk_12m, "decomp_risk_12m", assessment)?;
            Ok((score >= thresholds.high_decomp).then_some(Firing {
                alert_type,
                score,
                threshold: thresholds.high_decomp,
            }))
        }
        AlertType::AdvancedFibrosisRisk => {
            let score =
                finite(assessment.composite_risk_score, "composite_risk_score", assessment)?;
            let fires =
                score >= thresholds.advanced_fibrosis && assessment.risk_tier >= RiskTier::High;
            Ok(fires.then_some(Firing {
                alert_type,
                score,
                threshold: thresholds.advanced_fibrosis,
            }))
        }
    }
}

/// Rise of the current score over the lowest score in the last
/// `window_visits` prior visits; fires when the rise exceeds `delta`.
fn rapid_progression(
    thresholds: &AlertThresholds,
    assessment: &Assessment,
    prior: &[Assessment],
) -> std::result::Result<Option<Firing>, RuleError> {
    let rule = thresholds.rapid_progression;
    let current = finite(assessment.composite_risk_score, "composite_risk_score", assessment)?;

    let ordered = prior.windows(2).all(|pair| pair[0].created_at <= pair[1].created_at)
        && prior.last().map_or(true, |last| last.created_at <= assessment.created_at);
    if !ordered {
        return Err(RuleError::HistoryOutOfOrder);
    }

    let start = prior.len().saturating_sub(rule.window_visits);
    let mut baseline: Option<f64> = None;
    for row in &prior[start..] {
        let score = finite(row.composite_risk_score, "composite_risk_score", row)?;
        baseline = Some(baseline.map_or(score, |b: f64| b.min(score)));
    }
    let Some(baseline) = baseline else {
        return Ok(None);
    };

    let rise = crate::risk::round6(current - baseline);
    Ok((rise > rule.delta).then_some(Firing {
        alert_type: AlertType::RapidProgression,
        score: rise,
        threshold: rule.delta,
    }))
}

fn finite(
    value: f64,
    field: &'static str,
    assessment: &Assessment,
) -> std::result::Result<f64, RuleError> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(RuleError::NonFiniteScore {
            field,
            assessment_id: assessment.id,
        })
    }
}

pub fn severity_for(score: f64, threshold: f64, critical_margin: f64) -> AlertSeverity {
    if score - threshold >= critical_margin {
        AlertSeverity::Critical
    } else {
        AlertSeverity::High
    }
}

/// External acknowledge/close action on a stored alert.
///
/// The write only lands if the alert is still in the status it was read in;
/// losing that race reports the transition from whatever status won.
pub async fn apply_status_action<S: MonitoringStore + ?Sized>(
    store: &S,
    patient_id: Uuid,
    alert_id: Uuid,
    action: AlertAction,
    at: DateTime<Utc>,
) -> Result<RiskAlert> {
    let not_found = || MonitorError::NotFound(format!("alert {alert_id} for patient {patient_id}"));
    let mut alert = store
        .get_alert(alert_id)
        .await?
        .filter(|alert| alert.patient_id == patient_id)
        .ok_or_else(not_found)?;
    let previous = alert.status;
    alert.transition(action, at)?;

    if !store.update_alert_status(&alert, previous).await? {
        let current = store.get_alert(alert_id).await?.ok_or_else(not_found)?;
        warn!(
            alert_id = %alert_id,
            expected = %previous,
            found = %current.status,
            "alert status changed concurrently"
        );
        return Err(MonitorError::InvalidTransition {
            from: current.status.as_str(),
            action: action.as_str(),
        });
    }
    info!(
        patient_id = %patient_id,
        alert_id = %alert_id,
        status = %alert.status,
        "alert status updated"
    );
    Ok(alert)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::calibration;
    use crate::models::{FeatureSnapshot, MonitoringEvent, Patient, StiffnessSource};
    use crate::store::memory::MemoryStore;
    use chrono::Duration;

    fn assessment(
        patient_id: Uuid,
        created_at: DateTime<Utc>,
        score: f64,
        decomp: f64,
    ) -> Assessment {
        let tiers = calibration().scorer.tiers;
        Assessment {
            id: Uuid::new_v4(),
            patient_id,
            clinical_score_id: None,
            imaging_prediction_id: None,
            stiffness_measurement_id: None,
            composite_risk_score: score,
            progression_risk_12m: 0.5,
            decomp_risk_12m: decomp,
            risk_tier: crate::risk::risk_tier(score, &tiers),
            scorer_version: "stage3-composite:v1".to_string(),
            feature_snapshot: FeatureSnapshot {
                clinical_probability: score,
                clinical_model_version: "stage1:v3".to_string(),
                imaging_softmax: vec![0.2; 5],
                imaging_top1_stage: "F2".to_string(),
                imaging_model_version: "stage2:v5".to_string(),
                stiffness_kpa: 9.0,
                stiffness_source: StiffnessSource::Measured,
                clinical_index: score,
                imaging_index: score,
                stiffness_index: score,
                advanced_fibrosis_threshold: 0.7,
                high_decomp_threshold: 0.55,
                alert_ppv_target: 0.85,
                alert_recall_floor: 0.7,
            },
            performed_by: None,
            created_at,
        }
    }

    fn of_type(decision: &AlertDecision, alert_type: AlertType) -> Vec<&RiskAlert> {
        decision
            .created
            .iter()
            .filter(|alert| alert.alert_type == alert_type)
            .collect()
    }

    #[test]
    fn rapid_progression_fires_on_third_visit_only() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let start = Utc::now() - Duration::weeks(24);
        let visits: Vec<Assessment> = [0.30, 0.32, 0.68]
            .iter()
            .enumerate()
            .map(|(i, score)| {
                let at = start + Duration::weeks(12 * i as i64);
                assessment(patient_id, at, *score, 0.1)
            })
            .collect();

        let mut alerts: Vec<RiskAlert> = Vec::new();
        for (i, visit) in visits.iter().enumerate() {
            let decision = evaluate(&thresholds, visit, &visits[..i], &alerts, visit.created_at);
            let rapid = of_type(&decision, AlertType::RapidProgression);
            if i < 2 {
                assert!(rapid.is_empty(), "unexpected alert on visit {}", i + 1);
            } else {
                assert_eq!(rapid.len(), 1);
                assert_eq!(rapid[0].severity, AlertSeverity::High);
                assert_eq!(rapid[0].status, AlertStatus::Open);
                assert_eq!(rapid[0].assessment_id, Some(visit.id));
                assert!((rapid[0].score - 0.38).abs() < 1e-9);
            }
            alerts.extend(decision.created);
        }
    }

    #[test]
    fn steep_rise_is_critical() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let prior = vec![assessment(patient_id, now - Duration::weeks(12), 0.10, 0.05)];
        let current = assessment(patient_id, now, 0.60, 0.1);

        let decision = evaluate(&thresholds, &current, &prior, &[], now);
        let rapid = of_type(&decision, AlertType::RapidProgression);
        assert_eq!(rapid[0].severity, AlertSeverity::Critical);
    }

    #[test]
    fn open_alert_within_window_suppresses_duplicate() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let current = assessment(patient_id, now, 0.40, 0.60);

        let first = evaluate(&thresholds, &current, &[], &[], now);
        assert_eq!(of_type(&first, AlertType::HighDecompRisk).len(), 1);

        let second = evaluate(&thresholds, &current, &[], &first.created, now);
        assert!(second.created.is_empty());
        assert_eq!(second.suppressed, vec![AlertType::HighDecompRisk]);
        assert_eq!(second.refreshed.len(), 1);
        assert_eq!(second.refreshed[0].alert_id, first.created[0].id);
    }

    #[test]
    fn closed_alert_is_never_reopened() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let current = assessment(patient_id, now, 0.40, 0.60);

        let mut closed = evaluate(&thresholds, &current, &[], &[], now - Duration::days(5)).created;
        closed[0]
            .transition(AlertAction::Close, now - Duration::days(1))
            .unwrap();
        let snapshot = closed.clone();

        let decision = evaluate(&thresholds, &current, &[], &closed, now);
        let fresh = of_type(&decision, AlertType::HighDecompRisk);
        assert_eq!(fresh.len(), 1);
        assert_ne!(fresh[0].id, closed[0].id);
        assert_eq!(fresh[0].status, AlertStatus::Open);
        assert!(decision.refreshed.is_empty());
        assert_eq!(closed, snapshot);
    }

    #[test]
    fn acknowledged_alert_does_not_suppress() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let current = assessment(patient_id, now, 0.40, 0.60);

        let mut existing =
            evaluate(&thresholds, &current, &[], &[], now - Duration::days(2)).created;
        existing[0]
            .transition(AlertAction::Acknowledge, now - Duration::days(1))
            .unwrap();

        let decision = evaluate(&thresholds, &current, &[], &existing, now);
        assert_eq!(of_type(&decision, AlertType::HighDecompRisk).len(), 1);
    }

    #[test]
    fn open_alert_outside_dedup_window_does_not_suppress() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let current = assessment(patient_id, now, 0.40, 0.60);
        let old = evaluate(&thresholds, &current, &[], &[], now - Duration::days(200)).created;

        let decision = evaluate(&thresholds, &current, &[], &old, now);
        assert_eq!(of_type(&decision, AlertType::HighDecompRisk).len(), 1);
    }

    #[test]
    fn advanced_fibrosis_needs_threshold_and_high_tier() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();

        let below = assessment(patient_id, now, 0.65, 0.1);
        assert!(evaluate_rule(AlertType::AdvancedFibrosisRisk, &thresholds, &below, &[])
            .unwrap()
            .is_none());

        let above = assessment(patient_id, now, 0.90, 0.1);
        let firing = evaluate_rule(AlertType::AdvancedFibrosisRisk, &thresholds, &above, &[])
            .unwrap()
            .unwrap();
        assert_eq!(firing.threshold, 0.70);
        assert_eq!(
            severity_for(firing.score, firing.threshold, thresholds.critical_margin),
            AlertSeverity::Critical
        );
    }

    #[test]
    fn failing_rule_does_not_block_the_others() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let mut broken_prior = assessment(patient_id, now - Duration::weeks(12), 0.2, 0.1);
        broken_prior.composite_risk_score = f64::NAN;
        let current = assessment(patient_id, now, 0.40, 0.60);

        let decision = evaluate(&thresholds, &current, &[broken_prior], &[], now);
        assert_eq!(decision.rule_failures.len(), 1);
        assert_eq!(decision.rule_failures[0].alert_type, AlertType::RapidProgression);
        assert!(matches!(
            decision.rule_failures[0].error,
            RuleError::NonFiniteScore { .. }
        ));
        assert_eq!(of_type(&decision, AlertType::HighDecompRisk).len(), 1);
    }

    #[test]
    fn out_of_order_history_is_a_rule_failure() {
        let thresholds = calibration().alerts;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let prior = vec![
            assessment(patient_id, now - Duration::weeks(2), 0.2, 0.1),
            assessment(patient_id, now - Duration::weeks(10), 0.2, 0.1),
        ];
        let current = assessment(patient_id, now, 0.3, 0.1);
        let result = evaluate_rule(AlertType::RapidProgression, &thresholds, &current, &prior);
        assert_eq!(result, Err(RuleError::HistoryOutOfOrder));
    }

    async fn stored_open_alert(store: &MemoryStore, at: DateTime<Utc>) -> RiskAlert {
        let thresholds = calibration().alerts;
        let patient = Patient {
            id: Uuid::new_v4(),
            external_ref: "MRN-ack".to_string(),
            full_name: "Ack Race".to_string(),
            created_at: at,
        };
        store.add_patient(patient.clone());
        let mut current = assessment(patient.id, at, 0.40, 0.60);
        current.performed_by = Some("dr.hale".to_string());
        let alert = evaluate(&thresholds, &current, &[], &[], at).created.remove(0);
        assert_eq!(alert.created_by.as_deref(), Some("dr.hale"));
        let event = MonitoringEvent {
            proxy_stiffness: None,
            explanation: crate::explain::explain(
                &calibration().scorer,
                crate::explain::ExplainOptions {
                    top_k: 3,
                    trend_limit: 12,
                },
                &current,
                &[],
                &[],
            )
            .unwrap(),
            assessment: current,
            new_alerts: vec![alert.clone()],
            refreshed_alerts: Vec::new(),
            dedup_since: at - thresholds.dedup_window,
            batch: None,
        };
        store.commit_event(&event, None).await.unwrap();
        alert
    }

    #[tokio::test]
    async fn stale_status_write_does_not_overwrite_a_close() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let alert = stored_open_alert(&store, now - Duration::days(1)).await;

        let mut stale = store.get_alert(alert.id).await.unwrap().unwrap();
        apply_status_action(&store, alert.patient_id, alert.id, AlertAction::Close, now)
            .await
            .unwrap();

        stale.transition(AlertAction::Acknowledge, now).unwrap();
        let written = store.update_alert_status(&stale, AlertStatus::Open).await.unwrap();
        assert!(!written);
        let stored = store.get_alert(alert.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AlertStatus::Closed);
    }

    #[tokio::test]
    async fn status_action_on_a_closed_alert_is_rejected() {
        let store = MemoryStore::default();
        let now = Utc::now();
        let alert = stored_open_alert(&store, now - Duration::days(1)).await;

        apply_status_action(&store, alert.patient_id, alert.id, AlertAction::Close, now)
            .await
            .unwrap();
        let err = apply_status_action(
            &store,
            alert.patient_id,
            alert.id,
            AlertAction::Acknowledge,
            now,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            MonitorError::InvalidTransition {
                from: "closed",
                action: "acknowledge"
            }
        ));

        let other_patient = Uuid::new_v4();
        let err = apply_status_action(&store, other_patient, alert.id, AlertAction::Close, now)
            .await
            .unwrap_err();
        assert!(matches!(err, MonitorError::NotFound(_)));
    }
}
