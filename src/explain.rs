use std::cmp::Ordering;

use crate::config::ScorerCalibration;
use crate::error::{MonitorError, Result};
use crate::models::{
    Assessment, ComponentValue, Contribution, ExplainabilityRecord, RiskAlert, TrendAlertState,
    TrendPoint,
};
use crate::risk::round6;

pub const CLINICAL_FEATURE: &str = "clinical_probability";
pub const IMAGING_FEATURE: &str = "imaging_severity";
pub const STIFFNESS_FEATURE: &str = "stiffness_severity";

#[derive(Debug, Clone, Copy)]
pub struct ExplainOptions {
    pub top_k: usize,
    pub trend_limit: usize,
}

/// Explain `assessment` against the population reference and the patient's
/// history. `history` may or may not already contain `assessment`; anything
/// recorded after it is ignored so the record is stable on recomputation.
pub fn explain(
    scorer: &ScorerCalibration,
    options: ExplainOptions,
    assessment: &Assessment,
    history: &[Assessment],
    alerts: &[RiskAlert],
) -> Result<ExplainabilityRecord> {
    if assessment.scorer_version != scorer.version {
        return Err(MonitorError::CalibrationMissing(format!(
            "no reference baseline for scorer version {} (loaded {})",
            assessment.scorer_version, scorer.version
        )));
    }

    let raw_components = component_values(scorer, assessment);
    let (positive, negative) = split_contributions(&raw_components, options.top_k);

    Ok(ExplainabilityRecord {
        assessment_id: assessment.id,
        patient_id: assessment.patient_id,
        positive,
        negative,
        raw_components,
        reference_version: format!("{}/{}", scorer.version, scorer.reference.tag),
        trend: trend_points(assessment, history, alerts, options.trend_limit),
        created_at: assessment.created_at,
    })
}

fn component_values(scorer: &ScorerCalibration, assessment: &Assessment) -> Vec<ComponentValue> {
    let snapshot = &assessment.feature_snapshot;
    let weights = scorer.weights;
    let reference = &scorer.reference;
    [
        (CLINICAL_FEATURE, snapshot.clinical_index, weights.clinical, reference.clinical),
        (IMAGING_FEATURE, snapshot.imaging_index, weights.imaging, reference.imaging),
        (STIFFNESS_FEATURE, snapshot.stiffness_index, weights.stiffness, reference.stiffness),
    ]
    .into_iter()
    .map(|(feature, sub_score, weight, reference)| ComponentValue {
        feature: feature.to_string(),
        sub_score,
        weight,
        reference,
    })
    .collect()
}

/// Signed weighted deviation from the reference, split by direction and
/// ordered by magnitude. Zero contributions belong to neither side.
fn split_contributions(
    components: &[ComponentValue],
    top_k: usize,
) -> (Vec<Contribution>, Vec<Contribution>) {
    let contributions: Vec<Contribution> = components
        .iter()
        .map(|c| Contribution {
            feature: c.feature.clone(),
            contribution: round6(c.weight * c.sub_score - c.weight * c.reference),
        })
        .collect();

    let by_magnitude = |a: &Contribution, b: &Contribution| {
        b.contribution
            .abs()
            .partial_cmp(&a.contribution.abs())
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.feature.cmp(&b.feature))
    };

    let mut positive: Vec<Contribution> = contributions
        .iter()
        .filter(|c| c.contribution > 0.0)
        .cloned()
        .collect();
    let mut negative: Vec<Contribution> = contributions
        .into_iter()
        .filter(|c| c.contribution < 0.0)
        .collect();
    positive.sort_by(by_magnitude);
    negative.sort_by(by_magnitude);
    positive.truncate(top_k);
    negative.truncate(top_k);
    (positive, negative)
}

fn trend_points(
    assessment: &Assessment,
    history: &[Assessment],
    alerts: &[RiskAlert],
    limit: usize,
) -> Vec<TrendPoint> {
    let mut series: Vec<&Assessment> = history
        .iter()
        .filter(|row| row.id != assessment.id && row.created_at <= assessment.created_at)
        .collect();
    series.push(assessment);
    series.sort_by_key(|row| row.created_at);

    let skip = series.len().saturating_sub(limit);
    series
        .iter()
        .enumerate()
        .skip(skip)
        .map(|(idx, row)| {
            let open = alerts
                .iter()
                .filter(|alert| alert.patient_id == row.patient_id)
                .any(|alert| alert.was_open_at(row.created_at));
            TrendPoint {
                visit_index: idx + 1,
                assessment_id: row.id,
                score: row.composite_risk_score,
                risk_tier: row.risk_tier,
                alert_state: if open {
                    TrendAlertState::Open
                } else {
                    TrendAlertState::None
                },
                created_at: row.created_at,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::calibration;
    use crate::models::{
        AlertAction, AlertSeverity, AlertStatus, AlertType, FeatureSnapshot, RiskTier,
        StiffnessSource,
    };
    use chrono::{DateTime, Duration, Utc};
    use uuid::Uuid;

    fn assessment(
        patient_id: Uuid,
        created_at: DateTime<Utc>,
        score: f64,
        indices: (f64, f64, f64),
    ) -> Assessment {
        Assessment {
            id: Uuid::new_v4(),
            patient_id,
            clinical_score_id: None,
            imaging_prediction_id: None,
            stiffness_measurement_id: None,
            composite_risk_score: score,
            progression_risk_12m: 0.3,
            decomp_risk_12m: 0.1,
            risk_tier: RiskTier::Low,
            scorer_version: "stage3-composite:v1".to_string(),
            feature_snapshot: FeatureSnapshot {
                clinical_probability: indices.0,
                clinical_model_version: "stage1:v3".to_string(),
                imaging_softmax: vec![0.2; 5],
                imaging_top1_stage: "F1".to_string(),
                imaging_model_version: "stage2:v5".to_string(),
                stiffness_kpa: 7.0,
                stiffness_source: StiffnessSource::Measured,
                clinical_index: indices.0,
                imaging_index: indices.1,
                stiffness_index: indices.2,
                advanced_fibrosis_threshold: 0.7,
                high_decomp_threshold: 0.55,
                alert_ppv_target: 0.85,
                alert_recall_floor: 0.7,
            },
            performed_by: None,
            created_at,
        }
    }

    fn options() -> ExplainOptions {
        ExplainOptions {
            top_k: 3,
            trend_limit: 12,
        }
    }

    #[test]
    fn contributions_split_by_direction_and_magnitude() {
        let scorer = calibration().scorer;
        let patient_id = Uuid::new_v4();
        // clinical above reference, imaging well below, stiffness slightly below
        let current = assessment(patient_id, Utc::now(), 0.4, (0.62, 0.05, 0.18));

        let record = explain(&scorer, options(), &current, &[], &[]).unwrap();
        assert_eq!(record.positive.len(), 1);
        assert_eq!(record.positive[0].feature, CLINICAL_FEATURE);
        assert!((record.positive[0].contribution - 0.35 * (0.62 - 0.22)).abs() < 1e-6);

        let negative: Vec<&str> = record.negative.iter().map(|c| c.feature.as_str()).collect();
        assert_eq!(negative, vec![IMAGING_FEATURE, STIFFNESS_FEATURE]);
        assert!(record.negative.iter().all(|c| c.contribution < 0.0));
        assert_eq!(record.raw_components.len(), 3);
        assert_eq!(record.reference_version, "stage3-composite:v1/population-2025q4");
    }

    #[test]
    fn top_k_truncates_each_side() {
        let scorer = calibration().scorer;
        let current = assessment(Uuid::new_v4(), Utc::now(), 0.9, (0.9, 0.9, 0.9));
        let record = explain(
            &scorer,
            ExplainOptions {
                top_k: 2,
                trend_limit: 12,
            },
            &current,
            &[],
            &[],
        )
        .unwrap();
        assert_eq!(record.positive.len(), 2);
        assert!(record.negative.is_empty());
        assert!(record.positive[0].contribution.abs() >= record.positive[1].contribution.abs());
    }

    #[test]
    fn trend_has_one_point_per_visit_with_alert_state() {
        let scorer = calibration().scorer;
        let patient_id = Uuid::new_v4();
        let start = Utc::now() - Duration::weeks(30);
        let first = assessment(patient_id, start, 0.30, (0.3, 0.2, 0.2));
        let second = assessment(patient_id, start + Duration::weeks(12), 0.32, (0.3, 0.2, 0.2));
        let third = assessment(patient_id, start + Duration::weeks(24), 0.68, (0.7, 0.6, 0.7));

        let mut alert = RiskAlert {
            id: Uuid::new_v4(),
            patient_id,
            assessment_id: Some(second.id),
            alert_type: AlertType::HighDecompRisk,
            severity: AlertSeverity::High,
            status: AlertStatus::Open,
            score: 0.6,
            threshold: 0.55,
            last_seen_score: None,
            created_by: None,
            created_at: second.created_at,
            updated_at: second.created_at,
            status_changed_at: None,
        };
        alert
            .transition(AlertAction::Close, second.created_at + Duration::weeks(2))
            .unwrap();

        let history = vec![first.clone(), second.clone()];
        let record = explain(&scorer, options(), &third, &history, &[alert]).unwrap();

        let indices: Vec<usize> = record.trend.iter().map(|p| p.visit_index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        let states: Vec<TrendAlertState> = record.trend.iter().map(|p| p.alert_state).collect();
        assert_eq!(
            states,
            vec![TrendAlertState::None, TrendAlertState::Open, TrendAlertState::None]
        );
        assert_eq!(record.trend[2].assessment_id, third.id);
    }

    #[test]
    fn recomputation_ignores_later_history() {
        let scorer = calibration().scorer;
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let first = assessment(patient_id, now - Duration::weeks(12), 0.3, (0.3, 0.2, 0.2));
        let second = assessment(patient_id, now, 0.4, (0.4, 0.3, 0.3));
        let later = assessment(patient_id, now + Duration::weeks(12), 0.5, (0.5, 0.4, 0.4));

        let at_write = explain(&scorer, options(), &second, &[first.clone()], &[]).unwrap();
        let recomputed = explain(
            &scorer,
            options(),
            &second,
            &[first, second.clone(), later],
            &[],
        )
        .unwrap();
        assert_eq!(at_write, recomputed);
    }

    #[test]
    fn trend_limit_keeps_absolute_visit_indices() {
        let scorer = calibration().scorer;
        let patient_id = Uuid::new_v4();
        let start = Utc::now() - Duration::weeks(100);
        let history: Vec<Assessment> = (0..5)
            .map(|i| assessment(patient_id, start + Duration::weeks(12 * i), 0.3, (0.3, 0.2, 0.2)))
            .collect();
        let current = assessment(patient_id, start + Duration::weeks(72), 0.35, (0.3, 0.2, 0.2));

        let record = explain(
            &scorer,
            ExplainOptions {
                top_k: 3,
                trend_limit: 3,
            },
            &current,
            &history,
            &[],
        )
        .unwrap();
        let indices: Vec<usize> = record.trend.iter().map(|p| p.visit_index).collect();
        assert_eq!(indices, vec![4, 5, 6]);
    }

    #[test]
    fn foreign_scorer_version_has_no_reference() {
        let scorer = calibration().scorer;
        let mut current = assessment(Uuid::new_v4(), Utc::now(), 0.3, (0.3, 0.2, 0.2));
        current.scorer_version = "stage3-composite:v0".to_string();
        assert!(matches!(
            explain(&scorer, options(), &current, &[], &[]),
            Err(MonitorError::CalibrationMissing(_))
        ));
    }
}
