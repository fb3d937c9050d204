use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, Serialize)]
pub struct Patient {
    pub id: Uuid,
    pub external_ref: String,
    pub full_name: String,
    pub created_at: DateTime<Utc>,
}

/// Stage 1 output plus the demographics the proxy estimator needs.
#[derive(Debug, Clone, Serialize)]
pub struct ClinicalScore {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub probability: f64,
    pub risk_tier: String,
    pub model_version: String,
    pub age: i32,
    pub bmi: f64,
    pub type2dm: bool,
    pub created_at: DateTime<Utc>,
}

/// Stage 2 output: fibrosis stage distribution F0..F4.
#[derive(Debug, Clone, Serialize)]
pub struct ImagingPrediction {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub softmax_vector: Vec<f64>,
    pub top1_stage: String,
    pub confidence_flag: String,
    pub model_version: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StiffnessSource {
    Measured,
    Proxy,
}

impl StiffnessSource {
    pub fn as_str(self) -> &'static str {
        match self {
            StiffnessSource::Measured => "MEASURED",
            StiffnessSource::Proxy => "PROXY",
        }
    }
}

impl FromStr for StiffnessSource {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "MEASURED" => Ok(StiffnessSource::Measured),
            "PROXY" => Ok(StiffnessSource::Proxy),
            other => Err(format!("unknown stiffness source '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StiffnessMeasurement {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub kpa: f64,
    pub cap_dbm: Option<f64>,
    pub source: StiffnessSource,
    pub measured_at: DateTime<Utc>,
    #[serde(default)]
    pub entered_by: Option<String>,
}

impl StiffnessMeasurement {
    pub fn new(
        patient_id: Uuid,
        kpa: f64,
        cap_dbm: Option<f64>,
        source: StiffnessSource,
        measured_at: DateTime<Utc>,
    ) -> Result<Self> {
        if !kpa.is_finite() || kpa <= 0.0 {
            return Err(MonitorError::invalid_range("stiffness_kpa", kpa));
        }
        if let Some(cap) = cap_dbm {
            if !cap.is_finite() || cap <= 0.0 {
                return Err(MonitorError::invalid_range("cap_dbm", cap));
            }
        }
        Ok(Self {
            id: Uuid::new_v4(),
            patient_id,
            kpa,
            cap_dbm,
            source,
            measured_at,
            entered_by: None,
        })
    }

    pub fn entered_by(mut self, who: Option<&str>) -> Self {
        self.entered_by = who.map(str::to_owned);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Low,
    Moderate,
    High,
    Critical,
}

impl RiskTier {
    pub fn as_str(self) -> &'static str {
        match self {
            RiskTier::Low => "LOW",
            RiskTier::Moderate => "MODERATE",
            RiskTier::High => "HIGH",
            RiskTier::Critical => "CRITICAL",
        }
    }
}

impl fmt::Display for RiskTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskTier {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_uppercase().as_str() {
            "LOW" => Ok(RiskTier::Low),
            "MODERATE" => Ok(RiskTier::Moderate),
            "HIGH" => Ok(RiskTier::High),
            "CRITICAL" => Ok(RiskTier::Critical),
            other => Err(format!("unknown risk tier '{other}'")),
        }
    }
}

/// Exact inputs and calibration used for one assessment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSnapshot {
    pub clinical_probability: f64,
    pub clinical_model_version: String,
    pub imaging_softmax: Vec<f64>,
    pub imaging_top1_stage: String,
    pub imaging_model_version: String,
    pub stiffness_kpa: f64,
    pub stiffness_source: StiffnessSource,
    pub clinical_index: f64,
    pub imaging_index: f64,
    pub stiffness_index: f64,
    pub advanced_fibrosis_threshold: f64,
    pub high_decomp_threshold: f64,
    pub alert_ppv_target: f64,
    pub alert_recall_floor: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub clinical_score_id: Option<Uuid>,
    pub imaging_prediction_id: Option<Uuid>,
    pub stiffness_measurement_id: Option<Uuid>,
    pub composite_risk_score: f64,
    pub progression_risk_12m: f64,
    pub decomp_risk_12m: f64,
    pub risk_tier: RiskTier,
    pub scorer_version: String,
    pub feature_snapshot: FeatureSnapshot,
    #[serde(default)]
    pub performed_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    RapidProgression,
    HighDecompRisk,
    AdvancedFibrosisRisk,
}

impl AlertType {
    pub const ALL: [AlertType; 3] = [
        AlertType::RapidProgression,
        AlertType::HighDecompRisk,
        AlertType::AdvancedFibrosisRisk,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AlertType::RapidProgression => "RAPID_PROGRESSION",
            AlertType::HighDecompRisk => "HIGH_DECOMP_RISK",
            AlertType::AdvancedFibrosisRisk => "ADVANCED_FIBROSIS_RISK",
        }
    }
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertType {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        AlertType::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(value))
            .ok_or_else(|| format!("unknown alert type '{value}'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertSeverity::High => "high",
            AlertSeverity::Critical => "critical",
        }
    }
}

impl FromStr for AlertSeverity {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "high" => Ok(AlertSeverity::High),
            "critical" => Ok(AlertSeverity::Critical),
            other => Err(format!("unknown alert severity '{other}'")),
        }
    }
}

/// Alert lifecycle. Alerts are born `Open`; no action leads back to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Open,
    Ack,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertAction {
    Acknowledge,
    Close,
}

impl AlertAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertAction::Acknowledge => "acknowledge",
            AlertAction::Close => "close",
        }
    }
}

impl FromStr for AlertAction {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "ack" | "acknowledge" => Ok(AlertAction::Acknowledge),
            "close" => Ok(AlertAction::Close),
            other => Err(format!("unknown alert action '{other}'")),
        }
    }
}

impl AlertStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AlertStatus::Open => "open",
            AlertStatus::Ack => "ack",
            AlertStatus::Closed => "closed",
        }
    }

    pub fn apply(self, action: AlertAction) -> Result<AlertStatus> {
        match (self, action) {
            (AlertStatus::Open, AlertAction::Acknowledge) => Ok(AlertStatus::Ack),
            (AlertStatus::Open | AlertStatus::Ack, AlertAction::Close) => Ok(AlertStatus::Closed),
            (from, action) => Err(MonitorError::InvalidTransition {
                from: from.as_str(),
                action: action.as_str(),
            }),
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AlertStatus {
    type Err = String;

    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "open" => Ok(AlertStatus::Open),
            "ack" => Ok(AlertStatus::Ack),
            "closed" => Ok(AlertStatus::Closed),
            other => Err(format!("unknown alert status '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskAlert {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub assessment_id: Option<Uuid>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub status: AlertStatus,
    pub score: f64,
    pub threshold: f64,
    pub last_seen_score: Option<f64>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status_changed_at: Option<DateTime<Utc>>,
}

impl RiskAlert {
    pub fn transition(&mut self, action: AlertAction, at: DateTime<Utc>) -> Result<()> {
        self.status = self.status.apply(action)?;
        self.status_changed_at = Some(at);
        self.updated_at = at;
        Ok(())
    }

    /// Whether the alert was still unacknowledged at `at`.
    pub fn was_open_at(&self, at: DateTime<Utc>) -> bool {
        if self.created_at > at {
            return false;
        }
        match self.status {
            AlertStatus::Open => true,
            AlertStatus::Ack | AlertStatus::Closed => {
                self.status_changed_at.map_or(false, |changed| changed > at)
            }
        }
    }
}

/// "Last seen" note written onto an open alert that suppressed a duplicate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertRefresh {
    pub alert_id: Uuid,
    pub last_seen_score: f64,
    pub seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Contribution {
    pub feature: String,
    pub contribution: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentValue {
    pub feature: String,
    pub sub_score: f64,
    pub weight: f64,
    pub reference: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrendAlertState {
    None,
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendPoint {
    pub visit_index: usize,
    pub assessment_id: Uuid,
    pub score: f64,
    pub risk_tier: RiskTier,
    pub alert_state: TrendAlertState,
    pub created_at: DateTime<Utc>,
}

/// Derived view of one assessment; keyed by the assessment it explains.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplainabilityRecord {
    pub assessment_id: Uuid,
    pub patient_id: Uuid,
    pub positive: Vec<Contribution>,
    pub negative: Vec<Contribution>,
    pub raw_components: Vec<ComponentValue>,
    pub reference_version: String,
    pub trend: Vec<TrendPoint>,
    pub created_at: DateTime<Utc>,
}

pub const BATCH_COMPLETED_EVENT: &str = "STAGE3_MONITORING_BATCH_COMPLETED";

/// Append-only entry on a patient's care timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: Uuid,
    pub patient_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Run-level facts stamped on the timeline entry of a scheduled assessment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchContext {
    pub monitoring_mode: String,
    pub interval_weeks: u32,
    pub run_started_at: DateTime<Utc>,
}

/// Everything one monitoring event writes, committed together or not at all.
#[derive(Debug, Clone, Serialize)]
pub struct MonitoringEvent {
    pub proxy_stiffness: Option<StiffnessMeasurement>,
    pub assessment: Assessment,
    pub explanation: ExplainabilityRecord,
    pub new_alerts: Vec<RiskAlert>,
    pub refreshed_alerts: Vec<AlertRefresh>,
    /// Open alerts created at or after this instant absorb a new alert of
    /// the same type at commit time.
    #[serde(skip)]
    pub dedup_since: DateTime<Utc>,
    /// Present for scheduled runs only.
    #[serde(skip)]
    pub batch: Option<BatchContext>,
}

impl MonitoringEvent {
    /// Timeline entry for a committed batch event, given how many alerts
    /// were actually inserted.
    pub fn timeline_event(&self, alerts_created: usize) -> Option<TimelineEvent> {
        let batch = self.batch.as_ref()?;
        let assessment = &self.assessment;
        Some(TimelineEvent {
            id: Uuid::new_v4(),
            patient_id: assessment.patient_id,
            event_type: BATCH_COMPLETED_EVENT.to_string(),
            payload: serde_json::json!({
                "assessment_id": assessment.id,
                "risk_tier": assessment.risk_tier,
                "composite_risk_score": assessment.composite_risk_score,
                "alerts_created": alerts_created,
                "monitoring_mode": batch.monitoring_mode,
                "interval_weeks": batch.interval_weeks,
                "run_started_at": batch.run_started_at,
            }),
            created_by: assessment.performed_by.clone(),
            created_at: assessment.created_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn open_alert(created_at: DateTime<Utc>) -> RiskAlert {
        RiskAlert {
            id: Uuid::new_v4(),
            patient_id: Uuid::new_v4(),
            assessment_id: None,
            alert_type: AlertType::HighDecompRisk,
            severity: AlertSeverity::High,
            status: AlertStatus::Open,
            score: 0.6,
            threshold: 0.55,
            last_seen_score: None,
            created_by: None,
            created_at,
            updated_at: created_at,
            status_changed_at: None,
        }
    }

    #[test]
    fn open_alerts_can_be_acknowledged_then_closed() {
        let status = AlertStatus::Open.apply(AlertAction::Acknowledge).unwrap();
        assert_eq!(status, AlertStatus::Ack);
        assert_eq!(status.apply(AlertAction::Close).unwrap(), AlertStatus::Closed);
        assert_eq!(
            AlertStatus::Open.apply(AlertAction::Close).unwrap(),
            AlertStatus::Closed
        );
    }

    #[test]
    fn closed_and_acked_alerts_reject_backward_moves() {
        assert!(matches!(
            AlertStatus::Closed.apply(AlertAction::Close),
            Err(MonitorError::InvalidTransition { from: "closed", .. })
        ));
        assert!(AlertStatus::Closed.apply(AlertAction::Acknowledge).is_err());
        assert!(AlertStatus::Ack.apply(AlertAction::Acknowledge).is_err());
    }

    #[test]
    fn transition_stamps_the_change_time() {
        let created = Utc::now() - Duration::days(3);
        let mut alert = open_alert(created);
        let at = created + Duration::days(1);
        alert.transition(AlertAction::Close, at).unwrap();

        assert_eq!(alert.status, AlertStatus::Closed);
        assert_eq!(alert.status_changed_at, Some(at));
        assert!(alert.was_open_at(created + Duration::hours(2)));
        assert!(!alert.was_open_at(at + Duration::hours(1)));
        assert!(!alert.was_open_at(created - Duration::hours(1)));
    }

    #[test]
    fn stiffness_requires_positive_kpa() {
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let measured = |kpa: f64, cap: Option<f64>| {
            StiffnessMeasurement::new(patient_id, kpa, cap, StiffnessSource::Measured, now)
        };
        assert!(measured(0.0, None).is_err());
        assert!(measured(-3.0, None).is_err());
        assert!(measured(6.1, Some(-1.0)).is_err());
        let ok = measured(6.1, Some(240.0)).unwrap().entered_by(Some("rn.okafor"));
        assert_eq!(ok.source, StiffnessSource::Measured);
        assert_eq!(ok.entered_by.as_deref(), Some("rn.okafor"));
    }

    #[test]
    fn enum_codecs_accept_stored_text() {
        assert_eq!("critical".parse::<RiskTier>().unwrap(), RiskTier::Critical);
        assert_eq!(
            "RAPID_PROGRESSION".parse::<AlertType>().unwrap(),
            AlertType::RapidProgression
        );
        assert_eq!("ack".parse::<AlertAction>().unwrap(), AlertAction::Acknowledge);
        assert_eq!("closed".parse::<AlertStatus>().unwrap(), AlertStatus::Closed);
        assert!("reopen".parse::<AlertAction>().is_err());
        assert!(RiskTier::Low < RiskTier::Moderate && RiskTier::High < RiskTier::Critical);
    }
}
