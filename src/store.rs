use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    AlertStatus, AlertType, Assessment, ClinicalScore, ExplainabilityRecord, ImagingPrediction,
    MonitoringEvent, Patient, RiskAlert, StiffnessMeasurement, TimelineEvent,
};

/// A planned alert that found an open alert of its type already on record
/// when the event was committed, and was written as a refresh of it instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedAlert {
    pub planned_id: Uuid,
    pub existing_id: Uuid,
    pub alert_type: AlertType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed { merged: Vec<MergedAlert> },
    /// The patient gained an assessment inside the cadence window first.
    AlreadyFresh,
}

/// Persistence collaborator. The monitoring core keeps no state of its own
/// between runs; everything goes through here.
#[async_trait]
pub trait MonitoringStore: Send + Sync {
    async fn list_patients(&self) -> Result<Vec<Patient>>;

    async fn latest_clinical_score(&self, patient_id: Uuid) -> Result<Option<ClinicalScore>>;

    async fn latest_imaging_prediction(&self, patient_id: Uuid)
        -> Result<Option<ImagingPrediction>>;

    async fn latest_measured_stiffness(&self, patient_id: Uuid)
        -> Result<Option<StiffnessMeasurement>>;

    async fn get_clinical_score(&self, score_id: Uuid) -> Result<Option<ClinicalScore>>;

    async fn get_imaging_prediction(&self, prediction_id: Uuid)
        -> Result<Option<ImagingPrediction>>;

    async fn get_stiffness(&self, measurement_id: Uuid) -> Result<Option<StiffnessMeasurement>>;

    /// False when a measured reading for the same patient and instant exists.
    async fn record_stiffness(&self, measurement: &StiffnessMeasurement) -> Result<bool>;

    async fn latest_assessment(&self, patient_id: Uuid) -> Result<Option<Assessment>>;

    /// Oldest first.
    async fn assessment_history(&self, patient_id: Uuid) -> Result<Vec<Assessment>>;

    async fn get_assessment(&self, assessment_id: Uuid) -> Result<Option<Assessment>>;

    /// Newest first, optionally restricted to one status.
    async fn alerts_for_patient(
        &self,
        patient_id: Uuid,
        status: Option<AlertStatus>,
    ) -> Result<Vec<RiskAlert>>;

    async fn get_alert(&self, alert_id: Uuid) -> Result<Option<RiskAlert>>;

    /// Write `alert`'s status only if the stored row is still in `expected`.
    /// Returns false when nothing matched.
    async fn update_alert_status(&self, alert: &RiskAlert, expected: AlertStatus)
        -> Result<bool>;

    async fn explanation_for_assessment(
        &self,
        assessment_id: Uuid,
    ) -> Result<Option<ExplainabilityRecord>>;

    /// Oldest first.
    async fn timeline_for_patient(&self, patient_id: Uuid) -> Result<Vec<TimelineEvent>>;

    /// Write every part of `event` atomically. With `fresh_since`, nothing is
    /// written if the patient already has an assessment created after it.
    /// A new alert whose type already has an open alert created at or after
    /// `event.dedup_since` refreshes that alert instead of being inserted.
    async fn commit_event(
        &self,
        event: &MonitoringEvent,
        fresh_since: Option<DateTime<Utc>>,
    ) -> Result<CommitOutcome>;
}
