//! Scheduled and manual monitoring runs.
//!
//! Each patient is an independent unit of work: read inputs, resolve
//! stiffness, score, decide alerts, explain, then commit everything in one
//! store transaction. A batch fans the units out and collects a typed outcome
//! per patient; one patient's failure never stops the others.

use std::collections::HashMap;
use std::time::Instant;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::alerts::{self, RuleFailure};
use crate::config::{Calibration, Settings};
use crate::error::{MonitorError, Result, UpstreamInput};
use crate::explain::{self, ExplainOptions};
use crate::models::{
    AlertRefresh, AlertType, Assessment, BatchContext, ClinicalScore, FeatureSnapshot,
    ImagingPrediction, MonitoringEvent, Patient, RiskAlert,
};
use crate::risk::{self, ScoreInputs};
use crate::stiffness::{ResolvedStiffness, StiffnessResolver};
use crate::store::{CommitOutcome, MonitoringStore};

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Compute and report everything but write nothing.
    pub dry_run: bool,
    /// Stop scheduling new units after this many due patients.
    pub patient_limit: Option<usize>,
    /// Stop scheduling new units after this instant; running units finish.
    pub deadline: Option<Instant>,
    pub as_of: DateTime<Utc>,
    /// Operator or job the run is attributed to.
    pub performed_by: Option<String>,
}

impl RunOptions {
    pub fn at(as_of: DateTime<Utc>) -> Self {
        Self {
            dry_run: false,
            patient_limit: None,
            deadline: None,
            as_of,
            performed_by: None,
        }
    }
}

/// Explicit upstream rows for a manual assessment. Unset fields fall back to
/// the patient's latest row (and the stiffness resolver for stiffness).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputSelection {
    pub clinical_score_id: Option<Uuid>,
    pub imaging_prediction_id: Option<Uuid>,
    pub stiffness_measurement_id: Option<Uuid>,
}

/// Result of running the pipeline for one patient, committed or projected.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluatedEvent {
    pub event: MonitoringEvent,
    pub suppressed: Vec<AlertType>,
    pub rule_failures: Vec<String>,
    pub committed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    Stiffness,
    ClinicalScore,
    ImagingPrediction,
    AlreadyAssessed,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Stiffness => "stiffness",
            SkipReason::ClinicalScore => "clinical score",
            SkipReason::ImagingPrediction => "imaging prediction",
            SkipReason::AlreadyAssessed => "already assessed this cadence",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PatientOutcome {
    Success {
        patient_id: Uuid,
        result: Box<EvaluatedEvent>,
    },
    Skipped {
        patient_id: Uuid,
        reason: SkipReason,
    },
    Failed {
        patient_id: Uuid,
        reason: String,
    },
}

impl PatientOutcome {
    pub fn patient_id(&self) -> Uuid {
        match self {
            PatientOutcome::Success { patient_id, .. }
            | PatientOutcome::Skipped { patient_id, .. }
            | PatientOutcome::Failed { patient_id, .. } => *patient_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Completed,
    Disabled,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchReport {
    pub status: BatchStatus,
    pub dry_run: bool,
    pub interval_weeks: u32,
    pub performed_by: Option<String>,
    pub run_started_at: DateTime<Utc>,
    pub run_finished_at: DateTime<Utc>,
    pub patients_seen: usize,
    pub not_due: usize,
    /// Due patients left unscheduled by the limit or deadline.
    pub deferred: usize,
    pub outcomes: Vec<PatientOutcome>,
}

impl BatchReport {
    pub fn succeeded(&self) -> usize {
        self.count(|o| matches!(o, PatientOutcome::Success { .. }))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, PatientOutcome::Skipped { .. }))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, PatientOutcome::Failed { .. }))
    }

    pub fn alerts_created(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match o {
                PatientOutcome::Success { result, .. } => result.event.new_alerts.len(),
                _ => 0,
            })
            .sum()
    }

    fn count(&self, predicate: impl Fn(&PatientOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| predicate(o)).count()
    }
}

pub struct Monitor<'a, S: MonitoringStore + ?Sized> {
    store: &'a S,
    settings: &'a Settings,
    calibration: &'a Calibration,
}

impl<'a, S: MonitoringStore + ?Sized> Monitor<'a, S> {
    pub fn new(store: &'a S, settings: &'a Settings, calibration: &'a Calibration) -> Self {
        Self {
            store,
            settings,
            calibration,
        }
    }

    /// Scheduled run over every patient due at `options.as_of`.
    pub async fn run_batch(&self, options: &RunOptions) -> Result<BatchReport> {
        let run_started_at = Utc::now();
        let mut report = BatchReport {
            status: BatchStatus::Completed,
            dry_run: options.dry_run,
            interval_weeks: self.settings.monitoring.interval_weeks,
            performed_by: options.performed_by.clone(),
            run_started_at,
            run_finished_at: run_started_at,
            patients_seen: 0,
            not_due: 0,
            deferred: 0,
            outcomes: Vec::new(),
        };

        if !self.settings.monitoring.enabled {
            info!("risk monitoring disabled, batch skipped");
            report.status = BatchStatus::Disabled;
            report.run_finished_at = Utc::now();
            return Ok(report);
        }

        let patients = self.store.list_patients().await?;
        report.patients_seen = patients.len();

        let mut due: Vec<Patient> = Vec::new();
        for patient in patients {
            match self.is_due(patient.id, options.as_of).await {
                Ok(true) => due.push(patient),
                Ok(false) => report.not_due += 1,
                Err(err) => {
                    warn!(patient_id = %patient.id, reason = %err, "eligibility check failed");
                    report.outcomes.push(PatientOutcome::Failed {
                        patient_id: patient.id,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let limit = options.patient_limit.unwrap_or(usize::MAX);
        let scheduled = due.len().min(limit);
        report.deferred = due.len() - scheduled;
        let order: HashMap<Uuid, usize> =
            due.iter().enumerate().map(|(i, p)| (p.id, i)).collect();

        let context = BatchContext {
            monitoring_mode: self.settings.monitoring_mode().to_string(),
            interval_weeks: self.settings.monitoring.interval_weeks,
            run_started_at,
        };
        let deadline = options.deadline;
        let mut outcomes: Vec<PatientOutcome> = stream::iter(due.into_iter().take(limit))
            .take_while(|_| futures::future::ready(deadline.map_or(true, |d| Instant::now() < d)))
            .map(|patient| self.run_unit(patient.id, options, &context))
            .buffer_unordered(self.settings.monitoring.concurrency)
            .collect()
            .await;

        report.deferred += scheduled - outcomes.len();
        outcomes.sort_by_key(|o| order.get(&o.patient_id()).copied());
        report.outcomes.extend(outcomes);
        report.run_finished_at = Utc::now();

        info!(
            dry_run = report.dry_run,
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            not_due = report.not_due,
            deferred = report.deferred,
            alerts_created = report.alerts_created(),
            "monitoring batch finished"
        );
        Ok(report)
    }

    /// Manual single-patient run: ignores cadence and surfaces errors directly.
    pub async fn assess_patient(
        &self,
        patient_id: Uuid,
        as_of: DateTime<Utc>,
        selection: &InputSelection,
        performed_by: Option<&str>,
    ) -> Result<EvaluatedEvent> {
        if !self.settings.monitoring.enabled {
            return Err(MonitorError::Disabled);
        }
        let mut evaluated = self.evaluate(patient_id, as_of, selection, performed_by).await?;
        self.commit(&mut evaluated, None).await?;
        info!(
            patient_id = %patient_id,
            assessment_id = %evaluated.event.assessment.id,
            risk_tier = %evaluated.event.assessment.risk_tier,
            alerts_created = evaluated.event.new_alerts.len(),
            "manual assessment recorded"
        );
        Ok(evaluated)
    }

    /// Due when no assessment exists inside the current cadence window.
    pub async fn is_due(&self, patient_id: Uuid, as_of: DateTime<Utc>) -> Result<bool> {
        let latest = self.store.latest_assessment(patient_id).await?;
        Ok(latest.map_or(true, |a| a.created_at <= as_of - self.settings.interval()))
    }

    /// Write `evaluated` and fold any alerts the store merged into open ones
    /// back into the result. False when the freshness guard rejected it.
    async fn commit(
        &self,
        evaluated: &mut EvaluatedEvent,
        fresh_since: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let merged = match self.store.commit_event(&evaluated.event, fresh_since).await? {
            CommitOutcome::Committed { merged } => merged,
            CommitOutcome::AlreadyFresh => return Ok(false),
        };
        let event = &mut evaluated.event;
        for merge in merged {
            let Some(pos) = event.new_alerts.iter().position(|a| a.id == merge.planned_id) else {
                continue;
            };
            let planned = event.new_alerts.remove(pos);
            info!(
                patient_id = %planned.patient_id,
                alert_id = %merge.existing_id,
                alert_type = %merge.alert_type,
                "duplicate alert suppressed at commit"
            );
            evaluated.suppressed.push(merge.alert_type);
            event.refreshed_alerts.push(AlertRefresh {
                alert_id: merge.existing_id,
                last_seen_score: planned.score,
                seen_at: planned.created_at,
            });
        }
        evaluated.committed = true;
        Ok(true)
    }

    async fn run_unit(
        &self,
        patient_id: Uuid,
        options: &RunOptions,
        context: &BatchContext,
    ) -> PatientOutcome {
        match self.run_unit_inner(patient_id, options, context).await {
            Ok(outcome) => outcome,
            Err(err) => {
                if let Some(reason) = skip_reason(&err) {
                    info!(
                        patient_id = %patient_id,
                        reason = reason.as_str(),
                        "patient skipped, stage unavailable"
                    );
                    PatientOutcome::Skipped { patient_id, reason }
                } else {
                    warn!(patient_id = %patient_id, reason = %err, "monitoring unit failed");
                    PatientOutcome::Failed {
                        patient_id,
                        reason: err.to_string(),
                    }
                }
            }
        }
    }

    async fn run_unit_inner(
        &self,
        patient_id: Uuid,
        options: &RunOptions,
        context: &BatchContext,
    ) -> Result<PatientOutcome> {
        let performed_by = options.performed_by.as_deref();
        let mut evaluated = self
            .evaluate(patient_id, options.as_of, &InputSelection::default(), performed_by)
            .await?;
        evaluated.event.batch = Some(context.clone());
        if !options.dry_run {
            let fresh_since = options.as_of - self.settings.interval();
            if !self.commit(&mut evaluated, Some(fresh_since)).await? {
                return Ok(PatientOutcome::Skipped {
                    patient_id,
                    reason: SkipReason::AlreadyAssessed,
                });
            }
        }
        Ok(PatientOutcome::Success {
            patient_id,
            result: Box::new(evaluated),
        })
    }

    async fn clinical_input(
        &self,
        patient_id: Uuid,
        selected: Option<Uuid>,
    ) -> Result<ClinicalScore> {
        match selected {
            Some(id) => owned_by(
                self.store.get_clinical_score(id).await?,
                patient_id,
                |row| row.patient_id,
                || format!("clinical score {id} for patient {patient_id}"),
            ),
            None => self.store.latest_clinical_score(patient_id).await?.ok_or(
                MonitorError::MissingInput {
                    patient_id,
                    input: UpstreamInput::ClinicalScore,
                },
            ),
        }
    }

    async fn imaging_input(
        &self,
        patient_id: Uuid,
        selected: Option<Uuid>,
    ) -> Result<ImagingPrediction> {
        match selected {
            Some(id) => owned_by(
                self.store.get_imaging_prediction(id).await?,
                patient_id,
                |row| row.patient_id,
                || format!("imaging prediction {id} for patient {patient_id}"),
            ),
            None => self.store.latest_imaging_prediction(patient_id).await?.ok_or(
                MonitorError::MissingInput {
                    patient_id,
                    input: UpstreamInput::ImagingPrediction,
                },
            ),
        }
    }

    async fn stiffness_input(
        &self,
        patient_id: Uuid,
        selected: Option<Uuid>,
        clinical: &ClinicalScore,
        imaging: &ImagingPrediction,
        now: DateTime<Utc>,
    ) -> Result<ResolvedStiffness> {
        if let Some(id) = selected {
            let reading = owned_by(
                self.store.get_stiffness(id).await?,
                patient_id,
                |row| row.patient_id,
                || format!("stiffness measurement {id} for patient {patient_id}"),
            )?;
            return Ok(ResolvedStiffness::Existing(reading));
        }
        let measured = self.store.latest_measured_stiffness(patient_id).await?;
        let resolver = StiffnessResolver::new(
            &self.calibration.proxy,
            self.settings.measured_recency(),
            self.settings.monitoring.stiffness_proxy_enabled,
        );
        resolver.resolve(patient_id, clinical, imaging, measured.as_ref(), now)
    }

    /// Run the full pipeline for one patient without writing anything.
    pub async fn evaluate(
        &self,
        patient_id: Uuid,
        now: DateTime<Utc>,
        selection: &InputSelection,
        performed_by: Option<&str>,
    ) -> Result<EvaluatedEvent> {
        let clinical = self.clinical_input(patient_id, selection.clinical_score_id).await?;
        let imaging = self
            .imaging_input(patient_id, selection.imaging_prediction_id)
            .await?;
        let stiffness = self
            .stiffness_input(
                patient_id,
                selection.stiffness_measurement_id,
                &clinical,
                &imaging,
                now,
            )
            .await?;
        let reading = stiffness.measurement().clone();

        let scorer = &self.calibration.scorer;
        let score = risk::score(
            scorer,
            &ScoreInputs {
                clinical_probability: clinical.probability,
                imaging_softmax: &imaging.softmax_vector,
                stiffness_kpa: reading.kpa,
            },
        )?;

        let thresholds = &self.calibration.alerts;
        let assessment = Assessment {
            id: Uuid::new_v4(),
            patient_id,
            clinical_score_id: Some(clinical.id),
            imaging_prediction_id: Some(imaging.id),
            stiffness_measurement_id: Some(reading.id),
            composite_risk_score: score.composite,
            progression_risk_12m: score.progression_12m,
            decomp_risk_12m: score.decomp_12m,
            risk_tier: score.tier,
            scorer_version: scorer.version.clone(),
            feature_snapshot: FeatureSnapshot {
                clinical_probability: clinical.probability,
                clinical_model_version: clinical.model_version.clone(),
                imaging_softmax: imaging.softmax_vector.clone(),
                imaging_top1_stage: imaging.top1_stage.clone(),
                imaging_model_version: imaging.model_version.clone(),
                stiffness_kpa: reading.kpa,
                stiffness_source: reading.source,
                clinical_index: score.sub_scores.clinical,
                imaging_index: score.sub_scores.imaging,
                stiffness_index: score.sub_scores.stiffness,
                advanced_fibrosis_threshold: thresholds.advanced_fibrosis,
                high_decomp_threshold: thresholds.high_decomp,
                alert_ppv_target: thresholds.ppv_target,
                alert_recall_floor: thresholds.recall_floor,
            },
            performed_by: performed_by.map(str::to_owned),
            created_at: now,
        };

        let history = self.store.assessment_history(patient_id).await?;
        let prior: Vec<Assessment> = history
            .into_iter()
            .filter(|row| row.created_at <= now)
            .collect();
        let existing = self.store.alerts_for_patient(patient_id, None).await?;

        let decision = alerts::evaluate(thresholds, &assessment, &prior, &existing, now);

        let all_alerts: Vec<RiskAlert> = existing
            .iter()
            .chain(decision.created.iter())
            .cloned()
            .collect();
        let explanation = explain::explain(
            scorer,
            ExplainOptions {
                top_k: self.settings.monitoring.explain_top_k,
                trend_limit: self.settings.monitoring.trend_limit,
            },
            &assessment,
            &prior,
            &all_alerts,
        )?;

        Ok(EvaluatedEvent {
            event: MonitoringEvent {
                proxy_stiffness: stiffness
                    .into_new_proxy()
                    .map(|proxy| proxy.entered_by(performed_by)),
                assessment,
                explanation,
                new_alerts: decision.created,
                refreshed_alerts: decision.refreshed,
                dedup_since: now - thresholds.dedup_window,
                batch: None,
            },
            suppressed: decision.suppressed,
            rule_failures: decision
                .rule_failures
                .iter()
                .map(|RuleFailure { alert_type, error }| format!("{alert_type}: {error}"))
                .collect(),
            committed: false,
        })
    }
}

/// An explicitly selected row must exist and belong to the patient.
fn owned_by<T>(
    row: Option<T>,
    patient_id: Uuid,
    owner: impl Fn(&T) -> Uuid,
    describe: impl FnOnce() -> String,
) -> Result<T> {
    row.filter(|row| owner(row) == patient_id)
        .ok_or_else(|| MonitorError::NotFound(describe()))
}

fn skip_reason(err: &MonitorError) -> Option<SkipReason> {
    match err {
        MonitorError::MissingStiffnessSignal { .. } => Some(SkipReason::Stiffness),
        MonitorError::MissingInput { input, .. } => Some(match input {
            UpstreamInput::ClinicalScore => SkipReason::ClinicalScore,
            UpstreamInput::ImagingPrediction => SkipReason::ImagingPrediction,
        }),
        _ => None,
    }
}
