use std::str::FromStr;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    AlertStatus, Assessment, ClinicalScore, ExplainabilityRecord, ImagingPrediction,
    MonitoringEvent, Patient, RiskAlert, StiffnessMeasurement, StiffnessSource, TimelineEvent,
};
use crate::store::{CommitOutcome, MergedAlert, MonitoringStore};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Demo patients with Stage 1 and Stage 2 signals; one also has a measured reading.
pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let patients = vec![
        (
            Uuid::parse_str("7b1e4c52-9a0d-4f3e-8d2a-51c6f0b9e3a1")?,
            "HEP-1001",
            "Marisol Ortega",
            (0.18, 41, 24.2, false),
            [0.62, 0.27, 0.08, 0.02, 0.01],
            "F0",
        ),
        (
            Uuid::parse_str("c4d8a2f7-3b61-4e90-a7c5-0e9f2d4b8c63")?,
            "HEP-1002",
            "Desmond Clarke",
            (0.47, 57, 31.5, true),
            [0.08, 0.22, 0.41, 0.21, 0.08],
            "F2",
        ),
        (
            Uuid::parse_str("e91f5b3c-6d27-48a4-b0e8-3a7c1d9f6e25")?,
            "HEP-1003",
            "Yuki Tanaka",
            (0.86, 66, 34.8, true),
            [0.01, 0.03, 0.10, 0.31, 0.55],
            "F4",
        ),
    ];

    let taken_at = Utc::now() - Duration::days(2);
    for (id, external_ref, name, (probability, age, bmi, type2dm), softmax, top1) in patients {
        sqlx::query(
            r#"
            INSERT INTO risk_monitoring.patients (id, external_ref, full_name, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (external_ref) DO UPDATE SET full_name = EXCLUDED.full_name
            "#,
        )
        .bind(id)
        .bind(external_ref)
        .bind(name)
        .bind(taken_at - Duration::days(365))
        .execute(pool)
        .await?;

        let tier = if probability >= 0.7 {
            "HIGH"
        } else if probability >= 0.35 {
            "MODERATE"
        } else {
            "LOW"
        };
        sqlx::query(
            r#"
            INSERT INTO risk_monitoring.clinical_scores
            (id, patient_id, probability, risk_tier, model_version, age, bmi, type2dm, created_at)
            VALUES ($1, $2, $3, $4, 'stage1:v3', $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(probability)
        .bind(tier)
        .bind(age)
        .bind(bmi)
        .bind(type2dm)
        .bind(taken_at)
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO risk_monitoring.imaging_predictions
            (id, patient_id, softmax_vector, top1_stage, confidence_flag, model_version, created_at)
            VALUES ($1, $2, $3, $4, 'NORMAL', 'stage2:v5', $5)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(id)
        .bind(softmax.to_vec())
        .bind(top1)
        .bind(taken_at)
        .execute(pool)
        .await?;
    }

    let measured = StiffnessMeasurement::new(
        Uuid::parse_str("e91f5b3c-6d27-48a4-b0e8-3a7c1d9f6e25")?,
        18.4,
        Some(312.0),
        StiffnessSource::Measured,
        taken_at,
    )?;
    insert_stiffness(pool, &measured).await?;

    Ok(())
}

/// Import measured stiffness readings. Columns: `external_ref`, `kpa`,
/// optional `cap_dbm`, `measured_at` (RFC 3339). Unknown patients are skipped.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        external_ref: String,
        kpa: f64,
        cap_dbm: Option<f64>,
        measured_at: DateTime<Utc>,
    }

    let mut reader = csv::Reader::from_path(csv_path)
        .with_context(|| format!("failed to open {}", csv_path.display()))?;
    let mut inserted = 0usize;

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("malformed row {}", line + 1))?;
        let patient_id: Option<Uuid> = sqlx::query(
            "SELECT id FROM risk_monitoring.patients WHERE external_ref = $1",
        )
        .bind(&row.external_ref)
        .fetch_optional(pool)
        .await?
        .map(|r| r.get("id"));

        let Some(patient_id) = patient_id else {
            warn!(external_ref = %row.external_ref, "unknown patient, reading skipped");
            continue;
        };

        let reading = StiffnessMeasurement::new(
            patient_id,
            row.kpa,
            row.cap_dbm,
            StiffnessSource::Measured,
            row.measured_at,
        )
        .with_context(|| format!("row {} for {}", line + 1, row.external_ref))?;

        if insert_stiffness(pool, &reading).await? > 0 {
            inserted += 1;
        }
    }

    Ok(inserted)
}

async fn insert_stiffness<'e, E>(executor: E, reading: &StiffnessMeasurement) -> sqlx::Result<u64>
where
    E: sqlx::PgExecutor<'e>,
{
    let result = sqlx::query(
        r#"
        INSERT INTO risk_monitoring.stiffness_measurements
        (id, patient_id, kpa, cap_dbm, source, measured_at, entered_by)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (patient_id, measured_at) WHERE source = 'MEASURED' DO NOTHING
        "#,
    )
    .bind(reading.id)
    .bind(reading.patient_id)
    .bind(reading.kpa)
    .bind(reading.cap_dbm)
    .bind(reading.source.as_str())
    .bind(reading.measured_at)
    .bind(&reading.entered_by)
    .execute(executor)
    .await?;
    Ok(result.rows_affected())
}

fn parse_column<T>(row: &PgRow, column: &str) -> sqlx::Result<T>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse::<T>().map_err(|err| sqlx::Error::Decode(err.into()))
}

fn patient_from_row(row: &PgRow) -> sqlx::Result<Patient> {
    Ok(Patient {
        id: row.try_get("id")?,
        external_ref: row.try_get("external_ref")?,
        full_name: row.try_get("full_name")?,
        created_at: row.try_get("created_at")?,
    })
}

fn clinical_from_row(row: &PgRow) -> sqlx::Result<ClinicalScore> {
    Ok(ClinicalScore {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        probability: row.try_get("probability")?,
        risk_tier: row.try_get("risk_tier")?,
        model_version: row.try_get("model_version")?,
        age: row.try_get("age")?,
        bmi: row.try_get("bmi")?,
        type2dm: row.try_get("type2dm")?,
        created_at: row.try_get("created_at")?,
    })
}

fn imaging_from_row(row: &PgRow) -> sqlx::Result<ImagingPrediction> {
    Ok(ImagingPrediction {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        softmax_vector: row.try_get("softmax_vector")?,
        top1_stage: row.try_get("top1_stage")?,
        confidence_flag: row.try_get("confidence_flag")?,
        model_version: row.try_get("model_version")?,
        created_at: row.try_get("created_at")?,
    })
}

fn stiffness_from_row(row: &PgRow) -> sqlx::Result<StiffnessMeasurement> {
    Ok(StiffnessMeasurement {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        kpa: row.try_get("kpa")?,
        cap_dbm: row.try_get("cap_dbm")?,
        source: parse_column(row, "source")?,
        measured_at: row.try_get("measured_at")?,
        entered_by: row.try_get("entered_by")?,
    })
}

fn assessment_from_row(row: &PgRow) -> sqlx::Result<Assessment> {
    let Json(feature_snapshot) = row.try_get("feature_snapshot")?;
    Ok(Assessment {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        clinical_score_id: row.try_get("clinical_score_id")?,
        imaging_prediction_id: row.try_get("imaging_prediction_id")?,
        stiffness_measurement_id: row.try_get("stiffness_measurement_id")?,
        composite_risk_score: row.try_get("composite_risk_score")?,
        progression_risk_12m: row.try_get("progression_risk_12m")?,
        decomp_risk_12m: row.try_get("decomp_risk_12m")?,
        risk_tier: parse_column(row, "risk_tier")?,
        scorer_version: row.try_get("scorer_version")?,
        feature_snapshot,
        performed_by: row.try_get("performed_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn alert_from_row(row: &PgRow) -> sqlx::Result<RiskAlert> {
    Ok(RiskAlert {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        assessment_id: row.try_get("assessment_id")?,
        alert_type: parse_column(row, "alert_type")?,
        severity: parse_column(row, "severity")?,
        status: parse_column(row, "status")?,
        score: row.try_get("score")?,
        threshold: row.try_get("threshold")?,
        last_seen_score: row.try_get("last_seen_score")?,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        status_changed_at: row.try_get("status_changed_at")?,
    })
}

fn timeline_from_row(row: &PgRow) -> sqlx::Result<TimelineEvent> {
    let Json(payload) = row.try_get("payload")?;
    Ok(TimelineEvent {
        id: row.try_get("id")?,
        patient_id: row.try_get("patient_id")?,
        event_type: row.try_get("event_type")?,
        payload,
        created_by: row.try_get("created_by")?,
        created_at: row.try_get("created_at")?,
    })
}

fn explanation_from_row(row: &PgRow) -> sqlx::Result<ExplainabilityRecord> {
    let Json(positive) = row.try_get("positive")?;
    let Json(negative) = row.try_get("negative")?;
    let Json(raw_components) = row.try_get("raw_components")?;
    let Json(trend) = row.try_get("trend")?;
    Ok(ExplainabilityRecord {
        assessment_id: row.try_get("assessment_id")?,
        patient_id: row.try_get("patient_id")?,
        positive,
        negative,
        raw_components,
        reference_version: row.try_get("reference_version")?,
        trend,
        created_at: row.try_get("created_at")?,
    })
}

const CLINICAL_COLUMNS: &str =
    "id, patient_id, probability, risk_tier, model_version, age, bmi, type2dm, created_at";

const IMAGING_COLUMNS: &str =
    "id, patient_id, softmax_vector, top1_stage, confidence_flag, model_version, created_at";

const STIFFNESS_COLUMNS: &str = "id, patient_id, kpa, cap_dbm, source, measured_at, entered_by";

const ASSESSMENT_COLUMNS: &str = "id, patient_id, clinical_score_id, imaging_prediction_id, \
     stiffness_measurement_id, composite_risk_score, progression_risk_12m, decomp_risk_12m, \
     risk_tier, scorer_version, feature_snapshot, performed_by, created_at";

const ALERT_COLUMNS: &str = "id, patient_id, assessment_id, alert_type, severity, status, score, \
     threshold, last_seen_score, created_by, created_at, updated_at, status_changed_at";

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MonitoringStore for PgStore {
    async fn list_patients(&self) -> Result<Vec<Patient>> {
        let rows = sqlx::query(
            "SELECT id, external_ref, full_name, created_at FROM risk_monitoring.patients \
             ORDER BY created_at, id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(patient_from_row).collect::<sqlx::Result<_>>()?)
    }

    async fn latest_clinical_score(&self, patient_id: Uuid) -> Result<Option<ClinicalScore>> {
        let query = format!(
            "SELECT {CLINICAL_COLUMNS} FROM risk_monitoring.clinical_scores \
             WHERE patient_id = $1 ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(clinical_from_row).transpose()?)
    }

    async fn latest_imaging_prediction(
        &self,
        patient_id: Uuid,
    ) -> Result<Option<ImagingPrediction>> {
        let query = format!(
            "SELECT {IMAGING_COLUMNS} FROM risk_monitoring.imaging_predictions \
             WHERE patient_id = $1 ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(imaging_from_row).transpose()?)
    }

    async fn latest_measured_stiffness(
        &self,
        patient_id: Uuid,
    ) -> Result<Option<StiffnessMeasurement>> {
        let query = format!(
            "SELECT {STIFFNESS_COLUMNS} FROM risk_monitoring.stiffness_measurements \
             WHERE patient_id = $1 AND source = 'MEASURED' \
             ORDER BY measured_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(stiffness_from_row).transpose()?)
    }

    async fn get_clinical_score(&self, score_id: Uuid) -> Result<Option<ClinicalScore>> {
        let query =
            format!("SELECT {CLINICAL_COLUMNS} FROM risk_monitoring.clinical_scores WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(score_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(clinical_from_row).transpose()?)
    }

    async fn get_imaging_prediction(
        &self,
        prediction_id: Uuid,
    ) -> Result<Option<ImagingPrediction>> {
        let query = format!(
            "SELECT {IMAGING_COLUMNS} FROM risk_monitoring.imaging_predictions WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(prediction_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(imaging_from_row).transpose()?)
    }

    async fn get_stiffness(&self, measurement_id: Uuid) -> Result<Option<StiffnessMeasurement>> {
        let query = format!(
            "SELECT {STIFFNESS_COLUMNS} FROM risk_monitoring.stiffness_measurements WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(measurement_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(stiffness_from_row).transpose()?)
    }

    async fn record_stiffness(&self, measurement: &StiffnessMeasurement) -> Result<bool> {
        let inserted = insert_stiffness(&self.pool, measurement).await?;
        Ok(inserted > 0)
    }

    async fn latest_assessment(&self, patient_id: Uuid) -> Result<Option<Assessment>> {
        let query = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_monitoring.stage3_assessments \
             WHERE patient_id = $1 ORDER BY created_at DESC LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(patient_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(assessment_from_row).transpose()?)
    }

    async fn assessment_history(&self, patient_id: Uuid) -> Result<Vec<Assessment>> {
        let query = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_monitoring.stage3_assessments \
             WHERE patient_id = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&query)
            .bind(patient_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(assessment_from_row).collect::<sqlx::Result<_>>()?)
    }

    async fn get_assessment(&self, assessment_id: Uuid) -> Result<Option<Assessment>> {
        let query = format!(
            "SELECT {ASSESSMENT_COLUMNS} FROM risk_monitoring.stage3_assessments WHERE id = $1"
        );
        let row = sqlx::query(&query)
            .bind(assessment_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(assessment_from_row).transpose()?)
    }

    async fn alerts_for_patient(
        &self,
        patient_id: Uuid,
        status: Option<AlertStatus>,
    ) -> Result<Vec<RiskAlert>> {
        let mut query = format!(
            "SELECT {ALERT_COLUMNS} FROM risk_monitoring.risk_alerts WHERE patient_id = $1"
        );
        if status.is_some() {
            query.push_str(" AND status = $2");
        }
        query.push_str(" ORDER BY created_at DESC, id");

        let mut rows = sqlx::query(&query).bind(patient_id);
        if let Some(value) = status {
            rows = rows.bind(value.as_str());
        }
        let records = rows.fetch_all(&self.pool).await?;
        Ok(records.iter().map(alert_from_row).collect::<sqlx::Result<_>>()?)
    }

    async fn get_alert(&self, alert_id: Uuid) -> Result<Option<RiskAlert>> {
        let query =
            format!("SELECT {ALERT_COLUMNS} FROM risk_monitoring.risk_alerts WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(alert_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(alert_from_row).transpose()?)
    }

    async fn update_alert_status(&self, alert: &RiskAlert, expected: AlertStatus) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE risk_monitoring.risk_alerts
            SET status = $2, status_changed_at = $3, updated_at = $4
            WHERE id = $1 AND status = $5
            "#,
        )
        .bind(alert.id)
        .bind(alert.status.as_str())
        .bind(alert.status_changed_at)
        .bind(alert.updated_at)
        .bind(expected.as_str())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn explanation_for_assessment(
        &self,
        assessment_id: Uuid,
    ) -> Result<Option<ExplainabilityRecord>> {
        let row = sqlx::query(
            "SELECT assessment_id, patient_id, positive, negative, raw_components, \
             reference_version, trend, created_at FROM risk_monitoring.stage3_explanations \
             WHERE assessment_id = $1",
        )
        .bind(assessment_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(explanation_from_row).transpose()?)
    }

    async fn timeline_for_patient(&self, patient_id: Uuid) -> Result<Vec<TimelineEvent>> {
        let rows = sqlx::query(
            "SELECT id, patient_id, event_type, payload, created_by, created_at \
             FROM risk_monitoring.timeline_events WHERE patient_id = $1 \
             ORDER BY created_at, id",
        )
        .bind(patient_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(timeline_from_row).collect::<sqlx::Result<_>>()?)
    }

    async fn commit_event(
        &self,
        event: &MonitoringEvent,
        fresh_since: Option<DateTime<Utc>>,
    ) -> Result<CommitOutcome> {
        let assessment = &event.assessment;
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent runs for the same patient until commit.
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
            .bind(assessment.patient_id)
            .execute(&mut *tx)
            .await?;

        if let Some(since) = fresh_since {
            let fresh: bool = sqlx::query(
                "SELECT EXISTS (SELECT 1 FROM risk_monitoring.stage3_assessments \
                 WHERE patient_id = $1 AND created_at > $2)",
            )
            .bind(assessment.patient_id)
            .bind(since)
            .fetch_one(&mut *tx)
            .await?
            .get(0);
            if fresh {
                tx.rollback().await?;
                debug!(
                    patient_id = %assessment.patient_id,
                    "assessment already fresh, nothing written"
                );
                return Ok(CommitOutcome::AlreadyFresh);
            }
        }

        if let Some(proxy) = &event.proxy_stiffness {
            insert_stiffness(&mut *tx, proxy).await?;
        }

        sqlx::query(
            r#"
            INSERT INTO risk_monitoring.stage3_assessments
            (id, patient_id, clinical_score_id, imaging_prediction_id, stiffness_measurement_id,
             composite_risk_score, progression_risk_12m, decomp_risk_12m, risk_tier,
             scorer_version, feature_snapshot, performed_by, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(assessment.id)
        .bind(assessment.patient_id)
        .bind(assessment.clinical_score_id)
        .bind(assessment.imaging_prediction_id)
        .bind(assessment.stiffness_measurement_id)
        .bind(assessment.composite_risk_score)
        .bind(assessment.progression_risk_12m)
        .bind(assessment.decomp_risk_12m)
        .bind(assessment.risk_tier.as_str())
        .bind(&assessment.scorer_version)
        .bind(Json(&assessment.feature_snapshot))
        .bind(&assessment.performed_by)
        .bind(assessment.created_at)
        .execute(&mut *tx)
        .await?;

        let explanation = &event.explanation;
        sqlx::query(
            r#"
            INSERT INTO risk_monitoring.stage3_explanations
            (assessment_id, patient_id, positive, negative, raw_components, reference_version,
             trend, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(explanation.assessment_id)
        .bind(explanation.patient_id)
        .bind(Json(&explanation.positive))
        .bind(Json(&explanation.negative))
        .bind(Json(&explanation.raw_components))
        .bind(&explanation.reference_version)
        .bind(Json(&explanation.trend))
        .bind(explanation.created_at)
        .execute(&mut *tx)
        .await?;

        let mut merged = Vec::new();
        for alert in &event.new_alerts {
            // Another writer may have raised this type since the plan was made.
            let open: Option<Uuid> = sqlx::query(
                "SELECT id FROM risk_monitoring.risk_alerts \
                 WHERE patient_id = $1 AND alert_type = $2 AND status = 'open' \
                 AND created_at >= $3 ORDER BY created_at DESC LIMIT 1",
            )
            .bind(alert.patient_id)
            .bind(alert.alert_type.as_str())
            .bind(event.dedup_since)
            .fetch_optional(&mut *tx)
            .await?
            .map(|row| row.get("id"));

            if let Some(existing_id) = open {
                sqlx::query(
                    "UPDATE risk_monitoring.risk_alerts \
                     SET last_seen_score = $2, updated_at = $3 WHERE id = $1",
                )
                .bind(existing_id)
                .bind(alert.score)
                .bind(alert.created_at)
                .execute(&mut *tx)
                .await?;
                merged.push(MergedAlert {
                    planned_id: alert.id,
                    existing_id,
                    alert_type: alert.alert_type,
                });
                continue;
            }

            sqlx::query(
                r#"
                INSERT INTO risk_monitoring.risk_alerts
                (id, patient_id, assessment_id, alert_type, severity, status, score, threshold,
                 last_seen_score, created_by, created_at, updated_at, status_changed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                "#,
            )
            .bind(alert.id)
            .bind(alert.patient_id)
            .bind(alert.assessment_id)
            .bind(alert.alert_type.as_str())
            .bind(alert.severity.as_str())
            .bind(alert.status.as_str())
            .bind(alert.score)
            .bind(alert.threshold)
            .bind(alert.last_seen_score)
            .bind(&alert.created_by)
            .bind(alert.created_at)
            .bind(alert.updated_at)
            .bind(alert.status_changed_at)
            .execute(&mut *tx)
            .await?;
        }

        for refresh in &event.refreshed_alerts {
            sqlx::query(
                r#"
                UPDATE risk_monitoring.risk_alerts
                SET last_seen_score = $2, updated_at = $3
                WHERE id = $1 AND status = 'open'
                "#,
            )
            .bind(refresh.alert_id)
            .bind(refresh.last_seen_score)
            .bind(refresh.seen_at)
            .execute(&mut *tx)
            .await?;
        }

        if let Some(entry) = event.timeline_event(event.new_alerts.len() - merged.len()) {
            sqlx::query(
                r#"
                INSERT INTO risk_monitoring.timeline_events
                (id, patient_id, event_type, payload, created_by, created_at)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(entry.id)
            .bind(entry.patient_id)
            .bind(&entry.event_type)
            .bind(Json(&entry.payload))
            .bind(&entry.created_by)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        if !merged.is_empty() {
            debug!(
                patient_id = %assessment.patient_id,
                merged = merged.len(),
                "planned alerts merged into open alerts at commit"
            );
        }
        Ok(CommitOutcome::Committed { merged })
    }
}
