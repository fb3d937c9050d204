use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

mod alerts;
mod config;
mod db;
mod error;
mod explain;
mod models;
mod monitor;
mod report;
mod risk;
mod stiffness;
mod store;

use config::{Calibration, Settings};
use models::{AlertAction, AlertStatus, StiffnessMeasurement, StiffnessSource};
use monitor::{InputSelection, Monitor, RunOptions};
use store::MonitoringStore;

#[derive(Parser)]
#[command(name = "risk-monitor")]
#[command(about = "Longitudinal liver risk monitoring and alerting", long_about = None)]
struct Cli {
    /// Runtime settings file
    #[arg(long, env = "RISK_MONITOR_CONFIG", default_value = "risk-monitor.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database schema
    InitDb,
    /// Load demo patients with clinical and imaging signals
    Seed,
    /// Import measured stiffness readings from a CSV file
    Import {
        #[arg(long)]
        csv: PathBuf,
    },
    /// Record one measured stiffness reading taken now
    RecordStiffness {
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        kpa: f64,
        #[arg(long)]
        cap: Option<f64>,
        /// Who took the reading
        #[arg(long)]
        performed_by: Option<String>,
    },
    /// Assess one patient immediately, ignoring the cadence
    Assess {
        #[arg(long)]
        patient: Uuid,
        /// Score this clinical score instead of the latest
        #[arg(long)]
        clinical: Option<Uuid>,
        /// Score this imaging prediction instead of the latest
        #[arg(long)]
        imaging: Option<Uuid>,
        /// Use this stiffness reading as-is, regardless of its age
        #[arg(long)]
        stiffness: Option<Uuid>,
        #[arg(long)]
        performed_by: Option<String>,
    },
    /// Run the scheduled batch over every due patient
    Monitor {
        #[arg(long)]
        dry_run: bool,
        /// Maximum number of due patients to process
        #[arg(long)]
        limit: Option<usize>,
        /// Stop scheduling new patients after this many seconds
        #[arg(long)]
        deadline_secs: Option<u64>,
        /// Also write a markdown summary of the run
        #[arg(long = "report")]
        report_path: Option<PathBuf>,
        #[arg(long, env = "RISK_MONITOR_PERFORMED_BY")]
        performed_by: Option<String>,
    },
    /// Print a patient's assessments, oldest first
    History {
        #[arg(long)]
        patient: Uuid,
    },
    /// Print a patient's alerts, newest first
    Alerts {
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        status: Option<AlertStatus>,
    },
    /// Acknowledge or close an alert
    SetAlertStatus {
        #[arg(long)]
        patient: Uuid,
        #[arg(long)]
        alert: Uuid,
        /// ack or close
        #[arg(long)]
        action: AlertAction,
    },
    /// Print an assessment together with its stored explanation
    Explain {
        #[arg(long)]
        assessment: Uuid,
    },
    /// Print a patient's timeline events, oldest first
    Timeline {
        #[arg(long)]
        patient: Uuid,
    },
    /// Write a markdown history report for one patient
    Report {
        #[arg(long)]
        patient: Uuid,
        #[arg(long, default_value = "risk-report.md")]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("hepatica_risk_monitor=info")),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("failed to load settings from {}", cli.config.display()))?;
    let calibration = Calibration::load(&settings.monitoring.calibration_file, &settings.alerts)
        .context("calibration is required before any monitoring work")?;

    let database_url = std::env::var("DATABASE_URL")
        .context("DATABASE_URL must be set to a production Postgres instance")?;

    let pool = PgPoolOptions::new()
        .max_connections(settings.pool_size())
        .connect(&database_url)
        .await
        .context("failed to connect to Postgres")?;
    let store = db::PgStore::new(pool.clone());

    match cli.command {
        Commands::InitDb => {
            db::init_db(&pool).await?;
            println!("Schema ready.");
        }
        Commands::Seed => {
            db::seed(&pool).await?;
            println!("Seed data inserted.");
        }
        Commands::Import { csv } => {
            let inserted = db::import_csv(&pool, &csv).await?;
            println!("Inserted {inserted} stiffness readings from {}.", csv.display());
        }
        Commands::RecordStiffness {
            patient,
            kpa,
            cap,
            performed_by,
        } => {
            let reading =
                StiffnessMeasurement::new(patient, kpa, cap, StiffnessSource::Measured, Utc::now())
                    .map(|m| m.entered_by(performed_by.as_deref()))?;
            if store.record_stiffness(&reading).await? {
                println!("{}", serde_json::to_string_pretty(&reading)?);
            } else {
                println!(
                    "Reading already recorded for patient {patient} at {}.",
                    reading.measured_at.to_rfc3339()
                );
            }
        }
        Commands::Assess {
            patient,
            clinical,
            imaging,
            stiffness,
            performed_by,
        } => {
            let monitor = Monitor::new(&store, &settings, &calibration);
            let selection = InputSelection {
                clinical_score_id: clinical,
                imaging_prediction_id: imaging,
                stiffness_measurement_id: stiffness,
            };
            let evaluated = monitor
                .assess_patient(patient, Utc::now(), &selection, performed_by.as_deref())
                .await?;
            println!("{}", serde_json::to_string_pretty(&evaluated)?);
        }
        Commands::Monitor {
            dry_run,
            limit,
            deadline_secs,
            report_path,
            performed_by,
        } => {
            let monitor = Monitor::new(&store, &settings, &calibration);
            let options = RunOptions {
                dry_run,
                patient_limit: limit,
                deadline: deadline_secs.map(|secs| Instant::now() + Duration::from_secs(secs)),
                performed_by,
                ..RunOptions::at(Utc::now())
            };
            let batch = monitor.run_batch(&options).await?;

            println!(
                "{} assessed, {} skipped, {} failed, {} not due, {} deferred, {} alerts raised{}",
                batch.succeeded(),
                batch.skipped(),
                batch.failed(),
                batch.not_due,
                batch.deferred,
                batch.alerts_created(),
                if dry_run { " (dry run, nothing written)" } else { "" }
            );
            if let Some(out) = report_path {
                std::fs::write(&out, report::build_batch_report(&batch))
                    .with_context(|| format!("failed to write {}", out.display()))?;
                println!("Report written to {}.", out.display());
            }
        }
        Commands::History { patient } => {
            let history = store.assessment_history(patient).await?;
            if history.is_empty() {
                println!("No assessments recorded for this patient.");
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&history)?);
        }
        Commands::Alerts { patient, status } => {
            let alerts = store.alerts_for_patient(patient, status).await?;
            println!("{}", serde_json::to_string_pretty(&alerts)?);
        }
        Commands::SetAlertStatus {
            patient,
            alert,
            action,
        } => {
            let updated =
                alerts::apply_status_action(&store, patient, alert, action, Utc::now()).await?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }
        Commands::Explain { assessment } => {
            let row = store
                .get_assessment(assessment)
                .await?
                .with_context(|| format!("assessment {assessment} not found"))?;
            let record = store
                .explanation_for_assessment(assessment)
                .await?
                .with_context(|| format!("no explanation stored for assessment {assessment}"))?;
            let output = serde_json::json!({ "assessment": row, "explanation": record });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        Commands::Timeline { patient } => {
            let events = store.timeline_for_patient(patient).await?;
            if events.is_empty() {
                println!("No timeline events for this patient.");
                return Ok(());
            }
            println!("{}", serde_json::to_string_pretty(&events)?);
        }
        Commands::Report { patient, out } => {
            let history = store.assessment_history(patient).await?;
            let alerts = store.alerts_for_patient(patient, None).await?;
            let explanation = match history.last() {
                Some(latest) => store.explanation_for_assessment(latest.id).await?,
                None => None,
            };
            let text =
                report::build_patient_report(patient, &history, &alerts, explanation.as_ref());
            std::fs::write(&out, text)?;
            println!("Report written to {}.", out.display());
        }
    }

    Ok(())
}
