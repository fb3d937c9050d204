//! Runtime settings and the versioned calibration artifact.
//!
//! Both are loaded once at startup, validated eagerly and then passed by
//! reference. Nothing here is tunable per call.

use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{MonitorError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub monitoring: MonitoringSettings,
    #[serde(default)]
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitoringSettings {
    /// Master switch for the whole subsystem
    #[serde(default)]
    pub enabled: bool,

    /// Cadence between assessments of the same patient
    #[serde(default = "default_interval_weeks")]
    pub interval_weeks: u32,

    #[serde(default = "default_true")]
    pub stiffness_proxy_enabled: bool,

    /// How old a measured stiffness reading may be and still be used
    #[serde(default = "default_recency_days")]
    pub measured_recency_days: u32,

    /// Patients processed concurrently during a batch
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    #[serde(default = "default_trend_limit")]
    pub trend_limit: usize,

    #[serde(default = "default_top_k")]
    pub explain_top_k: usize,

    #[serde(default = "default_calibration_file")]
    pub calibration_file: PathBuf,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_weeks: default_interval_weeks(),
            stiffness_proxy_enabled: true,
            measured_recency_days: default_recency_days(),
            concurrency: default_concurrency(),
            trend_limit: default_trend_limit(),
            explain_top_k: default_top_k(),
            calibration_file: default_calibration_file(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertSettings {
    /// Minimum precision the selected thresholds must reach offline
    #[serde(default = "default_ppv_target")]
    pub ppv_target: f64,

    /// Minimum recall the selected thresholds must keep
    #[serde(default = "default_recall_floor")]
    pub recall_floor: f64,

    #[serde(default = "default_dedup_window_days")]
    pub dedup_window_days: u32,
}

impl Default for AlertSettings {
    fn default() -> Self {
        Self {
            ppv_target: default_ppv_target(),
            recall_floor: default_recall_floor(),
            dedup_window_days: default_dedup_window_days(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_weeks() -> u32 {
    12
}

fn default_recency_days() -> u32 {
    180
}

fn default_concurrency() -> usize {
    4
}

fn default_trend_limit() -> usize {
    12
}

fn default_top_k() -> usize {
    3
}

fn default_calibration_file() -> PathBuf {
    PathBuf::from("calibration/stage3-v1.toml")
}

fn default_ppv_target() -> f64 {
    0.85
}

fn default_recall_floor() -> f64 {
    0.70
}

fn default_dedup_window_days() -> u32 {
    90
}

/// Upper bound on batch fan-out; the pool holds one extra connection.
pub const MAX_CONCURRENCY: usize = 256;

impl Settings {
    /// Load settings from `path`, falling back to defaults when the file is absent.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            warn!(
                path = %path.display(),
                "settings file not found, using defaults (monitoring disabled)"
            );
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let settings = Self::from_toml_str(&content)?;
        info!(path = %path.display(), enabled = settings.monitoring.enabled, "loaded settings");
        Ok(settings)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let settings: Settings =
            toml::from_str(content).map_err(|e| MonitorError::Config(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.monitoring;
        if m.interval_weeks == 0 {
            return Err(MonitorError::Config("interval_weeks must be at least 1".into()));
        }
        if m.measured_recency_days == 0 {
            return Err(MonitorError::Config("measured_recency_days must be at least 1".into()));
        }
        if m.concurrency == 0 || m.trend_limit == 0 || m.explain_top_k == 0 {
            return Err(MonitorError::Config(
                "concurrency, trend_limit and explain_top_k must be at least 1".into(),
            ));
        }
        if m.concurrency > MAX_CONCURRENCY {
            return Err(MonitorError::Config(format!(
                "concurrency must be at most {MAX_CONCURRENCY}, got {}",
                m.concurrency
            )));
        }
        let a = &self.alerts;
        for (name, value) in [("ppv_target", a.ppv_target), ("recall_floor", a.recall_floor)] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(MonitorError::Config(format!("{name} must be in (0, 1], got {value}")));
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::weeks(i64::from(self.monitoring.interval_weeks))
    }

    pub fn measured_recency(&self) -> Duration {
        Duration::days(i64::from(self.monitoring.measured_recency_days))
    }

    /// Stiffness policy in effect, recorded on batch timeline events.
    pub fn monitoring_mode(&self) -> &'static str {
        if self.monitoring.stiffness_proxy_enabled {
            "measured_or_proxy"
        } else {
            "measured_only"
        }
    }

    /// Postgres pool size: one connection per concurrent unit plus one.
    pub fn pool_size(&self) -> u32 {
        u32::try_from(self.monitoring.concurrency)
            .unwrap_or(u32::MAX)
            .saturating_add(1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ComponentWeights {
    pub clinical: f64,
    pub imaging: f64,
    pub stiffness: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TierCutPoints {
    pub moderate: f64,
    pub high: f64,
    pub critical: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Breakpoint {
    pub kpa: f64,
    pub severity: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogisticCurve {
    pub slope: f64,
    pub midpoint: f64,
}

impl LogisticCurve {
    pub fn eval(&self, x: f64) -> f64 {
        1.0 / (1.0 + (-self.slope * (x - self.midpoint)).exp())
    }
}

/// Population sub-scores the local contributions are measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceBaseline {
    pub tag: String,
    pub clinical: f64,
    pub imaging: f64,
    pub stiffness: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScorerCalibration {
    pub version: String,
    pub imaging_stage_count: usize,
    pub weights: ComponentWeights,
    pub tiers: TierCutPoints,
    pub stiffness_breakpoints: Vec<Breakpoint>,
    pub progression: LogisticCurve,
    pub decompensation: LogisticCurve,
    pub reference: ReferenceBaseline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyCalibration {
    pub intercept_kpa: f64,
    pub clinical_kpa: f64,
    pub bmi_pivot: f64,
    pub bmi_kpa: f64,
    pub age_pivot: f64,
    pub age_kpa: f64,
    pub type2dm_kpa: f64,
    /// Expected kPa contribution per fibrosis stage, F0 first.
    pub stage_kpa: Vec<f64>,
    pub min_kpa: f64,
    pub max_kpa: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OperatingPoint {
    pub threshold: f64,
    pub ppv: f64,
    pub recall: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RapidProgressionRule {
    /// Score rise over the window that fires the rule
    pub delta: f64,
    /// Number of prior visits the rise is measured across
    pub window_visits: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AlertCalibrationFile {
    critical_margin: f64,
    rapid_progression: RapidProgressionRule,
    advanced_fibrosis: Vec<OperatingPoint>,
    high_decomp: Vec<OperatingPoint>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CalibrationFile {
    scorer: ScorerCalibration,
    proxy: ProxyCalibration,
    alerts: AlertCalibrationFile,
}

/// Alert thresholds selected from the offline operating points.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    pub advanced_fibrosis: f64,
    pub high_decomp: f64,
    pub rapid_progression: RapidProgressionRule,
    /// Excess over threshold at which severity becomes critical
    pub critical_margin: f64,
    pub dedup_window: Duration,
    pub ppv_target: f64,
    pub recall_floor: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Calibration {
    pub scorer: ScorerCalibration,
    pub proxy: ProxyCalibration,
    pub alerts: AlertThresholds,
}

impl Calibration {
    pub fn load(path: &Path, alert_settings: &AlertSettings) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            MonitorError::CalibrationMissing(format!("cannot read {}: {e}", path.display()))
        })?;
        let calibration = Self::from_toml_str(&content, alert_settings)?;
        info!(
            path = %path.display(),
            version = %calibration.scorer.version,
            advanced_fibrosis_threshold = calibration.alerts.advanced_fibrosis,
            high_decomp_threshold = calibration.alerts.high_decomp,
            "loaded calibration"
        );
        Ok(calibration)
    }

    pub fn from_toml_str(content: &str, alert_settings: &AlertSettings) -> Result<Self> {
        let file: CalibrationFile = toml::from_str(content)
            .map_err(|e| MonitorError::CalibrationMissing(e.to_string()))?;
        validate_scorer(&file.scorer)?;
        validate_proxy(&file.proxy, file.scorer.imaging_stage_count)?;

        let rules = &file.alerts;
        require(rules.critical_margin > 0.0, "alerts.critical_margin must be positive")?;
        require(
            rules.rapid_progression.delta > 0.0 && rules.rapid_progression.delta <= 1.0,
            "alerts.rapid_progression.delta must be in (0, 1]",
        )?;
        require(
            rules.rapid_progression.window_visits >= 1,
            "alerts.rapid_progression.window_visits must be at least 1",
        )?;

        let advanced_fibrosis = select_threshold(
            "advanced_fibrosis",
            &rules.advanced_fibrosis,
            alert_settings.ppv_target,
            alert_settings.recall_floor,
        )?;
        let high_decomp = select_threshold(
            "high_decomp",
            &rules.high_decomp,
            alert_settings.ppv_target,
            alert_settings.recall_floor,
        )?;

        Ok(Self {
            scorer: file.scorer,
            proxy: file.proxy,
            alerts: AlertThresholds {
                advanced_fibrosis,
                high_decomp,
                rapid_progression: rules.rapid_progression,
                critical_margin: rules.critical_margin,
                dedup_window: Duration::days(i64::from(alert_settings.dedup_window_days)),
                ppv_target: alert_settings.ppv_target,
                recall_floor: alert_settings.recall_floor,
            },
        })
    }
}

/// Lowest threshold meeting both the precision target and the recall floor.
pub fn select_threshold(
    rule: &str,
    points: &[OperatingPoint],
    ppv_target: f64,
    recall_floor: f64,
) -> Result<f64> {
    for point in points {
        let fields = [
            ("threshold", point.threshold),
            ("ppv", point.ppv),
            ("recall", point.recall),
        ];
        for (name, value) in fields {
            require(
                (0.0..=1.0).contains(&value),
                &format!("alerts.{rule} {name} {value} outside [0, 1]"),
            )?;
        }
    }
    points
        .iter()
        .filter(|point| point.ppv >= ppv_target && point.recall >= recall_floor)
        .map(|point| point.threshold)
        .min_by(|a, b| a.total_cmp(b))
        .ok_or_else(|| {
            MonitorError::CalibrationMissing(format!(
                "no {rule} operating point reaches ppv {ppv_target} with recall >= {recall_floor}"
            ))
        })
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(MonitorError::CalibrationMissing(message.to_string()))
    }
}

fn unit_interval(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

fn validate_scorer(scorer: &ScorerCalibration) -> Result<()> {
    require(!scorer.version.trim().is_empty(), "scorer.version is empty")?;
    require(scorer.imaging_stage_count >= 2, "scorer.imaging_stage_count must be at least 2")?;

    let w = scorer.weights;
    require(
        [w.clinical, w.imaging, w.stiffness].into_iter().all(unit_interval),
        "scorer.weights must each be in [0, 1]",
    )?;
    require(
        (w.clinical + w.imaging + w.stiffness - 1.0).abs() <= 1e-6,
        "scorer.weights must sum to 1",
    )?;

    let t = scorer.tiers;
    require(
        0.0 < t.moderate && t.moderate < t.high && t.high < t.critical && t.critical <= 1.0,
        "scorer.tiers must satisfy 0 < moderate < high < critical <= 1",
    )?;

    let points = &scorer.stiffness_breakpoints;
    require(points.len() >= 2, "scorer.stiffness_breakpoints needs at least two points")?;
    require(
        points.iter().all(|p| p.kpa > 0.0 && p.kpa.is_finite() && unit_interval(p.severity)),
        "scorer.stiffness_breakpoints must have kpa > 0 and severity in [0, 1]",
    )?;
    require(
        points
            .windows(2)
            .all(|pair| pair[0].kpa < pair[1].kpa && pair[0].severity <= pair[1].severity),
        "scorer.stiffness_breakpoints must be increasing",
    )?;

    let curves = [
        ("progression", scorer.progression),
        ("decompensation", scorer.decompensation),
    ];
    for (name, curve) in curves {
        require(
            curve.slope > 0.0 && curve.slope.is_finite() && curve.midpoint.is_finite(),
            &format!("scorer.{name} needs a positive finite slope"),
        )?;
    }

    let r = &scorer.reference;
    require(!r.tag.trim().is_empty(), "scorer.reference.tag is empty")?;
    require(
        [r.clinical, r.imaging, r.stiffness].into_iter().all(unit_interval),
        "scorer.reference sub-scores must be in [0, 1]",
    )
}

fn validate_proxy(proxy: &ProxyCalibration, stage_count: usize) -> Result<()> {
    require(
        proxy.min_kpa > 0.0 && proxy.max_kpa > proxy.min_kpa && proxy.max_kpa.is_finite(),
        "proxy clip range must satisfy 0 < min_kpa < max_kpa",
    )?;
    require(
        [
            proxy.intercept_kpa,
            proxy.clinical_kpa,
            proxy.bmi_kpa,
            proxy.age_kpa,
            proxy.type2dm_kpa,
        ]
        .into_iter()
        .all(|c| c.is_finite() && c >= 0.0),
        "proxy coefficients must be finite and non-negative",
    )?;
    require(
        proxy.bmi_pivot.is_finite() && proxy.age_pivot.is_finite(),
        "proxy pivots must be finite",
    )?;
    require(
        proxy.stage_kpa.len() == stage_count,
        "proxy.stage_kpa must have one entry per imaging stage",
    )?;
    require(
        proxy.stage_kpa.iter().all(|kpa| kpa.is_finite() && *kpa >= 0.0)
            && proxy.stage_kpa.windows(2).all(|pair| pair[0] <= pair[1]),
        "proxy.stage_kpa must be non-negative and non-decreasing",
    )
}


#[cfg(test)]
mod tests {
    use super::fixtures::{calibration, CALIBRATION_TOML};
    use super::*;

    #[test]
    fn shipped_calibration_selects_thresholds_for_default_targets() {
        let calibration = calibration();
        assert_eq!(calibration.scorer.version, "stage3-composite:v1");
        assert_eq!(calibration.alerts.advanced_fibrosis, 0.70);
        assert_eq!(calibration.alerts.high_decomp, 0.55);
        assert_eq!(calibration.alerts.dedup_window, Duration::days(90));
    }

    #[test]
    fn stricter_precision_target_moves_thresholds_up() {
        let settings = AlertSettings {
            ppv_target: 0.9,
            recall_floor: 0.6,
            dedup_window_days: 30,
        };
        let calibration = Calibration::from_toml_str(CALIBRATION_TOML, &settings).unwrap();
        assert_eq!(calibration.alerts.advanced_fibrosis, 0.78);
        assert_eq!(calibration.alerts.high_decomp, 0.68);
    }

    #[test]
    fn unreachable_targets_are_a_calibration_failure() {
        let settings = AlertSettings {
            ppv_target: 0.95,
            recall_floor: 0.9,
            dedup_window_days: 30,
        };
        let err = Calibration::from_toml_str(CALIBRATION_TOML, &settings).unwrap_err();
        assert!(matches!(err, MonitorError::CalibrationMissing(_)));
    }

    #[test]
    fn missing_sections_fail_fast() {
        let truncated = CALIBRATION_TOML.replace("[scorer.tiers]", "[scorer.unused]");
        let err = Calibration::from_toml_str(&truncated, &AlertSettings::default()).unwrap_err();
        assert!(matches!(err, MonitorError::CalibrationMissing(_)));

        let err = Calibration::load(Path::new("does/not/exist.toml"), &AlertSettings::default())
            .unwrap_err();
        assert!(matches!(err, MonitorError::CalibrationMissing(_)));
    }

    #[test]
    fn weights_must_sum_to_one() {
        let skewed = CALIBRATION_TOML.replace("clinical = 0.35", "clinical = 0.45");
        let err = Calibration::from_toml_str(&skewed, &AlertSettings::default()).unwrap_err();
        assert!(err.to_string().contains("sum to 1"));
    }

    #[test]
    fn tier_cut_points_must_be_ordered() {
        let inverted = CALIBRATION_TOML.replace("high = 0.62", "high = 0.90");
        assert!(Calibration::from_toml_str(&inverted, &AlertSettings::default()).is_err());
    }

    #[test]
    fn settings_defaults_keep_monitoring_off() {
        let settings = Settings::from_toml_str("").unwrap();
        assert!(!settings.monitoring.enabled);
        assert_eq!(settings.interval(), Duration::weeks(12));
        assert!(settings.monitoring.stiffness_proxy_enabled);
    }

    #[test]
    fn settings_reject_zero_interval() {
        let err = Settings::from_toml_str("[monitoring]\ninterval_weeks = 0\n").unwrap_err();
        assert!(matches!(err, MonitorError::Config(_)));
    }

    #[test]
    fn settings_bound_concurrency_and_pool_size() {
        let err = Settings::from_toml_str("[monitoring]\nconcurrency = 100000\n").unwrap_err();
        assert!(err.to_string().contains("at most 256"));

        let settings = Settings::from_toml_str("[monitoring]\nconcurrency = 256\n").unwrap();
        assert_eq!(settings.pool_size(), 257);

        let mut oversized = Settings::default();
        oversized.monitoring.concurrency = usize::MAX;
        assert_eq!(oversized.pool_size(), u32::MAX);
    }

    #[test]
    fn logistic_curve_is_centered_on_midpoint() {
        let curve = LogisticCurve { slope: 6.0, midpoint: 0.5 };
        assert!((curve.eval(0.5) - 0.5).abs() < 1e-12);
        assert!(curve.eval(0.2) < curve.eval(0.8));
    }
}
