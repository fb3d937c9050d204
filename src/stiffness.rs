//! Chooses the liver-stiffness reading an assessment is scored with: a recent
//! measured reading when one exists, otherwise a proxy estimate.

use chrono::{DateTime, Duration, Utc};
use tracing::debug;
use uuid::Uuid;

use crate::config::ProxyCalibration;
use crate::error::{MonitorError, Result};
use crate::models::{ClinicalScore, ImagingPrediction, StiffnessMeasurement, StiffnessSource};

#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedStiffness {
    /// Reading already on record, used unchanged.
    Existing(StiffnessMeasurement),
    /// Newly synthesized proxy; must be persisted with the assessment.
    Proxy(StiffnessMeasurement),
}

impl ResolvedStiffness {
    pub fn measurement(&self) -> &StiffnessMeasurement {
        match self {
            ResolvedStiffness::Existing(m) | ResolvedStiffness::Proxy(m) => m,
        }
    }

    pub fn into_new_proxy(self) -> Option<StiffnessMeasurement> {
        match self {
            ResolvedStiffness::Proxy(m) => Some(m),
            ResolvedStiffness::Existing(_) => None,
        }
    }
}

pub struct StiffnessResolver<'a> {
    proxy: &'a ProxyCalibration,
    recency: Duration,
    proxy_enabled: bool,
}

impl<'a> StiffnessResolver<'a> {
    pub fn new(proxy: &'a ProxyCalibration, recency: Duration, proxy_enabled: bool) -> Self {
        Self {
            proxy,
            recency,
            proxy_enabled,
        }
    }

    pub fn resolve(
        &self,
        patient_id: Uuid,
        clinical: &ClinicalScore,
        imaging: &ImagingPrediction,
        latest_measured: Option<&StiffnessMeasurement>,
        now: DateTime<Utc>,
    ) -> Result<ResolvedStiffness> {
        let recent = latest_measured.filter(|m| {
            m.source == StiffnessSource::Measured && m.measured_at >= now - self.recency
        });
        if let Some(measured) = recent {
            return Ok(ResolvedStiffness::Existing(measured.clone()));
        }

        if !self.proxy_enabled {
            return Err(MonitorError::MissingStiffnessSignal { patient_id });
        }

        let kpa = estimate_proxy_kpa(self.proxy, clinical, imaging)?;
        debug!(patient_id = %patient_id, kpa, "synthesized proxy stiffness");
        let measurement =
            StiffnessMeasurement::new(patient_id, kpa, None, StiffnessSource::Proxy, now)?;
        Ok(ResolvedStiffness::Proxy(measurement))
    }
}

/// Bounded proxy estimate, non-decreasing in every severity signal.
pub fn estimate_proxy_kpa(
    proxy: &ProxyCalibration,
    clinical: &ClinicalScore,
    imaging: &ImagingPrediction,
) -> Result<f64> {
    let probability = clinical.probability;
    if !probability.is_finite() || !(0.0..=1.0).contains(&probability) {
        return Err(MonitorError::invalid_range("clinical_probability", probability));
    }
    if !clinical.bmi.is_finite() || clinical.bmi <= 0.0 {
        return Err(MonitorError::invalid_range("bmi", clinical.bmi));
    }
    if clinical.age < 0 {
        return Err(MonitorError::invalid_range("age", f64::from(clinical.age)));
    }
    crate::risk::validate_softmax(&imaging.softmax_vector, proxy.stage_kpa.len())?;

    let stage_kpa: f64 = imaging
        .softmax_vector
        .iter()
        .zip(proxy.stage_kpa.iter())
        .map(|(p, kpa)| p * kpa)
        .sum();

    let raw = proxy.intercept_kpa
        + proxy.clinical_kpa * probability
        + proxy.bmi_kpa * (clinical.bmi - proxy.bmi_pivot).max(0.0)
        + proxy.age_kpa * (f64::from(clinical.age) - proxy.age_pivot).max(0.0)
        + if clinical.type2dm { proxy.type2dm_kpa } else { 0.0 }
        + stage_kpa;

    let clipped = raw.clamp(proxy.min_kpa, proxy.max_kpa);
    Ok((clipped * 1000.0).round() / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::calibration;

    fn clinical(
        patient_id: Uuid,
        probability: f64,
        bmi: f64,
        age: i32,
        type2dm: bool,
    ) -> ClinicalScore {
        ClinicalScore {
            id: Uuid::new_v4(),
            patient_id,
            probability,
            risk_tier: "MODERATE".to_string(),
            model_version: "stage1:v3".to_string(),
            age,
            bmi,
            type2dm,
            created_at: Utc::now(),
        }
    }

    fn imaging(patient_id: Uuid, softmax: Vec<f64>) -> ImagingPrediction {
        ImagingPrediction {
            id: Uuid::new_v4(),
            patient_id,
            softmax_vector: softmax,
            top1_stage: "F2".to_string(),
            confidence_flag: "NORMAL".to_string(),
            model_version: "stage2:v5".to_string(),
            created_at: Utc::now(),
        }
    }

    fn one_hot(stage: usize) -> Vec<f64> {
        let mut v = vec![0.0; 5];
        v[stage] = 1.0;
        v
    }

    #[test]
    fn recent_measured_reading_is_used_unchanged() {
        let calibration = calibration();
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let measured = StiffnessMeasurement::new(
            patient_id,
            11.2,
            Some(280.0),
            StiffnessSource::Measured,
            now - Duration::days(20),
        )
        .unwrap();
        let resolver = StiffnessResolver::new(&calibration.proxy, Duration::days(180), true);

        let resolved = resolver
            .resolve(
                patient_id,
                &clinical(patient_id, 0.4, 29.0, 55, false),
                &imaging(patient_id, one_hot(2)),
                Some(&measured),
                now,
            )
            .unwrap();
        assert_eq!(resolved, ResolvedStiffness::Existing(measured));
        assert!(resolved.into_new_proxy().is_none());
    }

    #[test]
    fn stale_reading_falls_back_to_proxy() {
        let calibration = calibration();
        let patient_id = Uuid::new_v4();
        let now = Utc::now();
        let stale = StiffnessMeasurement::new(
            patient_id,
            11.2,
            None,
            StiffnessSource::Measured,
            now - Duration::days(400),
        )
        .unwrap();
        let resolver = StiffnessResolver::new(&calibration.proxy, Duration::days(180), true);

        let resolved = resolver
            .resolve(
                patient_id,
                &clinical(patient_id, 0.4, 29.0, 55, false),
                &imaging(patient_id, one_hot(2)),
                Some(&stale),
                now,
            )
            .unwrap();
        let proxy = resolved.measurement();
        assert_eq!(proxy.source, StiffnessSource::Proxy);
        assert_eq!(proxy.patient_id, patient_id);
        assert_eq!(proxy.measured_at, now);
        assert!(proxy.kpa > 0.0);
    }

    #[test]
    fn disabled_proxy_without_reading_is_missing_signal() {
        let calibration = calibration();
        let patient_id = Uuid::new_v4();
        let resolver = StiffnessResolver::new(&calibration.proxy, Duration::days(180), false);

        let err = resolver
            .resolve(
                patient_id,
                &clinical(patient_id, 0.4, 29.0, 55, false),
                &imaging(patient_id, one_hot(1)),
                None,
                Utc::now(),
            )
            .unwrap_err();
        assert!(matches!(err, MonitorError::MissingStiffnessSignal { .. }));
    }

    #[test]
    fn proxy_stays_within_plausible_range_for_extreme_inputs() {
        let proxy = calibration().proxy;
        let patient_id = Uuid::new_v4();
        for probability in [0.0, 0.5, 1.0] {
            for bmi in [0.1, 12.0, 45.0, 900.0, 1.0e9] {
                for age in [0, 18, 90, 130, i32::MAX] {
                    for type2dm in [false, true] {
                        for stage in 0..5 {
                            let kpa = estimate_proxy_kpa(
                                &proxy,
                                &clinical(patient_id, probability, bmi, age, type2dm),
                                &imaging(patient_id, one_hot(stage)),
                            )
                            .unwrap();
                            assert!((2.0..=75.0).contains(&kpa), "{kpa} kPa out of range");
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn proxy_rises_with_severity_signals() {
        let proxy = calibration().proxy;
        let patient_id = Uuid::new_v4();
        let base = estimate_proxy_kpa(
            &proxy,
            &clinical(patient_id, 0.2, 24.0, 35, false),
            &imaging(patient_id, one_hot(0)),
        )
        .unwrap();
        let sicker = estimate_proxy_kpa(
            &proxy,
            &clinical(patient_id, 0.8, 34.0, 65, true),
            &imaging(patient_id, one_hot(3)),
        )
        .unwrap();
        assert!(sicker > base);
    }

    #[test]
    fn proxy_rejects_nonsense_inputs() {
        let proxy = calibration().proxy;
        let patient_id = Uuid::new_v4();
        let err = estimate_proxy_kpa(
            &proxy,
            &clinical(patient_id, 0.4, -3.0, 50, false),
            &imaging(patient_id, one_hot(1)),
        )
        .unwrap_err();
        assert!(matches!(err, MonitorError::InvalidSignalRange { .. }));
    }
}
