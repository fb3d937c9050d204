use crate::config::{Breakpoint, ScorerCalibration, TierCutPoints};
use crate::error::{MonitorError, Result};
use crate::models::RiskTier;

const SOFTMAX_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs<'a> {
    pub clinical_probability: f64,
    pub imaging_softmax: &'a [f64],
    pub stiffness_kpa: f64,
}

/// Normalized [0, 1] severity per input component.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SubScores {
    pub clinical: f64,
    pub imaging: f64,
    pub stiffness: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RiskScore {
    pub composite: f64,
    pub progression_12m: f64,
    pub decomp_12m: f64,
    pub tier: RiskTier,
    pub sub_scores: SubScores,
}

/// Composite risk for one assessment event. Pure: identical inputs under the
/// same calibration version always give identical output.
pub fn score(calibration: &ScorerCalibration, inputs: &ScoreInputs<'_>) -> Result<RiskScore> {
    let sub_scores = sub_scores(calibration, inputs)?;
    let weights = calibration.weights;

    let composite = round6(clamp_unit(
        weights.clinical * sub_scores.clinical
            + weights.imaging * sub_scores.imaging
            + weights.stiffness * sub_scores.stiffness,
    ));
    let progression_12m = round6(clamp_unit(calibration.progression.eval(composite)));
    let decomp_12m = round6(clamp_unit(calibration.decompensation.eval(composite)));

    Ok(RiskScore {
        composite,
        progression_12m,
        decomp_12m,
        tier: risk_tier(composite, &calibration.tiers),
        sub_scores,
    })
}

pub fn sub_scores(calibration: &ScorerCalibration, inputs: &ScoreInputs<'_>) -> Result<SubScores> {
    let clinical = inputs.clinical_probability;
    if !clinical.is_finite() || !(0.0..=1.0).contains(&clinical) {
        return Err(MonitorError::invalid_range("clinical_probability", clinical));
    }
    Ok(SubScores {
        clinical,
        imaging: imaging_severity_index(inputs.imaging_softmax, calibration.imaging_stage_count)?,
        stiffness: stiffness_severity_index(
            inputs.stiffness_kpa,
            &calibration.stiffness_breakpoints,
        )?,
    })
}

/// Expected stage ordinal under the softmax, scaled to [0, 1].
pub fn imaging_severity_index(softmax: &[f64], stage_count: usize) -> Result<f64> {
    validate_softmax(softmax, stage_count)?;
    let total: f64 = softmax.iter().sum();
    let expected: f64 = softmax
        .iter()
        .enumerate()
        .map(|(stage, p)| stage as f64 * p)
        .sum::<f64>()
        / total;
    Ok(clamp_unit(expected / (stage_count - 1) as f64))
}

pub fn validate_softmax(softmax: &[f64], stage_count: usize) -> Result<()> {
    if softmax.len() != stage_count {
        return Err(MonitorError::invalid_range(
            "imaging_softmax.len",
            softmax.len() as f64,
        ));
    }
    for (stage, p) in softmax.iter().enumerate() {
        if !p.is_finite() || !(0.0..=1.0).contains(p) {
            return Err(MonitorError::invalid_range(format!("imaging_softmax[{stage}]"), *p));
        }
    }
    let total: f64 = softmax.iter().sum();
    if (total - 1.0).abs() > SOFTMAX_TOLERANCE {
        return Err(MonitorError::invalid_range("imaging_softmax.sum", total));
    }
    Ok(())
}

/// Piecewise-linear kPa to severity, flat beyond the outer breakpoints.
pub fn stiffness_severity_index(kpa: f64, breakpoints: &[Breakpoint]) -> Result<f64> {
    if !kpa.is_finite() || kpa <= 0.0 {
        return Err(MonitorError::invalid_range("stiffness_kpa", kpa));
    }
    let (first, last) = match (breakpoints.first(), breakpoints.last()) {
        (Some(first), Some(last)) => (first, last),
        _ => {
            return Err(MonitorError::CalibrationMissing(
                "no stiffness breakpoints".to_string(),
            ))
        }
    };
    if kpa <= first.kpa {
        return Ok(first.severity);
    }
    if kpa >= last.kpa {
        return Ok(last.severity);
    }
    let severity = breakpoints
        .windows(2)
        .find(|pair| kpa <= pair[1].kpa)
        .map(|pair| {
            let (lo, hi) = (pair[0], pair[1]);
            let t = (kpa - lo.kpa) / (hi.kpa - lo.kpa);
            lo.severity + t * (hi.severity - lo.severity)
        })
        .unwrap_or(last.severity);
    Ok(clamp_unit(severity))
}

/// Lower cut points are inclusive: a score exactly at `high` is HIGH.
pub fn risk_tier(score: f64, tiers: &TierCutPoints) -> RiskTier {
    if score >= tiers.critical {
        RiskTier::Critical
    } else if score >= tiers.high {
        RiskTier::High
    } else if score >= tiers.moderate {
        RiskTier::Moderate
    } else {
        RiskTier::Low
    }
}

pub fn clamp_unit(value: f64) -> f64 {
    value.clamp(0.0, 1.0)
}

pub fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}
