//! Step-response analysis over a captured `(time, value)` series.

use serde::Serialize;
use thiserror::Error;

/// Fewer samples than this cannot be analyzed.
pub const MIN_STEP_SAMPLES: usize = 10;
/// `final_value` is the mean of this many trailing samples.
pub const FINAL_VALUE_WINDOW: usize = 20;

const RISE_BAND: f64 = 0.05;
const SETTLING_BAND: f64 = 0.02;

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum StepAnalysisError {
    #[error("insufficient data for analysis: {count} samples, need at least {MIN_STEP_SAMPLES}")]
    TooFewSamples { count: usize },
    #[error("step size {step} too small for analysis")]
    StepTooSmall { step: f64 },
    #[error("sample rate must be positive, got {rate_hz} Hz")]
    InvalidSampleRate { rate_hz: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepResponse {
    pub initial_value: f64,
    pub target_value: f64,
    pub final_value: f64,
    pub steady_state_error: f64,
    /// 10 % to 90 % of the commanded step, seconds.
    pub rise_time_s: Option<f64>,
    /// Time after which the series stays within 2 % of the step around
    /// `final_value`.
    pub settling_time_s: Option<f64>,
    pub overshoot: f64,
    pub overshoot_percent: f64,
    pub times: Vec<f64>,
    pub values: Vec<f64>,
}

pub fn analyze_step_response(
    times: &[f64],
    values: &[f64],
    initial_value: f64,
    target_value: f64,
) -> Result<StepResponse, StepAnalysisError> {
    let n = times.len().min(values.len());
    if n < MIN_STEP_SAMPLES {
        return Err(StepAnalysisError::TooFewSamples { count: n });
    }
    let (times, values) = (&times[..n], &values[..n]);

    let step = target_value - initial_value;
    if step.abs() < 1.0 {
        return Err(StepAnalysisError::StepTooSmall { step });
    }

    let tail = &values[n.saturating_sub(FINAL_VALUE_WINDOW)..];
    let final_value = tail.iter().sum::<f64>() / tail.len() as f64;
    let steady_state_error = (final_value - target_value).abs();

    let rise_tolerance = (step * RISE_BAND).abs();
    let first_near = |threshold: f64| {
        values
            .iter()
            .position(|v| (v - threshold).abs() < rise_tolerance)
    };
    let rise_time_s = match (
        first_near(initial_value + 0.1 * step),
        first_near(initial_value + 0.9 * step),
    ) {
        (Some(start), Some(end)) if end > start => Some(times[end] - times[start]),
        _ => None,
    };

    let settling_tolerance = (step * SETTLING_BAND).abs();
    let settling_time_s = match values
        .iter()
        .rposition(|v| (v - final_value).abs() > settling_tolerance)
    {
        None => Some(times[0]),
        Some(last_out) => times.get(last_out + 1).copied(),
    };

    let overshoot = if step > 0.0 {
        let peak = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        (peak - target_value).max(0.0)
    } else {
        let trough = values.iter().copied().fold(f64::INFINITY, f64::min);
        (target_value - trough).max(0.0)
    };
    let overshoot_percent = overshoot / step.abs() * 100.0;

    Ok(StepResponse {
        initial_value,
        target_value,
        final_value,
        steady_state_error,
        rise_time_s,
        settling_time_s,
        overshoot,
        overshoot_percent,
        times: times.to_vec(),
        values: values.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[f64], dt: f64) -> (Vec<f64>, Vec<f64>) {
        let times = (0..values.len()).map(|i| i as f64 * dt).collect();
        (times, values.to_vec())
    }

    #[test]
    fn ramp_then_hold_has_rise_and_settling() {
        // 0 -> 1000 in ten 100-RPM increments, then 30 samples at target.
        let mut values: Vec<f64> = (0..=10).map(|i| f64::from(i) * 100.0).collect();
        values.extend(std::iter::repeat(1000.0).take(30));
        let (times, values) = series(&values, 0.1);

        let result = analyze_step_response(&times, &values, 0.0, 1000.0).unwrap();
        assert_eq!(result.final_value, 1000.0);
        assert_eq!(result.steady_state_error, 0.0);
        // 100 RPM at t=0.1, 900 RPM at t=0.9.
        assert!((result.rise_time_s.unwrap() - 0.8).abs() < 1e-9);
        // Last sample off by more than 20 RPM is 900 at index 9.
        assert!((result.settling_time_s.unwrap() - 1.0).abs() < 1e-9);
        assert_eq!(result.overshoot, 0.0);
        assert_eq!(result.overshoot_percent, 0.0);
    }

    #[test]
    fn positive_overshoot_is_measured_above_target() {
        let mut values = vec![0.0, 500.0, 1000.0, 1150.0, 1050.0];
        values.extend(std::iter::repeat(1000.0).take(20));
        let (times, values) = series(&values, 0.05);

        let result = analyze_step_response(&times, &values, 0.0, 1000.0).unwrap();
        assert_eq!(result.overshoot, 150.0);
        assert!((result.overshoot_percent - 15.0).abs() < 1e-9);
    }

    #[test]
    fn negative_step_overshoot_is_measured_below_target() {
        let mut values = vec![1000.0, 900.0, 600.0, 190.0, 80.0, 120.0];
        values.extend(std::iter::repeat(100.0).take(20));
        let (times, values) = series(&values, 0.05);

        let result = analyze_step_response(&times, &values, 1000.0, 100.0).unwrap();
        assert!((result.overshoot - 20.0).abs() < 1e-9);
        assert!(result.rise_time_s.is_some());
    }

    #[test]
    fn series_already_settled_reports_first_sample() {
        let (times, values) = series(&[500.0; 15], 0.1);
        let result = analyze_step_response(&times, &values, 0.0, 500.0).unwrap();
        assert_eq!(result.settling_time_s, Some(0.0));
        // Never near the 10 % threshold.
        assert_eq!(result.rise_time_s, None);
    }

    #[test]
    fn final_sample_outside_band_means_never_settled() {
        let mut values = vec![1000.0; 14];
        values.push(0.0);
        let (times, values) = series(&values, 0.1);
        let result = analyze_step_response(&times, &values, 0.0, 1000.0).unwrap();
        assert_eq!(result.settling_time_s, None);
    }

    #[test]
    fn rejects_short_series_and_tiny_steps() {
        let (times, values) = series(&[1.0; 9], 0.1);
        assert_eq!(
            analyze_step_response(&times, &values, 0.0, 100.0),
            Err(StepAnalysisError::TooFewSamples { count: 9 })
        );

        let (times, values) = series(&[1.0; 12], 0.1);
        assert!(matches!(
            analyze_step_response(&times, &values, 100.0, 100.5),
            Err(StepAnalysisError::StepTooSmall { .. })
        ));
    }
}
