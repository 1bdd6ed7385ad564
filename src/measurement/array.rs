//! Setpoint array generation.
//!
//! Sweeps step through precomputed arrays rather than computing setpoints on
//! the fly, so the full trajectory can be validated (and recorded) up front.
//! [`lin_array`] builds linear arrays either from a point count or from a
//! target step size; [`rf_array`] builds arrays of RF generator powers from
//! excitation voltages at the sample.

use tracing::warn;

use crate::error::{MesoError, MesoResult};

/// Absolute tolerance for step-count arithmetic.
///
/// `floor((stop - start) / step)` is exact only in theory; the tolerance
/// absorbs representation error so a nominally integer division does not lose
/// its last point.
const STEP_TOL: f64 = 1e-10;

/// How a linear array is spaced: by total point count or by step size.
///
/// Exactly one of the two is given; the other is derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Spacing {
    /// Total number of points, endpoints included.
    Points(usize),
    /// Target step magnitude (sign is taken from the sweep direction).
    Step(f64),
}

/// Generate a linear setpoint array from `start` to `stop` inclusive.
///
/// With [`Spacing::Step`], the point count is the largest that fits the
/// interval; when the resulting effective step deviates from the requested
/// one by more than 5% a warning is logged with the effective value. A step
/// longer than the interval yields a single point at `start`.
pub fn lin_array(start: f64, stop: f64, spacing: Spacing) -> MesoResult<Vec<f64>> {
    if !start.is_finite() || !stop.is_finite() {
        return Err(MesoError::Array(format!(
            "endpoints must be finite, got start={start}, stop={stop}"
        )));
    }

    let num = match spacing {
        Spacing::Points(0) => {
            return Err(MesoError::Array("point count must be at least 1".to_string()))
        }
        Spacing::Points(1) => {
            if start != stop {
                return Err(MesoError::Array(
                    "a single-point array needs start == stop".to_string(),
                ));
            }
            return Ok(vec![start]);
        }
        Spacing::Points(n) => n,
        Spacing::Step(step) => {
            if !(step.is_finite() && step > 0.0) {
                return Err(MesoError::Array(format!(
                    "step must be positive and finite, got {step}"
                )));
            }
            let span = (stop - start).abs();
            if span < STEP_TOL {
                return Ok(vec![start]);
            }
            let n = (span / step + STEP_TOL).floor() as usize + 1;
            if n == 1 {
                // Step larger than the interval: one point, at the start.
                return Ok(vec![start]);
            }
            let effective = span / (n - 1) as f64;
            if ((effective - step) / step).abs() > 0.05 {
                warn!(
                    requested = step,
                    effective,
                    "step does not divide the interval; using effective step"
                );
            }
            n
        }
    };

    let step = (stop - start) / (num - 1) as f64;
    let mut points = Vec::with_capacity(num);
    for i in 0..num {
        points.push(start + step * i as f64);
    }
    // Pin the endpoint exactly.
    points[num - 1] = stop;
    Ok(points)
}

/// RF excitation voltage at the sample to generator output power in dBm,
/// assuming a 50 Ohm line with `attenuation_db` of attenuation in between.
pub fn vrf_to_dbm(v: f64, attenuation_db: f64) -> f64 {
    20.0 * v.log10() + 13.0 + attenuation_db
}

/// Inverse of [`vrf_to_dbm`].
pub fn dbm_to_vrf(power_dbm: f64, attenuation_db: f64) -> f64 {
    10f64.powf((power_dbm - 13.0 - attenuation_db) / 20.0)
}

/// Generate an array of generator powers (dBm) that is linear in excitation
/// voltage at the sample.
///
/// Warns when the endpoints fall outside the generator's usable range
/// (-30 dBm to +25 dBm).
pub fn rf_array(
    start_v: f64,
    stop_v: f64,
    spacing: Spacing,
    attenuation_db: f64,
) -> MesoResult<Vec<f64>> {
    if start_v <= 0.0 || stop_v <= 0.0 {
        return Err(MesoError::Array(format!(
            "RF voltages must be positive, got start={start_v}, stop={stop_v}"
        )));
    }
    let powers: Vec<f64> = lin_array(start_v, stop_v, spacing)?
        .into_iter()
        .map(|v| vrf_to_dbm(v, attenuation_db))
        .collect();

    if let Some(&first) = powers.first() {
        if first < -30.0 {
            warn!(power_dbm = first, "start power below -30 dBm generator floor");
        }
    }
    if let Some(&last) = powers.last() {
        if last > 25.0 {
            warn!(power_dbm = last, "stop power above +25 dBm generator ceiling");
        }
    }
    Ok(powers)
}

/// Whether the array is strictly increasing or strictly decreasing.
pub fn is_monotonic(points: &[f64]) -> bool {
    if points.len() < 2 {
        return true;
    }
    points.windows(2).all(|w| w[1] > w[0]) || points.windows(2).all(|w| w[1] < w[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lin_array_by_points() {
        let a = lin_array(0.0, 1.0, Spacing::Points(5)).unwrap();
        assert_eq!(a, vec![0.0, 0.25, 0.5, 0.75, 1.0]);
    }

    #[test]
    fn test_lin_array_by_step() {
        let a = lin_array(0.0, 1.0, Spacing::Step(0.25)).unwrap();
        assert_eq!(a.len(), 5);
        assert_eq!(*a.last().unwrap(), 1.0);
    }

    #[test]
    fn test_lin_array_by_step_descending() {
        let a = lin_array(1.0, -1.0, Spacing::Step(0.5)).unwrap();
        assert_eq!(a, vec![1.0, 0.5, 0.0, -0.5, -1.0]);
    }

    #[test]
    fn test_step_tolerance_keeps_last_point() {
        // 0.1 does not divide 1.0 exactly in binary; the tolerance must keep
        // all 11 points.
        let a = lin_array(0.0, 1.0, Spacing::Step(0.1)).unwrap();
        assert_eq!(a.len(), 11);
        assert_eq!(*a.last().unwrap(), 1.0);
    }

    #[test]
    fn test_step_larger_than_span_keeps_start() {
        assert_eq!(lin_array(0.0, 1.0, Spacing::Step(2.5)).unwrap(), vec![0.0]);
        assert_eq!(
            lin_array(1.0, -1.0, Spacing::Step(10.0)).unwrap(),
            vec![1.0]
        );
    }

    #[test]
    fn test_invalid_inputs() {
        assert!(lin_array(0.0, 1.0, Spacing::Points(0)).is_err());
        assert!(lin_array(0.0, 1.0, Spacing::Step(0.0)).is_err());
        assert!(lin_array(0.0, 1.0, Spacing::Step(-0.1)).is_err());
        assert!(lin_array(f64::NAN, 1.0, Spacing::Points(3)).is_err());
        assert!(lin_array(0.0, 1.0, Spacing::Points(1)).is_err());
        assert_eq!(lin_array(2.0, 2.0, Spacing::Points(1)).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_rf_conversion_round_trip() {
        let p = vrf_to_dbm(1e-3, 20.0);
        assert!((dbm_to_vrf(p, 20.0) - 1e-3).abs() < 1e-15);
        // 1 V with no attenuation lands at +13 dBm.
        assert!((vrf_to_dbm(1.0, 0.0) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn test_rf_array_linear_in_voltage() {
        let a = rf_array(1e-4, 1e-3, Spacing::Points(10), 40.0).unwrap();
        assert_eq!(a.len(), 10);
        assert!((a[0] - vrf_to_dbm(1e-4, 40.0)).abs() < 1e-12);
        assert!((a[9] - vrf_to_dbm(1e-3, 40.0)).abs() < 1e-12);
        assert!(rf_array(0.0, 1.0, Spacing::Points(3), 0.0).is_err());
    }

    #[test]
    fn test_is_monotonic() {
        assert!(is_monotonic(&[0.0, 0.5, 1.0]));
        assert!(is_monotonic(&[1.0, 0.5, 0.0]));
        assert!(is_monotonic(&[42.0]));
        assert!(is_monotonic(&[]));
        assert!(!is_monotonic(&[0.0, 1.0, 0.5]));
        assert!(!is_monotonic(&[0.0, 0.0, 1.0]));
    }
}
