//! Interpolation kernels used for cross-channel resampling and VDS
//! reconstruction: linear, modified Akima (makima), natural cubic spline,
//! and binterpolation (bucketed downsampling with a centre estimator).
//!
//! The hybrid modes follow the library's resampling policy: splines only
//! upsample — the downsample path is linear, since splines overshoot on
//! aliased input. The cubic spline itself comes from `csaps` evaluated as
//! an interpolant (smooth = 1.0).

use csaps::CubicSmoothingSpline;
use med_core::error::{MedError, Result};
use ndarray::Array1;

/// Upsample with makima only when `out_fs / in_fs` reaches this ratio.
pub const MAKIMA_UPSAMPLE_RATIO: f64 = 1.5;
/// Upsample with spline only when `out_fs / in_fs` reaches this ratio.
pub const SPLINE_UPSAMPLE_RATIO: f64 = 3.0;

/// Centre estimator for binterpolation buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BinCenterMode {
    /// The sample at the bucket's middle index.
    #[default]
    Midpoint,
    Mean,
    Median,
    /// The bucket's first sample; cheapest.
    Fastest,
}

/// Resampling mode for the data-matrix engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum InterpMode {
    #[default]
    Linear,
    Makima,
    Spline,
    /// Makima when upsampling by ≥ 1.5, linear otherwise.
    UpMakimaDownLinear,
    /// Spline when upsampling by ≥ 3.0, linear otherwise.
    UpSplineDownLinear,
    Binterp(BinCenterMode),
}

/// Linear interpolation at arbitrary query points. `x` must be strictly
/// increasing; queries outside the span clamp to the end values.
pub fn linear_at(x: &[f64], y: &[f64], xi: &[f64]) -> Vec<f64> {
    debug_assert_eq!(x.len(), y.len());
    if y.is_empty() {
        return vec![0.0; xi.len()];
    }
    if y.len() == 1 {
        return vec![y[0]; xi.len()];
    }
    xi.iter()
        .map(|&q| {
            if q <= x[0] {
                return y[0];
            }
            if q >= x[x.len() - 1] {
                return y[y.len() - 1];
            }
            let j = x.partition_point(|&v| v <= q) - 1;
            let t = (q - x[j]) / (x[j + 1] - x[j]);
            y[j] + t * (y[j + 1] - y[j])
        })
        .collect()
}

/// Resample a uniform series to `n_out` points across the same span.
pub fn linear(y: &[f64], n_out: usize) -> Vec<f64> {
    uniform_resample(y, n_out, |x, y, xi| linear_at(x, y, xi))
}

/// Modified Akima interpolation at arbitrary query points.
pub fn makima_at(x: &[f64], y: &[f64], xi: &[f64]) -> Vec<f64> {
    let n = y.len();
    if n < 3 {
        return linear_at(x, y, xi);
    }

    // Segment slopes with two quadratically extrapolated ghosts on each
    // side, as Akima's construction requires.
    let mut delta = Vec::with_capacity(n + 3);
    delta.push(0.0); // placeholder for d[-2]
    delta.push(0.0); // placeholder for d[-1]
    for i in 0..n - 1 {
        delta.push((y[i + 1] - y[i]) / (x[i + 1] - x[i]));
    }
    delta[1] = 2.0 * delta[2] - delta[3];
    delta[0] = 2.0 * delta[1] - delta[2];
    let m = delta.len();
    delta.push(2.0 * delta[m - 1] - delta[m - 2]);
    let m = delta.len();
    delta.push(2.0 * delta[m - 1] - delta[m - 2]);

    // Knot derivatives with the makima weighting, which damps the
    // flat-spot artifacts of classic Akima.
    let mut slope = Vec::with_capacity(n);
    for i in 0..n {
        // delta[i + 2] is the segment to the right of knot i.
        let dm2 = delta[i];
        let dm1 = delta[i + 1];
        let d0 = delta[i + 2];
        let d1 = delta[i + 3];
        let w1 = (d1 - d0).abs() + (d1 + d0).abs() / 2.0;
        let w2 = (dm1 - dm2).abs() + (dm1 + dm2).abs() / 2.0;
        if w1 + w2 == 0.0 {
            slope.push((dm1 + d0) / 2.0);
        } else {
            slope.push((w1 * dm1 + w2 * d0) / (w1 + w2));
        }
    }

    // Cubic Hermite evaluation.
    xi.iter()
        .map(|&q| {
            if q <= x[0] {
                return y[0];
            }
            if q >= x[n - 1] {
                return y[n - 1];
            }
            let j = x.partition_point(|&v| v <= q) - 1;
            let h = x[j + 1] - x[j];
            let t = (q - x[j]) / h;
            let t2 = t * t;
            let t3 = t2 * t;
            let h00 = 2.0 * t3 - 3.0 * t2 + 1.0;
            let h10 = t3 - 2.0 * t2 + t;
            let h01 = -2.0 * t3 + 3.0 * t2;
            let h11 = t3 - t2;
            h00 * y[j] + h10 * h * slope[j] + h01 * y[j + 1] + h11 * h * slope[j + 1]
        })
        .collect()
}

/// Resample a uniform series with makima.
pub fn makima(y: &[f64], n_out: usize) -> Vec<f64> {
    uniform_resample(y, n_out, |x, y, xi| makima_at(x, y, xi))
}

/// Natural cubic-spline interpolation at arbitrary query points, via the
/// smoothing-spline machinery evaluated as an interpolant.
pub fn spline_at(x: &[f64], y: &[f64], xi: &[f64]) -> Result<Vec<f64>> {
    if y.len() < 3 {
        return Ok(linear_at(x, y, xi));
    }
    let x_array = Array1::from(x.to_vec());
    let y_array = Array1::from(y.to_vec());
    let spline = CubicSmoothingSpline::new(&x_array, &y_array)
        .with_smooth(1.0)
        .make()
        .map_err(|e| MedError::decode(format!("spline fit failed: {e:?}")))?;
    let xi_array = Array1::from(xi.to_vec());
    let out = spline
        .evaluate(&xi_array)
        .map_err(|e| MedError::decode(format!("spline evaluation failed: {e:?}")))?;
    Ok(out.to_vec())
}

/// Resample a uniform series with a cubic spline.
pub fn spline(y: &[f64], n_out: usize) -> Result<Vec<f64>> {
    if y.len() < 3 || n_out < 2 {
        return Ok(linear(y, n_out));
    }
    let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
    let step = (y.len() - 1) as f64 / (n_out - 1) as f64;
    let xi: Vec<f64> = (0..n_out).map(|i| i as f64 * step).collect();
    spline_at(&x, y, &xi)
}

fn uniform_resample(
    y: &[f64],
    n_out: usize,
    kernel: impl Fn(&[f64], &[f64], &[f64]) -> Vec<f64>,
) -> Vec<f64> {
    if y.is_empty() || n_out == 0 {
        return vec![0.0; n_out];
    }
    if y.len() == 1 || n_out == 1 {
        return vec![y[0]; n_out];
    }
    let x: Vec<f64> = (0..y.len()).map(|i| i as f64).collect();
    let step = (y.len() - 1) as f64 / (n_out - 1) as f64;
    let xi: Vec<f64> = (0..n_out).map(|i| i as f64 * step).collect();
    kernel(&x, y, &xi)
}

/// Bucketed downsampling: each output sample summarizes its bucket of
/// input samples with the centre estimator, and the per-bucket minima and
/// maxima are returned for trace-range output.
pub fn binterpolate(
    y: &[f64],
    n_out: usize,
    mode: BinCenterMode,
) -> (Vec<f64>, Vec<f64>, Vec<f64>) {
    if y.is_empty() || n_out == 0 {
        return (vec![0.0; n_out], vec![0.0; n_out], vec![0.0; n_out]);
    }
    let mut out = Vec::with_capacity(n_out);
    let mut minima = Vec::with_capacity(n_out);
    let mut maxima = Vec::with_capacity(n_out);
    let ratio = y.len() as f64 / n_out as f64;
    let mut scratch = Vec::new();
    for j in 0..n_out {
        let lo = (j as f64 * ratio) as usize;
        let hi = (((j + 1) as f64 * ratio) as usize).clamp(lo + 1, y.len());
        let bucket = &y[lo..hi];
        let min = bucket.iter().copied().fold(f64::INFINITY, f64::min);
        let max = bucket.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let center = match mode {
            BinCenterMode::Midpoint => bucket[bucket.len() / 2],
            BinCenterMode::Mean => bucket.iter().sum::<f64>() / bucket.len() as f64,
            BinCenterMode::Median => {
                scratch.clear();
                scratch.extend_from_slice(bucket);
                scratch.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
                if scratch.len() % 2 == 0 {
                    (scratch[scratch.len() / 2 - 1] + scratch[scratch.len() / 2]) / 2.0
                } else {
                    scratch[scratch.len() / 2]
                }
            }
            BinCenterMode::Fastest => bucket[0],
        };
        out.push(center);
        minima.push(min);
        maxima.push(max);
    }
    (out, minima, maxima)
}

/// Resample per the engine's mode dispatch. The sampling-frequency ratio
/// decides the path for the hybrid modes.
pub fn interpolate(y: &[f64], n_out: usize, mode: InterpMode) -> Result<Vec<f64>> {
    let ratio = if y.is_empty() {
        1.0
    } else {
        n_out as f64 / y.len() as f64
    };
    Ok(match mode {
        InterpMode::Linear => linear(y, n_out),
        InterpMode::Makima => makima(y, n_out),
        InterpMode::Spline => spline(y, n_out)?,
        InterpMode::UpMakimaDownLinear => {
            if ratio >= MAKIMA_UPSAMPLE_RATIO {
                makima(y, n_out)
            } else {
                linear(y, n_out)
            }
        }
        InterpMode::UpSplineDownLinear => {
            if ratio >= SPLINE_UPSAMPLE_RATIO {
                spline(y, n_out)?
            } else {
                linear(y, n_out)
            }
        }
        InterpMode::Binterp(center) => binterpolate(y, n_out, center).0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn linear_hits_knots() {
        let y = vec![0.0, 10.0, 20.0, 30.0];
        let out = linear(&y, 7);
        assert_eq!(out.len(), 7);
        assert_relative_eq!(out[0], 0.0);
        assert_relative_eq!(out[2], 10.0);
        assert_relative_eq!(out[6], 30.0);
        assert_relative_eq!(out[1], 5.0);
    }

    #[test]
    fn makima_reproduces_lines_exactly() {
        let y: Vec<f64> = (0..20).map(|i| 3.0 * i as f64 + 1.0).collect();
        let out = makima(&y, 53);
        for (i, v) in out.iter().enumerate() {
            let expected = 1.0 + 3.0 * (i as f64 * 19.0 / 52.0);
            assert_relative_eq!(*v, expected, epsilon = 1e-9);
        }
    }

    #[test]
    fn makima_interpolates_knots() {
        let y = vec![0.0, 1.0, 4.0, 2.0, -3.0, 0.5, 8.0];
        let out = makima(&y, 2 * y.len() - 1);
        for (i, &knot) in y.iter().enumerate() {
            assert_relative_eq!(out[2 * i], knot, epsilon = 1e-9);
        }
    }

    #[test]
    fn spline_interpolates_knots() {
        let y = vec![0.0, 2.0, -1.0, 5.0, 3.0, 3.5];
        let out = spline(&y, 2 * y.len() - 1).unwrap();
        for (i, &knot) in y.iter().enumerate() {
            assert_relative_eq!(out[2 * i], knot, epsilon = 1e-6);
        }
    }

    #[test]
    fn binterpolate_means_and_ranges() {
        let y: Vec<f64> = (0..100).map(|i| i as f64).collect();
        let (out, minima, maxima) = binterpolate(&y, 10, BinCenterMode::Mean);
        assert_eq!(out.len(), 10);
        assert_relative_eq!(out[0], 4.5);
        assert_relative_eq!(minima[0], 0.0);
        assert_relative_eq!(maxima[0], 9.0);
        assert_relative_eq!(minima[9], 90.0);
        assert_relative_eq!(maxima[9], 99.0);
    }

    #[test]
    fn binterpolate_median_is_robust_to_spikes() {
        let mut y = vec![1.0; 40];
        y[7] = 1000.0;
        let (out, _, maxima) = binterpolate(&y, 4, BinCenterMode::Median);
        assert_relative_eq!(out[0], 1.0);
        assert_relative_eq!(maxima[0], 1000.0);
    }

    #[test]
    fn hybrid_modes_follow_the_ratio_rule() {
        let y: Vec<f64> = (0..100).map(|i| (i as f64 * 0.3).sin()).collect();
        // Downsampling through a hybrid equals plain linear.
        let hybrid = interpolate(&y, 40, InterpMode::UpSplineDownLinear).unwrap();
        let lin = linear(&y, 40);
        assert_eq!(hybrid, lin);
        // Strong upsampling through the makima hybrid equals makima.
        let hybrid = interpolate(&y, 200, InterpMode::UpMakimaDownLinear).unwrap();
        let mak = makima(&y, 200);
        assert_eq!(hybrid, mak);
    }

    #[test]
    fn degenerate_inputs() {
        assert_eq!(linear(&[], 4), vec![0.0; 4]);
        assert_eq!(linear(&[7.0], 3), vec![7.0; 3]);
        assert_eq!(makima(&[1.0, 2.0], 5).len(), 5);
        assert_eq!(spline(&[1.0, 2.0], 5).unwrap().len(), 5);
    }
}
