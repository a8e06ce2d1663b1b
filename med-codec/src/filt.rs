//! Filter kernels: Butterworth forward-backward filtering plus the
//! streaming moving-average and quantile filters.
//!
//! Filters are designed by bilinear transform from the analog prototype,
//! up to order 10. `filtfilt` pads with 3 samples per pole of odd
//! reflection on each side and seeds both passes with initial conditions
//! that null the startup transient, so a constant input passes through
//! bit-for-bit unchanged.

use med_core::error::{MedError, Result};
use tracing::warn;

pub const FILTER_ORDER_DEFAULT: usize = 5;
pub const FILTER_MAX_ORDER: usize = 10;
pub const PAD_SAMPLES_PER_POLE: usize = 3;
/// Antialias filters place their cutoff at `input_fs / 3.5`.
pub const ANTIALIAS_FREQ_DIVISOR: f64 = 3.5;

// Minimal complex arithmetic for the design path.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}

impl Complex {
    const ZERO: Complex = Complex { re: 0.0, im: 0.0 };

    fn new(re: f64, im: f64) -> Self {
        Complex { re, im }
    }

    fn real(re: f64) -> Self {
        Complex { re, im: 0.0 }
    }

    fn add(self, o: Complex) -> Complex {
        Complex::new(self.re + o.re, self.im + o.im)
    }

    fn sub(self, o: Complex) -> Complex {
        Complex::new(self.re - o.re, self.im - o.im)
    }

    fn mul(self, o: Complex) -> Complex {
        Complex::new(
            self.re * o.re - self.im * o.im,
            self.re * o.im + self.im * o.re,
        )
    }

    fn div(self, o: Complex) -> Complex {
        let denom = o.re * o.re + o.im * o.im;
        Complex::new(
            (self.re * o.re + self.im * o.im) / denom,
            (self.im * o.re - self.re * o.im) / denom,
        )
    }

    fn scale(self, s: f64) -> Complex {
        Complex::new(self.re * s, self.im * s)
    }

    fn sqrt(self) -> Complex {
        let r = (self.re * self.re + self.im * self.im).sqrt();
        let theta = self.im.atan2(self.re) / 2.0;
        Complex::new(r.sqrt() * theta.cos(), r.sqrt() * theta.sin())
    }

    fn abs(self) -> f64 {
        (self.re * self.re + self.im * self.im).sqrt()
    }
}

// Expand a polynomial from its roots; leading coefficient 1.
fn poly_from_roots(roots: &[Complex]) -> Vec<Complex> {
    let mut coeffs = vec![Complex::real(1.0)];
    for &r in roots {
        let mut next = vec![Complex::ZERO; coeffs.len() + 1];
        for (i, &c) in coeffs.iter().enumerate() {
            next[i] = next[i].add(c);
            next[i + 1] = next[i + 1].sub(c.mul(r));
        }
        coeffs = next;
    }
    coeffs
}

fn eval_poly(coeffs: &[f64], z: Complex) -> Complex {
    let mut acc = Complex::ZERO;
    for &c in coeffs {
        acc = acc.mul(z).add(Complex::real(c));
    }
    acc
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Band {
    Lowpass,
    Highpass,
    Bandpass,
    Bandstop,
}

/// A designed Butterworth filter, applied forward-backward.
#[derive(Debug, Clone)]
pub struct ButterworthFilter {
    b: Vec<f64>,
    a: Vec<f64>,
    n_poles: usize,
}

impl ButterworthFilter {
    pub fn lowpass(order: usize, sampling_frequency: f64, cutoff: f64) -> Result<Self> {
        Self::design(order, sampling_frequency, Band::Lowpass, cutoff, 0.0)
    }

    pub fn highpass(order: usize, sampling_frequency: f64, cutoff: f64) -> Result<Self> {
        Self::design(order, sampling_frequency, Band::Highpass, cutoff, 0.0)
    }

    pub fn bandpass(
        order: usize,
        sampling_frequency: f64,
        low_cutoff: f64,
        high_cutoff: f64,
    ) -> Result<Self> {
        Self::design(order, sampling_frequency, Band::Bandpass, low_cutoff, high_cutoff)
    }

    pub fn bandstop(
        order: usize,
        sampling_frequency: f64,
        low_cutoff: f64,
        high_cutoff: f64,
    ) -> Result<Self> {
        Self::design(order, sampling_frequency, Band::Bandstop, low_cutoff, high_cutoff)
    }

    /// Lowpass with the antialias cutoff rule.
    pub fn antialias(order: usize, input_frequency: f64, output_frequency: f64) -> Result<Self> {
        let cutoff = (input_frequency / ANTIALIAS_FREQ_DIVISOR).min(output_frequency / 2.0);
        Self::lowpass(order, input_frequency, cutoff)
    }

    fn design(
        order: usize,
        fs: f64,
        band: Band,
        fc1: f64,
        fc2: f64,
    ) -> Result<Self> {
        if order == 0 || order > FILTER_MAX_ORDER {
            return Err(MedError::parameter(format!(
                "filter order {order} outside 1..={FILTER_MAX_ORDER}"
            )));
        }
        let nyquist = fs / 2.0;
        let check = |fc: f64| -> Result<f64> {
            if fc <= 0.0 || fc >= nyquist {
                return Err(MedError::parameter(format!(
                    "cutoff {fc} Hz outside (0, {nyquist}) at {fs} Hz sampling"
                )));
            }
            Ok(fc / nyquist)
        };

        // Analog Butterworth prototype poles on the left unit semicircle.
        let proto: Vec<Complex> = (0..order)
            .map(|k| {
                let theta = std::f64::consts::PI * (2 * k + order + 1) as f64 / (2 * order) as f64;
                Complex::new(theta.cos(), theta.sin())
            })
            .collect();

        // Pre-warped analog frequencies (bilinear with fs_d = 2).
        let fs_d = 2.0;
        let warp = |w: f64| 2.0 * fs_d * (std::f64::consts::PI * w / 2.0).tan();

        let (analog_poles, analog_zeros, band_ref): (Vec<Complex>, Vec<Complex>, Complex) =
            match band {
                Band::Lowpass => {
                    let w = warp(check(fc1)?);
                    let poles = proto.iter().map(|&p| p.scale(w)).collect();
                    (poles, vec![], Complex::real(1.0)) // reference at z = 1 (DC)
                }
                Band::Highpass => {
                    let w = warp(check(fc1)?);
                    let poles = proto.iter().map(|&p| Complex::real(w).div(p)).collect();
                    let zeros = vec![Complex::ZERO; order];
                    (poles, zeros, Complex::real(-1.0)) // reference at Nyquist
                }
                Band::Bandpass => {
                    let w1 = warp(check(fc1)?);
                    let w2 = warp(check(fc2)?);
                    let bw = w2 - w1;
                    let w0 = (w1 * w2).sqrt();
                    let mut poles = Vec::with_capacity(2 * order);
                    for &p in &proto {
                        let pb = p.scale(bw / 2.0);
                        let disc = pb.mul(pb).sub(Complex::real(w0 * w0)).sqrt();
                        poles.push(pb.add(disc));
                        poles.push(pb.sub(disc));
                    }
                    let zeros = vec![Complex::ZERO; order];
                    // Reference at the geometric centre frequency.
                    let wd = 2.0 * (w0 / (2.0 * fs_d)).atan();
                    (poles, zeros, Complex::new(wd.cos(), wd.sin()))
                }
                Band::Bandstop => {
                    let w1 = warp(check(fc1)?);
                    let w2 = warp(check(fc2)?);
                    let bw = w2 - w1;
                    let w0 = (w1 * w2).sqrt();
                    let mut poles = Vec::with_capacity(2 * order);
                    for &p in &proto {
                        let inv = Complex::real(bw / 2.0).div(p);
                        let disc = inv.mul(inv).sub(Complex::real(w0 * w0)).sqrt();
                        poles.push(inv.add(disc));
                        poles.push(inv.sub(disc));
                    }
                    let mut zeros = Vec::with_capacity(2 * order);
                    for _ in 0..order {
                        zeros.push(Complex::new(0.0, w0));
                        zeros.push(Complex::new(0.0, -w0));
                    }
                    (poles, zeros, Complex::real(1.0))
                }
            };

        // Bilinear transform to the z-plane; analog zeros at infinity land
        // on z = -1.
        let two_fs = Complex::real(2.0 * fs_d);
        let digital_poles: Vec<Complex> = analog_poles
            .iter()
            .map(|&p| two_fs.add(p).div(two_fs.sub(p)))
            .collect();
        let mut digital_zeros: Vec<Complex> = analog_zeros
            .iter()
            .map(|&z| two_fs.add(z).div(two_fs.sub(z)))
            .collect();
        while digital_zeros.len() < digital_poles.len() {
            digital_zeros.push(Complex::real(-1.0));
        }

        let a: Vec<f64> = poly_from_roots(&digital_poles).iter().map(|c| c.re).collect();
        let mut b: Vec<f64> = poly_from_roots(&digital_zeros).iter().map(|c| c.re).collect();

        // Normalize to unit gain at the band's reference frequency.
        let num = eval_poly(&b, band_ref);
        let den = eval_poly(&a, band_ref);
        let gain = num.abs() / den.abs();
        if !gain.is_finite() || gain == 0.0 {
            return Err(MedError::parameter("degenerate filter design"));
        }
        for coeff in &mut b {
            *coeff /= gain;
        }

        Ok(ButterworthFilter {
            n_poles: digital_poles.len(),
            b,
            a,
        })
    }

    pub fn n_poles(&self) -> usize {
        self.n_poles
    }

    /// Padding applied to each side during [`filtfilt`](Self::filtfilt).
    pub fn pad_samples(&self) -> usize {
        PAD_SAMPLES_PER_POLE * self.n_poles
    }

    // Direct form II transposed, seeded with state `zi`.
    fn lfilter(&self, x: &[f64], zi: &[f64]) -> Vec<f64> {
        let n = self.a.len();
        let mut z = zi.to_vec();
        z.resize(n - 1, 0.0);
        let mut out = Vec::with_capacity(x.len());
        for &xv in x {
            let y = self.b[0] * xv + z[0];
            for i in 0..n - 2 {
                z[i] = self.b[i + 1] * xv + z[i + 1] - self.a[i + 1] * y;
            }
            z[n - 2] = self.b[n - 1] * xv - self.a[n - 1] * y;
            out.push(y);
        }
        out
    }

    // Steady-state filter state for a unit-step input: the startup
    // transient vanishes when this is scaled by the first sample.
    fn initial_conditions(&self) -> Result<Vec<f64>> {
        let n = self.a.len() - 1;
        // M = I - companion(a)^T
        let mut m = vec![vec![0.0; n]; n];
        for (i, row) in m.iter_mut().enumerate() {
            row[i] = 1.0;
        }
        for i in 0..n {
            m[i][0] += self.a[i + 1];
        }
        for i in 0..n - 1 {
            m[i][i + 1] -= 1.0;
        }
        let rhs: Vec<f64> = (0..n)
            .map(|i| self.b[i + 1] - self.a[i + 1] * self.b[0])
            .collect();
        solve_dense(m, rhs)
    }

    /// Zero-phase forward-backward filtering.
    pub fn filtfilt(&self, data: &[f64]) -> Result<Vec<f64>> {
        let pad = self.pad_samples();
        if data.len() <= pad {
            return Err(MedError::parameter(format!(
                "filtfilt needs more than {pad} samples, got {}",
                data.len()
            )));
        }
        // Odd reflection about the end points.
        let mut extended = Vec::with_capacity(data.len() + 2 * pad);
        for i in (1..=pad).rev() {
            extended.push(2.0 * data[0] - data[i]);
        }
        extended.extend_from_slice(data);
        for i in (data.len() - pad - 1..data.len() - 1).rev() {
            extended.push(2.0 * data[data.len() - 1] - data[i]);
        }

        let zi = self.initial_conditions()?;
        let seed: Vec<f64> = zi.iter().map(|&z| z * extended[0]).collect();
        let mut forward = self.lfilter(&extended, &seed);

        forward.reverse();
        let seed: Vec<f64> = zi.iter().map(|&z| z * forward[0]).collect();
        let mut backward = self.lfilter(&forward, &seed);
        backward.reverse();

        Ok(backward[pad..pad + data.len()].to_vec())
    }
}

// Gaussian elimination with partial pivoting; systems here are at most
// 2 * FILTER_MAX_ORDER wide.
fn solve_dense(mut m: Vec<Vec<f64>>, mut rhs: Vec<f64>) -> Result<Vec<f64>> {
    let n = rhs.len();
    for col in 0..n {
        let pivot = (col..n)
            .max_by(|&i, &j| {
                m[i][col]
                    .abs()
                    .partial_cmp(&m[j][col].abs())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap();
        if m[pivot][col].abs() < 1e-300 {
            return Err(MedError::parameter("singular system in filter design"));
        }
        m.swap(col, pivot);
        rhs.swap(col, pivot);
        for row in col + 1..n {
            let factor = m[row][col] / m[col][col];
            for k in col..n {
                m[row][k] -= factor * m[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }
    let mut x = vec![0.0; n];
    for row in (0..n).rev() {
        let mut acc = rhs[row];
        for k in row + 1..n {
            acc -= m[row][k] * x[k];
        }
        x[row] = acc / m[row][row];
    }
    Ok(x)
}

/// Clamp a highpass cutoff that is too low to resolve in `data_len`
/// samples, warning through the message sink.
pub fn adjusted_highpass_cutoff(cutoff: f64, sampling_frequency: f64, data_len: usize) -> f64 {
    let floor = sampling_frequency / data_len as f64;
    if cutoff < floor {
        warn!(cutoff, floor, "highpass cutoff too low, adjusted to fs / sample count");
        floor
    } else {
        cutoff
    }
}

/// Tail handling for the streaming filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TailMode {
    /// Shrink the window at the edges.
    #[default]
    Truncate,
    /// Extend the edges with their end values.
    Extrapolate,
    /// Treat samples beyond the edges as zero.
    ZeroPad,
}

fn edge_value(data: &[f64], idx: i64, tail: TailMode) -> Option<f64> {
    if idx >= 0 && (idx as usize) < data.len() {
        return Some(data[idx as usize]);
    }
    match tail {
        TailMode::Truncate => None,
        TailMode::Extrapolate => Some(if idx < 0 {
            data[0]
        } else {
            data[data.len() - 1]
        }),
        TailMode::ZeroPad => Some(0.0),
    }
}

/// Centered moving average over a window of `span` samples.
pub fn moving_average(data: &[f64], span: usize, tail: TailMode) -> Vec<f64> {
    if data.is_empty() || span == 0 {
        return data.to_vec();
    }
    let half = (span / 2) as i64;
    (0..data.len() as i64)
        .map(|center| {
            let mut sum = 0.0;
            let mut count = 0usize;
            for offset in -half..=(span as i64 - 1 - half) {
                if let Some(v) = edge_value(data, center + offset, tail) {
                    sum += v;
                    count += 1;
                }
            }
            if count == 0 { 0.0 } else { sum / count as f64 }
        })
        .collect()
}

/// Centered moving quantile (0.0 = min, 0.5 = median, 1.0 = max); the
/// noise-floor estimator runs this with a low quantile.
pub fn quantile_filter(data: &[f64], span: usize, quantile: f64, tail: TailMode) -> Vec<f64> {
    if data.is_empty() || span == 0 {
        return data.to_vec();
    }
    let q = quantile.clamp(0.0, 1.0);
    let half = (span / 2) as i64;
    let mut window = Vec::with_capacity(span);
    (0..data.len() as i64)
        .map(|center| {
            window.clear();
            for offset in -half..=(span as i64 - 1 - half) {
                if let Some(v) = edge_value(data, center + offset, tail) {
                    window.push(v);
                }
            }
            if window.is_empty() {
                return 0.0;
            }
            window.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
            let pos = q * (window.len() - 1) as f64;
            let lo = pos.floor() as usize;
            let hi = pos.ceil() as usize;
            if lo == hi {
                window[lo]
            } else {
                window[lo] + (pos - lo as f64) * (window[hi] - window[lo])
            }
        })
        .collect()
}

/// Blend decoded samples across a discontinuity boundary so the filter
/// pad does not ring. Each boundary is smoothed independently with its
/// own ramp index.
pub fn smooth_discontinuity_edges(data: &mut [f64], boundaries: &[usize], span: usize) {
    for &boundary in boundaries {
        if boundary == 0 || boundary >= data.len() || span == 0 {
            continue;
        }
        let left = data[boundary - 1];
        let right = data[boundary];
        let half_step = (right - left) / (2.0 * span as f64 + 1.0);
        for k in 0..span {
            let fade = (span - k) as f64 * half_step;
            if let Some(v) = data.get_mut(boundary + k) {
                *v -= fade;
            }
            if boundary >= k + 2 {
                if let Some(v) = data.get_mut(boundary - k - 1) {
                    *v += fade;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn sine(f: f64, fs: f64, n: usize) -> Vec<f64> {
        (0..n)
            .map(|i| (2.0 * std::f64::consts::PI * f * i as f64 / fs).sin())
            .collect()
    }

    #[test]
    fn constant_input_passes_unchanged() {
        let filter = ButterworthFilter::lowpass(FILTER_ORDER_DEFAULT, 1000.0, 40.0).unwrap();
        let data = vec![3.25; 512];
        let out = filter.filtfilt(&data).unwrap();
        for v in out {
            assert_relative_eq!(v, 3.25, epsilon = 1e-8);
        }
    }

    #[test]
    fn lowpass_attenuates_high_frequency() {
        let fs = 1000.0;
        let filter = ButterworthFilter::lowpass(4, fs, 30.0).unwrap();
        let slow = sine(5.0, fs, 2000);
        let fast = sine(200.0, fs, 2000);
        let mixed: Vec<f64> = slow.iter().zip(&fast).map(|(a, b)| a + b).collect();
        let out = filter.filtfilt(&mixed).unwrap();
        // Compare power in the middle region, clear of any edge effects.
        let mid = 500..1500;
        let residual: f64 = out[mid.clone()]
            .iter()
            .zip(&slow[mid])
            .map(|(o, s)| (o - s).powi(2))
            .sum();
        assert!(residual / 1000.0 < 0.01, "residual power {residual}");
    }

    #[test]
    fn highpass_removes_drift() {
        let fs = 500.0;
        let filter = ButterworthFilter::highpass(4, fs, 1.0).unwrap();
        let carrier = sine(50.0, fs, 4000);
        let data: Vec<f64> = carrier.iter().map(|v| 100.0 + v).collect();
        let out = filter.filtfilt(&data).unwrap();
        let mean: f64 = out[1000..3000].iter().sum::<f64>() / 2000.0;
        assert!(mean.abs() < 0.5, "residual offset {mean}");
    }

    #[test]
    fn bandstop_notches_line_noise() {
        let fs = 1000.0;
        let filter = ButterworthFilter::bandstop(2, fs, 55.0, 65.0).unwrap();
        let line = sine(60.0, fs, 4000);
        let signal = sine(10.0, fs, 4000);
        let mixed: Vec<f64> = line.iter().zip(&signal).map(|(a, b)| a + b).collect();
        let out = filter.filtfilt(&mixed).unwrap();
        let mid = 1000..3000;
        let residual: f64 = out[mid.clone()]
            .iter()
            .zip(&signal[mid])
            .map(|(o, s)| (o - s).powi(2))
            .sum();
        assert!(residual / 2000.0 < 0.02, "residual power {residual}");
    }

    #[test]
    fn bandpass_passes_band_center() {
        let fs = 1000.0;
        let filter = ButterworthFilter::bandpass(3, fs, 20.0, 60.0).unwrap();
        let inband = sine(40.0, fs, 4000);
        let out = filter.filtfilt(&inband).unwrap();
        let mid = 1000..3000;
        let power_in: f64 = inband[mid.clone()].iter().map(|v| v * v).sum();
        let power_out: f64 = out[mid].iter().map(|v| v * v).sum();
        assert!(
            (power_out / power_in - 1.0).abs() < 0.05,
            "band-center gain {}",
            power_out / power_in
        );
    }

    #[test]
    fn invalid_designs_are_rejected() {
        assert!(ButterworthFilter::lowpass(0, 1000.0, 40.0).is_err());
        assert!(ButterworthFilter::lowpass(11, 1000.0, 40.0).is_err());
        assert!(ButterworthFilter::lowpass(4, 1000.0, 600.0).is_err());
        assert!(ButterworthFilter::lowpass(4, 1000.0, 0.0).is_err());
    }

    #[test]
    fn short_input_is_rejected() {
        let filter = ButterworthFilter::lowpass(5, 1000.0, 40.0).unwrap();
        let data = vec![0.0; filter.pad_samples()];
        assert!(filter.filtfilt(&data).is_err());
    }

    #[test]
    fn moving_average_tail_modes() {
        let data = vec![1.0, 2.0, 3.0, 4.0, 5.0];
        let truncated = moving_average(&data, 3, TailMode::Truncate);
        assert_relative_eq!(truncated[0], 1.5); // window [1, 2]
        assert_relative_eq!(truncated[2], 3.0);
        let extended = moving_average(&data, 3, TailMode::Extrapolate);
        assert_relative_eq!(extended[0], (1.0 + 1.0 + 2.0) / 3.0);
        let zeroed = moving_average(&data, 3, TailMode::ZeroPad);
        assert_relative_eq!(zeroed[0], (0.0 + 1.0 + 2.0) / 3.0);
    }

    #[test]
    fn quantile_filter_tracks_noise_floor() {
        // Spikes on a flat floor: a low quantile ignores them.
        let mut data = vec![1.0; 100];
        for i in (0..100).step_by(10) {
            data[i] = 50.0;
        }
        let floor = quantile_filter(&data, 9, 0.25, TailMode::Extrapolate);
        for v in &floor[5..95] {
            assert_relative_eq!(*v, 1.0);
        }
    }

    #[test]
    fn antialias_cutoff_rule() {
        let filter = ButterworthFilter::antialias(5, 1000.0, 250.0).unwrap();
        // 1000 / 3.5 > 125 = out_fs / 2, so the rule clamps to 125.
        assert_eq!(filter.n_poles(), 5);
    }

    #[test]
    fn adjusted_cutoff_warns_and_clamps() {
        assert_relative_eq!(adjusted_highpass_cutoff(0.001, 1000.0, 5000), 0.2);
        assert_relative_eq!(adjusted_highpass_cutoff(5.0, 1000.0, 5000), 5.0);
    }

    #[test]
    fn discontinuity_smoothing_narrows_the_step() {
        let mut data = vec![0.0; 20];
        for v in data.iter_mut().skip(10) {
            *v = 10.0;
        }
        smooth_discontinuity_edges(&mut data, &[10], 3);
        // The jump between adjacent samples at the boundary shrinks.
        let step: f64 = data[10] - data[9];
        assert!(step < 10.0);
        // End values are untouched.
        assert_relative_eq!(data[0], 0.0);
        assert_relative_eq!(data[19], 10.0);
    }
}
