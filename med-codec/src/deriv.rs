//! Derivative preprocessing for the lossless encodings.
//!
//! Samples are differenced 0–3 times before entropy coding; small
//! derivatives compress far better than raw amplitudes. Differencing is
//! done in wrapping i32 arithmetic so integration is exact for any input.

pub const MAX_DERIVATIVE_LEVEL: u8 = 3;
pub const DEFAULT_DERIVATIVE_LEVEL: u8 = 1;

/// Difference `data` in place `level` times.
pub fn differentiate(data: &mut [i32], level: u8) {
    for _ in 0..level {
        for i in (1..data.len()).rev() {
            data[i] = data[i].wrapping_sub(data[i - 1]);
        }
    }
}

/// Invert [`differentiate`].
pub fn integrate(data: &mut [i32], level: u8) {
    for _ in 0..level {
        for i in 1..data.len() {
            data[i] = data[i].wrapping_add(data[i - 1]);
        }
    }
}

/// Cost proxy for a differenced stream: one byte per value that fits a
/// signed byte, `1 + overflow_bytes` for the rest.
pub fn byte_cost(data: &[i32], overflow_bytes: u8) -> usize {
    data.iter()
        .map(|&v| {
            if (-127..=127).contains(&v) {
                1
            } else {
                1 + overflow_bytes as usize
            }
        })
        .sum()
}

/// Try derivative levels 0–3 and return the one with the smallest byte
/// cost, preferring the lower level on ties.
pub fn find_level(samples: &[i32], overflow_bytes: u8) -> u8 {
    let mut best_level = 0u8;
    let mut best_cost = byte_cost(samples, overflow_bytes);
    let mut work = samples.to_vec();
    for level in 1..=MAX_DERIVATIVE_LEVEL {
        for i in (1..work.len()).rev() {
            work[i] = work[i].wrapping_sub(work[i - 1]);
        }
        let cost = byte_cost(&work, overflow_bytes);
        if cost < best_cost {
            best_cost = cost;
            best_level = level;
        }
    }
    best_level
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn differentiate_integrate_round_trip() {
        for level in 0..=MAX_DERIVATIVE_LEVEL {
            let original: Vec<i32> = (0..500).map(|i| (i * i - 250 * i) as i32).collect();
            let mut data = original.clone();
            differentiate(&mut data, level);
            integrate(&mut data, level);
            assert_eq!(data, original, "level {level}");
        }
    }

    #[test]
    fn wrapping_inputs_round_trip() {
        let original = vec![i32::MAX, i32::MIN, 0, i32::MAX, -1, i32::MIN + 1];
        let mut data = original.clone();
        differentiate(&mut data, 2);
        integrate(&mut data, 2);
        assert_eq!(data, original);
    }

    #[test]
    fn ramp_prefers_first_derivative() {
        // A steep ramp is constant after one difference.
        let samples: Vec<i32> = (0..1000).map(|i| i * 1000).collect();
        assert_eq!(find_level(&samples, 4), 1);
    }

    #[test]
    fn parabola_prefers_second_derivative() {
        let samples: Vec<i32> = (0..1000i64).map(|i| (i * i) as i32).collect();
        assert_eq!(find_level(&samples, 4), 2);
    }

    #[test]
    fn noise_prefers_no_derivative() {
        // Values already within a byte: differencing cannot help.
        let samples: Vec<i32> = (0..1000).map(|i| (i * 37 % 100) - 50).collect();
        let level = find_level(&samples, 4);
        assert_eq!(level, 0);
    }
}
