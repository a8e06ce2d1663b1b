//! Range coder backing the RED and PRED encodings.
//!
//! Counts are normalized to a 2^16 total; arithmetic runs in a 48-bit
//! window (range starts at 2^48) and emits one byte per renormalization.
//! Carries that ripple past the 48-bit boundary propagate into the bytes
//! already emitted. The stream is finalized by flushing the six bytes of
//! `low`, so a decoder primes itself with six bytes and never reads past
//! the end of the stream (missing bytes read as zero).

use med_core::error::{MedError, Result};

/// Total of every normalized statistics table.
pub const TOTAL_COUNTS: u32 = 1 << 16;
const RANGE_BITS: u32 = 48;
const RANGE_MASK: u64 = (1u64 << RANGE_BITS) - 1;
const TOP: u64 = 1u64 << (RANGE_BITS - 8);

pub struct RangeEncoder {
    low: u64,
    range: u64,
    out: Vec<u8>,
}

impl RangeEncoder {
    pub fn new() -> Self {
        RangeEncoder {
            low: 0,
            range: 1u64 << RANGE_BITS,
            out: Vec::new(),
        }
    }

    /// Encode one symbol given its cumulative count and count in the
    /// normalized table.
    pub fn encode(&mut self, cumulative: u32, count: u32) {
        debug_assert!(count > 0);
        debug_assert!(cumulative + count <= TOTAL_COUNTS);
        let r = self.range >> 16;
        self.low += r * u64::from(cumulative);
        if self.low > RANGE_MASK {
            self.propagate_carry();
            self.low &= RANGE_MASK;
        }
        self.range = r * u64::from(count);
        while self.range < TOP {
            self.out.push((self.low >> (RANGE_BITS - 8)) as u8);
            self.low = (self.low << 8) & RANGE_MASK;
            self.range <<= 8;
        }
    }

    fn propagate_carry(&mut self) {
        for byte in self.out.iter_mut().rev() {
            let (v, overflow) = byte.overflowing_add(1);
            *byte = v;
            if !overflow {
                return;
            }
        }
        // A carry with no emitted bytes cannot occur: low stays below
        // 2^48 until at least one renormalization has happened.
        unreachable!("range coder carry before first emitted byte");
    }

    /// Flush the remaining window and return the stream.
    pub fn finish(mut self) -> Vec<u8> {
        for _ in 0..(RANGE_BITS / 8) {
            self.out.push((self.low >> (RANGE_BITS - 8)) as u8);
            self.low = (self.low << 8) & RANGE_MASK;
        }
        self.out
    }
}

impl Default for RangeEncoder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct RangeDecoder<'a> {
    code: u64,
    range: u64,
    input: &'a [u8],
    pos: usize,
}

impl<'a> RangeDecoder<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        let mut decoder = RangeDecoder {
            code: 0,
            range: 1u64 << RANGE_BITS,
            input,
            pos: 0,
        };
        for _ in 0..(RANGE_BITS / 8) {
            decoder.code = (decoder.code << 8) | u64::from(decoder.next_byte());
        }
        decoder
    }

    fn next_byte(&mut self) -> u8 {
        let b = self.input.get(self.pos).copied().unwrap_or(0);
        self.pos += 1;
        b
    }

    /// The cumulative-count position of the next symbol. Look it up in
    /// the table, then call [`decode_update`](Self::decode_update).
    pub fn decode_target(&self) -> u32 {
        let r = self.range >> 16;
        ((self.code / r).min(u64::from(TOTAL_COUNTS - 1))) as u32
    }

    pub fn decode_update(&mut self, cumulative: u32, count: u32) -> Result<()> {
        if count == 0 {
            return Err(MedError::decode("zero-count symbol in range decode"));
        }
        let r = self.range >> 16;
        let offset = r * u64::from(cumulative);
        if self.code < offset {
            return Err(MedError::decode("range decoder lost synchronization"));
        }
        self.code -= offset;
        self.range = r * u64::from(count);
        while self.range < TOP {
            self.code = ((self.code << 8) & RANGE_MASK) | u64::from(self.next_byte());
            self.range <<= 8;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A tiny adaptive-free model: fixed table of (cumulative, count) per
    // symbol, summing to TOTAL_COUNTS.
    fn table(counts: &[u32]) -> Vec<(u32, u32)> {
        assert_eq!(counts.iter().sum::<u32>(), TOTAL_COUNTS);
        let mut cum = 0;
        counts
            .iter()
            .map(|&c| {
                let entry = (cum, c);
                cum += c;
                entry
            })
            .collect()
    }

    fn round_trip(symbols: &[usize], counts: &[u32]) {
        let model = table(counts);
        let mut encoder = RangeEncoder::new();
        for &s in symbols {
            let (cum, count) = model[s];
            encoder.encode(cum, count);
        }
        let stream = encoder.finish();

        let mut decoder = RangeDecoder::new(&stream);
        for (i, &expected) in symbols.iter().enumerate() {
            let target = decoder.decode_target();
            let symbol = model.partition_point(|&(cum, _)| cum <= target) - 1;
            assert_eq!(symbol, expected, "symbol {i}");
            let (cum, count) = model[symbol];
            decoder.decode_update(cum, count).unwrap();
        }
    }

    #[test]
    fn uniform_model_round_trip() {
        let counts = vec![TOTAL_COUNTS / 4; 4];
        let symbols: Vec<usize> = (0..10_000).map(|i| (i * 7 + i / 13) % 4).collect();
        round_trip(&symbols, &counts);
    }

    #[test]
    fn skewed_model_round_trip() {
        // One dominant symbol plus rare ones, the shape block statistics
        // take for slowly varying signals.
        let counts = vec![TOTAL_COUNTS - 3 * 7, 7, 7, 7];
        let symbols: Vec<usize> = (0..5_000)
            .map(|i| if i % 611 == 0 { 1 + (i / 611) % 3 } else { 0 })
            .collect();
        round_trip(&symbols, &counts);
    }

    #[test]
    fn single_symbol_round_trip() {
        let counts = vec![TOTAL_COUNTS];
        let symbols = vec![0usize; 3_000];
        round_trip(&symbols, &counts);
    }

    #[test]
    fn minimum_count_symbols_round_trip() {
        // 256 symbols, most with count 1.
        let mut counts = vec![1u32; 256];
        counts[0] = TOTAL_COUNTS - 255;
        let symbols: Vec<usize> = (0..4_000).map(|i| (i * 131) % 256).collect();
        round_trip(&symbols, &counts);
    }

    #[test]
    fn empty_stream_round_trip() {
        let encoder = RangeEncoder::new();
        let stream = encoder.finish();
        assert_eq!(stream.len(), 6);
        let _ = RangeDecoder::new(&stream);
    }

    #[test]
    fn compresses_skewed_input() {
        let counts = vec![TOTAL_COUNTS - 255, 255];
        let model = table(&counts);
        let mut encoder = RangeEncoder::new();
        for i in 0..10_000 {
            let s = usize::from(i % 1000 == 0);
            let (cum, count) = model[s];
            encoder.encode(cum, count);
        }
        let stream = encoder.finish();
        // 10k near-constant symbols should land far below one bit each.
        assert!(stream.len() < 300, "stream was {} bytes", stream.len());
    }
}
