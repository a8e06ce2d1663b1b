//! Time slices, contiguons, and the resolver that interconverts µUTC,
//! sample numbers, and segment numbers through a channel's `Sgmt`
//! records.
//!
//! A slice arrives with any subset of its bounds set (sentinels mark the
//! rest) and leaves resolution fully populated. Time and sample are
//! always interconverted through the reference channel; when channel
//! rates differ, sample-based slices are only meaningful relative to
//! that channel and a warning is emitted.

use serde::Serialize;
use tracing::warn;

use med_core::error::{MedError, Result};
use med_core::record::SgmtRecord;
use med_core::types::{
    BEGINNING_OF_TIME, END_OF_TIME, FREQUENCY_VARIABLE, SAMPLE_NUMBER_NO_ENTRY,
    SEGMENT_NUMBER_NO_ENTRY, UUTC_NO_ENTRY,
};

/// Tie-breaking mode for time/sample searches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FindMode {
    /// The sample whose period contains the target time.
    #[default]
    Current,
    /// Strictly before the target.
    Previous,
    /// Strictly after the target.
    Next,
    /// Whichever sample time is nearest.
    Closest,
    LastBefore,
    FirstOnOrAfter,
    LastOnOrBefore,
    FirstAfter,
}

/// Which point of a sample's period a time query returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimePoint {
    #[default]
    Start,
    Center,
    End,
}

/// A partially or fully specified extraction range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeSlice {
    pub conditioned: bool,
    pub number_of_segments: i32,
    pub start_time: i64,
    pub end_time: i64,
    pub start_sample_number: i64,
    pub end_sample_number: i64,
    pub start_segment_number: i32,
    pub end_segment_number: i32,
}

impl Default for TimeSlice {
    fn default() -> Self {
        TimeSlice {
            conditioned: false,
            number_of_segments: -1,
            start_time: UUTC_NO_ENTRY,
            end_time: UUTC_NO_ENTRY,
            start_sample_number: SAMPLE_NUMBER_NO_ENTRY,
            end_sample_number: SAMPLE_NUMBER_NO_ENTRY,
            start_segment_number: SEGMENT_NUMBER_NO_ENTRY,
            end_segment_number: SEGMENT_NUMBER_NO_ENTRY,
        }
    }
}

impl TimeSlice {
    pub fn from_times(start_time: i64, end_time: i64) -> Self {
        TimeSlice {
            start_time,
            end_time,
            ..Default::default()
        }
    }

    pub fn from_samples(start_sample_number: i64, end_sample_number: i64) -> Self {
        TimeSlice {
            start_sample_number,
            end_sample_number,
            ..Default::default()
        }
    }

    pub fn from_segments(start_segment_number: i32, end_segment_number: i32) -> Self {
        TimeSlice {
            start_segment_number,
            end_segment_number,
            ..Default::default()
        }
    }

    /// The whole recording.
    pub fn whole() -> Self {
        TimeSlice {
            start_time: BEGINNING_OF_TIME,
            end_time: END_OF_TIME,
            ..Default::default()
        }
    }

    /// Canonicalize: order swapped bounds and replace open-ended
    /// sentinels with the extremes.
    pub fn condition(&mut self) {
        if self.start_time != UUTC_NO_ENTRY
            && self.end_time != UUTC_NO_ENTRY
            && self.start_time > self.end_time
        {
            std::mem::swap(&mut self.start_time, &mut self.end_time);
        }
        if self.start_sample_number != SAMPLE_NUMBER_NO_ENTRY
            && self.end_sample_number != SAMPLE_NUMBER_NO_ENTRY
            && self.start_sample_number > self.end_sample_number
        {
            std::mem::swap(&mut self.start_sample_number, &mut self.end_sample_number);
        }
        // A time-less, sample-less slice means everything.
        if self.start_time == UUTC_NO_ENTRY
            && self.start_sample_number == SAMPLE_NUMBER_NO_ENTRY
            && self.start_segment_number == SEGMENT_NUMBER_NO_ENTRY
        {
            self.start_time = BEGINNING_OF_TIME;
            self.end_time = END_OF_TIME;
        }
        self.conditioned = true;
    }

    /// Inclusive duration in microseconds; meaningful once resolved.
    pub fn duration(&self) -> i64 {
        self.end_time - self.start_time + 1
    }

    pub fn sample_count(&self) -> i64 {
        self.end_sample_number - self.start_sample_number + 1
    }

    pub fn segment_count(&self) -> i32 {
        self.end_segment_number - self.start_segment_number + 1
    }
}

/// A maximal interval with no discontinuity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Contiguon {
    pub start_time: i64,
    pub end_time: i64,
    pub start_sample_number: i64,
    pub end_sample_number: i64,
    pub start_segment_number: i32,
    pub end_segment_number: i32,
}

/// Resolver over a channel's (or the session's) `Sgmt` records, sorted
/// by segment number.
pub struct SgmtIndex<'a> {
    records: &'a [SgmtRecord],
}

impl<'a> SgmtIndex<'a> {
    pub fn new(records: &'a [SgmtRecord]) -> Self {
        debug_assert!(!records.is_empty());
        SgmtIndex { records }
    }

    pub fn first(&self) -> &SgmtRecord {
        &self.records[0]
    }

    pub fn last(&self) -> &SgmtRecord {
        &self.records[self.records.len() - 1]
    }

    /// Whether the records carry the variable-frequency sentinel.
    pub fn variable_frequency(&self) -> bool {
        self.records
            .iter()
            .any(|r| r.sampling_frequency == FREQUENCY_VARIABLE)
    }

    fn period_us(record: &SgmtRecord) -> f64 {
        1_000_000.0 / record.sampling_frequency
    }

    /// The segment containing (or nearest preceding, per mode) a time.
    pub fn segment_for_uutc(&self, target: i64, mode: FindMode) -> Result<&SgmtRecord> {
        if target < self.first().start_time {
            return match mode {
                FindMode::Next | FindMode::FirstAfter | FindMode::FirstOnOrAfter
                | FindMode::Closest => Ok(self.first()),
                _ => Err(MedError::DoesNotExist),
            };
        }
        if target > self.last().end_time {
            return match mode {
                FindMode::Previous | FindMode::LastBefore | FindMode::LastOnOrBefore
                | FindMode::Current | FindMode::Closest => Ok(self.last()),
                _ => Err(MedError::DoesNotExist),
            };
        }
        // Last segment starting at or before the target; gaps between
        // segments resolve per mode.
        let idx = self
            .records
            .partition_point(|r| r.start_time <= target)
            .saturating_sub(1);
        let record = &self.records[idx];
        if target > record.end_time {
            // In the gap after `record`.
            return match mode {
                FindMode::Next | FindMode::FirstAfter | FindMode::FirstOnOrAfter => {
                    Ok(&self.records[idx + 1])
                }
                FindMode::Closest => {
                    let next = &self.records[idx + 1];
                    if target - record.end_time <= next.start_time - target {
                        Ok(record)
                    } else {
                        Ok(next)
                    }
                }
                _ => Ok(record),
            };
        }
        Ok(record)
    }

    pub fn segment_for_sample_number(&self, target: i64) -> Result<&SgmtRecord> {
        if target < self.first().start_sample_number {
            return Err(MedError::DoesNotExist);
        }
        if target > self.last().end_sample_number {
            return Err(MedError::DoesNotExist);
        }
        let idx = self
            .records
            .partition_point(|r| r.start_sample_number <= target)
            .saturating_sub(1);
        Ok(&self.records[idx])
    }

    /// Session-relative sample number for a time.
    pub fn sample_number_for_uutc(&self, target: i64, mode: FindMode) -> Result<i64> {
        let record = self.segment_for_uutc(target, mode)?;
        let period = Self::period_us(record);
        let clamped = target.clamp(record.start_time, record.end_time);
        let offset = (clamped - record.start_time) as f64 / period;
        let on_sample = (offset - offset.round()).abs() < 1e-9;
        let sample = match mode {
            FindMode::Current | FindMode::LastOnOrBefore => offset.floor(),
            FindMode::Previous | FindMode::LastBefore => {
                if on_sample {
                    offset.round() - 1.0
                } else {
                    offset.floor()
                }
            }
            FindMode::Next | FindMode::FirstAfter => {
                if on_sample {
                    offset.round() + 1.0
                } else {
                    offset.ceil()
                }
            }
            FindMode::FirstOnOrAfter => offset.ceil(),
            FindMode::Closest => offset.round(),
        };
        let sample = record.start_sample_number + sample as i64;
        Ok(sample.clamp(
            self.first().start_sample_number,
            self.last().end_sample_number,
        ))
    }

    /// Time of a sample number, at the requested point of its period.
    pub fn uutc_for_sample_number(&self, sample: i64, point: TimePoint) -> Result<i64> {
        let record = self.segment_for_sample_number(sample)?;
        let period = Self::period_us(record);
        let offset = (sample - record.start_sample_number) as f64 * period;
        let base = record.start_time + offset.round() as i64;
        Ok(match point {
            TimePoint::Start => base,
            TimePoint::Center => base + (period / 2.0).round() as i64,
            TimePoint::End => base + period.round() as i64 - 1,
        })
    }

    /// Resolve a slice to fully populated bounds. This is the entry
    /// point every bulk read goes through.
    pub fn resolve(&self, slice: &mut TimeSlice) -> Result<()> {
        if !slice.conditioned {
            slice.condition();
        }
        if self.variable_frequency() {
            warn!(
                "sampling frequencies vary across channels; sample-based bounds are relative and discontinuities produce relative output"
            );
        }

        // Segment-only slices pick up their times from the records.
        if slice.start_time == UUTC_NO_ENTRY
            && slice.start_sample_number == SAMPLE_NUMBER_NO_ENTRY
            && slice.start_segment_number != SEGMENT_NUMBER_NO_ENTRY
        {
            let start = self
                .records
                .iter()
                .find(|r| r.segment_number == slice.start_segment_number)
                .ok_or(MedError::DoesNotExist)?;
            let end = self
                .records
                .iter()
                .find(|r| r.segment_number == slice.end_segment_number)
                .ok_or(MedError::DoesNotExist)?;
            slice.start_time = start.start_time;
            slice.end_time = end.end_time;
        }

        // Times take precedence; otherwise derive them from samples.
        if slice.start_time != UUTC_NO_ENTRY {
            let start = slice.start_time.max(self.first().start_time);
            let end = slice.end_time.min(self.last().end_time);
            if slice.end_time < self.first().start_time
                || slice.start_time > self.last().end_time
            {
                return Err(MedError::DoesNotExist);
            }
            if start > end {
                return Err(MedError::EmptySlice);
            }
            slice.start_time = start;
            slice.end_time = end;
            slice.start_sample_number =
                self.sample_number_for_uutc(start, FindMode::FirstOnOrAfter)?;
            slice.end_sample_number =
                self.sample_number_for_uutc(end, FindMode::LastOnOrBefore)?;
        } else if slice.start_sample_number != SAMPLE_NUMBER_NO_ENTRY {
            let start = slice
                .start_sample_number
                .max(self.first().start_sample_number);
            let end = slice.end_sample_number.min(self.last().end_sample_number);
            if slice.end_sample_number < self.first().start_sample_number
                || slice.start_sample_number > self.last().end_sample_number
            {
                return Err(MedError::DoesNotExist);
            }
            if start > end {
                return Err(MedError::EmptySlice);
            }
            slice.start_sample_number = start;
            slice.end_sample_number = end;
            slice.start_time = self.uutc_for_sample_number(start, TimePoint::Start)?;
            slice.end_time = self.uutc_for_sample_number(end, TimePoint::End)?;
        } else {
            return Err(MedError::EmptySlice);
        }

        if slice.start_sample_number > slice.end_sample_number {
            return Err(MedError::EmptySlice);
        }

        slice.start_segment_number = self
            .segment_for_sample_number(slice.start_sample_number)?
            .segment_number;
        slice.end_segment_number = self
            .segment_for_sample_number(slice.end_sample_number)?
            .segment_number;
        slice.number_of_segments = slice.segment_count();
        Ok(())
    }

    /// Fill in the segment bounds only, returning the number of segments
    /// in the intersection.
    pub fn get_segment_range(&self, slice: &mut TimeSlice) -> Result<i32> {
        self.resolve(slice)?;
        Ok(slice.number_of_segments)
    }

    pub fn sample_count(&self) -> i64 {
        self.last().end_sample_number - self.first().start_sample_number + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use med_core::types::Uid;

    // Two segments of 1000 samples at 1000 Hz, with a 500 ms gap.
    fn records() -> Vec<SgmtRecord> {
        vec![
            SgmtRecord {
                start_time: 1_000_000,
                end_time: 1_999_999,
                start_sample_number: 0,
                end_sample_number: 999,
                segment_uid: Uid(1),
                segment_number: 1,
                acquisition_channel_number: 1,
                sampling_frequency: 1000.0,
            },
            SgmtRecord {
                start_time: 2_500_000,
                end_time: 3_499_999,
                start_sample_number: 1000,
                end_sample_number: 1999,
                segment_uid: Uid(2),
                segment_number: 2,
                acquisition_channel_number: 1,
                sampling_frequency: 1000.0,
            },
        ]
    }

    #[test]
    fn sample_for_time_modes() {
        let records = records();
        let index = SgmtIndex::new(&records);
        // Exactly on sample 5 of segment 1.
        let t = 1_005_000;
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Current).unwrap(), 5);
        assert_eq!(index.sample_number_for_uutc(t, FindMode::LastOnOrBefore).unwrap(), 5);
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Previous).unwrap(), 4);
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Next).unwrap(), 6);
        assert_eq!(index.sample_number_for_uutc(t, FindMode::FirstOnOrAfter).unwrap(), 5);
        // Mid-period.
        let t = 1_005_400;
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Current).unwrap(), 5);
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Next).unwrap(), 6);
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Closest).unwrap(), 5);
        let t = 1_005_600;
        assert_eq!(index.sample_number_for_uutc(t, FindMode::Closest).unwrap(), 6);
    }

    #[test]
    fn time_sample_round_trip_inside_contiguon() {
        let records = records();
        let index = SgmtIndex::new(&records);
        for t in [1_000_000i64, 1_234_000, 1_999_000, 2_500_000, 3_141_000] {
            let sample = index.sample_number_for_uutc(t, FindMode::Current).unwrap();
            let back = index.uutc_for_sample_number(sample, TimePoint::Start).unwrap();
            assert_eq!(back, t, "t = {t}");
        }
    }

    #[test]
    fn gap_times_resolve_per_mode() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let in_gap = 2_200_000;
        // Current clamps into the earlier segment.
        assert_eq!(
            index.sample_number_for_uutc(in_gap, FindMode::Current).unwrap(),
            999
        );
        assert_eq!(
            index.sample_number_for_uutc(in_gap, FindMode::FirstOnOrAfter).unwrap(),
            1000
        );
        // Closest picks the nearer edge.
        assert_eq!(
            index.sample_number_for_uutc(2_100_000, FindMode::Closest).unwrap(),
            999
        );
        assert_eq!(
            index.sample_number_for_uutc(2_450_000, FindMode::Closest).unwrap(),
            1000
        );
    }

    #[test]
    fn resolve_time_slice() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let mut slice = TimeSlice::from_times(1_200_000, 3_000_000);
        index.resolve(&mut slice).unwrap();
        assert!(slice.conditioned);
        assert_eq!(slice.start_sample_number, 200);
        assert_eq!(slice.end_sample_number, 1500);
        assert_eq!(slice.start_segment_number, 1);
        assert_eq!(slice.end_segment_number, 2);
        assert_eq!(slice.number_of_segments, 2);
    }

    #[test]
    fn resolve_sample_slice() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let mut slice = TimeSlice::from_samples(500, 1499);
        index.resolve(&mut slice).unwrap();
        assert_eq!(slice.start_time, 1_500_000);
        assert_eq!(slice.end_time, 2_999_999);
        assert_eq!(slice.segment_count(), 2);
    }

    #[test]
    fn swapped_bounds_are_conditioned() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let mut slice = TimeSlice::from_times(3_000_000, 1_200_000);
        index.resolve(&mut slice).unwrap();
        assert_eq!(slice.start_time, 1_200_000);
    }

    #[test]
    fn whole_slice_covers_everything() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let mut slice = TimeSlice::whole();
        index.resolve(&mut slice).unwrap();
        assert_eq!(slice.start_sample_number, 0);
        assert_eq!(slice.end_sample_number, 1999);
        assert_eq!(slice.number_of_segments, 2);
    }

    #[test]
    fn slice_before_the_recording_does_not_exist() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let mut slice = TimeSlice::from_times(0, 999_999);
        assert!(matches!(
            index.resolve(&mut slice).unwrap_err(),
            MedError::DoesNotExist
        ));
    }

    #[test]
    fn gap_only_slice_is_empty() {
        let records = records();
        let index = SgmtIndex::new(&records);
        // Entirely inside the inter-segment gap: no samples exist.
        let mut slice = TimeSlice::from_times(2_100_000, 2_400_000);
        let err = index.resolve(&mut slice).unwrap_err();
        assert!(matches!(err, MedError::EmptySlice));
    }

    #[test]
    fn segment_slice_resolves_times() {
        let records = records();
        let index = SgmtIndex::new(&records);
        let mut slice = TimeSlice::from_segments(2, 2);
        index.resolve(&mut slice).unwrap();
        assert_eq!(slice.start_time, 2_500_000);
        assert_eq!(slice.start_sample_number, 1000);
        assert_eq!(slice.number_of_segments, 1);
    }
}
