//! Pure functions aligning timestamps to a fixed-size minute grid.
//!
//! Every allocation boundary and every reservable slot in the engine is
//! aligned to one of the supported grid sizes. The grid sizes are an explicit
//! allow-list rather than a computed constraint; they all divide an hour, so
//! aligning to the grid and aligning to the minute-of-hour are the same
//! operation.

use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SchedulerError};

/// Grid sizes (in minutes) the engine supports.
pub const VALID_RASTERS: [u32; 6] = [5, 10, 15, 20, 30, 60];

/// True if `raster` is one of the supported grid sizes.
pub fn is_valid_raster(raster: u32) -> bool {
    VALID_RASTERS.contains(&raster)
}

/// Round `t` down to the nearest multiple of `raster` minutes.
pub fn rasterize_start(t: DateTime<Utc>, raster: u32) -> DateTime<Utc> {
    let step = i64::from(raster) * 60;
    let secs = t.timestamp().div_euclid(step) * step;
    DateTime::from_timestamp(secs, 0).unwrap_or(t)
}

/// Round `t` up to the nearest multiple of `raster` minutes. An end exactly
/// on the grid is left unchanged.
pub fn rasterize_end(t: DateTime<Utc>, raster: u32) -> DateTime<Utc> {
    let step = i64::from(raster) * 60;
    let secs = t.timestamp();
    let sub = t.timestamp_subsec_nanos();
    let mut aligned = secs.div_euclid(step) * step;
    if aligned != secs || sub != 0 {
        aligned += step;
    }
    DateTime::from_timestamp(aligned, 0).unwrap_or(t)
}

/// Apply [`rasterize_start`] and [`rasterize_end`] to a span, rejecting
/// unsupported grid sizes before anything else happens.
pub fn rasterize_span(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    raster: u32,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    if !is_valid_raster(raster) {
        return Err(SchedulerError::InvalidRaster { raster });
    }
    Ok((rasterize_start(start, raster), rasterize_end(end, raster)))
}

/// Lazy sequence of `(slot_start, slot_end)` pairs, each exactly `raster`
/// minutes long, covering `[start, end)`.
///
/// The span boundaries are rasterized first. A zero-length or inverted span
/// yields an empty sequence rather than an error; callers are expected to
/// validate range ordering upstream.
pub fn iterate_span(start: DateTime<Utc>, end: DateTime<Utc>, raster: u32) -> SpanIter {
    SpanIter {
        cursor: rasterize_start(start, raster),
        end: rasterize_end(end, raster),
        step: Duration::minutes(i64::from(raster)),
    }
}

/// Iterator over the raster-aligned slots of a span. `Clone` to restart it.
#[derive(Debug, Clone)]
pub struct SpanIter {
    cursor: DateTime<Utc>,
    end: DateTime<Utc>,
    step: Duration,
}

impl Iterator for SpanIter {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.end {
            return None;
        }
        let slot_start = self.cursor;
        let slot_end = slot_start + self.step;
        self.cursor = slot_end;
        Some((slot_start, slot_end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn dt(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    #[test]
    fn start_rounds_down_end_rounds_up() {
        assert_eq!(rasterize_start(dt(9, 7), 15), dt(9, 0));
        assert_eq!(rasterize_end(dt(9, 7), 15), dt(9, 15));

        // Values on the grid are untouched.
        assert_eq!(rasterize_start(dt(9, 30), 15), dt(9, 30));
        assert_eq!(rasterize_end(dt(9, 30), 15), dt(9, 30));
    }

    #[test]
    fn span_rejects_unsupported_raster() {
        assert!(matches!(
            rasterize_span(dt(9, 0), dt(10, 0), 7),
            Err(SchedulerError::InvalidRaster { raster: 7 })
        ));

        for raster in VALID_RASTERS {
            assert!(rasterize_span(dt(9, 0), dt(10, 0), raster).is_ok());
        }
    }

    #[test]
    fn rasterization_is_idempotent() {
        let (start, end) = rasterize_span(dt(9, 3), dt(10, 44), 30).unwrap();
        assert_eq!(rasterize_span(start, end, 30).unwrap(), (start, end));
    }

    #[test]
    fn iterate_span_is_length_additive() {
        let slots: Vec<_> = iterate_span(dt(9, 0), dt(17, 0), 15).collect();
        assert_eq!(slots.len(), 32);

        // No gaps, no overlaps: each slot starts where the previous ended.
        assert_eq!(slots[0].0, dt(9, 0));
        assert_eq!(slots.last().unwrap().1, dt(17, 0));
        for pair in slots.windows(2) {
            assert_eq!(pair[0].1, pair[1].0);
        }
    }

    #[test]
    fn iterate_span_is_restartable() {
        let iter = iterate_span(dt(8, 0), dt(9, 0), 30);
        assert_eq!(iter.clone().count(), 2);
        assert_eq!(iter.count(), 2);
    }

    #[test]
    fn empty_and_inverted_spans_yield_nothing() {
        assert_eq!(iterate_span(dt(9, 0), dt(9, 0), 15).count(), 0);
        assert_eq!(iterate_span(dt(10, 0), dt(9, 0), 15).count(), 0);
    }
}
