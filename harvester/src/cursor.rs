use chrono::{DateTime, FixedOffset};

use crate::model::{LogQuery, Position};

/// Boundary used when a source has never committed a checkpoint.
pub const DEFAULT_START: &str = "2018-05-04T00:00:00+00:00";

/// Owns the compound `(boundary, offset)` cursor that turns the remote API's
/// coarse, non-unique timestamp ordering into a resumable stream.
///
/// The query for a cycle is built from the position committed for the last
/// record of the previous cycle: the boundary becomes `from_time` and the
/// offset tells the server how many records at that exact boundary were
/// already consumed. The offset carries over between cycles and resets only
/// when a strictly newer boundary is observed.
pub struct CursorTracker {
    position: Position,
}

impl CursorTracker {
    pub fn resume(stored: Option<Position>) -> Self {
        let position = stored.unwrap_or_else(|| {
            Position::new(DateTime::parse_from_rfc3339(DEFAULT_START).unwrap(), 0)
        });
        Self { position }
    }

    pub fn current_query(&self, limit: u32) -> LogQuery {
        LogQuery {
            from_time: self.position.boundary,
            offset: self.position.offset,
            limit,
        }
    }

    /// Fold one record, in arrival order, into the cursor and return the
    /// position to commit alongside that record.
    pub fn advance(&mut self, record_timestamp: DateTime<FixedOffset>) -> Position {
        if record_timestamp == self.position.boundary {
            self.position.offset += 1;
        } else {
            self.position.boundary = record_timestamp;
            self.position.offset = 1;
        }
        self.position.clone()
    }

    pub fn position(&self) -> &Position {
        &self.position
    }

    /// Rewind to a previously committed position, discarding in-memory
    /// advancement from a batch that never reached the sink.
    pub fn reset(&mut self, position: Position) {
        self.position = position;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn ts(s: &str) -> DateTime<FixedOffset> {
        DateTime::parse_from_rfc3339(s).unwrap()
    }

    #[test]
    fn starts_from_the_default_boundary_without_a_checkpoint() {
        let tracker = CursorTracker::resume(None);
        let query = tracker.current_query(100);
        assert_eq!(query.from_time, ts(DEFAULT_START));
        assert_eq!(query.offset, 0);
        assert_eq!(query.limit, 100);
    }

    #[test]
    fn resumes_with_the_persisted_offset_intact() {
        let stored = Position::new(ts("2020-01-01T00:00:05+00:00"), 3);
        let tracker = CursorTracker::resume(Some(stored.clone()));
        let query = tracker.current_query(50);
        // the offset from the last committed record is re-submitted, not zeroed
        assert_eq!(query.from_time, stored.boundary);
        assert_eq!(query.offset, 3);
    }

    #[test]
    fn counts_repeats_of_the_same_boundary() {
        let mut tracker = CursorTracker::resume(None);

        let first = tracker.advance(ts("2020-01-01T00:00:00+00:00"));
        assert_eq!(first, Position::new(ts("2020-01-01T00:00:00+00:00"), 1));

        let second = tracker.advance(ts("2020-01-01T00:00:00+00:00"));
        assert_eq!(second.offset, 2);

        let third = tracker.advance(ts("2020-01-01T00:00:01+00:00"));
        assert_eq!(third, Position::new(ts("2020-01-01T00:00:01+00:00"), 1));
    }

    #[test]
    fn equal_instants_in_different_zones_share_a_boundary() {
        let mut tracker = CursorTracker::resume(None);
        tracker.advance(ts("2020-01-01T12:00:00+00:00"));
        let position = tracker.advance(ts("2020-01-01T14:00:00+02:00"));
        assert_eq!(position.offset, 2);
    }

    #[test]
    fn committed_position_feeds_the_next_query_verbatim() {
        let mut tracker = CursorTracker::resume(None);
        tracker.advance(ts("2021-03-04T10:00:00+00:00"));
        tracker.advance(ts("2021-03-04T10:00:00+00:00"));

        let query = tracker.current_query(10);
        assert_eq!(query.from_time, ts("2021-03-04T10:00:00+00:00"));
        assert_eq!(query.offset, 2);
    }

    #[test]
    fn reset_discards_in_memory_advancement() {
        let mut tracker = CursorTracker::resume(None);
        let committed = tracker.position().clone();
        tracker.advance(ts("2022-01-01T00:00:00+00:00"));
        tracker.reset(committed.clone());
        assert_eq!(tracker.position(), &committed);
    }

    proptest! {
        /// After any non-decreasing sequence, the committed offset for the
        /// last record equals the length of the trailing run sharing its
        /// exact timestamp.
        #[test]
        fn offset_equals_trailing_run_length(run_lengths in prop::collection::vec(1usize..6, 1..10)) {
            let mut tracker = CursorTracker::resume(None);
            let base = ts("2021-06-01T00:00:00+00:00");

            let mut last = None;
            for (i, len) in run_lengths.iter().enumerate() {
                let stamp = base + Duration::seconds(i as i64);
                for _ in 0..*len {
                    last = Some(tracker.advance(stamp));
                }
            }

            let last = last.unwrap();
            prop_assert_eq!(last.offset as usize, *run_lengths.last().unwrap());
        }
    }
}
