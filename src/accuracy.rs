//! Which spans of time are known to be in sync with the server.
//!
//! The table is a newest-first list of non-overlapping half-open ranges.
//! Neighbors with identical provenance are merged as soon as they touch.

use serde::{Deserialize, Serialize};

use crate::date::DAY_MILLIS;
use crate::directory::{find_first_overlapping, find_last_overlapping, TimeSpan};
use crate::error::{Error, Result};
use crate::model::Timestamp;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Provenance {
    /// Fully synchronized at `updated`.
    FullSync {
        highest_modseq: Option<String>,
        updated: Timestamp,
    },
    /// Only seen through searches; says nothing about completeness.
    Partial,
}

impl Provenance {
    pub fn full(highest_modseq: Option<String>, updated: Timestamp) -> Self {
        Provenance::FullSync {
            highest_modseq,
            updated,
        }
    }

    /// A full sync that happened at or after `cutoff`.
    fn fresh_since(&self, cutoff: Timestamp) -> bool {
        matches!(self, Provenance::FullSync { updated, .. } if *updated >= cutoff)
    }

    fn updated(&self) -> Option<Timestamp> {
        match self {
            Provenance::FullSync { updated, .. } => Some(*updated),
            Provenance::Partial => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyRange {
    /// Inclusive.
    pub start_ts: Timestamp,
    /// Exclusive.
    pub end_ts: Timestamp,
    pub provenance: Provenance,
}

impl AccuracyRange {
    pub fn new(start_ts: Timestamp, end_ts: Timestamp, provenance: Provenance) -> Self {
        Self {
            start_ts,
            end_ts,
            provenance,
        }
    }

    pub fn is_full_sync(&self) -> bool {
        matches!(self.provenance, Provenance::FullSync { .. })
    }
}

impl TimeSpan for AccuracyRange {
    fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    fn end_ts(&self) -> Timestamp {
        self.end_ts
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyTable {
    ranges: Vec<AccuracyRange>,
}

impl AccuracyTable {
    pub fn new(ranges: Vec<AccuracyRange>) -> Self {
        Self { ranges }
    }

    pub fn ranges(&self) -> &[AccuracyRange] {
        &self.ranges
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Record `[start, end)` as carrying `provenance`, replacing whatever was there.
    pub fn mark_sync_range(
        &mut self,
        start: Timestamp,
        end: Timestamp,
        provenance: Provenance,
    ) -> Result<()> {
        if start > end {
            return Err(Error::InvalidRange { start, end });
        }

        let (mut new_idx, new_hit) = {
            let (i, hit) = find_first_overlapping(&self.ranges, start, Some(end));
            (i, hit.cloned())
        };
        let (old_idx, old_hit) = {
            let (i, hit) = find_last_overlapping(&self.ranges, start, end);
            (i, hit.cloned())
        };

        let mut del_count = old_idx.saturating_sub(new_idx) + usize::from(old_hit.is_some());
        let mut insertions: Vec<AccuracyRange> = Vec::with_capacity(3);

        // Newest overlapping range sticks out past our end: keep its remainder.
        match new_hit {
            Some(hit) if hit.end_ts > end => {
                if hit.provenance == provenance {
                    insertions.push(AccuracyRange::new(start, hit.end_ts, provenance.clone()));
                } else {
                    insertions.push(AccuracyRange::new(end, hit.end_ts, hit.provenance));
                    insertions.push(AccuracyRange::new(start, end, provenance.clone()));
                }
            }
            _ => insertions.push(AccuracyRange::new(start, end, provenance.clone())),
        }

        // Oldest overlapping range sticks out past our start.
        if let Some(hit) = old_hit.as_ref().filter(|hit| hit.start_ts < start) {
            if hit.provenance == provenance {
                if let Some(last) = insertions.last_mut() {
                    last.start_ts = hit.start_ts;
                }
            } else {
                insertions.push(AccuracyRange::new(hit.start_ts, start, hit.provenance.clone()));
            }
        }

        // Merge with touching neighbors of identical provenance.
        if new_idx > 0 {
            let neighbor = &self.ranges[new_idx - 1];
            if let Some(first) = insertions.first_mut() {
                if first.end_ts == neighbor.start_ts && first.provenance == neighbor.provenance {
                    first.end_ts = neighbor.end_ts;
                    new_idx -= 1;
                    del_count += 1;
                }
            }
        }
        let old_neighbor_idx = old_idx + usize::from(old_hit.is_some());
        if let Some(neighbor) = self.ranges.get(old_neighbor_idx) {
            if let Some(last) = insertions.last_mut() {
                if last.start_ts == neighbor.end_ts && last.provenance == neighbor.provenance {
                    last.start_ts = neighbor.start_ts;
                    del_count += 1;
                }
            }
        }

        self.ranges.splice(new_idx..new_idx + del_count, insertions);
        Ok(())
    }

    /// The part of `[start, end)` not covered by fresh full-sync ranges at
    /// its edges, or `None` if the whole range is covered.
    pub fn check_coverage_needing_refresh(
        &self,
        start: Timestamp,
        end: Timestamp,
        stale_threshold_ms: i64,
        now: Timestamp,
    ) -> Option<(Timestamp, Timestamp)> {
        let cutoff = now - stale_threshold_ms;
        let (mut res_start, mut res_end) = (start, end);

        let (new_idx, new_hit) = find_first_overlapping(&self.ranges, start, Some(end));
        if new_hit.is_some() {
            let (old_idx, _) = find_last_overlapping(&self.ranges, start, end);
            let last = old_idx.min(self.ranges.len() - 1);
            let overlapping = self.ranges.get(new_idx..=last).unwrap_or(&[]);

            // Shrink the end edge, walking older.
            for arange in overlapping {
                // A gap, or a range that doesn't count.
                if arange.end_ts < res_end || !arange.provenance.fresh_since(cutoff) {
                    break;
                }
                if arange.start_ts <= res_start {
                    return None;
                }
                res_end = arange.start_ts;
            }

            // Shrink the start edge, walking newer.
            for arange in overlapping.iter().rev() {
                if arange.start_ts > res_start || !arange.provenance.fresh_since(cutoff) {
                    break;
                }
                res_start = arange.end_ts;
            }
        }

        if res_start >= res_end {
            return None;
        }
        Some((res_start, res_end))
    }

    /// Drop everything older than `cut`, trimming the range that straddles it.
    pub fn truncate_before(&mut self, cut: Timestamp) {
        let (idx, hit) = find_first_overlapping(&self.ranges, cut, Some(cut));
        match hit {
            Some(range) if range.end_ts > cut => {
                self.ranges[idx].start_ts = cut;
                self.ranges.truncate(idx + 1);
            }
            _ => self.ranges.truncate(idx),
        }
    }

    /// End of the newest full-sync range.
    pub fn newest_full_sync_date(&self) -> Option<Timestamp> {
        self.ranges
            .iter()
            .find(|r| r.is_full_sync())
            .map(|r| r.end_ts)
    }

    /// Start of the oldest full-sync range that was updated at or after `since`.
    pub fn oldest_full_sync_date(&self, since: Timestamp) -> Option<Timestamp> {
        self.ranges
            .iter()
            .rev()
            .find(|r| r.provenance.fresh_since(since))
            .map(|r| r.start_ts)
    }

    /// Whether the newest full sync covers the day `now` falls in.
    pub fn synced_to_today(&self, now: Timestamp) -> bool {
        self.newest_full_sync_date()
            .map_or(false, |end| end + DAY_MILLIS >= now)
    }

    /// Whether the oldest full sync reaches back to `oldest_sync_date`.
    pub fn synced_to_dawn_of_time(&self, oldest_sync_date: Timestamp) -> bool {
        self.ranges
            .last()
            .filter(|r| r.is_full_sync())
            .map_or(false, |r| r.start_ts <= oldest_sync_date)
    }

    /// Extend the oldest full-sync range back to `oldest_sync_date`.
    pub fn mark_synced_to_dawn_of_time(&mut self, oldest_sync_date: Timestamp) -> bool {
        match self.ranges.last_mut() {
            Some(last) if last.is_full_sync() => {
                last.start_ts = oldest_sync_date;
                true
            }
            _ => false,
        }
    }

    /// Undo a dawn-of-time mark by pulling the oldest range's start up to `start`.
    pub fn clear_synced_to_dawn_of_time(&mut self, oldest_sync_date: Timestamp, start: Timestamp) {
        if let Some(last) = self.ranges.last_mut() {
            if last.start_ts <= oldest_sync_date && start < last.end_ts {
                last.start_ts = start;
            }
        }
    }

    /// Last update time of the range at `index`, if it was a full sync.
    pub fn updated_at(&self, index: usize) -> Option<Timestamp> {
        self.ranges.get(index).and_then(|r| r.provenance.updated())
    }

    pub fn into_ranges(self) -> Vec<AccuracyRange> {
        self.ranges
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const JAN1: Timestamp = 1_704_067_200_000; // 2024-01-01

    fn day(n: i64) -> Timestamp {
        JAN1 + (n - 1) * DAY_MILLIS
    }

    fn full(updated: Timestamp) -> Provenance {
        Provenance::full(None, updated)
    }

    fn spans(table: &AccuracyTable) -> Vec<(Timestamp, Timestamp)> {
        table.ranges().iter().map(|r| (r.start_ts, r.end_ts)).collect()
    }

    #[test]
    fn test_mark_into_empty_and_reject_inverted() -> Result<()> {
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(1), day(10), full(100))?;
        assert_eq!(spans(&table), vec![(day(1), day(10))]);

        assert!(matches!(
            table.mark_sync_range(day(5), day(2), full(100)),
            Err(Error::InvalidRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_mark_merges_identical_neighbors() -> Result<()> {
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(1), day(10), full(100))?;
        table.mark_sync_range(day(10), day(20), full(100))?;
        assert_eq!(spans(&table), vec![(day(1), day(20))]);

        // A different provenance touching the old edge stays separate.
        table.mark_sync_range(day(0), day(1), full(200))?;
        assert_eq!(spans(&table), vec![(day(1), day(20)), (day(0), day(1))]);
        Ok(())
    }

    #[test]
    fn test_mark_splits_boundaries() -> Result<()> {
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(1), day(20), full(100))?;
        table.mark_sync_range(day(5), day(10), full(200))?;
        assert_eq!(
            spans(&table),
            vec![(day(10), day(20)), (day(5), day(10)), (day(1), day(5))]
        );
        assert_eq!(table.updated_at(0), Some(100));
        assert_eq!(table.updated_at(1), Some(200));
        assert_eq!(table.updated_at(2), Some(100));

        // Re-marking the whole span with one provenance collapses it again.
        table.mark_sync_range(day(1), day(20), full(300))?;
        assert_eq!(spans(&table), vec![(day(1), day(20))]);
        Ok(())
    }

    #[test]
    fn test_mark_covering_several() -> Result<()> {
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(15), day(20), full(1))?;
        table.mark_sync_range(day(8), day(12), full(2))?;
        table.mark_sync_range(day(1), day(5), full(3))?;
        assert_eq!(table.len(), 3);

        table.mark_sync_range(day(3), day(17), full(4))?;
        assert_eq!(
            spans(&table),
            vec![(day(17), day(20)), (day(3), day(17)), (day(1), day(3))]
        );
        Ok(())
    }

    #[test]
    fn test_partial_provenance_is_tracked() -> Result<()> {
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(1), day(5), Provenance::Partial)?;
        table.mark_sync_range(day(5), day(9), Provenance::Partial)?;
        assert_eq!(spans(&table), vec![(day(1), day(9))]);
        assert_eq!(table.newest_full_sync_date(), None);
        Ok(())
    }

    #[test]
    fn test_coverage_residual() -> Result<()> {
        let t = day(30);
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(1), day(10), full(t))?;

        let residual = table.check_coverage_needing_refresh(day(5), day(15), DAY_MILLIS, t + 1000);
        assert_eq!(residual, Some((day(10), day(15))));

        // Same answer the second time.
        let again = table.check_coverage_needing_refresh(day(5), day(15), DAY_MILLIS, t + 1000);
        assert_eq!(again, residual);

        table.mark_sync_range(day(5), day(15), full(t + 1000))?;
        let after = table.check_coverage_needing_refresh(day(5), day(15), DAY_MILLIS, t + 2000);
        assert_eq!(after, None);
        Ok(())
    }

    #[test]
    fn test_coverage_ignores_stale_and_gaps() -> Result<()> {
        let t = day(30);
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(1), day(10), full(t - 3 * DAY_MILLIS))?;
        assert_eq!(
            table.check_coverage_needing_refresh(day(2), day(8), DAY_MILLIS, t),
            Some((day(2), day(8)))
        );

        table.mark_sync_range(day(12), day(20), full(t))?;
        // Fresh newest edge shrinks the end; the gap stops further shrinking.
        assert_eq!(
            table.check_coverage_needing_refresh(day(11), day(18), DAY_MILLIS, t),
            Some((day(11), day(12)))
        );
        // Nothing overlapping at all.
        assert_eq!(
            table.check_coverage_needing_refresh(day(40), day(41), DAY_MILLIS, t),
            Some((day(40), day(41)))
        );
        Ok(())
    }

    #[test]
    fn test_truncate_before() -> Result<()> {
        let mut table = AccuracyTable::default();
        table.mark_sync_range(day(15), day(20), full(1))?;
        table.mark_sync_range(day(8), day(12), full(2))?;
        table.mark_sync_range(day(1), day(5), full(3))?;

        table.truncate_before(day(10));
        assert_eq!(spans(&table), vec![(day(15), day(20)), (day(10), day(12))]);

        table.truncate_before(day(13));
        assert_eq!(spans(&table), vec![(day(15), day(20))]);

        // A cut right on an exclusive end leaves nothing behind for that range.
        table.truncate_before(day(20));
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn test_sync_dates() -> Result<()> {
        let oldest = crate::config::OLDEST_SYNC_DATE;
        let mut table = AccuracyTable::default();
        assert!(!table.synced_to_today(day(10)));
        assert!(!table.mark_synced_to_dawn_of_time(oldest));

        table.mark_sync_range(day(3), day(10), full(day(10)))?;
        assert_eq!(table.newest_full_sync_date(), Some(day(10)));
        assert_eq!(table.oldest_full_sync_date(0), Some(day(3)));
        assert_eq!(table.oldest_full_sync_date(day(11)), None);
        assert!(table.synced_to_today(day(10) + 5));
        assert!(!table.synced_to_today(day(12)));

        assert!(!table.synced_to_dawn_of_time(oldest));
        assert!(table.mark_synced_to_dawn_of_time(oldest));
        assert!(table.synced_to_dawn_of_time(oldest));

        table.clear_synced_to_dawn_of_time(oldest, day(3));
        assert!(!table.synced_to_dawn_of_time(oldest));
        assert_eq!(spans(&table), vec![(day(3), day(10))]);
        Ok(())
    }
}
