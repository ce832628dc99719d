//! Time-based chunking of history entries
//!
//! Partitions a list of [`HistoryEntry`] values into chronologically ordered,
//! non-overlapping [`Chunk`]s, one per model call.
//!
//! Two sources of boundaries:
//! - **Supplied ranges** (from a heuristic or a model pass): one chunk per range
//! - **Half-day fallback**: entries no range captured are grouped by local
//!   calendar day and half (`00:00–11:59:59.999`, `12:00–23:59:59.999`)
//!
//! ```text
//! items ──► supplied ranges ──► covered ──────────────► range chunks ──┐
//!                    │                                                  ├─► sort by start ─► annotate
//!                    └────────► uncovered ─► half_day_partition ─► fallback chunks ──┘
//! ```
//!
//! Every entry with a defined timestamp lands in exactly one chunk (when the
//! fallback is allowed); entries without a timestamp are dropped. The output is
//! a pure function of the input.

use chrono::{DateTime, Duration, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{Chunk, HistoryEntry, TimeRange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Half {
    Morning,
    Afternoon,
}

/// Local calendar half-day a timestamp belongs to. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct HalfDay {
    date: NaiveDate,
    half: Half,
}

impl HalfDay {
    fn of<Tz: TimeZone>(ts: DateTime<Utc>, tz: &Tz) -> Self {
        let local = ts.with_timezone(tz).naive_local();
        let half = if local.hour() < 12 {
            Half::Morning
        } else {
            Half::Afternoon
        };
        Self {
            date: local.date(),
            half,
        }
    }

    fn range<Tz: TimeZone>(&self, tz: &Tz) -> TimeRange {
        let midnight = self.date.and_time(NaiveTime::MIN);
        let start = match self.half {
            Half::Morning => midnight,
            Half::Afternoon => midnight + Duration::hours(12),
        };
        let end = start + Duration::hours(12);
        TimeRange::new(resolve_local(tz, start), resolve_local(tz, end))
    }
}

/// Map a local wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; times inside a
/// DST gap move forward by an hour.
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}

/// Group timestamps into half-day buckets in the local timezone.
pub fn half_day_partition(timestamps: &[DateTime<Utc>]) -> Vec<TimeRange> {
    half_day_partition_in(timestamps, &Local)
}

/// Group timestamps into half-day buckets in `tz`.
///
/// Only non-empty buckets are returned, in ascending order, regardless of input
/// order. Duplicates collapse into the same bucket.
pub fn half_day_partition_in<Tz: TimeZone>(timestamps: &[DateTime<Utc>], tz: &Tz) -> Vec<TimeRange> {
    timestamps
        .iter()
        .map(|ts| HalfDay::of(*ts, tz))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|bucket| bucket.range(tz))
        .collect()
}

/// Chunk `items` using the local timezone for the fallback partition.
pub fn chunk(items: &[HistoryEntry], ranges: &[TimeRange], allow_fallback: bool) -> Vec<Chunk> {
    chunk_in(items, ranges, allow_fallback, &Local)
}

/// Chunk `items` by the supplied `ranges`, falling back to half-day buckets in `tz`.
///
/// - An entry inside several overlapping ranges goes to the first one listed.
/// - Ranges that capture nothing produce no chunk.
/// - With `allow_fallback = false`, entries outside every range are dropped.
pub fn chunk_in<Tz: TimeZone>(
    items: &[HistoryEntry],
    ranges: &[TimeRange],
    allow_fallback: bool,
    tz: &Tz,
) -> Vec<Chunk> {
    let mut chunks = Vec::new();
    let mut uncovered: Vec<(DateTime<Utc>, &HistoryEntry)> = Vec::new();

    if ranges.is_empty() {
        uncovered.extend(items.iter().filter_map(|i| i.visited_at.map(|ts| (ts, i))));
    } else {
        let mut per_range: Vec<Vec<&HistoryEntry>> = vec![Vec::new(); ranges.len()];
        for item in items {
            let Some(ts) = item.visited_at else {
                continue;
            };
            match ranges.iter().position(|r| r.contains(ts)) {
                Some(idx) => per_range[idx].push(item),
                None => uncovered.push((ts, item)),
            }
        }

        for (range, members) in ranges.iter().zip(per_range) {
            if members.is_empty() {
                continue;
            }
            chunks.push(new_chunk(members, *range, false));
        }
    }

    if allow_fallback && !uncovered.is_empty() {
        chunks.extend(fallback_chunks(uncovered, tz));
    } else if !uncovered.is_empty() {
        tracing::debug!(
            dropped = uncovered.len(),
            "Entries outside supplied ranges dropped (fallback disabled)"
        );
    }

    chunks.sort_by_key(|c| c.start);
    annotate(&mut chunks);
    chunks
}

fn fallback_chunks<Tz: TimeZone>(uncovered: Vec<(DateTime<Utc>, &HistoryEntry)>, tz: &Tz) -> Vec<Chunk> {
    let mut buckets: BTreeMap<HalfDay, Vec<&HistoryEntry>> = BTreeMap::new();
    for (ts, item) in uncovered {
        buckets.entry(HalfDay::of(ts, tz)).or_default().push(item);
    }

    buckets
        .into_iter()
        .map(|(bucket, members)| new_chunk(members, bucket.range(tz), true))
        .collect()
}

fn new_chunk(members: Vec<&HistoryEntry>, range: TimeRange, is_fallback: bool) -> Chunk {
    let mut items: Vec<HistoryEntry> = members.into_iter().cloned().collect();
    items.sort_by_key(|i| i.visited_at);
    Chunk {
        items,
        start: range.start,
        end: range.end,
        index: 0,
        total_chunks: 0,
        is_fallback,
    }
}

fn annotate(chunks: &mut [Chunk]) {
    let total = chunks.len();
    for (index, chunk) in chunks.iter_mut().enumerate() {
        chunk.index = index;
        chunk.total_chunks = total;
    }
}

/// Split chunks whose estimated size exceeds `budget` tokens.
///
/// Sub-chunks are consecutive in time: the first keeps the original start, the
/// last keeps the original end, and inner boundaries sit at the first visit of
/// the following sub-chunk. Entries sharing a timestamp are never separated,
/// so a single oversized instant stays in one chunk.
pub fn enforce_token_budget<F>(chunks: Vec<Chunk>, budget: usize, measure: F) -> Vec<Chunk>
where
    F: Fn(&HistoryEntry) -> usize,
{
    let mut out = Vec::with_capacity(chunks.len());

    for chunk in chunks {
        let total: usize = chunk.items.iter().map(&measure).sum();
        if total <= budget || chunk.items.len() <= 1 {
            out.push(chunk);
            continue;
        }

        let mut groups: Vec<Vec<HistoryEntry>> = Vec::new();
        let mut current: Vec<HistoryEntry> = Vec::new();
        let mut used = 0usize;
        for item in chunk.items {
            let cost = measure(&item);
            let same_instant = current
                .last()
                .map(|last: &HistoryEntry| last.visited_at == item.visited_at)
                .unwrap_or(false);
            if !current.is_empty() && used + cost > budget && !same_instant {
                groups.push(std::mem::take(&mut current));
                used = 0;
            }
            used += cost;
            current.push(item);
        }
        if !current.is_empty() {
            groups.push(current);
        }

        let starts: Vec<DateTime<Utc>> = groups
            .iter()
            .enumerate()
            .map(|(i, group)| {
                if i == 0 {
                    chunk.start
                } else {
                    group[0].visited_at.unwrap_or(chunk.start)
                }
            })
            .collect();

        tracing::debug!(
            original_start = %chunk.start,
            pieces = groups.len(),
            estimated_tokens = total,
            budget,
            "Split oversized chunk"
        );

        let last = groups.len() - 1;
        for (i, items) in groups.into_iter().enumerate() {
            let end = if i == last { chunk.end } else { starts[i + 1] };
            out.push(Chunk {
                items,
                start: starts[i],
                end,
                index: 0,
                total_chunks: 0,
                is_fallback: chunk.is_fallback,
            });
        }
    }

    annotate(&mut out);
    out
}

/// Human-readable label for progress reporting, in the local timezone.
pub fn describe(chunk: &Chunk) -> String {
    describe_in(chunk, &Local)
}

pub fn describe_in<Tz: TimeZone>(chunk: &Chunk, tz: &Tz) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let start = chunk.start.with_timezone(tz);
    let end = chunk.end.with_timezone(tz);
    let pages = chunk.items.len();
    let noun = if pages == 1 { "page" } else { "pages" };
    format!(
        "{} {}–{} ({} {})",
        start.format("%a %b %-d"),
        start.format("%H:%M"),
        end.format("%H:%M"),
        pages,
        noun
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0).unwrap()
    }

    fn entry(url: &str, ts: DateTime<Utc>) -> HistoryEntry {
        HistoryEntry::new(url, url, ts)
    }

    fn undated(url: &str) -> HistoryEntry {
        HistoryEntry {
            url: url.to_string(),
            title: String::new(),
            visited_at: None,
            visit_count: 1,
        }
    }

    fn urls(chunk: &Chunk) -> Vec<&str> {
        chunk.items.iter().map(|i| i.url.as_str()).collect()
    }

    // ============================================
    // Half-day partition
    // ============================================

    #[test]
    fn test_morning_bucket() {
        let ranges = half_day_partition_in(&[at(15, 9, 0)], &Utc);
        assert_eq!(ranges, vec![TimeRange::new(at(15, 0, 0), at(15, 12, 0))]);
    }

    #[test]
    fn test_afternoon_bucket() {
        let ranges = half_day_partition_in(&[at(15, 15, 0)], &Utc);
        assert_eq!(ranges, vec![TimeRange::new(at(15, 12, 0), at(16, 0, 0))]);
    }

    #[test]
    fn test_both_halves_in_order() {
        let ranges = half_day_partition_in(&[at(15, 15, 0), at(15, 9, 0)], &Utc);
        assert_eq!(
            ranges,
            vec![
                TimeRange::new(at(15, 0, 0), at(15, 12, 0)),
                TimeRange::new(at(15, 12, 0), at(16, 0, 0)),
            ]
        );
    }

    #[test]
    fn test_noon_belongs_to_afternoon() {
        let just_before = at(15, 11, 59) + Duration::milliseconds(59_999);
        let ranges = half_day_partition_in(&[at(15, 12, 0), just_before], &Utc);
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].end, at(15, 12, 0));
        assert_eq!(ranges[1].start, at(15, 12, 0));
    }

    #[test]
    fn test_duplicates_collapse() {
        let ts = at(15, 9, 0);
        let ranges = half_day_partition_in(&[ts, ts, ts, at(15, 10, 30)], &Utc);
        assert_eq!(ranges.len(), 1);
    }

    #[test]
    fn test_partition_respects_timezone() {
        // 23:00 UTC on Jan 15 is 08:00 on Jan 16 in UTC+9
        let tz = chrono::FixedOffset::east_opt(9 * 3600).unwrap();
        let ranges = half_day_partition_in(&[at(15, 23, 0)], &tz);
        assert_eq!(ranges, vec![TimeRange::new(at(15, 15, 0), at(16, 3, 0))]);
    }

    #[test]
    fn test_partition_empty() {
        assert!(half_day_partition_in(&[], &Utc).is_empty());
    }

    // ============================================
    // Chunking
    // ============================================

    #[test]
    fn test_four_entries_two_fallback_chunks() {
        let items = vec![
            entry("a", at(15, 9, 0)),
            entry("b", at(15, 11, 0)),
            entry("c", at(15, 14, 0)),
            entry("d", at(15, 15, 0)),
        ];
        let chunks = chunk_in(&items, &[], true, &Utc);

        assert_eq!(chunks.len(), 2);
        assert_eq!(urls(&chunks[0]), vec!["a", "b"]);
        assert_eq!(urls(&chunks[1]), vec!["c", "d"]);
        assert!(chunks.iter().all(|c| c.is_fallback));
        assert_eq!(chunks[0].start, at(15, 0, 0));
        assert_eq!(chunks[1].end, at(16, 0, 0));
        assert_eq!((chunks[1].index, chunks[1].total_chunks), (1, 2));
    }

    #[test]
    fn test_supplied_ranges_with_uncovered_fallback() {
        let items = vec![
            entry("a", at(15, 9, 0)),
            entry("b", at(15, 9, 30)),
            entry("c", at(15, 18, 0)),
            undated("d"),
        ];
        let ranges = vec![TimeRange::new(at(15, 8, 0), at(15, 10, 0))];
        let chunks = chunk_in(&items, &ranges, true, &Utc);

        assert_eq!(chunks.len(), 2);
        assert!(!chunks[0].is_fallback);
        assert_eq!(urls(&chunks[0]), vec!["a", "b"]);
        assert_eq!(chunks[0].range(), ranges[0]);
        assert!(chunks[1].is_fallback);
        assert_eq!(urls(&chunks[1]), vec!["c"]);
    }

    #[test]
    fn test_range_end_is_exclusive() {
        let items = vec![entry("edge", at(15, 10, 0))];
        let ranges = vec![TimeRange::new(at(15, 8, 0), at(15, 10, 0))];
        let chunks = chunk_in(&items, &ranges, true, &Utc);

        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_fallback);
    }

    #[test]
    fn test_overlapping_ranges_first_wins() {
        let items = vec![entry("a", at(15, 9, 0))];
        let ranges = vec![
            TimeRange::new(at(15, 8, 0), at(15, 10, 0)),
            TimeRange::new(at(15, 8, 30), at(15, 9, 30)),
        ];
        let chunks = chunk_in(&items, &ranges, true, &Utc);

        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].range(), ranges[0]);
    }

    #[test]
    fn test_fallback_disabled_drops_uncovered() {
        let items = vec![entry("a", at(15, 9, 0)), entry("b", at(15, 20, 0))];
        let ranges = vec![TimeRange::new(at(15, 8, 0), at(15, 10, 0))];
        let chunks = chunk_in(&items, &ranges, false, &Utc);

        assert_eq!(chunks.len(), 1);
        assert_eq!(urls(&chunks[0]), vec!["a"]);
    }

    #[test]
    fn test_every_dated_entry_in_exactly_one_chunk() {
        let mut items = Vec::new();
        for day in 10..14 {
            for hour in [1, 7, 11, 12, 13, 23] {
                items.push(entry(&format!("{day}-{hour}"), at(day, hour, 5)));
            }
        }
        items.push(undated("nowhere"));
        let ranges = vec![
            TimeRange::new(at(11, 6, 0), at(11, 14, 0)),
            TimeRange::new(at(12, 22, 0), at(13, 2, 0)),
        ];
        let chunks = chunk_in(&items, &ranges, true, &Utc);

        let mut seen: Vec<&str> = chunks.iter().flat_map(urls).collect();
        seen.sort();
        let mut expected: Vec<&str> = items
            .iter()
            .filter(|i| i.visited_at.is_some())
            .map(|i| i.url.as_str())
            .collect();
        expected.sort();
        assert_eq!(seen, expected);

        for pair in chunks.windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
    }

    #[test]
    fn test_chunking_is_deterministic() {
        let items = vec![
            entry("c", at(15, 14, 0)),
            entry("a", at(15, 9, 0)),
            entry("b", at(16, 11, 0)),
        ];
        assert_eq!(chunk_in(&items, &[], true, &Utc), chunk_in(&items, &[], true, &Utc));
    }

    #[test]
    fn test_only_undated_entries_yield_nothing() {
        let chunks = chunk_in(&[undated("x"), undated("y")], &[], true, &Utc);
        assert!(chunks.is_empty());
    }

    // ============================================
    // Token budget
    // ============================================

    #[test]
    fn test_budget_splits_into_consecutive_pieces() {
        let items: Vec<_> = (0..6).map(|m| entry(&format!("p{m}"), at(15, 9, m * 5))).collect();
        let chunks = chunk_in(&items, &[], true, &Utc);
        let split = enforce_token_budget(chunks, 20, |_| 10);

        assert_eq!(split.len(), 3);
        assert_eq!(split[0].start, at(15, 0, 0));
        assert_eq!(split[0].end, at(15, 9, 10));
        assert_eq!(split[1].start, at(15, 9, 10));
        assert_eq!(split[2].end, at(15, 12, 0));
        assert!(split.iter().all(|c| c.is_fallback && c.total_chunks == 3));
        assert_eq!(split.iter().map(|c| c.items.len()).sum::<usize>(), 6);
    }

    #[test]
    fn test_budget_keeps_same_instant_together() {
        let ts = at(15, 9, 0);
        let items = vec![entry("a", ts), entry("b", ts), entry("c", ts)];
        let chunks = chunk_in(&items, &[], true, &Utc);
        let split = enforce_token_budget(chunks, 5, |_| 10);

        assert_eq!(split.len(), 1);
        assert_eq!(split[0].items.len(), 3);
    }

    #[test]
    fn test_describe_chunk() {
        let items = vec![entry("a", at(15, 9, 0))];
        let chunks = chunk_in(&items, &[], true, &Utc);
        assert_eq!(describe_in(&chunks[0], &Utc), "Mon Jan 15 00:00–12:00 (1 page)");
    }
}
