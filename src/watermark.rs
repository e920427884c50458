// ABOUTME: Watermark value type - the durable progress record of a table scan
// ABOUTME: Half-open key range plus half-open time range with saturating time arithmetic

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// The Unix epoch, the lower bound for every watermark time.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

fn clamp_to_epoch(time: DateTime<Utc>) -> DateTime<Utc> {
    time.max(epoch())
}

/// Shift `time` by `seconds`, saturating at the representable range instead of failing.
pub fn shift_saturating(time: DateTime<Utc>, seconds: i64) -> DateTime<Utc> {
    let shifted = Duration::try_seconds(seconds).and_then(|delta| time.checked_add_signed(delta));
    match shifted {
        Some(shifted) => shifted,
        None => {
            let clamped = if seconds >= 0 {
                DateTime::<Utc>::MAX_UTC
            } else {
                DateTime::<Utc>::MIN_UTC
            };
            tracing::warn!(
                "Shifting {} by {} seconds overflows, clamping to {}",
                time,
                seconds,
                clamped
            );
            clamped
        }
    }
}

/// The earliest instant strictly after `time` that a bound parameter keeps:
/// one microsecond later, the finest resolution PostgreSQL stores.
pub fn just_after(time: DateTime<Utc>) -> DateTime<Utc> {
    time.checked_add_signed(Duration::microseconds(1)).unwrap_or(time)
}

/// A scheduler-owned time slice `[inclusive_start_time, exclusive_end_time)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub inclusive_start_time: DateTime<Utc>,
    pub exclusive_end_time: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(inclusive_start_time: DateTime<Utc>, exclusive_end_time: DateTime<Utc>) -> Self {
        Self {
            inclusive_start_time,
            exclusive_end_time,
        }
    }

    /// Split `[start, end)` into consecutive ranges of `step`, the last one cut at `end`.
    pub fn split(start: DateTime<Utc>, end: DateTime<Utc>, step: Duration) -> Vec<TimeRange> {
        let mut ranges = Vec::new();
        if step <= Duration::zero() {
            return ranges;
        }
        let mut cursor = start;
        while cursor < end {
            let next = cursor
                .checked_add_signed(step)
                .map_or(end, |next| next.min(end));
            ranges.push(TimeRange::new(cursor, next));
            cursor = next;
        }
        ranges
    }
}

/// Progress boundary of a scan: key range `[inclusive_start, exclusive_end)` and
/// time range `[start_time, end_time)`.
///
/// Both key bounds are zero when the table has no increment column. Times never
/// precede the Unix epoch and the upper bounds never precede the lower bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "WatermarkFields")]
pub struct Watermark {
    inclusive_start: i64,
    exclusive_end: i64,
    start_time: DateTime<Utc>,
    end_time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct WatermarkFields {
    inclusive_start: i64,
    exclusive_end: i64,
    #[serde(default)]
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    end_time: Option<DateTime<Utc>>,
}

impl From<WatermarkFields> for Watermark {
    fn from(fields: WatermarkFields) -> Self {
        Watermark::new(
            fields.inclusive_start,
            fields.exclusive_end,
            fields.start_time.unwrap_or_else(epoch),
            fields.end_time.unwrap_or_else(epoch),
        )
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Watermark::keys(0, 0)
    }
}

impl Watermark {
    pub fn new(
        inclusive_start: i64,
        exclusive_end: i64,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Self {
        let start_time = clamp_to_epoch(start_time);
        let end_time = clamp_to_epoch(end_time).max(start_time);
        Self {
            inclusive_start,
            exclusive_end: exclusive_end.max(inclusive_start),
            start_time,
            end_time,
        }
    }

    /// A key-only watermark with both times at the epoch.
    pub fn keys(inclusive_start: i64, exclusive_end: i64) -> Self {
        Watermark::new(inclusive_start, exclusive_end, epoch(), epoch())
    }

    pub fn inclusive_start(&self) -> i64 {
        self.inclusive_start
    }

    pub fn exclusive_end(&self) -> i64 {
        self.exclusive_end
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn end_time(&self) -> DateTime<Utc> {
        self.end_time
    }

    pub fn with_keys(&self, inclusive_start: i64, exclusive_end: i64) -> Self {
        Watermark::new(inclusive_start, exclusive_end, self.start_time, self.end_time)
    }

    pub fn with_times(&self, start_time: DateTime<Utc>, end_time: DateTime<Utc>) -> Self {
        Watermark::new(self.inclusive_start, self.exclusive_end, start_time, end_time)
    }

    pub fn item_count(&self) -> i64 {
        self.exclusive_end.saturating_sub(self.inclusive_start).max(0)
    }

    /// Proportional split size for `task_count` tasks. Zero for an empty key
    /// range or a non-positive task count.
    pub fn items_per_task(&self, task_count: i64) -> f64 {
        if task_count <= 0 {
            return 0.0;
        }
        self.item_count() as f64 / task_count as f64
    }

    /// Shift both time bounds by `seconds` (positive moves forward).
    ///
    /// Used to move between UTC and database-local time and to apply read
    /// delays. Saturates instead of failing; results below the epoch clamp to it.
    pub fn adjust_with_delay(&self, seconds: i64) -> Self {
        Watermark::new(
            self.inclusive_start,
            self.exclusive_end,
            shift_saturating(self.start_time, seconds),
            shift_saturating(self.end_time, seconds),
        )
    }

    /// Never regress below a previously completed watermark: upper bounds are
    /// raised to `previous`'s, and lower bounds start no earlier than where
    /// `previous` ended.
    pub fn limit_by_previous(&self, previous: &Watermark) -> Self {
        let exclusive_end = self.exclusive_end.max(previous.exclusive_end);
        let inclusive_start = self
            .inclusive_start
            .max(previous.exclusive_end)
            .min(exclusive_end);
        let end_time = self.end_time.max(previous.end_time);
        let start_time = self.start_time.max(previous.end_time).min(end_time);
        Watermark::new(inclusive_start, exclusive_end, start_time, end_time)
    }

    /// Merge completed watermarks of old shards into the starting point of a
    /// new shard: the most advanced key and time seen by any of them.
    pub fn merge_for_reshard(previous: &[Watermark]) -> Self {
        let max_end = previous.iter().map(|w| w.exclusive_end).max().unwrap_or(0);
        let max_time = previous
            .iter()
            .map(|w| w.end_time)
            .max()
            .unwrap_or_else(epoch);
        Watermark::new(max_end, max_end, max_time, max_time)
    }
}
