// ABOUTME: Task planner - splits one overall scan range into per-window watermarks
// ABOUTME: Gap-free key tiling, read-delay shifted time windows and full-load interval alignment

use chrono::Duration;

use crate::catalog::ScanMode;
use crate::watermark::{shift_saturating, TimeRange, Watermark};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    /// Rows are read for this window.
    Scan,
    /// Nothing to read; the completed watermark is the planned one.
    NoData,
}

/// One sub-window of a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlannedTask {
    pub range: TimeRange,
    pub watermark: Watermark,
    pub kind: TaskKind,
}

impl PlannedTask {
    fn scan(range: TimeRange, watermark: Watermark) -> Self {
        Self {
            range,
            watermark,
            kind: TaskKind::Scan,
        }
    }

    fn no_data(range: TimeRange, watermark: Watermark) -> Self {
        Self {
            range,
            watermark,
            kind: TaskKind::NoData,
        }
    }

    pub fn is_scan(&self) -> bool {
        self.kind == TaskKind::Scan
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TaskPlanner {
    scan_mode: ScanMode,
    read_delay_secs: i64,
    full_load_interval: Option<Duration>,
}

impl TaskPlanner {
    pub fn new(
        scan_mode: ScanMode,
        read_delay_secs: i64,
        full_load_interval: Option<Duration>,
    ) -> Self {
        Self {
            scan_mode,
            read_delay_secs,
            full_load_interval,
        }
    }

    /// Plan the `wanted` windows of a batch whose first `completed_count`
    /// windows already ran.
    ///
    /// # Arguments
    ///
    /// * `overall` - The discovered range of the whole batch
    /// * `completed_count` - Windows of this batch finished in earlier calls
    /// * `wanted` - Scheduler time ranges to plan, in order
    ///
    /// # Returns
    ///
    /// One task per wanted range, in the same order.
    pub fn plan(
        &self,
        overall: &Watermark,
        completed_count: usize,
        wanted: &[TimeRange],
    ) -> Vec<PlannedTask> {
        let tasks = match self.scan_mode {
            ScanMode::FullLoad => self.plan_full_load(overall, wanted),
            ScanMode::IncrementOnly => plan_increment(overall, completed_count, wanted),
            ScanMode::TimeOnly | ScanMode::IncrementAndTime => {
                self.plan_time(overall, completed_count, wanted)
            }
        };
        tracing::debug!(
            "Planned {} window(s) for {:?} from {:?}",
            tasks.len(),
            self.scan_mode,
            overall
        );
        tasks
    }

    fn plan_full_load(&self, overall: &Watermark, wanted: &[TimeRange]) -> Vec<PlannedTask> {
        let interval_millis = self
            .full_load_interval
            .map(|interval| interval.num_milliseconds())
            .unwrap_or(0);
        wanted
            .iter()
            .map(|range| {
                let start_millis = range.inclusive_start_time.timestamp_millis();
                if interval_millis > 0 && start_millis % interval_millis != 0 {
                    return PlannedTask::no_data(*range, *overall);
                }
                let watermark =
                    Watermark::new(0, 0, range.inclusive_start_time, range.exclusive_end_time);
                PlannedTask::scan(*range, watermark)
            })
            .collect()
    }

    fn plan_time(
        &self,
        overall: &Watermark,
        completed_count: usize,
        wanted: &[TimeRange],
    ) -> Vec<PlannedTask> {
        // Discovery found nothing after the previous run.
        let nothing_new = overall.end_time() <= overall.start_time();
        wanted
            .iter()
            .enumerate()
            .map(|(i, range)| {
                // The first window of a fresh batch starts where the previous
                // run ended so nothing between runs is lost.
                let start_time = if i == 0 && completed_count == 0 {
                    overall.start_time()
                } else {
                    shift_saturating(range.inclusive_start_time, -self.read_delay_secs)
                };
                let end_time = shift_saturating(range.exclusive_end_time, -self.read_delay_secs);
                let watermark = Watermark::new(
                    overall.inclusive_start(),
                    overall.exclusive_end(),
                    start_time,
                    end_time,
                );
                if nothing_new {
                    PlannedTask::no_data(*range, watermark)
                } else {
                    PlannedTask::scan(*range, watermark)
                }
            })
            .collect()
    }

    /// Starting watermark for a new shard layout.
    pub fn reshard(previous: &[Watermark]) -> Watermark {
        Watermark::merge_for_reshard(previous)
    }
}

/// Key bounds of task `index` out of `task_count` over `overall`.
fn increment_bounds(overall: &Watermark, index: usize, task_count: usize) -> (i64, i64) {
    let start = i128::from(overall.inclusive_start());
    let range = i128::from(overall.item_count());
    let count = task_count as i128;
    let lower = start + (index as i128 * range) / count;
    let upper = if index + 1 == task_count {
        i128::from(overall.exclusive_end())
    } else {
        start + ((index as i128 + 1) * range) / count
    };
    // Both bounds lie within [inclusive_start, exclusive_end].
    (lower as i64, upper as i64)
}

fn plan_increment(
    overall: &Watermark,
    completed_count: usize,
    wanted: &[TimeRange],
) -> Vec<PlannedTask> {
    let task_count = completed_count + wanted.len();
    if overall.items_per_task(task_count as i64) == 0.0 {
        return wanted
            .iter()
            .map(|range| PlannedTask::no_data(*range, *overall))
            .collect();
    }
    wanted
        .iter()
        .enumerate()
        .map(|(i, range)| {
            let (lower, upper) = increment_bounds(overall, completed_count + i, task_count);
            let watermark = overall.with_keys(lower, upper);
            if lower == upper {
                PlannedTask::no_data(*range, watermark)
            } else {
                PlannedTask::scan(*range, watermark)
            }
        })
        .collect()
}
