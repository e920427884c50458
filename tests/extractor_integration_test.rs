// ABOUTME: Integration tests for incremental extraction over a SQLite source
// ABOUTME: Covers discovery, window splitting, resume from completed watermarks and validation

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;
use table_window_extractor::config::properties;
use table_window_extractor::watermark::just_after;
use table_window_extractor::{
    Extractor, ScanMode, SourceConfig, SqlValue, TaskKind, TimeRange, Watermark, WatermarkStore,
};
use tempfile::TempDir;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Minute `m` past 09:00 UTC on the test day.
fn t(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2020, 9, 29, 9, 0, 0).unwrap() + Duration::minutes(minute)
}

/// Database-local text for a UTC instant, as SQLite stores it.
fn local_text(time: DateTime<Utc>, utc_offset_secs: i64) -> String {
    (time + Duration::seconds(utc_offset_secs))
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

fn create_database(ddl: &str) -> (TempDir, String) {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.db");
    let conn = rusqlite::Connection::open(&path).unwrap();
    conn.execute_batch(ddl).unwrap();
    let url = format!("sqlite:{}", path.display());
    (dir, url)
}

fn database_path(url: &str) -> &Path {
    Path::new(url.trim_start_matches("sqlite:"))
}

/// Insert rows 1..=9 stamped T1..T9, written in database-local time.
fn insert_events(url: &str, with_id: bool, utc_offset_secs: i64) {
    let conn = rusqlite::Connection::open(database_path(url)).unwrap();
    for minute in 1..=9 {
        let stamp = local_text(t(minute), utc_offset_secs);
        if with_id {
            conn.execute(
                "INSERT INTO events (id, name, updated_at) VALUES (?1, ?2, ?3)",
                rusqlite::params![minute, format!("row{}", minute), stamp],
            )
            .unwrap();
        } else {
            conn.execute(
                "INSERT INTO events (name, updated_at) VALUES (?1, ?2)",
                rusqlite::params![format!("row{}", minute), stamp],
            )
            .unwrap();
        }
    }
}

/// Drain every loader of a run: per-loader column values at `column` and
/// completed watermarks.
fn drain(
    extractor: &Extractor,
    info: &Watermark,
    completed_count: usize,
    wanted: &[TimeRange],
    column: usize,
) -> (Vec<Vec<SqlValue>>, Vec<Watermark>, Vec<TaskKind>) {
    let mut run = extractor
        .data_loaders(info, completed_count, wanted)
        .unwrap();
    let mut values = Vec::new();
    let mut completed = Vec::new();
    let mut kinds = Vec::new();
    while let Some(mut loader) = run.next_loader().unwrap() {
        let mut window = Vec::new();
        while let Some(row) = loader.next_row().unwrap() {
            window.push(row[column].clone());
        }
        assert_eq!(loader.rows_read(), window.len() as u64);
        values.push(window);
        completed.push(loader.completed_watermark());
        kinds.push(loader.task().kind);
    }
    run.close();
    (values, completed, kinds)
}

fn ints(values: &[SqlValue]) -> Vec<i64> {
    values.iter().map(|v| v.as_i64().unwrap()).collect()
}

fn names(values: &[SqlValue]) -> Vec<String> {
    values
        .iter()
        .map(|v| match v {
            SqlValue::Text(s) => s.clone(),
            other => panic!("expected text, got {:?}", other),
        })
        .collect()
}

#[test]
fn test_increment_and_time_windows_and_resume() {
    let (_dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    assert_eq!(extractor.table().scan_mode(), ScanMode::IncrementAndTime);
    assert_eq!(extractor.table().increment_column(), Some("id"));
    insert_events(&url, true, extractor.utc_offset_secs());

    // Rows at T2 with id >= 3, then everything after T2.
    let previous = Watermark::new(0, 3, t(2), t(2));
    let info = extractor
        .task_info(&previous, &TimeRange::new(t(2), t(9)))
        .unwrap();
    assert_eq!(info, Watermark::new(3, 9, t(2), t(9)));

    let wanted = [TimeRange::new(t(2), t(5)), TimeRange::new(t(5), t(9))];
    let (ids, completed, _) = drain(&extractor, &info, 0, &wanted, 0);
    assert_eq!(ints(&ids[0]), vec![3, 4]);
    assert_eq!(ints(&ids[1]), vec![5, 6, 7, 8]);
    assert_eq!(completed[0], Watermark::new(3, 5, t(2), t(4)));
    assert_eq!(completed[1], Watermark::new(3, 9, t(5), t(8)));

    // Resuming from the last completed window picks up only row 9.
    let next = extractor
        .task_info(&completed[1], &TimeRange::new(t(9), t(10)))
        .unwrap();
    assert_eq!(next, Watermark::new(9, 10, t(8), t(10)));
    let (ids, completed, _) = drain(&extractor, &next, 0, &[TimeRange::new(t(9), t(10))], 0);
    assert_eq!(ints(&ids[0]), vec![9]);
    assert_eq!(completed[0], Watermark::new(9, 10, t(8), t(9)));
    assert_eq!(extractor.pool().idle(), extractor.pool().size());
}

#[test]
fn test_increment_and_time_respects_read_delay() {
    let (_dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let config = SourceConfig::new(url.clone(), "events")
        .with_timestamp_columns(["updated_at"])
        .with_read_delay_secs(120);
    let extractor = Extractor::configure(config).unwrap();
    insert_events(&url, true, extractor.utc_offset_secs());

    // The scheduler asks up to T9; rows newer than T7 are not read yet.
    let info = extractor
        .task_info(&Watermark::default(), &TimeRange::new(t(0), t(9)))
        .unwrap();
    assert_eq!((info.inclusive_start(), info.exclusive_end()), (1, 7));

    let (ids, completed, _) = drain(&extractor, &info, 0, &[TimeRange::new(t(0), t(9))], 0);
    assert_eq!(ints(&ids[0]), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(completed[0].end_time(), t(6));
    assert_eq!(completed[0].exclusive_end(), 7);
}

#[test]
fn test_time_only_windows() {
    let (_dir, url) = create_database("CREATE TABLE events (name TEXT, updated_at DATETIME);");
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    assert_eq!(extractor.table().scan_mode(), ScanMode::TimeOnly);
    insert_events(&url, false, extractor.utc_offset_secs());

    let previous = Watermark::new(0, 0, t(2), t(2));
    let info = extractor
        .task_info(&previous, &TimeRange::new(t(2), t(9)))
        .unwrap();
    assert_eq!(info, Watermark::new(0, 0, t(2), t(9)));

    let wanted = [TimeRange::new(t(2), t(5)), TimeRange::new(t(5), t(9))];
    let (rows, completed, _) = drain(&extractor, &info, 0, &wanted, 0);
    assert_eq!(names(&rows[0]), vec!["row2", "row3", "row4"]);
    assert_eq!(names(&rows[1]), vec!["row5", "row6", "row7", "row8"]);
    assert_eq!(completed[1], Watermark::new(0, 0, t(5), just_after(t(8))));

    // Nothing newer than T8 before T9 keeps the previous end.
    let idle = extractor
        .task_info(&completed[1], &TimeRange::new(t(8), t(9)))
        .unwrap();
    assert_eq!(idle, Watermark::new(0, 0, just_after(t(8)), just_after(t(8))));
}

#[test]
fn test_time_only_resume_reads_each_row_once() {
    let (_dir, url) = create_database("CREATE TABLE events (name TEXT, updated_at DATETIME);");
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    let offset = extractor.utc_offset_secs();
    insert_events(&url, false, offset);

    let range = TimeRange::new(t(0), t(9));
    let info = extractor.task_info(&Watermark::default(), &range).unwrap();
    let (rows, completed, _) = drain(&extractor, &info, 0, &[range], 0);
    let expected: Vec<String> = (1..=8).map(|i| format!("row{}", i)).collect();
    assert_eq!(names(&rows[0]), expected);
    let mut previous = completed[0];
    assert_eq!(previous.end_time(), just_after(t(8)));

    // A late write stamped exactly T8 lands on the last timestamp read. It
    // sits before the stored end and is never read.
    let conn = rusqlite::Connection::open(database_path(&url)).unwrap();
    let insert = |name: &str, time: DateTime<Utc>| {
        conn.execute(
            "INSERT INTO events (name, updated_at) VALUES (?1, ?2)",
            rusqlite::params![name, local_text(time, offset)],
        )
        .unwrap();
    };
    insert("late", t(8));

    // Idle rounds neither query nor re-send row8.
    for round in 0..3 {
        let range = TimeRange::new(
            t(8) + Duration::seconds(round * 10),
            t(8) + Duration::seconds(round * 10 + 10),
        );
        let info = extractor.task_info(&previous, &range).unwrap();
        let (rows, completed, kinds) = drain(&extractor, &info, 0, &[range], 0);
        assert_eq!(kinds, vec![TaskKind::NoData], "round {}", round);
        assert!(rows[0].is_empty(), "round {} read {:?}", round, rows[0]);
        assert!(completed[0].end_time() >= previous.end_time());
        previous = completed[0];
    }

    insert("fresh", t(8) + Duration::seconds(50));
    let range = TimeRange::new(t(8) + Duration::seconds(30), t(9));
    let info = extractor.task_info(&previous, &range).unwrap();
    let (rows, completed, _) = drain(&extractor, &info, 0, &[range], 0);
    assert_eq!(names(&rows[0]), vec!["fresh"]);
    previous = completed[0];

    // Row 9 sits exactly on the previous exclusive end and is read once.
    let range = TimeRange::new(t(9), t(10));
    let info = extractor.task_info(&previous, &range).unwrap();
    let (rows, completed, _) = drain(&extractor, &info, 0, &[range], 0);
    assert_eq!(names(&rows[0]), vec!["row9"]);
    let info = extractor.task_info(&completed[0], &range).unwrap();
    let (rows, _, _) = drain(&extractor, &info, 0, &[range], 0);
    assert!(rows[0].is_empty());
}

#[test]
fn test_earliest_row_time_truncates_to_minute() {
    let (_dir, url) = create_database("CREATE TABLE events (name TEXT, updated_at DATETIME);");
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    assert_eq!(extractor.earliest_row_time().unwrap(), None);

    let conn = rusqlite::Connection::open(database_path(&url)).unwrap();
    let stamp = local_text(t(3) + Duration::seconds(42), extractor.utc_offset_secs());
    conn.execute(
        "INSERT INTO events (name, updated_at) VALUES ('late', ?1)",
        rusqlite::params![stamp],
    )
    .unwrap();
    assert_eq!(extractor.earliest_row_time().unwrap(), Some(t(3)));
}

#[test]
fn test_current_time_is_close_to_now() {
    let (_dir, url) = create_database("CREATE TABLE events (name TEXT, updated_at DATETIME);");
    let config = SourceConfig::new(url, "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    let now = extractor.current_time().unwrap();
    let drift = (now - Utc::now()).num_seconds().abs();
    assert!(drift < 120, "database clock is {}s away from now", drift);
}

#[test]
fn test_full_load_reads_on_interval_boundaries_only() {
    let (_dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let config = SourceConfig::new(url.clone(), "events").with_full_load_interval_minutes(5);
    let extractor = Extractor::configure(config).unwrap();
    assert_eq!(extractor.table().scan_mode(), ScanMode::FullLoad);
    insert_events(&url, true, extractor.utc_offset_secs());

    let previous = Watermark::new(0, 0, t(0), t(0));
    let info = extractor
        .task_info(&previous, &TimeRange::new(t(5), t(6)))
        .unwrap();
    let wanted = [TimeRange::new(t(5), t(6)), TimeRange::new(t(6), t(7))];
    let (ids, completed, kinds) = drain(&extractor, &info, 0, &wanted, 0);
    assert_eq!(kinds, vec![TaskKind::Scan, TaskKind::NoData]);
    assert_eq!(ints(&ids[0]), (1..=9).collect::<Vec<_>>());
    assert!(ids[1].is_empty());
    assert_eq!(completed[0], Watermark::new(0, 0, t(5), t(6)));
    assert_eq!(completed[1], info);
}

#[test]
fn test_empty_table_plans_no_data() {
    let (_dir, url) = create_database("CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT);");
    let extractor = Extractor::configure(SourceConfig::new(url, "events")).unwrap();
    assert_eq!(extractor.table().scan_mode(), ScanMode::IncrementOnly);

    let range = TimeRange::new(t(0), t(1));
    let info = extractor.task_info(&Watermark::default(), &range).unwrap();
    assert_eq!(info, Watermark::default());

    let (ids, completed, kinds) = drain(&extractor, &info, 0, &[range, range], 0);
    assert_eq!(kinds, vec![TaskKind::NoData, TaskKind::NoData]);
    assert!(ids.iter().all(Vec::is_empty));
    assert!(completed.iter().all(|w| *w == info));
}

#[test]
fn test_sample_reads_from_the_start() {
    let (_dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    insert_events(&url, true, extractor.utc_offset_secs());

    let sample = extractor.sample(3).unwrap();
    assert_eq!(sample.columns, vec!["id", "name", "updated_at"]);
    let ids: Vec<_> = sample.rows.iter().map(|r| r[0].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![1, 2, 3]);
}

#[test]
fn test_validate_reports_problems_by_property() {
    let (_dir, url) = create_database("CREATE TABLE events (name TEXT, updated_at DATETIME);");

    let missing_table = SourceConfig::new(url.clone(), "nope");
    let errors = Extractor::validate(&missing_table).unwrap();
    assert_eq!(errors[0].property, properties::TABLE_NAME);

    let bad_increment = SourceConfig::new(url.clone(), "events")
        .with_incrementing_column("missing")
        .with_timestamp_columns(["updated_at"]);
    let errors = Extractor::validate(&bad_increment).unwrap();
    assert!(errors
        .iter()
        .any(|e| e.property == properties::INCREMENTING_COLUMN));

    let not_a_time = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["name"]);
    let errors = Extractor::validate(&not_a_time).unwrap();
    assert!(errors
        .iter()
        .all(|e| e.property == properties::TIMESTAMP_COLUMNS));
    assert_eq!(errors.len(), 2);

    let nothing_to_bound = SourceConfig::new(url.clone(), "events");
    let errors = Extractor::validate(&nothing_to_bound).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].property, properties::TIMESTAMP_COLUMNS);

    let good = SourceConfig::new(url, "events").with_timestamp_columns(["updated_at"]);
    assert!(Extractor::validate(&good).unwrap().is_empty());
}

#[test]
fn test_validate_unreachable_database() {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite:{}", dir.path().join("absent.db").display());
    let errors = Extractor::validate(&SourceConfig::new(url, "events")).unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].property, properties::CONNECTION_STRING);
}

#[test]
fn test_watermarks_survive_restart() {
    let (dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let state_path = dir.path().join("state").join("watermarks.json");
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);

    let extractor = Extractor::configure(config.clone()).unwrap();
    insert_events(&url, true, extractor.utc_offset_secs());
    let mut store = WatermarkStore::load_or_new(&state_path, &url).unwrap();
    let range = TimeRange::new(t(0), t(5));
    let info = extractor
        .task_info(&store.resume_from(None, "events"), &range)
        .unwrap();
    let (ids, completed, _) = drain(&extractor, &info, 0, &[range], 0);
    store.record(None, "events", completed[0], ids[0].len() as u64);
    store.save(&state_path).unwrap();
    extractor.close();

    let extractor = Extractor::configure(config).unwrap();
    let store = WatermarkStore::load(&state_path).unwrap();
    let range = TimeRange::new(t(5), t(10));
    let info = extractor
        .task_info(&store.resume_from(None, "events"), &range)
        .unwrap();
    let (resumed, _, _) = drain(&extractor, &info, 0, &[range], 0);
    assert_eq!(ints(&ids[0]), vec![1, 2, 3, 4]);
    assert_eq!(ints(&resumed[0]), vec![5, 6, 7, 8, 9]);
}

#[test]
fn test_two_minute_windows_partition_rows_exactly() {
    let (_dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    insert_events(&url, true, extractor.utc_offset_secs());

    // Row 2 at T2 not consumed yet.
    let previous = Watermark::new(0, 2, t(2), t(2));
    let info = extractor
        .task_info(&previous, &TimeRange::new(t(2), t(9)))
        .unwrap();
    let wanted = TimeRange::split(t(2), t(9), Duration::minutes(2));
    assert_eq!(wanted.len(), 4);

    let (ids, completed, _) = drain(&extractor, &info, 0, &wanted, 0);
    let ids: Vec<Vec<i64>> = ids.iter().map(|w| ints(w)).collect();
    assert_eq!(ids, vec![vec![2, 3], vec![4, 5], vec![6, 7], vec![8]]);
    assert_eq!(completed[3].end_time(), t(8));
    assert_eq!(completed[3].exclusive_end(), 9);
}

#[test]
fn test_first_window_reaches_back_to_previous_run() {
    let (_dir, url) = create_database(
        "CREATE TABLE events (id INTEGER PRIMARY KEY, name TEXT, updated_at DATETIME);",
    );
    let config = SourceConfig::new(url.clone(), "events").with_timestamp_columns(["updated_at"]);
    let extractor = Extractor::configure(config).unwrap();
    insert_events(&url, true, extractor.utc_offset_secs());

    // The previous run stopped at T3; the scheduler resumes at T6.
    let previous = Watermark::new(0, 4, t(1), t(3));
    let info = extractor
        .task_info(&previous, &TimeRange::new(t(6), t(8)))
        .unwrap();
    assert_eq!(info, Watermark::new(4, 8, t(3), t(8)));

    let wanted = [TimeRange::new(t(6), t(7)), TimeRange::new(t(7), t(8))];
    let (ids, _, _) = drain(&extractor, &info, 0, &wanted, 0);
    assert_eq!(ints(&ids[0]), vec![4, 5, 6]);
    assert_eq!(ints(&ids[1]), vec![7]);

    // Continuing the same batch, the window starts at its own range.
    let (ids, _, _) = drain(&extractor, &info, 1, &wanted[1..], 0);
    assert_eq!(ints(&ids[0]), vec![7]);
}
