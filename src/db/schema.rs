//! Database schema definitions

/// The 12 demographic counter columns, in canonical order. Shared by the
/// three tables and by every query that reads or sums them.
pub const BUCKET_COLUMNS: [&str; 12] = [
    "male_0_9",
    "male_10_19",
    "male_20_29",
    "male_30_39",
    "male_40_49",
    "male_50_plus",
    "female_0_9",
    "female_10_19",
    "female_20_29",
    "female_30_39",
    "female_40_49",
    "female_50_plus",
];

/// `"male_0_9, male_10_19, ..."` for SELECT/INSERT column lists.
pub fn bucket_column_list() -> String {
    BUCKET_COLUMNS.join(", ")
}

/// `"COALESCE(SUM(male_0_9), 0) AS male_0_9, ..."` so empty result sets
/// decode as zeroed counters instead of NULLs.
pub fn bucket_sum_list() -> String {
    BUCKET_COLUMNS
        .map(|c| format!("COALESCE(SUM({c}), 0) AS {c}"))
        .join(", ")
}

/// `"male_0_9 = male_0_9 + excluded.male_0_9, ..."` for the
/// upsert-by-addition rollup writes.
pub fn bucket_additive_update_list() -> String {
    BUCKET_COLUMNS
        .map(|c| format!("{c} = {c} + excluded.{c}"))
        .join(", ")
}

pub const CREATE_DETECTIONS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS detections (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp BIGINT NOT NULL,            -- epoch millis UTC
    male_0_9 INTEGER NOT NULL DEFAULT 0,
    male_10_19 INTEGER NOT NULL DEFAULT 0,
    male_20_29 INTEGER NOT NULL DEFAULT 0,
    male_30_39 INTEGER NOT NULL DEFAULT 0,
    male_40_49 INTEGER NOT NULL DEFAULT 0,
    male_50_plus INTEGER NOT NULL DEFAULT 0,
    female_0_9 INTEGER NOT NULL DEFAULT 0,
    female_10_19 INTEGER NOT NULL DEFAULT 0,
    female_20_29 INTEGER NOT NULL DEFAULT 0,
    female_30_39 INTEGER NOT NULL DEFAULT 0,
    female_40_49 INTEGER NOT NULL DEFAULT 0,
    female_50_plus INTEGER NOT NULL DEFAULT 0,
    aggregated INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_DAILY_ROLLUPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS daily_rollups (
    date TEXT PRIMARY KEY,                -- YYYY-MM-DD (UTC)
    male_0_9 INTEGER NOT NULL DEFAULT 0,
    male_10_19 INTEGER NOT NULL DEFAULT 0,
    male_20_29 INTEGER NOT NULL DEFAULT 0,
    male_30_39 INTEGER NOT NULL DEFAULT 0,
    male_40_49 INTEGER NOT NULL DEFAULT 0,
    male_50_plus INTEGER NOT NULL DEFAULT 0,
    female_0_9 INTEGER NOT NULL DEFAULT 0,
    female_10_19 INTEGER NOT NULL DEFAULT 0,
    female_20_29 INTEGER NOT NULL DEFAULT 0,
    female_30_39 INTEGER NOT NULL DEFAULT 0,
    female_40_49 INTEGER NOT NULL DEFAULT 0,
    female_50_plus INTEGER NOT NULL DEFAULT 0
)
"#;

pub const CREATE_MONTHLY_ROLLUPS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS monthly_rollups (
    year INTEGER NOT NULL,
    month INTEGER NOT NULL,               -- 1..12
    male_0_9 INTEGER NOT NULL DEFAULT 0,
    male_10_19 INTEGER NOT NULL DEFAULT 0,
    male_20_29 INTEGER NOT NULL DEFAULT 0,
    male_30_39 INTEGER NOT NULL DEFAULT 0,
    male_40_49 INTEGER NOT NULL DEFAULT 0,
    male_50_plus INTEGER NOT NULL DEFAULT 0,
    female_0_9 INTEGER NOT NULL DEFAULT 0,
    female_10_19 INTEGER NOT NULL DEFAULT 0,
    female_20_29 INTEGER NOT NULL DEFAULT 0,
    female_30_39 INTEGER NOT NULL DEFAULT 0,
    female_40_49 INTEGER NOT NULL DEFAULT 0,
    female_50_plus INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (year, month)
)
"#;

// For time-range scans (today sums, hourly breakdown, recent listings)
pub const CREATE_INDEX_TIMESTAMP: &str =
    "CREATE INDEX IF NOT EXISTS idx_detections_timestamp ON detections(timestamp)";

// Partial index keeps the aggregation batch select cheap regardless of how
// large the detections table grows
pub const CREATE_INDEX_UNAGGREGATED: &str = "CREATE INDEX IF NOT EXISTS idx_detections_unaggregated \
     ON detections(timestamp) WHERE aggregated = 0";
