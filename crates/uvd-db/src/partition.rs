//! Monthly range-partition maintenance for the grab log.
//!
//! Partitions are named `{table}_y{YYYY}m{MM}` and cover one calendar
//! month. Every operation is idempotent: creation probes the catalog
//! first, so re-running maintenance for a month that already exists is a
//! no-op that reports `created = false`.

use chrono::{Datelike, NaiveDate, Utc};
use sqlx::PgPool;
use tracing::info;

use crate::StoreError;

/// One calendar month.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MonthWindow {
    pub year: i32,
    pub month: u32,
}

impl MonthWindow {
    pub fn of(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn current() -> Self {
        Self::of(Utc::now().date_naive())
    }

    pub fn next(self) -> Self {
        if self.month == 12 {
            Self {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Self {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    /// Half-open [first day of month, first day of next month).
    pub fn bounds(self) -> (NaiveDate, NaiveDate) {
        let from = NaiveDate::from_ymd_opt(self.year, self.month, 1)
            .expect("month window is always a valid date");
        let next = self.next();
        let to = NaiveDate::from_ymd_opt(next.year, next.month, 1)
            .expect("month window is always a valid date");
        (from, to)
    }

    pub fn label(self) -> String {
        format!("{:04}-{:02}", self.year, self.month)
    }
}

/// `{table}_y{YYYY}m{MM}`.
pub fn partition_name(table: &str, window: MonthWindow) -> String {
    format!("{table}_y{:04}m{:02}", window.year, window.month)
}

async fn partition_exists(pool: &PgPool, name: &str) -> Result<bool, StoreError> {
    let (exists,): (bool,) =
        sqlx::query_as("select to_regclass($1) is not null")
            .bind(name)
            .fetch_one(pool)
            .await?;
    Ok(exists)
}

async fn create_partition(
    pool: &PgPool,
    table: &str,
    window: MonthWindow,
    comment_prefix: &str,
) -> Result<bool, StoreError> {
    let name = partition_name(table, window);
    if partition_exists(pool, &name).await? {
        return Ok(false);
    }

    let (from, to) = window.bounds();
    sqlx::query(&format!(
        "create table if not exists {name} partition of {table} \
         for values from ('{from}') to ('{to}')"
    ))
    .execute(pool)
    .await?;

    sqlx::query(&format!(
        "comment on table {name} is '{comment_prefix} {}'",
        window.label()
    ))
    .execute(pool)
    .await?;

    info!(partition = %name, month = %window.label(), "partition created");
    Ok(true)
}

/// Create the partition for next month. Returns `true` when it was
/// actually created, `false` when it already existed.
pub async fn create_next_month_partition(
    pool: &PgPool,
    table: &str,
    comment_prefix: &str,
) -> Result<bool, StoreError> {
    create_partition(pool, table, MonthWindow::current().next(), comment_prefix).await
}

/// Ensure partitions exist for the current month and `months` months
/// ahead. Returns how many were newly created.
pub async fn ensure_future_partitions(
    pool: &PgPool,
    table: &str,
    months: u32,
    comment_prefix: &str,
) -> Result<u32, StoreError> {
    let mut created = 0;
    let mut window = MonthWindow::current();
    for _ in 0..=months {
        if create_partition(pool, table, window, comment_prefix).await? {
            created += 1;
        }
        window = window.next();
    }
    Ok(created)
}

/// Months within the lookahead window whose partition is missing.
pub async fn check_partition_health(
    pool: &PgPool,
    table: &str,
    lookahead_months: u32,
) -> Result<Vec<MonthWindow>, StoreError> {
    let mut missing = Vec::new();
    let mut window = MonthWindow::current();
    for _ in 0..=lookahead_months {
        if !partition_exists(pool, &partition_name(table, window)).await? {
            missing.push(window);
        }
        window = window.next();
    }
    Ok(missing)
}

/// Create exactly the given missing months. Safe to re-run.
pub async fn repair_missing_partitions(
    pool: &PgPool,
    table: &str,
    months: &[MonthWindow],
    comment_prefix: &str,
) -> Result<u32, StoreError> {
    let mut created = 0;
    for window in months {
        if create_partition(pool, table, *window, comment_prefix).await? {
            created += 1;
        }
    }
    Ok(created)
}
