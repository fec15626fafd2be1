use anyhow::Result;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc};
use common::config::{ArchiveTableConfig, ColumnType};
use sqlx::{PgPool, Row, SqlitePool, query};

use crate::schema::{CellValue, SourceRow};

/// One hour of one day, half-open: `start <= t < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HourWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HourWindow {
    pub fn of(day: NaiveDate, hour: u32) -> Self {
        let start = day.and_time(NaiveTime::MIN).and_utc() + Duration::hours(hour as i64);
        Self {
            start,
            end: start + Duration::hours(1),
        }
    }

    /// The full day containing this pipeline's 24 hourly windows.
    pub fn day(day: NaiveDate) -> Self {
        let start = day.and_time(NaiveTime::MIN).and_utc();
        Self {
            start,
            end: start + Duration::days(1),
        }
    }
}

/// Database provides an interface to the operational database
/// (PostgreSQL or SQLite) holding both the archived tables and the
/// archive job ledger.
///
/// Table, id and date column identifiers are caller-supplied, so every
/// statement interpolates them through [`quote_ident`]. On SQLite,
/// timestamps are stored and compared as RFC3339 TEXT in UTC, which
/// makes lexicographic comparison chronological.
#[derive(Clone)]
pub enum Database {
    Postgres(PgPool),
    Sqlite(SqlitePool),
}

/// Quote a caller-supplied identifier, rejecting anything that is not a
/// plain SQL name.
pub(crate) fn quote_ident(name: &str) -> Result<String> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || name.chars().next().is_some_and(|c| c.is_ascii_digit())
    {
        anyhow::bail!("invalid SQL identifier: {name:?}");
    }
    Ok(format!("\"{name}\""))
}

impl Database {
    /// Connect and initialize the ledger schema.
    pub async fn connect(dsn: &str) -> Result<Self> {
        log::info!("Connecting to database with DSN: {dsn}");

        let db = if dsn.starts_with("sqlite:") {
            // Add mode=rwc to create the database file if it doesn't exist
            let dsn_with_create = if dsn.contains('?') {
                if dsn.contains("mode=") {
                    dsn.to_string()
                } else {
                    format!("{dsn}&mode=rwc")
                }
            } else {
                format!("{dsn}?mode=rwc")
            };

            let pool = SqlitePool::connect(&dsn_with_create).await.map_err(|e| {
                log::error!("Failed to connect to SQLite database with DSN '{dsn_with_create}': {e}");
                e
            })?;
            Database::Sqlite(pool)
        } else {
            let pool = PgPool::connect(dsn).await.map_err(|e| {
                log::error!("Failed to connect to PostgreSQL database with DSN '{dsn}': {e}");
                e
            })?;
            Database::Postgres(pool)
        };

        db.init_ledger_schema().await?;
        Ok(db)
    }

    /// Count live rows of `table` with the date column inside the window.
    pub async fn count_in_window(
        &self,
        table: &str,
        date_column: &str,
        window: &HourWindow,
    ) -> Result<i64> {
        let t = quote_ident(table)?;
        let c = quote_ident(date_column)?;

        let count = match self {
            Database::Sqlite(pool) => {
                let stmt = format!("SELECT COUNT(*) AS n FROM {t} WHERE {c} >= ? AND {c} < ?");
                let row = query(&stmt)
                    .bind(window.start.to_rfc3339())
                    .bind(window.end.to_rfc3339())
                    .fetch_one(pool)
                    .await?;
                row.get::<i64, _>("n")
            }
            Database::Postgres(pool) => {
                let stmt = format!("SELECT COUNT(*) AS n FROM {t} WHERE {c} >= $1 AND {c} < $2");
                let row = query(&stmt)
                    .bind(window.start)
                    .bind(window.end)
                    .fetch_one(pool)
                    .await?;
                row.get::<i64, _>("n")
            }
        };

        Ok(count)
    }

    /// Count live rows matching both the time predicate and the id range.
    pub async fn count_in_id_window(
        &self,
        table: &ArchiveTableConfig,
        window: &HourWindow,
        min_id: i64,
        max_id: i64,
    ) -> Result<i64> {
        let t = quote_ident(&table.name)?;
        let c = quote_ident(&table.date_column)?;
        let id = quote_ident(&table.id_column)?;

        let count = match self {
            Database::Sqlite(pool) => {
                let stmt = format!(
                    "SELECT COUNT(*) AS n FROM {t} \
                     WHERE {c} >= ? AND {c} < ? AND {id} >= ? AND {id} <= ?"
                );
                let row = query(&stmt)
                    .bind(window.start.to_rfc3339())
                    .bind(window.end.to_rfc3339())
                    .bind(min_id)
                    .bind(max_id)
                    .fetch_one(pool)
                    .await?;
                row.get::<i64, _>("n")
            }
            Database::Postgres(pool) => {
                let stmt = format!(
                    "SELECT COUNT(*) AS n FROM {t} \
                     WHERE {c} >= $1 AND {c} < $2 AND {id} >= $3 AND {id} <= $4"
                );
                let row = query(&stmt)
                    .bind(window.start)
                    .bind(window.end)
                    .bind(min_id)
                    .bind(max_id)
                    .fetch_one(pool)
                    .await?;
                row.get::<i64, _>("n")
            }
        };

        Ok(count)
    }

    /// Count live rows purely by id range, ignoring the time predicate.
    pub async fn count_by_id_range(
        &self,
        table: &str,
        id_column: &str,
        min_id: i64,
        max_id: i64,
    ) -> Result<i64> {
        let t = quote_ident(table)?;
        let id = quote_ident(id_column)?;

        let count = match self {
            Database::Sqlite(pool) => {
                let stmt = format!("SELECT COUNT(*) AS n FROM {t} WHERE {id} >= ? AND {id} <= ?");
                let row = query(&stmt)
                    .bind(min_id)
                    .bind(max_id)
                    .fetch_one(pool)
                    .await?;
                row.get::<i64, _>("n")
            }
            Database::Postgres(pool) => {
                let stmt = format!("SELECT COUNT(*) AS n FROM {t} WHERE {id} >= $1 AND {id} <= $2");
                let row = query(&stmt)
                    .bind(min_id)
                    .bind(max_id)
                    .fetch_one(pool)
                    .await?;
                row.get::<i64, _>("n")
            }
        };

        Ok(count)
    }

    /// Fetch the next batch of rows to export, in ascending id order,
    /// decoded according to the table's declared export columns.
    pub async fn fetch_export_batch(
        &self,
        table: &ArchiveTableConfig,
        window: &HourWindow,
        after_id: i64,
        limit: i64,
    ) -> Result<Vec<SourceRow>> {
        let t = quote_ident(&table.name)?;
        let c = quote_ident(&table.date_column)?;
        let id = quote_ident(&table.id_column)?;

        let cols = table
            .columns
            .iter()
            .map(|col| quote_ident(&col.name))
            .collect::<Result<Vec<_>>>()?
            .join(", ");

        match self {
            Database::Sqlite(pool) => {
                let stmt = format!(
                    "SELECT {id} AS archive_row_id, {cols} FROM {t} \
                     WHERE {c} >= ? AND {c} < ? AND {id} > ? \
                     ORDER BY {id} ASC LIMIT ?"
                );
                let rows = query(&stmt)
                    .bind(window.start.to_rfc3339())
                    .bind(window.end.to_rfc3339())
                    .bind(after_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;

                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let row_id: i64 = row.try_get("archive_row_id")?;
                    let mut values = Vec::with_capacity(table.columns.len());
                    for col in &table.columns {
                        let name = col.name.as_str();
                        let value = match col.column_type {
                            ColumnType::Int => row
                                .try_get::<Option<i64>, _>(name)?
                                .map(CellValue::Int),
                            ColumnType::Float => row
                                .try_get::<Option<f64>, _>(name)?
                                .map(CellValue::Float),
                            ColumnType::Text => row
                                .try_get::<Option<String>, _>(name)?
                                .map(CellValue::Text),
                            ColumnType::Bool => row
                                .try_get::<Option<bool>, _>(name)?
                                .map(CellValue::Bool),
                            ColumnType::Timestamp => {
                                match row.try_get::<Option<String>, _>(name)? {
                                    Some(text) => Some(CellValue::Timestamp(
                                        DateTime::parse_from_rfc3339(&text)
                                            .map_err(|e| {
                                                anyhow::anyhow!(
                                                    "invalid timestamp in {}.{}: {e}",
                                                    table.name,
                                                    name
                                                )
                                            })?
                                            .with_timezone(&Utc),
                                    )),
                                    None => None,
                                }
                            }
                        };
                        values.push(value.unwrap_or(CellValue::Null));
                    }
                    out.push(SourceRow { id: row_id, values });
                }
                Ok(out)
            }
            Database::Postgres(pool) => {
                let stmt = format!(
                    "SELECT {id} AS archive_row_id, {cols} FROM {t} \
                     WHERE {c} >= $1 AND {c} < $2 AND {id} > $3 \
                     ORDER BY {id} ASC LIMIT $4"
                );
                let rows = query(&stmt)
                    .bind(window.start)
                    .bind(window.end)
                    .bind(after_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;

                let mut out = Vec::with_capacity(rows.len());
                for row in rows {
                    let row_id: i64 = row.try_get("archive_row_id")?;
                    let mut values = Vec::with_capacity(table.columns.len());
                    for col in &table.columns {
                        let name = col.name.as_str();
                        let value = match col.column_type {
                            ColumnType::Int => row
                                .try_get::<Option<i64>, _>(name)?
                                .map(CellValue::Int),
                            ColumnType::Float => row
                                .try_get::<Option<f64>, _>(name)?
                                .map(CellValue::Float),
                            ColumnType::Text => row
                                .try_get::<Option<String>, _>(name)?
                                .map(CellValue::Text),
                            ColumnType::Bool => row
                                .try_get::<Option<bool>, _>(name)?
                                .map(CellValue::Bool),
                            ColumnType::Timestamp => row
                                .try_get::<Option<DateTime<Utc>>, _>(name)?
                                .map(CellValue::Timestamp),
                        };
                        values.push(value.unwrap_or(CellValue::Null));
                    }
                    out.push(SourceRow { id: row_id, values });
                }
                Ok(out)
            }
        }
    }

    /// Delete one bounded batch of rows matching the time predicate and
    /// the id range, starting after `cursor`. Returns the number deleted
    /// and the highest id deleted, for the next batch's cursor.
    pub async fn delete_batch_in_window(
        &self,
        table: &ArchiveTableConfig,
        window: &HourWindow,
        cursor: i64,
        max_id: i64,
        limit: i64,
    ) -> Result<(u64, Option<i64>)> {
        let t = quote_ident(&table.name)?;
        let c = quote_ident(&table.date_column)?;
        let id = quote_ident(&table.id_column)?;

        match self {
            Database::Sqlite(pool) => {
                let stmt = format!(
                    "DELETE FROM {t} WHERE {id} IN (\
                       SELECT {id} FROM {t} \
                       WHERE {c} >= ? AND {c} < ? AND {id} > ? AND {id} <= ? \
                       ORDER BY {id} ASC LIMIT ?\
                     ) RETURNING {id} AS deleted_id"
                );
                let rows = query(&stmt)
                    .bind(window.start.to_rfc3339())
                    .bind(window.end.to_rfc3339())
                    .bind(cursor)
                    .bind(max_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                {
                    let mut last = None;
                    for row in &rows {
                        let deleted: i64 = row.try_get("deleted_id")?;
                        last = Some(last.map_or(deleted, |m: i64| m.max(deleted)));
                    }
                    Ok((rows.len() as u64, last))
                }
            }
            Database::Postgres(pool) => {
                let stmt = format!(
                    "DELETE FROM {t} WHERE {id} IN (\
                       SELECT {id} FROM {t} \
                       WHERE {c} >= $1 AND {c} < $2 AND {id} > $3 AND {id} <= $4 \
                       ORDER BY {id} ASC LIMIT $5\
                     ) RETURNING {id} AS deleted_id"
                );
                let rows = query(&stmt)
                    .bind(window.start)
                    .bind(window.end)
                    .bind(cursor)
                    .bind(max_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                {
                    let mut last = None;
                    for row in &rows {
                        let deleted: i64 = row.try_get("deleted_id")?;
                        last = Some(last.map_or(deleted, |m: i64| m.max(deleted)));
                    }
                    Ok((rows.len() as u64, last))
                }
            }
        }
    }

    /// Delete one bounded batch purely by id range. Deleting from an
    /// already-empty range is a no-op.
    pub async fn delete_batch_by_id(
        &self,
        table: &str,
        id_column: &str,
        cursor: i64,
        max_id: i64,
        limit: i64,
    ) -> Result<(u64, Option<i64>)> {
        let t = quote_ident(table)?;
        let id = quote_ident(id_column)?;

        match self {
            Database::Sqlite(pool) => {
                let stmt = format!(
                    "DELETE FROM {t} WHERE {id} IN (\
                       SELECT {id} FROM {t} WHERE {id} > ? AND {id} <= ? \
                       ORDER BY {id} ASC LIMIT ?\
                     ) RETURNING {id} AS deleted_id"
                );
                let rows = query(&stmt)
                    .bind(cursor)
                    .bind(max_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                {
                    let mut last = None;
                    for row in &rows {
                        let deleted: i64 = row.try_get("deleted_id")?;
                        last = Some(last.map_or(deleted, |m: i64| m.max(deleted)));
                    }
                    Ok((rows.len() as u64, last))
                }
            }
            Database::Postgres(pool) => {
                let stmt = format!(
                    "DELETE FROM {t} WHERE {id} IN (\
                       SELECT {id} FROM {t} WHERE {id} > $1 AND {id} <= $2 \
                       ORDER BY {id} ASC LIMIT $3\
                     ) RETURNING {id} AS deleted_id"
                );
                let rows = query(&stmt)
                    .bind(cursor)
                    .bind(max_id)
                    .bind(limit)
                    .fetch_all(pool)
                    .await?;
                {
                    let mut last = None;
                    for row in &rows {
                        let deleted: i64 = row.try_get("deleted_id")?;
                        last = Some(last.map_or(deleted, |m: i64| m.max(deleted)));
                    }
                    Ok((rows.len() as u64, last))
                }
            }
        }
    }

    /// Distinct UTC days with rows older than the cutoff, oldest first.
    pub async fn pending_days(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<NaiveDate>> {
        let t = quote_ident(table)?;
        let c = quote_ident(date_column)?;

        match self {
            Database::Sqlite(pool) => {
                let stmt = format!(
                    "SELECT DISTINCT substr({c}, 1, 10) AS day FROM {t} \
                     WHERE {c} < ? ORDER BY day ASC"
                );
                let rows = query(&stmt)
                    .bind(cutoff.to_rfc3339())
                    .fetch_all(pool)
                    .await?;
                let mut days = Vec::with_capacity(rows.len());
                for row in rows {
                    let text: String = row.get("day");
                    let day = NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                        .map_err(|e| anyhow::anyhow!("invalid date {text:?} in {table}: {e}"))?;
                    days.push(day);
                }
                Ok(days)
            }
            Database::Postgres(pool) => {
                let stmt = format!(
                    "SELECT DISTINCT ({c} AT TIME ZONE 'UTC')::date AS day FROM {t} \
                     WHERE {c} < $1 ORDER BY day ASC"
                );
                let rows = query(&stmt).bind(cutoff).fetch_all(pool).await?;
                Ok(rows.iter().map(|row| row.get::<NaiveDate, _>("day")).collect())
            }
        }
    }

    /// Backlog summary for the stats report: pending record count,
    /// pending day count, oldest pending timestamp.
    pub async fn backlog(
        &self,
        table: &str,
        date_column: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<(i64, i64, Option<DateTime<Utc>>)> {
        let t = quote_ident(table)?;
        let c = quote_ident(date_column)?;

        match self {
            Database::Sqlite(pool) => {
                let stmt = format!(
                    "SELECT COUNT(*) AS pending, \
                            COUNT(DISTINCT substr({c}, 1, 10)) AS days, \
                            MIN({c}) AS oldest \
                     FROM {t} WHERE {c} < ?"
                );
                let row = query(&stmt)
                    .bind(cutoff.to_rfc3339())
                    .fetch_one(pool)
                    .await?;
                let oldest = match row.get::<Option<String>, _>("oldest") {
                    Some(text) => Some(
                        DateTime::parse_from_rfc3339(&text)
                            .map_err(|e| anyhow::anyhow!("invalid timestamp {text:?}: {e}"))?
                            .with_timezone(&Utc),
                    ),
                    None => None,
                };
                Ok((row.get("pending"), row.get("days"), oldest))
            }
            Database::Postgres(pool) => {
                let stmt = format!(
                    "SELECT COUNT(*) AS pending, \
                            COUNT(DISTINCT ({c} AT TIME ZONE 'UTC')::date) AS days, \
                            MIN({c}) AS oldest \
                     FROM {t} WHERE {c} < $1"
                );
                let row = query(&stmt).bind(cutoff).fetch_one(pool).await?;
                Ok((
                    row.get("pending"),
                    row.get("days"),
                    row.get::<Option<DateTime<Utc>>, _>("oldest"),
                ))
            }
        }
    }

    /// Best-effort compaction after a table's backlog is drained.
    /// SQLite only supports vacuuming the whole database.
    pub async fn vacuum(&self, table: &str) -> Result<()> {
        match self {
            Database::Sqlite(pool) => {
                query("VACUUM").execute(pool).await?;
            }
            Database::Postgres(pool) => {
                let t = quote_ident(table)?;
                let stmt = format!("VACUUM {t}");
                query(&stmt).execute(pool).await?;
            }
        }
        Ok(())
    }
}
