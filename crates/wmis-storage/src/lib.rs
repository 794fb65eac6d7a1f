pub mod checkpoint;

pub use checkpoint::{Checkpoint, CheckpointError, CheckpointStore};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::debug;
use wmis_core::{RecordSink, SinkError, TradeAction, TransactionRecord};

pub const MARKET_SCHEMA_VERSION: i64 = 1;
pub const DEFAULT_QUERY_LIMIT: usize = 1000;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("unsupported schema version {found}, max supported {supported}")]
    UnsupportedSchemaVersion { found: i64, supported: i64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub id: i64,
    pub record: TransactionRecord,
}

/// Filters for [`MarketStore::query_records`]. Time bounds compare against
/// the capture time and are inclusive.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordQuery {
    pub group: Option<String>,
    pub action: Option<TradeAction>,
    pub captured_after: Option<DateTime<Utc>>,
    pub captured_before: Option<DateTime<Utc>>,
    pub limit: usize,
}

impl Default for RecordQuery {
    fn default() -> Self {
        Self {
            group: None,
            action: None,
            captured_after: None,
            captured_before: None,
            limit: DEFAULT_QUERY_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketStatistics {
    pub total_records: i64,
    pub by_group: BTreeMap<String, i64>,
    pub by_action: BTreeMap<String, i64>,
    /// Mean over priced records only; `None` when nothing carries a price.
    pub avg_price: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PriceTrendPoint {
    pub date: String,
    pub action: TradeAction,
    pub avg_price: f64,
    pub count: i64,
}

pub struct MarketStore {
    conn: Connection,
}

impl MarketStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    pub fn schema_version(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    pub fn migrate(&self) -> Result<(), StorageError> {
        let current = self.schema_version()?;
        if current > MARKET_SCHEMA_VERSION {
            return Err(StorageError::UnsupportedSchemaVersion {
                found: current,
                supported: MARKET_SCHEMA_VERSION,
            });
        }

        if current < 1 {
            let sql = include_str!("../migrations/0001_market_schema.sql");
            self.conn.execute_batch(sql)?;
            self.conn
                .execute("PRAGMA user_version = 1", [])
                .map(|_| ())?;
        }

        Ok(())
    }

    /// Inserts the whole slice in one transaction: either every record is
    /// stored or none is.
    pub fn insert_records(&mut self, records: &[TransactionRecord]) -> Result<usize, StorageError> {
        if records.is_empty() {
            return Ok(0);
        }

        let tx = self.conn.transaction()?;
        {
            let mut statement = tx.prepare(
                "
                INSERT INTO market_data (
                    capture_time,
                    message_time,
                    group_name,
                    sender_nickname,
                    raw_text,
                    action,
                    item_category,
                    specs,
                    price,
                    quantity
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                ",
            )?;
            for record in records {
                statement.execute(params![
                    format_timestamp(record.capture_time),
                    record.message_time,
                    record.group,
                    record.sender,
                    record.raw_text,
                    record.action.as_str(),
                    record.item,
                    record.specs,
                    record.price,
                    i64::from(record.quantity),
                ])?;
            }
        }
        tx.commit()?;

        debug!(event = "records_inserted", count = records.len());
        Ok(records.len())
    }

    /// Newest capture first.
    pub fn query_records(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>, StorageError> {
        let mut sql = String::from(
            "
            SELECT id, capture_time, message_time, group_name, sender_nickname,
                   raw_text, action, item_category, specs, price, quantity
            FROM market_data
            WHERE 1 = 1
            ",
        );
        let mut values = Vec::new();

        if let Some(group) = &query.group {
            values.push(SqlValue::Text(group.clone()));
            sql.push_str(&format!(" AND group_name = ?{}", values.len()));
        }
        if let Some(action) = query.action {
            values.push(SqlValue::Text(action.as_str().to_string()));
            sql.push_str(&format!(" AND action = ?{}", values.len()));
        }
        if let Some(after) = query.captured_after {
            values.push(SqlValue::Text(format_timestamp(after)));
            sql.push_str(&format!(" AND capture_time >= ?{}", values.len()));
        }
        if let Some(before) = query.captured_before {
            values.push(SqlValue::Text(format_timestamp(before)));
            sql.push_str(&format!(" AND capture_time <= ?{}", values.len()));
        }

        let limit = i64::try_from(query.limit).unwrap_or(i64::MAX);
        values.push(SqlValue::Integer(limit));
        sql.push_str(&format!(
            " ORDER BY capture_time DESC, id DESC LIMIT ?{}",
            values.len()
        ));

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(values.iter()), stored_record_from_row)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    pub fn record_count(&self) -> Result<i64, StorageError> {
        Ok(self
            .conn
            .query_row("SELECT COUNT(*) FROM market_data", [], |row| row.get(0))?)
    }

    pub fn statistics(&self) -> Result<MarketStatistics, StorageError> {
        let total_records = self.record_count()?;
        let by_group = self.grouped_counts("group_name")?;
        let by_action = self.grouped_counts("action")?;
        let avg_price = self.conn.query_row(
            "SELECT AVG(price) FROM market_data WHERE price > 0",
            [],
            |row| row.get::<_, Option<f64>>(0),
        )?;

        Ok(MarketStatistics {
            total_records,
            by_group,
            by_action,
            avg_price,
        })
    }

    /// Daily average price per action for records captured at or after
    /// `since`, oldest day first. Unpriced records are left out.
    pub fn price_trend(&self, since: DateTime<Utc>) -> Result<Vec<PriceTrendPoint>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT DATE(capture_time) AS day, action, AVG(price), COUNT(*)
            FROM market_data
            WHERE capture_time >= ?1 AND price > 0
            GROUP BY day, action
            ORDER BY day ASC, action ASC
            ",
        )?;
        let rows = statement.query_map([format_timestamp(since)], |row| {
            let action: String = row.get(1)?;
            Ok(PriceTrendPoint {
                date: row.get(0)?,
                action: TradeAction::from_raw(Some(&action)),
                avg_price: row.get(2)?,
                count: row.get(3)?,
            })
        })?;

        let mut points = Vec::new();
        for row in rows {
            points.push(row?);
        }
        Ok(points)
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    // Only called with the fixed column names above.
    fn grouped_counts(&self, column: &str) -> Result<BTreeMap<String, i64>, StorageError> {
        let sql = format!("SELECT {column}, COUNT(*) FROM market_data GROUP BY {column}");
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut counts = BTreeMap::new();
        for row in rows {
            let (key, count) = row?;
            counts.insert(key, count);
        }
        Ok(counts)
    }
}

impl RecordSink for MarketStore {
    fn store(&mut self, records: &[TransactionRecord]) -> Result<usize, SinkError> {
        self.insert_records(records)
            .map_err(|err| SinkError::new(records.len(), err.to_string()))
    }
}

fn stored_record_from_row(row: &Row<'_>) -> rusqlite::Result<StoredRecord> {
    let capture_time: String = row.get(1)?;
    let capture_time = DateTime::parse_from_rfc3339(&capture_time)
        .map_err(|err| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(err))
        })?
        .with_timezone(&Utc);
    let action: String = row.get(6)?;
    let quantity: i64 = row.get(10)?;

    Ok(StoredRecord {
        id: row.get(0)?,
        record: TransactionRecord {
            action: TradeAction::from_raw(Some(&action)),
            item: row.get(7)?,
            specs: row.get(8)?,
            price: row.get(9)?,
            quantity: u32::try_from(quantity).unwrap_or(u32::MAX),
            raw_text: row.get(5)?,
            sender: row.get(4)?,
            group: row.get(3)?,
            message_time: row.get(2)?,
            capture_time,
        },
    })
}

// Fixed width so lexical order in SQLite matches chronological order.
fn format_timestamp(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tempfile::NamedTempFile;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 23, 14, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    fn sample_record(group: &str, action: TradeAction, price: f64) -> TransactionRecord {
        TransactionRecord {
            action,
            item: "iPhone 14 Pro Max".to_string(),
            specs: "256G 紫色".to_string(),
            price,
            quantity: 2,
            raw_text: "出两台14pm 256 紫色 5800".to_string(),
            sender: "老王".to_string(),
            group: group.to_string(),
            message_time: "14:02".to_string(),
            capture_time: ts(),
        }
    }

    #[test]
    fn migration_creates_market_table() {
        let db = MarketStore::open_in_memory().expect("open db");
        assert!(db.table_exists("market_data").expect("table check"));
        assert!(!db.table_exists("raw_events").expect("table check"));
        assert_eq!(
            db.schema_version().expect("schema version"),
            MARKET_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopening_file_db_keeps_records_and_schema() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let mut db = MarketStore::open(file.path()).expect("open db");
            db.insert_records(&[sample_record("数码群", TradeAction::Sell, 5800.0)])
                .expect("insert");
        }

        let db = MarketStore::open(file.path()).expect("reopen db");
        assert_eq!(db.record_count().expect("count"), 1);
    }

    #[test]
    fn newer_schema_is_rejected() {
        let file = NamedTempFile::new().expect("temp file");
        {
            let conn = Connection::open(file.path()).expect("open raw");
            conn.execute("PRAGMA user_version = 9", [])
                .expect("bump version");
        }

        match MarketStore::open(file.path()) {
            Err(StorageError::UnsupportedSchemaVersion { found, supported }) => {
                assert_eq!(found, 9);
                assert_eq!(supported, MARKET_SCHEMA_VERSION);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("newer schema should be rejected"),
        }
    }

    #[test]
    fn insert_and_query_roundtrip() {
        let mut db = MarketStore::open_in_memory().expect("open db");
        let record = sample_record("数码群", TradeAction::Sell, 5800.0);
        let stored = db
            .insert_records(std::slice::from_ref(&record))
            .expect("insert");
        assert_eq!(stored, 1);

        let loaded = db
            .query_records(&RecordQuery::default())
            .expect("query records");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].record, record);
    }

    #[test]
    fn query_filters_and_orders_newest_first() {
        let mut db = MarketStore::open_in_memory().expect("open db");
        let mut older = sample_record("数码群", TradeAction::Buy, 3000.0);
        older.capture_time = ts() - Duration::hours(2);
        let newer = sample_record("数码群", TradeAction::Sell, 5800.0);
        let other_group = sample_record("二手群", TradeAction::Sell, 100.0);
        db.insert_records(&[older.clone(), newer.clone(), other_group])
            .expect("insert");

        let group_only = db
            .query_records(&RecordQuery {
                group: Some("数码群".to_string()),
                ..RecordQuery::default()
            })
            .expect("query group");
        assert_eq!(group_only.len(), 2);
        assert_eq!(group_only[0].record, newer);
        assert_eq!(group_only[1].record, older);

        let buys = db
            .query_records(&RecordQuery {
                action: Some(TradeAction::Buy),
                ..RecordQuery::default()
            })
            .expect("query action");
        assert_eq!(buys.len(), 1);

        let recent = db
            .query_records(&RecordQuery {
                captured_after: Some(ts() - Duration::minutes(30)),
                limit: 1,
                ..RecordQuery::default()
            })
            .expect("query window");
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].record.capture_time, ts());
    }

    #[test]
    fn statistics_skip_unpriced_records_in_average() {
        let mut db = MarketStore::open_in_memory().expect("open db");
        db.insert_records(&[
            sample_record("数码群", TradeAction::Sell, 6000.0),
            sample_record("数码群", TradeAction::Buy, 4000.0),
            sample_record("二手群", TradeAction::Unknown, 0.0),
        ])
        .expect("insert");

        let stats = db.statistics().expect("stats");
        assert_eq!(stats.total_records, 3);
        assert_eq!(stats.by_group.get("数码群"), Some(&2));
        assert_eq!(stats.by_group.get("二手群"), Some(&1));
        assert_eq!(stats.by_action.get("UNKNOWN"), Some(&1));
        assert_eq!(stats.avg_price, Some(5000.0));
    }

    #[test]
    fn empty_store_has_no_average_price() {
        let db = MarketStore::open_in_memory().expect("open db");
        let stats = db.statistics().expect("stats");
        assert_eq!(stats.total_records, 0);
        assert_eq!(stats.avg_price, None);
    }

    #[test]
    fn price_trend_groups_by_capture_day_and_action() {
        let mut db = MarketStore::open_in_memory().expect("open db");
        let mut yesterday = sample_record("数码群", TradeAction::Sell, 5000.0);
        yesterday.capture_time = ts() - Duration::days(1);
        let mut long_ago = sample_record("数码群", TradeAction::Sell, 9000.0);
        long_ago.capture_time = ts() - Duration::days(30);
        db.insert_records(&[
            yesterday,
            long_ago,
            sample_record("数码群", TradeAction::Sell, 6000.0),
            sample_record("数码群", TradeAction::Sell, 7000.0),
            sample_record("数码群", TradeAction::Buy, 3000.0),
        ])
        .expect("insert");

        let trend = db
            .price_trend(ts() - Duration::days(7))
            .expect("price trend");
        assert_eq!(
            trend,
            vec![
                PriceTrendPoint {
                    date: "2026-02-22".to_string(),
                    action: TradeAction::Sell,
                    avg_price: 5000.0,
                    count: 1,
                },
                PriceTrendPoint {
                    date: "2026-02-23".to_string(),
                    action: TradeAction::Buy,
                    avg_price: 3000.0,
                    count: 1,
                },
                PriceTrendPoint {
                    date: "2026-02-23".to_string(),
                    action: TradeAction::Sell,
                    avg_price: 6500.0,
                    count: 2,
                },
            ]
        );
    }

    #[test]
    fn sink_reports_attempted_count() {
        let mut db = MarketStore::open_in_memory().expect("open db");
        let records = vec![
            sample_record("数码群", TradeAction::Sell, 1.0),
            sample_record("数码群", TradeAction::Buy, 2.0),
        ];
        assert_eq!(db.store(&records).expect("store"), 2);
        assert_eq!(db.store(&[]).expect("store empty"), 0);
        assert_eq!(db.record_count().expect("count"), 2);
    }
}
