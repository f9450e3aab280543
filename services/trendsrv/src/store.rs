//! Durable storage for readings and point configuration
//!
//! One table per reading kind. Timestamps are Unix milliseconds so range
//! scans and retention deletes stay on an integer index.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use common::{Clock, SqliteClient};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, Transaction};
use tracing::{debug, info};

use crate::error::{Result, TrendSrvError};
use crate::model::{
    default_points, Address, PointConfig, PointKind, Quality, Reading, ReadingValue,
};

/// Persistence interface used by the repository
#[async_trait]
pub trait ReadingStore: Send + Sync {
    /// Create the schema and seed default points into an empty config table
    async fn initialize(&self) -> Result<()>;

    /// Insert a batch atomically
    async fn append_batch(&self, batch: &[Reading]) -> Result<()>;

    /// Readings of one tag and kind with `from <= timestamp <= to`, ascending
    async fn history(
        &self,
        tag_name: &str,
        kind: PointKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>>;

    /// Delete readings of one kind older than `cutoff`; returns rows removed
    async fn delete_older_than(&self, kind: PointKind, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Newest reading per tag for one kind
    async fn latest_per_tag(&self, kind: PointKind) -> Result<Vec<Reading>>;

    /// Point configurations ordered by tag
    async fn point_configs(&self, enabled_only: bool) -> Result<Vec<PointConfig>>;

    async fn point_config(&self, tag_name: &str) -> Result<Option<PointConfig>>;

    /// Insert or update a point configuration by tag
    async fn save_point_config(&self, config: &PointConfig) -> Result<()>;

    /// Reclaim free pages (`VACUUM`)
    async fn compact(&self) -> Result<()>;
}

fn table_name(kind: PointKind) -> &'static str {
    match kind {
        PointKind::Analog => "analog_readings",
        PointKind::Digital => "digital_readings",
        PointKind::DataBlock => "datablock_readings",
        PointKind::String => "string_readings",
    }
}

fn payload_columns(kind: PointKind) -> &'static str {
    match kind {
        PointKind::Analog => "value, unit",
        PointKind::Digital => "bit_index, value",
        PointKind::DataBlock => "encoded",
        PointKind::String => "value, max_length",
    }
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS analog_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_name TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        quality INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        value REAL NOT NULL,
        unit TEXT
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS digital_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_name TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        quality INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        bit_index INTEGER NOT NULL,
        value INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS datablock_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_name TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        quality INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        encoded TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS string_readings (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tag_name TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        quality INTEGER NOT NULL,
        timestamp_ms INTEGER NOT NULL,
        value TEXT NOT NULL,
        max_length INTEGER NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS point_configs (
        tag_name TEXT PRIMARY KEY,
        display_name TEXT NOT NULL,
        kind TEXT NOT NULL,
        block_number INTEGER NOT NULL,
        byte_offset INTEGER NOT NULL,
        bit_index INTEGER,
        unit TEXT,
        min_value REAL,
        max_value REAL,
        enabled INTEGER NOT NULL DEFAULT 1,
        polling_interval_ms INTEGER NOT NULL,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    )
    "#,
];

/// SQLite-backed [`ReadingStore`]
pub struct SqliteReadingStore {
    client: Arc<SqliteClient>,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
}

impl SqliteReadingStore {
    /// `chunk_size` bounds the rows per multi-row INSERT
    pub fn new(client: Arc<SqliteClient>, clock: Arc<dyn Clock>, chunk_size: usize) -> Self {
        Self {
            client,
            clock,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn client(&self) -> &Arc<SqliteClient> {
        &self.client
    }

    async fn seed_defaults(&self) -> Result<()> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM point_configs")
            .fetch_one(self.client.pool())
            .await?;
        if count > 0 {
            return Ok(());
        }

        let points = default_points();
        for point in &points {
            self.save_point_config(point).await?;
        }
        info!("Seeded {} default point configurations", points.len());
        Ok(())
    }

    async fn insert_analog(&self, tx: &mut Transaction<'_, Sqlite>, rows: &[&Reading]) -> Result<()> {
        for chunk in rows.chunks(self.chunk_size) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO analog_readings (tag_name, block_number, byte_offset, quality, timestamp_ms, value, unit) ",
            );
            qb.push_values(chunk, |mut b, r| {
                let (value, unit) = match &r.value {
                    ReadingValue::Analog { value, unit } => (*value as f64, unit.clone()),
                    _ => (0.0, None),
                };
                push_common(&mut b, r);
                b.push_bind(value).push_bind(unit);
            });
            qb.build().execute(&mut **tx).await?;
        }
        Ok(())
    }

    async fn insert_digital(&self, tx: &mut Transaction<'_, Sqlite>, rows: &[&Reading]) -> Result<()> {
        for chunk in rows.chunks(self.chunk_size) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO digital_readings (tag_name, block_number, byte_offset, quality, timestamp_ms, bit_index, value) ",
            );
            qb.push_values(chunk, |mut b, r| {
                let (value, bit) = match &r.value {
                    ReadingValue::Digital { value, bit } => (*value, *bit),
                    _ => (false, 0),
                };
                push_common(&mut b, r);
                b.push_bind(bit as i64).push_bind(value);
            });
            qb.build().execute(&mut **tx).await?;
        }
        Ok(())
    }

    async fn insert_data_block(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        rows: &[&Reading],
    ) -> Result<()> {
        for chunk in rows.chunks(self.chunk_size) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO datablock_readings (tag_name, block_number, byte_offset, quality, timestamp_ms, encoded) ",
            );
            qb.push_values(chunk, |mut b, r| {
                let encoded = match &r.value {
                    ReadingValue::DataBlock { encoded, .. } => encoded.clone(),
                    _ => String::new(),
                };
                push_common(&mut b, r);
                b.push_bind(encoded);
            });
            qb.build().execute(&mut **tx).await?;
        }
        Ok(())
    }

    async fn insert_string(&self, tx: &mut Transaction<'_, Sqlite>, rows: &[&Reading]) -> Result<()> {
        for chunk in rows.chunks(self.chunk_size) {
            let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO string_readings (tag_name, block_number, byte_offset, quality, timestamp_ms, value, max_length) ",
            );
            qb.push_values(chunk, |mut b, r| {
                let (value, max_length) = match &r.value {
                    ReadingValue::String { value, max_length } => (value.clone(), *max_length),
                    _ => (String::new(), 0),
                };
                push_common(&mut b, r);
                b.push_bind(value).push_bind(max_length as i64);
            });
            qb.build().execute(&mut **tx).await?;
        }
        Ok(())
    }
}

fn push_common(b: &mut sqlx::query_builder::Separated<'_, '_, Sqlite, &'static str>, r: &Reading) {
    b.push_bind(r.tag_name.clone())
        .push_bind(r.address.block as i64)
        .push_bind(r.address.offset as i64)
        .push_bind(r.quality.code())
        .push_bind(r.timestamp.timestamp_millis());
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| TrendSrvError::persistence(format!("timestamp {} out of range", ms)))
}

fn row_to_reading(kind: PointKind, row: &SqliteRow) -> Result<Reading> {
    let block: i64 = row.try_get("block_number")?;
    let offset: i64 = row.try_get("byte_offset")?;
    let quality: i64 = row.try_get("quality")?;
    let timestamp_ms: i64 = row.try_get("timestamp_ms")?;

    let mut address = Address::new(block as u16, offset as u32);
    let value = match kind {
        PointKind::Analog => {
            let value: f64 = row.try_get("value")?;
            ReadingValue::Analog {
                value: value as f32,
                unit: row.try_get("unit")?,
            }
        },
        PointKind::Digital => {
            let bit: i64 = row.try_get("bit_index")?;
            address.bit = Some(bit as u8);
            ReadingValue::Digital {
                value: row.try_get("value")?,
                bit: bit as u8,
            }
        },
        PointKind::DataBlock => {
            let encoded: String = row.try_get("encoded")?;
            let raw = BASE64.decode(&encoded).map_err(|e| {
                TrendSrvError::persistence(format!("corrupt data block payload: {}", e))
            })?;
            ReadingValue::DataBlock { raw, encoded }
        },
        PointKind::String => {
            let max_length: i64 = row.try_get("max_length")?;
            ReadingValue::String {
                value: row.try_get("value")?,
                max_length: max_length as u8,
            }
        },
    };

    Ok(Reading {
        tag_name: row.try_get("tag_name")?,
        address,
        quality: Quality::from_code(quality),
        timestamp: from_millis(timestamp_ms)?,
        value,
    })
}

fn row_to_point(row: &SqliteRow) -> Result<PointConfig> {
    let kind: String = row.try_get("kind")?;
    let kind = kind.parse::<PointKind>().map_err(TrendSrvError::persistence)?;
    let block: i64 = row.try_get("block_number")?;
    let offset: i64 = row.try_get("byte_offset")?;
    let bit: Option<i64> = row.try_get("bit_index")?;
    let min_value: Option<f64> = row.try_get("min_value")?;
    let max_value: Option<f64> = row.try_get("max_value")?;
    let polling_interval_ms: i64 = row.try_get("polling_interval_ms")?;

    Ok(PointConfig {
        tag_name: row.try_get("tag_name")?,
        display_name: row.try_get("display_name")?,
        kind,
        address: Address {
            block: block as u16,
            offset: offset as u32,
            bit: bit.map(|b| b as u8),
        },
        unit: row.try_get("unit")?,
        min_value: min_value.map(|v| v as f32),
        max_value: max_value.map(|v| v as f32),
        enabled: row.try_get("enabled")?,
        polling_interval_ms: polling_interval_ms as u32,
    })
}

const POINT_COLUMNS: &str = "tag_name, display_name, kind, block_number, byte_offset, bit_index, \
                             unit, min_value, max_value, enabled, polling_interval_ms";

#[async_trait]
impl ReadingStore for SqliteReadingStore {
    async fn initialize(&self) -> Result<()> {
        let pool = self.client.pool();
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(pool).await?;
        }
        for kind in PointKind::ALL {
            let table = table_name(kind);
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_tag_ts ON {table} (tag_name, timestamp_ms)"
            ))
            .execute(pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_ts ON {table} (timestamp_ms)"
            ))
            .execute(pool)
            .await?;
        }
        debug!("Schema ready at {}", self.client.path());

        self.seed_defaults().await
    }

    async fn append_batch(&self, batch: &[Reading]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut analog = Vec::new();
        let mut digital = Vec::new();
        let mut data_block = Vec::new();
        let mut string = Vec::new();
        for reading in batch {
            match reading.kind() {
                PointKind::Analog => analog.push(reading),
                PointKind::Digital => digital.push(reading),
                PointKind::DataBlock => data_block.push(reading),
                PointKind::String => string.push(reading),
            }
        }

        let mut tx = self.client.pool().begin().await?;
        self.insert_analog(&mut tx, &analog).await?;
        self.insert_digital(&mut tx, &digital).await?;
        self.insert_data_block(&mut tx, &data_block).await?;
        self.insert_string(&mut tx, &string).await?;
        tx.commit().await?;

        debug!("Stored {} readings", batch.len());
        Ok(())
    }

    async fn history(
        &self,
        tag_name: &str,
        kind: PointKind,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>> {
        let sql = format!(
            r#"
            SELECT tag_name, block_number, byte_offset, quality, timestamp_ms, {}
            FROM {}
            WHERE tag_name = ? AND timestamp_ms >= ? AND timestamp_ms <= ?
            ORDER BY timestamp_ms ASC, id ASC
            "#,
            payload_columns(kind),
            table_name(kind)
        );
        let rows = sqlx::query(&sql)
            .bind(tag_name)
            .bind(from.timestamp_millis())
            .bind(to.timestamp_millis())
            .fetch_all(self.client.pool())
            .await?;

        rows.iter().map(|row| row_to_reading(kind, row)).collect()
    }

    async fn delete_older_than(&self, kind: PointKind, cutoff: DateTime<Utc>) -> Result<u64> {
        let sql = format!("DELETE FROM {} WHERE timestamp_ms < ?", table_name(kind));
        let result = sqlx::query(&sql)
            .bind(cutoff.timestamp_millis())
            .execute(self.client.pool())
            .await?;
        Ok(result.rows_affected())
    }

    async fn latest_per_tag(&self, kind: PointKind) -> Result<Vec<Reading>> {
        let sql = format!(
            r#"
            SELECT tag_name, block_number, byte_offset, quality, timestamp_ms, {cols}
            FROM (
                SELECT *, ROW_NUMBER() OVER (
                    PARTITION BY tag_name ORDER BY timestamp_ms DESC, id DESC
                ) AS rn
                FROM {table}
            )
            WHERE rn = 1
            ORDER BY tag_name
            "#,
            cols = payload_columns(kind),
            table = table_name(kind)
        );
        let rows = sqlx::query(&sql).fetch_all(self.client.pool()).await?;

        rows.iter().map(|row| row_to_reading(kind, row)).collect()
    }

    async fn point_configs(&self, enabled_only: bool) -> Result<Vec<PointConfig>> {
        let sql = format!(
            "SELECT {} FROM point_configs WHERE (? = 0 OR enabled = 1) ORDER BY tag_name",
            POINT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(enabled_only)
            .fetch_all(self.client.pool())
            .await?;

        rows.iter().map(row_to_point).collect()
    }

    async fn point_config(&self, tag_name: &str) -> Result<Option<PointConfig>> {
        let sql = format!("SELECT {} FROM point_configs WHERE tag_name = ?", POINT_COLUMNS);
        let row = sqlx::query(&sql)
            .bind(tag_name)
            .fetch_optional(self.client.pool())
            .await?;

        row.as_ref().map(row_to_point).transpose()
    }

    async fn save_point_config(&self, config: &PointConfig) -> Result<()> {
        let now_ms = self.clock.now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO point_configs (
                tag_name, display_name, kind, block_number, byte_offset, bit_index,
                unit, min_value, max_value, enabled, polling_interval_ms,
                created_at_ms, updated_at_ms
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(tag_name) DO UPDATE SET
                display_name = excluded.display_name,
                kind = excluded.kind,
                block_number = excluded.block_number,
                byte_offset = excluded.byte_offset,
                bit_index = excluded.bit_index,
                unit = excluded.unit,
                min_value = excluded.min_value,
                max_value = excluded.max_value,
                enabled = excluded.enabled,
                polling_interval_ms = excluded.polling_interval_ms,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(&config.tag_name)
        .bind(&config.display_name)
        .bind(config.kind.as_str())
        .bind(config.address.block as i64)
        .bind(config.address.offset as i64)
        .bind(config.address.bit.map(|b| b as i64))
        .bind(&config.unit)
        .bind(config.min_value.map(|v| v as f64))
        .bind(config.max_value.map(|v| v as f64))
        .bind(config.enabled)
        .bind(config.polling_interval_ms as i64)
        .bind(now_ms)
        .bind(now_ms)
        .execute(self.client.pool())
        .await?;
        Ok(())
    }

    async fn compact(&self) -> Result<()> {
        self.client.vacuum().await.map_err(TrendSrvError::from)
    }
}
