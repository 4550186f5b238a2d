//! Persistent time-series store (C1). One physical SQLite database,
//! write-ahead-journaled so the single writer never blocks concurrent
//! readers (download handlers open their own short-lived connections).

use std::path::Path;

use rusqlite::{params, Connection, OpenFlags};

use crate::error::{Result, TelemetryError};
use crate::sample::{AdcSample, MeterSample, Sample, Table, TouchedTables};
use crate::series::Kind;

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Opens or creates the database, switches it to WAL, and creates the
    /// schema if missing. Fails with `StoreInit` if either step fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| TelemetryError::StoreInit(format!("open: {e}")))?;

        let mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| TelemetryError::StoreInit(format!("journal_mode: {e}")))?;
        if mode.to_ascii_lowercase() != "wal" {
            return Err(TelemetryError::StoreSchema(format!(
                "failed to switch to WAL mode, got {mode}"
            )));
        }
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|e| TelemetryError::StoreInit(format!("synchronous: {e}")))?;
        conn.pragma_update(None, "foreign_keys", "OFF")
            .map_err(|e| TelemetryError::StoreInit(format!("foreign_keys: {e}")))?;

        let store = Self { conn };
        store.create_schema()?;
        Ok(store)
    }

    /// Opens a short-lived, read-mostly connection to an existing database
    /// (used by the download handler, one per request, per spec §5).
    pub fn open_reader(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(path)
    }

    fn create_schema(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS meter_samples(
                    timestamp INTEGER PRIMARY KEY,
                    timestamp_str TEXT,
                    instant_power_1 REAL,
                    instant_power_2 REAL,
                    instant_power_3 REAL,
                    voltage_1 REAL,
                    voltage_2 REAL,
                    voltage_3 REAL
                );
                CREATE TABLE IF NOT EXISTS meter_peaks(
                    timestamp INTEGER PRIMARY KEY,
                    timestamp_str TEXT,
                    peak_power REAL
                );
                CREATE TABLE IF NOT EXISTS gas_samples(
                    timestamp INTEGER PRIMARY KEY,
                    timestamp_str TEXT,
                    volume REAL
                );
                CREATE TABLE IF NOT EXISTS water_samples(
                    timestamp INTEGER PRIMARY KEY,
                    voltage_int INTEGER
                );",
            )
            .map_err(|e| TelemetryError::StoreSchema(e.to_string()))?;
        Ok(())
    }

    /// Inserts one sample. Returns the set of tables actually written.
    /// Each logical write is `INSERT OR REPLACE` on the primary key; the
    /// whole call commits once.
    pub fn insert(&self, sample: &Sample) -> Result<TouchedTables> {
        let mut touched = TouchedTables::new();
        match sample {
            Sample::Meter(m) => self.insert_meter(m, &mut touched)?,
            Sample::Adc(a) => self.insert_adc(a, &mut touched)?,
        }
        Ok(touched)
    }

    fn insert_meter(&self, m: &MeterSample, touched: &mut TouchedTables) -> Result<()> {
        if let Some(ts) = m.timestamp {
            self.conn.execute(
                "INSERT OR REPLACE INTO meter_samples VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    ts,
                    m.timestamp_str,
                    m.instant_power_1,
                    m.instant_power_2,
                    m.instant_power_3,
                    m.voltage_1,
                    m.voltage_2,
                    m.voltage_3,
                ],
            )?;
            touched.insert(Table::MeterSamples);
        }
        if let Some(ts) = m.peak_power_timestamp {
            self.conn.execute(
                "INSERT OR REPLACE INTO meter_peaks VALUES (?1, ?2, ?3)",
                params![ts, m.peak_power_timestamp_str, m.peak_power],
            )?;
            touched.insert(Table::MeterPeaks);
        }
        if let Some(ts) = m.gas_timestamp {
            self.conn.execute(
                "INSERT OR REPLACE INTO gas_samples VALUES (?1, ?2, ?3)",
                params![ts, m.gas_timestamp_str, m.gas_volume],
            )?;
            touched.insert(Table::GasSamples);
        }
        Ok(())
    }

    fn insert_adc(&self, a: &AdcSample, touched: &mut TouchedTables) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO water_samples VALUES (?1, ?2)",
            params![a.timestamp, a.voltage_int],
        )?;
        touched.insert(Table::WaterSamples);
        Ok(())
    }

    /// Fetches the half-open range `[oldest, newest)`, materializing every
    /// row. Used by the Tracker, whose ranges are small (a handful of
    /// buckets). For bulk downloads see `stream_rows`.
    pub fn fetch_rows(
        &self,
        kind: Kind,
        bucket_size: Option<i64>,
        oldest: Option<i64>,
        newest: Option<i64>,
        water_tank_area_m2: f64,
    ) -> Result<Vec<(i64, Vec<f64>)>> {
        let mut rows = Vec::new();
        self.stream_rows(
            kind,
            bucket_size,
            oldest,
            newest,
            water_tank_area_m2,
            usize::MAX,
            |batch| {
                rows.extend_from_slice(batch);
                Ok(())
            },
        )?;
        Ok(rows)
    }

    /// Streams the half-open range `[oldest, newest)` in batches of at most
    /// `batch_rows`, calling `on_batch` once per batch. Used directly by the
    /// CSV download path so a slow client never forces the whole range into
    /// memory.
    pub fn stream_rows(
        &self,
        kind: Kind,
        bucket_size: Option<i64>,
        oldest: Option<i64>,
        newest: Option<i64>,
        water_tank_area_m2: f64,
        batch_rows: usize,
        mut on_batch: impl FnMut(&[(i64, Vec<f64>)]) -> Result<()>,
    ) -> Result<()> {
        let table = kind.table().name();
        let exprs = kind.column_exprs(water_tank_area_m2);
        let select_cols = exprs.join(", ");

        let mut where_clauses = Vec::new();
        if let Some(oldest) = oldest {
            where_clauses.push(format!("timestamp >= {oldest}"));
        }
        if let Some(newest) = newest {
            where_clauses.push(format!("timestamp < {newest}"));
        }
        let where_clause = if where_clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", where_clauses.join(" AND "))
        };

        let sql = match bucket_size {
            Some(bucket_size) => format!(
                "SELECT (timestamp / {bucket_size}) * {bucket_size} AS bucket, \
                 {agg} \
                 FROM {table} {where_clause} \
                 GROUP BY timestamp / {bucket_size} \
                 ORDER BY bucket",
                agg = exprs
                    .iter()
                    .map(|e| format!(", AVG({e})"))
                    .collect::<String>(),
            ),
            None => format!(
                "SELECT timestamp, {select_cols} FROM {table} {where_clause} ORDER BY timestamp"
            ),
        };

        let mut stmt = self.conn.prepare(&sql)?;
        let column_count = exprs.len();
        let mut rows = stmt.query([])?;

        let mut batch: Vec<(i64, Vec<f64>)> = Vec::with_capacity(batch_rows.min(1024));
        while let Some(row) = rows.next()? {
            let ts: i64 = row.get(0)?;
            let mut cols = Vec::with_capacity(column_count);
            for c in 0..column_count {
                let v: Option<f64> = row.get(c + 1)?;
                cols.push(v.unwrap_or(f64::NAN));
            }
            batch.push((ts, cols));
            if batch.len() >= batch_rows {
                on_batch(&batch)?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            on_batch(&batch)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MeterSample;

    fn sample(ts: i64, p1: f64) -> Sample {
        Sample::Meter(MeterSample {
            timestamp: Some(ts),
            timestamp_str: None,
            instant_power_1: p1,
            instant_power_2: 0.0,
            instant_power_3: 0.0,
            voltage_1: 230.0,
            voltage_2: 230.0,
            voltage_3: 230.0,
            peak_power: f64::NAN,
            peak_power_timestamp: None,
            peak_power_timestamp_str: None,
            gas_volume: f64::NAN,
            gas_timestamp: None,
            gas_timestamp_str: None,
        })
    }

    #[test]
    fn idempotent_insert() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        store.insert(&sample(1_700_000_000, 1000.0)).unwrap();
        store.insert(&sample(1_700_000_000, 1000.0)).unwrap();

        let rows = store
            .fetch_rows(Kind::Power, None, None, None, 1.0)
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1[0], 1000.0);
    }

    #[test]
    fn bucketed_range_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        for t in 0..120 {
            store.insert(&sample(t, t as f64)).unwrap();
        }
        let rows = store
            .fetch_rows(Kind::Power, Some(60), Some(0), Some(120), 1.0)
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 0);
        assert_eq!(rows[1].0, 60);
    }
}
