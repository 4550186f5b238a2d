//! Tracker (C4): owns the canonical `MultiSeries` and computes the
//! incremental delta for each newly ingested sample.

use std::collections::HashMap;

use crate::error::Result;
use crate::sample::{Table, TouchedTables};
use crate::series::{default_multi_series, MultiSeries, Series};
use crate::store::Store;

pub struct Tracker {
    multi_series: MultiSeries,
    /// `table -> last_ingested_timestamp`. Keyed by table, not by series:
    /// series sharing a table (spec §9 open question (c)) share a cursor.
    last_ingested: HashMap<Table, i64>,
    water_tank_area_m2: f64,
}

impl Tracker {
    pub fn new(water_tank_area_m2: f64) -> Self {
        Self {
            multi_series: default_multi_series(),
            last_ingested: HashMap::new(),
            water_tank_area_m2,
        }
    }

    /// For each series whose table was touched by the write that just
    /// happened, fetch any buckets that newly closed and fold them into
    /// both the canonical series and the returned delta. Series for tables
    /// untouched this call, or whose bucket bounds haven't advanced, are
    /// simply absent from the delta.
    pub fn update(
        &mut self,
        store: &Store,
        updated_tables: &TouchedTables,
        curr_ts: i64,
    ) -> Result<MultiSeries> {
        let mut delta = MultiSeries::new();

        for (name, series) in self.multi_series.series.iter_mut() {
            let table = series.kind.table();
            if !updated_tables.contains(&table) {
                continue;
            }

            let (curr_oldest, curr_newest) = series.buckets.bucket_bounds(curr_ts);
            let prev = self.last_ingested.get(&table).copied();

            let batch = match prev {
                None => store.fetch_rows(
                    series.kind,
                    series.buckets.bucket_size,
                    Some(curr_oldest),
                    Some(curr_newest),
                    self.water_tank_area_m2,
                )?,
                Some(prev_ts) => {
                    let (_, prev_newest) = series.buckets.bucket_bounds(prev_ts);
                    if curr_newest == prev_newest {
                        continue;
                    }
                    store.fetch_rows(
                        series.kind,
                        series.buckets.bucket_size,
                        Some(prev_newest),
                        Some(curr_newest),
                        self.water_tank_area_m2,
                    )?
                }
            };

            if batch.is_empty() {
                continue;
            }

            series.extend(&batch);

            let mut delta_series = Series::empty(series.kind, series.buckets);
            delta_series.extend(&batch);
            delta.insert(name.clone(), delta_series);
        }

        for table in updated_tables {
            self.last_ingested.insert(*table, curr_ts);
        }

        Ok(delta)
    }

    /// Deep clone of the current canonical state (bootstrap snapshot).
    pub fn snapshot(&self) -> MultiSeries {
        self.multi_series.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::{MeterSample, Sample};

    fn meter_sample(ts: i64, p1: f64) -> Sample {
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
    fn second_ingest_of_same_sample_yields_empty_delta() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut tracker = Tracker::new(1.0);

        let s = meter_sample(1_700_000_000, 1_000.0);
        let touched = store.insert(&s).unwrap();
        let delta1 = tracker.update(&store, &touched, 1_700_000_000).unwrap();
        assert!(!delta1.get("minute").unwrap().timestamps.is_empty());

        let touched2 = store.insert(&s).unwrap();
        let delta2 = tracker.update(&store, &touched2, 1_700_000_000).unwrap();
        assert!(delta2.series.is_empty() || delta2.get("minute").unwrap().timestamps.is_empty());
    }

    #[test]
    fn first_hour_bucket_closes_and_averages_to_4_5() {
        // Ingesting one sample per second for t=0..19 (spec §8 S3): once the
        // bucket-bounds formula's `newest` advances past the `[0, 10)`
        // bucket, the delta must contain exactly that bucket's average.
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut tracker = Tracker::new(1.0);

        let mut saw_bucket = false;
        for t in 0..20 {
            let s = meter_sample(t, t as f64);
            let touched = store.insert(&s).unwrap();
            let delta = tracker.update(&store, &touched, t).unwrap();
            if let Some(hour) = delta.get("hour") {
                if hour.timestamps == vec![0] {
                    assert!((hour.values[0][0] - 4.5).abs() < 1e-9);
                    saw_bucket = true;
                }
            }
        }
        assert!(saw_bucket, "the [0, 10) hour bucket must close exactly once");
    }

    #[test]
    fn gas_and_power_independence_in_one_delta() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let mut tracker = Tracker::new(1.0);

        let s = Sample::Meter(MeterSample {
            timestamp: Some(1_000),
            timestamp_str: None,
            instant_power_1: 500.0,
            instant_power_2: 0.0,
            instant_power_3: 0.0,
            voltage_1: 230.0,
            voltage_2: 230.0,
            voltage_3: 230.0,
            peak_power: f64::NAN,
            peak_power_timestamp: None,
            peak_power_timestamp_str: None,
            gas_volume: 12.5,
            gas_timestamp: Some(900),
            gas_timestamp_str: None,
        });
        let touched = store.insert(&s).unwrap();
        let delta = tracker.update(&store, &touched, 1_000).unwrap();

        assert!(!delta.get("minute").unwrap().timestamps.is_empty());
        assert!(!delta.get("gas").unwrap().timestamps.is_empty());
    }
}
