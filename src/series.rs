//! In-memory windowed bucket arrays (C2 Series, C3 MultiSeries).
//!
//! Pure data structures: no I/O, no locking. `Tracker` (see `tracker.rs`) owns
//! the canonical copy and mutates it under `DataStore`'s lock; clones handed
//! to subscribers are independent.

use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::sample::Table;

/// Logical signal family: which table it reads, how many columns, what unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Power,
    Gas,
    WaterHeight,
    /// Download-only quantity (spec §4.7): water height scaled by a
    /// configured tank cross-section to a volume. Never appears in the
    /// default `MultiSeries` configuration, only in `/download` queries.
    WaterVolume,
}

impl Kind {
    pub fn table(self) -> Table {
        match self {
            Kind::Power => Table::MeterSamples,
            Kind::Gas => Table::GasSamples,
            Kind::WaterHeight | Kind::WaterVolume => Table::WaterSamples,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Kind::Power => "power",
            Kind::Gas => "gas",
            Kind::WaterHeight => "water_height",
            Kind::WaterVolume => "water_volume",
        }
    }

    pub fn unit_label(self) -> &'static str {
        match self {
            Kind::Power => "W",
            Kind::Gas => "m3",
            Kind::WaterHeight => "m",
            Kind::WaterVolume => "m3",
        }
    }

    /// Column names as they appear in the wire/download header row.
    pub fn column_names(self) -> &'static [&'static str] {
        match self {
            Kind::Power => &["instant_power_1", "instant_power_2", "instant_power_3"],
            Kind::Gas => &["volume"],
            Kind::WaterHeight => &["height"],
            Kind::WaterVolume => &["volume"],
        }
    }

    pub fn column_count(self) -> usize {
        self.column_names().len()
    }

    /// Raw SQL expressions the Store evaluates server-side for each column,
    /// in the order of `column_names`. `water_tank_area_m2` only affects
    /// `WaterVolume`; it is ignored for every other kind.
    pub fn column_exprs(self, water_tank_area_m2: f64) -> Vec<String> {
        match self {
            Kind::Power => vec![
                "instant_power_1".to_string(),
                "instant_power_2".to_string(),
                "instant_power_3".to_string(),
            ],
            Kind::Gas => vec!["volume".to_string()],
            Kind::WaterHeight => vec![water_height_expr()],
            Kind::WaterVolume => vec![format!("({}) * {water_tank_area_m2}", water_height_expr())],
        }
    }

    pub fn from_str(s: &str) -> Option<Kind> {
        match s {
            "power" => Some(Kind::Power),
            "gas" => Some(Kind::Gas),
            "water_height" => Some(Kind::WaterHeight),
            "water_volume" => Some(Kind::WaterVolume),
            _ => None,
        }
    }
}

/// The sensor's documented 0.5-4.5V / 0-5m mapping (spec §6.1, ADDED §3).
pub fn water_height_expr() -> String {
    "(voltage_int/1023.0*5.0-0.5)/4.0*5.0".to_string()
}

/// A pair `(window_size, bucket_size)`, both in seconds. `bucket_size = None`
/// means one row per raw sample, no aggregation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buckets {
    pub window_size: i64,
    pub bucket_size: Option<i64>,
}

impl Buckets {
    pub fn new(window_size: i64, bucket_size: Option<i64>) -> Self {
        Self {
            window_size,
            bucket_size,
        }
    }

    /// The half-open range `[oldest, newest)` of every bucket that has
    /// *finished* given a latest-sample timestamp `t` (spec §3).
    pub fn bucket_bounds(&self, t: i64) -> (i64, i64) {
        match self.bucket_size {
            Some(bucket_size) => {
                let newest = (t + 1).div_euclid(bucket_size) * bucket_size;
                let oldest = newest - self.window_size;
                (oldest, newest)
            }
            None => (t - self.window_size, t + 1),
        }
    }
}

/// `values[column][row]`: one row per timestamp, one column per reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Series {
    pub kind: Kind,
    pub buckets: Buckets,
    pub timestamps: Vec<i64>,
    pub values: Vec<Vec<f64>>,
}

impl Series {
    pub fn empty(kind: Kind, buckets: Buckets) -> Self {
        Self {
            kind,
            buckets,
            timestamps: Vec::new(),
            values: vec![Vec::new(); kind.column_count()],
        }
    }

    /// Append rows (assumed already ordered by timestamp and disjoint from
    /// the existing range), then drop every entry that has fallen outside
    /// the rolling window.
    pub fn extend(&mut self, rows: &[(i64, Vec<f64>)]) {
        for (ts, cols) in rows {
            self.timestamps.push(*ts);
            for (c, v) in cols.iter().enumerate() {
                self.values[c].push(*v);
            }
        }
        self.drop_old();
    }

    fn drop_old(&mut self) {
        let Some(&newest) = self.timestamps.last() else {
            return;
        };
        self.drop_before(newest - self.buckets.window_size);
    }

    /// Delete the prefix with `timestamp < ts`.
    pub fn drop_before(&mut self, ts: i64) {
        let keep_from = self
            .timestamps
            .iter()
            .position(|&t| t >= ts)
            .unwrap_or(self.timestamps.len());
        if keep_from == 0 {
            return;
        }
        self.timestamps.drain(0..keep_from);
        for col in &mut self.values {
            col.drain(0..keep_from);
        }
    }

    pub fn encode(&self) -> SeriesEncoded {
        SeriesEncoded {
            window_size: Some(self.buckets.window_size),
            bucket_size: self.buckets.bucket_size,
            kind: self.kind.name().to_string(),
            unit_label: self.kind.unit_label().to_string(),
            timestamps: self.timestamps.clone(),
            values: self
                .values
                .iter()
                .map(|col| col.iter().map(|&v| JsonFloat(v)).collect())
                .collect(),
        }
    }
}

/// Named collection of `Series` (one per resolution), e.g. `minute`/`hour`.
#[derive(Debug, Clone, Default)]
pub struct MultiSeries {
    pub series: BTreeMap<String, Series>,
}

impl MultiSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, series: Series) {
        self.series.insert(name.into(), series);
    }

    pub fn get(&self, name: &str) -> Option<&Series> {
        self.series.get(name)
    }

    pub fn encode(&self) -> BTreeMap<String, SeriesEncoded> {
        self.series
            .iter()
            .map(|(name, series)| (name.clone(), series.encode()))
            .collect()
    }
}

/// An `f64` that serializes NaN as JSON `null` and deserializes `null` back
/// to NaN (spec §8.5 NaN round-trip).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JsonFloat(pub f64);

impl Serialize for JsonFloat {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for JsonFloat {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let opt = Option::<f64>::deserialize(deserializer)?;
        Ok(JsonFloat(opt.unwrap_or(f64::NAN)))
    }
}

/// Wire form of a `Series` (spec §6.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesEncoded {
    pub window_size: Option<i64>,
    pub bucket_size: Option<i64>,
    pub kind: String,
    pub unit_label: String,
    pub timestamps: Vec<i64>,
    pub values: Vec<Vec<JsonFloat>>,
}

/// Default per-metric resolution configuration (spec §3).
pub fn default_multi_series() -> MultiSeries {
    let mut m = MultiSeries::new();
    m.insert(
        "minute",
        Series::empty(Kind::Power, Buckets::new(60, Some(1))),
    );
    m.insert(
        "hour",
        Series::empty(Kind::Power, Buckets::new(3_600, Some(10))),
    );
    m.insert(
        "day",
        Series::empty(Kind::Power, Buckets::new(86_400, Some(60))),
    );
    m.insert(
        "week",
        Series::empty(Kind::Power, Buckets::new(604_800, Some(900))),
    );
    m.insert("gas", Series::empty(Kind::Gas, Buckets::new(604_800, None)));
    m.insert(
        "water",
        Series::empty(Kind::WaterHeight, Buckets::new(300, None)),
    );
    m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_bounds_divides_bucket_size() {
        let b = Buckets::new(3_600, Some(10));
        for t in [0_i64, 1, 9, 10, 11, 3_599, 3_600, 1_000_000] {
            let (oldest, newest) = b.bucket_bounds(t);
            assert_eq!(newest % 10, 0);
            assert_eq!(newest - oldest, 3_600);
        }
    }

    #[test]
    fn bucket_bounds_monotone_in_t() {
        let b = Buckets::new(60, Some(1));
        let mut prev_newest = i64::MIN;
        for t in 0..200 {
            let (_, newest) = b.bucket_bounds(t);
            assert!(newest >= prev_newest);
            prev_newest = newest;
        }
    }

    #[test]
    fn bucket_bounds_nil_bucket_size() {
        let b = Buckets::new(300, None);
        assert_eq!(b.bucket_bounds(1_000), (700, 1_001));
    }

    #[test]
    fn extend_keeps_window_invariant() {
        let mut s = Series::empty(Kind::Power, Buckets::new(10, Some(1)));
        let rows: Vec<(i64, Vec<f64>)> = (0..30).map(|t| (t, vec![t as f64, 0.0, 0.0])).collect();
        s.extend(&rows);
        assert!(s.timestamps.windows(2).all(|w| w[0] < w[1]));
        let span = s.timestamps.last().unwrap() - s.timestamps.first().unwrap();
        assert!(span <= 10);
        for col in &s.values {
            assert_eq!(col.len(), s.timestamps.len());
        }
    }

    #[test]
    fn json_float_round_trip_with_nan() {
        let original = vec![1.0, f64::NAN, -2.5];
        let encoded: Vec<JsonFloat> = original.iter().map(|&v| JsonFloat(v)).collect();
        let json = serde_json::to_string(&encoded).unwrap();
        assert!(json.contains("null"));
        let decoded: Vec<JsonFloat> = serde_json::from_str(&json).unwrap();
        for (a, b) in original.iter().zip(decoded.iter()) {
            if a.is_nan() {
                assert!(b.0.is_nan());
            } else {
                assert_eq!(*a, b.0);
            }
        }
    }
}
