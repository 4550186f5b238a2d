//! The heterogeneous message stream produced by ingress workers (C6).
//!
//! The upstream implementation dispatches on a Python union at runtime; here
//! it's a tagged enum matched exhaustively wherever it matters (`Store::insert`,
//! `DataStore::process`).

use std::collections::HashSet;
use std::fmt;

/// A table in the persistent store. `last_ingested` in the Tracker is keyed
/// by this, not by series name (spec §9 open question (c)).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Table {
    MeterSamples,
    MeterPeaks,
    GasSamples,
    WaterSamples,
}

impl Table {
    pub fn name(self) -> &'static str {
        match self {
            Table::MeterSamples => "meter_samples",
            Table::MeterPeaks => "meter_peaks",
            Table::GasSamples => "gas_samples",
            Table::WaterSamples => "water_samples",
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub type TouchedTables = HashSet<Table>;

/// One electrical-meter record. `timestamp` carries the "now" reading; the
/// peak-power and gas readings are reported with their own, independently
/// advancing timestamps (spec §3).
#[derive(Debug, Clone, PartialEq)]
pub struct MeterSample {
    pub timestamp: Option<i64>,
    pub timestamp_str: Option<String>,

    pub instant_power_1: f64,
    pub instant_power_2: f64,
    pub instant_power_3: f64,

    pub voltage_1: f64,
    pub voltage_2: f64,
    pub voltage_3: f64,

    pub peak_power: f64,
    pub peak_power_timestamp: Option<i64>,
    pub peak_power_timestamp_str: Option<String>,

    pub gas_volume: f64,
    pub gas_timestamp: Option<i64>,
    pub gas_timestamp_str: Option<String>,
}

impl MeterSample {
    /// Picks the timestamp used to drive tracker bucket bounds: the meter's
    /// own timestamp if present, else the first non-nil of peak/gas, in that
    /// documented order (spec §9 open question (a)).
    pub fn driving_timestamp(&self) -> Option<i64> {
        self.timestamp
            .or(self.peak_power_timestamp)
            .or(self.gas_timestamp)
    }
}

/// One raw 10-bit ADC reading of the water-level sensor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdcSample {
    pub timestamp: i64,
    pub voltage_int: u16,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Meter(MeterSample),
    Adc(AdcSample),
}

impl Sample {
    /// The timestamp used to decide which tracker buckets have newly closed.
    pub fn driving_timestamp(&self) -> Option<i64> {
        match self {
            Sample::Meter(m) => m.driving_timestamp(),
            Sample::Adc(a) => Some(a.timestamp),
        }
    }
}
