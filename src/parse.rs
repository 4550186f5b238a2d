//! Meter text protocol parser (collaborator contract, spec §6.1).
//!
//! The stream is a sequence of records separated by blank lines. Each
//! record is a set of lines shaped `KEY(VALUE)` or `KEY(TS)(VALUE)`; a line
//! starting with `!` terminates the record early; a line that doesn't match
//! the grammar marks the record `unclean` (dropped, never yields a
//! `MeterSample`).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use crate::sample::MeterSample;

static PATTERN_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?P<key>\d+-\d+:\d+\.\d+\.\d+)(?P<rest>.*)$").unwrap());
static PATTERN_VALUE_TST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\((?P<timestamp>\d{12})(?P<dst>[SW])\)\((?P<value>[^()]*)\)$").unwrap()
});
static PATTERN_VALUE_SINGLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\((?P<value>[^()]*)\)$").unwrap());
static PATTERN_KW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+\.\d+)\*kW$").unwrap());
static PATTERN_V: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+\.\d+)\*V$").unwrap());
static PATTERN_M3: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(\d+\.\d+)\*m3$").unwrap());

const KEY_TIMESTAMP: &str = "0-0:1.0.0";
const KEY_POWER_1: &str = "1-0:21.7.0";
const KEY_POWER_2: &str = "1-0:41.7.0";
const KEY_POWER_3: &str = "1-0:61.7.0";
const KEY_VOLTAGE_1: &str = "1-0:32.7.0";
const KEY_VOLTAGE_2: &str = "1-0:52.7.0";
const KEY_VOLTAGE_3: &str = "1-0:72.7.0";
const KEY_PEAK_POWER: &str = "1-0:1.6.0";
const KEY_GAS: &str = "0-1:24.2.3";

/// One parsed `KEY(...)` item: a raw value and, for `KEY(TS)(VALUE)` items,
/// the decoded timestamp (both as seconds since epoch and the original
/// `YYMMDDHHMMSS` + DST-flag string).
#[derive(Debug, Clone, PartialEq)]
struct MessageValue {
    value: String,
    timestamp: Option<i64>,
    timestamp_str: Option<String>,
}

impl MessageValue {
    fn parse(rest: &str) -> Self {
        if let Some(caps) = PATTERN_VALUE_TST.captures(rest) {
            let raw_ts = &caps["timestamp"];
            let dst = &caps["dst"] == "S";
            let value = caps["value"].to_string();
            let (timestamp, timestamp_str) = match decode_timestamp(raw_ts, dst) {
                Some((ts, s)) => (Some(ts), Some(s)),
                None => (None, None),
            };
            return MessageValue {
                value,
                timestamp,
                timestamp_str,
            };
        }
        if let Some(caps) = PATTERN_VALUE_SINGLE.captures(rest) {
            return MessageValue {
                value: caps["value"].to_string(),
                timestamp: None,
                timestamp_str: None,
            };
        }
        MessageValue {
            value: rest.to_string(),
            timestamp: None,
            timestamp_str: None,
        }
    }
}

/// Decodes a 12-digit `yymmddhhmmss` timestamp with a DST flag (`S` =
/// UTC+2, `W` = UTC+1) into Unix seconds plus the canonical display string.
fn decode_timestamp(raw: &str, dst: bool) -> Option<(i64, String)> {
    let yy: i32 = raw.get(0..2)?.parse().ok()?;
    let mm: u32 = raw.get(2..4)?.parse().ok()?;
    let dd: u32 = raw.get(4..6)?.parse().ok()?;
    let hh: u32 = raw.get(6..8)?.parse().ok()?;
    let mi: u32 = raw.get(8..10)?.parse().ok()?;
    let ss: u32 = raw.get(10..12)?.parse().ok()?;
    let year = 2000 + yy;

    let days = days_from_civil(year, mm, dd)?;
    let offset_hours: i64 = if dst { 2 } else { 1 };
    let local_seconds =
        days * 86_400 + hh as i64 * 3_600 + mi as i64 * 60 + ss as i64;
    let utc_seconds = local_seconds - offset_hours * 3_600;

    let display = format!(
        "{year:04}-{mm:02}-{dd:02} {hh:02}:{mi:02}:{ss:02}{}",
        if dst { " DST" } else { "" }
    );
    Some((utc_seconds, display))
}

/// Howard Hinnant's days-from-civil algorithm (proleptic Gregorian, days
/// since 1970-01-01), used instead of pulling in a datetime crate for one
/// timestamp decode.
fn days_from_civil(y: i32, m: u32, d: u32) -> Option<i64> {
    if !(1..=12).contains(&m) || !(1..=31).contains(&d) {
        return None;
    }
    let y = if m <= 2 { y - 1 } else { y } as i64;
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = (y - era * 400) as i64;
    let mp = ((m as i64 + 9) % 12) as i64;
    let doy = (153 * mp + 2) / 5 + d as i64 - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    Some(era * 146_097 + doe - 719_468)
}

fn parse_power(value: Option<&str>) -> f64 {
    match value.and_then(|v| PATTERN_KW.captures(v)) {
        Some(caps) => caps[1].parse::<f64>().unwrap_or(f64::NAN) * 1000.0,
        None => f64::NAN,
    }
}

fn parse_voltage(value: Option<&str>) -> f64 {
    match value.and_then(|v| PATTERN_V.captures(v)) {
        Some(caps) => caps[1].parse::<f64>().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}

fn parse_volume(value: Option<&str>) -> f64 {
    match value.and_then(|v| PATTERN_M3.captures(v)) {
        Some(caps) => caps[1].parse::<f64>().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}

/// One record's worth of successfully-matched `KEY -> value` pairs, plus
/// whether every line in the record matched the grammar (`clean`).
#[derive(Debug, Default)]
struct RawRecord {
    values: HashMap<String, MessageValue>,
    clean: bool,
}

impl RawRecord {
    fn from_lines(lines: &[String]) -> Self {
        let mut values = HashMap::new();
        let mut clean = true;

        for line in lines {
            if line.starts_with('!') {
                break;
            }
            let Some(caps) = PATTERN_ITEM.captures(line) else {
                clean = false;
                continue;
            };
            let key = caps["key"].to_string();
            let value = MessageValue::parse(&caps["rest"]);
            if values.insert(key, value).is_some() {
                clean = false;
            }
        }

        Self { values, clean }
    }

    fn to_meter_sample(&self) -> Option<MeterSample> {
        if !self.clean {
            return None;
        }
        let get = |k: &str| self.values.get(k);

        let timestamp = get(KEY_TIMESTAMP).and_then(|v| v.timestamp.or_else(|| v.value.parse().ok()));
        let timestamp_str = get(KEY_TIMESTAMP).and_then(|v| v.timestamp_str.clone());

        let peak = get(KEY_PEAK_POWER);
        let peak_power = peak.map(|v| parse_power(Some(&v.value))).unwrap_or(f64::NAN);
        let peak_power_timestamp = peak.and_then(|v| v.timestamp);
        let peak_power_timestamp_str = peak.and_then(|v| v.timestamp_str.clone());

        let gas = get(KEY_GAS);
        let gas_volume = gas.map(|v| parse_volume(Some(&v.value))).unwrap_or(f64::NAN);
        let gas_timestamp = gas.and_then(|v| v.timestamp);
        let gas_timestamp_str = gas.and_then(|v| v.timestamp_str.clone());

        Some(MeterSample {
            timestamp,
            timestamp_str,
            instant_power_1: parse_power(get(KEY_POWER_1).map(|v| v.value.as_str())),
            instant_power_2: parse_power(get(KEY_POWER_2).map(|v| v.value.as_str())),
            instant_power_3: parse_power(get(KEY_POWER_3).map(|v| v.value.as_str())),
            voltage_1: parse_voltage(get(KEY_VOLTAGE_1).map(|v| v.value.as_str())),
            voltage_2: parse_voltage(get(KEY_VOLTAGE_2).map(|v| v.value.as_str())),
            voltage_3: parse_voltage(get(KEY_VOLTAGE_3).map(|v| v.value.as_str())),
            peak_power,
            peak_power_timestamp,
            peak_power_timestamp_str,
            gas_volume,
            gas_timestamp,
            gas_timestamp_str,
        })
    }
}

/// Streaming parser: feed it newline-terminated lines with `push_line`.
/// `wait_for_sync` discards everything up to the first blank line so a
/// mid-record connection doesn't yield a truncated first sample.
pub struct Parser {
    wait_for_sync: bool,
    lines: Vec<String>,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Self {
            wait_for_sync: true,
            lines: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.wait_for_sync = true;
        self.lines.clear();
    }

    /// Pushes one line (without its newline). Returns `Some(sample)` only
    /// when a blank line completes a *clean* record.
    pub fn push_line(&mut self, line: &str) -> Option<MeterSample> {
        let line = line.trim();
        if line.is_empty() {
            self.wait_for_sync = false;
            if self.lines.is_empty() {
                return None;
            }
            let record = RawRecord::from_lines(&self.lines);
            self.lines.clear();
            return record.to_meter_sample();
        }
        if !self.wait_for_sync {
            self.lines.push(line.to_string());
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut Parser, text: &str) -> Vec<MeterSample> {
        let mut out = Vec::new();
        for line in text.lines() {
            if let Some(sample) = parser.push_line(line) {
                out.push(sample);
            }
        }
        out
    }

    #[test]
    fn clean_record_yields_sample() {
        let mut parser = Parser::new();
        // first blank line only releases wait_for_sync
        let text = "\n1-0:21.7.0(01.234*kW)\n1-0:41.7.0(00.000*kW)\n1-0:61.7.0(00.000*kW)\n1-0:32.7.0(230.1*V)\n1-0:52.7.0(229.8*V)\n1-0:72.7.0(230.4*V)\n!\n";
        let samples = feed(&mut parser, text);
        assert_eq!(samples.len(), 1);
        assert!((samples[0].instant_power_1 - 1234.0).abs() < 1e-6);
        assert!((samples[0].voltage_1 - 230.1).abs() < 1e-6);
    }

    #[test]
    fn unmatched_line_marks_record_unclean() {
        let mut parser = Parser::new();
        let text = "\ngarbage line that does not match\n1-0:21.7.0(01.000*kW)\n!\n";
        let samples = feed(&mut parser, text);
        assert!(samples.is_empty());
    }

    #[test]
    fn duplicate_key_marks_record_unclean() {
        let mut parser = Parser::new();
        let text = "\n1-0:21.7.0(01.000*kW)\n1-0:21.7.0(02.000*kW)\n!\n";
        let samples = feed(&mut parser, text);
        assert!(samples.is_empty());
    }

    #[test]
    fn timestamped_value_decodes_dst() {
        let mut parser = Parser::new();
        let text = "\n1-0:1.6.0(230101120000S)(05.678*kW)\n!\n";
        let samples = feed(&mut parser, text);
        assert_eq!(samples.len(), 1);
        let sample = &samples[0];
        assert!(sample.peak_power_timestamp.is_some());
        assert!((sample.peak_power - 5678.0).abs() < 1e-6);
    }

    #[test]
    fn gas_volume_parses_m3_suffix() {
        let mut parser = Parser::new();
        let text = "\n0-1:24.2.3(230101120000W)(01234.567*m3)\n!\n";
        let samples = feed(&mut parser, text);
        assert_eq!(samples.len(), 1);
        assert!((samples[0].gas_volume - 1234.567).abs() < 1e-6);
    }
}
