use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_path: PathBuf,

    pub http_bind: String,
    pub static_root: Option<PathBuf>,

    pub serial_port: String,
    pub serial_baud: u32,
    pub serial_read_timeout: Duration,

    pub adc_enabled: bool,
    pub adc_period: Duration,
    pub adc_bit_delay: Duration,
    pub adc_reset_pin: u32,
    pub adc_next_pin: u32,
    pub adc_data_pin: u32,

    pub ingress_channel_capacity: usize,
    pub ingress_backlog_warn_threshold: usize,

    pub subscriber_queue_capacity: usize,

    pub water_tank_area_m2: f64,
    pub download_max_items: u64,
    pub download_batch_rows: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_path = PathBuf::from(env_string(
            "METER_DATABASE_PATH",
            Some("data.db".to_string()),
        )?);

        let http_bind = env_string("METER_HTTP_BIND", Some("0.0.0.0:8000".to_string()))?;
        let static_root = env_optional("METER_STATIC_ROOT").map(PathBuf::from);

        let serial_port =
            env_string("METER_SERIAL_PORT", Some("/dev/ttyUSB0".to_string()))?;
        let serial_baud = env_u64("METER_SERIAL_BAUD", Some(115_200))? as u32;
        let serial_read_timeout =
            Duration::from_secs(env_u64("METER_SERIAL_READ_TIMEOUT_SECONDS", Some(10))?);

        let adc_enabled = env_bool("METER_ADC_ENABLED", false)?;
        let adc_period = Duration::from_millis(env_u64("METER_ADC_PERIOD_MS", Some(1_000))?);
        let adc_bit_delay = Duration::from_millis(env_u64("METER_ADC_BIT_DELAY_MS", Some(100))?);
        let adc_reset_pin = env_u64("METER_ADC_RESET_PIN", Some(17))? as u32;
        let adc_next_pin = env_u64("METER_ADC_NEXT_PIN", Some(27))? as u32;
        let adc_data_pin = env_u64("METER_ADC_DATA_PIN", Some(22))? as u32;

        let ingress_channel_capacity =
            env_u64("METER_INGRESS_CHANNEL_CAPACITY", Some(1_024))? as usize;
        let ingress_backlog_warn_threshold =
            env_u64("METER_INGRESS_BACKLOG_WARN_THRESHOLD", Some(10))? as usize;

        let subscriber_queue_capacity =
            env_u64("METER_SUBSCRIBER_QUEUE_CAPACITY", Some(32))? as usize;

        let water_tank_area_m2 = env_f64("METER_WATER_TANK_AREA_M2", Some(1.0))?;
        let download_max_items = env_u64("METER_DOWNLOAD_MAX_ITEMS", Some(1_000_000))?;
        let download_batch_rows = env_u64("METER_DOWNLOAD_BATCH_ROWS", Some(10_240))? as usize;

        Ok(Self {
            database_path,
            http_bind,
            static_root,
            serial_port,
            serial_baud,
            serial_read_timeout,
            adc_enabled,
            adc_period,
            adc_bit_delay,
            adc_reset_pin,
            adc_next_pin,
            adc_data_pin,
            ingress_channel_capacity,
            ingress_backlog_warn_threshold,
            subscriber_queue_capacity,
            water_tank_area_m2,
            download_max_items,
            download_batch_rows,
        })
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value.trim().parse::<u64>().with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => value.trim().parse::<f64>().with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(anyhow!("invalid boolean for {key}: {other}")),
        },
        Err(_) => Ok(default),
    }
}
