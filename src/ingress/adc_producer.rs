//! ADC producer (C6): bit-bangs the 10-bit water-level ADC once per period
//! and emits an `AdcSample`.

use tokio::sync::mpsc;

use crate::adc::{Adc, GpioLine};
use crate::config::Config;
use crate::sample::{AdcSample, Sample};

/// Runs for the process lifetime. Returns only if `tx` closes (shutdown).
pub async fn run<R: GpioLine, N: GpioLine, D: GpioLine>(
    config: &Config,
    mut adc: Adc<R, N, D>,
    tx: mpsc::Sender<Sample>,
) {
    let mut ticker = tokio::time::interval(config.adc_period);
    loop {
        ticker.tick().await;
        let raw = adc.readout().await;
        let now = now_unix();
        let sample = Sample::Adc(AdcSample {
            timestamp: now,
            voltage_int: raw,
        });
        if tx.send(sample).await.is_err() {
            return;
        }
    }
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
