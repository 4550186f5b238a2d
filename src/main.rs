mod adc;
mod config;
mod datastore;
mod download;
mod error;
mod http;
mod ingress;
mod parse;
mod sample;
mod series;
mod store;
mod tracker;
mod ws;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::adc::{Adc, SysfsInput, SysfsOutput};
use crate::config::Config;
use crate::datastore::DataStore;
use crate::sample::Sample;
use crate::store::Store;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,meter_telemetry_server=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    init_tracing()?;

    let store = Store::open(&config.database_path)
        .map_err(|err| anyhow::anyhow!("failed to open store: {err}"))?;
    let datastore = Arc::new(DataStore::new(store, config.water_tank_area_m2));

    let (ingress_tx, ingress_rx) = mpsc::channel::<Sample>(config.ingress_channel_capacity);

    let serial_config = config.clone();
    let serial_tx = ingress_tx.clone();
    let serial_handle = tokio::spawn(async move {
        ingress::serial_producer::run(&serial_config, serial_tx).await;
    });

    if config.adc_enabled {
        let adc_config = config.clone();
        let adc_tx = ingress_tx.clone();
        tokio::spawn(async move {
            match build_adc(&adc_config) {
                Ok(adc) => ingress::adc_producer::run(&adc_config, adc, adc_tx).await,
                Err(err) => tracing::error!(error = %err, "failed to initialize adc, producer not started"),
            }
        });
    }

    // The router is the sole receiver; dropping our clone here lets the
    // channel close once every producer has exited.
    drop(ingress_tx);

    let router_config = config.clone();
    let router_datastore = datastore.clone();
    let router_handle = tokio::spawn(async move {
        ingress::router::run(&router_config, router_datastore, ingress_rx).await;
    });

    let app = http::router(config.clone(), datastore.clone());
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind = %config.http_bind, "telemetry server listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = serial_handle => {}
        _ = router_handle => {}
        _ = http_handle => {}
    }

    Ok(())
}

fn build_adc(config: &Config) -> std::io::Result<Adc<SysfsOutput, SysfsOutput, SysfsInput>> {
    let reset_n = SysfsOutput::export(config.adc_reset_pin)?;
    let next_n = SysfsOutput::export(config.adc_next_pin)?;
    let data = SysfsInput::export(config.adc_data_pin)?;
    Ok(Adc::new(reset_n, next_n, data, config.adc_bit_delay))
}
