//! Serial producer (C6): reads newline-terminated frames from the meter's
//! serial port, feeds them to the text-protocol `Parser`, and emits a
//! `MeterSample` for every clean record.

use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;

use crate::config::Config;
use crate::parse::Parser;
use crate::sample::Sample;

/// Runs for the process lifetime, reconnecting on open failure. Never
/// returns under normal operation; returns only if `tx` is closed (the
/// Router shut down).
pub async fn run(config: &Config, tx: mpsc::Sender<Sample>) {
    loop {
        match open_port(config) {
            Ok(port) => {
                tracing::info!(port = %config.serial_port, "serial producer connected");
                if !read_loop(config, port, &tx).await {
                    return;
                }
            }
            Err(err) => {
                tracing::warn!(port = %config.serial_port, error = %err, "failed to open serial port, retrying");
            }
        }
        tokio::time::sleep(Duration::from_secs(5)).await;
    }
}

fn open_port(config: &Config) -> tokio_serial::Result<tokio_serial::SerialStream> {
    tokio_serial::new(&config.serial_port, config.serial_baud)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .open_native_async()
}

/// Returns `false` once the channel to the Router is closed (shutdown).
async fn read_loop(
    config: &Config,
    port: tokio_serial::SerialStream,
    tx: &mpsc::Sender<Sample>,
) -> bool {
    let mut reader = BufReader::new(port);
    let mut parser = Parser::new();
    let mut line = String::new();

    loop {
        line.clear();
        let read = tokio::time::timeout(config.serial_read_timeout, reader.read_line(&mut line)).await;

        let n = match read {
            Ok(Ok(n)) => n,
            Ok(Err(err)) if err.kind() == std::io::ErrorKind::InvalidData => {
                // Malformed UTF-8 on the wire: spec §7 classifies this as
                // TransientIO, same policy as a read timeout below. Reset the
                // parser and keep reading on the same connection.
                tracing::warn!(error = %err, "serial decode error, resetting parser");
                parser.reset();
                continue;
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %err, "serial read error, reconnecting");
                return true;
            }
            Err(_) => {
                tracing::warn!("serial read timeout, resetting parser");
                parser.reset();
                continue;
            }
        };

        if n == 0 {
            tracing::warn!("serial port closed by peer");
            return true;
        }

        if let Some(sample) = parser.push_line(&line) {
            if tx.send(Sample::Meter(sample)).await.is_err() {
                return false;
            }
        }
    }
}
