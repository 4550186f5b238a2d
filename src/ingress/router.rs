//! Router (C7): the sole consumer of the ingress channel. Invokes
//! `DataStore::process` for each message; a `StoreIO` failure is logged and
//! the message dropped, the router itself never crashes on one bad write.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::datastore::DataStore;
use crate::sample::Sample;

pub async fn run(config: &Config, datastore: Arc<DataStore>, mut rx: mpsc::Receiver<Sample>) {
    while let Some(sample) = rx.recv().await {
        let depth = rx.len();
        if depth > config.ingress_backlog_warn_threshold {
            tracing::warn!(depth, "ingress channel backlog above soft threshold");
        }

        if let Err(err) = datastore.process(&sample) {
            tracing::error!(error = %err, "failed to process sample, dropping it");
        }
    }
    tracing::info!("router exiting: ingress channel closed");
}
