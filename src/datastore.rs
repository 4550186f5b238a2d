//! DataStore (C5): serializes the write path (store insert -> tracker
//! update -> broadcast) and manages the live-subscriber set, all under one
//! lock so snapshot + subsequent deltas are always a consistent
//! prefix/suffix partition of the canonical state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::error::Result;
use crate::sample::Sample;
use crate::series::MultiSeries;
use crate::store::Store;
use crate::tracker::Tracker;

pub type SubscriberId = u64;

struct Inner {
    store: Store,
    tracker: Tracker,
    subscribers: HashMap<SubscriberId, mpsc::Sender<MultiSeries>>,
}

pub struct DataStore {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl DataStore {
    pub fn new(store: Store, water_tank_area_m2: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                store,
                tracker: Tracker::new(water_tank_area_m2),
                subscribers: HashMap::new(),
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// Atomically inserts the sample, updates the tracker, and fans the
    /// resulting delta out to every subscriber. A slow subscriber (full
    /// queue) only drops its own delta; it never blocks ingest.
    pub fn process(&self, sample: &Sample) -> Result<()> {
        let mut inner = self.inner.lock().expect("datastore mutex poisoned");

        let touched = inner.store.insert(sample)?;
        if touched.is_empty() {
            return Ok(());
        }
        let Some(curr_ts) = sample.driving_timestamp() else {
            return Ok(());
        };

        let delta = inner.tracker.update(&inner.store, &touched, curr_ts)?;
        if delta.series.is_empty() {
            return Ok(());
        }

        for (id, tx) in inner.subscribers.iter() {
            match tx.try_send(delta.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(subscriber_id = id, "subscriber queue full, dropping delta");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    tracing::debug!(subscriber_id = id, "subscriber channel closed, dropping delta");
                }
            }
        }
        Ok(())
    }

    /// Registers `tx` as a live subscriber and returns the current canonical
    /// state, atomically with respect to `process`: no sample is both in the
    /// returned snapshot and the first delta sent afterwards, and none is
    /// missed in between.
    pub fn subscribe(&self, tx: mpsc::Sender<MultiSeries>) -> (SubscriberId, MultiSeries) {
        let mut inner = self.inner.lock().expect("datastore mutex poisoned");
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let snapshot = inner.tracker.snapshot();
        inner.subscribers.insert(id, tx);
        (id, snapshot)
    }

    pub fn unsubscribe(&self, id: SubscriberId) {
        let mut inner = self.inner.lock().expect("datastore mutex poisoned");
        inner.subscribers.remove(&id);
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("datastore mutex poisoned").subscribers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sample::MeterSample;

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
    fn bootstrap_only_snapshot_has_every_series_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let ds = DataStore::new(store, 1.0);

        let (tx, _rx) = mpsc::channel(8);
        let (_id, snapshot) = ds.subscribe(tx);

        assert_eq!(snapshot.series.len(), 6);
        for series in snapshot.series.values() {
            assert!(series.timestamps.is_empty());
        }
    }

    #[tokio::test]
    async fn single_sample_produces_expected_minute_delta() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let ds = DataStore::new(store, 1.0);

        let (tx, mut rx) = mpsc::channel(8);
        let (_id, _initial) = ds.subscribe(tx);

        ds.process(&meter_sample(1_700_000_000, 1_000.0)).unwrap();

        let delta = rx.recv().await.unwrap();
        let minute = delta.get("minute").unwrap();
        assert_eq!(minute.timestamps, vec![1_700_000_000]);
        assert_eq!(minute.values[0], vec![1_000.0]);
        assert!(delta.get("hour").map(|s| s.timestamps.is_empty()).unwrap_or(true));
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_stall_ingest_or_other_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let ds = DataStore::new(store, 1.0);

        let (slow_tx, _slow_rx) = mpsc::channel(1);
        let (_slow_id, _) = ds.subscribe(slow_tx.clone());
        // fill the slow subscriber's queue without draining it
        slow_tx.try_send(MultiSeries::new()).unwrap();

        let (healthy_tx, mut healthy_rx) = mpsc::channel(8);
        let (_healthy_id, _) = ds.subscribe(healthy_tx);

        ds.process(&meter_sample(1_700_000_000, 1_000.0)).unwrap();

        let delta = healthy_rx.recv().await.unwrap();
        assert!(!delta.get("minute").unwrap().timestamps.is_empty());
    }

    #[tokio::test]
    async fn deltas_applied_to_snapshot_reconstruct_canonical_state() {
        // Property 4: a subscriber that bootstraps with `subscribe`'s
        // snapshot and then folds every received delta into it via
        // `Series::extend` must end up bit-for-bit where the canonical
        // Tracker landed, including a bucket closing partway through.
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path().join("db.sqlite")).unwrap();
        let ds = DataStore::new(store, 1.0);

        let (tx, mut rx) = mpsc::channel(128);
        let (_id, mut reconstructed) = ds.subscribe(tx);

        for t in 0..20_i64 {
            ds.process(&meter_sample(t, t as f64)).unwrap();
        }

        while let Ok(delta) = rx.try_recv() {
            for (name, delta_series) in delta.series.iter() {
                let target = reconstructed
                    .series
                    .get_mut(name)
                    .expect("bootstrap snapshot is missing a series the delta carries");
                let rows: Vec<(i64, Vec<f64>)> = delta_series
                    .timestamps
                    .iter()
                    .enumerate()
                    .map(|(i, &ts)| {
                        (ts, delta_series.values.iter().map(|col| col[i]).collect())
                    })
                    .collect();
                target.extend(&rows);
            }
        }

        let (_, canonical) = ds.subscribe(mpsc::channel(1).0);
        assert_eq!(reconstructed.series, canonical.series);
    }
}
