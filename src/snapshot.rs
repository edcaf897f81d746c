//! The single published state of the daemon.
//!
//! `SnapshotStore` owns one `Snapshot` behind an `RwLock`. The poll loop is the only
//! writer; the dashboard and persistence take owned copies through `read()`. Writers
//! build the successor snapshot from a copy and swap it in whole, so a reader never
//! sees a record from one cycle paired with a report from another.
//!
//! Position changes are also announced on a `tokio::sync::watch` channel for the live
//! stream. Repeated publishes of the same position do not wake subscribers.

use crate::compare::DriftReport;
use crate::error::{CycleError, ErrorKind};
use crate::extract::LocationRecord;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RecordedError {
    pub kind: ErrorKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    pub record: Option<LocationRecord>,
    pub report: Option<DriftReport>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<RecordedError>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl Snapshot {
    /// True when nothing has been published yet, or the last success is older than `max_age`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        match self.last_success_at {
            None => true,
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                .map(|age| age > max_age)
                .unwrap_or(false),
        }
    }

    /// How far the GPS clock trails the host clock, from the last report.
    pub fn gps_lag_s(&self) -> Option<f64> {
        self.report.map(|r| r.gps_lag_s())
    }

    /// The GPS reading is older than one poll interval relative to the host clock.
    pub fn is_gps_stale(&self, interval: Duration) -> bool {
        self.gps_lag_s()
            .map(|lag| lag > interval.as_secs_f64())
            .unwrap_or(false)
    }
}

/// The payload of a live `update` event: where the receiver is and when it got there.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct LocationUpdate {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_meters: f64,
    pub updated_at: DateTime<Utc>,
}

impl LocationUpdate {
    fn new(record: &LocationRecord, at: DateTime<Utc>) -> Self {
        LocationUpdate {
            latitude: record.latitude,
            longitude: record.longitude,
            altitude_meters: record.altitude_meters,
            updated_at: at,
        }
    }

    fn same_position(&self, other: &LocationUpdate) -> bool {
        self.latitude == other.latitude
            && self.longitude == other.longitude
            && self.altitude_meters == other.altitude_meters
    }
}

pub struct SnapshotStore {
    current: RwLock<Snapshot>,
    persist_path: Option<PathBuf>,
    updates: watch::Sender<Option<LocationUpdate>>,
}

impl SnapshotStore {
    /// An empty store. With a path, every publish is written there.
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        Self::with_snapshot(Snapshot::default(), persist_path)
    }

    fn with_snapshot(initial: Snapshot, persist_path: Option<PathBuf>) -> Self {
        let last_position = match (initial.record, initial.last_success_at) {
            (Some(record), Some(at)) => Some(LocationUpdate::new(&record, at)),
            _ => None,
        };
        let (updates, _) = watch::channel(last_position);
        SnapshotStore {
            current: RwLock::new(initial),
            persist_path,
            updates,
        }
    }

    /// Start from the snapshot persisted by a previous run, if there is a usable one.
    pub fn restore(persist_path: Option<PathBuf>) -> Self {
        let initial = match persist_path.as_deref() {
            Some(path) => match load(path) {
                Ok(Some(snapshot)) => {
                    info!("[Snapshot] Restored last-known state from {}", path.display());
                    snapshot
                }
                Ok(None) => {
                    debug!("[Snapshot] No previous state at {}", path.display());
                    Snapshot::default()
                }
                Err(e) => {
                    warn!("[Snapshot] Ignoring unreadable state file: {:#}", e);
                    Snapshot::default()
                }
            },
            None => Snapshot::default(),
        };
        Self::with_snapshot(initial, persist_path)
    }

    pub fn persist_path(&self) -> Option<&Path> {
        self.persist_path.as_deref()
    }

    /// Latest position, current value first. `None` until something has been published.
    pub fn subscribe(&self) -> watch::Receiver<Option<LocationUpdate>> {
        self.updates.subscribe()
    }

    /// Replace record and report together and clear the error.
    pub fn publish(&self, record: LocationRecord, report: DriftReport) {
        let now = Utc::now();
        let next = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let next = Snapshot {
                record: Some(record),
                report: Some(report),
                last_success_at: Some(now),
                last_attempt_at: Some(now),
                last_error: None,
                consecutive_failures: 0,
            };
            *guard = next.clone();
            next
        };
        self.persist(&next);

        let update = LocationUpdate::new(&record, now);
        self.updates.send_if_modified(|last| {
            if last.as_ref().is_some_and(|prev| prev.same_position(&update)) {
                return false;
            }
            *last = Some(update);
            true
        });
    }

    /// Record a failed cycle. The last good record and report stay as they are.
    pub fn publish_error(&self, err: &CycleError) {
        let now = Utc::now();
        let next = {
            let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
            let mut next = guard.clone();
            next.last_attempt_at = Some(now);
            next.last_error = Some(RecordedError {
                kind: err.kind(),
                message: err.to_string(),
                at: now,
            });
            next.consecutive_failures = next.consecutive_failures.saturating_add(1);
            *guard = next.clone();
            next
        };
        self.persist(&next);
    }

    pub fn read(&self) -> Snapshot {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Write the current state again. Called on shutdown.
    pub fn flush(&self) -> Result<()> {
        match &self.persist_path {
            Some(path) => write_atomic(path, &self.read()),
            None => Ok(()),
        }
    }

    fn persist(&self, snapshot: &Snapshot) {
        if let Some(path) = &self.persist_path {
            if let Err(e) = write_atomic(path, snapshot) {
                warn!("[Snapshot] Could not write runtime file: {:#}", e);
            }
        }
    }
}

fn load(path: &Path) -> Result<Option<Snapshot>> {
    let data = match fs::read(path) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
    };
    let snapshot = serde_json::from_slice(&data)
        .with_context(|| format!("parsing {}", path.display()))?;
    Ok(Some(snapshot))
}

/// Write to a sibling temp file and rename it over the target.
fn write_atomic(path: &Path, snapshot: &Snapshot) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
    }
    let tmp = path.with_extension("tmp");
    let body = serde_json::to_vec_pretty(snapshot)?;
    fs::write(&tmp, body).with_context(|| format!("writing {}", tmp.display()))?;
    fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} to {}", tmp.display(), path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::ClockComparator;
    use crate::extract::ExtractError;
    use crate::fetch::FetchError;
    use std::sync::Arc;
    use std::thread;

    fn record() -> LocationRecord {
        LocationRecord {
            latitude: -10.951121,
            longitude: -150.393507,
            altitude_meters: 339.7,
            gps_time_s: 1446994128.52,
        }
    }

    fn report() -> DriftReport {
        ClockComparator::new(1.0).compare(1446994128.52, 1446994129.0, Some(1446994128.6))
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = SnapshotStore::new(None);
        let snap = store.read();
        assert_eq!(snap, Snapshot::default());
        assert!(snap.is_stale(Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn test_publish_replaces_both_and_clears_error() {
        let store = SnapshotStore::new(None);
        store.publish_error(&FetchError::Timeout("5s".into()).into());
        assert!(store.read().last_error.is_some());

        store.publish(record(), report());
        let snap = store.read();
        assert_eq!(snap.record, Some(record()));
        assert_eq!(snap.report, Some(report()));
        assert!(snap.last_error.is_none());
        assert_eq!(snap.consecutive_failures, 0);
        assert!(snap.last_success_at.is_some());
        assert_eq!(snap.last_success_at, snap.last_attempt_at);
    }

    #[test]
    fn test_errors_keep_last_good_values() {
        let store = SnapshotStore::new(None);
        store.publish(record(), report());
        let success_at = store.read().last_success_at;

        for _ in 0..3 {
            store.publish_error(&FetchError::Network("connection refused".into()).into());
        }
        store.publish_error(&ExtractError::MalformedJson("eof".into()).into());

        let snap = store.read();
        assert_eq!(snap.record, Some(record()));
        assert_eq!(snap.report, Some(report()));
        assert_eq!(snap.last_success_at, success_at);
        assert_eq!(snap.consecutive_failures, 4);
        let err = snap.last_error.unwrap();
        assert_eq!(err.kind, ErrorKind::MalformedJson);
        assert!(err.message.contains("eof"));
    }

    #[test]
    fn test_gps_staleness() {
        let store = SnapshotStore::new(None);
        assert!(!store.read().is_gps_stale(Duration::from_secs(1)));

        let lagging = ClockComparator::new(1.0).compare(100.0, 105.0, None);
        store.publish(record(), lagging);
        let snap = store.read();
        assert_eq!(snap.gps_lag_s(), Some(5.0));
        assert!(snap.is_gps_stale(Duration::from_secs(1)));
        assert!(!snap.is_gps_stale(Duration::from_secs(10)));
    }

    #[test]
    fn test_readers_never_see_torn_state() {
        let store = Arc::new(SnapshotStore::new(None));
        let writer = {
            let store = store.clone();
            thread::spawn(move || {
                for i in 0..2000 {
                    let t = i as f64;
                    let rec = LocationRecord {
                        latitude: 0.0,
                        longitude: 0.0,
                        altitude_meters: 0.0,
                        gps_time_s: t,
                    };
                    let rep = ClockComparator::new(1.0).compare(t, t, Some(t));
                    store.publish(rec, rep);
                    if i % 7 == 0 {
                        store.publish_error(&FetchError::Timeout("1s".into()).into());
                    }
                }
            })
        };

        for _ in 0..2000 {
            let snap = store.read();
            if let (Some(rec), Some(rep)) = (snap.record, snap.report) {
                assert_eq!(rec.gps_time_s, rep.gps_time_s);
            } else {
                assert!(snap.record.is_none() && snap.report.is_none());
            }
        }
        writer.join().unwrap();
    }

    #[test]
    fn test_persist_and_restore_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("current_location.json");

        let store = SnapshotStore::new(Some(path.clone()));
        store.publish(record(), report());
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let restored = SnapshotStore::restore(Some(path.clone())).read();
        let original = store.read();
        assert_eq!(restored.record, original.record);
        assert_eq!(restored.report, original.report);
        assert_eq!(
            restored.record.unwrap().gps_time_s.to_bits(),
            1446994128.52f64.to_bits()
        );
        assert_eq!(restored.last_success_at, original.last_success_at);
    }

    #[test]
    fn test_failures_reach_the_runtime_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        let store = SnapshotStore::new(Some(path.clone()));
        store.publish(record(), report());
        for _ in 0..5 {
            store.publish_error(&FetchError::Timeout("5s".into()).into());
        }

        // Read back as an external reader would, without going through the store.
        let on_disk: Snapshot = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        let in_memory = store.read();
        assert_eq!(on_disk.last_error.unwrap().kind, ErrorKind::FetchTimeout);
        assert_eq!(on_disk.consecutive_failures, 5);
        assert_eq!(on_disk.last_attempt_at, in_memory.last_attempt_at);
        assert_eq!(on_disk.record, Some(record()));
        assert_eq!(on_disk.last_success_at, in_memory.last_success_at);

        // A restart after a crash still shows the outage.
        let restored = SnapshotStore::restore(Some(path)).read();
        assert_eq!(restored.consecutive_failures, 5);
        assert!(restored.last_error.is_some());
    }

    #[test]
    fn test_position_updates_only_on_change() {
        let store = SnapshotStore::new(None);
        let mut rx = store.subscribe();
        assert!(rx.borrow_and_update().is_none());

        store.publish(record(), report());
        assert!(rx.has_changed().unwrap());
        let first = (*rx.borrow_and_update()).clone().unwrap();
        assert_eq!(first.latitude, -10.951121);
        assert_eq!(first.altitude_meters, 339.7);

        // Same position, newer GPS time: not a location update
        let mut later = record();
        later.gps_time_s += 1.0;
        store.publish(later, report());
        store.publish_error(&FetchError::Timeout("5s".into()).into());
        assert!(!rx.has_changed().unwrap());

        let mut moved = record();
        moved.latitude = -10.95;
        store.publish(moved, report());
        assert!(rx.has_changed().unwrap());
        assert_eq!(rx.borrow_and_update().as_ref().unwrap().latitude, -10.95);
    }

    #[test]
    fn test_restored_store_announces_last_position() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        SnapshotStore::new(Some(path.clone())).publish(record(), report());

        let restored = SnapshotStore::restore(Some(path));
        let rx = restored.subscribe();
        let update = (*rx.borrow()).clone().unwrap();
        assert_eq!(update.longitude, -150.393507);
        assert_eq!(Some(update.updated_at), restored.read().last_success_at);
    }

    #[test]
    fn test_restore_missing_or_corrupt_file() {
        let _ = env_logger::builder().is_test(true).try_init();
        let dir = tempfile::tempdir().unwrap();

        let missing = SnapshotStore::restore(Some(dir.path().join("nope.json")));
        assert_eq!(missing.read(), Snapshot::default());

        let corrupt = dir.path().join("corrupt.json");
        fs::write(&corrupt, b"{ not json").unwrap();
        let store = SnapshotStore::restore(Some(corrupt));
        assert_eq!(store.read(), Snapshot::default());
    }

    #[test]
    fn test_flush_without_path_is_noop() {
        let store = SnapshotStore::new(None);
        assert!(store.flush().is_ok());
        assert!(store.persist_path().is_none());
    }
}
