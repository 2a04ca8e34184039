//! Persisted sensor identity, calibration, lifecycle state and unlock
//! counter. The store is injected wherever it is needed so tests can
//! substitute the in-memory implementation.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::sync::RwLock;

use crate::error::SensorError;
use crate::fram::{FactoryCalibration, SensorLifecycleState};

/// Everything the store persists. Absent fields mean "not yet paired",
/// which is a normal precondition, never an error.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoredSensor {
    pub uid: Option<[u8; 6]>,
    pub patch_info: Option<Vec<u8>>,
    pub calibration: Option<FactoryCalibration>,
    pub lifecycle_state: Option<SensorLifecycleState>,
    #[serde(default)]
    pub unlock_counter: u16,
    pub last_wear_time_minutes: Option<u16>,
}

/// Key-value holder for the sensor identity. Each accessor is atomic with
/// respect to the others; `clear` is the only way to zero the unlock
/// counter outside the streaming-enabled success path.
pub trait SensorStore: Send + Sync + 'static {
    fn uid(&self) -> Option<[u8; 6]>;
    fn set_uid(&self, uid: Option<[u8; 6]>);

    fn patch_info(&self) -> Option<Vec<u8>>;
    fn set_patch_info(&self, patch_info: Option<Vec<u8>>);

    fn calibration(&self) -> Option<FactoryCalibration>;
    fn set_calibration(&self, calibration: Option<FactoryCalibration>);

    fn lifecycle_state(&self) -> Option<SensorLifecycleState>;
    fn set_lifecycle_state(&self, state: Option<SensorLifecycleState>);

    fn unlock_counter(&self) -> u16;
    fn set_unlock_counter(&self, counter: u16);

    fn last_wear_time_minutes(&self) -> Option<u16>;
    fn set_last_wear_time_minutes(&self, minutes: Option<u16>);

    /// All-or-nothing pairing check: identity, calibration and lifecycle
    /// state must all be present before any connect attempt.
    fn paired(&self) -> bool {
        self.uid().is_some()
            && self.patch_info().is_some()
            && self.calibration().is_some()
            && self.lifecycle_state().is_some()
    }

    /// Full reset: wipes identity, calibration, state, wear time and the
    /// unlock counter. Forces re-pairing before the next connect.
    fn clear(&self) {
        self.set_uid(None);
        self.set_patch_info(None);
        self.set_calibration(None);
        self.set_lifecycle_state(None);
        self.set_last_wear_time_minutes(None);
        self.set_unlock_counter(0);
    }
}

/// Process-local store backed by a `RwLock`. The default test double.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<StoredSensor>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> StoredSensor {
        self.inner.read().expect("store lock poisoned").clone()
    }

    fn write(&self, f: impl FnOnce(&mut StoredSensor)) {
        f(&mut self.inner.write().expect("store lock poisoned"));
    }
}

impl SensorStore for MemoryStore {
    fn uid(&self) -> Option<[u8; 6]> {
        self.read().uid
    }

    fn set_uid(&self, uid: Option<[u8; 6]>) {
        self.write(|s| s.uid = uid);
    }

    fn patch_info(&self) -> Option<Vec<u8>> {
        self.read().patch_info
    }

    fn set_patch_info(&self, patch_info: Option<Vec<u8>>) {
        self.write(|s| s.patch_info = patch_info);
    }

    fn calibration(&self) -> Option<FactoryCalibration> {
        self.read().calibration
    }

    fn set_calibration(&self, calibration: Option<FactoryCalibration>) {
        self.write(|s| s.calibration = calibration);
    }

    fn lifecycle_state(&self) -> Option<SensorLifecycleState> {
        self.read().lifecycle_state
    }

    fn set_lifecycle_state(&self, state: Option<SensorLifecycleState>) {
        self.write(|s| s.lifecycle_state = state);
    }

    fn unlock_counter(&self) -> u16 {
        self.read().unlock_counter
    }

    fn set_unlock_counter(&self, counter: u16) {
        self.write(|s| s.unlock_counter = counter);
    }

    fn last_wear_time_minutes(&self) -> Option<u16> {
        self.read().last_wear_time_minutes
    }

    fn set_last_wear_time_minutes(&self, minutes: Option<u16>) {
        self.write(|s| s.last_wear_time_minutes = minutes);
    }
}

/// Store persisted as a JSON document, written through on every change so
/// the unlock counter survives process restarts.
#[derive(Debug)]
pub struct JsonStore {
    path: PathBuf,
    inner: RwLock<StoredSensor>,
}

impl JsonStore {
    /// Open or create the store at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, SensorError> {
        let path = path.into();
        let inner = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => StoredSensor::default(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            inner: RwLock::new(inner),
        })
    }

    fn read(&self) -> StoredSensor {
        self.inner.read().expect("store lock poisoned").clone()
    }

    fn write(&self, f: impl FnOnce(&mut StoredSensor)) {
        let snapshot = {
            let mut guard = self.inner.write().expect("store lock poisoned");
            f(&mut guard);
            guard.clone()
        };
        // Persistence is best-effort; the in-memory view stays authoritative.
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(err) = fs::write(&self.path, bytes) {
                    tracing::warn!(path = %self.path.display(), %err, "store write failed");
                }
            }
            Err(err) => tracing::warn!(%err, "store serialization failed"),
        }
    }
}

impl SensorStore for JsonStore {
    fn uid(&self) -> Option<[u8; 6]> {
        self.read().uid
    }

    fn set_uid(&self, uid: Option<[u8; 6]>) {
        self.write(|s| s.uid = uid);
    }

    fn patch_info(&self) -> Option<Vec<u8>> {
        self.read().patch_info
    }

    fn set_patch_info(&self, patch_info: Option<Vec<u8>>) {
        self.write(|s| s.patch_info = patch_info);
    }

    fn calibration(&self) -> Option<FactoryCalibration> {
        self.read().calibration
    }

    fn set_calibration(&self, calibration: Option<FactoryCalibration>) {
        self.write(|s| s.calibration = calibration);
    }

    fn lifecycle_state(&self) -> Option<SensorLifecycleState> {
        self.read().lifecycle_state
    }

    fn set_lifecycle_state(&self, state: Option<SensorLifecycleState>) {
        self.write(|s| s.lifecycle_state = state);
    }

    fn unlock_counter(&self) -> u16 {
        self.read().unlock_counter
    }

    fn set_unlock_counter(&self, counter: u16) {
        self.write(|s| s.unlock_counter = counter);
    }

    fn last_wear_time_minutes(&self) -> Option<u16> {
        self.read().last_wear_time_minutes
    }

    fn set_last_wear_time_minutes(&self, minutes: Option<u16>) {
        self.write(|s| s.last_wear_time_minutes = minutes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paired_is_all_or_nothing() {
        let store = MemoryStore::new();
        assert!(!store.paired());

        store.set_uid(Some([1; 6]));
        store.set_patch_info(Some(vec![0x9D, 0x08]));
        store.set_calibration(Some(FactoryCalibration {
            i1: 1,
            i2: 2,
            i3: 3,
            i4: 4,
            i5: 5,
            i6: 6,
        }));
        assert!(!store.paired());

        store.set_lifecycle_state(Some(SensorLifecycleState::Ready));
        assert!(store.paired());
    }

    #[test]
    fn clear_zeroes_unlock_counter() {
        let store = MemoryStore::new();
        store.set_uid(Some([1; 6]));
        store.set_unlock_counter(41);
        store.clear();
        assert_eq!(store.unlock_counter(), 0);
        assert!(store.uid().is_none());
    }
}
