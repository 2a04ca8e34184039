//! JSON store round-trips across process restarts.

mod common;

use common::*;

use libre2_rs::{JsonStore, SensorStore};
use libre2_rs::fram::SensorLifecycleState;
use libre2_rs::pairing;

#[test]
fn missing_file_starts_unpaired() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonStore::open(dir.path().join("sensor.json")).unwrap();
    assert!(!store.paired());
    assert_eq!(store.unlock_counter(), 0);
}

#[test]
fn pairing_survives_a_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sensor.json");

    {
        let store = JsonStore::open(&path).unwrap();
        pairing::apply_identity(&store, UID, PATCH_INFO.to_vec()).unwrap();
        pairing::apply_fram(&store, &encrypted_fram(3)).unwrap();
        store.set_unlock_counter(7);
        store.set_last_wear_time_minutes(Some(1234));
    }

    let store = JsonStore::open(&path).unwrap();
    assert!(store.paired());
    assert_eq!(store.uid(), Some(UID));
    assert_eq!(store.patch_info(), Some(PATCH_INFO.to_vec()));
    assert_eq!(store.calibration(), Some(fram_calibration()));
    assert_eq!(store.lifecycle_state(), Some(SensorLifecycleState::Ready));
    assert_eq!(store.unlock_counter(), 7);
    assert_eq!(store.last_wear_time_minutes(), Some(1234));
}

#[test]
fn clear_persists_too() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sensor.json");

    {
        let store = JsonStore::open(&path).unwrap();
        pairing::apply_identity(&store, UID, PATCH_INFO.to_vec()).unwrap();
        store.set_unlock_counter(42);
        store.clear();
    }

    let store = JsonStore::open(&path).unwrap();
    assert!(store.uid().is_none());
    assert_eq!(store.unlock_counter(), 0);
}
