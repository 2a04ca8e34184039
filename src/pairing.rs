//! Consuming the near-field pairing session's outputs.
//!
//! The NFC session itself is external; it hands over the sensor identity
//! first and the encrypted FRAM image second. These helpers persist both
//! stages into the store so `paired()` flips to true only once identity,
//! calibration and lifecycle state are all present.

use tracing::{debug, info};

use crate::crypto;
use crate::error::SensorError;
use crate::fram::{FactoryCalibration, SensorLifecycleState};
use crate::store::SensorStore;

/// First pairing stage: persist the raw identity bytes.
pub fn apply_identity(
    store: &dyn SensorStore,
    uid: [u8; 6],
    patch_info: Vec<u8>,
) -> Result<(), SensorError> {
    if patch_info.len() < 2 {
        return Err(SensorError::InvalidLength {
            expected: 2,
            actual: patch_info.len(),
        });
    }

    debug!(uid = %hex::encode(uid), patch_info = %hex::encode(&patch_info), "pairing identity");
    store.set_uid(Some(uid));
    store.set_patch_info(Some(patch_info));
    Ok(())
}

/// Second pairing stage: decrypt the FRAM dump and persist calibration
/// and lifecycle state. Requires the identity stage to have run; on any
/// failure nothing further is persisted and connects stay gated.
pub fn apply_fram(store: &dyn SensorStore, fram: &[u8]) -> Result<SensorLifecycleState, SensorError> {
    let uid = store.uid().ok_or(SensorError::NotPaired { missing: "uid" })?;
    let patch_info = store.patch_info().ok_or(SensorError::NotPaired {
        missing: "patch info",
    })?;

    let plain = crypto::decrypt_fram(&uid, &patch_info, fram)?;
    let calibration = FactoryCalibration::parse(&plain)?;
    let state = SensorLifecycleState::parse(&plain)?;

    info!(%calibration, %state, "pairing complete");
    store.set_calibration(Some(calibration));
    store.set_lifecycle_state(Some(state));
    Ok(state)
}

/// Streaming-enabled acknowledgment from the sensor: only a confirmed
/// success resets the unlock counter.
pub fn streaming_enabled(store: &dyn SensorStore, successful: bool) {
    debug!(successful, "streaming enabled ack");
    if successful {
        store.set_unlock_counter(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    const UID: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
    const PATCH_INFO: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x12, 0x34];

    #[test]
    fn fram_stage_requires_identity() {
        let store = MemoryStore::new();
        let err = apply_fram(&store, &[0u8; crypto::FRAM_LEN]).unwrap_err();
        assert!(matches!(err, SensorError::NotPaired { missing: "uid" }));
        assert!(!store.paired());
    }

    #[test]
    fn both_stages_complete_pairing() {
        let store = MemoryStore::new();
        apply_identity(&store, UID, PATCH_INFO.to_vec()).unwrap();
        assert!(!store.paired());

        // Encrypt-a-known-plaintext: the FRAM transform is an XOR stream,
        // so running a plaintext image through it yields its ciphertext.
        let mut plain = vec![0u8; crypto::FRAM_LEN];
        plain[4] = 3; // ready
        let cipher = crypto::decrypt_fram(&UID, &PATCH_INFO, &plain).unwrap();

        let state = apply_fram(&store, &cipher).unwrap();
        assert_eq!(state, SensorLifecycleState::Ready);
        assert!(store.paired());
        assert_eq!(store.lifecycle_state(), Some(SensorLifecycleState::Ready));
    }

    #[test]
    fn identity_rejects_short_patch_info() {
        let store = MemoryStore::new();
        assert!(apply_identity(&store, UID, vec![0x9D]).is_err());
        assert!(store.uid().is_none());
    }

    #[test]
    fn only_success_resets_unlock_counter() {
        let store = MemoryStore::new();
        store.set_unlock_counter(17);
        streaming_enabled(&store, false);
        assert_eq!(store.unlock_counter(), 17);
        streaming_enabled(&store, true);
        assert_eq!(store.unlock_counter(), 0);
    }
}
