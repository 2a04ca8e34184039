//! Shared fixtures: a scripted in-memory transport and packet builders.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use libre2_rs::SensorError;
use libre2_rs::crypto;
use libre2_rs::fram::FactoryCalibration;
use libre2_rs::sensor::Advertisement;
use libre2_rs::transport::{BleTransport, PeripheralId, TransportEvent};

pub const UID: [u8; 6] = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
pub const PATCH_INFO: [u8; 6] = [0x9D, 0x08, 0x30, 0x01, 0x12, 0x34];

/// Commands the manager issued against the transport, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    StartScan,
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverCharacteristics(PeripheralId, Uuid),
    Write(PeripheralId, Uuid, Vec<u8>),
    Subscribe(PeripheralId, Uuid),
}

/// Test-side handle: inject transport events, observe issued commands.
#[derive(Clone)]
pub struct MockHandle {
    pub events_tx: mpsc::UnboundedSender<TransportEvent>,
    calls: Arc<Mutex<Vec<Call>>>,
}

impl MockHandle {
    pub fn send(&self, event: TransportEvent) {
        self.events_tx.send(event).expect("worker gone");
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().expect("calls lock poisoned").clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|c| pred(c)).count()
    }

    pub fn last_write(&self) -> Option<(Uuid, Vec<u8>)> {
        self.calls().into_iter().rev().find_map(|c| match c {
            Call::Write(_, uuid, value) => Some((uuid, value)),
            _ => None,
        })
    }
}

/// Transport double: every operation succeeds and is recorded; nothing
/// happens unless the test injects the corresponding event.
pub struct MockTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl MockTransport {
    pub fn new() -> (Self, MockHandle) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let calls = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                calls: calls.clone(),
                events_rx: Some(events_rx),
            },
            MockHandle { events_tx, calls },
        )
    }

    fn record(&self, call: Call) {
        self.calls.lock().expect("calls lock poisoned").push(call);
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events_rx.take().expect("events receiver already taken")
    }

    async fn start_scan(&mut self) -> Result<(), SensorError> {
        self.record(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), SensorError> {
        self.record(Call::StopScan);
        Ok(())
    }

    async fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), SensorError> {
        self.record(Call::Connect(peripheral.clone()));
        Ok(())
    }

    async fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), SensorError> {
        self.record(Call::Disconnect(peripheral.clone()));
        Ok(())
    }

    async fn discover_characteristics(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<(), SensorError> {
        self.record(Call::DiscoverCharacteristics(peripheral.clone(), service));
        Ok(())
    }

    async fn write(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), SensorError> {
        self.record(Call::Write(peripheral.clone(), characteristic, value));
        Ok(())
    }

    async fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<(), SensorError> {
        self.record(Call::Subscribe(peripheral.clone(), characteristic));
        Ok(())
    }
}

/// Advertisement the candidate filter accepts for [`UID`].
pub fn matching_advertisement() -> Advertisement {
    let mut manufacturer_data = vec![0x12, 0x34];
    manufacturer_data.extend_from_slice(&UID);
    Advertisement {
        local_name: Some("ABBOTT1234".to_owned()),
        manufacturer_data,
    }
}

/// Plaintext FRAM image with the given lifecycle state byte and a
/// non-trivial calibration block (i3 = 5, i4 = 65).
pub fn plain_fram(state: u8) -> Vec<u8> {
    let mut plain = vec![0u8; crypto::FRAM_LEN];
    plain[4] = state;
    plain[2] = 0x10; // i1/i2 word
    plain[0x150] = 0x05; // i3
    plain[0x151] = 0x41; // i4 low bits
    plain
}

/// [`plain_fram`] encrypted for [`UID`]/[`PATCH_INFO`]. Encrypting is
/// decrypting: the FRAM transform is an XOR stream.
pub fn encrypted_fram(state: u8) -> Vec<u8> {
    crypto::decrypt_fram(&UID, &PATCH_INFO, &plain_fram(state)).expect("fram encrypt")
}

/// Calibration matching [`plain_fram`]'s coefficients.
pub fn fram_calibration() -> FactoryCalibration {
    FactoryCalibration::parse(&plain_fram(3)).expect("calibration")
}

/// A valid 44-byte plaintext payload: constant raw counts, the given
/// wear time, correct trailing CRC.
pub fn plain_payload(raw: u16, wear_time: u16) -> Vec<u8> {
    let mut plain = Vec::with_capacity(crypto::BLE_PAYLOAD_LEN);
    for _ in 0..10 {
        // 14-bit glucose counts, upper temperature/flag bits zero
        plain.extend_from_slice(&u32::from(raw & 0x3FFF).to_le_bytes());
    }
    plain.extend_from_slice(&wear_time.to_le_bytes());
    let crc = crypto::crc16(&plain);
    plain.extend_from_slice(&crc.to_le_bytes());
    plain
}

/// Encrypt a 44-byte plaintext into a full 46-byte packet for [`UID`].
/// The BLE transform is an XOR stream, so encryption reuses the decrypt.
pub fn encrypted_packet(plain: &[u8], nonce: [u8; 2]) -> Vec<u8> {
    let mut buffer = nonce.to_vec();
    buffer.extend_from_slice(plain);
    let cipher_payload = crypto::decrypt_ble(&UID, &buffer).expect("ble encrypt");

    let mut packet = nonce.to_vec();
    packet.extend_from_slice(&cipher_payload);
    packet
}
