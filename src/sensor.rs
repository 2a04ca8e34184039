//! Sensor family polymorphism: each supported hardware family is a
//! capability set (identity match, GATT identifiers, decode, unlock)
//! behind [`SensorFamily`], with a registry keyed by the advertised name
//! prefix. One concrete family today: Libre2.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use num_enum::FromPrimitive;
use std::fmt;
use strum_macros::Display;
use uuid::Uuid;

use crate::crypto::{self, ENABLE_TIME, UNLOCK_PAYLOAD_LEN};
use crate::error::SensorError;
use crate::fram::FactoryCalibration;
use crate::measurement::{BlePayload, parse_ble_payload};

/// Hardware family tag carried in the first patch-info byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, FromPrimitive)]
#[repr(u8)]
pub enum SensorType {
    #[strum(to_string = "Libre 1")]
    Libre1 = 0xDF,
    #[strum(to_string = "Libre 2")]
    Libre2 = 0x9D,
    #[strum(to_string = "Libre 2 US")]
    Libre2Us = 0xE5,
    #[strum(to_string = "Libre Pro/H")]
    LibreProH = 0x70,
    #[num_enum(catch_all)]
    #[strum(to_string = "unknown ({0})")]
    Unknown(u8),
}

impl SensorType {
    /// Derive the family tag from the pairing patch info.
    pub fn from_patch_info(patch_info: &[u8]) -> Self {
        patch_info
            .first()
            .copied()
            .map(Self::from_primitive)
            .unwrap_or(Self::Unknown(0))
    }
}

/// Advertisement fields the candidate filter looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub local_name: Option<String>,
    pub manufacturer_data: Vec<u8>,
}

/// Capability set for one sensor hardware family.
pub trait SensorFamily: Send + Sync {
    fn manufacturer(&self) -> &'static str;

    /// Case-insensitive prefix of the advertised peripheral name.
    fn name_prefix(&self) -> &'static str;

    /// Whether this family handles the given hardware tag.
    fn supports(&self, sensor_type: SensorType) -> bool;

    fn service_uuid(&self) -> Uuid;
    fn write_characteristic(&self) -> Uuid;
    fn read_characteristic(&self) -> Uuid;

    /// Whether an advertising peripheral is the paired sensor.
    fn matches_advertisement(&self, adv: &Advertisement, uid: &[u8; 6]) -> bool;

    /// Gate on the family tag, then decrypt and parse one reassembled
    /// 46-byte packet.
    fn decode_packet(
        &self,
        uid: &[u8; 6],
        patch_info: &[u8],
        calibration: &FactoryCalibration,
        cipher: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(Bytes, BlePayload), SensorError>;

    /// Authenticated streaming unlock command for this unlock attempt.
    fn unlock_payload(
        &self,
        uid: &[u8; 6],
        patch_info: &[u8],
        unlock_count: u16,
    ) -> Result<[u8; UNLOCK_PAYLOAD_LEN], SensorError>;
}

impl fmt::Debug for dyn SensorFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SensorFamily")
            .field("manufacturer", &self.manufacturer())
            .field("name_prefix", &self.name_prefix())
            .finish()
    }
}

/// Abbott Libre2: GATT service FDE3, write F001, read F002.
#[derive(Debug, Default, Clone, Copy)]
pub struct Libre2Family;

impl Libre2Family {
    pub const SERVICE: Uuid = Uuid::from_u128(0x0000FDE3_0000_1000_8000_00805F9B34FB);
    pub const WRITE_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000F001_0000_1000_8000_00805F9B34FB);
    pub const READ_CHARACTERISTIC: Uuid = Uuid::from_u128(0x0000F002_0000_1000_8000_00805F9B34FB);
}

impl SensorFamily for Libre2Family {
    fn manufacturer(&self) -> &'static str {
        "Abbott"
    }

    fn name_prefix(&self) -> &'static str {
        "abbott"
    }

    fn supports(&self, sensor_type: SensorType) -> bool {
        matches!(sensor_type, SensorType::Libre2)
    }

    fn service_uuid(&self) -> Uuid {
        Self::SERVICE
    }

    fn write_characteristic(&self) -> Uuid {
        Self::WRITE_CHARACTERISTIC
    }

    fn read_characteristic(&self) -> Uuid {
        Self::READ_CHARACTERISTIC
    }

    /// Manufacturer data must be exactly 8 bytes with the sensor UID at
    /// bytes 2..8, and the advertised name must carry the vendor prefix.
    fn matches_advertisement(&self, adv: &Advertisement, uid: &[u8; 6]) -> bool {
        let Some(name) = adv.local_name.as_deref() else {
            return false;
        };
        if !name.to_lowercase().starts_with(self.name_prefix()) {
            return false;
        }
        adv.manufacturer_data.len() == 8 && adv.manufacturer_data[2..8] == uid[..]
    }

    fn decode_packet(
        &self,
        uid: &[u8; 6],
        patch_info: &[u8],
        calibration: &FactoryCalibration,
        cipher: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(Bytes, BlePayload), SensorError> {
        let sensor_type = SensorType::from_patch_info(patch_info);
        if !self.supports(sensor_type) {
            return Err(SensorError::UnsupportedSensor(sensor_type));
        }

        let plain = Bytes::from(crypto::decrypt_ble(uid, cipher)?);
        let payload = parse_ble_payload(&plain, calibration, now)?;
        Ok((plain, payload))
    }

    fn unlock_payload(
        &self,
        uid: &[u8; 6],
        patch_info: &[u8],
        unlock_count: u16,
    ) -> Result<[u8; UNLOCK_PAYLOAD_LEN], SensorError> {
        crypto::streaming_unlock_payload(uid, patch_info, ENABLE_TIME, unlock_count)
    }
}

/// Registry of known families, keyed by advertised-name prefix.
pub struct FamilyRegistry {
    families: Vec<Box<dyn SensorFamily>>,
}

impl FamilyRegistry {
    /// All built-in families.
    pub fn builtin() -> Self {
        Self {
            families: vec![Box::new(Libre2Family)],
        }
    }

    pub fn register(&mut self, family: Box<dyn SensorFamily>) {
        self.families.push(family);
    }

    /// The first family whose filter accepts the advertisement.
    pub fn match_advertisement(
        &self,
        adv: &Advertisement,
        uid: &[u8; 6],
    ) -> Option<&dyn SensorFamily> {
        self.families
            .iter()
            .map(Box::as_ref)
            .find(|f| f.matches_advertisement(adv, uid))
    }

    /// The family responsible for the paired sensor's hardware tag.
    pub fn family_for_patch_info(&self, patch_info: &[u8]) -> Option<&dyn SensorFamily> {
        let sensor_type = SensorType::from_patch_info(patch_info);
        self.families
            .iter()
            .map(Box::as_ref)
            .find(|f| f.supports(sensor_type))
    }
}

impl Default for FamilyRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}
