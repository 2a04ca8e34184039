//! Fixed-offset decode of the decrypted FRAM image: factory calibration
//! coefficients and the sensor lifecycle state.

use num_enum::FromPrimitive;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;

use crate::crypto::FRAM_LEN;
use crate::error::SensorError;

/// LSB-first bit reader over a byte buffer.
///
/// `byte_offset`/`bit_offset` locate the first bit, `bit_count` bits are
/// assembled low-to-high. Matches the sensor's bit packing.
pub fn read_bits(buffer: &[u8], byte_offset: usize, bit_offset: usize, bit_count: usize) -> i32 {
    let mut res: i32 = 0;
    for i in 0..bit_count {
        let total = byte_offset * 8 + bit_offset + i;
        let byte = total / 8;
        let bit = total % 8;
        if byte < buffer.len() && (buffer[byte] >> bit) & 0x1 == 1 {
            res |= 1 << i;
        }
    }
    res
}

/// Factory calibration coefficients, read once per pairing from fixed
/// offsets of the decrypted FRAM image. Immutable thereafter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryCalibration {
    pub i1: i32,
    pub i2: i32,
    pub i3: i32,
    pub i4: i32,
    pub i5: i32,
    pub i6: i32,
}

impl FactoryCalibration {
    /// Extract the six coefficients. The i3 sign travels as a separate bit;
    /// i5 and i6 are stored pre-divided by four.
    pub fn parse(plain_fram: &[u8]) -> Result<Self, SensorError> {
        if plain_fram.len() != FRAM_LEN {
            return Err(SensorError::InvalidLength {
                expected: FRAM_LEN,
                actual: plain_fram.len(),
            });
        }

        let i1 = read_bits(plain_fram, 2, 0, 3);
        let i2 = read_bits(plain_fram, 2, 3, 0xa);
        let i3 = read_bits(plain_fram, 0x150, 0, 8);
        let i4 = read_bits(plain_fram, 0x150, 8, 0xe);
        let negative_i3 = read_bits(plain_fram, 0x150, 0x21, 1) != 0;
        let i5 = read_bits(plain_fram, 0x150, 0x28, 0xc) << 2;
        let i6 = read_bits(plain_fram, 0x150, 0x34, 0xc) << 2;

        Ok(Self {
            i1,
            i2,
            i3: if negative_i3 { -i3 } else { i3 },
            i4,
            i5,
            i6,
        })
    }
}

impl fmt::Display for FactoryCalibration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "i1: {}, i2: {}, i3: {}, i4: {}, i5: {}, i6: {}",
            self.i1, self.i2, self.i3, self.i4, self.i5, self.i6
        )
    }
}

/// Sensor lifecycle state, decoded from FRAM byte 4. Advisory only: it
/// never gates a connection attempt by itself.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, FromPrimitive,
)]
#[repr(u8)]
pub enum SensorLifecycleState {
    #[strum(to_string = "not started")]
    NotStarted = 1,
    #[strum(to_string = "starting")]
    Starting = 2,
    #[strum(to_string = "ready")]
    Ready = 3,
    #[strum(to_string = "expired")]
    Expired = 4,
    #[strum(to_string = "shutdown")]
    Shutdown = 5,
    #[strum(to_string = "failure")]
    Failure = 6,
    #[num_enum(catch_all)]
    #[strum(to_string = "unknown ({0})")]
    Unknown(u8),
}

impl SensorLifecycleState {
    /// Decode from a decrypted FRAM image.
    pub fn parse(plain_fram: &[u8]) -> Result<Self, SensorError> {
        if plain_fram.len() != FRAM_LEN {
            return Err(SensorError::InvalidLength {
                expected: FRAM_LEN,
                actual: plain_fram.len(),
            });
        }
        Ok(Self::from_primitive(plain_fram[4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fram_with(state: u8) -> Vec<u8> {
        let mut fram = vec![0u8; FRAM_LEN];
        fram[4] = state;
        fram
    }

    #[test]
    fn read_bits_is_lsb_first() {
        let buf = [0b1010_0110, 0b0000_0001];
        assert_eq!(read_bits(&buf, 0, 0, 3), 0b110);
        assert_eq!(read_bits(&buf, 0, 1, 3), 0b011);
        // crosses the byte boundary
        assert_eq!(read_bits(&buf, 0, 5, 4), 0b1101);
        assert_eq!(read_bits(&buf, 0, 0, 0), 0);
    }

    #[test]
    fn lifecycle_state_decodes_from_byte_4() {
        assert_eq!(
            SensorLifecycleState::parse(&fram_with(3)).unwrap(),
            SensorLifecycleState::Ready
        );
        assert_eq!(
            SensorLifecycleState::parse(&fram_with(6)).unwrap(),
            SensorLifecycleState::Failure
        );
        assert_eq!(
            SensorLifecycleState::parse(&fram_with(0xAB)).unwrap(),
            SensorLifecycleState::Unknown(0xAB)
        );
    }

    #[test]
    fn calibration_sign_bit_negates_i3() {
        let mut fram = vec![0u8; FRAM_LEN];
        fram[0x150] = 0x2A; // i3 = 42
        let cal = FactoryCalibration::parse(&fram).unwrap();
        assert_eq!(cal.i3, 42);

        // bit 0x21 within the block starting at 0x150
        fram[0x150 + 4] |= 1 << 1;
        let cal = FactoryCalibration::parse(&fram).unwrap();
        assert_eq!(cal.i3, -42);
    }

    #[test]
    fn calibration_rejects_short_image() {
        assert!(FactoryCalibration::parse(&[0u8; 10]).is_err());
        assert!(SensorLifecycleState::parse(&[0u8; 10]).is_err());
    }
}
