//! Parsing of the decrypted BLE payload into calibrated measurements.
//!
//! Payload layout (44 bytes, after the 2-byte nonce is stripped):
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 28   | 7 trend samples, 4 bytes each, newest first |
//! | 28     | 12   | 3 history samples, 4 bytes each, newest first |
//! | 40     | 2    | wear time in minutes (u16 LE)           |
//! | 42     | 2    | CRC16 over bytes 0..42 (u16 LE)         |
//!
//! Each 4-byte sample word packs, LSB first: 14-bit raw glucose counts,
//! 12-bit raw thermistor counts, 5 quality bits, 1 error bit.

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use modular_bitfield::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;
use strum_macros::Display;

use crate::crypto::{BLE_PAYLOAD_LEN, crc16};
use crate::error::SensorError;
use crate::fram::FactoryCalibration;

/// Trend samples per packet, spaced one minute apart.
pub const TREND_SAMPLES: usize = 7;
/// History samples per packet, spaced fifteen minutes apart.
pub const HISTORY_SAMPLES: usize = 3;
/// Minutes between consecutive history samples.
pub const HISTORY_INTERVAL_MINUTES: i64 = 15;

/// Lowest glucose value the sensor reports, mg/dL.
pub const GLUCOSE_MIN: f64 = 39.0;
/// Highest glucose value the sensor reports, mg/dL.
pub const GLUCOSE_MAX: f64 = 501.0;

/// One packed 4-byte measurement word.
#[bitfield(bytes = 4)]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawSample {
    pub glucose: B14,
    pub temperature: B12,
    pub quality: B5,
    pub has_error: bool,
}

/// Slope classification between adjacent trend samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize)]
pub enum GlucoseTrend {
    #[strum(to_string = "falling quickly")]
    FallingQuickly,
    #[strum(to_string = "falling")]
    Falling,
    #[strum(to_string = "stable")]
    Stable,
    #[strum(to_string = "rising")]
    Rising,
    #[strum(to_string = "rising quickly")]
    RisingQuickly,
    #[strum(to_string = "not computable")]
    NotComputable,
}

impl GlucoseTrend {
    /// Classify a rate of change in mg/dL per minute.
    fn from_rate(rate: f64) -> Self {
        match rate {
            r if r <= -2.0 => Self::FallingQuickly,
            r if r <= -1.0 => Self::Falling,
            r if r < 1.0 => Self::Stable,
            r if r < 2.0 => Self::Rising,
            _ => Self::RisingQuickly,
        }
    }
}

/// A single calibrated glucose sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub raw_glucose: u16,
    pub raw_temperature: u16,
    /// Calibrated value in mg/dL, clamped to the sensor's readable range.
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub trend: GlucoseTrend,
    pub quality: u8,
    pub has_error: bool,
}

impl fmt::Display for Measurement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.0} mg/dL ({}) at {} [raw {}]",
            self.value, self.trend, self.timestamp, self.raw_glucose
        )
    }
}

/// Fields recovered from one decoded packet, newest-first as transmitted.
#[derive(Debug, Clone, PartialEq)]
pub struct BlePayload {
    pub wear_time_minutes: u16,
    pub crc: u16,
    pub trend: Vec<Measurement>,
    pub history: Vec<Measurement>,
}

/// Convert raw counts to mg/dL using the factory coefficients.
///
/// Affine map over the glucose counts (i3/i4) with the documented
/// thermistor compensation (i6). The factory lookup stage parameterized
/// by i1/i2 is out of scope; values are clamped to the readable range.
pub fn calibrated_value(raw_glucose: u16, raw_temperature: u16, cal: &FactoryCalibration) -> f64 {
    const CA: f64 = 0.0009180023;
    const CB: f64 = 0.0001964561;
    const CC: f64 = 0.0000007061775;
    const CD: f64 = 0.00000005283566;
    const RESISTANCE_SCALE: f64 = 72500.0;
    const OFFSET: f64 = 1000.0;

    let span = f64::from(cal.i4 - cal.i3);
    let g1 = if span != 0.0 {
        65.0 * (f64::from(raw_glucose) - f64::from(cal.i3)) / span
    } else {
        f64::from(raw_glucose)
    };

    // Thermistor compensation is only defined for a positive resistance
    // term; otherwise the uncompensated value stands.
    let g2 = if cal.i6 > 0 {
        let r = f64::from(raw_temperature) * RESISTANCE_SCALE / f64::from(cal.i6) - OFFSET;
        if r > 0.0 {
            let log_r = (r / OFFSET).ln();
            let d = CA + CB * log_r + CC * log_r.powi(2) + CD * log_r.powi(3);
            let temperature = 1.0 / d - 273.15;
            1.045_f64.powf(32.5 - temperature)
        } else {
            1.0
        }
    } else {
        1.0
    };

    (g1 * g2).clamp(GLUCOSE_MIN, GLUCOSE_MAX)
}

/// Parse a decrypted 44-byte payload, gating on the embedded checksum.
///
/// A checksum mismatch rejects the whole packet; sample timestamps are
/// derived from `now` minus each sample's interval offset. Collections
/// come back newest-first, exactly as transmitted.
pub fn parse_ble_payload(
    plain: &[u8],
    calibration: &FactoryCalibration,
    now: DateTime<Utc>,
) -> Result<BlePayload, SensorError> {
    if plain.len() != BLE_PAYLOAD_LEN {
        return Err(SensorError::InvalidLength {
            expected: BLE_PAYLOAD_LEN,
            actual: plain.len(),
        });
    }

    let expected = u16::from_le_bytes([plain[42], plain[43]]);
    let actual = crc16(&plain[..42]);
    if expected != actual {
        return Err(SensorError::ChecksumMismatch { expected, actual });
    }

    let wear_time_minutes = u16::from_le_bytes([plain[40], plain[41]]);

    let samples: Vec<RawSample> = (0..TREND_SAMPLES + HISTORY_SAMPLES)
        .map(|i| {
            let word: [u8; 4] = plain[i * 4..i * 4 + 4].try_into().expect("fixed slice");
            RawSample::from_bytes(word)
        })
        .collect();

    let values: Vec<f64> = samples
        .iter()
        .map(|s| calibrated_value(s.glucose(), s.temperature(), calibration))
        .collect();

    let build = |sample: &RawSample, value: f64, trend: GlucoseTrend, minutes_back: i64| {
        Measurement {
            raw_glucose: sample.glucose(),
            raw_temperature: sample.temperature(),
            value,
            timestamp: now - Duration::minutes(minutes_back),
            trend,
            quality: sample.quality(),
            has_error: sample.has_error(),
        }
    };

    let trend = (0..TREND_SAMPLES)
        .map(|i| {
            // Slope against the next-older neighbour, one minute apart.
            let classification = if i + 1 < TREND_SAMPLES {
                GlucoseTrend::from_rate(values[i] - values[i + 1])
            } else {
                GlucoseTrend::NotComputable
            };
            build(&samples[i], values[i], classification, i as i64)
        })
        .collect();

    let history = (0..HISTORY_SAMPLES)
        .map(|i| {
            let idx = TREND_SAMPLES + i;
            build(
                &samples[idx],
                values[idx],
                GlucoseTrend::NotComputable,
                i as i64 * HISTORY_INTERVAL_MINUTES,
            )
        })
        .collect();

    Ok(BlePayload {
        wear_time_minutes,
        crc: expected,
        trend,
        history,
    })
}

/// Immutable snapshot emitted to the observer once per decoded packet.
/// Trend and history are in chronological (oldest-first) order.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorData {
    pub bytes: Bytes,
    pub uid: [u8; 6],
    pub patch_info: Vec<u8>,
    pub calibration: FactoryCalibration,
    pub wear_time_minutes: u16,
    pub trend: Vec<Measurement>,
    pub history: Vec<Measurement>,
}

impl SensorData {
    /// Build a snapshot from a parsed payload, reversing the transmitted
    /// newest-first sample order to chronological order.
    pub fn from_payload(
        plain: Bytes,
        uid: [u8; 6],
        patch_info: Vec<u8>,
        calibration: FactoryCalibration,
        payload: BlePayload,
    ) -> Self {
        let mut trend = payload.trend;
        let mut history = payload.history;
        trend.reverse();
        history.reverse();

        Self {
            bytes: plain,
            uid,
            patch_info,
            calibration,
            wear_time_minutes: payload.wear_time_minutes,
            trend,
            history,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn flat_calibration() -> FactoryCalibration {
        FactoryCalibration { i1: 0, i2: 0, i3: 0, i4: 8192, i5: 0, i6: 0 }
    }

    /// Valid 44-byte payload with the given raw glucose counts, zero
    /// temperature words, and a correct trailing checksum.
    fn payload_with(raws: [u16; 10], wear_time: u16) -> Vec<u8> {
        let mut plain = Vec::with_capacity(BLE_PAYLOAD_LEN);
        for raw in raws {
            let sample = RawSample::new()
                .with_glucose(raw)
                .with_temperature(0)
                .with_quality(0)
                .with_has_error(false);
            plain.extend_from_slice(&sample.into_bytes());
        }
        plain.extend_from_slice(&wear_time.to_le_bytes());
        let crc = crc16(&plain);
        plain.extend_from_slice(&crc.to_le_bytes());
        plain
    }

    #[test]
    fn sample_word_packs_lsb_first() {
        let sample = RawSample::new()
            .with_glucose(0x1FFF)
            .with_temperature(0)
            .with_quality(0)
            .with_has_error(false);
        let bytes = sample.into_bytes();
        assert_eq!(bytes[0], 0xFF);
        assert_eq!(bytes[1] & 0x3F, 0x1F);
        let back = RawSample::from_bytes(bytes);
        assert_eq!(back.glucose(), 0x1FFF);
    }

    #[test]
    fn parse_recovers_wear_time_and_sample_count() {
        let plain = payload_with([1000; 10], 1234);
        let parsed = parse_ble_payload(&plain, &flat_calibration(), Utc::now()).unwrap();
        assert_eq!(parsed.wear_time_minutes, 1234);
        assert_eq!(parsed.trend.len(), TREND_SAMPLES);
        assert_eq!(parsed.history.len(), HISTORY_SAMPLES);
    }

    #[test]
    fn checksum_mismatch_rejects_packet() {
        let mut plain = payload_with([1000; 10], 1234);
        plain[5] ^= 0x01;
        let err = parse_ble_payload(&plain, &flat_calibration(), Utc::now()).unwrap_err();
        assert!(matches!(err, SensorError::ChecksumMismatch { .. }));
    }

    #[test]
    fn timestamps_follow_interval_spacing() {
        let now = Utc::now();
        let plain = payload_with([1000; 10], 100);
        let parsed = parse_ble_payload(&plain, &flat_calibration(), now).unwrap();

        for (i, m) in parsed.trend.iter().enumerate() {
            assert_eq!(m.timestamp, now - Duration::minutes(i as i64));
        }
        for (i, m) in parsed.history.iter().enumerate() {
            assert_eq!(m.timestamp, now - Duration::minutes(i as i64 * 15));
        }
    }

    #[test]
    fn trend_classification_tracks_slope() {
        // Flat calibration maps counts at 65/8192 ≈ 0.0079 mg/dL each;
        // 12600 counts sit near 100 mg/dL, clear of both clamp bounds.
        let mut raws = [12600u16; 10];
        raws[0] = 13200; // +600 counts/min ≈ +4.8 mg/dL/min
        let plain = payload_with(raws, 100);
        let parsed = parse_ble_payload(&plain, &flat_calibration(), Utc::now()).unwrap();
        assert_eq!(parsed.trend[0].trend, GlucoseTrend::RisingQuickly);
        assert_eq!(parsed.trend[1].trend, GlucoseTrend::Stable);
        assert_eq!(parsed.trend[TREND_SAMPLES - 1].trend, GlucoseTrend::NotComputable);
    }

    #[test]
    fn snapshot_is_chronological() {
        let now = Utc::now();
        let plain = payload_with([1000; 10], 100);
        let parsed = parse_ble_payload(&plain, &flat_calibration(), now).unwrap();
        let data = SensorData::from_payload(
            Bytes::from(plain),
            [0xAA; 6],
            vec![0x9D, 0, 0, 0, 0, 0],
            flat_calibration(),
            parsed,
        );
        assert!(data.trend.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
        assert!(data.history.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[test]
    fn calibration_is_deterministic_and_clamped() {
        let cal = flat_calibration();
        assert_eq!(
            calibrated_value(1000, 0, &cal),
            calibrated_value(1000, 0, &cal)
        );
        assert_eq!(calibrated_value(0, 0, &cal), GLUCOSE_MIN);

        // Steep calibration: one count per mg/dL, so 1000 counts clamps.
        let steep = FactoryCalibration { i1: 0, i2: 0, i3: 0, i4: 65, i5: 0, i6: 0 };
        assert_eq!(calibrated_value(1000, 0, &steep), GLUCOSE_MAX);
    }
}
