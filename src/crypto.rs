//! Keyed transforms for the Libre2 sensor family.
//!
//! These are ports of the documented, deterministic transforms the sensor
//! applies to its FRAM image, its BLE notification stream and its streaming
//! unlock command. All functions here are pure and operate on borrowed byte
//! slices; nothing in this module touches the radio or the store.

use crate::error::SensorError;

/// Length of a full FRAM image as read over NFC.
pub const FRAM_LEN: usize = 344;
/// Length of a reassembled BLE notification buffer.
pub const BLE_PACKET_LEN: usize = 46;
/// Length of the decrypted BLE payload (nonce stripped).
pub const BLE_PAYLOAD_LEN: usize = 44;
/// Length of the streaming unlock command.
pub const UNLOCK_PAYLOAD_LEN: usize = 20;
/// Streaming enable time constant written with every unlock command.
pub const ENABLE_TIME: u32 = 42;

/// Fixed key schedule words shared by all transforms.
const KEY: [u16; 4] = [0xA0C5, 0x6860, 0x0000, 0x14C6];

#[inline]
fn word(high: u8, low: u8) -> u16 {
    u16::from(high) << 8 | u16::from(low)
}

/// One mixing step: shift out the two low bits, folding each into the
/// state via the key schedule.
fn op(value: u16) -> u16 {
    let mut res = value >> 2;
    if value & 1 != 0 {
        res ^= KEY[1];
    }
    if value & 2 != 0 {
        res ^= KEY[0];
    }
    res
}

/// Core block function over four u16 words.
fn process_crypto(input: [u16; 4]) -> [u16; 4] {
    let r0 = op(input[0]) ^ input[3];
    let r1 = op(r0) ^ input[2];
    let r2 = op(r1) ^ input[1];
    let r3 = op(r2) ^ input[0];
    let r4 = op(r3);
    let r5 = op(r4 ^ r0);
    let r6 = op(r5 ^ r1);
    let r7 = op(r6 ^ r2);

    [r3 ^ r7, r2 ^ r6, r1 ^ r5, r0 ^ r4]
}

/// Block-function input derived from the sensor UID and two salt words.
fn prepare_variables(uid: &[u8; 6], x: u16, y: u16) -> [u16; 4] {
    let s1 = (u32::from(word(uid[5], uid[4])) + u32::from(x) + u32::from(y)) as u16;
    let s2 = (u32::from(word(uid[3], uid[2])) + u32::from(KEY[2])) as u16;
    let s3 = (u32::from(word(uid[1], uid[0])) + 2 * u32::from(x)) as u16;
    let s4 = 0x241a ^ KEY[3];

    [s1, s2, s3, s4]
}

/// Second-form input used by the BLE and unlock key schedules.
fn prepare_variables2(uid: &[u8; 6], i1: u16, i2: u16, i3: u16, i4: u16) -> [u16; 4] {
    let s1 = (u32::from(word(uid[5], uid[4])) + u32::from(i1)) as u16;
    let s2 = (u32::from(word(uid[3], uid[2])) + u32::from(i2)) as u16;
    let s3 = (u32::from(word(uid[1], uid[0])) + u32::from(i3) + u32::from(KEY[2])) as u16;
    let s4 = (u32::from(i4) + u32::from(KEY[3])) as u16;

    [s1, s2, s3, s4]
}

/// Four whitened bytes derived from the UID, used both for the BLE key
/// schedule and for the unlock command.
fn useful_function(uid: &[u8; 6], x: u16, y: u16) -> [u8; 4] {
    let block = process_crypto(prepare_variables(uid, x, y));
    let low = block[0] ^ 0x4163;
    let high = block[1] ^ 0x4344;

    [low as u8, (low >> 8) as u8, high as u8, (high >> 8) as u8]
}

/// Append the four words of `block` to `out` in little-endian byte order.
fn push_block_le(out: &mut Vec<u8>, block: [u16; 4]) {
    for w in block {
        out.extend_from_slice(&w.to_le_bytes());
    }
}

/// Decrypt a full FRAM image read over NFC.
///
/// The image is processed as 43 blocks of 8 bytes, each XORed with a block
/// key derived from the UID and the block index. The header and footer
/// blocks (0..3 and 40..43) are additionally salted with the patch-info
/// word. Output length equals input length.
pub fn decrypt_fram(
    uid: &[u8; 6],
    patch_info: &[u8],
    cipher: &[u8],
) -> Result<Vec<u8>, SensorError> {
    if cipher.len() != FRAM_LEN {
        return Err(SensorError::InvalidLength {
            expected: FRAM_LEN,
            actual: cipher.len(),
        });
    }
    if patch_info.len() < 6 {
        return Err(SensorError::InvalidLength {
            expected: 6,
            actual: patch_info.len(),
        });
    }

    let mut plain = Vec::with_capacity(FRAM_LEN);
    for i in 0..43u16 {
        let salt = if i < 3 || i >= 40 {
            word(patch_info[5], patch_info[4]) ^ 0x44
        } else {
            0x44
        };

        let mut keystream = Vec::with_capacity(8);
        push_block_le(&mut keystream, process_crypto(prepare_variables(uid, i, salt)));

        let base = usize::from(i) * 8;
        for j in 0..8 {
            plain.push(cipher[base + j] ^ keystream[j]);
        }
    }

    Ok(plain)
}

/// Expanded keystream for one BLE packet: eight rounds of the block
/// function, 64 bytes total (only the first 44 are consumed).
fn ble_keystream(uid: &[u8; 6], nonce: [u8; 2]) -> Vec<u8> {
    let d = useful_function(uid, 0x1b, 0x1b6a);
    let x = (word(d[1], d[0]) ^ word(d[3], d[2])) | 0x63;
    let y = word(nonce[1], nonce[0]) ^ 0x63;

    let mut state = process_crypto(prepare_variables2(uid, x, y, 0x1b6a, 0x1b6a));
    let mut key = Vec::with_capacity(64);
    for _ in 0..8 {
        push_block_le(&mut key, state);
        state = process_crypto(state);
    }

    key
}

/// Decrypt a reassembled 46-byte notification buffer.
///
/// The first two bytes travel in the clear and seed the keystream; the
/// remaining 44 bytes are XOR-decrypted. The embedded checksum is *not*
/// verified here. That is the measurement parser's job, so a caller can
/// distinguish transport garbage from a checksum miss.
pub fn decrypt_ble(uid: &[u8; 6], cipher: &[u8]) -> Result<Vec<u8>, SensorError> {
    if cipher.len() != BLE_PACKET_LEN {
        return Err(SensorError::InvalidLength {
            expected: BLE_PACKET_LEN,
            actual: cipher.len(),
        });
    }

    let key = ble_keystream(uid, [cipher[0], cipher[1]]);
    let plain = cipher[2..]
        .iter()
        .zip(key.iter())
        .map(|(c, k)| c ^ k)
        .collect();

    Ok(plain)
}

/// Compute the authenticated command that enables the sensor's BLE
/// streaming mode.
///
/// Layout: enable time (u32 LE) | unlock count (u16 LE) | enable-command
/// whitening bytes | 10-byte tag from the expanded block function. The
/// output is a pure function of its inputs; the caller owns the
/// monotonicity of `unlock_count`.
pub fn streaming_unlock_payload(
    uid: &[u8; 6],
    patch_info: &[u8],
    enable_time: u32,
    unlock_count: u16,
) -> Result<[u8; UNLOCK_PAYLOAD_LEN], SensorError> {
    if patch_info.len() < 6 {
        return Err(SensorError::InvalidLength {
            expected: 6,
            actual: patch_info.len(),
        });
    }

    let b: [u8; 6] = {
        let t = enable_time.to_le_bytes();
        let c = unlock_count.to_le_bytes();
        [t[0], t[1], t[2], t[3], c[0], c[1]]
    };

    let d1 = useful_function(uid, 0x1b, 0x1b6a);
    let d2 = useful_function(
        uid,
        0x1e,
        (enable_time & 0xffff) as u16 ^ word(patch_info[5], patch_info[4]),
    );

    let t1 = process_crypto(prepare_variables2(
        uid,
        word(b[1], b[0]),
        word(d1[1], d1[0]),
        word(b[5], b[4]),
        word(d2[1], d2[0]),
    ));
    let t2 = process_crypto(t1);

    let mut tag = Vec::with_capacity(16);
    push_block_le(&mut tag, t2);
    push_block_le(&mut tag, process_crypto(t2));

    let mut payload = [0u8; UNLOCK_PAYLOAD_LEN];
    payload[..6].copy_from_slice(&b);
    payload[6..10].copy_from_slice(&d2);
    payload[10..].copy_from_slice(&tag[..10]);

    Ok(payload)
}

/// Sensor checksum: reflected CRC-16/CCITT (poly 0x8408, init 0xFFFF)
/// with the remainder bit-reversed, as stored by the sensor.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &byte in data {
        crc ^= u16::from(byte);
        for _ in 0..8 {
            crc = if crc & 1 != 0 { (crc >> 1) ^ 0x8408 } else { crc >> 1 };
        }
    }

    crc.reverse_bits()
}
