//! Reassembly of notification fragments into whole 46-byte packets.
//!
//! The sensor streams each packet as fragments (observed 20, 18, 8 bytes,
//! in that order); any fragment size is accepted and appended. The buffer
//! is handed out the moment it holds exactly 46 bytes and is reset
//! unconditionally after every decode attempt.

use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::crypto::BLE_PACKET_LEN;

/// No-fragment window after which the owner is told the stream stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);
/// Resend budget offered to the owner; not enforced here.
pub const MAX_RESEND_REQUESTS: u8 = 3;

/// Observable reassembly state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RxState {
    /// Empty buffer, nothing pending.
    Idle,
    /// Partial packet accumulated.
    Accumulating,
}

/// Outcome of appending one fragment.
#[derive(Debug, Clone, PartialEq)]
pub enum PushOutcome {
    /// Fragment absorbed, packet still incomplete.
    Accumulating,
    /// Buffer hit exactly 46 bytes: decode now. The buffer is already
    /// reset when this is returned.
    Complete(Bytes),
    /// Accumulated length ran past 46 bytes; buffer discarded.
    Overflow { accumulated: usize },
}

#[derive(Debug)]
pub struct RxBuffer {
    buffer: BytesMut,
    resend_counter: u8,
    last_fragment: Instant,
}

impl RxBuffer {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(BLE_PACKET_LEN),
            resend_counter: 0,
            last_fragment: Instant::now(),
        }
    }

    pub fn state(&self) -> RxState {
        if self.buffer.is_empty() {
            RxState::Idle
        } else {
            RxState::Accumulating
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Append one notification fragment, unconditionally.
    pub fn push(&mut self, fragment: &[u8]) -> PushOutcome {
        self.last_fragment = Instant::now();
        self.buffer.extend_from_slice(fragment);
        debug!(
            fragment_len = fragment.len(),
            accumulated = self.buffer.len(),
            "rx fragment"
        );

        match self.buffer.len() {
            n if n == BLE_PACKET_LEN => {
                let packet = self.buffer.split().freeze();
                self.reset();
                PushOutcome::Complete(packet)
            }
            n if n > BLE_PACKET_LEN => {
                let accumulated = self.buffer.len();
                self.reset();
                PushOutcome::Overflow { accumulated }
            }
            _ => PushOutcome::Accumulating,
        }
    }

    /// Whether no fragment arrived within the stall window while a
    /// partial packet is pending. The owner decides the recovery action.
    pub fn is_stalled(&self, now: Instant) -> bool {
        self.state() == RxState::Accumulating
            && now.duration_since(self.last_fragment) >= STALL_TIMEOUT
    }

    pub fn resend_counter(&self) -> u8 {
        self.resend_counter
    }

    /// Bump the resend counter; returns false once the budget is spent.
    pub fn register_resend(&mut self) -> bool {
        self.resend_counter += 1;
        self.resend_counter <= MAX_RESEND_REQUESTS
    }

    /// Drop a partial packet and restart the stall clock, keeping the
    /// resend counter so the owner's recovery budget still burns down.
    pub fn discard_partial(&mut self) {
        self.buffer.clear();
        self.last_fragment = Instant::now();
    }

    /// Drop any partial packet and restart the stall clock. Called after
    /// every decode attempt and on each subscription-state transition.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.resend_counter = 0;
        self.last_fragment = Instant::now();
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new()
    }
}
