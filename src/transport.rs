//! GATT central-role transport boundary.
//!
//! The lifecycle manager drives the radio exclusively through
//! [`BleTransport`]; command issue is async, completions and pushes come
//! back as [`TransportEvent`]s on a channel. This keeps the manager's
//! worker loop testable against an in-memory fake and confines the real
//! backend (btleplug, feature `btleplug`) to one adapter module.

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SensorError;
use crate::sensor::Advertisement;

#[cfg(feature = "btleplug")]
pub mod bluez;

/// Opaque peripheral handle, stable for the lifetime of the transport.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PeripheralId(pub String);

impl std::fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Asynchronous completions and pushes from the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The adapter radio became usable.
    PoweredOn,
    /// The adapter radio went away; all links are implicitly dead.
    PoweredOff,
    /// An advertisement was seen while scanning.
    Discovered {
        peripheral: PeripheralId,
        advertisement: Advertisement,
        rssi: Option<i16>,
    },
    Connected {
        peripheral: PeripheralId,
    },
    ConnectFailed {
        peripheral: PeripheralId,
        error: String,
    },
    /// `error` is `None` for a clean, host-initiated disconnect.
    Disconnected {
        peripheral: PeripheralId,
        error: Option<String>,
    },
    /// Characteristics of the requested service, post-discovery.
    CharacteristicsDiscovered {
        peripheral: PeripheralId,
        characteristics: Vec<Uuid>,
    },
    /// Delivery acknowledgment for a write-with-response.
    WriteConfirmed {
        peripheral: PeripheralId,
        characteristic: Uuid,
    },
    /// Notification subscription took effect.
    SubscriptionStarted {
        peripheral: PeripheralId,
        characteristic: Uuid,
    },
    /// A value push from a subscribed characteristic.
    Notification {
        peripheral: PeripheralId,
        characteristic: Uuid,
        value: Bytes,
    },
}

/// GATT central operations. Implementations deliver completions through
/// the event channel handed out by [`BleTransport::events`], which may be
/// taken exactly once.
#[async_trait]
pub trait BleTransport: Send + 'static {
    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent>;

    async fn start_scan(&mut self) -> Result<(), SensorError>;
    async fn stop_scan(&mut self) -> Result<(), SensorError>;

    async fn connect(&mut self, peripheral: &PeripheralId) -> Result<(), SensorError>;
    async fn disconnect(&mut self, peripheral: &PeripheralId) -> Result<(), SensorError>;

    /// Discover `service` and its characteristics; completion arrives as
    /// [`TransportEvent::CharacteristicsDiscovered`].
    async fn discover_characteristics(
        &mut self,
        peripheral: &PeripheralId,
        service: Uuid,
    ) -> Result<(), SensorError>;

    /// Write with response; the delivery ack arrives as
    /// [`TransportEvent::WriteConfirmed`].
    async fn write(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), SensorError>;

    /// Subscribe for notifications; the ack arrives as
    /// [`TransportEvent::SubscriptionStarted`].
    async fn subscribe(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<(), SensorError>;
}
