//! btleplug-backed implementation of [`BleTransport`].
//!
//! One background task pumps the adapter's central events into the
//! transport event channel; a further task per subscription forwards
//! value notifications. btleplug reports disconnects without an error
//! cause, so they surface as clean disconnects and recovery runs through
//! the delayed-rescan path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use bytes::Bytes;
use futures_lite::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::SensorError;
use crate::sensor::Advertisement;
use crate::transport::{BleTransport, PeripheralId, TransportEvent};

type PeripheralMap = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

pub struct BluezTransport {
    adapter: Adapter,
    peripherals: PeripheralMap,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

impl BluezTransport {
    /// Connect to the first available adapter and start the event pump.
    pub async fn new() -> Result<Self, SensorError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| SensorError::Transport("no bluetooth adapter found".into()))?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let peripherals: PeripheralMap = Arc::new(Mutex::new(HashMap::new()));

        tokio::spawn(pump_central_events(
            adapter.clone(),
            peripherals.clone(),
            events_tx.clone(),
        ));
        // btleplug exposes no portable power-state stream; a usable
        // adapter is treated as powered on.
        let _ = events_tx.send(TransportEvent::PoweredOn);

        Ok(Self {
            adapter,
            peripherals,
            events_tx,
            events_rx: Some(events_rx),
        })
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, SensorError> {
        self.peripherals
            .lock()
            .expect("peripheral map lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| SensorError::Transport(format!("unknown peripheral {id}")))
    }

    fn characteristic(
        peripheral: &Peripheral,
        uuid: Uuid,
    ) -> Result<btleplug::api::Characteristic, SensorError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or(SensorError::CharacteristicNotFound(uuid))
    }
}

async fn pump_central_events(
    adapter: Adapter,
    peripherals: PeripheralMap,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(err) => {
            warn!(%err, "central event stream unavailable");
            return;
        }
    };

    while let Some(event) = events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };

                let peripheral_id = PeripheralId(id.to_string());
                peripherals
                    .lock()
                    .expect("peripheral map lock poisoned")
                    .insert(peripheral_id.clone(), peripheral);

                // CoreBluetooth hands the manufacturer block over as raw
                // bytes; rebuild that shape from btleplug's keyed map.
                let manufacturer_data = properties
                    .manufacturer_data
                    .iter()
                    .next()
                    .map(|(company, data)| {
                        let mut raw = company.to_le_bytes().to_vec();
                        raw.extend_from_slice(data);
                        raw
                    })
                    .unwrap_or_default();

                let _ = events_tx.send(TransportEvent::Discovered {
                    peripheral: peripheral_id,
                    advertisement: Advertisement {
                        local_name: properties.local_name,
                        manufacturer_data,
                    },
                    rssi: properties.rssi,
                });
            }
            CentralEvent::DeviceDisconnected(id) => {
                let _ = events_tx.send(TransportEvent::Disconnected {
                    peripheral: PeripheralId(id.to_string()),
                    error: None,
                });
            }
            _ => {}
        }
    }
    debug!("central event stream ended");
}

#[async_trait]
impl BleTransport for BluezTransport {
    fn events(&mut self) -> mpsc::UnboundedReceiver<TransportEvent> {
        self.events_rx.take().expect("events receiver already taken")
    }

    async fn start_scan(&mut self) -> Result<(), SensorError> {
        debug!("starting scan");
        self.adapter.start_scan(ScanFilter::default()).await?;
        Ok(())
    }

    async fn stop_scan(&mut self) -> Result<(), SensorError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    async fn connect(&mut self, id: &PeripheralId) -> Result<(), SensorError> {
        let peripheral = self.peripheral(id)?;
        match peripheral.connect().await {
            Ok(()) => {
                let _ = self.events_tx.send(TransportEvent::Connected {
                    peripheral: id.clone(),
                });
            }
            Err(err) => {
                let _ = self.events_tx.send(TransportEvent::ConnectFailed {
                    peripheral: id.clone(),
                    error: err.to_string(),
                });
            }
        }
        Ok(())
    }

    async fn disconnect(&mut self, id: &PeripheralId) -> Result<(), SensorError> {
        let peripheral = self.peripheral(id)?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn discover_characteristics(
        &mut self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<(), SensorError> {
        let peripheral = self.peripheral(id)?;
        peripheral.discover_services().await?;

        let characteristics: Vec<Uuid> = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == service)
            .map(|c| c.uuid)
            .collect();
        debug!(?characteristics, "characteristics discovered");

        let _ = self
            .events_tx
            .send(TransportEvent::CharacteristicsDiscovered {
                peripheral: id.clone(),
                characteristics,
            });
        Ok(())
    }

    async fn write(
        &mut self,
        id: &PeripheralId,
        characteristic: Uuid,
        value: Vec<u8>,
    ) -> Result<(), SensorError> {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral
            .write(&target, &value, WriteType::WithResponse)
            .await?;
        // write-with-response returns only after the peripheral acked
        let _ = self.events_tx.send(TransportEvent::WriteConfirmed {
            peripheral: id.clone(),
            characteristic,
        });
        Ok(())
    }

    async fn subscribe(
        &mut self,
        id: &PeripheralId,
        characteristic: Uuid,
    ) -> Result<(), SensorError> {
        let peripheral = self.peripheral(id)?;
        let target = Self::characteristic(&peripheral, characteristic)?;
        peripheral.subscribe(&target).await?;

        let mut notifications = peripheral.notifications().await?;
        let events_tx = self.events_tx.clone();
        let peripheral_id = id.clone();
        tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let _ = events_tx.send(TransportEvent::Notification {
                    peripheral: peripheral_id.clone(),
                    characteristic: notification.uuid,
                    value: Bytes::from(notification.value),
                });
            }
        });

        let _ = self.events_tx.send(TransportEvent::SubscriptionStarted {
            peripheral: id.clone(),
            characteristic,
        });
        Ok(())
    }
}
