//! BLE connection lifecycle: scanning, candidate matching, unlock
//! sequencing, notification reassembly and recovery policy.
//!
//! All radio traffic happens on one worker task that owns the transport;
//! callers reach it through a command channel, and `disconnect`/`reset`
//! block until the worker has executed them. Backoff timers sleep on
//! detached tasks and re-enter the worker via the same channel, so the
//! worker itself never blocks on a timer.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use chrono::Utc;
use strum_macros::Display;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SensorError;
use crate::measurement::SensorData;
use crate::rxbuffer::{PushOutcome, RxBuffer};
use crate::sensor::{Advertisement, FamilyRegistry, SensorType};
use crate::store::SensorStore;
use crate::transport::{BleTransport, PeripheralId, TransportEvent};

/// Connection lifecycle as observed by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ConnectionState {
    #[strum(to_string = "unassigned")]
    Unassigned,
    #[strum(to_string = "powered off")]
    PoweredOff,
    #[strum(to_string = "scanning")]
    Scanning,
    #[strum(to_string = "connecting")]
    Connecting,
    #[strum(to_string = "connected")]
    Connected,
    #[strum(to_string = "notifying")]
    Notifying,
}

/// What the manager reports to its registered observer.
#[derive(Debug, Clone, PartialEq)]
pub enum SensorEvent {
    Connection(ConnectionState),
    Data(SensorData),
}

/// Recovery policy knobs. The exact backoff delay is deliberately a
/// tunable rather than a fixed behavior.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Delay before rescanning after a clean disconnect.
    pub rescan_delay: Duration,
    /// How often the worker checks the reassembly buffer for a stall.
    pub stall_poll: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            rescan_delay: Duration::from_secs(30),
            stall_poll: Duration::from_secs(5),
        }
    }
}

enum Command {
    Disconnect { done: oneshot::Sender<()> },
    Reset { done: oneshot::Sender<()> },
    Rescan,
}

/// Handle to the lifecycle worker. Dropping it (with no rescan timer
/// pending) shuts the worker down.
pub struct SensorManager {
    cmd_tx: mpsc::UnboundedSender<Command>,
    worker: JoinHandle<()>,
}

impl SensorManager {
    /// Spawn the worker on the current tokio runtime. Observer events
    /// arrive on the returned receiver.
    pub fn start<T: BleTransport>(
        mut transport: T,
        store: Arc<dyn SensorStore>,
        config: ManagerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<SensorEvent>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let transport_events = transport.events();

        let worker = Worker {
            transport,
            store,
            registry: FamilyRegistry::builtin(),
            config,
            state: ConnectionState::Unassigned,
            observer: event_tx,
            rx: RxBuffer::new(),
            peripheral: None,
            stay_connected: true,
            reconnect_pending: false,
            rescan_timer: None,
            cmd_tx: cmd_tx.downgrade(),
        };
        let handle = tokio::spawn(worker.run(cmd_rx, transport_events));

        (
            Self {
                cmd_tx,
                worker: handle,
            },
            event_rx,
        )
    }

    /// Tear down any scan or live link, keeping the pairing. Returns once
    /// the worker has processed the request.
    pub async fn disconnect(&self) -> Result<(), SensorError> {
        self.roundtrip(|done| Command::Disconnect { done }).await
    }

    /// Full reset: clears the persisted identity (forcing re-pairing) and
    /// drops any active link. Safe to call in every state.
    pub async fn reset(&self) -> Result<(), SensorError> {
        self.roundtrip(|done| Command::Reset { done }).await
    }

    /// Ask the worker to start scanning again, if the store is paired.
    pub fn rescan(&self) -> Result<(), SensorError> {
        self.cmd_tx
            .send(Command::Rescan)
            .map_err(|_| SensorError::ManagerGone)
    }

    /// Abort the worker outright.
    pub fn shutdown(self) {
        self.worker.abort();
    }

    async fn roundtrip(
        &self,
        make: impl FnOnce(oneshot::Sender<()>) -> Command,
    ) -> Result<(), SensorError> {
        let (done, ack) = oneshot::channel();
        self.cmd_tx
            .send(make(done))
            .map_err(|_| SensorError::ManagerGone)?;
        ack.await.map_err(|_| SensorError::ManagerGone)
    }
}

/// The UUIDs the current pairing's family answers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FamilyUuids {
    service: Uuid,
    write: Uuid,
    read: Uuid,
}

struct Worker<T: BleTransport> {
    transport: T,
    store: Arc<dyn SensorStore>,
    registry: FamilyRegistry,
    config: ManagerConfig,
    state: ConnectionState,
    observer: mpsc::UnboundedSender<SensorEvent>,
    rx: RxBuffer,
    peripheral: Option<PeripheralId>,
    stay_connected: bool,
    /// The next clean disconnect is a deliberate link drop (stall
    /// recovery) and must reconnect immediately instead of rescanning.
    reconnect_pending: bool,
    rescan_timer: Option<JoinHandle<()>>,
    cmd_tx: mpsc::WeakUnboundedSender<Command>,
}

impl<T: BleTransport> Worker<T> {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut transport_events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("sensor manager worker started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                event = transport_events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = tokio::time::sleep(self.config.stall_poll),
                    if self.state == ConnectionState::Notifying && !self.rx.is_empty() =>
                {
                    self.check_stall().await;
                }
            }
        }

        self.cancel_rescan_timer();
        info!("sensor manager worker stopped");
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            info!(%state, "connection state");
            self.state = state;
            let _ = self.observer.send(SensorEvent::Connection(state));
        }
    }

    fn cancel_rescan_timer(&mut self) {
        if let Some(timer) = self.rescan_timer.take() {
            timer.abort();
        }
    }

    /// Service and characteristic identifiers for the paired family, if
    /// the store holds a supported pairing.
    fn family_uuids(&self) -> Option<FamilyUuids> {
        let patch_info = self.store.patch_info()?;
        let family = self.registry.family_for_patch_info(&patch_info)?;
        Some(FamilyUuids {
            service: family.service_uuid(),
            write: family.write_characteristic(),
            read: family.read_characteristic(),
        })
    }

    fn is_current(&self, peripheral: &PeripheralId) -> bool {
        self.peripheral.as_ref() == Some(peripheral)
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::Disconnect { done } => {
                debug!("disconnect requested");
                self.stay_connected = false;
                self.reconnect_pending = false;
                self.cancel_rescan_timer();
                let res = self.transport.stop_scan().await;
                self.log_transport(res, "stop scan");
                if let Some(peripheral) = self.peripheral.clone() {
                    let res = self.transport.disconnect(&peripheral).await;
                    self.log_transport(res, "disconnect");
                }
                self.rx.reset();
                let _ = done.send(());
            }
            Command::Reset { done } => {
                debug!("full reset requested");
                self.stay_connected = false;
                self.reconnect_pending = false;
                self.cancel_rescan_timer();
                self.store.clear();
                let res = self.transport.stop_scan().await;
                self.log_transport(res, "stop scan");
                if let Some(peripheral) = self.peripheral.take() {
                    let res = self.transport.disconnect(&peripheral).await;
                    self.log_transport(res, "disconnect");
                }
                self.rx.reset();
                self.set_state(ConnectionState::Unassigned);
                let _ = done.send(());
            }
            Command::Rescan => {
                self.stay_connected = true;
                self.scan_if_paired().await;
            }
        }
    }

    /// Scanning is gated on the all-or-nothing pairing invariant; an
    /// incomplete identity is a precondition, not an error.
    async fn scan_if_paired(&mut self) {
        if !self.store.paired() {
            info!("not paired, connect attempts stay gated");
            return;
        }
        match self.transport.start_scan().await {
            Ok(()) => self.set_state(ConnectionState::Scanning),
            Err(err) => warn!(%err, "scan failed to start"),
        }
    }

    async fn handle_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::PoweredOn => {
                debug!("adapter powered on");
                self.scan_if_paired().await;
            }
            TransportEvent::PoweredOff => {
                self.rx.reset();
                self.set_state(ConnectionState::PoweredOff);
            }
            TransportEvent::Discovered {
                peripheral,
                advertisement,
                rssi,
            } => {
                self.handle_discovery(peripheral, advertisement, rssi).await;
            }
            TransportEvent::Connected { peripheral } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                self.set_state(ConnectionState::Connected);
                if let Some(uuids) = self.family_uuids() {
                    let res = self
                        .transport
                        .discover_characteristics(&peripheral, uuids.service)
                        .await;
                    self.log_transport(res, "service discovery");
                }
            }
            TransportEvent::ConnectFailed { peripheral, error } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                // Transport-reported failure: retry the same peripheral
                // immediately.
                warn!(%peripheral, %error, "connect failed, retrying");
                let res = self.transport.connect(&peripheral).await;
                self.log_transport(res, "reconnect");
                self.set_state(ConnectionState::Connecting);
            }
            TransportEvent::Disconnected { peripheral, error } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                self.rx.reset();
                match error {
                    Some(error) => {
                        warn!(%peripheral, %error, "link lost, reconnecting");
                        let res = self.transport.connect(&peripheral).await;
                        self.log_transport(res, "reconnect");
                        self.set_state(ConnectionState::Connecting);
                    }
                    None if self.reconnect_pending => {
                        self.reconnect_pending = false;
                        info!(%peripheral, "stalled link dropped, reconnecting");
                        let res = self.transport.connect(&peripheral).await;
                        self.log_transport(res, "reconnect");
                        self.set_state(ConnectionState::Connecting);
                    }
                    None if self.stay_connected => {
                        // A clean disconnect usually means the sensor left
                        // range; rescanning immediately would hot-loop.
                        info!(
                            delay_s = self.config.rescan_delay.as_secs(),
                            "clean disconnect, rescanning after delay"
                        );
                        self.set_state(ConnectionState::Unassigned);
                        self.schedule_rescan();
                    }
                    None => {
                        self.set_state(ConnectionState::Unassigned);
                    }
                }
            }
            TransportEvent::CharacteristicsDiscovered {
                peripheral,
                characteristics,
            } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                self.unlock(peripheral, characteristics).await;
            }
            TransportEvent::WriteConfirmed {
                peripheral,
                characteristic,
            } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                let Some(uuids) = self.family_uuids() else {
                    return;
                };
                if characteristic == uuids.write {
                    debug!("unlock write confirmed, subscribing");
                    let res = self.transport.subscribe(&peripheral, uuids.read).await;
                    self.log_transport(res, "subscribe");
                }
            }
            TransportEvent::SubscriptionStarted { peripheral, .. } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                self.rx.reset();
                self.set_state(ConnectionState::Notifying);
            }
            TransportEvent::Notification {
                peripheral,
                characteristic,
                value,
            } => {
                if !self.is_current(&peripheral) {
                    return;
                }
                let Some(uuids) = self.family_uuids() else {
                    return;
                };
                if characteristic == uuids.read {
                    self.handle_notification(&value);
                }
            }
        }
    }

    async fn handle_discovery(
        &mut self,
        peripheral: PeripheralId,
        advertisement: Advertisement,
        rssi: Option<i16>,
    ) {
        if self.state != ConnectionState::Scanning {
            return;
        }
        let Some(uid) = self.store.uid() else {
            return;
        };
        if self
            .registry
            .match_advertisement(&advertisement, &uid)
            .is_none()
        {
            return;
        }

        info!(%peripheral, ?rssi, "paired sensor advertising, connecting");
        let res = self.transport.stop_scan().await;
        self.log_transport(res, "stop scan");
        self.peripheral = Some(peripheral.clone());
        let res = self.transport.connect(&peripheral).await;
        self.log_transport(res, "connect");
        self.set_state(ConnectionState::Connecting);
    }

    /// Discovering the write characteristic triggers the unlock sequence:
    /// bump and persist the counter first, then write the payload with
    /// delivery acknowledgment.
    async fn unlock(&mut self, peripheral: PeripheralId, characteristics: Vec<Uuid>) {
        let Some(uuids) = self.family_uuids() else {
            warn!("no supported family for the stored pairing");
            return;
        };
        if !characteristics.contains(&uuids.write) {
            warn!(%peripheral, "write characteristic missing");
            return;
        }

        let (Some(uid), Some(patch_info)) = (self.store.uid(), self.store.patch_info()) else {
            warn!("identity vanished mid-connection");
            return;
        };

        let unlock_count = self.store.unlock_counter().wrapping_add(1);
        self.store.set_unlock_counter(unlock_count);
        debug!(unlock_count, "unlocking streaming mode");

        let payload = {
            let Some(family) = self.registry.family_for_patch_info(&patch_info) else {
                return;
            };
            match family.unlock_payload(&uid, &patch_info, unlock_count) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(%err, "unlock payload computation failed");
                    return;
                }
            }
        };

        let res = self
            .transport
            .write(&peripheral, uuids.write, payload.to_vec())
            .await;
        self.log_transport(res, "unlock write");
    }

    /// Append a fragment; a complete 46-byte buffer is decoded at once and
    /// the buffer is reset regardless of the outcome.
    fn handle_notification(&mut self, value: &[u8]) {
        match self.rx.push(value) {
            PushOutcome::Accumulating => {}
            PushOutcome::Overflow { accumulated } => {
                warn!(accumulated, "rx buffer overran, discarded");
            }
            PushOutcome::Complete(packet) => {
                if let Err(err) = self.decode_packet(&packet) {
                    // Per-packet failure: discard and await the next one.
                    debug!(%err, "packet discarded");
                }
            }
        }
    }

    fn decode_packet(&mut self, packet: &[u8]) -> Result<(), SensorError> {
        let uid = self
            .store
            .uid()
            .ok_or(SensorError::NotPaired { missing: "uid" })?;
        let patch_info = self.store.patch_info().ok_or(SensorError::NotPaired {
            missing: "patch info",
        })?;
        let calibration = self.store.calibration().ok_or(SensorError::NotPaired {
            missing: "calibration",
        })?;

        let family = self
            .registry
            .family_for_patch_info(&patch_info)
            .ok_or_else(|| {
                SensorError::UnsupportedSensor(SensorType::from_patch_info(&patch_info))
            })?;

        let (plain, payload) =
            family.decode_packet(&uid, &patch_info, &calibration, packet, Utc::now())?;

        debug!(
            wear_time = payload.wear_time_minutes,
            trend = payload.trend.len(),
            history = payload.history.len(),
            "packet decoded"
        );
        self.store
            .set_last_wear_time_minutes(Some(payload.wear_time_minutes));

        let data = SensorData::from_payload(plain, uid, patch_info, calibration, payload);
        let _ = self.observer.send(SensorEvent::Data(data));
        Ok(())
    }

    /// Stall recovery: the resend budget is burned down first; once it is
    /// exhausted the link is dropped and reconnected immediately. The drop
    /// reads as a clean disconnect to the transport, so `reconnect_pending`
    /// keeps it out of the delayed-rescan path.
    async fn check_stall(&mut self) {
        if !self.rx.is_stalled(Instant::now()) {
            return;
        }
        warn!(
            accumulated = self.rx.len(),
            resends = self.rx.resend_counter(),
            "notification stream stalled"
        );
        if self.rx.register_resend() {
            let dropped = self.rx.len();
            self.rx.discard_partial();
            debug!(dropped, "partial packet dropped, awaiting next");
        } else {
            self.rx.reset();
            if let Some(peripheral) = self.peripheral.clone() {
                self.reconnect_pending = true;
                let res = self.transport.disconnect(&peripheral).await;
                self.log_transport(res, "stall disconnect");
            }
        }
    }

    fn schedule_rescan(&mut self) {
        self.cancel_rescan_timer();
        let delay = self.config.rescan_delay;
        let cmd_tx = self.cmd_tx.clone();
        self.rescan_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = cmd_tx.upgrade() {
                let _ = tx.send(Command::Rescan);
            }
        }));
    }

    fn log_transport(&self, result: Result<(), SensorError>, context: &str) {
        if let Err(err) = result {
            warn!(%err, "{context} failed");
        }
    }
}
