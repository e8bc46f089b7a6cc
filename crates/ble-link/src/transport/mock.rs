//! In-memory transport
//!
//! Plays back scripted peripherals and answers writes through a
//! responder closure, emitting the same events a platform stack would.
//! Used by tests throughout the workspace and by the CLI's simulated mode.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use super::{
    Advertisement, BleTransport, CharacteristicInfo, CharacteristicProperties, PeripheralId,
    RadioState, TransportError, TransportEvent, WriteKind, EVENT_CAPACITY,
};
use crate::descriptor::{uuid_from_u16, SERVICE_FFF0};

/// Produces reply fragments for one written command, or `None` to stay silent
pub type Responder = Arc<dyn Fn(&str) -> Option<Vec<String>> + Send + Sync>;

/// What a connection request leads to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Emit `Connected`
    Accept,
    /// Emit `ConnectFailed` with the reason
    Fail(String),
    /// Emit nothing
    Hang,
}

/// A scripted peripheral with its GATT table
#[derive(Debug, Clone)]
pub struct MockPeripheral {
    pub advertisement: Advertisement,
    pub services: Vec<(Uuid, Vec<CharacteristicInfo>)>,
}

impl MockPeripheral {
    pub fn new(id: &str, name: Option<&str>) -> Self {
        Self {
            advertisement: Advertisement {
                id: PeripheralId::new(id),
                local_name: name.map(str::to_string),
                rssi: Some(-60),
                services: Vec::new(),
                connectable: true,
            },
            services: Vec::new(),
        }
    }

    /// Typical clone layout: service FFF0, notify FFF1, write FFF2
    pub fn elm327(id: &str, name: &str) -> Self {
        let notify = CharacteristicInfo {
            uuid: uuid_from_u16(0xFFF1),
            service: SERVICE_FFF0,
            properties: CharacteristicProperties::NOTIFY | CharacteristicProperties::READ,
        };
        let write = CharacteristicInfo {
            uuid: uuid_from_u16(0xFFF2),
            service: SERVICE_FFF0,
            properties: CharacteristicProperties::WRITE
                | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        };
        let mut peripheral = Self::new(id, Some(name)).with_service(SERVICE_FFF0, vec![notify, write]);
        peripheral.advertisement.services.push(SERVICE_FFF0);
        peripheral
    }

    pub fn with_service(mut self, service: Uuid, characteristics: Vec<CharacteristicInfo>) -> Self {
        self.services.push((service, characteristics));
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.advertisement.rssi = Some(rssi);
        self
    }
}

struct MockState {
    radio: RadioState,
    scanning: bool,
    peripherals: Vec<MockPeripheral>,
    connect_behavior: ConnectBehavior,
    connected: Option<PeripheralId>,
    subscribed: Option<CharacteristicInfo>,
    responder: Option<Responder>,
    fragment_size: Option<usize>,
    writes: Vec<String>,
    connect_attempts: Vec<PeripheralId>,
    disconnects: usize,
}

/// Scriptable [`BleTransport`]
pub struct MockTransport {
    events: broadcast::Sender<TransportEvent>,
    state: Mutex<MockState>,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    /// Powered-on radio with no peripherals
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            events,
            state: Mutex::new(MockState {
                radio: RadioState::PoweredOn,
                scanning: false,
                peripherals: Vec::new(),
                connect_behavior: ConnectBehavior::Accept,
                connected: None,
                subscribed: None,
                responder: None,
                fragment_size: None,
                writes: Vec::new(),
                connect_attempts: Vec::new(),
                disconnects: 0,
            }),
        }
    }

    /// Single `OBDII` adapter answering through `responder`
    pub fn elm327(responder: Responder) -> Self {
        Self::new()
            .with_peripheral(MockPeripheral::elm327("mock-elm327", "OBDII"))
            .with_responder(responder)
    }

    pub fn with_peripheral(self, peripheral: MockPeripheral) -> Self {
        self.state.lock().peripherals.push(peripheral);
        self
    }

    pub fn with_responder(self, responder: Responder) -> Self {
        self.set_responder(responder);
        self
    }

    pub fn with_connect_behavior(self, behavior: ConnectBehavior) -> Self {
        self.set_connect_behavior(behavior);
        self
    }

    pub fn with_radio_state(self, radio: RadioState) -> Self {
        self.state.lock().radio = radio;
        self
    }

    /// Split every reply into notifications of at most `size` bytes
    pub fn with_fragment_size(self, size: usize) -> Self {
        self.state.lock().fragment_size = Some(size.max(1));
        self
    }

    pub fn set_responder(&self, responder: Responder) {
        self.state.lock().responder = Some(responder);
    }

    pub fn set_connect_behavior(&self, behavior: ConnectBehavior) {
        self.state.lock().connect_behavior = behavior;
    }

    /// Change the radio state and report it
    pub fn set_radio_state(&self, radio: RadioState) {
        self.state.lock().radio = radio;
        self.emit(TransportEvent::RadioStateChanged(radio));
    }

    /// Add a peripheral; reported immediately while scanning
    pub fn advertise(&self, peripheral: MockPeripheral) {
        let advertisement = peripheral.advertisement.clone();
        let scanning = {
            let mut state = self.state.lock();
            state.peripherals.push(peripheral);
            state.scanning
        };
        if scanning {
            self.emit(TransportEvent::Discovered(advertisement));
        }
    }

    /// Deliver an unsolicited notification on the subscribed characteristic
    pub fn push_notification(&self, value: &[u8]) {
        let target = {
            let state = self.state.lock();
            state.connected.clone().zip(state.subscribed.clone())
        };
        if let Some((id, characteristic)) = target {
            self.emit(TransportEvent::ValueChanged {
                id,
                characteristic: characteristic.uuid,
                value: value.to_vec(),
            });
        }
    }

    /// Drop the current link as if the adapter lost power
    pub fn drop_link(&self) {
        let dropped = {
            let mut state = self.state.lock();
            state.subscribed = None;
            state.connected.take()
        };
        if let Some(id) = dropped {
            self.emit(TransportEvent::Disconnected(id));
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        // No receivers is fine
        let _ = self.events.send(event);
    }

    /// Commands written so far, without the terminating carriage return
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    pub fn connect_attempts(&self) -> Vec<PeripheralId> {
        self.state.lock().connect_attempts.clone()
    }

    pub fn disconnect_count(&self) -> usize {
        self.state.lock().disconnects
    }

    pub fn is_scanning(&self) -> bool {
        self.state.lock().scanning
    }

    pub fn is_subscribed(&self) -> bool {
        self.state.lock().subscribed.is_some()
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<MockPeripheral, TransportError> {
        self.state
            .lock()
            .peripherals
            .iter()
            .find(|p| &p.advertisement.id == id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))
    }

    fn require_powered(&self) -> Result<(), TransportError> {
        match self.state.lock().radio {
            RadioState::PoweredOn => Ok(()),
            other => Err(TransportError::Unavailable(other)),
        }
    }
}

fn split_fragments(reply: String, size: Option<usize>) -> Vec<String> {
    match size {
        Some(size) => {
            let chars: Vec<char> = reply.chars().collect();
            chars.chunks(size).map(|chunk| chunk.iter().collect()).collect()
        }
        None => vec![reply],
    }
}

#[async_trait]
impl BleTransport for MockTransport {
    async fn radio_state(&self) -> RadioState {
        self.state.lock().radio
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.require_powered()?;
        let advertisements: Vec<Advertisement> = {
            let mut state = self.state.lock();
            state.scanning = true;
            state.peripherals.iter().map(|p| p.advertisement.clone()).collect()
        };
        for advertisement in advertisements {
            self.emit(TransportEvent::Discovered(advertisement));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.state.lock().scanning = false;
        Ok(())
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        self.require_powered()?;
        self.peripheral(id)?;
        let behavior = {
            let mut state = self.state.lock();
            state.connect_attempts.push(id.clone());
            state.connect_behavior.clone()
        };
        match behavior {
            ConnectBehavior::Accept => {
                self.state.lock().connected = Some(id.clone());
                self.emit(TransportEvent::Connected(id.clone()));
            }
            ConnectBehavior::Fail(reason) => {
                self.emit(TransportEvent::ConnectFailed { id: id.clone(), reason });
            }
            ConnectBehavior::Hang => debug!(peripheral = %id, "Mock connect left pending"),
        }
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let was_connected = {
            let mut state = self.state.lock();
            state.disconnects += 1;
            if state.connected.as_ref() == Some(id) {
                state.connected = None;
                state.subscribed = None;
                true
            } else {
                false
            }
        };
        if was_connected {
            self.emit(TransportEvent::Disconnected(id.clone()));
        }
        Ok(())
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let services = peripheral.services.iter().map(|(uuid, _)| *uuid).collect();
        self.emit(TransportEvent::ServicesDiscovered {
            id: id.clone(),
            services,
        });
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        id: &PeripheralId,
        service: Uuid,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let characteristics = peripheral
            .services
            .into_iter()
            .find(|(uuid, _)| *uuid == service)
            .map(|(_, characteristics)| characteristics)
            .unwrap_or_default();
        self.emit(TransportEvent::CharacteristicsDiscovered {
            id: id.clone(),
            service,
            characteristics,
        });
        Ok(())
    }

    async fn subscribe(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), TransportError> {
        let mut state = self.state.lock();
        if state.connected.as_ref() != Some(id) {
            return Err(TransportError::UnknownPeripheral(id.to_string()));
        }
        state.subscribed = Some(characteristic.clone());
        Ok(())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        _kind: WriteKind,
    ) -> Result<(), TransportError> {
        let command = String::from_utf8_lossy(value).trim_end_matches('\r').to_string();
        let (responder, notify, fragment_size) = {
            let mut state = self.state.lock();
            if state.connected.as_ref() != Some(id) {
                return Err(TransportError::WriteFailed(format!("{} is not connected", id)));
            }
            if !characteristic.properties.is_writable() {
                return Err(TransportError::UnknownCharacteristic(characteristic.uuid.to_string()));
            }
            state.writes.push(command.clone());
            (state.responder.clone(), state.subscribed.clone(), state.fragment_size)
        };

        let (Some(responder), Some(notify)) = (responder, notify) else {
            return Ok(());
        };
        let fragments = responder(&command).unwrap_or_default();
        for reply in fragments {
            for fragment in split_fragments(reply, fragment_size) {
                self.emit(TransportEvent::ValueChanged {
                    id: id.clone(),
                    characteristic: notify.uuid,
                    value: fragment.into_bytes(),
                });
            }
        }
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

/// Responder that answers every command with `OK`
pub fn ok_responder() -> Responder {
    Arc::new(|_command: &str| Some(vec!["OK\r\r>".to_string()]))
}

/// Responder that never answers
pub fn silent_responder() -> Responder {
    Arc::new(|_command: &str| None)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scan_reports_peripherals() {
        let transport = MockTransport::new()
            .with_peripheral(MockPeripheral::elm327("a", "OBDII"))
            .with_peripheral(MockPeripheral::new("b", Some("Headphones")));
        let mut events = transport.events();

        transport.start_scan().await.unwrap();

        let mut names = Vec::new();
        for _ in 0..2 {
            if let TransportEvent::Discovered(ad) = events.recv().await.unwrap() {
                names.push(ad.local_name.unwrap());
            }
        }
        assert_eq!(names, vec!["OBDII", "Headphones"]);
        assert!(transport.is_scanning());
    }

    #[tokio::test]
    async fn test_write_answers_on_notify() {
        let transport = MockTransport::elm327(ok_responder()).with_fragment_size(2);
        let mut events = transport.events();
        let id = PeripheralId::new("mock-elm327");
        transport.connect(&id).await.unwrap();
        let mut layout = MockPeripheral::elm327("x", "y");
        let (_, characteristics) = layout.services.remove(0);
        transport.subscribe(&id, &characteristics[0]).await.unwrap();
        transport
            .write(&id, &characteristics[1], b"ATE0\r", WriteKind::WithoutResponse)
            .await
            .unwrap();

        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connected(id.clone()));
        let mut text = String::new();
        while let Ok(TransportEvent::ValueChanged { value, .. }) = events.try_recv() {
            text.push_str(&String::from_utf8(value).unwrap());
        }
        assert_eq!(text, "OK\r\r>");
        assert_eq!(transport.writes(), vec!["ATE0"]);
    }

    #[tokio::test]
    async fn test_radio_off_rejects_scan() {
        let transport = MockTransport::new().with_radio_state(RadioState::PoweredOff);
        assert_eq!(
            transport.start_scan().await,
            Err(TransportError::Unavailable(RadioState::PoweredOff))
        );
    }
}
