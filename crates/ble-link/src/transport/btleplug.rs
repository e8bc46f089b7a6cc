//! btleplug backed transport
//!
//! Uses the first local adapter. Central events are pumped into the
//! transport event stream; requests that block in btleplug (connect,
//! service discovery) run on their own tasks and report completion as
//! events.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use ::btleplug::api::{
    Central, CentralEvent, CharPropFlags, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use ::btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{
    Advertisement, BleTransport, CharacteristicInfo, CharacteristicProperties, PeripheralId,
    RadioState, TransportError, TransportEvent, WriteKind, EVENT_CAPACITY,
};

type PeripheralMap = Arc<Mutex<HashMap<PeripheralId, Peripheral>>>;

/// [`BleTransport`] over the platform Bluetooth stack
pub struct BtleplugTransport {
    adapter: Adapter,
    events: broadcast::Sender<TransportEvent>,
    peripherals: PeripheralMap,
    central_pump: AbortHandle,
    notification_pump: Mutex<Option<AbortHandle>>,
}

impl Drop for BtleplugTransport {
    fn drop(&mut self) {
        self.central_pump.abort();
        if let Some(pump) = self.notification_pump.get_mut().take() {
            pump.abort();
        }
    }
}

fn map_error(error: ::btleplug::Error) -> TransportError {
    match error {
        ::btleplug::Error::PermissionDenied => TransportError::Unavailable(RadioState::Unauthorized),
        ::btleplug::Error::DeviceNotFound => TransportError::UnknownPeripheral(error.to_string()),
        ::btleplug::Error::NotSupported(reason) => {
            warn!(reason = %reason, "Bluetooth operation not supported");
            TransportError::Unavailable(RadioState::Unsupported)
        }
        other => TransportError::Gatt(other.to_string()),
    }
}

fn convert_properties(flags: CharPropFlags) -> CharacteristicProperties {
    let mut properties = CharacteristicProperties::empty();
    for (from, to) in [
        (CharPropFlags::READ, CharacteristicProperties::READ),
        (
            CharPropFlags::WRITE_WITHOUT_RESPONSE,
            CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
        ),
        (CharPropFlags::WRITE, CharacteristicProperties::WRITE),
        (CharPropFlags::NOTIFY, CharacteristicProperties::NOTIFY),
        (CharPropFlags::INDICATE, CharacteristicProperties::INDICATE),
    ] {
        if flags.contains(from) {
            properties |= to;
        }
    }
    properties
}

fn convert_characteristic(characteristic: &Characteristic) -> CharacteristicInfo {
    CharacteristicInfo {
        uuid: characteristic.uuid,
        service: characteristic.service_uuid,
        properties: convert_properties(characteristic.properties),
    }
}

impl BtleplugTransport {
    /// Open the first Bluetooth adapter and start listening for central events
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await.map_err(map_error)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(map_error)?
            .into_iter()
            .next()
            .ok_or(TransportError::Unavailable(RadioState::Unsupported))?;
        if let Ok(info) = adapter.adapter_info().await {
            info!(adapter = %info, "Using Bluetooth adapter");
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let peripherals: PeripheralMap = Arc::new(Mutex::new(HashMap::new()));
        let central_events = adapter.events().await.map_err(map_error)?;
        let central_pump = tokio::spawn(pump_central_events(
            adapter.clone(),
            central_events,
            events.clone(),
            peripherals.clone(),
        ))
        .abort_handle();

        Ok(Self {
            adapter,
            events,
            peripherals,
            central_pump,
            notification_pump: Mutex::new(None),
        })
    }

    fn peripheral(&self, id: &PeripheralId) -> Result<Peripheral, TransportError> {
        self.peripherals
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))
    }

    fn find_characteristic(
        peripheral: &Peripheral,
        characteristic: &CharacteristicInfo,
    ) -> Result<Characteristic, TransportError> {
        peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or_else(|| TransportError::UnknownCharacteristic(characteristic.uuid.to_string()))
    }

    fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

async fn pump_central_events(
    adapter: Adapter,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    events: broadcast::Sender<TransportEvent>,
    peripherals: PeripheralMap,
) {
    while let Some(event) = central_events.next().await {
        match event {
            CentralEvent::DeviceDiscovered(platform_id) | CentralEvent::DeviceUpdated(platform_id) => {
                let Ok(peripheral) = adapter.peripheral(&platform_id).await else {
                    continue;
                };
                let Ok(Some(properties)) = peripheral.properties().await else {
                    continue;
                };
                let id = PeripheralId::new(platform_id.to_string());
                peripherals.lock().insert(id.clone(), peripheral);
                let _ = events.send(TransportEvent::Discovered(Advertisement {
                    id,
                    local_name: properties.local_name,
                    rssi: properties.rssi,
                    services: properties.services,
                    connectable: true,
                }));
            }
            CentralEvent::DeviceDisconnected(platform_id) => {
                let id = PeripheralId::new(platform_id.to_string());
                let _ = events.send(TransportEvent::Disconnected(id));
            }
            _ => {}
        }
    }
    debug!("Central event stream ended");
}

#[async_trait]
impl BleTransport for BtleplugTransport {
    async fn radio_state(&self) -> RadioState {
        match self.adapter.adapter_info().await {
            Ok(_) => RadioState::PoweredOn,
            Err(::btleplug::Error::PermissionDenied) => RadioState::Unauthorized,
            Err(_) => RadioState::PoweredOff,
        }
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(|e| match map_error(e) {
                TransportError::Gatt(reason) => TransportError::ScanFailed(reason),
                other => other,
            })
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await.map_err(map_error)
    }

    async fn connect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            let event = match peripheral.connect().await {
                Ok(()) => TransportEvent::Connected(id),
                Err(e) => TransportEvent::ConnectFailed {
                    id,
                    reason: e.to_string(),
                },
            };
            let _ = events.send(event);
        });
        Ok(())
    }

    async fn disconnect(&self, id: &PeripheralId) -> Result<(), TransportError> {
        if let Some(pump) = self.notification_pump.lock().take() {
            pump.abort();
        }
        let peripheral = self.peripheral(id)?;
        peripheral.disconnect().await.map_err(map_error)
    }

    async fn discover_services(&self, id: &PeripheralId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let events = self.events.clone();
        let id = id.clone();
        tokio::spawn(async move {
            match peripheral.discover_services().await {
                Ok(()) => {
                    let services = peripheral.services().iter().map(|s| s.uuid).collect();
                    let _ = events.send(TransportEvent::ServicesDiscovered { id, services });
                }
                Err(e) => {
                    warn!(error = %e, "Service discovery failed");
                    let _ = events.send(TransportEvent::ServicesDiscovered {
                        id,
                        services: Vec::new(),
                    });
                }
            }
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
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .map(|s| s.characteristics.iter().map(convert_characteristic).collect())
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
        let peripheral = self.peripheral(id)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let mut notifications = peripheral.notifications().await.map_err(map_error)?;
        peripheral.subscribe(&target).await.map_err(map_error)?;

        let events = self.events.clone();
        let id = id.clone();
        let pump = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                let _ = events.send(TransportEvent::ValueChanged {
                    id: id.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                });
            }
        });
        if let Some(previous) = self.notification_pump.lock().replace(pump.abort_handle()) {
            previous.abort();
        }
        Ok(())
    }

    async fn write(
        &self,
        id: &PeripheralId,
        characteristic: &CharacteristicInfo,
        value: &[u8],
        kind: WriteKind,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id)?;
        let target = Self::find_characteristic(&peripheral, characteristic)?;
        let write_type = match kind {
            WriteKind::WithResponse => WriteType::WithResponse,
            WriteKind::WithoutResponse => WriteType::WithoutResponse,
        };
        peripheral
            .write(&target, value, write_type)
            .await
            .map_err(|e| TransportError::WriteFailed(e.to_string()))
    }

    fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_conversion() {
        let converted = convert_properties(CharPropFlags::NOTIFY | CharPropFlags::WRITE_WITHOUT_RESPONSE);
        assert_eq!(
            converted,
            CharacteristicProperties::NOTIFY | CharacteristicProperties::WRITE_WITHOUT_RESPONSE
        );
    }
}
