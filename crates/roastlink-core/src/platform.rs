//! [`BleAdapter`] implementation on top of btleplug.
//!
//! Device ids are the platform's peripheral ids: MAC addresses on
//! Linux/Windows, CoreBluetooth UUIDs on macOS. macOS UUIDs are only stable
//! on the Mac that assigned them, so a bonded id stored in the config file
//! does not carry over between machines.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::traits::{AdapterState, BleAdapter, DeviceHandle, LinkEvent};

/// Capacity of the discovery and notification channels.
const CHANNEL_CAPACITY: usize = 64;

/// Format a peripheral id as a plain string.
///
/// `PeripheralId`'s `Debug` output wraps the address or UUID in
/// `PeripheralId(...)`; the wrapper is stripped.
pub fn format_peripheral_id(id: &PeripheralId) -> String {
    format!("{:?}", id)
        .trim_start_matches("PeripheralId(")
        .trim_end_matches(')')
        .to_string()
}

/// The first Bluetooth adapter on this machine, driven through btleplug.
pub struct BtleplugAdapter {
    adapter: Adapter,
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    scan_task: Mutex<Option<JoinHandle<()>>>,
    notify_tasks: Mutex<HashMap<(String, Uuid), JoinHandle<()>>>,
    link_tx: broadcast::Sender<LinkEvent>,
    watcher: JoinHandle<()>,
}

impl std::fmt::Debug for BtleplugAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugAdapter").finish_non_exhaustive()
    }
}

impl BtleplugAdapter {
    /// Open the first available adapter.
    ///
    /// Fails with [`Error::AdapterUnavailable`] if the machine has none.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::AdapterUnavailable("no Bluetooth adapter found".to_string()))?;
        Self::from_adapter(adapter).await
    }

    /// Wrap an already opened adapter.
    pub async fn from_adapter(adapter: Adapter) -> Result<Self> {
        let (link_tx, _) = broadcast::channel(16);
        let mut events = adapter.events().await?;
        let tx = link_tx.clone();
        let watcher = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                if let CentralEvent::DeviceDisconnected(id) = event {
                    let device_id = format_peripheral_id(&id);
                    debug!("Platform reported disconnect of {}", device_id);
                    let _ = tx.send(LinkEvent::Disconnected { device_id });
                }
            }
        });

        Ok(Self {
            adapter,
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            scan_task: Mutex::new(None),
            notify_tasks: Mutex::new(HashMap::new()),
            link_tx,
            watcher,
        })
    }

    async fn peripheral(&self, device_id: &str) -> Result<Peripheral> {
        if let Some(p) = self.peripherals.read().await.get(device_id) {
            return Ok(p.clone());
        }

        // Not seen in this process: the platform may still know it.
        for p in self.adapter.peripherals().await? {
            let id = format_peripheral_id(&p.id());
            if id.eq_ignore_ascii_case(device_id) {
                self.peripherals.write().await.insert(id, p.clone());
                return Ok(p);
            }
        }
        Err(Error::DeviceNotFound(device_id.to_string()))
    }
}

fn find_characteristic(peripheral: &Peripheral, uuid: Uuid) -> Result<Characteristic> {
    peripheral
        .characteristics()
        .into_iter()
        .find(|c| c.uuid == uuid)
        .ok_or_else(|| Error::CharacteristicNotFound(uuid.to_string()))
}

impl Drop for BtleplugAdapter {
    fn drop(&mut self) {
        self.watcher.abort();
    }
}

async fn handle_from_peripheral(peripheral: &Peripheral) -> Option<DeviceHandle> {
    let props = peripheral.properties().await.ok().flatten()?;
    Some(DeviceHandle {
        id: format_peripheral_id(&peripheral.id()),
        name: props.local_name,
        rssi: props.rssi,
        services: props.services,
        manufacturer_data: props.manufacturer_data,
    })
}

fn scan_error(err: btleplug::Error) -> Error {
    match err {
        btleplug::Error::PermissionDenied => Error::PermissionDenied,
        other => Error::Bluetooth(other),
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn state(&self) -> AdapterState {
        match self.adapter.adapter_state().await {
            Ok(CentralState::PoweredOn) => AdapterState::PoweredOn,
            Ok(CentralState::PoweredOff) => AdapterState::PoweredOff,
            Ok(_) => AdapterState::Unavailable,
            Err(btleplug::Error::PermissionDenied) => AdapterState::Unauthorized,
            Err(e) => {
                warn!("Could not query adapter state: {}", e);
                AdapterState::Unavailable
            }
        }
    }

    async fn start_scan(&self) -> Result<mpsc::Receiver<DeviceHandle>> {
        let mut events = self.adapter.events().await.map_err(scan_error)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(scan_error)?;
        info!("Scan started");

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let adapter = self.adapter.clone();
        let peripherals = Arc::clone(&self.peripherals);
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                let Some(handle) = handle_from_peripheral(&peripheral).await else {
                    continue;
                };
                peripherals
                    .write()
                    .await
                    .insert(handle.id.clone(), peripheral);
                if tx.send(handle).await.is_err() {
                    break;
                }
            }
        });

        if let Some(previous) = self.scan_task.lock().await.replace(task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(task) = self.scan_task.lock().await.take() {
            task.abort();
            self.adapter.stop_scan().await?;
            info!("Scan stopped");
        }
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn connect(&self, device_id: &str) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        peripheral.connect().await?;
        peripheral.discover_services().await?;
        debug!(
            "Discovered {} characteristics",
            peripheral.characteristics().len()
        );
        Ok(())
    }

    #[tracing::instrument(level = "info", skip(self))]
    async fn disconnect(&self, device_id: &str) -> Result<()> {
        {
            let mut tasks = self.notify_tasks.lock().await;
            tasks.retain(|(id, _), handle| {
                if id == device_id {
                    handle.abort();
                    false
                } else {
                    true
                }
            });
        }
        let peripheral = self.peripheral(device_id).await?;
        peripheral.disconnect().await?;
        Ok(())
    }

    async fn read(&self, device_id: &str, characteristic: Uuid) -> Result<Vec<u8>> {
        let peripheral = self.peripheral(device_id).await?;
        let c = find_characteristic(&peripheral, characteristic)?;
        Ok(peripheral.read(&c).await?)
    }

    async fn write(&self, device_id: &str, characteristic: Uuid, data: &[u8]) -> Result<()> {
        let peripheral = self.peripheral(device_id).await?;
        let c = find_characteristic(&peripheral, characteristic)?;
        peripheral.write(&c, data, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        device_id: &str,
        characteristic: Uuid,
    ) -> Result<mpsc::Receiver<Vec<u8>>> {
        let peripheral = self.peripheral(device_id).await?;
        let c = find_characteristic(&peripheral, characteristic)?;
        let mut stream = peripheral.notifications().await?;
        peripheral.subscribe(&c).await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let task = tokio::spawn(async move {
            while let Some(notification) = stream.next().await {
                if notification.uuid != characteristic {
                    continue;
                }
                if tx.send(notification.value).await.is_err() {
                    break;
                }
            }
        });

        let key = (device_id.to_string(), characteristic);
        if let Some(previous) = self.notify_tasks.lock().await.insert(key, task) {
            previous.abort();
        }
        Ok(rx)
    }

    async fn unsubscribe(&self, device_id: &str, characteristic: Uuid) -> Result<()> {
        let key = (device_id.to_string(), characteristic);
        if let Some(task) = self.notify_tasks.lock().await.remove(&key) {
            task.abort();
        }
        let peripheral = self.peripheral(device_id).await?;
        let c = find_characteristic(&peripheral, characteristic)?;
        peripheral.unsubscribe(&c).await?;
        Ok(())
    }

    fn link_events(&self) -> broadcast::Receiver<LinkEvent> {
        self.link_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_error_maps_permission() {
        assert!(matches!(
            scan_error(btleplug::Error::PermissionDenied),
            Error::PermissionDenied
        ));
        assert!(matches!(
            scan_error(btleplug::Error::NotConnected),
            Error::Bluetooth(_)
        ));
    }
}
