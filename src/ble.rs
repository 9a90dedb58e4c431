use async_trait::async_trait;
use btleplug::{
    api::{
        BDAddr, Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter,
        ValueNotification, WriteType,
    },
    platform::{Adapter, Manager, Peripheral, PeripheralId},
};
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use std::{collections::HashMap, pin::Pin, str::FromStr, sync::Arc, time::Duration};
use tokio::{sync::mpsc, task::JoinHandle, time::Instant};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::{
    error::{MountError, Result},
    protocol::Attribute,
    MOVEMENT_SERVICE_UUID, SESSION_SERVICE_UUID,
};

const SCAN_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_SCAN_TIMEOUT: Duration = Duration::from_secs(10);

/// Value pushed by the device for a subscribed attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Attribute that changed
    pub attribute: Attribute,
    /// Raw payload
    pub value: Bytes,
}

/// Established connection to a device
///
/// The notification receiver closes when the device link is lost.
pub struct Link {
    /// Attribute I/O for this connection
    pub session: Arc<dyn GattSession>,
    /// Notifications for subscribed attributes
    pub notifications: mpsc::UnboundedReceiver<Notification>,
}

/// Attribute primitives of one connection
#[async_trait]
pub trait GattSession: Send + Sync {
    /// Read the current value of an attribute
    async fn read(&self, attribute: Attribute) -> Result<Bytes>;

    /// Write an attribute, waiting for the device's acknowledgement
    async fn write(&self, attribute: Attribute, data: &[u8]) -> Result<()>;

    /// Enable notifications for an attribute
    async fn subscribe(&self, attribute: Attribute) -> Result<()>;

    /// Close the connection
    async fn disconnect(&self) -> Result<()>;
}

/// Something that can open a [`Link`] to a device address
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to the device at `address`
    async fn connect(&self, address: &str) -> Result<Link>;
}

/// BLE transport over the system adapter
pub struct BleTransport {
    manager: Manager,
    scan_timeout: Duration,
}

impl BleTransport {
    /// Create a transport on the platform BLE manager
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Ble`] if the Bluetooth stack cannot be initialized.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new().await?;

        Ok(Self {
            manager,
            scan_timeout: DEFAULT_SCAN_TIMEOUT,
        })
    }

    /// Bound the scan used when the adapter does not know the device yet
    #[must_use]
    pub const fn with_scan_timeout(mut self, scan_timeout: Duration) -> Self {
        self.scan_timeout = scan_timeout;
        self
    }

    async fn central(&self, address: &str) -> Result<Adapter> {
        self.manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| MountError::DeviceNotFound(address.to_string()))
    }

    async fn locate(&self, central: &Adapter, address: BDAddr) -> Result<Option<Peripheral>> {
        if let Some(peripheral) = find_peripheral(central, address).await? {
            return Ok(Some(peripheral));
        }

        info!("Scanning for MotionMount at {}", address);
        central.start_scan(ScanFilter::default()).await?;

        let deadline = Instant::now() + self.scan_timeout;
        let mut found = None;
        while Instant::now() < deadline {
            tokio::time::sleep(SCAN_POLL_INTERVAL).await;
            if let Some(peripheral) = find_peripheral(central, address).await? {
                found = Some(peripheral);
                break;
            }
        }

        if let Err(e) = central.stop_scan().await {
            debug!("Failed to stop scan: {}", e);
        }
        Ok(found)
    }
}

async fn find_peripheral(central: &Adapter, address: BDAddr) -> Result<Option<Peripheral>> {
    Ok(central
        .peripherals()
        .await?
        .into_iter()
        .find(|p| p.address() == address))
}

#[async_trait]
impl Transport for BleTransport {
    async fn connect(&self, address: &str) -> Result<Link> {
        let bd_addr = BDAddr::from_str(address).map_err(|e| {
            MountError::InvalidParameters(format!("invalid device address {address}: {e}"))
        })?;

        let central = self.central(address).await?;
        let peripheral = self
            .locate(&central, bd_addr)
            .await?
            .ok_or_else(|| MountError::DeviceNotFound(address.to_string()))?;

        info!("Connecting to MotionMount at {}", bd_addr);
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;

        let characteristics: HashMap<Uuid, Characteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter(|c| c.service_uuid == MOVEMENT_SERVICE_UUID || c.service_uuid == SESSION_SERVICE_UUID)
            .map(|c| (c.uuid, c))
            .collect();
        debug!("Discovered {} MotionMount characteristics", characteristics.len());

        let (sender, receiver) = mpsc::unbounded_channel();
        let notifications = peripheral.notifications().await?;
        let events = central.events().await?;
        let forwarder = tokio::spawn(forward_notifications(
            notifications,
            events,
            peripheral.id(),
            sender,
        ));

        Ok(Link {
            session: Arc::new(BleSession {
                peripheral,
                characteristics,
                forwarder,
            }),
            notifications: receiver,
        })
    }
}

/// Active connection to a MotionMount peripheral
pub struct BleSession {
    peripheral: Peripheral,
    characteristics: HashMap<Uuid, Characteristic>,
    forwarder: JoinHandle<()>,
}

impl BleSession {
    fn characteristic(&self, attribute: Attribute) -> Result<&Characteristic> {
        attribute
            .uuid()
            .and_then(|uuid| self.characteristics.get(&uuid))
            .ok_or(MountError::CharacteristicMissing(attribute))
    }

    /// Get device address
    #[must_use]
    pub fn address(&self) -> BDAddr {
        self.peripheral.address()
    }
}

impl Drop for BleSession {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

#[async_trait]
impl GattSession for BleSession {
    async fn read(&self, attribute: Attribute) -> Result<Bytes> {
        let characteristic = self.characteristic(attribute)?;
        let data = self.peripheral.read(characteristic).await?;
        trace!("Read {}: {:02X?}", attribute, data);
        Ok(Bytes::from(data))
    }

    async fn write(&self, attribute: Attribute, data: &[u8]) -> Result<()> {
        let characteristic = self.characteristic(attribute)?;
        self.peripheral
            .write(characteristic, data, WriteType::WithResponse)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, attribute: Attribute) -> Result<()> {
        let characteristic = self.characteristic(attribute)?;
        self.peripheral.subscribe(characteristic).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.forwarder.abort();
        self.peripheral.disconnect().await?;
        Ok(())
    }
}

/// Forward notifications until the peripheral disconnects
async fn forward_notifications(
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    mut events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    id: PeripheralId,
    sender: mpsc::UnboundedSender<Notification>,
) {
    loop {
        tokio::select! {
            notification = notifications.next() => {
                let Some(notification) = notification else {
                    break;
                };
                let Some(attribute) = Attribute::from_uuid(notification.uuid) else {
                    trace!("Ignoring notification from {}", notification.uuid);
                    continue;
                };
                let value = Bytes::from(notification.value);
                if sender.send(Notification { attribute, value }).is_err() {
                    break;
                }
            }
            event = events.next() => match event {
                Some(CentralEvent::DeviceDisconnected(peer)) if peer == id => {
                    warn!("MotionMount disconnected");
                    break;
                }
                Some(_) => {}
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_uuid_parsing() {
        assert_eq!(
            MOVEMENT_SERVICE_UUID,
            Uuid::parse_str("3e6fe65d-ed78-11e4-895e-00026fd5c52c").unwrap()
        );
        assert_eq!(
            SESSION_SERVICE_UUID,
            Uuid::parse_str("3e6fe65e-ed78-11e4-895e-00026fd5c52c").unwrap()
        );
    }

    #[test]
    fn test_address_parsing() {
        assert!(BDAddr::from_str("AA:BB:CC:DD:EE:FF").is_ok());
        assert!(BDAddr::from_str("not-an-address").is_err());
    }
}
