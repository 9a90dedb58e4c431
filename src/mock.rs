//! In-memory MotionMount for tests and demos
//!
//! [`MockDevice`] holds an attribute table and simulates the device side of
//! PIN authentication and PIN changes. [`MockTransport`] hands out links to
//! it and lets tests inject failures, stalls and dropped links.

use async_trait::async_trait;
use bytes::Bytes;
use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tokio::sync::mpsc;

use crate::{
    ble::{GattSession, Link, Notification, Transport},
    error::{MountError, Result},
    protocol::{self, Attribute, PresetRecord, NAME_LEN, PRESET_SLOTS, SUPERVISOR_PIN_OFFSET},
    variant::ProtocolVariant,
};

const PERMISSION_FULL: [u8; 2] = [0x80, 0x80];
const PERMISSION_CONTROL: [u8; 2] = [0x80, 0x00];
const PERMISSION_NONE: [u8; 2] = [0x00, 0x00];

#[derive(Debug)]
struct DeviceTable {
    variant: ProtocolVariant,
    attributes: HashMap<Attribute, Vec<u8>>,
    writes: Vec<(Attribute, Vec<u8>)>,
    subscriptions: Vec<Attribute>,
    failing_reads: HashSet<Attribute>,
    failing_writes: HashSet<Attribute>,
    failing_subscriptions: HashSet<Attribute>,
    stalled: HashSet<Attribute>,
    ignored_writes: HashSet<Attribute>,
    user_pin: Option<u16>,
    supervisor_pin: Option<u16>,
    reachable: bool,
    stall_connect: bool,
    connects: usize,
    link: usize,
    sender: Option<mpsc::UnboundedSender<Notification>>,
}

impl DeviceTable {
    fn new(variant: ProtocolVariant) -> Self {
        let mut attributes = HashMap::new();
        let numeric = |value: u16| match variant {
            ProtocolVariant::Modern => value.to_be_bytes().to_vec(),
            ProtocolVariant::Legacy => value.to_le_bytes().to_vec(),
        };

        attributes.insert(Attribute::Distance, numeric(0));
        attributes.insert(Attribute::Rotation, numeric(0));
        attributes.insert(Attribute::Calibrate, vec![0]);
        attributes.insert(Attribute::AutoMove, vec![1]);
        attributes.insert(Attribute::Freeze, vec![0]);
        attributes.insert(Attribute::TvWidth, vec![120]);
        attributes.insert(Attribute::Unknown(0), vec![0]);
        attributes.insert(Attribute::Unknown(1), vec![0]);
        for index in 0..PRESET_SLOTS {
            attributes.insert(Attribute::Preset(index), vec![0; variant.preset_record_len()]);
            if let Some(len) = variant.overflow_name_len() {
                attributes.insert(Attribute::PresetName(index), vec![0; len]);
            }
        }
        attributes.insert(Attribute::MultiPinFeatures, vec![0]);
        let mut name = b"MotionMount".to_vec();
        name.resize(NAME_LEN, 0);
        attributes.insert(Attribute::Name, name);
        attributes.insert(Attribute::VersionsCeb, vec![1, 2, 3]);
        let mcp = match variant {
            ProtocolVariant::Modern => vec![4, 5, 6, 7, 8, 9, 10],
            ProtocolVariant::Legacy => vec![1, 0, 2, 3, 1],
        };
        attributes.insert(Attribute::VersionsMcp, mcp);

        let mut table = Self {
            variant,
            attributes,
            writes: Vec::new(),
            subscriptions: Vec::new(),
            failing_reads: HashSet::new(),
            failing_writes: HashSet::new(),
            failing_subscriptions: HashSet::new(),
            stalled: HashSet::new(),
            ignored_writes: HashSet::new(),
            user_pin: None,
            supervisor_pin: None,
            reachable: true,
            stall_connect: false,
            connects: 0,
            link: 0,
            sender: None,
        };
        table.sync_pin_attributes();
        table
    }

    fn pin_code(&self) -> u8 {
        let (none, user, both) = match self.variant {
            ProtocolVariant::Modern => (12, 13, 15),
            ProtocolVariant::Legacy => (0, 1, 3),
        };
        match (self.user_pin, self.supervisor_pin) {
            (None, _) => none,
            (Some(_), None) => user,
            (Some(_), Some(_)) => both,
        }
    }

    fn base_permission(&self) -> [u8; 2] {
        if self.user_pin.is_none() {
            PERMISSION_FULL
        } else {
            PERMISSION_NONE
        }
    }

    fn sync_pin_attributes(&mut self) {
        let code = self.pin_code();
        self.attributes.insert(Attribute::PinSettings, vec![code]);
        let permission = self.base_permission();
        self.attributes
            .insert(Attribute::PinCheck, permission.to_vec());
    }

    fn authenticate(&mut self, data: &[u8]) {
        let Some([low, high]) = pin_bytes(data) else {
            self.attributes.insert(Attribute::PinCheck, PERMISSION_NONE.to_vec());
            return;
        };
        let supervisor = self
            .supervisor_pin
            .is_some_and(|pin| supervisor_bytes(pin) == [low, high]);
        let user = self
            .user_pin
            .is_some_and(|pin| pin.to_le_bytes() == [low, high]);

        let permission = if supervisor {
            PERMISSION_FULL
        } else if user && self.supervisor_pin.is_none() {
            // A single PIN unlocks everything
            PERMISSION_FULL
        } else if user {
            PERMISSION_CONTROL
        } else {
            PERMISSION_NONE
        };
        self.attributes
            .insert(Attribute::PinCheck, permission.to_vec());
    }

    fn change_pin(&mut self, data: &[u8]) {
        let Some([low, high]) = pin_bytes(data) else {
            return;
        };
        if high >= SUPERVISOR_PIN_OFFSET {
            let pin = u16::from_le_bytes([low, high - SUPERVISOR_PIN_OFFSET]);
            self.supervisor_pin = (pin != 0).then_some(pin);
        } else {
            let pin = u16::from_le_bytes([low, high]);
            self.user_pin = (pin != 0).then_some(pin);
            if self.user_pin.is_none() {
                self.supervisor_pin = None;
            }
        }
        let code = self.pin_code();
        self.attributes.insert(Attribute::PinSettings, vec![code]);
    }

    fn notify(&mut self, attribute: Attribute, value: Vec<u8>) {
        self.attributes.insert(attribute, value.clone());
        if let Some(sender) = &self.sender {
            let _ = sender.send(Notification {
                attribute,
                value: Bytes::from(value),
            });
        }
    }
}

fn pin_bytes(data: &[u8]) -> Option<[u8; 2]> {
    data.get(..2)?.try_into().ok()
}

fn supervisor_bytes(pin: u16) -> [u8; 2] {
    let [low, high] = pin.to_le_bytes();
    [low, high.wrapping_add(SUPERVISOR_PIN_OFFSET)]
}

/// Simulated device shared between a test and the sessions it hands out
#[derive(Debug, Clone)]
pub struct MockDevice {
    table: Arc<Mutex<DeviceTable>>,
}

impl MockDevice {
    /// Device speaking the modern dialect, no PIN configured
    #[must_use]
    pub fn modern() -> Self {
        Self::with_variant(ProtocolVariant::Modern)
    }

    /// Device speaking the legacy dialect, no PIN configured
    #[must_use]
    pub fn legacy() -> Self {
        Self::with_variant(ProtocolVariant::Legacy)
    }

    fn with_variant(variant: ProtocolVariant) -> Self {
        Self {
            table: Arc::new(Mutex::new(DeviceTable::new(variant))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DeviceTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configure the authorised user PIN
    #[must_use]
    pub fn with_user_pin(self, pin: u16) -> Self {
        {
            let mut table = self.lock();
            table.user_pin = Some(pin);
            table.sync_pin_attributes();
        }
        self
    }

    /// Configure the supervisor PIN (requires a user PIN to take effect)
    #[must_use]
    pub fn with_supervisor_pin(self, pin: u16) -> Self {
        {
            let mut table = self.lock();
            table.supervisor_pin = Some(pin);
            table.sync_pin_attributes();
        }
        self
    }

    /// Store a preset in a slot, splitting long names into the overflow field
    #[must_use]
    pub fn with_preset(self, index: u8, name: &str, distance: u8, rotation: i8) -> Self {
        {
            let mut table = self.lock();
            let variant = table.variant;
            let bytes = name.as_bytes();
            let split = bytes.len().min(variant.primary_name_len());
            let record = PresetRecord {
                exists: true,
                distance,
                rotation,
                name: bytes[..split].to_vec(),
            };
            if let Ok(encoded) = protocol::encode_preset_record(&record, variant) {
                table.attributes.insert(Attribute::Preset(index), encoded.to_vec());
            }
            if let Some(len) = variant.overflow_name_len() {
                let mut overflow = bytes[split..].to_vec();
                overflow.resize(len, 0);
                table.attributes.insert(Attribute::PresetName(index), overflow);
            }
        }
        self
    }

    /// Overwrite an attribute without notifying
    pub fn set(&self, attribute: Attribute, value: Vec<u8>) {
        self.lock().attributes.insert(attribute, value);
    }

    /// Current raw value of an attribute
    #[must_use]
    pub fn get(&self, attribute: Attribute) -> Option<Vec<u8>> {
        self.lock().attributes.get(&attribute).cloned()
    }

    /// Overwrite an attribute and push a notification on the live link
    pub fn notify(&self, attribute: Attribute, value: Vec<u8>) {
        self.lock().notify(attribute, value);
    }

    /// Every write received, in order
    #[must_use]
    pub fn writes(&self) -> Vec<(Attribute, Vec<u8>)> {
        self.lock().writes.clone()
    }

    /// Writes received for one attribute
    #[must_use]
    pub fn writes_to(&self, attribute: Attribute) -> Vec<Vec<u8>> {
        self.lock()
            .writes
            .iter()
            .filter(|(a, _)| *a == attribute)
            .map(|(_, data)| data.clone())
            .collect()
    }

    /// Attributes subscribed on any link
    #[must_use]
    pub fn subscriptions(&self) -> Vec<Attribute> {
        self.lock().subscriptions.clone()
    }

    /// Number of connection attempts received
    #[must_use]
    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    /// Make connection attempts fail or succeed
    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    /// Make connection attempts hang
    pub fn stall_connect(&self, stall: bool) {
        self.lock().stall_connect = stall;
    }

    /// Make reads of an attribute fail
    pub fn fail_read(&self, attribute: Attribute) {
        self.lock().failing_reads.insert(attribute);
    }

    /// Make writes of an attribute fail
    pub fn fail_write(&self, attribute: Attribute) {
        self.lock().failing_writes.insert(attribute);
    }

    /// Make subscribing to an attribute fail
    pub fn fail_subscribe(&self, attribute: Attribute) {
        self.lock().failing_subscriptions.insert(attribute);
    }

    /// Make every operation on an attribute hang
    pub fn stall(&self, attribute: Attribute) {
        self.lock().stalled.insert(attribute);
    }

    /// Accept writes of an attribute without storing them
    pub fn ignore_writes(&self, attribute: Attribute) {
        self.lock().ignored_writes.insert(attribute);
    }

    /// Clear injected failures and stalls
    pub fn heal(&self) {
        let mut table = self.lock();
        table.failing_reads.clear();
        table.failing_writes.clear();
        table.failing_subscriptions.clear();
        table.stalled.clear();
    }

    /// Drop the live link as if the device went out of range
    pub fn drop_link(&self) {
        let mut table = self.lock();
        table.sender = None;
        table.link += 1;
    }

    /// Session not bound to any link
    #[must_use]
    pub fn session(&self) -> Arc<dyn GattSession> {
        Arc::new(MockSession {
            device: self.clone(),
            link: None,
        })
    }

    /// Transport connecting to this device
    #[must_use]
    pub fn transport(&self) -> MockTransport {
        MockTransport {
            device: self.clone(),
        }
    }

    fn check(&self, link: Option<usize>, attribute: Attribute) -> Result<bool> {
        let table = self.lock();
        if link.is_some_and(|id| id != table.link || table.sender.is_none()) {
            return Err(MountError::Disconnected);
        }
        if !table.attributes.contains_key(&attribute) && attribute.is_readable() {
            return Err(MountError::CharacteristicMissing(attribute));
        }
        Ok(table.stalled.contains(&attribute))
    }
}

struct MockSession {
    device: MockDevice,
    link: Option<usize>,
}

#[async_trait]
impl GattSession for MockSession {
    async fn read(&self, attribute: Attribute) -> Result<Bytes> {
        if self.device.check(self.link, attribute)? {
            std::future::pending::<()>().await;
        }
        let table = self.device.lock();
        if table.failing_reads.contains(&attribute) {
            return Err(MountError::Transport(format!("read of {attribute} failed")));
        }
        table
            .attributes
            .get(&attribute)
            .map(|value| Bytes::copy_from_slice(value))
            .ok_or(MountError::CharacteristicMissing(attribute))
    }

    async fn write(&self, attribute: Attribute, data: &[u8]) -> Result<()> {
        if self.device.check(self.link, attribute)? {
            std::future::pending::<()>().await;
        }
        let mut table = self.device.lock();
        if table.failing_writes.contains(&attribute) {
            return Err(MountError::Transport(format!("write of {attribute} failed")));
        }
        table.writes.push((attribute, data.to_vec()));

        match attribute {
            Attribute::Authenticate => table.authenticate(data),
            Attribute::ChangePin => table.change_pin(data),
            Attribute::SelectPreset => {}
            _ if table.ignored_writes.contains(&attribute) => {}
            _ => {
                table.attributes.insert(attribute, data.to_vec());
            }
        }
        Ok(())
    }

    async fn subscribe(&self, attribute: Attribute) -> Result<()> {
        if self.device.check(self.link, attribute)? {
            std::future::pending::<()>().await;
        }
        let mut table = self.device.lock();
        if table.failing_subscriptions.contains(&attribute) {
            return Err(MountError::Transport(format!(
                "subscription to {attribute} rejected"
            )));
        }
        table.subscriptions.push(attribute);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut table = self.device.lock();
        if self.link == Some(table.link) {
            table.sender = None;
            table.link += 1;
        }
        Ok(())
    }
}

/// Transport handing out links to a [`MockDevice`]
#[derive(Debug, Clone)]
pub struct MockTransport {
    device: MockDevice,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, address: &str) -> Result<Link> {
        let stall = {
            let mut table = self.device.lock();
            table.connects += 1;
            if !table.reachable {
                return Err(MountError::DeviceNotFound(address.to_string()));
            }
            table.stall_connect
        };
        if stall {
            std::future::pending::<()>().await;
        }

        let mut table = self.device.lock();
        let (sender, receiver) = mpsc::unbounded_channel();
        table.link += 1;
        table.sender = Some(sender);
        let permission = table.base_permission();
        table
            .attributes
            .insert(Attribute::PinCheck, permission.to_vec());

        Ok(Link {
            session: Arc::new(MockSession {
                device: self.device.clone(),
                link: Some(table.link),
            }),
            notifications: receiver,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_authentication_simulation() {
        let device = MockDevice::modern()
            .with_user_pin(1234)
            .with_supervisor_pin(5678);
        let session = device.session();

        assert_eq!(device.get(Attribute::PinSettings), Some(vec![15]));
        session
            .write(Attribute::Authenticate, &1234u16.to_le_bytes())
            .await
            .unwrap();
        assert_eq!(
            &session.read(Attribute::PinCheck).await.unwrap()[..],
            &PERMISSION_CONTROL
        );

        session
            .write(Attribute::Authenticate, &supervisor_bytes(5678))
            .await
            .unwrap();
        assert_eq!(
            &session.read(Attribute::PinCheck).await.unwrap()[..],
            &PERMISSION_FULL
        );
    }

    #[tokio::test]
    async fn test_dropped_link_refuses_operations() {
        let device = MockDevice::legacy();
        let mut link = device.transport().connect("mock").await.unwrap();
        assert!(link.session.read(Attribute::Distance).await.is_ok());

        device.drop_link();
        assert!(link.notifications.recv().await.is_none());
        assert!(matches!(
            link.session.read(Attribute::Distance).await,
            Err(MountError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_legacy_has_no_overflow_names() {
        let device = MockDevice::legacy().with_preset(0, "Kitchen", 20, -40);
        let session = device.session();

        assert!(matches!(
            session.read(Attribute::PresetName(0)).await,
            Err(MountError::CharacteristicMissing(_))
        ));
        let record = session.read(Attribute::Preset(0)).await.unwrap();
        assert_eq!(record.len(), 24);
    }
}
