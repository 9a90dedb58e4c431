use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::Duration};

use crate::{error::ErrorKind, variant::ProtocolVariant};

/// Number of HDMI inputs the auto-move feature can follow
pub const HDMI_INPUTS: u8 = 5;

/// Auto-move behaviour: follow the TV on one HDMI input, or stay put
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AutoMove {
    /// Auto-move disabled
    #[default]
    Off,
    /// Auto-move active for HDMI input 1..=5
    Hdmi(u8),
}

impl fmt::Display for AutoMove {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => write!(f, "Off"),
            Self::Hdmi(input) => write!(f, "HDMI {input}"),
        }
    }
}

/// Firmware and hardware versions reported by the two controller boards
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Versions {
    /// CEB (bluetooth board) bootloader
    ///
    /// The CEB version attribute carries only this one dotted version; there
    /// is no separate CEB firmware field.
    pub ceb_bootloader: String,
    /// MCP (motor board) hardware revision, absent on three-field firmware
    pub mcp_hardware: Option<String>,
    /// MCP bootloader
    pub mcp_bootloader: String,
    /// MCP firmware
    pub mcp_firmware: String,
}

/// Settings an authorised (non-supervisor) user may still change
///
/// Bit layout of the multi-pin feature attribute:
/// - Bit 0: change presets
/// - Bit 1: change name
/// - Bit 2: disable channel
/// - Bit 3: TV on/off detection (freeze preset)
/// - Bit 4: default position
/// - Bit 5: start calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct MultiPinFeatures {
    /// Presets may be changed
    pub change_presets: bool,
    /// Device name may be changed
    pub change_name: bool,
    /// Channel may be disabled
    pub disable_channel: bool,
    /// TV on/off detection (freeze preset) may be changed
    pub change_tv_on_off_detection: bool,
    /// Default position may be changed
    pub change_default_position: bool,
    /// Calibration may be started
    pub start_calibration: bool,
}

impl MultiPinFeatures {
    /// Build from the raw feature byte
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self {
            change_presets: bits & 0x01 != 0,
            change_name: bits & 0x02 != 0,
            disable_channel: bits & 0x04 != 0,
            change_tv_on_off_detection: bits & 0x08 != 0,
            change_default_position: bits & 0x10 != 0,
            start_calibration: bits & 0x20 != 0,
        }
    }

    /// Pack into the raw feature byte
    #[must_use]
    pub const fn bits(&self) -> u8 {
        (self.change_presets as u8)
            | (self.change_name as u8) << 1
            | (self.disable_channel as u8) << 2
            | (self.change_tv_on_off_detection as u8) << 3
            | (self.change_default_position as u8) << 4
            | (self.start_calibration as u8) << 5
    }
}

/// Mirror of the physical device
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DeviceState {
    /// Distance from the wall in percent (0..=100)
    pub distance: u8,
    /// Rotation in percent (-100..=100)
    pub rotation: i8,
    /// Last distance requested through a movement command
    pub requested_distance: Option<u8>,
    /// Last rotation requested through a movement command
    pub requested_rotation: Option<i8>,
    /// Auto-move setting
    pub auto_move: AutoMove,
    /// Preset the mount moves to when the TV turns off
    pub freeze_preset_index: Option<u8>,
    /// TV width in centimetres
    pub tv_width_cm: u8,
    /// Device name
    pub name: String,
    /// Board versions
    pub versions: Versions,
    /// Feature grants for authorised users
    pub multi_pin_features: MultiPinFeatures,
    /// Verbatim payloads of undocumented notifying attributes, by index
    pub opaque: BTreeMap<u8, Vec<u8>>,
}

/// One of the seven fixed preset slots
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Preset {
    /// Stable slot index (0..=6)
    pub slot_index: u8,
    /// Whether the slot holds a preset
    pub exists: bool,
    /// Distance from the wall in percent
    pub distance: u8,
    /// Rotation in percent
    pub rotation: i8,
    /// Preset name
    pub name: String,
}

impl Preset {
    /// An unused slot
    #[must_use]
    pub const fn empty(slot_index: u8) -> Self {
        Self {
            slot_index,
            exists: false,
            distance: 0,
            rotation: 0,
            name: String::new(),
        }
    }
}

/// PIN configuration reported by the pin-information attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PinMode {
    /// No PIN required
    #[default]
    None,
    /// A single authorised-user PIN
    UserOnly,
    /// Distinct authorised-user and supervisor PINs
    UserAndSupervisor,
}

impl PinMode {
    /// Check if any PIN is configured
    #[must_use]
    pub const fn requires_pin(self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Role the session is authenticated as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuthLevel {
    /// No PIN accepted on this connection
    #[default]
    Unauthenticated,
    /// Authorised user PIN accepted
    User,
    /// Supervisor PIN accepted
    Supervisor,
}

impl fmt::Display for AuthLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthenticated => write!(f, "unauthenticated"),
            Self::User => write!(f, "user"),
            Self::Supervisor => write!(f, "supervisor"),
        }
    }
}

/// Effective permission level, ordered from least to most privileged
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Permission {
    /// Movement and preset selection
    ControlOnly,
    /// Movement plus every setting
    ControlAndSettings,
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ControlOnly => write!(f, "control"),
            Self::ControlAndSettings => write!(f, "control and settings"),
        }
    }
}

/// Authentication state of the current connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SessionState {
    /// PIN configuration of the device
    pub pin_mode: PinMode,
    /// Accepted role
    pub authenticated: AuthLevel,
    /// Effective permission, `None` when a PIN is required but not accepted
    pub permission: Option<Permission>,
}

/// Connection lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    /// No transport session
    #[default]
    Disconnected,
    /// Establishing the transport session
    Connecting,
    /// Registering for notifications
    Subscribing,
    /// Detecting the dialect and reading all attributes
    Syncing,
    /// Sending the PIN
    Authenticating,
    /// Accepting commands
    Ready,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Subscribing => write!(f, "Subscribing"),
            Self::Syncing => write!(f, "Syncing"),
            Self::Authenticating => write!(f, "Authenticating"),
            Self::Ready => write!(f, "Ready"),
        }
    }
}

/// Observable view of the connection state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionSnapshot {
    /// Current machine state
    pub state: ConnectionState,
    /// Dialect selected for the current connection
    pub protocol_variant: Option<ProtocolVariant>,
    /// Classification of the most recent failure
    pub last_error: Option<ErrorKind>,
}

/// Progress of an active calibration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CalibrationState {
    /// Calibration has not reached its terminal step yet
    pub running: bool,
    /// Last accepted step
    pub last_step: Option<u8>,
}

/// Transport timeout configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Bound on establishing the transport session in milliseconds
    pub connect_timeout_ms: u64,
    /// Bound on each read, write or subscribe in milliseconds
    pub operation_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: 30_000,
            operation_timeout_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    /// Connect bound as a [`Duration`]
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-operation bound as a [`Duration`]
    #[must_use]
    pub const fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

/// Connection configuration for a single mount
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Transport address of the device
    pub address: String,
    /// PIN used to authenticate on every connection
    pub pin: Option<u16>,
    /// Permission the application intends to use
    pub intent: Permission,
    /// Fixed delay between reconnect attempts in milliseconds
    pub reconnect_interval_ms: u64,
    /// Interval of the full re-read while ready, in milliseconds
    pub refresh_interval_ms: Option<u64>,
    /// Transport timeouts
    pub timeouts: TimeoutConfig,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            pin: None,
            intent: Permission::ControlOnly,
            reconnect_interval_ms: 60_000,
            refresh_interval_ms: Some(300_000),
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl MountConfig {
    /// Configuration for the device at `address`
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            ..Self::default()
        }
    }

    /// Set the PIN and intended permission
    #[must_use]
    pub const fn with_pin(mut self, pin: u16, intent: Permission) -> Self {
        self.pin = Some(pin);
        self.intent = intent;
        self
    }

    /// Reconnect delay as a [`Duration`]
    #[must_use]
    pub const fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Refresh interval as a [`Duration`]
    #[must_use]
    pub fn refresh_interval(&self) -> Option<Duration> {
        self.refresh_interval_ms.map(Duration::from_millis)
    }
}

impl fmt::Debug for MountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountConfig")
            .field("address", &self.address)
            .field("pin", &self.pin.map(|_| "****"))
            .field("intent", &self.intent)
            .field("reconnect_interval_ms", &self.reconnect_interval_ms)
            .field("refresh_interval_ms", &self.refresh_interval_ms)
            .field("timeouts", &self.timeouts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_pin_features_bits() {
        let features = MultiPinFeatures::from_bits(0b0001_0101);
        assert!(features.change_presets);
        assert!(!features.change_name);
        assert!(features.disable_channel);
        assert!(!features.change_tv_on_off_detection);
        assert!(features.change_default_position);
        assert!(!features.start_calibration);
        assert_eq!(features.bits(), 0b0001_0101);

        let calibration_only = MultiPinFeatures::from_bits(0b0010_0000);
        assert!(calibration_only.start_calibration);
        assert_eq!(calibration_only.bits(), 0x20);
    }

    #[test]
    fn test_permission_ordering() {
        assert!(Permission::ControlAndSettings > Permission::ControlOnly);
        assert!(!PinMode::None.requires_pin());
        assert!(PinMode::UserAndSupervisor.requires_pin());
    }

    #[test]
    fn test_mount_config_defaults() {
        let config = MountConfig::new("AA:BB:CC:DD:EE:FF");

        assert_eq!(config.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(config.reconnect_interval(), Duration::from_secs(60));
        assert_eq!(config.refresh_interval(), Some(Duration::from_secs(300)));
        assert_eq!(config.timeouts.connect_timeout_ms, 30_000);
        assert_eq!(config.timeouts.operation_timeout_ms, 5_000);
        assert!(config.pin.is_none());
    }

    #[test]
    fn test_mount_config_debug_hides_pin() {
        let config = MountConfig::new("AA:BB:CC:DD:EE:FF").with_pin(1234, Permission::ControlOnly);
        let debug = format!("{config:?}");
        assert!(!debug.contains("1234"));
        assert!(debug.contains("****"));
    }

    #[test]
    fn test_preset_empty() {
        let preset = Preset::empty(4);
        assert_eq!(preset.slot_index, 4);
        assert!(!preset.exists);
        assert!(preset.name.is_empty());
    }
}
