use thiserror::Error;

use crate::protocol::Attribute;
use crate::types::{AuthLevel, Permission};

/// Errors that can occur when working with a MotionMount
#[derive(Error, Debug)]
pub enum MountError {
    /// Bluetooth Low Energy related errors
    #[error("BLE error: {0}")]
    Ble(#[from] btleplug::Error),

    /// Transport failure reported by a non-btleplug transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Device not found at the configured address
    #[error("MotionMount not found at {0}")]
    DeviceNotFound(String),

    /// Device disconnected unexpectedly
    #[error("Device disconnected")]
    Disconnected,

    /// Transport operation timed out
    #[error("Transport operation timed out after {timeout_ms}ms")]
    Timeout {
        /// Timeout duration in milliseconds
        timeout_ms: u64,
    },

    /// The connection is not in a state that accepts commands
    #[error("Device not ready: {reason}")]
    NotReady {
        /// Reason why device is not ready
        reason: String,
    },

    /// The operation was aborted by an explicit disconnect
    #[error("Operation cancelled by disconnect")]
    Cancelled,

    /// The device does not expose a required characteristic
    #[error("Characteristic {0} not found on device")]
    CharacteristicMissing(Attribute),

    /// Malformed or unrecognized attribute payload
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Value could not be encoded for the wire
    #[error("Encode error: {0}")]
    Encode(#[from] EncodeError),

    /// Neither or both protocol dialects matched the device
    #[error("Could not determine the protocol variant of the device")]
    ProtocolVariantAmbiguous,

    /// PIN authentication failure
    #[error("Authentication failed: {0}")]
    Auth(#[from] AuthError),

    /// The current session lacks the permission for this command
    #[error("Permission denied: {required} required")]
    PermissionDenied {
        /// Permission level the command needs
        required: Permission,
    },

    /// All preset slots are occupied
    #[error("No free preset slot")]
    NoFreeSlot,

    /// The requested preset slot already holds a preset
    #[error("Preset slot {0} is already occupied")]
    SlotOccupied(u8),

    /// The requested preset slot holds no preset
    #[error("Preset slot {0} is empty")]
    PresetNotFound(u8),

    /// Only part of a multi-step preset write reached the device
    #[error("Preset {index} was only partially written: {source}")]
    PartialWrite {
        /// Slot index of the affected preset
        index: u8,
        /// Failure of the step that did not complete
        #[source]
        source: Box<MountError>,
    },

    /// A movement command was issued during calibration
    #[error("Calibration in progress")]
    CalibrationInProgress,

    /// Calibration step did not increase
    #[error("Calibration step {observed} after step {previous}")]
    CalibrationOutOfOrder {
        /// Last accepted step
        previous: u8,
        /// Step that was observed
        observed: u8,
    },

    /// Invalid command parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// A written value did not read back as written
    #[error("Value of {attribute} was not saved by the device")]
    NotSaved {
        /// Attribute that was written
        attribute: Attribute,
    },
}

/// Result type for MotionMount operations
pub type Result<T> = std::result::Result<T, MountError>;

/// Failures decoding an attribute payload
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Payload shorter than the documented minimum
    #[error("{attribute}: expected at least {expected} bytes, got {actual}")]
    TooShort {
        /// Attribute being decoded
        attribute: Attribute,
        /// Minimum length
        expected: usize,
        /// Received length
        actual: usize,
    },

    /// Auto-move byte outside the HDMI code table
    #[error("unknown auto-move code {0}")]
    UnknownAutoMoveCode(u8),

    /// Byte pattern outside a lookup table
    #[error("{attribute}: unknown code {code:02X?}")]
    UnknownEnumCode {
        /// Attribute being decoded
        attribute: Attribute,
        /// Raw bytes that did not match
        code: Vec<u8>,
    },

    /// Numeric value outside its documented range
    #[error("{attribute}: value {value} out of range")]
    OutOfRange {
        /// Attribute being decoded
        attribute: Attribute,
        /// Decoded value
        value: i32,
    },

    /// Name bytes are not valid UTF-8
    #[error("{0}: invalid UTF-8")]
    InvalidUtf8(Attribute),

    /// Attribute cannot be read
    #[error("{0} is not readable")]
    NotReadable(Attribute),
}

/// Failures encoding a value for an attribute
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Attribute cannot be written
    #[error("{0} is read-only")]
    ReadOnly(Attribute),

    /// Undocumented attributes are preserved on read but never written
    #[error("{0} has no documented meaning and cannot be written")]
    Opaque(Attribute),

    /// Field kind does not belong to the attribute
    #[error("field does not match attribute {0}")]
    FieldMismatch(Attribute),

    /// Numeric value outside its documented range
    #[error("{attribute}: value {value} out of range")]
    OutOfRange {
        /// Attribute being encoded
        attribute: Attribute,
        /// Rejected value
        value: i32,
    },

    /// Name is empty
    #[error("name must not be empty")]
    EmptyName,

    /// Name contains a NUL byte, which the device reads as padding
    #[error("name must not contain NUL bytes")]
    NulInName,

    /// Name exceeds the dialect's width
    #[error("name is {len} bytes, at most {max} allowed")]
    NameTooLong {
        /// Encoded length in bytes
        len: usize,
        /// Maximum length in bytes
        max: usize,
    },

    /// PIN outside 0000..=9999
    #[error("PIN must have four digits")]
    InvalidPin,
}

/// PIN authentication failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// The device did not grant the requested level
    #[error("{requested} PIN rejected (device reports {observed:?})")]
    Rejected {
        /// Role the PIN was sent for
        requested: AuthLevel,
        /// Permission the device reported afterwards, if recognized
        observed: Option<Permission>,
    },

    /// The device has no PIN configured for the requested role
    #[error("device has no {0} PIN configured")]
    RoleUnavailable(AuthLevel),
}

/// Compact classification of an error, stored as the connection's last error
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorKind {
    /// Connect/read/write/subscribe failure or lost link
    Transport,
    /// A transport operation exceeded its bound
    Timeout,
    /// Malformed attribute payload
    Decode,
    /// Protocol dialect could not be determined
    ProtocolVariantAmbiguous,
    /// PIN rejected
    AuthRejected,
    /// Local permission check failed
    PermissionDenied,
    /// Preset capacity exhausted
    NoFreeSlot,
    /// Preset write incomplete
    PartialWrite,
    /// Command blocked by calibration
    CalibrationInProgress,
    /// Calibration anomaly
    CalibrationOutOfOrder,
    /// Caller-supplied value rejected
    InvalidParameters,
    /// Aborted by explicit disconnect
    Cancelled,
    /// Verification read-back mismatch
    NotSaved,
    /// Anything else
    Other,
}

impl MountError {
    /// Check if this error means the link itself is unusable
    ///
    /// A missing characteristic is reported but leaves the link usable.
    #[must_use]
    pub const fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Ble(_)
                | Self::Transport(_)
                | Self::DeviceNotFound(_)
                | Self::Disconnected
                | Self::Timeout { .. }
        )
    }

    /// Check if the caller can retry this operation without a reconnect
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PartialWrite { .. }
                | Self::NoFreeSlot
                | Self::SlotOccupied(_)
                | Self::CalibrationInProgress
                | Self::InvalidParameters(_)
                | Self::NotSaved { .. }
        )
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Ble(_)
            | Self::Transport(_)
            | Self::DeviceNotFound(_)
            | Self::Disconnected
            | Self::NotReady { .. }
            | Self::CharacteristicMissing(_) => ErrorKind::Transport,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Decode(_) => ErrorKind::Decode,
            Self::ProtocolVariantAmbiguous => ErrorKind::ProtocolVariantAmbiguous,
            Self::Auth(_) => ErrorKind::AuthRejected,
            Self::PermissionDenied { .. } => ErrorKind::PermissionDenied,
            Self::NoFreeSlot | Self::SlotOccupied(_) => ErrorKind::NoFreeSlot,
            Self::PartialWrite { .. } => ErrorKind::PartialWrite,
            Self::CalibrationInProgress => ErrorKind::CalibrationInProgress,
            Self::CalibrationOutOfOrder { .. } => ErrorKind::CalibrationOutOfOrder,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::NotSaved { .. } => ErrorKind::NotSaved,
            Self::Encode(_) | Self::PresetNotFound(_) => ErrorKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = MountError::Timeout { timeout_ms: 5000 };
        assert!(timeout.is_transport_error());
        assert!(!timeout.is_recoverable());
        assert_eq!(timeout.kind(), ErrorKind::Timeout);

        let denied = MountError::PermissionDenied {
            required: Permission::ControlAndSettings,
        };
        assert!(!denied.is_transport_error());
        assert_eq!(denied.kind(), ErrorKind::PermissionDenied);

        let partial = MountError::PartialWrite {
            index: 2,
            source: Box::new(MountError::Disconnected),
        };
        assert!(partial.is_recoverable());
        assert_eq!(partial.kind(), ErrorKind::PartialWrite);
    }

    #[test]
    fn test_error_display() {
        let error = MountError::from(DecodeError::UnknownAutoMoveCode(99));
        let error_string = format!("{error}");
        assert!(error_string.contains("Decode error"));
        assert!(error_string.contains("99"));

        let auth = MountError::from(AuthError::Rejected {
            requested: AuthLevel::Supervisor,
            observed: Some(Permission::ControlOnly),
        });
        assert_eq!(auth.kind(), ErrorKind::AuthRejected);
        assert!(format!("{auth}").contains("supervisor"));
    }
}
