use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::debug;

use crate::{
    error::{MountError, Result},
    protocol,
};

/// Byte order of multi-byte numeric fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteOrder {
    /// Most significant byte first
    Big,
    /// Least significant byte first
    Little,
}

/// Layout of the MCP version attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionLayout {
    /// Hardware 0..3, bootloader 3..5, firmware 5..7
    FourField,
    /// Bootloader 0..3, firmware 3..5
    ThreeField,
}

/// Wire dialect spoken by a connected mount
///
/// Two firmware families are in the field. They agree on the set of
/// attributes but not on how presets, versions and the pin-information byte
/// are laid out:
///
/// | | Modern | Legacy |
/// |---|---|---|
/// | Byte order | big-endian | little-endian |
/// | Preset record | exists flag + distance + rotation + 15 name bytes | distance + rotation + 20 name bytes |
/// | Preset overflow name | 17 bytes per slot | none |
/// | MCP versions | 4-field, 7 bytes | 3-field, 5 bytes |
/// | Pin information | 12 / 13 / 15 | 0 / 1 / 3 |
///
/// The variant is detected once per connection and passed into every codec call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVariant {
    /// Current firmware family
    Modern,
    /// Early firmware family
    Legacy,
}

impl ProtocolVariant {
    /// Every known dialect in detection order
    pub const ALL: [Self; 2] = [Self::Modern, Self::Legacy];

    /// Byte order of distance and rotation fields
    #[must_use]
    pub const fn byte_order(self) -> ByteOrder {
        match self {
            Self::Modern => ByteOrder::Big,
            Self::Legacy => ByteOrder::Little,
        }
    }

    /// Whether preset records start with an explicit exists byte
    #[must_use]
    pub const fn has_exists_flag(self) -> bool {
        matches!(self, Self::Modern)
    }

    /// Offset of the distance field inside a preset record
    #[must_use]
    pub const fn preset_header_len(self) -> usize {
        match self {
            Self::Modern => 5,
            Self::Legacy => 4,
        }
    }

    /// Name bytes carried by the preset record itself
    #[must_use]
    pub const fn primary_name_len(self) -> usize {
        match self {
            Self::Modern => 15,
            Self::Legacy => 20,
        }
    }

    /// Full length of a preset record on the wire
    #[must_use]
    pub const fn preset_record_len(self) -> usize {
        self.preset_header_len() + self.primary_name_len()
    }

    /// Length of the per-slot overflow name attribute, if the dialect has one
    #[must_use]
    pub const fn overflow_name_len(self) -> Option<usize> {
        match self {
            Self::Modern => Some(17),
            Self::Legacy => None,
        }
    }

    /// Longest preset name the dialect can store
    #[must_use]
    pub const fn max_preset_name_len(self) -> usize {
        match self.overflow_name_len() {
            Some(overflow) => self.primary_name_len() + overflow,
            None => self.primary_name_len(),
        }
    }

    /// Layout of the MCP version attribute
    #[must_use]
    pub const fn version_layout(self) -> VersionLayout {
        match self {
            Self::Modern => VersionLayout::FourField,
            Self::Legacy => VersionLayout::ThreeField,
        }
    }
}

impl fmt::Display for ProtocolVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Modern => write!(f, "modern"),
            Self::Legacy => write!(f, "legacy"),
        }
    }
}

/// Raw reference attributes read before the dialect is known
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialReads {
    /// Pin-information attribute
    pub pin_information: Bytes,
    /// MCP version attribute
    pub mcp_versions: Bytes,
}

/// Select the dialect whose decoders accept every reference attribute
///
/// # Errors
///
/// Returns [`MountError::ProtocolVariantAmbiguous`] if no dialect or more
/// than one dialect validates.
pub fn detect(reads: &InitialReads) -> Result<ProtocolVariant> {
    let mut matching = ProtocolVariant::ALL.into_iter().filter(|variant| {
        let pin = protocol::decode_pin_mode(&reads.pin_information, *variant);
        let versions = protocol::decode_mcp_versions(&reads.mcp_versions, *variant);
        debug!(
            "Variant {} validation: pin={:?} versions={:?}",
            variant,
            pin.is_ok(),
            versions.is_ok()
        );
        pin.is_ok() && versions.is_ok()
    });

    match (matching.next(), matching.next()) {
        (Some(variant), None) => Ok(variant),
        _ => Err(MountError::ProtocolVariantAmbiguous),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reads(pin: u8, mcp: &[u8]) -> InitialReads {
        InitialReads {
            pin_information: Bytes::from(vec![pin]),
            mcp_versions: Bytes::copy_from_slice(mcp),
        }
    }

    #[test]
    fn test_detect_modern() {
        let variant = detect(&reads(15, &[4, 5, 6, 7, 8, 9, 10])).unwrap();
        assert_eq!(variant, ProtocolVariant::Modern);
    }

    #[test]
    fn test_detect_legacy() {
        let variant = detect(&reads(1, &[1, 0, 2, 3, 1])).unwrap();
        assert_eq!(variant, ProtocolVariant::Legacy);
    }

    #[test]
    fn test_detect_neither() {
        let result = detect(&reads(99, &[4, 5, 6, 7, 8, 9, 10]));
        assert!(matches!(result, Err(MountError::ProtocolVariantAmbiguous)));

        // Modern pin code but too few version bytes for the modern layout
        let result = detect(&reads(12, &[1, 2, 3, 4, 5]));
        assert!(matches!(result, Err(MountError::ProtocolVariantAmbiguous)));
    }

    #[test]
    fn test_dialect_layouts() {
        assert_eq!(ProtocolVariant::Modern.preset_record_len(), 20);
        assert_eq!(ProtocolVariant::Legacy.preset_record_len(), 24);
        assert_eq!(ProtocolVariant::Modern.max_preset_name_len(), 32);
        assert_eq!(ProtocolVariant::Legacy.max_preset_name_len(), 20);
        assert!(ProtocolVariant::Modern.has_exists_flag());
        assert!(!ProtocolVariant::Legacy.has_exists_flag());
    }
}
