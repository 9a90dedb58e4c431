use crate::{
    error::{DecodeError, EncodeError},
    types::{AuthLevel, AutoMove, MultiPinFeatures, Permission, PinMode, HDMI_INPUTS},
    variant::{ByteOrder, ProtocolVariant, VersionLayout},
    MOVEMENT_CHAR_BASE, SESSION_CHAR_BASE,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;
use uuid::Uuid;

/// Number of preset slots on the device
pub const PRESET_SLOTS: u8 = 7;

/// Width of the device name attribute in bytes
pub const NAME_LEN: usize = 20;

/// Widest TV the mount accepts in centimetres
pub const MAX_TV_WIDTH_CM: u8 = 243;

/// Value written to the calibration attribute to start calibrating
pub const CALIBRATION_START: u8 = 1;

/// Calibration step signalling completion
pub const CALIBRATION_DONE: u8 = 0;

/// Added to the PIN's most significant byte to address the supervisor role
pub const SUPERVISOR_PIN_OFFSET: u8 = 0x40;

/// Highest four-digit PIN
pub const MAX_PIN: u16 = 9999;

/// Number of undocumented notifying attributes in the movement group
pub const UNKNOWN_ATTRIBUTES: u8 = 2;

/// Auto-move "on" codes, indexed by HDMI input - 1
const AUTO_MOVE_ON_CODES: [u8; HDMI_INPUTS as usize] = [0, 4, 8, 12, 16];

/// Auto-move "off" codes, indexed by HDMI input - 1
const AUTO_MOVE_OFF_CODES: [u8; HDMI_INPUTS as usize] = [1, 5, 9, 13, 17];

const PERMISSION_GRANTED: u8 = 0x80;
const PERMISSION_CONTROL_AND_SETTINGS: [u8; 2] = [PERMISSION_GRANTED, PERMISSION_GRANTED];
const PERMISSION_CONTROL_ONLY: [u8; 2] = [PERMISSION_GRANTED, 0x00];

/// Pin-information codes as `(none, user only, user and supervisor)`
const MODERN_PIN_CODES: (u8, u8, u8) = (12, 13, 15);
const LEGACY_PIN_CODES: (u8, u8, u8) = (0, 1, 3);

/// Logical grouping of attributes on the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeGroup {
    /// Movement and preset attributes
    Movement,
    /// Authentication, naming and version attributes
    Session,
}

/// Addressable attribute of the mount
///
/// Each attribute maps to one 128-bit characteristic UUID. Movement group
/// characteristics share the `c005faNN-0651-4800-b000-000000000000` pattern,
/// session group characteristics `c005fcNN-0651-4800-b000-000000000000`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Attribute {
    /// Current distance from the wall (R/W/N)
    Distance,
    /// Current rotation (R/W/N)
    Rotation,
    /// Move to a preset (W)
    SelectPreset,
    /// Calibration control and progress (R/W/N)
    Calibrate,
    /// Auto-move mode (R/W)
    AutoMove,
    /// Preset used when the TV turns off (R/W)
    Freeze,
    /// TV width (R/W)
    TvWidth,
    /// Undocumented notifying attribute (R/N)
    Unknown(u8),
    /// Preset record for a slot (R/W)
    Preset(u8),
    /// Overflow name for a slot (R/W, modern dialect)
    PresetName(u8),
    /// PIN authentication (W)
    Authenticate,
    /// Permission check after authentication (R)
    PinCheck,
    /// Pin information (R/N)
    PinSettings,
    /// Change a PIN (W)
    ChangePin,
    /// Features granted to authorised users (R/W)
    MultiPinFeatures,
    /// Device name (R/W)
    Name,
    /// CEB board versions (R)
    VersionsCeb,
    /// MCP board versions (R)
    VersionsMcp,
}

impl Attribute {
    /// Group owning this attribute
    #[must_use]
    pub const fn group(self) -> AttributeGroup {
        match self {
            Self::Distance
            | Self::Rotation
            | Self::SelectPreset
            | Self::Calibrate
            | Self::AutoMove
            | Self::Freeze
            | Self::TvWidth
            | Self::Unknown(_)
            | Self::Preset(_)
            | Self::PresetName(_) => AttributeGroup::Movement,
            Self::Authenticate
            | Self::PinCheck
            | Self::PinSettings
            | Self::ChangePin
            | Self::MultiPinFeatures
            | Self::Name
            | Self::VersionsCeb
            | Self::VersionsMcp => AttributeGroup::Session,
        }
    }

    const fn offset(self) -> Option<u8> {
        let offset = match self {
            Self::Distance | Self::Authenticate => 0x00,
            Self::Rotation | Self::PinCheck => 0x01,
            Self::SelectPreset | Self::PinSettings => 0x02,
            Self::Calibrate | Self::ChangePin => 0x03,
            Self::AutoMove | Self::MultiPinFeatures => 0x04,
            Self::Freeze | Self::Name => 0x05,
            Self::TvWidth | Self::VersionsCeb => 0x06,
            Self::VersionsMcp => 0x07,
            Self::Unknown(index) if index < UNKNOWN_ATTRIBUTES => 0x07 + index,
            Self::Preset(index) if index < PRESET_SLOTS => 0x10 + index,
            Self::PresetName(index) if index < PRESET_SLOTS => 0x20 + index,
            Self::Unknown(_) | Self::Preset(_) | Self::PresetName(_) => return None,
        };
        Some(offset)
    }

    /// Characteristic UUID of this attribute
    ///
    /// Returns `None` for an index past the attributes the mount exposes.
    #[must_use]
    pub const fn uuid(self) -> Option<Uuid> {
        let Some(offset) = self.offset() else {
            return None;
        };
        let base = match self.group() {
            AttributeGroup::Movement => MOVEMENT_CHAR_BASE,
            AttributeGroup::Session => SESSION_CHAR_BASE,
        };
        Some(Uuid::from_u128(base | ((offset as u128) << 96)))
    }

    /// Resolve a characteristic UUID back to its attribute
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        let raw = uuid.as_u128();
        let base = raw & !(0xFF_u128 << 96);
        let offset = u8::try_from((raw >> 96) & 0xFF).ok()?;

        if base == MOVEMENT_CHAR_BASE {
            match offset {
                0x00 => Some(Self::Distance),
                0x01 => Some(Self::Rotation),
                0x02 => Some(Self::SelectPreset),
                0x03 => Some(Self::Calibrate),
                0x04 => Some(Self::AutoMove),
                0x05 => Some(Self::Freeze),
                0x06 => Some(Self::TvWidth),
                0x07..=0x08 => Some(Self::Unknown(offset - 0x07)),
                0x10..=0x16 => Some(Self::Preset(offset - 0x10)),
                0x20..=0x26 => Some(Self::PresetName(offset - 0x20)),
                _ => None,
            }
        } else if base == SESSION_CHAR_BASE {
            match offset {
                0x00 => Some(Self::Authenticate),
                0x01 => Some(Self::PinCheck),
                0x02 => Some(Self::PinSettings),
                0x03 => Some(Self::ChangePin),
                0x04 => Some(Self::MultiPinFeatures),
                0x05 => Some(Self::Name),
                0x06 => Some(Self::VersionsCeb),
                0x07 => Some(Self::VersionsMcp),
                _ => None,
            }
        } else {
            None
        }
    }

    /// Check if the attribute can be read
    #[must_use]
    pub const fn is_readable(self) -> bool {
        !matches!(
            self,
            Self::SelectPreset | Self::Authenticate | Self::ChangePin
        )
    }

    /// Check if the attribute pushes notifications
    #[must_use]
    pub const fn notifies(self) -> bool {
        matches!(
            self,
            Self::Distance | Self::Rotation | Self::Calibrate | Self::PinSettings | Self::Unknown(_)
        )
    }

    /// Every notify-capable attribute
    #[must_use]
    pub fn notifying() -> Vec<Self> {
        let mut attributes = vec![
            Self::Distance,
            Self::Rotation,
            Self::Calibrate,
            Self::PinSettings,
        ];
        attributes.extend((0..UNKNOWN_ATTRIBUTES).map(Self::Unknown));
        attributes
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distance => write!(f, "distance"),
            Self::Rotation => write!(f, "rotation"),
            Self::SelectPreset => write!(f, "select-preset"),
            Self::Calibrate => write!(f, "calibration"),
            Self::AutoMove => write!(f, "auto-move"),
            Self::Freeze => write!(f, "freeze-preset"),
            Self::TvWidth => write!(f, "tv-width"),
            Self::Unknown(index) => write!(f, "unknown-{index}"),
            Self::Preset(index) => write!(f, "preset-{index}"),
            Self::PresetName(index) => write!(f, "preset-name-{index}"),
            Self::Authenticate => write!(f, "authenticate"),
            Self::PinCheck => write!(f, "pin-check"),
            Self::PinSettings => write!(f, "pin-information"),
            Self::ChangePin => write!(f, "change-pin"),
            Self::MultiPinFeatures => write!(f, "multi-pin-features"),
            Self::Name => write!(f, "name"),
            Self::VersionsCeb => write!(f, "versions-ceb"),
            Self::VersionsMcp => write!(f, "versions-mcp"),
        }
    }
}

/// Role a PIN is sent for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinRole {
    /// Authorised user
    User,
    /// Supervisor
    Supervisor,
}

impl From<PinRole> for AuthLevel {
    fn from(role: PinRole) -> Self {
        match role {
            PinRole::User => Self::User,
            PinRole::Supervisor => Self::Supervisor,
        }
    }
}

/// PIN payload for the authenticate and change-PIN attributes
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PinCode {
    /// Four-digit PIN value
    pub pin: u16,
    /// Role the PIN addresses
    pub role: PinRole,
}

impl fmt::Debug for PinCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PinCode")
            .field("pin", &"****")
            .field("role", &self.role)
            .finish()
    }
}

/// Decoded preset record, name bytes not yet joined with the overflow field
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PresetRecord {
    /// Slot holds a preset
    pub exists: bool,
    /// Distance in percent
    pub distance: u8,
    /// Rotation in percent
    pub rotation: i8,
    /// Primary name bytes without trailing padding
    pub name: Vec<u8>,
}

/// Decoded MCP board versions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McpVersions {
    /// Hardware revision, four-field layout only
    pub hardware: Option<String>,
    /// Bootloader version
    pub bootloader: String,
    /// Firmware version
    pub firmware: String,
}

/// Logical value of an attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// Distance in percent
    Distance(u8),
    /// Rotation in percent
    Rotation(i8),
    /// Auto-move mode
    AutoMove(AutoMove),
    /// Freeze preset slot
    FreezePreset(u8),
    /// TV width in centimetres
    TvWidth(u8),
    /// Device name
    Name(String),
    /// Preset record
    PresetRecord(PresetRecord),
    /// Preset overflow name bytes
    PresetOverflow(Vec<u8>),
    /// Preset to move to
    SelectPreset(u8),
    /// Calibration step or start code
    Calibration(u8),
    /// CEB bootloader version
    CebVersion(String),
    /// MCP versions
    McpVersions(McpVersions),
    /// PIN payload
    Pin(PinCode),
    /// Permission check result
    Permission(Permission),
    /// Pin information
    PinMode(PinMode),
    /// Authorised user feature grants
    MultiPinFeatures(MultiPinFeatures),
    /// Undocumented payload preserved verbatim
    Opaque(Bytes),
}

/// Decode the payload of `attribute` under `variant`
///
/// # Errors
///
/// Returns a [`DecodeError`] if the payload is shorter than the attribute's
/// minimum, holds an unrecognized code, or the attribute is write-only.
pub fn decode(
    attribute: Attribute,
    data: &[u8],
    variant: ProtocolVariant,
) -> Result<Field, DecodeError> {
    match attribute {
        Attribute::Distance => decode_distance(data, variant).map(Field::Distance),
        Attribute::Rotation => decode_rotation(data, variant).map(Field::Rotation),
        Attribute::AutoMove => decode_auto_move(data, variant).map(Field::AutoMove),
        Attribute::Freeze => decode_freeze_preset(data).map(Field::FreezePreset),
        Attribute::TvWidth => decode_tv_width(data).map(Field::TvWidth),
        Attribute::Name => decode_name(data).map(Field::Name),
        Attribute::Preset(_) => decode_preset_record(data, variant).map(Field::PresetRecord),
        Attribute::PresetName(_) => Ok(Field::PresetOverflow(decode_preset_overflow(data))),
        Attribute::Calibrate => decode_calibration(data).map(Field::Calibration),
        Attribute::PinCheck => decode_permission(data).map(Field::Permission),
        Attribute::PinSettings => decode_pin_mode(data, variant).map(Field::PinMode),
        Attribute::MultiPinFeatures => {
            decode_multi_pin_features(data).map(Field::MultiPinFeatures)
        }
        Attribute::VersionsCeb => decode_ceb_version(data).map(Field::CebVersion),
        Attribute::VersionsMcp => decode_mcp_versions(data, variant).map(Field::McpVersions),
        Attribute::Unknown(_) => Ok(Field::Opaque(Bytes::copy_from_slice(data))),
        Attribute::SelectPreset | Attribute::Authenticate | Attribute::ChangePin => {
            Err(DecodeError::NotReadable(attribute))
        }
    }
}

/// Encode `field` for `attribute` under `variant`
///
/// # Errors
///
/// Returns an [`EncodeError`] if the attribute is read-only or opaque, the
/// field does not belong to the attribute, or the value is out of range.
pub fn encode(
    attribute: Attribute,
    field: &Field,
    variant: ProtocolVariant,
) -> Result<Bytes, EncodeError> {
    match (attribute, field) {
        (Attribute::Unknown(_), _) => Err(EncodeError::Opaque(attribute)),
        (
            Attribute::PinCheck
            | Attribute::PinSettings
            | Attribute::VersionsCeb
            | Attribute::VersionsMcp,
            _,
        ) => Err(EncodeError::ReadOnly(attribute)),
        (Attribute::Distance, Field::Distance(distance)) => encode_distance(*distance, variant),
        (Attribute::Rotation, Field::Rotation(rotation)) => encode_rotation(*rotation, variant),
        (Attribute::AutoMove, Field::AutoMove(mode)) => encode_auto_move(*mode),
        (Attribute::Freeze, Field::FreezePreset(index))
        | (Attribute::SelectPreset, Field::SelectPreset(index)) => {
            encode_slot_index(attribute, *index)
        }
        (Attribute::TvWidth, Field::TvWidth(width)) => encode_tv_width(*width),
        (Attribute::Name, Field::Name(name)) => encode_name(name),
        (Attribute::Preset(_), Field::PresetRecord(record)) => {
            encode_preset_record(record, variant)
        }
        (Attribute::PresetName(_), Field::PresetOverflow(name)) => {
            encode_preset_overflow(attribute, name, variant)
        }
        (Attribute::Calibrate, Field::Calibration(code)) => Ok(Bytes::copy_from_slice(&[*code])),
        (Attribute::Authenticate | Attribute::ChangePin, Field::Pin(code)) => encode_pin(*code),
        (Attribute::MultiPinFeatures, Field::MultiPinFeatures(features)) => {
            Ok(Bytes::copy_from_slice(&[features.bits()]))
        }
        _ => Err(EncodeError::FieldMismatch(attribute)),
    }
}

fn require_len(attribute: Attribute, data: &[u8], expected: usize) -> Result<(), DecodeError> {
    if data.len() < expected {
        return Err(DecodeError::TooShort {
            attribute,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn get_u16(buf: &mut &[u8], variant: ProtocolVariant) -> u16 {
    match variant.byte_order() {
        ByteOrder::Big => buf.get_u16(),
        ByteOrder::Little => buf.get_u16_le(),
    }
}

fn get_i16(buf: &mut &[u8], variant: ProtocolVariant) -> i16 {
    match variant.byte_order() {
        ByteOrder::Big => buf.get_i16(),
        ByteOrder::Little => buf.get_i16_le(),
    }
}

fn put_u16(buf: &mut BytesMut, value: u16, variant: ProtocolVariant) {
    match variant.byte_order() {
        ByteOrder::Big => buf.put_u16(value),
        ByteOrder::Little => buf.put_u16_le(value),
    }
}

fn put_i16(buf: &mut BytesMut, value: i16, variant: ProtocolVariant) {
    match variant.byte_order() {
        ByteOrder::Big => buf.put_i16(value),
        ByteOrder::Little => buf.put_i16_le(value),
    }
}

fn trim_padding(data: &[u8]) -> &[u8] {
    let end = data.iter().rposition(|b| *b != 0).map_or(0, |i| i + 1);
    &data[..end]
}

fn dotted(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Decode a distance (2 bytes, 0..=100)
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] or [`DecodeError::OutOfRange`].
pub fn decode_distance(data: &[u8], variant: ProtocolVariant) -> Result<u8, DecodeError> {
    require_len(Attribute::Distance, data, 2)?;
    let value = get_u16(&mut &data[..], variant);
    u8::try_from(value)
        .ok()
        .filter(|d| *d <= 100)
        .ok_or(DecodeError::OutOfRange {
            attribute: Attribute::Distance,
            value: i32::from(value),
        })
}

/// Encode a distance (2 bytes, 0..=100)
///
/// # Errors
///
/// Returns [`EncodeError::OutOfRange`] above 100.
pub fn encode_distance(distance: u8, variant: ProtocolVariant) -> Result<Bytes, EncodeError> {
    if distance > 100 {
        return Err(EncodeError::OutOfRange {
            attribute: Attribute::Distance,
            value: i32::from(distance),
        });
    }
    let mut buf = BytesMut::with_capacity(2);
    put_u16(&mut buf, u16::from(distance), variant);
    Ok(buf.freeze())
}

/// Decode a rotation (2 bytes signed, -100..=100)
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] or [`DecodeError::OutOfRange`].
pub fn decode_rotation(data: &[u8], variant: ProtocolVariant) -> Result<i8, DecodeError> {
    require_len(Attribute::Rotation, data, 2)?;
    let value = get_i16(&mut &data[..], variant);
    i8::try_from(value)
        .ok()
        .filter(|r| (-100..=100).contains(r))
        .ok_or(DecodeError::OutOfRange {
            attribute: Attribute::Rotation,
            value: i32::from(value),
        })
}

/// Encode a rotation (2 bytes signed, -100..=100)
///
/// # Errors
///
/// Returns [`EncodeError::OutOfRange`] outside -100..=100.
pub fn encode_rotation(rotation: i8, variant: ProtocolVariant) -> Result<Bytes, EncodeError> {
    if !(-100..=100).contains(&rotation) {
        return Err(EncodeError::OutOfRange {
            attribute: Attribute::Rotation,
            value: i32::from(rotation),
        });
    }
    let mut buf = BytesMut::with_capacity(2);
    put_i16(&mut buf, i16::from(rotation), variant);
    Ok(buf.freeze())
}

/// Map a raw auto-move code through the HDMI on/off tables
///
/// # Errors
///
/// Returns [`DecodeError::UnknownAutoMoveCode`] for codes outside both tables.
pub fn auto_move_from_code(code: u8) -> Result<AutoMove, DecodeError> {
    if let Some(index) = AUTO_MOVE_ON_CODES.iter().position(|c| *c == code) {
        // index < HDMI_INPUTS
        return Ok(AutoMove::Hdmi(index as u8 + 1));
    }
    if AUTO_MOVE_OFF_CODES.contains(&code) {
        return Ok(AutoMove::Off);
    }
    Err(DecodeError::UnknownAutoMoveCode(code))
}

/// Decode the auto-move attribute
///
/// The attribute is one byte; firmware that answers with two bytes is read
/// as a 16-bit value in the dialect's byte order.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] or [`DecodeError::UnknownAutoMoveCode`].
pub fn decode_auto_move(data: &[u8], variant: ProtocolVariant) -> Result<AutoMove, DecodeError> {
    require_len(Attribute::AutoMove, data, 1)?;
    let code = if data.len() == 1 {
        data[0]
    } else {
        let value = get_u16(&mut &data[..], variant);
        u8::try_from(value).map_err(|_| DecodeError::UnknownAutoMoveCode(data[0]))?
    };
    auto_move_from_code(code)
}

/// Encode an auto-move mode as its one-byte code
///
/// # Errors
///
/// Returns [`EncodeError::OutOfRange`] for HDMI inputs outside 1..=5.
pub fn encode_auto_move(mode: AutoMove) -> Result<Bytes, EncodeError> {
    let code = match mode {
        AutoMove::Off => AUTO_MOVE_OFF_CODES[0],
        AutoMove::Hdmi(input @ 1..=HDMI_INPUTS) => AUTO_MOVE_ON_CODES[usize::from(input - 1)],
        AutoMove::Hdmi(input) => {
            return Err(EncodeError::OutOfRange {
                attribute: Attribute::AutoMove,
                value: i32::from(input),
            })
        }
    };
    Ok(Bytes::copy_from_slice(&[code]))
}

/// Decode the freeze preset slot index
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] or [`DecodeError::OutOfRange`].
pub fn decode_freeze_preset(data: &[u8]) -> Result<u8, DecodeError> {
    require_len(Attribute::Freeze, data, 1)?;
    if data[0] >= PRESET_SLOTS {
        return Err(DecodeError::OutOfRange {
            attribute: Attribute::Freeze,
            value: i32::from(data[0]),
        });
    }
    Ok(data[0])
}

fn encode_slot_index(attribute: Attribute, index: u8) -> Result<Bytes, EncodeError> {
    if index >= PRESET_SLOTS {
        return Err(EncodeError::OutOfRange {
            attribute,
            value: i32::from(index),
        });
    }
    Ok(Bytes::copy_from_slice(&[index]))
}

/// Decode the TV width in centimetres
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for an empty payload.
pub fn decode_tv_width(data: &[u8]) -> Result<u8, DecodeError> {
    require_len(Attribute::TvWidth, data, 1)?;
    Ok(data[0])
}

/// Encode the TV width (1..=243 cm)
///
/// # Errors
///
/// Returns [`EncodeError::OutOfRange`] outside 1..=243.
pub fn encode_tv_width(width: u8) -> Result<Bytes, EncodeError> {
    if !(1..=MAX_TV_WIDTH_CM).contains(&width) {
        return Err(EncodeError::OutOfRange {
            attribute: Attribute::TvWidth,
            value: i32::from(width),
        });
    }
    Ok(Bytes::copy_from_slice(&[width]))
}

/// Decode the NUL-padded device name
///
/// # Errors
///
/// Returns [`DecodeError::InvalidUtf8`] if the bytes are not UTF-8.
pub fn decode_name(data: &[u8]) -> Result<String, DecodeError> {
    String::from_utf8(trim_padding(data).to_vec())
        .map_err(|_| DecodeError::InvalidUtf8(Attribute::Name))
}

/// Encode the device name, padded to 20 bytes
///
/// # Errors
///
/// Returns [`EncodeError::EmptyName`], [`EncodeError::NulInName`] or
/// [`EncodeError::NameTooLong`].
pub fn encode_name(name: &str) -> Result<Bytes, EncodeError> {
    if name.is_empty() {
        return Err(EncodeError::EmptyName);
    }
    if name.contains('\0') {
        return Err(EncodeError::NulInName);
    }
    if name.len() > NAME_LEN {
        return Err(EncodeError::NameTooLong {
            len: name.len(),
            max: NAME_LEN,
        });
    }
    let mut buf = BytesMut::with_capacity(NAME_LEN);
    buf.extend_from_slice(name.as_bytes());
    buf.resize(NAME_LEN, 0);
    Ok(buf.freeze())
}

/// Decode a preset record
///
/// Distance and rotation are clamped to their ranges. In the legacy dialect,
/// which carries no exists flag, an all-zero record is an empty slot.
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] if the record lacks its numeric header.
pub fn decode_preset_record(
    data: &[u8],
    variant: ProtocolVariant,
) -> Result<PresetRecord, DecodeError> {
    require_len(Attribute::Preset(0), data, variant.preset_header_len())?;
    let mut buf = data;

    let exists = if variant.has_exists_flag() {
        buf.get_u8() != 0
    } else {
        data.iter().any(|b| *b != 0)
    };

    let distance = get_u16(&mut buf, variant).min(100);
    let rotation = get_i16(&mut buf, variant).clamp(-100, 100);

    Ok(PresetRecord {
        exists,
        // clamped above
        distance: distance as u8,
        rotation: rotation as i8,
        name: trim_padding(buf).to_vec(),
    })
}

/// Encode a preset record padded to the dialect's record width
///
/// # Errors
///
/// Returns [`EncodeError::OutOfRange`] or [`EncodeError::NameTooLong`] if the
/// primary name bytes do not fit the record.
pub fn encode_preset_record(
    record: &PresetRecord,
    variant: ProtocolVariant,
) -> Result<Bytes, EncodeError> {
    let attribute = Attribute::Preset(0);
    if record.distance > 100 {
        return Err(EncodeError::OutOfRange {
            attribute,
            value: i32::from(record.distance),
        });
    }
    if !(-100..=100).contains(&record.rotation) {
        return Err(EncodeError::OutOfRange {
            attribute,
            value: i32::from(record.rotation),
        });
    }
    if record.name.len() > variant.primary_name_len() {
        return Err(EncodeError::NameTooLong {
            len: record.name.len(),
            max: variant.primary_name_len(),
        });
    }

    let mut buf = BytesMut::with_capacity(variant.preset_record_len());
    if variant.has_exists_flag() {
        buf.put_u8(u8::from(record.exists));
    } else if !record.exists {
        buf.resize(variant.preset_record_len(), 0);
        return Ok(buf.freeze());
    }
    put_u16(&mut buf, u16::from(record.distance), variant);
    put_i16(&mut buf, i16::from(record.rotation), variant);
    buf.extend_from_slice(&record.name);
    buf.resize(variant.preset_record_len(), 0);
    Ok(buf.freeze())
}

/// Decode a preset overflow name, without padding
#[must_use]
pub fn decode_preset_overflow(data: &[u8]) -> Vec<u8> {
    trim_padding(data).to_vec()
}

fn encode_preset_overflow(
    attribute: Attribute,
    name: &[u8],
    variant: ProtocolVariant,
) -> Result<Bytes, EncodeError> {
    let Some(width) = variant.overflow_name_len() else {
        return Err(EncodeError::FieldMismatch(attribute));
    };
    if name.len() > width {
        return Err(EncodeError::NameTooLong {
            len: name.len(),
            max: width,
        });
    }
    let mut buf = BytesMut::with_capacity(width);
    buf.extend_from_slice(name);
    buf.resize(width, 0);
    Ok(buf.freeze())
}

/// Decode a calibration step
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for an empty payload.
pub fn decode_calibration(data: &[u8]) -> Result<u8, DecodeError> {
    require_len(Attribute::Calibrate, data, 1)?;
    Ok(data[0])
}

/// Decode the permission-check byte pair
///
/// # Errors
///
/// Returns [`DecodeError::UnknownEnumCode`] for any pair other than
/// `(128, 128)` or `(128, 0)`.
pub fn decode_permission(data: &[u8]) -> Result<Permission, DecodeError> {
    require_len(Attribute::PinCheck, data, 2)?;
    match [data[0], data[1]] {
        PERMISSION_CONTROL_AND_SETTINGS => Ok(Permission::ControlAndSettings),
        PERMISSION_CONTROL_ONLY => Ok(Permission::ControlOnly),
        _ => Err(DecodeError::UnknownEnumCode {
            attribute: Attribute::PinCheck,
            code: data[..2].to_vec(),
        }),
    }
}

/// Decode the pin-information byte
///
/// # Errors
///
/// Returns [`DecodeError::UnknownEnumCode`] for codes outside the dialect's table.
pub fn decode_pin_mode(data: &[u8], variant: ProtocolVariant) -> Result<PinMode, DecodeError> {
    require_len(Attribute::PinSettings, data, 1)?;
    let (none, user, both) = match variant {
        ProtocolVariant::Modern => MODERN_PIN_CODES,
        ProtocolVariant::Legacy => LEGACY_PIN_CODES,
    };
    match data[0] {
        code if code == none => Ok(PinMode::None),
        code if code == user => Ok(PinMode::UserOnly),
        code if code == both => Ok(PinMode::UserAndSupervisor),
        code => Err(DecodeError::UnknownEnumCode {
            attribute: Attribute::PinSettings,
            code: vec![code],
        }),
    }
}

/// Decode the multi-pin feature bitmask
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for an empty payload.
pub fn decode_multi_pin_features(data: &[u8]) -> Result<MultiPinFeatures, DecodeError> {
    require_len(Attribute::MultiPinFeatures, data, 1)?;
    Ok(MultiPinFeatures::from_bits(data[0]))
}

/// Decode the CEB bootloader version as a dotted string
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] for an empty payload.
pub fn decode_ceb_version(data: &[u8]) -> Result<String, DecodeError> {
    require_len(Attribute::VersionsCeb, data, 1)?;
    Ok(dotted(data))
}

/// Decode the MCP version attribute using the dialect's layout
///
/// # Errors
///
/// Returns [`DecodeError::TooShort`] if the payload is shorter than the layout.
pub fn decode_mcp_versions(
    data: &[u8],
    variant: ProtocolVariant,
) -> Result<McpVersions, DecodeError> {
    match variant.version_layout() {
        VersionLayout::FourField => {
            require_len(Attribute::VersionsMcp, data, 7)?;
            Ok(McpVersions {
                hardware: Some(dotted(&data[0..3])),
                bootloader: dotted(&data[3..5]),
                firmware: dotted(&data[5..7]),
            })
        }
        VersionLayout::ThreeField => {
            require_len(Attribute::VersionsMcp, data, 5)?;
            Ok(McpVersions {
                hardware: None,
                bootloader: dotted(&data[0..3]),
                firmware: dotted(&data[3..5]),
            })
        }
    }
}

/// Encode a PIN as a little-endian integer
///
/// The supervisor role adds [`SUPERVISOR_PIN_OFFSET`] to the most significant
/// byte. Both dialects share this encoding.
///
/// # Errors
///
/// Returns [`EncodeError::InvalidPin`] above 9999.
pub fn encode_pin(code: PinCode) -> Result<Bytes, EncodeError> {
    if code.pin > MAX_PIN {
        return Err(EncodeError::InvalidPin);
    }
    let mut bytes = code.pin.to_le_bytes();
    if code.role == PinRole::Supervisor {
        bytes[1] = bytes[1].wrapping_add(SUPERVISOR_PIN_OFFSET);
    }
    Ok(Bytes::copy_from_slice(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: ProtocolVariant = ProtocolVariant::Modern;
    const LEGACY: ProtocolVariant = ProtocolVariant::Legacy;

    #[test]
    fn test_distance_round_trip() {
        for variant in ProtocolVariant::ALL {
            for distance in 0..=100 {
                let bytes = encode_distance(distance, variant).unwrap();
                assert_eq!(decode_distance(&bytes, variant).unwrap(), distance);
            }
        }
    }

    #[test]
    fn test_rotation_round_trip() {
        for variant in ProtocolVariant::ALL {
            for rotation in -100..=100 {
                let bytes = encode_rotation(rotation, variant).unwrap();
                assert_eq!(decode_rotation(&bytes, variant).unwrap(), rotation);
            }
        }
    }

    #[test]
    fn test_numeric_byte_order() {
        assert_eq!(&encode_distance(55, MODERN).unwrap()[..], &[0x00, 55]);
        assert_eq!(&encode_distance(55, LEGACY).unwrap()[..], &[55, 0x00]);
        assert_eq!(&encode_rotation(-25, MODERN).unwrap()[..], &[0xFF, 0xE7]);
        assert_eq!(&encode_rotation(-25, LEGACY).unwrap()[..], &[0xE7, 0xFF]);
    }

    #[test]
    fn test_numeric_range_checks() {
        assert!(encode_distance(101, MODERN).is_err());
        assert!(encode_rotation(101, MODERN).is_err());
        assert!(encode_rotation(-101, LEGACY).is_err());
        assert_eq!(
            decode_distance(&[0x00, 150], MODERN),
            Err(DecodeError::OutOfRange {
                attribute: Attribute::Distance,
                value: 150
            })
        );
        assert!(matches!(
            decode_distance(&[42], MODERN),
            Err(DecodeError::TooShort { expected: 2, .. })
        ));
    }

    #[test]
    fn test_auto_move_codes() {
        assert_eq!(decode_auto_move(&[8], MODERN), Ok(AutoMove::Hdmi(3)));
        assert_eq!(decode_auto_move(&[0], MODERN), Ok(AutoMove::Hdmi(1)));
        assert_eq!(decode_auto_move(&[16], MODERN), Ok(AutoMove::Hdmi(5)));
        assert_eq!(decode_auto_move(&[9], MODERN), Ok(AutoMove::Off));
        assert_eq!(
            decode_auto_move(&[99], MODERN),
            Err(DecodeError::UnknownAutoMoveCode(99))
        );
        // Two byte answers are read in the dialect's byte order
        assert_eq!(decode_auto_move(&[0x00, 12], MODERN), Ok(AutoMove::Hdmi(4)));
        assert_eq!(decode_auto_move(&[12, 0x00], LEGACY), Ok(AutoMove::Hdmi(4)));

        assert_eq!(&encode_auto_move(AutoMove::Hdmi(2)).unwrap()[..], &[4]);
        assert_eq!(&encode_auto_move(AutoMove::Off).unwrap()[..], &[1]);
        assert!(encode_auto_move(AutoMove::Hdmi(6)).is_err());
        assert!(encode_auto_move(AutoMove::Hdmi(0)).is_err());
    }

    #[test]
    fn test_permission_check() {
        assert_eq!(decode_permission(&[128, 0]), Ok(Permission::ControlOnly));
        assert_eq!(
            decode_permission(&[128, 128, 0, 0]),
            Ok(Permission::ControlAndSettings)
        );
        assert_eq!(
            decode_permission(&[1, 0, 0, 0]),
            Err(DecodeError::UnknownEnumCode {
                attribute: Attribute::PinCheck,
                code: vec![1, 0]
            })
        );
        assert!(decode_permission(&[128, 7]).is_err());
    }

    #[test]
    fn test_pin_information() {
        assert_eq!(decode_pin_mode(&[12], MODERN), Ok(PinMode::None));
        assert_eq!(decode_pin_mode(&[13], MODERN), Ok(PinMode::UserOnly));
        assert_eq!(decode_pin_mode(&[15], MODERN), Ok(PinMode::UserAndSupervisor));
        assert_eq!(decode_pin_mode(&[3], LEGACY), Ok(PinMode::UserAndSupervisor));
        assert!(decode_pin_mode(&[14], MODERN).is_err());
        assert!(decode_pin_mode(&[12], LEGACY).is_err());
    }

    #[test]
    fn test_pin_encoding() {
        let user = encode_pin(PinCode {
            pin: 1234,
            role: PinRole::User,
        })
        .unwrap();
        assert_eq!(&user[..], &1234u16.to_le_bytes());

        let supervisor = encode_pin(PinCode {
            pin: 1234,
            role: PinRole::Supervisor,
        })
        .unwrap();
        assert_eq!(&supervisor[..], &[0xD2, 0x04 + 0x40]);

        assert_eq!(
            encode_pin(PinCode {
                pin: 10_000,
                role: PinRole::User,
            }),
            Err(EncodeError::InvalidPin)
        );
    }

    #[test]
    fn test_modern_preset_record() {
        let record = PresetRecord {
            exists: true,
            distance: 50,
            rotation: 10,
            name: b"LivingRoom".to_vec(),
        };
        let bytes = encode_preset_record(&record, MODERN).unwrap();

        assert_eq!(bytes.len(), 20);
        assert_eq!(&bytes[..5], &[0x01, 0x00, 50, 0x00, 10]);
        assert_eq!(&bytes[5..15], b"LivingRoom");
        assert_eq!(decode_preset_record(&bytes, MODERN).unwrap(), record);

        let mut empty = [0u8; 20];
        empty[1] = 30;
        let decoded = decode_preset_record(&empty, MODERN).unwrap();
        assert!(!decoded.exists);
        assert_eq!(decoded.distance, 30);
    }

    #[test]
    fn test_legacy_preset_record() {
        let record = PresetRecord {
            exists: true,
            distance: 20,
            rotation: -40,
            name: b"Kitchen".to_vec(),
        };
        let bytes = encode_preset_record(&record, LEGACY).unwrap();

        assert_eq!(bytes.len(), 24);
        assert_eq!(&bytes[..4], &[20, 0x00, 0xD8, 0xFF]);
        assert_eq!(decode_preset_record(&bytes, LEGACY).unwrap(), record);

        let deleted = PresetRecord {
            exists: false,
            ..record
        };
        let bytes = encode_preset_record(&deleted, LEGACY).unwrap();
        assert!(bytes.iter().all(|b| *b == 0));
        assert!(!decode_preset_record(&bytes, LEGACY).unwrap().exists);
    }

    #[test]
    fn test_preset_record_clamps_out_of_range_values() {
        let data = [0x01, 0x00, 0xC8, 0x01, 0x00];
        let record = decode_preset_record(&data, MODERN).unwrap();
        assert_eq!(record.distance, 100);
        assert_eq!(record.rotation, 100);
        assert!(decode_preset_record(&data[..4], MODERN).is_err());
    }

    #[test]
    fn test_versions() {
        let mcp = decode_mcp_versions(&[4, 5, 6, 7, 8, 9, 10], MODERN).unwrap();
        assert_eq!(mcp.hardware.as_deref(), Some("4.5.6"));
        assert_eq!(mcp.bootloader, "7.8");
        assert_eq!(mcp.firmware, "9.10");

        let mcp = decode_mcp_versions(&[1, 0, 2, 3, 1], LEGACY).unwrap();
        assert_eq!(mcp.hardware, None);
        assert_eq!(mcp.bootloader, "1.0.2");
        assert_eq!(mcp.firmware, "3.1");

        assert!(decode_mcp_versions(&[1, 2, 3, 4, 5], MODERN).is_err());
        assert_eq!(decode_ceb_version(&[1, 2, 3]).unwrap(), "1.2.3");
    }

    #[test]
    fn test_name() {
        let bytes = encode_name("MyMount").unwrap();
        assert_eq!(bytes.len(), NAME_LEN);
        assert_eq!(decode_name(&bytes).unwrap(), "MyMount");
        assert_eq!(encode_name(""), Err(EncodeError::EmptyName));
        assert_eq!(encode_name("MyMount\0"), Err(EncodeError::NulInName));
        assert!(encode_name("this name is far too long").is_err());
        assert!(decode_name(&[0xFF, 0xFE]).is_err());
    }

    #[test]
    fn test_opaque_attributes() {
        let field = decode(Attribute::Unknown(1), &[1, 2, 3], MODERN).unwrap();
        assert_eq!(field, Field::Opaque(Bytes::from_static(&[1, 2, 3])));
        assert_eq!(
            encode(Attribute::Unknown(1), &field, MODERN),
            Err(EncodeError::Opaque(Attribute::Unknown(1)))
        );
    }

    #[test]
    fn test_dispatch_rejects_mismatches() {
        assert_eq!(
            encode(Attribute::Distance, &Field::Rotation(3), MODERN),
            Err(EncodeError::FieldMismatch(Attribute::Distance))
        );
        assert_eq!(
            encode(Attribute::PinCheck, &Field::Permission(Permission::ControlOnly), MODERN),
            Err(EncodeError::ReadOnly(Attribute::PinCheck))
        );
        assert_eq!(
            decode(Attribute::Authenticate, &[0, 0], MODERN),
            Err(DecodeError::NotReadable(Attribute::Authenticate))
        );
        assert_eq!(
            encode(Attribute::PresetName(0), &Field::PresetOverflow(vec![1]), LEGACY),
            Err(EncodeError::FieldMismatch(Attribute::PresetName(0)))
        );
    }

    #[test]
    fn test_attribute_uuids() {
        assert_eq!(
            Attribute::Distance.uuid().unwrap().to_string(),
            "c005fa00-0651-4800-b000-000000000000"
        );
        assert_eq!(
            Attribute::Preset(3).uuid().unwrap().to_string(),
            "c005fa13-0651-4800-b000-000000000000"
        );
        assert_eq!(
            Attribute::PinCheck.uuid().unwrap().to_string(),
            "c005fc01-0651-4800-b000-000000000000"
        );

        let all = [
            Attribute::Distance,
            Attribute::Rotation,
            Attribute::SelectPreset,
            Attribute::Calibrate,
            Attribute::AutoMove,
            Attribute::Freeze,
            Attribute::TvWidth,
            Attribute::Unknown(0),
            Attribute::Unknown(1),
            Attribute::Preset(0),
            Attribute::Preset(6),
            Attribute::PresetName(6),
            Attribute::Authenticate,
            Attribute::PinCheck,
            Attribute::PinSettings,
            Attribute::ChangePin,
            Attribute::MultiPinFeatures,
            Attribute::Name,
            Attribute::VersionsCeb,
            Attribute::VersionsMcp,
        ];
        for attribute in all {
            assert_eq!(Attribute::from_uuid(attribute.uuid().unwrap()), Some(attribute));
        }
        assert_eq!(Attribute::from_uuid(Uuid::nil()), None);
    }

    #[test]
    fn test_indexed_attributes_out_of_range() {
        assert_eq!(Attribute::Unknown(UNKNOWN_ATTRIBUTES).uuid(), None);
        assert_eq!(Attribute::Unknown(9).uuid(), None);
        assert_eq!(Attribute::Preset(PRESET_SLOTS).uuid(), None);
        assert_eq!(Attribute::Preset(255).uuid(), None);
        assert_eq!(Attribute::PresetName(255).uuid(), None);

        // Indices never alias a neighbouring attribute
        let preset = Attribute::Preset(0).uuid().unwrap();
        assert_ne!(Attribute::Unknown(1).uuid(), Some(preset));
        assert_eq!(Attribute::from_uuid(preset), Some(Attribute::Preset(0)));
    }
}
