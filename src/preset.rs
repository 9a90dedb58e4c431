use bytes::Bytes;

use crate::{
    error::{DecodeError, EncodeError, MountError, Result},
    protocol::{self, Attribute, Field, PresetRecord, PRESET_SLOTS},
    types::Preset,
    variant::ProtocolVariant,
};

/// Wire payloads needed to persist one preset slot
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetWrite {
    /// Slot being written
    pub index: u8,
    /// Encoded preset record
    pub record: Bytes,
    /// Encoded overflow name, when the slot's name reaches the overflow field
    pub overflow: Option<Bytes>,
}

/// In-memory mirror of the seven preset slots
///
/// Slot indices are stable. Deleting a preset clears its exists flag and
/// keeps the stale values until the slot is overwritten.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresetStore {
    slots: Vec<Preset>,
}

impl Default for PresetStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PresetStore {
    /// Store with every slot empty
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: (0..PRESET_SLOTS).map(Preset::empty).collect(),
        }
    }

    /// Replace every slot from decoded records and their overflow names
    ///
    /// `overflow` may be shorter than `records` (or empty for dialects
    /// without an overflow field).
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidUtf8`] if a coalesced name is not UTF-8.
    pub fn load(
        &mut self,
        records: &[PresetRecord],
        overflow: &[Vec<u8>],
        variant: ProtocolVariant,
    ) -> std::result::Result<(), DecodeError> {
        let mut staged = Self::new();
        for (index, record) in (0..PRESET_SLOTS).zip(records) {
            let extra = overflow.get(usize::from(index)).map(Vec::as_slice);
            staged.load_slot(index, record, extra, variant)?;
        }
        *self = staged;
        Ok(())
    }

    /// Replace one slot from a decoded record
    ///
    /// # Errors
    ///
    /// Returns [`DecodeError::InvalidUtf8`] if the coalesced name is not UTF-8.
    pub fn load_slot(
        &mut self,
        index: u8,
        record: &PresetRecord,
        overflow: Option<&[u8]>,
        variant: ProtocolVariant,
    ) -> std::result::Result<(), DecodeError> {
        let Some(slot) = self.slots.get_mut(usize::from(index)) else {
            return Ok(());
        };
        let name = coalesce_name(record, overflow, variant)
            .map_err(|_| DecodeError::InvalidUtf8(Attribute::Preset(index)))?;

        *slot = Preset {
            slot_index: index,
            exists: record.exists,
            distance: record.distance,
            rotation: record.rotation,
            name,
        };
        Ok(())
    }

    /// Slot at `index`, existing or not
    #[must_use]
    pub fn get(&self, index: u8) -> Option<&Preset> {
        self.slots.get(usize::from(index))
    }

    /// All slots in index order
    #[must_use]
    pub fn slots(&self) -> &[Preset] {
        &self.slots
    }

    /// First slot without a preset
    #[must_use]
    pub fn first_free(&self) -> Option<u8> {
        self.slots.iter().find(|p| !p.exists).map(|p| p.slot_index)
    }

    /// Existing presets in slot order
    #[must_use]
    pub fn selections_snapshot(&self) -> Vec<Preset> {
        self.slots.iter().filter(|p| p.exists).cloned().collect()
    }

    /// Claim the first free slot for a new preset
    ///
    /// # Errors
    ///
    /// Returns [`MountError::NoFreeSlot`] when all slots are occupied, or a
    /// validation error for out-of-range values. The store is unchanged on error.
    pub fn add(
        &mut self,
        name: &str,
        distance: u8,
        rotation: i8,
        variant: ProtocolVariant,
    ) -> Result<u8> {
        validate_position(distance, rotation)?;
        validate_name(name, variant)?;
        let index = self.first_free().ok_or(MountError::NoFreeSlot)?;
        self.fill(index, name, distance, rotation);
        Ok(index)
    }

    /// Create a preset in a specific empty slot
    ///
    /// # Errors
    ///
    /// Returns [`MountError::SlotOccupied`] if the slot already holds a preset.
    pub fn add_at(
        &mut self,
        index: u8,
        name: &str,
        distance: u8,
        rotation: i8,
        variant: ProtocolVariant,
    ) -> Result<()> {
        validate_position(distance, rotation)?;
        validate_name(name, variant)?;
        if self.slot(index)?.exists {
            return Err(MountError::SlotOccupied(index));
        }
        self.fill(index, name, distance, rotation);
        Ok(())
    }

    /// Logically delete the preset at `index`
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PresetNotFound`] if the slot is already empty.
    pub fn delete(&mut self, index: u8) -> Result<()> {
        self.existing_mut(index)?.exists = false;
        Ok(())
    }

    /// Rename an existing preset
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PresetNotFound`] or a name validation error.
    pub fn set_name(&mut self, index: u8, name: &str, variant: ProtocolVariant) -> Result<()> {
        validate_name(name, variant)?;
        self.existing_mut(index)?.name = name.to_string();
        Ok(())
    }

    /// Change the distance of an existing preset
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PresetNotFound`] or [`MountError::InvalidParameters`].
    pub fn set_distance(&mut self, index: u8, distance: u8) -> Result<()> {
        validate_position(distance, 0)?;
        self.existing_mut(index)?.distance = distance;
        Ok(())
    }

    /// Change the rotation of an existing preset
    ///
    /// # Errors
    ///
    /// Returns [`MountError::PresetNotFound`] or [`MountError::InvalidParameters`].
    pub fn set_rotation(&mut self, index: u8, rotation: i8) -> Result<()> {
        validate_position(0, rotation)?;
        self.existing_mut(index)?.rotation = rotation;
        Ok(())
    }

    /// Encode the slot's record and, where needed, its overflow name
    ///
    /// # Errors
    ///
    /// Returns [`MountError::InvalidParameters`] for an index beyond the
    /// last slot, or an encode error if the slot's values do not fit.
    pub fn encode_slot(&self, index: u8, variant: ProtocolVariant) -> Result<PresetWrite> {
        let preset = self.slot(index)?;
        let name = preset.name.as_bytes();
        let split = name.len().min(variant.primary_name_len());

        let record = PresetRecord {
            exists: preset.exists,
            distance: preset.distance,
            rotation: preset.rotation,
            name: if preset.exists || variant.has_exists_flag() {
                name[..split].to_vec()
            } else {
                Vec::new()
            },
        };
        let record = protocol::encode(
            Attribute::Preset(index),
            &Field::PresetRecord(record),
            variant,
        )?;

        // The overflow field is only read back when the primary field is full
        let overflow = match variant.overflow_name_len() {
            Some(_) if preset.exists && name.len() >= variant.primary_name_len() => {
                Some(protocol::encode(
                    Attribute::PresetName(index),
                    &Field::PresetOverflow(name[split..].to_vec()),
                    variant,
                )?)
            }
            _ => None,
        };

        Ok(PresetWrite {
            index,
            record,
            overflow,
        })
    }

    fn fill(&mut self, index: u8, name: &str, distance: u8, rotation: i8) {
        if let Some(slot) = self.slots.get_mut(usize::from(index)) {
            *slot = Preset {
                slot_index: index,
                exists: true,
                distance,
                rotation,
                name: name.to_string(),
            };
        }
    }

    fn slot(&self, index: u8) -> Result<&Preset> {
        self.slots
            .get(usize::from(index))
            .ok_or_else(|| invalid_index(index))
    }

    fn existing_mut(&mut self, index: u8) -> Result<&mut Preset> {
        let slot = self
            .slots
            .get_mut(usize::from(index))
            .ok_or_else(|| invalid_index(index))?;
        if !slot.exists {
            return Err(MountError::PresetNotFound(index));
        }
        Ok(slot)
    }
}

fn invalid_index(index: u8) -> MountError {
    MountError::InvalidParameters(format!(
        "preset index {index} outside 0..{PRESET_SLOTS}"
    ))
}

fn validate_position(distance: u8, rotation: i8) -> Result<()> {
    if distance > 100 {
        return Err(MountError::InvalidParameters(format!(
            "distance {distance} outside 0..=100"
        )));
    }
    if !(-100..=100).contains(&rotation) {
        return Err(MountError::InvalidParameters(format!(
            "rotation {rotation} outside -100..=100"
        )));
    }
    Ok(())
}

fn validate_name(name: &str, variant: ProtocolVariant) -> Result<()> {
    if name.is_empty() {
        return Err(EncodeError::EmptyName.into());
    }
    if name.contains('\0') {
        return Err(EncodeError::NulInName.into());
    }
    if name.len() > variant.max_preset_name_len() {
        return Err(EncodeError::NameTooLong {
            len: name.len(),
            max: variant.max_preset_name_len(),
        }
        .into());
    }
    Ok(())
}

fn coalesce_name(
    record: &PresetRecord,
    overflow: Option<&[u8]>,
    variant: ProtocolVariant,
) -> std::result::Result<String, std::string::FromUtf8Error> {
    let mut bytes = record.name.clone();
    if bytes.len() >= variant.primary_name_len() {
        if let Some(extra) = overflow {
            bytes.extend_from_slice(extra);
        }
    }
    String::from_utf8(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MODERN: ProtocolVariant = ProtocolVariant::Modern;
    const LEGACY: ProtocolVariant = ProtocolVariant::Legacy;

    fn record(name: &[u8]) -> PresetRecord {
        PresetRecord {
            exists: true,
            distance: 40,
            rotation: -20,
            name: name.to_vec(),
        }
    }

    #[test]
    fn test_add_claims_first_free_slot() {
        let mut store = PresetStore::new();
        store
            .load(&[record(b"A"), PresetRecord::default(), record(b"C")], &[], MODERN)
            .unwrap();

        let index = store.add("Movie", 80, 10, MODERN).unwrap();
        assert_eq!(index, 1);
        let index = store.add("Game", 60, 0, MODERN).unwrap();
        assert_eq!(index, 3);
    }

    #[test]
    fn test_add_never_reuses_existing_slot() {
        let mut store = PresetStore::new();
        let mut claimed = Vec::new();
        for n in 0..PRESET_SLOTS {
            let index = store.add(&format!("P{n}"), n * 10, 0, MODERN).unwrap();
            assert!(!claimed.contains(&index));
            claimed.push(index);
        }
        assert_eq!(claimed, vec![0, 1, 2, 3, 4, 5, 6]);
    }

    #[test]
    fn test_eighth_add_fails_without_changes() {
        let mut store = PresetStore::new();
        for n in 0..PRESET_SLOTS {
            store.add(&format!("P{n}"), n, 0, MODERN).unwrap();
        }
        let before = store.clone();

        let result = store.add("Overflow", 50, 50, MODERN);
        assert!(matches!(result, Err(MountError::NoFreeSlot)));
        assert_eq!(store, before);
    }

    #[test]
    fn test_delete_then_reuse() {
        let mut store = PresetStore::new();
        for n in 0..3 {
            store.add(&format!("P{n}"), 10, 0, MODERN).unwrap();
        }

        store.delete(1).unwrap();
        let deleted = store.get(1).unwrap();
        assert!(!deleted.exists);
        // Stale values remain until overwritten
        assert_eq!(deleted.name, "P1");
        assert_eq!(store.selections_snapshot().len(), 2);

        assert_eq!(store.add("Reused", 30, 5, MODERN).unwrap(), 1);
        assert!(matches!(store.delete(4), Err(MountError::PresetNotFound(4))));
    }

    #[test]
    fn test_add_at_rejects_occupied_slot() {
        let mut store = PresetStore::new();
        store.add_at(5, "Five", 50, 0, MODERN).unwrap();
        assert!(matches!(
            store.add_at(5, "Again", 50, 0, MODERN),
            Err(MountError::SlotOccupied(5))
        ));
        assert!(store.add_at(7, "Nope", 50, 0, MODERN).is_err());
    }

    #[test]
    fn test_setters_require_existing_preset() {
        let mut store = PresetStore::new();
        assert!(matches!(
            store.set_distance(0, 10),
            Err(MountError::PresetNotFound(0))
        ));

        store.add("Desk", 10, 10, MODERN).unwrap();
        store.set_name(0, "Couch", MODERN).unwrap();
        store.set_distance(0, 90).unwrap();
        store.set_rotation(0, -90).unwrap();

        let preset = store.get(0).unwrap();
        assert_eq!(preset.name, "Couch");
        assert_eq!((preset.distance, preset.rotation), (90, -90));
        assert!(store.set_rotation(0, 101).is_err());
    }

    #[test]
    fn test_name_limits_follow_dialect() {
        let mut store = PresetStore::new();
        let long = "a".repeat(25);
        assert!(store.add(&long, 10, 0, MODERN).is_ok());
        assert!(matches!(
            store.add(&long, 10, 0, LEGACY),
            Err(MountError::Encode(EncodeError::NameTooLong { max: 20, .. }))
        ));
        assert!(store.add("", 10, 0, MODERN).is_err());
    }

    #[test]
    fn test_nul_in_name_is_rejected() {
        let mut store = PresetStore::new();
        assert!(matches!(
            store.add("Kitchen\0", 10, 0, MODERN),
            Err(MountError::Encode(EncodeError::NulInName))
        ));
        assert!(store.selections_snapshot().is_empty());
        assert_eq!(store.first_free(), Some(0));

        store.add("Kitchen", 10, 0, MODERN).unwrap();
        assert!(store.set_name(0, "Kit\0chen", LEGACY).is_err());
        assert_eq!(store.get(0).unwrap().name, "Kitchen");
    }

    #[test]
    fn test_overflow_name_is_coalesced() {
        let mut store = PresetStore::new();
        let primary = b"Living room lef";
        store
            .load(&[record(primary)], &[b"t corner".to_vec()], MODERN)
            .unwrap();
        assert_eq!(store.get(0).unwrap().name, "Living room left corner");

        // A short primary name ignores whatever the overflow field holds
        store
            .load(&[record(b"Desk")], &[b"stale".to_vec()], MODERN)
            .unwrap();
        assert_eq!(store.get(0).unwrap().name, "Desk");
    }

    #[test]
    fn test_encode_slot_splits_long_name() {
        let mut store = PresetStore::new();
        let index = store
            .add("Living room left corner", 40, -20, MODERN)
            .unwrap();
        let write = store.encode_slot(index, MODERN).unwrap();

        assert_eq!(write.record.len(), 20);
        assert_eq!(&write.record[5..], b"Living room lef");
        let overflow = write.overflow.unwrap();
        assert_eq!(overflow.len(), 17);
        assert_eq!(&overflow[..8], b"t corner");

        let decoded = protocol::decode_preset_record(&write.record, MODERN).unwrap();
        let mut reloaded = PresetStore::new();
        reloaded
            .load(&[decoded], &[overflow[..8].to_vec()], MODERN)
            .unwrap();
        assert_eq!(reloaded.get(0), store.get(0));
    }

    #[test]
    fn test_encode_slot_short_name_skips_overflow() {
        let mut store = PresetStore::new();
        store.add("Desk", 40, 0, MODERN).unwrap();
        assert!(store.encode_slot(0, MODERN).unwrap().overflow.is_none());

        store.add("Kitchen", 40, 0, LEGACY).unwrap();
        let write = store.encode_slot(1, LEGACY).unwrap();
        assert_eq!(write.record.len(), 24);
        assert!(write.overflow.is_none());
    }

    #[test]
    fn test_encode_deleted_slot() {
        let mut store = PresetStore::new();
        store.add("Desk", 40, 10, MODERN).unwrap();
        store.delete(0).unwrap();

        let modern = store.encode_slot(0, MODERN).unwrap();
        assert_eq!(modern.record[0], 0);
        assert!(modern.overflow.is_none());

        let legacy = store.encode_slot(0, LEGACY).unwrap();
        assert!(legacy.record.iter().all(|b| *b == 0));
    }
}
