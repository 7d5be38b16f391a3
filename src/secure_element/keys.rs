//! Key slot catalog
//!
//! Every key the device owns lives in one of [`NUM_OF_KEYS`] slots, indexed
//! by a [`KeyIdentifier`]. Depending on the backend a slot carries either the
//! raw key bytes or a handle to an object living inside the HSM.

use std::fmt;

use bytes::{Buf, BufMut};

use super::errors::{Result, SecureElementError};
use crate::lorawan::GroupId;
use crate::pkcs11::ObjectHandle;

/// Number of slots in the catalog
pub const NUM_OF_KEYS: usize = 24;

/// AES-128 key length
pub const KEY_SIZE: usize = 16;

/// Identifier of a key slot. Values match the LoRaWAN stack numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum KeyIdentifier {
    AppKey = 0,
    GenAppKey = 1,
    NwkKey = 2,
    JSIntKey = 3,
    JSEncKey = 4,
    FNwkSIntKey = 5,
    SNwkSIntKey = 6,
    NwkSEncKey = 7,
    AppSKey = 8,
    McRootKey = 9,
    McKeKey = 127,
    McKey0 = 128,
    McAppSKey0 = 129,
    McNwkSKey0 = 130,
    McKey1 = 131,
    McAppSKey1 = 132,
    McNwkSKey1 = 133,
    McKey2 = 134,
    McAppSKey2 = 135,
    McNwkSKey2 = 136,
    McKey3 = 137,
    McAppSKey3 = 138,
    McNwkSKey3 = 139,
    SlotRandZeroKey = 140,
}

impl KeyIdentifier {
    /// Slot order of a freshly initialized store
    pub const CATALOG: [KeyIdentifier; NUM_OF_KEYS] = [
        KeyIdentifier::AppKey,
        KeyIdentifier::GenAppKey,
        KeyIdentifier::NwkKey,
        KeyIdentifier::JSIntKey,
        KeyIdentifier::JSEncKey,
        KeyIdentifier::FNwkSIntKey,
        KeyIdentifier::SNwkSIntKey,
        KeyIdentifier::NwkSEncKey,
        KeyIdentifier::AppSKey,
        KeyIdentifier::McRootKey,
        KeyIdentifier::McKeKey,
        KeyIdentifier::McKey0,
        KeyIdentifier::McAppSKey0,
        KeyIdentifier::McNwkSKey0,
        KeyIdentifier::McKey1,
        KeyIdentifier::McAppSKey1,
        KeyIdentifier::McNwkSKey1,
        KeyIdentifier::McKey2,
        KeyIdentifier::McAppSKey2,
        KeyIdentifier::McNwkSKey2,
        KeyIdentifier::McKey3,
        KeyIdentifier::McAppSKey3,
        KeyIdentifier::McNwkSKey3,
        KeyIdentifier::SlotRandZeroKey,
    ];

    /// Encrypted per-group multicast keys. They are never used directly for
    /// frame authentication.
    pub fn is_group_key(self) -> bool {
        matches!(
            self,
            KeyIdentifier::McKey0
                | KeyIdentifier::McKey1
                | KeyIdentifier::McKey2
                | KeyIdentifier::McKey3
        )
    }

    pub fn mc_key(group: GroupId) -> Self {
        [
            KeyIdentifier::McKey0,
            KeyIdentifier::McKey1,
            KeyIdentifier::McKey2,
            KeyIdentifier::McKey3,
        ][group.index()]
    }

    pub fn mc_app_s_key(group: GroupId) -> Self {
        [
            KeyIdentifier::McAppSKey0,
            KeyIdentifier::McAppSKey1,
            KeyIdentifier::McAppSKey2,
            KeyIdentifier::McAppSKey3,
        ][group.index()]
    }

    pub fn mc_nwk_s_key(group: GroupId) -> Self {
        [
            KeyIdentifier::McNwkSKey0,
            KeyIdentifier::McNwkSKey1,
            KeyIdentifier::McNwkSKey2,
            KeyIdentifier::McNwkSKey3,
        ][group.index()]
    }
}

impl TryFrom<u8> for KeyIdentifier {
    type Error = SecureElementError;

    fn try_from(value: u8) -> Result<Self> {
        KeyIdentifier::CATALOG
            .iter()
            .copied()
            .find(|id| *id as u8 == value)
            .ok_or(SecureElementError::InvalidKeyIdentifier)
    }
}

impl fmt::Display for KeyIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Raw AES-128 key held in clear by the software backend
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct RawKey(pub [u8; KEY_SIZE]);

impl fmt::Debug for RawKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RawKey(..)")
    }
}

/// Content of a key slot, with its fixed-width persisted encoding
pub trait SlotValue: Copy + Default + PartialEq + fmt::Debug + Send {
    /// Bytes one value takes in the NVM blob
    const WIDTH: usize;

    fn encode(&self, buf: &mut impl BufMut);

    /// `buf` holds at least `WIDTH` bytes
    fn decode(buf: &mut impl Buf) -> Self;
}

impl SlotValue for RawKey {
    const WIDTH: usize = KEY_SIZE;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_slice(&self.0);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        let mut key = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut key);
        RawKey(key)
    }
}

impl SlotValue for ObjectHandle {
    const WIDTH: usize = 4;

    fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.0);
    }

    fn decode(buf: &mut impl Buf) -> Self {
        ObjectHandle(buf.get_u32_le())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySlot<S> {
    pub id: KeyIdentifier,
    pub value: S,
}

/// Fixed catalog of key slots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyStore<S> {
    slots: [KeySlot<S>; NUM_OF_KEYS],
}

impl<S: SlotValue> KeyStore<S> {
    /// Bytes of one persisted slot record: identifier + value
    pub const RECORD_SIZE: usize = 1 + S::WIDTH;

    /// Bytes of the whole persisted catalog
    pub const SNAPSHOT_SIZE: usize = NUM_OF_KEYS * Self::RECORD_SIZE;

    pub fn new() -> Self {
        Self {
            slots: KeyIdentifier::CATALOG.map(|id| KeySlot {
                id,
                value: S::default(),
            }),
        }
    }

    /// Linear scan, first match wins
    pub fn lookup(&self, id: KeyIdentifier) -> Result<&S> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| &slot.value)
            .ok_or(SecureElementError::InvalidKeyIdentifier)
    }

    pub fn set(&mut self, id: KeyIdentifier, value: S) -> Result<()> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| slot.id == id)
            .ok_or(SecureElementError::InvalidKeyIdentifier)?;
        slot.value = value;
        Ok(())
    }

    pub fn slots(&self) -> impl Iterator<Item = &KeySlot<S>> {
        self.slots.iter()
    }

    pub fn snapshot(&self, buf: &mut impl BufMut) {
        for slot in &self.slots {
            buf.put_u8(slot.id as u8);
            slot.value.encode(buf);
        }
    }

    /// Replaces every slot from a blob produced by [`KeyStore::snapshot`].
    /// The store is left untouched when the blob is malformed.
    pub fn restore(&mut self, mut buf: impl Buf) -> Result<()> {
        if buf.remaining() < Self::SNAPSHOT_SIZE {
            return Err(SecureElementError::BufferSize);
        }
        let mut restored = self.slots;
        for slot in restored.iter_mut() {
            slot.id = KeyIdentifier::try_from(buf.get_u8())?;
            slot.value = S::decode(&mut buf);
        }
        self.slots = restored;
        Ok(())
    }
}

impl<S: SlotValue> Default for KeyStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_identifiers_are_unique() {
        for (i, a) in KeyIdentifier::CATALOG.iter().enumerate() {
            for b in &KeyIdentifier::CATALOG[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_identifier_numbering() {
        assert_eq!(KeyIdentifier::try_from(127).unwrap(), KeyIdentifier::McKeKey);
        assert_eq!(KeyIdentifier::try_from(139).unwrap(), KeyIdentifier::McNwkSKey3);
        assert_eq!(
            KeyIdentifier::try_from(10),
            Err(SecureElementError::InvalidKeyIdentifier)
        );
    }

    #[test]
    fn test_group_key_helpers() {
        let g2 = GroupId::from_masked(2);
        assert_eq!(KeyIdentifier::mc_key(g2), KeyIdentifier::McKey2);
        assert_eq!(KeyIdentifier::mc_app_s_key(g2), KeyIdentifier::McAppSKey2);
        assert_eq!(KeyIdentifier::mc_nwk_s_key(g2), KeyIdentifier::McNwkSKey2);
        assert!(KeyIdentifier::McKey3.is_group_key());
        assert!(!KeyIdentifier::McAppSKey3.is_group_key());
    }

    #[test]
    fn test_set_and_lookup() {
        let mut store = KeyStore::<RawKey>::new();
        assert_eq!(*store.lookup(KeyIdentifier::NwkKey).unwrap(), RawKey::default());
        store.set(KeyIdentifier::NwkKey, RawKey([0x42; 16])).unwrap();
        assert_eq!(store.lookup(KeyIdentifier::NwkKey).unwrap().0, [0x42; 16]);
        assert_eq!(store.lookup(KeyIdentifier::AppKey).unwrap().0, [0; 16]);
    }

    #[test]
    fn test_snapshot_sizes() {
        let mut raw = Vec::new();
        KeyStore::<RawKey>::new().snapshot(&mut raw);
        assert_eq!(raw.len(), NUM_OF_KEYS * 17);

        let mut handles = Vec::new();
        KeyStore::<ObjectHandle>::new().snapshot(&mut handles);
        assert_eq!(handles.len(), KeyStore::<ObjectHandle>::SNAPSHOT_SIZE);
        assert_eq!(handles.len(), NUM_OF_KEYS * 5);
    }

    #[test]
    fn test_restore_rejects_unknown_identifier() {
        let mut store = KeyStore::<ObjectHandle>::new();
        store.set(KeyIdentifier::AppKey, ObjectHandle(3)).unwrap();
        let mut blob = Vec::new();
        store.snapshot(&mut blob);
        blob[KeyStore::<ObjectHandle>::RECORD_SIZE] = 0xEE;

        let mut target = KeyStore::<ObjectHandle>::new();
        assert_eq!(
            target.restore(&blob[..]),
            Err(SecureElementError::InvalidKeyIdentifier)
        );
        assert_eq!(target, KeyStore::new());
    }

    #[test]
    fn test_restore_short_blob() {
        let mut store = KeyStore::<RawKey>::new();
        assert_eq!(store.restore(&[0u8; 10][..]), Err(SecureElementError::BufferSize));
    }
}
