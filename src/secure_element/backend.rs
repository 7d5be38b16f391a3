use std::fmt;

use rand::RngCore;

use super::errors::Result;
use super::keys::{SlotValue, KEY_SIZE};
use crate::pkcs11::ObjectHandle;

/// Which crypto implementation a secure element runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Software,
    Hardware,
}

impl BackendKind {
    /// Activation modes the backend supports
    pub fn activation_modes(self) -> &'static [&'static str] {
        match self {
            BackendKind::Software | BackendKind::Hardware => &["ABP", "OTAA"],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Software => write!(f, "software"),
            BackendKind::Hardware => write!(f, "hardware"),
        }
    }
}

/// Outcome of a key derivation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DerivedKey<S> {
    /// Clear key value, stored through the regular set-key path
    Raw([u8; KEY_SIZE]),
    /// Key that stays inside the backend, stored as the slot value
    Stored(S),
}

/// Source of random numbers when no backend RNG is available
pub trait RandomSource: Send {
    fn next_u32(&mut self) -> u32;
}

/// Stand-in for the radio's wideband RSSI random generator
#[derive(Debug, Default)]
pub struct RadioRng;

impl RandomSource for RadioRng {
    fn next_u32(&mut self) -> u32 {
        rand::thread_rng().next_u32()
    }
}

/// Crypto operations over key slot values. Exactly one backend is wired into
/// a secure element, chosen when it is constructed.
pub trait CryptoBackend: Send {
    /// What a key slot holds for this backend
    type Slot: SlotValue;

    const KIND: BackendKind;

    /// Brings up the backend; runs once before any keyed operation
    fn start(&mut self) -> Result<()>;

    /// AES-128 ECB over `input` (a multiple of 16 bytes) into `output`
    fn aes_encrypt(&mut self, key: &Self::Slot, input: &[u8], output: &mut [u8]) -> Result<()>;

    /// AES-CMAC of `prefix || buffer`
    fn compute_cmac(
        &mut self,
        key: &Self::Slot,
        prefix: Option<&[u8; 16]>,
        buffer: &[u8],
    ) -> Result<[u8; 16]>;

    /// New key = AES-128-ECB(root, input)
    fn derive_key(&mut self, root: &Self::Slot, input: &[u8; 16]) -> Result<DerivedKey<Self::Slot>>;

    /// Slot value for a clear key, `None` when the backend only takes keys
    /// through derivation
    fn import_key(&self, key: &[u8; KEY_SIZE]) -> Option<Self::Slot>;

    /// Slot value for a pre-provisioned HSM object, `None` when the backend
    /// has no object store
    fn handle_slot(&self, handle: ObjectHandle) -> Option<Self::Slot>;

    /// Loads a clear key into the backend and returns the slot value for it
    fn provision(&mut self, key: &[u8; KEY_SIZE]) -> Result<Self::Slot>;

    fn random_number(&mut self) -> u32;

    /// Frees the backend storage behind a slot value that is about to be
    /// replaced by a derivation
    fn release_key(&mut self, _slot: &Self::Slot) -> Result<()> {
        Ok(())
    }

    /// Destroys every derived key object; nothing to do without an object store
    fn delete_derived_keys(&mut self) -> Result<()> {
        Ok(())
    }
}
