//! LoRaWAN Secure Element
//!
//! Owns every symmetric key of the device and performs the MIC, encryption
//! and key derivation operations the MAC layer needs. Keys never leave the
//! element; callers refer to them by [`KeyIdentifier`].
//!
//! The crypto backend is picked once, when the element is constructed:
//! [`SoftBackend`] keeps raw keys in memory, [`HsmBackend`] keeps handles to
//! objects living in a PKCS#11 token.

pub mod backend;
pub mod errors;
pub mod hsm;
pub mod keys;
pub mod soft;

pub use backend::{BackendKind, CryptoBackend, DerivedKey, RadioRng, RandomSource};
pub use errors::{Result, SecureElementError};
pub use hsm::HsmBackend;
pub use keys::{KeyIdentifier, KeyStore, RawKey, SlotValue, KEY_SIZE, NUM_OF_KEYS};
pub use soft::SoftBackend;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, info};

use crate::lorawan::Version;
use crate::pkcs11::ObjectHandle;

/// Called whenever persisted state changes
pub type ChangeNotify = Box<dyn FnMut() + Send>;

const EUI_SIZE: usize = 8;

pub struct SecureElement<B: CryptoBackend> {
    backend: B,
    dev_eui: [u8; EUI_SIZE],
    join_eui: [u8; EUI_SIZE],
    keys: KeyStore<B::Slot>,
    notify: ChangeNotify,
}

impl<B: CryptoBackend> SecureElement<B> {
    /// Size of the blob returned by [`SecureElement::nvm_context`]
    pub const NVM_CONTEXT_SIZE: usize = 2 * EUI_SIZE + KeyStore::<B::Slot>::SNAPSHOT_SIZE;

    /// Starts the backend and populates the slot catalog. A backend that
    /// cannot start yields [`SecureElementError::Startup`].
    pub fn init(mut backend: B, notify: Option<ChangeNotify>) -> Result<Self> {
        backend.start()?;
        info!(
            "Secure element ready: {} backend, {} key slots, activation {}",
            B::KIND,
            NUM_OF_KEYS,
            B::KIND.activation_modes().join("/")
        );
        Ok(Self {
            backend,
            dev_eui: [0; EUI_SIZE],
            join_eui: [0; EUI_SIZE],
            keys: KeyStore::new(),
            notify: notify.unwrap_or_else(|| Box::new(|| {})),
        })
    }

    pub fn kind(&self) -> BackendKind {
        B::KIND
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn keys(&self) -> &KeyStore<B::Slot> {
        &self.keys
    }

    /// Stores a 16-byte key. Group multicast keys arrive encrypted and are
    /// decrypted under McKEKey before storage. A backend that only takes
    /// keys through derivation accepts the call without changing anything.
    pub fn set_key(&mut self, id: KeyIdentifier, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(SecureElementError::NullArgument);
        }
        self.keys.lookup(id)?;
        let key: &[u8; KEY_SIZE] = key
            .try_into()
            .map_err(|_| SecureElementError::BufferSize)?;

        let Some(mut value) = self.backend.import_key(key) else {
            debug!("Key {} is populated through derivation on this backend", id);
            return Ok(());
        };

        if id.is_group_key() {
            let mut decrypted = [0u8; KEY_SIZE];
            let kek = *self.keys.lookup(KeyIdentifier::McKeKey)?;
            self.backend.aes_encrypt(&kek, key, &mut decrypted)?;
            if let Some(imported) = self.backend.import_key(&decrypted) {
                value = imported;
            }
        }

        self.keys.set(id, value)?;
        (self.notify)();
        Ok(())
    }

    /// Points a slot at an object already provisioned in the HSM
    pub fn set_object_handle(&mut self, id: KeyIdentifier, handle: ObjectHandle) -> Result<()> {
        let value = self
            .backend
            .handle_slot(handle)
            .ok_or(soft::NO_OBJECT_STORE)?;
        self.keys.set(id, value)?;
        (self.notify)();
        Ok(())
    }

    /// Loads a clear root key into the backend's own storage and records it
    /// in the slot
    pub fn provision_key(&mut self, id: KeyIdentifier, key: &[u8; KEY_SIZE]) -> Result<()> {
        self.keys.lookup(id)?;
        let value = self.backend.provision(key)?;
        self.keys.set(id, value)?;
        (self.notify)();
        Ok(())
    }

    /// 32-bit MIC over `prefix || buffer`: the first four bytes of the CMAC
    /// tag, little-endian
    pub fn compute_aes_cmac(
        &mut self,
        prefix: Option<&[u8; 16]>,
        buffer: &[u8],
        id: KeyIdentifier,
    ) -> Result<u32> {
        if id.is_group_key() {
            return Err(SecureElementError::InvalidKeyIdentifier);
        }
        let key = *self.keys.lookup(id)?;
        let tag = self.backend.compute_cmac(&key, prefix, buffer)?;
        Ok(u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]))
    }

    pub fn verify_aes_cmac(&mut self, buffer: &[u8], expected: u32, id: KeyIdentifier) -> Result<()> {
        if buffer.is_empty() {
            return Err(SecureElementError::NullArgument);
        }
        let computed = self.compute_aes_cmac(None, buffer, id)?;
        if computed != expected {
            return Err(SecureElementError::MicMismatch);
        }
        Ok(())
    }

    /// AES-128 ECB of `buffer` under key `id`
    pub fn aes_encrypt(&mut self, buffer: &[u8], id: KeyIdentifier) -> Result<Vec<u8>> {
        if buffer.is_empty() {
            return Err(SecureElementError::NullArgument);
        }
        if buffer.len() % 16 != 0 {
            return Err(SecureElementError::BufferSize);
        }
        let key = *self.keys.lookup(id)?;
        let mut out = vec![0u8; buffer.len()];
        self.backend.aes_encrypt(&key, buffer, &mut out)?;
        Ok(out)
    }

    /// Derives `target = AES-128-ECB(root, input)` and stores it
    pub fn derive_and_store_key(
        &mut self,
        version: Version,
        input: &[u8],
        root: KeyIdentifier,
        target: KeyIdentifier,
    ) -> Result<()> {
        if input.is_empty() {
            return Err(SecureElementError::NullArgument);
        }
        let input: &[u8; 16] = input
            .try_into()
            .map_err(|_| SecureElementError::BufferSize)?;

        // McKEKey may only come from McRootKey, or from AppKey on 1.1+
        if target == KeyIdentifier::McKeKey
            && ((root == KeyIdentifier::AppKey && version.minor == 0)
                || root == KeyIdentifier::NwkKey)
        {
            return Err(SecureElementError::InvalidKeyIdentifier);
        }

        let previous = *self.keys.lookup(target)?;
        let root_key = *self.keys.lookup(root)?;
        if previous != B::Slot::default() && previous != root_key {
            self.backend.release_key(&previous)?;
            self.keys.set(target, B::Slot::default())?;
        }
        match self.backend.derive_key(&root_key, input)? {
            DerivedKey::Raw(key) => self.set_key(target, &key),
            DerivedKey::Stored(value) => {
                self.keys.set(target, value)?;
                (self.notify)();
                Ok(())
            }
        }
    }

    pub fn random_number(&mut self) -> u32 {
        self.backend.random_number()
    }

    pub fn delete_derived_keys(&mut self) -> Result<()> {
        self.backend.delete_derived_keys()
    }

    pub fn set_dev_eui(&mut self, dev_eui: [u8; EUI_SIZE]) {
        self.dev_eui = dev_eui;
        (self.notify)();
    }

    pub fn dev_eui(&self) -> [u8; EUI_SIZE] {
        self.dev_eui
    }

    pub fn set_join_eui(&mut self, join_eui: [u8; EUI_SIZE]) {
        self.join_eui = join_eui;
        (self.notify)();
    }

    pub fn join_eui(&self) -> [u8; EUI_SIZE] {
        self.join_eui
    }

    /// Whole persisted state: DevEui, JoinEui, then the slot records
    pub fn nvm_context(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::NVM_CONTEXT_SIZE);
        buf.put_slice(&self.dev_eui);
        buf.put_slice(&self.join_eui);
        self.keys.snapshot(&mut buf);
        buf.freeze()
    }

    pub fn nvm_context_size(&self) -> usize {
        Self::NVM_CONTEXT_SIZE
    }

    /// Replaces the whole state from a blob produced by
    /// [`SecureElement::nvm_context`] on the same backend kind
    pub fn restore_nvm_context(&mut self, blob: &[u8]) -> Result<()> {
        if blob.is_empty() {
            return Err(SecureElementError::NullArgument);
        }
        if blob.len() != Self::NVM_CONTEXT_SIZE {
            return Err(SecureElementError::BufferSize);
        }
        let mut buf = blob;
        let mut dev_eui = [0u8; EUI_SIZE];
        let mut join_eui = [0u8; EUI_SIZE];
        buf.copy_to_slice(&mut dev_eui);
        buf.copy_to_slice(&mut join_eui);
        self.keys.restore(buf)?;
        self.dev_eui = dev_eui;
        self.join_eui = join_eui;
        Ok(())
    }
}
