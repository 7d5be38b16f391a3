//! Hardware crypto backend: every operation runs inside one token session
//! against key object handles

use tracing::{debug, warn};

use super::backend::{BackendKind, CryptoBackend, DerivedKey, RadioRng, RandomSource};
use super::errors::{Result, SecureElementError};
use super::keys::KEY_SIZE;
use crate::pkcs11::{
    KeyTemplate, Mechanism, ObjectHandle, Pkcs11Token, Session, TokenError,
    DERIVED_OBJECT_HANDLES,
};

/// Largest payload the staging buffer accepts after the B0 block
pub const PAYLOAD_MAX_SIZE: usize = 256;

pub struct HsmBackend<T> {
    token: T,
    staging: Vec<u8>,
    fallback_rng: Box<dyn RandomSource>,
}

impl<T: Pkcs11Token> HsmBackend<T> {
    pub fn new(token: T) -> Self {
        Self::with_fallback_rng(token, Box::new(RadioRng))
    }

    pub fn with_fallback_rng(token: T, fallback_rng: Box<dyn RandomSource>) -> Self {
        Self {
            token,
            staging: Vec::with_capacity(PAYLOAD_MAX_SIZE + KEY_SIZE),
            fallback_rng,
        }
    }

    pub fn token(&self) -> &T {
        &self.token
    }

    pub fn token_mut(&mut self) -> &mut T {
        &mut self.token
    }

    /// Copies `prefix || buffer` into the staging buffer
    fn stage(&mut self, prefix: Option<&[u8; 16]>, buffer: &[u8]) -> Result<()> {
        let len = prefix.map_or(0, |p| p.len()) + buffer.len();
        if len > PAYLOAD_MAX_SIZE + KEY_SIZE {
            return Err(SecureElementError::BufferSize);
        }
        self.staging.clear();
        if let Some(b0) = prefix {
            self.staging.extend_from_slice(b0);
        }
        self.staging.extend_from_slice(buffer);
        Ok(())
    }
}

impl<T: Pkcs11Token> CryptoBackend for HsmBackend<T> {
    type Slot = ObjectHandle;

    const KIND: BackendKind = BackendKind::Hardware;

    fn start(&mut self) -> Result<()> {
        self.token
            .initialize()
            .map_err(SecureElementError::Startup)
    }

    fn aes_encrypt(&mut self, key: &ObjectHandle, input: &[u8], output: &mut [u8]) -> Result<()> {
        if input.len() % 16 != 0 || output.len() < input.len() {
            return Err(SecureElementError::BufferSize);
        }
        self.stage(None, input)?;

        let mut session = Session::open(&mut self.token)?;
        session.encrypt_init(Mechanism::AesEcb, *key)?;
        session.encrypt_update(&self.staging, output)?;
        // Releases the operation; ECB produces no trailing bytes
        let mut tail = [0u8; 16];
        session.encrypt_final(&mut tail)?;
        Ok(())
    }

    fn compute_cmac(
        &mut self,
        key: &ObjectHandle,
        prefix: Option<&[u8; 16]>,
        buffer: &[u8],
    ) -> Result<[u8; 16]> {
        // The token accepts a single update per CMAC operation, so the B0
        // block and the payload go in together.
        self.stage(prefix, buffer)?;

        let mut session = Session::open(&mut self.token)?;
        session.encrypt_init(Mechanism::AesCmac, *key)?;
        session.encrypt_update(&self.staging, &mut [])?;
        let mut tag = [0u8; 16];
        session.encrypt_final(&mut tag)?;
        Ok(tag)
    }

    fn derive_key(
        &mut self,
        root: &ObjectHandle,
        input: &[u8; 16],
    ) -> Result<DerivedKey<ObjectHandle>> {
        let mut session = Session::open(&mut self.token)?;
        let derived = session.derive_key(
            Mechanism::AesEcbEncryptData(*input),
            *root,
            &KeyTemplate::DERIVED,
        )?;
        debug!("Derived HSM object {:?} from {:?}", derived, root);
        Ok(DerivedKey::Stored(derived))
    }

    fn import_key(&self, _key: &[u8; KEY_SIZE]) -> Option<ObjectHandle> {
        None
    }

    fn handle_slot(&self, handle: ObjectHandle) -> Option<ObjectHandle> {
        Some(handle)
    }

    fn provision(&mut self, key: &[u8; KEY_SIZE]) -> Result<ObjectHandle> {
        let mut session = Session::open(&mut self.token)?;
        Ok(session.create_object(key, &KeyTemplate::PROVISIONED)?)
    }

    fn random_number(&mut self) -> u32 {
        let mut bytes = [0u8; 4];
        let drawn = Session::open(&mut self.token).and_then(|mut session| session.generate_random(&mut bytes));
        match drawn {
            Ok(()) => u32::from_le_bytes(bytes),
            Err(e) => {
                warn!("HSM random generation failed ({}), using radio RNG", e);
                self.fallback_rng.next_u32()
            }
        }
    }

    fn release_key(&mut self, slot: &ObjectHandle) -> Result<()> {
        if !DERIVED_OBJECT_HANDLES.contains(&slot.0) {
            return Ok(());
        }
        let mut session = Session::open(&mut self.token)?;
        match session.destroy_object(*slot) {
            Ok(()) => debug!("Released derived object {:?}", slot),
            // Already gone, e.g. after DeleteDerivedKeys
            Err(TokenError::ObjectHandleInvalid) => {}
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    fn delete_derived_keys(&mut self) -> Result<()> {
        let mut session = Session::open(&mut self.token)?;
        for handle in DERIVED_OBJECT_HANDLES {
            if let Err(e) = session.destroy_object(ObjectHandle(handle)) {
                debug!("Derived object {} not destroyed: {}", handle, e);
            }
        }
        Ok(())
    }
}
