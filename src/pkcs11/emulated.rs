//! In-process token implementing the Cryptoki subset over the `aes`/`cmac`
//! crates
//!
//! Behaves like the key management service found on STM32WL parts: a small
//! number of serial sessions, derived keys are never extractable, and a CMAC
//! operation accepts a single update call before it has to be finalized.

use std::collections::HashMap;

use aes::Aes128;
use cmac::{Cmac, Mac};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use tracing::debug;

use super::{
    KeyTemplate, Mechanism, ObjectHandle, Pkcs11Token, SessionHandle, TokenError,
    DERIVED_OBJECT_HANDLES,
};
use crate::secure_element::soft::aes_ecb_encrypt;

/// Sessions the token can keep open at the same time
pub const MAX_SESSIONS: usize = 4;

/// First handle given to provisioned objects; derived objects take the
/// lowest free handle of [`DERIVED_OBJECT_HANDLES`]
const FIRST_PROVISIONED_HANDLE: u32 = 1;

struct TokenObject {
    value: [u8; 16],
    template: KeyTemplate,
}

enum ActiveOperation {
    Ecb { key: [u8; 16] },
    Cmac { mac: Box<Cmac<Aes128>>, updated: bool },
}

/// Software emulation of a PKCS#11 token
pub struct EmulatedToken {
    initialized: bool,
    objects: HashMap<ObjectHandle, TokenObject>,
    sessions: HashMap<SessionHandle, Option<ActiveOperation>>,
    next_session: u32,
    next_provisioned: u32,
    rng: StdRng,
    rng_available: bool,
}

impl EmulatedToken {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    /// Deterministic token, for reproducible runs
    pub fn with_seed(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            initialized: false,
            objects: HashMap::new(),
            sessions: HashMap::new(),
            next_session: 1,
            next_provisioned: FIRST_PROVISIONED_HANDLE,
            rng,
            rng_available: true,
        }
    }

    /// Simulates a failing random generator
    pub fn set_rng_available(&mut self, available: bool) {
        self.rng_available = available;
    }

    pub fn open_sessions(&self) -> usize {
        self.sessions.len()
    }

    pub fn contains_object(&self, object: ObjectHandle) -> bool {
        self.objects.contains_key(&object)
    }

    /// Reads a key value back (C_GetAttributeValue on CKA_VALUE)
    pub fn key_value(&self, object: ObjectHandle) -> Result<[u8; 16], TokenError> {
        let obj = self
            .objects
            .get(&object)
            .ok_or(TokenError::ObjectHandleInvalid)?;
        if !obj.template.extractable {
            return Err(TokenError::AttributeSensitive);
        }
        Ok(obj.value)
    }

    fn check_session(&self, session: SessionHandle) -> Result<(), TokenError> {
        if !self.initialized {
            return Err(TokenError::CryptokiNotInitialized);
        }
        if !self.sessions.contains_key(&session) {
            return Err(TokenError::SessionHandleInvalid);
        }
        Ok(())
    }

    fn key_for_encrypt(&self, key: ObjectHandle) -> Result<[u8; 16], TokenError> {
        let obj = self
            .objects
            .get(&key)
            .ok_or(TokenError::ObjectHandleInvalid)?;
        if !obj.template.encrypt {
            return Err(TokenError::KeyFunctionNotPermitted);
        }
        Ok(obj.value)
    }

    fn operation(&mut self, session: SessionHandle) -> Result<&mut Option<ActiveOperation>, TokenError> {
        self.sessions
            .get_mut(&session)
            .ok_or(TokenError::SessionHandleInvalid)
    }
}

impl Default for EmulatedToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Pkcs11Token for EmulatedToken {
    fn initialize(&mut self) -> Result<(), TokenError> {
        if self.initialized {
            return Err(TokenError::CryptokiAlreadyInitialized);
        }
        self.initialized = true;
        Ok(())
    }

    fn open_session(&mut self) -> Result<SessionHandle, TokenError> {
        if !self.initialized {
            return Err(TokenError::CryptokiNotInitialized);
        }
        if self.sessions.len() >= MAX_SESSIONS {
            return Err(TokenError::SessionCount);
        }
        let handle = SessionHandle(self.next_session);
        self.next_session = self.next_session.wrapping_add(1).max(1);
        self.sessions.insert(handle, None);
        Ok(handle)
    }

    fn close_session(&mut self, session: SessionHandle) -> Result<(), TokenError> {
        self.sessions
            .remove(&session)
            .map(|_| ())
            .ok_or(TokenError::SessionHandleInvalid)
    }

    fn create_object(
        &mut self,
        session: SessionHandle,
        value: &[u8; 16],
        template: &KeyTemplate,
    ) -> Result<ObjectHandle, TokenError> {
        self.check_session(session)?;
        if self.next_provisioned >= *DERIVED_OBJECT_HANDLES.start() {
            return Err(TokenError::DeviceMemory);
        }
        let handle = ObjectHandle(self.next_provisioned);
        self.next_provisioned += 1;
        self.objects.insert(
            handle,
            TokenObject {
                value: *value,
                template: *template,
            },
        );
        Ok(handle)
    }

    fn encrypt_init(
        &mut self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> Result<(), TokenError> {
        self.check_session(session)?;
        if self.operation(session)?.is_some() {
            return Err(TokenError::OperationActive);
        }
        let key = self.key_for_encrypt(key)?;
        let op = match mechanism {
            Mechanism::AesEcb => ActiveOperation::Ecb { key },
            Mechanism::AesCmac => {
                let mac = <Cmac<Aes128> as Mac>::new_from_slice(&key)
                    .map_err(|_| TokenError::DataLenRange)?;
                ActiveOperation::Cmac {
                    mac: Box::new(mac),
                    updated: false,
                }
            }
            Mechanism::AesEcbEncryptData(_) => return Err(TokenError::MechanismInvalid),
        };
        *self.operation(session)? = Some(op);
        Ok(())
    }

    fn encrypt_update(
        &mut self,
        session: SessionHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TokenError> {
        self.check_session(session)?;
        match self.operation(session)? {
            None => Err(TokenError::OperationNotInitialized),
            Some(ActiveOperation::Ecb { key }) => {
                if input.len() % 16 != 0 {
                    return Err(TokenError::DataLenRange);
                }
                if output.len() < input.len() {
                    return Err(TokenError::BufferTooSmall);
                }
                aes_ecb_encrypt(key, input, &mut output[..input.len()]);
                Ok(input.len())
            }
            Some(ActiveOperation::Cmac { mac, updated }) => {
                // a second update on the same CMAC operation is refused
                if *updated {
                    return Err(TokenError::OperationActive);
                }
                mac.update(input);
                *updated = true;
                Ok(0)
            }
        }
    }

    fn encrypt_final(
        &mut self,
        session: SessionHandle,
        output: &mut [u8],
    ) -> Result<usize, TokenError> {
        self.check_session(session)?;
        match self.operation(session)?.take() {
            None => Err(TokenError::OperationNotInitialized),
            Some(ActiveOperation::Ecb { .. }) => Ok(0),
            Some(ActiveOperation::Cmac { mac, .. }) => {
                if output.len() < 16 {
                    return Err(TokenError::BufferTooSmall);
                }
                let tag = (*mac).finalize().into_bytes();
                output[..16].copy_from_slice(&tag);
                Ok(16)
            }
        }
    }

    fn derive_key(
        &mut self,
        session: SessionHandle,
        mechanism: Mechanism,
        base: ObjectHandle,
        template: &KeyTemplate,
    ) -> Result<ObjectHandle, TokenError> {
        self.check_session(session)?;
        let Mechanism::AesEcbEncryptData(data) = mechanism else {
            return Err(TokenError::MechanismInvalid);
        };
        let base_key = self.key_for_encrypt(base)?;

        let mut value = [0u8; 16];
        aes_ecb_encrypt(&base_key, &data, &mut value);

        let handle = DERIVED_OBJECT_HANDLES
            .map(ObjectHandle)
            .find(|h| !self.objects.contains_key(h))
            .ok_or(TokenError::DeviceMemory)?;
        self.objects.insert(
            handle,
            TokenObject {
                value,
                template: *template,
            },
        );
        debug!("Derived key object {:?} from {:?}", handle, base);
        Ok(handle)
    }

    fn generate_random(&mut self, session: SessionHandle, output: &mut [u8]) -> Result<(), TokenError> {
        self.check_session(session)?;
        if !self.rng_available {
            return Err(TokenError::FunctionNotSupported);
        }
        self.rng.fill_bytes(output);
        Ok(())
    }

    fn destroy_object(&mut self, session: SessionHandle, object: ObjectHandle) -> Result<(), TokenError> {
        self.check_session(session)?;
        let obj = self
            .objects
            .get(&object)
            .ok_or(TokenError::ObjectHandleInvalid)?;
        if !obj.template.destroyable {
            return Err(TokenError::ActionProhibited);
        }
        self.objects.remove(&object);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkcs11::Session;

    const RFC4493_KEY: [u8; 16] = [
        0x2b, 0x7e, 0x15, 0x16, 0x28, 0xae, 0xd2, 0xa6, 0xab, 0xf7, 0x15, 0x88, 0x09, 0xcf, 0x4f,
        0x3c,
    ];

    fn ready_token() -> (EmulatedToken, ObjectHandle) {
        let mut token = EmulatedToken::with_seed(7);
        token.initialize().unwrap();
        let handle = {
            let mut session = Session::open(&mut token).unwrap();
            session
                .create_object(&RFC4493_KEY, &KeyTemplate::PROVISIONED)
                .unwrap()
        };
        (token, handle)
    }

    #[test]
    fn test_requires_initialize() {
        let mut token = EmulatedToken::new();
        assert_eq!(token.open_session(), Err(TokenError::CryptokiNotInitialized));
        token.initialize().unwrap();
        assert_eq!(token.initialize(), Err(TokenError::CryptokiAlreadyInitialized));
    }

    #[test]
    fn test_session_guard_closes_on_drop() {
        let (mut token, key) = ready_token();
        {
            let mut session = Session::open(&mut token).unwrap();
            // Leave with an operation still active
            session.encrypt_init(Mechanism::AesEcb, key).unwrap();
        }
        assert_eq!(token.open_sessions(), 0);
    }

    #[test]
    fn test_session_slots_are_bounded() {
        let (mut token, _) = ready_token();
        for _ in 0..MAX_SESSIONS {
            token.open_session().unwrap();
        }
        assert_eq!(token.open_session(), Err(TokenError::SessionCount));
    }

    #[test]
    fn test_cmac_rejects_second_update() {
        let (mut token, key) = ready_token();
        let mut session = Session::open(&mut token).unwrap();
        session.encrypt_init(Mechanism::AesCmac, key).unwrap();
        session.encrypt_update(&[0u8; 16], &mut []).unwrap();
        assert_eq!(
            session.encrypt_update(&[0u8; 16], &mut []),
            Err(TokenError::OperationActive)
        );
    }

    #[test]
    fn test_cmac_empty_message_vector() {
        let (mut token, key) = ready_token();
        let mut session = Session::open(&mut token).unwrap();
        session.encrypt_init(Mechanism::AesCmac, key).unwrap();
        session.encrypt_update(&[], &mut []).unwrap();
        let mut tag = [0u8; 16];
        assert_eq!(session.encrypt_final(&mut tag).unwrap(), 16);
        assert_eq!(hex::encode(tag), "bb1d6929e95937287fa37d129b756746");
    }

    #[test]
    fn test_derived_keys_are_not_extractable() {
        let (mut token, key) = ready_token();
        let derived = {
            let mut session = Session::open(&mut token).unwrap();
            session
                .derive_key(Mechanism::AesEcbEncryptData([0u8; 16]), key, &KeyTemplate::DERIVED)
                .unwrap()
        };
        assert_eq!(derived.0, *DERIVED_OBJECT_HANDLES.start());
        assert_eq!(token.key_value(derived), Err(TokenError::AttributeSensitive));
    }

    #[test]
    fn test_derived_handles_stay_in_range() {
        let (mut token, key) = ready_token();
        let mut session = Session::open(&mut token).unwrap();
        let mut derived = Vec::new();
        for i in DERIVED_OBJECT_HANDLES {
            let handle = session
                .derive_key(Mechanism::AesEcbEncryptData([i as u8; 16]), key, &KeyTemplate::DERIVED)
                .unwrap();
            assert!(DERIVED_OBJECT_HANDLES.contains(&handle.0));
            derived.push(handle);
        }
        assert_eq!(
            session.derive_key(Mechanism::AesEcbEncryptData([0xFF; 16]), key, &KeyTemplate::DERIVED),
            Err(TokenError::DeviceMemory)
        );

        // A destroyed handle is handed out again
        session.destroy_object(derived[3]).unwrap();
        let reused = session
            .derive_key(Mechanism::AesEcbEncryptData([0xFF; 16]), key, &KeyTemplate::DERIVED)
            .unwrap();
        assert_eq!(reused, derived[3]);
    }

    #[test]
    fn test_provisioned_keys_cannot_be_destroyed() {
        let (mut token, key) = ready_token();
        let mut session = Session::open(&mut token).unwrap();
        assert_eq!(session.destroy_object(key), Err(TokenError::ActionProhibited));
        assert_eq!(
            session.destroy_object(ObjectHandle(999)),
            Err(TokenError::ObjectHandleInvalid)
        );
    }

    #[test]
    fn test_derive_requires_encrypt_data_mechanism() {
        let (mut token, key) = ready_token();
        let mut session = Session::open(&mut token).unwrap();
        assert_eq!(
            session.derive_key(Mechanism::AesEcb, key, &KeyTemplate::DERIVED),
            Err(TokenError::MechanismInvalid)
        );
    }
}
