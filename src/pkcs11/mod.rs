//! PKCS#11-style token contract used by the hardware crypto backend
//!
//! Only the slice of Cryptoki the secure element needs is modelled: serial
//! sessions, single-part ECB encryption, CMAC authentication through the
//! encrypt interface, ECB-encrypt-data key derivation, random generation and
//! object lifecycle.

pub mod emulated;

pub use emulated::EmulatedToken;

use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::warn;

/// Handles the token hands out to derived keys, destroyed together on reset
pub const DERIVED_OBJECT_HANDLES: RangeInclusive<u32> = 50..=57;

/// Opaque reference to a key object living inside the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ObjectHandle(pub u32);

/// Open session with the token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle(pub u32);

/// Cryptographic mechanisms the secure element issues
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mechanism {
    /// AES-128 ECB encryption, block by block
    AesEcb,
    /// AES-128 CMAC, driven through the encrypt init/update/final calls
    AesCmac,
    /// Key derivation: new key = AES-ECB(base key, data)
    AesEcbEncryptData([u8; 16]),
}

/// Attributes of a secret key object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyTemplate {
    pub destroyable: bool,
    pub encrypt: bool,
    pub decrypt: bool,
    pub extractable: bool,
}

impl KeyTemplate {
    /// Template applied to keys derived inside the token
    pub const DERIVED: KeyTemplate = KeyTemplate {
        destroyable: true,
        encrypt: true,
        decrypt: true,
        extractable: false,
    };

    /// Template applied to keys provisioned at manufacturing time
    pub const PROVISIONED: KeyTemplate = KeyTemplate {
        destroyable: false,
        encrypt: true,
        decrypt: true,
        extractable: false,
    };
}

/// Token return values other than CKR_OK
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("cryptoki not initialized")]
    CryptokiNotInitialized,
    #[error("cryptoki already initialized")]
    CryptokiAlreadyInitialized,
    #[error("invalid session handle")]
    SessionHandleInvalid,
    #[error("too many open sessions")]
    SessionCount,
    #[error("invalid object handle")]
    ObjectHandleInvalid,
    #[error("mechanism invalid for this operation")]
    MechanismInvalid,
    #[error("an operation is already active on this session")]
    OperationActive,
    #[error("no operation initialized on this session")]
    OperationNotInitialized,
    #[error("input length out of range")]
    DataLenRange,
    #[error("output buffer too small")]
    BufferTooSmall,
    #[error("key does not permit this function")]
    KeyFunctionNotPermitted,
    #[error("attribute is sensitive")]
    AttributeSensitive,
    #[error("action prohibited on this object")]
    ActionProhibited,
    #[error("token object memory exhausted")]
    DeviceMemory,
    #[error("function not supported")]
    FunctionNotSupported,
}

/// Cryptoki entry points, one call per C_* function
pub trait Pkcs11Token: Send {
    fn initialize(&mut self) -> Result<(), TokenError>;

    fn open_session(&mut self) -> Result<SessionHandle, TokenError>;

    fn close_session(&mut self, session: SessionHandle) -> Result<(), TokenError>;

    /// Creates a secret key object from a clear value (C_CreateObject)
    fn create_object(
        &mut self,
        session: SessionHandle,
        value: &[u8; 16],
        template: &KeyTemplate,
    ) -> Result<ObjectHandle, TokenError>;

    fn encrypt_init(
        &mut self,
        session: SessionHandle,
        mechanism: Mechanism,
        key: ObjectHandle,
    ) -> Result<(), TokenError>;

    /// Feeds `input` to the active operation and returns the number of bytes
    /// written to `output` (always 0 for CMAC, which only absorbs)
    fn encrypt_update(
        &mut self,
        session: SessionHandle,
        input: &[u8],
        output: &mut [u8],
    ) -> Result<usize, TokenError>;

    /// Ends the active operation; CMAC writes its 16-byte tag
    fn encrypt_final(
        &mut self,
        session: SessionHandle,
        output: &mut [u8],
    ) -> Result<usize, TokenError>;

    fn derive_key(
        &mut self,
        session: SessionHandle,
        mechanism: Mechanism,
        base: ObjectHandle,
        template: &KeyTemplate,
    ) -> Result<ObjectHandle, TokenError>;

    fn generate_random(&mut self, session: SessionHandle, output: &mut [u8])
        -> Result<(), TokenError>;

    fn destroy_object(&mut self, session: SessionHandle, object: ObjectHandle)
        -> Result<(), TokenError>;
}

/// Serial session that is closed when dropped, whatever path the caller
/// leaves through
pub struct Session<'a, T: Pkcs11Token + ?Sized> {
    token: &'a mut T,
    handle: SessionHandle,
}

impl<'a, T: Pkcs11Token + ?Sized> Session<'a, T> {
    pub fn open(token: &'a mut T) -> Result<Self, TokenError> {
        let handle = token.open_session()?;
        Ok(Self { token, handle })
    }

    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    pub fn create_object(
        &mut self,
        value: &[u8; 16],
        template: &KeyTemplate,
    ) -> Result<ObjectHandle, TokenError> {
        self.token.create_object(self.handle, value, template)
    }

    pub fn encrypt_init(&mut self, mechanism: Mechanism, key: ObjectHandle) -> Result<(), TokenError> {
        self.token.encrypt_init(self.handle, mechanism, key)
    }

    pub fn encrypt_update(&mut self, input: &[u8], output: &mut [u8]) -> Result<usize, TokenError> {
        self.token.encrypt_update(self.handle, input, output)
    }

    pub fn encrypt_final(&mut self, output: &mut [u8]) -> Result<usize, TokenError> {
        self.token.encrypt_final(self.handle, output)
    }

    pub fn derive_key(
        &mut self,
        mechanism: Mechanism,
        base: ObjectHandle,
        template: &KeyTemplate,
    ) -> Result<ObjectHandle, TokenError> {
        self.token.derive_key(self.handle, mechanism, base, template)
    }

    pub fn generate_random(&mut self, output: &mut [u8]) -> Result<(), TokenError> {
        self.token.generate_random(self.handle, output)
    }

    pub fn destroy_object(&mut self, object: ObjectHandle) -> Result<(), TokenError> {
        self.token.destroy_object(self.handle, object)
    }
}

impl<T: Pkcs11Token + ?Sized> Drop for Session<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.token.close_session(self.handle) {
            warn!("Failed to close HSM session {:?}: {}", self.handle, e);
        }
    }
}
