//! Software crypto backend: AES-128 ECB and CMAC straight over key bytes

use aes::cipher::{generic_array::GenericArray, BlockEncrypt, KeyInit};
use aes::Aes128;
use cmac::{Cmac, Mac};

use super::backend::{BackendKind, CryptoBackend, DerivedKey, RadioRng, RandomSource};
use super::errors::{Result, SecureElementError};
use super::keys::{RawKey, KEY_SIZE};
use crate::pkcs11::{ObjectHandle, TokenError};

/// AES-128 ECB, one 16-byte block at a time. `input` is block aligned and
/// `output` at least as long.
pub(crate) fn aes_ecb_encrypt(key: &[u8; KEY_SIZE], input: &[u8], output: &mut [u8]) {
    let cipher = Aes128::new(GenericArray::from_slice(key));
    for (src, dst) in input.chunks_exact(16).zip(output.chunks_exact_mut(16)) {
        let mut block = GenericArray::clone_from_slice(src);
        cipher.encrypt_block(&mut block);
        dst.copy_from_slice(&block);
    }
}

pub(crate) fn aes_cmac(key: &[u8; KEY_SIZE], prefix: Option<&[u8; 16]>, buffer: &[u8]) -> [u8; 16] {
    let mut mac = <Cmac<Aes128> as KeyInit>::new(GenericArray::from_slice(key));
    if let Some(b0) = prefix {
        mac.update(b0);
    }
    mac.update(buffer);
    mac.finalize().into_bytes().into()
}

pub struct SoftBackend {
    rng: Box<dyn RandomSource>,
}

impl SoftBackend {
    pub fn new() -> Self {
        Self::with_rng(Box::new(RadioRng))
    }

    pub fn with_rng(rng: Box<dyn RandomSource>) -> Self {
        Self { rng }
    }
}

impl Default for SoftBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptoBackend for SoftBackend {
    type Slot = RawKey;

    const KIND: BackendKind = BackendKind::Software;

    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    fn aes_encrypt(&mut self, key: &RawKey, input: &[u8], output: &mut [u8]) -> Result<()> {
        if input.len() % 16 != 0 || output.len() < input.len() {
            return Err(SecureElementError::BufferSize);
        }
        aes_ecb_encrypt(&key.0, input, output);
        Ok(())
    }

    fn compute_cmac(
        &mut self,
        key: &RawKey,
        prefix: Option<&[u8; 16]>,
        buffer: &[u8],
    ) -> Result<[u8; 16]> {
        Ok(aes_cmac(&key.0, prefix, buffer))
    }

    fn derive_key(&mut self, root: &RawKey, input: &[u8; 16]) -> Result<DerivedKey<RawKey>> {
        let mut key = [0u8; KEY_SIZE];
        aes_ecb_encrypt(&root.0, input, &mut key);
        Ok(DerivedKey::Raw(key))
    }

    fn import_key(&self, key: &[u8; KEY_SIZE]) -> Option<RawKey> {
        Some(RawKey(*key))
    }

    fn handle_slot(&self, _handle: ObjectHandle) -> Option<RawKey> {
        None
    }

    fn provision(&mut self, key: &[u8; KEY_SIZE]) -> Result<RawKey> {
        Ok(RawKey(*key))
    }

    fn random_number(&mut self) -> u32 {
        self.rng.next_u32()
    }
}

/// Error the software backend reports for HSM-only operations
pub(crate) const NO_OBJECT_STORE: SecureElementError =
    SecureElementError::Backend(TokenError::FunctionNotSupported);
