use thiserror::Error;

use crate::pkcs11::TokenError;

/// Status of a failed Secure Element operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SecureElementError {
    #[error("required argument is missing")]
    NullArgument,

    #[error("unknown or protected key identifier")]
    InvalidKeyIdentifier,

    #[error("buffer length is not a multiple of the AES block size or exceeds the staging buffer")]
    BufferSize,

    #[error("MIC does not match")]
    MicMismatch,

    #[error("crypto backend failure: {0}")]
    Backend(#[from] TokenError),

    #[error("crypto backend failed to start: {0}")]
    Startup(TokenError),
}

pub type Result<T> = std::result::Result<T, SecureElementError>;
