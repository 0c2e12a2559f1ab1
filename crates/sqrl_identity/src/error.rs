//! Identity core error type.

use crate::client::CredentialKind;
use crate::keys::KeySlot;

/// Identity core error type.
#[derive(Debug, thiserror::Error)]
pub enum SqrlError {
    /// Storage container error.
    #[error(transparent)]
    S4(#[from] sqrl_s4::S4Error),

    /// Authenticated decryption failed.
    ///
    /// The message deliberately carries no detail about which field
    /// mismatched: a wrong password, a wrong rescue code, a wrong hint and
    /// a tampered block all surface identically.
    #[error("authentication failed")]
    BadTag,

    /// Non-blocking entropy request under the current estimate.
    #[error("insufficient entropy")]
    NoEntropy,

    /// The identity is hint locked; decrypted keys are unavailable.
    #[error("identity is hint locked")]
    HintLocked,

    /// A long-running operation was cancelled through the progress callback.
    #[error("operation cancelled")]
    Cancelled,

    /// The host declined to supply a required credential.
    #[error("credential required: {0:?}")]
    CredentialRequired(CredentialKind),

    /// The requested key slot is not present in this identity.
    #[error("key slot not present: {0:?}")]
    KeyNotPresent(KeySlot),

    /// Key derivation parameters out of range.
    #[error("bad key derivation parameter: {0}")]
    BadKdfParameter(String),
}

/// Identity core result type.
pub type SqrlResult<T> = Result<T, SqrlError>;
