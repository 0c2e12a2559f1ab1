//! Host capability passed to identity operations.
//!
//! There is no global callback table: every top-level call that may need a
//! credential or wants progress display receives a [`ClientCallbacks`]
//! capability from the host.

use zeroize::Zeroizing;

/// The secret kinds an identity operation may request from the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialKind {
    /// The full identity password.
    Password,

    /// The 24-digit rescue code.
    RescueCode,

    /// The configured leading characters of the password.
    Hint,

    /// A password for an identity that has none yet.
    NewPassword,
}

/// The operation on whose behalf a callback fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Parsing an identity document.
    Load,

    /// Serializing an identity document.
    Save,

    /// Rotating the identity unlock key.
    Rekey,

    /// Materializing a key slot on demand.
    KeyAccess,

    /// Encrypting resident keys under the hint key.
    HintLock,

    /// Restoring resident keys from the hint vault.
    HintUnlock,
}

/// Credential prompts and progress display, supplied by the host.
pub trait ClientCallbacks {
    /// Supply the requested credential, or `None` to decline.
    ///
    /// Returned secrets are scrubbed after use; `None` surfaces to the
    /// caller as [`SqrlError::CredentialRequired`](crate::SqrlError).
    fn authentication_required(
        &self,
        op: Operation,
        kind: CredentialKind,
    ) -> Option<Zeroizing<String>>;

    /// Observe key-derivation progress, 0 through 100.
    ///
    /// Returning `false` cancels the operation between iterations.
    fn progress(&self, op: Operation, percent: u8) -> bool {
        let _ = (op, percent);
        true
    }
}
