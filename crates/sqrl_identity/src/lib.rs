#![deny(missing_docs)]
#![deny(unsafe_code)]
//! Client-side SQRL identity core.
//!
//! This crate manages a user's cryptographic identity on-device: it
//! generates and safeguards the small set of long-lived secrets behind a
//! SQRL identity, protects them at rest inside the S4 container format
//! (see the [`sqrl_s4`] crate), and re-derives them on demand so higher
//! layers can run the authentication handshake with relying parties.
//!
//! ### The key hierarchy
//!
//! - **IUK** — identity unlock key, the 32-byte root secret. Protected at
//!   rest under a key derived from the 24-digit rescue code.
//! - **ILK** — identity lock key, the curve25519 base-point multiple of
//!   the IUK; shared with servers so an identity can later be unlocked
//!   without exposing the IUK.
//! - **MK** — identity master key, `EnHash(IUK)`; protected at rest under
//!   the password-derived key, and the root of per-site signing seeds.
//! - **PIUK0..3** — up to four previous unlock keys, newest first,
//!   preserved across rekeys and encrypted under the current MK.
//!
//! ### The moving parts
//!
//! - [`entropy`] — a process-wide, background-fed SHA-512 pool that
//!   supplies every seed, salt and IV.
//! - [`crypto`] — typed wrappers over the primitives (EnHash, EnScrypt,
//!   AES-GCM, Ed25519, X25519, HMAC).
//! - [`Identity`] — the store gluing it together: load, save, rekey,
//!   decrypt-on-demand key access, and the idle-time hint lock.
//! - [`ClientCallbacks`] — the capability a host passes into each call for
//!   credential prompts and progress display (a zero return from the
//!   progress callback cancels long key derivations).
//!
//! ```no_run
//! use sqrl_identity::{ClientCallbacks, CredentialKind, Identity, Operation};
//! use sqrl_identity::{ExportScope, KeySlot};
//! use sqrl_s4::Encoding;
//! use zeroize::Zeroizing;
//!
//! struct Host;
//!
//! impl ClientCallbacks for Host {
//!     fn authentication_required(
//!         &self,
//!         _op: Operation,
//!         kind: CredentialKind,
//!     ) -> Option<Zeroizing<String>> {
//!         match kind {
//!             CredentialKind::NewPassword => {
//!                 Some(Zeroizing::new("the password".into()))
//!             }
//!             _ => None,
//!         }
//!     }
//! }
//!
//! # fn main() -> sqrl_identity::SqrlResult<()> {
//! let mut identity = Identity::create()?;
//! identity.set_password("the password");
//! println!("rescue code: {}", identity.rescue_code().unwrap());
//! let export = identity.save(Encoding::Base64, ExportScope::All, &Host)?;
//! let mut restored = Identity::load(&export)?;
//! let mk = restored.key(KeySlot::Mk, &Host);
//! # let _ = mk;
//! # Ok(())
//! # }
//! ```

pub use sqrl_s4;
pub use sqrl_s4::Encoding;

mod error;
pub use error::*;

mod client;
pub use client::*;

pub mod crypto;

pub mod entropy;

mod keys;
pub use keys::*;

mod identity;
pub use identity::*;
