//! Identity key hierarchy: slots, zero-on-drop material, the hint vault.
//!
//! The hierarchy hangs off one root secret, the identity unlock key (IUK):
//!
//! ```text
//! IUK ──x25519 base mult──▶ ILK   (identity lock key, shared with servers)
//!  │
//!  └────── EnHash ────────▶ MK    (identity master key)
//!                            │
//!                            └─HMAC(site)─▶ per-site Ed25519 seeds
//! ```
//!
//! Up to four previous IUKs survive rekeying, newest first, so sites keyed
//! against an older identity can still be proven and upgraded.

use crate::crypto::{self, EnScryptEffort, GCM_TAG_LEN, SALT_LEN};
use crate::SqrlResult;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length in bytes of every key in the hierarchy.
pub const KEY_LEN: usize = 32;

/// Maximum retained previous identity unlock keys.
pub const PIUK_COUNT: usize = 4;

/// Addressable key slots of an identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySlot {
    /// Identity unlock key: the root secret.
    Iuk,

    /// Identity lock key.
    Ilk,

    /// Identity master key.
    Mk,

    /// Most recent previous unlock key.
    Piuk0,

    /// Second most recent previous unlock key.
    Piuk1,

    /// Third most recent previous unlock key.
    Piuk2,

    /// Oldest retained previous unlock key.
    Piuk3,
}

impl KeySlot {
    /// The previous-key slots, newest first.
    pub const PREVIOUS: [KeySlot; PIUK_COUNT] =
        [Self::Piuk0, Self::Piuk1, Self::Piuk2, Self::Piuk3];

    pub(crate) fn piuk_index(self) -> Option<usize> {
        match self {
            Self::Piuk0 => Some(0),
            Self::Piuk1 => Some(1),
            Self::Piuk2 => Some(2),
            Self::Piuk3 => Some(3),
            _ => None,
        }
    }
}

/// A 32-byte secret scrubbed on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial([u8; KEY_LEN]);

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial").finish()
    }
}

impl KeyMaterial {
    /// Wrap raw key bytes.
    pub fn new(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Copy key bytes out of a slice prefix.
    pub(crate) fn from_slice(bytes: &[u8]) -> Self {
        let mut out = [0_u8; KEY_LEN];
        out.copy_from_slice(&bytes[..KEY_LEN]);
        Self(out)
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl PartialEq for KeyMaterial {
    fn eq(&self, other: &Self) -> bool {
        // not constant-time; used for state checks, never for tag checks
        self.0 == other.0
    }
}

impl Eq for KeyMaterial {}

/// The in-memory encrypted form of the resident keys while hint locked.
/// Never persisted.
struct HintVault {
    salt: [u8; SALT_LEN],
    log_n: u8,
    iterations: u32,
    mask: u8,
    cipher: Zeroizing<Vec<u8>>,
    tag: [u8; GCM_TAG_LEN],
}

const VAULT_ORDER: [KeySlot; 7] = [
    KeySlot::Iuk,
    KeySlot::Ilk,
    KeySlot::Mk,
    KeySlot::Piuk0,
    KeySlot::Piuk1,
    KeySlot::Piuk2,
    KeySlot::Piuk3,
];

const VAULT_IV: [u8; crypto::GCM_IV_LEN] = [0; crypto::GCM_IV_LEN];

/// The resident (decrypted) key set of one identity.
#[derive(Default)]
pub(crate) struct KeyRing {
    iuk: Option<KeyMaterial>,
    ilk: Option<KeyMaterial>,
    mk: Option<KeyMaterial>,
    piuks: [Option<KeyMaterial>; PIUK_COUNT],
    pub(crate) password: Option<Zeroizing<String>>,
    pub(crate) rescue_code: Option<Zeroizing<String>>,
    vault: Option<HintVault>,
}

impl KeyRing {
    pub(crate) fn get(&self, slot: KeySlot) -> Option<&KeyMaterial> {
        match slot {
            KeySlot::Iuk => self.iuk.as_ref(),
            KeySlot::Ilk => self.ilk.as_ref(),
            KeySlot::Mk => self.mk.as_ref(),
            _ => self.piuks[slot.piuk_index().expect("previous slot")]
                .as_ref(),
        }
    }

    fn set(&mut self, slot: KeySlot, key: KeyMaterial) {
        match slot {
            KeySlot::Iuk => self.iuk = Some(key),
            KeySlot::Ilk => self.ilk = Some(key),
            KeySlot::Mk => self.mk = Some(key),
            _ => {
                self.piuks[slot.piuk_index().expect("previous slot")] =
                    Some(key)
            }
        }
    }

    pub(crate) fn set_master_keys(&mut self, mk: KeyMaterial, ilk: KeyMaterial) {
        self.mk = Some(mk);
        self.ilk = Some(ilk);
    }

    pub(crate) fn set_iuk_only(&mut self, iuk: KeyMaterial) {
        self.iuk = Some(iuk);
    }

    pub(crate) fn set_piuk(&mut self, index: usize, key: KeyMaterial) {
        self.piuks[index] = Some(key);
    }

    /// Number of resident previous keys (the list is contiguous from 0).
    pub(crate) fn piuk_len(&self) -> usize {
        self.piuks.iter().take_while(|p| p.is_some()).count()
    }

    pub(crate) fn piuk(&self, index: usize) -> Option<&KeyMaterial> {
        self.piuks.get(index).and_then(|p| p.as_ref())
    }

    /// Install a freshly drawn IUK and re-derive ILK and MK from it.
    ///
    /// Any current IUK shifts into the newest previous slot; the oldest
    /// previous key beyond four is dropped (and thereby scrubbed).
    pub(crate) fn install_new_iuk(&mut self, iuk: KeyMaterial) {
        if let Some(old) = self.iuk.take() {
            self.piuks.rotate_right(1);
            self.piuks[0] = Some(old);
        }
        self.ilk = Some(KeyMaterial::new(crypto::x25519_base_mult(
            iuk.as_bytes(),
        )));
        self.mk = Some(KeyMaterial::new(crypto::en_hash(iuk.as_bytes())));
        self.iuk = Some(iuk);
    }

    /// Ed25519 seed for one site, grown from the master key. Never stored.
    pub(crate) fn site_seed(
        &self,
        site: &str,
    ) -> Option<Zeroizing<[u8; KEY_LEN]>> {
        let mk = self.mk.as_ref()?;
        Some(Zeroizing::new(crypto::hmac_sha256(
            mk.as_bytes(),
            site.as_bytes(),
        )))
    }

    pub(crate) fn is_hint_locked(&self) -> bool {
        self.vault.is_some()
    }

    /// Encrypt every resident key under a hint-derived key and scrub the
    /// plaintexts (and the cached password) from memory.
    pub(crate) fn hint_lock(
        &mut self,
        hint: &[u8],
        salt: [u8; SALT_LEN],
        log_n: u8,
        effort: EnScryptEffort,
        progress: &mut dyn FnMut(u8) -> bool,
    ) -> SqrlResult<()> {
        let (key, iterations) =
            crypto::en_scrypt(hint, &salt, log_n, effort, progress)?;

        let mut canvas =
            Zeroizing::new(vec![0_u8; VAULT_ORDER.len() * KEY_LEN]);
        let mut mask = 0_u8;
        for (i, slot) in VAULT_ORDER.iter().enumerate() {
            if let Some(k) = self.get(*slot) {
                mask |= 1 << i;
                canvas[i * KEY_LEN..(i + 1) * KEY_LEN]
                    .copy_from_slice(k.as_bytes());
            }
        }

        let tag =
            crypto::gcm_encrypt(&key, &VAULT_IV, &[mask], &mut canvas[..])?;

        self.vault = Some(HintVault {
            salt,
            log_n,
            iterations,
            mask,
            cipher: canvas,
            tag,
        });
        self.iuk = None;
        self.ilk = None;
        self.mk = None;
        self.piuks = Default::default();
        self.password = None;
        Ok(())
    }

    /// Decrypt the hint vault and restore the resident keys.
    ///
    /// A wrong hint fails uniformly with `BadTag`; the vault stays intact
    /// so the host may retry.
    pub(crate) fn hint_unlock(
        &mut self,
        hint: &[u8],
        progress: &mut dyn FnMut(u8) -> bool,
    ) -> SqrlResult<()> {
        let vault = match self.vault.as_ref() {
            Some(v) => v,
            None => return Ok(()),
        };
        let (key, _) = crypto::en_scrypt(
            hint,
            &vault.salt,
            vault.log_n,
            EnScryptEffort::Iterations(vault.iterations),
            progress,
        )?;

        let mut canvas = Zeroizing::new(vault.cipher.to_vec());
        crypto::gcm_decrypt(
            &key,
            &VAULT_IV,
            &[vault.mask],
            &mut canvas[..],
            &vault.tag,
        )?;

        let mask = vault.mask;
        for (i, slot) in VAULT_ORDER.iter().enumerate() {
            if mask & (1 << i) != 0 {
                self.set(
                    *slot,
                    KeyMaterial::from_slice(&canvas[i * KEY_LEN..]),
                );
            }
        }
        self.vault = None;
        Ok(())
    }
}
