//! The identity store: load, save, rekey, decrypt-on-demand.
//!
//! An [`Identity`] keeps its S4 blocks in encrypted form and materializes
//! keys lazily: the first request for a slot runs the stored key derivation
//! against a credential obtained through the host capability, verifies the
//! block tag, and populates the slot. Saving reverses the flow, re-deriving
//! only what changed since the last save.

use crate::client::{ClientCallbacks, CredentialKind, Operation};
use crate::crypto::{
    self, EnScryptEffort, GCM_IV_LEN, GCM_TAG_LEN, SALT_LEN,
};
use crate::entropy;
use crate::keys::{KeyMaterial, KeyRing, KeySlot, KEY_LEN, PIUK_COUNT};
use crate::{SqrlError, SqrlResult};
use sqrl_s4::{Block, Encoding, Storage};
use zeroize::Zeroizing;

/// S4 block type holding the password-protected master keys.
pub const BLOCK_TYPE_ACCESS: u16 = 1;

/// S4 block type holding the rescue-code-protected unlock key.
pub const BLOCK_TYPE_RESCUE: u16 = 2;

/// S4 block type holding the previous unlock keys.
pub const BLOCK_TYPE_PREVIOUS: u16 = 3;

const ACCESS_BLOCK_LEN: u16 = 125;
const ACCESS_AAD_LEN: usize = 45;
const RESCUE_BLOCK_LEN: u16 = 73;
const RESCUE_AAD_LEN: usize = 25;
const PREVIOUS_AAD_LEN: usize = 4;

// single-use keys: the rescue key is freshly derived per save, and the
// master key changes with every rekey before block 3 is rewritten
const ZERO_IV: [u8; GCM_IV_LEN] = [0; GCM_IV_LEN];

/// Identity option flags persisted in the type 1 block.
pub mod option_flags {
    /// Ask servers for software update information.
    pub const CHECK_FOR_UPDATES: u16 = 0x0001;

    /// Always prompt before using the identity.
    pub const ASK_FOR_IDENTITY: u16 = 0x0002;

    /// Request that sites disable non-SQRL authentication.
    pub const SQRL_ONLY: u16 = 0x0004;

    /// Request that sites disable side-channel account recovery.
    pub const NO_BYPASS: u16 = 0x0008;

    /// Warn when a man-in-the-middle is detected.
    pub const WARN_MITM: u16 = 0x0010;

    /// Discard the hint vault when the system suspends.
    pub const CLEAR_HINT_SUSPEND: u16 = 0x0020;

    /// Discard the hint vault on user switch.
    pub const CLEAR_HINT_USER_SWITCH: u16 = 0x0040;

    /// Discard the hint vault after the idle timeout.
    pub const CLEAR_HINT_IDLE: u16 = 0x0080;
}

/// Persisted identity options plus local KDF tuning.
#[derive(Debug, Clone)]
pub struct IdentityOptions {
    /// Behavior flags (see [`option_flags`]). Persisted.
    pub option_flags: u16,

    /// Leading password characters accepted for hint unlock. Persisted.
    pub hint_length: u8,

    /// Wall-clock budget in seconds for the password KDF. Persisted.
    pub pw_verify_sec: u8,

    /// Minutes of idle after which hosts should hint lock. Persisted.
    pub idle_timeout_min: u16,

    /// log2 of the scrypt N factor. Persisted per block.
    pub log_n_factor: u8,

    /// Wall-clock budget in seconds for the rescue-code KDF. Local only.
    pub rescue_verify_sec: u8,

    /// Wall-clock budget in seconds for the hint-lock KDF. Local only.
    pub hint_verify_sec: u8,
}

impl Default for IdentityOptions {
    fn default() -> Self {
        Self {
            option_flags: option_flags::CHECK_FOR_UPDATES
                | option_flags::WARN_MITM
                | option_flags::CLEAR_HINT_SUSPEND
                | option_flags::CLEAR_HINT_USER_SWITCH
                | option_flags::CLEAR_HINT_IDLE,
            hint_length: 4,
            pw_verify_sec: 5,
            idle_timeout_min: 15,
            log_n_factor: 9,
            rescue_verify_sec: 5,
            hint_verify_sec: 1,
        }
    }
}

/// Which blocks an export carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportScope {
    /// Blocks 1, 2 and 3 (plus retained unknown blocks).
    All,

    /// Block 2 only: the identity recoverable via rescue code.
    RescueOnly,
}

/// A client-side identity: encrypted S4 blocks plus the resident key set.
///
/// Dropping an identity scrubs every resident secret byte.
pub struct Identity {
    access_block: Option<Block>,
    rescue_block: Option<Block>,
    previous_block: Option<Block>,
    unknown_blocks: Vec<Block>,
    keys: KeyRing,
    options: IdentityOptions,
    password_dirty: bool,
    keys_dirty: bool,
    rescue_dirty: bool,
    previous_dirty: bool,
    options_dirty: bool,
}

impl Identity {
    fn empty() -> Self {
        Self {
            access_block: None,
            rescue_block: None,
            previous_block: None,
            unknown_blocks: Vec::new(),
            keys: KeyRing::default(),
            options: IdentityOptions::default(),
            password_dirty: false,
            keys_dirty: false,
            rescue_dirty: false,
            previous_dirty: false,
            options_dirty: false,
        }
    }

    /// Generate a fresh identity from the process entropy pool.
    ///
    /// Draws 512 estimated bits for the rescue code and another 512 for the
    /// unlock key, then derives the lock and master keys. The new identity
    /// starts decrypted; set a password before saving.
    pub fn create() -> SqrlResult<Self> {
        let pool = entropy::pool();
        let mut seed = Zeroizing::new([0_u8; 64]);
        if pool.get_blocking(&mut seed, entropy::ENTROPY_TARGET_BITS) == 0 {
            return Err(SqrlError::NoEntropy);
        }
        let rescue_code = crypto::bin2rc(&seed);
        if pool.get_blocking(&mut seed, entropy::ENTROPY_TARGET_BITS) == 0 {
            return Err(SqrlError::NoEntropy);
        }
        let iuk = KeyMaterial::from_slice(&seed[..KEY_LEN]);

        let mut identity = Self::empty();
        identity.keys.install_new_iuk(iuk);
        identity.keys.rescue_code = Some(rescue_code);
        identity.password_dirty = true;
        identity.keys_dirty = true;
        identity.rescue_dirty = true;
        tracing::debug!("created fresh identity");
        Ok(identity)
    }

    /// Parse an identity document (armored or binary).
    ///
    /// No secret is decrypted here; every key stays in its block until the
    /// first [`key`](Self::key) request for its slot.
    pub fn load(input: &[u8]) -> SqrlResult<Self> {
        let doc = Storage::parse(input)?;
        let mut identity = Self::empty();
        for block in doc.blocks() {
            match block.block_type() {
                BLOCK_TYPE_ACCESS => {
                    if identity.access_block.is_some() {
                        return Err(malformed("duplicate type 1 block"));
                    }
                    identity.adopt_access_options(block)?;
                    identity.access_block = Some(block.clone());
                }
                BLOCK_TYPE_RESCUE => {
                    if identity.rescue_block.is_some() {
                        return Err(malformed("duplicate type 2 block"));
                    }
                    if block.len() != RESCUE_BLOCK_LEN {
                        return Err(malformed(format!(
                            "bad rescue block length {}",
                            block.len()
                        )));
                    }
                    identity.rescue_block = Some(block.clone());
                }
                BLOCK_TYPE_PREVIOUS => {
                    if identity.previous_block.is_some() {
                        return Err(malformed("duplicate type 3 block"));
                    }
                    piuk_count_of(block)?;
                    identity.previous_block = Some(block.clone());
                }
                other => {
                    tracing::trace!(
                        block_type = other,
                        "retaining unknown block"
                    );
                    identity.unknown_blocks.push(block.clone());
                }
            }
        }
        tracing::debug!(blocks = doc.blocks().len(), "identity loaded");
        Ok(identity)
    }

    /// Serialize the identity, re-encrypting whatever changed.
    ///
    /// A dirty password (or a first save) runs the password KDF against its
    /// wall-clock budget and records the iteration count reached; otherwise
    /// the stored salt and count are replayed. The rescue block is rebuilt
    /// only after create/rekey, the previous-keys block only when the list
    /// or the master key changed.
    pub fn save(
        &mut self,
        encoding: Encoding,
        scope: ExportScope,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<Vec<u8>> {
        let mut doc = Storage::new();
        match scope {
            ExportScope::All => {
                let access = self.current_access_block(client)?;
                let rescue = self.current_rescue_block(client)?;
                let previous = self.current_previous_block(client)?;
                doc.push(access.clone());
                doc.push(rescue.clone());
                if let Some(p) = previous.clone() {
                    doc.push(p);
                }
                for block in &self.unknown_blocks {
                    doc.push(block.clone());
                }
                self.access_block = Some(access);
                self.rescue_block = Some(rescue);
                self.previous_block = previous;
                self.password_dirty = false;
                self.keys_dirty = false;
                self.rescue_dirty = false;
                self.previous_dirty = false;
                self.options_dirty = false;
            }
            ExportScope::RescueOnly => {
                let rescue = self.current_rescue_block(client)?;
                doc.push(rescue.clone());
                self.rescue_block = Some(rescue);
                self.rescue_dirty = false;
            }
        }
        tracing::debug!(
            scope = ?scope,
            blocks = doc.blocks().len(),
            "identity saved"
        );
        Ok(doc.to_export(encoding))
    }

    /// Rotate the identity unlock key.
    ///
    /// The current unlock key becomes the newest previous key (the oldest
    /// beyond four is discarded), a fresh unlock key and rescue code are
    /// drawn from the pool, and the lock and master keys are re-derived.
    pub fn rekey(&mut self, client: &dyn ClientCallbacks) -> SqrlResult<()> {
        // the previous keys must be resident before the shift: the new
        // master key has to re-encrypt them at the next save
        self.ensure_previous_keys(client, Operation::Rekey)?;
        self.ensure_key(KeySlot::Iuk, client, Operation::Rekey)?;

        let pool = entropy::pool();
        let mut seed = Zeroizing::new([0_u8; 64]);
        if pool.get_blocking(&mut seed, entropy::ENTROPY_TARGET_BITS) == 0 {
            return Err(SqrlError::NoEntropy);
        }
        let rescue_code = crypto::bin2rc(&seed);
        if pool.get_blocking(&mut seed, entropy::ENTROPY_TARGET_BITS) == 0 {
            return Err(SqrlError::NoEntropy);
        }
        let iuk = KeyMaterial::from_slice(&seed[..KEY_LEN]);

        self.keys.install_new_iuk(iuk);
        self.keys.rescue_code = Some(rescue_code);
        self.keys_dirty = true;
        self.rescue_dirty = true;
        self.previous_dirty = true;
        tracing::debug!("identity rekeyed");
        Ok(())
    }

    /// Materialize and return the requested 32-byte key.
    ///
    /// Decrypts the originating block on first access, prompting for the
    /// password (master/lock keys), the rescue code (unlock key) or the
    /// master key chain (previous keys). Fails with
    /// [`SqrlError::HintLocked`] while the identity is hint locked.
    pub fn key(
        &mut self,
        slot: KeySlot,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<KeyMaterial> {
        self.ensure_key(slot, client, Operation::KeyAccess)?;
        self.keys
            .get(slot)
            .cloned()
            .ok_or(SqrlError::KeyNotPresent(slot))
    }

    /// Sign `msg` with the Ed25519 keypair of one site.
    ///
    /// Site seeds grow from the master key and are never retained.
    pub fn sign_for_site(
        &mut self,
        site: &str,
        msg: &[u8],
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<[u8; 64]> {
        self.ensure_key(KeySlot::Mk, client, Operation::KeyAccess)?;
        let seed = self
            .keys
            .site_seed(site)
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;
        Ok(crypto::ed25519_sign(&seed, msg))
    }

    /// The Ed25519 public key this identity presents to one site.
    pub fn site_public_key(
        &mut self,
        site: &str,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<[u8; KEY_LEN]> {
        self.ensure_key(KeySlot::Mk, client, Operation::KeyAccess)?;
        let seed = self
            .keys
            .site_seed(site)
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;
        Ok(crypto::ed25519_public_from_seed(&seed))
    }

    /// Encrypt the resident keys under a key derived from the password
    /// hint (its first [`IdentityOptions::hint_length`] characters) and
    /// scrub the plaintexts. The full cached password is scrubbed too.
    pub fn hint_lock(
        &mut self,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<()> {
        if self.keys.is_hint_locked() {
            return Ok(());
        }
        let password = self
            .keys
            .password
            .clone()
            .ok_or(SqrlError::CredentialRequired(CredentialKind::Password))?;
        let hint: Zeroizing<String> = Zeroizing::new(
            password
                .chars()
                .take(self.options.hint_length as usize)
                .collect(),
        );
        let pool = entropy::pool();
        let mut salt = [0_u8; SALT_LEN];
        if pool.bytes(&mut salt) == 0 {
            return Err(SqrlError::NoEntropy);
        }
        let mut progress = |p| client.progress(Operation::HintLock, p);
        self.keys.hint_lock(
            hint.as_bytes(),
            salt,
            self.options.log_n_factor,
            EnScryptEffort::Seconds(self.options.hint_verify_sec),
            &mut progress,
        )?;
        tracing::debug!("identity hint locked");
        Ok(())
    }

    /// Restore the resident keys from the hint vault.
    ///
    /// The hint is requested through the host capability. A wrong hint of
    /// any length fails uniformly with [`SqrlError::BadTag`] and leaves the
    /// vault intact for another attempt.
    pub fn hint_unlock(
        &mut self,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<()> {
        if !self.keys.is_hint_locked() {
            return Ok(());
        }
        let hint = client
            .authentication_required(Operation::HintUnlock, CredentialKind::Hint)
            .ok_or(SqrlError::CredentialRequired(CredentialKind::Hint))?;
        let mut progress = |p| client.progress(Operation::HintUnlock, p);
        self.keys.hint_unlock(hint.as_bytes(), &mut progress)?;
        tracing::debug!("identity hint unlocked");
        Ok(())
    }

    /// True while the resident keys are held encrypted in the hint vault.
    pub fn is_hint_locked(&self) -> bool {
        self.keys.is_hint_locked()
    }

    /// Password characters accepted for hint unlock.
    pub fn hint_length(&self) -> u8 {
        self.options.hint_length
    }

    /// The current rescue code, if one is resident (fresh create/rekey, or
    /// entered through a credential prompt).
    pub fn rescue_code(&self) -> Option<&str> {
        self.keys.rescue_code.as_ref().map(|code| code.as_str())
    }

    /// Cache a new password and mark the password block dirty.
    pub fn set_password(&mut self, password: &str) {
        self.keys.password = Some(Zeroizing::new(password.to_string()));
        self.password_dirty = true;
    }

    /// The identity options.
    pub fn options(&self) -> &IdentityOptions {
        &self.options
    }

    /// Replace the identity options; persisted fields reach disk at the
    /// next save.
    pub fn set_options(&mut self, options: IdentityOptions) {
        self.options = options;
        self.options_dirty = true;
    }

    // -- block assembly -- //

    fn current_access_block(
        &mut self,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<Block> {
        let rebuild = self.password_dirty
            || self.keys_dirty
            || self.options_dirty
            || self.access_block.is_none();
        if !rebuild {
            if let Some(block) = self.access_block.clone() {
                return Ok(block);
            }
        }

        self.ensure_key(KeySlot::Mk, client, Operation::Save)?;
        let password = self.obtain_password(client, Operation::Save)?;

        let pool = entropy::pool();
        let (salt, log_n, effort) =
            if self.password_dirty || self.access_block.is_none() {
                let mut salt = [0_u8; SALT_LEN];
                if pool.bytes(&mut salt) == 0 {
                    return Err(SqrlError::NoEntropy);
                }
                (
                    salt,
                    self.options.log_n_factor,
                    EnScryptEffort::Seconds(self.options.pw_verify_sec),
                )
            } else {
                let stored = self
                    .access_block
                    .as_ref()
                    .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;
                let params = AccessKdfParams::read(stored)?;
                (
                    params.salt,
                    params.log_n,
                    EnScryptEffort::Iterations(params.iterations),
                )
            };

        let mut progress = |p| client.progress(Operation::Save, p);
        let (pw_key, iterations) = crypto::en_scrypt(
            password.as_bytes(),
            &salt,
            log_n,
            effort,
            &mut progress,
        )?;

        let mut iv = [0_u8; GCM_IV_LEN];
        if pool.bytes(&mut iv) == 0 {
            return Err(SqrlError::NoEntropy);
        }

        let mk = self
            .keys
            .get(KeySlot::Mk)
            .cloned()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;
        let ilk = self
            .keys
            .get(KeySlot::Ilk)
            .cloned()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Ilk))?;

        let mut block = Block::init(BLOCK_TYPE_ACCESS, ACCESS_BLOCK_LEN)?;
        block.write_u16(ACCESS_AAD_LEN as u16)?;
        block.write(&iv)?;
        block.write(&salt)?;
        block.write_u8(log_n)?;
        block.write_u32(iterations)?;
        block.write_u16(self.options.option_flags)?;
        block.write_u8(self.options.hint_length)?;
        block.write_u8(self.options.pw_verify_sec)?;
        block.write_u16(self.options.idle_timeout_min)?;

        let mut payload = Zeroizing::new([0_u8; KEY_LEN * 2]);
        payload[..KEY_LEN].copy_from_slice(mk.as_bytes());
        payload[KEY_LEN..].copy_from_slice(ilk.as_bytes());
        let aad = block.as_bytes()[..ACCESS_AAD_LEN].to_vec();
        let tag = crypto::gcm_encrypt(&pw_key, &iv, &aad, &mut payload[..])?;
        block.write(&payload[..])?;
        block.write(&tag)?;
        Ok(block)
    }

    fn current_rescue_block(
        &mut self,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<Block> {
        if !self.rescue_dirty {
            if let Some(block) = self.rescue_block.clone() {
                return Ok(block);
            }
        }

        self.ensure_key(KeySlot::Iuk, client, Operation::Save)?;
        let rescue_code = self.keys.rescue_code.clone().ok_or(
            SqrlError::CredentialRequired(CredentialKind::RescueCode),
        )?;
        let iuk = self
            .keys
            .get(KeySlot::Iuk)
            .cloned()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Iuk))?;

        let pool = entropy::pool();
        let mut salt = [0_u8; SALT_LEN];
        if pool.bytes(&mut salt) == 0 {
            return Err(SqrlError::NoEntropy);
        }
        let mut progress = |p| client.progress(Operation::Save, p);
        let (key, iterations) = crypto::en_scrypt(
            rescue_code.as_bytes(),
            &salt,
            self.options.log_n_factor,
            EnScryptEffort::Seconds(self.options.rescue_verify_sec),
            &mut progress,
        )?;

        let mut block = Block::init(BLOCK_TYPE_RESCUE, RESCUE_BLOCK_LEN)?;
        block.write(&salt)?;
        block.write_u8(self.options.log_n_factor)?;
        block.write_u32(iterations)?;

        let mut payload = Zeroizing::new([0_u8; KEY_LEN]);
        payload.copy_from_slice(iuk.as_bytes());
        let aad = block.as_bytes()[..RESCUE_AAD_LEN].to_vec();
        let tag = crypto::gcm_encrypt(&key, &ZERO_IV, &aad, &mut payload[..])?;
        block.write(&payload[..])?;
        block.write(&tag)?;
        Ok(block)
    }

    fn current_previous_block(
        &mut self,
        client: &dyn ClientCallbacks,
    ) -> SqrlResult<Option<Block>> {
        if !self.previous_dirty {
            return Ok(self.previous_block.clone());
        }
        let count = self.keys.piuk_len();
        if count == 0 {
            return Ok(None);
        }

        self.ensure_key(KeySlot::Mk, client, Operation::Save)?;
        let mk = self
            .keys
            .get(KeySlot::Mk)
            .cloned()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;

        let block_len = (4 + count * KEY_LEN + GCM_TAG_LEN) as u16;
        let mut block = Block::init(BLOCK_TYPE_PREVIOUS, block_len)?;
        let mut payload = Zeroizing::new(vec![0_u8; count * KEY_LEN]);
        for i in 0..count {
            let piuk = self
                .keys
                .piuk(i)
                .ok_or(SqrlError::KeyNotPresent(KeySlot::PREVIOUS[i]))?;
            payload[i * KEY_LEN..(i + 1) * KEY_LEN]
                .copy_from_slice(piuk.as_bytes());
        }
        let aad = block.as_bytes()[..PREVIOUS_AAD_LEN].to_vec();
        let tag =
            crypto::gcm_encrypt(mk.as_bytes(), &ZERO_IV, &aad, &mut payload)?;
        block.write(&payload)?;
        block.write(&tag)?;
        Ok(Some(block))
    }

    // -- block decryption -- //

    fn ensure_key(
        &mut self,
        slot: KeySlot,
        client: &dyn ClientCallbacks,
        op: Operation,
    ) -> SqrlResult<()> {
        if self.keys.get(slot).is_some() {
            return Ok(());
        }
        if self.keys.is_hint_locked() {
            return Err(SqrlError::HintLocked);
        }
        match slot {
            KeySlot::Mk | KeySlot::Ilk => {
                self.decrypt_access_block(client, op)?
            }
            KeySlot::Iuk => self.decrypt_rescue_block(client, op)?,
            _ => self.decrypt_previous_block(client, op)?,
        }
        if self.keys.get(slot).is_none() {
            return Err(SqrlError::KeyNotPresent(slot));
        }
        Ok(())
    }

    fn ensure_previous_keys(
        &mut self,
        client: &dyn ClientCallbacks,
        op: Operation,
    ) -> SqrlResult<()> {
        if self.previous_block.is_some() && self.keys.piuk_len() == 0 {
            if self.keys.is_hint_locked() {
                return Err(SqrlError::HintLocked);
            }
            self.decrypt_previous_block(client, op)?;
        }
        Ok(())
    }

    fn decrypt_access_block(
        &mut self,
        client: &dyn ClientCallbacks,
        op: Operation,
    ) -> SqrlResult<()> {
        let block = self
            .access_block
            .clone()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;
        let mut b = block.clone();
        b.seek(4)?;
        let pt_len = b.read_u16()?;
        if pt_len as usize != ACCESS_AAD_LEN {
            return Err(malformed(format!(
                "bad access block plaintext length {pt_len}"
            )));
        }
        let mut iv = [0_u8; GCM_IV_LEN];
        b.read(&mut iv)?;
        let mut salt = [0_u8; SALT_LEN];
        b.read(&mut salt)?;
        let log_n = b.read_u8()?;
        let iterations = b.read_u32()?;
        // option fields were adopted at load
        b.seek_by(6)?;
        let mut payload = Zeroizing::new([0_u8; KEY_LEN * 2]);
        b.read(&mut payload[..])?;
        let mut tag = [0_u8; GCM_TAG_LEN];
        b.read(&mut tag)?;

        let password = match self.keys.password.clone() {
            Some(p) => p,
            None => client
                .authentication_required(op, CredentialKind::Password)
                .ok_or(SqrlError::CredentialRequired(
                    CredentialKind::Password,
                ))?,
        };
        let mut progress = |p| client.progress(op, p);
        let (pw_key, _) = crypto::en_scrypt(
            password.as_bytes(),
            &salt,
            log_n,
            EnScryptEffort::Iterations(iterations),
            &mut progress,
        )?;
        crypto::gcm_decrypt(
            &pw_key,
            &iv,
            &block.as_bytes()[..ACCESS_AAD_LEN],
            &mut payload[..],
            &tag,
        )?;

        self.keys.set_master_keys(
            KeyMaterial::from_slice(&payload[..KEY_LEN]),
            KeyMaterial::from_slice(&payload[KEY_LEN..]),
        );
        // the password proved itself; cache it for hint lock and re-save
        self.keys.password = Some(password);
        Ok(())
    }

    fn decrypt_rescue_block(
        &mut self,
        client: &dyn ClientCallbacks,
        op: Operation,
    ) -> SqrlResult<()> {
        let block = self
            .rescue_block
            .clone()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Iuk))?;
        let mut b = block.clone();
        b.seek(4)?;
        let mut salt = [0_u8; SALT_LEN];
        b.read(&mut salt)?;
        let log_n = b.read_u8()?;
        let iterations = b.read_u32()?;
        let mut payload = Zeroizing::new([0_u8; KEY_LEN]);
        b.read(&mut payload[..])?;
        let mut tag = [0_u8; GCM_TAG_LEN];
        b.read(&mut tag)?;

        // no length or format pre-check: a malformed rescue code runs the
        // full derivation and fails exactly like a wrong one
        let rescue_code = match self.keys.rescue_code.clone() {
            Some(code) => code,
            None => client
                .authentication_required(op, CredentialKind::RescueCode)
                .ok_or(SqrlError::CredentialRequired(
                    CredentialKind::RescueCode,
                ))?,
        };

        let mut progress = |p| client.progress(op, p);
        let (key, _) = crypto::en_scrypt(
            rescue_code.as_bytes(),
            &salt,
            log_n,
            EnScryptEffort::Iterations(iterations),
            &mut progress,
        )?;
        crypto::gcm_decrypt(
            &key,
            &ZERO_IV,
            &block.as_bytes()[..RESCUE_AAD_LEN],
            &mut payload[..],
            &tag,
        )?;

        self.keys
            .set_iuk_only(KeyMaterial::from_slice(&payload[..]));
        self.keys.rescue_code = Some(rescue_code);
        Ok(())
    }

    fn decrypt_previous_block(
        &mut self,
        client: &dyn ClientCallbacks,
        op: Operation,
    ) -> SqrlResult<()> {
        let block = self
            .previous_block
            .clone()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Piuk0))?;
        let count = piuk_count_of(&block)?;
        self.ensure_key(KeySlot::Mk, client, op)?;
        let mk = self
            .keys
            .get(KeySlot::Mk)
            .cloned()
            .ok_or(SqrlError::KeyNotPresent(KeySlot::Mk))?;

        let mut b = block.clone();
        b.seek(4)?;
        let mut payload = Zeroizing::new(vec![0_u8; count * KEY_LEN]);
        b.read(&mut payload)?;
        let mut tag = [0_u8; GCM_TAG_LEN];
        b.read(&mut tag)?;

        crypto::gcm_decrypt(
            mk.as_bytes(),
            &ZERO_IV,
            &block.as_bytes()[..PREVIOUS_AAD_LEN],
            &mut payload,
            &tag,
        )?;

        for i in 0..count {
            self.keys.set_piuk(
                i,
                KeyMaterial::from_slice(&payload[i * KEY_LEN..]),
            );
        }
        Ok(())
    }

    // -- helpers -- //

    /// The cached password, or a brand-new one from the host.
    ///
    /// A stored password only enters the cache by proving itself during
    /// block decryption; a password prompted here is treated as new and
    /// marked dirty, so it re-encrypts under a fresh salt and timed run
    /// rather than replaying stored parameters it never matched.
    fn obtain_password(
        &mut self,
        client: &dyn ClientCallbacks,
        op: Operation,
    ) -> SqrlResult<Zeroizing<String>> {
        if let Some(password) = self.keys.password.as_ref() {
            return Ok(password.clone());
        }
        let password = client
            .authentication_required(op, CredentialKind::NewPassword)
            .ok_or(SqrlError::CredentialRequired(
                CredentialKind::NewPassword,
            ))?;
        self.keys.password = Some(password.clone());
        self.password_dirty = true;
        Ok(password)
    }

    fn adopt_access_options(&mut self, block: &Block) -> SqrlResult<()> {
        if block.len() != ACCESS_BLOCK_LEN {
            return Err(malformed(format!(
                "bad access block length {}",
                block.len()
            )));
        }
        let mut b = block.clone();
        b.seek(4)?;
        let pt_len = b.read_u16()?;
        if pt_len as usize != ACCESS_AAD_LEN {
            return Err(malformed(format!(
                "bad access block plaintext length {pt_len}"
            )));
        }
        b.seek(34)?;
        self.options.log_n_factor = b.read_u8()?;
        b.seek_by(4)?;
        self.options.option_flags = b.read_u16()?;
        self.options.hint_length = b.read_u8()?;
        self.options.pw_verify_sec = b.read_u8()?;
        self.options.idle_timeout_min = b.read_u16()?;
        Ok(())
    }
}

/// The stored KDF parameters of an access block, replayed when a clean
/// password re-encrypts without a fresh timed run.
struct AccessKdfParams {
    salt: [u8; SALT_LEN],
    log_n: u8,
    iterations: u32,
}

impl AccessKdfParams {
    fn read(block: &Block) -> SqrlResult<Self> {
        let mut b = block.clone();
        // past the header, plaintext length and IV
        b.seek((4 + 2 + GCM_IV_LEN) as u16)?;
        let mut salt = [0_u8; SALT_LEN];
        b.read(&mut salt)?;
        let log_n = b.read_u8()?;
        let iterations = b.read_u32()?;
        Ok(Self {
            salt,
            log_n,
            iterations,
        })
    }
}

fn piuk_count_of(block: &Block) -> SqrlResult<usize> {
    let len = block.len() as usize;
    let overhead = 4 + GCM_TAG_LEN;
    if len < overhead + KEY_LEN || (len - overhead) % KEY_LEN != 0 {
        return Err(malformed(format!(
            "bad previous-keys block length {len}"
        )));
    }
    let count = (len - overhead) / KEY_LEN;
    if count > PIUK_COUNT {
        return Err(malformed(format!(
            "previous-keys block holds {count} keys"
        )));
    }
    Ok(count)
}

fn malformed(msg: impl Into<String>) -> SqrlError {
    sqrl_s4::S4Error::MalformedBlock(msg.into()).into()
}
