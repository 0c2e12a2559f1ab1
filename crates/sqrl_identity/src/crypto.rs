//! Thin typed wrappers over the cryptographic primitives.
//!
//! Nothing above this module names an algorithm: higher layers deal in
//! "the password key", "the verification tag" and so on, and the concrete
//! choices (AES-256-GCM, scrypt, SHA-2, curve25519) stay contained here.

use crate::keys::KEY_LEN;
use crate::{SqrlError, SqrlResult};
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, Zeroizing};

/// AES-GCM initialization vector length in bytes.
pub const GCM_IV_LEN: usize = 12;

/// AES-GCM verification tag length in bytes.
pub const GCM_TAG_LEN: usize = 16;

/// Key-derivation salt length in bytes.
pub const SALT_LEN: usize = 16;

/// Rescue code length in decimal digits.
pub const RESCUE_CODE_LEN: usize = 24;

/// SHA-256 rounds folded into one EnHash output.
pub const ENHASH_ROUNDS: usize = 16;

/// scrypt block size parameter used by EnScrypt.
pub const ENSCRYPT_R: u32 = 256;

/// scrypt parallelization parameter used by EnScrypt.
pub const ENSCRYPT_P: u32 = 1;

/// How long an EnScrypt run should work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnScryptEffort {
    /// Run exactly this many chained scrypt iterations.
    Iterations(u32),

    /// Run whole iterations until this many seconds have elapsed.
    Seconds(u8),
}

/// 16 chained SHA-256 rounds XOR-folded into a single 32-byte output.
pub fn en_hash(input: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut state: [u8; KEY_LEN] = Sha256::digest(input).into();
    let mut out = state;
    for _ in 1..ENHASH_ROUNDS {
        state = Sha256::digest(state).into();
        for (o, s) in out.iter_mut().zip(state.iter()) {
            *o ^= *s;
        }
    }
    state.zeroize();
    out
}

/// Iterated memory-hard key derivation.
///
/// Each iteration runs scrypt (N = 2^`log_n`, r = 256, p = 1); the first is
/// salted with `salt`, every later one with the previous raw output, and all
/// outputs XOR into the returned accumulator. The effort is either a fixed
/// iteration count (the load path, replaying a stored count) or a wall-clock
/// budget (the save path, which records the count actually reached).
///
/// `progress` observes 0..=100 once per iteration; returning `false` aborts
/// with [`SqrlError::Cancelled`] and no derived material survives.
pub fn en_scrypt(
    password: &[u8],
    salt: &[u8],
    log_n: u8,
    effort: EnScryptEffort,
    progress: &mut dyn FnMut(u8) -> bool,
) -> SqrlResult<(Zeroizing<[u8; KEY_LEN]>, u32)> {
    let params = scrypt::Params::new(log_n, ENSCRYPT_R, ENSCRYPT_P, KEY_LEN)
        .map_err(|e| SqrlError::BadKdfParameter(e.to_string()))?;

    let mut acc = Zeroizing::new([0_u8; KEY_LEN]);
    let mut prev = Zeroizing::new([0_u8; KEY_LEN]);
    let started = std::time::Instant::now();
    let mut count: u32 = 0;

    loop {
        let iter_salt: &[u8] = if count == 0 { salt } else { &prev[..] };
        let mut out = Zeroizing::new([0_u8; KEY_LEN]);
        scrypt::scrypt(password, iter_salt, &params, &mut out[..])
            .map_err(|e| SqrlError::BadKdfParameter(e.to_string()))?;
        for (a, o) in acc.iter_mut().zip(out.iter()) {
            *a ^= *o;
        }
        prev.copy_from_slice(&out[..]);
        count += 1;

        let (done, percent) = match effort {
            EnScryptEffort::Iterations(n) => {
                let n = n.max(1);
                let percent =
                    u64::from(count.min(n)) * 100 / u64::from(n);
                (count >= n, percent as u8)
            }
            EnScryptEffort::Seconds(secs) => {
                let target =
                    std::time::Duration::from_secs(u64::from(secs).max(1));
                let elapsed = started.elapsed();
                let percent = (elapsed.as_millis() * 100
                    / target.as_millis())
                .min(100) as u8;
                (elapsed >= target, percent)
            }
        };
        let percent = if done { 100 } else { percent.min(99) };
        if !progress(percent) {
            return Err(SqrlError::Cancelled);
        }
        if done {
            return Ok((acc, count));
        }
    }
}

/// AES-256-GCM encrypt `buf` in place, returning the detached tag.
pub fn gcm_encrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; GCM_IV_LEN],
    aad: &[u8],
    buf: &mut [u8],
) -> SqrlResult<[u8; GCM_TAG_LEN]> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let tag = cipher
        .encrypt_in_place_detached(Nonce::from_slice(iv), aad, buf)
        .map_err(|_| SqrlError::BadTag)?;
    Ok(tag.into())
}

/// AES-256-GCM decrypt `buf` in place against a detached tag.
///
/// Every failure is [`SqrlError::BadTag`]; the buffer is left untouched.
pub fn gcm_decrypt(
    key: &[u8; KEY_LEN],
    iv: &[u8; GCM_IV_LEN],
    aad: &[u8],
    buf: &mut [u8],
    tag: &[u8; GCM_TAG_LEN],
) -> SqrlResult<()> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    cipher
        .decrypt_in_place_detached(
            Nonce::from_slice(iv),
            aad,
            buf,
            Tag::from_slice(tag),
        )
        .map_err(|_| SqrlError::BadTag)
}

/// The Ed25519 public key grown from a 32-byte seed.
pub fn ed25519_public_from_seed(seed: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    ed25519_dalek::SigningKey::from_bytes(seed)
        .verifying_key()
        .to_bytes()
}

/// Sign `msg` with the Ed25519 keypair grown from `seed`.
pub fn ed25519_sign(seed: &[u8; KEY_LEN], msg: &[u8]) -> [u8; 64] {
    use ed25519_dalek::Signer;
    ed25519_dalek::SigningKey::from_bytes(seed).sign(msg).to_bytes()
}

/// Multiply the curve25519 base point by `seed` (lock-key derivation).
pub fn x25519_base_mult(seed: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    x25519_dalek::x25519(*seed, x25519_dalek::X25519_BASEPOINT_BYTES)
}

/// HMAC-SHA256 of `data` under `key` (site-seed derivation).
pub fn hmac_sha256(key: &[u8; KEY_LEN], data: &[u8]) -> [u8; KEY_LEN] {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .expect("hmac accepts a 32-byte key");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

/// Fill `out` with the ChaCha20 keystream keyed from a 64-byte seed
/// (key = bytes 0..32, nonce = bytes 32..44).
pub fn chacha20_expand(seed: &[u8; 64], out: &mut [u8]) {
    use chacha20::cipher::{KeyIvInit, StreamCipher};
    let key = chacha20::Key::from_slice(&seed[0..32]);
    let nonce = chacha20::Nonce::from_slice(&seed[32..44]);
    let mut cipher = chacha20::ChaCha20::new(key, nonce);
    out.fill(0);
    cipher.apply_keystream(out);
}

/// Derive the 24-digit rescue code from 512 bits of pool output.
///
/// The seed is read as eight little-endian u64 lanes; three passes over the
/// lanes each extract one decimal digit per lane by repeated modulo 10.
pub fn bin2rc(seed: &[u8; 64]) -> Zeroizing<String> {
    let mut lanes = Zeroizing::new([0_u64; 8]);
    for (i, lane) in lanes.iter_mut().enumerate() {
        *lane = u64::from_le_bytes(
            seed[i * 8..i * 8 + 8].try_into().expect("8-byte chunk"),
        );
    }
    let mut out = String::with_capacity(RESCUE_CODE_LEN);
    for _ in 0..3 {
        for lane in lanes.iter_mut() {
            out.push(char::from(b'0' + (*lane % 10) as u8));
            *lane /= 10;
        }
    }
    Zeroizing::new(out)
}
