//! End-to-end identity scenarios: create, rekey, export, re-import.

use once_cell::sync::Lazy;
use sqrl_identity::{
    ClientCallbacks, CredentialKind, Encoding, ExportScope, Identity,
    IdentityOptions, KeySlot, Operation, SqrlError,
};
use sqrl_s4::Storage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use zeroize::Zeroizing;

const PASSWORD: &str = "the password";

/// Keeps the process entropy pool fed while a test runs, the way a host
/// application would keep the collector supplied with events.
struct PoolFeeder {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl PoolFeeder {
    fn start() -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = stop.clone();
            std::thread::spawn(move || {
                let pool = sqrl_identity::entropy::pool();
                while !stop.load(Ordering::Relaxed) {
                    pool.add(&[0xa5; 16384]);
                    std::thread::sleep(Duration::from_millis(1));
                }
            })
        };
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for PoolFeeder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[derive(Default)]
struct TestClient {
    password: Option<String>,
    rescue_code: Option<String>,
    hint: Option<String>,
    cancel_at: Option<u8>,
}

impl TestClient {
    fn new() -> Self {
        Self::default()
    }

    fn password(mut self, password: &str) -> Self {
        self.password = Some(password.to_string());
        self
    }

    fn rescue_code(mut self, code: &str) -> Self {
        self.rescue_code = Some(code.to_string());
        self
    }

    fn hint(mut self, hint: &str) -> Self {
        self.hint = Some(hint.to_string());
        self
    }

    fn cancel_at(mut self, percent: u8) -> Self {
        self.cancel_at = Some(percent);
        self
    }
}

impl ClientCallbacks for TestClient {
    fn authentication_required(
        &self,
        _op: Operation,
        kind: CredentialKind,
    ) -> Option<Zeroizing<String>> {
        let secret = match kind {
            CredentialKind::Password | CredentialKind::NewPassword => {
                self.password.clone()
            }
            CredentialKind::RescueCode => self.rescue_code.clone(),
            CredentialKind::Hint => self.hint.clone(),
        };
        secret.map(Zeroizing::new)
    }

    fn progress(&self, _op: Operation, percent: u8) -> bool {
        match self.cancel_at {
            Some(at) => percent < at,
            None => true,
        }
    }
}

fn fast_options() -> IdentityOptions {
    IdentityOptions {
        pw_verify_sec: 1,
        rescue_verify_sec: 1,
        hint_verify_sec: 1,
        ..Default::default()
    }
}

/// A saved identity shared by the read-only scenarios.
struct Fixture {
    export: Vec<u8>,
    rescue: String,
    mk: Vec<u8>,
    iuk: Vec<u8>,
}

static FIXTURE: Lazy<Fixture> = Lazy::new(|| {
    let client = TestClient::new().password(PASSWORD);
    let mut identity = Identity::create().unwrap();
    identity.set_options(fast_options());
    identity.set_password(PASSWORD);
    identity.rekey(&client).unwrap();
    let mk = identity
        .key(KeySlot::Mk, &client)
        .unwrap()
        .as_bytes()
        .to_vec();
    let iuk = identity
        .key(KeySlot::Iuk, &client)
        .unwrap()
        .as_bytes()
        .to_vec();
    let rescue = identity.rescue_code().unwrap().to_string();
    let export = identity
        .save(Encoding::Base64, ExportScope::All, &client)
        .unwrap();
    Fixture {
        export,
        rescue,
        mk,
        iuk,
    }
});

#[test]
fn s1_round_trip_through_base64_export() {
    let _feeder = PoolFeeder::start();
    let client = TestClient::new().password(PASSWORD);

    let mut identity = Identity::create().unwrap();
    identity.set_options(fast_options());
    identity.set_password(PASSWORD);
    for _ in 0..4 {
        identity.rekey(&client).unwrap();
    }

    let slots = [
        KeySlot::Piuk3,
        KeySlot::Piuk2,
        KeySlot::Piuk1,
        KeySlot::Piuk0,
        KeySlot::Iuk,
        KeySlot::Ilk,
        KeySlot::Mk,
    ];
    let mut saved = Vec::new();
    for slot in slots {
        saved.extend_from_slice(
            identity.key(slot, &client).unwrap().as_bytes(),
        );
    }
    assert_eq!(224, saved.len());
    let rescue = identity.rescue_code().unwrap().to_string();

    let export = identity
        .save(Encoding::Base64, ExportScope::All, &client)
        .unwrap();
    assert_eq!(470, export.len());
    drop(identity);

    let client =
        TestClient::new().password(PASSWORD).rescue_code(&rescue);
    let mut restored = Identity::load(&export).unwrap();
    let mut loaded = Vec::new();
    for slot in slots {
        loaded.extend_from_slice(
            restored.key(slot, &client).unwrap().as_bytes(),
        );
    }
    assert_eq!(saved, loaded);
}

#[test]
fn s2_wrong_password_fails_uniformly() {
    let _feeder = PoolFeeder::start();
    let fixture = &*FIXTURE;

    let client = TestClient::new().password("the passworD");
    let mut identity = Identity::load(&fixture.export).unwrap();
    let err = identity.key(KeySlot::Mk, &client).unwrap_err();
    assert!(matches!(err, SqrlError::BadTag));

    // the right password still works afterwards
    let client = TestClient::new().password(PASSWORD);
    let mk = identity.key(KeySlot::Mk, &client).unwrap();
    assert_eq!(fixture.mk, mk.as_bytes().to_vec());
}

#[test]
fn s3_hint_lock_cycle() {
    let _feeder = PoolFeeder::start();
    let fixture = &*FIXTURE;

    let client = TestClient::new().password(PASSWORD).hint(&PASSWORD[..4]);
    let mut identity = Identity::load(&fixture.export).unwrap();
    assert!(!identity.is_hint_locked());

    let before = identity.key(KeySlot::Mk, &client).unwrap();
    identity.hint_lock(&client).unwrap();
    assert!(identity.is_hint_locked());
    assert!(matches!(
        identity.key(KeySlot::Mk, &client),
        Err(SqrlError::HintLocked)
    ));

    // a wrong hint fails like any other bad credential, and the vault
    // survives for another attempt
    let wrong = TestClient::new().hint("thx ");
    assert!(matches!(
        identity.hint_unlock(&wrong),
        Err(SqrlError::BadTag)
    ));
    assert!(identity.is_hint_locked());

    identity.hint_unlock(&client).unwrap();
    assert!(!identity.is_hint_locked());
    let after = identity.key(KeySlot::Mk, &client).unwrap();
    assert_eq!(before.as_bytes(), after.as_bytes());
}

#[test]
fn s6_save_cancels_through_the_progress_callback() {
    let _feeder = PoolFeeder::start();

    let mut identity = Identity::create().unwrap();
    identity.set_options(fast_options());
    identity.set_password(PASSWORD);
    let client = TestClient::new().password(PASSWORD).cancel_at(20);
    let err = identity
        .save(Encoding::Base64, ExportScope::All, &client)
        .unwrap_err();
    assert!(matches!(err, SqrlError::Cancelled));
}

#[test]
fn flipped_bits_fail_decryption() {
    let _feeder = PoolFeeder::start();
    let fixture = &*FIXTURE;
    let raw = Storage::parse(&fixture.export).unwrap().to_bytes();

    // type 1 spans bytes 0..125: additional authenticated data (option
    // flags at 39), ciphertext (45..109) and the tag (109..125)
    for offset in [40_usize, 50, 80, 110] {
        let mut tampered = raw.clone();
        tampered[offset] ^= 0x01;
        let client = TestClient::new().password(PASSWORD);
        let mut identity = Identity::load(&tampered).unwrap();
        let err = identity.key(KeySlot::Mk, &client).unwrap_err();
        assert!(matches!(err, SqrlError::BadTag), "offset {offset}");
    }

    // type 2 spans bytes 125..198; flip inside the encrypted unlock key
    let mut tampered = raw.clone();
    tampered[160] ^= 0x01;
    let client = TestClient::new()
        .password(PASSWORD)
        .rescue_code(&fixture.rescue);
    let mut identity = Identity::load(&tampered).unwrap();
    let err = identity.key(KeySlot::Iuk, &client).unwrap_err();
    assert!(matches!(err, SqrlError::BadTag));
}

#[test]
fn rescue_only_export_recovers_the_unlock_key() {
    let _feeder = PoolFeeder::start();
    let fixture = &*FIXTURE;

    let client = TestClient::new()
        .password(PASSWORD)
        .rescue_code(&fixture.rescue);
    let mut identity = Identity::load(&fixture.export).unwrap();
    let export = identity
        .save(Encoding::Binary, ExportScope::RescueOnly, &client)
        .unwrap();
    // binary signature plus the 73-byte rescue block
    assert_eq!(8 + 73, export.len());

    let mut recovered = Identity::load(&export).unwrap();
    let iuk = recovered.key(KeySlot::Iuk, &client).unwrap();
    assert_eq!(fixture.iuk, iuk.as_bytes().to_vec());
    assert!(matches!(
        recovered.key(KeySlot::Mk, &client),
        Err(SqrlError::KeyNotPresent(KeySlot::Mk))
    ));

    // a wrong rescue code fails uniformly
    let wrong = TestClient::new().rescue_code(&"0".repeat(24));
    let mut recovered = Identity::load(&export).unwrap();
    assert!(matches!(
        recovered.key(KeySlot::Iuk, &wrong),
        Err(SqrlError::BadTag)
    ));

    // so does a malformed one: no length or digit-format oracle
    let malformed = TestClient::new().rescue_code("not-a-rescue-code");
    let mut recovered = Identity::load(&export).unwrap();
    assert!(matches!(
        recovered.key(KeySlot::Iuk, &malformed),
        Err(SqrlError::BadTag)
    ));
}

#[test]
fn rekey_after_load_exports_the_fresh_keys() {
    let _feeder = PoolFeeder::start();

    // an identity with no previous keys: the rekey below only ever needs
    // the rescue code, so the password stays uncached throughout
    let client = TestClient::new().password(PASSWORD);
    let mut identity = Identity::create().unwrap();
    identity.set_options(fast_options());
    identity.set_password(PASSWORD);
    let old_mk = identity.key(KeySlot::Mk, &client).unwrap();
    let rescue = identity.rescue_code().unwrap().to_string();
    let export = identity
        .save(Encoding::Base64, ExportScope::All, &client)
        .unwrap();
    drop(identity);

    let client = TestClient::new().password(PASSWORD).rescue_code(&rescue);
    let mut identity = Identity::load(&export).unwrap();
    identity.rekey(&client).unwrap();
    let new_iuk = identity.key(KeySlot::Iuk, &client).unwrap();
    let new_rescue = identity.rescue_code().unwrap().to_string();
    let export = identity
        .save(Encoding::Base64, ExportScope::All, &client)
        .unwrap();

    // the export must carry the post-rekey master key, not the stale one
    // decrypted from the pre-rekey block
    let client = TestClient::new()
        .password(PASSWORD)
        .rescue_code(&new_rescue);
    let mut reloaded = Identity::load(&export).unwrap();
    let mk = reloaded.key(KeySlot::Mk, &client).unwrap();
    assert_eq!(
        &sqrl_identity::crypto::en_hash(new_iuk.as_bytes()),
        mk.as_bytes()
    );
    assert_ne!(old_mk.as_bytes(), mk.as_bytes());
    assert_eq!(
        new_iuk.as_bytes(),
        reloaded.key(KeySlot::Iuk, &client).unwrap().as_bytes()
    );
    assert_eq!(
        old_mk.as_bytes(),
        &sqrl_identity::crypto::en_hash(
            reloaded.key(KeySlot::Piuk0, &client).unwrap().as_bytes()
        )
    );
}

#[test]
fn saved_documents_reload_to_identical_bytes() {
    let _feeder = PoolFeeder::start();
    let fixture = &*FIXTURE;

    // an untouched load/save cycle reuses every stored block verbatim
    let client = TestClient::new();
    let mut identity = Identity::load(&fixture.export).unwrap();
    let again = identity
        .save(Encoding::Base64, ExportScope::All, &client)
        .unwrap();
    assert_eq!(fixture.export, again);
}
