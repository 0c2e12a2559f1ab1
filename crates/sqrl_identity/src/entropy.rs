//! Process-wide entropy pool.
//!
//! The pool accumulates environmental samples into a running SHA-512 state
//! alongside a conservative estimated-bits counter. A single long-lived
//! collector thread feeds it: quickly (about 50 Hz) while the estimate is
//! under target, slowly (about 5 Hz) once it is met. Consumers drain the
//! whole estimate at once; the pool is process-wide because splitting it
//! would split the collected entropy too.
//!
//! Draining brackets the hash finalization with extra fast-flux input and
//! folds the emitted output back into the fresh state, so a snapshot of the
//! pool state predicts neither earlier nor later outputs.

use crate::crypto;
use crate::{SqrlError, SqrlResult};
use once_cell::sync::Lazy;
use rand::RngCore;
use sha2::{Digest, Sha512};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use zeroize::{Zeroize, Zeroizing};

/// Default estimated-bits target of the pool.
pub const ENTROPY_TARGET_BITS: usize = 512;

const FAST_TICK: Duration = Duration::from_millis(20);
const SLOW_TICK: Duration = Duration::from_millis(200);

static FLUX_COUNTER: AtomicU64 = AtomicU64::new(0);
static MONOTONIC_BASE: Lazy<Instant> = Lazy::new(Instant::now);

struct Global {
    pool: Arc<EntropyPool>,
    collector: JoinHandle<()>,
}

static GLOBAL: Lazy<Mutex<Option<Global>>> = Lazy::new(|| Mutex::new(None));

/// Obtain the process-wide pool, lazily starting it (and its collector
/// thread) on first access or after a [`shutdown`].
pub fn pool() -> Arc<EntropyPool> {
    let mut global = GLOBAL.lock().unwrap();
    match global.as_ref() {
        Some(g) if !g.pool.is_stopped() => g.pool.clone(),
        _ => {
            let (pool, collector) = EntropyPool::start();
            *global = Some(Global {
                pool: pool.clone(),
                collector,
            });
            pool
        }
    }
}

/// Stop the collector and tear the process-wide pool down.
///
/// In-flight blocking consumers return zero; the next [`pool`] call
/// re-initializes from scratch.
pub fn shutdown() {
    let taken = GLOBAL.lock().unwrap().take();
    if let Some(global) = taken {
        global.pool.stop();
        let _ = global.collector.join();
    }
}

struct PoolState {
    hash: Sha512,
    estimated: usize,
    target: usize,
    stopping: bool,
}

/// Background-fed SHA-512 entropy pool with estimated-bits accounting.
pub struct EntropyPool {
    state: Mutex<PoolState>,
    cond: Condvar,
}

impl EntropyPool {
    fn bare() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(PoolState {
                hash: Sha512::new(),
                estimated: 0,
                target: ENTROPY_TARGET_BITS,
                stopping: false,
            }),
            cond: Condvar::new(),
        })
    }

    fn start() -> (Arc<Self>, JoinHandle<()>) {
        let pool = Self::bare();

        // one OS draw through the regular add path seeds the fresh state
        let mut seed = Zeroizing::new([0_u8; 64]);
        rand::rngs::OsRng.fill_bytes(&mut seed[..]);
        pool.add(&seed[..]);

        let collector = {
            let pool = pool.clone();
            std::thread::Builder::new()
                .name("sqrl-entropy".into())
                .spawn(move || pool.collect())
                .expect("spawn entropy collector")
        };
        (pool, collector)
    }

    fn collect(&self) {
        tracing::debug!("entropy collector started");
        loop {
            let tick = {
                let mut state = self.state.lock().unwrap();
                if state.stopping {
                    break;
                }
                state.hash.update(fast_flux());
                state.estimated += 1;
                if state.estimated >= state.target {
                    self.cond.notify_all();
                    SLOW_TICK
                } else {
                    FAST_TICK
                }
            };
            std::thread::sleep(tick);
        }
        let mut state = self.state.lock().unwrap();
        state.estimated = 0;
        self.cond.notify_all();
        tracing::debug!("entropy collector stopped");
    }

    /// Mix caller-supplied bytes, plus a fast-flux sample, into the pool.
    ///
    /// Credits `1 + len/64` estimated bits: at least one bit is assumed per
    /// collection no matter how predictable the input.
    pub fn add(&self, msg: &[u8]) {
        let ffe = fast_flux();
        let mut state = self.state.lock().unwrap();
        if state.stopping {
            return;
        }
        state.hash.update(msg);
        state.hash.update(ffe);
        state.estimated += 1 + msg.len() / 64;
        if state.estimated >= state.target {
            self.cond.notify_all();
        }
    }

    /// Non-blocking drain of the pool into `buf`.
    ///
    /// Fails with [`SqrlError::NoEntropy`] (raising the collection target)
    /// when the estimate is below `desired_bits`; otherwise returns the
    /// estimate that was drained.
    pub fn get(
        &self,
        buf: &mut [u8; 64],
        desired_bits: usize,
    ) -> SqrlResult<usize> {
        let mut state = self.state.lock().unwrap();
        if state.stopping {
            return Err(SqrlError::NoEntropy);
        }
        if state.estimated < desired_bits {
            state.target = desired_bits;
            return Err(SqrlError::NoEntropy);
        }
        Ok(Self::drain(&mut state, buf))
    }

    /// Drain the pool into `buf`, waiting until `desired_bits` are
    /// estimated. Returns the drained estimate, or zero if the pool is
    /// stopped.
    pub fn get_blocking(
        &self,
        buf: &mut [u8; 64],
        desired_bits: usize,
    ) -> usize {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopping {
                return 0;
            }
            if state.estimated >= desired_bits {
                return Self::drain(&mut state, buf);
            }
            if state.target < desired_bits {
                state.target = desired_bits;
            }
            state = self.cond.wait(state).unwrap();
        }
    }

    /// Fill `out` with pool-derived bytes, blocking as needed.
    ///
    /// Up to 64 bytes come straight from one drain; anything beyond is the
    /// ChaCha20 keystream keyed from that drain. Returns the number of
    /// bytes produced (zero if the pool is stopped).
    pub fn bytes(&self, out: &mut [u8]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let desired = (8 * out.len()).min(ENTROPY_TARGET_BITS);
        let mut seed = Zeroizing::new([0_u8; 64]);
        if self.get_blocking(&mut seed, desired) == 0 {
            return 0;
        }
        if out.len() <= 64 {
            out.copy_from_slice(&seed[..out.len()]);
        } else {
            crypto::chacha20_expand(&seed, out);
        }
        out.len()
    }

    /// Estimated bits currently available (zero once stopped).
    pub fn estimate(&self) -> usize {
        let state = self.state.lock().unwrap();
        if state.stopping {
            0
        } else {
            state.estimated
        }
    }

    fn drain(state: &mut PoolState, buf: &mut [u8; 64]) -> usize {
        // bracket: extra flux ahead of finalization...
        state.hash.update(fast_flux());
        let mut digest = state.hash.finalize_reset();
        buf.copy_from_slice(&digest);
        // ...and the emitted output folded into the fresh state
        state.hash.update(digest.as_slice());
        state.hash.update(fast_flux());
        digest.as_mut_slice().zeroize();
        let received = state.estimated;
        state.estimated = 0;
        state.target = ENTROPY_TARGET_BITS;
        received
    }

    fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopping = true;
        self.cond.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopping
    }
}

/// Cheap per-tick environmental sample: wall clock, monotonic clock,
/// process id, thread id, and a process-global counter.
fn fast_flux() -> [u8; 40] {
    use std::hash::{Hash, Hasher};

    let wall = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mono = MONOTONIC_BASE.elapsed().as_nanos() as u64;
    let pid = u64::from(std::process::id());
    let tid = {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        std::thread::current().id().hash(&mut h);
        h.finish()
    };
    let count = FLUX_COUNTER.fetch_add(1, Ordering::Relaxed);

    let mut out = [0_u8; 40];
    out[0..8].copy_from_slice(&wall.to_le_bytes());
    out[8..16].copy_from_slice(&mono.to_le_bytes());
    out[16..24].copy_from_slice(&pid.to_le_bytes());
    out[24..32].copy_from_slice(&tid.to_le_bytes());
    out[32..40].copy_from_slice(&count.to_le_bytes());
    out
}
