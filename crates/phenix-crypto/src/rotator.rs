//! Periodic replacement of the local hybrid keypair.
//!
//! Rotation is a pure decision over elapsed time ([`should_rotate`]); the
//! caller supplies `now`, so nothing here owns a timer. Retired keypairs stay
//! in a bounded history so ciphertexts encapsulated just before a rotation
//! still open, until the grace period or the capacity drops them.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{hex, CryptoError};
use crate::hybrid::{HybridCiphertext, HybridKeyPair, HybridSharedSecret, KeyId};

pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(60 * 60);
pub const DEFAULT_HISTORY_SIZE: usize = 10;
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationConfig {
    pub interval: Duration,
    /// Retired keypairs kept for late ciphertexts. Zero disables history.
    pub history_size: usize,
    pub grace_period: Duration,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            interval: DEFAULT_ROTATION_INTERVAL,
            history_size: DEFAULT_HISTORY_SIZE,
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationState {
    pub interval: Duration,
    pub last_rotation: Instant,
}

/// True once `interval` has fully elapsed since the last rotation.
pub fn should_rotate(state: &RotationState, now: Instant) -> bool {
    now.saturating_duration_since(state.last_rotation) >= state.interval
}

struct RetiredKey {
    keypair: HybridKeyPair,
    retired_at: Instant,
}

/// Bounded ring of retired keypairs, oldest first.
pub struct KeyHistory {
    entries: VecDeque<RetiredKey>,
    capacity: usize,
}

impl KeyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append, evicting the oldest entry when full.
    pub fn push(&mut self, keypair: HybridKeyPair, retired_at: Instant) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            if let Some(evicted) = self.entries.pop_front() {
                debug!(key_id = %evicted.keypair.fingerprint(), "evicted key from history");
            }
        }
        self.entries.push_back(RetiredKey { keypair, retired_at });
    }

    /// Drop entries retired longer than `grace` ago. Returns how many went.
    pub fn prune(&mut self, now: Instant, grace: Duration) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|entry| now.saturating_duration_since(entry.retired_at) <= grace);
        before - self.entries.len()
    }

    pub fn find(&self, key_id: &KeyId) -> Option<&HybridKeyPair> {
        self.entries
            .iter()
            .rev()
            .map(|entry| &entry.keypair)
            .find(|kp| &kp.key_id() == key_id)
    }

    pub fn key_ids(&self) -> impl Iterator<Item = KeyId> + '_ {
        self.entries.iter().map(|entry| entry.keypair.key_id())
    }
}

/// Owns the current keypair and its retired predecessors.
pub struct KeyRotator {
    current: HybridKeyPair,
    history: KeyHistory,
    state: RotationState,
    grace_period: Duration,
}

impl KeyRotator {
    pub fn new(config: RotationConfig, now: Instant) -> Self {
        Self::with_keypair(config, HybridKeyPair::generate(), now)
    }

    pub fn with_keypair(config: RotationConfig, keypair: HybridKeyPair, now: Instant) -> Self {
        Self {
            current: keypair,
            history: KeyHistory::new(config.history_size),
            state: RotationState {
                interval: config.interval,
                last_rotation: now,
            },
            grace_period: config.grace_period,
        }
    }

    pub fn current(&self) -> &HybridKeyPair {
        &self.current
    }

    pub fn state(&self) -> RotationState {
        self.state
    }

    pub fn history(&self) -> &KeyHistory {
        &self.history
    }

    pub fn should_rotate(&self, now: Instant) -> bool {
        should_rotate(&self.state, now)
    }

    /// Generate a new current keypair, retiring the old one into history.
    pub fn rotate(&mut self, now: Instant) -> &HybridKeyPair {
        let previous = std::mem::replace(&mut self.current, HybridKeyPair::generate());
        info!(
            old = %previous.fingerprint(),
            new = %self.current.fingerprint(),
            "rotated hybrid keypair"
        );
        self.history.push(previous, now);
        self.state.last_rotation = now;
        &self.current
    }

    /// Forget retired keys older than the grace period.
    pub fn prune(&mut self, now: Instant) -> usize {
        let dropped = self.history.prune(now, self.grace_period);
        if dropped > 0 {
            debug!(dropped, "pruned expired keys from history");
        }
        dropped
    }

    /// Current keypair or a retained retired one.
    pub fn find(&self, key_id: &KeyId) -> Option<&HybridKeyPair> {
        if &self.current.key_id() == key_id {
            return Some(&self.current);
        }
        self.history.find(key_id)
    }

    /// Decapsulate with whichever retained keypair the ciphertext names.
    pub fn decapsulate(&self, ciphertext: &HybridCiphertext) -> Result<HybridSharedSecret, CryptoError> {
        let key_id = ciphertext.key_id();
        match self.find(&key_id) {
            Some(keypair) => keypair.decapsulate(ciphertext),
            None => {
                debug!(key_id = %hex(&key_id), "no retained key for ciphertext");
                Err(CryptoError::UnknownKey(key_id))
            }
        }
    }
}
