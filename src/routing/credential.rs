//! Per-provider credential pool and rotation strategies (section 4.1/4.8).
//!
//! A provider's configured API keys are held here as a small ring that
//! Dispatch draws from on every attempt. Keys never leave this module: the
//! pool hands out an index plus the header pair to attach, never the raw
//! key string to a log line.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use serde::Deserialize;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationStrategy {
    RoundRobin,
    RateLimitAware,
}

impl Default for RotationStrategy {
    fn default() -> Self {
        RotationStrategy::RoundRobin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CredentialState {
    Healthy,
    CoolingDown,
    Exhausted,
}

struct Slot {
    key: String,
    state: CredentialState,
    cooldown_until: Option<Instant>,
    /// Stamped on every `select()` that hands this slot out. `None` means
    /// never used, which sorts ahead of any timestamp.
    last_used: Option<Instant>,
}

/// Fingerprint used in logs and diagnostics instead of the raw key.
pub fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    format!("{:x}", digest)[..12].to_string()
}

struct Inner {
    slots: Vec<Slot>,
    next: usize,
}

/// Rotation over a provider's configured credentials. Every mutation happens
/// under one short-lived lock; nothing here awaits.
pub struct CredentialPool {
    strategy: RotationStrategy,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CredentialPool {
    pub fn new(keys: Vec<String>, strategy: RotationStrategy, cooldown: Duration) -> Self {
        let slots = keys
            .into_iter()
            .map(|key| Slot {
                key,
                state: CredentialState::Healthy,
                cooldown_until: None,
                last_used: None,
            })
            .collect();
        Self {
            strategy,
            cooldown,
            inner: Mutex::new(Inner { slots, next: 0 }),
        }
    }

    /// Select the next usable credential, expiring any cooldowns whose
    /// deadline has passed. Returns `None` when every key is exhausted or
    /// still cooling down.
    pub fn select(&self) -> Option<CredentialHandle> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();

        for slot in inner.slots.iter_mut() {
            if slot.state == CredentialState::CoolingDown {
                if let Some(until) = slot.cooldown_until {
                    if now >= until {
                        slot.state = CredentialState::Healthy;
                        slot.cooldown_until = None;
                    }
                }
            }
        }

        let len = inner.slots.len();
        if len == 0 {
            return None;
        }

        let idx = match self.strategy {
            RotationStrategy::RoundRobin => {
                let mut found = None;
                for offset in 0..len {
                    let idx = (inner.next + offset) % len;
                    if inner.slots[idx].state == CredentialState::Healthy {
                        inner.next = (idx + 1) % len;
                        found = Some(idx);
                        break;
                    }
                }
                found?
            }
            RotationStrategy::RateLimitAware => {
                // Oldest last-use timestamp among healthy slots; a slot never
                // used before (`None`) sorts ahead of any stamped timestamp.
                inner
                    .slots
                    .iter()
                    .enumerate()
                    .filter(|(_, s)| s.state == CredentialState::Healthy)
                    .min_by_key(|(_, s)| s.last_used.map(|t| (true, t)).unwrap_or((false, now)))
                    .map(|(i, _)| i)?
            }
        };

        inner.slots[idx].last_used = Some(now);
        Some(CredentialHandle {
            index: idx,
            key: inner.slots[idx].key.clone(),
        })
    }

    /// Mark a credential as rate-limited; it re-enters rotation after the
    /// configured cooldown elapses.
    pub fn mark_cooling_down(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.get_mut(index) {
            slot.state = CredentialState::CoolingDown;
            slot.cooldown_until = Some(Instant::now() + self.cooldown);
        }
    }

    /// Mark a credential as permanently unusable for this process lifetime
    /// (401/403 classification). Monotone: never transitions back to healthy.
    pub fn mark_exhausted(&self, index: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(slot) = inner.slots.get_mut(index) {
            slot.state = CredentialState::Exhausted;
            slot.cooldown_until = None;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().slots.len()
    }

    /// `(healthy, total)` for the `/routes` introspection endpoint. Expires
    /// due cooldowns first so the count reflects current reality rather than
    /// the state as of the last `select`.
    pub fn health_counts(&self) -> (usize, usize) {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        for slot in inner.slots.iter_mut() {
            if slot.state == CredentialState::CoolingDown {
                if let Some(until) = slot.cooldown_until {
                    if now >= until {
                        slot.state = CredentialState::Healthy;
                        slot.cooldown_until = None;
                    }
                }
            }
        }
        let healthy = inner.slots.iter().filter(|s| s.state == CredentialState::Healthy).count();
        (healthy, inner.slots.len())
    }

    /// Non-consuming peek used by the Router (section 4.3) to decide whether a
    /// binding is even worth attaching to the envelope. Expires due cooldowns
    /// as a side effect (cheap, and keeps the view consistent with `select`)
    /// but never advances the round-robin cursor.
    pub fn has_healthy(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        for slot in inner.slots.iter_mut() {
            if slot.state == CredentialState::CoolingDown {
                if let Some(until) = slot.cooldown_until {
                    if now >= until {
                        slot.state = CredentialState::Healthy;
                        slot.cooldown_until = None;
                    }
                }
            }
        }
        inner.slots.iter().any(|s| s.state == CredentialState::Healthy)
    }
}

#[derive(Debug, Clone)]
pub struct CredentialHandle {
    pub index: usize,
    pub key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_cycles_through_all_keys() {
        let pool = CredentialPool::new(
            vec!["a".into(), "b".into(), "c".into()],
            RotationStrategy::RoundRobin,
            Duration::from_secs(30),
        );
        let first = pool.select().unwrap().key;
        let second = pool.select().unwrap().key;
        let third = pool.select().unwrap().key;
        let fourth = pool.select().unwrap().key;
        assert_eq!(vec![first, second, third], vec!["a", "b", "c"]);
        assert_eq!(fourth, "a");
    }

    #[test]
    fn cooling_down_credential_is_skipped_until_deadline() {
        let pool = CredentialPool::new(
            vec!["a".into(), "b".into()],
            RotationStrategy::RoundRobin,
            Duration::from_millis(10),
        );
        let handle = pool.select().unwrap();
        assert_eq!(handle.index, 0);
        pool.mark_cooling_down(0);
        let next = pool.select().unwrap();
        assert_eq!(next.key, "b");
        std::thread::sleep(Duration::from_millis(20));
        let revived = pool.select().unwrap();
        assert_eq!(revived.key, "a");
    }

    #[test]
    fn exhausted_credential_never_returns() {
        let pool = CredentialPool::new(
            vec!["a".into()],
            RotationStrategy::RoundRobin,
            Duration::from_millis(10),
        );
        pool.mark_exhausted(0);
        assert!(pool.select().is_none());
    }

    #[test]
    fn has_healthy_reports_false_once_all_exhausted() {
        let pool = CredentialPool::new(vec!["a".into()], RotationStrategy::RoundRobin, Duration::from_millis(10));
        assert!(pool.has_healthy());
        pool.mark_exhausted(0);
        assert!(!pool.has_healthy());
    }

    #[test]
    fn health_counts_reflects_exhaustion() {
        let pool = CredentialPool::new(vec!["a".into(), "b".into()], RotationStrategy::RoundRobin, Duration::from_millis(10));
        assert_eq!(pool.health_counts(), (2, 2));
        pool.mark_exhausted(0);
        assert_eq!(pool.health_counts(), (1, 2));
    }

    #[test]
    fn rate_limit_aware_prefers_oldest_last_used() {
        let pool = CredentialPool::new(
            vec!["a".into(), "b".into(), "c".into()],
            RotationStrategy::RateLimitAware,
            Duration::from_secs(30),
        );
        // All start unused; the first selection just needs a healthy slot.
        let first = pool.select().unwrap();
        std::thread::sleep(Duration::from_millis(5));
        // "first" is now the most recently used, so the next call must avoid
        // it in favor of one of the two still-untouched slots.
        let second = pool.select().unwrap();
        assert_ne!(second.key, first.key);
        std::thread::sleep(Duration::from_millis(5));
        let third = pool.select().unwrap();
        assert_ne!(third.key, first.key);
        assert_ne!(third.key, second.key);

        // Every slot has now been used once, oldest first; the cycle repeats.
        let fourth = pool.select().unwrap();
        assert_eq!(fourth.key, first.key);
    }

    #[test]
    fn fingerprint_is_stable_and_short() {
        let f1 = fingerprint("sk-abc123");
        let f2 = fingerprint("sk-abc123");
        assert_eq!(f1, f2);
        assert_eq!(f1.len(), 12);
    }
}
