//! Rotating pool of API credentials with per-key rate-limit cooldown.
//!
//! Every outbound attempt leases one credential via [`CredentialPool::acquire`]
//! and hands it back with the attempt's outcome via [`CredentialPool::release`].
//! That pair is the only place cooldown timestamps and failure counters change.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::error::ErrorKind;

/// Largest exponent applied to the cooldown base.
const MAX_BACKOFF_EXPONENT: u32 = 16;

#[derive(Debug, Clone)]
pub struct CredentialPoolConfig {
    /// Cooldown after the first consecutive rate limit.
    pub cooldown_base: Duration,
    /// Upper bound on any cooldown, including provider Retry-After hints.
    pub cooldown_cap: Duration,
    /// How long `acquire` may wait for a cooldown to expire.
    pub max_wait: Duration,
}

impl Default for CredentialPoolConfig {
    fn default() -> Self {
        Self {
            cooldown_base: Duration::from_secs(1),
            cooldown_cap: Duration::from_secs(60),
            max_wait: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("credential pool is empty")]
    Empty,
    #[error("no credential left cooldown within {waited:?}")]
    Exhausted { waited: Duration },
    #[error("all {0} credentials were rejected by the provider")]
    AllRejected(usize),
}

impl CredentialError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::Exhausted
    }
}

/// How a leased credential fared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    /// Provider returned 429; `retry_after` is its hint, if any.
    RateLimited { retry_after: Option<Duration> },
    /// Failure unrelated to the credential (network, malformed, cancelled).
    Failed,
    /// Provider rejected the key itself.
    Rejected,
}

/// A leased credential. Return it with [`CredentialPool::release`].
#[derive(Debug, Clone)]
pub struct Credential {
    index: usize,
    key: Arc<str>,
    label: Arc<str>,
}

impl Credential {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Raw key material, for the provider call only.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Masked label safe to log or persist.
    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Point-in-time view of one credential, for diagnostics and tests.
#[derive(Debug, Clone)]
pub struct CredentialStatus {
    pub label: String,
    pub failures: u32,
    pub cooldown_remaining: Option<Duration>,
    pub leases: usize,
    pub disabled: bool,
}

#[derive(Debug)]
struct Slot {
    key: Arc<str>,
    label: Arc<str>,
    cooldown_until: Option<Instant>,
    failures: u32,
    leases: usize,
    disabled: bool,
}

impl Slot {
    fn usable_at(&self, now: Instant) -> bool {
        !self.disabled && self.cooldown_until.map_or(true, |until| until <= now)
    }
}

#[derive(Debug)]
struct PoolState {
    slots: Vec<Slot>,
    cursor: usize,
}

impl PoolState {
    /// Round-robin from the cursor; idle credentials first, else the least-leased usable one.
    fn select(&self, now: Instant) -> Option<usize> {
        let n = self.slots.len();
        let mut shared: Option<usize> = None;
        for offset in 0..n {
            let idx = (self.cursor + offset) % n;
            let slot = &self.slots[idx];
            if !slot.usable_at(now) {
                continue;
            }
            if slot.leases == 0 {
                return Some(idx);
            }
            match shared {
                Some(best) if self.slots[best].leases <= slot.leases => {}
                _ => shared = Some(idx),
            }
        }
        shared
    }

    fn lease(&mut self, idx: usize) -> Credential {
        self.cursor = (idx + 1) % self.slots.len();
        let slot = &mut self.slots[idx];
        slot.leases += 1;
        Credential {
            index: idx,
            key: slot.key.clone(),
            label: slot.label.clone(),
        }
    }

    fn earliest_cooldown(&self) -> Option<Instant> {
        self.slots
            .iter()
            .filter(|s| !s.disabled)
            .filter_map(|s| s.cooldown_until)
            .min()
    }
}

/// Synchronized credential pool shared by all in-flight calls.
#[derive(Debug)]
pub struct CredentialPool {
    state: Mutex<PoolState>,
    notify: Notify,
    config: CredentialPoolConfig,
}

impl CredentialPool {
    pub fn new<I, S>(keys: I, config: CredentialPoolConfig) -> Result<Self, CredentialError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let slots: Vec<Slot> = keys
            .into_iter()
            .enumerate()
            .map(|(idx, key)| {
                let key: String = key.into();
                Slot {
                    label: mask_key(idx, &key).into(),
                    key: key.into(),
                    cooldown_until: None,
                    failures: 0,
                    leases: 0,
                    disabled: false,
                }
            })
            .collect();

        if slots.is_empty() {
            return Err(CredentialError::Empty);
        }

        Ok(Self {
            state: Mutex::new(PoolState { slots, cursor: 0 }),
            notify: Notify::new(),
            config,
        })
    }

    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn config(&self) -> &CredentialPoolConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lease the next usable credential.
    ///
    /// Waits for the earliest cooldown when every credential is cooling down,
    /// but never longer than `max_wait`.
    pub async fn acquire(&self) -> Result<Credential, CredentialError> {
        let started = Instant::now();
        let deadline = started + self.config.max_wait;

        loop {
            let notified = self.notify.notified();
            let next_expiry = {
                let mut state = self.lock();
                if state.slots.iter().all(|s| s.disabled) {
                    return Err(CredentialError::AllRejected(state.slots.len()));
                }
                if let Some(idx) = state.select(Instant::now()) {
                    return Ok(state.lease(idx));
                }
                state.earliest_cooldown()
            };

            let now = Instant::now();
            if now >= deadline {
                return Err(CredentialError::Exhausted {
                    waited: now - started,
                });
            }

            let wake_at = next_expiry.map_or(deadline, |t| t.min(deadline));
            debug!(
                wait_ms = wake_at.saturating_duration_since(now).as_millis() as u64,
                "All credentials cooling down; waiting"
            );
            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {}
                _ = notified => {}
            }
        }
    }

    /// Return a leased credential and record how the call went.
    pub fn release(&self, credential: Credential, outcome: CallOutcome) {
        {
            let mut state = self.lock();
            let Some(slot) = state.slots.get_mut(credential.index) else {
                return;
            };
            slot.leases = slot.leases.saturating_sub(1);

            match outcome {
                CallOutcome::Success => {
                    slot.failures = 0;
                    slot.cooldown_until = None;
                }
                CallOutcome::RateLimited { retry_after } => {
                    let delay = cooldown_delay(&self.config, slot.failures, retry_after);
                    slot.failures = slot.failures.saturating_add(1);
                    slot.cooldown_until = Some(Instant::now() + delay);
                    warn!(
                        credential = %slot.label,
                        failures = slot.failures,
                        cooldown_ms = delay.as_millis() as u64,
                        "Credential rate limited; cooling down"
                    );
                }
                CallOutcome::Failed => {}
                CallOutcome::Rejected => {
                    slot.disabled = true;
                    warn!(credential = %slot.label, "Credential rejected; disabling");
                }
            }
        }
        self.notify.notify_waiters();
    }

    pub fn snapshot(&self) -> Vec<CredentialStatus> {
        let now = Instant::now();
        self.lock()
            .slots
            .iter()
            .map(|s| CredentialStatus {
                label: s.label.to_string(),
                failures: s.failures,
                cooldown_remaining: s
                    .cooldown_until
                    .filter(|until| *until > now)
                    .map(|until| until - now),
                leases: s.leases,
                disabled: s.disabled,
            })
            .collect()
    }
}

/// base * 2^prior_failures, raised to the provider hint, capped.
fn cooldown_delay(
    config: &CredentialPoolConfig,
    prior_failures: u32,
    retry_after: Option<Duration>,
) -> Duration {
    let exponent = prior_failures.min(MAX_BACKOFF_EXPONENT);
    let backoff = config
        .cooldown_base
        .saturating_mul(2u32.pow(exponent))
        .min(config.cooldown_cap);
    retry_after
        .map_or(backoff, |hint| hint.max(backoff))
        .min(config.cooldown_cap)
}

fn mask_key(index: usize, key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return format!("key#{index}");
    }
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("key#{index}(...{tail})")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(keys: &[&str], config: CredentialPoolConfig) -> CredentialPool {
        CredentialPool::new(keys.iter().copied(), config).unwrap()
    }

    #[test]
    fn empty_pool_is_rejected() {
        let err = CredentialPool::new(Vec::<String>::new(), CredentialPoolConfig::default())
            .unwrap_err();
        assert!(matches!(err, CredentialError::Empty));
    }

    #[test]
    fn labels_never_expose_full_key() {
        assert_eq!(mask_key(0, "sk-or-v1-abcdef123456"), "key#0(...3456)");
        assert_eq!(mask_key(2, "short"), "key#2");
    }

    #[test]
    fn cooldown_grows_exponentially_and_caps() {
        let cfg = CredentialPoolConfig {
            cooldown_base: Duration::from_secs(1),
            cooldown_cap: Duration::from_secs(10),
            max_wait: Duration::from_secs(1),
        };
        assert_eq!(cooldown_delay(&cfg, 0, None), Duration::from_secs(1));
        assert_eq!(cooldown_delay(&cfg, 1, None), Duration::from_secs(2));
        assert_eq!(cooldown_delay(&cfg, 2, None), Duration::from_secs(4));
        assert_eq!(cooldown_delay(&cfg, 8, None), Duration::from_secs(10));
        assert_eq!(
            cooldown_delay(&cfg, 0, Some(Duration::from_secs(5))),
            Duration::from_secs(5)
        );
        assert_eq!(
            cooldown_delay(&cfg, 0, Some(Duration::from_secs(500))),
            Duration::from_secs(10)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn rotates_round_robin() {
        let pool = pool(&["k0", "k1", "k2"], CredentialPoolConfig::default());
        let mut seen = Vec::new();
        for _ in 0..4 {
            let c = pool.acquire().await.unwrap();
            seen.push(c.index());
            pool.release(c, CallOutcome::Success);
        }
        assert_eq!(seen, vec![0, 1, 2, 0]);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_holders_get_distinct_credentials() {
        let pool = pool(&["k0", "k1", "k2"], CredentialPoolConfig::default());
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let c = pool.acquire().await.unwrap();
        let mut idx = vec![a.index(), b.index(), c.index()];
        idx.sort();
        assert_eq!(idx, vec![0, 1, 2]);

        // Oversubscribed: shares instead of blocking.
        let d = pool.acquire().await.unwrap();
        assert!(d.index() < 3);
        assert_eq!(pool.snapshot()[d.index()].leases, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_credential_is_skipped_until_cooldown_elapses() {
        let pool = pool(
            &["k0", "k1", "k2"],
            CredentialPoolConfig {
                cooldown_base: Duration::from_secs(2),
                ..Default::default()
            },
        );

        let first = pool.acquire().await.unwrap();
        assert_eq!(first.index(), 0);
        pool.release(first, CallOutcome::RateLimited { retry_after: None });

        for _ in 0..6 {
            let c = pool.acquire().await.unwrap();
            assert_ne!(c.index(), 0, "cooling credential must not be selected");
            pool.release(c, CallOutcome::Success);
        }

        tokio::time::advance(Duration::from_secs(2)).await;

        let mut picked = Vec::new();
        for _ in 0..3 {
            let c = pool.acquire().await.unwrap();
            picked.push(c.index());
            pool.release(c, CallOutcome::Success);
        }
        assert!(picked.contains(&0));
    }

    #[tokio::test(start_paused = true)]
    async fn all_cooling_blocks_then_exhausts_after_max_wait() {
        let pool = pool(
            &["k0", "k1"],
            CredentialPoolConfig {
                cooldown_base: Duration::from_secs(60),
                cooldown_cap: Duration::from_secs(120),
                max_wait: Duration::from_secs(5),
            },
        );
        for _ in 0..2 {
            let c = pool.acquire().await.unwrap();
            pool.release(c, CallOutcome::RateLimited { retry_after: None });
        }

        let start = Instant::now();
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CredentialError::Exhausted { .. }));
        assert_eq!(err.kind(), ErrorKind::Exhausted);
        assert!(start.elapsed() >= Duration::from_secs(5));
        assert!(start.elapsed() < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_acquire_succeeds_when_cooldown_expires_in_time() {
        let pool = pool(
            &["k0"],
            CredentialPoolConfig {
                cooldown_base: Duration::from_secs(2),
                cooldown_cap: Duration::from_secs(60),
                max_wait: Duration::from_secs(10),
            },
        );
        let c = pool.acquire().await.unwrap();
        pool.release(c, CallOutcome::RateLimited { retry_after: None });

        let start = Instant::now();
        let c = pool.acquire().await.unwrap();
        assert_eq!(c.index(), 0);
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn success_resets_failure_count() {
        let pool = pool(
            &["k0"],
            CredentialPoolConfig {
                cooldown_base: Duration::from_millis(100),
                ..Default::default()
            },
        );
        for _ in 0..2 {
            let c = pool.acquire().await.unwrap();
            pool.release(c, CallOutcome::RateLimited { retry_after: None });
        }
        assert_eq!(pool.snapshot()[0].failures, 2);
        assert!(pool.snapshot()[0].cooldown_remaining.is_some());

        let c = pool.acquire().await.unwrap();
        pool.release(c, CallOutcome::Success);
        let status = &pool.snapshot()[0];
        assert_eq!(status.failures, 0);
        assert!(status.cooldown_remaining.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_credentials_are_disabled() {
        let pool = pool(&["k0", "k1"], CredentialPoolConfig::default());
        let c = pool.acquire().await.unwrap();
        pool.release(c, CallOutcome::Rejected);

        for _ in 0..3 {
            let c = pool.acquire().await.unwrap();
            assert_eq!(c.index(), 1);
            pool.release(c, CallOutcome::Success);
        }

        let c = pool.acquire().await.unwrap();
        pool.release(c, CallOutcome::Rejected);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, CredentialError::AllRejected(2)));
    }
}
