use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zeroize::{ZeroizeOnDrop, Zeroizing};

use crate::error::{SecretError, ValidationRule};
use crate::store::crypto::{self, EncryptionKey};
use crate::store::SecretStore;

pub const DEFAULT_MAX_CONTENT_CHARS: usize = 10_000;
/// 30 days.
pub const DEFAULT_MAX_TTL_MINUTES: i64 = 43_200;
/// Largest `max_ttl_minutes` a configuration may set: 100 years.
pub const TTL_MINUTES_CEILING: i64 = 100 * 365 * 24 * 60;

/// Source of the current Unix time in seconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs() as i64
    }
}

/// Input bounds enforced by [`SecretService::create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_content_chars: usize,
    pub max_ttl_minutes: i64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
            max_ttl_minutes: DEFAULT_MAX_TTL_MINUTES,
        }
    }
}

impl Limits {
    /// Reject limits no request could satisfy, or whose TTLs cannot be
    /// represented as an expiry timestamp.
    pub fn check(&self) -> anyhow::Result<()> {
        if self.max_content_chars == 0 {
            anyhow::bail!("max content length must be at least 1 character");
        }
        if !(1..=TTL_MINUTES_CEILING).contains(&self.max_ttl_minutes) {
            anyhow::bail!(
                "max ttl must be between 1 and {TTL_MINUTES_CEILING} minutes, got {}",
                self.max_ttl_minutes
            );
        }
        Ok(())
    }
}

/// Returned from a successful create. Carries no secret material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreatedSecret {
    pub id: Uuid,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

/// The decrypted content of a secret that has just been burned.
#[derive(Clone, Serialize, ZeroizeOnDrop)]
pub struct RevealedSecret {
    pub content: String,
    pub created_at: i64,
    pub expires_at: Option<i64>,
}

impl fmt::Debug for RevealedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevealedSecret")
            .field("content", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Encrypts, stores and burns secrets on top of a [`SecretStore`].
///
/// Plaintext exists only in `create`'s input and in the value returned by the
/// single winning `retrieve_and_burn` call.
pub struct SecretService {
    store: Arc<dyn SecretStore>,
    key: EncryptionKey,
    limits: Limits,
    clock: Arc<dyn Clock>,
}

impl SecretService {
    pub fn new(store: Arc<dyn SecretStore>, key: EncryptionKey, limits: Limits) -> Self {
        Self::with_clock(store, key, limits, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn SecretStore>,
        key: EncryptionKey,
        limits: Limits,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            key,
            limits,
            clock,
        }
    }

    /// Encrypt and store `content`, expiring `ttl_minutes` from now if given.
    pub fn create(
        &self,
        content: &str,
        ttl_minutes: Option<i64>,
    ) -> Result<CreatedSecret, SecretError> {
        self.validate(content, ttl_minutes)?;

        let payload = crypto::seal(&self.key, content.as_bytes()).map_err(SecretError::Crypto)?;

        let created_at = self.clock.now();
        let expires_at = match ttl_minutes {
            Some(ttl) => Some(
                ttl.checked_mul(60)
                    .and_then(|secs| created_at.checked_add(secs))
                    .ok_or_else(|| self.ttl_out_of_range())?,
            ),
            None => None,
        };

        let id = self
            .store
            .insert(&payload, created_at, expires_at)
            .map_err(SecretError::Storage)?;

        info!(id = %id, ?expires_at, "secret created");
        Ok(CreatedSecret {
            id,
            created_at,
            expires_at,
        })
    }

    /// Decrypt and permanently delete the secret behind `public_id`.
    ///
    /// Concurrent callers racing on one id all decrypt, but only the caller whose
    /// `delete_if_present` actually removes the row gets the content. Everyone else
    /// drops their copy and sees `NotFound`.
    pub fn retrieve_and_burn(&self, public_id: &str) -> Result<RevealedSecret, SecretError> {
        let Ok(id) = Uuid::parse_str(public_id) else {
            return Err(SecretError::NotFound);
        };

        let now = self.clock.now();
        let record = self
            .store
            .find_live(&id, now)
            .map_err(SecretError::Storage)?
            .ok_or(SecretError::NotFound)?;

        let plaintext = Zeroizing::new(
            crypto::open(&self.key, &record.payload).map_err(SecretError::Crypto)?,
        );

        let won = self
            .store
            .delete_if_present(&id)
            .map_err(SecretError::Storage)?;
        if !won {
            warn!(id = %id, "secret burned by a concurrent request; discarding");
            return Err(SecretError::NotFound);
        }

        let content = std::str::from_utf8(&plaintext)
            .map_err(|e| SecretError::Crypto(anyhow::anyhow!("plaintext is not UTF-8: {e}")))?
            .to_owned();

        info!(id = %id, "secret burned");
        Ok(RevealedSecret {
            content,
            created_at: record.created_at,
            expires_at: record.expires_at,
        })
    }

    /// Delete every secret whose TTL has elapsed. Returns how many were removed.
    pub fn run_cleanup(&self) -> Result<usize, SecretError> {
        let now = self.clock.now();
        let removed = self
            .store
            .delete_expired(now)
            .map_err(SecretError::Storage)?;
        debug!(removed, now, "cleanup pass finished");
        Ok(removed)
    }

    /// Spawn a background Tokio task that calls `run_cleanup()` every `interval`.
    pub fn spawn_sweep(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await; // skip first immediate tick
            loop {
                ticker.tick().await;
                if let Err(e) = self.run_cleanup() {
                    warn!(error = %e, "background sweep error");
                }
            }
        })
    }

    fn validate(&self, content: &str, ttl_minutes: Option<i64>) -> Result<(), SecretError> {
        if content.is_empty() {
            return Err(SecretError::validation("content", ValidationRule::Empty));
        }
        let max = self.limits.max_content_chars;
        // Byte length bounds char count from above; skip the walk for short input.
        if content.len() > max && content.chars().count() > max {
            return Err(SecretError::validation(
                "content",
                ValidationRule::TooLong { max },
            ));
        }
        if let Some(ttl) = ttl_minutes {
            if ttl < 1 || ttl > self.limits.max_ttl_minutes {
                return Err(self.ttl_out_of_range());
            }
        }
        Ok(())
    }

    fn ttl_out_of_range(&self) -> SecretError {
        SecretError::validation(
            "ttl_minutes",
            ValidationRule::OutOfRange {
                min: 1,
                max: self.limits.max_ttl_minutes,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Barrier;
    use std::thread;

    use super::*;
    use crate::store::{MemoryStore, RedbStore};

    struct ManualClock(AtomicI64);

    impl ManualClock {
        fn new(start: i64) -> Arc<Self> {
            Arc::new(Self(AtomicI64::new(start)))
        }

        fn advance_minutes(&self, minutes: i64) {
            self.0.fetch_add(minutes * 60, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    const T0: i64 = 1_700_000_000;

    fn make_service() -> (SecretService, Arc<MemoryStore>, Arc<ManualClock>) {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(T0);
        let svc = SecretService::with_clock(
            store.clone(),
            crypto::generate_key(),
            Limits::default(),
            clock.clone(),
        );
        (svc, store, clock)
    }

    #[test]
    fn create_then_burn() {
        let (svc, _store, _clock) = make_service();
        let created = svc.create("hello", Some(60)).unwrap();
        assert_eq!(created.id.get_version_num(), 4);
        assert_eq!(created.created_at, T0);
        assert_eq!(created.expires_at, Some(T0 + 3600));

        let revealed = svc.retrieve_and_burn(&created.id.to_string()).unwrap();
        assert_eq!(revealed.content, "hello");
        assert_eq!(revealed.created_at, T0);
        assert_eq!(revealed.expires_at, Some(T0 + 3600));

        assert!(matches!(
            svc.retrieve_and_burn(&created.id.to_string()),
            Err(SecretError::NotFound)
        ));
    }

    #[test]
    fn content_round_trips_exactly() {
        let (svc, _store, _clock) = make_service();
        for content in [
            "plain",
            "  leading and trailing whitespace \n",
            "ünïcødé ✓ 秘密 🔥",
            "quotes \" ' \\ and $dollar `tick`",
            "line1\r\nline2\0nul",
        ] {
            let created = svc.create(content, None).unwrap();
            let revealed = svc.retrieve_and_burn(&created.id.to_string()).unwrap();
            assert_eq!(revealed.content, content);
        }
    }

    #[test]
    fn store_never_sees_plaintext() {
        let (svc, store, _clock) = make_service();
        let created = svc.create("very-secret-value", None).unwrap();
        let record = store.find_live(&created.id, T0).unwrap().unwrap();
        let needle = b"very-secret-value";
        assert!(!record
            .payload
            .windows(needle.len())
            .any(|w| w == needle.as_slice()));
    }

    #[test]
    fn malformed_and_unknown_ids_are_not_found() {
        let (svc, _store, _clock) = make_service();
        for id in ["", "not-a-uuid", "12345", &Uuid::new_v4().to_string()] {
            assert!(matches!(
                svc.retrieve_and_burn(id),
                Err(SecretError::NotFound)
            ));
        }
    }

    #[test]
    fn no_ttl_survives_indefinitely() {
        let (svc, _store, clock) = make_service();
        let created = svc.create("forever", None).unwrap();
        assert_eq!(created.expires_at, None);
        clock.advance_minutes(10 * DEFAULT_MAX_TTL_MINUTES);
        assert_eq!(svc.run_cleanup().unwrap(), 0);
        let revealed = svc.retrieve_and_burn(&created.id.to_string()).unwrap();
        assert_eq!(revealed.content, "forever");
    }

    #[test]
    fn ttl_elapsed_is_not_found() {
        let (svc, store, clock) = make_service();
        let created = svc.create("short-lived", Some(5)).unwrap();
        clock.advance_minutes(5);
        assert!(matches!(
            svc.retrieve_and_burn(&created.id.to_string()),
            Err(SecretError::NotFound)
        ));
        // Expired records are left for the sweep, not burned by the read path.
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn ttl_not_yet_elapsed_is_readable() {
        let (svc, _store, clock) = make_service();
        let created = svc.create("still-here", Some(5)).unwrap();
        clock.advance_minutes(4);
        assert!(svc.retrieve_and_burn(&created.id.to_string()).is_ok());
    }

    #[test]
    fn cleanup_removes_only_expired() {
        let (svc, store, clock) = make_service();
        let immortal = svc.create("a", None).unwrap();
        svc.create("b", Some(1)).unwrap();
        svc.create("c", Some(10)).unwrap();
        let later = svc.create("d", Some(60)).unwrap();

        assert_eq!(svc.run_cleanup().unwrap(), 0);

        clock.advance_minutes(10);
        assert_eq!(svc.run_cleanup().unwrap(), 2);
        assert_eq!(svc.run_cleanup().unwrap(), 0);
        assert_eq!(store.len().unwrap(), 2);

        assert!(svc.retrieve_and_burn(&immortal.id.to_string()).is_ok());
        assert!(svc.retrieve_and_burn(&later.id.to_string()).is_ok());
    }

    #[tokio::test]
    async fn sweep_task_removes_expired() {
        let (svc, store, clock) = make_service();
        svc.create("x", Some(1)).unwrap();
        clock.advance_minutes(2);

        let handle = Arc::new(svc).spawn_sweep(Duration::from_millis(10));
        for _ in 0..200 {
            if store.is_empty().unwrap() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.abort();
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn content_length_boundaries() {
        let (svc, _store, _clock) = make_service();
        let at_max = "x".repeat(DEFAULT_MAX_CONTENT_CHARS);
        assert!(svc.create(&at_max, None).is_ok());

        let over = "x".repeat(DEFAULT_MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            svc.create(&over, None),
            Err(SecretError::Validation {
                field: "content",
                rule: ValidationRule::TooLong { .. }
            })
        ));

        assert!(matches!(
            svc.create("", None),
            Err(SecretError::Validation {
                field: "content",
                rule: ValidationRule::Empty
            })
        ));
    }

    #[test]
    fn content_length_counts_characters() {
        let (svc, _store, _clock) = make_service();
        // Multi-byte characters: well over the limit in bytes, exactly at it in chars.
        let at_max = "é".repeat(DEFAULT_MAX_CONTENT_CHARS);
        assert!(svc.create(&at_max, None).is_ok());
        let over = "é".repeat(DEFAULT_MAX_CONTENT_CHARS + 1);
        assert!(svc.create(&over, None).is_err());
    }

    #[test]
    fn ttl_boundaries() {
        let (svc, _store, _clock) = make_service();
        assert!(svc.create("x", Some(1)).is_ok());
        assert!(svc.create("x", Some(DEFAULT_MAX_TTL_MINUTES)).is_ok());

        for bad in [0, -1, -60, DEFAULT_MAX_TTL_MINUTES + 1] {
            assert!(
                matches!(
                    svc.create("x", Some(bad)),
                    Err(SecretError::Validation {
                        field: "ttl_minutes",
                        ..
                    })
                ),
                "ttl {bad} should be rejected"
            );
        }
    }

    #[test]
    fn custom_limits_apply() {
        let svc = SecretService::new(
            Arc::new(MemoryStore::new()),
            crypto::generate_key(),
            Limits {
                max_content_chars: 3,
                max_ttl_minutes: 10,
            },
        );
        assert!(svc.create("abc", Some(10)).is_ok());
        assert!(svc.create("abcd", None).is_err());
        assert!(svc.create("abc", Some(11)).is_err());
    }

    #[test]
    fn unrepresentable_expiry_is_rejected_not_wrapped() {
        let store = Arc::new(MemoryStore::new());
        let svc = SecretService::with_clock(
            store.clone(),
            crypto::generate_key(),
            Limits {
                max_content_chars: 10,
                max_ttl_minutes: i64::MAX,
            },
            ManualClock::new(T0),
        );

        let err = svc.create("x", Some(i64::MAX / 2)).unwrap_err();
        assert!(matches!(
            err,
            SecretError::Validation {
                field: "ttl_minutes",
                rule: ValidationRule::OutOfRange { min: 1, max: i64::MAX },
            }
        ));
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn limits_check_rejects_unusable_bounds() {
        assert!(Limits::default().check().is_ok());
        let at_ceiling = Limits {
            max_ttl_minutes: TTL_MINUTES_CEILING,
            ..Limits::default()
        };
        assert!(at_ceiling.check().is_ok());

        for max_ttl_minutes in [0, -5, TTL_MINUTES_CEILING + 1, i64::MAX] {
            let limits = Limits {
                max_ttl_minutes,
                ..Limits::default()
            };
            assert!(limits.check().is_err(), "accepted {max_ttl_minutes}");
        }
        let no_content = Limits {
            max_content_chars: 0,
            ..Limits::default()
        };
        assert!(no_content.check().is_err());
    }

    #[test]
    fn wrong_key_is_crypto_failure_and_keeps_record() {
        let store = Arc::new(MemoryStore::new());
        let writer = SecretService::new(store.clone(), crypto::generate_key(), Limits::default());
        let reader = SecretService::new(store.clone(), crypto::generate_key(), Limits::default());

        let created = writer.create("keyed", None).unwrap();
        let err = reader
            .retrieve_and_burn(&created.id.to_string())
            .unwrap_err();
        assert!(matches!(err, SecretError::Crypto(_)));
        assert_eq!(store.len().unwrap(), 1);

        // The rightful key holder can still read it.
        let revealed = writer.retrieve_and_burn(&created.id.to_string()).unwrap();
        assert_eq!(revealed.content, "keyed");
    }

    #[test]
    fn revealed_debug_hides_content() {
        let (svc, _store, _clock) = make_service();
        let created = svc.create("do-not-print", None).unwrap();
        let revealed = svc.retrieve_and_burn(&created.id.to_string()).unwrap();
        assert!(!format!("{revealed:?}").contains("do-not-print"));
    }

    fn race_once(svc: &Arc<SecretService>) -> usize {
        let created = svc.create("contested", None).unwrap();
        let id = created.id.to_string();
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let svc = svc.clone();
                let id = id.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    svc.retrieve_and_burn(&id)
                })
            })
            .collect();

        let mut winners = 0;
        for h in handles {
            match h.join().unwrap() {
                Ok(revealed) => {
                    assert_eq!(revealed.content, "contested");
                    winners += 1;
                }
                Err(SecretError::NotFound) => {}
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        winners
    }

    #[test]
    fn concurrent_burn_has_exactly_one_winner_memory() {
        let svc = Arc::new(SecretService::new(
            Arc::new(MemoryStore::new()),
            crypto::generate_key(),
            Limits::default(),
        ));
        for _ in 0..200 {
            assert_eq!(race_once(&svc), 1);
        }
    }

    #[test]
    fn concurrent_burn_has_exactly_one_winner_redb() {
        let dir = tempfile::tempdir().unwrap();
        let store = RedbStore::open(&dir.path().join("race.db")).unwrap();
        let svc = Arc::new(SecretService::new(
            Arc::new(store),
            crypto::generate_key(),
            Limits::default(),
        ));
        for _ in 0..50 {
            assert_eq!(race_once(&svc), 1);
        }
    }

    #[test]
    fn cleanup_racing_retrieval_never_double_delivers() {
        let store = Arc::new(MemoryStore::new());
        let clock = ManualClock::new(T0);
        let svc = Arc::new(SecretService::with_clock(
            store.clone(),
            crypto::generate_key(),
            Limits::default(),
            clock.clone(),
        ));

        let ids: Vec<String> = (0..50)
            .map(|_| svc.create("expiring", Some(1)).unwrap().id.to_string())
            .collect();
        clock.advance_minutes(1);

        let sweeper = {
            let svc = svc.clone();
            thread::spawn(move || svc.run_cleanup().unwrap())
        };
        for id in &ids {
            assert!(matches!(
                svc.retrieve_and_burn(id),
                Err(SecretError::NotFound)
            ));
        }
        sweeper.join().unwrap();
        svc.run_cleanup().unwrap();
        assert!(store.is_empty().unwrap());
    }
}
