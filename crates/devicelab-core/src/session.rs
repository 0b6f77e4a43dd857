//! Token sessions scoping mutating operations to one caller
//!
//! The registry owns every session; devices carry at most the token value.
//! A session expires when it goes unused for its TTL, and expiry is enforced
//! lazily: the next `validate` destroys the stale session and reports false.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Default session TTL (5 minutes), overridable via configuration
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_millis(300_000);

#[derive(Debug)]
struct SessionRecord {
    device_id: String,
    last_used_at: Instant,
    ttl: Duration,
}

impl SessionRecord {
    fn is_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_used_at) >= self.ttl
    }
}

#[derive(Debug, Default)]
struct Inner {
    by_token: HashMap<String, SessionRecord>,
    by_device: HashMap<String, String>,
}

/// Process-wide session registry, owned by the runtime
#[derive(Debug)]
pub struct SessionRegistry {
    inner: Mutex<Inner>,
    default_ttl: Duration,
    /// Per-registry salt mixed into every token so neighbors cannot guess
    /// tokens from timing alone
    salt: u64,
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_TTL)
    }
}

impl SessionRegistry {
    pub fn new(default_ttl: Duration) -> Self {
        SessionRegistry {
            inner: Mutex::new(Inner::default()),
            default_ttl,
            salt: rand::random(),
        }
    }

    /// Create a session for a device, returning its opaque token.
    ///
    /// Fails with `SessionAlreadyActive` while an unexpired session exists
    /// for the same device; an expired leftover is swept first.
    pub fn create(&self, device_id: &str) -> Result<String> {
        let mut inner = self.lock();
        let now = Instant::now();

        if let Some(existing) = inner.by_device.get(device_id).cloned() {
            let live = inner
                .by_token
                .get(&existing)
                .is_some_and(|s| !s.is_expired(now));
            if live {
                return Err(Error::session_already_active(device_id));
            }
            inner.by_token.remove(&existing);
            inner.by_device.remove(device_id);
        }

        let token = self.mint_token();
        inner.by_token.insert(
            token.clone(),
            SessionRecord {
                device_id: device_id.to_string(),
                last_used_at: now,
                ttl: self.default_ttl,
            },
        );
        inner.by_device.insert(device_id.to_string(), token.clone());

        tracing::debug!(device = device_id, "session created");
        Ok(token)
    }

    /// Validate a token: registered and used within its TTL.
    ///
    /// A valid token has its `last_used_at` refreshed; an expired one is
    /// destroyed so it can never authorize again.
    pub fn validate(&self, token: &str) -> bool {
        let mut inner = self.lock();
        let now = Instant::now();

        let expired = match inner.by_token.get_mut(token) {
            Some(session) if !session.is_expired(now) => {
                session.last_used_at = now;
                return true;
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            if let Some(session) = inner.by_token.remove(token) {
                inner.by_device.remove(&session.device_id);
                tracing::debug!(device = %session.device_id, "session expired");
            }
        }
        false
    }

    /// Token equality against the device's recorded token, plus validation
    pub fn compare_and_validate(&self, expected: Option<&str>, provided: &str) -> bool {
        match expected {
            Some(expected) if expected == provided => self.validate(provided),
            _ => false,
        }
    }

    /// Remove a session by its token; idempotent
    pub fn destroy(&self, token: &str) {
        let mut inner = self.lock();
        if let Some(session) = inner.by_token.remove(token) {
            inner.by_device.remove(&session.device_id);
            tracing::debug!(device = %session.device_id, "session destroyed");
        }
    }

    /// Token of the live (unexpired) session for a device, if any
    pub fn active_token(&self, device_id: &str) -> Option<String> {
        let inner = self.lock();
        let now = Instant::now();
        let token = inner.by_device.get(device_id)?;
        inner
            .by_token
            .get(token)
            .filter(|s| !s.is_expired(now))
            .map(|_| token.clone())
    }

    /// Number of registered sessions, expired or not (test observability)
    pub fn len(&self) -> usize {
        self.lock().by_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn mint_token(&self) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        format!(
            "{:x}.{:x}.{:x}",
            nanos,
            std::process::id(),
            rand::random::<u64>() ^ self.salt
        )
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned registry mutex means a panic mid-update; propagating the
        // inner state is still safe because every update is a single insert
        // or remove.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn registry_with_ttl(ms: u64) -> SessionRegistry {
        SessionRegistry::new(Duration::from_millis(ms))
    }

    #[test]
    fn test_create_and_validate() {
        let registry = SessionRegistry::default();
        let token = registry.create("UDID-A").unwrap();
        assert!(registry.validate(&token));
    }

    #[test]
    fn test_single_session_per_device() {
        let registry = SessionRegistry::default();
        let _token = registry.create("UDID-A").unwrap();

        let err = registry.create("UDID-A").unwrap_err();
        assert!(matches!(err, Error::SessionAlreadyActive { .. }));

        // A different device is unaffected
        assert!(registry.create("UDID-B").is_ok());
    }

    #[test]
    fn test_destroy_frees_the_device() {
        let registry = SessionRegistry::default();
        let token = registry.create("UDID-A").unwrap();

        registry.destroy(&token);
        assert!(!registry.validate(&token));
        assert!(registry.create("UDID-A").is_ok());
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let registry = SessionRegistry::default();
        let token = registry.create("UDID-A").unwrap();
        registry.destroy(&token);
        registry.destroy(&token);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_expired_session_fails_validate_and_is_destroyed() {
        let registry = registry_with_ttl(50);
        let token = registry.create("UDID-A").unwrap();

        sleep(Duration::from_millis(80));

        assert!(!registry.validate(&token));
        assert!(registry.is_empty());
        // Validation of a destroyed token stays false
        assert!(!registry.validate(&token));
    }

    #[test]
    fn test_validate_refreshes_ttl() {
        let registry = registry_with_ttl(120);
        let token = registry.create("UDID-A").unwrap();

        // Keep touching the session at sub-TTL intervals; the refresh on each
        // validate keeps it alive past the original deadline.
        for _ in 0..3 {
            sleep(Duration::from_millis(70));
            assert!(registry.validate(&token));
        }
    }

    #[test]
    fn test_expired_leftover_is_swept_by_create() {
        let registry = registry_with_ttl(50);
        let first = registry.create("UDID-A").unwrap();

        sleep(Duration::from_millis(80));

        let second = registry.create("UDID-A").unwrap();
        assert_ne!(first, second);
        assert!(registry.validate(&second));
        assert!(!registry.validate(&first));
    }

    #[test]
    fn test_compare_and_validate() {
        let registry = SessionRegistry::default();
        let token = registry.create("UDID-A").unwrap();

        assert!(registry.compare_and_validate(Some(token.as_str()), &token));
        assert!(!registry.compare_and_validate(Some("other"), &token));
        assert!(!registry.compare_and_validate(None, &token));
    }

    #[test]
    fn test_bogus_token_rejected() {
        let registry = SessionRegistry::default();
        let _token = registry.create("UDID-A").unwrap();
        assert!(!registry.validate("bogus"));
    }

    #[test]
    fn test_tokens_are_unique() {
        let registry = SessionRegistry::default();
        let a = registry.create("UDID-A").unwrap();
        let b = registry.create("UDID-B").unwrap();
        let c = registry.create("UDID-C").unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn test_active_token_lookup() {
        let registry = registry_with_ttl(50);
        let token = registry.create("UDID-A").unwrap();

        assert_eq!(registry.active_token("UDID-A").as_deref(), Some(&token[..]));
        assert_eq!(registry.active_token("UDID-B"), None);

        sleep(Duration::from_millis(80));
        assert_eq!(registry.active_token("UDID-A"), None);
    }
}
