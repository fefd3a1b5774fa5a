//! Execution identity management.
//!
//! An [`ExecutionSession`] is an immutable identity (egress zone, token,
//! fingerprint) plus a request counter. The [`SessionManager`] holds the
//! current session behind an `Arc` and swaps in a fresh one on rotation, so an
//! operation that started on the old session finishes with it.

pub mod fingerprint;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{ScrapeError, ScrapeResult};
pub use fingerprint::{
    profile_by_name, Fingerprint, FingerprintProfile, NoFingerprint, StealthProfile, Viewport,
};

/// Minimum number of egress zones a pool must offer.
pub const MIN_ZONES: usize = 3;

/// Rotation thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionLimits {
    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
    #[serde(default = "default_max_lifetime", with = "duration_secs")]
    pub max_lifetime: Duration,
}

fn default_max_requests() -> u32 {
    30
}

fn default_max_lifetime() -> Duration {
    Duration::from_secs(10 * 60)
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl Default for SessionLimits {
    fn default() -> Self {
        Self {
            max_requests: default_max_requests(),
            max_lifetime: default_max_lifetime(),
        }
    }
}

/// A single remote execution identity.
#[derive(Debug)]
pub struct ExecutionSession {
    /// Monotonic issue number within the manager, for logs.
    pub generation: u64,
    pub zone: String,
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub fingerprint: Fingerprint,
    requests: AtomicU32,
}

impl ExecutionSession {
    fn issue(generation: u64, zone: String, fingerprint: Fingerprint, now: DateTime<Utc>) -> Self {
        Self {
            generation,
            zone,
            token: generate_token(now),
            created_at: now,
            fingerprint,
            requests: AtomicU32::new(0),
        }
    }

    /// Number of operations dispatched on this session.
    pub fn request_count(&self) -> u32 {
        self.requests.load(Ordering::SeqCst)
    }

    fn record_request(&self) -> u32 {
        self.requests.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Time since issue, clamped at zero.
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Whether either rotation threshold has been reached.
    pub fn exhausted(&self, limits: &SessionLimits, now: DateTime<Utc>) -> bool {
        self.request_count() >= limits.max_requests || self.age_at(now) >= limits.max_lifetime
    }
}

/// Token derived from the issue time plus random bytes.
fn generate_token(now: DateTime<Utc>) -> String {
    let mut bytes = [0u8; 12];
    rand::rng().fill(&mut bytes);
    format!("{:x}{}", now.timestamp_millis(), hex::encode(bytes))
}

/// Owns the rotating identity used to open remote connections.
pub struct SessionManager {
    zones: Vec<String>,
    limits: SessionLimits,
    profile: Box<dyn FingerprintProfile>,
    current: RwLock<Arc<ExecutionSession>>,
    issued: AtomicU64,
}

impl SessionManager {
    /// Create a manager and issue the first session.
    pub fn new(
        zones: Vec<String>,
        limits: SessionLimits,
        profile: Box<dyn FingerprintProfile>,
    ) -> ScrapeResult<Self> {
        if zones.len() < MIN_ZONES {
            return Err(ScrapeError::Config(format!(
                "egress zone pool needs at least {} zones, got {}",
                MIN_ZONES,
                zones.len()
            )));
        }
        let first = ExecutionSession::issue(1, pick_zone(&zones), profile.generate(), Utc::now());
        Ok(Self {
            zones,
            limits,
            profile,
            current: RwLock::new(Arc::new(first)),
            issued: AtomicU64::new(1),
        })
    }

    pub fn limits(&self) -> &SessionLimits {
        &self.limits
    }

    pub fn zones(&self) -> &[String] {
        &self.zones
    }

    /// Number of sessions issued so far, including the first.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// The session currently in use, without counting a request.
    pub async fn current_session(&self) -> Arc<ExecutionSession> {
        self.current.read().await.clone()
    }

    /// Session for the next operation.
    ///
    /// Rotates first if the current session is exhausted, then counts the
    /// request on the returned session before the caller dispatches.
    pub async fn acquire(&self) -> Arc<ExecutionSession> {
        let mut current = self.current.write().await;
        if current.exhausted(&self.limits, Utc::now()) {
            debug!(
                "Session {} exhausted ({} requests), rotating",
                current.generation,
                current.request_count()
            );
            *current = Arc::new(self.issue());
        }
        current.record_request();
        current.clone()
    }

    /// Discard the current session and issue a new one.
    pub async fn rotate(&self) -> Arc<ExecutionSession> {
        let fresh = Arc::new(self.issue());
        let mut current = self.current.write().await;
        info!(
            "Rotating session {} -> {} (zone {})",
            current.generation, fresh.generation, fresh.zone
        );
        *current = fresh.clone();
        fresh
    }

    /// True iff `request_count >= max_requests` or the session is older than
    /// `max_lifetime`.
    pub fn should_rotate(&self, session: &ExecutionSession) -> bool {
        self.should_rotate_at(session, Utc::now())
    }

    pub fn should_rotate_at(&self, session: &ExecutionSession, now: DateTime<Utc>) -> bool {
        session.exhausted(&self.limits, now)
    }

    fn issue(&self) -> ExecutionSession {
        let generation = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
        ExecutionSession::issue(
            generation,
            pick_zone(&self.zones),
            self.profile.generate(),
            Utc::now(),
        )
    }
}

fn pick_zone(zones: &[String]) -> String {
    zones
        .choose(&mut rand::rng())
        .cloned()
        .unwrap_or_default()
}
