//! Pluggable browser fingerprint profiles.
//!
//! A profile decides what a fresh session looks like to the remote site:
//! user agent, viewport, and the evasion scripts injected into each page.

use rand::seq::IndexedRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Real browser user agents used by the stealth profile.
pub const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/133.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.3 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:136.0) Gecko/20100101 Firefox/136.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/134.0.0.0 Safari/537.36 Edg/134.0.0.0",
];

/// Evasion scripts injected after navigation.
pub const STEALTH_SCRIPTS: &[&str] = &[
    // navigator.webdriver is the first thing most checks look at
    r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined,
        configurable: true
    });
    "#,
    r#"
    if (!window.chrome) {
        window.chrome = { runtime: {}, app: {}, csi: function() {}, loadTimes: function() {} };
    }
    "#,
    r#"
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en'],
        configurable: true
    });
    "#,
    r#"
    const queryPermission = window.navigator.permissions.query;
    window.navigator.permissions.query = (p) => (
        p.name === 'notifications'
            ? Promise.resolve({ state: Notification.permission })
            : queryPermission(p)
    );
    "#,
];

/// Browser viewport dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

impl Default for Viewport {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

/// What one session presents to the remote site.
#[derive(Debug, Clone, PartialEq)]
pub struct Fingerprint {
    pub user_agent: String,
    pub viewport: Viewport,
    pub scripts: Vec<&'static str>,
}

/// Strategy that produces a fingerprint for each new session.
pub trait FingerprintProfile: Send + Sync {
    fn name(&self) -> &'static str;
    fn generate(&self) -> Fingerprint;
}

/// Randomized user agent, jittered viewport and stealth scripts.
#[derive(Debug, Clone)]
pub struct StealthProfile {
    pub base_viewport: Viewport,
    /// Maximum pixels added to each viewport dimension.
    pub viewport_jitter: u32,
}

impl Default for StealthProfile {
    fn default() -> Self {
        Self {
            base_viewport: Viewport::default(),
            viewport_jitter: 120,
        }
    }
}

impl FingerprintProfile for StealthProfile {
    fn name(&self) -> &'static str {
        "stealth"
    }

    fn generate(&self) -> Fingerprint {
        let mut rng = rand::rng();
        let user_agent = USER_AGENTS
            .choose(&mut rng)
            .copied()
            .unwrap_or(USER_AGENTS[0])
            .to_string();
        let jitter = self.viewport_jitter;
        let viewport = Viewport {
            width: self.base_viewport.width - jitter.min(self.base_viewport.width / 2)
                + rng.random_range(0..=jitter),
            height: self.base_viewport.height - jitter.min(self.base_viewport.height / 2)
                + rng.random_range(0..=jitter),
        };
        Fingerprint {
            user_agent,
            viewport,
            scripts: STEALTH_SCRIPTS.to_vec(),
        }
    }
}

/// Fixed fingerprint with no evasion. Used in tests and for debugging.
#[derive(Debug, Clone, Default)]
pub struct NoFingerprint;

impl FingerprintProfile for NoFingerprint {
    fn name(&self) -> &'static str {
        "none"
    }

    fn generate(&self) -> Fingerprint {
        Fingerprint {
            user_agent: USER_AGENTS[0].to_string(),
            viewport: Viewport::default(),
            scripts: Vec::new(),
        }
    }
}

/// Resolve a profile by configured name. Unknown names fall back to stealth.
pub fn profile_by_name(name: &str) -> Box<dyn FingerprintProfile> {
    match name {
        "none" | "off" | "disabled" => Box::new(NoFingerprint),
        _ => Box::new(StealthProfile::default()),
    }
}
