//! Remote browser / scraping-proxy gateways.
//!
//! Two interchangeable backends sit behind [`Gateway`]: a raw CDP browser
//! endpoint ([`CdpGateway`], `browser` feature) and an HTTP scraping-proxy API
//! ([`ProxyApiGateway`]). Callers either drive a [`RemotePage`] interactively
//! or use the one-shot [`Gateway::fetch`].

#[cfg(feature = "browser")]
mod browser;
mod proxy_api;

#[cfg(feature = "browser")]
pub use browser::CdpGateway;
pub use proxy_api::ProxyApiGateway;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ScrapeError, ScrapeResult};
use crate::session::ExecutionSession;

/// Markers of an anti-bot interstitial instead of real content.
const BLOCK_INDICATORS: &[&str] = &[
    "Access Denied",
    "Attention Required! | Cloudflare",
    "cf-challenge-running",
    "px-captcha",
    "Please verify you are a human",
];

/// True if the page looks like a block or challenge page.
pub fn is_blocked_page(html: &str) -> bool {
    // Real result pages are large; interstitials are small
    html.len() < 50_000 && BLOCK_INDICATORS.iter().any(|m| html.contains(m))
}

/// In-page action.
#[derive(Debug, Clone, PartialEq)]
pub enum PageAction {
    Click(String),
    Wait(Duration),
    WaitFor { selector: String, timeout: Duration },
    ScrollToBottom,
    /// Run a script and capture its JSON result.
    Evaluate(String),
}

/// State of a page element used for pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Absent,
    /// Present but not actionable (disabled, or a loading indicator is shown).
    Busy,
    Ready,
}

/// Result of a one-shot fetch.
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub url: String,
    pub html: String,
    /// Results of any `Evaluate` actions, in order.
    pub results: Vec<serde_json::Value>,
}

/// An open remote page. Must be closed by its owner on every path.
#[async_trait]
pub trait RemotePage: Send {
    async fn goto(&mut self, url: &str) -> ScrapeResult<()>;

    async fn perform(&mut self, action: &PageAction) -> ScrapeResult<Option<serde_json::Value>>;

    async fn element_state(&mut self, selector: &str, busy_selector: Option<&str>) -> ScrapeResult<ElementState>;

    async fn content(&mut self) -> ScrapeResult<String>;

    /// Release the remote connection. Errors are swallowed.
    async fn close(&mut self);
}

/// Capability shared by both remote backends.
#[async_trait]
pub trait Gateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Run-start connectivity and credential check.
    async fn check(&self, session: &ExecutionSession) -> ScrapeResult<()>;

    /// Open a page on the given session.
    async fn open(&self, session: &ExecutionSession) -> ScrapeResult<Box<dyn RemotePage>>;

    /// Navigate, run `actions`, and return the rendered content.
    ///
    /// The timeout covers the page work only; the page is closed afterwards
    /// whether it finished, failed or timed out.
    async fn fetch(
        &self,
        session: &ExecutionSession,
        url: &str,
        actions: &[PageAction],
        timeout: Duration,
    ) -> ScrapeResult<FetchResponse> {
        let mut page = self.open(session).await?;
        let result = tokio::time::timeout(timeout, fetch_on_page(page.as_mut(), url, actions)).await;
        page.close().await;
        match result {
            Ok(inner) => inner,
            Err(_) => Err(ScrapeError::Timeout(timeout, url.to_string())),
        }
    }
}

async fn fetch_on_page(
    page: &mut dyn RemotePage,
    url: &str,
    actions: &[PageAction],
) -> ScrapeResult<FetchResponse> {
    page.goto(url).await?;
    let mut results = Vec::new();
    for action in actions {
        if let Some(value) = page.perform(action).await? {
            results.push(value);
        }
    }
    let html = page.content().await?;
    Ok(FetchResponse {
        url: url.to_string(),
        html,
        results,
    })
}

/// Which backend to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayBackend {
    /// Remote CDP browser endpoint.
    #[default]
    Browser,
    /// HTTP scraping-proxy API.
    ProxyApi,
}

/// Proxy tier for the scraping-proxy API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxyTier {
    #[default]
    Standard,
    Premium,
    Stealth,
}

/// Gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub backend: GatewayBackend,
    /// Browser: `host:port` of the CDP endpoint. Proxy API: base URL.
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub proxy_tier: ProxyTier,
    #[serde(default = "default_render_js")]
    pub render_js: bool,
    /// Selector the proxy API waits for before returning.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    /// Connection/request timeout in seconds.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

fn default_render_js() -> bool {
    true
}

fn default_connect_timeout() -> u64 {
    60
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            backend: GatewayBackend::default(),
            endpoint: String::new(),
            username: None,
            password: None,
            api_key: None,
            proxy_tier: ProxyTier::default(),
            render_js: default_render_js(),
            wait_for: None,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl GatewayConfig {
    /// Apply `LOT_GATEWAY_*` / `LOT_PROXY_API_KEY` environment overrides.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(url) = std::env::var("LOT_GATEWAY_URL") {
            if !url.is_empty() {
                self.endpoint = url;
            }
        }
        if let Ok(user) = std::env::var("LOT_GATEWAY_USERNAME") {
            self.username = Some(user);
        }
        if let Ok(pass) = std::env::var("LOT_GATEWAY_PASSWORD") {
            self.password = Some(pass);
        }
        if let Ok(key) = std::env::var("LOT_PROXY_API_KEY") {
            self.api_key = Some(key);
        }
        self
    }

    /// Browser connection string carrying credentials, zone and token.
    pub fn connection_string(&self, session: &ExecutionSession) -> String {
        self.build_connection_string(session, self.password.as_deref().unwrap_or(""))
    }

    /// Connection string safe for logs.
    pub fn redacted_connection_string(&self, session: &ExecutionSession) -> String {
        self.build_connection_string(session, "***")
    }

    fn build_connection_string(&self, session: &ExecutionSession, password: &str) -> String {
        let host = self
            .endpoint
            .trim_start_matches("wss://")
            .trim_start_matches("ws://")
            .trim_end_matches('/');
        match self.username.as_deref() {
            Some(user) => format!(
                "wss://{}-zone-{}-session-{}:{}@{}",
                user, session.zone, session.token, password, host
            ),
            None => format!("wss://{}", host),
        }
    }
}

/// Construct the configured backend.
pub fn build_gateway(config: &GatewayConfig) -> ScrapeResult<Arc<dyn Gateway>> {
    if config.endpoint.is_empty() {
        return Err(ScrapeError::Config(
            "gateway endpoint is not configured (set gateway.endpoint or LOT_GATEWAY_URL)".into(),
        ));
    }
    match config.backend {
        GatewayBackend::ProxyApi => Ok(Arc::new(ProxyApiGateway::new(config.clone())?)),
        #[cfg(feature = "browser")]
        GatewayBackend::Browser => Ok(Arc::new(CdpGateway::new(config.clone()))),
        #[cfg(not(feature = "browser"))]
        GatewayBackend::Browser => Err(ScrapeError::Config(
            "Browser support not compiled. Rebuild with: cargo build --features browser".into(),
        )),
    }
}
