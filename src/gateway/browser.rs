//! Remote CDP browser backend.

use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::emulation::SetDeviceMetricsOverrideParams;
use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::{Browser, Page};
use futures::StreamExt;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{is_blocked_page, ElementState, Gateway, GatewayConfig, PageAction, RemotePage};
use crate::error::{ScrapeError, ScrapeResult};
use crate::session::ExecutionSession;

/// JavaScript to wait for page ready state.
const WAIT_FOR_READY_SCRIPT: &str = r#"
    new Promise((resolve) => {
        if (document.readyState === 'complete' || document.readyState === 'interactive') {
            resolve(document.readyState);
        } else {
            document.addEventListener('DOMContentLoaded', () => resolve(document.readyState));
            setTimeout(() => resolve('timeout'), 10000);
        }
    })
"#;

const SCROLL_SCRIPT: &str = "window.scrollTo(0, document.body.scrollHeight); true";

const POLL_INTERVAL: Duration = Duration::from_millis(250);

fn element_state_script(selector: &str, busy_selector: Option<&str>) -> String {
    // serde_json quoting gives a valid JS string literal
    let sel = serde_json::Value::from(selector).to_string();
    let busy = busy_selector
        .map(|b| serde_json::Value::from(b).to_string())
        .unwrap_or_else(|| "null".to_string());
    format!(
        r#"(() => {{
            const busy = {busy};
            if (busy && document.querySelector(busy)) return 'busy';
            const el = document.querySelector({sel});
            if (!el) return 'absent';
            if (el.disabled || el.getAttribute('aria-disabled') === 'true') return 'busy';
            return 'ready';
        }})()"#
    )
}

/// Gateway over a remote Chrome DevTools endpoint.
pub struct CdpGateway {
    config: GatewayConfig,
}

impl CdpGateway {
    pub fn new(config: GatewayConfig) -> Self {
        Self { config }
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout)
    }

    async fn connect(&self, session: &ExecutionSession) -> ScrapeResult<(Browser, JoinHandle<()>)> {
        info!(
            "Connecting to remote browser {} (timeout: {}s)",
            self.config.redacted_connection_string(session),
            self.config.connect_timeout
        );

        let handler_config = chromiumoxide::handler::HandlerConfig {
            request_timeout: self.request_timeout(),
            ..Default::default()
        };

        let ws_url = self.config.connection_string(session);
        let connect = Browser::connect_with_config(ws_url, handler_config);
        let (browser, mut handler) = tokio::time::timeout(self.request_timeout(), connect)
            .await
            .map_err(|_| ScrapeError::Timeout(self.request_timeout(), "browser connect".into()))?
            .map_err(|e| ScrapeError::Connectivity(format!("Failed to connect to remote browser: {}", e)))?;

        let handle = tokio::spawn(async move {
            while let Some(h) = handler.next().await {
                if h.is_err() {
                    break;
                }
            }
        });

        Ok((browser, handle))
    }
}

/// Teardown errors are logged, never surfaced.
fn closed_cleanly<T, E: std::fmt::Display>(what: &str, result: Result<T, E>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            debug!("Remote {} close failed: {}", what, e);
            false
        }
    }
}

#[async_trait]
impl Gateway for CdpGateway {
    fn name(&self) -> &'static str {
        "cdp"
    }

    async fn check(&self, session: &ExecutionSession) -> ScrapeResult<()> {
        let (mut browser, handle) = self.connect(session).await?;
        let version = browser.version().await;
        closed_cleanly("browser", browser.close().await);
        handle.abort();
        let version =
            version.map_err(|e| ScrapeError::Connectivity(format!("Browser did not respond: {}", e)))?;
        info!("Remote browser ready: {}", version.product);
        Ok(())
    }

    async fn open(&self, session: &ExecutionSession) -> ScrapeResult<Box<dyn RemotePage>> {
        let (mut browser, handle) = self.connect(session).await?;
        let page = match browser.new_page("about:blank").await {
            Ok(page) => page,
            Err(e) => {
                closed_cleanly("browser", browser.close().await);
                handle.abort();
                return Err(ScrapeError::Connectivity(format!("Failed to open page: {}", e)));
            }
        };

        let fp = &session.fingerprint;
        if let Err(e) = page
            .execute(SetUserAgentOverrideParams::new(fp.user_agent.clone()))
            .await
        {
            debug!("User agent override skipped: {}", e);
        }
        let metrics = SetDeviceMetricsOverrideParams::new(
            fp.viewport.width as i64,
            fp.viewport.height as i64,
            1.0,
            false,
        );
        if let Err(e) = page.execute(metrics).await {
            debug!("Viewport override skipped: {}", e);
        }

        Ok(Box::new(CdpPage {
            browser,
            page: Some(page),
            handler: handle,
            scripts: fp.scripts.clone(),
            nav_timeout: self.request_timeout(),
        }))
    }
}

struct CdpPage {
    browser: Browser,
    page: Option<Page>,
    handler: JoinHandle<()>,
    scripts: Vec<&'static str>,
    nav_timeout: Duration,
}

impl CdpPage {
    fn page(&self) -> ScrapeResult<&Page> {
        self.page
            .as_ref()
            .ok_or_else(|| ScrapeError::Other("page already closed".into()))
    }

    async fn wait_for_ready(&self) {
        let Ok(page) = self.page() else { return };
        match tokio::time::timeout(self.nav_timeout, page.evaluate(WAIT_FOR_READY_SCRIPT.to_string())).await {
            Ok(Ok(result)) => {
                let state: String = result.into_value().unwrap_or_else(|_| "unknown".to_string());
                debug!("Page ready state: {}", state);
            }
            Ok(Err(e)) => debug!("Could not check ready state: {}", e),
            Err(_) => warn!("Timeout waiting for page ready state"),
        }
    }

    async fn apply_stealth(&self) -> ScrapeResult<()> {
        let page = self.page()?;
        for script in &self.scripts {
            if let Err(e) = page.evaluate(script.to_string()).await {
                debug!("Stealth script injection skipped: {}", e);
            }
        }
        Ok(())
    }

    async fn evaluate(&self, script: &str) -> ScrapeResult<serde_json::Value> {
        let result = self
            .page()?
            .evaluate(script.to_string())
            .await
            .map_err(|e| ScrapeError::Other(format!("script failed: {}", e)))?;
        Ok(result.into_value().unwrap_or(serde_json::Value::Null))
    }
}

#[async_trait]
impl RemotePage for CdpPage {
    async fn goto(&mut self, url: &str) -> ScrapeResult<()> {
        info!("Navigating to {}", url);
        let nav_params = NavigateParams::builder()
            .url(url)
            .build()
            .map_err(|e| ScrapeError::Parse(format!("Invalid URL {}: {}", url, e)))?;

        tokio::time::timeout(self.nav_timeout, self.page()?.execute(nav_params))
            .await
            .map_err(|_| ScrapeError::Timeout(self.nav_timeout, url.to_string()))?
            .map_err(|e| ScrapeError::navigation(url, e))?;

        self.wait_for_ready().await;
        self.apply_stealth().await?;

        let html = self.content().await?;
        if is_blocked_page(&html) {
            warn!("Blocked by anti-bot page at {}", url);
            return Err(ScrapeError::http(403, url));
        }
        Ok(())
    }

    async fn perform(&mut self, action: &PageAction) -> ScrapeResult<Option<serde_json::Value>> {
        match action {
            PageAction::Click(selector) => {
                let element = self
                    .page()?
                    .find_element(selector.as_str())
                    .await
                    .map_err(|e| ScrapeError::Parse(format!("element {} not found: {}", selector, e)))?;
                element
                    .click()
                    .await
                    .map_err(|e| ScrapeError::Other(format!("click on {} failed: {}", selector, e)))?;
                Ok(None)
            }
            PageAction::Wait(duration) => {
                tokio::time::sleep(*duration).await;
                Ok(None)
            }
            PageAction::WaitFor { selector, timeout } => {
                let deadline = tokio::time::Instant::now() + *timeout;
                loop {
                    if self.page()?.find_element(selector.as_str()).await.is_ok() {
                        return Ok(None);
                    }
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ScrapeError::Timeout(*timeout, format!("waiting for {}", selector)));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
            PageAction::ScrollToBottom => {
                self.evaluate(SCROLL_SCRIPT).await?;
                Ok(None)
            }
            PageAction::Evaluate(script) => self.evaluate(script).await.map(Some),
        }
    }

    async fn element_state(&mut self, selector: &str, busy_selector: Option<&str>) -> ScrapeResult<ElementState> {
        let state = self.evaluate(&element_state_script(selector, busy_selector)).await?;
        Ok(match state.as_str() {
            Some("ready") => ElementState::Ready,
            Some("busy") => ElementState::Busy,
            _ => ElementState::Absent,
        })
    }

    async fn content(&mut self) -> ScrapeResult<String> {
        self.page()?
            .content()
            .await
            .map_err(|e| ScrapeError::Other(format!("failed to read page content: {}", e)))
    }

    async fn close(&mut self) {
        if let Some(page) = self.page.take() {
            closed_cleanly("page", page.close().await);
        }
        closed_cleanly("browser", self.browser.close().await);
        self.handler.abort();
    }
}
