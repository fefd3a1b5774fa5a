//! HTTP scraping-proxy backend.
//!
//! The proxy renders a page per request and is not interactive, so a
//! [`ProxyApiPage`] accumulates actions and replays the whole scenario on
//! every render.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use super::{is_blocked_page, ElementState, Gateway, GatewayConfig, PageAction, ProxyTier, RemotePage};
use crate::error::{ScrapeError, ScrapeResult};
use crate::session::ExecutionSession;

/// Gateway over a scraping-proxy HTTP API.
pub struct ProxyApiGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl ProxyApiGateway {
    pub fn new(config: GatewayConfig) -> ScrapeResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.connect_timeout))
            .gzip(true)
            .brotli(true)
            .build()
            .map_err(|e| ScrapeError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    fn api_key(&self) -> ScrapeResult<&str> {
        match self.config.api_key.as_deref() {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(ScrapeError::Connectivity(
                "proxy API key is not configured (set gateway.api_key or LOT_PROXY_API_KEY)".into(),
            )),
        }
    }
}

#[async_trait]
impl Gateway for ProxyApiGateway {
    fn name(&self) -> &'static str {
        "proxy_api"
    }

    async fn check(&self, _session: &ExecutionSession) -> ScrapeResult<()> {
        let key = self.api_key()?;
        let usage_url = format!("{}/usage", self.config.endpoint.trim_end_matches('/'));
        let response = self
            .client
            .get(&usage_url)
            .query(&[("api_key", key)])
            .send()
            .await
            .map_err(|e| ScrapeError::Connectivity(format!("proxy API unreachable: {}", e)))?;

        match response.status().as_u16() {
            200..=299 => {
                info!("Proxy API credentials accepted");
                Ok(())
            }
            401 | 403 => Err(ScrapeError::Connectivity("proxy API rejected credentials".into())),
            status @ 500..=599 => Err(ScrapeError::http(status, &usage_url)),
            status => Err(ScrapeError::Connectivity(format!(
                "proxy API check failed with HTTP {}",
                status
            ))),
        }
    }

    async fn open(&self, session: &ExecutionSession) -> ScrapeResult<Box<dyn RemotePage>> {
        let api_key = self.api_key()?.to_string();
        Ok(Box::new(ProxyApiPage {
            client: self.client.clone(),
            endpoint: self.config.endpoint.trim_end_matches('/').to_string(),
            api_key,
            tier: self.config.proxy_tier,
            render_js: self.config.render_js,
            wait_for: self.config.wait_for.clone(),
            zone: session.zone.clone(),
            token: session.token.clone(),
            viewport: (session.fingerprint.viewport.width, session.fingerprint.viewport.height),
            url: None,
            scenario: Vec::new(),
            rendered: None,
        }))
    }
}

#[derive(Debug, Deserialize)]
struct RenderResponse {
    #[serde(default)]
    body: String,
    #[serde(default)]
    evaluate_results: Vec<Value>,
}

pub(crate) struct ProxyApiPage {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    tier: ProxyTier,
    render_js: bool,
    wait_for: Option<String>,
    zone: String,
    token: String,
    viewport: (u32, u32),
    url: Option<String>,
    scenario: Vec<PageAction>,
    rendered: Option<RenderResponse>,
}

/// Translate page actions into the proxy's instruction list.
fn scenario_json(actions: &[PageAction]) -> Value {
    let instructions: Vec<Value> = actions
        .iter()
        .map(|action| match action {
            PageAction::Click(selector) => json!({ "click": selector }),
            PageAction::Wait(duration) => json!({ "wait": duration.as_millis() as u64 }),
            PageAction::WaitFor { selector, .. } => json!({ "wait_for": selector }),
            PageAction::ScrollToBottom => json!({ "scroll_y": 100_000 }),
            PageAction::Evaluate(script) => json!({ "evaluate": script }),
        })
        .collect();
    json!({ "instructions": instructions, "strict": false })
}

/// Element state from a rendered snapshot.
fn element_state_in(html: &str, selector: &str, busy_selector: Option<&str>) -> ScrapeResult<ElementState> {
    let parse = |s: &str| {
        Selector::parse(s).map_err(|e| ScrapeError::Parse(format!("invalid selector {}: {:?}", s, e)))
    };
    let target = parse(selector)?;
    let busy = busy_selector.map(parse).transpose()?;

    let document = Html::parse_document(html);
    if let Some(busy) = busy {
        if document.select(&busy).next().is_some() {
            return Ok(ElementState::Busy);
        }
    }
    match document.select(&target).next() {
        None => Ok(ElementState::Absent),
        Some(el) => {
            let attrs = el.value();
            if attrs.attr("disabled").is_some() || attrs.attr("aria-disabled") == Some("true") {
                Ok(ElementState::Busy)
            } else {
                Ok(ElementState::Ready)
            }
        }
    }
}

impl ProxyApiPage {
    fn target_url(&self) -> ScrapeResult<&str> {
        self.url
            .as_deref()
            .ok_or_else(|| ScrapeError::Other("no page loaded".into()))
    }

    async fn render(&mut self) -> ScrapeResult<&RenderResponse> {
        if self.rendered.is_none() {
            let rendered = self.request_render().await?;
            self.rendered = Some(rendered);
        }
        self.rendered
            .as_ref()
            .ok_or_else(|| ScrapeError::Other("render result missing".into()))
    }

    async fn request_render(&self) -> ScrapeResult<RenderResponse> {
        let url = self.target_url()?;
        let mut params: Vec<(&str, String)> = vec![
            ("api_key", self.api_key.clone()),
            ("url", url.to_string()),
            ("render_js", self.render_js.to_string()),
            ("json_response", "true".to_string()),
            ("country_code", self.zone.clone()),
            ("session_id", self.token.clone()),
            ("window_width", self.viewport.0.to_string()),
            ("window_height", self.viewport.1.to_string()),
        ];
        match self.tier {
            ProxyTier::Standard => {}
            ProxyTier::Premium => params.push(("premium_proxy", "true".to_string())),
            ProxyTier::Stealth => params.push(("stealth_proxy", "true".to_string())),
        }
        if let Some(ref selector) = self.wait_for {
            params.push(("wait_for", selector.clone()));
        }
        if !self.scenario.is_empty() {
            params.push(("js_scenario", scenario_json(&self.scenario).to_string()));
        }

        debug!("Rendering {} via proxy ({} actions)", url, self.scenario.len());
        let response = self.client.get(&self.endpoint).query(&params).send().await;
        let response = match response {
            Ok(r) => r,
            Err(e) if e.is_timeout() => return Err(ScrapeError::Timeout(Duration::ZERO, url.to_string())),
            Err(e) => return Err(ScrapeError::navigation(url, e)),
        };

        let status = response.status().as_u16();
        match status {
            200..=299 => {}
            401 => return Err(ScrapeError::Connectivity("proxy API rejected credentials".into())),
            _ => {
                warn!("Proxy returned HTTP {} for {}", status, url);
                return Err(ScrapeError::http(status, url));
            }
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| ScrapeError::Parse(format!("invalid proxy response for {}: {}", url, e)))?;
        if is_blocked_page(&rendered.body) {
            warn!("Blocked by anti-bot page at {}", url);
            return Err(ScrapeError::http(403, url));
        }
        Ok(rendered)
    }
}

#[async_trait]
impl RemotePage for ProxyApiPage {
    async fn goto(&mut self, url: &str) -> ScrapeResult<()> {
        info!("Navigating to {} (proxy)", url);
        self.url = Some(url.to_string());
        self.scenario.clear();
        self.rendered = None;
        self.render().await?;
        Ok(())
    }

    async fn perform(&mut self, action: &PageAction) -> ScrapeResult<Option<Value>> {
        self.target_url()?;
        self.scenario.push(action.clone());
        self.rendered = None;
        match action {
            PageAction::Evaluate(_) => {
                let rendered = self.render().await?;
                Ok(rendered.evaluate_results.last().cloned())
            }
            _ => Ok(None),
        }
    }

    async fn element_state(&mut self, selector: &str, busy_selector: Option<&str>) -> ScrapeResult<ElementState> {
        let rendered = self.render().await?;
        element_state_in(&rendered.body, selector, busy_selector)
    }

    async fn content(&mut self) -> ScrapeResult<String> {
        Ok(self.render().await?.body.clone())
    }

    async fn close(&mut self) {
        self.scenario.clear();
        self.rendered = None;
    }
}
