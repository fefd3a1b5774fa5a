//! Shared helpers for integration tests: a scripted in-memory gateway and a
//! source config that parses its pages.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use lotacquire::archive::ContentArchive;
use lotacquire::config::{Delays, SourceBudget, SourceConfig};
use lotacquire::extract::{CardRules, DetailRules, ExtractionRules, FilterRules};
use lotacquire::gateway::{ElementState, Gateway, PageAction, RemotePage};
use lotacquire::models::{BuyerFeeConfig, ScrapeTarget};
use lotacquire::orchestrator::ScrapeOrchestrator;
use lotacquire::pagination::LoadMoreControls;
use lotacquire::retry::RetryExecutor;
use lotacquire::session::{ExecutionSession, NoFingerprint, SessionLimits, SessionManager};
use lotacquire::store::ListingStore;
use lotacquire::{ScrapeError, ScrapeResult};

pub const BASE_URL: &str = "https://auctions.test";
pub const CARD_PRICE: u64 = 50_000;
pub const DETAIL_PRICE: u64 = 61_000;

pub fn listing_url(i: usize) -> String {
    format!("{}/listing/{}", BASE_URL, i)
}

/// Even-numbered cards are sold, odd ones ended at "bid to".
fn card_html(i: usize) -> String {
    let result = if i % 2 == 0 { "Sold for" } else { "Bid to" };
    format!(
        r#"<div class="card"><a href="/listing/{i}">1990 Porsche 911 Carrera {i}</a><span class="price">$50,000</span><span class="result">{result} $50,000</span></div>"#
    )
}

pub fn detail_html(i: usize) -> String {
    format!(
        r#"<html><body><h1>1990 Porsche 911 Carrera {i}</h1><span class="price">$61,000</span><div class="result">Sold for $61,000</div><ul><li class="spec">Mileage: 42,100 miles</li></ul></body></html>"#
    )
}

/// A search results page that grows by `per_click` cards per load-more click.
#[derive(Debug, Clone, Copy)]
struct SearchScript {
    first: usize,
    total: usize,
    per_click: usize,
}

/// Scripted response for a non-search URL.
#[derive(Debug, Clone)]
pub enum Reply {
    Html(String),
    Status(u16),
}

enum PageState {
    Blank,
    Search { script: SearchScript, shown: usize },
    Static(String),
}

pub struct ScriptedPage {
    gateway: Arc<Inner>,
    state: PageState,
}

#[derive(Default)]
struct Inner {
    searches: Mutex<HashMap<String, SearchScript>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    reject_credentials: Mutex<bool>,
    check_failures: Mutex<VecDeque<u16>>,
    checks: AtomicU32,
    opened: AtomicU32,
    closed: AtomicU32,
    visits: Mutex<Vec<String>>,
}

impl Inner {
    /// Next scripted reply for `url`. The last reply repeats.
    fn reply(&self, url: &str) -> Option<Reply> {
        let mut replies = self.replies.lock().unwrap();
        let queue = replies.get_mut(url)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        }
    }
}

/// In-memory gateway driven by per-URL scripts. Listing URLs without a
/// script get a generated detail page; any other unscripted URL is a 404.
#[derive(Clone, Default)]
pub struct ScriptedGateway {
    inner: Arc<Inner>,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve `total` cards at `url`, numbered from `first`, 20 per load.
    pub fn search(self, url: &str, first: usize, total: usize) -> Self {
        self.inner.searches.lock().unwrap().insert(
            url.to_string(),
            SearchScript {
                first,
                total,
                per_click: 20,
            },
        );
        self
    }

    pub fn replies(self, url: &str, replies: Vec<Reply>) -> Self {
        self.inner
            .replies
            .lock()
            .unwrap()
            .insert(url.to_string(), replies.into());
        self
    }

    pub fn reject_credentials(self) -> Self {
        *self.inner.reject_credentials.lock().unwrap() = true;
        self
    }

    /// Fail the next health checks with these HTTP statuses, in order.
    pub fn check_failures(self, statuses: Vec<u16>) -> Self {
        *self.inner.check_failures.lock().unwrap() = statuses.into();
        self
    }

    pub fn checks(&self) -> u32 {
        self.inner.checks.load(Ordering::SeqCst)
    }

    pub fn opened(&self) -> u32 {
        self.inner.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> u32 {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Every URL navigated to, in order.
    pub fn visits(&self) -> Vec<String> {
        self.inner.visits.lock().unwrap().clone()
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn check(&self, _session: &ExecutionSession) -> ScrapeResult<()> {
        self.inner.checks.fetch_add(1, Ordering::SeqCst);
        if *self.inner.reject_credentials.lock().unwrap() {
            return Err(ScrapeError::Connectivity("credentials rejected".into()));
        }
        if let Some(status) = self.inner.check_failures.lock().unwrap().pop_front() {
            return Err(ScrapeError::http(status, "https://gateway.test/check"));
        }
        Ok(())
    }

    async fn open(&self, _session: &ExecutionSession) -> ScrapeResult<Box<dyn RemotePage>> {
        self.inner.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedPage {
            gateway: self.inner.clone(),
            state: PageState::Blank,
        }))
    }
}

impl ScriptedPage {
    fn html(&self) -> String {
        match self.state {
            PageState::Blank => String::new(),
            PageState::Search { script, shown } => {
                let cards: String = (script.first..script.first + shown).map(card_html).collect();
                format!("<html><body>{}</body></html>", cards)
            }
            PageState::Static(ref html) => html.clone(),
        }
    }
}

#[async_trait]
impl RemotePage for ScriptedPage {
    async fn goto(&mut self, url: &str) -> ScrapeResult<()> {
        self.gateway.visits.lock().unwrap().push(url.to_string());
        if let Some(script) = self.gateway.searches.lock().unwrap().get(url).copied() {
            self.state = PageState::Search {
                script,
                shown: script.per_click.min(script.total),
            };
            return Ok(());
        }
        let reply = match self.gateway.reply(url) {
            Some(reply) => reply,
            None => match url.rsplit_once("/listing/").and_then(|(_, i)| i.parse::<usize>().ok()) {
                Some(i) => Reply::Html(detail_html(i)),
                None => Reply::Status(404),
            },
        };
        match reply {
            Reply::Html(html) => {
                self.state = PageState::Static(html);
                Ok(())
            }
            Reply::Status(status) => Err(ScrapeError::http(status, url)),
        }
    }

    async fn perform(&mut self, action: &PageAction) -> ScrapeResult<Option<serde_json::Value>> {
        if let (PageAction::Click(_), PageState::Search { script, shown }) = (action, &mut self.state) {
            *shown = (*shown + script.per_click).min(script.total);
        }
        Ok(None)
    }

    async fn element_state(&mut self, _selector: &str, _busy: Option<&str>) -> ScrapeResult<ElementState> {
        Ok(match self.state {
            PageState::Search { script, shown } if shown < script.total => ElementState::Ready,
            _ => ElementState::Absent,
        })
    }

    async fn content(&mut self) -> ScrapeResult<String> {
        Ok(self.html())
    }

    async fn close(&mut self) {
        self.gateway.closed.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn target(slug: &str, search_url: &str) -> ScrapeTarget {
    ScrapeTarget::new("911", slug, search_url)
}

/// Source whose rules match the scripted pages, with no delays.
pub fn source(targets: Vec<ScrapeTarget>) -> SourceConfig {
    SourceConfig {
        name: "Test Auctions".into(),
        base_url: BASE_URL.into(),
        budget: SourceBudget::Low,
        targets,
        extraction: ExtractionRules {
            cards: Some(CardRules {
                card: "div.card".into(),
                link: "a".into(),
                title: None,
                price: Some(".price".into()),
                status: Some(".result".into()),
            }),
            detail: DetailRules {
                title: "h1".into(),
                price: Some(".price".into()),
                status: Some(".result".into()),
                spec_items: Some("li.spec".into()),
            },
            ..Default::default()
        },
        load_more: LoadMoreControls {
            selector: Some("button.more".into()),
            busy_selector: None,
        },
        filters: FilterRules::default(),
        buyer_fee: Some(BuyerFeeConfig::default()),
        delays: Delays {
            inter_target_ms: 0,
            inter_item_ms: 0,
        },
    }
}

pub fn orchestrator(
    gateway: &ScriptedGateway,
    store: Arc<dyn ListingStore>,
    archive: Arc<ContentArchive>,
    cancel: CancellationToken,
) -> ScrapeOrchestrator {
    let sessions = SessionManager::new(
        vec!["us".into(), "ca".into(), "gb".into()],
        SessionLimits::default(),
        Box::new(NoFingerprint),
    )
    .unwrap();
    let executor = RetryExecutor::new(Arc::new(sessions), cancel);
    ScrapeOrchestrator::new(Arc::new(gateway.clone()), executor, store, archive)
}
