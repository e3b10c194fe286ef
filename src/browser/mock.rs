//! Scripted in-memory automation engine for tests
//!
//! Navigation outcomes are scripted per absolute URL. The engine keeps
//! counters for open tabs/contexts and navigation attempts so tests can
//! assert on leaks, retries and concurrency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::browser::engine::{
    BrowserEngine, EngineError, IsolatedContext, MediaMode, NavigationDriver, NetworkEvent,
    PdfStream, PrimaryResponse, Tab,
};
use crate::options::{PdfOptions, Viewport, WaitUntil};

/// What happens when a navigation reaches a URL.
#[derive(Debug, Clone)]
pub(crate) enum MockPage {
    /// Respond with this status and complete the navigation
    Ok { status: u16 },
    /// Respond 3xx with a `Location` header and continue
    Redirect { status: u16, to: String },
    /// Respond with an error status; the navigation primitive never
    /// completes, so rejection must come from the response listener
    ErrorStatus { status: u16, text: String },
    /// The request fails without a response
    NetworkFail { error: String },
    /// The navigation primitive completes with no response object
    NoResponse,
    /// Nothing ever happens
    Hang,
}

/// How tab acquisition fails.
#[derive(Debug, Clone, Copy)]
pub(crate) enum AcquireFailure {
    /// The browser connection drops: `is_alive` turns false
    Disconnect,
    /// Tab creation fails while the connection stays up
    TabFail,
}

#[derive(Default)]
struct MockState {
    scripts: Mutex<HashMap<String, MockPage>>,
    tabs_open: AtomicUsize,
    tabs_peak: AtomicUsize,
    contexts_open: AtomicUsize,
    nav_counts: Mutex<HashMap<String, u32>>,
    acquire_failure: Mutex<Option<AcquireFailure>>,
    render_failure: AtomicBool,
    dead: AtomicBool,
    nav_delay: Mutex<Duration>,
    render_delay: Mutex<Duration>,
    media: Mutex<Option<MediaMode>>,
}

pub(crate) struct MockEngine {
    state: Arc<MockState>,
}

impl MockEngine {
    pub(crate) fn new() -> Self {
        Self {
            state: Arc::new(MockState::default()),
        }
    }

    pub(crate) fn script(&self, url: &str, page: MockPage) {
        self.state.scripts.lock().insert(url.to_string(), page);
    }

    /// Make every subsequent tab acquisition fail this way.
    pub(crate) fn fail_acquisition(&self, failure: AcquireFailure) {
        *self.state.acquire_failure.lock() = Some(failure);
        if matches!(failure, AcquireFailure::Disconnect) {
            self.state.dead.store(true, Ordering::SeqCst);
        }
    }

    /// Make `render_pdf` streams fail after their first chunk.
    pub(crate) fn fail_rendering(&self) {
        self.state.render_failure.store(true, Ordering::SeqCst);
    }

    /// Delay injected before each navigation completes.
    pub(crate) fn set_nav_delay(&self, delay: Duration) {
        *self.state.nav_delay.lock() = delay;
    }

    /// Delay injected between PDF stream chunks.
    pub(crate) fn set_render_delay(&self, delay: Duration) {
        *self.state.render_delay.lock() = delay;
    }

    /// The media mode most recently emulated on any tab.
    pub(crate) fn emulated_media(&self) -> Option<MediaMode> {
        *self.state.media.lock()
    }

    /// Number of times a navigation was started for `url`.
    pub(crate) fn nav_count(&self, url: &str) -> u32 {
        self.state.nav_counts.lock().get(url).copied().unwrap_or(0)
    }

    pub(crate) fn tabs_open(&self) -> usize {
        self.state.tabs_open.load(Ordering::SeqCst)
    }

    /// High-water mark of simultaneously open tabs.
    pub(crate) fn tabs_peak(&self) -> usize {
        self.state.tabs_peak.load(Ordering::SeqCst)
    }

    pub(crate) fn contexts_open(&self) -> usize {
        self.state.contexts_open.load(Ordering::SeqCst)
    }

    fn make_tab(&self) -> Result<Box<dyn Tab>, EngineError> {
        if let Some(failure) = *self.state.acquire_failure.lock() {
            return Err(match failure {
                AcquireFailure::Disconnect => EngineError::new("browser disconnected"),
                AcquireFailure::TabFail => EngineError::new("could not create target"),
            });
        }
        let open = self.state.tabs_open.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.tabs_peak.fetch_max(open, Ordering::SeqCst);
        Ok(Box::new(MockTab {
            state: Arc::clone(&self.state),
            navigated: false,
            current_url: Arc::new(Mutex::new("about:blank".to_string())),
        }))
    }
}

#[async_trait]
impl BrowserEngine for MockEngine {
    async fn new_tab(&self) -> Result<Box<dyn Tab>, EngineError> {
        self.make_tab()
    }

    async fn new_isolated_tab(
        &self,
    ) -> Result<(Box<dyn IsolatedContext>, Box<dyn Tab>), EngineError> {
        let tab = self.make_tab()?;
        self.state.contexts_open.fetch_add(1, Ordering::SeqCst);
        let context = Box::new(MockContext {
            state: Arc::clone(&self.state),
        });
        Ok((context, tab))
    }

    fn is_alive(&self) -> bool {
        !self.state.dead.load(Ordering::SeqCst)
    }
}

struct MockContext {
    state: Arc<MockState>,
}

#[async_trait]
impl IsolatedContext for MockContext {
    async fn close(self: Box<Self>) {
        self.state.contexts_open.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MockTab {
    state: Arc<MockState>,
    navigated: bool,
    current_url: Arc<Mutex<String>>,
}

#[async_trait]
impl Tab for MockTab {
    fn has_navigated(&self) -> bool {
        self.navigated
    }

    async fn begin_navigation(
        &mut self,
        url: &str,
        _wait_until: WaitUntil,
        _timeout: Duration,
    ) -> Result<NavigationDriver, EngineError> {
        self.navigated = true;
        *self
            .state
            .nav_counts
            .lock()
            .entry(url.to_string())
            .or_insert(0) += 1;

        let (event_tx, events) = mpsc::unbounded_channel();
        // mut: `closed()` needs exclusive access in the non-resolving arms
        let (mut outcome_tx, outcome) = oneshot::channel();
        let state = Arc::clone(&self.state);
        let current_url = Arc::clone(&self.current_url);
        let start = url.to_string();

        tokio::spawn(async move {
            let delay = *state.nav_delay.lock();
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let mut current = start;
            loop {
                let script = state.scripts.lock().get(&current).cloned();
                match script {
                    Some(MockPage::Ok { status }) => {
                        let _ = event_tx.send(NetworkEvent::Response {
                            url: current.clone(),
                            status,
                            status_text: "OK".to_string(),
                            location: None,
                        });
                        *current_url.lock() = current.clone();
                        let _ = outcome_tx.send(Ok(Some(PrimaryResponse {
                            url: current,
                            status,
                            status_text: "OK".to_string(),
                        })));
                        return;
                    }
                    Some(MockPage::Redirect { status, to }) => {
                        let _ = event_tx.send(NetworkEvent::Response {
                            url: current.clone(),
                            status,
                            status_text: String::new(),
                            location: Some(to.clone()),
                        });
                        let Some(next) = Url::parse(&current)
                            .ok()
                            .and_then(|url| url.join(&to).ok())
                        else {
                            return;
                        };
                        current = next.to_string();
                    }
                    Some(MockPage::ErrorStatus { status, text }) => {
                        let _ = event_tx.send(NetworkEvent::Response {
                            url: current.clone(),
                            status,
                            status_text: text,
                            location: None,
                        });
                        outcome_tx.closed().await;
                        return;
                    }
                    Some(MockPage::NetworkFail { error }) => {
                        let _ = event_tx.send(NetworkEvent::RequestFailed {
                            url: current.clone(),
                            error,
                        });
                        outcome_tx.closed().await;
                        return;
                    }
                    Some(MockPage::NoResponse) => {
                        let _ = outcome_tx.send(Ok(None));
                        return;
                    }
                    Some(MockPage::Hang) | None => {
                        outcome_tx.closed().await;
                        return;
                    }
                }
            }
        });

        Ok(NavigationDriver { events, outcome })
    }

    async fn abort_navigation(&mut self) {}

    async fn current_url(&self) -> Result<String, EngineError> {
        Ok(self.current_url.lock().clone())
    }

    async fn set_viewport(&mut self, _viewport: Viewport) -> Result<(), EngineError> {
        Ok(())
    }

    async fn emulate_media(&mut self, media: MediaMode) -> Result<(), EngineError> {
        *self.state.media.lock() = Some(media);
        Ok(())
    }

    async fn render_pdf(&mut self, _options: &PdfOptions) -> Result<PdfStream, EngineError> {
        let (tx, rx) = mpsc::channel(4);
        let fail = self.state.render_failure.load(Ordering::SeqCst);
        let delay = *self.state.render_delay.lock();
        tokio::spawn(async move {
            let _ = tx.send(Ok(b"%PDF-1.7 ".to_vec())).await;
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if fail {
                let _ = tx.send(Err(EngineError::new("render stream broke"))).await;
            } else {
                let _ = tx.send(Ok(b"mock page content".to_vec())).await;
            }
        });
        Ok(rx)
    }

    async fn close(self: Box<Self>) {
        // Tab::close is the only sanctioned release path; a drop without
        // close leaves the counter high, which is what leak assertions
        // catch
        self.state.tabs_open.fetch_sub(1, Ordering::SeqCst);
    }
}
