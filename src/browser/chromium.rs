//! Chromium-backed automation engine
//!
//! Implements the engine traits over a CDP connection. Navigation events
//! come from the `Network` domain: intermediate redirect hops surface as
//! `requestWillBeSent.redirectResponse`, final hops as `responseReceived`.
//! PDFs are pulled through an IO stream handle so large documents never
//! sit in one message.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::emulation::{
    SetDeviceMetricsOverrideParams, SetEmulatedMediaParams,
};
use chromiumoxide::cdp::browser_protocol::io::{CloseParams, ReadParams};
use chromiumoxide::cdp::browser_protocol::network::{
    EnableParams, EventLoadingFailed, EventRequestWillBeSent, EventResponseReceived, Headers,
    ResourceType, Response,
};
use chromiumoxide::cdp::browser_protocol::page::{
    PrintToPdfParams, PrintToPdfTransferMode, StopLoadingParams,
};
use chromiumoxide::cdp::browser_protocol::browser::BrowserContextId;
use chromiumoxide::cdp::browser_protocol::target::{
    CreateBrowserContextParams, CreateTargetParams, DisposeBrowserContextParams,
};
use chromiumoxide::Page;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::browser::engine::{
    BrowserEngine, EngineError, IsolatedContext, MediaMode, NavigationDriver, NetworkEvent,
    PdfStream, PrimaryResponse, Tab,
};
use crate::options::{PdfOptions, Viewport, WaitUntil};

/// Size of one IO stream read when pulling PDF data.
const PDF_READ_CHUNK: i64 = 1 << 16;

/// Configuration for browser launch
#[derive(Debug, Clone)]
pub struct BrowserSettings {
    /// Run in headless mode (default: true)
    pub headless: bool,
    /// Enable sandbox (default: true)
    pub sandbox: bool,
    /// Browser window width (default: 1920)
    pub width: u32,
    /// Browser window height (default: 1080)
    pub height: u32,
    /// Path to Chrome/Chromium executable (None = auto-detect)
    pub chrome_path: Option<String>,
    /// Additional Chrome arguments
    pub extra_args: Vec<String>,
}

impl Default for BrowserSettings {
    fn default() -> Self {
        Self {
            headless: true,
            sandbox: true,
            width: 1920,
            height: 1080,
            chrome_path: None,
            extra_args: Vec::new(),
        }
    }
}

impl BrowserSettings {
    pub fn builder() -> BrowserSettingsBuilder {
        BrowserSettingsBuilder::default()
    }
}

/// Builder for [`BrowserSettings`]
#[derive(Default)]
pub struct BrowserSettingsBuilder {
    settings: BrowserSettings,
}

impl BrowserSettingsBuilder {
    pub fn headless(mut self, headless: bool) -> Self {
        self.settings.headless = headless;
        self
    }

    pub fn sandbox(mut self, sandbox: bool) -> Self {
        self.settings.sandbox = sandbox;
        self
    }

    pub fn window(mut self, width: u32, height: u32) -> Self {
        self.settings.width = width;
        self.settings.height = height;
        self
    }

    pub fn chrome_path<S: Into<String>>(mut self, path: S) -> Self {
        self.settings.chrome_path = Some(path.into());
        self
    }

    pub fn arg<S: Into<String>>(mut self, arg: S) -> Self {
        self.settings.extra_args.push(arg.into());
        self
    }

    pub fn build(self) -> BrowserSettings {
        self.settings
    }
}

/// Engine backed by a launched Chromium instance.
pub struct ChromiumEngine {
    browser: Arc<tokio::sync::Mutex<Browser>>,
    handler: Mutex<Option<JoinHandle<()>>>,
    alive: Arc<AtomicBool>,
}

impl ChromiumEngine {
    /// Launch a browser with the given settings.
    #[instrument(skip(settings))]
    pub async fn launch(settings: BrowserSettings) -> Result<Self, EngineError> {
        info!("launching browser, headless={}", settings.headless);

        let mut builder = BrowserConfig::builder();
        builder = builder.viewport(chromiumoxide::handler::viewport::Viewport {
            width: settings.width,
            height: settings.height,
            device_scale_factor: None,
            emulating_mobile: false,
            is_landscape: true,
            has_touch: false,
        });
        if !settings.headless {
            builder = builder.with_head();
        }
        if !settings.sandbox {
            builder = builder.arg("--no-sandbox");
        }
        if let Some(ref path) = settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        for arg in &settings.extra_args {
            builder = builder.arg(arg);
        }
        let config = builder.build().map_err(EngineError::new)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;

        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    warn!("browser handler event error");
                    break;
                }
            }
            flag.store(false, Ordering::SeqCst);
            debug!("browser handler finished");
        });

        info!("browser launched");
        Ok(Self {
            browser: Arc::new(tokio::sync::Mutex::new(browser)),
            handler: Mutex::new(Some(handler_task)),
            alive,
        })
    }

    async fn open_page(&self, params: CreateTargetParams) -> Result<Box<dyn Tab>, EngineError> {
        let browser = self.browser.lock().await;
        let page = browser
            .new_page(params)
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;
        debug!("created new page");
        Ok(Box::new(ChromiumTab {
            page,
            navigated: false,
            workers: Vec::new(),
        }))
    }

    /// Close the browser and wait for its handler to wind down.
    #[instrument(skip(self))]
    pub async fn close(&self) -> Result<(), EngineError> {
        info!("closing browser");
        self.alive.store(false, Ordering::SeqCst);
        {
            let mut browser = self.browser.lock().await;
            browser
                .close()
                .await
                .map_err(|err| EngineError::new(err.to_string()))?;
        }
        let handler = self.handler.lock().take();
        if let Some(handler) = handler {
            let _ = tokio::time::timeout(Duration::from_secs(5), handler).await;
        }
        info!("browser closed");
        Ok(())
    }
}

#[async_trait]
impl BrowserEngine for ChromiumEngine {
    async fn new_tab(&self) -> Result<Box<dyn Tab>, EngineError> {
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .build()
            .map_err(EngineError::new)?;
        self.open_page(params).await
    }

    async fn new_isolated_tab(
        &self,
    ) -> Result<(Box<dyn IsolatedContext>, Box<dyn Tab>), EngineError> {
        let context_id = {
            let browser = self.browser.lock().await;
            browser
                .execute(CreateBrowserContextParams::default())
                .await
                .map_err(|err| EngineError::new(err.to_string()))?
                .result
                .browser_context_id
        };
        let params = CreateTargetParams::builder()
            .url("about:blank")
            .browser_context_id(context_id.clone())
            .build()
            .map_err(EngineError::new)?;
        let tab = self.open_page(params).await?;
        let context = Box::new(ChromiumContext {
            id: context_id,
            browser: Arc::clone(&self.browser),
        });
        Ok((context, tab))
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

/// A dedicated browsing context, disposed when its task finishes.
struct ChromiumContext {
    id: BrowserContextId,
    browser: Arc<tokio::sync::Mutex<Browser>>,
}

#[async_trait]
impl IsolatedContext for ChromiumContext {
    async fn close(self: Box<Self>) {
        let params = match DisposeBrowserContextParams::builder()
            .browser_context_id(self.id.clone())
            .build()
        {
            Ok(params) => params,
            Err(err) => {
                warn!("could not build context disposal: {}", err);
                return;
            }
        };
        let browser = self.browser.lock().await;
        if let Err(err) = browser.execute(params).await {
            warn!("failed to dispose browser context: {}", err);
        }
    }
}

struct ChromiumTab {
    page: Page,
    navigated: bool,
    /// Event forwarders and the navigation outcome task, aborted on close
    workers: Vec<JoinHandle<()>>,
}

/// Case-insensitive `Location` header lookup on a CDP header map.
fn location_header(headers: &Headers) -> Option<String> {
    let value = serde_json::to_value(headers).ok()?;
    value.as_object()?.iter().find_map(|(key, value)| {
        key.eq_ignore_ascii_case("location")
            .then(|| value.as_str().map(String::from))
            .flatten()
    })
}

fn response_event(response: &Response) -> NetworkEvent {
    NetworkEvent::Response {
        url: response.url.clone(),
        status: response.status as u16,
        status_text: response.status_text.clone(),
        location: location_header(&response.headers),
    }
}

/// Readiness condition evaluated in the page after the navigation
/// primitive completes. Network idle approximates the real thing with a
/// settle delay after load.
fn ready_script(wait_until: WaitUntil) -> &'static str {
    match wait_until {
        WaitUntil::Load => {
            r#"
                new Promise(resolve => {
                    if (document.readyState === 'complete') {
                        resolve(true);
                    } else {
                        window.addEventListener('load', () => resolve(true));
                    }
                })
            "#
        }
        WaitUntil::DomContentLoaded => {
            r#"
                new Promise(resolve => {
                    if (document.readyState !== 'loading') {
                        resolve(true);
                    } else {
                        document.addEventListener('DOMContentLoaded', () => resolve(true));
                    }
                })
            "#
        }
        WaitUntil::NetworkIdle0 | WaitUntil::NetworkIdle2 => {
            r#"
                new Promise(resolve => {
                    if (document.readyState === 'complete') {
                        setTimeout(() => resolve(true), 500);
                    } else {
                        window.addEventListener('load', () => {
                            setTimeout(() => resolve(true), 500);
                        });
                    }
                })
            "#
        }
    }
}

#[async_trait]
impl Tab for ChromiumTab {
    fn has_navigated(&self) -> bool {
        self.navigated
    }

    async fn begin_navigation(
        &mut self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<NavigationDriver, EngineError> {
        self.navigated = true;

        self.page
            .execute(EnableParams::default())
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;

        let mut requests = self
            .page
            .event_listener::<EventRequestWillBeSent>()
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;
        let mut responses = self
            .page
            .event_listener::<EventResponseReceived>()
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;
        let mut failures = self
            .page
            .event_listener::<EventLoadingFailed>()
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let (outcome_tx, outcome) = oneshot::channel();
        // request id -> url, for loadingFailed which carries no url
        let urls: Arc<Mutex<HashMap<String, String>>> = Arc::new(Mutex::new(HashMap::new()));
        // latest document response; authoritative once the load completes
        let primary: Arc<Mutex<Option<PrimaryResponse>>> = Arc::new(Mutex::new(None));

        let tx = event_tx.clone();
        let url_map = Arc::clone(&urls);
        self.workers.push(tokio::spawn(async move {
            while let Some(event) = requests.next().await {
                url_map
                    .lock()
                    .insert(event.request_id.inner().clone(), event.request.url.clone());
                // a redirect hop's response only ever shows up here
                if let Some(redirect) = &event.redirect_response {
                    if tx.send(response_event(redirect)).is_err() {
                        return;
                    }
                }
            }
        }));

        let tx = event_tx.clone();
        let latest = Arc::clone(&primary);
        self.workers.push(tokio::spawn(async move {
            while let Some(event) = responses.next().await {
                if event.r#type == ResourceType::Document {
                    *latest.lock() = Some(PrimaryResponse {
                        url: event.response.url.clone(),
                        status: event.response.status as u16,
                        status_text: event.response.status_text.clone(),
                    });
                }
                if tx.send(response_event(&event.response)).is_err() {
                    return;
                }
            }
        }));

        let url_map = Arc::clone(&urls);
        self.workers.push(tokio::spawn(async move {
            while let Some(event) = failures.next().await {
                let failed_url = url_map.lock().get(event.request_id.inner()).cloned();
                let Some(failed_url) = failed_url else {
                    continue;
                };
                let sent = event_tx.send(NetworkEvent::RequestFailed {
                    url: failed_url,
                    error: event.error_text.clone(),
                });
                if sent.is_err() {
                    return;
                }
            }
        }));

        let page = self.page.clone();
        let script = ready_script(wait_until);
        let target = url.to_string();
        self.workers.push(tokio::spawn(async move {
            let navigate = async {
                page.goto(target.as_str())
                    .await
                    .map_err(|err| EngineError::new(err.to_string()))?;
                page.evaluate(script)
                    .await
                    .map_err(|err| EngineError::new(err.to_string()))?;
                Ok(primary.lock().clone())
            };
            let result = match tokio::time::timeout(timeout, navigate).await {
                Ok(result) => result,
                Err(_) => Err(EngineError::new(format!(
                    "navigation timed out after {}ms",
                    timeout.as_millis()
                ))),
            };
            // the receiver is gone when a listener already settled the load
            let _ = outcome_tx.send(result);
        }));

        Ok(NavigationDriver { events, outcome })
    }

    async fn abort_navigation(&mut self) {
        if let Err(err) = self.page.execute(StopLoadingParams::default()).await {
            debug!("stop loading failed: {}", err);
        }
    }

    async fn current_url(&self) -> Result<String, EngineError> {
        self.page
            .url()
            .await
            .map_err(|err| EngineError::new(err.to_string()))?
            .ok_or_else(|| EngineError::new("page has no url"))
    }

    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError> {
        let params = SetDeviceMetricsOverrideParams::builder()
            .width(viewport.width as i64)
            .height(viewport.height as i64)
            .device_scale_factor(1.0)
            .mobile(false)
            .build()
            .map_err(EngineError::new)?;
        self.page
            .execute(params)
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;
        Ok(())
    }

    async fn emulate_media(&mut self, media: MediaMode) -> Result<(), EngineError> {
        let media = match media {
            MediaMode::Screen => "screen",
            MediaMode::Print => "print",
        };
        let params = SetEmulatedMediaParams::builder().media(media).build();
        self.page
            .execute(params)
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;
        Ok(())
    }

    async fn render_pdf(&mut self, options: &PdfOptions) -> Result<PdfStream, EngineError> {
        let mut builder = PrintToPdfParams::builder()
            .landscape(options.landscape)
            .print_background(options.print_background)
            .prefer_css_page_size(options.prefer_css_page_size)
            .transfer_mode(PrintToPdfTransferMode::ReturnAsStream);
        if let Some(scale) = options.scale {
            builder = builder.scale(scale);
        }
        if let Some(width) = options.paper_width {
            builder = builder.paper_width(width);
        }
        if let Some(height) = options.paper_height {
            builder = builder.paper_height(height);
        }
        if let Some(top) = options.margin_top {
            builder = builder.margin_top(top);
        }
        if let Some(bottom) = options.margin_bottom {
            builder = builder.margin_bottom(bottom);
        }
        if let Some(left) = options.margin_left {
            builder = builder.margin_left(left);
        }
        if let Some(right) = options.margin_right {
            builder = builder.margin_right(right);
        }
        if let Some(ref ranges) = options.page_ranges {
            builder = builder.page_ranges(ranges.clone());
        }

        let response = self
            .page
            .execute(builder.build())
            .await
            .map_err(|err| EngineError::new(err.to_string()))?;
        let result = response.result;

        let (tx, rx) = mpsc::channel(4);
        match result.stream {
            Some(handle) => {
                let page = self.page.clone();
                tokio::spawn(async move {
                    loop {
                        let read = match ReadParams::builder()
                            .handle(handle.clone())
                            .size(PDF_READ_CHUNK)
                            .build()
                        {
                            Ok(params) => page.execute(params).await,
                            Err(err) => {
                                let _ = tx.send(Err(EngineError::new(err))).await;
                                return;
                            }
                        };
                        let read = match read {
                            Ok(read) => read.result,
                            Err(err) => {
                                let _ = tx.send(Err(EngineError::new(err.to_string()))).await;
                                return;
                            }
                        };
                        let chunk = if read.base64_encoded.unwrap_or(false) {
                            match BASE64.decode(read.data.as_bytes()) {
                                Ok(bytes) => bytes,
                                Err(err) => {
                                    let _ = tx.send(Err(EngineError::new(err.to_string()))).await;
                                    return;
                                }
                            }
                        } else {
                            read.data.into_bytes()
                        };
                        if !chunk.is_empty() && tx.send(Ok(chunk)).await.is_err() {
                            return;
                        }
                        if read.eof {
                            break;
                        }
                    }
                    if let Ok(params) = CloseParams::builder().handle(handle.clone()).build() {
                        let _ = page.execute(params).await;
                    }
                });
            }
            None => {
                // older targets ignore the transfer mode and inline the data
                let decoded = BASE64
                    .decode(AsRef::<str>::as_ref(&result.data))
                    .map_err(|err| EngineError::new(err.to_string()))?;
                tokio::spawn(async move {
                    let _ = tx.send(Ok(decoded)).await;
                });
            }
        }
        Ok(rx)
    }

    async fn close(self: Box<Self>) {
        for worker in &self.workers {
            worker.abort();
        }
        if let Err(err) = self.page.close().await {
            warn!("failed to close page: {}", err);
        }
    }
}
