//! Automation engine interface
//!
//! The core never talks to a browser directly. It drives these traits:
//! open a tab, navigate a tab and observe the network, render a tab to a
//! byte stream. [`super::chromium::ChromiumEngine`] is the real
//! implementation; tests script an in-memory one.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::options::{PdfOptions, Viewport, WaitUntil};

/// Failure reported by the automation layer.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// Network activity observed while a navigation is in flight.
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A response was received
    Response {
        /// Absolute URL the response is for
        url: String,
        status: u16,
        status_text: String,
        /// Value of the `Location` header, if present
        location: Option<String>,
    },
    /// A request failed without a response
    RequestFailed {
        /// Absolute URL of the failed request
        url: String,
        /// Network error text, e.g. `net::ERR_NAME_NOT_RESOLVED`
        error: String,
    },
}

/// The final response seen by the navigation primitive itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryResponse {
    pub url: String,
    pub status: u16,
    pub status_text: String,
}

/// How one navigation resolves: a live stream of network events plus a
/// one-shot completion from the navigation primitive. `Ok(None)` on the
/// outcome channel means the primitive completed with no response object
/// (same-document navigation or `about:blank`).
#[derive(Debug)]
pub struct NavigationDriver {
    pub events: mpsc::UnboundedReceiver<NetworkEvent>,
    pub outcome: oneshot::Receiver<Result<Option<PrimaryResponse>, EngineError>>,
}

/// Media type emulated for rendering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaMode {
    Screen,
    Print,
}

/// Rendered PDF bytes, delivered in chunks so writes can observe
/// cancellation mid-stream.
pub type PdfStream = mpsc::Receiver<Result<Vec<u8>, EngineError>>;

/// One browser tab, exclusively owned by its task for its lifetime.
#[async_trait]
pub trait Tab: Send {
    /// Whether this tab has already started a navigation. Trackers must
    /// fail fast on reused tabs rather than silently misbehave.
    fn has_navigated(&self) -> bool;

    /// Start navigating to `url`. May be called at most once per tab.
    async fn begin_navigation(
        &mut self,
        url: &str,
        wait_until: WaitUntil,
        timeout: Duration,
    ) -> Result<NavigationDriver, EngineError>;

    /// Abort an in-flight navigation. A no-op when none is in flight.
    async fn abort_navigation(&mut self);

    /// The tab's current URL.
    async fn current_url(&self) -> Result<String, EngineError>;

    async fn set_viewport(&mut self, viewport: Viewport) -> Result<(), EngineError>;

    async fn emulate_media(&mut self, media: MediaMode) -> Result<(), EngineError>;

    /// Render the current page to a PDF byte stream.
    async fn render_pdf(&mut self, options: &PdfOptions) -> Result<PdfStream, EngineError>;

    /// Close the tab. Infallible by contract; implementations log failures.
    async fn close(self: Box<Self>);
}

/// A dedicated browsing context for an isolated task. Shares no
/// cookies/cache with the default context and is closed by the task that
/// created it.
#[async_trait]
pub trait IsolatedContext: Send {
    async fn close(self: Box<Self>);
}

/// The shared browser connection.
#[async_trait]
pub trait BrowserEngine: Send + Sync {
    /// Open a fresh tab in the default browsing context.
    async fn new_tab(&self) -> Result<Box<dyn Tab>, EngineError>;

    /// Open a fresh tab in its own isolated context.
    async fn new_isolated_tab(
        &self,
    ) -> Result<(Box<dyn IsolatedContext>, Box<dyn Tab>), EngineError>;

    /// Whether the browser connection is still up. Consulted to classify
    /// tab-creation failures as connection loss.
    fn is_alive(&self) -> bool;
}
