//! Page navigation tracking
//!
//! [`load_page`] drives one freshly created tab to a terminal state. The
//! network event stream is the source of truth for intermediate redirect
//! hops; the navigation primitive's own completion is the source of truth
//! for the final hop. A single mutable current-target cell follows `Location`
//! headers, and the first terminal event wins.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};
use url::Url;

use crate::browser::engine::{NetworkEvent, Tab};
use crate::error::{PageError, PageErrorKind, TaskError};
use crate::options::{PageHook, Viewport, WaitUntil};

/// Pre-navigation setup and wait condition for one load.
pub struct LoadOptions<'a> {
    pub wait_until: WaitUntil,
    pub viewport: Option<Viewport>,
    pub timeout: Duration,
    pub pre_hook: Option<&'a PageHook>,
}

/// Resolve `location` against the base URL, or fail with `invalid location`.
pub fn resolve_location(location: &str, base_url: Option<&Url>) -> Result<Url, PageError> {
    Url::options()
        .base_url(base_url)
        .parse(location)
        .map_err(|err| PageError::invalid_location(location).with_cause(Box::new(err)))
}

/// If `url` is under the base origin, return its base-relative form;
/// otherwise return it unchanged.
pub fn relative_to_base(url: &str, base_url: Option<&Url>) -> String {
    if let Some(base) = base_url {
        let origin = base.origin().ascii_serialization();
        if let Some(rest) = url.strip_prefix(&origin) {
            return rest.to_string();
        }
    }
    url.to_string()
}

/// Absolute form of the current redirect target, for event matching.
fn target_href(dest: &str, base_url: Option<&Url>) -> Option<String> {
    Url::options()
        .base_url(base_url)
        .parse(dest)
        .map(String::from)
        .ok()
}

/// Drive `tab` through a navigation to `location` until it reaches a
/// terminal state.
///
/// The tab must be freshly created; reusing a navigated tab fails fast.
/// Observing `cancel` at any point aborts the in-flight navigation and
/// resolves to [`TaskError::Cancelled`], never to a navigation failure.
#[instrument(skip_all, fields(location = location))]
pub async fn load_page(
    tab: &mut dyn Tab,
    location: &str,
    base_url: Option<&Url>,
    options: LoadOptions<'_>,
    cancel: &CancellationToken,
) -> Result<(), TaskError> {
    if tab.has_navigated() {
        return Err(PageError::new(
            location,
            "internal error: navigation requires a fresh tab",
            PageErrorKind::NavigationFailed,
        )
        .into());
    }

    let url = resolve_location(location, base_url)?;

    if let Some(viewport) = options.viewport {
        tab.set_viewport(viewport)
            .await
            .map_err(|err| navigation_error(location, location, err.to_string()))?;
    }
    if let Some(pre_hook) = options.pre_hook {
        debug!("running pre-navigation hook");
        pre_hook(tab)
            .await
            .map_err(|cause| PageError::hook(location, "pre-navigation", cause))?;
    }

    if cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    // current redirect target, in base-relative form when under the base
    let mut dest = location.to_string();
    let mut listening = true;

    let mut driver = tab
        .begin_navigation(url.as_str(), options.wait_until, options.timeout)
        .await
        .map_err(|err| navigation_error(location, location, err.to_string()))?;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tab.abort_navigation().await;
                return Err(TaskError::Cancelled);
            }
            event = driver.events.recv(), if listening => {
                let Some(event) = event else {
                    listening = false;
                    continue;
                };
                let Some(target) = target_href(&dest, base_url) else {
                    continue;
                };
                match event {
                    NetworkEvent::RequestFailed { url, error } if url == target => {
                        tab.abort_navigation().await;
                        return Err(navigation_error(&dest, location, error));
                    }
                    NetworkEvent::Response { url, status, status_text, location: header }
                        if url == target =>
                    {
                        if (300..400).contains(&status) {
                            // the header resolves relative to the response's own URL
                            let next = header
                                .as_deref()
                                .and_then(|header| Url::parse(&url).ok()?.join(header).ok());
                            if let Some(next) = next {
                                // not terminal: follow the redirect target
                                dest = relative_to_base(next.as_str(), base_url);
                                debug!("following redirect to {}", dest);
                            } else {
                                // 3xx without a Location header is terminal
                                tab.abort_navigation().await;
                                return Err(PageError::error_response(&dest, status, &status_text)
                                    .with_source(location)
                                    .into());
                            }
                        } else if (400..599).contains(&status) {
                            tab.abort_navigation().await;
                            return Err(PageError::error_response(&dest, status, &status_text)
                                .with_source(location)
                                .into());
                        } else if (200..300).contains(&status) {
                            // the navigation primitive's completion is now
                            // authoritative
                            listening = false;
                        }
                    }
                    _ => {}
                }
            }
            outcome = &mut driver.outcome => {
                return match outcome {
                    Ok(Ok(Some(response))) => {
                        if (200..300).contains(&response.status) {
                            Ok(())
                        } else {
                            Err(PageError::error_response(
                                &dest,
                                response.status,
                                &response.status_text,
                            )
                            .with_source(location)
                            .into())
                        }
                    }
                    Ok(Ok(None)) => Err(PageError::new(
                        location,
                        "did not navigate",
                        PageErrorKind::NavigationFailed,
                    )
                    .into()),
                    Ok(Err(err)) => Err(navigation_error(&dest, location, err.to_string())),
                    Err(_) => Err(navigation_error(
                        &dest,
                        location,
                        "navigation ended without a result",
                    )),
                };
            }
        }
    }
}

fn navigation_error(dest: &str, location: &str, title: impl Into<String>) -> TaskError {
    PageError::request_failed(dest, title)
        .with_source(location)
        .into()
}
