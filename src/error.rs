//! Error types for pagepress
//!
//! Failures are split into two disjoint kinds: [`PageError`] is scoped to a
//! single task and may be retried, while [`FatalError`] is scoped to the whole
//! run and always aborts it. Callers receive them through [`TaskError`] and
//! are forced to handle both paths.

use thiserror::Error;

/// Boxed upstream cause attached to a [`PageError`].
pub type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Classification of a task-scoped failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageErrorKind {
    /// The location string could not be resolved into an absolute URL
    InvalidLocation,
    /// Navigation ended in a non-2xx response or a network failure
    NavigationFailed,
    /// A user hook (pre-navigation, page, path or pdf) failed
    HookFailed,
    /// Writing the rendered PDF to disk failed
    WriteFailed,
    /// The resolved output path is a directory
    PathIsDirectory,
}

/// A recoverable, task-scoped failure.
///
/// Carries the resolved destination at the point of failure, a human title,
/// the HTTP status when one was observed, and the originating (pre-redirect)
/// location when it differs from the failure location.
#[derive(Debug, Error)]
#[error("failed to load `{location}`: {title}")]
pub struct PageError {
    /// Resolved destination the failure occurred at
    pub location: String,
    /// Human-readable title, e.g. `404 Not Found` or `invalid location`
    pub title: String,
    /// What went wrong
    pub kind: PageErrorKind,
    /// HTTP status code, when the failure was an error response
    pub status: Option<u16>,
    /// Originating location, set only when a redirect moved the task away
    /// from the requested location before it failed
    pub source: Option<String>,
    /// Upstream cause, if any
    #[source]
    pub cause: Option<Cause>,
}

impl PageError {
    /// Build a bare [`PageError`] with no status, source or cause.
    pub fn new(location: impl Into<String>, title: impl Into<String>, kind: PageErrorKind) -> Self {
        Self {
            location: location.into(),
            title: title.into(),
            kind,
            status: None,
            source: None,
            cause: None,
        }
    }

    /// Attach the originating location. Ignored when it matches the failure
    /// location, so `source` is only ever set after an actual redirect.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        let source = source.into();
        if source != self.location {
            self.source = Some(source);
        }
        self
    }

    /// Attach an HTTP status code.
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach an upstream cause.
    pub fn with_cause(mut self, cause: impl Into<Cause>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    /// The location string could not be parsed into a URL.
    pub fn invalid_location(location: impl Into<String>) -> Self {
        Self::new(location, "invalid location", PageErrorKind::InvalidLocation)
    }

    /// An error response was observed. The title is `<status> <statusText>`,
    /// or just the status when the status text is empty.
    pub fn error_response(location: impl Into<String>, status: u16, status_text: &str) -> Self {
        let title = if status_text.is_empty() {
            status.to_string()
        } else {
            format!("{} {}", status, status_text)
        };
        Self::new(location, title, PageErrorKind::NavigationFailed).with_status(status)
    }

    /// The network request for the navigation target failed outright.
    pub fn request_failed(location: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self::new(location, error_text, PageErrorKind::NavigationFailed)
    }

    /// A user hook failed; `hook` names which one.
    pub fn hook(location: impl Into<String>, hook: &str, cause: anyhow::Error) -> Self {
        let title = format!("{} hook failed: {}", hook, cause);
        Self::new(location, title, PageErrorKind::HookFailed).with_cause(cause)
    }

    /// Writing the output file failed.
    pub fn write_failed(location: impl Into<String>, cause: impl Into<Cause>) -> Self {
        Self::new(location, "failed to write pdf", PageErrorKind::WriteFailed).with_cause(cause)
    }

    /// The resolved output path points at a directory.
    pub fn path_is_directory(
        location: impl Into<String>,
        path: impl AsRef<std::path::Path>,
    ) -> Self {
        Self::new(
            location,
            format!("output path `{}` is a directory", path.as_ref().display()),
            PageErrorKind::PathIsDirectory,
        )
    }
}

/// A run-scoped failure. Never retried; aborts all other tasks.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FatalError {
    /// The browser connection is gone
    #[error("browser connection lost")]
    ConnectionLost,

    /// A new tab could not be created
    #[error("failed to create tab: {0}")]
    TabCreationFailed(String),
}

/// Terminal state of one task attempt, other than success.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task-scoped failure, eligible for retry
    #[error(transparent)]
    Page(#[from] PageError),

    /// Run-scoped failure, propagates past retry logic
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// The run was cancelled while this task was in flight. Not a failure of
    /// the task itself and never counted against its retry budget.
    #[error("task cancelled")]
    Cancelled,
}

/// The terminal error of an aborted run.
#[derive(Debug, Error)]
pub enum RunError {
    /// A fatal error aborted the run
    #[error(transparent)]
    Fatal(#[from] FatalError),

    /// A hard-fail task exhausted its attempts
    #[error("hard-fail task failed: {0}")]
    HardFail(#[from] PageError),
}
