//! pagepress - PDF generation for static sites
//!
//! Renders the pages of a served site to PDF files through a headless
//! browser. A worklist of page locations is expanded from the site's built
//! pages plus explicit per-page configuration, then executed with bounded
//! concurrency against one shared browser: each task navigates a fresh tab
//! (following redirects), runs its hooks, renders the page, and writes the
//! result to a collision-free output path.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use pagepress::browser::{BrowserSettings, ChromiumEngine};
//! use pagepress::{PageOptions, PageTask, Scheduler, TracingReporter};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = Arc::new(ChromiumEngine::launch(BrowserSettings::default()).await?);
//!
//!     let scheduler = Scheduler::new(engine.clone(), "pdf")
//!         .with_base_url("http://localhost:4321".parse()?)
//!         .with_reporter(Arc::new(TracingReporter));
//!     let outcome = scheduler
//!         .run(vec![PageTask {
//!             location: "/docs/intro".to_string(),
//!             options: PageOptions::default(),
//!         }])
//!         .await;
//!
//!     engine.close().await?;
//!     println!("generated {} files", outcome.results.len());
//!     Ok(())
//! }
//! ```

pub mod browser;
pub mod error;
pub mod options;
pub mod output;
pub mod reporter;
pub mod scheduler;
pub mod task;

// Re-exports for convenience
pub use error::{FatalError, PageError, PageErrorKind, RunError, TaskError};
pub use options::{
    merge_pages, PageOptions, PageOptionsPatch, PagesConfig, PagesEntry, PathSpec, PdfOptions,
    PdfSpec, Viewport, WaitUntil,
};
pub use reporter::{NullReporter, Reporter, TracingReporter};
pub use scheduler::{PageTask, RunOutcome, Scheduler};
pub use task::TaskResult;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
