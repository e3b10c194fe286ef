//! Browser automation layer
//!
//! The engine traits isolate the rest of the crate from the automation
//! backend; [`chromium`] is the CDP-backed implementation and
//! [`navigation`] drives a tab through one tracked page load.

pub mod chromium;
pub mod engine;
pub mod navigation;

#[cfg(test)]
pub(crate) mod mock;

pub use chromium::{BrowserSettings, ChromiumEngine};
pub use engine::{BrowserEngine, EngineError, IsolatedContext, MediaMode, Tab};
pub use navigation::{load_page, LoadOptions};
