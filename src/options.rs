//! Per-page options and worklist expansion
//!
//! The host supplies a map (or function) from locations to page entries;
//! each entry fans out into zero or more tasks. Task-level options are
//! merged over a base configuration, with task-level values winning.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::browser::Tab;

/// Condition to wait for after navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WaitUntil {
    /// Wait until load event fires
    Load,
    /// Wait until DOMContentLoaded event fires
    #[serde(rename = "domcontentloaded")]
    DomContentLoaded,
    /// Wait until network is idle (0 connections for 500ms)
    NetworkIdle0,
    /// Wait until network is idle (max 2 connections for 500ms)
    #[default]
    NetworkIdle2,
}

/// Viewport applied to a tab before navigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

/// PDF render parameters, a subset of the CDP `Page.printToPDF` options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PdfOptions {
    pub landscape: bool,
    pub print_background: bool,
    pub prefer_css_page_size: bool,
    pub scale: Option<f64>,
    /// Paper width in inches
    pub paper_width: Option<f64>,
    /// Paper height in inches
    pub paper_height: Option<f64>,
    pub margin_top: Option<f64>,
    pub margin_bottom: Option<f64>,
    pub margin_left: Option<f64>,
    pub margin_right: Option<f64>,
    /// Page ranges to print, e.g. `1-5, 8`
    pub page_ranges: Option<String>,
}

impl Default for PdfOptions {
    fn default() -> Self {
        Self {
            landscape: false,
            print_background: true,
            prefer_css_page_size: true,
            scale: None,
            paper_width: None,
            paper_height: None,
            margin_top: None,
            margin_bottom: None,
            margin_left: None,
            margin_right: None,
            page_ranges: None,
        }
    }
}

/// Function resolving the output pathname from the final URL.
pub type PathFn = Arc<dyn Fn(&Url) -> anyhow::Result<String> + Send + Sync>;

/// Async hook run against the task's tab.
pub type PageHook =
    Arc<dyn for<'a> Fn(&'a mut dyn Tab) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync>;

/// Function resolving PDF render parameters from the task's tab.
pub type PdfFn = Arc<
    dyn for<'a> Fn(&'a mut dyn Tab) -> BoxFuture<'a, anyhow::Result<PdfOptions>> + Send + Sync,
>;

/// Desired output path: a literal pathname (which may contain the
/// `[pathname]` template) or a function of the final URL.
#[derive(Clone)]
pub enum PathSpec {
    Pathname(String),
    Function(PathFn),
}

impl fmt::Debug for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSpec::Pathname(p) => f.debug_tuple("Pathname").field(p).finish(),
            PathSpec::Function(_) => f.write_str("Function(..)"),
        }
    }
}

impl PathSpec {
    /// Resolve against the final URL. Literal paths containing `[pathname]`
    /// are treated as templates.
    pub fn resolve(&self, final_url: &Url) -> anyhow::Result<String> {
        match self {
            PathSpec::Pathname(p) if p.contains("[pathname]") => {
                Ok(apply_path_template(p, final_url))
            }
            PathSpec::Pathname(p) => Ok(p.clone()),
            PathSpec::Function(f) => f(final_url),
        }
    }
}

/// PDF render parameters: literal, or resolved from the tab at render time.
#[derive(Clone)]
pub enum PdfSpec {
    Options(PdfOptions),
    Function(PdfFn),
}

impl fmt::Debug for PdfSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PdfSpec::Options(o) => f.debug_tuple("Options").field(o).finish(),
            PdfSpec::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Replace `[pathname]` in `template` with the URL's pathname, trailing
/// slashes trimmed and the root pathname mapped to `/index`.
pub fn apply_path_template(template: &str, url: &Url) -> String {
    let pathname = url.path().trim_end_matches('/');
    let pathname = if pathname.is_empty() { "/index" } else { pathname };
    template.replace("[pathname]", pathname)
}

/// Full per-task configuration.
#[derive(Clone)]
pub struct PageOptions {
    /// Desired output path
    pub path: PathSpec,
    /// Emulate screen media instead of print when rendering
    pub screen: bool,
    /// Wait condition for navigation
    pub wait_until: WaitUntil,
    /// Viewport applied before navigation
    pub viewport: Option<Viewport>,
    /// Navigation timeout
    pub nav_timeout: Duration,
    /// PDF render parameters
    pub pdf: PdfSpec,
    /// Hook run after viewport/timeout setup, before navigation
    pub pre_hook: Option<PageHook>,
    /// Hook run after navigation completes
    pub hook: Option<PageHook>,
    /// Retry budget: the task is attempted up to `max_retries + 1` times
    pub max_retries: u32,
    /// Run in a dedicated browsing context sharing no cookies/cache
    pub isolated: bool,
    /// Treat this task's exhausted failure as fatal to the whole run
    pub throw_on_fail: bool,
    /// Fail on output collision instead of searching for a free suffix
    pub ensure_path: bool,
}

impl Default for PageOptions {
    fn default() -> Self {
        Self {
            path: PathSpec::Pathname("[pathname].pdf".to_string()),
            screen: false,
            wait_until: WaitUntil::NetworkIdle2,
            viewport: None,
            nav_timeout: Duration::from_secs(30),
            pdf: PdfSpec::Options(PdfOptions::default()),
            pre_hook: None,
            hook: None,
            max_retries: 0,
            isolated: false,
            throw_on_fail: false,
            ensure_path: false,
        }
    }
}

impl fmt::Debug for PageOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageOptions")
            .field("path", &self.path)
            .field("screen", &self.screen)
            .field("wait_until", &self.wait_until)
            .field("viewport", &self.viewport)
            .field("nav_timeout", &self.nav_timeout)
            .field("pdf", &self.pdf)
            .field("pre_hook", &self.pre_hook.is_some())
            .field("hook", &self.hook.is_some())
            .field("max_retries", &self.max_retries)
            .field("isolated", &self.isolated)
            .field("throw_on_fail", &self.throw_on_fail)
            .field("ensure_path", &self.ensure_path)
            .finish()
    }
}

/// Partial [`PageOptions`]; set fields override the base configuration.
#[derive(Clone, Default)]
pub struct PageOptionsPatch {
    pub path: Option<PathSpec>,
    pub screen: Option<bool>,
    pub wait_until: Option<WaitUntil>,
    pub viewport: Option<Viewport>,
    pub nav_timeout: Option<Duration>,
    pub pdf: Option<PdfSpec>,
    pub pre_hook: Option<PageHook>,
    pub hook: Option<PageHook>,
    pub max_retries: Option<u32>,
    pub isolated: Option<bool>,
    pub throw_on_fail: Option<bool>,
    pub ensure_path: Option<bool>,
}

impl fmt::Debug for PageOptionsPatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageOptionsPatch")
            .field("path", &self.path)
            .field("pdf", &self.pdf)
            .field("max_retries", &self.max_retries)
            .field("isolated", &self.isolated)
            .field("throw_on_fail", &self.throw_on_fail)
            .finish_non_exhaustive()
    }
}

impl PageOptionsPatch {
    /// Merge this patch over `base`, producing the task's options.
    pub fn apply(&self, base: &PageOptions) -> PageOptions {
        PageOptions {
            path: self.path.clone().unwrap_or_else(|| base.path.clone()),
            screen: self.screen.unwrap_or(base.screen),
            wait_until: self.wait_until.unwrap_or(base.wait_until),
            viewport: self.viewport.or(base.viewport),
            nav_timeout: self.nav_timeout.unwrap_or(base.nav_timeout),
            pdf: self.pdf.clone().unwrap_or_else(|| base.pdf.clone()),
            pre_hook: self.pre_hook.clone().or_else(|| base.pre_hook.clone()),
            hook: self.hook.clone().or_else(|| base.hook.clone()),
            max_retries: self.max_retries.unwrap_or(base.max_retries),
            isolated: self.isolated.unwrap_or(base.isolated),
            throw_on_fail: self.throw_on_fail.unwrap_or(base.throw_on_fail),
            ensure_path: self.ensure_path.unwrap_or(base.ensure_path),
        }
    }
}

/// What to do for one location. A location may fan out into several tasks.
#[derive(Clone, Default)]
pub enum PagesEntry {
    /// Skip this location
    #[default]
    Skip,
    /// Include with the base options
    Include,
    /// Include, with this output path
    Path(String),
    /// Include, with these option overrides
    Options(PageOptionsPatch),
    /// Several tasks for the same location
    Multiple(Vec<PagesEntry>),
}

impl fmt::Debug for PagesEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PagesEntry::Skip => f.write_str("Skip"),
            PagesEntry::Include => f.write_str("Include"),
            PagesEntry::Path(p) => f.debug_tuple("Path").field(p).finish(),
            PagesEntry::Options(_) => f.write_str("Options(..)"),
            PagesEntry::Multiple(v) => f.debug_tuple("Multiple").field(&v.len()).finish(),
        }
    }
}

/// Fallback resolving an entry for locations absent from the map.
pub type PagesFn = Arc<dyn Fn(&str) -> PagesEntry + Send + Sync>;

/// The host's page selection: explicit entries plus an optional fallback
/// for built pages not named in the map.
#[derive(Clone, Default)]
pub struct PagesConfig {
    pub map: HashMap<String, PagesEntry>,
    pub fallback: Option<PagesFn>,
}

impl PagesConfig {
    /// Select every built page with the base options.
    pub fn all() -> Self {
        Self {
            map: HashMap::new(),
            fallback: Some(Arc::new(|_| PagesEntry::Include)),
        }
    }

    pub fn with_entry(mut self, location: impl Into<String>, entry: PagesEntry) -> Self {
        self.map.insert(normalize_location(&location.into()), entry);
        self
    }
}

/// Canonical form of a map key or built pathname: absolute http(s) URLs
/// keep their full href, everything else becomes a root-relative pathname.
pub fn normalize_location(key: &str) -> String {
    if let Ok(url) = Url::parse(key) {
        if url.scheme() == "http" || url.scheme() == "https" {
            return url.to_string();
        }
    }
    // parse against an opaque base so relative paths and stray `..` resolve
    let Ok(base) = Url::parse("base://pages/") else {
        return key.to_string();
    };
    match base.join(key) {
        Ok(url) => {
            let mut loc = url.path().to_string();
            if let Some(query) = url.query() {
                loc.push('?');
                loc.push_str(query);
            }
            loc
        }
        Err(_) => key.to_string(),
    }
}

/// Expand the host's built pages and page map into the flat worklist of
/// `(location, options)` pairs.
pub fn merge_pages(
    built_pathnames: &[String],
    pages: &PagesConfig,
    base_options: &PageOptions,
) -> Vec<(String, PageOptions)> {
    let mut locations: Vec<String> = Vec::new();
    let mut map: HashMap<String, PagesEntry> = HashMap::new();

    // map iteration order is unspecified; sort so explicit entries land
    // in the worklist in a stable order
    let mut explicit: Vec<(&String, &PagesEntry)> = pages.map.iter().collect();
    explicit.sort_by(|a, b| a.0.cmp(b.0));
    for (key, entry) in explicit {
        let location = normalize_location(key);
        if !map.contains_key(&location) {
            locations.push(location.clone());
        }
        map.insert(location, entry.clone());
    }
    for pathname in built_pathnames {
        let location = normalize_location(pathname);
        if !map.contains_key(&location) && !locations.contains(&location) {
            locations.push(location);
        }
    }

    let mut worklist = Vec::new();
    for location in locations {
        // an explicit Skip entry suppresses the location outright; only
        // locations the map never mentioned consult the fallback
        let entry = match map.get(&location) {
            Some(entry) => entry.clone(),
            None => pages
                .fallback
                .as_ref()
                .map(|f| f(&location))
                .unwrap_or_default(),
        };
        expand_entry(&entry, &location, base_options, &mut worklist);
    }
    worklist
}

fn expand_entry(
    entry: &PagesEntry,
    location: &str,
    base: &PageOptions,
    out: &mut Vec<(String, PageOptions)>,
) {
    match entry {
        PagesEntry::Skip => {}
        PagesEntry::Include => out.push((location.to_string(), base.clone())),
        PagesEntry::Path(path) => {
            let mut options = base.clone();
            options.path = PathSpec::Pathname(path.clone());
            out.push((location.to_string(), options));
        }
        PagesEntry::Options(patch) => out.push((location.to_string(), patch.apply(base))),
        PagesEntry::Multiple(entries) => {
            for entry in entries {
                expand_entry(entry, location, base, out);
            }
        }
    }
}
