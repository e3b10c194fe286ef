//! pagepress CLI
//!
//! Renders pages of a served site to PDF files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use url::Url;

use pagepress::browser::{BrowserSettings, ChromiumEngine};
use pagepress::output::filepath_to_pathname;
use pagepress::{
    merge_pages, PageOptions, PageTask, PagesConfig, PathSpec, Scheduler, TracingReporter,
};

/// Render pages of a served site to PDF files
#[derive(Parser, Debug)]
#[command(name = "pagepress")]
#[command(version)]
#[command(about = "Generate PDFs from the pages of a running site")]
struct Args {
    /// Page locations to render, e.g. `/docs/intro` or a full URL
    locations: Vec<String>,

    /// Base URL the site is served under
    #[arg(short, long)]
    base_url: Url,

    /// Directory of built HTML files; every page found is rendered
    #[arg(short, long)]
    site_dir: Option<PathBuf>,

    /// Directory to write PDFs into
    #[arg(short, long, default_value = "pdf")]
    out_dir: PathBuf,

    /// Output path template; `[pathname]` expands to the page's pathname
    #[arg(short, long, default_value = "[pathname].pdf")]
    path: String,

    /// Maximum number of pages rendered at once (default: unbounded)
    #[arg(short = 'c', long)]
    max_concurrent: Option<usize>,

    /// Retry attempts per page after the first failure
    #[arg(short, long, default_value = "0")]
    retries: u32,

    /// Emulate screen media instead of print
    #[arg(long)]
    screen: bool,

    /// Abort the whole run when any page exhausts its attempts
    #[arg(long)]
    fail_fast: bool,

    /// Path to Chrome/Chromium executable
    #[arg(long)]
    chrome_path: Option<String>,

    /// Run the browser with its window visible
    #[arg(long)]
    headed: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

/// Collect site-relative pathnames of all `.html` files under `dir`.
fn collect_html_pages(dir: &Path, root: &Path, pages: &mut Vec<String>) -> anyhow::Result<()> {
    for entry in std::fs::read_dir(dir)
        .with_context(|| format!("could not read directory {}", dir.display()))?
    {
        let path = entry?.path();
        if path.is_dir() {
            collect_html_pages(&path, root, pages)?;
        } else if path.extension().is_some_and(|ext| ext == "html") {
            pages.push(filepath_to_pathname(&path, root));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut pathnames = args.locations.clone();
    if let Some(ref site_dir) = args.site_dir {
        collect_html_pages(site_dir, site_dir, &mut pathnames)?;
    }
    if pathnames.is_empty() {
        anyhow::bail!("nothing to render: pass locations or --site-dir");
    }

    let base_options = PageOptions {
        path: PathSpec::Pathname(args.path.clone()),
        screen: args.screen,
        max_retries: args.retries,
        throw_on_fail: args.fail_fast,
        ..PageOptions::default()
    };
    let tasks: Vec<PageTask> = merge_pages(&pathnames, &PagesConfig::all(), &base_options)
        .into_iter()
        .map(|(location, options)| PageTask { location, options })
        .collect();

    let mut settings = BrowserSettings::builder().headless(!args.headed);
    if let Some(ref path) = args.chrome_path {
        settings = settings.chrome_path(path);
    }
    let engine = Arc::new(ChromiumEngine::launch(settings.build()).await?);

    let scheduler = Scheduler::new(engine.clone(), args.out_dir.clone())
        .with_base_url(args.base_url.clone())
        .with_max_concurrent(args.max_concurrent)
        .with_reporter(Arc::new(TracingReporter));
    let total = tasks.len();
    let outcome = scheduler.run(tasks).await;

    engine.close().await?;

    if let Some(error) = outcome.error {
        return Err(error.into());
    }
    if !outcome.is_complete(total) {
        // the reporter already logged each failure
        std::process::exit(1);
    }
    Ok(())
}
