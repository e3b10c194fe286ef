//! Task execution
//!
//! [`run_task`] takes one `(location, options)` pair end to end: acquire a
//! tab, navigate, run hooks, render, write the output file, release the
//! tab. Failures come back as a typed [`TaskError`]; the tab (and, for
//! isolated tasks, its context) is released on every exit path.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};
use url::Url;

use crate::browser::engine::{BrowserEngine, EngineError, MediaMode, Tab};
use crate::browser::navigation::{load_page, relative_to_base, LoadOptions};
use crate::error::{FatalError, PageError, PageErrorKind, TaskError};
use crate::options::{PageOptions, PdfSpec};
use crate::output::{filepath_to_pathname, open_exclusive, pathname_to_filepath};

/// Successful outcome of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    /// Location as requested by the host
    pub requested: String,
    /// Effective location after redirects, base-relative when possible
    pub resolved: String,
    /// The requested location, set only when a redirect moved the task
    pub source: Option<String>,
    /// Absolute path of the written PDF
    pub output_path: PathBuf,
    /// Site-relative pathname of the written PDF
    pub output_pathname: String,
}

/// Shared environment for all tasks of a run.
#[derive(Clone)]
pub struct TaskEnv {
    pub engine: Arc<dyn BrowserEngine>,
    pub out_dir: PathBuf,
    pub base_url: Option<Url>,
    pub cancel: CancellationToken,
}

/// Classify a tab-acquisition failure: when the connection is gone it is
/// [`FatalError::ConnectionLost`], otherwise the tab itself failed.
fn acquire_failure(engine: &dyn BrowserEngine, err: EngineError) -> FatalError {
    if engine.is_alive() {
        FatalError::TabCreationFailed(err.to_string())
    } else {
        FatalError::ConnectionLost
    }
}

/// Execute one task to completion or a classified failure.
#[instrument(skip_all, fields(location = location))]
pub async fn run_task(
    location: &str,
    options: &PageOptions,
    env: &TaskEnv,
) -> Result<TaskResult, TaskError> {
    if env.cancel.is_cancelled() {
        return Err(TaskError::Cancelled);
    }

    debug!("starting processing of {}", location);

    let (context, mut tab) = if options.isolated {
        match env.engine.new_isolated_tab().await {
            Ok((context, tab)) => (Some(context), tab),
            Err(err) => return Err(acquire_failure(&*env.engine, err).into()),
        }
    } else {
        match env.engine.new_tab().await {
            Ok(tab) => (None, tab),
            Err(err) => return Err(acquire_failure(&*env.engine, err).into()),
        }
    };

    let result = drive(tab.as_mut(), location, options, env).await;

    // cleanup runs regardless of outcome and must never mask it
    tab.close().await;
    if let Some(context) = context {
        context.close().await;
    }

    result
}

async fn drive(
    tab: &mut dyn Tab,
    location: &str,
    options: &PageOptions,
    env: &TaskEnv,
) -> Result<TaskResult, TaskError> {
    let base_url = env.base_url.as_ref();

    load_page(
        tab,
        location,
        base_url,
        LoadOptions {
            wait_until: options.wait_until,
            viewport: options.viewport,
            timeout: options.nav_timeout,
            pre_hook: options.pre_hook.as_ref(),
        },
        &env.cancel,
    )
    .await?;

    let media = if options.screen {
        MediaMode::Screen
    } else {
        MediaMode::Print
    };
    tab.emulate_media(media).await.map_err(|err| {
        PageError::new(
            location,
            format!("failed to emulate media: {}", err),
            PageErrorKind::NavigationFailed,
        )
    })?;

    let url_str = tab.current_url().await.map_err(|err| {
        PageError::new(location, err.to_string(), PageErrorKind::NavigationFailed)
    })?;
    let resolved = relative_to_base(&url_str, base_url);
    let attribute = |err: PageError| err.with_source(location);

    if let Some(hook) = &options.hook {
        debug!("running page hook");
        hook(tab)
            .await
            .map_err(|cause| attribute(PageError::hook(&resolved, "page", cause)))?;
    }

    let final_url = Url::parse(&url_str).map_err(|err| {
        attribute(
            PageError::new(
                &resolved,
                "could not parse final url",
                PageErrorKind::NavigationFailed,
            )
            .with_cause(Box::new(err)),
        )
    })?;

    let pathname = options
        .path
        .resolve(&final_url)
        .map_err(|cause| attribute(PageError::hook(&resolved, "path", cause)))?;
    let out_path = pathname_to_filepath(&pathname, &env.out_dir);

    if pathname.ends_with('/') || is_directory(&out_path).await {
        return Err(attribute(PageError::path_is_directory(&resolved, &out_path)).into());
    }

    let pdf_options = match &options.pdf {
        PdfSpec::Options(pdf) => pdf.clone(),
        PdfSpec::Function(f) => f(tab)
            .await
            .map_err(|cause| attribute(PageError::hook(&resolved, "pdf", cause)))?,
    };

    if let Some(parent) = out_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| attribute(PageError::write_failed(&resolved, err)))?;
    }

    let output = open_exclusive(&out_path, options.ensure_path)
        .await
        .map_err(|err| {
            if err.kind() == io::ErrorKind::AlreadyExists {
                attribute(
                    PageError::new(
                        &resolved,
                        "output file already exists",
                        PageErrorKind::WriteFailed,
                    )
                    .with_cause(Box::new(err)),
                )
            } else {
                attribute(PageError::write_failed(&resolved, err))
            }
        })?;

    let write_result = write_pdf(tab, &pdf_options, output.file, &resolved, env).await;
    if let Err(err) = write_result {
        // never leave a partially written file behind
        if let Err(remove_err) = tokio::fs::remove_file(&output.path).await {
            warn!(
                "could not remove partial output {}: {}",
                output.path.display(),
                remove_err
            );
        }
        return Err(match err {
            TaskError::Page(page) => attribute(page).into(),
            other => other,
        });
    }

    let output_pathname = filepath_to_pathname(&output.path, &env.out_dir);
    Ok(TaskResult {
        requested: location.to_string(),
        source: (resolved != location).then(|| location.to_string()),
        resolved,
        output_path: output.path,
        output_pathname,
    })
}

async fn is_directory(path: &std::path::Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|meta| meta.is_dir())
        .unwrap_or(false)
}

/// Stream the rendered PDF into the open file, observing cancellation
/// between chunks.
async fn write_pdf(
    tab: &mut dyn Tab,
    pdf_options: &crate::options::PdfOptions,
    mut file: tokio::fs::File,
    resolved: &str,
    env: &TaskEnv,
) -> Result<(), TaskError> {
    let mut stream = tab
        .render_pdf(pdf_options)
        .await
        .map_err(|err| PageError::write_failed(resolved, Box::new(err)))?;

    loop {
        tokio::select! {
            _ = env.cancel.cancelled() => return Err(TaskError::Cancelled),
            chunk = stream.recv() => match chunk {
                None => break,
                Some(Ok(bytes)) => file
                    .write_all(&bytes)
                    .await
                    .map_err(|err| PageError::write_failed(resolved, err))?,
                Some(Err(err)) => {
                    return Err(PageError::write_failed(resolved, Box::new(err)).into())
                }
            },
        }
    }
    file.flush()
        .await
        .map_err(|err| PageError::write_failed(resolved, err))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::mock::{AcquireFailure, MockEngine, MockPage};
    use crate::options::{PathSpec, WaitUntil};
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn env(engine: Arc<MockEngine>, out_dir: &std::path::Path) -> TaskEnv {
        TaskEnv {
            engine,
            out_dir: out_dir.to_path_buf(),
            base_url: Some(Url::parse("http://localhost:4321").unwrap()),
            cancel: CancellationToken::new(),
        }
    }

    fn options(path: &str) -> PageOptions {
        PageOptions {
            path: PathSpec::Pathname(path.to_string()),
            wait_until: WaitUntil::Load,
            ..PageOptions::default()
        }
    }

    #[tokio::test]
    async fn test_successful_task_writes_pdf() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let result = run_task("/page", &options("out.pdf"), &env).await.unwrap();
        assert_eq!(result.requested, "/page");
        assert_eq!(result.resolved, "/page");
        assert_eq!(result.source, None);
        assert_eq!(result.output_path, dir.path().join("out.pdf"));
        assert_eq!(result.output_pathname, "/out.pdf");

        let written = std::fs::read(&result.output_path).unwrap();
        assert!(written.starts_with(b"%PDF-"));
        assert_eq!(engine.tabs_open(), 0);
    }

    #[tokio::test]
    async fn test_redirected_task_sets_source() {
        let engine = Arc::new(MockEngine::new());
        engine.script(
            "http://localhost:4321/docs",
            MockPage::Redirect {
                status: 302,
                to: "/docs/page".to_string(),
            },
        );
        engine.script("http://localhost:4321/docs/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let result = run_task("/docs", &options("docs/page.pdf"), &env)
            .await
            .unwrap();
        assert_eq!(result.resolved, "/docs/page");
        assert_eq!(result.source.as_deref(), Some("/docs"));
        assert_eq!(result.output_pathname, "/docs/page.pdf");
    }

    #[tokio::test]
    async fn test_template_path_uses_final_url() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/guide/", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let result = run_task("/guide/", &options("[pathname].pdf"), &env)
            .await
            .unwrap();
        assert_eq!(result.output_pathname, "/guide.pdf");
    }

    #[tokio::test]
    async fn test_conflicting_filenames_get_suffixes() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let first = run_task("/page", &options("out.pdf"), &env).await.unwrap();
        let second = run_task("/page", &options("out.pdf"), &env).await.unwrap();
        assert_eq!(first.output_pathname, "/out.pdf");
        assert_eq!(second.output_pathname, "/out-1.pdf");
        assert_eq!(first.resolved, "/page");
        assert_eq!(second.resolved, "/page");
    }

    #[tokio::test]
    async fn test_ensure_path_collision_fails() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let mut opts = options("out.pdf");
        opts.ensure_path = true;
        run_task("/page", &opts, &env).await.unwrap();
        let err = run_task("/page", &opts, &env).await.unwrap_err();
        match err {
            TaskError::Page(err) => {
                assert_eq!(err.kind, PageErrorKind::WriteFailed);
                assert!(err.title.contains("already exists"));
            }
            other => panic!("expected PageError, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_directory_destination_is_rejected() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let err = run_task("/page", &options("sub"), &env).await.unwrap_err();
        match err {
            TaskError::Page(err) => assert_eq!(err.kind, PageErrorKind::PathIsDirectory),
            other => panic!("expected PageError, got {:?}", other),
        }
        assert_eq!(engine.tabs_open(), 0);
    }

    #[tokio::test]
    async fn test_hook_failure_is_wrapped() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let mut opts = options("out.pdf");
        opts.hook = Some(Arc::new(|_tab| {
            Box::pin(async { Err::<(), anyhow::Error>(anyhow::anyhow!("script blew up")) })
        }));
        let err = run_task("/page", &opts, &env).await.unwrap_err();
        match err {
            TaskError::Page(err) => {
                assert_eq!(err.kind, PageErrorKind::HookFailed);
                assert!(err.title.contains("page hook failed"));
                assert!(err.title.contains("script blew up"));
            }
            other => panic!("expected PageError, got {:?}", other),
        }
        assert_eq!(engine.tabs_open(), 0);
    }

    #[tokio::test]
    async fn test_render_failure_removes_partial_file() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        engine.fail_rendering();
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let err = run_task("/page", &options("out.pdf"), &env).await.unwrap_err();
        match err {
            TaskError::Page(err) => assert_eq!(err.kind, PageErrorKind::WriteFailed),
            other => panic!("expected PageError, got {:?}", other),
        }
        assert!(!dir.path().join("out.pdf").exists());
        assert_eq!(engine.tabs_open(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_between_pdf_chunks_removes_partial_file() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        engine.set_render_delay(Duration::from_millis(500));
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let cancel = env.cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            cancel.cancel();
        });

        let err = run_task("/page", &options("out.pdf"), &env).await.unwrap_err();
        assert!(matches!(err, TaskError::Cancelled));
        assert!(!dir.path().join("out.pdf").exists());
        assert_eq!(engine.tabs_open(), 0);
    }

    #[tokio::test]
    async fn test_print_media_is_emulated_by_default() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        run_task("/page", &options("out.pdf"), &env).await.unwrap();
        assert_eq!(engine.emulated_media(), Some(MediaMode::Print));
    }

    #[tokio::test]
    async fn test_screen_flag_emulates_screen_media() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let mut opts = options("out.pdf");
        opts.screen = true;
        run_task("/page", &opts, &env).await.unwrap();
        assert_eq!(engine.emulated_media(), Some(MediaMode::Screen));
    }

    #[tokio::test]
    async fn test_disconnected_browser_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_acquisition(AcquireFailure::Disconnect);
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let err = run_task("/page", &options("out.pdf"), &env).await.unwrap_err();
        assert!(matches!(err, TaskError::Fatal(FatalError::ConnectionLost)));
    }

    #[tokio::test]
    async fn test_tab_creation_failure_is_fatal() {
        let engine = Arc::new(MockEngine::new());
        engine.fail_acquisition(AcquireFailure::TabFail);
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let err = run_task("/page", &options("out.pdf"), &env).await.unwrap_err();
        assert!(matches!(
            err,
            TaskError::Fatal(FatalError::TabCreationFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_isolated_task_closes_its_context() {
        let engine = Arc::new(MockEngine::new());
        engine.script("http://localhost:4321/page", MockPage::Ok { status: 200 });
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let mut opts = options("out.pdf");
        opts.isolated = true;
        run_task("/page", &opts, &env).await.unwrap();
        assert_eq!(engine.tabs_open(), 0);
        assert_eq!(engine.contexts_open(), 0);
    }

    #[tokio::test]
    async fn test_navigation_failure_releases_tab() {
        let engine = Arc::new(MockEngine::new());
        engine.script(
            "http://localhost:4321/missing",
            MockPage::ErrorStatus {
                status: 404,
                text: "Not Found".to_string(),
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let env = env(Arc::clone(&engine), dir.path());

        let err = run_task("/missing", &options("out.pdf"), &env)
            .await
            .unwrap_err();
        match err {
            TaskError::Page(err) => assert_eq!(err.status, Some(404)),
            other => panic!("expected PageError, got {:?}", other),
        }
        assert_eq!(engine.tabs_open(), 0);
        assert!(!dir.path().join("out.pdf").exists());
    }
}
