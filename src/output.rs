//! Output path resolution
//!
//! Logical output paths are always rooted at the output directory: `..`
//! segments normalize away instead of escaping it. Destination files are
//! opened exclusively, with a numeric suffix search on collision, so no
//! task ever overwrites another's output.

use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tracing::{debug, warn};

/// Consecutive unexpected errors tolerated during the suffix search before
/// giving up.
const MAX_UNEXPECTED_ERRORS: u32 = 5;

/// Map a logical, possibly relative, possibly traversal-containing pathname
/// to an absolute path confined to `out_dir`.
///
/// Segments are normalized: `.` and empty segments are dropped, and `..`
/// pops at most back to the output root. Both `/` and `\` separate
/// segments.
pub fn pathname_to_filepath(pathname: &str, out_dir: &Path) -> PathBuf {
    let mut stack: Vec<&str> = Vec::new();
    for segment in pathname.split(['/', '\\']) {
        match segment {
            "" | "." => {}
            ".." => {
                stack.pop();
            }
            _ => stack.push(segment),
        }
    }
    let mut path = out_dir.to_path_buf();
    for segment in stack {
        path.push(segment);
    }
    path
}

/// Map an absolute output file path back to its canonical site-relative
/// pathname: leading `/`, forward slashes, no trailing slash.
pub fn filepath_to_pathname(path: &Path, out_dir: &Path) -> String {
    let relative = path.strip_prefix(out_dir).unwrap_or(path);
    let mut pathname = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            pathname.push('/');
            pathname.push_str(&part.to_string_lossy());
        }
    }
    if pathname.is_empty() {
        pathname.push('/');
    }
    pathname
}

/// A destination file opened exclusively, together with the concrete path
/// the suffix search settled on.
#[derive(Debug)]
pub struct OpenOutput {
    pub file: File,
    pub path: PathBuf,
}

/// Open `path` for writing without ever overwriting an existing file.
///
/// On collision the file name gains a numeric suffix before the extension
/// (`name.pdf`, `name-1.pdf`, `name-2.pdf`, …) and the open is retried.
/// With `exact` set, a collision is a hard failure instead. File creation
/// is the serialization point: two concurrent callers for the same name
/// get distinct files in completion order.
pub async fn open_exclusive(path: &Path, exact: bool) -> io::Result<OpenOutput> {
    let (stem, ext) = split_extension(path);
    let mut unexpected = 0u32;
    let mut i = 0u32;
    loop {
        let candidate = if i == 0 {
            path.to_path_buf()
        } else {
            PathBuf::from(format!("{}-{}{}", stem, i, ext))
        };
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&candidate)
            .await
        {
            Ok(file) => {
                debug!("opened output file {}", candidate.display());
                return Ok(OpenOutput {
                    file,
                    path: candidate,
                });
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                if exact {
                    return Err(err);
                }
                unexpected = 0;
                i += 1;
            }
            Err(err) => {
                warn!("unexpected error opening {}: {}", candidate.display(), err);
                unexpected += 1;
                if unexpected >= MAX_UNEXPECTED_ERRORS {
                    return Err(err);
                }
                i += 1;
            }
        }
    }
}

/// Split a path into everything before the final extension and the
/// extension itself (dot included), as strings.
fn split_extension(path: &Path) -> (String, String) {
    let path_str = path.to_string_lossy();
    match path.extension() {
        Some(ext) => {
            let ext = format!(".{}", ext.to_string_lossy());
            let stem = path_str[..path_str.len() - ext.len()].to_string();
            (stem, ext)
        }
        None => (path_str.into_owned(), String::new()),
    }
}
