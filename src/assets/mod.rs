//! The build steps behind the built-in tasks. Each step reads a source set
//! under the project root and writes into its own output directory.

pub mod images;
pub mod scripts;
pub mod styles;
pub mod vendor;

use std::path::{Path, PathBuf};

use crate::error::{PipelineError, Result};

pub const MIN_SUFFIX: &str = "min";

/// `dir/name.ext` becomes `dir/name.min.<extension>`.
pub fn min_path(relative: &Path, extension: &str) -> PathBuf {
    relative.with_extension(format!("{}.{}", MIN_SUFFIX, extension))
}

/// Whether the file name already carries the `.min` marker.
pub fn is_minified(path: &Path) -> bool {
    path.file_stem()
        .and_then(|stem| Path::new(stem).extension())
        .is_some_and(|ext| ext == MIN_SUFFIX)
}

/// Runs CPU-bound library work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| PipelineError::Task(format!("Worker thread failed: {}", e)))?
}

/// Path as requested by browsers: relative to the served `base`, forward
/// slashes. `None` when `path` is not under `base`.
pub fn url_path(path: &Path, base: &Path) -> Option<String> {
    let relative = path.strip_prefix(base).ok()?;
    Some(
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_path_inserts_suffix_before_extension() {
        assert_eq!(min_path(Path::new("app.js"), "js"), PathBuf::from("app.min.js"));
        assert_eq!(
            min_path(Path::new("pages/home.scss"), "css"),
            PathBuf::from("pages/home.min.css")
        );
    }

    #[test]
    fn detects_minified_names() {
        assert!(is_minified(Path::new("js/app.min.js")));
        assert!(!is_minified(Path::new("js/app.js")));
        assert!(!is_minified(Path::new("js/min.js")));
    }

    #[test]
    fn url_path_is_relative_with_forward_slashes() {
        assert_eq!(
            url_path(Path::new("/site/public/css/app.css"), Path::new("/site/public")).as_deref(),
            Some("css/app.css")
        );
        assert_eq!(
            url_path(Path::new("/site/css/app.css"), Path::new("/site/.")).as_deref(),
            Some("css/app.css")
        );
        assert_eq!(url_path(Path::new("/site/css/app.css"), Path::new("/site/public")), None);
    }
}
