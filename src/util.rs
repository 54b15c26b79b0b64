use blake3::Hash;
use glob::{GlobError, MatchOptions, Pattern, PatternError, glob};
use serde::Deserialize;
use std::{
    collections::HashSet,
    fs,
    io::{Error as IoError, ErrorKind},
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum FileError {
    #[error("Invalid glob pattern: {0}")]
    GlobPattern(#[from] PatternError),
    #[error("Failed to expand glob: {0}")]
    GlobExpansion(#[from] GlobError),
    #[error("IO error: {0}")]
    Io(#[from] IoError),
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

/// An ordered list of glob patterns relative to the project root.
/// Patterns starting with `!` exclude matches of the patterns before them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct SourceSet(Vec<String>);

/// A file selected by a [`SourceSet`], with its path relative to the glob
/// base of the pattern that matched it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: PathBuf,
    pub relative: PathBuf,
}

impl SourceSet {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(patterns.into_iter().map(Into::into).collect())
    }

    pub fn patterns(&self) -> &[String] {
        &self.0
    }

    pub fn patterns_mut(&mut self) -> &mut Vec<String> {
        &mut self.0
    }

    pub fn includes(&self) -> impl Iterator<Item = &str> {
        self.0
            .iter()
            .map(String::as_str)
            .filter(|p| !p.starts_with('!'))
    }

    pub fn excludes(&self) -> impl Iterator<Item = &str> {
        self.0.iter().filter_map(|p| p.strip_prefix('!'))
    }

    /// Literal directory prefixes of the include patterns.
    pub fn bases(&self) -> Vec<PathBuf> {
        self.includes().map(glob_base).collect()
    }

    /// Expands the set against `root`, in pattern order, skipping directories
    /// and duplicates.
    pub fn resolve(&self, root: &Path) -> Result<Vec<SourceFile>, FileError> {
        let excludes = self.compiled_excludes()?;
        let escaped_root = Pattern::escape(&root.to_string_lossy());

        let mut result = Vec::new();
        let mut seen = HashSet::new();

        for include in self.includes() {
            let base = root.join(glob_base(include));
            let full_pattern = format!("{}/{}", escaped_root, include);

            for entry in glob(&full_pattern)? {
                let path = entry?;
                if !path.is_file() || !seen.insert(path.clone()) {
                    continue;
                }

                let Ok(from_root) = path.strip_prefix(root) else {
                    continue;
                };
                if excludes.iter().any(|p| p.matches_path_with(from_root, MATCH_OPTIONS)) {
                    debug!("Excluded '{}'", from_root.display());
                    continue;
                }

                let relative = path
                    .strip_prefix(&base)
                    .map(Path::to_path_buf)
                    .unwrap_or_else(|_| from_root.to_path_buf());

                result.push(SourceFile { path, relative });
            }
        }

        if result.is_empty() {
            debug!("Source set {:?} matched no files", self.0);
        }

        Ok(result)
    }

    /// Whether a path relative to the project root is selected by this set.
    pub fn matches(&self, relative: &Path) -> Result<bool, FileError> {
        let excludes = self.compiled_excludes()?;
        for include in self.includes() {
            if Pattern::new(include)?.matches_path_with(relative, MATCH_OPTIONS) {
                return Ok(!excludes
                    .iter()
                    .any(|p| p.matches_path_with(relative, MATCH_OPTIONS)));
            }
        }
        Ok(false)
    }

    fn compiled_excludes(&self) -> Result<Vec<Pattern>, FileError> {
        self.excludes()
            .map(|p| Pattern::new(p).map_err(FileError::from))
            .collect()
    }
}

pub fn is_glob_pattern(path: &str) -> bool {
    path.contains('*') || path.contains('?') || path.contains('[')
}

/// The leading components of `pattern` that contain no glob metacharacters.
/// A pattern without any metacharacters names a file, so its parent is used.
pub fn glob_base(pattern: &str) -> PathBuf {
    let pattern = pattern.trim_start_matches("./");

    if !is_glob_pattern(pattern) {
        return Path::new(pattern)
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
    }

    pattern
        .split('/')
        .take_while(|component| !is_glob_pattern(component))
        .collect()
}

pub fn parse_duration(value: &str) -> Result<Option<Duration>, humantime::DurationError> {
    if value == "0" || value.is_empty() {
        return Ok(None);
    }

    value
        .parse::<humantime::Duration>()
        .map(|duration| Some(duration.into()))
}

pub fn hash_files(label: &str, files: &[PathBuf]) -> Result<Hash, FileError> {
    let mut sorted_files = files.to_vec();
    sorted_files.sort();

    let mut hasher = blake3::Hasher::new();
    hasher.update(label.as_bytes());

    for file_path in &sorted_files {
        let contents = fs::read(file_path)?;
        let path_str = file_path.to_string_lossy();
        let mut combined = format!("{}:{}", path_str.len(), path_str).into_bytes();
        combined.extend_from_slice(&contents);
        hasher.update(blake3::hash(&combined).as_bytes());
    }

    Ok(hasher.finalize())
}

/// Removes a file or directory tree. Succeeds if the path does not exist.
pub async fn remove_path(path: &Path) -> Result<(), IoError> {
    let metadata = match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        tokio::fs::remove_dir_all(path).await
    } else {
        tokio::fs::remove_file(path).await
    };

    match result {
        Ok(()) => {
            debug!("Removed: {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => {
            warn!("Failed to remove '{}': {}", path.display(), e);
            Err(e)
        }
    }
}

/// Writes `contents` to `path`, creating parent directories first.
pub async fn write_output(path: &Path, contents: &[u8]) -> Result<(), IoError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, contents).await
}
