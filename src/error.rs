use thiserror::Error;

use crate::util::FileError;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Task error: {0}")]
    Task(String),
    #[error("Config error: {0}")]
    Config(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("File error: {0}")]
    File(#[from] FileError),
    #[error("Style compilation failed in '{path}': {message}")]
    StyleCompile { path: String, message: String },
    #[error("Minify error in '{path}': {message}")]
    Minify { path: String, message: String },
    #[error("Image optimization failed for '{path}': {message}")]
    Image { path: String, message: String },
    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),
    #[error("Server error: {0}")]
    Server(String),
    #[error("Task '{0}' timed out")]
    Timeout(String),
    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl PipelineError {
    /// Style compilation errors are the only class the watch session survives.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, PipelineError::StyleCompile { .. })
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
