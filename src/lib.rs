//! Front-end asset pipeline: vendor sync, style and script builds, image
//! optimization, a watch loop, and a live-reload development server,
//! composed into named pipelines.

pub mod assets;
pub mod cache;
pub mod cli;
pub mod error;
pub mod execution;
pub mod reload;
pub mod server;
pub mod task;
pub mod util;
pub mod watch;

pub use error::{PipelineError, Result};
pub use execution::TaskRunner;
pub use reload::{ReloadHub, ReloadMessage};
pub use task::{Configuration, Plan, Step, TaskKind};
