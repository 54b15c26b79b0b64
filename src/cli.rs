use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Configuration file to use [default: assetline.toml, optional]
    #[arg(short = 'f', long = "file")]
    pub file: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,

    /// Show what would be executed without running tasks
    #[arg(long = "dry-run")]
    pub dry_run: bool,

    /// List tasks and pipelines
    #[arg(short = 'l', long = "list")]
    pub list: bool,

    /// Keep running later steps of a sequence after a failure
    #[arg(long = "continue-on-failure")]
    pub continue_on_failure: bool,

    /// Skip tasks whose inputs are unchanged since their last successful run
    #[arg(long = "incremental")]
    pub incremental: bool,

    /// Override the dev server port
    #[arg(short = 'p', long = "port")]
    pub port: Option<u16>,

    /// Task or pipeline to run, runs the default (build) if not specified
    pub task: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_task_and_flags() {
        let cli = Cli::parse_from(["assetline", "-v", "--port", "8080", "watch"]);
        assert!(cli.verbose);
        assert_eq!(cli.port, Some(8080));
        assert_eq!(cli.task.as_deref(), Some("watch"));
        assert!(cli.file.is_none());
    }

    #[test]
    fn task_is_optional() {
        let cli = Cli::parse_from(["assetline", "--dry-run"]);
        assert!(cli.dry_run);
        assert!(cli.task.is_none());
    }
}
