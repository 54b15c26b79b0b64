pub mod analysis;
pub mod config;
pub mod dependency;

pub use analysis::{check_plan, show_plan_relationships};
pub use config::{Configuration, load_configuration};
pub use dependency::{resolve_plan, validate_configuration};

use serde::Deserialize;
use std::{fmt, path::PathBuf};

/// The built-in units of work. Every pipeline bottoms out in these.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    Clean,
    Modules,
    Styles,
    Scripts,
    Images,
    WatchFiles,
    Serve,
}

impl TaskKind {
    pub const ALL: [TaskKind; 7] = [
        TaskKind::Clean,
        TaskKind::Modules,
        TaskKind::Styles,
        TaskKind::Scripts,
        TaskKind::Images,
        TaskKind::WatchFiles,
        TaskKind::Serve,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::Clean => "clean",
            TaskKind::Modules => "modules",
            TaskKind::Styles => "css",
            TaskKind::Scripts => "js",
            TaskKind::Images => "minifyImages",
            TaskKind::WatchFiles => "watchFiles",
            TaskKind::Serve => "serve",
        }
    }

    pub fn from_name(name: &str) -> Option<TaskKind> {
        TaskKind::ALL.into_iter().find(|kind| kind.name() == name)
    }

    pub fn description(self) -> &'static str {
        match self {
            TaskKind::Clean => "Remove the vendor directory",
            TaskKind::Modules => "Copy third-party files into the vendor directory",
            TaskKind::Styles => "Compile, prefix and minify style sheets",
            TaskKind::Scripts => "Minify scripts",
            TaskKind::Images => "Optimize images",
            TaskKind::WatchFiles => "Rebuild on source changes",
            TaskKind::Serve => "Serve the project with live reload",
        }
    }

    /// Tasks that run until the process is interrupted.
    pub fn is_long_running(self) -> bool {
        matches!(self, TaskKind::WatchFiles | TaskKind::Serve)
    }

    /// Paths the task reads and writes, as directory prefixes relative to
    /// the project root.
    pub fn manifest(self, config: &Configuration) -> Manifest {
        match self {
            TaskKind::Clean => Manifest {
                inputs: Vec::new(),
                outputs: vec![config.vendor_dir.clone()],
            },
            TaskKind::Modules => Manifest {
                inputs: config.vendor.iter().flat_map(|m| m.src.bases()).collect(),
                outputs: config.vendor.iter().map(|m| m.dest.clone()).collect(),
            },
            TaskKind::Styles => Manifest {
                inputs: config
                    .styles
                    .src
                    .bases()
                    .into_iter()
                    .chain(config.styles.load_paths.iter().cloned())
                    .collect(),
                outputs: vec![config.styles.dest.clone()],
            },
            TaskKind::Scripts => Manifest {
                inputs: config.scripts.src.bases(),
                outputs: vec![config.scripts.dest.clone()],
            },
            TaskKind::Images => Manifest {
                inputs: config.images.src.bases(),
                outputs: vec![config.images.dest.clone()],
            },
            TaskKind::WatchFiles | TaskKind::Serve => Manifest::default(),
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl Manifest {
    pub fn extend(&mut self, other: Manifest) {
        self.inputs.extend(other.inputs);
        self.outputs.extend(other.outputs);
    }
}

/// A pipeline step as written in configuration: a task or pipeline name, or
/// a composition of steps.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Step {
    Run(String),
    Sequence { sequence: Vec<Step> },
    Parallel { parallel: Vec<Step> },
}

impl Step {
    pub fn run(name: &str) -> Step {
        Step::Run(name.to_string())
    }

    pub fn sequence(steps: impl IntoIterator<Item = Step>) -> Step {
        Step::Sequence {
            sequence: steps.into_iter().collect(),
        }
    }

    pub fn parallel(steps: impl IntoIterator<Item = Step>) -> Step {
        Step::Parallel {
            parallel: steps.into_iter().collect(),
        }
    }

    /// Every name this step refers to, in order of appearance.
    pub fn references(&self) -> Vec<&str> {
        match self {
            Step::Run(name) => vec![name.as_str()],
            Step::Sequence { sequence: steps } | Step::Parallel { parallel: steps } => {
                steps.iter().flat_map(Step::references).collect()
            }
        }
    }
}

/// A step tree with every pipeline reference inlined.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Plan {
    Task(TaskKind),
    Sequence(Vec<Plan>),
    Parallel(Vec<Plan>),
}

impl Plan {
    /// Tasks in the order a sequential walk would reach them.
    pub fn tasks(&self) -> Vec<TaskKind> {
        match self {
            Plan::Task(kind) => vec![*kind],
            Plan::Sequence(steps) | Plan::Parallel(steps) => {
                steps.iter().flat_map(Plan::tasks).collect()
            }
        }
    }

    pub fn contains(&self, kind: TaskKind) -> bool {
        self.tasks().contains(&kind)
    }

    pub fn manifest(&self, config: &Configuration) -> Manifest {
        let mut manifest = Manifest::default();
        for kind in self.tasks() {
            manifest.extend(kind.manifest(config));
        }
        manifest
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Plan::Task(kind) => write!(f, "{}", kind),
            Plan::Sequence(steps) => {
                let parts: Vec<String> = steps.iter().map(ToString::to_string).collect();
                write!(f, "{}", parts.join(" -> "))
            }
            Plan::Parallel(steps) => {
                let parts: Vec<String> = steps.iter().map(ToString::to_string).collect();
                write!(f, "({})", parts.join(" | "))
            }
        }
    }
}
