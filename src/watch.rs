//! Watch loop: turns file-system events into task re-runs and browser
//! reloads.
//!
//! Raw events are batched until the tree has been quiet for the debounce
//! window. Each batch fires every matching binding once. Every target owns a
//! worker that runs at most one execution at a time and keeps at most one
//! re-run queued, so a burst of saves never piles up overlapping builds.

use std::{
    collections::BTreeSet,
    future::Future,
    path::{Component, Path, PathBuf},
    time::Duration,
};

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    error::{PipelineError, Result},
    execution::{TaskRunner, wait_for_shutdown},
    task::config::{RELOAD_TARGET, WatchBinding},
};

/// What a binding does when one of its paths changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Target {
    Reload,
    Run(String),
}

impl Target {
    fn from_binding(binding: &WatchBinding) -> Target {
        if binding.run == RELOAD_TARGET {
            Target::Reload
        } else {
            Target::Run(binding.run.clone())
        }
    }
}

/// Distinct targets triggered by a batch of changed paths (relative to the
/// project root), in binding order.
pub fn triggered_targets(changed: &BTreeSet<PathBuf>, bindings: &[WatchBinding]) -> Vec<Target> {
    let mut targets = Vec::new();

    for binding in bindings {
        let target = Target::from_binding(binding);
        if targets.contains(&target) {
            continue;
        }
        if changed
            .iter()
            .any(|path| binding.src.matches(path).unwrap_or(false))
        {
            targets.push(target);
        }
    }

    targets
}

/// Recursive watcher over the project root delivering root-relative paths.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    event_rx: mpsc::UnboundedReceiver<PathBuf>,
    root: PathBuf,
    ignore: Vec<String>,
}

impl FileWatcher {
    /// `root` must be absolute; events under any top-level directory named
    /// in `ignore` are dropped.
    pub fn new(root: PathBuf, ignore: Vec<String>) -> std::result::Result<Self, notify::Error> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) if is_change(&event.kind) => {
                    for path in event.paths {
                        // Receiver gone means the watch loop has ended.
                        let _ = event_tx.send(path);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Watch error: {}", e),
            },
            Config::default(),
        )?;

        watcher.watch(&root, RecursiveMode::Recursive)?;

        Ok(Self {
            _watcher: watcher,
            event_rx,
            root,
            ignore,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Waits for the next change, then keeps collecting until no event has
    /// arrived for `debounce`. Returns `None` once the watcher has stopped.
    pub async fn next_batch(&mut self, debounce: Duration) -> Option<BTreeSet<PathBuf>> {
        let mut batch = BTreeSet::new();

        while batch.is_empty() {
            let path = self.event_rx.recv().await?;
            if let Some(relative) = self.relative(&path) {
                batch.insert(relative);
            }
        }

        loop {
            match tokio::time::timeout(debounce, self.event_rx.recv()).await {
                Ok(Some(path)) => {
                    if let Some(relative) = self.relative(&path) {
                        batch.insert(relative);
                    }
                }
                Ok(None) | Err(_) => break,
            }
        }

        debug!("Change batch: {:?}", batch);
        Some(batch)
    }

    fn relative(&self, path: &Path) -> Option<PathBuf> {
        let relative = path.strip_prefix(&self.root).ok()?;

        match relative.components().next() {
            Some(Component::Normal(first))
                if self.ignore.iter().any(|ignored| first == ignored.as_str()) =>
            {
                None
            }
            Some(_) => Some(relative.to_path_buf()),
            None => None,
        }
    }
}

fn is_change(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

/// Serializes executions of one target. While a run is in flight one more
/// trigger is queued; any further triggers coalesce into the queued one.
pub struct TargetWorker {
    trigger: mpsc::Sender<()>,
}

impl TargetWorker {
    pub fn spawn<F, Fut>(job: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (trigger, mut pending) = mpsc::channel(1);

        tokio::spawn(async move {
            while pending.recv().await.is_some() {
                job().await;
            }
        });

        Self { trigger }
    }

    /// Returns `false` when the trigger coalesced into an already queued run.
    pub fn trigger(&self) -> bool {
        self.trigger.try_send(()).is_ok()
    }
}

/// Runs until shutdown is requested or a re-run fails with an error the
/// session cannot survive.
pub async fn run_watch(runner: TaskRunner) -> Result<()> {
    let config = runner.config();

    for binding in &config.watch {
        // Surfaces bad patterns at startup rather than on the first event.
        binding
            .src
            .matches(Path::new(""))
            .map_err(|e| PipelineError::Config(format!("Invalid watch pattern: {}", e)))?;
    }

    let mut watcher = FileWatcher::new(config.root.clone(), config.watch_ignore.clone())?;
    let (fatal_tx, mut fatal_rx) = mpsc::channel::<PipelineError>(1);

    let mut workers: Vec<(Target, TargetWorker)> = Vec::new();
    for binding in &config.watch {
        let target = Target::from_binding(binding);
        if workers.iter().any(|(existing, _)| *existing == target) {
            continue;
        }
        let worker = spawn_target_worker(&runner, &target, fatal_tx.clone());
        workers.push((target, worker));
    }

    info!(
        "Watching {} ({} binding(s))",
        watcher.root().display(),
        config.watch.len()
    );

    let mut shutdown = runner.shutdown_signal();
    loop {
        tokio::select! {
            batch = watcher.next_batch(config.debounce) => {
                let Some(batch) = batch else {
                    break;
                };
                for target in triggered_targets(&batch, &config.watch) {
                    if let Some((_, worker)) = workers.iter().find(|(t, _)| *t == target) {
                        if !worker.trigger() {
                            debug!("{:?} already queued", target);
                        }
                    }
                }
            }
            Some(error) = fatal_rx.recv() => {
                runner.request_shutdown();
                return Err(error);
            }
            _ = wait_for_shutdown(&mut shutdown) => break,
        }
    }

    info!("Stopped watching");
    Ok(())
}

fn spawn_target_worker(
    runner: &TaskRunner,
    target: &Target,
    fatal: mpsc::Sender<PipelineError>,
) -> TargetWorker {
    match target {
        Target::Reload => {
            let hub = runner.hub().clone();
            TargetWorker::spawn(move || {
                info!("Reloading browsers");
                hub.reload();
                async {}
            })
        }
        Target::Run(name) => {
            let runner = runner.clone();
            let name = name.clone();
            TargetWorker::spawn(move || {
                let runner = runner.clone();
                let name = name.clone();
                let fatal = fatal.clone();
                async move {
                    if let Err(e) = runner.run_named(&name).await {
                        let _ = fatal.try_send(e);
                    }
                }
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{task::Configuration, util::SourceSet};
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    fn changed(paths: &[&str]) -> BTreeSet<PathBuf> {
        paths.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn default_bindings_route_changes() {
        let bindings = Configuration::with_root(".").watch;

        assert_eq!(
            triggered_targets(&changed(&["scss/_vars.scss"]), &bindings),
            vec![Target::Run("css".to_string())]
        );
        assert_eq!(
            triggered_targets(&changed(&["js/app.js"]), &bindings),
            vec![Target::Run("js".to_string())]
        );
        assert!(triggered_targets(&changed(&["js/app.min.js"]), &bindings).is_empty());
        assert_eq!(
            triggered_targets(&changed(&["img/logo.png"]), &bindings),
            vec![Target::Run("minifyImages".to_string())]
        );
        assert!(triggered_targets(&changed(&["css/app.css"]), &bindings).is_empty());
    }

    #[test]
    fn one_markup_batch_yields_one_reload() {
        let bindings = Configuration::with_root(".").watch;
        let targets = triggered_targets(&changed(&["index.html", "about.html"]), &bindings);
        assert_eq!(targets, vec![Target::Reload]);
    }

    #[test]
    fn bindings_sharing_a_target_fire_once() {
        let bindings = vec![
            WatchBinding {
                src: SourceSet::new(["a/*"]),
                run: "css".to_string(),
            },
            WatchBinding {
                src: SourceSet::new(["b/*"]),
                run: "css".to_string(),
            },
        ];
        let targets = triggered_targets(&changed(&["a/x", "b/y"]), &bindings);
        assert_eq!(targets, vec![Target::Run("css".to_string())]);
    }

    #[tokio::test]
    async fn worker_coalesces_bursts() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let worker = TargetWorker::spawn(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        });

        assert!(worker.trigger());
        // Let the worker pick up the first trigger and start running.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(worker.trigger());
        for _ in 0..10 {
            assert!(!worker.trigger());
        }

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn ignored_directories_are_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let watcher = FileWatcher::new(root.clone(), vec!["node_modules".to_string()]).unwrap();

        assert_eq!(
            watcher.relative(&root.join("scss/app.scss")),
            Some(PathBuf::from("scss/app.scss"))
        );
        assert_eq!(watcher.relative(&root.join("node_modules/x/index.html")), None);
        assert_eq!(watcher.relative(Path::new("/elsewhere/file")), None);
        assert_eq!(watcher.relative(&root), None);
    }
}
