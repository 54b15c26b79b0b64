use std::{
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use futures::future::{BoxFuture, join_all};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::{
    assets::{images, scripts, styles, vendor},
    cache::{self, Cache},
    error::{PipelineError, Result},
    reload::ReloadHub,
    server::DevServer,
    task::{Configuration, Plan, TaskKind, resolve_plan},
    util::hash_files,
    watch::run_watch,
};

struct Context {
    config: Configuration,
    hub: ReloadHub,
    cache: Mutex<Cache>,
    cache_changed: AtomicBool,
    /// Set once the invoked plan includes the watch loop; style compilation
    /// errors are then logged instead of failing the pipeline.
    watching: AtomicBool,
    shutdown: watch::Sender<bool>,
}

/// Runs plans against one configuration. Clones share the same context.
#[derive(Clone)]
pub struct TaskRunner {
    ctx: Arc<Context>,
}

impl TaskRunner {
    pub fn new(config: Configuration, hub: ReloadHub) -> Self {
        let cache = if config.incremental {
            cache::load_cache(config.cache_dir.as_deref(), &config.root)
        } else {
            Cache::default()
        };
        let (shutdown, _) = watch::channel(false);

        Self {
            ctx: Arc::new(Context {
                config,
                hub,
                cache: Mutex::new(cache),
                cache_changed: AtomicBool::new(false),
                watching: AtomicBool::new(false),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.ctx.config
    }

    pub fn hub(&self) -> &ReloadHub {
        &self.ctx.hub
    }

    /// Asks long-running tasks to stop.
    pub fn request_shutdown(&self) {
        self.ctx.shutdown.send_replace(true);
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.ctx.shutdown.subscribe()
    }

    pub async fn run_named(&self, name: &str) -> Result<()> {
        let plan = resolve_plan(&self.ctx.config, name)?;
        self.run(&plan).await
    }

    /// Runs a top-level plan.
    pub async fn run(&self, plan: &Plan) -> Result<()> {
        if plan.contains(TaskKind::WatchFiles) {
            self.ctx.watching.store(true, Ordering::SeqCst);
        }
        self.run_plan(plan).await
    }

    fn run_plan<'a>(&'a self, plan: &'a Plan) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match plan {
                Plan::Task(kind) => self.run_task(*kind).await,
                Plan::Sequence(steps) => self.run_sequence(steps).await,
                Plan::Parallel(steps) => self.run_parallel(steps).await,
            }
        })
    }

    async fn run_sequence(&self, steps: &[Plan]) -> Result<()> {
        let mut first_error = None;

        for step in steps {
            if let Err(e) = self.run_plan(step).await {
                if self.ctx.config.continue_on_failure {
                    warn!("'{}' failed, continuing due to --continue-on-failure", step);
                    first_error.get_or_insert(e);
                } else {
                    debug!("'{}' failed, stopping sequence", step);
                    return Err(e);
                }
            }
        }

        first_error.map_or(Ok(()), Err)
    }

    /// Siblings are never cancelled: every branch runs to completion and
    /// the group then reports its first failure.
    async fn run_parallel(&self, steps: &[Plan]) -> Result<()> {
        debug!("Running {} steps in parallel", steps.len());

        let results = join_all(steps.iter().map(|step| self.run_plan(step))).await;

        let mut first_error = None;
        let mut failures = 0;
        for result in results {
            if let Err(e) = result {
                failures += 1;
                first_error.get_or_insert(e);
            }
        }

        if failures > 1 {
            error!("{} of {} parallel steps failed", failures, steps.len());
        }

        first_error.map_or(Ok(()), Err)
    }

    async fn run_task(&self, kind: TaskKind) -> Result<()> {
        info!("Starting '{}'...", kind);
        let started = Instant::now();

        let execution = self.execute_task(kind);
        let result = match self.ctx.config.timeouts.get(kind.name()) {
            Some(limit) => tokio::time::timeout(*limit, execution)
                .await
                .unwrap_or_else(|_| Err(PipelineError::Timeout(kind.to_string()))),
            None => execution.await,
        };

        let elapsed = humantime::format_duration(round_to_millis(started.elapsed()));
        match result {
            Ok(()) => {
                info!("Finished '{}' after {}", kind, elapsed);
                Ok(())
            }
            Err(e) if e.is_recoverable() && self.ctx.watching.load(Ordering::SeqCst) => {
                error!("'{}' errored after {}: {}", kind, elapsed, e);
                Ok(())
            }
            Err(e) => {
                error!("'{}' errored after {}: {}", kind, elapsed, e);
                // Parallel siblings never get cancelled, so a failed watcher
                // or server has to stop the other long-running task itself.
                if kind.is_long_running() {
                    self.request_shutdown();
                }
                Err(e)
            }
        }
    }

    async fn execute_task(&self, kind: TaskKind) -> Result<()> {
        let config = &self.ctx.config;
        let root = &config.root;

        let cache_key = self.cache_key(kind)?;
        if let Some(key) = &cache_key {
            if self.ctx.cache.lock().await.contains(key) && outputs_exist(kind, config)? {
                info!("'{}': inputs unchanged and outputs present, skipping", kind);
                return Ok(());
            }
        }

        match kind {
            TaskKind::Clean => vendor::clean(root, &config.vendor_dir).await?,
            TaskKind::Modules => {
                vendor::copy_modules(root, &config.vendor).await?;
            }
            TaskKind::Styles => {
                styles::build_styles(root, &config.styles, &config.served_root(), &self.ctx.hub)
                    .await?;
            }
            TaskKind::Scripts => {
                scripts::build_scripts(root, &config.scripts, &self.ctx.hub).await?;
            }
            TaskKind::Images => {
                images::optimize_images(root, &config.images).await?;
            }
            TaskKind::WatchFiles => run_watch(self.clone()).await?,
            TaskKind::Serve => self.serve().await?,
        }

        if let Some(key) = cache_key {
            self.ctx.cache.lock().await.insert(key);
            self.ctx.cache_changed.store(true, Ordering::SeqCst);
        }

        Ok(())
    }

    async fn serve(&self) -> Result<()> {
        let config = &self.ctx.config;
        let server = DevServer::start(
            &config.server,
            config.served_root(),
            self.ctx.hub.clone(),
        )
        .await?;

        wait_for_shutdown(&mut self.shutdown_signal()).await;

        server.shutdown().await
    }

    /// Content hash of the task's inputs, when incremental mode applies.
    fn cache_key(&self, kind: TaskKind) -> Result<Option<String>> {
        if !self.ctx.config.incremental {
            return Ok(None);
        }

        let files = match input_files(kind, &self.ctx.config)? {
            Some(files) => files,
            None => return Ok(None),
        };

        let hash = hash_files(kind.name(), &files)?;
        Ok(Some(hash.to_hex().to_string()))
    }

    /// Persists the incremental cache if any task updated it.
    pub async fn save_cache(&self) {
        let config = &self.ctx.config;
        if !config.incremental {
            return;
        }

        if self.ctx.cache_changed.load(Ordering::SeqCst) {
            let cache = self.ctx.cache.lock().await;
            cache::save_cache(&cache, config.cache_dir.as_deref(), &config.root);
        } else {
            debug!("No changes detected, cache not saved.");
        }
    }
}

/// Resolves once shutdown has been requested or the runner is gone.
pub(crate) async fn wait_for_shutdown(signal: &mut watch::Receiver<bool>) {
    loop {
        let stop = *signal.borrow_and_update();
        if stop || signal.changed().await.is_err() {
            return;
        }
    }
}

fn input_files(kind: TaskKind, config: &Configuration) -> Result<Option<Vec<PathBuf>>> {
    let sets = match kind {
        TaskKind::Modules => config.vendor.iter().map(|m| &m.src).collect(),
        TaskKind::Styles => vec![&config.styles.src],
        TaskKind::Scripts => vec![&config.scripts.src],
        TaskKind::Images => vec![&config.images.src],
        TaskKind::Clean | TaskKind::WatchFiles | TaskKind::Serve => return Ok(None),
    };

    let mut files = Vec::new();
    for set in sets {
        files.extend(set.resolve(&config.root)?.into_iter().map(|f| f.path));
    }
    Ok(Some(files))
}

/// Whether every file the task would write is present.
fn outputs_exist(kind: TaskKind, config: &Configuration) -> Result<bool> {
    let root = &config.root;
    let outputs = match kind {
        TaskKind::Modules => vendor::outputs(root, &config.vendor)?,
        TaskKind::Styles => styles::outputs(root, &config.styles)?,
        TaskKind::Scripts => scripts::outputs(root, &config.scripts)?,
        TaskKind::Images => images::outputs(root, &config.images)?,
        TaskKind::Clean | TaskKind::WatchFiles | TaskKind::Serve => return Ok(false),
    };
    Ok(outputs.iter().all(|output| output.exists()))
}

fn round_to_millis(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn project() -> (tempfile::TempDir, Configuration) {
        let dir = tempfile::tempdir().unwrap();
        let config = Configuration::with_root(fs::canonicalize(dir.path()).unwrap());
        (dir, config)
    }

    #[tokio::test]
    async fn sequence_stops_on_first_failure() {
        let (dir, config) = project();
        fs::create_dir_all(dir.path().join("js")).unwrap();
        fs::write(dir.path().join("js/bad.js"), "function ( {").unwrap();

        let runner = TaskRunner::new(config, ReloadHub::new());
        let plan = Plan::Sequence(vec![Plan::Task(TaskKind::Scripts), Plan::Task(TaskKind::Images)]);

        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/a.svg"), "<svg/>").unwrap();

        assert!(runner.run(&plan).await.is_err());
        assert!(!dir.path().join("dist/img/a.svg").exists());
    }

    #[tokio::test]
    async fn parallel_siblings_finish_despite_a_failure() {
        let (dir, config) = project();
        fs::create_dir_all(dir.path().join("js")).unwrap();
        fs::write(dir.path().join("js/bad.js"), "function ( {").unwrap();
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/a.svg"), "<svg/>").unwrap();

        let runner = TaskRunner::new(config, ReloadHub::new());
        let plan = Plan::Parallel(vec![Plan::Task(TaskKind::Scripts), Plan::Task(TaskKind::Images)]);

        assert!(matches!(runner.run(&plan).await, Err(PipelineError::Minify { .. })));
        assert!(dir.path().join("dist/img/a.svg").exists());
    }

    #[tokio::test]
    async fn continue_on_failure_runs_later_steps() {
        let (dir, mut config) = project();
        config.continue_on_failure = true;
        fs::create_dir_all(dir.path().join("js")).unwrap();
        fs::write(dir.path().join("js/bad.js"), "function ( {").unwrap();
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/a.svg"), "<svg/>").unwrap();

        let runner = TaskRunner::new(config, ReloadHub::new());
        let plan = Plan::Sequence(vec![Plan::Task(TaskKind::Scripts), Plan::Task(TaskKind::Images)]);

        assert!(runner.run(&plan).await.is_err());
        assert!(dir.path().join("dist/img/a.svg").exists());
    }

    #[tokio::test]
    async fn timeouts_fail_the_task() {
        let (dir, mut config) = project();
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/a.svg"), "<svg/>").unwrap();
        config.timeouts.insert("minifyImages".to_string(), Duration::ZERO);

        let runner = TaskRunner::new(config, ReloadHub::new());
        let result = runner.run(&Plan::Task(TaskKind::Images)).await;
        assert!(matches!(result, Err(PipelineError::Timeout(_))));
    }

    #[tokio::test]
    async fn incremental_mode_skips_unchanged_inputs() {
        let (dir, mut config) = project();
        config.incremental = true;
        fs::create_dir_all(dir.path().join("img")).unwrap();
        fs::write(dir.path().join("img/a.svg"), "<svg/>").unwrap();

        let runner = TaskRunner::new(config.clone(), ReloadHub::new());
        runner.run(&Plan::Task(TaskKind::Images)).await.unwrap();
        runner.save_cache().await;

        fs::write(dir.path().join("dist/img/a.svg"), "stale").unwrap();
        let runner = TaskRunner::new(config, ReloadHub::new());
        runner.run(&Plan::Task(TaskKind::Images)).await.unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("dist/img/a.svg")).unwrap(), "stale");
    }

    #[tokio::test]
    async fn incremental_mode_rebuilds_a_missing_output() {
        let (dir, mut config) = project();
        config.incremental = true;
        fs::create_dir_all(dir.path().join("js")).unwrap();
        fs::write(dir.path().join("js/a.js"), "let a = 1;").unwrap();
        fs::write(dir.path().join("js/b.js"), "let b = 2;").unwrap();

        let runner = TaskRunner::new(config.clone(), ReloadHub::new());
        runner.run(&Plan::Task(TaskKind::Scripts)).await.unwrap();
        runner.save_cache().await;

        fs::remove_file(dir.path().join("dist/js/b.min.js")).unwrap();
        assert!(!outputs_exist(TaskKind::Scripts, &config).unwrap());

        let runner = TaskRunner::new(config, ReloadHub::new());
        runner.run(&Plan::Task(TaskKind::Scripts)).await.unwrap();

        assert!(dir.path().join("dist/js/b.min.js").exists());
    }

    #[tokio::test]
    async fn failed_long_running_task_requests_shutdown() {
        let (_dir, mut config) = project();
        let occupied = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        config.server.port = occupied.local_addr().unwrap().port();

        let runner = TaskRunner::new(config, ReloadHub::new());
        let mut shutdown = runner.shutdown_signal();

        let result = runner.run(&Plan::Task(TaskKind::Serve)).await;
        assert!(matches!(result, Err(PipelineError::Server(_))), "{:?}", result);
        assert!(*shutdown.borrow_and_update());
    }

    #[tokio::test]
    async fn failed_one_shot_task_leaves_shutdown_alone() {
        let (dir, config) = project();
        fs::create_dir_all(dir.path().join("js")).unwrap();
        fs::write(dir.path().join("js/bad.js"), "function ( {").unwrap();

        let runner = TaskRunner::new(config, ReloadHub::new());
        let shutdown = runner.shutdown_signal();

        assert!(runner.run(&Plan::Task(TaskKind::Scripts)).await.is_err());
        assert!(!*shutdown.borrow());
    }
}
