use std::{
    collections::{BTreeMap, HashMap},
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use regex::Regex;
use serde::Deserialize;
use tracing::debug;

use super::{Step, dependency::validate_configuration};
use crate::{
    error::{PipelineError, Result},
    util::{SourceSet, parse_duration},
};

pub const DEFAULT_CONFIG_FILE: &str = "assetline.toml";
pub const RELOAD_TARGET: &str = "reload";

const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(100);

static BRACED_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());
static SIMPLE_VARIABLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").unwrap());

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Config {
    config: Option<ConfigSection>,
    #[serde(default)]
    variables: HashMap<String, String>,
    vendor: Option<Vec<VendorMapping>>,
    #[serde(default)]
    styles: StylesConfig,
    #[serde(default)]
    scripts: ScriptsConfig,
    #[serde(default)]
    images: ImagesConfig,
    #[serde(default)]
    server: ServerConfig,
    watch: Option<Vec<WatchBinding>>,
    #[serde(default, rename = "pipeline")]
    pipelines: BTreeMap<String, Step>,
    #[serde(default)]
    timeouts: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigSection {
    default: Option<String>,
    cache_dir: Option<String>,
    #[serde(default)]
    incremental: bool,
    #[serde(default)]
    continue_on_failure: bool,
    debounce: Option<String>,
    vendor_dir: Option<PathBuf>,
    watch_ignore: Option<Vec<String>>,
}

/// One third-party subtree copied into the vendor directory.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VendorMapping {
    pub src: SourceSet,
    pub dest: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StylesConfig {
    pub src: SourceSet,
    pub dest: PathBuf,
    /// Extra import search paths, relative to the project root.
    pub load_paths: Vec<PathBuf>,
    /// Browserslist queries used for vendor prefixing.
    pub browsers: Vec<String>,
}

impl Default for StylesConfig {
    fn default() -> Self {
        Self {
            src: SourceSet::new(["scss/**/*.scss"]),
            dest: PathBuf::from("css"),
            load_paths: vec![PathBuf::from("node_modules")],
            browsers: vec!["defaults".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScriptsConfig {
    pub src: SourceSet,
    pub dest: PathBuf,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            src: SourceSet::new(["js/*.js", "!js/*.min.js"]),
            dest: PathBuf::from("dist/js"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImagesConfig {
    pub src: SourceSet,
    pub dest: PathBuf,
    /// PNG optimization preset, 0 (fast) to 6 (smallest).
    pub level: u8,
    /// JPEG re-encoding quality, 1 to 100.
    pub jpeg_quality: u8,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            src: SourceSet::new(["img/**/*"]),
            dest: PathBuf::from("dist/img"),
            level: 2,
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Directory served, relative to the project root.
    pub root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3000,
            root: PathBuf::from("."),
        }
    }
}

/// Re-runs `run` (a task, a pipeline, or `reload`) when a file in `src`
/// changes.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchBinding {
    pub src: SourceSet,
    pub run: String,
}

#[derive(Debug, Clone)]
pub struct Configuration {
    /// Absolute project root; every relative path is resolved against it.
    pub root: PathBuf,
    pub default_task: String,
    pub cache_dir: Option<String>,
    pub incremental: bool,
    pub continue_on_failure: bool,
    pub debounce: Duration,
    pub vendor_dir: PathBuf,
    pub vendor: Vec<VendorMapping>,
    pub styles: StylesConfig,
    pub scripts: ScriptsConfig,
    pub images: ImagesConfig,
    pub server: ServerConfig,
    pub watch: Vec<WatchBinding>,
    pub watch_ignore: Vec<String>,
    pub pipelines: BTreeMap<String, Step>,
    pub timeouts: HashMap<String, Duration>,
}

impl Configuration {
    /// The built-in layout, rooted at `root`.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            default_task: "build".to_string(),
            cache_dir: None,
            incremental: false,
            continue_on_failure: false,
            debounce: DEFAULT_DEBOUNCE,
            vendor_dir: PathBuf::from("vendor"),
            vendor: default_vendor_mappings(),
            styles: StylesConfig::default(),
            scripts: ScriptsConfig::default(),
            images: ImagesConfig::default(),
            server: ServerConfig::default(),
            watch: default_watch_bindings(),
            watch_ignore: ["node_modules", "vendor", "dist", "target", ".git"]
                .into_iter()
                .map(String::from)
                .collect(),
            pipelines: default_pipelines(),
            timeouts: HashMap::new(),
        }
    }

    /// Absolute directory the dev server serves.
    pub fn served_root(&self) -> PathBuf {
        self.root.join(&self.server.root)
    }

    pub fn is_known(&self, name: &str) -> bool {
        super::TaskKind::from_name(name).is_some() || self.pipelines.contains_key(name)
    }
}

fn default_vendor_mappings() -> Vec<VendorMapping> {
    let mapping = |src: &[&str], dest: &str| VendorMapping {
        src: SourceSet::new(src.iter().copied()),
        dest: PathBuf::from(dest),
    };

    vec![
        mapping(&["node_modules/bootstrap/dist/**/*"], "vendor/bootstrap"),
        mapping(
            &["node_modules/@fortawesome/fontawesome-free/css/**/*"],
            "vendor/fontawesome-free/css",
        ),
        mapping(
            &["node_modules/@fortawesome/fontawesome-free/webfonts/**/*"],
            "vendor/fontawesome-free/webfonts",
        ),
        mapping(&["node_modules/jquery.easing/*.js"], "vendor/jquery-easing"),
        mapping(
            &["node_modules/jquery/dist/*", "!node_modules/jquery/dist/core.js"],
            "vendor/jquery",
        ),
    ]
}

fn default_watch_bindings() -> Vec<WatchBinding> {
    let binding = |src: &[&str], run: &str| WatchBinding {
        src: SourceSet::new(src.iter().copied()),
        run: run.to_string(),
    };

    vec![
        binding(&["scss/**/*"], "css"),
        binding(&["js/**/*", "!js/**/*.min.js"], "js"),
        binding(&["**/*.html"], RELOAD_TARGET),
        binding(&["img/**/*"], "minifyImages"),
    ]
}

fn default_pipelines() -> BTreeMap<String, Step> {
    BTreeMap::from([
        (
            "vendor".to_string(),
            Step::sequence([Step::run("clean"), Step::run("modules")]),
        ),
        (
            "build".to_string(),
            Step::sequence([
                Step::run("vendor"),
                Step::parallel([Step::run("css"), Step::run("js"), Step::run("minifyImages")]),
            ]),
        ),
        (
            "watch".to_string(),
            Step::sequence([
                Step::run("build"),
                Step::parallel([Step::run("watchFiles"), Step::run("serve")]),
            ]),
        ),
    ])
}

/// Loads `config_path`, falling back to the built-in layout when the file
/// does not exist and `required` is false. The project root is the
/// directory holding the configuration file.
pub fn load_configuration(config_path: &Path, required: bool) -> Result<Configuration> {
    let root = project_root(config_path)?;

    let config = match fs::read_to_string(config_path) {
        Ok(contents) => toml::from_str(&contents)?,
        Err(e) if e.kind() == ErrorKind::NotFound && !required => {
            debug!(
                "No {} found, using built-in layout",
                config_path.display()
            );
            Config::default()
        }
        Err(e) => return Err(e.into()),
    };

    let configuration = process_config(config, root)?;
    validate_configuration(&configuration)?;
    Ok(configuration)
}

fn project_root(config_path: &Path) -> Result<PathBuf> {
    let parent = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok(fs::canonicalize(parent)?)
}

fn process_config(config: Config, root: PathBuf) -> Result<Configuration> {
    let mut configuration = Configuration::with_root(root);

    let mut variables = config.variables;
    add_builtin_variables(&mut variables, &configuration.root);

    if let Some(section) = config.config {
        if let Some(default) = section.default {
            configuration.default_task = default;
        }
        configuration.cache_dir = section.cache_dir;
        configuration.incremental = section.incremental;
        configuration.continue_on_failure = section.continue_on_failure;
        if let Some(debounce) = section.debounce {
            configuration.debounce = parse_config_duration("config.debounce", &debounce)?
                .unwrap_or(Duration::ZERO);
        }
        if let Some(vendor_dir) = section.vendor_dir {
            configuration.vendor_dir = vendor_dir;
        }
        if let Some(ignore) = section.watch_ignore {
            configuration.watch_ignore = ignore;
        }
    }

    if let Some(vendor) = config.vendor {
        configuration.vendor = vendor;
    }
    if let Some(watch) = config.watch {
        configuration.watch = watch;
    }
    configuration.styles = config.styles;
    configuration.scripts = config.scripts;
    configuration.images = config.images;
    configuration.server = config.server;
    configuration.pipelines.extend(config.pipelines);

    for (task, value) in config.timeouts {
        if let Some(duration) = parse_config_duration(&format!("timeouts.{}", task), &value)? {
            configuration.timeouts.insert(task, duration);
        }
    }

    substitute_variables_in_config(&mut configuration, &variables);

    Ok(configuration)
}

fn parse_config_duration(key: &str, value: &str) -> Result<Option<Duration>> {
    parse_duration(value).map_err(|e| {
        PipelineError::Config(format!(
            "Invalid duration '{}' for {}: {} (use a format like '100ms', '30s', '1h30m')",
            value, key, e
        ))
    })
}

fn add_builtin_variables(variables: &mut HashMap<String, String>, root: &Path) {
    variables
        .entry("PWD".to_string())
        .or_insert_with(|| root.to_string_lossy().to_string());
}

fn substitute_variables_in_config(config: &mut Configuration, variables: &HashMap<String, String>) {
    let path = |p: &PathBuf| PathBuf::from(substitute_variables(&p.to_string_lossy(), variables));
    let set = |s: &mut SourceSet| {
        for pattern in s.patterns_mut() {
            *pattern = substitute_variables(pattern, variables);
        }
    };

    config.vendor_dir = path(&config.vendor_dir);
    for mapping in &mut config.vendor {
        set(&mut mapping.src);
        mapping.dest = path(&mapping.dest);
    }

    set(&mut config.styles.src);
    config.styles.dest = path(&config.styles.dest);
    config.styles.load_paths = config.styles.load_paths.iter().map(path).collect();

    set(&mut config.scripts.src);
    config.scripts.dest = path(&config.scripts.dest);

    set(&mut config.images.src);
    config.images.dest = path(&config.images.dest);

    config.server.root = path(&config.server.root);

    for binding in &mut config.watch {
        set(&mut binding.src);
    }
}

fn substitute_variables(text: &str, variables: &HashMap<String, String>) -> String {
    let result = BRACED_VARIABLE
        .replace_all(text, |caps: &regex::Captures| lookup_variable(caps, variables))
        .to_string();

    SIMPLE_VARIABLE
        .replace_all(&result, |caps: &regex::Captures| lookup_variable(caps, variables))
        .to_string()
}

fn lookup_variable(caps: &regex::Captures, variables: &HashMap<String, String>) -> String {
    variables
        .get(&caps[1])
        .cloned()
        .unwrap_or_else(|| caps[0].to_string())
}
