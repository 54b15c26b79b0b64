use std::path::{Path, PathBuf};

use lightningcss::{
    stylesheet::{MinifyOptions, ParserOptions, PrinterOptions, StyleSheet},
    targets::{Browsers, Targets},
};
use tracing::{debug, info};

use super::{blocking, min_path, url_path};
use crate::{
    error::{PipelineError, Result},
    reload::ReloadHub,
    task::config::StylesConfig,
    util::{SourceFile, write_output},
};

/// Expanded and minified renderings of one entry file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSheet {
    /// Output path of the expanded sheet, relative to the css directory.
    pub relative: PathBuf,
    pub expanded: String,
    pub minified: String,
}

/// Compiles every entry of the style source set. Nothing is written unless
/// every entry compiles, so a syntax error leaves earlier output in place.
///
/// Browsers are told which sheets changed by their path under `served_root`.
/// Sheets written outside it can only be picked up by a full reload.
pub async fn build_styles(
    root: &Path,
    config: &StylesConfig,
    served_root: &Path,
    hub: &ReloadHub,
) -> Result<usize> {
    let entries = entries(root, config)?;

    let load_paths: Vec<PathBuf> = config.load_paths.iter().map(|p| root.join(p)).collect();
    let browsers = resolve_browsers(&config.browsers)?;

    let compiled = blocking(move || {
        entries
            .iter()
            .map(|entry| compile_entry(entry, &load_paths, browsers))
            .collect::<Result<Vec<_>>>()
    })
    .await?;

    let dest = root.join(&config.dest);
    let mut changed = Vec::new();
    let mut outside_served_root = false;

    for sheet in &compiled {
        let (expanded_path, minified_path) = output_paths(&dest, &sheet.relative);

        write_output(&expanded_path, sheet.expanded.as_bytes()).await?;
        write_output(&minified_path, sheet.minified.as_bytes()).await?;

        for path in [&expanded_path, &minified_path] {
            match url_path(path, served_root) {
                Some(url) => changed.push(url),
                None => outside_served_root = true,
            }
        }
    }

    if outside_served_root {
        hub.reload();
    } else if !changed.is_empty() {
        hub.inject_css(changed);
    }

    info!("Compiled {} style sheet(s)", compiled.len());
    Ok(compiled.len())
}

/// Every file a build of `config` writes.
pub fn outputs(root: &Path, config: &StylesConfig) -> Result<Vec<PathBuf>> {
    let dest = root.join(&config.dest);
    Ok(entries(root, config)?
        .iter()
        .flat_map(|entry| {
            let (expanded, minified) = output_paths(&dest, &entry.relative.with_extension("css"));
            [expanded, minified]
        })
        .collect())
}

fn entries(root: &Path, config: &StylesConfig) -> Result<Vec<SourceFile>> {
    Ok(config
        .src
        .resolve(root)?
        .into_iter()
        .filter(|file| !is_partial(&file.path))
        .collect())
}

fn output_paths(dest: &Path, relative: &Path) -> (PathBuf, PathBuf) {
    (dest.join(relative), dest.join(min_path(relative, "css")))
}

/// Sass partials are only compiled through the files that import them.
fn is_partial(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|name| name.to_string_lossy().starts_with('_'))
}

fn resolve_browsers(queries: &[String]) -> Result<Option<Browsers>> {
    if queries.is_empty() {
        return Ok(None);
    }

    Browsers::from_browserslist(queries).map_err(|e| {
        PipelineError::Config(format!("Invalid browsers query {:?}: {}", queries, e))
    })
}

fn compile_entry(
    entry: &SourceFile,
    load_paths: &[PathBuf],
    browsers: Option<Browsers>,
) -> Result<CompiledSheet> {
    let shown = entry.path.display().to_string();
    debug!("Compiling {}", shown);

    let options = grass::Options::default()
        .style(grass::OutputStyle::Expanded)
        .load_paths(load_paths);

    let css = grass::from_path(&entry.path, &options).map_err(|e| PipelineError::StyleCompile {
        path: shown.clone(),
        message: e.to_string(),
    })?;

    Ok(CompiledSheet {
        relative: entry.relative.with_extension("css"),
        expanded: prefix(&css, &shown, browsers, false)?,
        minified: prefix(&css, &shown, browsers, true)?,
    })
}

/// Adds the vendor-prefixed declarations `browsers` need, then prints the
/// sheet either pretty or minified.
///
/// Prefixes are only generated by lightningcss's minify pass, so the pretty
/// rendering is normalized too: duplicate rules merge and values shorten.
pub fn prefix(
    css: &str,
    filename: &str,
    browsers: Option<Browsers>,
    minify: bool,
) -> Result<String> {
    let minify_error = |message: String| PipelineError::Minify {
        path: filename.to_string(),
        message,
    };

    let targets = || Targets {
        browsers,
        ..Targets::default()
    };

    let mut sheet = StyleSheet::parse(
        css,
        ParserOptions {
            filename: filename.to_string(),
            ..ParserOptions::default()
        },
    )
    .map_err(|e| minify_error(e.to_string()))?;

    sheet
        .minify(MinifyOptions {
            targets: targets(),
            ..MinifyOptions::default()
        })
        .map_err(|e| minify_error(e.to_string()))?;

    let output = sheet
        .to_css(PrinterOptions {
            minify,
            targets: targets(),
            ..PrinterOptions::default()
        })
        .map_err(|e| minify_error(e.to_string()))?;

    Ok(output.code)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safari13() -> Option<Browsers> {
        Some(Browsers {
            safari: Some(13 << 16),
            ..Browsers::default()
        })
    }

    #[test]
    fn partials_are_skipped() {
        assert!(is_partial(Path::new("scss/_variables.scss")));
        assert!(!is_partial(Path::new("scss/app.scss")));
    }

    #[test]
    fn prefix_adds_vendor_declaration() {
        let css = ".card {\n  user-select: none;\n}\n";
        let expanded = prefix(css, "card.css", safari13(), false).unwrap();
        let minified = prefix(css, "card.css", safari13(), true).unwrap();

        for output in [&expanded, &minified] {
            assert!(output.contains("-webkit-user-select"), "{}", output);
            assert_eq!(output.matches("user-select").count(), 2, "{}", output);
        }
        assert!(minified.len() <= expanded.len());
    }

    #[test]
    fn pretty_rendering_is_normalized_but_not_minified() {
        let css = ".a {\n  color: #ff0000;\n}\n.a {\n  margin: 0px;\n}\n";
        let expanded = prefix(css, "a.css", None, false).unwrap();

        assert_eq!(expanded.matches(".a").count(), 1, "{}", expanded);
        assert!(expanded.contains("color: red"), "{}", expanded);
        assert!(expanded.contains('\n'), "{}", expanded);
    }

    #[test]
    fn outputs_list_both_renderings_of_each_entry() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("scss/pages")).unwrap();
        std::fs::write(dir.path().join("scss/_vars.scss"), "").unwrap();
        std::fs::write(dir.path().join("scss/pages/home.scss"), "").unwrap();

        let outputs = outputs(dir.path(), &StylesConfig::default()).unwrap();
        assert_eq!(
            outputs,
            vec![
                dir.path().join("css/pages/home.css"),
                dir.path().join("css/pages/home.min.css"),
            ]
        );
    }

    #[test]
    fn empty_query_means_no_targets() {
        assert!(resolve_browsers(&[]).unwrap().is_none());
    }
}
