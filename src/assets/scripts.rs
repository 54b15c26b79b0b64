use std::path::{Path, PathBuf};

use minify_js::{Session, TopLevelMode, minify};
use tracing::{debug, info};

use super::{blocking, is_minified, min_path};
use crate::{
    error::{PipelineError, Result},
    reload::ReloadHub,
    task::config::ScriptsConfig,
    util::{SourceFile, write_output},
};

/// Minifies every selected script into `<dest>/<name>.min.js`. Files already
/// named `*.min.js` are never inputs, even if the source set selects them.
pub async fn build_scripts(root: &Path, config: &ScriptsConfig, hub: &ReloadHub) -> Result<usize> {
    let sources = sources(root, config)?;
    let dest = root.join(&config.dest);
    let mut written = 0;

    for source in sources {
        let target = dest.join(min_path(&source.relative, "js"));
        let contents = tokio::fs::read(&source.path).await?;
        let path = source.path.clone();

        let minified = blocking(move || minify_script(&path, &contents)).await?;
        write_output(&target, &minified).await?;

        debug!("{} -> {}", source.path.display(), target.display());
        written += 1;
    }

    if written > 0 {
        hub.reload();
    }

    info!("Minified {} script(s)", written);
    Ok(written)
}

/// Every file a build of `config` writes.
pub fn outputs(root: &Path, config: &ScriptsConfig) -> Result<Vec<PathBuf>> {
    let dest = root.join(&config.dest);
    Ok(sources(root, config)?
        .iter()
        .map(|source| dest.join(min_path(&source.relative, "js")))
        .collect())
}

fn sources(root: &Path, config: &ScriptsConfig) -> Result<Vec<SourceFile>> {
    Ok(config
        .src
        .resolve(root)?
        .into_iter()
        .filter(|file| !is_minified(&file.path))
        .collect())
}

pub fn minify_script(path: &Path, source: &[u8]) -> Result<Vec<u8>> {
    let session = Session::new();
    let mut output = Vec::new();

    minify(&session, TopLevelMode::Global, source, &mut output).map_err(|e| {
        PipelineError::Minify {
            path: path.display().to_string(),
            message: format!("{:?}", e),
        }
    })?;

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn minified_output_is_smaller_and_stable() {
        let source = b"function greet(name) {\n    const message = 'hello ' + name;\n    return message;\n}\n";
        let path = PathBuf::from("js/greet.js");

        let first = minify_script(&path, source).unwrap();
        let second = minify_script(&path, source).unwrap();

        assert!(first.len() < source.len());
        assert_eq!(first, second);
    }

    #[test]
    fn syntax_errors_are_reported() {
        let result = minify_script(&PathBuf::from("js/bad.js"), b"function ( {");
        assert!(matches!(result, Err(PipelineError::Minify { .. })));
    }
}
