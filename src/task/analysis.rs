use std::path::{Path, PathBuf};

use tracing::debug;

use super::{Configuration, Manifest, Plan};
use crate::error::{PipelineError, Result};

/// Rejects parallel groups whose branches write where a sibling writes or
/// reads. Tasks in a group share no locks, so disjoint paths are required.
pub fn check_plan(plan: &Plan, config: &Configuration) -> Result<()> {
    match plan {
        Plan::Task(_) => Ok(()),
        Plan::Sequence(steps) => steps.iter().try_for_each(|s| check_plan(s, config)),
        Plan::Parallel(steps) => {
            let manifests: Vec<Manifest> = steps.iter().map(|s| s.manifest(config)).collect();

            for (i, left) in manifests.iter().enumerate() {
                for (j, right) in manifests.iter().enumerate() {
                    if i == j {
                        continue;
                    }
                    if let Some((output, other)) = find_conflict(left, right, i < j) {
                        return Err(PipelineError::Config(format!(
                            "Parallel steps '{}' and '{}' both touch '{}' (via '{}')",
                            steps[i],
                            steps[j],
                            output.display(),
                            other.display()
                        )));
                    }
                }
            }

            steps.iter().try_for_each(|s| check_plan(s, config))
        }
    }
}

fn find_conflict<'a>(
    writer: &'a Manifest,
    other: &'a Manifest,
    check_outputs: bool,
) -> Option<(&'a PathBuf, &'a PathBuf)> {
    for output in &writer.outputs {
        for input in &other.inputs {
            if paths_overlap(output, input) {
                return Some((output, input));
            }
        }
        if check_outputs {
            for other_output in &other.outputs {
                if paths_overlap(output, other_output) {
                    return Some((output, other_output));
                }
            }
        }
    }
    None
}

/// Logs sequence orderings that have no file relationship between them.
pub fn show_plan_relationships(plan: &Plan, config: &Configuration) {
    match plan {
        Plan::Task(_) => {}
        Plan::Sequence(steps) => {
            for pair in steps.windows(2) {
                let earlier = pair[0].manifest(config);
                let later = pair[1].manifest(config);
                if !has_file_relationship(&later, &earlier) {
                    debug!("'{}' runs after '{}' for ordering only", pair[1], pair[0]);
                }
            }
            steps.iter().for_each(|s| show_plan_relationships(s, config));
        }
        Plan::Parallel(steps) => steps.iter().for_each(|s| show_plan_relationships(s, config)),
    }
}

fn has_file_relationship(task: &Manifest, dependency: &Manifest) -> bool {
    if dependency.outputs.is_empty() || task.inputs.is_empty() {
        return false;
    }

    dependency
        .outputs
        .iter()
        .any(|output| task.inputs.iter().any(|input| paths_overlap(output, input)))
}

/// Whether one path lies inside the other. An empty path stands for the
/// project root.
fn paths_overlap(a: &Path, b: &Path) -> bool {
    let a = a.strip_prefix(".").unwrap_or(a);
    let b = b.strip_prefix(".").unwrap_or(b);
    a.starts_with(b) || b.starts_with(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, resolve_plan};

    #[test]
    fn default_build_is_conflict_free() {
        let config = Configuration::with_root(".");
        let plan = resolve_plan(&config, "build").unwrap();
        check_plan(&plan, &config).unwrap();
    }

    #[test]
    fn overlapping_outputs_are_rejected() {
        let mut config = Configuration::with_root(".");
        config.images.dest = PathBuf::from("dist/js/img");

        let plan = resolve_plan(&config, "build").unwrap();
        let err = check_plan(&plan, &config).unwrap_err();
        assert!(err.to_string().contains("dist/js"), "{}", err);
    }

    #[test]
    fn reading_a_sibling_output_is_rejected() {
        let mut config = Configuration::with_root(".");
        config.scripts.dest = PathBuf::from("scss/generated");

        let plan = Plan::Parallel(vec![Plan::Task(TaskKind::Styles), Plan::Task(TaskKind::Scripts)]);
        assert!(check_plan(&plan, &config).is_err());
    }

    #[test]
    fn overlap_is_component_wise() {
        assert!(paths_overlap(Path::new("vendor"), Path::new("vendor/jquery")));
        assert!(paths_overlap(Path::new("./css"), Path::new("css")));
        assert!(!paths_overlap(Path::new("css"), Path::new("scss")));
        assert!(!paths_overlap(Path::new("dist/js"), Path::new("dist/img")));
        assert!(paths_overlap(Path::new(""), Path::new("img")));
    }

    #[test]
    fn vendor_copy_reads_nothing_clean_writes() {
        let config = Configuration::with_root(".");
        let clean = TaskKind::Clean.manifest(&config);
        let modules = TaskKind::Modules.manifest(&config);
        assert!(!has_file_relationship(&modules, &clean));
    }
}
