use std::collections::{HashMap, HashSet};

use super::{Configuration, Plan, Step, TaskKind, config::RELOAD_TARGET};
use crate::error::{PipelineError, Result};

pub fn validate_configuration(config: &Configuration) -> Result<()> {
    for (name, step) in &config.pipelines {
        if TaskKind::from_name(name).is_some() {
            return Err(PipelineError::Config(format!(
                "Pipeline '{}' shadows the built-in task of the same name",
                name
            )));
        }

        for reference in step.references() {
            if reference == name {
                return Err(PipelineError::Config(format!(
                    "Pipeline '{}' depends on itself",
                    name
                )));
            }
            if !config.is_known(reference) {
                return Err(PipelineError::Config(format!(
                    "Pipeline '{}' depends on '{}' which doesn't exist",
                    name, reference
                )));
            }
        }

        if is_empty_step(step) {
            return Err(PipelineError::Config(format!(
                "Pipeline '{}' has an empty step list",
                name
            )));
        }
    }

    detect_cycles(config)?;

    if config.images.level > 6 {
        return Err(PipelineError::Config(format!(
            "images.level must be between 0 and 6, got {}",
            config.images.level
        )));
    }
    if !(1..=100).contains(&config.images.jpeg_quality) {
        return Err(PipelineError::Config(format!(
            "images.jpeg_quality must be between 1 and 100, got {}",
            config.images.jpeg_quality
        )));
    }

    if !config.is_known(&config.default_task) {
        return Err(PipelineError::Config(format!(
            "Default task '{}' doesn't exist",
            config.default_task
        )));
    }

    for binding in &config.watch {
        if binding.run != RELOAD_TARGET && !config.is_known(&binding.run) {
            return Err(PipelineError::Config(format!(
                "Watch binding for {:?} runs '{}' which doesn't exist",
                binding.src.patterns(),
                binding.run
            )));
        }
    }

    for task in config.timeouts.keys() {
        match TaskKind::from_name(task) {
            Some(kind) if !kind.is_long_running() => {}
            _ => {
                return Err(PipelineError::Config(format!(
                    "Timeout set for '{}' which is not a finite task",
                    task
                )));
            }
        }
    }

    Ok(())
}

fn is_empty_step(step: &Step) -> bool {
    match step {
        Step::Run(_) => false,
        Step::Sequence { sequence: steps } | Step::Parallel { parallel: steps } => {
            steps.is_empty() || steps.iter().any(is_empty_step)
        }
    }
}

/// Inlines every pipeline reference reachable from `target`.
pub fn resolve_plan(config: &Configuration, target: &str) -> Result<Plan> {
    if !config.is_known(target) {
        return Err(PipelineError::Task(format!("Task '{}' not found", target)));
    }

    resolve_step(config, &Step::Run(target.to_string()))
}

fn resolve_step(config: &Configuration, step: &Step) -> Result<Plan> {
    match step {
        Step::Run(name) => {
            if let Some(kind) = TaskKind::from_name(name) {
                return Ok(Plan::Task(kind));
            }
            match config.pipelines.get(name) {
                Some(pipeline) => resolve_step(config, pipeline),
                None => Err(PipelineError::Task(format!("Task '{}' not found", name))),
            }
        }
        Step::Sequence { sequence } => Ok(Plan::Sequence(
            sequence
                .iter()
                .map(|s| resolve_step(config, s))
                .collect::<Result<_>>()?,
        )),
        Step::Parallel { parallel } => Ok(Plan::Parallel(
            parallel
                .iter()
                .map(|s| resolve_step(config, s))
                .collect::<Result<_>>()?,
        )),
    }
}

fn detect_cycles(config: &Configuration) -> Result<()> {
    let pipeline_map: HashMap<&str, Vec<&str>> = config
        .pipelines
        .iter()
        .map(|(name, step)| (name.as_str(), step.references()))
        .collect();

    for name in config.pipelines.keys() {
        let mut visited = HashSet::new();
        let mut path = Vec::new();

        if has_cycle(name, &pipeline_map, &mut visited, &mut path) {
            path.push(name.clone());
            return Err(PipelineError::Config(format!(
                "Circular dependency: {}",
                path.join(" -> ")
            )));
        }
    }

    Ok(())
}

fn has_cycle(
    name: &str,
    pipeline_map: &HashMap<&str, Vec<&str>>,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool {
    if path.iter().any(|id| id == name) {
        return true;
    }

    if visited.contains(name) {
        return false;
    }

    visited.insert(name.to_string());
    path.push(name.to_string());

    if let Some(references) = pipeline_map.get(name) {
        for reference in references {
            if has_cycle(reference, pipeline_map, visited, path) {
                return true;
            }
        }
    }

    path.pop();

    false
}
