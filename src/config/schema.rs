//! Configuration validation
//!
//! This module provides validation logic for configuration files and for the
//! relationships between tasks once they are built.

use crate::config::types::Config;
use crate::error::{ConfigError, ConfigResult};
use crate::runner::task::{SequenceItem, TaskKind, TaskRegistry, TaskSpec};
use crate::runner::template::has_expansions;
use crate::runner::words::split_plain;
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;

const TASK_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_:.+-]*$";
const ENV_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";
const TASK_TYPES: &[&str] = &["cmd", "shell", "script", "expr", "ref"];

/// Check a name against one of the validation patterns
pub fn matches_pattern(pattern: &str, value: &str) -> ConfigResult<bool> {
    let re = Regex::new(pattern)
        .map_err(|e| ConfigError::Invalid(format!("bad validation pattern: {}", e)))?;
    Ok(re.is_match(value))
}

/// Validate a complete configuration before tasks are built
pub fn validate_config(config: &Config) -> ConfigResult<()> {
    for (label, value) in [
        ("default_task_type", &config.default_task_type),
        ("default_array_item_task_type", &config.default_array_item_task_type),
    ] {
        if !TASK_TYPES.contains(&value.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "{} must be one of {}, got '{}'",
                label,
                TASK_TYPES.join(", "),
                value
            )));
        }
    }

    for (key, _) in &config.env {
        validate_env_name("<global env>", key)?;
    }

    for (name, _) in &config.tasks {
        if !matches_pattern(TASK_NAME_PATTERN, name)? {
            return Err(ConfigError::InvalidTask {
                task: name.clone(),
                reason: "task names must start with a letter or underscore and contain only letters, digits and _:.+-".to_string(),
            });
        }
    }

    Ok(())
}

fn validate_env_name(task: &str, key: &str) -> ConfigResult<()> {
    if matches_pattern(ENV_NAME_PATTERN, key)? {
        Ok(())
    } else {
        Err(ConfigError::InvalidTask {
            task: task.to_string(),
            reason: format!("'{}' is not a valid environment variable name", key),
        })
    }
}

/// Validate relationships between built tasks
pub fn validate_registry(registry: &TaskRegistry) -> ConfigResult<()> {
    for task in registry.tasks() {
        validate_task(registry, task, &[])?;
    }
    detect_circular_task_dependencies(registry)
}

/// Name of the task an invocation string starts with, if it is static
fn invocation_target(task: &str, invocation: &str) -> ConfigResult<Option<String>> {
    if has_expansions(invocation) {
        let words = split_plain(invocation).unwrap_or_default();
        return Ok(words
            .into_iter()
            .next()
            .filter(|first| !has_expansions(first)));
    }
    let words = split_plain(invocation).map_err(|e| ConfigError::InvalidTask {
        task: task.to_string(),
        reason: e,
    })?;
    match words.into_iter().next() {
        Some(first) => Ok(Some(first)),
        None => Err(ConfigError::InvalidTask {
            task: task.to_string(),
            reason: "empty task reference".to_string(),
        }),
    }
}

fn require_task<'a>(
    registry: &'a TaskRegistry,
    task: &str,
    invocation: &str,
) -> ConfigResult<Option<&'a Arc<TaskSpec>>> {
    match invocation_target(task, invocation)? {
        None => Ok(None),
        Some(target) => registry
            .get(&target)
            .map(Some)
            .ok_or(ConfigError::TaskNotFound(target)),
    }
}

/// Follow ref tasks to the task that actually runs
fn ref_target<'a>(registry: &'a TaskRegistry, task: &'a TaskSpec) -> Option<&'a TaskSpec> {
    let mut current = task;
    let mut seen = HashSet::new();
    while let TaskKind::Ref(invocation) = &current.kind {
        if !seen.insert(current.name.clone()) {
            return None;
        }
        let target = invocation_target(&current.name, invocation).ok().flatten()?;
        current = registry.get(&target)?;
    }
    Some(current)
}

fn validate_task(
    registry: &TaskRegistry,
    task: &TaskSpec,
    inherited_args: &[crate::runner::args::ArgumentSpec],
) -> ConfigResult<()> {
    for (key, _) in &task.env {
        validate_env_name(&task.name, key)?;
    }
    for (key, _) in &task.uses {
        validate_env_name(&task.name, key)?;
    }
    for invocation in task.deps.iter().chain(task.uses.iter().map(|(_, inv)| inv)) {
        require_task(registry, &task.name, invocation)?;
    }

    match &task.kind {
        TaskKind::Ref(invocation) => {
            require_task(registry, &task.name, invocation)?;
            if task.capture_stdout.is_some() {
                if let Some(target) = ref_target(registry, task) {
                    if matches!(target.kind, TaskKind::Sequence { .. }) {
                        return Err(ConfigError::CaptureOnSequence(task.name.clone()));
                    }
                }
            }
        }
        TaskKind::Sequence { items, .. } => {
            if task.capture_stdout.is_some() {
                return Err(ConfigError::CaptureOnSequence(task.name.clone()));
            }
            for item in items {
                match item {
                    SequenceItem::Task(sub) => validate_task(registry, sub, &[])?,
                    SequenceItem::Parallel(members) => {
                        for member in members {
                            validate_task(registry, member, &[])?;
                            if let Some(target) = ref_target(registry, member) {
                                if !target.is_leaf() {
                                    return Err(ConfigError::InvalidTask {
                                        task: member.name.clone(),
                                        reason: format!(
                                            "parallel group member refers to {} task '{}'",
                                            target.kind.label(),
                                            target.name
                                        ),
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
        TaskKind::Switch { control, cases, .. } => {
            validate_task(registry, control, &task.args)?;
            for case in cases {
                validate_task(registry, &case.task, &task.args)?;
            }
        }
        TaskKind::Expr { expr, .. } => {
            let known: HashSet<String> = task
                .args
                .iter()
                .chain(inherited_args.iter())
                .map(|arg| arg.env_name())
                .collect();
            if let Some(unknown) = expr.names().into_iter().find(|n| !known.contains(n)) {
                return Err(ConfigError::InvalidTask {
                    task: task.name.clone(),
                    reason: format!(
                        "expression refers to '{}' which is not a declared argument",
                        unknown
                    ),
                });
            }
        }
        TaskKind::Cmd(_) | TaskKind::Shell { .. } | TaskKind::Script { .. } => {}
    }

    Ok(())
}

/// Names of top-level tasks a task can start, directly or through inline subtasks
fn static_edges(task: &TaskSpec, out: &mut Vec<String>) {
    let mut push = |invocation: &str| {
        if let Ok(Some(target)) = invocation_target(&task.name, invocation) {
            out.push(target);
        }
    };
    for invocation in task.deps.iter().chain(task.uses.iter().map(|(_, inv)| inv)) {
        push(invocation);
    }
    if let TaskKind::Ref(invocation) = &task.kind {
        push(invocation);
    }

    match &task.kind {
        TaskKind::Sequence { items, .. } => {
            for item in items {
                match item {
                    SequenceItem::Task(sub) => static_edges(sub, out),
                    SequenceItem::Parallel(members) => {
                        members.iter().for_each(|m| static_edges(m, out));
                    }
                }
            }
        }
        TaskKind::Switch { control, cases, .. } => {
            static_edges(control, out);
            cases.iter().for_each(|c| static_edges(&c.task, out));
        }
        _ => {}
    }
}

/// Detect circular dependencies between tasks
fn detect_circular_task_dependencies(registry: &TaskRegistry) -> ConfigResult<()> {
    let mut visited = HashSet::new();
    for task in registry.tasks() {
        let mut stack = Vec::new();
        check_task_cycle(registry, &task.name, &mut visited, &mut stack)?;
    }
    Ok(())
}

fn check_task_cycle(
    registry: &TaskRegistry,
    task_name: &str,
    visited: &mut HashSet<String>,
    stack: &mut Vec<String>,
) -> ConfigResult<()> {
    if stack.iter().any(|t| t == task_name) {
        stack.push(task_name.to_string());
        return Err(ConfigError::CircularDependency(stack.join(" -> ")));
    }
    if visited.contains(task_name) {
        return Ok(());
    }

    let task = registry
        .get(task_name)
        .ok_or_else(|| ConfigError::TaskNotFound(task_name.to_string()))?;

    stack.push(task_name.to_string());
    let mut edges = Vec::new();
    static_edges(task, &mut edges);
    for edge in edges {
        check_task_cycle(registry, &edge, visited, stack)?;
    }
    stack.pop();
    visited.insert(task_name.to_string());

    Ok(())
}
