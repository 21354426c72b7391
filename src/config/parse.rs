//! Configuration file parsing and discovery

use crate::config::types::Config;
use crate::error::{ConfigError, ConfigResult, RpoeError};
use crate::runner::template::expand_braced;
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file names to search for
pub const CONFIG_FILE_NAMES: &[&str] = &["rpoe.yml", "rpoe.yaml"];

/// Find the configuration file by searching current and parent directories
pub fn find_config_file() -> ConfigResult<PathBuf> {
    find_config_file_from(env::current_dir().map_err(|e| {
        ConfigError::Invalid(format!("Failed to get current directory: {}", e))
    })?)
}

/// Find the configuration file starting from a specific directory
pub fn find_config_file_from(start_dir: PathBuf) -> ConfigResult<PathBuf> {
    let mut current_dir = start_dir;
    let mut searched_paths = Vec::new();

    loop {
        for file_name in CONFIG_FILE_NAMES {
            let config_path = current_dir.join(file_name);
            searched_paths.push(config_path.display().to_string());

            if config_path.is_file() {
                return Ok(config_path);
            }
        }

        match current_dir.parent() {
            Some(parent) => current_dir = parent.to_path_buf(),
            None => return Err(ConfigError::NotFound(searched_paths.join(", "))),
        }
    }
}

/// Resolve a `-f/--file` or `-C/--root` argument to a config file path
pub fn resolve_config_path(path: &Path) -> ConfigResult<PathBuf> {
    if path.is_dir() {
        for file_name in CONFIG_FILE_NAMES {
            let candidate = path.join(file_name);
            if candidate.is_file() {
                return Ok(candidate);
            }
        }
        return Err(ConfigError::NotFound(path.join(CONFIG_FILE_NAMES[0]).display().to_string()));
    }
    if path.is_file() {
        return Ok(path.to_path_buf());
    }
    Err(ConfigError::NotFound(path.display().to_string()))
}

/// Parse a configuration file from a path
pub fn parse_config_file(path: &Path) -> Result<Config, RpoeError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read {}: {}", path.display(), e)))?;

    parse_config(&contents, Some(path))
}

/// Parse configuration from a string
pub fn parse_config(yaml: &str, config_path: Option<&Path>) -> Result<Config, RpoeError> {
    let mut config: Config = serde_yaml::from_str(yaml)?;
    config.conf_dir = config_path.map(base_dir);

    if let Some(path) = config_path {
        let root = base_dir(path);
        let mut seen = vec![absolute(path)];
        process_includes(&mut config, &root, &mut seen)?;
    }

    Ok(config)
}

/// Merge tasks from included files; tasks defined earlier win
fn process_includes(config: &mut Config, root: &Path, seen: &mut Vec<PathBuf>) -> Result<(), RpoeError> {
    if config.include.is_empty() {
        return Ok(());
    }

    let mut vars = HashMap::new();
    vars.insert("POE_ROOT".to_string(), root.display().to_string());
    let conf_dir = config.conf_dir.clone().unwrap_or_else(|| root.to_path_buf());

    for include in config.include.clone() {
        let include_path = conf_dir.join(expand_braced(&include, &vars));
        let canonical = absolute(&include_path);
        if seen.contains(&canonical) {
            debug!(path = %include_path.display(), "skipping already included config");
            continue;
        }
        seen.push(canonical);

        let included = load_included_config(&include_path, root, seen)?;
        for (name, def) in included.tasks {
            if config.tasks.iter().any(|(existing, _)| *existing == name) {
                debug!(task = %name, path = %include_path.display(), "ignoring task already defined");
                continue;
            }
            config.tasks.push((name.clone(), def));
            if let Some(dir) = &included.conf_dir {
                config.task_dirs.insert(name, dir.clone());
            }
        }
        for (name, dir) in included.task_dirs {
            config.task_dirs.entry(name).or_insert(dir);
        }
    }

    Ok(())
}

/// Load a config file pulled in through `include`
fn load_included_config(path: &Path, root: &Path, seen: &mut Vec<PathBuf>) -> Result<Config, RpoeError> {
    let contents = fs::read_to_string(path).map_err(|e| ConfigError::IncludeFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;

    let mut config: Config = serde_yaml::from_str(&contents).map_err(|e| ConfigError::IncludeFile {
        path: path.to_path_buf(),
        error: e.to_string(),
    })?;
    config.conf_dir = Some(base_dir(path));
    process_includes(&mut config, root, seen)?;

    Ok(config)
}

fn base_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => absolute(parent),
        _ => absolute(Path::new(".")),
    }
}

fn absolute(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}
