//! Environment layering for task runs
//!
//! Every task run derives its own `TaskEnv` from its parent's, so branches of a
//! task graph never observe each other's variables.

use crate::config::types::EnvValue;
use crate::error::{ConfigError, ConfigResult};
use crate::runner::template::{expand, expand_braced, Lookup};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use tracing::debug;

pub const POE_ROOT: &str = "POE_ROOT";
pub const POE_PWD: &str = "POE_PWD";
pub const POE_CWD: &str = "POE_CWD";
pub const POE_CONF_DIR: &str = "POE_CONF_DIR";
pub const POE_ACTIVE: &str = "POE_ACTIVE";

/// Environment variables visible to a task and its child processes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskEnv {
    vars: BTreeMap<String, String>,
}

impl TaskEnv {
    pub fn new<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        TaskEnv {
            vars: vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Copy of this environment for a child branch
    pub fn derive(&self) -> Self {
        self.clone()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.vars.insert(key.into(), value.into());
    }

    pub fn unset(&mut self, key: &str) {
        self.vars.remove(key);
    }

    pub fn extend<I>(&mut self, vars: I)
    where
        I: IntoIterator<Item = (String, String)>,
    {
        self.vars.extend(vars);
    }

    /// Apply `env` entries from the config file
    ///
    /// Each value is expanded against the variables set so far, with
    /// `POE_CONF_DIR` pointing at the directory the entries were declared in.
    /// `{default: ...}` entries only apply to keys that are still unset.
    pub fn apply_config_env(&mut self, entries: &[(String, EnvValue)], conf_dir: &Path) {
        let mut scoped = self.derive();
        scoped.set(POE_CONF_DIR, conf_dir.display().to_string());

        for (key, value) in entries {
            let template = match value {
                EnvValue::Value(template) => template,
                EnvValue::Default(template) if !scoped.contains(key) => template,
                EnvValue::Default(_) => continue,
            };
            let expanded = expand_braced(template, &scoped);
            scoped.set(key.clone(), expanded.clone());
            self.set(key.clone(), expanded);
        }
    }

    /// Apply bound argument values; a None value removes the variable
    pub fn apply_args(&mut self, entries: Vec<(String, Option<String>)>) {
        for (key, value) in entries {
            match value {
                Some(value) => self.set(key, value),
                None => self.unset(&key),
            }
        }
    }

    /// Expand a template against this environment
    pub fn expand(&self, template: &str) -> String {
        expand(template, self)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.vars.iter()
    }
}

impl Lookup for TaskEnv {
    fn lookup(&self, name: &str) -> Option<&str> {
        self.get(name)
    }
}

/// Resolve an `envfile` entry relative to the directory it was declared in
pub fn envfile_path(template: &str, env: &TaskEnv, conf_dir: &Path) -> PathBuf {
    let mut scoped = env.derive();
    scoped.set(POE_CONF_DIR, conf_dir.display().to_string());
    conf_dir.join(expand_braced(template, &scoped))
}

/// Env files loaded during one run
///
/// A missing file loads as `None` and is reported by the caller; a file that
/// cannot be parsed is a configuration error.
#[derive(Debug, Default)]
pub struct EnvFileCache {
    loaded: HashMap<PathBuf, Option<Vec<(String, String)>>>,
}

impl EnvFileCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(&mut self, path: &Path) -> ConfigResult<Option<Vec<(String, String)>>> {
        if let Some(cached) = self.loaded.get(path) {
            return Ok(cached.clone());
        }

        let entries = if path.is_file() {
            let iter = dotenvy::from_path_iter(path).map_err(|e| ConfigError::EnvFile {
                path: path.to_path_buf(),
                error: e.to_string(),
            })?;
            let entries = iter
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::EnvFile {
                    path: path.to_path_buf(),
                    error: e.to_string(),
                })?;
            debug!(path = %path.display(), count = entries.len(), "loaded envfile");
            Some(entries)
        } else {
            debug!(path = %path.display(), "envfile not found");
            None
        };

        self.loaded.insert(path.to_path_buf(), entries.clone());
        Ok(entries)
    }
}
