//! Core configuration types
//!
//! This module defines the data structures that represent an rpoe.yml configuration file.
//! Mappings whose order matters (tasks, env, uses, args) are read into ordered
//! `Vec<(String, _)>` lists.

use serde::de::Error;
use serde::{Deserialize, Deserializer};
use serde_yaml::{Mapping, Value};
use std::collections::HashMap;
use std::path::PathBuf;

/// Top-level configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Global environment applied to every task
    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: Vec<(String, EnvValue)>,

    /// Env files loaded before the global env
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub envfile: Vec<String>,

    /// Kind of task a bare string task definition stands for
    #[serde(default = "default_task_type")]
    pub default_task_type: String,

    /// Kind of task a bare string inside a sequence stands for
    #[serde(default = "default_array_item_task_type")]
    pub default_array_item_task_type: String,

    /// Interpreter tags tried for shell tasks without their own
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub shell_interpreter: Vec<String>,

    /// Other config files whose tasks are merged into this one
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub include: Vec<String>,

    /// Tasks defined in the configuration, in declaration order
    #[serde(default, deserialize_with = "deserialize_tasks")]
    pub tasks: Vec<(String, TaskDef)>,

    /// Directory of the file this configuration was read from
    #[serde(skip)]
    pub conf_dir: Option<PathBuf>,

    /// Directories of included files, for tasks merged in from them
    #[serde(skip)]
    pub task_dirs: HashMap<String, PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            env: Vec::new(),
            envfile: Vec::new(),
            default_task_type: default_task_type(),
            default_array_item_task_type: default_array_item_task_type(),
            shell_interpreter: Vec::new(),
            include: Vec::new(),
            tasks: Vec::new(),
            conf_dir: None,
            task_dirs: HashMap::new(),
        }
    }
}

fn default_task_type() -> String {
    "cmd".to_string()
}

fn default_array_item_task_type() -> String {
    "ref".to_string()
}

/// A task definition as written in the config file
#[derive(Debug, Clone)]
pub enum TaskDef {
    /// `name: "echo hi"`, interpreted with the default task type
    Shorthand(String),

    /// `name: [a, [b, c]]`, a sequence; nested lists are parallel groups
    Items(Vec<TaskDef>),

    /// A mapping with exactly one task type key
    Full(Box<TaskDetail>),
}

impl<'de> Deserialize<'de> for TaskDef {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        task_def_from_value(value).map_err(D::Error::custom)
    }
}

fn task_def_from_value(value: Value) -> Result<TaskDef, String> {
    match value {
        Value::String(s) => Ok(TaskDef::Shorthand(s)),
        Value::Sequence(seq) => Ok(TaskDef::Items(
            seq.into_iter()
                .map(task_def_from_value)
                .collect::<Result<_, _>>()?,
        )),
        Value::Mapping(_) => TaskDetail::deserialize(value)
            .map(|detail| TaskDef::Full(Box::new(detail)))
            .map_err(|e| e.to_string()),
        other => Err(format!(
            "task definition must be a string, list or mapping, got {}",
            describe(&other)
        )),
    }
}

/// Full task definition
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskDetail {
    #[serde(default)]
    pub cmd: Option<String>,

    #[serde(default)]
    pub shell: Option<String>,

    #[serde(default)]
    pub script: Option<String>,

    #[serde(default)]
    pub expr: Option<String>,

    #[serde(rename = "ref", default)]
    pub reference: Option<String>,

    #[serde(default)]
    pub sequence: Option<Vec<TaskDef>>,

    #[serde(default)]
    pub switch: Option<Vec<SwitchCase>>,

    /// Task whose output selects the switch case
    #[serde(default)]
    pub control: Option<Box<TaskDef>>,

    #[serde(default)]
    pub help: Option<String>,

    #[serde(default)]
    pub group: Option<String>,

    #[serde(default, deserialize_with = "deserialize_args")]
    pub args: Vec<ArgDef>,

    #[serde(default, deserialize_with = "deserialize_env")]
    pub env: Vec<(String, EnvValue)>,

    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub envfile: Vec<String>,

    #[serde(default)]
    pub cwd: Option<String>,

    #[serde(default)]
    pub capture_stdout: Option<String>,

    /// Local name to upstream task invocation
    #[serde(default, deserialize_with = "deserialize_uses")]
    pub uses: Vec<(String, String)>,

    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub deps: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub interpreter: Vec<String>,

    #[serde(default, deserialize_with = "deserialize_ignore_fail")]
    pub ignore_fail: IgnoreFail,

    #[serde(default)]
    pub default_item_type: Option<String>,

    #[serde(default)]
    pub default: Option<SwitchDefault>,

    /// Exit code for a falsy expr result
    #[serde(rename = "assert", default, deserialize_with = "deserialize_assert")]
    pub assert: Option<i32>,
}

/// One `switch` entry: case values plus the task to run
#[derive(Debug, Clone)]
pub struct SwitchCase {
    /// None marks the default case
    pub case: Option<Vec<String>>,
    pub task: TaskDetail,
}

impl<'de> Deserialize<'de> for SwitchCase {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let mut mapping = Mapping::deserialize(deserializer)?;
        let case = match mapping.remove("case") {
            None => None,
            Some(Value::Sequence(values)) => Some(
                values
                    .iter()
                    .map(scalar_to_string)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(D::Error::custom)?,
            ),
            Some(value) => Some(vec![scalar_to_string(&value).map_err(D::Error::custom)?]),
        };
        let task = TaskDetail::deserialize(Value::Mapping(mapping)).map_err(D::Error::custom)?;
        Ok(SwitchCase { case, task })
    }
}

/// What a switch does when no case matches
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwitchDefault {
    #[default]
    Fail,
    Pass,
}

/// How a sequence treats failing items
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IgnoreFail {
    /// Abort on the first failure
    #[default]
    Never,
    /// Run everything and succeed regardless
    ReturnZero,
    /// Run everything, then fail if anything failed
    ReturnNonZero,
}

/// An environment value, either assigned or only defaulted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    Value(String),
    /// Only applied when the variable is not already set
    Default(String),
}

impl EnvValue {
    pub fn template(&self) -> &str {
        match self {
            EnvValue::Value(v) | EnvValue::Default(v) => v,
        }
    }
}

/// Declared task argument
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArgDef {
    #[serde(default)]
    pub name: String,

    /// Option strings such as `--name` and `-n`
    #[serde(default, deserialize_with = "deserialize_string_or_list")]
    pub options: Vec<String>,

    /// `true`, or a display name for the positional slot
    #[serde(default)]
    pub positional: Option<PositionalDef>,

    #[serde(rename = "type", default)]
    pub arg_type: Option<String>,

    #[serde(default)]
    pub default: Option<Value>,

    #[serde(default)]
    pub choices: Option<Vec<Value>>,

    #[serde(default)]
    pub multiple: Option<MultipleDef>,

    #[serde(default)]
    pub required: bool,

    #[serde(default)]
    pub help: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PositionalDef {
    Flag(bool),
    Display(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum MultipleDef {
    Flag(bool),
    Count(usize),
}

fn describe(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Sequence(_) => "a list",
        Value::Mapping(_) => "a mapping",
        Value::Tagged(_) => "a tagged value",
    }
}

/// Render a YAML scalar as the string it stands for
pub fn scalar_to_string(value: &Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(true) => Ok("True".to_string()),
        Value::Bool(false) => Ok("False".to_string()),
        other => Err(format!("expected a scalar value, got {}", describe(other))),
    }
}

fn mapping_entries<E: Error>(value: Value, what: &str) -> Result<Vec<(String, Value)>, E> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Mapping(mapping) => mapping
            .into_iter()
            .map(|(k, v)| match k {
                Value::String(key) => Ok((key, v)),
                other => Err(E::custom(format!(
                    "{} keys must be strings, got {}",
                    what,
                    describe(&other)
                ))),
            })
            .collect(),
        other => Err(E::custom(format!(
            "{} must be a mapping, got {}",
            what,
            describe(&other)
        ))),
    }
}

/// Custom deserializer for fields that accept a single string or a list of strings
fn deserialize_string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::String(s) => Ok(vec![s]),
        Value::Sequence(seq) => seq
            .iter()
            .map(|item| scalar_to_string(item).map_err(D::Error::custom))
            .collect(),
        Value::Null => Ok(Vec::new()),
        other => Err(D::Error::custom(format!(
            "expected a string or list of strings, got {}",
            describe(&other)
        ))),
    }
}

fn deserialize_tasks<'de, D>(deserializer: D) -> Result<Vec<(String, TaskDef)>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    mapping_entries::<D::Error>(value, "tasks")?
        .into_iter()
        .map(|(name, def)| {
            task_def_from_value(def)
                .map(|def| (name.clone(), def))
                .map_err(|e| D::Error::custom(format!("task '{}': {}", name, e)))
        })
        .collect()
}

fn deserialize_env<'de, D>(deserializer: D) -> Result<Vec<(String, EnvValue)>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    mapping_entries::<D::Error>(value, "env")?
        .into_iter()
        .map(|(key, value)| {
            let env_value = match value {
                Value::Mapping(mut mapping) => {
                    let default = mapping.remove("default").ok_or_else(|| {
                        D::Error::custom(format!("env '{}' mapping needs a 'default' key", key))
                    })?;
                    if !mapping.is_empty() {
                        return Err(D::Error::custom(format!(
                            "env '{}' mapping only supports a 'default' key",
                            key
                        )));
                    }
                    EnvValue::Default(scalar_to_string(&default).map_err(D::Error::custom)?)
                }
                scalar => EnvValue::Value(scalar_to_string(&scalar).map_err(D::Error::custom)?),
            };
            Ok((key, env_value))
        })
        .collect()
}

fn deserialize_uses<'de, D>(deserializer: D) -> Result<Vec<(String, String)>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    mapping_entries::<D::Error>(value, "uses")?
        .into_iter()
        .map(|(key, value)| match value {
            Value::String(invocation) => Ok((key, invocation)),
            other => Err(D::Error::custom(format!(
                "uses '{}' must be a task invocation string, got {}",
                key,
                describe(&other)
            ))),
        })
        .collect()
}

/// Args may be a list of names, a list of mappings with `name`, or a mapping of name to options
fn deserialize_args<'de, D>(deserializer: D) -> Result<Vec<ArgDef>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;

    match value {
        Value::Null => Ok(Vec::new()),
        Value::Sequence(seq) => seq
            .into_iter()
            .map(|item| match item {
                Value::String(name) => Ok(ArgDef {
                    name,
                    ..ArgDef::default()
                }),
                Value::Mapping(_) => ArgDef::deserialize(item).map_err(D::Error::custom),
                other => Err(D::Error::custom(format!(
                    "argument must be a name or a mapping, got {}",
                    describe(&other)
                ))),
            })
            .collect(),
        Value::Mapping(_) => mapping_entries::<D::Error>(value, "args")?
            .into_iter()
            .map(|(name, options)| {
                let mut def = match options {
                    Value::Null => ArgDef::default(),
                    other => ArgDef::deserialize(other).map_err(D::Error::custom)?,
                };
                def.name = name;
                Ok(def)
            })
            .collect(),
        other => Err(D::Error::custom(format!(
            "args must be a list or a mapping, got {}",
            describe(&other)
        ))),
    }
}

fn deserialize_ignore_fail<'de, D>(deserializer: D) -> Result<IgnoreFail, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(IgnoreFail::Never),
        Value::Bool(true) => Ok(IgnoreFail::ReturnZero),
        Value::String(s) if s == "return_zero" => Ok(IgnoreFail::ReturnZero),
        Value::String(s) if s == "return_non_zero" => Ok(IgnoreFail::ReturnNonZero),
        _ => Err(D::Error::custom(
            "ignore_fail must be true, false, 'return_zero' or 'return_non_zero'",
        )),
    }
}

fn deserialize_assert<'de, D>(deserializer: D) -> Result<Option<i32>, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::Null | Value::Bool(false) => Ok(None),
        Value::Bool(true) => Ok(Some(1)),
        Value::Number(n) => n
            .as_i64()
            .and_then(|code| i32::try_from(code).ok())
            .filter(|code| *code > 0)
            .map(Some)
            .ok_or_else(|| D::Error::custom("assert must be a positive exit code")),
        _ => Err(D::Error::custom("assert must be a boolean or an exit code")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_simple_config() {
        let yaml = r#"
tasks:
  hello: echo "hello"
  all: [hello, [a, b]]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.tasks.len(), 2);
        assert_eq!(config.tasks[0].0, "hello");
        assert!(matches!(config.tasks[0].1, TaskDef::Shorthand(_)));
        match &config.tasks[1].1 {
            TaskDef::Items(items) => {
                assert_eq!(items.len(), 2);
                assert!(matches!(&items[1], TaskDef::Items(group) if group.len() == 2));
            }
            other => panic!("expected items, got {:?}", other),
        }
        assert_eq!(config.default_task_type, "cmd");
        assert_eq!(config.default_array_item_task_type, "ref");
    }

    #[test]
    fn test_deserialize_full_task() {
        let yaml = r#"
tasks:
  greet:
    cmd: echo "Hello, ${name}!"
    help: Say hello to someone
    args:
      name:
        help: Person to greet
        default: World
    env:
      ZED: last
      ALPHA: { default: first }
      PORT: 8080
    uses: { VERSION: get_version }
    deps: build
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let TaskDef::Full(task) = &config.tasks[0].1 else {
            panic!("expected full task");
        };
        assert_eq!(task.help.as_deref(), Some("Say hello to someone"));
        assert_eq!(task.args.len(), 1);
        assert_eq!(task.args[0].name, "name");
        assert_eq!(
            task.env,
            vec![
                ("ZED".to_string(), EnvValue::Value("last".to_string())),
                ("ALPHA".to_string(), EnvValue::Default("first".to_string())),
                ("PORT".to_string(), EnvValue::Value("8080".to_string())),
            ]
        );
        assert_eq!(task.uses, vec![("VERSION".to_string(), "get_version".to_string())]);
        assert_eq!(task.deps, vec!["build"]);
    }

    #[test]
    fn test_deserialize_args_list_forms() {
        let yaml = r#"
tasks:
  t:
    cmd: echo
    args:
      - plain
      - name: flag
        type: boolean
        options: ["--flag", "-f"]
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let TaskDef::Full(task) = &config.tasks[0].1 else {
            panic!("expected full task");
        };
        assert_eq!(task.args[0].name, "plain");
        assert_eq!(task.args[1].options, vec!["--flag", "-f"]);
        assert_eq!(task.args[1].arg_type.as_deref(), Some("boolean"));
    }

    #[test]
    fn test_deserialize_switch() {
        let yaml = r#"
tasks:
  sw:
    control: { expr: "platform" }
    default: pass
    switch:
      - case: [linux, darwin]
        cmd: echo unix
      - case: 1
        cmd: echo one
      - cmd: echo other
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let TaskDef::Full(task) = &config.tasks[0].1 else {
            panic!("expected full task");
        };
        let cases = task.switch.as_ref().unwrap();
        assert_eq!(cases[0].case, Some(vec!["linux".to_string(), "darwin".to_string()]));
        assert_eq!(cases[1].case, Some(vec!["1".to_string()]));
        assert_eq!(cases[2].case, None);
        assert_eq!(cases[2].task.cmd.as_deref(), Some("echo other"));
        assert_eq!(task.default, Some(SwitchDefault::Pass));
    }

    #[test]
    fn test_deserialize_sequence_options() {
        let yaml = r#"
tasks:
  a:
    sequence: [x, y]
    ignore_fail: return_non_zero
    default_item_type: cmd
  b:
    expr: "1 == 2"
    assert: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        let TaskDef::Full(a) = &config.tasks[0].1 else {
            panic!("expected full task");
        };
        assert_eq!(a.ignore_fail, IgnoreFail::ReturnNonZero);
        assert_eq!(a.default_item_type.as_deref(), Some("cmd"));
        let TaskDef::Full(b) = &config.tasks[1].1 else {
            panic!("expected full task");
        };
        assert_eq!(b.assert, Some(3));
    }

    #[test]
    fn test_unknown_task_key_is_rejected() {
        let yaml = r#"
tasks:
  t:
    cmd: echo
    colour: red
"#;
        let err = serde_yaml::from_str::<Config>(yaml).unwrap_err();
        assert!(err.to_string().contains("colour"));
    }
}
