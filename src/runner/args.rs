//! Task argument declarations and binding
//!
//! Declared arguments are validated when the task registry is built; the
//! binder turns invocation tokens into typed values using a `clap::Command`
//! generated from the declarations.

use crate::config::types::{scalar_to_string, ArgDef, MultipleDef, PositionalDef};
use crate::config::schema::matches_pattern;
use crate::error::{ConfigError, ConfigResult, ValidationError, ValidationResult};
use crate::runner::expr::Value;
use crate::runner::template::{expand, has_expansions, Lookup};
use clap::error::ErrorKind;
use clap::{Arg, ArgAction, Command};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

const ARG_NAME_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_-]*$";
const OPTION_PATTERN: &str = r"^(--[A-Za-z0-9][A-Za-z0-9_-]*|-[A-Za-z0-9])$";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    String,
    Integer,
    Float,
    Boolean,
}

impl ArgType {
    fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "string" | "str" => Some(ArgType::String),
            "integer" | "int" => Some(ArgType::Integer),
            "float" => Some(ArgType::Float),
            "boolean" | "bool" => Some(ArgType::Boolean),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ArgType::String => "string",
            ArgType::Integer => "integer",
            ArgType::Float => "float",
            ArgType::Boolean => "boolean",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgForm {
    Positional { display: String },
    Options(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Multiplicity {
    Single,
    Any,
    Exactly(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ArgDefault {
    Literal(Value),
    /// Expanded against the task environment at bind time
    Template(String),
}

/// A declared task argument
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentSpec {
    pub name: String,
    pub form: ArgForm,
    pub arg_type: ArgType,
    pub default: Option<ArgDefault>,
    pub choices: Option<Vec<Value>>,
    pub multiple: Multiplicity,
    pub required: bool,
    pub help: Option<String>,
}

impl ArgumentSpec {
    /// Build and check an argument declaration
    pub fn from_def(task: &str, def: &ArgDef) -> ConfigResult<Self> {
        let invalid = |reason: String| ConfigError::InvalidArgument {
            task: task.to_string(),
            arg: def.name.clone(),
            reason,
        };

        if !matches_pattern(ARG_NAME_PATTERN, &def.name)? {
            return Err(invalid("argument names must be identifiers".to_string()));
        }

        let arg_type = match &def.arg_type {
            None => ArgType::String,
            Some(tag) => ArgType::from_tag(tag).ok_or_else(|| {
                invalid(format!(
                    "unknown type '{}', expected one of: string, integer, float, boolean",
                    tag
                ))
            })?,
        };

        let form = match &def.positional {
            Some(PositionalDef::Flag(true)) => ArgForm::Positional {
                display: def.name.clone(),
            },
            Some(PositionalDef::Display(display)) => ArgForm::Positional {
                display: display.clone(),
            },
            Some(PositionalDef::Flag(false)) | None => {
                let options = if def.options.is_empty() {
                    vec![format!("--{}", def.name)]
                } else {
                    def.options.clone()
                };
                for option in &options {
                    if !matches_pattern(OPTION_PATTERN, option)? {
                        return Err(invalid(format!(
                            "option '{}' must look like --name or -n",
                            option
                        )));
                    }
                }
                ArgForm::Options(options)
            }
        };
        if matches!(form, ArgForm::Positional { .. }) && !def.options.is_empty() {
            return Err(invalid("positional arguments cannot declare options".to_string()));
        }

        let multiple = match def.multiple {
            None | Some(MultipleDef::Flag(false)) => Multiplicity::Single,
            Some(MultipleDef::Flag(true)) => Multiplicity::Any,
            Some(MultipleDef::Count(n)) if n >= 2 => Multiplicity::Exactly(n),
            Some(MultipleDef::Count(n)) => {
                return Err(invalid(format!(
                    "multiple must be true or a count of at least 2, got {}",
                    n
                )))
            }
        };

        if arg_type == ArgType::Boolean {
            if matches!(form, ArgForm::Positional { .. }) {
                return Err(invalid("boolean arguments cannot be positional".to_string()));
            }
            if multiple != Multiplicity::Single {
                return Err(invalid("boolean arguments cannot be multiple".to_string()));
            }
        }

        let choices = match &def.choices {
            None => None,
            Some(raw) => Some(
                raw.iter()
                    .map(|choice| {
                        literal(arg_type, choice)
                            .map_err(|reason| invalid(format!("invalid choice value {}", reason)))
                    })
                    .collect::<ConfigResult<Vec<_>>>()?,
            ),
        };

        let default = match &def.default {
            None => None,
            Some(serde_yaml::Value::String(s)) if has_expansions(s) => {
                Some(ArgDefault::Template(s.clone()))
            }
            Some(serde_yaml::Value::Sequence(items)) if multiple != Multiplicity::Single => {
                let values = items
                    .iter()
                    .map(|item| {
                        literal(arg_type, item)
                            .map_err(|reason| invalid(format!("invalid default value {}", reason)))
                    })
                    .collect::<ConfigResult<Vec<_>>>()?;
                Some(ArgDefault::Literal(Value::List(values)))
            }
            Some(raw) => {
                let value = literal(arg_type, raw)
                    .map_err(|reason| invalid(format!("invalid default value {}", reason)))?;
                Some(ArgDefault::Literal(value))
            }
        };

        if let (Some(ArgDefault::Literal(value)), Some(choices)) = (&default, &choices) {
            let members = match value {
                Value::List(items) => items.clone(),
                single => vec![single.clone()],
            };
            for member in members {
                if !choices.contains(&member) {
                    return Err(invalid(format!(
                        "default value {} is not one of the choices",
                        member.repr()
                    )));
                }
            }
        }

        Ok(ArgumentSpec {
            name: def.name.clone(),
            form,
            arg_type,
            default,
            choices,
            multiple,
            required: def.required,
            help: def.help.clone(),
        })
    }

    /// Name under which the value is exposed to the environment and scripts
    pub fn env_name(&self) -> String {
        self.name.replace('-', "_")
    }

    pub fn is_positional(&self) -> bool {
        matches!(self.form, ArgForm::Positional { .. })
    }
}

/// Checks that need to see all arguments of a task at once
pub fn validate_args(task: &str, args: &[ArgumentSpec]) -> ConfigResult<()> {
    let mut names = HashSet::new();
    let mut options = HashSet::new();

    for (index, arg) in args.iter().enumerate() {
        let invalid = |reason: &str| ConfigError::InvalidArgument {
            task: task.to_string(),
            arg: arg.name.clone(),
            reason: reason.to_string(),
        };

        if !names.insert(arg.env_name()) {
            return Err(invalid("duplicate argument name"));
        }
        if let ArgForm::Options(forms) = &arg.form {
            for form in forms {
                if !options.insert(form.clone()) {
                    return Err(invalid("option string is used by another argument"));
                }
            }
        }
        let later_positional = args[index + 1..].iter().any(ArgumentSpec::is_positional);
        if arg.is_positional() && arg.multiple != Multiplicity::Single && later_positional {
            return Err(invalid("only the last positional argument may be multiple"));
        }
    }

    Ok(())
}

/// Read a YAML literal as a value of the declared type, without any coercion
fn literal(arg_type: ArgType, raw: &serde_yaml::Value) -> Result<Value, String> {
    let shown = scalar_to_string(raw).unwrap_or_else(|_| format!("{:?}", raw));
    let mismatch = || format!("'{}' for {} argument", shown, arg_type.name());

    match (arg_type, raw) {
        (ArgType::String, serde_yaml::Value::String(s)) => Ok(Value::Str(s.clone())),
        (ArgType::Integer, serde_yaml::Value::Number(n)) if n.is_i64() || n.is_u64() => {
            n.as_i64().map(Value::Int).ok_or_else(mismatch)
        }
        (ArgType::Float, serde_yaml::Value::Number(n)) if n.is_f64() => {
            n.as_f64().map(Value::Float).ok_or_else(mismatch)
        }
        (ArgType::Boolean, serde_yaml::Value::Bool(b)) => Ok(Value::Bool(*b)),
        _ => Err(mismatch()),
    }
}

/// Values bound for one invocation of a task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    /// Typed values by env name; unset optional arguments are absent
    pub values: BTreeMap<String, Value>,
    /// Tokens not consumed by the declared arguments
    pub extra: Vec<String>,
}

impl BoundArgs {
    /// Env entries for the bound values in declaration order; None means unset
    pub fn env_entries(&self, specs: &[ArgumentSpec]) -> Vec<(String, Option<String>)> {
        specs
            .iter()
            .filter_map(|spec| {
                let key = spec.env_name();
                let value = self.values.get(&key)?;
                Some((key, value.to_env()))
            })
            .collect()
    }
}

/// Build the clap command that parses a task's arguments
pub fn task_command(task: &str, help: Option<&str>, specs: &[ArgumentSpec]) -> Command {
    let mut cmd = Command::new(task.to_string())
        .no_binary_name(true)
        .disable_version_flag(true);
    if let Some(help) = help {
        cmd = cmd.about(help.to_string());
    }

    for spec in specs {
        let mut arg = Arg::new(spec.name.clone());
        if let Some(help) = &spec.help {
            arg = arg.help(help.clone());
        }

        match &spec.form {
            ArgForm::Positional { display } => {
                arg = arg.value_name(display.to_uppercase());
            }
            ArgForm::Options(forms) => {
                let mut longs = forms.iter().filter_map(|f| f.strip_prefix("--"));
                let shorts = forms
                    .iter()
                    .filter(|f| !f.starts_with("--"))
                    .filter_map(|f| f.chars().nth(1));
                if let Some(long) = longs.next() {
                    arg = arg.long(long.to_string());
                }
                for alias in longs {
                    arg = arg.visible_alias(alias.to_string());
                }
                for (i, short) in shorts.enumerate() {
                    arg = if i == 0 {
                        arg.short(short)
                    } else {
                        arg.visible_short_alias(short)
                    };
                }
                if spec.arg_type != ArgType::Boolean {
                    arg = arg.value_name(spec.name.to_uppercase());
                }
            }
        }

        arg = match (spec.arg_type, spec.multiple) {
            (ArgType::Boolean, _) => arg.action(ArgAction::SetTrue),
            (_, Multiplicity::Single) => arg.action(ArgAction::Set).num_args(1),
            (_, Multiplicity::Any) => arg.action(ArgAction::Append).num_args(1..),
            (_, Multiplicity::Exactly(n)) => arg.action(ArgAction::Append).num_args(n),
        };
        if matches!(spec.arg_type, ArgType::Integer | ArgType::Float) {
            arg = arg.allow_negative_numbers(true);
        }

        cmd = cmd.arg(arg);
    }

    cmd
}

/// Bind invocation tokens to a task's declared arguments
///
/// With no declarations every token, including a `--`, is returned as extra.
/// Otherwise tokens after the first `--` are extra and the rest must match the
/// declarations.
pub fn bind(
    task: &str,
    help: Option<&str>,
    specs: &[ArgumentSpec],
    tokens: &[String],
    env: &impl Lookup,
) -> ValidationResult<BoundArgs> {
    if specs.is_empty() {
        return Ok(BoundArgs {
            values: BTreeMap::new(),
            extra: tokens.to_vec(),
        });
    }

    let (before, extra) = match tokens.iter().position(|t| t == "--") {
        Some(split) => (&tokens[..split], tokens[split + 1..].to_vec()),
        None => (tokens, Vec::new()),
    };

    let matches = task_command(task, help, specs)
        .try_get_matches_from(before)
        .map_err(|e| match e.kind() {
            ErrorKind::DisplayHelp => ValidationError::HelpRequested(e.render().to_string()),
            _ => ValidationError::InvalidArguments {
                task: task.to_string(),
                message: first_line(&e.render().to_string()),
            },
        })?;

    let mut values = BTreeMap::new();
    for spec in specs {
        let value = if spec.arg_type == ArgType::Boolean {
            let default_true = match &spec.default {
                Some(ArgDefault::Literal(value)) => value.truthy(),
                Some(ArgDefault::Template(template)) => {
                    let expanded = expand(template, env);
                    match expanded.trim() {
                        "" => false,
                        raw => parse_bool(raw).ok_or_else(|| ValidationError::InvalidType {
                            task: task.to_string(),
                            arg: spec.name.clone(),
                            value: raw.to_string(),
                            expected: spec.arg_type.name(),
                        })?,
                    }
                }
                None => false,
            };
            let flagged = matches.get_flag(&spec.name);
            let value = Value::Bool(flagged != default_true);
            if flagged {
                check_choice(task, spec, &value, &value.to_string())?;
            }
            Some(value)
        } else {
            match matches.get_many::<String>(&spec.name) {
                Some(raw) => {
                    let typed = raw
                        .map(|r| coerce(task, spec, r))
                        .collect::<ValidationResult<Vec<_>>>()?;
                    Some(if spec.multiple == Multiplicity::Single {
                        typed.into_iter().next().unwrap_or(Value::None)
                    } else {
                        Value::List(typed)
                    })
                }
                None => match &spec.default {
                    Some(ArgDefault::Literal(value)) => Some(value.clone()),
                    Some(ArgDefault::Template(template)) => {
                        Some(Value::Str(expand(template, env)))
                    }
                    None if spec.required => {
                        return Err(ValidationError::MissingArgument {
                            task: task.to_string(),
                            arg: spec.name.clone(),
                        })
                    }
                    None => None,
                },
            }
        };

        if let Some(value) = value {
            values.insert(spec.env_name(), value);
        }
    }

    debug!(task, ?values, ?extra, "bound task arguments");
    Ok(BoundArgs { values, extra })
}

fn coerce(task: &str, spec: &ArgumentSpec, raw: &str) -> ValidationResult<Value> {
    let invalid_type = || ValidationError::InvalidType {
        task: task.to_string(),
        arg: spec.name.clone(),
        value: raw.to_string(),
        expected: spec.arg_type.name(),
    };

    let value = match spec.arg_type {
        ArgType::String => Value::Str(raw.to_string()),
        ArgType::Integer => Value::Int(raw.trim().parse().map_err(|_| invalid_type())?),
        ArgType::Float => Value::Float(raw.trim().parse().map_err(|_| invalid_type())?),
        ArgType::Boolean => Value::Bool(parse_bool(raw).ok_or_else(invalid_type)?),
    };

    check_choice(task, spec, &value, raw)?;
    Ok(value)
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw {
        "true" | "True" | "1" => Some(true),
        "false" | "False" | "0" => Some(false),
        _ => None,
    }
}

fn check_choice(task: &str, spec: &ArgumentSpec, value: &Value, raw: &str) -> ValidationResult<()> {
    match &spec.choices {
        Some(choices) if !choices.contains(value) => Err(ValidationError::InvalidChoice {
            task: task.to_string(),
            arg: spec.name.clone(),
            value: raw.to_string(),
            choices: choices.iter().map(Value::repr).collect::<Vec<_>>().join(", "),
        }),
        _ => Ok(()),
    }
}

fn first_line(message: &str) -> String {
    message
        .lines()
        .next()
        .unwrap_or_default()
        .trim_start_matches("error: ")
        .to_string()
}
