//! Task model and registry
//!
//! Config task definitions are turned into immutable `TaskSpec`s once, when the
//! registry is loaded. Everything that can be checked without running anything
//! is checked here or in `config::schema`.

use crate::config::schema::{matches_pattern, validate_config, validate_registry};
use crate::config::types::{Config, EnvValue, IgnoreFail, SwitchDefault, TaskDef, TaskDetail};
use crate::error::{ConfigError, ConfigResult};
use crate::runner::args::{validate_args, ArgumentSpec};
use crate::runner::expr::Expr;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const SCRIPT_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_.]*:[A-Za-z_][A-Za-z0-9_]*$";

/// Shell interpreters a shell task can run under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interpreter {
    Posix,
    Sh,
    Bash,
    Zsh,
    Fish,
    Pwsh,
    PowerShell,
    Python,
}

impl Interpreter {
    pub const TAGS: &'static [&'static str] =
        &["posix", "sh", "bash", "zsh", "fish", "pwsh", "powershell", "python"];

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "posix" => Some(Interpreter::Posix),
            "sh" => Some(Interpreter::Sh),
            "bash" => Some(Interpreter::Bash),
            "zsh" => Some(Interpreter::Zsh),
            "fish" => Some(Interpreter::Fish),
            "pwsh" => Some(Interpreter::Pwsh),
            "powershell" => Some(Interpreter::PowerShell),
            "python" => Some(Interpreter::Python),
            _ => None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            Interpreter::Posix => "posix",
            Interpreter::Sh => "sh",
            Interpreter::Bash => "bash",
            Interpreter::Zsh => "zsh",
            Interpreter::Fish => "fish",
            Interpreter::Pwsh => "pwsh",
            Interpreter::PowerShell => "powershell",
            Interpreter::Python => "python",
        }
    }

    /// Executables that can serve this interpreter, in order of preference
    pub fn executables(&self) -> &'static [&'static str] {
        match self {
            Interpreter::Posix => &["sh", "bash", "zsh"],
            Interpreter::Sh => &["sh"],
            Interpreter::Bash => &["bash"],
            Interpreter::Zsh => &["zsh"],
            Interpreter::Fish => &["fish"],
            Interpreter::Pwsh => &["pwsh"],
            Interpreter::PowerShell => &["powershell", "pwsh"],
            Interpreter::Python => &["python3", "python"],
        }
    }

    /// Arguments that make the interpreter read its script from stdin
    pub fn stdin_args(&self) -> &'static [&'static str] {
        match self {
            Interpreter::Pwsh | Interpreter::PowerShell => &["-NoLogo", "-Command", "-"],
            Interpreter::Python => &["-"],
            _ => &[],
        }
    }
}

fn parse_interpreters(task: &str, tags: &[String]) -> ConfigResult<Vec<Interpreter>> {
    tags.iter()
        .map(|tag| {
            Interpreter::from_tag(tag).ok_or_else(|| ConfigError::InvalidInterpreter {
                task: task.to_string(),
                interpreter: tag.clone(),
                valid: Interpreter::TAGS.join(", "),
            })
        })
        .collect()
}

/// Runnable part of a task
#[derive(Debug)]
pub enum TaskKind {
    Cmd(String),
    Shell {
        content: String,
        interpreters: Vec<Interpreter>,
    },
    Script {
        module: String,
        function: String,
    },
    Expr {
        expr: Expr,
        assert: Option<i32>,
    },
    Sequence {
        items: Vec<SequenceItem>,
        ignore_fail: IgnoreFail,
    },
    Switch {
        control: Arc<TaskSpec>,
        cases: Vec<SwitchBranch>,
        default: SwitchDefault,
    },
    Ref(String),
}

impl TaskKind {
    pub fn label(&self) -> &'static str {
        match self {
            TaskKind::Cmd(_) => "cmd",
            TaskKind::Shell { .. } => "shell",
            TaskKind::Script { .. } => "script",
            TaskKind::Expr { .. } => "expr",
            TaskKind::Sequence { .. } => "sequence",
            TaskKind::Switch { .. } => "switch",
            TaskKind::Ref(_) => "ref",
        }
    }
}

#[derive(Debug)]
pub enum SequenceItem {
    Task(Arc<TaskSpec>),
    /// Members run concurrently; the sequence waits for all of them
    Parallel(Vec<Arc<TaskSpec>>),
}

#[derive(Debug)]
pub struct SwitchBranch {
    /// None for the default branch
    pub values: Option<Vec<String>>,
    pub task: Arc<TaskSpec>,
}

/// Immutable task definition
#[derive(Debug)]
pub struct TaskSpec {
    pub name: String,
    pub kind: TaskKind,
    pub args: Vec<ArgumentSpec>,
    pub env: Vec<(String, EnvValue)>,
    pub envfiles: Vec<String>,
    pub cwd: Option<String>,
    pub capture_stdout: Option<String>,
    pub uses: Vec<(String, String)>,
    pub deps: Vec<String>,
    pub group: Option<String>,
    pub help: Option<String>,
    /// Directory of the config file the task was defined in
    pub conf_dir: PathBuf,
}

impl TaskSpec {
    /// Tasks whose name starts with `_` can only be reached from other tasks
    pub fn is_private(&self) -> bool {
        self.name.starts_with('_')
    }

    /// Kinds that produce a single process or in-process result
    pub fn is_leaf(&self) -> bool {
        !matches!(self.kind, TaskKind::Sequence { .. } | TaskKind::Switch { .. })
    }
}

/// Defaults that flow from the config file into task construction
struct BuildDefaults<'a> {
    default_task_type: &'a str,
    default_item_type: &'a str,
    shell_interpreter: &'a [Interpreter],
    conf_dir: &'a Path,
}

fn shorthand_detail(task: &str, kind: &str, content: &str) -> ConfigResult<TaskDetail> {
    let mut detail = TaskDetail::default();
    let content = Some(content.to_string());
    match kind {
        "cmd" => detail.cmd = content,
        "shell" => detail.shell = content,
        "script" => detail.script = content,
        "expr" => detail.expr = content,
        "ref" => detail.reference = content,
        other => {
            return Err(ConfigError::InvalidTask {
                task: task.to_string(),
                reason: format!(
                    "unsupported default task type '{}', expected one of: cmd, shell, script, expr, ref",
                    other
                ),
            })
        }
    }
    Ok(detail)
}

fn build_task(name: &str, def: &TaskDef, defaults: &BuildDefaults<'_>) -> ConfigResult<Arc<TaskSpec>> {
    match def {
        TaskDef::Shorthand(content) => {
            let detail = shorthand_detail(name, defaults.default_task_type, content)?;
            build_detail(name, &detail, defaults)
        }
        TaskDef::Items(items) => {
            let detail = TaskDetail {
                sequence: Some(items.clone()),
                ..TaskDetail::default()
            };
            build_detail(name, &detail, defaults)
        }
        TaskDef::Full(detail) => build_detail(name, detail, defaults),
    }
}

fn build_detail(
    name: &str,
    detail: &TaskDetail,
    defaults: &BuildDefaults<'_>,
) -> ConfigResult<Arc<TaskSpec>> {
    let invalid = |reason: &str| ConfigError::InvalidTask {
        task: name.to_string(),
        reason: reason.to_string(),
    };

    let declared = [
        detail.cmd.is_some(),
        detail.shell.is_some(),
        detail.script.is_some(),
        detail.expr.is_some(),
        detail.reference.is_some(),
        detail.sequence.is_some(),
        detail.switch.is_some(),
    ];
    match declared.iter().filter(|d| **d).count() {
        1 => {}
        0 => return Err(invalid("no task type given; expected one of cmd, shell, script, expr, ref, sequence, switch")),
        _ => return Err(invalid("only one of cmd, shell, script, expr, ref, sequence, switch may be given")),
    }

    if !detail.interpreter.is_empty() && detail.shell.is_none() {
        return Err(invalid("'interpreter' only applies to shell tasks"));
    }
    if (detail.ignore_fail != IgnoreFail::Never || detail.default_item_type.is_some())
        && detail.sequence.is_none()
    {
        return Err(invalid("'ignore_fail' and 'default_item_type' only apply to sequence tasks"));
    }
    if (detail.control.is_some() || detail.default.is_some()) && detail.switch.is_none() {
        return Err(invalid("'control' and 'default' only apply to switch tasks"));
    }
    if detail.assert.is_some() && detail.expr.is_none() {
        return Err(invalid("'assert' only applies to expr tasks"));
    }

    let args = detail
        .args
        .iter()
        .map(|def| ArgumentSpec::from_def(name, def))
        .collect::<ConfigResult<Vec<_>>>()?;
    validate_args(name, &args)?;

    let kind = if let Some(cmd) = &detail.cmd {
        TaskKind::Cmd(cmd.clone())
    } else if let Some(content) = &detail.shell {
        let interpreters = if detail.interpreter.is_empty() {
            defaults.shell_interpreter.to_vec()
        } else {
            parse_interpreters(name, &detail.interpreter)?
        };
        TaskKind::Shell {
            content: content.clone(),
            interpreters,
        }
    } else if let Some(target) = &detail.script {
        if !matches_pattern(SCRIPT_PATTERN, target)? {
            return Err(invalid("script must be given as 'module:function'"));
        }
        let (module, function) = target.split_once(':').unwrap_or((target.as_str(), ""));
        TaskKind::Script {
            module: module.to_string(),
            function: function.to_string(),
        }
    } else if let Some(source) = &detail.expr {
        let expr = Expr::parse(source)
            .map_err(|e| invalid(&format!("invalid expression '{}': {}", source, e)))?;
        TaskKind::Expr {
            expr,
            assert: detail.assert,
        }
    } else if let Some(target) = &detail.reference {
        TaskKind::Ref(target.clone())
    } else if let Some(items) = &detail.sequence {
        build_sequence(name, detail, items, defaults)?
    } else if let Some(cases) = &detail.switch {
        build_switch(name, detail, cases, defaults)?
    } else {
        return Err(invalid("no task type given"));
    };

    Ok(Arc::new(TaskSpec {
        name: name.to_string(),
        kind,
        args,
        env: detail.env.clone(),
        envfiles: detail.envfile.clone(),
        cwd: detail.cwd.clone(),
        capture_stdout: detail.capture_stdout.clone(),
        uses: detail.uses.clone(),
        deps: detail.deps.clone(),
        group: detail.group.clone(),
        help: detail.help.clone(),
        conf_dir: defaults.conf_dir.to_path_buf(),
    }))
}

fn build_sequence(
    name: &str,
    detail: &TaskDetail,
    items: &[TaskDef],
    defaults: &BuildDefaults<'_>,
) -> ConfigResult<TaskKind> {
    let item_type = detail
        .default_item_type
        .as_deref()
        .unwrap_or(defaults.default_item_type);
    let item_defaults = BuildDefaults {
        default_task_type: item_type,
        default_item_type: item_type,
        shell_interpreter: defaults.shell_interpreter,
        conf_dir: defaults.conf_dir,
    };

    let mut built = Vec::with_capacity(items.len());
    for (index, item) in items.iter().enumerate() {
        match item {
            TaskDef::Items(group) => {
                let mut members = Vec::with_capacity(group.len());
                for (member_index, member) in group.iter().enumerate() {
                    let member_name = format!("{}[{}][{}]", name, index, member_index);
                    if matches!(member, TaskDef::Items(_)) {
                        return Err(ConfigError::InvalidTask {
                            task: member_name,
                            reason: "parallel groups cannot be nested".to_string(),
                        });
                    }
                    let spec = build_task(&member_name, member, &item_defaults)?;
                    if !spec.is_leaf() {
                        return Err(ConfigError::InvalidTask {
                            task: member_name,
                            reason: format!(
                                "a {} task cannot be a member of a parallel group",
                                spec.kind.label()
                            ),
                        });
                    }
                    members.push(spec);
                }
                built.push(SequenceItem::Parallel(members));
            }
            other => {
                let item_name = format!("{}[{}]", name, index);
                built.push(SequenceItem::Task(build_task(&item_name, other, &item_defaults)?));
            }
        }
    }

    Ok(TaskKind::Sequence {
        items: built,
        ignore_fail: detail.ignore_fail,
    })
}

fn build_switch(
    name: &str,
    detail: &TaskDetail,
    cases: &[crate::config::types::SwitchCase],
    defaults: &BuildDefaults<'_>,
) -> ConfigResult<TaskKind> {
    let invalid = |reason: String| ConfigError::InvalidTask {
        task: name.to_string(),
        reason,
    };

    let control_def = detail
        .control
        .as_deref()
        .ok_or_else(|| invalid("switch tasks need a 'control' task".to_string()))?;
    let control = build_task(&format!("{}[control]", name), control_def, defaults)?;
    if !matches!(
        control.kind,
        TaskKind::Expr { .. } | TaskKind::Cmd(_) | TaskKind::Script { .. }
    ) {
        return Err(invalid(format!(
            "control must be an expr, cmd or script task, not {}",
            control.kind.label()
        )));
    }
    if !control.args.is_empty() || control.capture_stdout.is_some() {
        return Err(invalid(
            "control task cannot declare its own args or capture_stdout".to_string(),
        ));
    }

    let mut branches = Vec::with_capacity(cases.len());
    let mut seen_values = HashSet::new();
    let mut has_default = false;
    for case in cases {
        let case_name = match &case.case {
            Some(values) => {
                for value in values {
                    if !seen_values.insert(value.clone()) {
                        return Err(invalid(format!("case value '{}' is used more than once", value)));
                    }
                }
                format!("{}[{}]", name, values.join(","))
            }
            None => {
                if has_default {
                    return Err(invalid("only one default case is allowed".to_string()));
                }
                has_default = true;
                format!("{}[default]", name)
            }
        };
        let task = build_detail(&case_name, &case.task, defaults)?;
        if !task.args.is_empty() {
            return Err(invalid(format!(
                "case '{}' cannot declare args; declare them on the switch",
                case_name
            )));
        }
        branches.push(SwitchBranch {
            values: case.case.clone(),
            task,
        });
    }

    Ok(TaskKind::Switch {
        control,
        cases: branches,
        default: detail.default.unwrap_or_default(),
    })
}

/// All tasks of a loaded configuration
#[derive(Debug)]
pub struct TaskRegistry {
    tasks: Vec<Arc<TaskSpec>>,
    index: HashMap<String, usize>,
    /// Global env, applied before any task env
    pub env: Vec<(String, EnvValue)>,
    /// Global env files
    pub envfiles: Vec<String>,
    /// Directory of the main config file
    pub conf_dir: PathBuf,
}

impl TaskRegistry {
    /// Validate a configuration and build its tasks
    pub fn load(config: &Config) -> ConfigResult<Self> {
        validate_config(config)?;

        let conf_dir = match &config.conf_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()
                .map_err(|e| ConfigError::Invalid(format!("Failed to get current directory: {}", e)))?,
        };
        let shell_interpreter = if config.shell_interpreter.is_empty() {
            vec![Interpreter::Posix]
        } else {
            parse_interpreters("<shell_interpreter>", &config.shell_interpreter)?
        };

        let mut tasks = Vec::with_capacity(config.tasks.len());
        let mut index = HashMap::new();
        for (name, def) in &config.tasks {
            let task_dir = config.task_dirs.get(name).unwrap_or(&conf_dir);
            let defaults = BuildDefaults {
                default_task_type: &config.default_task_type,
                default_item_type: &config.default_array_item_task_type,
                shell_interpreter: &shell_interpreter,
                conf_dir: task_dir,
            };
            index.insert(name.clone(), tasks.len());
            tasks.push(build_task(name, def, &defaults)?);
        }

        let registry = TaskRegistry {
            tasks,
            index,
            env: config.env.clone(),
            envfiles: config.envfile.clone(),
            conf_dir,
        };
        validate_registry(&registry)?;

        Ok(registry)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<TaskSpec>> {
        self.index.get(name).map(|i| &self.tasks[*i])
    }

    /// Tasks in declaration order
    pub fn tasks(&self) -> impl Iterator<Item = &Arc<TaskSpec>> {
        self.tasks.iter()
    }
}
