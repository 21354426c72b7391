//! Task graph resolution
//!
//! The `Runner` walks a task and everything it reaches (deps, uses, sequence
//! items, switch branches and refs), turning leaf tasks into `ResolvedStep`s
//! for the supervisor. Upstream results are memoized for the whole run.

use crate::config::types::{IgnoreFail, SwitchDefault};
use crate::error::{ConfigError, ExecutionError, RpoeError, ValidationError};
use crate::runner::args::{bind, ArgumentSpec, BoundArgs};
use crate::runner::context::{Action, ExecutionContext};
use crate::runner::env::{envfile_path, EnvFileCache, TaskEnv, POE_CONF_DIR};
use crate::runner::expr::{Scope, Value};
use crate::runner::supervisor::{Capture, ExecutionResult, ResolvedStep, Supervisor};
use crate::runner::task::{Interpreter, SequenceItem, SwitchBranch, TaskKind, TaskRegistry, TaskSpec};
use crate::runner::words::{self, expand_globs, split_plain, split_words};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

type Result<T> = std::result::Result<T, RpoeError>;

/// Arguments bound once by a switch and shared with its control and cases
type Shared<'s> = Option<(&'s [ArgumentSpec], &'s BoundArgs)>;

/// Result of the common prologue of a task run
struct Prepared {
    env: TaskEnv,
    bound: BoundArgs,
    /// Declarations `bound` was produced from
    specs: Vec<ArgumentSpec>,
    cwd: PathBuf,
    /// An upstream value could not be produced in a dry run
    unresolved: bool,
}

/// A leaf task ready to run
enum Planned {
    Step { step: ResolvedStep, display: String },
    /// Finished in-process or not runnable in a dry run
    Done(ExecutionResult),
}

/// Resolves and runs tasks from a registry
pub struct Runner<'a> {
    registry: &'a TaskRegistry,
    ctx: &'a ExecutionContext,
    supervisor: Supervisor<'a>,
    envfiles: EnvFileCache,
    global_env: Option<TaskEnv>,
    /// Captured output of `uses` upstreams by invocation; None when unresolved
    upstream: HashMap<String, Option<String>>,
    completed_deps: HashSet<String>,
    /// Named tasks currently being resolved
    stack: Vec<String>,
}

impl<'a> Runner<'a> {
    pub fn new(registry: &'a TaskRegistry, ctx: &'a ExecutionContext, supervisor: Supervisor<'a>) -> Self {
        Runner {
            registry,
            ctx,
            supervisor,
            envfiles: EnvFileCache::new(),
            global_env: None,
            upstream: HashMap::new(),
            completed_deps: HashSet::new(),
            stack: Vec::new(),
        }
    }

    /// Run a task requested from the command line
    pub fn run_task(&mut self, name: &str, tokens: &[String]) -> Result<ExecutionResult> {
        let task = self
            .registry
            .get(name)
            .ok_or_else(|| ConfigError::TaskNotFound(name.to_string()))?;
        if task.is_private() {
            return Err(ConfigError::InvalidTask {
                task: name.to_string(),
                reason: "tasks starting with '_' can only be run by other tasks".to_string(),
            }
            .into());
        }

        let env = self.global_env()?;
        let cwd = self.ctx.project_root.clone();
        self.run_named(name, tokens, &env, Capture::Inherit, &cwd)
    }

    /// Process env plus global envfiles and env from the config
    fn global_env(&mut self) -> Result<TaskEnv> {
        if let Some(env) = &self.global_env {
            return Ok(env.clone());
        }
        let registry = self.registry;
        let mut env = self.ctx.base_env.derive();
        self.load_envfiles(&mut env, &registry.envfiles, &registry.conf_dir)?;
        env.apply_config_env(&registry.env, &registry.conf_dir);
        self.global_env = Some(env.clone());
        Ok(env)
    }

    fn load_envfiles(&mut self, env: &mut TaskEnv, files: &[String], conf_dir: &Path) -> Result<()> {
        for file in files {
            let path = envfile_path(file, env, conf_dir);
            match self.envfiles.load(&path)? {
                Some(entries) => env.extend(entries),
                None => self.ctx.print_debug(&format!(
                    "Warning: failed to locate envfile at '{}'",
                    path.display()
                )),
            }
        }
        Ok(())
    }

    /// Look up a task by name and push it onto the resolution stack
    fn enter(&mut self, name: &str) -> Result<Arc<TaskSpec>> {
        let task = self
            .registry
            .get(name)
            .cloned()
            .ok_or_else(|| ConfigError::TaskNotFound(name.to_string()))?;
        if self.stack.iter().any(|t| t == name) {
            let mut path = self.stack.clone();
            path.push(name.to_string());
            return Err(ConfigError::CircularDependency(path.join(" -> ")).into());
        }
        self.stack.push(name.to_string());
        Ok(task)
    }

    fn run_named(
        &mut self,
        name: &str,
        tokens: &[String],
        env: &TaskEnv,
        capture: Capture,
        cwd: &Path,
    ) -> Result<ExecutionResult> {
        let task = self.enter(name)?;
        debug!(task = name, depth = self.stack.len(), "running task");
        let result = self.run_spec(&task, tokens, env, None, capture, cwd);
        self.stack.pop();
        result
    }

    fn run_spec(
        &mut self,
        task: &Arc<TaskSpec>,
        tokens: &[String],
        parent_env: &TaskEnv,
        shared: Shared<'_>,
        capture: Capture,
        cwd: &Path,
    ) -> Result<ExecutionResult> {
        match &task.kind {
            TaskKind::Sequence { items, ignore_fail } => {
                let prepared = self.prepare(task, tokens, parent_env, shared, cwd)?;
                self.run_sequence(task, items, *ignore_fail, prepared)
            }
            TaskKind::Switch {
                control,
                cases,
                default,
            } => {
                let prepared = self.prepare(task, tokens, parent_env, shared, cwd)?;
                self.run_switch(task, control, cases, *default, prepared, capture)
            }
            TaskKind::Ref(invocation) => {
                let prepared = self.prepare(task, tokens, parent_env, shared, cwd)?;
                let (target, args) = self.ref_target(task, invocation, &prepared)?;
                let capture = self.capture_for(task, &prepared, capture);
                self.run_named(&target, &args, &prepared.env, capture, &prepared.cwd)
            }
            TaskKind::Cmd(_) | TaskKind::Shell { .. } | TaskKind::Script { .. } | TaskKind::Expr { .. } => {
                match self.plan_leaf(task, tokens, parent_env, shared, capture, cwd)? {
                    Planned::Step { step, display } => self.execute(step, &display),
                    Planned::Done(result) => Ok(result),
                }
            }
        }
    }

    /// Bind arguments, layer the environment and run upstream tasks
    fn prepare(
        &mut self,
        task: &TaskSpec,
        tokens: &[String],
        parent_env: &TaskEnv,
        shared: Shared<'_>,
        cwd: &Path,
    ) -> Result<Prepared> {
        let mut env = parent_env.derive();
        env.set(POE_CONF_DIR, task.conf_dir.display().to_string());
        self.load_envfiles(&mut env, &task.envfiles, &task.conf_dir)?;
        env.apply_config_env(&task.env, &task.conf_dir);

        let (bound, specs) = match shared {
            Some((specs, bound)) => (bound.clone(), specs.to_vec()),
            None => {
                let bound = bind(&task.name, task.help.as_deref(), &task.args, tokens, &env)?;
                env.apply_args(bound.env_entries(&task.args));
                (bound, task.args.clone())
            }
        };

        let cwd = match &task.cwd {
            Some(template) => self.ctx.project_root.join(env.expand(template)),
            None => cwd.to_path_buf(),
        };

        for dep in &task.deps {
            self.run_upstream(task, dep, &env, false)?;
        }

        let mut unresolved = false;
        for (var, invocation) in &task.uses {
            match self.run_upstream(task, invocation, &env, true)? {
                Some(value) => env.set(var.clone(), value),
                None => unresolved = true,
            }
        }

        Ok(Prepared {
            env,
            bound,
            specs,
            cwd,
            unresolved,
        })
    }

    /// Run a `deps` or `uses` invocation once per run
    fn run_upstream(
        &mut self,
        task: &TaskSpec,
        invocation: &str,
        env: &TaskEnv,
        capture: bool,
    ) -> Result<Option<String>> {
        let (target, args) = split_invocation(task, invocation, env)?;
        let mut key_words = vec![target.clone()];
        key_words.extend(args.iter().cloned());
        let key = words::join(&key_words);

        if capture {
            if let Some(cached) = self.upstream.get(&key) {
                debug!(task = %task.name, upstream = %key, "reusing upstream result");
                return Ok(cached.clone());
            }
        } else if self.completed_deps.contains(&key) {
            return Ok(None);
        }

        let global = self.global_env()?;
        let requested = if capture { Capture::Memory } else { Capture::Inherit };
        let cwd = self.ctx.project_root.clone();
        let result = self.run_named(&target, &args, &global, requested, &cwd)?;
        if !result.success() {
            return Err(ExecutionError::UpstreamFailed {
                task: task.name.clone(),
                upstream: target,
                code: result.exit_code,
            }
            .into());
        }

        if !capture {
            self.completed_deps.insert(key);
            return Ok(None);
        }
        let output = if self.ctx.dry_run {
            result.stdout.map(|s| s.trim().to_string())
        } else {
            Some(result.stdout.unwrap_or_default().trim().to_string())
        };
        self.upstream.insert(key, output.clone());
        Ok(output)
    }

    /// Target task and arguments of a ref task
    fn ref_target(
        &self,
        task: &TaskSpec,
        invocation: &str,
        prepared: &Prepared,
    ) -> Result<(String, Vec<String>)> {
        let (target, mut args) = split_invocation(task, invocation, &prepared.env)?;
        args.extend(prepared.bound.extra.iter().cloned());
        Ok((target, args))
    }

    /// Stdout target for a task: upstream captures win over `capture_stdout`
    fn capture_for(&self, task: &TaskSpec, prepared: &Prepared, requested: Capture) -> Capture {
        match (&requested, &task.capture_stdout) {
            (Capture::Memory, _) | (_, None) => requested,
            (_, Some(template)) => Capture::File(prepared.cwd.join(prepared.env.expand(template))),
        }
    }

    /// Resolve a task that runs as a single process or in-process
    fn plan_leaf(
        &mut self,
        task: &Arc<TaskSpec>,
        tokens: &[String],
        parent_env: &TaskEnv,
        shared: Shared<'_>,
        capture: Capture,
        cwd: &Path,
    ) -> Result<Planned> {
        if let TaskKind::Ref(invocation) = &task.kind {
            let prepared = self.prepare(task, tokens, parent_env, shared, cwd)?;
            let (target, args) = self.ref_target(task, invocation, &prepared)?;
            let capture = self.capture_for(task, &prepared, capture);
            let target_task = self.enter(&target)?;
            let planned = self.plan_leaf(&target_task, &args, &prepared.env, None, capture, &prepared.cwd);
            self.stack.pop();
            return planned;
        }
        if !task.is_leaf() {
            return Err(ConfigError::InvalidTask {
                task: task.name.clone(),
                reason: format!("a {} task cannot run in a parallel group", task.kind.label()),
            }
            .into());
        }

        let prepared = self.prepare(task, tokens, parent_env, shared, cwd)?;
        let capture = self.capture_for(task, &prepared, capture);
        if prepared.unresolved {
            self.ctx.print_action(Action::Unresolved, &describe(task));
            return Ok(Planned::Done(ExecutionResult::default()));
        }

        match &task.kind {
            TaskKind::Cmd(template) => self.plan_cmd(task, template, prepared, capture),
            TaskKind::Shell {
                content,
                interpreters,
            } => self.plan_shell(task, content, interpreters, prepared, capture),
            TaskKind::Script { module, function } => {
                self.plan_script(task, module, function, prepared, capture)
            }
            TaskKind::Expr { expr, assert } => {
                let argv: Vec<String> = std::iter::once(task.name.clone())
                    .chain(prepared.bound.extra.iter().cloned())
                    .collect();
                let scope = Scope {
                    args: &prepared.bound.values,
                    env: &prepared.env,
                    argv: &argv,
                };
                let action = action_for(&capture);
                self.ctx.print_action(action, expr.source());
                let value = expr.evaluate(&scope).map_err(|error| ExecutionError::Expression {
                    task: task.name.clone(),
                    error,
                })?;
                let exit_code = match assert {
                    Some(code) if !value.truthy() => *code,
                    _ => 0,
                };
                self.finish_expr(value, exit_code, capture).map(Planned::Done)
            }
            TaskKind::Sequence { .. } | TaskKind::Switch { .. } | TaskKind::Ref(_) => {
                Err(ConfigError::InvalidTask {
                    task: task.name.clone(),
                    reason: "not a leaf task".to_string(),
                }
                .into())
            }
        }
    }

    fn plan_cmd(
        &self,
        task: &TaskSpec,
        template: &str,
        prepared: Prepared,
        capture: Capture,
    ) -> Result<Planned> {
        let line = prepared.env.expand(template);
        let words = split_words(&line).map_err(|reason| -> RpoeError {
            if split_words(template).is_ok() {
                ValidationError::InvalidArguments {
                    task: task.name.clone(),
                    message: format!("substituted values break the command line: {}", reason),
                }
                .into()
            } else {
                ConfigError::InvalidTask {
                    task: task.name.clone(),
                    reason,
                }
                .into()
            }
        })?;
        let mut argv = expand_globs(words, &prepared.cwd);
        argv.extend(prepared.bound.extra.iter().map(|arg| prepared.env.expand(arg)));
        if argv.is_empty() {
            return Err(ConfigError::InvalidTask {
                task: task.name.clone(),
                reason: "command is empty".to_string(),
            }
            .into());
        }

        let display = words::join(&argv);
        let program = argv.remove(0);
        Ok(Planned::Step {
            step: ResolvedStep {
                name: task.name.clone(),
                program,
                args: argv,
                env: prepared.env,
                cwd: prepared.cwd,
                stdin: None,
                capture,
            },
            display,
        })
    }

    fn plan_shell(
        &self,
        task: &TaskSpec,
        content: &str,
        interpreters: &[Interpreter],
        prepared: Prepared,
        capture: Capture,
    ) -> Result<Planned> {
        if !prepared.bound.extra.is_empty() {
            return Err(ValidationError::UnexpectedArguments {
                task: task.name.clone(),
                kind: "shell",
            }
            .into());
        }

        let program = self.find_interpreter(task, interpreters, &prepared)?;
        let args = interpreters
            .iter()
            .find(|i| i.executables().iter().any(|exe| program_matches(&program, exe)))
            .map(|i| i.stdin_args())
            .unwrap_or_default()
            .iter()
            .map(|a| a.to_string())
            .collect();

        Ok(Planned::Step {
            step: ResolvedStep {
                name: task.name.clone(),
                program,
                args,
                env: prepared.env,
                cwd: prepared.cwd,
                stdin: Some(content.to_string()),
                capture,
            },
            display: content.trim().to_string(),
        })
    }

    fn plan_script(
        &self,
        task: &TaskSpec,
        module: &str,
        function: &str,
        prepared: Prepared,
        capture: Capture,
    ) -> Result<Planned> {
        let program = self.find_interpreter(task, &[Interpreter::Python], &prepared)?;
        let argv: Vec<String> = std::iter::once(task.name.clone())
            .chain(prepared.bound.extra.iter().map(|arg| prepared.env.expand(arg)))
            .collect();
        let kwargs = prepared
            .specs
            .iter()
            .map(|spec| {
                let key = spec.env_name();
                let value = prepared
                    .bound
                    .values
                    .get(&key)
                    .map(Value::repr)
                    .unwrap_or_else(|| "None".to_string());
                format!("{}={}", key, value)
            })
            .collect::<Vec<_>>()
            .join(", ");
        let argv_literal = Value::List(argv.iter().cloned().map(Value::Str).collect()).repr();
        let code = format!(
            "import sys; from importlib import import_module; sys.argv = {}; sys.path.append('src'); import_module({}).{}({})",
            argv_literal,
            Value::Str(module.to_string()).repr(),
            function,
            kwargs
        );

        Ok(Planned::Step {
            step: ResolvedStep {
                name: task.name.clone(),
                program,
                args: vec!["-c".to_string(), code],
                env: prepared.env,
                cwd: prepared.cwd,
                stdin: None,
                capture,
            },
            display: argv.join(" "),
        })
    }

    /// Locate the first available executable for a list of interpreters
    fn find_interpreter(
        &self,
        task: &TaskSpec,
        interpreters: &[Interpreter],
        prepared: &Prepared,
    ) -> Result<String> {
        let path = prepared.env.get("PATH");
        for interpreter in interpreters {
            for exe in interpreter.executables() {
                if let Ok(found) = which::which_in(exe, path, &prepared.cwd) {
                    debug!(task = %task.name, interpreter = interpreter.tag(), path = %found.display(), "located interpreter");
                    return Ok(found.display().to_string());
                }
            }
        }
        Err(crate::error::ProcessError::InterpreterNotFound {
            task: task.name.clone(),
            interpreter: interpreters
                .iter()
                .map(Interpreter::tag)
                .collect::<Vec<_>>()
                .join(", "),
        }
        .into())
    }

    /// Deliver an expression result to its capture target
    fn finish_expr(&self, value: Value, exit_code: i32, capture: Capture) -> Result<ExecutionResult> {
        let text = value.to_string();
        let mut result = ExecutionResult {
            exit_code,
            stdout: None,
        };
        match capture {
            Capture::Memory => result.stdout = Some(text),
            Capture::Inherit if !self.ctx.dry_run => println!("{}", text),
            Capture::File(path) if !self.ctx.dry_run => {
                fs::write(&path, format!("{}\n", text)).map_err(|e| ExecutionError::CaptureFile {
                    path: path.clone(),
                    error: e.to_string(),
                })?;
            }
            Capture::Inherit | Capture::File(_) => {}
        }
        Ok(result)
    }

    fn execute(&mut self, step: ResolvedStep, display: &str) -> Result<ExecutionResult> {
        self.ctx.print_action(action_for(&step.capture), display);
        if self.ctx.dry_run {
            return Ok(ExecutionResult::default());
        }
        self.supervisor.run(&step)
    }

    fn check_interrupted(&self) -> Result<()> {
        match self.supervisor.group().shutdown() {
            Some(signal) => Err(RpoeError::Interrupted(signal)),
            None => Ok(()),
        }
    }

    fn run_sequence(
        &mut self,
        task: &TaskSpec,
        items: &[SequenceItem],
        ignore_fail: IgnoreFail,
        prepared: Prepared,
    ) -> Result<ExecutionResult> {
        if prepared.specs.is_empty() && !prepared.bound.extra.is_empty() {
            return Err(ValidationError::UnexpectedArguments {
                task: task.name.clone(),
                kind: "sequence",
            }
            .into());
        }

        let mut failed = Vec::new();
        for item in items {
            self.check_interrupted()?;
            let (label, outcome) = match item {
                SequenceItem::Task(sub) => (
                    item_label(sub),
                    self.run_spec(sub, &[], &prepared.env, None, Capture::Inherit, &prepared.cwd)
                        .map(|r| r.exit_code),
                ),
                SequenceItem::Parallel(members) => (
                    members.iter().map(|m| item_label(m)).collect::<Vec<_>>().join(", "),
                    self.run_parallel(members, &prepared),
                ),
            };

            let code = match outcome {
                Ok(code) => code,
                Err(RpoeError::Execution(err)) if ignore_fail != IgnoreFail::Never => {
                    self.ctx.print_error(&err.to_string());
                    err.exit_code()
                }
                Err(err) => return Err(err),
            };
            if code != 0 {
                if ignore_fail == IgnoreFail::Never {
                    return Err(ExecutionError::SequenceAborted {
                        task: task.name.clone(),
                        subtask: label,
                        code,
                    }
                    .into());
                }
                debug!(task = %task.name, subtask = %label, code, "ignoring failed subtask");
                failed.push(label);
            }
        }

        if ignore_fail == IgnoreFail::ReturnNonZero && !failed.is_empty() {
            return Err(ExecutionError::SubtasksFailed {
                task: task.name.clone(),
                subtasks: failed.join(", "),
            }
            .into());
        }
        Ok(ExecutionResult::default())
    }

    /// Plan every member first, then start them together
    fn run_parallel(&mut self, members: &[Arc<TaskSpec>], prepared: &Prepared) -> Result<i32> {
        let mut steps = Vec::with_capacity(members.len());
        let mut exit_code = 0;
        for member in members {
            match self.plan_leaf(member, &[], &prepared.env, None, Capture::Inherit, &prepared.cwd)? {
                Planned::Step { step, display } => {
                    self.ctx.print_action(action_for(&step.capture), &display);
                    steps.push(step);
                }
                Planned::Done(result) => exit_code += result.exit_code,
            }
        }
        if !self.ctx.dry_run && !steps.is_empty() {
            exit_code += self.supervisor.run_group(&steps)?.exit_code;
        }
        Ok(exit_code)
    }

    fn run_switch(
        &mut self,
        task: &TaskSpec,
        control: &Arc<TaskSpec>,
        cases: &[SwitchBranch],
        default: SwitchDefault,
        prepared: Prepared,
        capture: Capture,
    ) -> Result<ExecutionResult> {
        let control_bound = BoundArgs {
            values: prepared.bound.values.clone(),
            extra: Vec::new(),
        };
        let planned = self.plan_leaf(
            control,
            &[],
            &prepared.env,
            Some((prepared.specs.as_slice(), &control_bound)),
            Capture::Memory,
            &prepared.cwd,
        )?;
        let result = match planned {
            Planned::Step { step, display } => self.execute(step, &display)?,
            Planned::Done(result) => result,
        };
        if !result.success() {
            return Err(ExecutionError::ControlFailed {
                task: task.name.clone(),
                code: result.exit_code,
            }
            .into());
        }

        let Some(output) = result.stdout else {
            self.ctx.print_action(
                Action::Unresolved,
                &format!("unresolved case for switch task '{}'", task.name),
            );
            return Ok(ExecutionResult::default());
        };
        let value = output.trim();
        debug!(task = %task.name, value, "switch control value");

        let branch = cases
            .iter()
            .find(|case| {
                case.values
                    .as_ref()
                    .is_some_and(|values| values.iter().any(|v| v == value))
            })
            .or_else(|| cases.iter().find(|case| case.values.is_none()));

        match branch {
            Some(branch) => self.run_spec(
                &branch.task,
                &[],
                &prepared.env,
                Some((prepared.specs.as_slice(), &prepared.bound)),
                capture,
                &prepared.cwd,
            ),
            None if default == SwitchDefault::Pass => {
                debug!(task = %task.name, value, "no case matched, passing");
                Ok(ExecutionResult::default())
            }
            None => Err(ExecutionError::UnresolvedCase {
                task: task.name.clone(),
                value: value.to_string(),
            }
            .into()),
        }
    }
}

/// Split an expanded `"task args..."` invocation
fn split_invocation(task: &TaskSpec, invocation: &str, env: &TaskEnv) -> Result<(String, Vec<String>)> {
    let expanded = env.expand(invocation);
    let mut parts = split_plain(&expanded).map_err(|reason| ConfigError::InvalidTask {
        task: task.name.clone(),
        reason,
    })?;
    if parts.is_empty() {
        return Err(ConfigError::InvalidTask {
            task: task.name.clone(),
            reason: format!("'{}' does not name a task", invocation),
        }
        .into());
    }
    let target = parts.remove(0);
    Ok((target, parts))
}

fn action_for(capture: &Capture) -> Action {
    match capture {
        Capture::Inherit => Action::Streamed,
        Capture::Memory | Capture::File(_) => Action::Captured,
    }
}

fn program_matches(program: &str, exe: &str) -> bool {
    Path::new(program)
        .file_stem()
        .is_some_and(|stem| stem.to_string_lossy() == exe)
}

/// Short form of a task for unresolved messages
fn describe(task: &TaskSpec) -> String {
    match &task.kind {
        TaskKind::Cmd(template) => template.clone(),
        TaskKind::Shell { content, .. } => content.trim().to_string(),
        TaskKind::Script { module, function } => format!("{}:{}", module, function),
        TaskKind::Expr { expr, .. } => expr.source().to_string(),
        TaskKind::Ref(invocation) => invocation.clone(),
        TaskKind::Sequence { .. } | TaskKind::Switch { .. } => task.name.clone(),
    }
}

/// Name used for a sequence item in failure messages
fn item_label(task: &TaskSpec) -> String {
    match &task.kind {
        TaskKind::Ref(invocation) => invocation.clone(),
        _ => task.name.clone(),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::parse_config_file;
    use crate::runner::command::SimpleExecutor;
    use crate::runner::supervisor::ProcessGroup;
    use tempfile::TempDir;

    struct Project {
        dir: TempDir,
        registry: TaskRegistry,
    }

    fn project(yaml: &str) -> Project {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("rpoe.yml");
        fs::write(&path, yaml).unwrap();
        let config = parse_config_file(&path).unwrap();
        let registry = TaskRegistry::load(&config).unwrap();
        Project { dir, registry }
    }

    fn context(project: &Project, dry_run: bool) -> ExecutionContext {
        let root = project.dir.path().canonicalize().unwrap();
        ExecutionContext::with_env(root.clone(), std::env::vars(), &root)
            .with_verbosity(crate::runner::context::Verbosity::Silent)
            .with_dry_run(dry_run)
    }

    fn run(project: &Project, task: &str, args: &[&str]) -> Result<ExecutionResult> {
        let ctx = context(project, false);
        let supervisor = Supervisor::new(&SimpleExecutor, Arc::new(ProcessGroup::new()));
        let mut runner = Runner::new(&project.registry, &ctx, supervisor);
        let tokens: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        runner.run_task(task, &tokens)
    }

    fn read(project: &Project, file: &str) -> String {
        fs::read_to_string(project.dir.path().join(file)).unwrap()
    }

    #[test]
    fn test_cmd_with_args_and_capture() {
        let p = project(
            r#"
tasks:
  greet:
    cmd: echo hello ${name}
    args: [name]
    capture_stdout: out.txt
"#,
        );
        let result = run(&p, "greet", &["--name", "world"]).unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(read(&p, "out.txt"), "hello world\n");
    }

    #[test]
    fn test_escaped_and_doubled_backslash() {
        let p = project(
            r#"
tasks:
  t:
    cmd: printf '%s|' \${POE_ROOT} \\${MARK}
    env: { MARK: x }
    capture_stdout: out.txt
"#,
        );
        run(&p, "t", &[]).unwrap();
        assert_eq!(read(&p, "out.txt"), "${POE_ROOT}|\\x|");
    }

    #[test]
    fn test_uses_feeds_captured_output() {
        let p = project(
            r#"
tasks:
  _version: echo 1.2.3
  show:
    cmd: echo "v=${VERSION}"
    uses: { VERSION: _version }
    capture_stdout: out.txt
"#,
        );
        run(&p, "show", &[]).unwrap();
        assert_eq!(read(&p, "out.txt"), "v=1.2.3\n");
    }

    #[test]
    fn test_uses_failure_names_upstream() {
        let p = project("tasks:\n  bad: 'false'\n  t:\n    cmd: echo $X\n    uses: { X: bad }\n");
        match run(&p, "t", &[]) {
            Err(RpoeError::Execution(ExecutionError::UpstreamFailed { upstream, .. })) => {
                assert_eq!(upstream, "bad")
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_sequence_fail_fast() {
        let p = project(
            r#"
tasks:
  seq:
    sequence:
      - cmd: sh -c 'exit 3'
      - cmd: touch never.txt
"#,
        );
        match run(&p, "seq", &[]) {
            Err(RpoeError::Execution(err @ ExecutionError::SequenceAborted { .. })) => {
                assert_eq!(err.exit_code(), 3)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!p.dir.path().join("never.txt").exists());
    }

    #[test]
    fn test_sequence_ignore_fail() {
        let p = project(
            r#"
tasks:
  seq:
    sequence:
      - cmd: 'false'
      - cmd: touch ran.txt
    ignore_fail: return_non_zero
"#,
        );
        assert!(matches!(
            run(&p, "seq", &[]),
            Err(RpoeError::Execution(ExecutionError::SubtasksFailed { .. }))
        ));
        assert!(p.dir.path().join("ran.txt").exists());
    }

    #[test]
    fn test_parallel_group_sums_and_waits() {
        let p = project(
            r#"
tasks:
  seq:
    sequence:
      - [{ cmd: sh -c 'sleep 0.2; touch a; exit 1' }, { cmd: sh -c 'sleep 0.1; touch b; exit 2' }, { cmd: touch c }]
      - cmd: touch after
    ignore_fail: true
"#,
        );
        run(&p, "seq", &[]).unwrap();
        for marker in ["a", "b", "c", "after"] {
            assert!(p.dir.path().join(marker).exists(), "missing {}", marker);
        }

        let p = project("tasks:\n  seq:\n    sequence:\n      - [{ cmd: sh -c 'exit 1' }, { cmd: sh -c 'exit 2' }]\n");
        match run(&p, "seq", &[]) {
            Err(RpoeError::Execution(ExecutionError::SequenceAborted { code, .. })) => assert_eq!(code, 3),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_switch_selects_case() {
        let p = project(
            r#"
tasks:
  sw:
    args: [{ name: mode, default: b }]
    control: { expr: "mode" }
    switch:
      - case: a
        cmd: touch chose-a
      - case: [b, c]
        cmd: touch chose-b
      - cmd: touch chose-default
"#,
        );
        run(&p, "sw", &[]).unwrap();
        assert!(p.dir.path().join("chose-b").exists());
        run(&p, "sw", &["--mode", "zzz"]).unwrap();
        assert!(p.dir.path().join("chose-default").exists());
        assert!(!p.dir.path().join("chose-a").exists());
    }

    #[test]
    fn test_switch_without_match() {
        let p = project(
            r#"
tasks:
  sw:
    control: { cmd: echo nope }
    switch:
      - case: yes
        cmd: touch ran
"#,
        );
        let err = run(&p, "sw", &[]).unwrap_err();
        assert!(err.to_string().contains("did not match any cases"));
        assert_eq!(err.exit_code(), 1);
        assert!(!p.dir.path().join("ran").exists());

        let p = project("tasks:\n  sw:\n    control: { cmd: echo nope }\n    default: pass\n    switch:\n      - case: yes\n        cmd: touch ran\n");
        assert!(run(&p, "sw", &[]).unwrap().success());
    }

    #[test]
    fn test_ref_forwards_all_tokens() {
        let p = project(
            r#"
tasks:
  _show:
    cmd: printf '%s,'
    capture_stdout: out.txt
  fwd: { ref: _show first }
"#,
        );
        run(&p, "fwd", &["-x", "--", "y"]).unwrap();
        assert_eq!(read(&p, "out.txt"), "first,-x,--,y,");
    }

    #[test]
    fn test_expr_task_and_assert() {
        let p = project(
            r#"
tasks:
  calc:
    expr: "n * 2"
    args: [{ name: n, type: integer }]
    capture_stdout: out.txt
  check:
    expr: "n > 5"
    args: [{ name: n, type: integer }]
    assert: 7
"#,
        );
        run(&p, "calc", &["--n", "21"]).unwrap();
        assert_eq!(read(&p, "out.txt"), "42\n");
        assert_eq!(run(&p, "check", &["--n", "1"]).unwrap().exit_code, 7);
        assert_eq!(run(&p, "check", &["--n", "9"]).unwrap().exit_code, 0);
    }

    #[test]
    fn test_shell_rejects_extra_args() {
        let p = project("tasks:\n  sh: { shell: 'echo hi' }\n");
        assert!(matches!(
            run(&p, "sh", &["extra"]),
            Err(RpoeError::Validation(ValidationError::UnexpectedArguments { .. }))
        ));
    }

    #[test]
    fn test_shell_reads_env() {
        let p = project(
            r#"
env: { GREETING: hi }
tasks:
  sh:
    shell: |
      echo "$GREETING from $POE_ACTIVE_UNSET${GREETING}" > shell.txt
"#,
        );
        run(&p, "sh", &[]).unwrap();
        assert_eq!(read(&p, "shell.txt"), "hi from hi\n");
    }

    #[test]
    fn test_private_task_not_runnable() {
        let p = project("tasks:\n  _hidden: echo\n");
        assert!(matches!(run(&p, "_hidden", &[]), Err(RpoeError::Config(_))));
    }

    #[test]
    fn test_runtime_cycle_through_template() {
        let p = project("tasks:\n  a: { ref: '${NEXT:-b}' }\n  b: { ref: '${BACK:-a}' }\n");
        assert!(matches!(
            run(&p, "a", &[]),
            Err(RpoeError::Config(ConfigError::CircularDependency(_)))
        ));
    }

    #[test]
    fn test_dry_run_spawns_nothing() {
        let p = project(
            r#"
tasks:
  _v: echo 1
  t:
    cmd: touch made-${V}
    uses: { V: _v }
  plain: touch plain
"#,
        );
        let ctx = context(&p, true);
        let supervisor = Supervisor::new(&SimpleExecutor, Arc::new(ProcessGroup::new()));
        let mut runner = Runner::new(&p.registry, &ctx, supervisor);
        assert!(runner.run_task("t", &[]).unwrap().success());
        assert!(runner.run_task("plain", &[]).unwrap().success());
        assert_eq!(fs::read_dir(p.dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_task_env_and_global_env_layering() {
        let p = project(
            r#"
env:
  A: global
  B: global
tasks:
  t:
    cmd: sh -c 'echo "$A $B $C" > env.txt'
    env:
      B: task-${A}
      C: { default: fallback }
"#,
        );
        run(&p, "t", &[]).unwrap();
        assert_eq!(read(&p, "env.txt"), "global task-global fallback\n");
    }
}
