//! Main CLI application

use crate::config::{find_config_file, parse_config_file, resolve_config_path};
use crate::error::RpoeError;
use crate::logging;
use crate::runner::args::ArgForm;
use crate::runner::{
    signals, Executor, ExecutionContext, ProcessGroup, Runner, SimpleExecutor, Supervisor,
    TaskRegistry, TaskSpec, Verbosity,
};
use anyhow::Context as _;
use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Runner flags that take a value
const VALUE_FLAGS: &[&str] = &["-f", "--file", "-C", "--root"];

/// Command line split into runner flags, task name and task tokens
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub runner_args: Vec<String>,
    pub task: Option<String>,
    pub task_args: Vec<String>,
}

/// Split the command line at the task name
///
/// Everything after the task name belongs to the task and is passed on
/// untouched, including `--`.
pub fn split_command_line(args: &[String]) -> CommandLine {
    let mut runner_args = Vec::new();
    let mut iter = args.iter();

    if let Some(bin) = iter.next() {
        runner_args.push(bin.clone());
    }

    while let Some(arg) = iter.next() {
        if arg == "--" {
            let task = iter.next().cloned();
            return CommandLine {
                runner_args,
                task,
                task_args: iter.cloned().collect(),
            };
        }
        if arg.starts_with('-') && arg.len() > 1 {
            runner_args.push(arg.clone());
            if VALUE_FLAGS.contains(&arg.as_str()) {
                if let Some(value) = iter.next() {
                    runner_args.push(value.clone());
                }
            }
            continue;
        }
        return CommandLine {
            runner_args,
            task: Some(arg.clone()),
            task_args: iter.cloned().collect(),
        };
    }

    CommandLine {
        runner_args,
        task: None,
        task_args: Vec::new(),
    }
}

/// Build the clap command for the runner's own flags
pub fn build_command() -> Command {
    Command::new("rpoe")
        .version(env!("CARGO_PKG_VERSION"))
        .about("A YAML-based task runner")
        .override_usage("rpoe [OPTIONS] [TASK] [ARGS]...")
        .arg(
            Arg::new("file")
                .short('f')
                .long("file")
                .value_name("FILE")
                .help("Path to an rpoe.yml config file")
                .conflicts_with("root"),
        )
        .arg(
            Arg::new("root")
                .short('C')
                .long("root")
                .value_name("DIR")
                .help("Directory containing rpoe.yml"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Only print command output and errors")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("silent")
                .short('s')
                .long("silent")
                .help("Print no output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Print verbose output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("dry_run")
                .short('d')
                .long("dry-run")
                .help("Print the commands a task would run without running them")
                .action(ArgAction::SetTrue),
        )
}

/// Get verbosity level from matches
fn get_verbosity(matches: &ArgMatches) -> Verbosity {
    if matches.get_flag("silent") {
        Verbosity::Silent
    } else if matches.get_flag("quiet") {
        Verbosity::Quiet
    } else if matches.get_flag("verbose") {
        Verbosity::Verbose
    } else {
        Verbosity::Normal
    }
}

/// Find the config file named by `-f`/`-C`, or search from the working directory
fn locate_config(matches: &ArgMatches) -> Result<PathBuf, RpoeError> {
    let explicit = matches
        .get_one::<String>("file")
        .or_else(|| matches.get_one::<String>("root"));
    let path = match explicit {
        Some(path) => resolve_config_path(&PathBuf::from(path))?,
        None => find_config_file()?,
    };
    Ok(path)
}

fn describe_args(task: &TaskSpec) -> Vec<(String, String)> {
    task.args
        .iter()
        .map(|arg| {
            let usage = match &arg.form {
                ArgForm::Positional { display } => display.to_uppercase(),
                ArgForm::Options(forms) if arg.arg_type == crate::runner::args::ArgType::Boolean => {
                    forms.join(", ")
                }
                ArgForm::Options(forms) => {
                    format!("{} {}", forms.join(", "), arg.name.to_uppercase())
                }
            };
            (usage, arg.help.clone().unwrap_or_default())
        })
        .collect()
}

/// Render the task listing shown when no task is given
pub fn render_task_list(registry: &TaskRegistry) -> String {
    let mut out = String::new();
    out.push_str(&format!(
        "{} rpoe [OPTIONS] TASK [ARGS]...\n\n",
        "Usage:".bold()
    ));

    let public: Vec<&Arc<TaskSpec>> = registry.tasks().filter(|t| !t.is_private()).collect();
    if public.is_empty() {
        out.push_str("No tasks configured.\n");
        return out;
    }

    let width = public
        .iter()
        .map(|t| t.name.chars().count())
        .chain(public.iter().flat_map(|t| describe_args(t).into_iter().map(|(u, _)| u.chars().count() + 2)))
        .max()
        .unwrap_or(0);

    let mut groups: Vec<Option<&str>> = Vec::new();
    for task in &public {
        let group = task.group.as_deref();
        if !groups.contains(&group) {
            groups.push(group);
        }
    }

    out.push_str(&format!("{}\n", "Configured tasks:".bold()));
    for group in groups {
        if let Some(name) = group {
            out.push_str(&format!("\n  {}\n", name.underline()));
        }
        for task in public.iter().filter(|t| t.group.as_deref() == group) {
            let help = task.help.clone().unwrap_or_default();
            out.push_str(&format!(
                "  {}  {}\n",
                format!("{:<width$}", task.name, width = width).cyan(),
                help
            ));
            for (usage, help) in describe_args(task) {
                out.push_str(&format!(
                    "    {:<width$}  {}\n",
                    usage,
                    help,
                    width = width.saturating_sub(2)
                ));
            }
        }
    }

    out
}

/// Run the CLI with the given command line and return the exit code
pub fn run_from(args: Vec<String>) -> anyhow::Result<i32> {
    let command_line = split_command_line(&args);
    let matches = build_command().get_matches_from(&command_line.runner_args);

    let verbosity = get_verbosity(&matches);
    logging::init(verbosity);

    let config_path = locate_config(&matches)?;
    debug!(path = %config_path.display(), "loading config");
    let config = parse_config_file(&config_path)?;
    let registry = TaskRegistry::load(&config).map_err(RpoeError::from)?;

    let Some(task) = command_line.task else {
        if verbosity > Verbosity::Silent {
            print!("{}", render_task_list(&registry));
        }
        return Ok(crate::exit_codes::OK);
    };

    let executor = SimpleExecutor;
    let ctx = ExecutionContext::new(registry.conf_dir.clone())
        .with_verbosity(verbosity)
        .with_dry_run(matches.get_flag("dry_run"))
        .with_executor_name(executor.name());

    let group = Arc::new(ProcessGroup::new());
    let _listener =
        signals::listen(group.clone()).context("failed to install signal handlers")?;
    let supervisor = Supervisor::new(&executor, group);
    let mut runner = Runner::new(&registry, &ctx, supervisor);

    let result = runner.run_task(&task, &command_line.task_args)?;
    Ok(result.exit_code)
}

/// Run the CLI application with the process arguments
pub fn run() -> anyhow::Result<i32> {
    run_from(std::env::args().collect())
}
