//! Integration tests for YAML parsing and task loading

mod common;

use common::{create_test_config, create_test_config_in_subdir};
use rpoe::config::types::{EnvValue, TaskDef};
use rpoe::config::{find_config_file_from, parse_config, parse_config_file, validate_config};
use rpoe::error::ConfigError;
use rpoe::runner::task::SequenceItem;
use rpoe::runner::{TaskKind, TaskRegistry};
use rpoe::RpoeError;
use std::fs;

#[test]
fn test_parse_complete_config() {
    let yaml = r#"
env:
  PROFILE: dev
  LOG_LEVEL: { default: info }
envfile: .env
default_task_type: cmd

tasks:
  build:
    help: Build the project
    cmd: cargo build --profile ${PROFILE}
    args:
      - name: release
        type: boolean
        options: [--release, -r]

  test: cargo test

  check:
    sequence:
      - build
      - [lint, test]
    ignore_fail: return_non_zero

  lint:
    shell: cargo clippy && cargo fmt --check
"#;

    let config = parse_config(yaml, None).unwrap();
    validate_config(&config).unwrap();

    let names: Vec<&str> = config.tasks.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["build", "test", "check", "lint"]);
    assert_eq!(config.envfile, [".env"]);
    assert_eq!(
        config.env,
        vec![
            ("PROFILE".to_string(), EnvValue::Value("dev".to_string())),
            ("LOG_LEVEL".to_string(), EnvValue::Default("info".to_string())),
        ]
    );

    match &config.tasks[0].1 {
        TaskDef::Full(detail) => {
            assert_eq!(detail.help.as_deref(), Some("Build the project"));
            assert_eq!(detail.args.len(), 1);
            assert_eq!(detail.args[0].options, ["--release", "-r"]);
        }
        other => panic!("expected full definition, got {:?}", other),
    }
    assert!(matches!(&config.tasks[1].1, TaskDef::Shorthand(s) if s == "cargo test"));
}

#[test]
fn test_registry_names_inline_tasks() {
    let yaml = r#"
tasks:
  a: echo a
  b: echo b
  c: echo c
  all:
    sequence:
      - a
      - [b, c]
      - cmd: echo done
"#;

    let config = parse_config(yaml, None).unwrap();
    let registry = TaskRegistry::load(&config).unwrap();
    let all = registry.get("all").unwrap();

    let TaskKind::Sequence { items, .. } = &all.kind else {
        panic!("expected a sequence, got {}", all.kind.label());
    };
    assert_eq!(items.len(), 3);
    match &items[1] {
        SequenceItem::Parallel(members) => {
            let names: Vec<&str> = members.iter().map(|m| m.name.as_str()).collect();
            assert_eq!(names, ["all[1][0]", "all[1][1]"]);
        }
        SequenceItem::Task(task) => panic!("expected a parallel group, got {}", task.name),
    }
    match &items[2] {
        SequenceItem::Task(task) => {
            assert_eq!(task.name, "all[2]");
            assert!(matches!(&task.kind, TaskKind::Cmd(c) if c == "echo done"));
        }
        SequenceItem::Parallel(_) => panic!("expected a single task"),
    }
}

#[test]
fn test_parse_args_as_mapping() {
    let yaml = r#"
tasks:
  greet:
    cmd: echo ${greeting} ${person}
    args:
      person:
        positional: true
        required: true
      greeting:
        default: Hello
        choices: [Hello, Hi]
"#;

    let config = parse_config(yaml, None).unwrap();
    let registry = TaskRegistry::load(&config).unwrap();
    let greet = registry.get("greet").unwrap();

    let names: Vec<&str> = greet.args.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(names, ["person", "greeting"]);
    assert!(greet.args[0].is_positional());
    assert!(greet.args[0].required);
}

#[test]
fn test_invalid_task_name_is_rejected() {
    let config = parse_config("tasks:\n  '1bad': echo\n", None).unwrap();
    assert!(matches!(
        validate_config(&config),
        Err(ConfigError::InvalidTask { .. })
    ));
}

#[test]
fn test_invalid_default_task_type() {
    let config = parse_config("default_task_type: make\ntasks:\n  a: echo\n", None).unwrap();
    let err = validate_config(&config).unwrap_err();
    assert!(err.to_string().contains("default_task_type"));
}

#[test]
fn test_unknown_task_key_is_rejected() {
    let result = parse_config("tasks:\n  a:\n    cmd: echo\n    colour: red\n", None);
    assert!(matches!(result, Err(RpoeError::Yaml(_))));
}

#[test]
fn test_registry_rejects_missing_ref_target() {
    let config = parse_config("tasks:\n  a: { ref: nowhere }\n", None).unwrap();
    assert!(matches!(
        TaskRegistry::load(&config),
        Err(ConfigError::TaskNotFound(name)) if name == "nowhere"
    ));
}

#[test]
fn test_registry_rejects_static_cycle() {
    let yaml = "tasks:\n  a: { ref: b }\n  b: { ref: a }\n";
    let config = parse_config(yaml, None).unwrap();
    match TaskRegistry::load(&config) {
        Err(ConfigError::CircularDependency(path)) => assert!(path.contains("a -> b -> a") || path.contains("b -> a -> b")),
        other => panic!("expected a cycle, got {:?}", other),
    }
}

#[test]
fn test_parse_config_file_records_directory() {
    let (dir, path) = create_test_config("tasks:\n  hello: echo hi\n");
    let config = parse_config_file(&path).unwrap();
    assert_eq!(
        config.conf_dir.unwrap().canonicalize().unwrap(),
        dir.path().canonicalize().unwrap()
    );
}

#[test]
fn test_config_discovered_from_subdirectory() {
    let (dir, _, sub_dir) = create_test_config_in_subdir("tasks:\n  hello: echo hi\n");
    let found = find_config_file_from(sub_dir).unwrap();
    assert_eq!(found, dir.path().join("rpoe.yml"));
}

#[test]
fn test_included_tasks_are_merged() {
    let (dir, path) = create_test_config(
        "include: extra/tasks.yml\ntasks:\n  hello: echo main\n",
    );
    fs::create_dir(dir.path().join("extra")).unwrap();
    fs::write(
        dir.path().join("extra/tasks.yml"),
        "tasks:\n  hello: echo shadowed\n  extra: echo extra\n",
    )
    .unwrap();

    let config = parse_config_file(&path).unwrap();
    let registry = TaskRegistry::load(&config).unwrap();

    assert!(matches!(&registry.get("hello").unwrap().kind, TaskKind::Cmd(c) if c == "echo main"));
    let extra = registry.get("extra").unwrap();
    assert!(extra.conf_dir.ends_with("extra"));
}
