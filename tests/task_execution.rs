//! Integration tests for running tasks through the rpoe binary

mod common;

use common::{create_test_config, create_test_config_in_subdir, rpoe};
use predicates::prelude::*;

#[test]
fn test_execute_simple_task() {
    let (dir, _) = create_test_config("tasks:\n  hello: echo Hello World\n");

    rpoe(dir.path())
        .arg("hello")
        .assert()
        .success()
        .stdout("Hello World\n")
        .stderr(predicate::str::contains("rpoe => echo Hello World"));
}

#[test]
fn test_execute_task_with_arguments() {
    let yaml = r#"
tasks:
  greet:
    cmd: echo "Hello, ${name}!"
    args:
      name:
        default: Rust
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path()).arg("greet").assert().success().stdout("Hello, Rust!\n");
    rpoe(dir.path())
        .args(["greet", "--name", "Ferris"])
        .assert()
        .success()
        .stdout("Hello, Ferris!\n");
}

#[test]
fn test_failing_command_exit_code_is_propagated() {
    let (dir, _) = create_test_config("tasks:\n  fail: sh -c 'exit 4'\n");

    rpoe(dir.path()).arg("fail").assert().code(4);
}

#[test]
fn test_missing_executable_exits_127() {
    let (dir, _) = create_test_config("tasks:\n  nope: definitely-not-a-real-program-xyz\n");

    rpoe(dir.path())
        .arg("nope")
        .assert()
        .code(127)
        .stderr(predicate::str::contains("definitely-not-a-real-program-xyz"));
}

#[test]
fn test_unknown_task_is_config_error() {
    let (dir, _) = create_test_config("tasks:\n  hello: echo hi\n");

    rpoe(dir.path())
        .arg("missing")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("missing"));
}

#[test]
fn test_invalid_choices_for_integer_argument() {
    let yaml = r#"
tasks:
  pick:
    cmd: echo ${level}
    args:
      - name: level
        type: integer
        choices: ["1", "2"]
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .arg("pick")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("level"));
}

#[test]
fn test_invalid_argument_value_exits_2() {
    let yaml = r#"
tasks:
  count:
    cmd: echo ${n}
    args:
      - name: n
        type: integer
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["count", "--n", "many"])
        .assert()
        .code(2)
        .stdout("");
}

#[test]
fn test_quote_in_argument_value_is_a_validation_error() {
    let yaml = r#"
tasks:
  say:
    cmd: echo ${msg}
    args: [msg]
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["say", "--msg", "it's"])
        .assert()
        .code(2)
        .stdout("")
        .stderr(predicate::str::contains("Invalid arguments for task 'say'"))
        .stderr(predicate::str::contains("Configuration error").not());
}

#[test]
fn test_sequence_runs_in_order() {
    let yaml = r#"
tasks:
  multi:
    sequence:
      - cmd: echo First
      - cmd: echo Second
      - shell: echo Third
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .arg("multi")
        .assert()
        .success()
        .stdout("First\nSecond\nThird\n");
}

#[test]
fn test_parallel_group_exit_codes_are_summed() {
    let yaml = r#"
tasks:
  both:
    sequence:
      - [{ cmd: sh -c 'exit 1' }, { cmd: sh -c 'exit 2' }]
      - cmd: echo unreachable
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .arg("both")
        .assert()
        .code(3)
        .stdout(predicate::str::contains("unreachable").not());
}

#[test]
fn test_parallel_output_is_prefixed() {
    let yaml = r#"
tasks:
  _left: echo from-left
  _right: echo from-right
  both:
    sequence:
      - [_left, _right]
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .arg("both")
        .assert()
        .success()
        .stdout(predicate::str::contains("from-left").and(predicate::str::contains("from-right")))
        .stdout(predicate::str::contains("_left"));
}

#[test]
fn test_switch_without_matching_case() {
    let yaml = r#"
tasks:
  sw:
    control: { cmd: echo other }
    switch:
      - case: linux
        cmd: echo matched
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .arg("sw")
        .assert()
        .code(1)
        .stdout(predicate::str::contains("matched").not())
        .stderr(predicate::str::contains("did not match any cases"));
}

#[test]
fn test_switch_on_argument() {
    let yaml = r#"
tasks:
  sw:
    args: [{ name: mode, default: fast }]
    control: { expr: mode }
    switch:
      - case: fast
        cmd: echo going fast
      - cmd: echo going slow
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path()).arg("sw").assert().success().stdout("going fast\n");
    rpoe(dir.path())
        .args(["sw", "--mode", "careful"])
        .assert()
        .success()
        .stdout("going slow\n");
}

#[test]
fn test_ref_forwards_double_dash() {
    let yaml = r#"
tasks:
  _show: printf '%s;'
  fwd: { ref: _show base }
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["fwd", "--", "--flag", "x"])
        .assert()
        .success()
        .stdout("base;--;--flag;x;");
}

#[test]
fn test_expr_task_prints_value() {
    let yaml = r#"
tasks:
  calc:
    expr: "n * 2"
    args: [{ name: n, type: integer, default: 4 }]
  check:
    expr: "n > 5"
    args: [{ name: n, type: integer, default: 1 }]
    assert: 3
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path()).args(["calc", "--n", "21"]).assert().success().stdout("42\n");
    rpoe(dir.path()).arg("check").assert().code(3);
}

#[test]
fn test_dry_run_prints_without_running() {
    let yaml = r#"
tasks:
  make:
    cmd: touch created.txt
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["--dry-run", "make"])
        .assert()
        .success()
        .stderr(predicate::str::contains("rpoe => touch created.txt"));
    assert!(!dir.path().join("created.txt").exists());
}

#[test]
fn test_dry_run_reports_unresolved_switch_case() {
    let yaml = r#"
tasks:
  sw:
    control: { cmd: uname }
    switch:
      - case: Linux
        cmd: touch linux.txt
      - cmd: touch other.txt
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["-d", "sw"])
        .assert()
        .success()
        .stdout("")
        .stderr(predicate::str::contains("rpoe <= uname"))
        .stderr(predicate::str::contains(
            "rpoe ?? unresolved case for switch task 'sw'",
        ))
        .stderr(predicate::str::contains("touch").not());
}

#[test]
fn test_dry_run_reports_step_using_upstream_output() {
    let yaml = r#"
tasks:
  version: echo 1.2.3
  tag:
    cmd: touch v${VERSION}
    uses: { VERSION: version }
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["--dry-run", "tag"])
        .assert()
        .success()
        .stdout("")
        .stderr(predicate::str::contains("rpoe ?? touch v${VERSION}"));
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_quiet_hides_action_lines() {
    let (dir, _) = create_test_config("tasks:\n  hello: echo hi\n");

    rpoe(dir.path())
        .args(["-q", "hello"])
        .assert()
        .success()
        .stdout("hi\n")
        .stderr(predicate::str::contains("rpoe =>").not());
}

#[test]
fn test_task_listing_without_task() {
    let yaml = r#"
tasks:
  build:
    cmd: cargo build
    help: Build the project
  _private: echo hidden
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Build the project"))
        .stdout(predicate::str::contains("_private").not());
}

#[test]
fn test_task_help_flag() {
    let yaml = r#"
tasks:
  greet:
    cmd: echo ${name}
    help: Say hello
    args:
      - name: name
        help: Who to greet
"#;
    let (dir, _) = create_test_config(yaml);

    rpoe(dir.path())
        .args(["greet", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--name"))
        .stdout(predicate::str::contains("Who to greet"));
}

#[test]
fn test_config_found_from_subdirectory() {
    let yaml = r#"
tasks:
  where: pwd
"#;
    let (_dir, _, sub_dir) = create_test_config_in_subdir(yaml);

    // cwd defaults to the project root, not the invocation directory
    rpoe(&sub_dir)
        .arg("where")
        .assert()
        .success()
        .stdout(predicate::str::contains("subdir").not());
}

#[test]
fn test_root_flag_selects_project() {
    let (dir, _) = create_test_config("tasks:\n  hello: echo from-root\n");
    let elsewhere = tempfile::TempDir::new().unwrap();

    rpoe(elsewhere.path())
        .arg("-C")
        .arg(dir.path())
        .arg("hello")
        .assert()
        .success()
        .stdout("from-root\n");
}

#[test]
fn test_missing_config_file() {
    let empty = tempfile::TempDir::new().unwrap();

    rpoe(empty.path())
        .arg("-C")
        .arg(empty.path())
        .arg("anything")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("rpoe.yml"));
}

#[cfg(unix)]
#[test]
fn test_sigint_is_forwarded_to_children() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::process::{Command, Stdio};
    use std::time::Duration;
    use wait_timeout::ChildExt;

    let (dir, _) = create_test_config("tasks:\n  slow: sh -c 'sleep 3117'\n");

    let mut child = Command::new(assert_cmd::cargo::cargo_bin("rpoe"))
        .arg("slow")
        .current_dir(dir.path())
        .env("NO_COLOR", "1")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    std::thread::sleep(Duration::from_millis(800));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGINT).unwrap();

    let status = match child.wait_timeout(Duration::from_secs(10)).unwrap() {
        Some(status) => status,
        None => {
            child.kill().unwrap();
            panic!("rpoe did not exit after SIGINT");
        }
    };
    assert_eq!(status.code(), Some(130));

    #[cfg(target_os = "linux")]
    {
        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while running_sleepers("3117") > 0 {
            assert!(
                std::time::Instant::now() < deadline,
                "child 'sleep 3117' outlived the runner"
            );
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

/// Live processes whose command line is `sleep <arg>`
#[cfg(target_os = "linux")]
fn running_sleepers(arg: &str) -> usize {
    let wanted = format!("sleep\0{}\0", arg);
    std::fs::read_dir("/proc")
        .unwrap()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| std::fs::read(entry.path().join("cmdline")).ok())
        .filter(|cmdline| cmdline.ends_with(wanted.as_bytes()))
        .count()
}
