//! Command-line tests for the `fleetrun` binary.

use std::fs;
use std::path::{Path, PathBuf};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn fleetrun(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("fleetrun").unwrap();
    cmd.current_dir(dir);
    cmd
}

fn write_suite(dir: &Path, scripts: &[&str]) -> PathBuf {
    let suite = dir.join("suite");
    for script in scripts {
        let path = suite.join(script);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "# test\n").unwrap();
    }
    suite
}

#[test]
fn validate_accepts_valid_config() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("fleetrun.toml"),
        "[fleetrun]\npolicy = \"replicate\"\n\n[devices]\nserials = [\"A\", \"B\"]\n",
    )
    .unwrap();

    fleetrun(dir.path())
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration is valid!"))
        .stdout(predicate::str::contains("Replicate"))
        .stdout(predicate::str::contains("A, B"));
}

#[test]
fn validate_rejects_bad_policy() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("fleetrun.toml"),
        "[fleetrun]\npolicy = \"shuffle\"\n",
    )
    .unwrap();

    fleetrun(dir.path())
        .arg("validate")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Configuration error"));
}

#[test]
fn init_creates_config_once() {
    let dir = TempDir::new().unwrap();

    fleetrun(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("Created fleetrun.toml"));
    assert!(dir.path().join("fleetrun.toml").is_file());

    fleetrun(dir.path()).arg("validate").assert().success();

    fleetrun(dir.path())
        .arg("init")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn plan_lists_balanced_assignment() {
    let dir = TempDir::new().unwrap();
    write_suite(dir.path(), &["x_test.py", "y_test.py", "helper.py"]);

    fleetrun(dir.path())
        .args(["plan", "suite", "-d", "A", "-d", "B"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Planned 2 tasks on 2 devices"))
        .stdout(predicate::str::contains("A_x_test"))
        .stdout(predicate::str::contains("B_y_test"))
        .stdout(predicate::str::contains("helper").not());
}

#[test]
fn plan_json_replicates_to_every_device() {
    let dir = TempDir::new().unwrap();
    write_suite(dir.path(), &["x_test.py", "y_test.py"]);

    let output = fleetrun(dir.path())
        .args(["plan", "suite", "-d", "A", "-d", "B", "--replicate", "--format", "json"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let plan: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let queues = plan["queues"].as_array().unwrap();
    assert_eq!(queues.len(), 2);
    for queue in queues {
        assert_eq!(queue["tasks"].as_array().unwrap().len(), 2);
    }
    assert_eq!(queues[1]["tasks"][0]["log_key"], "B_x_test");
}

#[test]
fn plan_rejects_scripts_sharing_a_log_directory() {
    let dir = TempDir::new().unwrap();
    write_suite(dir.path(), &["a.b_test.py", "a_b_test.py"]);

    fleetrun(dir.path())
        .args(["plan", "suite", "-d", "A"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("share log directories: A_a_b_test"));
}

#[test]
fn missing_path_is_an_infrastructure_error() {
    let dir = TempDir::new().unwrap();

    fleetrun(dir.path())
        .args(["plan", "nope", "-d", "A"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("does not exist"));
}

#[cfg(unix)]
mod run {
    use super::*;

    /// Stand-in for the test tool. Records each call in `calls.txt`; `run`
    /// fails scripts named `*fail*` unless `FLEET_PASS_ALL` is set.
    const FAKE_TOOL: &str = r#"
echo "$1 $2" >> "$(dirname "$0")/calls.txt"
case "$1" in
  run)
    mkdir -p "$6"
    echo log > "$6/log.txt"
    case "$2" in
      *fail*) [ -n "$FLEET_PASS_ALL" ] || exit 1 ;;
    esac
    ;;
  report)
    echo html > "$6"
    ;;
esac
exit 0
"#;

    fn write_config(dir: &Path, pass_all: bool) {
        let env = if pass_all {
            "\n[tool.env]\nFLEET_PASS_ALL = \"1\"\n"
        } else {
            ""
        };
        let config = format!(
            "[fleetrun]\noutput_dir = \"{}\"\n\n[tool]\ncommand = \"sh {}\"\n{}",
            dir.join("runs").display(),
            dir.join("fake_tool.sh").display(),
            env
        );
        fs::write(dir.join("fleetrun.toml"), config).unwrap();
    }

    fn calls(dir: &Path) -> Vec<String> {
        fs::read_to_string(dir.join("calls.txt"))
            .unwrap_or_default()
            .lines()
            .map(str::to_string)
            .collect()
    }

    fn run_id(dir: &Path) -> String {
        let name = fs::read_dir(dir.join("runs"))
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .find(|n| n.ends_with("_data.json"))
            .unwrap();
        name.trim_end_matches("_data.json").to_string()
    }

    #[test]
    fn run_then_resume_reruns_only_failures() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("fake_tool.sh"), FAKE_TOOL).unwrap();
        write_suite(dir.path(), &["ok_test.py", "fail_test.py"]);
        write_config(dir.path(), false);

        fleetrun(dir.path())
            .args(["run", "suite", "-d", "A", "-d", "B"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("Some tasks failed."));

        let id = run_id(dir.path());
        let runs = dir.path().join("runs");
        assert!(runs.join(format!("{}_junit.xml", id)).is_file());
        assert!(runs.join(format!("{}_logs", id)).join("A_fail_test").join("log.html").is_file());
        assert_eq!(calls(dir.path()).iter().filter(|c| c.starts_with("run ")).count(), 2);

        fs::remove_file(dir.path().join("calls.txt")).unwrap();
        write_config(dir.path(), true);

        fleetrun(dir.path())
            .args(["run", "suite", "-d", "A", "-d", "B", "--resume"])
            .arg(format!("{}_data.json", id))
            .assert()
            .success()
            .stdout(predicate::str::contains("All tasks passed!"));

        let reruns: Vec<_> = calls(dir.path())
            .into_iter()
            .filter(|c| c.starts_with("run "))
            .collect();
        assert_eq!(reruns.len(), 1);
        assert!(reruns[0].ends_with("fail_test.py"));

        let state: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(runs.join(format!("{}_data.json", id))).unwrap())
                .unwrap();
        assert_eq!(state["tests"]["A_fail_test"]["status"], 0);
        assert_eq!(state["tests"]["B_ok_test"]["status"], 0);
    }
}
