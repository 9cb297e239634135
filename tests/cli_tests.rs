//! Integration tests for CLI execution using `assert_cmd`.
//!
//! These tests invoke the compiled binary inside temporary projects and check
//! stdout, exit codes, and the state directory.

use anyhow::{Context, Result, ensure};
use assert_cmd::Command;
use camino::Utf8PathBuf;
use predicates::prelude::*;
use std::fs;
use tempfile::{TempDir, tempdir};

fn project(manifest: &str) -> Result<(TempDir, Utf8PathBuf)> {
    let temp = tempdir().context("create temp dir")?;
    let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).context("utf8 temp dir")?;
    fs::copy(format!("tests/data/{manifest}"), root.join("Pipeline.yml"))
        .with_context(|| format!("copy {manifest}"))?;
    Ok((temp, root))
}

fn polyflow(root: &Utf8PathBuf) -> Result<Command> {
    let mut cmd = Command::cargo_bin("polyflow").context("locate polyflow binary")?;
    cmd.current_dir(root)
        .env_remove("POLYFLOW_CONFIG_PATH")
        .env_remove("POLYFLOW_JOBS")
        .env_remove("POLYFLOW_STATE_DIR")
        .arg("--progress")
        .arg("false");
    Ok(cmd)
}

#[test]
fn build_is_the_default_command() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    polyflow(&root)?
        .assert()
        .success()
        .stdout(predicate::str::contains("c\trebuilt"))
        .stdout(predicate::str::contains(": complete"));
    ensure!(
        root.join(".polyflow/store").is_dir(),
        "build should create the artifact store"
    );
    polyflow(&root)?
        .arg("build")
        .assert()
        .success()
        .stdout(predicate::str::contains("c\treused"));
    Ok(())
}

#[test]
fn read_and_load_print_artifacts() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    polyflow(&root)?.arg("build").assert().success();
    polyflow(&root)?
        .args(["read", "c"])
        .assert()
        .success()
        .stdout("12\n");
    polyflow(&root)?
        .args(["load", "b", "--language", "shell"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2"));
    polyflow(&root)?
        .args(["read", "b", "-o", "b.json"])
        .assert()
        .success();
    let written = fs::read_to_string(root.join("b.json")).context("read output")?;
    ensure!(written == "[2,4,6]", "unexpected artifact bytes: {written}");
    Ok(())
}

#[test]
fn failed_builds_exit_non_zero_and_are_logged() -> Result<()> {
    let (_temp, root) = project("broken.yml")?;
    polyflow(&root)?
        .assert()
        .failure()
        .stdout(predicate::str::contains("a\tfailed"))
        .stdout(predicate::str::contains("b\tblocked"))
        .stderr(predicate::str::contains("build failed"));
    polyflow(&root)?
        .arg("log")
        .assert()
        .success()
        .stdout(predicate::str::contains("failed"));
    Ok(())
}

#[test]
fn graph_and_trace_need_no_state() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    polyflow(&root)?
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::starts_with("digraph"));
    polyflow(&root)?
        .args(["trace", "b"])
        .assert()
        .success()
        .stdout("b\n  ancestors: a\n  descendants: c\n");
    ensure!(
        !root.join(".polyflow").exists(),
        "graph and trace should not open the state directory"
    );
    Ok(())
}

#[test]
fn plan_only_writes_plan_without_building() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    polyflow(&root)?
        .args(["build", "--plan-only"])
        .assert()
        .success()
        .stdout(predicate::str::contains("plan: 3 pending, 0 cached"));
    let plan = fs::read_to_string(root.join(".polyflow/plan.json")).context("read plan")?;
    ensure!(plan.contains("\"pending\""), "plan should list pending nodes");
    polyflow(&root)?
        .arg("log")
        .assert()
        .success()
        .stdout("no builds recorded\n");
    Ok(())
}

#[test]
fn export_and_gc_operate_on_history() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    polyflow(&root)?.assert().success();
    polyflow(&root)?
        .args(["export", "out"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(4 files)"));
    ensure!(root.join("out/c.json").is_file(), "export should write c.json");
    polyflow(&root)?
        .args(["gc", "--dry-run"])
        .assert()
        .success()
        .stdout("would remove 0 build(s) and 0 artifact(s); 3 artifact(s) retained\n");
    Ok(())
}

#[test]
fn state_dir_and_jobs_come_from_config() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    fs::write(root.join("polyflow.yml"), "jobs: 2\nstate_dir: cache\n").context("write config")?;
    polyflow(&root)?.assert().success();
    ensure!(root.join("cache/logs").is_dir(), "config state_dir should be used");
    polyflow(&root)?
        .args(["--state-dir", "elsewhere", "log"])
        .assert()
        .success()
        .stdout("no builds recorded\n");
    Ok(())
}

#[test]
fn config_path_and_jobs_come_from_the_environment() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    let custom = root.join("custom.yml");
    fs::write(&custom, "state_dir: from-env\n").context("write config")?;
    polyflow(&root)?
        .env("POLYFLOW_CONFIG_PATH", &custom)
        .assert()
        .success();
    ensure!(
        root.join("from-env/logs").is_dir(),
        "POLYFLOW_CONFIG_PATH should select the configuration file"
    );
    polyflow(&root)?
        .env("POLYFLOW_JOBS", "0")
        .assert()
        .failure()
        .stderr(predicate::str::contains("jobs must be between 1 and 64, got 0"));
    Ok(())
}

#[test]
fn reserved_input_names_are_rejected_before_building() -> Result<()> {
    let (_temp, root) = project("reserved.yml")?;
    polyflow(&root)?
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "cannot bind input 'PATH': the name is reserved in shell",
        ));
    ensure!(
        !root.join(".polyflow/logs").read_dir().is_ok_and(|mut entries| entries.next().is_some()),
        "no build should be recorded"
    );
    Ok(())
}

#[test]
fn missing_manifest_is_reported() -> Result<()> {
    let temp = tempdir().context("create temp dir")?;
    let root = Utf8PathBuf::try_from(temp.path().to_path_buf()).context("utf8 temp dir")?;
    polyflow(&root)?
        .arg("inspect")
        .assert()
        .failure()
        .stderr(predicate::str::contains("no Pipeline.yml found"));
    Ok(())
}

#[test]
fn invalid_job_counts_are_rejected() -> Result<()> {
    let (_temp, root) = project("doubling.yml")?;
    polyflow(&root)?
        .args(["-j", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("jobs must be between 1 and 64"));
    Ok(())
}

#[cfg(unix)]
#[test]
fn shell_derivations_read_upstream_files() -> Result<()> {
    let (_temp, root) = project("shell.yml")?;
    polyflow(&root)?.assert().success();
    polyflow(&root)?
        .args(["read", "echoed"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("got:"));
    Ok(())
}
