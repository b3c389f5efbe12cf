use std::path::Path;

use anyhow::Result;
use predicates::prelude::*;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn execbridge_command(home: &Path) -> Result<assert_cmd::Command> {
    let mut cmd = assert_cmd::Command::cargo_bin("execbridge")?;
    cmd.env("EXECBRIDGE_HOME", home);
    Ok(cmd)
}

#[test]
fn run_streams_stdout_and_stderr() -> Result<()> {
    let home = TempDir::new()?;
    let output = execbridge_command(home.path())?
        .args(["run", "--", "echo out; echo err >&2"])
        .output()?;
    assert!(output.status.success());
    assert_eq!(String::from_utf8(output.stdout)?, "out\n");
    assert!(String::from_utf8(output.stderr)?.contains("err"));
    Ok(())
}

#[test]
fn run_exits_with_child_code() -> Result<()> {
    let home = TempDir::new()?;
    execbridge_command(home.path())?.args(["run", "--", "exit 3"]).assert().code(3);
    Ok(())
}

#[test]
fn run_honours_working_directory() -> Result<()> {
    let home = TempDir::new()?;
    let work = TempDir::new()?;
    std::fs::write(work.path().join("marker.txt"), "")?;
    execbridge_command(home.path())?
        .args(["run", "--cwd"])
        .arg(work.path())
        .args(["--", "ls"])
        .assert()
        .success()
        .stdout(predicate::str::contains("marker.txt"));
    Ok(())
}

#[test]
fn run_reports_missing_shell() -> Result<()> {
    let home = TempDir::new()?;
    std::fs::write(home.path().join("config.toml"), "shell = \"/nonexistent/sh\"\n")?;
    execbridge_command(home.path())?
        .args(["run", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to start command"));
    Ok(())
}

#[test]
fn malformed_config_is_rejected() -> Result<()> {
    let home = TempDir::new()?;
    let config = home.path().join("broken.toml");
    std::fs::write(&config, "interrupt_timeout_ms = \"soon\"\n")?;
    execbridge_command(home.path())?
        .arg("--config")
        .arg(&config)
        .args(["run", "--", "true"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
    Ok(())
}

#[test]
fn grep_groups_matches_by_file() -> Result<()> {
    let home = TempDir::new()?;
    let tree = TempDir::new()?;
    std::fs::write(tree.path().join("notes.txt"), "first\nneedle here\nlast\n")?;
    std::fs::create_dir(tree.path().join("skipped"))?;
    std::fs::write(tree.path().join("skipped").join("other.txt"), "needle too\n")?;

    execbridge_command(home.path())?
        .args(["grep", "--exclude-dir", "skipped", "needle"])
        .arg(tree.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("notes.txt"))
        .stdout(predicate::str::contains("     2: needle here"))
        .stdout(predicate::str::contains("other.txt").not());
    Ok(())
}

#[test]
fn grep_without_matches_exits_one() -> Result<()> {
    let home = TempDir::new()?;
    let tree = TempDir::new()?;
    std::fs::write(tree.path().join("notes.txt"), "nothing to see\n")?;
    execbridge_command(home.path())?
        .args(["grep", "absent"])
        .arg(tree.path())
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
    Ok(())
}

#[test]
fn pty_runs_program_on_a_terminal() -> Result<()> {
    let home = TempDir::new()?;
    execbridge_command(home.path())?
        .args(["pty", "--", "/bin/sh", "-c", "test -t 1 && echo on-a-tty"])
        .write_stdin("")
        .assert()
        .success()
        .stdout(predicate::str::contains("on-a-tty"));
    Ok(())
}
