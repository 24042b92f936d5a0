//! CLI end-to-end tests
//!
//! Runs the `distfork` binary against a local worker rooted in a temp dir.

#![cfg(unix)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

struct Setup {
    dir: tempfile::TempDir,
    config: PathBuf,
}

impl Setup {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("workspaces");
        let config = dir.path().join("config.toml");
        fs::write(
            &config,
            format!(
                "[worker]\nname = \"local-1\"\nroot = \"{}\"\nlabels = [\"linux\"]\npoll_interval_ms = 10\n\n[logging]\nfilter = \"warn\"\n",
                root.display()
            ),
        )
        .unwrap();
        Self { dir, config }
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }

    fn run(&self, args: &[&str]) -> Output {
        Command::new(env!("CARGO_BIN_EXE_distfork"))
            .arg("run")
            .arg("--config")
            .arg(&self.config)
            .args(args)
            .env_remove("RUST_LOG")
            .output()
            .unwrap()
    }

    fn workspaces_left(&self) -> usize {
        fs::read_dir(self.path().join("workspaces"))
            .map(|entries| entries.count())
            .unwrap_or(0)
    }
}

// =============================================================================
// Exit status and output
// =============================================================================

#[test]
fn test_exit_status_is_forwarded() {
    let setup = Setup::new();
    let output = setup.run(&["--", "/bin/sh", "-c", "echo out; echo err >&2; exit 3"]);

    assert_eq!(output.status.code(), Some(3));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Executing on local-1\nout\n");
    assert!(String::from_utf8_lossy(&output.stderr).contains("err\n"));
    assert_eq!(setup.workspaces_left(), 0);
}

#[test]
fn test_env_and_json_result() {
    let setup = Setup::new();
    let output = setup.run(&["-e", "WHO=world", "--json", "--", "/bin/sh", "-c", "echo hello $WHO"]);

    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains("hello world\n"));
    let stderr = String::from_utf8_lossy(&output.stderr);
    let json_line = stderr.lines().last().unwrap();
    let result: serde_json::Value = serde_json::from_str(json_line).unwrap();
    assert_eq!(result["exit_code"], 0);
    assert_eq!(result["outcome"], "SUCCEEDED");
}

// =============================================================================
// Files in and out
// =============================================================================

#[test]
fn test_input_and_return_files() {
    let setup = Setup::new();
    let input = setup.path().join("numbers.txt");
    fs::write(&input, "1\n2\n3\n").unwrap();
    let result = setup.path().join("count.txt");

    let output = setup.run(&[
        "-f",
        &format!("data/numbers.txt={}", input.display()),
        "-F",
        &format!("{}=count.txt", result.display()),
        "--",
        "/bin/sh",
        "-c",
        "wc -l < data/numbers.txt > count.txt",
    ]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(fs::read_to_string(&result).unwrap().trim(), "3");
    assert!(String::from_utf8_lossy(&output.stderr).contains("Copying back files"));
}

// =============================================================================
// Rejections
// =============================================================================

#[test]
fn test_unknown_label_is_rejected() {
    let setup = Setup::new();
    let output = setup.run(&["-l", "gpu", "--", "true"]);

    assert_eq!(output.status.code(), Some(255));
    assert!(String::from_utf8_lossy(&output.stderr).contains("No such label: gpu\n"));
    assert!(output.stdout.is_empty());
    assert_eq!(setup.workspaces_left(), 0);
}

#[test]
fn test_failed_launch_reports_incomplete() {
    let setup = Setup::new();
    let output = setup.run(&["--", "/definitely/not/here"]);

    assert_eq!(output.status.code(), Some(255));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("ERROR: Failed to execute a process"));
}

#[test]
fn test_missing_config_file_fails() {
    let output = Command::new(env!("CARGO_BIN_EXE_distfork"))
        .args(["run", "--config", "/nonexistent/distfork.toml", "--", "true"])
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(255));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Error loading config"));
}
