//! Runs the built binary with an unsupported provider so startup logs are
//! written and the process exits early.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

const STARTUP_EVENT: &str = "loaded runtime configuration";

struct Run {
    success: bool,
    stderr: String,
}

fn run_cli(log_output: &str, log_format: &str, log_file_path: Option<&Path>) -> Run {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_cipriano"));
    cmd.arg("what time is it?")
        .env("MODEL_PROVIDER", "invalid")
        .env("RUST_LOG", "cipriano=info")
        .env("LOG_OUTPUT", log_output)
        .env("LOG_FORMAT", log_format)
        .env_remove("BIND_ADDR");
    match log_file_path {
        Some(path) => cmd.env("LOG_FILE_PATH", path),
        None => cmd.env_remove("LOG_FILE_PATH"),
    };

    let output = cmd.output().expect("failed to run cipriano binary");
    Run {
        success: output.status.success(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}

struct TempDir(PathBuf);

impl TempDir {
    fn new(label: &str) -> Self {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock should be after unix epoch")
            .as_nanos();
        let dir = std::env::temp_dir().join(format!(
            "cipriano-logging-{label}-{stamp}-{}",
            std::process::id()
        ));
        fs::create_dir_all(&dir).expect("failed to create temp directory");
        Self(dir)
    }

    /// Contents of the newest daily file rotated from `base_name`.
    fn rotated_log(&self, base_name: &str) -> String {
        let prefix = format!("{base_name}.");
        let newest = fs::read_dir(&self.0)
            .expect("failed to read temp directory")
            .filter_map(|entry| entry.ok().map(|entry| entry.path()))
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(&prefix))
            })
            .max()
            .expect("expected a rotated log file to be created");
        fs::read_to_string(newest).expect("failed to read rotated log file")
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn unsupported_provider_fails_startup() {
    let run = run_cli("stderr", "pretty", None);

    assert!(!run.success, "invalid provider should fail the command");
    assert!(
        run.stderr.contains("Unsupported MODEL_PROVIDER='invalid'"),
        "expected provider error on stderr:\n{}",
        run.stderr
    );
    assert!(run.stderr.contains(STARTUP_EVENT), "stderr:\n{}", run.stderr);
}

#[test]
fn json_format_emits_structured_startup_event() {
    let run = run_cli("stderr", "json", None);

    let events: Vec<Value> = run
        .stderr
        .lines()
        .filter(|line| line.trim_start().starts_with('{'))
        .map(|line| serde_json::from_str(line).expect("log line should be valid JSON"))
        .collect();
    let startup = events
        .iter()
        .find(|event| event["fields"]["message"] == STARTUP_EVENT)
        .unwrap_or_else(|| panic!("no startup event in stderr:\n{}", run.stderr));

    assert_eq!(startup["fields"]["provider"], "invalid");
    assert_eq!(startup["fields"]["max_iterations"], 6);
}

#[test]
fn file_output_keeps_logs_off_stderr() {
    let dir = TempDir::new("file");
    let run = run_cli("file", "pretty", Some(&dir.0.join("cipriano.log")));

    assert!(dir.rotated_log("cipriano.log").contains(STARTUP_EVENT));
    assert!(
        !run.stderr.contains(STARTUP_EVENT),
        "file-only mode should not log to stderr:\n{}",
        run.stderr
    );
    assert!(run.stderr.contains("Unsupported MODEL_PROVIDER"), "stderr:\n{}", run.stderr);
}

#[test]
fn both_output_writes_stderr_and_file() {
    let dir = TempDir::new("both");
    let run = run_cli("both", "pretty", Some(&dir.0.join("cipriano.log")));

    assert!(dir.rotated_log("cipriano.log").contains(STARTUP_EVENT));
    assert!(run.stderr.contains(STARTUP_EVENT), "stderr:\n{}", run.stderr);
}

#[test]
fn unusable_log_directory_falls_back_to_stderr() {
    let dir = TempDir::new("fallback");
    let blocking_file = dir.0.join("not-a-directory");
    fs::write(&blocking_file, "block").expect("failed to create blocking file");

    let run = run_cli("file", "pretty", Some(&blocking_file.join("cipriano.log")));

    for expected in [
        "failed to initialize LOG_OUTPUT=file",
        "using stderr instead",
        STARTUP_EVENT,
    ] {
        assert!(
            run.stderr.contains(expected),
            "expected '{expected}' on stderr:\n{}",
            run.stderr
        );
    }
}
