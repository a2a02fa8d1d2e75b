//! CLI integration tests for the coordinator binary.

use std::process::{Command, Output};

fn run(args: &[&str]) -> Output {
    let bin = env!("CARGO_BIN_EXE_driver_fleet");
    Command::new(bin)
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run driver_fleet")
}

// Unique per test process so parallel runs never share a task channel.
fn task_channel(tag: &str) -> String {
    format!("/driver_fleet_cli_{}_{tag}", std::process::id())
}

fn summary_value<'a>(stdout: &'a str, key: &str) -> &'a str {
    stdout
        .lines()
        .flat_map(str::split_whitespace)
        .find_map(|field| field.strip_prefix(key)?.strip_prefix('='))
        .unwrap_or_else(|| panic!("{key} missing from summary:\n{stdout}"))
}

#[test]
fn zero_drivers_is_a_usage_error() {
    let output = run(&["0", "10"]);
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Usage"), "usage missing from stderr: {stderr}");
    assert!(output.stdout.is_empty());
}

#[test]
fn missing_or_short_duration_is_rejected() {
    assert_eq!(run(&["3"]).status.code(), Some(2));
    assert_eq!(run(&["3", "4"]).status.code(), Some(2));
    assert_eq!(run(&["three", "10"]).status.code(), Some(2));
}

#[test]
fn thread_backend_runs_to_completion() {
    let channel = task_channel("thread");
    let output = run(&[
        "2", "5", "--backend", "thread", "--speedup", "50", "--seed", "7", "--task-channel", &channel,
    ]);
    assert!(
        output.status.success(),
        "thread run exited with {:?}: {}",
        output.status,
        String::from_utf8_lossy(&output.stderr)
    );

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Driver 1 starts at"));
    assert!(stdout.contains("Driver 2 starts at"));
    assert_eq!(stdout.matches("timed out").count(), 2);
    assert!(stdout.contains("Coordinator: no new tasks available."));
    assert!(stdout.contains("FLEET SUMMARY"));
    assert_eq!(summary_value(&stdout, "failed_drivers"), "[]");

    // Every emitted task was driven and reported back.
    let emitted = summary_value(&stdout, "tasks_emitted");
    assert_ne!(emitted, "0");
    assert_eq!(summary_value(&stdout, "results_received"), emitted);
    assert_eq!(
        stdout.lines().filter(|line| line.starts_with("The driver ")).count(),
        emitted.parse::<usize>().expect("tasks_emitted is a number")
    );
    assert!(stdout.contains("Coordinator: terminating."));
}

#[test]
fn silent_drivers_report_nothing() {
    let channel = task_channel("silent");
    let output = run(&[
        "2", "5", "--backend", "thread", "--no-report", "--speedup", "50", "--task-channel", &channel,
    ]);
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(summary_value(&stdout, "results_received"), "0");
    assert!(!stdout.contains("drove a distance of"));
    assert!(stdout.contains("is taking a client from"));
}

#[cfg(target_os = "linux")]
#[test]
fn process_backend_runs_drivers_as_children() {
    let channel = task_channel("process");
    let output = run(&["2", "5", "--speedup", "50", "--task-channel", &channel]);
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // Sandboxes without /dev/mqueue cannot host the process backend.
        if stderr.contains("failed to open") {
            eprintln!("skipping: POSIX message queues unavailable: {stderr}");
            return;
        }
        panic!("process run exited with {:?}: {stderr}", output.status);
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(stdout.matches("starts at").count(), 2);
    assert_eq!(stdout.matches("timed out").count(), 2);
    assert!(stdout.contains("FLEET SUMMARY"));
    assert_eq!(summary_value(&stdout, "failed_drivers"), "[]");
    assert_eq!(
        summary_value(&stdout, "results_received"),
        summary_value(&stdout, "tasks_emitted")
    );
}
