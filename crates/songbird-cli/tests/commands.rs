use std::fs;
use std::path::Path;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use songbird_core::lock::CheckpointLock;
use tempfile::TempDir;

fn bin() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_songbird-checkpoint"));
    // Keep a developer's global config out of the way.
    command.env("SONGBIRD_HOME", env!("CARGO_TARGET_TMPDIR"));
    command.env_remove("SONGBIRD_LOG").env_remove("RUST_LOG");
    command
}

fn run(args: &[&str]) -> Output {
    bin().args(args).output().expect("run songbird-checkpoint")
}

fn stdout(output: &Output) -> String {
    String::from_utf8(output.stdout.clone()).expect("utf8 stdout")
}

fn stderr(output: &Output) -> String {
    String::from_utf8(output.stderr.clone()).expect("utf8 stderr")
}

fn diagnostic_lines(output: &Output) -> Vec<String> {
    stderr(output)
        .lines()
        .filter(|line| line.starts_with("error:"))
        .map(str::to_string)
        .collect()
}

fn path_str(path: &Path) -> &str {
    path.to_str().expect("utf8 path")
}

fn register(checkpoint: &str, subject: &str, variant: &str, source: &str) -> String {
    let output = run(&[
        "register",
        checkpoint,
        subject,
        variant,
        source,
        &format!("out/{}", source),
    ]);
    assert!(output.status.success());
    stdout(&output).trim().to_string()
}

#[test]
fn init_creates_empty_checkpoint() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("runs").join("session.json");

    let output = run(&["init", path_str(&checkpoint)]);
    assert!(output.status.success());
    assert!(stdout(&output).contains("Checkpoint initialized"));

    let data: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&checkpoint).expect("read")).expect("json");
    assert_eq!(data["metadata"]["version"], "2.0");
    assert_eq!(data["tasks"].as_array().expect("tasks").len(), 0);
}

#[test]
fn register_complete_and_check_round_trip() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint = path_str(&checkpoint);

    let before = run(&["is_completed", checkpoint, "spk01", "ModeA", "clip1.wav"]);
    assert_eq!(before.status.code(), Some(1));
    assert_eq!(stdout(&before).trim(), "false");

    let id = register(checkpoint, "spk01", "ModeA", "clip1.wav");
    assert_eq!(id.len(), 12);

    let predicted = run(&["task_id", "spk01", "ModeA", "clip1.wav"]);
    assert_eq!(stdout(&predicted).trim(), id);

    assert!(run(&["start", checkpoint, &id]).status.success());
    let still_running = run(&["is_completed", checkpoint, "spk01", "ModeA", "clip1.wav"]);
    assert_eq!(still_running.status.code(), Some(1));

    let complete = run(&[
        "complete",
        checkpoint,
        &id,
        "--validation",
        r#"{"is_valid": true, "duration": 10.1}"#,
    ]);
    assert!(complete.status.success());

    let after = run(&["is_completed", checkpoint, "spk01", "ModeA", "clip1.wav"]);
    assert_eq!(after.status.code(), Some(0));
    assert_eq!(stdout(&after).trim(), "true");

    let show = run(&["show", checkpoint, "spk01", "ModeA", "clip1.wav"]);
    assert!(show.status.success());
    let task: serde_json::Value = serde_json::from_str(&stdout(&show)).expect("json");
    assert_eq!(task["task_id"], id.as_str());
    assert_eq!(task["status"], "COMPLETED");
    assert_eq!(task["validation_result"]["is_valid"], true);
}

#[test]
fn unknown_task_id_exits_one() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint = path_str(&checkpoint);

    assert_eq!(run(&["complete", checkpoint, "ffffffffffff"]).status.code(), Some(1));
    assert_eq!(run(&["fail", checkpoint, "ffffffffffff"]).status.code(), Some(1));
    assert_eq!(run(&["skip", checkpoint, "ffffffffffff"]).status.code(), Some(1));
    assert!(!Path::new(checkpoint).exists());
}

#[test]
fn fail_records_message_and_reset_clears_it() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint = path_str(&checkpoint);

    let done = register(checkpoint, "spk01", "ModeA", "a.wav");
    let failed = register(checkpoint, "spk01", "ModeA", "b.wav");
    let defaulted = register(checkpoint, "spk01", "ModeA", "c.wav");
    assert!(run(&["complete", checkpoint, &done]).status.success());
    assert!(run(&["fail", checkpoint, &failed, "device disconnected"])
        .status
        .success());
    assert!(run(&["fail", checkpoint, &defaulted]).status.success());

    let listed = stdout(&run(&["failed", checkpoint]));
    let lines: Vec<&str> = listed.lines().collect();
    assert_eq!(
        lines,
        vec![
            format!("{}|spk01|ModeA|b.wav|device disconnected", failed),
            format!("{}|spk01|ModeA|c.wav|Unknown error", defaulted),
        ]
    );

    let reset = run(&["reset_failed", checkpoint]);
    assert!(reset.status.success());
    assert_eq!(stdout(&reset).trim(), "2");
    assert!(stdout(&run(&["failed", checkpoint])).trim().is_empty());
    assert_eq!(
        run(&["is_completed", checkpoint, "spk01", "ModeA", "a.wav"])
            .status
            .code(),
        Some(0)
    );
}

#[test]
fn summary_prints_json_counts() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint = path_str(&checkpoint);

    let ids: Vec<String> = ["1.wav", "2.wav", "3.wav", "4.wav", "5.wav"]
        .iter()
        .map(|name| register(checkpoint, "spk01", "ModeA", name))
        .collect();
    for id in &ids[..3] {
        assert!(run(&["complete", checkpoint, id]).status.success());
    }
    assert!(run(&["fail", checkpoint, &ids[3], "clipped"]).status.success());

    let output = run(&["summary", checkpoint]);
    assert!(output.status.success());
    let summary: serde_json::Value = serde_json::from_str(&stdout(&output)).expect("json");
    assert_eq!(summary["total_tasks"], 5);
    assert_eq!(summary["completion_rate"], 60.0);
    assert_eq!(summary["status_counts"]["COMPLETED"], 3);
    assert_eq!(summary["status_counts"]["FAILED"], 1);
    assert_eq!(summary["status_counts"]["PENDING"], 1);
    assert_eq!(summary["status_counts"]["SKIPPED"], 0);
    assert_eq!(summary["status_counts"]["IN_PROGRESS"], 0);
    assert!(summary["session_created"].is_string());

    let text = run(&["summary", checkpoint, "--text"]);
    assert!(stdout(&text).contains("Completion: 60.0%"));
}

#[test]
fn export_legacy_writes_pipe_delimited_lines() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let legacy = temp.path().join("progress.txt");
    let checkpoint = path_str(&checkpoint);

    let id = register(checkpoint, "spk01", "ModeA", "clip1.wav");
    assert!(run(&["complete", checkpoint, &id]).status.success());

    let output = run(&["export_legacy", checkpoint, path_str(&legacy)]);
    assert!(output.status.success());

    let content = fs::read_to_string(&legacy).expect("read legacy");
    let header: Vec<&str> = content.lines().filter(|l| l.starts_with('#')).collect();
    assert_eq!(header.len(), 3);
    assert_eq!(
        header[2],
        "# Format: speaker|mode_name|source_filename|output_path|status|timestamp"
    );
    let data: Vec<&str> = content.lines().filter(|l| !l.starts_with('#')).collect();
    assert_eq!(data.len(), 1);
    assert!(data[0].starts_with("spk01|ModeA|clip1.wav|out/clip1.wav|COMPLETED|"));
}

#[test]
fn export_legacy_reports_io_failure() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, "").expect("write");
    let checkpoint = path_str(&checkpoint);
    register(checkpoint, "spk01", "ModeA", "clip1.wav");

    let output = run(&[
        "export_legacy",
        checkpoint,
        path_str(&blocker.join("progress.txt")),
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(diagnostic_lines(&output).len(), 1);
    assert!(stderr(&output).contains("error exporting legacy format"));
}

#[test]
fn register_save_failure_exits_one_with_single_diagnostic() {
    let temp = TempDir::new().expect("tempdir");
    let blocker = temp.path().join("blocker");
    fs::write(&blocker, "").expect("write");
    let checkpoint = blocker.join("session.json");

    let output = run(&[
        "register",
        path_str(&checkpoint),
        "spk01",
        "ModeA",
        "clip1.wav",
        "out/clip1.wav",
    ]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(stdout(&output), "");
    assert_eq!(diagnostic_lines(&output).len(), 1);
    assert!(stderr(&output).contains("error saving checkpoint"));
    assert_eq!(fs::read_to_string(&blocker).expect("read"), "");
}

#[test]
fn complete_save_failure_leaves_checkpoint_unchanged() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint_str = path_str(&checkpoint);
    let id = register(checkpoint_str, "spk01", "ModeA", "clip1.wav");
    let saved = fs::read_to_string(&checkpoint).expect("read");

    // A directory in the way of the staging file makes the next save fail.
    fs::create_dir(temp.path().join("session.json.tmp")).expect("mkdir");
    let output = run(&["complete", checkpoint_str, &id]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(diagnostic_lines(&output).len(), 1);
    assert_eq!(fs::read_to_string(&checkpoint).expect("read"), saved);
    assert_eq!(
        run(&["is_completed", checkpoint_str, "spk01", "ModeA", "clip1.wav"])
            .status
            .code(),
        Some(1)
    );
}

#[test]
fn keep_existing_register_preserves_completed_task() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint = path_str(&checkpoint);

    let id = register(checkpoint, "spk01", "ModeA", "clip1.wav");
    assert!(run(&["complete", checkpoint, &id]).status.success());

    let kept = run(&[
        "register",
        checkpoint,
        "spk01",
        "ModeA",
        "clip1.wav",
        "elsewhere.wav",
        "--keep-existing",
    ]);
    assert!(kept.status.success());
    assert_eq!(stdout(&kept).trim(), id);
    assert_eq!(
        run(&["is_completed", checkpoint, "spk01", "ModeA", "clip1.wav"])
            .status
            .code(),
        Some(0)
    );

    // Default policy replaces and resets to PENDING.
    register(checkpoint, "spk01", "ModeA", "clip1.wav");
    assert_eq!(
        run(&["is_completed", checkpoint, "spk01", "ModeA", "clip1.wav"])
            .status
            .code(),
        Some(1)
    );
}

#[test]
fn project_config_selects_register_policy() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    fs::write(
        temp.path().join("songbird.toml"),
        "register_policy = \"keep_existing\"\n",
    )
    .expect("config");
    let checkpoint = path_str(&checkpoint);

    let id = register(checkpoint, "spk01", "ModeA", "clip1.wav");
    assert!(run(&["fail", checkpoint, &id, "clipped"]).status.success());
    register(checkpoint, "spk01", "ModeA", "clip1.wav");

    let listed = stdout(&run(&["failed", checkpoint]));
    assert!(listed.contains("clipped"));
}

#[test]
fn unparseable_project_config_is_reported_and_skipped() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    fs::write(temp.path().join("songbird.toml"), "strict_laod = true\n").expect("config");

    let output = run(&["summary", path_str(&checkpoint)]);
    assert!(output.status.success());
    let logged = stderr(&output);
    assert!(logged.contains("ignoring config file"));
    assert!(logged.contains("songbird.toml"));
}

#[test]
fn malformed_checkpoint_is_lenient_by_default_and_fatal_when_strict() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    fs::write(&checkpoint, "{\"tasks\": [").expect("write");
    let checkpoint_str = path_str(&checkpoint);

    let strict = run(&["--strict", "summary", checkpoint_str]);
    assert_eq!(strict.status.code(), Some(1));
    assert_eq!(
        fs::read_to_string(&checkpoint).expect("read"),
        "{\"tasks\": ["
    );

    let lenient = run(&["summary", checkpoint_str]);
    assert!(lenient.status.success());
    assert!(stderr(&lenient).contains("could not load checkpoint"));
    let summary: serde_json::Value = serde_json::from_str(&stdout(&lenient)).expect("json");
    assert_eq!(summary["total_tasks"], 0);

    assert!(run(&["init", checkpoint_str]).status.success());
    let backup = temp.path().join("session.json.corrupt");
    assert_eq!(fs::read_to_string(backup).expect("backup"), "{\"tasks\": [");
}

#[test]
fn invalid_validation_json_is_rejected_without_mutation() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint = path_str(&checkpoint);
    let id = register(checkpoint, "spk01", "ModeA", "clip1.wav");

    let output = run(&["complete", checkpoint, &id, "--validation", "{not json"]);
    assert_eq!(output.status.code(), Some(1));
    assert_eq!(
        run(&["is_completed", checkpoint, "spk01", "ModeA", "clip1.wav"])
            .status
            .code(),
        Some(1)
    );
}

#[test]
fn locked_invocations_still_work_sequentially() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let checkpoint_str = path_str(&checkpoint);

    let output = run(&[
        "--lock",
        "register",
        checkpoint_str,
        "spk01",
        "ModeA",
        "clip1.wav",
        "out/clip1.wav",
    ]);
    assert!(output.status.success());
    let id = stdout(&output).trim().to_string();
    assert!(run(&["complete", "--lock", checkpoint_str, &id]).status.success());
    assert!(temp.path().join("session.json.lock").exists());
    assert_eq!(
        run(&["is_completed", checkpoint_str, "spk01", "ModeA", "clip1.wav"])
            .status
            .code(),
        Some(0)
    );
}

#[test]
fn locked_invocation_waits_for_current_holder() {
    let temp = TempDir::new().expect("tempdir");
    let checkpoint = temp.path().join("session.json");
    let held = CheckpointLock::acquire(&checkpoint).expect("acquire");

    let mut child = bin()
        .args([
            "--lock",
            "register",
            path_str(&checkpoint),
            "spk01",
            "ModeA",
            "clip1.wav",
            "out/clip1.wav",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn");
    thread::sleep(Duration::from_millis(300));
    assert!(child.try_wait().expect("poll").is_none());
    assert!(!checkpoint.exists());

    drop(held);
    let output = child.wait_with_output().expect("wait");
    assert!(output.status.success());
    assert!(stderr(&output).contains("checkpoint is locked by another invocation"));
    assert!(checkpoint.is_file());
}

#[test]
fn unknown_command_prints_usage_to_stdout() {
    let output = run(&["frobnicate", "session.json"]);
    assert_ne!(output.status.code(), Some(0));
    let text = stdout(&output);
    assert!(text.contains("Usage"));
    assert!(text.contains("is_completed"));
}
