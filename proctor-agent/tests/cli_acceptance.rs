use proctor_core::{Config, LogQueue, LogType, PayloadCodec};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    fn db_path(&self) -> PathBuf {
        self.xdg_data.join("proctor-sync/queue.db")
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("proctor-sync");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }
}

fn run_agent(env: &CliTestEnv, args: &[&str]) -> Output {
    let bin_path = PathBuf::from(assert_cmd::cargo::cargo_bin!("proctor-agent"));

    Command::new(bin_path)
        .args(args)
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute proctor-agent: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "proctor-agent {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

#[test]
fn enqueue_persists_encrypted_entries() {
    let env = CliTestEnv::new();

    let args = [
        "enqueue",
        "submission-42",
        "keystroke",
        "--data",
        r#"{"key":"q","loggedAt":"2026-01-01T10:00:00Z"}"#,
    ];
    let output = run_agent(&env, &args);
    assert_success(&args, &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Queued KEYSTROKE entry"));

    let args = [
        "enqueue",
        "submission-42",
        "FOCUS_CHANGE",
        "--data",
        r#"{"duration":1200,"loggedAt":"2026-01-01T10:00:05Z"}"#,
    ];
    let output = run_agent(&env, &args);
    assert_success(&args, &output);

    let db_path = env.db_path();
    assert!(
        db_path.exists(),
        "queue file should exist at {}",
        db_path.display()
    );

    let codec = PayloadCodec::new(Config::default().codec.secret);
    let queue = LogQueue::open(&db_path, codec).expect("failed to open queue");
    let db = queue.database();
    let entries = db
        .pending_entries("submission-42")
        .expect("failed to list entries");

    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].log_type, LogType::Keystroke);
    assert_eq!(entries[1].log_type, LogType::FocusChange);
    assert!(entries.iter().all(|e| !e.encrypted_payload.contains("loggedAt")));
}

#[test]
fn enqueue_rejects_mismatched_data() {
    let env = CliTestEnv::new();

    let args = [
        "enqueue",
        "submission-42",
        "MOUSECLICK",
        "--data",
        r#"{"key":"q"}"#,
    ];
    let output = run_agent(&env, &args);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not match MOUSECLICK"));
}

#[test]
fn status_and_discarded_report_queue_contents() {
    let env = CliTestEnv::new();

    let output = run_agent(&env, &["status"]);
    assert_success(&["status"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Backend:  <not configured>"));
    assert!(stdout.contains("proctor-sync/proctor-sync.log.20"));
    assert!(stdout.contains("No pending entries"));

    let args = [
        "enqueue",
        "submission-7",
        "MOUSECLICK",
        "--data",
        r#"{"type":"LEFT","position":[10,20],"loggedAt":"2026-01-01T10:00:00Z"}"#,
    ];
    assert_success(&args, &run_agent(&env, &args));

    let output = run_agent(&env, &["status"]);
    assert_success(&["status"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        stdout.contains("submission-7: 1 pending"),
        "expected backlog line in stdout, got:\n{stdout}"
    );

    let output = run_agent(&env, &["discarded", "submission-7"]);
    assert_success(&["discarded", "submission-7"], &output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("No discarded entries"));
}

#[test]
fn sync_requires_backend_configuration() {
    let env = CliTestEnv::new();

    let output = run_agent(&env, &["sync", "submission-42"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("backend is not configured"));
}

#[test]
fn sync_against_unreachable_backend_stays_offline() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[backend]
base_url = "http://127.0.0.1:9"
timeout_secs = 2

[connectivity]
probe_interval_secs = 2
"#,
    );

    let args = [
        "enqueue",
        "submission-42",
        "KEYSTROKE",
        "--data",
        r#"{"key":"z","loggedAt":"2026-01-01T10:00:00Z"}"#,
    ];
    assert_success(&args, &run_agent(&env, &args));

    // Repeated syncs during an outage must not use up the entry's attempts.
    for _ in 0..6 {
        let output = run_agent(&env, &["sync", "submission-42"]);
        assert_success(&["sync", "submission-42"], &output);
        assert!(String::from_utf8_lossy(&output.stdout).contains("Offline: backend unreachable"));
    }

    let queue = LogQueue::open(
        &env.db_path(),
        PayloadCodec::new(Config::default().codec.secret),
    )
    .expect("failed to open queue");
    let entries = queue
        .database()
        .pending_entries("submission-42")
        .expect("failed to list entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].upload_attempts, 0);
    assert!(queue
        .database()
        .discarded_entries("submission-42")
        .expect("failed to list discarded")
        .is_empty());
}

#[test]
fn sync_without_connectivity_check_counts_failed_attempt() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[backend]
base_url = "http://127.0.0.1:9"
timeout_secs = 2

[connectivity]
enabled = false
"#,
    );

    let args = [
        "enqueue",
        "submission-42",
        "KEYSTROKE",
        "--data",
        r#"{"key":"z","loggedAt":"2026-01-01T10:00:00Z"}"#,
    ];
    assert_success(&args, &run_agent(&env, &args));

    let output = run_agent(&env, &["sync", "submission-42"]);
    assert_success(&["sync", "submission-42"], &output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Still pending:     1"));
    assert!(stdout.contains("did not accept the batch"));

    let queue = LogQueue::open(
        &env.db_path(),
        PayloadCodec::new(Config::default().codec.secret),
    )
    .expect("failed to open queue");
    let entries = queue
        .database()
        .pending_entries("submission-42")
        .expect("failed to list entries");
    assert_eq!(entries[0].upload_attempts, 1);
}
