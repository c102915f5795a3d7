//! End-to-end runner scenarios against a stub `claude` executable.
//!
//! Each test builds a throwaway base directory, seeds task files, points the
//! runner at a small shell script standing in for the child CLI, and asserts
//! on the resulting state records and exit codes.

#![cfg(unix)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use claude_autopilot::compat::CliAdapter;
use claude_autopilot::config::{Config, Paths};
use claude_autopilot::detector::Detector;
use claude_autopilot::notifier::Notifier;
use claude_autopilot::queue::{StateStore, TaskState, TaskStatus};
use claude_autopilot::runner::{EXIT_FAILED, EXIT_FATAL, EXIT_OK, EXIT_SIGNAL, Runner};
use claude_autopilot::{lock, queue};
use time::OffsetDateTime;

struct Harness {
    _tempdir: tempfile::TempDir,
    paths: Paths,
    workdir: PathBuf,
}

impl Harness {
    fn new() -> Self {
        let tempdir = tempfile::tempdir().expect("tempdir");
        let paths = Paths::new(tempdir.path().join("base"));
        paths.ensure_dirs().expect("ensure dirs");
        let workdir = tempdir.path().join("work");
        std::fs::create_dir_all(&workdir).expect("workdir");
        Self {
            _tempdir: tempdir,
            paths,
            workdir,
        }
    }

    fn scratch(&self) -> &Path {
        self._tempdir.path()
    }

    fn store(&self) -> StateStore {
        StateStore::new(self.paths.state_dir())
    }

    fn write_task(&self, id: &str, extra: &str) {
        let body = format!(
            "id: {id}\nprompt: do X\nworking_dir: {}\n{extra}",
            self.workdir.display()
        );
        std::fs::write(self.paths.tasks_dir().join(format!("{id}.yaml")), body)
            .expect("write task file");
    }

    fn write_stub(&self, name: &str, script: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt as _;

        let path = self.scratch().join(name);
        std::fs::write(&path, script).expect("write stub");
        let mut perms = std::fs::metadata(&path).expect("stat stub").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod stub");
        path
    }

    fn runner(&self, executable: &Path) -> Runner {
        let mut r = Runner::new(
            self.paths.clone(),
            Config {
                notification_bell: false,
                ..Config::default()
            },
            CliAdapter::for_version(Some("2.1.0")),
            Detector::new(
                vec!["rate limit".to_owned(), "usage limit".to_owned()],
                Some(75),
            )
            .expect("detector"),
            Notifier::disabled(),
        );
        r.executable = executable.to_string_lossy().into_owned();
        r.yes = true;
        r
    }
}

async fn run_with_timeout(runner: &mut Runner) -> u8 {
    tokio::time::timeout(Duration::from_secs(60), runner.run())
        .await
        .expect("runner did not finish in time")
}

// Flips the runner's shutdown flag as soon as the given task reaches the
// expected status, so tests don't sit out real resume waits.
fn shutdown_when_status(
    store: StateStore,
    flag: Arc<std::sync::atomic::AtomicBool>,
    task_id: &'static str,
    status: TaskStatus,
) {
    std::thread::spawn(move || {
        for _ in 0..1200 {
            if let Ok(Some(st)) = store.load(task_id)
                && st.status == status
            {
                flag.store(true, Ordering::SeqCst);
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    });
}

#[tokio::test]
async fn happy_path_records_session_and_completes() {
    let h = Harness::new();
    h.write_task("happy", "");

    let stub = h.write_stub(
        "claude-ok.sh",
        "#!/bin/sh\n\
         echo '{\"type\":\"system\",\"session_id\":\"sess-abc\"}'\n\
         echo '{\"type\":\"assistant\",\"message\":\"working\"}'\n\
         echo '{\"type\":\"result\"}'\n\
         exit 0\n",
    );

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_OK);

    let st = h.store().load("happy").unwrap().expect("state exists");
    assert_eq!(st.status, TaskStatus::Done);
    assert_eq!(st.attempt, 1);
    assert_eq!(st.session_id, "sess-abc");
    assert!(st.started_at.is_some() && st.ended_at.is_some());
    assert!(!st.prompt_hash.is_empty());

    // Child output landed in the per-task log.
    let log = std::fs::read_to_string(h.paths.task_log_file("happy")).unwrap();
    assert!(log.contains("sess-abc"));
}

#[tokio::test]
async fn rate_limit_schedules_resume_then_native_resume_completes() {
    let h = Harness::new();
    h.write_task("limited", "");

    let marker = h.scratch().join("first-attempt-done");
    let args_log = h.scratch().join("args.log");
    let stub = h.write_stub(
        "claude-rl.sh",
        &format!(
            "#!/bin/sh\n\
             printf '%s\\n' \"$@\" >> {args}\n\
             echo '{{\"type\":\"system\",\"session_id\":\"sess-rl\"}}'\n\
             if [ ! -f {marker} ]; then\n\
               touch {marker}\n\
               echo 'Claude usage limit reached. Will reset at 6:30 PM.' >&2\n\
               exit 75\n\
             fi\n\
             echo '{{\"type\":\"result\"}}'\n\
             exit 0\n",
            args = args_log.display(),
            marker = marker.display()
        ),
    );

    // Phase 1: the child rate-limits; the runner parks the task as waiting.
    let mut runner = h.runner(&stub);
    shutdown_when_status(
        h.store(),
        runner.shutdown_flag(),
        "limited",
        TaskStatus::Waiting,
    );
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_SIGNAL);

    let st = h.store().load("limited").unwrap().expect("state exists");
    assert_eq!(st.status, TaskStatus::Waiting);
    assert_eq!(st.attempt, 1);
    assert_eq!(st.session_id, "sess-rl");
    assert!(st.last_rate_limited_at.is_some());
    let resume_at = st.resume_at.expect("resume_at set");
    assert!(resume_at > OffsetDateTime::now_utc());
    // "6:30 PM" parses to a wall-clock instant, not a backoff window.
    assert!(resume_at < OffsetDateTime::now_utc() + time::Duration::hours(25));

    // Phase 2: the reset time elapses; the retry resumes natively and
    // completes.
    let mut st = st;
    st.resume_at = Some(OffsetDateTime::now_utc() - time::Duration::minutes(1));
    h.store().save(&st).unwrap();

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_OK);

    let done = h.store().load("limited").unwrap().expect("state exists");
    assert_eq!(done.status, TaskStatus::Done);
    assert_eq!(done.attempt, 2);
    assert_eq!(done.session_id, "sess-rl");

    let args = std::fs::read_to_string(&args_log).unwrap();
    assert!(args.contains("--resume"), "{args}");
    assert!(args.contains("sess-rl"), "{args}");
}

#[tokio::test]
async fn crash_recovery_resets_stale_running_and_resumes() {
    let h = Harness::new();
    h.write_task("recover", "");

    // A dead runner left the task mid-flight with a captured session.
    let mut stale = TaskState::pending("recover");
    stale.status = TaskStatus::Running;
    stale.attempt = 1;
    stale.session_id = "sess-prev".to_owned();
    stale.last_ndjson_messages = vec!["halfway there".to_owned()];
    h.store().save(&stale).unwrap();

    let args_log = h.scratch().join("args.log");
    let stub = h.write_stub(
        "claude-ok.sh",
        &format!(
            "#!/bin/sh\n\
             printf '%s\\n' \"$@\" >> {args}\n\
             echo '{{\"type\":\"result\"}}'\n\
             exit 0\n",
            args = args_log.display()
        ),
    );

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_OK);

    let st = h.store().load("recover").unwrap().expect("state exists");
    assert_eq!(st.status, TaskStatus::Done);
    assert_eq!(st.attempt, 2);

    // The retry used the surviving session.
    let args = std::fs::read_to_string(&args_log).unwrap();
    assert!(args.contains("--resume"), "{args}");
    assert!(args.contains("sess-prev"), "{args}");
}

#[tokio::test]
async fn silent_child_is_terminated_and_marked_failed() {
    let h = Harness::new();
    h.write_task("stuck", "");

    // One attempt already happened, so the unclassifiable kill is terminal.
    let mut prior = TaskState::pending("stuck");
    prior.attempt = 1;
    h.store().save(&prior).unwrap();

    let stub = h.write_stub(
        "claude-hang.sh",
        "#!/bin/sh\necho 'Do you want to proceed?'\nsleep 120\n",
    );

    let mut runner = h.runner(&stub);
    runner.config.hang_timeout = Duration::from_secs(1);
    let started = std::time::Instant::now();
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_FAILED);
    // Far faster than the stub's 120 s sleep: the hang watcher killed it.
    assert!(started.elapsed() < Duration::from_secs(30));

    let st = h.store().load("stuck").unwrap().expect("state exists");
    assert_eq!(st.status, TaskStatus::Failed);
    assert_eq!(st.attempt, 2);
}

#[tokio::test]
async fn lock_contention_exits_fatal() {
    let h = Harness::new();
    h.write_task("blocked", "");

    let held = lock::RunnerLock::acquire(&h.paths.lock_file()).unwrap();
    let info = lock::read_info(&h.paths.lock_file()).unwrap();
    assert_eq!(info.pid, std::process::id());

    let stub = h.write_stub("claude-ok.sh", "#!/bin/sh\nexit 0\n");
    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_FATAL);

    // No state was touched while locked out.
    assert!(h.store().load("blocked").unwrap().is_none());
    held.release();
}

#[tokio::test]
async fn duplicate_task_ids_abort_before_any_execution() {
    let h = Harness::new();
    h.write_task("dup", "");
    std::fs::write(
        h.paths.tasks_dir().join("other.yaml"),
        format!(
            "id: dup\nprompt: do Y\nworking_dir: {}\n",
            h.workdir.display()
        ),
    )
    .unwrap();

    let ran_marker = h.scratch().join("ran");
    let stub = h.write_stub(
        "claude-ok.sh",
        &format!("#!/bin/sh\ntouch {}\nexit 0\n", ran_marker.display()),
    );

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_FATAL);
    assert!(!ran_marker.exists(), "child must never run on duplicate IDs");
}

#[tokio::test]
async fn queued_cancel_is_applied_on_next_pass() {
    let h = Harness::new();
    h.write_task("doomed", "");

    // Queue a cancel before the runner starts; the first drain applies it
    // and the child never runs.
    queue::control::append_command(
        &h.paths.control_dir(),
        &queue::control::ControlCommand::new(queue::control::ControlOp::Cancel, "doomed"),
    )
    .unwrap();

    let ran_marker = h.scratch().join("ran");
    let stub = h.write_stub(
        "claude-ok.sh",
        &format!("#!/bin/sh\ntouch {}\nexit 0\n", ran_marker.display()),
    );

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_OK);

    let st = h.store().load("doomed").unwrap().expect("state exists");
    assert_eq!(st.status, TaskStatus::Cancelled);
    assert!(!ran_marker.exists());
    assert!(
        queue::control::read_commands(&h.paths.control_dir())
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn failure_retries_with_backoff_until_exhausted() {
    let h = Harness::new();
    // max_retries 1: the first plain failure is terminal.
    h.write_task("fails", "max_retries: 1\n");

    let stub = h.write_stub(
        "claude-fail.sh",
        "#!/bin/sh\necho 'boom' >&2\nexit 3\n",
    );

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    assert_eq!(code, EXIT_FAILED);

    let st = h.store().load("fails").unwrap().expect("state exists");
    assert_eq!(st.status, TaskStatus::Failed);
    assert_eq!(st.attempt, 1);
}

#[tokio::test]
async fn context_files_feed_the_prompt_and_missing_ones_fail_the_task() {
    let h = Harness::new();
    std::fs::write(h.workdir.join("ctx.md"), "important context").unwrap();
    h.write_task("with-ctx", "context_files:\n  - ctx.md\n");
    h.write_task("bad-ctx", "context_files:\n  - nope.md\npriority: 20\n");

    let prompt_log = h.scratch().join("prompt.log");
    let stub = h.write_stub(
        "claude-echo.sh",
        &format!(
            "#!/bin/sh\n\
             for last; do :; done\n\
             printf '%s' \"$last\" > {}\n\
             exit 0\n",
            prompt_log.display()
        ),
    );

    let mut runner = h.runner(&stub);
    let code = run_with_timeout(&mut runner).await;
    // bad-ctx fails, so the run reports failure overall.
    assert_eq!(code, EXIT_FAILED);

    let ok = h.store().load("with-ctx").unwrap().expect("state exists");
    assert_eq!(ok.status, TaskStatus::Done);
    let prompt = std::fs::read_to_string(&prompt_log).unwrap();
    assert!(prompt.contains("[File: ctx.md]"), "{prompt}");
    assert!(prompt.contains("important context"), "{prompt}");
    assert!(prompt.ends_with("do X"), "{prompt}");

    let bad = h.store().load("bad-ctx").unwrap().expect("state exists");
    assert_eq!(bad.status, TaskStatus::Failed);
}
