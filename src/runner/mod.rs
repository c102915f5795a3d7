#![forbid(unsafe_code)]

//! The execution engine: acquires the runner lock, drives the task queue,
//! supervises one child process at a time, and schedules resumes.
//!
//! The runner is the single writer for all task state while it holds the
//! lock. A `running` record found on startup is therefore definitionally
//! stale (left by a dead runner) and is restored to `pending`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::Context as _;
use serde::Deserialize;
use sha2::Digest as _;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::io::{AsyncBufReadExt as _, AsyncWriteExt as _};
use tracing::{error, info, warn};

use crate::compat::{CliAdapter, LaunchSpec};
use crate::config::{Config, Paths, format_duration};
use crate::detector::{Detection, DetectionKind, Detector};
use crate::error::AutopilotError;
use crate::fsutil;
use crate::lock::RunnerLock;
use crate::notifier::Notifier;
use crate::queue::control::{self, ControlOp};
use crate::queue::{self, StateStore, Task, TaskState, TaskStatus, valid_transition};
use crate::resume::{self, ResumeStrategy};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_FATAL: u8 = 2;
pub const EXIT_SIGNAL: u8 = 130;

const MAX_TAIL_LINES: usize = 20;
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const KILL_GRACE: Duration = Duration::from_secs(10);
const PROMPT_SILENCE_GATE: Duration = Duration::from_secs(30);
const WAIT_TICK: Duration = Duration::from_secs(30);

pub struct Runner {
    pub paths: Paths,
    pub config: Config,
    pub adapter: CliAdapter,
    pub detector: Detector,
    pub notifier: Notifier,
    /// Child executable; "claude" outside of tests.
    pub executable: String,
    pub project_dir: Option<PathBuf>,
    pub yes: bool,
    /// Prompt-wait patterns for hang detection when permissions are not
    /// skipped.
    pub prompt_patterns: Vec<String>,
    shutting_down: Arc<AtomicBool>,
}

// One line of the child's stream-json output; only the envelope fields the
// runner reacts to are decoded.
#[derive(Debug, Deserialize)]
struct StreamEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    session_id: String,
}

// Shared between the stdout reader and the watchers.
#[derive(Debug, Clone)]
struct ChildOutput {
    last_output: Instant,
    tail: Vec<String>,
    stdout: String,
    stderr: String,
    session_id: String,
    saw_result: bool,
}

impl ChildOutput {
    fn new() -> Self {
        Self {
            last_output: Instant::now(),
            tail: Vec::new(),
            stdout: String::new(),
            stderr: String::new(),
            session_id: String::new(),
            saw_result: false,
        }
    }
}

fn lock_output(shared: &Arc<Mutex<ChildOutput>>) -> MutexGuard<'_, ChildOutput> {
    shared
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

impl Runner {
    #[must_use]
    pub fn new(
        paths: Paths,
        config: Config,
        adapter: CliAdapter,
        detector: Detector,
        notifier: Notifier,
    ) -> Self {
        Self {
            paths,
            config,
            adapter,
            detector,
            notifier,
            executable: "claude".to_owned(),
            project_dir: None,
            yes: false,
            prompt_patterns: Vec::new(),
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The shutdown flag; the signal handler and tests flip it.
    #[must_use]
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutting_down)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Runs the queue to completion. Returns the process exit code: 0 when
    /// everything finished, 1 when any task failed, 2 on lock contention or
    /// fatal infrastructure errors, 130 on signal-driven shutdown.
    pub async fn run(&mut self) -> u8 {
        let run_started = Instant::now();

        if let Err(e) = self.paths.ensure_dirs() {
            error!("failed to create directories: {e:#}");
            return EXIT_FATAL;
        }

        let lock = match RunnerLock::acquire(&self.paths.lock_file()) {
            Ok(lock) => lock,
            Err(e) => {
                match e.downcast_ref::<AutopilotError>() {
                    Some(AutopilotError::Locked(pid)) => {
                        eprintln!(
                            "Another claude-autopilot instance is already running (held by PID {pid})."
                        );
                    }
                    _ => error!("failed to acquire runner lock: {e:#}"),
                }
                return EXIT_FATAL;
            }
        };

        match fsutil::clean_orphan_temps(&self.paths.sweep_dirs(self.project_dir.as_deref())) {
            Ok(0) => {}
            Ok(n) => info!("cleaned {n} orphan temp file(s)"),
            Err(e) => warn!("orphan temp cleanup: {e:#}"),
        }

        if !self.acknowledge_first_run() {
            eprintln!("First-run acknowledgement declined. Exiting.");
            return EXIT_OK;
        }

        self.install_signal_handler();

        let code = self.main_loop().await;

        if code == EXIT_OK || code == EXIT_FAILED {
            self.print_summary(run_started);
            self.notifier
                .notify_complete("claude-autopilot run completed")
                .await;
        }

        lock.release();
        code
    }

    async fn main_loop(&mut self) -> u8 {
        let store = StateStore::new(self.paths.state_dir());
        let tasks_dir = self.paths.tasks_dir();
        let mut any_failed = false;

        loop {
            if self.is_shutting_down() {
                return EXIT_SIGNAL;
            }

            if let Err(e) = self.drain_control(&store) {
                warn!("processing control commands: {e:#}");
            }

            let loaded =
                queue::load_tasks_with_init(&tasks_dir, self.project_dir.as_deref(), &store);
            let (tasks, init_count) = match loaded {
                Ok(v) => v,
                Err(e) => {
                    error!("loading tasks: {e:#}");
                    return EXIT_FATAL;
                }
            };
            if init_count > 0 {
                println!("Initialized state for {init_count} new task(s)");
            }
            if tasks.is_empty() {
                println!(
                    "No tasks found. Add tasks with 'claude-autopilot add' or create YAML files in {}",
                    tasks_dir.display()
                );
                return if any_failed { EXIT_FAILED } else { EXIT_OK };
            }

            let mut states: HashMap<String, TaskState> = HashMap::new();
            for task in &tasks {
                let mut st = match store.load(&task.id) {
                    Ok(Some(st)) => st,
                    Ok(None) => TaskState::pending(&task.id),
                    Err(e) => {
                        warn!("load state for {}: {e:#}", task.id);
                        TaskState::pending(&task.id)
                    }
                };
                if st.status == TaskStatus::Running {
                    // Stale in-flight record from a dead runner.
                    st.status = TaskStatus::Pending;
                    if let Err(e) = store.save(&st) {
                        warn!("crash recovery save for {}: {e:#}", task.id);
                    }
                }
                states.insert(task.id.clone(), st);
            }

            let now = OffsetDateTime::now_utc();
            let mut actionable: Vec<&Task> = Vec::new();
            let mut waiting_future: Vec<&Task> = Vec::new();
            for task in &tasks {
                match states[&task.id].status {
                    TaskStatus::Pending => actionable.push(task),
                    TaskStatus::Waiting => match states[&task.id].resume_at {
                        Some(at) if at > now => waiting_future.push(task),
                        _ => actionable.push(task),
                    },
                    TaskStatus::Failed => any_failed = true,
                    TaskStatus::Done | TaskStatus::Cancelled | TaskStatus::Running => {}
                }
            }

            if let Some(task) = actionable.first() {
                let task = (*task).clone();
                let mut st = states
                    .remove(&task.id)
                    .unwrap_or_else(|| TaskState::pending(&task.id));

                let code = self.execute_task(&task, &mut st, &store).await;

                if let Ok(Some(reloaded)) = store.load(&task.id)
                    && reloaded.status == TaskStatus::Failed
                {
                    any_failed = true;
                }
                if code == EXIT_SIGNAL || code == EXIT_FATAL {
                    return code;
                }
                continue;
            }

            if !waiting_future.is_empty() {
                let earliest = waiting_future
                    .iter()
                    .filter_map(|t| states[&t.id].resume_at)
                    .min();
                let Some(earliest) = earliest else {
                    break;
                };

                let first = waiting_future[0];
                println!(
                    "All tasks waiting. Next resume at {}",
                    format_rfc3339(earliest)
                );

                if self.is_shutting_down() {
                    return EXIT_SIGNAL;
                }

                let until = earliest - OffsetDateTime::now_utc();
                if until.is_positive() {
                    self.show_countdown(earliest, &first.id, states[&first.id].attempt);
                    let tick_ms = u64::try_from(until.whole_milliseconds())
                        .unwrap_or(u64::MAX)
                        .min(WAIT_TICK.as_millis() as u64);

                    // One wait tick, polled in small slices so a shutdown
                    // signal interrupts promptly.
                    let deadline = Instant::now() + Duration::from_millis(tick_ms.max(1));
                    while Instant::now() < deadline {
                        if self.is_shutting_down() {
                            return EXIT_SIGNAL;
                        }
                        tokio::time::sleep(Duration::from_millis(250)).await;
                    }

                    if let Err(e) = self.drain_control(&store) {
                        warn!("processing control commands during wait: {e:#}");
                    }
                }
                // Re-evaluate the queue: a tick may have made a task
                // actionable or a control command may have changed state.
                continue;
            }

            break;
        }

        if any_failed { EXIT_FAILED } else { EXIT_OK }
    }

    async fn execute_task(&self, task: &Task, state: &mut TaskState, store: &StateStore) -> u8 {
        let now = OffsetDateTime::now_utc();
        let working_dir = Path::new(&task.working_dir);

        if !working_dir.is_absolute() || !working_dir.is_dir() {
            error!(
                "task {}: working_dir missing or not absolute: {}",
                task.id, task.working_dir
            );
            state.status = TaskStatus::Failed;
            state.ended_at = Some(now);
            if let Err(e) = store.save(state) {
                warn!("save state for {}: {e:#}", task.id);
            }
            return EXIT_FAILED;
        }

        state.status = TaskStatus::Running;
        state.attempt += 1;
        state.started_at = Some(now);
        state.ended_at = None;
        state.prompt_hash = hash_prompt(&task.prompt);
        state.git_commit = current_git_commit(working_dir).unwrap_or_default();

        if let Err(e) = store.save(state) {
            error!("save pre-run state for {}: {e:#}", task.id);
            return EXIT_FATAL;
        }

        let log_path = self.paths.task_log_file(&task.id);
        if let Err(e) = rotate_log_if_needed(&log_path, MAX_LOG_BYTES) {
            warn!("log rotation failed for {}: {e:#}", log_path.display());
        }

        info!(
            "running task {} (attempt {}): {}",
            task.id, state.attempt, task.title
        );

        let prompt = match self.build_prompt(task, state) {
            Ok(p) => p,
            Err(e) => {
                error!("build prompt for {}: {e:#}", task.id);
                state.status = TaskStatus::Failed;
                state.ended_at = Some(OffsetDateTime::now_utc());
                if let Err(e) = store.save(state) {
                    warn!("save state for {}: {e:#}", task.id);
                }
                return EXIT_FAILED;
            }
        };

        let native_session = if state.attempt > 1
            && resume::determine_strategy(
                !state.session_id.is_empty(),
                self.adapter.supports_resume(),
            ) == ResumeStrategy::Native
        {
            state.session_id.clone()
        } else {
            String::new()
        };

        let skip_permissions = self.config.skip_permissions || task.skip_permissions;
        let args = self.adapter.build_args(&LaunchSpec {
            prompt: &prompt,
            model: &task.model,
            session_id: &native_session,
            skip_permissions,
            flags: &task.flags,
        });

        let mut cmd = tokio::process::Command::new(&self.executable);
        cmd.args(&args)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                error!("start {} for {}: {e}", self.executable, task.id);
                state.status = TaskStatus::Failed;
                state.ended_at = Some(OffsetDateTime::now_utc());
                if let Err(e) = store.save(state) {
                    warn!("save state for {}: {e:#}", task.id);
                }
                return EXIT_FAILED;
            }
        };

        let child_pid = child.id();
        let shared = Arc::new(Mutex::new(ChildOutput::new()));

        let stdout_reader = child.stdout.take().map(|out| {
            let shared = Arc::clone(&shared);
            let stream_json = self.adapter.supports_stream_json();
            let log_path = log_path.clone();
            let task_id = task.id.clone();
            let attempt = state.attempt;
            tokio::spawn(read_stdout(
                out, shared, stream_json, log_path, task_id, attempt,
            ))
        });
        let stderr_reader = child.stderr.take().map(|err| {
            let shared = Arc::clone(&shared);
            tokio::spawn(read_stderr(err, shared))
        });

        let status = self
            .supervise(&mut child, child_pid, &shared, skip_permissions, &task.id)
            .await;

        // The readers normally finish at pipe EOF. A grandchild that
        // inherited the pipe can keep it open past the child's exit, so the
        // join is bounded.
        if let Some(handle) = stdout_reader {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }
        if let Some(handle) = stderr_reader {
            let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
        }

        let output = lock_output(&shared).clone();
        if !output.session_id.is_empty() {
            state.session_id = output.session_id.clone();
        }
        state.last_ndjson_messages = output.tail.clone();

        if self.is_shutting_down() {
            // The interrupted attempt doesn't count; restore for a clean
            // restart.
            if state.status == TaskStatus::Running {
                state.status = TaskStatus::Pending;
                state.attempt -= 1;
                state.ended_at = None;
            }
            if let Err(e) = store.save(state) {
                warn!("save state for {} on shutdown: {e:#}", task.id);
            }
            return EXIT_SIGNAL;
        }

        let exit_code = status.as_ref().ok().and_then(std::process::ExitStatus::code);
        if output.saw_result && exit_code != Some(0) {
            info!(
                "task {} emitted a result message but exited with {exit_code:?}",
                task.id
            );
        }
        let detection = self.detector.detect(exit_code, &output.stdout, &output.stderr);
        info!(
            "task {} exit_code={exit_code:?} detection={} reason={:?}",
            task.id, detection.kind, detection.reason
        );

        self.apply_detection(task, state, &detection);

        state.ended_at = Some(OffsetDateTime::now_utc());
        if let Err(e) = store.save(state) {
            error!("save post-run state for {}: {e:#}", task.id);
        }

        EXIT_OK
    }

    fn apply_detection(&self, task: &Task, state: &mut TaskState, detection: &Detection) {
        match detection.kind {
            DetectionKind::Completed => {
                state.status = TaskStatus::Done;
                info!("task {} completed successfully", task.id);
            }
            DetectionKind::RateLimited => {
                state.status = TaskStatus::Waiting;
                let now = OffsetDateTime::now_utc();
                state.last_rate_limited_at = Some(now);

                if let Some(reset_at) = detection.reset_at {
                    state.resume_at = Some(reset_at);
                    info!(
                        "task {} rate limited; resume at {}",
                        task.id,
                        format_rfc3339(reset_at)
                    );
                } else {
                    let delay = backoff_delay(state.attempt);
                    state.resume_at = Some(now + delay);
                    info!(
                        "task {} rate limited; backoff {}, resume at {}",
                        task.id,
                        format_duration(delay),
                        format_rfc3339(now + delay)
                    );
                }
            }
            DetectionKind::Failed => {
                if state.attempt < task.max_retries {
                    state.status = TaskStatus::Waiting;
                    let delay = backoff_delay(state.attempt);
                    state.resume_at = Some(OffsetDateTime::now_utc() + delay);
                    info!(
                        "task {} failed (attempt {}/{}); retry in {}",
                        task.id,
                        state.attempt,
                        task.max_retries,
                        format_duration(delay)
                    );
                } else {
                    state.status = TaskStatus::Failed;
                    info!(
                        "task {} failed after {} attempts; giving up",
                        task.id, state.attempt
                    );
                }
            }
            DetectionKind::Unknown => {
                // Unclassifiable results get exactly one retry.
                if state.attempt < 2 {
                    state.status = TaskStatus::Waiting;
                    let delay = backoff_delay(state.attempt);
                    state.resume_at = Some(OffsetDateTime::now_utc() + delay);
                    info!(
                        "task {} unknown result; retry once (attempt {})",
                        task.id, state.attempt
                    );
                } else {
                    state.status = TaskStatus::Failed;
                    info!("task {} unknown result after retry; marking failed", task.id);
                }
            }
        }
    }

    // Waits for the child while two watchers tick alongside: the hang
    // watcher (every 5 s) and the shutdown watcher (every 500 ms). Signals
    // go to the child's PID so neither watcher needs the process handle.
    async fn supervise(
        &self,
        child: &mut tokio::process::Child,
        pid: Option<u32>,
        shared: &Arc<Mutex<ChildOutput>>,
        skip_permissions: bool,
        task_id: &str,
    ) -> std::io::Result<std::process::ExitStatus> {
        let hang_timeout = if self.config.hang_timeout.is_zero() {
            Duration::from_secs(600)
        } else {
            self.config.hang_timeout
        };

        let mut hang_tick = tokio::time::interval(Duration::from_secs(5));
        let mut shutdown_tick = tokio::time::interval(Duration::from_millis(500));
        let mut kill_at: Option<Instant> = None;
        let mut term_sent = false;

        loop {
            tokio::select! {
                status = child.wait() => return status,

                _ = hang_tick.tick() => {
                    if term_sent {
                        // Already winding down; the kill deadline is handled
                        // by the shutdown watcher.
                    } else {
                        let (silence, recent) = {
                            let guard = lock_output(shared);
                            (guard.last_output.elapsed(), guard.tail.join("\n"))
                        };

                        let prompt_stuck = !skip_permissions
                            && !self.prompt_patterns.is_empty()
                            && silence >= PROMPT_SILENCE_GATE
                            && matches_any(&recent, &self.prompt_patterns);

                        if prompt_stuck {
                            warn!(
                                "task {task_id} appears stuck at a permission prompt \
                                 (silent for {}s); terminating",
                                silence.as_secs()
                            );
                            send_term(pid);
                            term_sent = true;
                            kill_at = Some(Instant::now() + KILL_GRACE);
                        } else if silence >= hang_timeout {
                            warn!(
                                "task {task_id} produced no output for {}s; terminating",
                                silence.as_secs()
                            );
                            send_term(pid);
                            term_sent = true;
                            kill_at = Some(Instant::now() + KILL_GRACE);
                        }
                    }
                }

                _ = shutdown_tick.tick() => {
                    if self.is_shutting_down() && !term_sent {
                        info!("shutdown signal received; terminating task {task_id}");
                        send_term(pid);
                        term_sent = true;
                        kill_at = Some(Instant::now() + KILL_GRACE);
                    }
                    if let Some(deadline) = kill_at
                        && Instant::now() >= deadline
                    {
                        send_kill(pid);
                        kill_at = None;
                    }
                }
            }
        }
    }

    /// Builds the child prompt: context files framed as `[File: <path>]`
    /// blocks, then the (possibly resume-wrapped) task prompt. A missing
    /// context file fails the task, not the runner.
    fn build_prompt(&self, task: &Task, state: &TaskState) -> anyhow::Result<String> {
        let base = self.maybe_wrap_resume(task, state);
        if task.context_files.is_empty() {
            return Ok(base);
        }

        let mut out = String::new();
        for file_ref in &task.context_files {
            let resolved = if Path::new(file_ref).is_absolute() {
                PathBuf::from(file_ref)
            } else {
                Path::new(&task.working_dir).join(file_ref)
            };

            let data = match std::fs::read(&resolved) {
                Ok(data) => data,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    anyhow::bail!(
                        "Context file '{file_ref}' not found in {}",
                        task.working_dir
                    );
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("read context file '{file_ref}'"));
                }
            };

            out.push_str(&format!("[File: {file_ref}]\n"));
            out.push_str(&String::from_utf8_lossy(&data));
            out.push_str("\n\n");
        }

        out.push_str(&base);
        Ok(out)
    }

    fn maybe_wrap_resume(&self, task: &Task, state: &TaskState) -> String {
        if state.attempt <= 1 {
            return task.prompt.clone();
        }

        let strategy = resume::determine_strategy(
            !state.session_id.is_empty(),
            self.adapter.supports_resume(),
        );
        if strategy == ResumeStrategy::Native {
            // --resume carries the context; the prompt goes out unchanged.
            return task.prompt.clone();
        }

        resume::build_resume_prompt(state.attempt, &state.last_ndjson_messages, &task.prompt)
    }

    fn drain_control(&self, store: &StateStore) -> anyhow::Result<()> {
        let control_dir = self.paths.control_dir();
        let commands = control::read_commands(&control_dir)?;
        if commands.is_empty() {
            return Ok(());
        }

        for cmd in &commands {
            let mut st = match store.load(&cmd.task_id) {
                Ok(Some(st)) => st,
                Ok(None) => TaskState::pending(&cmd.task_id),
                Err(e) => {
                    warn!("control {} for {}: load state: {e:#}", cmd.op, cmd.task_id);
                    continue;
                }
            };

            match cmd.op {
                ControlOp::Retry => {
                    if matches!(st.status, TaskStatus::Failed | TaskStatus::Cancelled)
                        && valid_transition(st.status, TaskStatus::Pending)
                    {
                        st.status = TaskStatus::Pending;
                        st.attempt = 0;
                        st.resume_at = None;
                        info!("control: retrying task {}", cmd.task_id);
                    } else {
                        info!(
                            "control: dropping retry for {} in state {}",
                            cmd.task_id, st.status
                        );
                        continue;
                    }
                }
                ControlOp::Cancel => {
                    if valid_transition(st.status, TaskStatus::Cancelled) {
                        st.status = TaskStatus::Cancelled;
                        info!("control: cancelled task {}", cmd.task_id);
                    } else {
                        info!(
                            "control: dropping cancel for {} in state {}",
                            cmd.task_id, st.status
                        );
                        continue;
                    }
                }
            }

            if let Err(e) = store.save(&st) {
                warn!("control {} for {}: save state: {e:#}", cmd.op, cmd.task_id);
            }
        }

        control::clear_commands(&control_dir)
    }

    fn acknowledge_first_run(&self) -> bool {
        use std::io::IsTerminal as _;

        let ack = self.paths.first_run_ack_file();
        if ack.exists() {
            return true;
        }

        let env_yes = std::env::var("CLAUDE_AUTOPILOT_YES")
            .is_ok_and(|v| matches!(v.as_str(), "1" | "true" | "yes"));
        if self.yes || env_yes || !std::io::stdin().is_terminal() {
            return true;
        }

        println!("=== claude-autopilot: First Run ===");
        println!();
        println!("This tool will autonomously run Claude Code on your tasks.");
        println!("It will execute commands and modify files in your working directories.");
        println!();
        println!("Please ensure you have reviewed your task definitions and understand");
        println!("that claude-autopilot will invoke 'claude' with the prompts you provide.");
        println!();
        print!("Type 'yes' to acknowledge and continue: ");
        let _ = std::io::Write::flush(&mut std::io::stdout());

        let mut response = String::new();
        let _ = std::io::stdin().read_line(&mut response);
        if response.trim().to_lowercase() != "yes" {
            return false;
        }

        if let Err(e) = std::fs::write(&ack, format!("{}\n", now_rfc3339())) {
            warn!("could not write first-run marker: {e}");
        }
        true
    }

    fn install_signal_handler(&self) {
        let flag = Arc::clone(&self.shutting_down);
        tokio::spawn(async move {
            #[cfg(unix)]
            {
                use tokio::signal::unix::{SignalKind, signal};
                match signal(SignalKind::terminate()) {
                    Ok(mut term) => {
                        tokio::select! {
                            _ = tokio::signal::ctrl_c() => {}
                            _ = term.recv() => {}
                        }
                    }
                    Err(_) => {
                        let _ = tokio::signal::ctrl_c().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                let _ = tokio::signal::ctrl_c().await;
            }
            flag.store(true, Ordering::SeqCst);
        });
    }

    fn show_countdown(&self, resume_at: OffsetDateTime, task_id: &str, attempt: i64) {
        let remaining = (resume_at - OffsetDateTime::now_utc())
            .whole_seconds()
            .max(0);
        print!(
            "\r  Waiting for {task_id} (attempt {attempt}), resumes in {}  ",
            format_elapsed_secs(remaining)
        );
        let _ = std::io::Write::flush(&mut std::io::stdout());
    }

    fn print_summary(&self, run_started: Instant) {
        let store = StateStore::new(self.paths.state_dir());
        let loaded = queue::load_tasks_with_init(
            &self.paths.tasks_dir(),
            self.project_dir.as_deref(),
            &store,
        );
        let Ok((tasks, _)) = loaded else {
            warn!("could not load tasks for summary");
            return;
        };

        let mut counts: HashMap<TaskStatus, usize> = HashMap::new();
        for task in &tasks {
            let st = store.load(&task.id).ok().flatten();
            let status = st.as_ref().map_or(TaskStatus::Pending, |s| s.status);
            *counts.entry(status).or_insert(0) += 1;

            let retries = st.as_ref().map_or(0, |s| (s.attempt - 1).max(0));
            let duration = st
                .as_ref()
                .map_or_else(|| "n/a".to_owned(), |s| task_duration(s));
            let line = format!(
                "Task {}: {} ({duration}, {retries} retries)",
                task.id,
                status.to_string().to_uppercase()
            );
            println!("{line}");
            if let Err(e) = self.append_summary_log(&line) {
                warn!("summary log: {e:#}");
            }
        }

        let count = |s: TaskStatus| counts.get(&s).copied().unwrap_or(0);
        println!();
        println!("=== Run Summary ===");
        println!("  Done:      {}", count(TaskStatus::Done));
        println!("  Failed:    {}", count(TaskStatus::Failed));
        println!("  Cancelled: {}", count(TaskStatus::Cancelled));
        println!("  Pending:   {}", count(TaskStatus::Pending));
        println!("  Waiting:   {}", count(TaskStatus::Waiting));
        println!("  Total:     {}", tasks.len());
        println!(
            "  Elapsed:   {}",
            format_elapsed_secs(run_started.elapsed().as_secs() as i64)
        );

        let _ = self.append_summary_log(&format!(
            "Run completed: done={} failed={} cancelled={} pending={} waiting={} total={} elapsed={}",
            count(TaskStatus::Done),
            count(TaskStatus::Failed),
            count(TaskStatus::Cancelled),
            count(TaskStatus::Pending),
            count(TaskStatus::Waiting),
            tasks.len(),
            format_elapsed_secs(run_started.elapsed().as_secs() as i64)
        ));
    }

    fn append_summary_log(&self, line: &str) -> anyhow::Result<()> {
        use std::io::Write as _;

        let dir = self.paths.logs_dir();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
        let path = self.paths.summary_log_file();
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        writeln!(f, "[{}] {line}", now_rfc3339())?;
        Ok(())
    }
}

async fn read_stdout(
    out: tokio::process::ChildStdout,
    shared: Arc<Mutex<ChildOutput>>,
    stream_json: bool,
    log_path: PathBuf,
    task_id: String,
    attempt: i64,
) {
    let mut log = open_task_log(&log_path, &task_id, attempt).await;
    let mut lines = tokio::io::BufReader::with_capacity(1024 * 1024, out).lines();

    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(f) = log.as_mut() {
            let _ = f.write_all(line.as_bytes()).await;
            let _ = f.write_all(b"\n").await;
        }

        let mut guard = lock_output(&shared);
        guard.last_output = Instant::now();
        guard.stdout.push_str(&line);
        guard.stdout.push('\n');
        guard.tail.push(line.clone());
        if guard.tail.len() > MAX_TAIL_LINES {
            let excess = guard.tail.len() - MAX_TAIL_LINES;
            guard.tail.drain(..excess);
        }

        if stream_json
            && let Ok(msg) = serde_json::from_str::<StreamEnvelope>(&line)
        {
            match msg.kind.as_str() {
                "system" if !msg.session_id.is_empty() => guard.session_id = msg.session_id,
                "result" => guard.saw_result = true,
                _ => {}
            }
        }
    }

    if let Some(mut f) = log {
        let _ = f.flush().await;
    }
}

async fn read_stderr(err: tokio::process::ChildStderr, shared: Arc<Mutex<ChildOutput>>) {
    let mut lines = tokio::io::BufReader::with_capacity(64 * 1024, err).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let mut guard = lock_output(&shared);
        guard.stderr.push_str(&line);
        guard.stderr.push('\n');
    }
}

async fn open_task_log(path: &Path, task_id: &str, attempt: i64) -> Option<tokio::fs::File> {
    if let Some(parent) = path.parent() {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
    {
        Ok(mut f) => {
            let header = format!("\n[{}] attempt={attempt} task={task_id}\n", now_rfc3339());
            let _ = f.write_all(header.as_bytes()).await;
            Some(f)
        }
        Err(e) => {
            warn!("cannot open log file {}: {e}", path.display());
            None
        }
    }
}

fn send_term(pid: Option<u32>) {
    if let Some(pid) = pid {
        fsutil::process::terminate(pid);
    }
}

fn send_kill(pid: Option<u32>) {
    if let Some(pid) = pid {
        fsutil::process::kill_hard(pid);
    }
}

fn matches_any(text: &str, patterns: &[String]) -> bool {
    let lower = text.to_lowercase();
    patterns.iter().any(|p| lower.contains(&p.to_lowercase()))
}

/// Retry delay for an attempt: base 5 minutes doubling per attempt, capped at
/// 300 minutes, with ±20% uniform jitter so simultaneous retries spread out.
#[must_use]
pub fn backoff_delay(attempt: i64) -> Duration {
    use rand::Rng as _;

    const BASE_MINUTES: f64 = 5.0;
    const CAP_MINUTES: f64 = 300.0;
    const JITTER_PCT: f64 = 0.20;

    let exp = i32::try_from((attempt - 1).clamp(0, 30)).unwrap_or(0);
    let mut minutes = BASE_MINUTES * 2f64.powi(exp);
    if minutes > CAP_MINUTES {
        minutes = CAP_MINUTES;
    }

    let jitter = minutes * JITTER_PCT * (2.0 * rand::thread_rng().r#gen::<f64>() - 1.0);
    minutes += jitter;
    if minutes < 1.0 {
        minutes = 1.0;
    }

    Duration::from_secs_f64(minutes * 60.0)
}

fn hash_prompt(prompt: &str) -> String {
    let digest = sha2::Sha256::digest(prompt.as_bytes());
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

fn current_git_commit(dir: &Path) -> Option<String> {
    let out = std::process::Command::new("git")
        .args(["rev-parse", "HEAD"])
        .current_dir(dir)
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let hash = String::from_utf8_lossy(&out.stdout).trim().to_owned();
    (!hash.is_empty()).then_some(hash)
}

fn rotate_log_if_needed(path: &Path, max_bytes: u64) -> anyhow::Result<()> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e).with_context(|| format!("stat {}", path.display())),
    };
    if meta.len() <= max_bytes {
        return Ok(());
    }

    let backup = PathBuf::from(format!("{}.1", path.display()));
    let _ = std::fs::remove_file(&backup);
    std::fs::rename(path, &backup)
        .with_context(|| format!("rotate {} -> {}", path.display(), backup.display()))
}

fn now_rfc3339() -> String {
    format_rfc3339(OffsetDateTime::now_utc())
}

fn format_rfc3339(t: OffsetDateTime) -> String {
    t.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_owned())
}

fn task_duration(state: &TaskState) -> String {
    let Some(start) = state.started_at else {
        return "n/a".to_owned();
    };
    let end = state.ended_at.unwrap_or_else(OffsetDateTime::now_utc);
    if end < start {
        return "n/a".to_owned();
    }
    format_elapsed_secs((end - start).whole_seconds())
}

fn format_elapsed_secs(total: i64) -> String {
    let total = total.max(0);
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}
