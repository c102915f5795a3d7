#![forbid(unsafe_code)]

//! Command-line surface: argument parsing, user-facing output, and the exit
//! code contract for every subcommand.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context as _;
use clap::{CommandFactory as _, Parser, Subcommand};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::compat::{self, CliAdapter};
use crate::config::{self, Paths, matchers};
use crate::detector::Detector;
use crate::error::AutopilotError;
use crate::fsutil;
use crate::lock::{self, RunnerLock};
use crate::notifier::Notifier;
use crate::output::table::Table;
use crate::queue::control::{ControlCommand, ControlOp};
use crate::queue::{self, StateStore, Task, TaskState, TaskStatus, valid_transition};
use crate::runner::{self, Runner};

#[derive(Debug, Parser)]
#[command(
    name = "claude-autopilot",
    version,
    about = "Autonomous task runner for Claude Code — auto-retries on rate limits, queues tasks, keeps working while you sleep."
)]
pub struct Cli {
    /// Project directory whose .autopilot/tasks are merged into the queue
    /// (default: current directory)
    #[arg(long = "project-dir", global = true)]
    pub project_dir: Option<String>,

    #[command(subcommand)]
    pub cmd: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Add a new task to the queue
    Add(AddArgs),
    /// Start the autonomous task runner
    Run(RunArgs),
    /// List all queued tasks in execution order
    List(ListArgs),
    /// Show runner liveness and queue counts
    Status(StatusArgs),
    /// Retry a failed or cancelled task
    Retry(TaskIdArgs),
    /// Cancel a pending, waiting, or failed task
    Cancel(TaskIdArgs),
    /// Clean orphan temp files and rotated log backups
    Clean,
    /// Manage configuration
    Config(ConfigArgs),
    /// Generate shell completions
    Completion(CompletionArgs),
}

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Task prompt
    pub prompt: String,

    /// Working directory for the task (required)
    #[arg(long = "dir")]
    pub dir: String,
    /// Task title (default: first 60 chars of prompt)
    #[arg(long = "title")]
    pub title: Option<String>,
    /// Task priority (lower = earlier)
    #[arg(long = "priority", default_value_t = 10)]
    pub priority: i64,
    /// Claude model to use
    #[arg(long = "model")]
    pub model: Option<String>,
    /// Skip permission prompts for this task
    #[arg(long = "skip-permissions")]
    pub skip_permissions: bool,
    /// Task ID (default: auto-generated from the title)
    #[arg(long = "id")]
    pub id: Option<String>,
}

#[derive(Debug, Parser)]
pub struct RunArgs {
    /// Skip the first-run safety prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
    /// Skip permission prompts for every task
    #[arg(long = "skip-permissions")]
    pub skip_permissions: bool,
    /// Silence timeout before a child is considered hung (e.g. "10m")
    #[arg(long = "hang-timeout")]
    pub hang_timeout: Option<String>,
}

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output in JSON format
    #[arg(long = "json")]
    pub json: bool,
    /// Output in CSV format
    #[arg(long = "csv")]
    pub csv: bool,
    /// Show working directory and source columns
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output in JSON format
    #[arg(long = "json")]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct TaskIdArgs {
    /// Task ID
    pub task_id: String,
}

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub cmd: ConfigCmd,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCmd {
    /// Set a configuration value
    Set(ConfigSetArgs),
    /// Get a configuration value
    Get(ConfigGetArgs),
    /// List all configuration values
    List,
    /// Print the config file path
    Path,
}

#[derive(Debug, Parser)]
pub struct ConfigSetArgs {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Parser)]
pub struct ConfigGetArgs {
    pub key: String,
}

#[derive(Debug, Parser)]
pub struct CompletionArgs {
    pub shell: clap_complete::Shell,
}

pub async fn main() -> ExitCode {
    init_tracing();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            ExitCode::from(1)
        }
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let paths = Paths::resolve();
    let project_dir = resolve_project_dir(cli.project_dir.as_deref());

    match cli.cmd {
        Commands::Add(args) => cmd_add(&paths, args),
        Commands::Run(args) => cmd_run(paths, project_dir, args).await,
        Commands::List(args) => cmd_list(&paths, project_dir.as_deref(), &args),
        Commands::Status(args) => cmd_status(&paths, project_dir.as_deref(), &args),
        Commands::Retry(args) => cmd_retry(&paths, &args.task_id),
        Commands::Cancel(args) => cmd_cancel(&paths, &args.task_id),
        Commands::Clean => cmd_clean(&paths, project_dir.as_deref()),
        Commands::Config(args) => cmd_config(&paths, args),
        Commands::Completion(args) => {
            let mut cmd = Cli::command();
            clap_complete::generate(
                args.shell,
                &mut cmd,
                "claude-autopilot",
                &mut std::io::stdout(),
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// The project-local task directory: `<project>/.autopilot/tasks`, with the
/// current directory as the default project.
fn resolve_project_dir(flag: Option<&str>) -> Option<PathBuf> {
    let root = match flag {
        Some(dir) => std::path::absolute(dir).unwrap_or_else(|_| PathBuf::from(dir)),
        None => std::env::current_dir().ok()?,
    };
    Some(root.join(".autopilot").join("tasks"))
}

fn cmd_add(paths: &Paths, args: AddArgs) -> anyhow::Result<ExitCode> {
    let abs_dir = std::path::absolute(&args.dir)
        .with_context(|| format!("resolve --dir {}", args.dir))?;
    let meta = std::fs::metadata(&abs_dir)
        .map_err(|_| AutopilotError::Other(format!("Directory {} does not exist", abs_dir.display())))?;
    if !meta.is_dir() {
        anyhow::bail!("--dir {} is not a directory", abs_dir.display());
    }

    paths.ensure_dirs()?;

    let title = match args.title {
        Some(t) if !t.trim().is_empty() => t,
        _ => queue::truncate_title(&args.prompt, 60),
    };

    let id = match args.id {
        Some(id) => {
            if !queue::is_valid_id(&id) {
                return Err(AutopilotError::InvalidTaskId(id).into());
            }
            id
        }
        None => queue::generate_id(&title),
    };

    let task = Task {
        id: id.clone(),
        title,
        priority: args.priority,
        created_at: Some(OffsetDateTime::now_utc()),
        working_dir: abs_dir.to_string_lossy().into_owned(),
        skip_permissions: args.skip_permissions,
        prompt: args.prompt,
        model: args.model.unwrap_or_default(),
        ..Task::default()
    };

    let task_path = paths.tasks_dir().join(format!("{id}.yaml"));
    if task_path.exists() {
        anyhow::bail!("task with id '{id}' already exists");
    }

    let data = serde_yaml::to_string(&task).context("serialize task")?;
    fsutil::atomic_write(&task_path, data.as_bytes())?;

    println!("Added task '{id}' (priority: {})", task.priority);
    Ok(ExitCode::SUCCESS)
}

async fn cmd_run(
    paths: Paths,
    project_dir: Option<PathBuf>,
    args: RunArgs,
) -> anyhow::Result<ExitCode> {
    let version = match compat::detect_version("claude") {
        Ok(v) => Some(v),
        Err(e) => {
            eprintln!("Failed to detect Claude Code version: {e:#}");
            return Ok(ExitCode::from(runner::EXIT_FATAL));
        }
    };
    let adapter = CliAdapter::for_version(version.as_deref());

    let matchers = matchers::load_matchers(&paths.matchers_file())?;
    let detector = Detector::new(
        matchers.rate_limit_patterns.clone(),
        adapter.rate_limit_exit_code(),
    )?;

    let mut overrides = BTreeMap::new();
    if args.skip_permissions {
        overrides.insert("skip_permissions".to_owned(), "true".to_owned());
    }
    if let Some(timeout) = args.hang_timeout {
        overrides.insert("hang_timeout".to_owned(), timeout);
    }
    let cfg = config::load(&paths, &overrides)?;
    let notifier = Notifier::new(&cfg);

    let mut r = Runner::new(paths, cfg, adapter, detector, notifier);
    r.project_dir = project_dir;
    r.yes = args.yes;
    r.prompt_patterns = matchers.prompt_patterns;

    Ok(ExitCode::from(r.run().await))
}

fn cmd_list(
    paths: &Paths,
    project_dir: Option<&std::path::Path>,
    args: &ListArgs,
) -> anyhow::Result<ExitCode> {
    paths.ensure_dirs()?;

    let store = StateStore::new(paths.state_dir());
    let (tasks, init_count) =
        queue::load_tasks_with_init(&paths.tasks_dir(), project_dir, &store)?;
    if init_count > 0 && !args.json && !args.csv {
        println!("Initialized state for {init_count} new task(s)");
    }

    if tasks.is_empty() {
        if args.json {
            println!("[]");
        } else {
            println!("No tasks found.");
        }
        return Ok(ExitCode::SUCCESS);
    }

    #[derive(serde::Serialize)]
    struct Row<'a> {
        position: usize,
        id: &'a str,
        priority: i64,
        status: TaskStatus,
        title: &'a str,
        working_dir: &'a str,
        source: &'a str,
    }

    let mut rows = Vec::new();
    for (i, task) in tasks.iter().enumerate() {
        let status = store
            .load(&task.id)?
            .map_or(TaskStatus::Pending, |st| st.status);
        rows.push(Row {
            position: i + 1,
            id: &task.id,
            priority: task.priority,
            status,
            title: &task.title,
            working_dir: &task.working_dir,
            source: &task.source,
        });
    }

    if args.json {
        let mut out = serde_json::to_string_pretty(&rows)?;
        out.push('\n');
        print!("{out}");
        return Ok(ExitCode::SUCCESS);
    }

    let mut t = if args.verbose {
        Table::new(["#", "ID", "PRIORITY", "STATUS", "TITLE", "WORKING_DIR", "SOURCE"])
    } else {
        Table::new(["#", "ID", "PRIORITY", "STATUS", "TITLE"])
    };
    for row in &rows {
        let mut title = row.title.to_owned();
        if title.chars().count() > 50 {
            title = format!("{}...", title.chars().take(50).collect::<String>());
        }
        let mut cells = vec![
            row.position.to_string(),
            row.id.to_owned(),
            row.priority.to_string(),
            row.status.to_string(),
            title,
        ];
        if args.verbose {
            cells.push(row.working_dir.to_owned());
            cells.push(row.source.to_owned());
        }
        t.row(cells);
    }
    if args.csv {
        t.write_csv()?;
    } else {
        t.print()?;
    }

    Ok(ExitCode::SUCCESS)
}

fn cmd_status(
    paths: &Paths,
    project_dir: Option<&std::path::Path>,
    args: &StatusArgs,
) -> anyhow::Result<ExitCode> {
    paths.ensure_dirs()?;

    let runner_info = match RunnerLock::try_acquire(&paths.lock_file())? {
        Some(probe) => {
            // We got the lock, so no runner is active.
            probe.release();
            None
        }
        None => Some(lock::read_info(&paths.lock_file()).ok()),
    };

    let store = StateStore::new(paths.state_dir());
    let (tasks, init_count) =
        queue::load_tasks_with_init(&paths.tasks_dir(), project_dir, &store)?;

    let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
    let mut active_task = String::new();
    let mut next_resume: Option<OffsetDateTime> = None;

    for task in &tasks {
        let st = store.load(&task.id)?;
        let status = st.as_ref().map_or(TaskStatus::Pending, |s| s.status);
        *counts.entry(status_label(status)).or_insert(0) += 1;

        if let Some(st) = st {
            if st.status == TaskStatus::Running && active_task.is_empty() {
                active_task = task.id.clone();
            }
            if st.status == TaskStatus::Waiting
                && let Some(at) = st.resume_at
                && next_resume.is_none_or(|cur| at < cur)
            {
                next_resume = Some(at);
            }
        }
    }

    let count = |label: &str| counts.get(label).copied().unwrap_or(0);
    let fmt_time = |t: OffsetDateTime| {
        t.format(&Rfc3339).unwrap_or_else(|_| "unknown".to_owned())
    };

    if args.json {
        #[derive(serde::Serialize)]
        struct RunnerOut {
            active: bool,
            #[serde(skip_serializing_if = "Option::is_none")]
            pid: Option<u32>,
            #[serde(skip_serializing_if = "Option::is_none")]
            since: Option<String>,
        }
        #[derive(serde::Serialize)]
        struct QueueOut {
            pending: usize,
            running: usize,
            waiting: usize,
            done: usize,
            failed: usize,
            cancelled: usize,
            total: usize,
            #[serde(skip_serializing_if = "Option::is_none")]
            active_task: Option<String>,
            #[serde(skip_serializing_if = "Option::is_none")]
            next_resume_at: Option<String>,
        }
        #[derive(serde::Serialize)]
        struct Out {
            runner: RunnerOut,
            queue: QueueOut,
        }

        let out = Out {
            runner: RunnerOut {
                active: runner_info.is_some(),
                pid: runner_info.as_ref().and_then(|i| i.as_ref()).map(|i| i.pid),
                since: runner_info
                    .as_ref()
                    .and_then(|i| i.as_ref())
                    .map(|i| fmt_time(i.acquired_at)),
            },
            queue: QueueOut {
                pending: count("pending"),
                running: count("running"),
                waiting: count("waiting"),
                done: count("done"),
                failed: count("failed"),
                cancelled: count("cancelled"),
                total: tasks.len(),
                active_task: (!active_task.is_empty()).then_some(active_task),
                next_resume_at: next_resume.map(fmt_time),
            },
        };
        let mut s = serde_json::to_string_pretty(&out)?;
        s.push('\n');
        print!("{s}");
        return Ok(ExitCode::SUCCESS);
    }

    match &runner_info {
        None => println!("Runner: idle (no active instance)"),
        Some(Some(info)) => println!(
            "Runner: active (PID {}, since {})",
            info.pid,
            fmt_time(info.acquired_at)
        ),
        Some(None) => println!("Runner: active (PID unknown)"),
    }
    println!();
    if init_count > 0 {
        println!("Initialized state for {init_count} new task(s)");
    }

    println!("Queue:");
    println!("  Pending:   {}", count("pending"));
    println!("  Running:   {}", count("running"));
    println!("  Waiting:   {}", count("waiting"));
    println!("  Done:      {}", count("done"));
    println!("  Failed:    {}", count("failed"));
    println!("  Cancelled: {}", count("cancelled"));
    println!("  Total:     {}", tasks.len());
    if !active_task.is_empty() {
        println!("  Active:    {active_task}");
    }
    if let Some(at) = next_resume {
        println!("  Next resume at: {}", fmt_time(at));
    }

    Ok(ExitCode::SUCCESS)
}

fn status_label(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Pending => "pending",
        TaskStatus::Running => "running",
        TaskStatus::Waiting => "waiting",
        TaskStatus::Done => "done",
        TaskStatus::Failed => "failed",
        TaskStatus::Cancelled => "cancelled",
    }
}

fn cmd_retry(paths: &Paths, task_id: &str) -> anyhow::Result<ExitCode> {
    paths.ensure_dirs()?;
    let store = StateStore::new(paths.state_dir());

    match RunnerLock::try_acquire(&paths.lock_file())? {
        Some(lock) => {
            // No runner is active; apply directly while holding the lock.
            let result = retry_direct(&store, task_id);
            lock.release();
            result?;
            println!("Reset task '{task_id}' to pending (attempt 0)");
        }
        None => {
            queue::control::append_command(
                &paths.control_dir(),
                &ControlCommand::new(ControlOp::Retry, task_id),
            )?;
            println!("Queued retry for {task_id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn retry_direct(store: &StateStore, task_id: &str) -> anyhow::Result<()> {
    let Some(mut st) = store.load(task_id)? else {
        anyhow::bail!("no state found for task {task_id}");
    };

    if !matches!(st.status, TaskStatus::Failed | TaskStatus::Cancelled) {
        anyhow::bail!(
            "Task '{task_id}' is {}, only failed/cancelled tasks can be retried",
            st.status
        );
    }

    // session_id and the output tail are preserved as context for the next
    // attempt.
    st.status = TaskStatus::Pending;
    st.attempt = 0;
    st.resume_at = None;
    store.save(&st)
}

fn cmd_cancel(paths: &Paths, task_id: &str) -> anyhow::Result<ExitCode> {
    paths.ensure_dirs()?;
    let store = StateStore::new(paths.state_dir());

    match RunnerLock::try_acquire(&paths.lock_file())? {
        Some(lock) => {
            let result = cancel_direct(&store, task_id);
            lock.release();
            result?;
        }
        None => {
            queue::control::append_command(
                &paths.control_dir(),
                &ControlCommand::new(ControlOp::Cancel, task_id),
            )?;
            println!("Queued cancel for {task_id}");
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cancel_direct(store: &StateStore, task_id: &str) -> anyhow::Result<()> {
    let mut st = store
        .load(task_id)?
        .unwrap_or_else(|| TaskState::pending(task_id));

    match st.status {
        TaskStatus::Done => {
            println!("Task '{task_id}' already completed");
            Ok(())
        }
        TaskStatus::Cancelled => Ok(()),
        TaskStatus::Running => {
            println!(
                "Task '{task_id}' is currently running. It will be marked cancelled after it \
                 completes or on next queue reload."
            );
            Ok(())
        }
        TaskStatus::Pending | TaskStatus::Waiting | TaskStatus::Failed => {
            if !valid_transition(st.status, TaskStatus::Cancelled) {
                return Err(AutopilotError::InvalidTransition {
                    id: task_id.to_owned(),
                    from: st.status.to_string(),
                    to: TaskStatus::Cancelled.to_string(),
                }
                .into());
            }
            st.status = TaskStatus::Cancelled;
            store.save(&st)?;
            println!("Cancelled task '{task_id}'");
            Ok(())
        }
    }
}

fn cmd_clean(paths: &Paths, project_dir: Option<&std::path::Path>) -> anyhow::Result<ExitCode> {
    paths.ensure_dirs()?;

    let temps = fsutil::clean_orphan_temps(&paths.sweep_dirs(project_dir))?;

    // Rotated log backups (*.log.N). Live logs and state files are never
    // touched here.
    let mut rotated = 0usize;
    if let Ok(entries) = std::fs::read_dir(paths.logs_dir()) {
        for entry in entries.filter_map(Result::ok) {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.contains(".log.") && !name.ends_with(".log") {
                if std::fs::remove_file(entry.path()).is_ok() {
                    rotated += 1;
                }
            }
        }
    }

    println!("Cleaned artifacts: {temps} temp files, {rotated} log files");
    Ok(ExitCode::SUCCESS)
}

fn cmd_config(paths: &Paths, args: ConfigArgs) -> anyhow::Result<ExitCode> {
    match args.cmd {
        ConfigCmd::Set(set) => {
            paths.ensure_dirs()?;
            config::set_value(paths, &set.key, &set.value)?;
            println!("Set {} = {}", set.key, set.value);
        }
        ConfigCmd::Get(get) => {
            let value = config::get_value(paths, &get.key)?;
            let source = config::value_source(paths, &get.key);
            println!("{} = {} (source: {})", get.key, value, source);
        }
        ConfigCmd::List => {
            for (key, value) in config::list_values(paths)? {
                let source = config::value_source(paths, &key);
                println!("{key:<25} = {value:<20} (source: {source})");
            }
        }
        ConfigCmd::Path => {
            println!("{}", paths.config_file().display());
        }
    }
    Ok(ExitCode::SUCCESS)
}
