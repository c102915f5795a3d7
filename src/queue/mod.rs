#![forbid(unsafe_code)]

//! Task discovery, validation, ordering, and per-task state I/O.
//!
//! Task definitions are user-authored YAML files (single or multi-document)
//! under a global directory plus an optional project-local directory. Runtime
//! state and the immutable init record live as JSON in the state directory
//! and are written through the atomic store.

pub mod control;
pub mod task;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::Context as _;
use rand::Rng as _;
use regex::Regex;
use time::OffsetDateTime;

use crate::error::AutopilotError;
use crate::fsutil;

pub use task::{Task, TaskInit, TaskState, TaskStatus, valid_transition};

static TASK_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").expect("task id regex"));

// Lines that are exactly "---" (with optional trailing whitespace) separate
// YAML documents.
static YAML_DOC_SEP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^---\s*$").expect("doc separator regex"));

/// Whether `id` matches the filesystem-safe task ID format.
#[must_use]
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64 && TASK_ID_RE.is_match(id)
}

/// Reads and writes per-task state and init records in one directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn state_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(AutopilotError::InvalidTaskId(id.to_owned()).into());
        }
        Ok(self.dir.join(format!("{id}.state.json")))
    }

    fn init_path(&self, id: &str) -> anyhow::Result<PathBuf> {
        if !is_valid_id(id) {
            return Err(AutopilotError::InvalidTaskId(id.to_owned()).into());
        }
        Ok(self.dir.join(format!("{id}.init.json")))
    }

    /// Loads the state record, or `None` when absent (implicit pending).
    pub fn load(&self, id: &str) -> anyhow::Result<Option<TaskState>> {
        let path = self.state_path(id)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let state = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(state))
    }

    pub fn save(&self, state: &TaskState) -> anyhow::Result<()> {
        let path = self.state_path(&state.id)?;
        let mut data = serde_json::to_vec_pretty(state)
            .with_context(|| format!("failed to serialize state for {}", state.id))?;
        data.push(b'\n');
        fsutil::atomic_write(&path, &data)
    }

    pub fn load_init(&self, id: &str) -> anyhow::Result<Option<TaskInit>> {
        let path = self.init_path(id)?;
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read {}", path.display()));
            }
        };
        let init = serde_json::from_slice(&data)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        Ok(Some(init))
    }

    /// Ensures an init record exists for the task (create-once). On the
    /// losing side of a race, `created_at` is canonicalized from the existing
    /// record. Returns whether this call created the record.
    pub fn ensure_init(&self, task: &mut Task) -> anyhow::Result<bool> {
        let created_at = task
            .created_at
            .unwrap_or_else(OffsetDateTime::now_utc);
        let init = TaskInit {
            id: task.id.clone(),
            created_at,
        };
        let mut data = serde_json::to_vec_pretty(&init)
            .with_context(|| format!("failed to serialize init for {}", task.id))?;
        data.push(b'\n');

        let path = self.init_path(&task.id)?;
        let created = fsutil::atomic_create(&path, &data)
            .with_context(|| format!("failed to create init file for {}", task.id))?;

        if created {
            task.created_at = Some(created_at);
        } else if let Some(existing) = self.load_init(&task.id)? {
            task.created_at = Some(existing.created_at);
        }

        Ok(created)
    }
}

/// Loads and merges task definitions from the global and (optional) project
/// directories, materializes init records so `created_at` is canonical,
/// rejects duplicate IDs, and returns tasks sorted by
/// `(priority ASC, created_at ASC, id ASC)`. The second value is the count of
/// newly initialized tasks.
pub fn load_tasks_with_init(
    global_dir: &Path,
    project_dir: Option<&Path>,
    store: &StateStore,
) -> anyhow::Result<(Vec<Task>, usize)> {
    let mut tasks = load_source_group(global_dir)
        .with_context(|| format!("load global tasks from {}", global_dir.display()))?;

    if let Some(project_dir) = project_dir {
        let project = load_source_group(project_dir)
            .with_context(|| format!("load project tasks from {}", project_dir.display()))?;
        tasks.extend(project);
    }

    let mut init_count = 0usize;
    for task in &mut tasks {
        if store
            .ensure_init(task)
            .with_context(|| format!("initialize task '{}'", task.id))?
        {
            init_count += 1;
        }
    }

    let mut seen: HashMap<String, String> = HashMap::new();
    for task in &tasks {
        if let Some(first) = seen.get(&task.id) {
            return Err(AutopilotError::DuplicateTaskId {
                id: task.id.clone(),
                first: first.clone(),
                second: task.source.clone(),
            }
            .into());
        }
        seen.insert(task.id.clone(), task.source.clone());
    }

    tasks.sort_by(|a, b| {
        let a_created = a.created_at.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        let b_created = b.created_at.unwrap_or(OffsetDateTime::UNIX_EPOCH);
        a.priority
            .cmp(&b.priority)
            .then_with(|| a_created.cmp(&b_created))
            .then_with(|| a.id.cmp(&b.id))
    });

    Ok((tasks, init_count))
}

// A source group is a task directory plus the companion multi-task files
// beside it: <parent>/tasks.yaml and <parent>/tasks.yml.
fn load_source_group(task_dir: &Path) -> anyhow::Result<Vec<Task>> {
    let mut all = load_tasks_from_dir(task_dir)?;

    if let Some(parent) = task_dir.parent() {
        for name in ["tasks.yaml", "tasks.yml"] {
            all.extend(load_tasks_from_file(&parent.join(name))?);
        }
    }

    Ok(all)
}

fn load_tasks_from_dir(dir: &Path) -> anyhow::Result<Vec<Task>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", dir.display())),
    };

    let mut names: Vec<String> = entries
        .filter_map(Result::ok)
        .filter(|e| !e.file_type().is_ok_and(|t| t.is_dir()))
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".yaml") || n.ends_with(".yml"))
        .collect();
    names.sort();

    let mut tasks = Vec::new();
    for name in names {
        tasks.extend(load_tasks_from_file(&dir.join(name))?);
    }
    Ok(tasks)
}

fn load_tasks_from_file(path: &Path) -> anyhow::Result<Vec<Task>> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    parse_multi_doc_yaml(&data, &path.to_string_lossy())
        .with_context(|| format!("parse {}", path.display()))
}

/// Splits a YAML stream on `---` separator lines and parses each document as
/// a task, applying defaults and validating. Empty documents are skipped,
/// but still count toward document numbering: whenever the split yields more
/// than one segment, every task's `source` carries a `#docN` suffix so
/// duplicate and validation errors stay attributable to the exact document.
pub fn parse_multi_doc_yaml(data: &str, source: &str) -> anyhow::Result<Vec<Task>> {
    let docs: Vec<&str> = YAML_DOC_SEP.split(data).collect();
    let multi = docs.len() > 1;

    let mut tasks = Vec::new();
    for (i, doc) in docs.into_iter().enumerate() {
        if doc.trim().is_empty() {
            continue;
        }

        let value: serde_yaml::Value = serde_yaml::from_str(doc)
            .with_context(|| format!("document {}", i + 1))?;
        if value.is_null() {
            continue;
        }

        let mut task: Task = serde_yaml::from_value(value)
            .with_context(|| format!("document {}", i + 1))?;

        task.source = if multi {
            format!("{source}#doc{}", i + 1)
        } else {
            source.to_owned()
        };

        apply_defaults(&mut task).with_context(|| format!("document {}", i + 1))?;
        validate_task(&task).with_context(|| format!("document {}", i + 1))?;
        tasks.push(task);
    }

    Ok(tasks)
}

fn apply_defaults(task: &mut Task) -> anyhow::Result<()> {
    if task.title.is_empty() && !task.prompt.is_empty() {
        task.title = truncate_title(&task.prompt, 60);
    }

    if task.id.is_empty() {
        if task.title.is_empty() {
            anyhow::bail!("task has no id, title, or prompt for ID generation");
        }
        task.id = generate_id(&task.title);
    }

    if task.priority == 0 {
        task.priority = 10;
    }
    if task.max_retries == 0 {
        task.max_retries = 5;
    }

    Ok(())
}

fn validate_task(task: &Task) -> anyhow::Result<()> {
    let label = if task.id.trim().is_empty() {
        "<unknown>"
    } else {
        &task.id
    };

    if task.id.trim().is_empty() {
        anyhow::bail!(
            "Task '{label}' ({}): missing required field 'id'",
            task.source
        );
    }
    if task.id.len() > 64 {
        anyhow::bail!(
            "Task '{label}' ({}): id must be <= 64 characters",
            task.source
        );
    }
    if !TASK_ID_RE.is_match(&task.id) {
        anyhow::bail!(
            "Task '{label}' ({}): id must match [a-z0-9-]",
            task.source
        );
    }
    if task.prompt.trim().is_empty() {
        anyhow::bail!(
            "Task '{label}' ({}): missing required field 'prompt'",
            task.source
        );
    }
    if task.working_dir.trim().is_empty() {
        anyhow::bail!(
            "Task '{label}' ({}): missing required field 'working_dir'",
            task.source
        );
    }
    if !Path::new(&task.working_dir).is_absolute() {
        anyhow::bail!(
            "Task '{label}': working_dir must be absolute (got '{}'). \
             Use 'add --dir' which resolves automatically.",
            task.working_dir
        );
    }
    Ok(())
}

/// First `max` characters of `s` with newlines flattened, trimmed to the last
/// space boundary when that doesn't cut away more than half the text.
#[must_use]
pub fn truncate_title(s: &str, max: usize) -> String {
    let flat: String = s
        .trim()
        .chars()
        .map(|c| if c == '\n' || c == '\r' { ' ' } else { c })
        .collect();

    if flat.chars().count() <= max {
        return flat;
    }

    let truncated: String = flat.chars().take(max).collect();
    match truncated.rfind(' ') {
        Some(idx) if idx > max / 2 => truncated[..idx].to_owned(),
        _ => truncated,
    }
}

/// Lowercased slug of `s`: alphanumerics kept, runs of anything else become a
/// single dash, no leading/trailing dashes, at most 64 characters.
#[must_use]
pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut prev_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_lowercase() || c.is_ascii_digit() {
            out.push(c);
            prev_dash = false;
        } else if !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }

    let mut out = out.trim_end_matches('-').to_owned();
    if out.len() > 64 {
        out.truncate(64);
        out = out.trim_end_matches('-').to_owned();
    }
    out
}

/// Slug of the title plus a 4-hex-character suffix, capped at 64 characters.
#[must_use]
pub fn generate_id(title: &str) -> String {
    let mut slug = slugify(title);
    if slug.is_empty() {
        slug = "task".to_owned();
    }

    let suffix: u16 = rand::thread_rng().r#gen();

    // Reserve "-" + 4 hex chars to stay within the 64-char limit.
    const SUFFIX_LEN: usize = 5;
    if slug.len() > 64 - SUFFIX_LEN {
        slug.truncate(64 - SUFFIX_LEN);
        slug = slug.trim_end_matches('-').to_owned();
    }

    format!("{slug}-{suffix:04x}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(td: &tempfile::TempDir) -> StateStore {
        StateStore::new(td.path().join("state"))
    }

    fn write_task(dir: &Path, name: &str, body: &str) {
        std::fs::create_dir_all(dir).unwrap();
        std::fs::write(dir.join(name), body).unwrap();
    }

    #[test]
    fn id_validation_rules() {
        assert!(is_valid_id("fix-tests-1a2b"));
        assert!(!is_valid_id(""));
        assert!(!is_valid_id("Has-Caps"));
        assert!(!is_valid_id("has_underscore"));
        assert!(!is_valid_id("dot./slash"));
        assert!(!is_valid_id(&"a".repeat(65)));
    }

    #[test]
    fn defaults_are_applied() {
        let tasks = parse_multi_doc_yaml(
            "prompt: fix the flaky integration tests in ci\nworking_dir: /tmp\n",
            "inline.yaml",
        )
        .unwrap();
        assert_eq!(tasks.len(), 1);
        let t = &tasks[0];
        assert_eq!(t.priority, 10);
        assert_eq!(t.max_retries, 5);
        assert_eq!(t.title, "fix the flaky integration tests in ci");
        assert!(t.id.starts_with("fix-the-flaky"), "{}", t.id);
        assert!(is_valid_id(&t.id));
    }

    #[test]
    fn multi_doc_gets_doc_provenance() {
        let yaml = "id: one\nprompt: p1\nworking_dir: /tmp\n---\nid: two\nprompt: p2\nworking_dir: /tmp\n";
        let tasks = parse_multi_doc_yaml(yaml, "tasks.yaml").unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].source, "tasks.yaml#doc1");
        assert_eq!(tasks[1].source, "tasks.yaml#doc2");
    }

    #[test]
    fn empty_documents_are_skipped_but_keep_numbering() {
        // Two empty segments precede the real document, so it is doc 3.
        let yaml = "---\n\n---\nid: only\nprompt: p\nworking_dir: /tmp\n";
        let tasks = parse_multi_doc_yaml(yaml, "tasks.yaml").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source, "tasks.yaml#doc3");
    }

    #[test]
    fn leading_separator_makes_a_single_doc_file_multi() {
        let yaml = "---\nid: solo\nprompt: p\nworking_dir: /tmp\n";
        let tasks = parse_multi_doc_yaml(yaml, "solo.yaml").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source, "solo.yaml#doc2");
    }

    #[test]
    fn plain_single_doc_keeps_bare_source() {
        let yaml = "id: plain\nprompt: p\nworking_dir: /tmp\n";
        let tasks = parse_multi_doc_yaml(yaml, "plain.yaml").unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].source, "plain.yaml");
    }

    #[test]
    fn relative_working_dir_is_rejected() {
        let err = parse_multi_doc_yaml(
            "id: bad\nprompt: p\nworking_dir: relative/path\n",
            "bad.yaml",
        )
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("working_dir must be absolute"),
            "{err:#}"
        );
    }

    #[test]
    fn missing_prompt_is_rejected() {
        let err =
            parse_multi_doc_yaml("id: bad\nworking_dir: /tmp\n", "bad.yaml").unwrap_err();
        assert!(format!("{err:#}").contains("missing required field 'prompt'"));
    }

    #[test]
    fn id_length_and_charset_get_distinct_errors() {
        let long = "a".repeat(65);
        let err = parse_multi_doc_yaml(
            &format!("id: {long}\nprompt: p\nworking_dir: /tmp\n"),
            "long.yaml",
        )
        .unwrap_err();
        assert!(
            format!("{err:#}").contains("id must be <= 64 characters"),
            "{err:#}"
        );

        let err = parse_multi_doc_yaml(
            "id: Bad_Chars\nprompt: p\nworking_dir: /tmp\n",
            "chars.yaml",
        )
        .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("id must match [a-z0-9-]"), "{msg}");
        assert!(!msg.contains("<= 64"), "{msg}");
    }

    #[test]
    fn duplicate_ids_across_sources_fail() {
        let td = tempfile::tempdir().expect("tempdir");
        let global = td.path().join("tasks");
        let project = td.path().join("proj");
        write_task(&global, "a.yaml", "id: same\nprompt: p\nworking_dir: /tmp\n");
        write_task(&project, "b.yaml", "id: same\nprompt: p\nworking_dir: /tmp\n");

        let err = load_tasks_with_init(&global, Some(&project), &store(&td)).unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("Duplicate task ID 'same'"), "{msg}");
        assert!(msg.contains("a.yaml") && msg.contains("b.yaml"), "{msg}");
    }

    #[test]
    fn ordering_is_priority_then_created_then_id() {
        let td = tempfile::tempdir().expect("tempdir");
        let global = td.path().join("tasks");
        write_task(
            &global,
            "z.yaml",
            "id: zeta\npriority: 5\nprompt: p\nworking_dir: /tmp\ncreated_at: 2026-01-02T00:00:00Z\n",
        );
        write_task(
            &global,
            "a.yaml",
            "id: alpha\npriority: 5\nprompt: p\nworking_dir: /tmp\ncreated_at: 2026-01-02T00:00:00Z\n",
        );
        write_task(
            &global,
            "b.yaml",
            "id: later\npriority: 5\nprompt: p\nworking_dir: /tmp\ncreated_at: 2026-03-01T00:00:00Z\n",
        );
        write_task(
            &global,
            "c.yaml",
            "id: urgent\npriority: 1\nprompt: p\nworking_dir: /tmp\ncreated_at: 2026-03-01T00:00:00Z\n",
        );

        let st = store(&td);
        let (tasks, init_count) = load_tasks_with_init(&global, None, &st).unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["urgent", "alpha", "zeta", "later"]);
        assert_eq!(init_count, 4);

        // Deterministic across reloads; nothing new to initialize.
        let (tasks2, init_count2) = load_tasks_with_init(&global, None, &st).unwrap();
        let ids2: Vec<_> = tasks2.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ids2);
        assert_eq!(init_count2, 0);
    }

    #[test]
    fn init_record_canonicalizes_created_at() {
        let td = tempfile::tempdir().expect("tempdir");
        let st = store(&td);

        let mut first = Task {
            id: "t".to_owned(),
            prompt: "p".to_owned(),
            working_dir: "/tmp".to_owned(),
            ..Task::default()
        };
        assert!(st.ensure_init(&mut first).unwrap());
        let canonical = first.created_at.unwrap();

        // A later load with its own created_at gets the recorded one.
        let mut second = Task {
            id: "t".to_owned(),
            created_at: Some(OffsetDateTime::now_utc() + time::Duration::days(1)),
            ..first.clone()
        };
        assert!(!st.ensure_init(&mut second).unwrap());
        assert_eq!(second.created_at.unwrap(), canonical);
    }

    #[test]
    fn companion_tasks_file_is_merged() {
        let td = tempfile::tempdir().expect("tempdir");
        let global = td.path().join("tasks");
        std::fs::create_dir_all(&global).unwrap();
        write_task(&global, "a.yaml", "id: in-dir\nprompt: p\nworking_dir: /tmp\n");
        std::fs::write(
            td.path().join("tasks.yaml"),
            "id: companion\nprompt: p\nworking_dir: /tmp\n",
        )
        .unwrap();

        let (tasks, _) = load_tasks_with_init(&global, None, &store(&td)).unwrap();
        let ids: Vec<_> = tasks.iter().map(|t| t.id.as_str()).collect();
        assert!(ids.contains(&"in-dir") && ids.contains(&"companion"), "{ids:?}");
    }

    #[test]
    fn state_roundtrip_and_implicit_pending() {
        let td = tempfile::tempdir().expect("tempdir");
        let st = store(&td);

        assert!(st.load("ghost").unwrap().is_none());

        let mut state = TaskState::pending("ghost");
        state.status = TaskStatus::Waiting;
        state.attempt = 3;
        st.save(&state).unwrap();

        let back = st.load("ghost").unwrap().unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn state_path_rejects_traversal() {
        let td = tempfile::tempdir().expect("tempdir");
        let st = store(&td);
        assert!(st.load("../escape").is_err());
    }

    #[test]
    fn slugify_and_generate_id() {
        assert_eq!(slugify("Fix the Build!"), "fix-the-build");
        assert_eq!(slugify("  weird -- spacing  "), "weird-spacing");
        assert_eq!(slugify("___"), "");

        let id = generate_id("Fix the Build!");
        assert!(id.starts_with("fix-the-build-"), "{id}");
        assert!(is_valid_id(&id));

        let long = generate_id(&"x".repeat(200));
        assert!(long.len() <= 64, "{}", long.len());
        assert!(is_valid_id(&long));
    }

    #[test]
    fn truncate_title_prefers_space_boundary() {
        assert_eq!(truncate_title("short", 60), "short");
        let t = truncate_title("one two three four five six seven eight nine", 20);
        assert!(t.len() <= 20);
        assert!(!t.ends_with(' '));
        assert_eq!(truncate_title("line\nbreaks\rhere", 60), "line breaks here");
    }
}
