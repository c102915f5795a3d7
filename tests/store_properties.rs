//! Durability and determinism properties of the file-backed stores.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use claude_autopilot::fsutil;
use claude_autopilot::queue::{self, StateStore, Task};

fn write_task_file(dir: &Path, name: &str, body: &str) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join(name), body).unwrap();
}

#[test]
fn readers_never_observe_partial_atomic_writes() {
    let td = tempfile::tempdir().expect("tempdir");
    let path = td.path().join("state.json");

    // Two distinct payloads, both large enough that a torn write would be
    // visible as a mixed or truncated read.
    let a = "A".repeat(64 * 1024);
    let b = "B".repeat(64 * 1024);
    fsutil::atomic_write(&path, a.as_bytes()).unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let path = path.clone();
        let stop = Arc::clone(&stop);
        let (a, b) = (a.clone(), b.clone());
        std::thread::spawn(move || {
            let mut observed = 0usize;
            while !stop.load(Ordering::Relaxed) {
                let data = std::fs::read_to_string(&path).unwrap();
                assert!(
                    data == a || data == b,
                    "observed a partial write of {} bytes",
                    data.len()
                );
                observed += 1;
            }
            observed
        })
    };

    for i in 0..200 {
        let payload = if i % 2 == 0 { &b } else { &a };
        fsutil::atomic_write(&path, payload.as_bytes()).unwrap();
    }

    stop.store(true, Ordering::Relaxed);
    let observed = reader.join().unwrap();
    assert!(observed > 0);
}

#[test]
fn concurrent_first_loads_agree_on_created_at() {
    let td = tempfile::tempdir().expect("tempdir");
    let state_dir = td.path().join("state");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let state_dir = state_dir.clone();
        handles.push(std::thread::spawn(move || {
            let store = StateStore::new(state_dir);
            let mut task = Task {
                id: "shared".to_owned(),
                prompt: "p".to_owned(),
                working_dir: "/tmp".to_owned(),
                ..Task::default()
            };
            store.ensure_init(&mut task).unwrap();
            task.created_at.unwrap()
        }));
    }

    let stamps: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(
        stamps.windows(2).all(|w| w[0] == w[1]),
        "created_at diverged across racing loaders: {stamps:?}"
    );
}

#[test]
fn execution_order_is_stable_across_invocations() {
    let td = tempfile::tempdir().expect("tempdir");
    let tasks_dir = td.path().join("tasks");
    let state_dir = td.path().join("state");

    write_task_file(
        &tasks_dir,
        "batch.yaml",
        "id: b-two\npriority: 2\nprompt: p\nworking_dir: /tmp\n\
         ---\n\
         id: a-two\npriority: 2\nprompt: p\nworking_dir: /tmp\n\
         ---\n\
         id: z-one\npriority: 1\nprompt: p\nworking_dir: /tmp\n",
    );
    write_task_file(
        &tasks_dir,
        "solo.yaml",
        "id: m-two\npriority: 2\nprompt: p\nworking_dir: /tmp\n",
    );

    // Each pass models a fresh process: new store handle, full reload.
    let mut orders = Vec::new();
    for _ in 0..3 {
        let store = StateStore::new(state_dir.clone());
        let (tasks, _) = queue::load_tasks_with_init(&tasks_dir, None, &store).unwrap();
        orders.push(
            tasks
                .iter()
                .map(|t| t.id.clone())
                .collect::<Vec<_>>(),
        );
    }

    assert_eq!(orders[0][0], "z-one");
    assert_eq!(orders[0], orders[1]);
    assert_eq!(orders[1], orders[2]);

    // Same-priority tasks order by their recorded created_at (with the id
    // tiebreaker); the exact permutation depends on init instants, but the
    // set is fixed and, per the assertions above, the order is durable.
    let mut same_priority: Vec<_> = orders[0][1..].to_vec();
    same_priority.sort();
    assert_eq!(same_priority, ["a-two", "b-two", "m-two"]);
}

#[test]
fn torn_trailing_control_line_does_not_block_drain() {
    use claude_autopilot::queue::control::{self, ControlCommand, ControlOp};

    let td = tempfile::tempdir().expect("tempdir");
    let dir = td.path().join("control");

    control::append_command(&dir, &ControlCommand::new(ControlOp::Retry, "ok-1")).unwrap();
    control::append_command(&dir, &ControlCommand::new(ControlOp::Cancel, "ok-2")).unwrap();

    // Simulate a crash mid-append: a torn line with no newline terminator.
    {
        use std::io::Write as _;
        let mut f = std::fs::OpenOptions::new()
            .append(true)
            .open(dir.join("commands.jsonl"))
            .unwrap();
        f.write_all(b"{\"op\":\"retry\",\"task_id\":\"to").unwrap();
    }

    let cmds = control::read_commands(&dir).unwrap();
    assert_eq!(cmds.len(), 2);
    assert_eq!(cmds[0].task_id, "ok-1");
    assert_eq!(cmds[1].task_id, "ok-2");

    control::clear_commands(&dir).unwrap();
    assert!(control::read_commands(&dir).unwrap().is_empty());
}

#[test]
fn orphan_sweep_spares_live_writers() {
    let td = tempfile::tempdir().expect("tempdir");
    let dir = td.path().to_path_buf();

    // A temp owned by this (live) process stays; the sweep must not race
    // in-flight writes.
    let live = dir.join(format!("x.state.json.tmp.{}.0badc0de", std::process::id()));
    std::fs::write(&live, b"in flight").unwrap();

    let n = fsutil::clean_orphan_temps(std::slice::from_ref(&dir)).unwrap();
    assert_eq!(n, 0);
    assert!(live.exists());
}
