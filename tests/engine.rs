//! End-to-end tests over a temporary project workspace.
//!
//! Exercises the contract the engine promises to agents: read-before-write
//! enforcement, per-path FIFO serialization, cascade replacement through
//! the tool surface, and all-or-nothing patch validation.

use filetime::FileTime;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use workspace_patcher::{
    ChangeAction, ChangeNotifier, FileChange, FileTools, LockManager, ReadLedger, ToolError,
    ToolInput,
};

fn workspace() -> TempDir {
    let dir = TempDir::new().unwrap();
    fs::create_dir_all(dir.path().join("src")).unwrap();
    fs::write(
        dir.path().join("src/app.ts"),
        "function f() {\n  const a = 1;\n\n  const b = 2;\n}\n",
    )
    .unwrap();
    fs::write(dir.path().join("src/util.ts"), "export const N = 1;\n").unwrap();
    dir
}

fn input(pairs: &[(&str, Value)]) -> ToolInput {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn path_arg(dir: &TempDir, rel: &str) -> Value {
    json!(dir.path().join(rel).to_string_lossy())
}

#[derive(Default)]
struct RecordingNotifier {
    changes: Mutex<Vec<FileChange>>,
    reloads: Mutex<usize>,
}

impl ChangeNotifier for RecordingNotifier {
    fn file_changed(&self, _project_id: &str, change: &FileChange) {
        self.changes.lock().unwrap().push(change.clone());
    }

    fn request_reload(&self, _project_id: &str) {
        *self.reloads.lock().unwrap() += 1;
    }
}

#[test]
fn read_edit_patch_workflow() {
    let dir = workspace();
    let notifier = Arc::new(RecordingNotifier::default());
    let tools = FileTools::with_notifier(dir.path(), "proj", "s1", notifier.clone());

    let app = path_arg(&dir, "src/app.ts");
    tools.file_read(&input(&[("file_path", app.clone())])).unwrap();

    // Cascade edit with drifted indentation in the search text.
    tools
        .file_edit(&input(&[
            ("file_path", app.clone()),
            ("old_string", json!("const a = 1;")),
            ("new_string", json!("const a = 10;")),
        ]))
        .unwrap();

    // Patch the same file through the two-phase pipeline; the edit above
    // refreshed the read baseline, so no re-read is needed.
    let patch = format!(
        "*** Begin Patch\n*** Update File: {}\n@@ function f()\n const a = 10;\n\n-const b = 2;\n+const b = 3;\n*** End Patch",
        dir.path().join("src/app.ts").to_string_lossy()
    );
    tools.file_patch(&input(&[("patch", json!(patch))])).unwrap();

    let final_content = fs::read_to_string(dir.path().join("src/app.ts")).unwrap();
    assert!(final_content.contains("const a = 10;"));
    assert!(final_content.contains("const b = 3;"));
    assert!(final_content.contains("\n\n"), "blank line must survive");

    // One change per mutation, one reload per accepted operation.
    assert_eq!(notifier.changes.lock().unwrap().len(), 2);
    assert_eq!(*notifier.reloads.lock().unwrap(), 2);
}

#[test]
fn ledger_strictly_greater_mtime_scenario() {
    let dir = workspace();
    let ledger = ReadLedger::new();
    let file = dir.path().join("src/util.ts");

    filetime::set_file_mtime(&file, FileTime::from_unix_time(1, 0)).unwrap();
    ledger.record_read(dir.path(), "s1", &file).unwrap();

    // Same mtime (1000ms): equal passes.
    assert!(ledger.assert_read(dir.path(), "s1", &file).is_ok());

    // 1001ms: strictly greater fails.
    filetime::set_file_mtime(&file, FileTime::from_unix_time(1, 1_000_000)).unwrap();
    let result = ledger.assert_read(dir.path(), "s1", &file);
    assert!(matches!(
        result,
        Err(workspace_patcher::LedgerError::FileChangedExternally { .. })
    ));
}

#[test]
fn lock_fifo_side_effects_in_start_order() {
    // Scenario: a slow operation started first must land its side effect
    // before a fast operation started second.
    let locks = Arc::new(LockManager::new());
    let order = Arc::new(Mutex::new(Vec::new()));

    let l1 = locks.clone();
    let o1 = order.clone();
    let slow = thread::spawn(move || {
        l1.with_lock(Path::new("/a.ts"), || {
            thread::sleep(Duration::from_millis(10));
            o1.lock().unwrap().push(1);
        });
    });
    thread::sleep(Duration::from_millis(2));

    let l2 = locks.clone();
    let o2 = order.clone();
    let fast = thread::spawn(move || {
        l2.with_lock(Path::new("/a.ts"), || {
            o2.lock().unwrap().push(2);
        });
    });

    slow.join().unwrap();
    fast.join().unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn patch_atomicity_across_files() {
    let dir = workspace();
    let tools = FileTools::new(dir.path(), "proj", "s1");

    let util = path_arg(&dir, "src/util.ts");
    tools.file_read(&input(&[("file_path", util)])).unwrap();

    // Valid Add plus an Update whose context line does not exist: neither
    // file may be written.
    let patch = format!(
        "*** Begin Patch\n*** Add File: src/brand-new.ts\n+export {{}};\n*** Update File: {}\n@@ function missing()\n-export const N = 1;\n+export const N = 2;\n*** End Patch",
        dir.path().join("src/util.ts").to_string_lossy()
    );
    let result = tools.file_patch(&input(&[("patch", json!(patch))]));
    assert!(matches!(result, Err(ToolError::PatchApplyFailed(_))));

    assert!(!dir.path().join("src/brand-new.ts").exists());
    assert_eq!(
        fs::read_to_string(dir.path().join("src/util.ts")).unwrap(),
        "export const N = 1;\n"
    );
}

#[test]
fn patch_add_move_delete() {
    let dir = workspace();
    let tools = FileTools::new(dir.path(), "proj", "s1");

    let app = path_arg(&dir, "src/app.ts");
    tools.file_read(&input(&[("file_path", app)])).unwrap();

    let patch = format!(
        "*** Begin Patch\n*** Add File: src/created.ts\n+export const made = true;\n*** Update File: {app}\n*** Move to: src/moved.ts\n@@\n-  const b = 2;\n+  const b = 20;\n*** Delete File: {util}\n*** End Patch",
        app = dir.path().join("src/app.ts").to_string_lossy(),
        util = dir.path().join("src/util.ts").to_string_lossy(),
    );
    let output = tools.file_patch(&input(&[("patch", json!(patch))])).unwrap();

    assert!(dir.path().join("src/created.ts").exists());
    assert!(!dir.path().join("src/app.ts").exists());
    assert!(!dir.path().join("src/util.ts").exists());
    let moved = fs::read_to_string(dir.path().join("src/moved.ts")).unwrap();
    assert!(moved.contains("const b = 20;"));

    // Add → create; move → delete + create; delete → delete.
    let actions: Vec<ChangeAction> = output.changes.iter().map(|c| c.action).collect();
    assert_eq!(
        actions,
        vec![
            ChangeAction::Create,
            ChangeAction::Delete,
            ChangeAction::Create,
            ChangeAction::Delete,
        ]
    );
}

#[test]
fn sessions_contend_on_shared_registries() {
    let dir = workspace();
    let tools_a = FileTools::new(dir.path(), "proj", "session-a");
    let tools_b = tools_a.sharing_registries("session-b");

    let util = path_arg(&dir, "src/util.ts");
    tools_a.file_read(&input(&[("file_path", util.clone())])).unwrap();

    // Session B never read the file; its edit must be refused even though
    // session A's read is on record.
    let result = tools_b.file_edit(&input(&[
        ("file_path", util.clone()),
        ("old_string", json!("export const N = 1;")),
        ("new_string", json!("export const N = 2;")),
    ]));
    assert!(matches!(result, Err(ToolError::FileNotRead(_))));

    // Session A's edit goes through.
    tools_a
        .file_edit(&input(&[
            ("file_path", util),
            ("old_string", json!("export const N = 1;")),
            ("new_string", json!("export const N = 2;")),
        ]))
        .unwrap();
    assert_eq!(
        fs::read_to_string(dir.path().join("src/util.ts")).unwrap(),
        "export const N = 2;\n"
    );
}

#[test]
fn replace_round_trip_through_tools() {
    let dir = workspace();
    let tools = FileTools::new(dir.path(), "proj", "s1");
    let app = path_arg(&dir, "src/app.ts");
    let original = fs::read_to_string(dir.path().join("src/app.ts")).unwrap();

    tools.file_read(&input(&[("file_path", app.clone())])).unwrap();
    tools
        .file_edit(&input(&[
            ("file_path", app.clone()),
            ("old_string", json!("const b = 2;")),
            ("new_string", json!("const b = 99;")),
        ]))
        .unwrap();
    tools
        .file_edit(&input(&[
            ("file_path", app),
            ("old_string", json!("const b = 99;")),
            ("new_string", json!("const b = 2;")),
        ]))
        .unwrap();

    assert_eq!(
        fs::read_to_string(dir.path().join("src/app.ts")).unwrap(),
        original
    );
}

#[test]
fn clear_session_forces_reread() {
    let dir = workspace();
    let tools = FileTools::new(dir.path(), "proj", "s1");
    let util = path_arg(&dir, "src/util.ts");

    tools.file_read(&input(&[("file_path", util.clone())])).unwrap();
    tools.clear_session().unwrap();

    let result = tools.file_edit(&input(&[
        ("file_path", util),
        ("old_string", json!("export const N = 1;")),
        ("new_string", json!("export const N = 2;")),
    ]));
    assert!(matches!(result, Err(ToolError::FileNotRead(_))));
}
