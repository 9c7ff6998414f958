//! Sandboxed file access.

mod common;

use std::path::PathBuf;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tempfile::TempDir;
use tokio_test::assert_ok;

use common::Harness;
use irintai_plugins::SandboxedFileOps;

struct Sandbox {
    tmp: TempDir,
    ops: SandboxedFileOps,
}

impl Sandbox {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let shared = tmp.path().join("shared");
        std::fs::create_dir_all(&shared).unwrap();
        let ops = SandboxedFileOps::new(
            "notes",
            tmp.path().join("data").join("notes"),
            tmp.path().join("config").join("notes"),
            Some(&shared),
        );
        Self { tmp, ops }
    }

    fn data(&self, rel: &str) -> PathBuf {
        self.ops.data_dir().join(rel)
    }

    fn shared(&self, rel: &str) -> PathBuf {
        self.tmp.path().join("shared").join(rel)
    }
}

#[tokio::test]
async fn test_relative_paths_land_in_data_dir() {
    let sandbox = Sandbox::new();
    let ops = &sandbox.ops;

    assert!(ops.write("notes/today.md", "# Today").await);
    assert!(sandbox.data("notes/today.md").is_file());
    assert_eq!(ops.read("notes/today.md").await.as_deref(), Some("# Today"));

    assert!(ops.append("notes/today.md", "\n- buy milk").await);
    assert_eq!(
        ops.read("notes/today.md").await.as_deref(),
        Some("# Today\n- buy milk")
    );
    assert_eq!(ops.read_bytes("notes/today.md").await.map(|b| b.len()), Some(18));
}

#[tokio::test]
async fn test_config_dir_is_writable() {
    let sandbox = Sandbox::new();
    let target = sandbox.ops.config_dir().join("state.json");

    assert!(sandbox.ops.save_json(&target, &json!({"seen": 2})).await);
    let value: Option<Value> = sandbox.ops.load_json(&target).await;
    assert_eq!(value, Some(json!({"seen": 2})));
}

#[tokio::test]
async fn test_refuses_escapes() {
    let sandbox = Sandbox::new();
    let ops = &sandbox.ops;
    let outside = sandbox.tmp.path().join("outside.txt");
    std::fs::write(&outside, "secret").unwrap();

    assert_eq!(ops.read(&outside).await, None);
    assert_eq!(ops.read("../../outside.txt").await, None);
    assert!(!ops.write("../../outside.txt", "overwritten").await);
    assert!(!ops.write("../evil/x.txt", "x").await);
    assert!(!ops.delete(&outside).await);
    assert!(!ops.copy(&outside, "stolen.txt").await);

    assert_eq!(std::fs::read_to_string(&outside).unwrap(), "secret");
    assert!(!sandbox.tmp.path().join("data").join("evil").exists());
    assert!(!sandbox.data("stolen.txt").exists());
}

#[tokio::test]
async fn test_shared_dir_is_read_only() {
    let sandbox = Sandbox::new();
    let ops = &sandbox.ops;
    let prompt = sandbox.shared("prompt.txt");
    std::fs::write(&prompt, "You are helpful.").unwrap();

    assert_eq!(ops.read(&prompt).await.as_deref(), Some("You are helpful."));
    assert!(!ops.write(&prompt, "changed").await);
    assert!(!ops.write(sandbox.shared("new.txt"), "x").await);
    assert!(!ops.delete(&prompt).await);
    assert!(!ops.move_file(&prompt, "prompt.txt").await);

    let info = ops.file_info(&prompt).await.unwrap();
    assert!(info.readonly);
    assert_eq!(info.name, "prompt.txt");

    assert!(ops.copy(&prompt, "copies/prompt.txt").await);
    assert_eq!(
        ops.read("copies/prompt.txt").await.as_deref(),
        Some("You are helpful.")
    );
    assert!(!sandbox.shared("new.txt").exists());
    assert_eq!(std::fs::read_to_string(&prompt).unwrap(), "You are helpful.");
}

#[tokio::test]
async fn test_list_files() {
    let sandbox = Sandbox::new();
    let ops = &sandbox.ops;
    assert!(ops.write("a.json", "{}").await);
    assert!(ops.write("sub/b.json", "{}").await);
    assert!(ops.write("sub/c.txt", "c").await);

    assert_eq!(
        ops.list_files(".", &[".json"]).await,
        vec![sandbox.data("a.json"), sandbox.data("sub/b.json")]
    );
    assert_eq!(ops.list_files("sub", &[]).await.len(), 2);
    assert!(ops.list_files("missing", &[]).await.is_empty());
    assert!(ops.list_files("/", &[]).await.is_empty());
}

#[tokio::test]
async fn test_file_info() {
    let sandbox = Sandbox::new();
    assert!(sandbox.ops.write("report.csv", "a,b\n1,2\n").await);

    let info = sandbox.ops.file_info("report.csv").await.unwrap();
    assert_eq!(info.path, sandbox.data("report.csv"));
    assert_eq!(info.extension, ".csv");
    assert_eq!(info.size, 8);
    assert!(!info.is_dir);
    assert!(!info.readonly);
    assert!(info.modified.is_some());

    assert!(sandbox.ops.file_info("nope.csv").await.is_none());
}

#[tokio::test]
async fn test_move_and_delete() {
    let sandbox = Sandbox::new();
    let ops = &sandbox.ops;
    assert!(ops.write("inbox/item.txt", "x").await);

    assert!(ops.move_file("inbox/item.txt", "archive/item.txt").await);
    assert!(!sandbox.data("inbox/item.txt").exists());
    assert!(sandbox.data("archive/item.txt").is_file());

    assert!(!ops.delete(".").await);
    assert!(!ops.delete(ops.config_dir()).await);
    assert!(ops.data_dir().is_dir());

    assert!(ops.delete("archive").await);
    assert!(!sandbox.data("archive").exists());
    assert!(!ops.delete("archive").await);
}

#[tokio::test]
async fn test_temp_files() {
    let sandbox = Sandbox::new();
    let ops = &sandbox.ops;

    let path = ops.create_temp_file(Some(".txt"), "scratch").await.unwrap();
    assert!(path.starts_with(sandbox.data("temp")));
    let name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(name.starts_with("notes_"));
    assert!(name.ends_with(".txt"));
    assert_eq!(ops.read(&path).await.as_deref(), Some("scratch"));

    assert_eq!(ops.cleanup_temp_files(Duration::from_secs(3600)).await, 0);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(ops.cleanup_temp_files(Duration::ZERO).await, 1);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_sdk_data_round_trip() {
    let harness = Harness::new();
    harness.add("notes", harness.factory("Notes"));
    let manager = harness.manager().await;
    assert_ok!(manager.load("notes").await);
    let sdk = harness.journal.sdk("notes");

    assert_eq!(sdk.data_dir(), harness.paths().plugin_data_dir("notes").unwrap());
    assert_eq!(sdk.load_data::<Value>(None).await, None);

    let data = json!({"notes": ["one", "two"]});
    assert!(sdk.save_data(&data, None).await);
    assert!(sdk.data_dir().join("plugin_data.json").is_file());
    assert_eq!(sdk.load_data::<Value>(None).await, Some(data));

    assert!(sdk.save_data(&json!([1, 2]), Some("numbers.json")).await);
    assert_eq!(
        sdk.load_data::<Vec<u32>>(Some("numbers.json")).await,
        Some(vec![1, 2])
    );

    let escape = harness.paths().plugin_data_dir("other").unwrap().join("x.json");
    assert!(!sdk.files().write(&escape, "{}").await);
}
