use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn chat_search_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_chat-search"))
}

const EXPORT: &str = r#"{
  "name": "rust_chat",
  "messages": [
    {"id": 1, "type": "message", "text": "How do I share state between tokio tasks without a global?", "source": "rust_chat", "pub_time": 1700000000, "url": "https://t.me/rust_chat/1"},
    {"id": 2, "type": "message", "text": "Wrap it in an Arc and clone the handle into each task.", "reply_to_message_id": 1, "source": "rust_chat", "pub_time": 1700000060, "url": "https://t.me/rust_chat/2"},
    {"id": 3, "type": "service", "text": "", "source": "rust_chat"},
    {"id": 4, "type": "message", "text": ["Anyone tried ", {"type": "bold", "text": "x"}, "sqlx offline mode with workspaces? It keeps asking for DATABASE_URL."], "source": "rust_chat", "pub_time": 1700000100, "url": "https://t.me/rust_chat/4"},
    {"id": 5, "type": "message", "text": "ok", "source": "rust_chat", "pub_time": 1700000200, "url": "https://t.me/rust_chat/5"}
  ]
}"#;

/// Embeds each input as a 2-d vector derived from its length, one per input.
struct LengthEmbedder;

impl Respond for LengthEmbedder {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let body: serde_json::Value = serde_json::from_slice(&request.body).unwrap();
        let data: Vec<serde_json::Value> = body["input"]
            .as_array()
            .unwrap()
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let len = text.as_str().unwrap().len() as f64;
                serde_json::json!({"index": i, "embedding": [len, 1.0]})
            })
            .collect();
        ResponseTemplate::new(200).set_body_json(serde_json::json!({ "data": data }))
    }
}

fn setup_test_env(embedding_url: Option<&str>) -> (TempDir, PathBuf) {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().to_path_buf();

    let config_dir = root.join("config");
    fs::create_dir_all(&config_dir).unwrap();
    fs::create_dir_all(root.join("data")).unwrap();
    fs::write(root.join("data/result.json"), EXPORT).unwrap();

    let embedding = match embedding_url {
        Some(url) => format!(
            r#"[embedding]
provider = "openai"
model = "test-embedding"
dims = 2
url = "{}"
api_key_env = "CHAT_SEARCH_IT_KEY"
batch_size = 1
max_retries = 0
"#,
            url
        ),
        None => String::new(),
    };

    let config_content = format!(
        r#"[index]
vectors_path = "{root}/data/all_embeddings.vec"
metadata_path = "{root}/data/all_meta.jsonl"

[threads]
min_text_length = 50

{embedding}
"#,
        root = root.display(),
        embedding = embedding
    );

    let config_path = config_dir.join("chat-search.toml");
    fs::write(&config_path, config_content).unwrap();

    (tmp, config_path)
}

fn run_chat_search(config_path: &Path, args: &[&str]) -> (String, String, bool) {
    let binary = chat_search_binary();
    let output = Command::new(&binary)
        .arg("--config")
        .arg(config_path.to_str().unwrap())
        .arg("--progress")
        .arg("off")
        .args(args)
        .env("CHAT_SEARCH_IT_KEY", "sk-test")
        .output()
        .unwrap_or_else(|e| panic!("Failed to run chat-search binary at {:?}: {}", binary, e));

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn write_threads(config_path: &Path, root: &Path) -> PathBuf {
    let threads = root.join("data/threads.jsonl");
    let (stdout, stderr, success) = run_chat_search(
        config_path,
        &[
            "threads",
            root.join("data/result.json").to_str().unwrap(),
            threads.to_str().unwrap(),
        ],
    );
    assert!(success, "threads failed: {}", stderr);
    assert!(stdout.contains("threads written: 2"), "stdout: {}", stdout);
    threads
}

#[test]
fn test_threads_reconstructs_replies() {
    let (tmp, config_path) = setup_test_env(None);
    let threads = write_threads(&config_path, tmp.path());

    let content = fs::read_to_string(threads).unwrap();
    let lines: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(
        lines[0]["text"],
        "How do I share state between tokio tasks without a global?\n  Wrap it in an Arc and clone the handle into each task."
    );
    assert_eq!(
        lines[0]["urls"],
        serde_json::json!(["https://t.me/rust_chat/1", "https://t.me/rust_chat/2"])
    );
    assert_eq!(lines[0]["source"], "rust_chat");
    assert_eq!(lines[0]["pub_time"], 1700000000);
    assert!(lines[1]["text"]
        .as_str()
        .unwrap()
        .starts_with("Anyone tried sqlx offline mode"));
}

#[test]
fn test_threads_without_config_file() {
    let tmp = TempDir::new().unwrap();
    let input = tmp.path().join("result.json");
    let output = tmp.path().join("threads.jsonl");
    fs::write(&input, EXPORT).unwrap();

    let (stdout, stderr, success) = run_chat_search(
        &tmp.path().join("missing.toml"),
        &[
            "threads",
            input.to_str().unwrap(),
            output.to_str().unwrap(),
            "--min-text-length",
            "0",
        ],
    );
    assert!(success, "stderr: {}", stderr);
    assert!(stdout.contains("threads written: 3"), "stdout: {}", stdout);
}

#[test]
fn test_stats_on_empty_index() {
    let (_tmp, config_path) = setup_test_env(None);
    let (stdout, stderr, success) = run_chat_search(&config_path, &["stats"]);
    assert!(success, "stderr: {}", stderr);
    assert!(stdout.contains("Rows:        0"), "stdout: {}", stdout);
}

#[test]
fn test_search_without_index_fails() {
    let (_tmp, config_path) = setup_test_env(None);
    let (stdout, stderr, success) = run_chat_search(&config_path, &["search", "anything"]);
    assert!(!success, "stdout: {}", stdout);
    assert!(stderr.contains("is missing"), "stderr: {}", stderr);
}

#[test]
fn test_index_dry_run_needs_no_provider() {
    let (tmp, config_path) = setup_test_env(None);
    let threads = write_threads(&config_path, tmp.path());
    let (stdout, stderr, success) =
        run_chat_search(&config_path, &["index", threads.to_str().unwrap(), "--dry-run"]);
    assert!(success, "stderr: {}", stderr);
    assert!(stdout.contains("records needing embeddings: 2"), "stdout: {}", stdout);
}

#[test]
fn test_index_with_disabled_provider_fails() {
    let (tmp, config_path) = setup_test_env(None);
    let threads = write_threads(&config_path, tmp.path());
    let (_, stderr, success) = run_chat_search(&config_path, &["index", threads.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("disabled"), "stderr: {}", stderr);
}

#[test]
fn test_rollback_without_previous_generation_fails() {
    let (_tmp, config_path) = setup_test_env(None);
    let (_, stderr, success) = run_chat_search(&config_path, &["rollback"]);
    assert!(!success);
    assert!(stderr.contains("no previous generation"), "stderr: {}", stderr);
}

#[tokio::test]
async fn test_index_is_idempotent_and_searchable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/embeddings"))
        .respond_with(LengthEmbedder)
        .expect(3)
        .mount(&server)
        .await;

    let (tmp, config_path) = setup_test_env(Some(&server.uri()));
    let root = tmp.path().to_path_buf();

    let result = tokio::task::spawn_blocking(move || {
        let threads = write_threads(&config_path, &root);
        let threads = threads.to_str().unwrap().to_string();

        let first = run_chat_search(&config_path, &["index", &threads]);
        let second = run_chat_search(&config_path, &["index", &threads]);
        let stats = run_chat_search(&config_path, &["stats"]);
        let search = run_chat_search(&config_path, &["search", "tokio state", "--top-k", "1"]);
        (first, second, stats, search)
    })
    .await
    .unwrap();

    let (first, second, stats, search) = result;
    assert!(first.2, "first index failed: {}", first.1);
    assert!(first.0.contains("embedded: 2"), "stdout: {}", first.0);
    assert!(second.2, "second index failed: {}", second.1);
    assert!(second.0.contains("embedded: 0"), "stdout: {}", second.0);
    assert!(second.0.contains("already indexed: 2"), "stdout: {}", second.0);
    assert!(stats.0.contains("Rows:        2"), "stdout: {}", stats.0);
    assert!(stats.0.contains("rust_chat"), "stdout: {}", stats.0);
    assert!(search.2, "search failed: {}", search.1);
    assert!(search.0.contains("1. ["), "stdout: {}", search.0);
}
