//! Integration tests for fire-and-forget capture.

use std::io;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use rulebook_memory::{CaptureHook, Config, ExportFormat, MemoryManager, MemoryRecord, NewMemory};
use tempfile::TempDir;
use uuid::Uuid;

/// Collects formatted log output in memory
#[derive(Clone, Default)]
struct LogBuffer(Arc<Mutex<Vec<u8>>>);

impl LogBuffer {
    fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

async fn open(dir: &TempDir) -> Arc<MemoryManager> {
    Arc::new(
        MemoryManager::open(Config::with_data_dir(dir.path().join("memory")))
            .await
            .unwrap(),
    )
}

async fn saved(manager: &MemoryManager) -> Vec<MemoryRecord> {
    let json = manager.export_all(ExportFormat::Json).await.unwrap();
    serde_json::from_str(&json).unwrap()
}

#[tokio::test]
async fn test_captured_memories_are_saved_in_background() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir).await;
    let (hook, worker) = CaptureHook::spawn(manager.clone(), 16);

    for i in 0..5 {
        assert!(hook.capture(NewMemory::new(
            "web",
            format!("Tool call {i}"),
            format!("ran cargo test <private>API_KEY={i}</private>pass {i}"),
        )));
    }
    // Failures stay inside the worker
    assert!(hook.capture(NewMemory::new("web", "", "no title")));

    drop(hook);
    worker.await.unwrap();

    let records = saved(&manager).await;
    assert_eq!(records.len(), 5);
    assert!(records.iter().all(|r| !r.content.contains("API_KEY")));
    assert_eq!(records[0].title, "Tool call 0");
}

#[tokio::test]
async fn test_full_queue_drops_instead_of_blocking() {
    let dir = TempDir::new().unwrap();
    let manager = open(&dir).await;
    let (hook, worker) = CaptureHook::spawn(manager.clone(), 1);

    // The worker cannot run before this task yields
    assert!(hook.capture(NewMemory::new("web", "First", "queued")));
    assert!(!hook.capture(NewMemory::new("web", "Second", "dropped")));

    let clone = hook.clone();
    drop(hook);
    drop(clone);
    worker.await.unwrap();

    let records = saved(&manager).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].title, "First");
}

#[tokio::test]
async fn test_dropped_and_failed_captures_keep_private_text_out_of_logs() {
    let logs = LogBuffer::default();
    let writer = logs.clone();
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_ansi(false)
        .with_writer(move || writer.clone())
        .finish();
    let _guard = tracing::subscriber::set_default(subscriber);

    let dir = TempDir::new().unwrap();
    let manager = open(&dir).await;
    let (hook, worker) = CaptureHook::spawn(manager.clone(), 1);

    // Rejected by the worker: the session does not exist
    assert!(hook.capture(
        NewMemory::new("web", "Key <private>abc123</private>", "body").in_session(Uuid::new_v4())
    ));
    // Dropped: the queue holds one item
    assert!(!hook.capture(NewMemory::new(
        "web",
        "Other <private>def456</private>",
        "<private>def456</private> body",
    )));

    drop(hook);
    worker.await.unwrap();

    let output = logs.contents();
    assert!(output.contains("Capture queue full"));
    assert!(output.contains("Failed to capture memory"));
    assert!(!output.contains("abc123"));
    assert!(!output.contains("def456"));
    assert!(saved(&manager).await.is_empty());
}
