//! Integration tests for storage-budget eviction.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use pretty_assertions::assert_eq;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rulebook_memory::{
    Config, Error, ExportFormat, MemoryManager, MemoryRecord, MemoryType, NewMemory,
    SearchRequest,
};
use tempfile::TempDir;
use tokio_test::assert_err;
use uuid::Uuid;

const VOCABULARY: &[&str] = &[
    "cache", "router", "token", "schema", "migration", "worker", "queue", "index", "shard",
    "latency", "timeout", "retry", "socket", "parser", "lexer", "buffer", "thread", "mutex",
    "deadlock", "snapshot", "replica", "leader", "follower", "quorum", "commit", "rollback",
    "bundle", "webpack", "component", "render", "hydrate", "session", "cookie", "header",
];

/// Reproducible pseudo-random text
fn sentence(rng: &mut StdRng) -> String {
    let len = rng.gen_range(8..20);
    (0..len)
        .map(|_| VOCABULARY[rng.gen_range(0..VOCABULARY.len())])
        .collect::<Vec<_>>()
        .join(" ")
}

async fn all_records(manager: &MemoryManager) -> Vec<MemoryRecord> {
    let json = manager.export_all(ExportFormat::Json).await.unwrap();
    serde_json::from_str(&json).unwrap()
}

#[tokio::test]
async fn test_cleanup_evicts_least_recently_accessed_to_target() {
    let dir = TempDir::new().unwrap();
    let config = Config::with_data_dir(dir.path().join("memory"));
    let mut rng = StdRng::seed_from_u64(42);

    let (usage, session_id) = {
        let manager = MemoryManager::open(config.clone()).await.unwrap();
        let active = manager.start_session("web").await.unwrap();
        let finished = manager.start_session("web").await.unwrap();

        for i in 0..500 {
            let mut memory = NewMemory::new("web", format!("Record {i}"), sentence(&mut rng));
            memory = match i % 10 {
                0 => memory.with_type(MemoryType::Decision),
                1 => memory.with_type(MemoryType::Change).in_session(active.id),
                2 => memory.with_type(MemoryType::Change).in_session(finished.id),
                _ => memory.with_type(MemoryType::Observation),
            };
            manager.save_memory(memory).await.unwrap();
        }
        manager.end_session(finished.id, None).await.unwrap();

        // The oldest fifty become the most recently accessed
        let records = all_records(&manager).await;
        let oldest: Vec<Uuid> = records.iter().take(50).map(|r| r.id).collect();
        manager.get_memory(&oldest).await.unwrap();

        let usage = manager.stats().await.unwrap().usage_bytes;
        manager.close().await.unwrap();
        (usage, active.id)
    };

    // Reopen with a budget well below current usage
    let config = Config {
        max_size_bytes: usage / 2,
        ..config
    };
    let manager = MemoryManager::open(config.clone()).await.unwrap();
    let before = all_records(&manager).await;
    assert_eq!(before.len(), 500);

    let report = manager.cleanup(true).await.unwrap();
    assert!(report.evicted_count > 0);
    assert_eq!(report.usage_before, usage);
    assert!(report.usage_after <= report.target_bytes);
    assert_eq!(report.target_bytes, config.eviction_target_bytes());
    assert_eq!(report.freed_bytes, report.usage_before - report.usage_after);

    let stats = manager.stats().await.unwrap();
    assert!(stats.usage_bytes <= config.max_size_bytes);
    assert_eq!(stats.record_count, 500 - report.evicted_count);
    assert_eq!(stats.index_health.lexical_entries, stats.record_count);
    assert_eq!(stats.index_health.vector_entries, stats.record_count);

    let after = all_records(&manager).await;
    let surviving: HashSet<Uuid> = after.iter().map(|r| r.id).collect();
    let protected = |r: &MemoryRecord| {
        r.memory_type == MemoryType::Decision || r.session_id == Some(session_id)
    };

    for record in &before {
        if protected(record) {
            assert!(surviving.contains(&record.id), "protected record evicted");
        }
    }

    let accessed: HashMap<Uuid, DateTime<Utc>> =
        before.iter().map(|r| (r.id, r.accessed_at)).collect();
    let newest_evicted = before
        .iter()
        .filter(|r| !surviving.contains(&r.id))
        .map(|r| accessed[&r.id])
        .max()
        .unwrap();
    for record in after.iter().filter(|r| !protected(*r)) {
        assert!(
            record.accessed_at >= newest_evicted,
            "surviving record {} is older than an evicted one",
            record.id
        );
    }

    // Recently accessed records outlive newer but untouched ones
    for record in before.iter().take(50) {
        assert!(surviving.contains(&record.id));
    }

    // Evicted records are gone from search as well
    let evicted: HashSet<Uuid> = before
        .iter()
        .map(|r| r.id)
        .filter(|id| !surviving.contains(id))
        .collect();
    let results = manager
        .search_memories(&SearchRequest::new("cache router token schema").with_limit(1000))
        .await
        .unwrap();
    assert!(results.hits.iter().all(|h| !evicted.contains(&h.id)));
}

#[tokio::test]
async fn test_cleanup_within_budget_is_noop() {
    let dir = TempDir::new().unwrap();
    let manager = MemoryManager::open(Config::with_data_dir(dir.path().join("memory")))
        .await
        .unwrap();
    for i in 0..10 {
        manager
            .save_memory(NewMemory::new("web", format!("Note {i}"), "small"))
            .await
            .unwrap();
    }

    let report = manager.cleanup(false).await.unwrap();
    assert_eq!(report.evicted_count, 0);
    assert_eq!(report.usage_before, report.usage_after);
    assert_eq!(manager.stats().await.unwrap().record_count, 10);
}

#[tokio::test]
async fn test_cleanup_reports_when_only_protected_records_remain() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_size_bytes: 1024,
        flush_every: 1000,
        ..Config::with_data_dir(dir.path().join("memory"))
    };
    let manager = MemoryManager::open(config).await.unwrap();

    for i in 0..3 {
        manager
            .save_memory(
                NewMemory::new("web", format!("Decision {i}"), "we chose sqlite for storage")
                    .with_type(MemoryType::Decision),
            )
            .await
            .unwrap();
    }
    for i in 0..2 {
        manager
            .save_memory(
                NewMemory::new("web", format!("Note {i}"), "plain observation")
                    .with_type(MemoryType::Observation),
            )
            .await
            .unwrap();
    }

    let err = assert_err!(manager.cleanup(true).await);
    match err {
        Error::CannotReclaim {
            evicted,
            usage_bytes,
            max_bytes,
            ..
        } => {
            assert_eq!(evicted, 2);
            assert_eq!(max_bytes, 1024);
            assert!(usage_bytes > max_bytes);
        }
        other => panic!("unexpected error: {other}"),
    }

    let remaining = all_records(&manager).await;
    assert_eq!(remaining.len(), 3);
    assert!(remaining
        .iter()
        .all(|r| r.memory_type == MemoryType::Decision));
}

#[tokio::test]
async fn test_automatic_eviction_never_fails_a_save() {
    let dir = TempDir::new().unwrap();
    let config = Config {
        max_size_bytes: 1024,
        flush_every: 1,
        ..Config::with_data_dir(dir.path().join("memory"))
    };
    let manager = MemoryManager::open(config).await.unwrap();

    for i in 0..5 {
        manager
            .save_memory(
                NewMemory::new("web", format!("Decision {i}"), "keep this forever")
                    .with_type(MemoryType::Decision),
            )
            .await
            .unwrap();
    }

    let stats = manager.stats().await.unwrap();
    assert_eq!(stats.record_count, 5);
    assert!(stats.usage_bytes > stats.max_bytes);
}
