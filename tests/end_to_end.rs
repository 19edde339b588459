//! End-to-end tests through the `tally` facade: config file, runtime and
//! writer handles together.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tally::{DocPath, DocumentStore, MemoryStore, Runtime, ShardedCounter, TallyConfig};
use tempfile::TempDir;

fn wait_for<F: FnMut() -> bool>(timeout: Duration, mut check: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn load_config(dir: &TempDir) -> TallyConfig {
    let file = dir.path().join(tally::CONFIG_FILE_NAME);
    std::fs::write(
        &file,
        r#"
shard_collection_id = "_shards_"
internal_state_path = "_state_/controller"

[worker]
tick_ms = 10
timeout_ms = 300

[controller]
schedule_interval_ms = 50
continuous_timeout_ms = 300
"#,
    )
    .unwrap();
    TallyConfig::from_file(&file).unwrap()
}

#[test]
fn test_counts_converge_with_config_from_file() {
    tally::init_tracing();
    let dir = TempDir::new().unwrap();
    let config = load_config(&dir);
    assert_eq!(config.worker.shards_limit, 100);

    let store = Arc::new(MemoryStore::new());
    let mut runtime = Runtime::start(Arc::clone(&store), config.clone()).unwrap();

    let page = DocPath::parse("pages/home").unwrap();
    let writers: Vec<_> = (0..3)
        .map(|_| {
            ShardedCounter::new(Arc::clone(&store), page.clone(), &config.shard_collection_id)
                .unwrap()
        })
        .collect();
    for (i, writer) in writers.iter().enumerate() {
        writer.increment_by("views", (i + 1) as i64).unwrap();
        writer.increment_by("stats.likes", 1).unwrap();
    }

    assert!(wait_for(Duration::from_secs(5), || {
        store
            .get(&page)
            .ok()
            .and_then(|s| s.data)
            .and_then(|d| d.get("views").and_then(|v| v.as_i64()))
            == Some(6)
    }));
    for writer in &writers {
        assert_eq!(writer.get("views").unwrap().as_i64(), Some(6));
        assert_eq!(writer.get("stats.likes").unwrap().as_i64(), Some(3));
    }
    runtime.shutdown();
}

#[test]
fn test_init_tracing_is_idempotent() {
    tally::init_tracing();
    assert!(!tally::init_tracing());
}

#[test]
fn test_bad_config_file_is_rejected() {
    let dir = TempDir::new().unwrap();
    let file = dir.path().join(tally::CONFIG_FILE_NAME);
    std::fs::write(&file, "[worker]\nshards_limit = 900\n").unwrap();
    assert!(TallyConfig::from_file(&file).is_err());
}
