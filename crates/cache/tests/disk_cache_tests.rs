//! Integration tests for the disk-backed cache
//!
//! Covers crash atomicity (simulated by abandoning writes midway), on-disk
//! corruption, and concurrent access from several threads.

use memento_cache::{
    AtomicFile, Cache, DiskCache, Error, FunctionKey, InputKey, Metadata, create_metadata,
};
use serde_json::json;
use std::io::Write;
use std::sync::{Arc, Barrier};
use std::thread;
use tempfile::TempDir;

fn key(function: &str, input: &str) -> InputKey {
    FunctionKey::new(function).unwrap().input(input).unwrap()
}

/// Route cache logs to the test output; `RUST_LOG=memento_cache=trace` shows them
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn staging(cache: &DiskCache) -> std::path::PathBuf {
    cache.root().join("staging")
}

#[test]
fn test_crash_before_output_rename_leaves_nothing_visible() {
    let tmp = TempDir::new().unwrap();
    let cache = DiskCache::new(tmp.path());
    let k = key("crash", "1");
    let dest = cache.get_output_path(&k).unwrap();
    std::fs::create_dir_all(dest.parent().unwrap()).unwrap();
    std::fs::create_dir_all(staging(&cache)).unwrap();

    // Writer dies after writing bytes but before the rename
    let mut pending = AtomicFile::create(&staging(&cache), &dest).unwrap();
    pending.write_all(b"half of the out").unwrap();
    let temp_path = pending.temp_path().to_path_buf();
    std::mem::forget(pending);

    assert!(temp_path.exists());
    assert!(!dest.exists());
    assert!(!cache.exists(&k).unwrap());
    assert!(cache.list(k.function_key()).unwrap().is_empty());
    assert!(cache.read(&k).unwrap_err().is_not_found());
}

#[test]
fn test_crash_between_output_and_metadata_leaves_nothing_visible() {
    let tmp = TempDir::new().unwrap();
    let cache = DiskCache::new(tmp.path());
    let k = key("crash", "1");

    cache.write(b"previous", &Metadata::new(), &k).unwrap();
    // An overwrite that dies after evicting and storing the new output
    cache.evict(&k).unwrap();
    cache.write_output(b"replacement", &k).unwrap();

    assert!(!cache.exists(&k).unwrap());
    assert!(cache.list(k.function_key()).unwrap().is_empty());
    assert!(cache.load_metadata(&k).unwrap_err().is_not_found());

    // A later complete write recovers the key
    cache.write(b"replacement", &Metadata::new(), &k).unwrap();
    assert_eq!(cache.read(&k).unwrap(), b"replacement");
}

#[test]
fn test_purge_staging_collects_crash_debris() {
    let tmp = TempDir::new().unwrap();
    let cache = DiskCache::new(tmp.path());
    let k = key("crash", "1");
    std::fs::create_dir_all(staging(&cache)).unwrap();

    let mut pending = AtomicFile::create(&staging(&cache), cache.get_output_path(&k).unwrap())
        .unwrap();
    pending.write_all(b"abandoned").unwrap();
    std::mem::forget(pending);

    assert_eq!(
        cache.purge_staging(std::time::Duration::ZERO).unwrap(),
        1
    );
    assert_eq!(std::fs::read_dir(staging(&cache)).unwrap().count(), 0);
}

#[test]
fn test_truncated_output_is_corruption() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let cache = DiskCache::new(tmp.path());
    let k = key("corrupt", "1");

    cache.write(b"0123456789", &Metadata::new(), &k).unwrap();
    std::fs::write(cache.get_output_path(&k).unwrap(), b"01234").unwrap();

    // Size mismatch already hides the entry
    assert!(!cache.exists(&k).unwrap());
    let err = cache.read(&k).unwrap_err();
    assert!(err.is_corruption(), "unexpected error: {err}");
    assert!(err.to_string().contains("5 bytes"));

    // Evicting and rewriting heals it
    cache.evict(&k).unwrap();
    cache.write(b"0123456789", &Metadata::new(), &k).unwrap();
    assert_eq!(cache.read(&k).unwrap(), b"0123456789");
}

#[test]
fn test_create_metadata_round_trips() {
    let tmp = TempDir::new().unwrap();
    let cache = DiskCache::new(tmp.path());
    let k = InputKey::from_serializable(
        FunctionKey::new("model.fit").unwrap(),
        &json!({"epochs": 3, "lr": "0.1"}),
    )
    .unwrap();
    let output = b"weights".to_vec();
    let metadata = create_metadata(&k, &output, json!({"format": "bin"}));

    cache.write(&output, &metadata, &k).unwrap();

    assert_eq!(cache.load_metadata(&k).unwrap(), metadata);
    assert_eq!(metadata["input_id"], json!(k.id()));
    assert_eq!(metadata["output_size"], json!(7));
}

#[test]
fn test_from_env_uses_override() {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path().join("env-root");
    temp_env::with_var("MEMENTO_CACHE_DIR", Some(&root), || {
        let cache = DiskCache::from_env().unwrap();
        assert_eq!(cache.root(), root.as_path());
        let k = key("env", "1");
        cache.write(b"x", &Metadata::new(), &k).unwrap();
        assert!(root.join("functions").is_dir());
    });
}

#[test]
fn test_concurrent_writers_never_tear() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(DiskCache::new(tmp.path()));
    let k = key("race", "shared");
    let writers = 4;
    let barrier = Arc::new(Barrier::new(writers + 1));

    let mut handles = Vec::new();
    for w in 0..writers {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        let k = k.clone();
        handles.push(thread::spawn(move || {
            let byte = u8::try_from(w).unwrap();
            let payload = vec![byte; 64 * 1024];
            let mut metadata = Metadata::new();
            metadata.insert("writer".into(), json!(w));
            barrier.wait();
            for _ in 0..20 {
                // Losing every publish attempt to other writers is allowed
                if let Err(e) = cache.write(&payload, &metadata, &k) {
                    assert!(matches!(e, Error::Conflict { .. }), "unexpected error: {e}");
                }
            }
        }));
    }

    let reader = {
        let cache = Arc::clone(&cache);
        let barrier = Arc::clone(&barrier);
        let k = k.clone();
        thread::spawn(move || {
            barrier.wait();
            for _ in 0..200 {
                match cache.read(&k) {
                    Ok(bytes) => {
                        assert_eq!(bytes.len(), 64 * 1024);
                        assert!(bytes.iter().all(|b| *b == bytes[0]), "torn read");
                    }
                    Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
                }
            }
        })
    };

    for handle in handles {
        handle.join().unwrap();
    }
    reader.join().unwrap();

    // The surviving entry pairs one writer's bytes with that writer's metadata
    let bytes = cache.read(&k).unwrap();
    let metadata = cache.load_metadata(&k).unwrap();
    assert_eq!(metadata["writer"], json!(bytes[0]));

    // Whatever won, a final write settles the key
    cache.write(b"final", &Metadata::new(), &k).unwrap();
    assert_eq!(cache.read(&k).unwrap(), b"final");
}

#[test]
fn test_timestamp_never_regresses_under_concurrent_readers() {
    // Two handles on one root, as two processes would have
    let tmp = TempDir::new().unwrap();
    let first = Arc::new(DiskCache::new(tmp.path()));
    let second = Arc::new(DiskCache::new(tmp.path()));
    let k = key("shared", "1");
    first.write(b"x", &Metadata::new(), &k).unwrap();

    let done = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let readers: Vec<_> = [&first, &second, &first, &second]
        .into_iter()
        .map(|cache| {
            let cache = Arc::clone(cache);
            let k = k.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    cache.read(&k).unwrap();
                }
            })
        })
        .collect();
    let poller = {
        let cache = Arc::clone(&second);
        let k = k.clone();
        let done = Arc::clone(&done);
        thread::spawn(move || {
            let mut last = None;
            while !done.load(std::sync::atomic::Ordering::Acquire) {
                let seen = cache.get_last_accessed(&k).unwrap();
                assert!(seen >= last, "timestamp went back: {last:?} -> {seen:?}");
                last = seen;
            }
        })
    };

    for reader in readers {
        reader.join().unwrap();
    }
    done.store(true, std::sync::atomic::Ordering::Release);
    poller.join().unwrap();
}

#[test]
fn test_clear_racing_writers_stays_consistent() {
    init_tracing();
    let tmp = TempDir::new().unwrap();
    let cache = Arc::new(DiskCache::new(tmp.path()));
    let f = FunctionKey::new("churn").unwrap();

    let writer = {
        let cache = Arc::clone(&cache);
        let f = f.clone();
        thread::spawn(move || {
            for i in 0..100 {
                let k = f.input(format!("in-{i}")).unwrap();
                match cache.write(b"value", &Metadata::new(), &k) {
                    Ok(()) => {}
                    Err(e) => assert!(e.is_not_found(), "unexpected error: {e}"),
                }
            }
        })
    };
    let clearer = {
        let cache = Arc::clone(&cache);
        let f = f.clone();
        thread::spawn(move || {
            for _ in 0..20 {
                cache.clear(&f).unwrap();
            }
        })
    };
    writer.join().unwrap();
    clearer.join().unwrap();

    // Everything still listed is complete
    for k in cache.list(&f).unwrap() {
        assert_eq!(cache.read(&k).unwrap(), b"value");
    }
}
