mod helpers;

use helpers::TestEnv;
use memdex::{SearchOptions, SyncOptions};
use std::sync::atomic::Ordering;

fn store_dir_entries(env: &TestEnv) -> Vec<String> {
    std::fs::read_dir(env.db_path().parent().unwrap())
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect()
}

#[test]
fn forced_rebuild_leaves_no_temp_or_backup_files() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "first edition");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    env.write_note("MEMORY.md", "second edition entirely");
    manager.sync(SyncOptions::forced()).unwrap();

    let names = store_dir_entries(&env);
    assert!(
        names
            .iter()
            .all(|n| !n.contains(".tmp-") && !n.contains(".backup-")),
        "stray rebuild files: {names:?}"
    );

    let hits = manager.search("second edition", &SearchOptions::default()).unwrap();
    assert!(hits[0].snippet.contains("second edition"));
    manager.close();
}

#[test]
fn cache_survives_forced_rebuild() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "cached once");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();
    let embedded = env.provider.texts_embedded.load(Ordering::SeqCst);
    assert!(embedded >= 1);

    // same content, fresh rebuild: every vector comes from the seeded cache
    manager.sync(SyncOptions::forced()).unwrap();
    assert_eq!(env.provider.texts_embedded.load(Ordering::SeqCst), embedded);
    assert!(manager.status().unwrap().cache_entries >= 1);
    manager.close();
}

#[test]
fn chunking_config_change_forces_full_reindex() {
    let env = TestEnv::new();
    let long_note: String = (0..40)
        .map(|i| format!("paragraph {i} with a reasonable amount of text\n\n"))
        .collect();
    env.write_note("MEMORY.md", &long_note);

    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();
    let chunks_before = manager.status().unwrap().chunks;
    manager.close();

    let mut narrow = env.config.clone();
    narrow.chunking.tokens = 40;
    narrow.chunking.overlap = 0;
    let manager = memdex::IndexManager::with_provider(
        helpers::AGENT,
        narrow,
        Box::new(helpers::SharedProvider(env.provider.clone())),
        Box::new(memdex::NoopSanitizer),
    )
    .unwrap();

    // not forced: the configuration stamp mismatch alone triggers the rebuild
    manager.sync(SyncOptions::default()).unwrap();
    let chunks_after = manager.status().unwrap().chunks;
    assert!(
        chunks_after > chunks_before,
        "narrower chunks should multiply: {chunks_before} -> {chunks_after}"
    );
    manager.close();
}

#[test]
fn fresh_store_first_sync_is_a_full_build() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "content from day one");
    let manager = env.manager();

    // a brand-new store has no configuration stamp, so even a plain sync
    // builds and swaps in a complete index
    manager.sync(SyncOptions::default()).unwrap();
    let status = manager.status().unwrap();
    assert_eq!(status.files, 1);
    assert!(status.chunks >= 1);
    assert!(!status.dirty);
    assert!(env.db_path().exists());
    manager.close();
}

#[test]
fn close_during_rebuild_does_not_resurrect_the_store() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "long lived note");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    // hold the rebuild inside the provider so close() lands mid-build
    env.provider.batch_started.store(false, Ordering::SeqCst);
    env.provider.batch_delay_ms.store(1500, Ordering::SeqCst);
    env.write_note("memory/next.md", "new content to rebuild with");

    let worker = {
        let manager = manager.clone();
        std::thread::spawn(move || manager.sync(SyncOptions::forced()))
    };
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while !env.provider.batch_started.load(Ordering::SeqCst) {
        assert!(std::time::Instant::now() < deadline, "rebuild never reached the provider");
        std::thread::sleep(std::time::Duration::from_millis(10));
    }
    manager.close();
    env.provider.batch_delay_ms.store(0, Ordering::SeqCst);

    // the finished build is discarded, not swapped into the closed manager
    assert!(worker.join().unwrap().is_err());
    assert!(manager.status().is_err());
    let names = store_dir_entries(&env);
    assert!(
        names.iter().all(|n| !n.contains(".tmp-")),
        "stray rebuild files: {names:?}"
    );
}

#[test]
fn concurrent_syncs_single_flight() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "contended content");
    let manager = env.manager();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let manager = manager.clone();
            std::thread::spawn(move || manager.sync(SyncOptions::default()))
        })
        .collect();
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let status = manager.status().unwrap();
    assert_eq!(status.files, 1);
    manager.close();
}
