mod helpers;

use helpers::{paths_of, TestEnv};
use memdex::{SearchOptions, Source, SyncOptions, SyncReason};
use std::sync::atomic::Ordering;

#[test]
fn hello_memory_end_to_end() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "Hello memory.");
    let manager = env.manager();

    manager.sync(SyncOptions::default()).unwrap();
    let results = manager
        .search(
            "Hello memory",
            &SearchOptions {
                session_key: Some("s1".into()),
                ..SearchOptions::default()
            },
        )
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].path, "MEMORY.md");
    assert_eq!(results[0].source, Source::Memory);
    assert_eq!(results[0].start_line, 1);
    assert!(results[0].snippet.contains("Hello memory."));
    assert!(results[0].score > 0.0);
    manager.close();
}

#[test]
fn resync_of_unchanged_content_is_free() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "stable content");
    env.write_note("memory/notes.md", "# Topic\nmore stable content");
    let manager = env.manager();

    manager.sync(SyncOptions::default()).unwrap();
    let embedded_after_first = env.provider.texts_embedded.load(Ordering::SeqCst);
    let chunks_after_first = manager.status().unwrap().chunks;

    manager.sync(SyncOptions::default()).unwrap();
    manager.sync(SyncOptions::default()).unwrap();

    let status = manager.status().unwrap();
    assert_eq!(status.chunks, chunks_after_first);
    assert_eq!(
        env.provider.texts_embedded.load(Ordering::SeqCst),
        embedded_after_first
    );
    manager.close();
}

#[test]
fn changed_file_is_reindexed_incrementally() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "the plan is alpha");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    // different length so the size fast path sees the change regardless of
    // mtime granularity
    env.write_note("MEMORY.md", "the plan is now omega");
    manager.sync(SyncOptions::default()).unwrap();

    let hits = manager.search("omega", &SearchOptions::default()).unwrap();
    assert_eq!(paths_of(&hits), vec!["MEMORY.md"]);
    let stale = manager.search("alpha", &SearchOptions::default()).unwrap();
    assert!(stale.is_empty() || !stale[0].snippet.contains("alpha"));
    manager.close();
}

#[test]
fn deleted_file_disappears_from_results() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "keep this note");
    env.write_note("memory/gone.md", "doomed zanzibar content");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    let before = manager.search("zanzibar", &SearchOptions::default()).unwrap();
    assert_eq!(before[0].path, "memory/gone.md");

    std::fs::remove_file(env.workspace().join("memory/gone.md")).unwrap();
    manager.sync(SyncOptions::default()).unwrap();

    // vector KNN still returns the surviving note, but nothing from the
    // deleted file may remain
    let after = manager.search("zanzibar", &SearchOptions::default()).unwrap();
    assert!(!paths_of(&after).contains(&"memory/gone.md"));
    assert_eq!(manager.status().unwrap().files, 1);
    manager.close();
}

#[test]
fn identical_content_is_embedded_once() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "duplicate paragraph");
    env.write_note("memory/copy.md", "duplicate paragraph");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    // both files indexed, but the shared chunk hash hit the cache second time
    assert_eq!(manager.status().unwrap().files, 2);
    assert_eq!(env.provider.texts_embedded.load(Ordering::SeqCst), 1);
    manager.close();
}

#[test]
fn session_transcripts_index_after_delta_threshold() {
    let mut env = TestEnv::new();
    env.config.sync.session_delta_bytes = 1; // any append counts
    env.write_note("MEMORY.md", "notes");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    env.write_session(
        "chat.jsonl",
        &[("user", "remember the marmalade"), ("assistant", "noted")],
    );
    manager.note_session_update(&env.sessions_dir().join("chat.jsonl"));

    // watch-triggered syncs skip transcripts even when deltas are pending
    manager
        .sync(SyncOptions {
            force: false,
            reason: SyncReason::Watch,
        })
        .unwrap();
    let hits = manager
        .search("marmalade", &SearchOptions::default())
        .unwrap();
    assert!(hits.iter().all(|r| r.source != Source::Sessions));

    manager.sync(SyncOptions::default()).unwrap();
    let hits = manager
        .search("marmalade", &SearchOptions::default())
        .unwrap();
    let session_hit = hits
        .iter()
        .find(|r| r.source == Source::Sessions)
        .expect("transcript indexed after delta threshold");
    assert_eq!(session_hit.path, "sessions/chat.jsonl");
    assert!(session_hit.snippet.starts_with("User: remember the marmalade"));
    manager.close();
}

#[test]
fn source_filter_restricts_results() {
    let mut env = TestEnv::new();
    env.config.sync.session_delta_bytes = 1;
    env.write_note("MEMORY.md", "shared keyword in notes");
    env.write_session("s.jsonl", &[("user", "shared keyword in chat")]);
    let manager = env.manager();
    manager.note_session_update(&env.sessions_dir().join("s.jsonl"));
    manager.sync(SyncOptions::default()).unwrap();

    let only_memory = manager
        .search(
            "shared keyword",
            &SearchOptions {
                sources: Some(vec![Source::Memory]),
                ..SearchOptions::default()
            },
        )
        .unwrap();
    assert!(!only_memory.is_empty());
    assert!(helpers::memory_sources_only(&only_memory));

    let only_sessions = manager
        .search(
            "shared keyword",
            &SearchOptions {
                sources: Some(vec![Source::Sessions]),
                ..SearchOptions::default()
            },
        )
        .unwrap();
    assert!(only_sessions.iter().all(|r| r.source == Source::Sessions));
    assert!(!only_sessions.is_empty());
    manager.close();
}

#[test]
fn status_reports_counts_and_capabilities() {
    let env = TestEnv::new();
    env.write_note("MEMORY.md", "one note");
    let manager = env.manager();
    manager.sync(SyncOptions::default()).unwrap();

    let status = manager.status().unwrap();
    assert_eq!(status.agent_id, "main");
    assert_eq!(status.provider, "mock");
    assert_eq!(status.model, "mock-model");
    assert_eq!(status.files, 1);
    assert!(status.chunks >= 1);
    assert!(status.cache_entries >= 1);
    assert!(status.fts_available);
    assert_eq!(status.vector_available, Some(true));
    assert_eq!(status.vector_dims, Some(helpers::DIMS));
    assert!(status.batch_enabled);
    assert_eq!(status.batch_failures, 0);
    manager.close();
}

#[test]
fn closed_manager_refuses_operations() {
    let env = TestEnv::new();
    let manager = env.manager();
    manager.close();
    assert!(manager.sync(SyncOptions::default()).is_err());
    assert!(manager.search("anything", &SearchOptions::default()).is_err());
    assert!(manager.status().is_err());
}
