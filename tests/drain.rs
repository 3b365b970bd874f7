mod helpers;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use driftscan::cancel::CancellationToken;
use driftscan::collectors::Collector;
use driftscan::drain::{DrainOutcome, Eta};
use driftscan::workflow::CollectOptions;
use helpers::*;

/// Keeps `stuck` writes queued for `hold`, then lets the queue empty
fn stalled_store(shards: usize, stuck: usize, hold: Duration) -> Arc<ScriptedStore> {
    let store = Arc::new(ScriptedStore::new(shards));
    store.stuck_writes.store(stuck, Ordering::SeqCst);
    let release = store.clone();
    thread::spawn(move || {
        thread::sleep(hold);
        release.stuck_writes.store(0, Ordering::SeqCst);
    });
    store
}

fn collect(store: Arc<ScriptedStore>, observer: Arc<RecordingObserver>) -> DrainOutcome {
    let mut coordinator = coordinator(store, CancellationToken::new(), observer);
    let mut collectors: Vec<Box<dyn Collector>> = vec![Box::new(FakeCollector::new("files", vec![vec![file("/a")]]))];
    coordinator
        .collect(
            &mut collectors,
            &CollectOptions {
                run_id: Some("drain".to_string()),
                overwrite: false,
            },
        )
        .unwrap()
        .drain
}

#[test]
fn test_stalled_queue_advises_once() {
    let observer = Arc::new(RecordingObserver::default());
    let outcome = collect(stalled_store(2, 100, Duration::from_millis(250)), observer.clone());

    assert!(matches!(outcome, DrainOutcome::Drained { .. }));
    assert_eq!(observer.advisory_count(), 1);
    let advisory = observer.advisories.lock().unwrap()[0].clone();
    assert!(advisory.contains("2 shard(s)"), "{}", advisory);

    let progress = observer.progress.lock().unwrap();
    assert!(progress.len() >= 2);
    // Nothing drained while stuck, so no estimate can be made
    assert!(progress.iter().any(|p| p.pending == 100 && p.eta == Eta::Unknown));
}

#[test]
fn test_no_advisory_at_shard_ceiling() {
    let observer = Arc::new(RecordingObserver::default());
    let outcome = collect(stalled_store(8, 100, Duration::from_millis(150)), observer.clone());

    assert!(matches!(outcome, DrainOutcome::Drained { .. }));
    assert_eq!(observer.advisory_count(), 0);
    assert!(!observer.progress.lock().unwrap().is_empty());
}

#[test]
fn test_empty_queue_drains_without_samples() {
    let observer = Arc::new(RecordingObserver::default());
    let outcome = collect(Arc::new(ScriptedStore::new(1)), observer.clone());

    assert!(matches!(outcome, DrainOutcome::Drained { .. }));
    assert_eq!(observer.advisory_count(), 0);
    assert!(observer
        .events()
        .contains(&"end drain drain completed".to_string()));
}
