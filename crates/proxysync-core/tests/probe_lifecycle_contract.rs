//! Contract Test: Latency Probe Lifecycle
//!
//! This test verifies that delay records live exactly as long as their
//! listeners and that probes never overlap or outlive their record.
//!
//! Constraints verified:
//! - Reserved names are never registered or probed
//! - One probe per (proxy, group) at a time
//! - Raw values and backend errors map onto terminal states
//! - The last unregister evicts the record
//! - Results arriving after eviction are discarded
//! - A probe left over from an evicted record never blocks its successor
//! - A failed probe task still settles the record
//! - The worker pool bounds concurrent backend probes

mod common;

use common::*;
use proxysync_core::model::NodeKind;
use proxysync_core::probe::DelayListener;
use proxysync_core::topology::resolve_topology;
use proxysync_core::{DelayState, DelayUpdate, LatencyProbeManager, ProbeConfig, ProbeOutcome};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A listener recording every state it is notified of
fn recording_listener() -> (DelayListener, Arc<Mutex<Vec<DelayState>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let listener: DelayListener = Arc::new(move |update: &DelayUpdate| {
        sink.lock().unwrap().push(update.state);
    });
    (listener, seen)
}

fn manager(backend: &Arc<ScriptedBackend>) -> LatencyProbeManager {
    LatencyProbeManager::new(backend.clone(), &ProbeConfig::default())
}

#[tokio::test]
async fn reserved_names_are_skipped() {
    let backend = ScriptedBackend::new();
    let probes = manager(&backend);

    for name in ["DIRECT", "REJECT", "REJECT-DROP", "PASS", "COMPATIBLE"] {
        let (listener, _) = recording_listener();
        assert!(probes.register(name, "Auto", listener).is_none());
        assert_eq!(probes.probe(name, "Auto", None).await, ProbeOutcome::Skipped);
    }

    assert_eq!(backend.call_count(PROBE_DELAY), 0);
    assert_eq!(probes.tracked(), 0);
}

#[tokio::test]
async fn listener_sees_full_lifecycle() {
    let backend = ScriptedBackend::new();
    backend.set_delay("hk-1", DelayScript::Value(87));
    let probes = manager(&backend);

    let (listener, seen) = recording_listener();
    let _handle = probes.register("hk-1", "Auto", listener).expect("not reserved");

    let outcome = probes.probe("hk-1", "Auto", None).await;

    assert_eq!(outcome, ProbeOutcome::Completed(DelayState::Measured(87)));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            DelayState::NotTested,
            DelayState::Testing,
            DelayState::Measured(87)
        ]
    );

    let state = probes.state("hk-1", "Auto").expect("record kept");
    assert_eq!(state.state, DelayState::Measured(87));
    assert!(state.updated_at.is_some());
}

#[tokio::test]
async fn probe_while_testing_is_rejected() {
    let backend = ScriptedBackend::new();
    backend.set_probe_latency(Duration::from_millis(50));
    let probes = manager(&backend);

    let (listener, _) = recording_listener();
    let _handle = probes.register("hk-1", "Auto", listener).unwrap();

    let (first, second) = tokio::join!(
        probes.probe("hk-1", "Auto", None),
        probes.probe("hk-1", "Auto", None),
    );

    assert_eq!(first, ProbeOutcome::Completed(DelayState::Measured(100)));
    assert_eq!(second, ProbeOutcome::AlreadyTesting);
    assert_eq!(backend.call_count(PROBE_DELAY), 1);

    // The same proxy in another group is a separate key
    assert!(matches!(
        probes.probe("hk-1", "Streaming", None).await,
        ProbeOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn raw_values_are_classified() {
    let backend = ScriptedBackend::new();
    backend.set_delay("zero", DelayScript::Value(0));
    backend.set_delay("almost", DelayScript::Value(9_999));
    backend.set_delay("slow", DelayScript::Value(12_000));
    backend.set_delay("sentinel", DelayScript::Value(150_000));
    backend.set_delay("timeout", DelayScript::Timeout);
    backend.set_delay("broken", DelayScript::Fail);
    let probes = manager(&backend);

    let cases = [
        ("zero", DelayState::TimedOut),
        ("almost", DelayState::Measured(9_999)),
        ("slow", DelayState::TimedOut),
        ("sentinel", DelayState::Errored),
        ("timeout", DelayState::TimedOut),
        ("broken", DelayState::Errored),
    ];

    let mut handles = Vec::new();
    for (name, expected) in cases {
        let (listener, _) = recording_listener();
        handles.push(probes.register(name, "Auto", listener).unwrap());

        let outcome = probes.probe(name, "Auto", Some(10_000)).await;
        assert_eq!(outcome, ProbeOutcome::Completed(expected), "proxy {}", name);
    }
}

#[tokio::test]
async fn last_unregister_evicts_record() {
    let backend = ScriptedBackend::new();
    let probes = manager(&backend);

    let (first, _) = recording_listener();
    let (second, _) = recording_listener();
    let a = probes.register("hk-1", "Auto", first).unwrap();
    let b = probes.register("hk-1", "Auto", second).unwrap();
    assert_eq!(probes.listener_count("hk-1", "Auto"), 2);
    assert_eq!(probes.tracked(), 1);

    probes.unregister(a);
    assert!(probes.state("hk-1", "Auto").is_some());

    probes.unregister(b);
    assert!(probes.state("hk-1", "Auto").is_none());
    assert_eq!(probes.tracked(), 0);
}

#[tokio::test]
async fn registering_resets_to_not_tested() {
    let backend = ScriptedBackend::new();
    let probes = manager(&backend);

    let (first, _) = recording_listener();
    let _a = probes.register("hk-1", "Auto", first).unwrap();
    probes.probe("hk-1", "Auto", None).await;

    let (second, seen) = recording_listener();
    let _b = probes.register("hk-1", "Auto", second).unwrap();

    assert_eq!(
        probes.state("hk-1", "Auto").map(|s| s.state),
        Some(DelayState::NotTested)
    );
    assert_eq!(*seen.lock().unwrap(), vec![DelayState::NotTested]);
}

#[tokio::test]
async fn late_result_after_eviction_is_discarded() {
    let backend = ScriptedBackend::new();
    backend.set_probe_latency(Duration::from_millis(50));
    let probes = manager(&backend);

    let (listener, seen) = recording_listener();
    let handle = probes.register("hk-1", "Auto", listener).unwrap();

    let running = {
        let probes = probes.clone();
        tokio::spawn(async move { probes.probe("hk-1", "Auto", None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    probes.unregister(handle);

    // A new listener arrives before the stale result does
    let (fresh, fresh_seen) = recording_listener();
    let _fresh = probes.register("hk-1", "Auto", fresh).unwrap();

    let outcome = running.await.unwrap();

    assert_eq!(outcome, ProbeOutcome::Discarded(DelayState::Measured(100)));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![DelayState::NotTested, DelayState::Testing]
    );
    assert_eq!(*fresh_seen.lock().unwrap(), vec![DelayState::NotTested]);
    assert_eq!(
        probes.state("hk-1", "Auto").map(|s| s.state),
        Some(DelayState::NotTested)
    );
}

#[tokio::test]
async fn reregistered_record_is_probed_while_old_probe_runs() {
    let backend = ScriptedBackend::new();
    backend.set_probe_latency(Duration::from_millis(100));
    let probes = manager(&backend);

    let (listener, _) = recording_listener();
    let handle = probes.register("hk-1", "Auto", listener).unwrap();

    let old_probe = {
        let probes = probes.clone();
        tokio::spawn(async move { probes.probe("hk-1", "Auto", None).await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The view goes away and comes back while the old probe is running
    probes.unregister(handle);
    let (fresh, fresh_seen) = recording_listener();
    let _fresh = probes.register("hk-1", "Auto", fresh).unwrap();
    assert_eq!(
        probes.state("hk-1", "Auto").map(|s| s.state),
        Some(DelayState::NotTested)
    );

    let outcome = probes.probe("hk-1", "Auto", None).await;
    assert_eq!(outcome, ProbeOutcome::Completed(DelayState::Measured(100)));
    assert_eq!(
        old_probe.await.unwrap(),
        ProbeOutcome::Discarded(DelayState::Measured(100))
    );

    assert_eq!(backend.call_count(PROBE_DELAY), 2);
    assert_eq!(
        *fresh_seen.lock().unwrap(),
        vec![
            DelayState::NotTested,
            DelayState::Testing,
            DelayState::Measured(100)
        ]
    );

    // Neither probe left the slot occupied
    assert!(matches!(
        probes.probe("hk-1", "Auto", None).await,
        ProbeOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn panicking_backend_settles_record_as_errored() {
    let backend = ScriptedBackend::new();
    backend.set_delay("hk-1", DelayScript::Panic);
    let probes = manager(&backend);

    let (listener, seen) = recording_listener();
    let _handle = probes.register("hk-1", "Auto", listener).unwrap();

    let outcome = probes.probe("hk-1", "Auto", None).await;

    assert_eq!(outcome, ProbeOutcome::Completed(DelayState::Errored));
    assert_eq!(
        *seen.lock().unwrap(),
        vec![
            DelayState::NotTested,
            DelayState::Testing,
            DelayState::Errored
        ]
    );

    backend.set_delay("hk-1", DelayScript::Value(50));
    assert_eq!(
        probes.probe("hk-1", "Auto", None).await,
        ProbeOutcome::Completed(DelayState::Measured(50))
    );
}

#[tokio::test]
async fn dropped_caller_does_not_cancel_probe() {
    let backend = ScriptedBackend::new();
    backend.set_probe_latency(Duration::from_millis(50));
    let probes = manager(&backend);

    let (listener, _) = recording_listener();
    let _handle = probes.register("hk-1", "Auto", listener).unwrap();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(10), probes.probe("hk-1", "Auto", None)).await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(
        probes.state("hk-1", "Auto").map(|s| s.state),
        Some(DelayState::Measured(100))
    );
    // The slot is free again
    assert!(matches!(
        probes.probe("hk-1", "Auto", None).await,
        ProbeOutcome::Completed(_)
    ));
}

#[tokio::test]
async fn worker_pool_bounds_concurrency() {
    let backend = ScriptedBackend::new();
    backend.set_probe_latency(Duration::from_millis(20));

    let config = ProbeConfig {
        max_concurrent_probes: 2,
        ..ProbeConfig::default()
    };
    let probes = LatencyProbeManager::new(backend.clone(), &config);

    let members: Vec<String> = (0..6).map(|i| format!("node-{}", i)).collect();
    let mut nodes: Vec<_> = members.iter().map(|m| leaf(m, NodeKind::Other("Vmess".into()))).collect();
    let member_refs: Vec<&str> = members.iter().map(String::as_str).chain(["DIRECT"]).collect();
    nodes.push(group("Auto", NodeKind::UrlTest, &member_refs));
    nodes.push(leaf("DIRECT", NodeKind::Direct));

    let topology = resolve_topology(&nodes, &[]);
    let auto = topology.group("Auto").expect("group resolved");

    let outcomes = probes.probe_group(auto, None).await;

    // DIRECT is not probed
    assert_eq!(outcomes.len(), 6);
    assert!(outcomes
        .iter()
        .all(|(_, outcome)| matches!(outcome, ProbeOutcome::Completed(_) | ProbeOutcome::Discarded(_))));
    assert_eq!(backend.call_count(PROBE_DELAY), 6);
    assert_eq!(backend.max_concurrent_probes(), 2);
}
