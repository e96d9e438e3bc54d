//! RecycleScheduler handover, gating and shutdown

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use common::{harness, FakeKv, FakeProvider};
use nodeshift_control::{LifecycleError, RecycleScheduler};
use nodeshift_proto::{Node, NodeState, ProviderKind, Region, TunnelType};
use nodeshift_provider::ProviderError;
use nodeshift_store::ACTIVE_NODE_KEY;
use nodeshift_trust::TrustError;

fn provider(kv: &Arc<FakeKv>) -> Arc<FakeProvider> {
    Arc::new(FakeProvider::new(ProviderKind::DigitalOcean).booting_into(kv.clone()))
}

/// ssh control socket name the tunnel scripts derive for `node`
fn control_socket_of(node: &Node) -> String {
    let suffix: String = node
        .uid
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(10)
        .collect();
    format!("ns{}.ctl", suffix)
}

#[tokio::test(start_paused = true)]
async fn test_handover_never_leaves_zero_active() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |_| {});
    let mut events = h.ctx.subscribe();

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let cancel = CancellationToken::new();
    scheduler.run_cycle(&cancel).await.unwrap();
    let first = scheduler.active().unwrap().clone();
    scheduler.run_cycle(&cancel).await.unwrap();
    let second = scheduler.active().unwrap().clone();
    assert_ne!(first.uid, second.uid);

    // Replay the event feed and count active nodes after every event
    let mut states: HashMap<String, NodeState> = HashMap::new();
    let mut seen_active = false;
    let mut max_active = 0;
    loop {
        let event = match events.try_recv() {
            Ok(event) => event,
            Err(TryRecvError::Empty) => break,
            Err(e) => panic!("event feed broken: {:?}", e),
        };
        states.insert(event.uid.clone(), event.state);

        let active = states.values().filter(|s| **s == NodeState::Active).count();
        if seen_active {
            assert!(active >= 1, "no active node after {:?}", event);
        }
        seen_active |= active > 0;
        max_active = max_active.max(active);
    }
    assert!(seen_active);
    assert_eq!(max_active, 2);
    assert_eq!(states[&first.uid], NodeState::Deleted);
    assert_eq!(states[&second.uid], NodeState::Active);

    // Store and provider agree on the single survivor
    assert_eq!(
        h.ctx.store.get_config(ACTIVE_NODE_KEY).as_deref(),
        Some(second.uid.as_str())
    );
    assert!(h.ctx.store.connection(&first.uid).unwrap().is_deleted);
    assert_eq!(provider.live_instance_names(), vec![second.name.clone()]);
    assert_eq!(h.ctx.tunnels.enabled_count().await, 1);

    // The local SOCKS port moved to the new node without a bind failure
    assert_eq!(h.runner.bind_failures.load(Ordering::SeqCst), 0);
    let owner = h.runner.port_owner(1080).unwrap();
    assert!(owner.contains(&control_socket_of(&second)));
}

#[tokio::test(start_paused = true)]
async fn test_proxy_handover_rebinds_local_port_under_killswitch() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |config| {
        config.tunnel_type = TunnelType::HttpProxy;
        config.local_port = 8888;
        config.killswitch.enabled = true;
    });

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let cancel = CancellationToken::new();
    let mut previous: Option<Node> = None;
    for _ in 0..3 {
        scheduler.run_cycle(&cancel).await.unwrap();
        let active = scheduler.active().unwrap().clone();
        if let Some(previous) = &previous {
            assert_ne!(previous.uid, active.uid);
            assert!(h.ctx.store.connection(&previous.uid).unwrap().is_deleted);
        }
        let owner = h.runner.port_owner(8888).unwrap();
        assert!(owner.contains(&control_socket_of(&active)));
        previous = Some(active);
    }

    assert_eq!(h.runner.bind_failures.load(Ordering::SeqCst), 0);
    assert_eq!(provider.requests().len(), 3);
    assert_eq!(h.ctx.tunnels.enabled_count().await, 1);

    // The killswitch was never lifted during a handover
    let scripts = h.runner.scripts();
    assert!(!scripts.iter().any(|s| s.contains("ufw --force disable")));
    let last_guard = scripts
        .iter()
        .rev()
        .find(|s| s.contains("ufw --force enable"))
        .unwrap();
    assert!(last_guard.contains("ufw allow out proto tcp to any port 22"));
}

#[tokio::test(start_paused = true)]
async fn test_cycle_places_node_on_provider_with_eligible_region() {
    let kv = Arc::new(FakeKv::new(1));
    let german = Arc::new(
        FakeProvider::new(ProviderKind::DigitalOcean)
            .with_regions(vec![Region::new("fra1", "DE")])
            .booting_into(kv.clone()),
    );
    let dutch = Arc::new(
        FakeProvider::new(ProviderKind::UpCloud)
            .with_regions(vec![Region::new("nl-ams1", "NL")])
            .booting_into(kv.clone()),
    );
    let h = harness(vec![german.clone(), dutch.clone()], kv, |config| {
        config.disabled_countries = vec!["DE".to_string()];
    });

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let cancel = CancellationToken::new();
    for _ in 0..20 {
        scheduler.run_cycle(&cancel).await.unwrap();
        let active = scheduler.active().unwrap();
        assert_eq!(active.provider, ProviderKind::UpCloud);
        assert_eq!(active.region.as_deref(), Some("nl-ams1"));
    }

    assert!(german.requests().is_empty());
    assert!(german.keys_added().is_empty());
    assert_eq!(dutch.requests().len(), 20);
    assert_eq!(
        h.ctx.store.active_connection().unwrap().provider,
        ProviderKind::UpCloud
    );
}

#[tokio::test(start_paused = true)]
async fn test_placement_spreads_over_providers() {
    let kv = Arc::new(FakeKv::new(1));
    let first = Arc::new(FakeProvider::new(ProviderKind::DigitalOcean).booting_into(kv.clone()));
    let second = Arc::new(FakeProvider::new(ProviderKind::UpCloud).booting_into(kv.clone()));
    let h = harness(vec![first.clone(), second.clone()], kv, |_| {});

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let cancel = CancellationToken::new();
    for _ in 0..20 {
        scheduler.run_cycle(&cancel).await.unwrap();
    }

    assert_eq!(first.requests().len() + second.requests().len(), 20);
    assert!(!first.requests().is_empty());
    assert!(!second.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_no_eligible_region_anywhere_fails_cycle() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |config| {
        config.disabled_countries = vec!["DE".to_string(), "NL".to_string()];
    });

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let err = scheduler
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        LifecycleError::Provider(ProviderError::NoEligibleRegion { .. })
    ));
    assert!(err.is_fatal_policy());
    assert!(provider.requests().is_empty());
    assert!(scheduler.active().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_failed_cycle_keeps_active_node() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |_| {});

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let cancel = CancellationToken::new();
    scheduler.run_cycle(&cancel).await.unwrap();
    let active = scheduler.active().unwrap().clone();

    provider.set_tampered(true);
    let err = scheduler.run_cycle(&cancel).await.unwrap_err();
    assert!(err.is_fatal_policy());

    let still_active = scheduler.active().unwrap();
    assert_eq!(still_active.uid, active.uid);
    assert_eq!(still_active.state, NodeState::Active);
    assert_eq!(h.ctx.store.active_connection().unwrap().id, active.uid);
    assert_eq!(provider.live_instance_names(), vec![active.name.clone()]);
    assert!(h.ctx.tunnels.is_enabled(&active.uid).await);
}

#[tokio::test(start_paused = true)]
async fn test_heartbeat_gate_skips_cycle() {
    let kv = Arc::new(FakeKv::new(1));
    kv.reachable.store(false, Ordering::SeqCst);
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |_| {});

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let err = scheduler
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(err, LifecycleError::Trust(TrustError::Kv { status: 503, .. })));
    assert!(provider.requests().is_empty());
    assert!(scheduler.active().is_none());
    assert!(scheduler.is_due());
}

#[tokio::test(start_paused = true)]
async fn test_first_cycle_sweeps_stragglers() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    provider.seed_instance("stale-1", "nodeshift-crashed");
    provider.seed_instance("other-1", "unrelated-server");
    let h = harness(vec![provider.clone()], kv, |_| {});

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    scheduler.run_cycle(&CancellationToken::new()).await.unwrap();

    let active = scheduler.active().unwrap();
    let mut expected = vec![active.name.clone(), "unrelated-server".to_string()];
    expected.sort();
    assert_eq!(provider.live_instance_names(), expected);
}

#[tokio::test(start_paused = true)]
async fn test_restart_adopts_and_retires_previous_node() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |_| {});
    let cancel = CancellationToken::new();

    let mut before_restart = RecycleScheduler::new(h.ctx.clone());
    before_restart.run_cycle(&cancel).await.unwrap();
    let previous = before_restart.active().unwrap().clone();
    drop(before_restart);

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    assert!(scheduler.adopt_persisted().await.unwrap());
    assert_eq!(scheduler.active().unwrap().uid, previous.uid);
    assert!(!scheduler.is_due());

    scheduler.run_cycle(&cancel).await.unwrap();
    let current = scheduler.active().unwrap().clone();
    assert_ne!(current.uid, previous.uid);
    assert!(h.ctx.store.connection(&previous.uid).unwrap().is_deleted);
    assert_eq!(provider.live_instance_names(), vec![current.name]);
}

#[tokio::test(start_paused = true)]
async fn test_run_recycles_node_past_recycle_interval() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |_| {});

    let mut before_restart = RecycleScheduler::new(h.ctx.clone());
    before_restart
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    let old = before_restart.active().unwrap().clone();
    drop(before_restart);

    // The recorded node was created two hours ago
    let mut connection = h.ctx.store.active_connection().unwrap();
    connection.created_at = chrono::Utc::now() - chrono::Duration::hours(2);
    h.ctx.store.upsert_connection(&connection).unwrap();

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    assert!(scheduler.adopt_persisted().await.unwrap());
    assert!(scheduler.is_due());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });
    scheduler.run(cancel).await.unwrap();

    let current = scheduler.active().unwrap().clone();
    assert_ne!(current.uid, old.uid);
    assert!(!scheduler.is_due());
    assert_eq!(provider.requests().len(), 2);
    assert!(h.ctx.store.connection(&old.uid).unwrap().is_deleted);
    assert_eq!(h.ctx.store.active_connection().unwrap().id, current.uid);
    assert_eq!(provider.live_instance_names(), vec![current.name]);
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_retires_active_node_before_sweeping() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |config| {
        config.killswitch.enabled = true;
    });

    let mut before_restart = RecycleScheduler::new(h.ctx.clone());
    before_restart
        .run_cycle(&CancellationToken::new())
        .await
        .unwrap();
    let active = before_restart.active().unwrap().clone();
    drop(before_restart);
    provider.seed_instance("stale-1", "nodeshift-crashed");

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    let summary = scheduler.cleanup().await.unwrap();

    assert_eq!(summary.deleted, vec!["stale-1".to_string()]);
    assert!(summary.is_clean());
    assert!(provider.live_instance_names().is_empty());
    assert!(scheduler.active().is_none());

    // Tunnel and killswitch came down with the node
    assert!(!h.ctx.tunnels.is_enabled(&active.uid).await);
    assert!(h.runner.port_owner(1080).is_none());
    let scripts = h.runner.scripts();
    assert!(scripts.last().unwrap().contains("ufw --force disable"));

    let record = h.ctx.store.connection(&active.uid).unwrap();
    assert!(record.is_deleted);
    assert_eq!(record.state, NodeState::Deleted);
    assert!(h.ctx.store.live_connections().is_empty());
    assert!(h.ctx.store.get_config(ACTIVE_NODE_KEY).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_run_stops_on_cancel_and_tears_down() {
    let kv = Arc::new(FakeKv::new(1));
    let provider = provider(&kv);
    let h = harness(vec![provider.clone()], kv, |config| {
        config.teardown_on_exit = true;
    });

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let mut scheduler = RecycleScheduler::new(h.ctx.clone());
    scheduler.run(cancel).await.unwrap();

    assert!(scheduler.active().is_none());
    assert!(provider.live_instance_names().is_empty());
    assert_eq!(provider.requests().len(), 1);
    assert!(h.ctx.store.live_connections().is_empty());
    assert!(h.ctx.store.get_config(ACTIVE_NODE_KEY).is_none());
}
