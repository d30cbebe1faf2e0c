//! End-to-end control plane tests against the loopback transport.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use bytes::Bytes;
use mittari_control::rpc::loopback::{LoopbackFactory, RecordingPublisher, ScriptedCollector};
use mittari_control::{
    BroadcastBus, Control, ControlEvent, DeclaredMetric, MetricType, PluginProspectus,
    PluginRequest, RoleClient, RpcClientFactory, SpawnArgs, TrustLevel,
};
use mittari_core::{
    ConfigTable, ControlError, Metric, MetricRequest, MetricValue, Namespace, PluginId,
    PluginRole, SubscriptionKind, VersionSpec,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

fn ns(s: &str) -> Namespace {
    s.parse().unwrap()
}

fn sample(namespace: &str, version: u32, value: f64) -> Metric {
    Metric::new(ns(namespace), version, 1, MetricValue::Float(value))
}

struct Plane {
    control: Arc<Control>,
    factory: Arc<LoopbackFactory>,
    bus: BroadcastBus,
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

impl Plane {
    fn new() -> Self {
        init_tracing();
        let factory = Arc::new(LoopbackFactory::new());
        let bus = BroadcastBus::new(64);
        let control = Arc::new(
            Control::builder()
                .factory(factory.clone() as Arc<dyn RpcClientFactory>)
                .event_sink(Arc::new(bus.clone()))
                .build(),
        );
        control.start();
        Self {
            control,
            factory,
            bus,
        }
    }

    /// Register a collector plugin with the loopback factory
    fn collector(
        &self,
        name: &str,
        version: u32,
        declares: &[(&str, u32)],
        client: Arc<ScriptedCollector>,
    ) -> PathBuf {
        let path = PathBuf::from(format!("/plugins/{name}-{version}"));
        let id = PluginId::new(PluginRole::Collector, name, version);
        let mut prospectus = PluginProspectus::new(id, SpawnArgs::new(&path));
        for (namespace, metric_version) in declares {
            prospectus = prospectus.with_metric(DeclaredMetric::new(ns(namespace), *metric_version));
        }
        self.factory.register(prospectus, RoleClient::Collector(client));
        path
    }
}

fn catalog_view(metrics: &[Arc<MetricType>]) -> Vec<(String, u32)> {
    metrics
        .iter()
        .map(|m| (m.namespace().to_string(), m.version()))
        .collect()
}

// ---------------------------------------------------------------------------
// catalog version resolution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn version_resolution_follows_load_and_unload() {
    let plane = Plane::new();
    let v1 = plane.collector(
        "cpu",
        1,
        &[("/intel/cpu/load", 1)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    let v2 = plane.collector(
        "cpu",
        2,
        &[("/intel/cpu/load", 2)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    plane.control.load(&v1).await.unwrap();
    plane.control.load(&v2).await.unwrap();

    let latest = plane
        .control
        .get_metric(&ns("/intel/cpu/load"), VersionSpec::Latest, None)
        .unwrap();
    assert_eq!(latest.metric.version(), 2);

    let pinned = plane
        .control
        .get_metric(&ns("/intel/cpu/load"), VersionSpec::Exact(1), None)
        .unwrap();
    assert_eq!(pinned.metric.version(), 1);

    plane
        .control
        .unload(&PluginId::new(PluginRole::Collector, "cpu", 2))
        .await
        .unwrap();

    let latest = plane
        .control
        .get_metric(&ns("/intel/cpu/load"), VersionSpec::Latest, None)
        .unwrap();
    assert_eq!(latest.metric.version(), 1, "latest follows the unload");

    let err = plane
        .control
        .get_metric(&ns("/intel/cpu/load"), VersionSpec::Exact(2), None)
        .unwrap_err();
    assert_eq!(err.kind(), "not_found");
    assert!(!plane.control.metric_exists(&ns("/intel/cpu/load"), VersionSpec::Exact(2)));
}

// ---------------------------------------------------------------------------
// lifecycle round-trips
// ---------------------------------------------------------------------------

#[tokio::test]
async fn load_then_unload_restores_catalog_and_manager() {
    let plane = Plane::new();
    assert!(plane.control.plugin_catalog().is_empty());
    assert!(plane.control.metric_catalog().is_empty());

    let path = plane.collector(
        "cpu",
        1,
        &[("/intel/cpu/load", 1), ("/intel/cpu/temp", 1)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    let plugin = plane.control.load(&path).await.unwrap();
    assert_eq!(plane.control.plugin_catalog().len(), 1);
    assert_eq!(
        catalog_view(&plane.control.metric_catalog()),
        vec![
            ("/intel/cpu/load".to_string(), 1),
            ("/intel/cpu/temp".to_string(), 1)
        ]
    );

    plane.control.unload(&plugin.id).await.unwrap();
    assert!(plane.control.plugin_catalog().is_empty());
    assert!(plane.control.metric_catalog().is_empty());
}

#[tokio::test]
async fn subscribe_then_unsubscribe_leaves_tables_unchanged() {
    let plane = Plane::new();
    let path = plane.collector(
        "cpu",
        1,
        &[("/intel/cpu/load", 1)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    plane.control.load(&path).await.unwrap();

    let requests = [MetricRequest::exact(ns("/intel/cpu/load"), 1)];
    assert!(plane.control.subscribe_deps(7, &requests, &[]).is_empty());

    let key = PluginId::new(PluginRole::Collector, "cpu", 1).key();
    let pool = plane.control.pool_collection().get(&key).unwrap();
    assert_eq!(pool.subscription(7), Some(SubscriptionKind::Bound));

    assert!(plane.control.unsubscribe_deps(7, &requests, &[]).is_empty());
    assert_eq!(pool.subscription(7), None);
    assert_eq!(pool.subscriber_count(), 0);
}

// ---------------------------------------------------------------------------
// unbound subscriptions follow version promotion
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unbound_subscription_migrates_on_load() {
    let plane = Plane::new();
    let v2 = plane.collector(
        "cpu",
        2,
        &[("/intel/cpu/load", 2)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    plane.control.load(&v2).await.unwrap();

    // task 7 asks for latest; the pool materializes at the concrete key
    let errors = plane.control.subscribe_deps(
        7,
        &[MetricRequest::latest(ns("/intel/cpu/load"))],
        &[],
    );
    assert!(errors.is_empty());

    let key_v2 = PluginId::new(PluginRole::Collector, "cpu", 2).key();
    let pool_v2 = plane.control.pool_collection().get(&key_v2).unwrap();
    assert_eq!(pool_v2.subscription(7), Some(SubscriptionKind::Unbound));

    // loading v3 promotes the unbound subscription
    let v3 = plane.collector(
        "cpu",
        3,
        &[("/intel/cpu/load", 3)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    plane.control.load(&v3).await.unwrap();

    let key_v3 = PluginId::new(PluginRole::Collector, "cpu", 3).key();
    let pool_v3 = plane.control.pool_collection().get(&key_v3).unwrap();
    assert_eq!(pool_v3.subscription(7), Some(SubscriptionKind::Unbound));
    assert_eq!(pool_v2.subscription(7), None, "old pool lost the subscriber");
    assert_eq!(pool_v2.target_size(), 1);
}

// ---------------------------------------------------------------------------
// swap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn swap_replaces_and_emits_one_event() {
    let plane = Plane::new();
    let mut events = plane.bus.subscribe();

    let v1 = plane.collector(
        "mem",
        1,
        &[("/intel/mem/free", 1)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    plane.control.load(&v1).await.unwrap();

    let v2 = plane.collector(
        "mem",
        2,
        &[("/intel/mem/free", 2)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    let out = PluginId::new(PluginRole::Collector, "mem", 1);
    let loaded = plane.control.swap_plugins(&v2, &out).await.unwrap();
    assert_eq!(loaded.id.version, 2);

    let keys: Vec<String> = plane
        .control
        .plugin_catalog()
        .iter()
        .map(|p| p.key().to_string())
        .collect();
    assert_eq!(keys, vec!["collector:mem:2"]);

    // LoadPlugin from the initial load, then the swap event
    assert!(matches!(events.recv().await.unwrap(), ControlEvent::LoadPlugin { .. }));
    match events.recv().await.unwrap() {
        ControlEvent::SwapPlugins { loaded, unloaded } => {
            assert_eq!(loaded.version, 2);
            assert_eq!(unloaded.version, 1);
        }
        other => panic!("expected SwapPlugins, got {other:?}"),
    }
}

#[tokio::test]
async fn failed_swap_rolls_back_the_incoming_plugin() {
    let plane = Plane::new();
    let mut events = plane.bus.subscribe();

    let v2 = plane.collector(
        "mem",
        2,
        &[("/intel/mem/free", 2)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );

    // the outgoing plugin was never loaded: phase two fails, and the
    // just-loaded v2 is unloaded again to restore the prior state
    let ghost = PluginId::new(PluginRole::Collector, "mem", 1);
    let err = plane.control.swap_plugins(&v2, &ghost).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");

    assert!(plane.control.plugin_catalog().is_empty(), "v2 rolled back");
    assert!(plane.control.metric_catalog().is_empty());

    // no swap event was emitted
    assert!(
        tokio::time::timeout(Duration::from_millis(50), events.recv())
            .await
            .is_err(),
        "no event should be published for a failed swap"
    );
}

// ---------------------------------------------------------------------------
// collect fan-out
// ---------------------------------------------------------------------------

async fn fan_out_plane() -> (Plane, Vec<MetricRequest>) {
    let plane = Plane::new();

    let a = Arc::new(
        ScriptedCollector::returning(vec![
            sample("/intel/cpu/load", 1, 0.1),
            sample("/intel/cpu/load", 1, 0.2),
            sample("/intel/cpu/load", 1, 0.3),
        ])
        .with_latency(Duration::from_millis(20)),
    );
    let b = Arc::new(
        ScriptedCollector::returning(vec![sample("/intel/mem/free", 1, 0.9)])
            .with_latency(Duration::from_millis(30)),
    );
    let c = Arc::new(ScriptedCollector::failing(ControlError::Transport {
        message: "connection reset by plugin".into(),
    }));

    for (name, namespace, client) in [
        ("cpu", "/intel/cpu/load", a),
        ("mem", "/intel/mem/free", b),
        ("net", "/intel/net/rx", c),
    ] {
        let path = plane.collector(name, 1, &[(namespace, 1)], client);
        plane.control.load(&path).await.unwrap();
    }

    let requests = vec![
        MetricRequest::latest(ns("/intel/cpu/load")),
        MetricRequest::latest(ns("/intel/mem/free")),
        MetricRequest::latest(ns("/intel/net/rx")),
    ];
    let errors = plane.control.subscribe_deps(1, &requests, &[]);
    assert!(errors.is_empty());
    (plane, requests)
}

#[tokio::test(start_paused = true)]
async fn collect_is_all_or_nothing_by_default() {
    let (plane, requests) = fan_out_plane().await;

    let errors = plane
        .control
        .collect_metrics(&requests, Duration::from_millis(500))
        .await
        .unwrap_err();

    assert_eq!(errors.len(), 1, "one failing group, one error");
    assert_eq!(errors[0].kind(), "transport");
}

#[tokio::test(start_paused = true)]
async fn collect_partial_surfaces_both_sides() {
    let (plane, requests) = fan_out_plane().await;

    let (metrics, errors) = plane
        .control
        .collect_metrics_partial(&requests, Duration::from_millis(500))
        .await;

    assert_eq!(metrics.len(), 4, "three from cpu, one from mem");
    assert_eq!(errors.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn collect_succeeds_when_every_group_answers() {
    let plane = Plane::new();
    let path = plane.collector(
        "cpu",
        1,
        &[("/intel/cpu/load", 1)],
        Arc::new(
            ScriptedCollector::returning(vec![sample("/intel/cpu/load", 1, 0.42)])
                .with_latency(Duration::from_millis(20)),
        ),
    );
    plane.control.load(&path).await.unwrap();

    let requests = [MetricRequest::latest(ns("/intel/cpu/load"))];
    plane.control.subscribe_deps(1, &requests, &[]);

    let metrics = plane
        .control
        .collect_metrics(&requests, Duration::from_millis(500))
        .await
        .unwrap();
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics[0].value, MetricValue::Float(0.42));
}

#[tokio::test(start_paused = true)]
async fn collect_reports_deadline_expiry() {
    let plane = Plane::new();
    let path = plane.collector(
        "cpu",
        1,
        &[("/intel/cpu/load", 1)],
        Arc::new(
            ScriptedCollector::returning(vec![sample("/intel/cpu/load", 1, 0.1)])
                .with_latency(Duration::from_millis(900)),
        ),
    );
    plane.control.load(&path).await.unwrap();

    let requests = [MetricRequest::latest(ns("/intel/cpu/load"))];
    plane.control.subscribe_deps(1, &requests, &[]);

    let errors = plane
        .control
        .collect_metrics(&requests, Duration::from_millis(500))
        .await
        .unwrap_err();
    assert_eq!(errors, vec![ControlError::Deadline { deadline_ms: 500 }]);
}

#[tokio::test]
async fn collect_releases_every_hold() {
    let (plane, requests) = fan_out_plane().await;

    let _ = plane
        .control
        .collect_metrics_partial(&requests, Duration::from_millis(500))
        .await;

    for pool in plane.control.pool_collection().all() {
        assert_eq!(pool.holds(), 0, "pool {} leaked a hold", pool.key());
    }
}

// ---------------------------------------------------------------------------
// signature enforcement
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trust_levels_gate_unsigned_plugins() {
    use std::fs;
    let dir = tempfile::TempDir::new().unwrap();
    let binary = dir.path().join("collector-cpu");
    fs::write(&binary, b"unsigned binary").unwrap();
    let keyring = dir.path().join("keyring");
    fs::write(&keyring, "").unwrap();

    let plane = Plane::new();
    let id = PluginId::new(PluginRole::Collector, "cpu", 1);
    plane.factory.register(
        PluginProspectus::new(id, SpawnArgs::new(&binary))
            .with_metric(DeclaredMetric::new(ns("/intel/cpu/load"), 1)),
        RoleClient::Collector(Arc::new(ScriptedCollector::returning(Vec::new()))),
    );
    plane.control.set_keyring_file(&keyring);

    plane.control.set_plugin_trust_level(TrustLevel::Required);
    let err = plane.control.load(&binary).await.unwrap_err();
    assert_eq!(err.kind(), "signature_invalid");
    assert!(plane.control.plugin_catalog().is_empty(), "no mutation on refusal");

    plane.control.set_plugin_trust_level(TrustLevel::Warn);
    let plugin = plane.control.load(&binary).await.unwrap();
    assert!(!plugin.signed);
}

// ---------------------------------------------------------------------------
// hold vs drain
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unload_drain_waits_for_held_pool() {
    let plane = Plane::new();
    let path = plane.collector(
        "cpu",
        1,
        &[("/intel/cpu/load", 1)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    let plugin = plane.control.load(&path).await.unwrap();
    let requests = [MetricRequest::exact(ns("/intel/cpu/load"), 1)];
    plane.control.subscribe_deps(1, &requests, &[]);

    let key = plugin.key();
    let pool = plane.control.pool_collection().get(&key).unwrap();
    let hold = pool.hold().unwrap();

    let unloading = {
        let control = Arc::clone(&plane.control);
        let id = plugin.id.clone();
        tokio::spawn(async move { control.unload(&id).await })
    };

    // the unload blocks on the outstanding hold
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!unloading.is_finished());
    assert!(pool.is_draining());

    drop(hold);
    unloading.await.unwrap().unwrap();
    assert!(
        plane.control.pool_collection().get(&key).is_none(),
        "pool gone once the drain completes"
    );
}

// ---------------------------------------------------------------------------
// events & publish
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscription_events_carry_task_and_kind() {
    let plane = Plane::new();
    let path = plane.collector(
        "cpu",
        2,
        &[("/intel/cpu/load", 2)],
        Arc::new(ScriptedCollector::returning(Vec::new())),
    );
    plane.control.load(&path).await.unwrap();
    let mut events = plane.bus.subscribe();

    plane
        .control
        .subscribe_deps(7, &[MetricRequest::latest(ns("/intel/cpu/load"))], &[]);
    match events.recv().await.unwrap() {
        ControlEvent::PluginSubscription { task_id, id, kind } => {
            assert_eq!(task_id, 7);
            assert_eq!(id.version, 2, "latest resolved to the concrete version");
            assert_eq!(kind, SubscriptionKind::Unbound);
        }
        other => panic!("expected PluginSubscription, got {other:?}"),
    }

    plane
        .control
        .unsubscribe_deps(7, &[MetricRequest::latest(ns("/intel/cpu/load"))], &[]);
    match events.recv().await.unwrap() {
        ControlEvent::PluginUnsubscription { task_id, id } => {
            assert_eq!(task_id, 7);
            assert_eq!(id.version, 2);
        }
        other => panic!("expected PluginUnsubscription, got {other:?}"),
    }
}

#[tokio::test]
async fn publish_flows_end_to_end() {
    let plane = Plane::new();
    let path = PathBuf::from("/plugins/file-1");
    let id = PluginId::new(PluginRole::Publisher, "file", 1);
    let publisher = Arc::new(RecordingPublisher::new());
    plane.factory.register(
        PluginProspectus::new(id, SpawnArgs::new(&path))
            .with_content_types(vec!["mittari.json".into()], vec![]),
        RoleClient::Publisher(publisher.clone()),
    );
    plane.control.load(&path).await.unwrap();
    plane.control.subscribe_deps(
        3,
        &[],
        &[PluginRequest::new(PluginRole::Publisher, "file", 1)],
    );

    plane
        .control
        .publish_metrics(
            "mittari.json",
            Bytes::from_static(b"[{\"value\":1}]"),
            "file",
            1,
            &ConfigTable::new(),
            Duration::from_millis(500),
        )
        .await
        .unwrap();

    let published = publisher.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "mittari.json");
}
