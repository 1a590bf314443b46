//! Decision-precedence checks for the rollout-aware resolver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value as Json};

use rudder_actuator::EventRecorder;
use rudder_core::{
    Constraint, DeliveryConfig, EngineEvent, Environment, FeatureRollout, Resolver, Resource,
    ResourceEvent, ResourceEventKind, ResourceId, ResourceKind, ResourceMetadata, RolloutStatus, Uid,
};
use rudder_persist::{
    EventLog, FeatureRolloutRepository, InMemoryEventLog, InMemoryFeatureRolloutRepository,
};
use rudder_rollout::{CurrentStateLookup, DependentEnvironmentFinder, RolloutAwareResolver, RolloutFeature};
use rustc_hash::FxHashMap;

const FEATURE: &str = "launch-template";

struct SpecFlagFeature {
    terminal: bool,
}

impl RolloutFeature for SpecFlagFeature {
    fn name(&self) -> &'static str {
        FEATURE
    }

    fn declared(&self, resource: &Resource) -> Option<bool> {
        resource.spec.get("launchTemplate").and_then(Json::as_bool)
    }

    fn is_active(&self, state: &Json) -> bool {
        state.get("launchTemplate").and_then(Json::as_bool).unwrap_or(false)
    }

    fn activate(&self, resource: &mut Resource) {
        resource.spec["launchTemplate"] = json!(true);
    }

    fn deactivate(&self, resource: &mut Resource) {
        resource.spec["launchTemplate"] = json!(false);
    }

    fn stop_on_failure(&self) -> bool {
        self.terminal
    }
}

/// Fixed live state keyed by resource id; absent key means "does not exist".
#[derive(Default)]
struct MapLookup(FxHashMap<ResourceId, Json>);

#[async_trait]
impl CurrentStateLookup for MapLookup {
    async fn current(&self, resource: &Resource) -> Result<Option<Json>> {
        Ok(self.0.get(resource.id()).cloned())
    }
}

/// Delegates to the in-memory store while counting writes.
struct CountingRollouts {
    inner: InMemoryFeatureRolloutRepository,
    writes: AtomicUsize,
}

impl CountingRollouts {
    fn new() -> Self {
        Self { inner: InMemoryFeatureRolloutRepository::new(), writes: AtomicUsize::new(0) }
    }
}

#[async_trait]
impl FeatureRolloutRepository for CountingRollouts {
    async fn rollout(&self, feature: &str, id: &ResourceId) -> Result<Option<FeatureRollout>> {
        self.inner.rollout(feature, id).await
    }

    async fn mark_started(&self, feature: &str, id: &ResourceId) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_started(feature, id).await
    }

    async fn mark_status(&self, feature: &str, id: &ResourceId, status: RolloutStatus) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.mark_status(feature, id, status).await
    }
}

fn resource(id: &str, spec: Json) -> Resource {
    Resource::new(
        ResourceKind::new("ec2", "cluster", 1),
        ResourceMetadata {
            id: ResourceId::from(id),
            uid: Uid::new_v4(),
            version: 1,
            application: "fnord".into(),
            service_account: "keel@acme.io".into(),
        },
        spec,
    )
    .unwrap()
}

/// `test` holds the upstream resource; `staging` depends on it and holds
/// the resource under resolution.
fn config(upstream: Resource, subject: Resource) -> DeliveryConfig {
    DeliveryConfig {
        name: "fnord-manifest".into(),
        application: "fnord".into(),
        service_account: "keel@acme.io".into(),
        artifacts: vec![],
        environments: vec![
            Environment {
                name: "test".into(),
                resources: vec![upstream],
                constraints: vec![],
                verifications: vec![],
                notifications: vec![],
            },
            Environment {
                name: "staging".into(),
                resources: vec![subject],
                constraints: vec![Constraint::DependsOn { environment: "test".into() }],
                verifications: vec![],
                notifications: vec![],
            },
        ],
    }
}

struct Fixture {
    resolver: RolloutAwareResolver<SpecFlagFeature>,
    rollouts: Arc<CountingRollouts>,
    log: Arc<InMemoryEventLog>,
    rx: tokio::sync::broadcast::Receiver<EngineEvent>,
}

fn fixture(lookup: MapLookup, terminal: bool) -> Fixture {
    let rollouts = Arc::new(CountingRollouts::new());
    let log = Arc::new(InMemoryEventLog::new());
    let recorder = EventRecorder::new(log.clone());
    let rx = recorder.subscribe();
    let resolver = RolloutAwareResolver::new(
        SpecFlagFeature { terminal },
        rollouts.clone(),
        DependentEnvironmentFinder::new(log.clone()),
        Arc::new(lookup),
        recorder,
    );
    Fixture { resolver, rollouts, log, rx }
}

fn drain(rx: &mut tokio::sync::broadcast::Receiver<EngineEvent>) -> Vec<EngineEvent> {
    let mut out = Vec::new();
    while let Ok(event) = rx.try_recv() {
        out.push(event);
    }
    out
}

async fn mark_upstream_ok(log: &InMemoryEventLog, upstream: &Resource) {
    log.append(ResourceEvent::new(upstream, ResourceEventKind::Valid)).await.unwrap();
}

#[tokio::test]
async fn explicit_declaration_wins_and_is_skipped() {
    let subject = resource("ec2:cluster:fnord-staging", json!({ "launchTemplate": false }));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream, subject.clone());
    let fx = fixture(MapLookup::default(), false);

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(false));
    let record = fx.rollouts.rollout(FEATURE, subject.id()).await.unwrap().unwrap();
    assert_eq!(record.status, RolloutStatus::Skipped);
}

#[tokio::test]
async fn successful_record_activates_with_no_writes_or_events() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream, subject.clone());
    // live state says inactive; the record wins to avoid flapping
    let mut lookup = MapLookup::default();
    lookup.0.insert(subject.id().clone(), json!({ "launchTemplate": false }));
    let mut fx = fixture(lookup, false);
    fx.rollouts.inner.mark_started(FEATURE, subject.id()).await.unwrap();
    fx.rollouts.inner.mark_status(FEATURE, subject.id(), RolloutStatus::Successful).await.unwrap();

    let resolved = fx.resolver.resolve(&config, subject).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(true));
    assert_eq!(fx.rollouts.writes.load(Ordering::SeqCst), 0);
    assert!(drain(&mut fx.rx).is_empty());
}

#[tokio::test]
async fn failed_record_deactivates() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream, subject.clone());
    let fx = fixture(MapLookup::default(), false);
    fx.rollouts.inner.mark_status(FEATURE, subject.id(), RolloutStatus::Failed).await.unwrap();

    let resolved = fx.resolver.resolve(&config, subject).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(false));
}

#[tokio::test]
async fn live_active_state_is_confirmed_as_successful() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream, subject.clone());
    let mut lookup = MapLookup::default();
    lookup.0.insert(subject.id().clone(), json!({ "launchTemplate": true }));
    let mut fx = fixture(lookup, false);

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(true));
    let record = fx.rollouts.rollout(FEATURE, subject.id()).await.unwrap().unwrap();
    assert_eq!(record.status, RolloutStatus::Successful);
    // confirmation is not a new rollout
    assert!(drain(&mut fx.rx).is_empty());
}

#[tokio::test]
async fn brand_new_resource_activates_unconditionally() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream, subject.clone());
    let mut fx = fixture(MapLookup::default(), false);

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(true));
    let record = fx.rollouts.rollout(FEATURE, subject.id()).await.unwrap().unwrap();
    assert_eq!(record.status, RolloutStatus::InProgress);
    assert_eq!(record.attempts, 1);
    assert!(matches!(
        drain(&mut fx.rx).as_slice(),
        [EngineEvent::FeatureRolloutAttempted { .. }]
    ));
}

#[tokio::test]
async fn unstable_upstream_holds_the_rollout() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream.clone(), subject.clone());
    let mut lookup = MapLookup::default();
    lookup.0.insert(subject.id().clone(), json!({ "launchTemplate": false }));
    let fx = fixture(lookup, false);
    fx.log
        .append(ResourceEvent::new(
            &upstream,
            ResourceEventKind::DeltaDetected { delta: json!({}) },
        ))
        .await
        .unwrap();

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(false));
    let record = fx.rollouts.rollout(FEATURE, subject.id()).await.unwrap().unwrap();
    assert_eq!(record.status, RolloutStatus::NotStarted);
}

#[tokio::test]
async fn stable_upstream_without_the_feature_holds_the_rollout() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream.clone(), subject.clone());
    let mut lookup = MapLookup::default();
    lookup.0.insert(subject.id().clone(), json!({ "launchTemplate": false }));
    lookup.0.insert(upstream.id().clone(), json!({ "launchTemplate": false }));
    let fx = fixture(lookup, false);
    mark_upstream_ok(&fx.log, &upstream).await;

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(false));
}

#[tokio::test]
async fn suspected_failure_is_reported_then_retried() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream.clone(), subject.clone());
    let mut lookup = MapLookup::default();
    lookup.0.insert(subject.id().clone(), json!({ "launchTemplate": false }));
    lookup.0.insert(upstream.id().clone(), json!({ "launchTemplate": true }));
    let mut fx = fixture(lookup, false);
    mark_upstream_ok(&fx.log, &upstream).await;
    fx.rollouts.inner.mark_started(FEATURE, subject.id()).await.unwrap();

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(true));
    let record = fx.rollouts.rollout(FEATURE, subject.id()).await.unwrap().unwrap();
    assert_eq!(record.attempts, 2);
    let events = drain(&mut fx.rx);
    assert!(matches!(events[0], EngineEvent::FeatureRolloutFailed { .. }));
    assert!(matches!(events[1], EngineEvent::FeatureRolloutAttempted { .. }));
}

#[tokio::test]
async fn suspected_failure_is_terminal_when_the_feature_stops_on_failure() {
    let subject = resource("ec2:cluster:fnord-staging", json!({}));
    let upstream = resource("ec2:cluster:fnord-test", json!({}));
    let config = config(upstream.clone(), subject.clone());
    let mut lookup = MapLookup::default();
    lookup.0.insert(subject.id().clone(), json!({ "launchTemplate": false }));
    lookup.0.insert(upstream.id().clone(), json!({ "launchTemplate": true }));
    let mut fx = fixture(lookup, true);
    mark_upstream_ok(&fx.log, &upstream).await;
    fx.rollouts.inner.mark_started(FEATURE, subject.id()).await.unwrap();

    let resolved = fx.resolver.resolve(&config, subject.clone()).await.unwrap();

    assert_eq!(resolved.spec["launchTemplate"], json!(false));
    let record = fx.rollouts.rollout(FEATURE, subject.id()).await.unwrap().unwrap();
    assert_eq!(record.status, RolloutStatus::Failed);
    let events = drain(&mut fx.rx);
    assert!(matches!(events.as_slice(), [EngineEvent::FeatureRolloutFailed { .. }]));
}
