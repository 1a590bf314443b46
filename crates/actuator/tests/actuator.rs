//! End-to-end checks of the per-resource cycle against in-memory stores.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value as Json};

use rudder_actuator::{EventRecorder, HandlerRegistry, ResourceActuator, ResourceHandler};
use rudder_core::{
    DeliveryConfig, HandlerError, Resolver, Resource, ResourceEventKind, ResourceId, ResourceKind,
    ResourceMetadata, Task, Uid,
};
use rudder_diff::ResourceDiff;
use rudder_persist::{
    EventLog, InMemoryDiffFingerprintRepository, InMemoryEventLog, InMemoryPauseRepository,
    PauseRepository,
};
use rudder_veto::{PauseVeto, VetoEnforcer};

#[derive(Clone, Copy, PartialEq)]
enum CurrentBehavior {
    Missing,
    Returns,
    Fails,
    Unresolvable,
}

struct TestHandler {
    desired: Json,
    current: Json,
    behavior: CurrentBehavior,
    desired_fails: bool,
    in_progress: bool,
    desired_calls: AtomicUsize,
    current_calls: AtomicUsize,
    create_calls: AtomicUsize,
    update_calls: AtomicUsize,
}

impl TestHandler {
    fn new(desired: Json, current: Json, behavior: CurrentBehavior) -> Self {
        Self {
            desired,
            current,
            behavior,
            desired_fails: false,
            in_progress: false,
            desired_calls: AtomicUsize::new(0),
            current_calls: AtomicUsize::new(0),
            create_calls: AtomicUsize::new(0),
            update_calls: AtomicUsize::new(0),
        }
    }

    fn in_progress(mut self) -> Self {
        self.in_progress = true;
        self
    }

    fn failing_desired(mut self) -> Self {
        self.desired_fails = true;
        self
    }
}

#[async_trait]
impl ResourceHandler for TestHandler {
    fn kind(&self) -> ResourceKind {
        ResourceKind::new("ec2", "cluster", 1)
    }

    async fn desired(&self, _config: &DeliveryConfig, _resource: &Resource) -> Result<Json, HandlerError> {
        self.desired_calls.fetch_add(1, Ordering::SeqCst);
        if self.desired_fails {
            return Err(HandlerError::Other(anyhow::anyhow!("template service down")));
        }
        Ok(self.desired.clone())
    }

    async fn current(&self, _resource: &Resource) -> Result<Option<Json>, HandlerError> {
        self.current_calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            CurrentBehavior::Missing => Ok(None),
            CurrentBehavior::Returns => Ok(Some(self.current.clone())),
            CurrentBehavior::Fails => Err(HandlerError::Other(anyhow::anyhow!("cloud API exploded"))),
            CurrentBehavior::Unresolvable => {
                Err(HandlerError::CurrentlyUnresolvable("upstream not ready".into()))
            }
        }
    }

    async fn create(&self, _resource: &Resource, _diff: &ResourceDiff) -> Result<Vec<Task>, HandlerError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Task { id: "task-1".into(), name: "create cluster".into() }])
    }

    async fn update(&self, _resource: &Resource, _diff: &ResourceDiff) -> Result<Vec<Task>, HandlerError> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![Task { id: "task-2".into(), name: "update cluster".into() }])
    }

    async fn actuation_in_progress(&self, _resource: &Resource) -> Result<bool, HandlerError> {
        Ok(self.in_progress)
    }
}

struct Fixture {
    actuator: ResourceActuator,
    handler: Arc<TestHandler>,
    log: Arc<InMemoryEventLog>,
    pause: Arc<InMemoryPauseRepository>,
}

fn fixture(handler: TestHandler) -> Fixture {
    fixture_with_resolvers(handler, vec![])
}

fn fixture_with_resolvers(handler: TestHandler, resolvers: Vec<Arc<dyn Resolver>>) -> Fixture {
    let handler = Arc::new(handler);
    let log = Arc::new(InMemoryEventLog::new());
    let pause = Arc::new(InMemoryPauseRepository::new());
    let mut handlers = HandlerRegistry::new();
    handlers.register(handler.clone());
    let actuator = ResourceActuator::new(
        handlers,
        resolvers,
        VetoEnforcer::new(vec![Arc::new(PauseVeto::new(pause.clone()))]),
        EventRecorder::new(log.clone()),
        log.clone(),
        Arc::new(InMemoryDiffFingerprintRepository::new()),
    );
    Fixture { actuator, handler, log, pause }
}

fn resource() -> Resource {
    Resource::new(
        ResourceKind::new("ec2", "cluster", 1),
        ResourceMetadata {
            id: ResourceId::from("ec2:cluster:fnord-test"),
            uid: Uid::new_v4(),
            version: 1,
            application: "fnord".into(),
            service_account: "keel@acme.io".into(),
        },
        json!({ "capacity": 3 }),
    )
    .unwrap()
}

fn config() -> DeliveryConfig {
    serde_json::from_value(json!({
        "name": "fnord-manifest",
        "application": "fnord",
        "serviceAccount": "keel@acme.io",
        "artifacts": [],
        "environments": []
    }))
    .unwrap()
}

async fn event_names(log: &InMemoryEventLog, id: &ResourceId) -> Vec<&'static str> {
    // oldest first, for readable assertions
    let mut history = log.history(id, 20).await.unwrap();
    history.reverse();
    history.iter().map(|e| e.data.name()).collect()
}

#[tokio::test]
async fn vetoed_check_never_touches_the_handler() {
    let fx = fixture(TestHandler::new(json!({"capacity": 3}), json!({}), CurrentBehavior::Returns));
    fx.pause.pause_application("fnord").await.unwrap();
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.desired_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.current_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        event_names(&fx.log, resource.id()).await,
        vec!["check-skipped", "actuation-paused"]
    );
}

#[tokio::test]
async fn missing_resource_is_created_once() {
    let fx = fixture(TestHandler::new(json!({"capacity": 3}), json!({}), CurrentBehavior::Missing));
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.create_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(
        event_names(&fx.log, resource.id()).await,
        vec!["missing", "actuation-launched"]
    );
}

#[tokio::test]
async fn drifted_resource_is_updated_with_a_delta_payload() {
    let fx = fixture(TestHandler::new(
        json!({"capacity": 3}),
        json!({"capacity": 1}),
        CurrentBehavior::Returns,
    ));
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.handler.create_calls.load(Ordering::SeqCst), 0);
    let history = fx.log.history(resource.id(), 10).await.unwrap();
    let delta = history
        .iter()
        .find_map(|e| match &e.data {
            ResourceEventKind::DeltaDetected { delta } => Some(delta.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(delta["capacity"]["desired"], json!(3));
    assert_eq!(delta["capacity"]["current"], json!(1));
}

#[tokio::test]
async fn converged_resource_emits_valid_and_nothing_else() {
    let spec = json!({"capacity": 3});
    let fx = fixture(TestHandler::new(spec.clone(), spec, CurrentBehavior::Returns));
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(event_names(&fx.log, resource.id()).await, vec!["valid"]);
}

#[tokio::test]
async fn recovery_after_a_delta_emits_delta_resolved() {
    let spec = json!({"capacity": 3});
    let fx = fixture(TestHandler::new(spec.clone(), spec, CurrentBehavior::Returns));
    let resource = resource();
    fx.log
        .append(rudder_core::ResourceEvent::new(
            &resource,
            ResourceEventKind::DeltaDetected { delta: json!({}) },
        ))
        .await
        .unwrap();

    fx.actuator.check_resource(&config(), &resource).await;

    let last = fx.log.last_event(resource.id()).await.unwrap().unwrap();
    assert_eq!(last.data.name(), "delta-resolved");
}

/// A resolver whose every call fails, standing in for a broken
/// desired-state plugin.
struct BrokenResolver;

#[async_trait]
impl Resolver for BrokenResolver {
    fn name(&self) -> &'static str {
        "broken"
    }

    async fn resolve(&self, _config: &DeliveryConfig, _resource: Resource) -> anyhow::Result<Resource> {
        Err(anyhow::anyhow!("resolver blew up"))
    }
}

#[tokio::test]
async fn desired_resolution_failure_is_wrapped_and_blocks_actuation() {
    let fx = fixture(
        TestHandler::new(json!({"capacity": 3}), json!({"capacity": 1}), CurrentBehavior::Returns)
            .failing_desired(),
    );
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 0);
    let last = fx.log.last_event(resource.id()).await.unwrap().unwrap();
    match last.data {
        ResourceEventKind::CheckError { error, .. } => {
            assert_eq!(error, "cannot-resolve-desired-state");
        }
        other => panic!("expected check-error, got {other:?}"),
    }
}

#[tokio::test]
async fn resolver_chain_failure_counts_as_a_desired_state_error() {
    let fx = fixture_with_resolvers(
        TestHandler::new(json!({"capacity": 3}), json!({"capacity": 1}), CurrentBehavior::Returns),
        vec![Arc::new(BrokenResolver)],
    );
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    // the handler's desired() is never reached past a failing resolver
    assert_eq!(fx.handler.desired_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 0);
    let last = fx.log.last_event(resource.id()).await.unwrap().unwrap();
    match last.data {
        ResourceEventKind::CheckError { error, .. } => {
            assert_eq!(error, "cannot-resolve-desired-state");
        }
        other => panic!("expected check-error, got {other:?}"),
    }
}

#[tokio::test]
async fn current_resolution_failure_is_wrapped_and_blocks_actuation() {
    let fx = fixture(TestHandler::new(json!({"capacity": 3}), json!({}), CurrentBehavior::Fails));
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.create_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 0);
    let last = fx.log.last_event(resource.id()).await.unwrap().unwrap();
    match last.data {
        ResourceEventKind::CheckError { error, .. } => {
            assert_eq!(error, "cannot-resolve-current-state");
        }
        other => panic!("expected check-error, got {other:?}"),
    }
}

#[tokio::test]
async fn transient_unresolvable_is_informational() {
    let fx = fixture(TestHandler::new(
        json!({"capacity": 3}),
        json!({}),
        CurrentBehavior::Unresolvable,
    ));
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    let last = fx.log.last_event(resource.id()).await.unwrap().unwrap();
    assert!(matches!(last.data, ResourceEventKind::CheckUnresolvable { .. }));
}

#[tokio::test]
async fn in_flight_actuation_skips_the_check() {
    let fx = fixture(
        TestHandler::new(json!({"capacity": 3}), json!({"capacity": 1}), CurrentBehavior::Returns)
            .in_progress(),
    );
    let resource = resource();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(fx.handler.desired_calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.handler.update_calls.load(Ordering::SeqCst), 0);
    assert_eq!(event_names(&fx.log, resource.id()).await, vec!["check-skipped"]);
}

#[tokio::test]
async fn paused_resource_resumes_before_the_next_decision() {
    let spec = json!({"capacity": 3});
    let fx = fixture(TestHandler::new(spec.clone(), spec, CurrentBehavior::Returns));
    let resource = resource();
    fx.log
        .append(rudder_core::ResourceEvent::new(
            &resource,
            ResourceEventKind::ActuationPaused { reason: None },
        ))
        .await
        .unwrap();

    fx.actuator.check_resource(&config(), &resource).await;

    assert_eq!(
        event_names(&fx.log, resource.id()).await,
        vec!["actuation-paused", "actuation-resumed", "valid"]
    );
}
