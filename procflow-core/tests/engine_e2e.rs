//! End-to-end tests through `ProcessEngine`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use async_trait::async_trait;
use procflow_core::document::parse_process_yaml;
use procflow_core::store_memory::MemoryRepository;
use procflow_core::{
    Agenda, EngineConfig, EngineError, EngineEvent, EngineEventListener, EngineEventType,
    EngineStores, InstanceState, MessageEventPayload, ProcessEngine, ProcessInstance, Repository,
    RuntimeEvent, RuntimeEventListener, VariableMap,
};
use serde_json::json;

const ORDERS: &str = r#"
processes:
  - id: orders
    name: Orders
    executable: true
    elements:
      - { kind: startEvent, id: start, attributes: { messageRef: orderReceived } }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: review } }
      - kind: userTask
        id: review
        attributes: { candidateUsers: kermit, candidateGroups: sales }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: review, targetRef: end } }
      - { kind: endEvent, id: end }
"#;

const PAYMENT: &str = r#"
processes:
  - id: payment
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: wait } }
      - kind: intermediateCatchEvent
        id: wait
        attributes: { messageRef: paymentReceived, correlationKey: "${orderId}" }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: wait, targetRef: end } }
      - { kind: endEvent, id: end }
"#;

const GUARDED: &str = r#"
processes:
  - id: guarded
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: review } }
      - { kind: userTask, id: review }
      - kind: sequenceFlow
        id: f2
        attributes: { sourceRef: review, targetRef: end, conditionExpression: "${approved}" }
      - { kind: endEvent, id: end }
"#;

const SIGNALLED: &str = r#"
processes:
  - id: signalled
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: wait } }
      - { kind: intermediateCatchEvent, id: wait, attributes: { signalRef: go } }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: wait, targetRef: end } }
      - { kind: endEvent, id: end }
"#;

const FORK_JOIN: &str = r#"
processes:
  - id: forkJoin
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: fork } }
      - { kind: parallelGateway, id: fork }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: fork, targetRef: a } }
      - { kind: sequenceFlow, id: f3, attributes: { sourceRef: fork, targetRef: b } }
      - { kind: userTask, id: a }
      - { kind: userTask, id: b }
      - { kind: sequenceFlow, id: f4, attributes: { sourceRef: a, targetRef: join } }
      - { kind: sequenceFlow, id: f5, attributes: { sourceRef: b, targetRef: join } }
      - { kind: parallelGateway, id: join }
      - { kind: sequenceFlow, id: f6, attributes: { sourceRef: join, targetRef: end } }
      - { kind: endEvent, id: end }
"#;

const TERMINATING: &str = r#"
processes:
  - id: terminating
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: fork } }
      - { kind: parallelGateway, id: fork }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: fork, targetRef: slow } }
      - { kind: sequenceFlow, id: f3, attributes: { sourceRef: fork, targetRef: kill } }
      - { kind: userTask, id: slow }
      - { kind: sequenceFlow, id: f4, attributes: { sourceRef: slow, targetRef: kill } }
      - { kind: endEvent, id: kill, attributes: { terminate: "true" } }
"#;

// ── Helpers ──

async fn deploy(engine: &ProcessEngine, name: &str, yaml: &str) -> String {
    let doc = parse_process_yaml(yaml).unwrap();
    engine.deploy(name, &doc).await.unwrap().id
}

fn order_message(business_key: &str) -> MessageEventPayload {
    MessageEventPayload::builder("orderReceived")
        .business_key(business_key)
        .build()
        .unwrap()
}

fn vars(pairs: &[(&str, serde_json::Value)]) -> VariableMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

struct FailingListener {
    fail_on_exception: bool,
    calls: AtomicUsize,
}

impl FailingListener {
    fn new(fail_on_exception: bool) -> Arc<Self> {
        Arc::new(Self {
            fail_on_exception,
            calls: AtomicUsize::new(0),
        })
    }
}

impl EngineEventListener for FailingListener {
    fn on_event(&self, _event: &EngineEvent, _agenda: &mut Agenda) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(anyhow!("listener exploded"))
    }

    fn is_fail_on_exception(&self) -> bool {
        self.fail_on_exception
    }
}

#[derive(Default)]
struct RuntimeRecorder {
    seen: Mutex<Vec<RuntimeEvent>>,
}

impl RuntimeRecorder {
    fn kinds(&self) -> Vec<&'static str> {
        self.seen.lock().unwrap().iter().map(RuntimeEvent::kind).collect()
    }
}

impl RuntimeEventListener for RuntimeRecorder {
    fn on_event(&self, event: &RuntimeEvent) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[derive(Default)]
struct EventRecorder {
    seen: Mutex<Vec<EngineEventType>>,
}

impl EngineEventListener for EventRecorder {
    fn on_event(&self, event: &EngineEvent, _agenda: &mut Agenda) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(event.event_type);
        Ok(())
    }
}

/// Instance store that cannot persist a completed instance.
#[derive(Default)]
struct FullDiskInstances {
    inner: MemoryRepository<ProcessInstance>,
}

#[async_trait]
impl Repository<ProcessInstance> for FullDiskInstances {
    async fn create(&self, entity: &ProcessInstance) -> anyhow::Result<()> {
        self.inner.create(entity).await
    }

    async fn find_by_id(&self, id: &str) -> anyhow::Result<Option<ProcessInstance>> {
        self.inner.find_by_id(id).await
    }

    async fn update(&self, entity: &ProcessInstance) -> anyhow::Result<()> {
        if entity.state == InstanceState::Completed {
            return Err(anyhow!("disk full"));
        }
        self.inner.update(entity).await
    }

    async fn delete(&self, id: &str) -> anyhow::Result<Option<ProcessInstance>> {
        self.inner.delete(id).await
    }

    async fn find_where(
        &self,
        predicate: &(dyn for<'a> Fn(&'a ProcessInstance) -> bool + Send + Sync),
    ) -> anyhow::Result<Vec<ProcessInstance>> {
        self.inner.find_where(predicate).await
    }
}

// ── Message start ──

#[tokio::test]
async fn test_message_start_anchors_instance_at_start_event() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    assert_eq!(engine.start_message_subscriptions().unwrap().len(), 1);

    let started = engine
        .start_process_by_message(&order_message("ORD-1"))
        .await
        .unwrap();

    assert_eq!(started.business_key.as_deref(), Some("ORD-1"));
    assert_eq!(started.start_activity_id, "start");
    let instance = engine
        .process_instance(&started.process_instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.start_activity_id, "start");
    assert_eq!(instance.state, InstanceState::Active);

    let executions = engine.executions(&started.process_instance_id).await.unwrap();
    assert_eq!(executions.len(), 1);
    assert_eq!(executions[0].current_element_id, "review");
}

#[tokio::test]
async fn test_non_executable_process_deploys_without_subscriptions() {
    let engine = ProcessEngine::default();
    let yaml = ORDERS.replace("executable: true", "executable: false");
    let deployment = engine
        .deploy("drafts", &parse_process_yaml(&yaml).unwrap())
        .await
        .unwrap();

    assert!(deployment.process_definition_ids.is_empty());
    assert!(engine.event_subscriptions().is_empty());
    assert!(engine.process_definitions().unwrap().is_empty());
    let err = engine
        .start_process_by_message(&order_message("ORD-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Correlation { .. }));
}

#[tokio::test]
async fn test_suspended_definition_cannot_start() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    let def = engine.latest_process_definition("orders").unwrap().unwrap();
    engine.suspend_process_definition(&def.id).await.unwrap();

    let err = engine
        .start_process_by_key("orders", None, VariableMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalState(_)));
    let err = engine
        .start_process_by_message(&order_message("ORD-2"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Correlation { .. }));

    engine.activate_process_definition(&def.id).await.unwrap();
    engine
        .start_process_by_message(&order_message("ORD-2"))
        .await
        .unwrap();
}

// ── Message catch ──

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_catch_delivery_resumes_once() {
    let engine = Arc::new(ProcessEngine::default());
    deploy(&engine, "payment", PAYMENT).await;
    let started = engine
        .start_process_by_key("payment", None, vars(&[("orderId", json!("A-1"))]))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&engine);
        handles.push(tokio::spawn(async move {
            let payload = MessageEventPayload::builder("paymentReceived")
                .correlation_key("A-1")
                .build()
                .unwrap();
            engine.receive_message(&payload).await
        }));
    }

    let mut delivered = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(()) => delivered += 1,
            Err(e) => assert!(matches!(e, EngineError::Correlation { .. }), "unexpected: {e}"),
        }
    }
    assert_eq!(delivered, 1);
    let instance = engine
        .process_instance(&started.process_instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
}

#[tokio::test]
async fn test_wrong_correlation_key_is_rejected() {
    let engine = ProcessEngine::default();
    deploy(&engine, "payment", PAYMENT).await;
    engine
        .start_process_by_key("payment", None, vars(&[("orderId", json!("A-1"))]))
        .await
        .unwrap();

    let payload = MessageEventPayload::builder("paymentReceived")
        .correlation_key("B-2")
        .build()
        .unwrap();
    let err = engine.receive_message(&payload).await.unwrap_err();
    assert!(matches!(err, EngineError::Correlation { .. }));
    assert_eq!(engine.event_subscriptions().len(), 1);
}

#[tokio::test]
async fn test_failed_store_write_keeps_catch_waiting() {
    let engine = ProcessEngine::builder()
        .stores(EngineStores {
            instances: Arc::new(FullDiskInstances::default()),
            ..EngineStores::in_memory()
        })
        .build();
    deploy(&engine, "payment", PAYMENT).await;
    let started = engine
        .start_process_by_key("payment", None, vars(&[("orderId", json!("A-1"))]))
        .await
        .unwrap();
    let id = started.process_instance_id;

    let payload = MessageEventPayload::builder("paymentReceived")
        .correlation_key("A-1")
        .build()
        .unwrap();
    let err = engine.receive_message(&payload).await.unwrap_err();
    assert!(matches!(err, EngineError::Store(_)), "unexpected: {err}");

    let instance = engine.process_instance(&id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Active);
    let tokens = engine.executions(&id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].current_element_id, "wait");
    assert_eq!(engine.event_subscriptions().len(), 1);
}

// ── Listeners ──

#[tokio::test]
async fn test_isolated_listener_failure_keeps_command() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    let failing = FailingListener::new(false);
    engine.add_event_listener(failing.clone(), [EngineEventType::ProcessStarted]);

    let started = engine
        .start_process_by_key("orders", Some("ORD-3"), VariableMap::new())
        .await
        .unwrap();

    assert_eq!(failing.calls.load(Ordering::SeqCst), 1);
    assert!(engine
        .process_instance(&started.process_instance_id)
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn test_fail_on_exception_listener_rolls_back() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    let failing = FailingListener::new(true);
    engine.add_event_listener(failing.clone(), [EngineEventType::TaskCreated]);

    let err = engine
        .start_process_by_key("orders", None, VariableMap::new())
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::ListenerInvocation { .. }));
    assert!(engine.process_instances_by_key("orders").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_rolled_back_catch_restores_subscription() {
    let engine = ProcessEngine::default();
    deploy(&engine, "payment", PAYMENT).await;
    engine
        .start_process_by_key("payment", None, vars(&[("orderId", json!("A-9"))]))
        .await
        .unwrap();
    let failing: Arc<dyn EngineEventListener> = FailingListener::new(true);
    engine.add_event_listener(
        Arc::clone(&failing),
        [EngineEventType::ActivityMessageReceived],
    );

    let payload = MessageEventPayload::builder("paymentReceived")
        .correlation_key("A-9")
        .build()
        .unwrap();
    assert!(engine.receive_message(&payload).await.is_err());
    assert_eq!(engine.event_subscriptions().len(), 1);

    engine.remove_event_listener(&failing);
    engine.receive_message(&payload).await.unwrap();
    assert!(engine.event_subscriptions().is_empty());
}

#[tokio::test]
async fn test_declared_global_signal_listener_resumes_other_process() {
    let engine = ProcessEngine::default();
    let thrower = r#"
processes:
  - id: thrower
    executable: true
    event_listeners:
      - events: TASK_COMPLETED
        implementation_type: throwGlobalSignalEvent
        implementation: go
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: work } }
      - { kind: userTask, id: work }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: work, targetRef: end } }
      - { kind: endEvent, id: end }
"#;
    deploy(&engine, "thrower", thrower).await;
    deploy(&engine, "signalled", SIGNALLED).await;
    let waiting = engine
        .start_process_by_key("signalled", None, VariableMap::new())
        .await
        .unwrap();
    let working = engine
        .start_process_by_key("thrower", None, VariableMap::new())
        .await
        .unwrap();

    let task = engine.tasks(&working.process_instance_id).await.unwrap().remove(0);
    engine.complete_task(&task.id, VariableMap::new()).await.unwrap();

    let resumed = engine
        .process_instance(&waiting.process_instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(resumed.state, InstanceState::Completed);
}

// ── Candidates ──

#[tokio::test]
async fn test_candidate_runtime_events() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    let recorder = Arc::new(RuntimeRecorder::default());
    engine.add_runtime_listener(recorder.clone());

    let started = engine
        .start_process_by_key("orders", None, VariableMap::new())
        .await
        .unwrap();
    let task = engine.tasks(&started.process_instance_id).await.unwrap().remove(0);
    recorder.seen.lock().unwrap().clear();

    let user = engine.add_candidate_user(&task.id, "gonzo").await.unwrap();
    engine.remove_candidate(&task.id, &user.id).await.unwrap();
    let group = engine.add_candidate_group(&task.id, "hr").await.unwrap();
    engine.remove_candidate(&task.id, &group.id).await.unwrap();
    let assignee = engine
        .add_identity_link(&task.id, "assignee", Some("fozzie"), None)
        .await
        .unwrap();
    engine.remove_candidate(&task.id, &assignee.id).await.unwrap();

    assert_eq!(
        recorder.kinds(),
        vec![
            "TASK_CANDIDATE_USER_ADDED",
            "TASK_CANDIDATE_USER_REMOVED",
            "TASK_CANDIDATE_GROUP_ADDED",
            "TASK_CANDIDATE_GROUP_REMOVED",
        ]
    );
    // kermit and sales from the definition remain
    assert_eq!(engine.identity_links(&task.id).await.unwrap().len(), 2);
    let visible = engine
        .candidate_tasks("nobody", &["sales".to_string()])
        .await
        .unwrap();
    assert_eq!(visible.len(), 1);
}

#[tokio::test]
async fn test_candidate_requires_exactly_one_identity() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    let started = engine
        .start_process_by_key("orders", None, VariableMap::new())
        .await
        .unwrap();
    let task = engine.tasks(&started.process_instance_id).await.unwrap().remove(0);

    let err = engine
        .add_candidate(&task.id, Some("gonzo"), Some("sales"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidArgument(_)));
    let err = engine.remove_candidate(&task.id, "missing").await.unwrap_err();
    assert!(matches!(err, EngineError::NotFound(_)));
}

// ── Control flow ──

#[tokio::test]
async fn test_parallel_fork_and_join() {
    let engine = ProcessEngine::default();
    deploy(&engine, "forkJoin", FORK_JOIN).await;
    let started = engine
        .start_process_by_key("forkJoin", None, VariableMap::new())
        .await
        .unwrap();
    let id = started.process_instance_id;

    let tasks = engine.tasks(&id).await.unwrap();
    assert_eq!(tasks.len(), 2);

    engine.complete_task(&tasks[0].id, VariableMap::new()).await.unwrap();
    let instance = engine.process_instance(&id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Active);

    engine.complete_task(&tasks[1].id, VariableMap::new()).await.unwrap();
    let instance = engine.process_instance(&id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    assert!(engine.executions(&id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_terminate_end_removes_open_work() {
    let engine = ProcessEngine::default();
    deploy(&engine, "terminating", TERMINATING).await;
    let started = engine
        .start_process_by_key("terminating", None, VariableMap::new())
        .await
        .unwrap();

    let instance = engine
        .process_instance(&started.process_instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    assert!(engine.tasks(&started.process_instance_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_signal_broadcast_skips_suspended_instances() {
    let engine = ProcessEngine::default();
    deploy(&engine, "signalled", SIGNALLED).await;
    let first = engine
        .start_process_by_key("signalled", None, VariableMap::new())
        .await
        .unwrap();
    let second = engine
        .start_process_by_key("signalled", None, VariableMap::new())
        .await
        .unwrap();
    engine
        .suspend_process_instance(&second.process_instance_id)
        .await
        .unwrap();

    let resumed = engine
        .signal_event_received("go", None, VariableMap::new())
        .await
        .unwrap();
    assert_eq!(resumed, 1);
    let done = engine
        .process_instance(&first.process_instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.state, InstanceState::Completed);
    assert_eq!(engine.event_subscriptions().len(), 1);

    engine
        .activate_process_instance(&second.process_instance_id)
        .await
        .unwrap();
    let resumed = engine
        .signal_event_received("go", Some(&second.process_instance_id), VariableMap::new())
        .await
        .unwrap();
    assert_eq!(resumed, 1);
}

#[tokio::test]
async fn test_delete_process_instance_cancels_everything() {
    let engine = ProcessEngine::default();
    deploy(&engine, "payment", PAYMENT).await;
    let started = engine
        .start_process_by_key("payment", None, vars(&[("orderId", json!("A-5"))]))
        .await
        .unwrap();

    engine
        .delete_process_instance(&started.process_instance_id, "customer withdrew")
        .await
        .unwrap();

    let instance = engine
        .process_instance(&started.process_instance_id)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(instance.state, InstanceState::Cancelled { .. }));
    assert!(engine.event_subscriptions().is_empty());
}

#[tokio::test]
async fn test_set_and_read_instance_variables() {
    let engine = ProcessEngine::default();
    deploy(&engine, "payment", PAYMENT).await;
    let started = engine
        .start_process_by_key("payment", None, vars(&[("orderId", json!("A-6"))]))
        .await
        .unwrap();

    engine
        .set_variables(&started.process_instance_id, vars(&[("amount", json!(42))]))
        .await
        .unwrap();
    let seen = engine.variables(&started.process_instance_id).await.unwrap();
    assert_eq!(seen.get("orderId"), Some(&json!("A-6")));
    assert_eq!(seen.get("amount"), Some(&json!(42)));
}

#[tokio::test]
async fn test_unresolved_guard_leaves_task_for_retry() {
    let engine = ProcessEngine::default();
    deploy(&engine, "guarded", GUARDED).await;
    let started = engine
        .start_process_by_key("guarded", None, VariableMap::new())
        .await
        .unwrap();
    let id = started.process_instance_id;
    let task = engine.tasks(&id).await.unwrap().remove(0);
    let recorder = Arc::new(EventRecorder::default());
    engine.add_event_listener(recorder.clone(), EngineEventType::ALL);

    let err = engine
        .complete_task(&task.id, VariableMap::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::UnresolvedReference(_)));
    assert_eq!(err.to_string(), "Cannot resolve identifier 'approved'");

    let tokens = engine.executions(&id).await.unwrap();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].current_element_id, "review");
    let open = engine.tasks(&id).await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].id, task.id);
    assert!(recorder.seen.lock().unwrap().is_empty());

    engine
        .set_variables(&id, vars(&[("approved", json!(true))]))
        .await
        .unwrap();
    engine.complete_task(&task.id, VariableMap::new()).await.unwrap();
    let instance = engine.process_instance(&id).await.unwrap().unwrap();
    assert_eq!(instance.state, InstanceState::Completed);
    assert!(recorder
        .seen
        .lock()
        .unwrap()
        .contains(&EngineEventType::TaskCompleted));
}

// ── Deployments ──

#[tokio::test]
async fn test_redeploy_and_undeploy_move_start_subscription() {
    let engine = ProcessEngine::default();
    let first = deploy(&engine, "orders", ORDERS).await;
    let second = deploy(&engine, "orders", &ORDERS.replace("name: Orders", "name: Orders v2")).await;

    let subs = engine.start_message_subscriptions().unwrap();
    assert_eq!(subs.len(), 1);
    let latest = engine.latest_process_definition("orders").unwrap().unwrap();
    assert_eq!(latest.version, 2);
    assert_eq!(subs[0].process_definition_id, latest.id);

    engine
        .start_process_by_message(&order_message("ORD-4"))
        .await
        .unwrap();
    let err = engine.undeploy(&second, false).await.unwrap_err();
    assert!(matches!(err, EngineError::Deployment(_)));

    engine.undeploy(&second, true).await.unwrap();
    let subs = engine.start_message_subscriptions().unwrap();
    assert_eq!(subs.len(), 1);
    let fallback = engine.latest_process_definition("orders").unwrap().unwrap();
    assert_eq!(fallback.version, 1);
    assert_eq!(fallback.deployment_id, first);
    assert_eq!(subs[0].process_definition_id, fallback.id);

    let started = engine
        .start_process_by_message(&order_message("ORD-5"))
        .await
        .unwrap();
    assert_eq!(started.process_definition_id, fallback.id);
}

#[tokio::test]
async fn test_duplicate_filtering() {
    let engine = ProcessEngine::default();
    let a = deploy(&engine, "orders", ORDERS).await;
    let b = deploy(&engine, "orders", ORDERS).await;
    assert_eq!(a, b);
    assert_eq!(engine.deployments().await.unwrap().len(), 1);

    let config = EngineConfig {
        duplicate_filtering: false,
        ..EngineConfig::default()
    };
    let engine = ProcessEngine::new(config);
    deploy(&engine, "orders", ORDERS).await;
    deploy(&engine, "orders", ORDERS).await;
    assert_eq!(engine.deployments().await.unwrap().len(), 2);
    let versions: Vec<u32> = engine
        .process_definitions()
        .unwrap()
        .iter()
        .map(|d| d.version)
        .collect();
    assert_eq!(versions, vec![1, 2]);
}

#[tokio::test]
async fn test_message_owned_by_other_key_is_rejected() {
    let engine = ProcessEngine::default();
    deploy(&engine, "orders", ORDERS).await;
    let rival = ORDERS.replace("id: orders", "id: rivalOrders");

    let err = engine
        .deploy("rival", &parse_process_yaml(&rival).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Deployment(_)));
    assert_eq!(engine.deployments().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_parse_error_rejects_deployment() {
    let engine = ProcessEngine::default();
    let broken = r#"
processes:
  - id: broken
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: nowhere } }
"#;
    let err = engine
        .deploy("broken", &parse_process_yaml(broken).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Parse(_)));
    assert!(engine.deployments().await.unwrap().is_empty());
}
