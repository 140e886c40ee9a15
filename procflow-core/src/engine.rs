//! Process engine: deployments, runtime commands and queries over one set of stores.
//!
//! Every command follows the same bracket: stage changes on a [`CommandContext`], run
//! the token VM, dispatch the raised events (global listeners first, then the
//! definition's declared listeners), then commit. Any failure on the way, a
//! fail-on-exception listener included, rolls the command back. Agenda actions queued by
//! listeners run afterwards, each as its own command.
//!
//! Commands on one process instance are serialized by a per-instance lock; different
//! instances proceed in parallel.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::agenda::{Agenda, AgendaAction};
use crate::command::{CommandContext, Staged};
use crate::compiler::{CompileContext, Compiler, ParseHandler};
use crate::config::EngineConfig;
use crate::deployment::{document_checksum, DeployedProcess, DeploymentCache};
use crate::document::ProcessDocument;
use crate::error::{EngineError, EngineResult};
use crate::events::{
    ConverterRegistry, ConvertingListener, DelegateRegistry, EngineEvent, EngineEventListener,
    EngineEventType, EventDispatcher, EventEntity, RuntimeEventListener, StartMessageSubscription,
};
use crate::expression::{ElEvaluator, ExpressionEvaluator};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::payloads::{MessageEventPayload, ProcessInstanceRef};
use crate::store::EngineStores;
use crate::subscription::SubscriptionManager;
use crate::task::{add_candidate, add_identity_link, delete_identity_link};
use crate::types::*;
use crate::vm::{resolve_variables, Termination, Vm};

// ── Builder ──

pub struct ProcessEngineBuilder {
    config: EngineConfig,
    compiler: Compiler,
    evaluator: Arc<dyn ExpressionEvaluator>,
    ids: Arc<dyn IdGenerator>,
    delegates: Arc<DelegateRegistry>,
    stores: EngineStores,
    converters: ConverterRegistry,
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig::default(),
            compiler: Compiler::new(),
            evaluator: Arc::new(ElEvaluator),
            ids: Arc::new(UuidIdGenerator),
            delegates: Arc::new(DelegateRegistry::new()),
            stores: EngineStores::in_memory(),
            converters: ConverterRegistry::with_defaults(),
        }
    }
}

impl ProcessEngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Registry that class and delegate-expression listeners resolve against.
    pub fn delegates(mut self, delegates: Arc<DelegateRegistry>) -> Self {
        self.delegates = delegates;
        self
    }

    pub fn stores(mut self, stores: EngineStores) -> Self {
        self.stores = stores;
        self
    }

    pub fn parse_handler(mut self, tag: impl Into<String>, handler: ParseHandler) -> Self {
        self.compiler.register_handler(tag, handler);
        self
    }

    pub fn converters(mut self, converters: ConverterRegistry) -> Self {
        self.converters = converters;
        self
    }

    pub fn build(self) -> ProcessEngine {
        ProcessEngine {
            dispatcher: EventDispatcher::new(self.config.event_dispatcher_enabled),
            config: self.config,
            compiler: self.compiler,
            evaluator: self.evaluator,
            ids: self.ids,
            delegates: self.delegates,
            stores: self.stores,
            subscriptions: SubscriptionManager::new(),
            deployments: DeploymentCache::new(),
            converters: Arc::new(self.converters),
            instance_locks: DashMap::new(),
            deploy_lock: Mutex::new(()),
        }
    }
}

// ── Engine ──

pub struct ProcessEngine {
    config: EngineConfig,
    compiler: Compiler,
    evaluator: Arc<dyn ExpressionEvaluator>,
    ids: Arc<dyn IdGenerator>,
    delegates: Arc<DelegateRegistry>,
    stores: EngineStores,
    subscriptions: SubscriptionManager,
    deployments: DeploymentCache,
    dispatcher: EventDispatcher,
    converters: Arc<ConverterRegistry>,
    instance_locks: DashMap<String, Arc<Mutex<()>>>,
    deploy_lock: Mutex<()>,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::default()
    }

    pub fn new(config: EngineConfig) -> Self {
        Self::builder().config(config).build()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn delegates(&self) -> &Arc<DelegateRegistry> {
        &self.delegates
    }

    // ── Listeners ──

    /// Registers a listener for `types` (empty = every type) on the engine-wide dispatcher.
    pub fn add_event_listener(
        &self,
        listener: Arc<dyn EngineEventListener>,
        types: impl IntoIterator<Item = EngineEventType>,
    ) {
        self.dispatcher.add_event_listener(listener, types);
    }

    pub fn remove_event_listener(&self, listener: &Arc<dyn EngineEventListener>) {
        self.dispatcher.remove_event_listener(listener);
    }

    /// Registers a listener for public runtime events. The returned handle removes it.
    pub fn add_runtime_listener(
        &self,
        listener: Arc<dyn RuntimeEventListener>,
    ) -> Arc<dyn EngineEventListener> {
        let bridge: Arc<dyn EngineEventListener> =
            Arc::new(ConvertingListener::new(Arc::clone(&self.converters), listener));
        self.dispatcher
            .add_event_listener(Arc::clone(&bridge), self.converters.event_types());
        bridge
    }

    // ── Deployments ──

    /// Compiles and deploys a document.
    ///
    /// Executable processes get the next version of their key and replace the start
    /// subscriptions of the previous version. Non-executable processes are compiled
    /// and logged only. With duplicate filtering on, an unchanged document redeployed
    /// under the same name returns the existing deployment.
    pub async fn deploy(&self, name: &str, document: &ProcessDocument) -> EngineResult<Deployment> {
        let _guard = self.deploy_lock.lock().await;

        let checksum = document_checksum(document)?;
        if self.config.duplicate_filtering {
            let previous = self
                .stores
                .deployments
                .find_where(&|d: &Deployment| d.name == name)
                .await?
                .into_iter()
                .max_by_key(|d| d.deployed_at);
            if let Some(previous) = previous.filter(|d| d.checksum == checksum) {
                info!(deployment_id = %previous.id, name, "duplicate deployment filtered");
                return Ok(previous);
            }
        }

        let mut ctx = CompileContext::new(self.ids.next_id());
        ctx.engine_version = self.config.engine_version.clone();
        ctx.delegates = Arc::clone(&self.delegates);
        ctx.dispatcher_enabled = self.config.event_dispatcher_enabled;
        for process in &document.processes {
            ctx.versions
                .insert(process.id.clone(), self.deployments.next_version(&process.id)?);
        }
        let compiled = self.compiler.compile(document, &ctx)?;

        // ── Message start ownership ──
        let mut claimed_names: HashMap<String, String> = HashMap::new();
        for process in compiled.executable() {
            let key = &process.definition.key;
            for (_, message) in process.definition.message_starts() {
                let owner = match claimed_names.get(message) {
                    Some(owner) => Some(owner.clone()),
                    None => self.deployments.message_owner(message)?,
                };
                if let Some(owner) = owner.filter(|owner| owner != key) {
                    return Err(EngineError::Deployment(format!(
                        "Cannot deploy process definition '{key}': there already is a message event subscription for the message with name '{message}' owned by '{owner}'"
                    )));
                }
                claimed_names.insert(message.to_string(), key.clone());
            }
        }

        // ── Start subscriptions ──
        let mut agenda = Agenda::new();
        let mut created = Vec::new();
        let mut replaced = Vec::new();
        for process in compiled.executable() {
            let def = &process.definition;
            if let Some(previous) = self.deployments.latest(&def.key)? {
                for sub in self
                    .subscriptions
                    .start_subscriptions_for_definition(&previous.definition().id)
                {
                    let event = subscription_event(EngineEventType::EntityDeleted, &sub);
                    self.dispatch_to(&event, &mut agenda, Some(&previous.compiled.event_support))?;
                    replaced.push(sub);
                }
            }
            for (element, message) in def.message_starts() {
                let sub = SubscriptionManager::start_subscription(self.ids.as_ref(), def, &element.id, message);
                let event = subscription_event(EngineEventType::EntityCreated, &sub);
                self.dispatch_to(&event, &mut agenda, Some(&process.event_support))?;
                created.push(sub);
            }
        }

        // ── Commit ──
        let deployment = Deployment {
            id: ctx.deployment_id.clone(),
            name: name.to_string(),
            checksum,
            deployed_at: Utc::now(),
            process_definition_ids: compiled
                .executable()
                .map(|p| p.definition.id.clone())
                .collect(),
        };
        self.stores.deployments.create(&deployment).await?;
        for process in compiled.executable() {
            self.deployments.insert(process.clone())?;
        }
        for sub in &replaced {
            self.subscriptions.try_consume(&sub.id);
        }
        for sub in created {
            self.subscriptions.insert(sub);
        }
        info!(
            deployment_id = %deployment.id,
            name,
            definitions = deployment.process_definition_ids.len(),
            "deployment created"
        );
        drop(_guard);

        self.drain_agenda(agenda.into_actions()).await;
        Ok(deployment)
    }

    /// Removes a deployment, its definitions and their start subscriptions. Start
    /// subscriptions of the now-latest remaining version of each key are re-registered.
    ///
    /// Running instances block removal unless `cascade` is set, which cancels them.
    pub async fn undeploy(&self, deployment_id: &str, cascade: bool) -> EngineResult<()> {
        let _guard = self.deploy_lock.lock().await;
        self.stores
            .deployments
            .find_by_id(deployment_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("deployment '{deployment_id}'")))?;

        let removed = self.deployments.for_deployment(deployment_id)?;
        let removed_ids: HashSet<String> = removed.iter().map(|d| d.definition().id.clone()).collect();
        let live = self
            .stores
            .instances
            .find_where(&|i: &ProcessInstance| {
                removed_ids.contains(&i.process_definition_id) && !i.state.is_terminal()
            })
            .await?;
        if !live.is_empty() && !cascade {
            return Err(EngineError::Deployment(format!(
                "deployment '{deployment_id}' still has {} running process instance(s)",
                live.len()
            )));
        }

        // Previous versions that become latest again.
        let mut agenda = Agenda::new();
        let mut dropped = Vec::new();
        let mut restored = Vec::new();
        let keys: BTreeSet<String> = removed.iter().map(|d| d.definition().key.clone()).collect();
        for key in &keys {
            let removed_latest = self
                .deployments
                .latest(key)?
                .is_some_and(|d| d.definition().deployment_id == deployment_id);
            for deployed in removed.iter().filter(|d| &d.definition().key == key) {
                for sub in self
                    .subscriptions
                    .start_subscriptions_for_definition(&deployed.definition().id)
                {
                    let event = subscription_event(EngineEventType::EntityDeleted, &sub);
                    self.dispatch_to(&event, &mut agenda, Some(&deployed.compiled.event_support))?;
                    dropped.push(sub.id);
                }
            }
            if !removed_latest {
                continue;
            }
            let fallback = self
                .deployments
                .all()?
                .into_iter()
                .filter(|d| &d.key == key && d.deployment_id != deployment_id)
                .max_by_key(|d| d.version);
            if let Some(fallback) = fallback {
                let deployed = self.deployments.get(&fallback.id)?;
                for (element, message) in fallback.message_starts() {
                    let sub = SubscriptionManager::start_subscription(
                        self.ids.as_ref(),
                        &fallback,
                        &element.id,
                        message,
                    );
                    let event = subscription_event(EngineEventType::EntityCreated, &sub);
                    let support = deployed.as_ref().map(|d| &d.compiled.event_support);
                    self.dispatch_to(&event, &mut agenda, support)?;
                    restored.push(sub);
                }
            }
        }

        for instance in &live {
            let actions = self
                .cancel_command(&instance.id, format!("deployment {deployment_id} removed"))
                .await?;
            for action in actions {
                agenda.push(action);
            }
        }
        self.deployments.remove_deployment(deployment_id)?;
        for id in &dropped {
            self.subscriptions.try_consume(id);
        }
        for sub in restored {
            self.subscriptions.insert(sub);
        }
        self.stores.deployments.delete(deployment_id).await?;
        info!(deployment_id, cancelled = live.len(), "deployment removed");
        drop(_guard);

        self.drain_agenda(agenda.into_actions()).await;
        Ok(())
    }

    pub async fn suspend_process_definition(&self, process_definition_id: &str) -> EngineResult<()> {
        self.set_definition_suspended(process_definition_id, true).await
    }

    pub async fn activate_process_definition(&self, process_definition_id: &str) -> EngineResult<()> {
        self.set_definition_suspended(process_definition_id, false).await
    }

    async fn set_definition_suspended(&self, process_definition_id: &str, suspended: bool) -> EngineResult<()> {
        let deployed = self.deployed(process_definition_id)?;
        if deployed.suspended == suspended {
            let state = if suspended { "suspended" } else { "active" };
            return Err(EngineError::IllegalState(format!(
                "process definition '{process_definition_id}' is already {state}"
            )));
        }
        let event_type = if suspended {
            EngineEventType::EntitySuspended
        } else {
            EngineEventType::EntityActivated
        };
        let event = EngineEvent::new(
            event_type,
            EventEntity::Definition {
                process_definition_id: process_definition_id.to_string(),
            },
        )
        .with_definition(process_definition_id);
        let mut agenda = Agenda::new();
        self.dispatch_to(&event, &mut agenda, Some(&deployed.compiled.event_support))?;
        self.deployments.set_suspended(process_definition_id, suspended)?;
        info!(process_definition_id, suspended, "process definition state changed");

        self.drain_agenda(agenda.into_actions()).await;
        Ok(())
    }

    // ── Starting instances ──

    /// Starts the latest version of `key` at its none start event.
    pub async fn start_process_by_key(
        &self,
        key: &str,
        business_key: Option<&str>,
        variables: VariableMap,
    ) -> EngineResult<ProcessInstanceRef> {
        let deployed = self
            .deployments
            .latest(key)?
            .ok_or_else(|| EngineError::NotFound(format!("no deployed process definition with key '{key}'")))?;
        if deployed.suspended {
            return Err(EngineError::IllegalState(format!(
                "Cannot start process instance. Process definition {} is suspended",
                deployed.definition().id
            )));
        }
        let start_id = deployed
            .definition()
            .initial_element()
            .map(|e| e.id.clone())
            .ok_or_else(|| {
                EngineError::NotFound(format!("start event in '{}'", deployed.definition().id))
            })?;

        let (instance_ref, actions) = self
            .start_command(&deployed, &start_id, business_key.map(str::to_string), variables)
            .await?;
        self.drain_agenda(actions).await;
        Ok(instance_ref)
    }

    /// Starts the process whose latest, active version has a message start event for
    /// `payload.name`. Fails with a correlation error when none does.
    pub async fn start_process_by_message(
        &self,
        payload: &MessageEventPayload,
    ) -> EngineResult<ProcessInstanceRef> {
        let (instance_ref, actions) = self.message_start_command(payload).await?;
        self.drain_agenda(actions).await;
        Ok(instance_ref)
    }

    async fn message_start_command(
        &self,
        payload: &MessageEventPayload,
    ) -> EngineResult<(ProcessInstanceRef, Vec<AgendaAction>)> {
        let correlation = self.subscriptions.correlate(
            &payload.name,
            payload.correlation_key.as_deref(),
            payload.business_key.as_deref(),
        );
        let mut target = None;
        for sub in &correlation.starts {
            let Some(deployed) = sub
                .process_definition_id()
                .map(|id| self.deployments.get(id))
                .transpose()?
                .flatten()
            else {
                continue;
            };
            if deployed.suspended {
                debug!(process_definition_id = %deployed.definition().id, "message start skipped, definition suspended");
                continue;
            }
            target = Some((sub.activity_id.clone(), deployed));
            break;
        }
        let (start_id, deployed) = target.ok_or_else(|| {
            EngineError::correlation(&payload.name, payload.correlation_key.as_deref())
        })?;
        self.start_command(&deployed, &start_id, payload.business_key.clone(), payload.variables.clone())
            .await
    }

    async fn start_command(
        &self,
        deployed: &DeployedProcess,
        start_activity_id: &str,
        business_key: Option<String>,
        variables: VariableMap,
    ) -> EngineResult<(ProcessInstanceRef, Vec<AgendaAction>)> {
        let mut ctx = CommandContext::new();
        let outcome = self
            .vm(deployed)
            .start_instance(&mut ctx, start_activity_id, business_key, variables);
        let (instance_ref, actions) = self.finish(ctx, outcome).await?;
        info!(
            process_instance_id = %instance_ref.process_instance_id,
            process_definition_id = %instance_ref.process_definition_id,
            business_key = ?instance_ref.business_key,
            "process instance started"
        );
        Ok((instance_ref, actions))
    }

    // ── Messages and signals ──

    /// Delivers a message to the waiting catch subscription it correlates with.
    ///
    /// Of several concurrent deliveries that match the same subscription exactly one
    /// resumes the token; the others fail with a correlation error.
    pub async fn receive_message(&self, payload: &MessageEventPayload) -> EngineResult<()> {
        let correlation = self.subscriptions.correlate(
            &payload.name,
            payload.correlation_key.as_deref(),
            payload.business_key.as_deref(),
        );
        let claimed = correlation
            .catches
            .iter()
            .find_map(|sub| self.subscriptions.try_consume(&sub.id))
            .ok_or_else(|| EngineError::correlation(&payload.name, payload.correlation_key.as_deref()))?;
        let actions = self
            .resume_claimed(claimed, payload.business_key.as_deref(), payload.variables.clone())
            .await?;
        self.drain_agenda(actions).await;
        Ok(())
    }

    /// Resumes tokens waiting on `signal_name`, in every instance or in one. Returns the
    /// number resumed. Suspended instances keep their subscription.
    pub async fn signal_event_received(
        &self,
        signal_name: &str,
        process_instance_id: Option<&str>,
        variables: VariableMap,
    ) -> EngineResult<usize> {
        let (resumed, actions) = self
            .signal_command(signal_name, process_instance_id, variables)
            .await?;
        self.drain_agenda(actions).await;
        Ok(resumed)
    }

    async fn signal_command(
        &self,
        signal_name: &str,
        process_instance_id: Option<&str>,
        variables: VariableMap,
    ) -> EngineResult<(usize, Vec<AgendaAction>)> {
        let mut resumed = 0;
        let mut actions = Vec::new();
        for sub in self
            .subscriptions
            .signal_subscriptions(signal_name, process_instance_id)
        {
            let Some(claimed) = self.subscriptions.try_consume(&sub.id) else {
                continue;
            };
            match self.resume_claimed(claimed, None, variables.clone()).await {
                Ok(more) => {
                    resumed += 1;
                    actions.extend(more);
                }
                Err(EngineError::IllegalState(reason)) => {
                    debug!(subscription_id = %sub.id, %reason, "signal not delivered");
                }
                Err(e) => return Err(e),
            }
        }
        Ok((resumed, actions))
    }

    /// Thrown message: the instance's own catch first, then a message start.
    async fn throw_message_command(
        &self,
        message_name: &str,
        process_instance_id: Option<&str>,
    ) -> EngineResult<Vec<AgendaAction>> {
        if let Some(instance_id) = process_instance_id {
            let waiting = self
                .subscriptions
                .instance_message_subscriptions(message_name, instance_id);
            if let Some(claimed) = waiting
                .iter()
                .find_map(|sub| self.subscriptions.try_consume(&sub.id))
            {
                return self.resume_claimed(claimed, None, VariableMap::new()).await;
            }
        }
        let payload = MessageEventPayload::builder(message_name).build_with(self.ids.as_ref())?;
        Ok(self.message_start_command(&payload).await?.1)
    }

    async fn resume_claimed(
        &self,
        claimed: EventSubscription,
        business_key: Option<&str>,
        variables: VariableMap,
    ) -> EngineResult<Vec<AgendaAction>> {
        let mut ctx = CommandContext::new();
        ctx.claimed(claimed.clone());
        let Some(instance_id) = claimed.process_instance_id().map(str::to_string) else {
            ctx.rollback(&self.subscriptions);
            return Err(EngineError::IllegalState(format!(
                "subscription '{}' does not target an execution",
                claimed.id
            )));
        };

        let guard = self.lock_instance(&instance_id).await;
        let result = match self.load_instance(&mut ctx, &instance_id).await {
            Ok(deployed) => {
                let outcome = self
                    .vm(&deployed)
                    .resume_catch(&mut ctx, &claimed, business_key, variables);
                self.finish(ctx, outcome).await.map(|(_, actions)| actions)
            }
            Err(e) => {
                ctx.rollback(&self.subscriptions);
                Err(e)
            }
        };
        self.unlock_instance(&instance_id, guard);
        result
    }

    // ── Tasks ──

    pub async fn complete_task(&self, task_id: &str, variables: VariableMap) -> EngineResult<()> {
        let task = self.find_task(task_id).await?;
        let ((), actions) = self
            .instance_command(&task.process_instance_id, |vm, ctx| {
                vm.complete_task(ctx, task_id, variables)
            })
            .await?;
        info!(task_id, process_instance_id = %task.process_instance_id, "task completed");
        self.drain_agenda(actions).await;
        Ok(())
    }

    pub async fn add_candidate_user(&self, task_id: &str, user_id: &str) -> EngineResult<IdentityLink> {
        self.add_candidate(task_id, Some(user_id), None).await
    }

    pub async fn add_candidate_group(&self, task_id: &str, group_id: &str) -> EngineResult<IdentityLink> {
        self.add_candidate(task_id, None, Some(group_id)).await
    }

    /// Adds a `candidate` link for exactly one of a user or a group.
    pub async fn add_candidate(
        &self,
        task_id: &str,
        user_id: Option<&str>,
        group_id: Option<&str>,
    ) -> EngineResult<IdentityLink> {
        let ids = Arc::clone(&self.ids);
        self.task_command(task_id, move |ctx, task| {
            add_candidate(ctx, ids.as_ref(), task, user_id, group_id)
        })
        .await
    }

    pub async fn add_identity_link(
        &self,
        task_id: &str,
        link_type: &str,
        user_id: Option<&str>,
        group_id: Option<&str>,
    ) -> EngineResult<IdentityLink> {
        let ids = Arc::clone(&self.ids);
        self.task_command(task_id, move |ctx, task| {
            add_identity_link(ctx, ids.as_ref(), task, link_type, user_id, group_id)
        })
        .await
    }

    /// Deletes a link of the task. A "candidate removed" runtime event follows only for
    /// candidate links with the matching id set.
    pub async fn remove_candidate(&self, task_id: &str, identity_link_id: &str) -> EngineResult<IdentityLink> {
        self.task_command(task_id, move |ctx, task| {
            delete_identity_link(ctx, task, identity_link_id)
        })
        .await
    }

    async fn task_command<T, F>(&self, task_id: &str, op: F) -> EngineResult<T>
    where
        T: Send,
        F: FnOnce(&mut CommandContext, &Task) -> EngineResult<T> + Send,
    {
        let task = self.find_task(task_id).await?;
        let (value, actions) = self
            .instance_command(&task.process_instance_id, |_, ctx| {
                let task = ctx
                    .tasks
                    .get(task_id)
                    .cloned()
                    .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}'")))?;
                op(ctx, &task)
            })
            .await?;
        self.drain_agenda(actions).await;
        Ok(value)
    }

    // ── Instances ──

    /// Sets variables on the instance scope (the root execution).
    pub async fn set_variables(&self, process_instance_id: &str, variables: VariableMap) -> EngineResult<()> {
        let ((), actions) = self
            .instance_command(process_instance_id, |vm, ctx| {
                let root = ctx
                    .instances
                    .get(process_instance_id)
                    .filter(|i| !i.state.is_terminal())
                    .map(|i| i.root_token_id.clone())
                    .ok_or_else(|| {
                        EngineError::IllegalState(format!(
                            "process instance '{process_instance_id}' has ended"
                        ))
                    })?;
                vm.set_variables(ctx, &root, variables)
            })
            .await?;
        self.drain_agenda(actions).await;
        Ok(())
    }

    pub async fn suspend_process_instance(&self, process_instance_id: &str) -> EngineResult<()> {
        let ((), actions) = self
            .instance_command(process_instance_id, |vm, ctx| {
                vm.set_suspended(ctx, process_instance_id, true)
            })
            .await?;
        self.drain_agenda(actions).await;
        Ok(())
    }

    pub async fn activate_process_instance(&self, process_instance_id: &str) -> EngineResult<()> {
        let ((), actions) = self
            .instance_command(process_instance_id, |vm, ctx| {
                vm.set_suspended(ctx, process_instance_id, false)
            })
            .await?;
        self.drain_agenda(actions).await;
        Ok(())
    }

    /// Cancels the instance: every token is terminated and its tasks and subscriptions
    /// are removed in this one command.
    pub async fn delete_process_instance(&self, process_instance_id: &str, reason: &str) -> EngineResult<()> {
        let actions = self
            .cancel_command(process_instance_id, reason.to_string())
            .await?;
        info!(process_instance_id, reason, "process instance cancelled");
        self.drain_agenda(actions).await;
        Ok(())
    }

    async fn cancel_command(&self, process_instance_id: &str, reason: String) -> EngineResult<Vec<AgendaAction>> {
        let ((), actions) = self
            .instance_command(process_instance_id, |vm, ctx| {
                vm.terminate_instance(ctx, process_instance_id, Termination::Cancelled { reason })
            })
            .await?;
        Ok(actions)
    }

    // ── Queries ──

    pub fn process_definition(&self, process_definition_id: &str) -> EngineResult<Option<Arc<ProcessDefinition>>> {
        Ok(self
            .deployments
            .get(process_definition_id)?
            .map(|d| Arc::clone(d.definition())))
    }

    pub fn latest_process_definition(&self, key: &str) -> EngineResult<Option<Arc<ProcessDefinition>>> {
        Ok(self.deployments.latest(key)?.map(|d| Arc::clone(d.definition())))
    }

    pub fn process_definitions(&self) -> EngineResult<Vec<Arc<ProcessDefinition>>> {
        Ok(self.deployments.all()?)
    }

    pub fn is_process_definition_suspended(&self, process_definition_id: &str) -> EngineResult<bool> {
        Ok(self.deployed(process_definition_id)?.suspended)
    }

    pub async fn deployments(&self) -> EngineResult<Vec<Deployment>> {
        let mut all = self.stores.deployments.find_where(&|_: &Deployment| true).await?;
        all.sort_by_key(|d| d.deployed_at);
        Ok(all)
    }

    pub async fn process_instance(&self, process_instance_id: &str) -> EngineResult<Option<ProcessInstance>> {
        Ok(self.stores.instances.find_by_id(process_instance_id).await?)
    }

    pub async fn process_instances_by_key(&self, key: &str) -> EngineResult<Vec<ProcessInstance>> {
        Ok(self
            .stores
            .instances
            .find_where(&|i: &ProcessInstance| i.process_key == key)
            .await?)
    }

    /// Live executions of an instance; empty once it ended.
    pub async fn executions(&self, process_instance_id: &str) -> EngineResult<Vec<ExecutionToken>> {
        Ok(self
            .stores
            .tokens
            .find_where(&|t: &ExecutionToken| t.process_instance_id == process_instance_id)
            .await?)
    }

    pub async fn task(&self, task_id: &str) -> EngineResult<Option<Task>> {
        Ok(self.stores.tasks.find_by_id(task_id).await?)
    }

    pub async fn tasks(&self, process_instance_id: &str) -> EngineResult<Vec<Task>> {
        Ok(self
            .stores
            .tasks
            .find_where(&|t: &Task| t.process_instance_id == process_instance_id)
            .await?)
    }

    /// Open tasks `user_id` is a candidate for, directly or through one of `groups`.
    pub async fn candidate_tasks(&self, user_id: &str, groups: &[String]) -> EngineResult<Vec<Task>> {
        let links = self
            .stores
            .identity_links
            .find_where(&|l: &IdentityLink| {
                l.is_candidate()
                    && (l.user_id.as_deref() == Some(user_id)
                        || l.group_id.as_ref().is_some_and(|g| groups.contains(g)))
            })
            .await?;
        let task_ids: HashSet<String> = links.into_iter().map(|l| l.task_id).collect();
        Ok(self
            .stores
            .tasks
            .find_where(&|t: &Task| task_ids.contains(&t.id))
            .await?)
    }

    pub async fn identity_links(&self, task_id: &str) -> EngineResult<Vec<IdentityLink>> {
        Ok(self
            .stores
            .identity_links
            .find_where(&|l: &IdentityLink| l.task_id == task_id)
            .await?)
    }

    pub fn event_subscriptions(&self) -> Vec<EventSubscription> {
        self.subscriptions.all()
    }

    pub fn start_message_subscriptions(&self) -> EngineResult<Vec<StartMessageSubscription>> {
        self.subscriptions
            .all()
            .iter()
            .filter(|s| s.kind == SubscriptionKind::MessageStart)
            .map(|s| StartMessageSubscription::try_from_subscription(Some(s)))
            .collect()
    }

    /// Variables visible at the instance scope.
    pub async fn variables(&self, process_instance_id: &str) -> EngineResult<VariableMap> {
        let instance = self
            .process_instance(process_instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("process instance '{process_instance_id}'")))?;
        let mut tokens = Staged::default();
        for token in self.executions(process_instance_id).await? {
            tokens.load(token);
        }
        Ok(resolve_variables(&tokens, &instance.root_token_id))
    }

    // ── Command bracket ──

    fn vm<'a>(&'a self, deployed: &'a DeployedProcess) -> Vm<'a> {
        Vm::new(
            deployed.definition(),
            self.evaluator.as_ref(),
            self.ids.as_ref(),
            self.config.max_transitions_per_command,
        )
    }

    fn deployed(&self, process_definition_id: &str) -> EngineResult<DeployedProcess> {
        self.deployments
            .get(process_definition_id)?
            .ok_or_else(|| EngineError::NotFound(format!("process definition '{process_definition_id}'")))
    }

    async fn lock_instance(&self, process_instance_id: &str) -> OwnedMutexGuard<()> {
        let lock = Arc::clone(
            self.instance_locks
                .entry(process_instance_id.to_string())
                .or_default()
                .value(),
        );
        lock.lock_owned().await
    }

    /// Releases the guard and drops the lock entry unless another command holds or
    /// awaits it.
    fn unlock_instance(&self, process_instance_id: &str, guard: OwnedMutexGuard<()>) {
        drop(guard);
        self.instance_locks
            .remove_if(process_instance_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn find_task(&self, task_id: &str) -> EngineResult<Task> {
        self.stores
            .tasks
            .find_by_id(task_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}'")))
    }

    /// Loads the instance with its tokens, tasks and task links into the context.
    async fn load_instance(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &str,
    ) -> EngineResult<DeployedProcess> {
        let instance = self
            .stores
            .instances
            .find_by_id(process_instance_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(format!("process instance '{process_instance_id}'")))?;
        let deployed = self.deployed(&instance.process_definition_id)?;

        for token in self.executions(process_instance_id).await? {
            ctx.tokens.load(token);
        }
        let tasks = self.tasks(process_instance_id).await?;
        let task_ids: HashSet<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in tasks {
            ctx.tasks.load(task);
        }
        for link in self
            .stores
            .identity_links
            .find_where(&|l: &IdentityLink| task_ids.contains(&l.task_id))
            .await?
        {
            ctx.identity_links.load(link);
        }
        ctx.instances.load(instance);
        Ok(deployed)
    }

    /// Runs `op` against the loaded instance under its lock, then finishes the command.
    async fn instance_command<T, F>(
        &self,
        process_instance_id: &str,
        op: F,
    ) -> EngineResult<(T, Vec<AgendaAction>)>
    where
        T: Send,
        F: FnOnce(&Vm<'_>, &mut CommandContext) -> EngineResult<T> + Send,
    {
        let guard = self.lock_instance(process_instance_id).await;
        let mut ctx = CommandContext::new();
        let result = match self.load_instance(&mut ctx, process_instance_id).await {
            Ok(deployed) => {
                let outcome = op(&self.vm(&deployed), &mut ctx);
                self.finish(ctx, outcome).await
            }
            Err(e) => Err(e),
        };
        self.unlock_instance(process_instance_id, guard);
        result
    }

    /// Dispatches staged events, then commits; rolls back on any failure.
    async fn finish<T: Send>(
        &self,
        mut ctx: CommandContext,
        outcome: EngineResult<T>,
    ) -> EngineResult<(T, Vec<AgendaAction>)> {
        let value = match outcome {
            Ok(value) => value,
            Err(e) => {
                ctx.rollback(&self.subscriptions);
                return Err(e);
            }
        };
        if let Err(e) = self.dispatch_pending(&mut ctx) {
            ctx.rollback(&self.subscriptions);
            return Err(e);
        }
        let agenda = ctx.commit(&self.stores, &self.subscriptions).await?;
        Ok((value, agenda.into_actions()))
    }

    fn dispatch_pending(&self, ctx: &mut CommandContext) -> EngineResult<()> {
        let mut supports: HashMap<String, Option<Arc<EventDispatcher>>> = HashMap::new();
        for event in ctx.take_events() {
            let support = match &event.process_definition_id {
                Some(id) => match supports.get(id) {
                    Some(cached) => cached.clone(),
                    None => {
                        let found = self
                            .deployments
                            .get(id)?
                            .map(|d| Arc::clone(&d.compiled.event_support));
                        supports.insert(id.clone(), found.clone());
                        found
                    }
                },
                None => None,
            };
            self.dispatch_to(&event, &mut ctx.agenda, support.as_ref())?;
        }
        Ok(())
    }

    fn dispatch_to(
        &self,
        event: &EngineEvent,
        agenda: &mut Agenda,
        support: Option<&Arc<EventDispatcher>>,
    ) -> EngineResult<()> {
        self.dispatcher.dispatch(event, agenda)?;
        if let Some(support) = support {
            support.dispatch(event, agenda)?;
        }
        Ok(())
    }

    /// Runs queued follow-up actions, each as its own command. Failures are logged;
    /// the command that queued them has already committed.
    async fn drain_agenda(&self, actions: Vec<AgendaAction>) {
        let mut pending: VecDeque<AgendaAction> = actions.into();
        let mut executed = 0usize;
        while let Some(action) = pending.pop_front() {
            if executed >= self.config.max_agenda_actions {
                warn!(
                    dropped = pending.len() + 1,
                    limit = self.config.max_agenda_actions,
                    "agenda limit reached, remaining actions dropped"
                );
                break;
            }
            executed += 1;
            let result = match &action {
                AgendaAction::ThrowSignal {
                    name,
                    process_instance_id,
                } => self
                    .signal_command(name, process_instance_id.as_deref(), VariableMap::new())
                    .await
                    .map(|(_, more)| more),
                AgendaAction::ThrowMessage {
                    name,
                    process_instance_id,
                } => self
                    .throw_message_command(name, process_instance_id.as_deref())
                    .await,
            };
            match result {
                Ok(more) => pending.extend(more),
                Err(e) => warn!(action = ?action, error = %e, "agenda action failed"),
            }
        }
    }
}

impl Default for ProcessEngine {
    fn default() -> Self {
        Self::builder().build()
    }
}

fn subscription_event(event_type: EngineEventType, sub: &EventSubscription) -> EngineEvent {
    let event = EngineEvent::new(event_type, EventEntity::Subscription(sub.clone()))
        .with_activity(&sub.activity_id);
    match sub.process_definition_id() {
        Some(id) => event.with_definition(id),
        None => event,
    }
}
