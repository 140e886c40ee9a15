use std::collections::VecDeque;

use chrono::Utc;
use serde_json::Value;
use tracing::debug;

use crate::command::{CommandContext, Staged};
use crate::error::{EngineError, EngineResult};
use crate::events::{EngineEvent, EngineEventType, EventEntity};
use crate::expression::ExpressionEvaluator;
use crate::ids::IdGenerator;
use crate::payloads::ProcessInstanceRef;
use crate::subscription::SubscriptionManager;
use crate::task;
use crate::types::*;

/// How an instance ends when all of its tokens are removed at once.
#[derive(Debug, Clone, PartialEq)]
pub enum Termination {
    /// Terminate end event reached.
    Completed,
    Cancelled { reason: String },
}

/// Token runtime for one process definition.
///
/// Every operation works on a [`CommandContext`] and never touches shared state, so a
/// failed operation is undone by dropping the context.
pub struct Vm<'a> {
    definition: &'a ProcessDefinition,
    evaluator: &'a dyn ExpressionEvaluator,
    ids: &'a dyn IdGenerator,
    max_transitions: usize,
}

impl<'a> Vm<'a> {
    pub fn new(
        definition: &'a ProcessDefinition,
        evaluator: &'a dyn ExpressionEvaluator,
        ids: &'a dyn IdGenerator,
        max_transitions: usize,
    ) -> Self {
        Self {
            definition,
            evaluator,
            ids,
            max_transitions,
        }
    }

    // ── Commands ──

    /// Creates an instance anchored at `start_activity_id` and runs it until every
    /// token waits or ends.
    pub fn start_instance(
        &self,
        ctx: &mut CommandContext,
        start_activity_id: &str,
        business_key: Option<String>,
        variables: VariableMap,
    ) -> EngineResult<ProcessInstanceRef> {
        let def = self.definition;
        if !def.executable {
            return Err(EngineError::IllegalState(format!(
                "process definition '{}' is not executable",
                def.id
            )));
        }
        let start = def
            .element(start_activity_id)
            .filter(|e| matches!(e.kind, ElementKind::StartEvent { .. }))
            .ok_or_else(|| {
                EngineError::NotFound(format!(
                    "start event '{start_activity_id}' in '{}'",
                    def.id
                ))
            })?;

        let token = ExecutionToken {
            id: self.ids.next_id(),
            process_instance_id: self.ids.next_id(),
            process_definition_id: def.id.clone(),
            current_element_id: start.id.clone(),
            parent_token_id: None,
            variables: VariableMap::new(),
            state: TokenState::Active,
            wait: WaitState::Running,
        };
        let instance = ProcessInstance {
            id: token.process_instance_id.clone(),
            process_definition_id: def.id.clone(),
            process_key: def.key.clone(),
            business_key: business_key.clone(),
            start_activity_id: start.id.clone(),
            root_token_id: token.id.clone(),
            state: InstanceState::Active,
            join_arrivals: Default::default(),
            created: Utc::now(),
            ended: None,
        };
        let instance_ref = ProcessInstanceRef {
            process_instance_id: instance.id.clone(),
            process_definition_id: def.id.clone(),
            business_key,
            start_activity_id: start.id.clone(),
            token_id: token.id.clone(),
        };

        ctx.instances.put(instance.clone());
        ctx.tokens.put(token.clone());
        ctx.emit(instance_event(EngineEventType::EntityCreated, &instance));
        for (name, value) in variables {
            self.set_variable(ctx, &token.id, &name, value)?;
        }
        ctx.emit(instance_event(EngineEventType::ProcessStarted, &instance));
        debug!(
            process_instance_id = %instance.id,
            process_definition_id = %def.id,
            start_activity_id = %start.id,
            "process instance started"
        );

        self.run(ctx, VecDeque::from([token.id]))?;
        Ok(instance_ref)
    }

    /// Resumes the token waiting on `subscription`, which the caller already claimed.
    pub fn resume_catch(
        &self,
        ctx: &mut CommandContext,
        subscription: &EventSubscription,
        business_key: Option<&str>,
        variables: VariableMap,
    ) -> EngineResult<()> {
        let token_id = subscription.execution_id().ok_or_else(|| {
            EngineError::IllegalState(format!(
                "subscription '{}' does not target an execution",
                subscription.id
            ))
        })?;
        let token = self.active_token(ctx, token_id)?;
        let waiting = match &token.wait {
            WaitState::Message { subscription_id } | WaitState::Signal { subscription_id } => {
                subscription_id == &subscription.id
            }
            _ => false,
        };
        if !waiting {
            return Err(EngineError::IllegalState(format!(
                "execution '{}' is not waiting for subscription '{}'",
                token.id, subscription.id
            )));
        }

        let (event_type, entity) = match subscription.kind {
            SubscriptionKind::Signal => (
                EngineEventType::ActivitySignaled,
                EventEntity::Signal {
                    name: subscription.event_name.clone(),
                },
            ),
            _ => (
                EngineEventType::ActivityMessageReceived,
                EventEntity::Message {
                    name: subscription.event_name.clone(),
                    correlation_key: subscription.correlation_key.clone(),
                    business_key: business_key.map(str::to_string),
                },
            ),
        };
        ctx.emit(EngineEvent::new(event_type, entity).with_token(&token));
        for (name, value) in variables {
            self.set_variable(ctx, &token.id, &name, value)?;
        }
        self.continue_after_wait(ctx, &token.id)
    }

    /// Completes a user task and moves its token on.
    pub fn complete_task(
        &self,
        ctx: &mut CommandContext,
        task_id: &str,
        variables: VariableMap,
    ) -> EngineResult<()> {
        let task = ctx
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("task '{task_id}'")))?;
        let token = self.active_token(ctx, &task.execution_id)?;

        task::delete_task_links(ctx, &task);
        ctx.tasks.remove(&task.id);
        for (name, value) in variables {
            self.set_variable(ctx, &token.id, &name, value)?;
        }
        ctx.emit(EngineEvent::new(EngineEventType::TaskCompleted, EventEntity::Task(task)).with_token(&token));
        self.continue_after_wait(ctx, &token.id)
    }

    pub fn set_variables(
        &self,
        ctx: &mut CommandContext,
        token_id: &str,
        variables: VariableMap,
    ) -> EngineResult<()> {
        self.token(ctx, token_id)?;
        for (name, value) in variables {
            self.set_variable(ctx, token_id, &name, value)?;
        }
        Ok(())
    }

    pub fn set_suspended(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &str,
        suspended: bool,
    ) -> EngineResult<()> {
        let instance = self.instance_mut(ctx, process_instance_id)?;
        let next = match (&instance.state, suspended) {
            (InstanceState::Active, true) => InstanceState::Suspended,
            (InstanceState::Suspended, false) => InstanceState::Active,
            (state, _) => {
                return Err(EngineError::IllegalState(format!(
                    "process instance '{process_instance_id}' is {state:?}"
                )))
            }
        };
        instance.state = next;
        let instance = instance.clone();
        let token_state = if suspended {
            TokenState::Suspended
        } else {
            TokenState::Active
        };
        for id in ctx
            .tokens
            .ids_where(|t| t.process_instance_id == process_instance_id)
        {
            if let Some(token) = ctx.tokens.get_mut(&id) {
                token.state = token_state;
            }
        }
        let event_type = if suspended {
            EngineEventType::EntitySuspended
        } else {
            EngineEventType::EntityActivated
        };
        ctx.emit(instance_event(event_type, &instance));
        Ok(())
    }

    /// Removes every token, task and subscription of the instance and closes it.
    pub fn terminate_instance(
        &self,
        ctx: &mut CommandContext,
        process_instance_id: &str,
        termination: Termination,
    ) -> EngineResult<()> {
        if self.instance_mut(ctx, process_instance_id)?.state.is_terminal() {
            return Err(EngineError::IllegalState(format!(
                "process instance '{process_instance_id}' already ended"
            )));
        }

        for id in ctx
            .tokens
            .ids_where(|t| t.process_instance_id == process_instance_id)
        {
            ctx.tokens.remove(&id);
        }
        for id in ctx
            .tasks
            .ids_where(|t| t.process_instance_id == process_instance_id)
        {
            if let Some(task) = ctx.tasks.remove(&id) {
                task::delete_task_links(ctx, &task);
                ctx.emit(
                    EngineEvent::new(EngineEventType::EntityDeleted, EventEntity::Task(task.clone()))
                        .with_definition(&task.process_definition_id)
                        .with_instance(&task.process_instance_id)
                        .with_activity(&task.task_definition_key),
                );
            }
        }
        ctx.release_instance_subscriptions(process_instance_id);

        let instance = self.instance_mut(ctx, process_instance_id)?;
        instance.join_arrivals.clear();
        instance.ended = Some(Utc::now());
        let event_type = match termination {
            Termination::Completed => {
                instance.state = InstanceState::Completed;
                EngineEventType::ProcessCompleted
            }
            Termination::Cancelled { reason } => {
                instance.state = InstanceState::Cancelled { reason };
                EngineEventType::ProcessCancelled
            }
        };
        let instance = instance.clone();
        ctx.emit(instance_event(event_type, &instance));
        Ok(())
    }

    // ── Run loop ──

    fn run(&self, ctx: &mut CommandContext, mut queue: VecDeque<String>) -> EngineResult<()> {
        let mut transitions = 0usize;
        while let Some(token_id) = queue.pop_front() {
            transitions += 1;
            if transitions > self.max_transitions {
                return Err(EngineError::TransitionLimit {
                    limit: self.max_transitions,
                });
            }
            self.execute(ctx, &token_id, &mut queue)?;
        }
        Ok(())
    }

    fn continue_after_wait(&self, ctx: &mut CommandContext, token_id: &str) -> EngineResult<()> {
        let token = self.token_mut(ctx, token_id)?;
        token.wait = WaitState::Running;
        let token = token.clone();
        let element = self.element(&token.current_element_id)?;
        ctx.emit(activity_event(EngineEventType::ActivityCompleted, &token, element));

        let mut queue = VecDeque::new();
        self.leave(ctx, token_id, &mut queue)?;
        self.run(ctx, queue)
    }

    /// Runs the behavior of the element the token just arrived at.
    fn execute(
        &self,
        ctx: &mut CommandContext,
        token_id: &str,
        queue: &mut VecDeque<String>,
    ) -> EngineResult<()> {
        // Gone: removed by a terminate end earlier in this command.
        let Some(token) = ctx.tokens.get(token_id).cloned() else {
            return Ok(());
        };
        let element = self.element(&token.current_element_id)?;
        ctx.emit(activity_event(EngineEventType::ActivityStarted, &token, element));

        match &element.kind {
            ElementKind::StartEvent { .. }
            | ElementKind::Task
            | ElementKind::ExclusiveGateway { .. }
            | ElementKind::Custom { .. } => {
                ctx.emit(activity_event(EngineEventType::ActivityCompleted, &token, element));
                self.leave(ctx, token_id, queue)
            }
            ElementKind::ServiceTask {
                expression,
                result_variable,
            } => self.run_expression(ctx, &token, element, expression, result_variable, queue),
            ElementKind::ScriptTask {
                script,
                result_variable,
            } => self.run_expression(ctx, &token, element, script, result_variable, queue),
            ElementKind::EndEvent { terminate } => {
                ctx.emit(activity_event(EngineEventType::ActivityCompleted, &token, element));
                if *terminate {
                    self.terminate_instance(ctx, &token.process_instance_id, Termination::Completed)
                } else {
                    self.end_token(ctx, token_id)
                }
            }
            ElementKind::UserTask { .. } => self.create_user_task(ctx, &token, element),
            ElementKind::ParallelGateway => self.parallel_gateway(ctx, &token, element, queue),
            ElementKind::MessageCatchEvent {
                message,
                correlation_key,
            } => {
                let scope = self.scope(ctx, token_id);
                let correlation_key = match correlation_key {
                    Some(raw) => self.evaluator.evaluate_string(raw, &scope)?,
                    None => None,
                };
                self.wait_for(ctx, &token, SubscriptionKind::MessageCatch, message, correlation_key)
            }
            ElementKind::SignalCatchEvent { signal } => {
                self.wait_for(ctx, &token, SubscriptionKind::Signal, signal, None)
            }
            ElementKind::SequenceFlow { .. } => Err(EngineError::IllegalState(format!(
                "execution '{token_id}' is positioned on sequence flow '{}'",
                element.id
            ))),
        }
    }

    fn run_expression(
        &self,
        ctx: &mut CommandContext,
        token: &ExecutionToken,
        element: &FlowElement,
        expression: &Option<String>,
        result_variable: &Option<String>,
        queue: &mut VecDeque<String>,
    ) -> EngineResult<()> {
        if let Some(expression) = expression {
            let scope = self.scope(ctx, &token.id);
            let value = self.evaluator.evaluate(expression, &scope)?;
            if let Some(name) = result_variable {
                self.set_variable(ctx, &token.id, name, value)?;
            }
        }
        ctx.emit(activity_event(EngineEventType::ActivityCompleted, token, element));
        self.leave(ctx, &token.id, queue)
    }

    // ── Sequence flows ──

    /// Takes the first outgoing flow whose guard holds, else the default flow. A token
    /// on an element without outgoing flows ends.
    fn leave(
        &self,
        ctx: &mut CommandContext,
        token_id: &str,
        queue: &mut VecDeque<String>,
    ) -> EngineResult<()> {
        let element_id = self.token(ctx, token_id)?.current_element_id.clone();
        let element = self.element(&element_id)?;
        let flows = self.definition.outgoing_flows(&element_id);
        if flows.is_empty() {
            return self.end_token(ctx, token_id);
        }

        let default_flow = match &element.kind {
            ElementKind::ExclusiveGateway { default_flow } => default_flow.as_deref(),
            _ => None,
        };
        let scope = self.scope(ctx, token_id);
        let mut chosen = None;
        for flow in &flows {
            if Some(flow.id.as_str()) == default_flow {
                continue;
            }
            let eligible = match &flow.kind {
                ElementKind::SequenceFlow {
                    condition: Some(condition),
                    ..
                } => self.evaluator.evaluate_bool(condition, &scope)?,
                _ => true,
            };
            if eligible {
                chosen = Some(*flow);
                break;
            }
        }
        let chosen = chosen
            .or_else(|| default_flow.and_then(|id| flows.iter().find(|f| f.id == id).copied()))
            .ok_or_else(|| EngineError::NoEligibleFlow {
                element_id: element_id.clone(),
            })?;
        self.take_flow(ctx, token_id, chosen, queue)
    }

    fn take_flow(
        &self,
        ctx: &mut CommandContext,
        token_id: &str,
        flow: &FlowElement,
        queue: &mut VecDeque<String>,
    ) -> EngineResult<()> {
        let ElementKind::SequenceFlow { source, target, .. } = &flow.kind else {
            return Err(EngineError::IllegalState(format!(
                "'{}' is not a sequence flow",
                flow.id
            )));
        };
        let token = self.token_mut(ctx, token_id)?;
        token.current_element_id = target.clone();
        token.wait = WaitState::Running;
        let token = token.clone();
        ctx.emit(
            EngineEvent::new(
                EngineEventType::SequenceflowTaken,
                EventEntity::SequenceFlow {
                    id: flow.id.clone(),
                    source: source.clone(),
                    target: target.clone(),
                },
            )
            .with_token(&token)
            .with_activity(&flow.id),
        );
        queue.push_back(token.id);
        Ok(())
    }

    // ── Parallel gateway ──

    fn parallel_gateway(
        &self,
        ctx: &mut CommandContext,
        token: &ExecutionToken,
        element: &FlowElement,
        queue: &mut VecDeque<String>,
    ) -> EngineResult<()> {
        ctx.emit(activity_event(EngineEventType::ActivityCompleted, token, element));

        let joining = element.incoming.len() > 1;
        let Some(parent_id) = token.parent_token_id.clone().filter(|_| joining) else {
            return self.fork_or_leave(ctx, &token.id, element, queue);
        };

        let key = format!("{parent_id}:{}", element.id);
        let instance = self.instance_mut(ctx, &token.process_instance_id)?;
        let arrived = {
            let count = instance.join_arrivals.entry(key.clone()).or_insert(0);
            *count += 1;
            *count
        };
        ctx.tokens.remove(&token.id);
        if arrived < element.incoming.len() {
            debug!(join = %key, arrived, expected = element.incoming.len(), "join waiting");
            return Ok(());
        }

        self.instance_mut(ctx, &token.process_instance_id)?
            .join_arrivals
            .remove(&key);
        let parent = self.token_mut(ctx, &parent_id)?;
        parent.current_element_id = element.id.clone();
        parent.wait = WaitState::Running;
        self.fork_or_leave(ctx, &parent_id, element, queue)
    }

    fn fork_or_leave(
        &self,
        ctx: &mut CommandContext,
        token_id: &str,
        element: &FlowElement,
        queue: &mut VecDeque<String>,
    ) -> EngineResult<()> {
        let flows = self.definition.outgoing_flows(&element.id);
        if flows.len() <= 1 {
            return self.leave(ctx, token_id, queue);
        }

        let parent = self.token_mut(ctx, token_id)?;
        parent.wait = WaitState::Forked;
        let parent = parent.clone();
        for flow in flows {
            let child = ExecutionToken {
                id: self.ids.next_id(),
                process_instance_id: parent.process_instance_id.clone(),
                process_definition_id: parent.process_definition_id.clone(),
                current_element_id: element.id.clone(),
                parent_token_id: Some(parent.id.clone()),
                variables: VariableMap::new(),
                state: TokenState::Active,
                wait: WaitState::Running,
            };
            let child_id = child.id.clone();
            ctx.tokens.put(child);
            self.take_flow(ctx, &child_id, flow, queue)?;
        }
        Ok(())
    }

    // ── Ending ──

    /// Ends a token. A forked parent whose last child ended ends too; the root token
    /// ending completes the instance.
    fn end_token(&self, ctx: &mut CommandContext, token_id: &str) -> EngineResult<()> {
        let token = ctx
            .tokens
            .remove(token_id)
            .ok_or_else(|| EngineError::NotFound(format!("execution '{token_id}'")))?;

        let Some(parent_id) = token.parent_token_id else {
            return self.terminate_instance(ctx, &token.process_instance_id, Termination::Completed);
        };
        let siblings_left = ctx
            .tokens
            .values()
            .any(|t| t.parent_token_id.as_deref() == Some(parent_id.as_str()));
        let parent_forked = ctx
            .tokens
            .get(&parent_id)
            .is_some_and(|p| p.wait == WaitState::Forked);
        if siblings_left || !parent_forked {
            return Ok(());
        }

        let prefix = format!("{parent_id}:");
        self.instance_mut(ctx, &token.process_instance_id)?
            .join_arrivals
            .retain(|key, _| !key.starts_with(&prefix));
        self.end_token(ctx, &parent_id)
    }

    // ── Wait states ──

    fn create_user_task(
        &self,
        ctx: &mut CommandContext,
        token: &ExecutionToken,
        element: &FlowElement,
    ) -> EngineResult<()> {
        let ElementKind::UserTask {
            assignee,
            candidate_users,
            candidate_groups,
        } = &element.kind
        else {
            return Ok(());
        };
        let scope = self.scope(ctx, &token.id);
        let assignee = match assignee {
            Some(raw) => self.evaluator.evaluate_string(raw, &scope)?,
            None => None,
        };
        let new_task = Task {
            id: self.ids.next_id(),
            name: element.name.clone(),
            task_definition_key: element.id.clone(),
            process_instance_id: token.process_instance_id.clone(),
            process_definition_id: token.process_definition_id.clone(),
            execution_id: token.id.clone(),
            assignee,
            created: Utc::now(),
        };
        ctx.tasks.put(new_task.clone());
        self.token_mut(ctx, &token.id)?.wait = WaitState::UserTask {
            task_id: new_task.id.clone(),
        };

        for user in self.expand_identities(candidate_users, &scope)? {
            task::add_candidate(ctx, self.ids, &new_task, Some(&user), None)?;
        }
        for group in self.expand_identities(candidate_groups, &scope)? {
            task::add_candidate(ctx, self.ids, &new_task, None, Some(&group))?;
        }
        ctx.emit(EngineEvent::new(EngineEventType::TaskCreated, EventEntity::Task(new_task)).with_token(token));
        Ok(())
    }

    /// Evaluates candidate entries; an expression may yield a comma-separated list.
    fn expand_identities(&self, raw: &[String], scope: &VariableMap) -> EngineResult<Vec<String>> {
        let mut out = Vec::new();
        for entry in raw {
            if let Some(value) = self.evaluator.evaluate_string(entry, scope)? {
                out.extend(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string),
                );
            }
        }
        Ok(out)
    }

    fn wait_for(
        &self,
        ctx: &mut CommandContext,
        token: &ExecutionToken,
        kind: SubscriptionKind,
        event_name: &str,
        correlation_key: Option<String>,
    ) -> EngineResult<()> {
        let business_key = ctx
            .instances
            .get(&token.process_instance_id)
            .and_then(|i| i.business_key.clone());
        let sub = SubscriptionManager::catch_subscription(
            self.ids,
            kind,
            token,
            business_key.as_deref(),
            event_name,
            correlation_key,
        );
        let subscription_id = sub.id.clone();
        let (wait, event_type) = match kind {
            SubscriptionKind::Signal => (
                WaitState::Signal { subscription_id },
                EngineEventType::ActivitySignalWaiting,
            ),
            _ => (
                WaitState::Message { subscription_id },
                EngineEventType::ActivityMessageWaiting,
            ),
        };
        self.token_mut(ctx, &token.id)?.wait = wait;
        ctx.add_subscription(sub.clone());
        ctx.emit(EngineEvent::new(event_type, EventEntity::Subscription(sub)).with_token(token));
        Ok(())
    }

    // ── Variables ──

    pub fn scope(&self, ctx: &CommandContext, token_id: &str) -> VariableMap {
        resolve_variables(&ctx.tokens, token_id)
    }

    /// Writes to the nearest token in the ancestry that already defines `name`,
    /// otherwise to the root token.
    fn set_variable(
        &self,
        ctx: &mut CommandContext,
        token_id: &str,
        name: &str,
        value: Value,
    ) -> EngineResult<()> {
        let mut owner = None;
        let mut root = token_id.to_string();
        let mut cursor = Some(token_id.to_string());
        while let Some(id) = cursor {
            let Some(token) = ctx.tokens.get(&id) else {
                break;
            };
            if token.variables.contains_key(name) {
                owner = Some(id);
                break;
            }
            cursor = token.parent_token_id.clone();
            root = id;
        }

        let updated = owner.is_some();
        let target = owner.unwrap_or(root);
        let token = self.token_mut(ctx, &target)?;
        token.variables.insert(name.to_string(), value.clone());
        let token = token.clone();
        let event_type = if updated {
            EngineEventType::VariableUpdated
        } else {
            EngineEventType::VariableCreated
        };
        ctx.emit(
            EngineEvent::new(
                event_type,
                EventEntity::Variable {
                    name: name.to_string(),
                    value,
                },
            )
            .with_token(&token),
        );
        Ok(())
    }

    // ── Lookups ──

    fn element(&self, id: &str) -> EngineResult<&'a FlowElement> {
        self.definition.element(id).ok_or_else(|| {
            EngineError::IllegalState(format!(
                "element '{id}' is not part of '{}'",
                self.definition.id
            ))
        })
    }

    fn token<'c>(&self, ctx: &'c CommandContext, id: &str) -> EngineResult<&'c ExecutionToken> {
        ctx.tokens
            .get(id)
            .ok_or_else(|| EngineError::NotFound(format!("execution '{id}'")))
    }

    fn token_mut<'c>(
        &self,
        ctx: &'c mut CommandContext,
        id: &str,
    ) -> EngineResult<&'c mut ExecutionToken> {
        ctx.tokens
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("execution '{id}'")))
    }

    fn active_token(&self, ctx: &CommandContext, id: &str) -> EngineResult<ExecutionToken> {
        let token = self.token(ctx, id)?;
        match token.state {
            TokenState::Active => Ok(token.clone()),
            TokenState::Suspended => Err(EngineError::IllegalState(format!(
                "execution '{id}' is suspended"
            ))),
            state => Err(EngineError::IllegalState(format!(
                "execution '{id}' is {state:?}"
            ))),
        }
    }

    fn instance_mut<'c>(
        &self,
        ctx: &'c mut CommandContext,
        id: &str,
    ) -> EngineResult<&'c mut ProcessInstance> {
        ctx.instances
            .get_mut(id)
            .ok_or_else(|| EngineError::NotFound(format!("process instance '{id}'")))
    }
}

/// Variables visible to a token: its own over its ancestors'.
pub fn resolve_variables(tokens: &Staged<ExecutionToken>, token_id: &str) -> VariableMap {
    let mut chain = Vec::new();
    let mut cursor = tokens.get(token_id);
    while let Some(token) = cursor {
        chain.push(token);
        cursor = token
            .parent_token_id
            .as_deref()
            .and_then(|parent| tokens.get(parent));
    }
    let mut variables = VariableMap::new();
    for token in chain.iter().rev() {
        variables.extend(token.variables.clone());
    }
    variables
}

fn instance_event(event_type: EngineEventType, instance: &ProcessInstance) -> EngineEvent {
    EngineEvent::new(event_type, EventEntity::Instance(instance.clone()))
        .with_definition(&instance.process_definition_id)
        .with_instance(&instance.id)
}

fn activity_event(
    event_type: EngineEventType,
    token: &ExecutionToken,
    element: &FlowElement,
) -> EngineEvent {
    EngineEvent::new(
        event_type,
        EventEntity::Activity {
            activity_type: element.type_tag().to_string(),
            name: element.name.clone(),
        },
    )
    .with_token(token)
    .with_activity(&element.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{CompileContext, Compiler};
    use crate::document::yaml::parse_process_yaml;
    use crate::expression::ElEvaluator;
    use crate::ids::SequentialIdGenerator;
    use serde_json::json;

    fn compile(yaml: &str) -> ProcessDefinition {
        let doc = parse_process_yaml(yaml).unwrap();
        let compiled = Compiler::new()
            .compile(&doc, &CompileContext::new("dep-1"))
            .unwrap();
        compiled.processes[0].definition.as_ref().clone()
    }

    fn vars(pairs: &[(&str, Value)]) -> VariableMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn types(ctx: &CommandContext) -> Vec<EngineEventType> {
        ctx.pending_events().iter().map(|e| e.event_type).collect()
    }

    const APPROVAL: &str = r#"
processes:
  - id: approval
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: start, targetRef: calc } }
      - kind: serviceTask
        id: calc
        attributes: { expression: "${amount * 2}", resultVariable: doubled }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: calc, targetRef: check } }
      - { kind: exclusiveGateway, id: check, attributes: { default: f4 } }
      - kind: sequenceFlow
        id: f3
        attributes: { sourceRef: check, targetRef: review, conditionExpression: "${doubled > 100}" }
      - { kind: sequenceFlow, id: f4, attributes: { sourceRef: check, targetRef: end } }
      - kind: userTask
        id: review
        name: Review
        attributes: { assignee: "${owner}", candidateGroups: "finance, ${team}" }
      - { kind: sequenceFlow, id: f5, attributes: { sourceRef: review, targetRef: end } }
      - { kind: endEvent, id: end }
"#;

    #[test]
    fn test_guard_routes_to_user_task() {
        let def = compile(APPROVAL);
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();

        let started = vm
            .start_instance(
                &mut ctx,
                "start",
                Some("BK".into()),
                vars(&[("amount", json!(80)), ("owner", json!("kermit")), ("team", json!("risk"))]),
            )
            .unwrap();

        let task = ctx.tasks.values().next().unwrap().clone();
        assert_eq!(task.assignee.as_deref(), Some("kermit"));
        assert_eq!(task.task_definition_key, "review");
        let groups: Vec<_> = task::links_of(&ctx, &task.id)
            .into_iter()
            .filter_map(|l| l.group_id)
            .collect();
        assert_eq!(groups.len(), 2);
        assert!(groups.contains(&"risk".to_string()));

        let token = ctx.tokens.get(&started.token_id).unwrap();
        assert_eq!(token.current_element_id, "review");
        assert_eq!(token.variables.get("doubled"), Some(&json!(160)));
        assert!(types(&ctx).contains(&EngineEventType::TaskCreated));
    }

    #[test]
    fn test_default_flow_and_completion() {
        let def = compile(APPROVAL);
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();

        let started = vm
            .start_instance(&mut ctx, "start", None, vars(&[("amount", json!(3))]))
            .unwrap();

        let instance = ctx.instances.get(&started.process_instance_id).unwrap();
        assert_eq!(instance.state, InstanceState::Completed);
        assert!(instance.ended.is_some());
        assert!(ctx.tokens.values().next().is_none());
        let seen = types(&ctx);
        assert_eq!(seen.first(), Some(&EngineEventType::EntityCreated));
        assert_eq!(seen.last(), Some(&EngineEventType::ProcessCompleted));
    }

    #[test]
    fn test_unresolved_guard_fails_command() {
        let def = compile(APPROVAL);
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();

        let err = vm
            .start_instance(&mut ctx, "start", None, VariableMap::new())
            .unwrap_err();
        assert_eq!(err.to_string(), "Cannot resolve identifier 'amount'");
    }

    #[test]
    fn test_complete_task_moves_token_to_end() {
        let def = compile(APPROVAL);
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();
        let started = vm
            .start_instance(
                &mut ctx,
                "start",
                None,
                vars(&[("amount", json!(500)), ("owner", json!("kermit")), ("team", json!("risk"))]),
            )
            .unwrap();
        let task_id = ctx.tasks.values().next().unwrap().id.clone();

        vm.complete_task(&mut ctx, &task_id, vars(&[("approved", json!(true))]))
            .unwrap();

        assert!(ctx.tasks.get(&task_id).is_none());
        assert!(task::links_of(&ctx, &task_id).is_empty());
        assert_eq!(
            ctx.instances.get(&started.process_instance_id).unwrap().state,
            InstanceState::Completed
        );
    }

    const PARALLEL: &str = r#"
processes:
  - id: parallel
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f0, attributes: { sourceRef: start, targetRef: fork } }
      - { kind: parallelGateway, id: fork }
      - { kind: sequenceFlow, id: fa, attributes: { sourceRef: fork, targetRef: a } }
      - { kind: sequenceFlow, id: fb, attributes: { sourceRef: fork, targetRef: b } }
      - { kind: userTask, id: a }
      - { kind: task, id: b }
      - { kind: sequenceFlow, id: fa2, attributes: { sourceRef: a, targetRef: join } }
      - { kind: sequenceFlow, id: fb2, attributes: { sourceRef: b, targetRef: join } }
      - { kind: parallelGateway, id: join }
      - { kind: sequenceFlow, id: f9, attributes: { sourceRef: join, targetRef: after } }
      - { kind: userTask, id: after }
"#;

    #[test]
    fn test_fork_and_join_resume_parent() {
        let def = compile(PARALLEL);
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();
        let started = vm
            .start_instance(&mut ctx, "start", None, VariableMap::new())
            .unwrap();

        // Branch b already reached the join; branch a waits in its task.
        let root = ctx.tokens.get(&started.token_id).unwrap();
        assert_eq!(root.wait, WaitState::Forked);
        let instance = ctx.instances.get(&started.process_instance_id).unwrap();
        assert_eq!(instance.join_arrivals.values().copied().collect::<Vec<_>>(), vec![1]);

        let task_id = ctx.tasks.values().next().unwrap().id.clone();
        vm.complete_task(&mut ctx, &task_id, vars(&[("x", json!(1))])).unwrap();

        let root = ctx.tokens.get(&started.token_id).unwrap();
        assert_eq!(root.current_element_id, "after");
        assert_eq!(root.variables.get("x"), Some(&json!(1)));
        assert_eq!(ctx.tokens.values().count(), 1);
        assert!(ctx
            .instances
            .get(&started.process_instance_id)
            .unwrap()
            .join_arrivals
            .is_empty());
    }

    #[test]
    fn test_terminate_end_removes_everything() {
        let def = compile(
            r#"
processes:
  - id: terminating
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f0, attributes: { sourceRef: start, targetRef: fork } }
      - { kind: parallelGateway, id: fork }
      - { kind: sequenceFlow, id: fa, attributes: { sourceRef: fork, targetRef: wait } }
      - { kind: sequenceFlow, id: fb, attributes: { sourceRef: fork, targetRef: kill } }
      - { kind: intermediateCatchEvent, id: wait, attributes: { signalRef: never } }
      - { kind: endEvent, id: kill, attributes: { terminate: "true" } }
"#,
        );
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();
        let started = vm
            .start_instance(&mut ctx, "start", None, VariableMap::new())
            .unwrap();

        assert_eq!(ctx.tokens.values().count(), 0);
        assert!(ctx.new_subscriptions().is_empty());
        assert_eq!(
            ctx.instances.get(&started.process_instance_id).unwrap().state,
            InstanceState::Completed
        );
    }

    #[test]
    fn test_message_catch_evaluates_key_once() {
        let def = compile(
            r#"
processes:
  - id: waiting
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f0, attributes: { sourceRef: start, targetRef: paid } }
      - kind: intermediateCatchEvent
        id: paid
        attributes: { messageRef: paymentReceived, correlationKey: "${orderId}" }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: paid, targetRef: end } }
      - { kind: endEvent, id: end }
"#,
        );
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();
        let started = vm
            .start_instance(&mut ctx, "start", Some("ORD-1".into()), vars(&[("orderId", json!("A-7"))]))
            .unwrap();

        let sub = ctx.new_subscriptions()[0].clone();
        assert_eq!(sub.correlation_key.as_deref(), Some("A-7"));
        assert_eq!(sub.activity_id, "paid");

        // A later change of the variable does not move the key.
        vm.set_variables(&mut ctx, &started.token_id, vars(&[("orderId", json!("B-9"))]))
            .unwrap();
        assert_eq!(ctx.new_subscriptions()[0].correlation_key.as_deref(), Some("A-7"));

        vm.resume_catch(&mut ctx, &sub, Some("ORD-1"), VariableMap::new())
            .unwrap();
        assert!(types(&ctx).contains(&EngineEventType::ActivityMessageReceived));
        assert_eq!(
            ctx.instances.get(&started.process_instance_id).unwrap().state,
            InstanceState::Completed
        );
    }

    #[test]
    fn test_cycle_hits_transition_limit() {
        let def = compile(
            r#"
processes:
  - id: spin
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f0, attributes: { sourceRef: start, targetRef: a } }
      - { kind: task, id: a }
      - { kind: sequenceFlow, id: f1, attributes: { sourceRef: a, targetRef: b } }
      - { kind: task, id: b }
      - { kind: sequenceFlow, id: f2, attributes: { sourceRef: b, targetRef: a } }
"#,
        );
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 25);
        let mut ctx = CommandContext::new();
        let err = vm
            .start_instance(&mut ctx, "start", None, VariableMap::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::TransitionLimit { limit: 25 }));
    }

    #[test]
    fn test_no_eligible_flow() {
        let def = compile(
            r#"
processes:
  - id: stuck
    executable: true
    elements:
      - { kind: startEvent, id: start }
      - { kind: sequenceFlow, id: f0, attributes: { sourceRef: start, targetRef: gw } }
      - { kind: exclusiveGateway, id: gw }
      - kind: sequenceFlow
        id: f1
        attributes: { sourceRef: gw, targetRef: end, conditionExpression: "${false}" }
      - { kind: endEvent, id: end }
"#,
        );
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();
        let err = vm
            .start_instance(&mut ctx, "start", None, VariableMap::new())
            .unwrap_err();
        assert!(matches!(err, EngineError::NoEligibleFlow { element_id } if element_id == "gw"));
    }

    #[test]
    fn test_suspended_instance_rejects_task_completion() {
        let def = compile(PARALLEL);
        let ids = SequentialIdGenerator::new("id");
        let vm = Vm::new(&def, &ElEvaluator, &ids, 100);
        let mut ctx = CommandContext::new();
        let started = vm
            .start_instance(&mut ctx, "start", None, VariableMap::new())
            .unwrap();
        vm.set_suspended(&mut ctx, &started.process_instance_id, true)
            .unwrap();

        let task_id = ctx.tasks.values().next().unwrap().id.clone();
        assert!(matches!(
            vm.complete_task(&mut ctx, &task_id, VariableMap::new()),
            Err(EngineError::IllegalState(_))
        ));
        assert!(vm
            .set_suspended(&mut ctx, &started.process_instance_id, true)
            .is_err());
    }
}
