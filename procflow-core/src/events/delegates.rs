//! Runtime side of listeners declared in process documents.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::anyhow;

use super::dispatcher::EngineEventListener;
use super::types::EngineEvent;
use crate::agenda::{Agenda, AgendaAction};

/// Named listener implementations that `class` and `delegateExpression` declarations
/// resolve against.
#[derive(Default)]
pub struct DelegateRegistry {
    delegates: RwLock<HashMap<String, Arc<dyn EngineEventListener>>>,
}

impl DelegateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, delegate: Arc<dyn EngineEventListener>) {
        self.delegates
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), delegate);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn EngineEventListener>> {
        self.delegates
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

/// `class="..."`: resolved by name on every invocation.
pub struct ClassDelegateListener {
    class_name: String,
    registry: Arc<DelegateRegistry>,
}

impl ClassDelegateListener {
    pub fn new(class_name: impl Into<String>, registry: Arc<DelegateRegistry>) -> Self {
        Self {
            class_name: class_name.into(),
            registry,
        }
    }
}

impl EngineEventListener for ClassDelegateListener {
    fn on_event(&self, event: &EngineEvent, agenda: &mut Agenda) -> anyhow::Result<()> {
        let delegate = self
            .registry
            .get(&self.class_name)
            .ok_or_else(|| anyhow!("listener class '{}' is not registered", self.class_name))?;
        delegate.on_event(event, agenda)
    }

    fn is_fail_on_exception(&self) -> bool {
        self.registry
            .get(&self.class_name)
            .is_some_and(|d| d.is_fail_on_exception())
    }

    fn describe(&self) -> String {
        format!("class:{}", self.class_name)
    }
}

/// `delegateExpression="${beanName}"`: the expression names a registered delegate.
pub struct DelegateExpressionListener {
    expression: String,
    registry: Arc<DelegateRegistry>,
}

impl DelegateExpressionListener {
    pub fn new(expression: impl Into<String>, registry: Arc<DelegateRegistry>) -> Self {
        Self {
            expression: expression.into(),
            registry,
        }
    }

    fn bean_name(&self) -> Option<&str> {
        let name = self
            .expression
            .trim()
            .strip_prefix("${")
            .and_then(|rest| rest.strip_suffix('}'))
            .map(str::trim)?;
        let valid = !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_');
        valid.then_some(name)
    }

    fn resolve(&self) -> anyhow::Result<Arc<dyn EngineEventListener>> {
        let name = self
            .bean_name()
            .ok_or_else(|| anyhow!("delegate expression '{}' is not a bean reference", self.expression))?;
        self.registry
            .get(name)
            .ok_or_else(|| anyhow!("Cannot resolve identifier '{name}'"))
    }
}

impl EngineEventListener for DelegateExpressionListener {
    fn on_event(&self, event: &EngineEvent, agenda: &mut Agenda) -> anyhow::Result<()> {
        self.resolve()?.on_event(event, agenda)
    }

    fn is_fail_on_exception(&self) -> bool {
        self.resolve().is_ok_and(|d| d.is_fail_on_exception())
    }

    fn describe(&self) -> String {
        format!("delegateExpression:{}", self.expression)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThrowKind {
    /// Signal scoped to the triggering instance.
    Signal,
    GlobalSignal,
    Message,
    Error,
}

/// Throws a signal, message or error when triggered.
pub struct EventThrowingListener {
    kind: ThrowKind,
    name: String,
}

impl EventThrowingListener {
    pub fn new(kind: ThrowKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
        }
    }
}

impl EngineEventListener for EventThrowingListener {
    fn on_event(&self, event: &EngineEvent, agenda: &mut Agenda) -> anyhow::Result<()> {
        match self.kind {
            ThrowKind::Signal => {
                let process_instance_id = event.process_instance_id.clone().ok_or_else(|| {
                    anyhow!("signal '{}' thrown outside a process instance", self.name)
                })?;
                agenda.push(AgendaAction::ThrowSignal {
                    name: self.name.clone(),
                    process_instance_id: Some(process_instance_id),
                });
            }
            ThrowKind::GlobalSignal => agenda.push(AgendaAction::ThrowSignal {
                name: self.name.clone(),
                process_instance_id: None,
            }),
            ThrowKind::Message => agenda.push(AgendaAction::ThrowMessage {
                name: self.name.clone(),
                process_instance_id: event.process_instance_id.clone(),
            }),
            ThrowKind::Error => {
                return Err(anyhow!(
                    "error event '{}' thrown on {}",
                    self.name,
                    event.event_type
                ))
            }
        }
        Ok(())
    }

    fn is_fail_on_exception(&self) -> bool {
        self.kind == ThrowKind::Error
    }

    fn describe(&self) -> String {
        format!("throw:{:?}:{}", self.kind, self.name)
    }
}

/// Restricts a listener declared on a flow element to events of that element.
pub struct ElementScopedListener {
    activity_id: String,
    inner: Arc<dyn EngineEventListener>,
}

impl ElementScopedListener {
    pub fn new(activity_id: impl Into<String>, inner: Arc<dyn EngineEventListener>) -> Self {
        Self {
            activity_id: activity_id.into(),
            inner,
        }
    }
}

impl EngineEventListener for ElementScopedListener {
    fn on_event(&self, event: &EngineEvent, agenda: &mut Agenda) -> anyhow::Result<()> {
        if event.activity_id.as_deref() != Some(self.activity_id.as_str()) {
            return Ok(());
        }
        self.inner.on_event(event, agenda)
    }

    fn is_fail_on_exception(&self) -> bool {
        self.inner.is_fail_on_exception()
    }

    fn describe(&self) -> String {
        format!("{}@{}", self.inner.describe(), self.activity_id)
    }
}
