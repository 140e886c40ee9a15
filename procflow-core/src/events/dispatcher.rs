use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};

use tracing::{debug, warn};

use super::types::{EngineEvent, EngineEventType};
use crate::agenda::Agenda;
use crate::error::{EngineError, EngineResult};

/// Receives internal engine events inside the dispatching command.
pub trait EngineEventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent, agenda: &mut Agenda) -> anyhow::Result<()>;

    /// `true`: a failure aborts the dispatching command. `false`: it is logged and skipped.
    fn is_fail_on_exception(&self) -> bool {
        false
    }

    /// Used in log lines.
    fn describe(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}

struct ListenerEntry {
    listener: Arc<dyn EngineEventListener>,
    /// Empty = every type.
    types: BTreeSet<EngineEventType>,
}

impl ListenerEntry {
    fn accepts(&self, event_type: EngineEventType) -> bool {
        self.types.is_empty() || self.types.contains(&event_type)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchSummary {
    pub delivered: usize,
    pub isolated_failures: usize,
}

/// Typed event fan-out. Listeners run in registration order.
pub struct EventDispatcher {
    enabled: bool,
    entries: RwLock<Vec<ListenerEntry>>,
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(true)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("enabled", &self.enabled)
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventDispatcher {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add_event_listener(
        &self,
        listener: Arc<dyn EngineEventListener>,
        types: impl IntoIterator<Item = EngineEventType>,
    ) {
        let entry = ListenerEntry {
            listener,
            types: types.into_iter().collect(),
        };
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Removes every registration of `listener`.
    pub fn remove_event_listener(&self, listener: &Arc<dyn EngineEventListener>) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|entry| !Arc::ptr_eq(&entry.listener, listener));
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delivers `event` to every matching listener.
    ///
    /// Failures of listeners that are not fail-on-exception are logged and counted; the
    /// first fail-on-exception failure stops delivery and is returned.
    pub fn dispatch(&self, event: &EngineEvent, agenda: &mut Agenda) -> EngineResult<DispatchSummary> {
        let mut summary = DispatchSummary::default();
        if !self.enabled {
            return Ok(summary);
        }

        // Snapshot so listeners may register further listeners without deadlocking.
        let targets: Vec<Arc<dyn EngineEventListener>> = {
            let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
            entries
                .iter()
                .filter(|entry| entry.accepts(event.event_type))
                .map(|entry| Arc::clone(&entry.listener))
                .collect()
        };

        for listener in targets {
            match listener.on_event(event, agenda) {
                Ok(()) => summary.delivered += 1,
                Err(e) if listener.is_fail_on_exception() => {
                    return Err(EngineError::ListenerInvocation {
                        event_type: event.event_type.to_string(),
                        message: format!("{}: {e:#}", listener.describe()),
                    });
                }
                Err(e) => {
                    warn!(
                        listener = %listener.describe(),
                        event_type = %event.event_type,
                        error = %e,
                        "Exception while executing event-listener, which was ignored"
                    );
                    summary.isolated_failures += 1;
                }
            }
        }

        debug!(
            event_type = %event.event_type,
            delivered = summary.delivered,
            failed = summary.isolated_failures,
            "event dispatched"
        );
        Ok(summary)
    }
}
