//! Follow-up work queued by listeners while a command runs.
//!
//! Actions only run if the command that queued them commits. Each action then runs
//! as its own command.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AgendaAction {
    /// `process_instance_id: None` broadcasts to every signal subscription.
    ThrowSignal {
        name: String,
        process_instance_id: Option<String>,
    },
    /// Delivered to the instance's catch subscription for `name`; with no instance
    /// (or no waiting catch) it is tried as a start message.
    ThrowMessage {
        name: String,
        process_instance_id: Option<String>,
    },
}

#[derive(Debug, Default)]
pub struct Agenda {
    actions: Vec<AgendaAction>,
}

impl Agenda {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: AgendaAction) {
        self.actions.push(action);
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn into_actions(self) -> Vec<AgendaAction> {
        self.actions
    }
}
