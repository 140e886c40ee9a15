//! Declared listener parsing and instantiation.

use std::sync::Arc;

use tracing::warn;

use crate::document::dto::EventListenerNode;
use crate::error::ParseError;
use crate::events::delegates::{
    ClassDelegateListener, DelegateExpressionListener, DelegateRegistry, ElementScopedListener,
    EventThrowingListener, ThrowKind,
};
use crate::events::{EngineEventListener, EngineEventType};
use crate::types::{EventListenerDecl, ImplementationKind};

/// Parses listener nodes declared on `owner_id` (a process or element id).
///
/// An unknown event type name is a parse error. An unknown implementation kind is
/// logged and that one listener is skipped.
pub fn parse_listener_decls(
    owner_id: &str,
    nodes: &[EventListenerNode],
) -> Result<Vec<EventListenerDecl>, ParseError> {
    let mut decls = Vec::with_capacity(nodes.len());
    for node in nodes {
        let events = EngineEventType::parse_list(node.events.as_deref().unwrap_or_default())
            .map_err(|unknown| {
                ParseError::new(owner_id, format!("unknown event type '{unknown}' in listener"))
            })?;
        let Ok(implementation_kind) = node.implementation_type.parse::<ImplementationKind>() else {
            warn!(
                owner = owner_id,
                implementation_type = %node.implementation_type,
                "Unsupported implementation type for EventListener: {}",
                node.implementation_type
            );
            continue;
        };
        if node.implementation.trim().is_empty() {
            return Err(ParseError::new(
                owner_id,
                format!("{implementation_kind} listener without implementation"),
            ));
        }
        decls.push(EventListenerDecl {
            events,
            implementation_kind,
            implementation: node.implementation.clone(),
        });
    }
    Ok(decls)
}

/// Runtime listener for a declaration. `scope` restricts element-level listeners to
/// events of that element.
pub fn instantiate_listener(
    decl: &EventListenerDecl,
    delegates: &Arc<DelegateRegistry>,
    scope: Option<&str>,
) -> Arc<dyn EngineEventListener> {
    let name = decl.implementation.clone();
    let listener: Arc<dyn EngineEventListener> = match decl.implementation_kind {
        ImplementationKind::Class => Arc::new(ClassDelegateListener::new(name, delegates.clone())),
        ImplementationKind::DelegateExpression => {
            Arc::new(DelegateExpressionListener::new(name, delegates.clone()))
        }
        ImplementationKind::ThrowSignalEvent => Arc::new(EventThrowingListener::new(ThrowKind::Signal, name)),
        ImplementationKind::ThrowGlobalSignalEvent => {
            Arc::new(EventThrowingListener::new(ThrowKind::GlobalSignal, name))
        }
        ImplementationKind::ThrowMessageEvent => {
            Arc::new(EventThrowingListener::new(ThrowKind::Message, name))
        }
        ImplementationKind::ThrowErrorEvent => Arc::new(EventThrowingListener::new(ThrowKind::Error, name)),
    };
    match scope {
        Some(activity_id) => Arc::new(ElementScopedListener::new(activity_id, listener)),
        None => listener,
    }
}
