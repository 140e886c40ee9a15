//! Event subsystem: internal engine events, typed dispatch with failure isolation,
//! conversion to public runtime events, and declared-listener implementations.

pub mod converter;
pub mod delegates;
pub mod dispatcher;
pub mod runtime;
pub mod types;

pub use converter::{ConverterRegistry, ConvertingListener, EventConverter};
pub use delegates::DelegateRegistry;
pub use dispatcher::{DispatchSummary, EngineEventListener, EventDispatcher};
pub use runtime::{RuntimeEvent, RuntimeEventListener, StartMessageSubscription};
pub use types::{EngineEvent, EngineEventType, EventEntity};
