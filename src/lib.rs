//! Blockly Bridge - expose typed host capabilities to a visual-programming client
//!
//! The host registers targets and a capability table; a remote client connects
//! over a minimal WebSocket transport, receives the block catalog and saved
//! programs, and invokes capabilities. Invocations run as cooperative
//! [`AsyncMethod`]s advanced by the host's own tick, and their results flow
//! back to the client as `BlockFinished` messages.
//!
//! - [`websocket`]: RFC 6455 subset over raw TCP, one peer at a time
//! - [`dispatcher`]: envelope routing, targets, program state
//! - [`scheduler`]: composable multi-tick methods and the per-target queue
//! - [`capability`]: parameter kinds, coercion and the capability table

pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod message;
pub mod program;
pub mod scheduler;
pub mod target;
pub mod websocket;

pub use capability::{
    coerce, ArgValue, CapabilityRegistry, CoercionError, EventDef, MethodDef, ParamKind, RegistryError,
    ResolveError, TypeDescriptor,
};
pub use config::BridgeConfig;
pub use dispatcher::{DispatchError, Dispatcher};
pub use message::Envelope;
pub use program::{Program, ProgramState, ProgramStateError};
pub use scheduler::{AsyncFunction, AsyncMethod, MethodQueue, ReturnHandle};
pub use target::{new_guid, Programmable, TargetRegistry};
pub use websocket::{TransportError, WebSocketServer};

#[cfg(test)]
mod test_support;

#[cfg(test)]
mod integration_tests;
