//! Protocol-level routing between the wire and the host
//!
//! The transport thread never touches host state. It sends the precomputed
//! catalog when a peer connects, then forwards connection events and raw
//! message text through a channel. [`Dispatcher::update`] drains that channel
//! on the host's own tick, so every state mutation driven by the client
//! happens on the host thread.
//!
//! ```ignore
//! let mut dispatcher = Dispatcher::new(registry)?;
//! dispatcher.register(turtle.clone());
//! dispatcher.start(&BridgeConfig::new(), || info!("client ready"))?;
//! loop {
//!     dispatcher.update();
//!     turtle.tick();
//!     std::thread::sleep(tick);
//! }
//! ```

use crate::capability::{CapabilityRegistry, ResolveError};
use crate::config::BridgeConfig;
use crate::message::{
    BlockFinished, CallRequest, Envelope, SaveRequest, SetTarget, TriggerEvent, MSG_BLOCK_FINISHED, MSG_CALL,
    MSG_DEFINE_BLOCKS, MSG_SAVE, MSG_SET_TARGET, MSG_SYNC_CODE, MSG_TEST, MSG_TRIGGER_EVENT,
};
use crate::program::ProgramState;
use crate::target::{Programmable, TargetRegistry};
use crate::websocket::{ConnectionHandler, Outbox, TransportError, WebSocketServer, DISCONNECT_MESSAGE};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("could not serialize the block catalog: {0}")]
    Catalog(#[from] serde_json::Error),
}

type ConnectedCallback = Box<dyn FnMut() + Send>;
type SaveObserver = Box<dyn FnMut(&ProgramState) + Send>;

/// Transport events waiting for the host tick
#[derive(Debug)]
enum InboundEvent {
    Connected,
    Disconnected,
    Message(String),
}

/// Runs on the serve thread: sends the catalog and forwards everything else
struct BridgeHandler {
    catalog: String,
    outbox: Outbox,
    events: Sender<InboundEvent>,
}

impl BridgeHandler {
    fn forward(&self, event: InboundEvent) {
        if self.events.send(event).is_err() {
            debug!("dispatcher is gone; dropping transport event");
        }
    }
}

impl ConnectionHandler for BridgeHandler {
    fn on_connected(&self) {
        self.outbox.send(self.catalog.as_str(), false);
        self.forward(InboundEvent::Connected);
    }

    fn on_message(&self, text: String) {
        self.forward(InboundEvent::Message(text));
    }

    fn on_disconnected(&self) {
        self.forward(InboundEvent::Disconnected);
    }
}

fn send_payload<T: Serialize>(outbox: &Outbox, kind: &str, payload: &T) -> bool {
    let text = match Envelope::wrap(kind, payload).and_then(|env| env.to_json()) {
        Ok(text) => text,
        Err(e) => {
            warn!(kind, error = %e, "could not serialize outbound message");
            return false;
        }
    };
    trace!(message = %text, "queueing");
    outbox.send(text, false)
}

fn send_block_finished(outbox: &Outbox, target_id: String, thread_id: JsonValue, return_value: JsonValue) {
    let finished = BlockFinished {
        target_id,
        thread_id,
        return_value,
    };
    if !send_payload(outbox, MSG_BLOCK_FINISHED, &finished) {
        debug!(target_id = %finished.target_id, "no client connected; BlockFinished dropped");
    }
}

/// Routes client requests to targets and pushes host state to the client
pub struct Dispatcher {
    registry: CapabilityRegistry,
    catalog: String,
    targets: TargetRegistry,
    state: ProgramState,
    active_target: Option<Arc<dyn Programmable>>,
    outbox: Outbox,
    server: Option<WebSocketServer>,
    events_tx: Sender<InboundEvent>,
    events_rx: Receiver<InboundEvent>,
    on_connected: Option<ConnectedCallback>,
    save_observers: Vec<SaveObserver>,
}

impl Dispatcher {
    /// Build the dispatcher and render the catalog once
    pub fn new(registry: CapabilityRegistry) -> Result<Self, DispatchError> {
        let (outbox, _) = Outbox::channel();
        Self::with_outbox(registry, outbox)
    }

    fn with_outbox(registry: CapabilityRegistry, outbox: Outbox) -> Result<Self, DispatchError> {
        let catalog = Envelope::wrap(MSG_DEFINE_BLOCKS, &registry.define_blocks())?.to_json()?;
        let (events_tx, events_rx) = unbounded();
        Ok(Self {
            registry,
            catalog,
            targets: TargetRegistry::new(),
            state: ProgramState::new(),
            active_target: None,
            outbox,
            server: None,
            events_tx,
            events_rx,
            on_connected: None,
            save_observers: Vec::new(),
        })
    }

    /// Start the transport. `on_connected` runs from [`Dispatcher::update`]
    /// after the catalog and program sync have been sent to a new peer.
    pub fn start<F>(&mut self, config: &BridgeConfig, on_connected: F) -> Result<SocketAddr, DispatchError>
    where
        F: FnMut() + Send + 'static,
    {
        if self.server.is_some() {
            return Err(TransportError::AlreadyRunning.into());
        }

        let mut server = WebSocketServer::new(config.clone());
        let handler = Arc::new(BridgeHandler {
            catalog: self.catalog.clone(),
            outbox: server.outbox(),
            events: self.events_tx.clone(),
        });
        let addr = server.start(handler)?;

        self.outbox = server.outbox();
        self.on_connected = Some(Box::new(on_connected));
        self.server = Some(server);
        Ok(addr)
    }

    /// Stop the transport. Pending transport events are discarded.
    pub fn stop(&mut self) {
        if let Some(mut server) = self.server.take() {
            server.stop();
        }
        let discarded = self.events_rx.try_iter().count();
        if discarded > 0 {
            debug!(discarded, "discarded unprocessed transport events");
        }
    }

    pub fn is_running(&self) -> bool {
        self.server.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.outbox.is_connected()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().and_then(WebSocketServer::local_addr)
    }

    /// Process every transport event received since the last call.
    /// Call once per host tick. Returns the number of events handled.
    pub fn update(&mut self) -> usize {
        let events: Vec<InboundEvent> = self.events_rx.try_iter().collect();
        let count = events.len();
        for event in events {
            match event {
                InboundEvent::Connected => self.handle_connected(),
                InboundEvent::Disconnected => info!("client disconnected"),
                InboundEvent::Message(text) => self.handle_text(&text),
            }
        }
        count
    }

    fn handle_connected(&mut self) {
        info!("client connected; syncing programs");
        self.sync_code();
        if let Some(callback) = self.on_connected.as_mut() {
            callback();
        }
    }

    /// Handle one raw client message immediately on the calling thread
    pub fn handle_text(&mut self, text: &str) {
        if text == DISCONNECT_MESSAGE {
            debug!("client requested disconnect");
            return;
        }
        let envelope = match Envelope::parse(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, message = %text, "malformed message discarded");
                return;
            }
        };

        match envelope.kind.as_str() {
            MSG_CALL => match envelope.payload::<CallRequest>() {
                Ok(call) => self.handle_call(call),
                Err(e) => warn!(error = %e, "invalid call payload"),
            },
            MSG_SAVE => match envelope.payload::<SaveRequest>() {
                Ok(save) => self.handle_save(save),
                Err(e) => warn!(error = %e, "invalid save payload"),
            },
            MSG_TEST => self.handle_test(),
            other => warn!(kind = other, "unknown message type ignored"),
        }
    }

    fn handle_call(&mut self, call: CallRequest) {
        let Some(target) = self.targets.get(&call.target_id).cloned() else {
            warn!(target_id = %call.target_id, method = %call.method_name, "call for unknown target dropped");
            return;
        };

        let method = match self.registry.resolve(&call.method_name, &call.args) {
            Ok(resolved) => resolved.invoke(target.as_ref()),
            Err(ResolveError::EventNotCallable(name)) => {
                debug!(event = %name, "event called as a method; no-op");
                None
            }
            Err(e) => {
                warn!(target_id = %call.target_id, error = %e, "call could not be resolved; no-op");
                None
            }
        };

        match method {
            Some(method) => {
                let returns = method.return_handle();
                let outbox = self.outbox.clone();
                let (target_id, thread_id) = (call.target_id, call.thread_id);
                target.enqueue_method(method.then(move || {
                    send_block_finished(&outbox, target_id, thread_id, returns.get());
                }));
            }
            None => send_block_finished(&self.outbox, call.target_id, call.thread_id, JsonValue::Null),
        }
    }

    fn handle_save(&mut self, save: SaveRequest) {
        let program = self.state.get_program(&save.target_id);
        program.code = save.code;
        program.var_map = save.var_map;
        debug!(target_id = %save.target_id, "program saved");
        for observer in self.save_observers.iter_mut() {
            observer(&self.state);
        }
    }

    fn handle_test(&self) {
        match &self.active_target {
            Some(target) => target.run_test(),
            None => debug!("test requested with no active target"),
        }
    }

    /// Add a target. A duplicate guid replaces the earlier one.
    pub fn register(&mut self, target: Arc<dyn Programmable>) {
        self.targets.register(target);
    }

    pub fn unregister(&mut self, guid: &str) -> Option<Arc<dyn Programmable>> {
        if self.active_target.as_ref().is_some_and(|t| t.guid() == guid) {
            self.active_target = None;
        }
        self.targets.unregister(guid)
    }

    pub fn targets(&self) -> &TargetRegistry {
        &self.targets
    }

    /// Show `target` and its program in the client and make it the target of `test`
    pub fn set_target(&mut self, target: Arc<dyn Programmable>) {
        let program = self.state.get_program(target.guid());
        let message = SetTarget {
            target_id: target.guid().to_string(),
            target_name: target.name().to_string(),
            code: program.code.clone(),
            var_map: program.var_map.clone(),
        };
        send_payload(&self.outbox, MSG_SET_TARGET, &message);
        self.active_target = Some(target);
    }

    pub fn active_target(&self) -> Option<&Arc<dyn Programmable>> {
        self.active_target.as_ref()
    }

    /// Raise a registered event on `target`. Returns whether it was queued.
    pub fn send_event(&self, target: &dyn Programmable, event_name: &str) -> bool {
        if self.registry.event(event_name).is_none() {
            warn!(event = event_name, "unknown event not sent");
            return false;
        }
        send_payload(
            &self.outbox,
            MSG_TRIGGER_EVENT,
            &TriggerEvent {
                event_name: event_name.to_string(),
                target_id: target.guid().to_string(),
            },
        )
    }

    pub fn state(&self) -> &ProgramState {
        &self.state
    }

    /// Replace the whole program state and push it to the client
    pub fn set_state(&mut self, state: ProgramState) {
        self.state = state;
        if self.is_running() {
            self.sync_code();
        }
    }

    /// Register a callback that receives the program state after every save
    pub fn on_save<F>(&mut self, observer: F)
    where
        F: FnMut(&ProgramState) + Send + 'static,
    {
        self.save_observers.push(Box::new(observer));
    }

    pub fn registry(&self) -> &CapabilityRegistry {
        &self.registry
    }

    fn sync_code(&self) {
        send_payload(&self.outbox, MSG_SYNC_CODE, &self.state.programs());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}
