//! Programmable targets
//!
//! A target is a host object the client can address by guid. The host decides
//! how invoked capabilities are scheduled for it (usually a [`MethodQueue`]
//! per target, ticked from the host's update loop).
//!
//! [`MethodQueue`]: crate::scheduler::MethodQueue

use crate::scheduler::AsyncMethod;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// A host object exposed to the client
pub trait Programmable: Send + Sync {
    /// Unique identifier, stable for the target's lifetime
    fn guid(&self) -> &str;

    /// Display name shown by the client
    fn name(&self) -> &str;

    /// Hand a method to this target's execution context
    fn enqueue_method(&self, method: AsyncMethod);

    /// Run the target's self-test capability. Result handling is up to the host.
    fn run_test(&self) {
        debug!(guid = self.guid(), "target has no self-test");
    }

    /// Access to the concrete type, for capability invokers
    fn as_any(&self) -> &dyn Any;
}

/// Generate a fresh random guid for a new target
pub fn new_guid() -> String {
    Uuid::new_v4().to_string()
}

/// Map of guid to registered target
#[derive(Default)]
pub struct TargetRegistry {
    targets: HashMap<String, Arc<dyn Programmable>>,
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a target under its guid.
    ///
    /// A duplicate guid replaces the earlier registration (with a warning);
    /// the replaced target is returned.
    pub fn register(&mut self, target: Arc<dyn Programmable>) -> Option<Arc<dyn Programmable>> {
        let guid = target.guid().to_string();
        let replaced = self.targets.insert(guid.clone(), target);
        if let Some(old) = &replaced {
            warn!(guid = %guid, old_name = old.name(), "target already registered; replacing it");
        }
        replaced
    }

    pub fn unregister(&mut self, guid: &str) -> Option<Arc<dyn Programmable>> {
        self.targets.remove(guid)
    }

    pub fn get(&self, guid: &str) -> Option<&Arc<dyn Programmable>> {
        self.targets.get(guid)
    }

    pub fn contains(&self, guid: &str) -> bool {
        self.targets.contains_key(guid)
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn guids(&self) -> Vec<String> {
        self.targets.keys().cloned().collect()
    }
}
