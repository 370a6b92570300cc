//! Capability registry
//!
//! An immutable table of the methods, events and categories the host exposes,
//! built once at startup. The dispatcher only uses its lookup interface:
//! [`CapabilityRegistry::resolve`] to turn a client call into a ready-to-run
//! invocation, and [`CapabilityRegistry::define_blocks`] for the catalog.

use super::types::{coerce, ArgValue, CoercionError, ParamKind};
use crate::message::{BlockCategory, BlockEvent, BlockMethod, BlockParameter, DefineBlocks};
use crate::scheduler::AsyncMethod;
use crate::target::Programmable;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Color given to categories that methods reference without declaring
pub const DEFAULT_CATEGORY_COLOR: i32 = 0;

/// Runs a capability against a target with already-coerced arguments.
///
/// Returning `None` means the call did nothing schedulable; the client still
/// receives a null-valued completion.
pub type Invoker = Arc<dyn Fn(&dyn Programmable, &[ArgValue]) -> Option<AsyncMethod> + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("method '{0}' is registered more than once")]
    DuplicateMethod(String),

    #[error("event '{0}' is registered more than once")]
    DuplicateEvent(String),

    #[error("method '{0}' has no invoker")]
    MissingInvoker(String),
}

/// Why a call could not be turned into an invocation
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    #[error("unknown method '{0}'")]
    UnknownMethod(String),

    #[error("'{0}' is an event and cannot be called")]
    EventNotCallable(String),

    #[error("method '{name}' expects {expected} arguments, got {got}")]
    ArityMismatch { name: String, expected: usize, got: usize },

    #[error("argument {index} of '{name}': {source}")]
    Argument {
        name: String,
        index: usize,
        #[source]
        source: CoercionError,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDef {
    pub name: String,
    pub kind: ParamKind,
}

/// A callable capability
#[derive(Clone)]
pub struct MethodDef {
    pub name: String,
    pub category: String,
    pub params: Vec<ParamDef>,
    /// None for methods without a result
    pub returns: Option<ParamKind>,
    invoker: Option<Invoker>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            params: Vec::new(),
            returns: None,
            invoker: None,
        }
    }

    pub fn param(mut self, name: impl Into<String>, kind: ParamKind) -> Self {
        self.params.push(ParamDef {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn returns(mut self, kind: ParamKind) -> Self {
        self.returns = Some(kind);
        self
    }

    pub fn invoke_with<F>(mut self, invoker: F) -> Self
    where
        F: Fn(&dyn Programmable, &[ArgValue]) -> Option<AsyncMethod> + Send + Sync + 'static,
    {
        self.invoker = Some(Arc::new(invoker));
        self
    }

    fn to_block(&self) -> BlockMethod {
        BlockMethod {
            name: self.name.clone(),
            category: self.category.clone(),
            return_type: self.returns.as_ref().map(ParamKind::descriptor),
            parameters: self
                .params
                .iter()
                .map(|p| BlockParameter {
                    name: p.name.clone(),
                    param_type: p.kind.descriptor(),
                })
                .collect(),
        }
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("name", &self.name)
            .field("category", &self.category)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("has_invoker", &self.invoker.is_some())
            .finish()
    }
}

/// An event the host can raise on a target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventDef {
    pub name: String,
    pub category: String,
    pub stackable: bool,
}

impl EventDef {
    pub fn new(name: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
            stackable: false,
        }
    }

    /// Whether the client may place other blocks below this event block
    pub fn stackable(mut self, stackable: bool) -> Self {
        self.stackable = stackable;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryDef {
    pub name: String,
    pub color: i32,
}

/// A call that passed lookup, arity and coercion checks
pub struct ResolvedCall {
    method: MethodDef,
    args: Vec<ArgValue>,
}

impl ResolvedCall {
    pub fn method(&self) -> &MethodDef {
        &self.method
    }

    pub fn args(&self) -> &[ArgValue] {
        &self.args
    }

    /// Run the invoker. Build guarantees every method has one.
    pub fn invoke(&self, target: &dyn Programmable) -> Option<AsyncMethod> {
        self.method
            .invoker
            .as_ref()
            .and_then(|invoke| invoke(target, &self.args))
    }
}

impl fmt::Debug for ResolvedCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCall")
            .field("method", &self.method.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Collects definitions before validation
#[derive(Default)]
pub struct CapabilityRegistryBuilder {
    methods: Vec<MethodDef>,
    events: Vec<EventDef>,
    categories: Vec<CategoryDef>,
}

impl CapabilityRegistryBuilder {
    /// Declare a category. Redeclaring a name updates its color.
    pub fn category(mut self, name: impl Into<String>, color: i32) -> Self {
        let name = name.into();
        match self.categories.iter_mut().find(|c| c.name == name) {
            Some(existing) => existing.color = color,
            None => self.categories.push(CategoryDef { name, color }),
        }
        self
    }

    pub fn method(mut self, method: MethodDef) -> Self {
        self.methods.push(method);
        self
    }

    pub fn event(mut self, event: EventDef) -> Self {
        self.events.push(event);
        self
    }

    pub fn build(self) -> Result<CapabilityRegistry, RegistryError> {
        let mut method_index = HashMap::new();
        for (i, method) in self.methods.iter().enumerate() {
            if method.invoker.is_none() {
                return Err(RegistryError::MissingInvoker(method.name.clone()));
            }
            if method_index.insert(method.name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateMethod(method.name.clone()));
            }
            warn_unsupported(method);
        }

        let mut event_index = HashMap::new();
        for (i, event) in self.events.iter().enumerate() {
            if event_index.insert(event.name.clone(), i).is_some() {
                return Err(RegistryError::DuplicateEvent(event.name.clone()));
            }
        }

        let mut categories = self.categories;
        let referenced = self
            .methods
            .iter()
            .map(|m| &m.category)
            .chain(self.events.iter().map(|e| &e.category));
        for name in referenced {
            if !name.is_empty() && !categories.iter().any(|c| &c.name == name) {
                debug!(category = %name, "adding undeclared category");
                categories.push(CategoryDef {
                    name: name.clone(),
                    color: DEFAULT_CATEGORY_COLOR,
                });
            }
        }

        Ok(CapabilityRegistry {
            methods: self.methods,
            method_index,
            events: self.events,
            event_index,
            categories,
        })
    }
}

fn warn_unsupported(method: &MethodDef) {
    for param in &method.params {
        if !param.kind.is_supported() {
            warn!(
                method = %method.name,
                parameter = %param.name,
                host_type = param.kind.display_name(),
                "parameter type cannot be represented on the client"
            );
        }
    }
    if let Some(kind) = method.returns.as_ref().filter(|k| !k.is_supported()) {
        warn!(
            method = %method.name,
            host_type = kind.display_name(),
            "return type cannot be represented on the client"
        );
    }
}

/// Immutable capability table
pub struct CapabilityRegistry {
    methods: Vec<MethodDef>,
    method_index: HashMap<String, usize>,
    events: Vec<EventDef>,
    event_index: HashMap<String, usize>,
    categories: Vec<CategoryDef>,
}

impl CapabilityRegistry {
    pub fn builder() -> CapabilityRegistryBuilder {
        CapabilityRegistryBuilder::default()
    }

    pub fn method(&self, name: &str) -> Option<&MethodDef> {
        self.method_index.get(name).map(|&i| &self.methods[i])
    }

    pub fn event(&self, name: &str) -> Option<&EventDef> {
        self.event_index.get(name).map(|&i| &self.events[i])
    }

    pub fn methods(&self) -> &[MethodDef] {
        &self.methods
    }

    pub fn events(&self) -> &[EventDef] {
        &self.events
    }

    pub fn categories(&self) -> &[CategoryDef] {
        &self.categories
    }

    /// The catalog in declaration order
    pub fn define_blocks(&self) -> DefineBlocks {
        DefineBlocks {
            methods: self.methods.iter().map(MethodDef::to_block).collect(),
            events: self
                .events
                .iter()
                .map(|e| BlockEvent {
                    name: e.name.clone(),
                    category: e.category.clone(),
                    is_stackable: e.stackable,
                })
                .collect(),
            categories: self
                .categories
                .iter()
                .map(|c| BlockCategory {
                    name: c.name.clone(),
                    color: c.color,
                })
                .collect(),
        }
    }

    /// Look up `name` and coerce `args` to its declared parameter kinds
    pub fn resolve(&self, name: &str, args: &[JsonValue]) -> Result<ResolvedCall, ResolveError> {
        let method = match self.method(name) {
            Some(method) => method,
            None if self.event_index.contains_key(name) => {
                return Err(ResolveError::EventNotCallable(name.to_string()))
            }
            None => return Err(ResolveError::UnknownMethod(name.to_string())),
        };

        if args.len() != method.params.len() {
            return Err(ResolveError::ArityMismatch {
                name: name.to_string(),
                expected: method.params.len(),
                got: args.len(),
            });
        }

        let args = method
            .params
            .iter()
            .zip(args)
            .enumerate()
            .map(|(index, (param, value))| {
                coerce(&param.kind, value).map_err(|source| ResolveError::Argument {
                    name: name.to_string(),
                    index,
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResolvedCall {
            method: method.clone(),
            args,
        })
    }
}

impl fmt::Debug for CapabilityRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityRegistry")
            .field("methods", &self.methods)
            .field("events", &self.events)
            .field("categories", &self.categories)
            .finish()
    }
}
