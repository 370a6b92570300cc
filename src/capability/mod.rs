//! Host capabilities: typed parameter kinds, argument coercion and the
//! registry the dispatcher resolves calls against.

pub mod registry;
pub mod types;

pub use registry::{
    CapabilityRegistry, CapabilityRegistryBuilder, CategoryDef, EventDef, Invoker, MethodDef, ParamDef,
    RegistryError, ResolveError, ResolvedCall,
};
pub use types::{coerce, ArgValue, CoercionError, ParamKind, TypeDescriptor};
