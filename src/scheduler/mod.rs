//! Cooperative scheduler driven by explicit host ticks
//!
//! - `async_method`: composable step sequences ([`AsyncMethod`], [`AsyncFunction`])
//! - `method_queue`: per-context queue with blocking-category exclusion

pub mod async_method;
pub mod method_queue;

pub use async_method::{AsyncFunction, AsyncMethod, ReturnHandle, Step};
pub use method_queue::MethodQueue;
