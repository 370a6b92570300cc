//! Composable multi-tick units of work
//!
//! An [`AsyncMethod`] is an ordered list of steps. Each step does some work and
//! reports whether it is complete. [`AsyncMethod::advance`] runs steps from the
//! front until one reports not-done (the suspension point) or none are left.
//!
//! ```ignore
//! let method = AsyncMethod::new()
//!     .blocking_category("movement")
//!     .then(|| start_walking())
//!     .wait(30)
//!     .update_until(|| arrived())
//!     .then(|| stop_walking());
//! ```

use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// A single step: performs work and returns whether it is complete
pub type Step = Box<dyn FnMut() -> bool + Send>;

type ReturnReader = Arc<dyn Fn() -> JsonValue + Send + Sync>;

/// Reads a method's result after (or before) it completes.
///
/// Yields `Null` for methods that produce no value, or before the value is set.
#[derive(Clone, Default)]
pub struct ReturnHandle {
    reader: Option<ReturnReader>,
}

impl ReturnHandle {
    pub fn get(&self) -> JsonValue {
        self.reader.as_ref().map(|read| read()).unwrap_or(JsonValue::Null)
    }
}

impl fmt::Debug for ReturnHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReturnHandle")
            .field("has_value_slot", &self.reader.is_some())
            .finish()
    }
}

/// A cooperative, composable unit of deferred work
#[derive(Default)]
pub struct AsyncMethod {
    steps: VecDeque<Step>,
    category: Option<String>,
    returns: ReturnHandle,
}

impl AsyncMethod {
    pub fn new() -> Self {
        Self::default()
    }

    /// A method with no steps; completes on its first advance
    pub fn noop() -> Self {
        Self::default()
    }

    /// Not done for the first `frames` advances, done thereafter
    pub fn wait(mut self, frames: u32) -> Self {
        let mut remaining = frames;
        self.steps.push_back(Box::new(move || {
            if remaining == 0 {
                true
            } else {
                remaining -= 1;
                false
            }
        }));
        self
    }

    /// Done exactly when `until` returns true
    pub fn update_until<F>(mut self, until: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.steps.push_back(Box::new(until));
        self
    }

    /// Run `action` once and complete immediately
    pub fn then<F>(mut self, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut action = Some(action);
        self.steps.push_back(Box::new(move || {
            if let Some(action) = action.take() {
                action();
            }
            true
        }));
        self
    }

    /// Inline all of `other`'s steps at this point
    pub fn then_method(mut self, other: AsyncMethod) -> Self {
        self.steps.extend(other.steps);
        self
    }

    /// Tag the whole method with a category for cross-method exclusion
    pub fn blocking_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    /// Whether the category is set and non-empty
    pub(crate) fn claims_category(&self) -> Option<&str> {
        self.category().filter(|c| !c.is_empty())
    }

    pub fn is_complete(&self) -> bool {
        self.steps.is_empty()
    }

    /// Number of steps left to run
    pub fn remaining_steps(&self) -> usize {
        self.steps.len()
    }

    /// Handle to this method's result value
    pub fn return_handle(&self) -> ReturnHandle {
        self.returns.clone()
    }

    pub fn return_value(&self) -> JsonValue {
        self.returns.get()
    }

    /// Run steps until one suspends or none are left. Returns whether the
    /// method is complete.
    pub fn advance(&mut self) -> bool {
        while let Some(step) = self.steps.front_mut() {
            if step() {
                self.steps.pop_front();
            } else {
                return false;
            }
        }
        true
    }
}

impl fmt::Debug for AsyncMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncMethod")
            .field("remaining_steps", &self.steps.len())
            .field("category", &self.category)
            .field("returns", &self.returns)
            .finish()
    }
}

/// An [`AsyncMethod`] that produces a typed value.
///
/// Exactly one `returns` step should write the value. Convert into an
/// `AsyncMethod` to schedule it; the returned method's [`ReturnHandle`]
/// exposes the value as JSON.
pub struct AsyncFunction<T> {
    method: AsyncMethod,
    value: Arc<Mutex<Option<T>>>,
}

impl<T> AsyncFunction<T>
where
    T: Serialize + Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            method: AsyncMethod::new(),
            value: Arc::new(Mutex::new(None)),
        }
    }

    pub fn wait(mut self, frames: u32) -> Self {
        self.method = self.method.wait(frames);
        self
    }

    pub fn update_until<F>(mut self, until: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        self.method = self.method.update_until(until);
        self
    }

    pub fn then<F>(mut self, action: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        self.method = self.method.then(action);
        self
    }

    pub fn then_method(mut self, other: AsyncMethod) -> Self {
        self.method = self.method.then_method(other);
        self
    }

    pub fn blocking_category(mut self, category: impl Into<String>) -> Self {
        self.method = self.method.blocking_category(category);
        self
    }

    /// Compute and store the result, then complete immediately
    pub fn returns<F>(mut self, supplier: F) -> Self
    where
        F: FnOnce() -> T + Send + 'static,
    {
        let slot = Arc::clone(&self.value);
        let mut supplier = Some(supplier);
        self.method.steps.push_back(Box::new(move || {
            if let Some(supplier) = supplier.take() {
                let value = supplier();
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
            }
            true
        }));
        self
    }

    /// The stored result, if the `returns` step has run
    pub fn value(&self) -> Option<T> {
        self.value
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn advance(&mut self) -> bool {
        self.method.advance()
    }

    pub fn into_method(self) -> AsyncMethod {
        self.into()
    }
}

impl<T> Default for AsyncFunction<T>
where
    T: Serialize + Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> From<AsyncFunction<T>> for AsyncMethod
where
    T: Serialize + Clone + Send + 'static,
{
    fn from(function: AsyncFunction<T>) -> Self {
        let slot = function.value;
        let mut method = function.method;
        method.returns = ReturnHandle {
            reader: Some(Arc::new(move || {
                let value = slot.lock().unwrap_or_else(PoisonError::into_inner);
                match value.as_ref() {
                    Some(v) => serde_json::to_value(v).unwrap_or_else(|e| {
                        tracing::warn!(error = %e, "could not serialize method result");
                        JsonValue::Null
                    }),
                    None => JsonValue::Null,
                }
            })),
        };
        method
    }
}
