use super::async_method::AsyncMethod;
use std::collections::HashSet;

/// Advances active [`AsyncMethod`]s once per host tick.
///
/// Methods are kept in admission order. Within one tick, at most one method
/// per non-empty blocking category makes progress: the earliest admitted
/// incomplete one. Methods without a category advance every tick.
///
/// The queue spawns no threads and performs no I/O; the host calls
/// [`MethodQueue::tick`] from its own update loop. A step that never reports
/// done stalls its method, and every later method in the same category, forever.
#[derive(Debug, Default)]
pub struct MethodQueue {
    active: Vec<AsyncMethod>,
}

impl MethodQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a method; it first advances on the next tick
    pub fn enqueue(&mut self, method: AsyncMethod) {
        self.active.push(method);
    }

    /// Number of active methods carrying `category`
    pub fn count_category(&self, category: &str) -> usize {
        self.active
            .iter()
            .filter(|m| m.category() == Some(category))
            .count()
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }

    /// Advance every eligible method once, dropping the ones that complete
    pub fn tick(&mut self) {
        let mut claimed: HashSet<String> = HashSet::new();
        let mut i = 0;
        while i < self.active.len() {
            let method = &mut self.active[i];
            if let Some(category) = method.claims_category() {
                if claimed.contains(category) {
                    i += 1;
                    continue;
                }
            }

            if method.advance() {
                self.active.remove(i);
                continue;
            }

            if let Some(category) = method.claims_category() {
                claimed.insert(category.to_string());
            }
            i += 1;
        }
    }
}
