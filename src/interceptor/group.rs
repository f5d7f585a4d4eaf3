//! Named tokens that let cooperating interceptors detect nested calls.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::error::IllegalStateError;

static NEXT_GROUP_KEY: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static DEPTHS: RefCell<HashMap<u64, usize>> = RefCell::new(HashMap::new());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionPolicy {
    /// Always run, counting the nesting level.
    Always,
    /// Run only for the outermost call of the group on this thread.
    Boundary,
    /// Run only inside an already active group invocation.
    Internal,
}

#[derive(Debug)]
pub struct InterceptorGroup {
    name: String,
    key: u64,
}

impl InterceptorGroup {
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), key: NEXT_GROUP_KEY.fetch_add(1, Ordering::Relaxed) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Nesting level on the current thread.
    pub fn depth(&self) -> usize {
        DEPTHS.with(|d| d.borrow().get(&self.key).copied().unwrap_or(0))
    }

    pub fn is_active(&self) -> bool {
        self.depth() > 0
    }

    /// Enters the group if `policy` allows it. Only a successful enter may be
    /// paired with [`leave`](Self::leave), using the same policy.
    pub fn try_enter(&self, policy: ExecutionPolicy) -> bool {
        let depth = self.depth();
        let allowed = match policy {
            ExecutionPolicy::Always => true,
            ExecutionPolicy::Boundary => depth == 0,
            ExecutionPolicy::Internal => depth > 0,
        };
        if allowed {
            DEPTHS.with(|d| *d.borrow_mut().entry(self.key).or_insert(0) += 1);
        }
        allowed
    }

    /// Leaves a level entered with `policy`. A `Boundary` leave must close
    /// the outermost level and an `Internal` one a nested level; a mismatch
    /// is an error and leaves the depth unchanged.
    pub fn leave(&self, policy: ExecutionPolicy) -> Result<(), IllegalStateError> {
        DEPTHS.with(|d| {
            let mut depths = d.borrow_mut();
            let depth = depths.get(&self.key).copied().unwrap_or(0);
            let allowed = match policy {
                ExecutionPolicy::Always => depth > 0,
                ExecutionPolicy::Boundary => depth == 1,
                ExecutionPolicy::Internal => depth > 1,
            };
            if !allowed {
                return Err(IllegalStateError::new(format!(
                    "group {} cannot leave with {policy:?} at depth {depth}",
                    self.name
                )));
            }
            if depth == 1 {
                depths.remove(&self.key);
            } else {
                depths.insert(self.key, depth - 1);
            }
            Ok(())
        })
    }
}

/// Lazily populated name to group table.
#[derive(Debug, Default)]
pub struct InterceptorGroups {
    groups: DashMap<String, Arc<InterceptorGroup>>,
}

impl InterceptorGroups {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&self, name: &str) -> Arc<InterceptorGroup> {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(InterceptorGroup::new(name)))
            .value()
            .clone()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
