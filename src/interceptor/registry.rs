//! Process-wide table from interceptor ids to interceptor instances.
//!
//! Generated code reaches it through the `findInterceptor` native, so a
//! lookup must be cheap and must not block registration on other threads.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

use dashmap::DashMap;

use super::{InterceptorDescriptor, InterceptorId, InterceptorInstance, InterceptorManifest};
use crate::error::InstrumentError;

static GLOBAL: OnceLock<Arc<InterceptorRegistry>> = OnceLock::new();

#[derive(Debug)]
pub struct InterceptorRegistry {
    next_id: AtomicU32,
    entries: DashMap<InterceptorId, Arc<InterceptorDescriptor>>,
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self { next_id: AtomicU32::new(1), entries: DashMap::new() }
    }
}

impl InterceptorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry bound to the `InterceptorRegistry.findInterceptor` native.
    pub fn global() -> Arc<InterceptorRegistry> {
        GLOBAL.get_or_init(|| Arc::new(InterceptorRegistry::new())).clone()
    }

    pub fn register(
        &self,
        manifest: &InterceptorManifest,
        instance: InterceptorInstance,
    ) -> Result<InterceptorId, InstrumentError> {
        let raw = self.next_id.fetch_add(1, Ordering::Relaxed);
        // Ids are pushed as Java ints.
        let id = InterceptorId::new(raw)
            .filter(|id| id.get() <= i32::MAX as u32)
            .ok_or_else(|| InstrumentError::Unsupported("interceptor id space exhausted".to_string()))?;
        let descriptor = InterceptorDescriptor {
            id,
            type_name: manifest.type_name().to_string(),
            category: manifest.category(),
            instance,
        };
        self.entries.insert(id, Arc::new(descriptor));
        log::trace!("registered interceptor {} as {}", manifest.type_name(), id);
        Ok(id)
    }

    pub fn find(&self, id: InterceptorId) -> Result<Arc<InterceptorDescriptor>, InstrumentError> {
        self.entries
            .get(&id)
            .map(|e| e.value().clone())
            .ok_or(InstrumentError::InterceptorNotFound(id))
    }

    /// Lookup by the raw `int` generated code passes.
    pub fn find_raw(&self, raw: i32) -> Option<Arc<InterceptorDescriptor>> {
        InterceptorId::from_java(raw).and_then(|id| self.find(id).ok())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops every registration and restarts numbering at 1.
    pub fn reset(&self) {
        self.entries.clear();
        self.next_id.store(1, Ordering::Relaxed);
    }
}
