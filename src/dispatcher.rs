//! Routing of class-load events to transformers.
//!
//! Every class the JVM loads passes through [`TransformerDispatcher::on_class_file_load`].
//! A one-shot transformer registered for exactly that loader and class runs
//! first; otherwise the first static transformer whose matcher claims the
//! name runs. Whatever goes wrong inside a transformer ends here as a log
//! line, and the JVM gets the original bytes.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::descriptor::java_name_to_internal;
use crate::error::{display_chain, IllegalStateError, InstrumentError, TransformError};
use crate::host::{ClassLoaderRef, ClassRef, HostHandle, InstrumentHost, Retransformer};
use crate::injector::ClassInjector;
use crate::instrument::InstrumentClass;
use crate::plugin::{ClassFileTransformer, TransformerEntry};
use crate::runtime::is_runtime_class;

/// One `ClassFileLoadHook` invocation.
#[derive(Debug, Clone, Copy)]
pub struct ClassLoadEvent<'a> {
    pub loader: &'a ClassLoaderRef,
    /// Internal name.
    pub class_name: &'a str,
    /// Set when the class is being redefined or retransformed.
    pub class_being_redefined: Option<&'a ClassRef>,
    pub protection_domain: Option<&'a HostHandle>,
    pub bytes: &'a [u8],
}

impl<'a> ClassLoadEvent<'a> {
    pub fn new(loader: &'a ClassLoaderRef, class_name: &'a str, bytes: &'a [u8]) -> Self {
        Self { loader, class_name, class_being_redefined: None, protection_domain: None, bytes }
    }
}

/// One-shot transformers keyed by loader and internal class name.
#[derive(Default)]
pub struct DynamicTransformers {
    map: DashMap<(ClassLoaderRef, String), Arc<dyn ClassFileTransformer>>,
}

impl DynamicTransformers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        loader: &ClassLoaderRef,
        class_name: &str,
        transformer: Arc<dyn ClassFileTransformer>,
    ) -> Result<(), IllegalStateError> {
        let key = (loader.clone(), java_name_to_internal(class_name));
        match self.map.entry(key) {
            Entry::Occupied(e) => Err(IllegalStateError::new(format!(
                "transformer already registered for {} in {}",
                e.key().1,
                e.key().0
            ))),
            Entry::Vacant(e) => {
                e.insert(transformer);
                Ok(())
            }
        }
    }

    /// Removes and returns the transformer for this class.
    pub fn take(&self, loader: &ClassLoaderRef, class_name: &str) -> Option<Arc<dyn ClassFileTransformer>> {
        self.map.remove(&(loader.clone(), class_name.to_string())).map(|(_, t)| t)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}

/// Services available to a running transformer.
#[derive(Clone)]
pub struct InstrumentContext {
    host: InstrumentHost,
    dynamic: Arc<DynamicTransformers>,
    injector: Option<Arc<ClassInjector>>,
    retransformer: Option<Arc<dyn Retransformer>>,
}

impl InstrumentContext {
    pub fn new(host: InstrumentHost) -> Self {
        Self { host, dynamic: Arc::new(DynamicTransformers::new()), injector: None, retransformer: None }
    }

    pub fn with_injector(mut self, injector: Arc<ClassInjector>) -> Self {
        self.injector = Some(injector);
        self
    }

    pub fn with_retransformer(mut self, retransformer: Arc<dyn Retransformer>) -> Self {
        self.retransformer = Some(retransformer);
        self
    }

    pub fn host(&self) -> &InstrumentHost {
        &self.host
    }

    pub fn dynamic_transformers(&self) -> &DynamicTransformers {
        &self.dynamic
    }

    /// Parses `bytes`, or the class file the host locates when `bytes` is
    /// `None`. `Ok(None)` if there is nothing to parse.
    pub fn get_instrument_class(
        &self,
        loader: &ClassLoaderRef,
        class_name: &str,
        bytes: Option<&[u8]>,
    ) -> Result<Option<InstrumentClass>, InstrumentError> {
        let located;
        let bytes = match bytes {
            Some(bytes) => bytes,
            None => match self.host.locator().locate(loader, &java_name_to_internal(class_name))? {
                Some(found) => {
                    located = found;
                    &located
                }
                None => return Ok(None),
            },
        };
        InstrumentClass::parse(self.host.clone(), loader.clone(), bytes).map(Some)
    }

    /// Whether `loader` can see a class file for `class_name`.
    pub fn exist(&self, loader: &ClassLoaderRef, class_name: &str) -> bool {
        matches!(self.host.locator().locate(loader, &java_name_to_internal(class_name)), Ok(Some(_)))
    }

    /// Runs `transformer` the next time `class_name` is loaded by `loader`.
    pub fn add_class_file_transformer(
        &self,
        loader: &ClassLoaderRef,
        class_name: &str,
        transformer: Arc<dyn ClassFileTransformer>,
    ) -> Result<(), InstrumentError> {
        self.dynamic.add(loader, class_name, transformer)?;
        log::debug!("dynamic transformer registered for {class_name} in {loader}");
        Ok(())
    }

    /// Retransforms an already loaded class with `transformer`.
    pub fn retransform(&self, class: &ClassRef, transformer: Arc<dyn ClassFileTransformer>) -> Result<(), InstrumentError> {
        let Some(retransformer) = &self.retransformer else {
            return Err(InstrumentError::Unsupported("the host cannot retransform classes".to_string()));
        };
        self.dynamic.add(&class.loader, &class.name, transformer)?;
        if let Err(e) = retransformer.retransform(class) {
            self.dynamic.take(&class.loader, &class.name);
            return Err(e);
        }
        Ok(())
    }

    pub fn inject_class(&self, loader: &ClassLoaderRef, name: &str) -> Result<ClassRef, InstrumentError> {
        match &self.injector {
            Some(injector) => Ok(injector.inject(loader, name)?),
            None => Err(InstrumentError::Unsupported(format!("no class injector to inject {name}"))),
        }
    }
}

pub struct TransformerDispatcher {
    entries: Vec<TransformerEntry>,
    context: InstrumentContext,
}

impl TransformerDispatcher {
    pub fn new(entries: Vec<TransformerEntry>, context: InstrumentContext) -> Self {
        Self { entries, context }
    }

    pub fn context(&self) -> &InstrumentContext {
        &self.context
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn select(&self, loader: &ClassLoaderRef, class_name: &str) -> Option<Arc<dyn ClassFileTransformer>> {
        if let Some(dynamic) = self.context.dynamic.take(loader, class_name) {
            return Some(dynamic);
        }
        self.entries
            .iter()
            .find(|e| e.matcher.matches(class_name))
            .map(|e| e.transformer.clone())
    }

    /// `Ok(None)` means the class keeps its original bytes.
    pub fn transform(&self, event: &ClassLoadEvent<'_>) -> Result<Option<Vec<u8>>, TransformError> {
        if is_runtime_class(event.class_name) {
            return Ok(None);
        }
        let Some(transformer) = self.select(event.loader, event.class_name) else {
            return Ok(None);
        };
        log::trace!("transforming {} from {}", event.class_name, event.loader);
        transformer
            .transform(&self.context, event)
            .map_err(|e| TransformError::new(event.class_name, e))
    }

    /// Host boundary: never fails and never unwinds into the JVM.
    pub fn on_class_file_load(
        &self,
        loader: &ClassLoaderRef,
        class_name: Option<&str>,
        class_being_redefined: Option<&ClassRef>,
        protection_domain: Option<&HostHandle>,
        bytes: &[u8],
    ) -> Option<Vec<u8>> {
        let class_name = class_name?;
        let event = ClassLoadEvent { loader, class_name, class_being_redefined, protection_domain, bytes };
        match panic::catch_unwind(AssertUnwindSafe(|| self.transform(&event))) {
            Ok(Ok(rewritten)) => rewritten,
            Ok(Err(e)) => {
                log::error!("{}; loading original class", display_chain(&e));
                None
            }
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                log::error!("transformer panicked on {class_name}: {reason}; loading original class");
                None
            }
        }
    }
}
