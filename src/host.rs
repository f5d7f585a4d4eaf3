//! What the instrumentation core needs from the JVM, as traits.
//!
//! The agent implements these on top of JNI. Tests implement them with plain
//! Rust values, which keeps every rewrite path runnable without a JVM.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::InstrumentError;
use crate::interceptor::{InterceptorInstance, InterceptorManifest, InterceptorRegistry};

/// Stable identity of a non-bootstrap class loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(pub u64);

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ClassLoaderRef {
    /// The JVM's bootstrap loader, seen as a null `ClassLoader`.
    Bootstrap,
    Loader(LoaderId),
}

impl fmt::Display for ClassLoaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassLoaderRef::Bootstrap => f.write_str("bootstrap"),
            ClassLoaderRef::Loader(id) => write!(f, "loader#{}", id.0),
        }
    }
}

/// Host object carried through the core without being inspected, e.g. a JNI
/// global reference.
#[derive(Clone)]
pub struct HostHandle(Arc<dyn Any + Send + Sync>);

impl HostHandle {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        HostHandle(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &HostHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for HostHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HostHandle(..)")
    }
}

/// A loaded class.
#[derive(Debug, Clone)]
pub struct ClassRef {
    pub loader: ClassLoaderRef,
    /// Internal name.
    pub name: String,
    pub handle: Option<HostHandle>,
}

impl ClassRef {
    pub fn new(loader: ClassLoaderRef, name: &str, handle: Option<HostHandle>) -> Self {
        Self { loader, name: name.to_string(), handle }
    }

    /// Same loader, same name and, when both carry one, the same handle.
    pub fn same_class(&self, other: &ClassRef) -> bool {
        let handles = match (&self.handle, &other.handle) {
            (Some(a), Some(b)) => a.ptr_eq(b),
            (None, None) => true,
            _ => false,
        };
        self.loader == other.loader && self.name == other.name && handles
    }
}

/// Reads class files as a loader would find them, without loading them.
pub trait ClassFileLocator: Send + Sync {
    fn locate(&self, loader: &ClassLoaderRef, internal_name: &str) -> Result<Option<Vec<u8>>, InstrumentError>;
}

impl<F> ClassFileLocator for F
where
    F: Fn(&ClassLoaderRef, &str) -> Result<Option<Vec<u8>>, InstrumentError> + Send + Sync,
{
    fn locate(&self, loader: &ClassLoaderRef, internal_name: &str) -> Result<Option<Vec<u8>>, InstrumentError> {
        self(loader, internal_name)
    }
}

/// Locator for hosts that cannot read class files.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoClassFiles;

impl ClassFileLocator for NoClassFiles {
    fn locate(&self, _loader: &ClassLoaderRef, _internal_name: &str) -> Result<Option<Vec<u8>>, InstrumentError> {
        Ok(None)
    }
}

/// Creates the interceptor object a trampoline will call, in the loader of
/// the class being instrumented.
pub trait InterceptorFactory: Send + Sync {
    fn create(
        &self,
        loader: &ClassLoaderRef,
        manifest: &InterceptorManifest,
    ) -> Result<InterceptorInstance, InstrumentError>;
}

impl<F> InterceptorFactory for F
where
    F: Fn(&ClassLoaderRef, &InterceptorManifest) -> Result<InterceptorInstance, InstrumentError> + Send + Sync,
{
    fn create(
        &self,
        loader: &ClassLoaderRef,
        manifest: &InterceptorManifest,
    ) -> Result<InterceptorInstance, InstrumentError> {
        self(loader, manifest)
    }
}

/// Host retransform API.
pub trait Retransformer: Send + Sync {
    fn retransform(&self, class: &ClassRef) -> Result<(), InstrumentError>;
}

/// The pieces of the host an [`InstrumentClass`](crate::instrument::InstrumentClass)
/// works against.
#[derive(Clone)]
pub struct InstrumentHost {
    registry: Arc<InterceptorRegistry>,
    factory: Arc<dyn InterceptorFactory>,
    locator: Arc<dyn ClassFileLocator>,
}

impl InstrumentHost {
    pub fn new(
        registry: Arc<InterceptorRegistry>,
        factory: Arc<dyn InterceptorFactory>,
        locator: Arc<dyn ClassFileLocator>,
    ) -> Self {
        Self { registry, factory, locator }
    }

    pub fn registry(&self) -> &Arc<InterceptorRegistry> {
        &self.registry
    }

    pub fn factory(&self) -> &Arc<dyn InterceptorFactory> {
        &self.factory
    }

    pub fn locator(&self) -> &Arc<dyn ClassFileLocator> {
        &self.locator
    }
}

impl fmt::Debug for InstrumentHost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentHost").field("registry", &self.registry).finish_non_exhaustive()
    }
}
