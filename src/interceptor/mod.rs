//! Interceptor identities, manifests and the runtime linkage they rely on.

pub mod codegen;
pub mod group;
pub mod invoker;
pub mod registry;

use std::any::Any;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;

use crate::descriptor::java_name_to_internal;

pub use codegen::{check_manifest, CallArg, InvokeCodeGenerator, TargetMethod, Trampoline, TrampolineKind};
pub use group::{ExecutionPolicy, InterceptorGroup, InterceptorGroups};
pub use invoker::InvokerHelper;
pub use registry::InterceptorRegistry;

/// Handle of a registered interceptor, embedded as a constant in generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterceptorId(NonZeroU32);

impl InterceptorId {
    pub fn new(raw: u32) -> Option<InterceptorId> {
        NonZeroU32::new(raw).map(InterceptorId)
    }

    /// Converts the `int` received from Java; negative values are invalid.
    pub fn from_java(raw: i32) -> Option<InterceptorId> {
        u32::try_from(raw).ok().and_then(InterceptorId::new)
    }

    pub fn get(self) -> u32 {
        self.0.get()
    }

    /// Value pushed by generated code.
    pub fn as_java(self) -> i32 {
        self.0.get() as i32
    }
}

impl fmt::Display for InterceptorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Argument shape of the calls a trampoline makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterceptorCategory {
    /// `before(Object target, Object[] args)` and
    /// `after(Object target, Object[] args, Object result, Throwable throwable)`.
    Simple,
    /// Like `Simple` with the class name, method name and parameter list
    /// passed as strings after the target.
    Static,
    /// Target followed by individual arguments, matched by position.
    Custom,
}

/// Method an interceptor declares it applies to when added at class level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodSelector {
    pub name: String,
    /// `None` selects every overload.
    pub params: Option<Vec<String>>,
}

/// Static description of an interceptor type. Stands in for reflecting over
/// the interceptor class: the code generator only needs the category and the
/// declared parameter counts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterceptorManifest {
    type_name: String,
    category: InterceptorCategory,
    before_arity: Option<usize>,
    after_arity: Option<usize>,
    targets: Vec<MethodSelector>,
}

impl InterceptorManifest {
    fn new(type_name: &str, category: InterceptorCategory, before: Option<usize>, after: Option<usize>) -> Self {
        Self {
            type_name: type_name.to_string(),
            category,
            before_arity: before,
            after_arity: after,
            targets: Vec::new(),
        }
    }

    pub fn simple(type_name: &str) -> Self {
        Self::new(type_name, InterceptorCategory::Simple, Some(2), Some(4))
    }

    pub fn static_method(type_name: &str) -> Self {
        Self::new(type_name, InterceptorCategory::Static, Some(5), Some(7))
    }

    /// `before_arity` and `after_arity` count every declared parameter,
    /// including the target and, for `after`, the result and throwable.
    pub fn custom(type_name: &str, before_arity: Option<usize>, after_arity: Option<usize>) -> Self {
        Self::new(type_name, InterceptorCategory::Custom, before_arity, after_arity)
    }

    pub fn without_before(mut self) -> Self {
        self.before_arity = None;
        self
    }

    pub fn without_after(mut self) -> Self {
        self.after_arity = None;
        self
    }

    pub fn target(mut self, name: &str, params: Option<&[&str]>) -> Self {
        self.targets.push(MethodSelector {
            name: name.to_string(),
            params: params.map(|p| p.iter().map(|s| s.to_string()).collect()),
        });
        self
    }

    /// Java name, e.g. `com.example.CloseInterceptor`.
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn internal_name(&self) -> String {
        java_name_to_internal(&self.type_name)
    }

    pub fn category(&self) -> InterceptorCategory {
        self.category
    }

    pub fn before_arity(&self) -> Option<usize> {
        self.before_arity
    }

    pub fn after_arity(&self) -> Option<usize> {
        self.after_arity
    }

    pub fn targets(&self) -> &[MethodSelector] {
        &self.targets
    }
}

/// The interceptor object handed back to generated code. The host decides
/// what it wraps: a JNI global reference in the agent, a plain Rust value in
/// tests.
#[derive(Clone)]
pub struct InterceptorInstance(Arc<dyn Any + Send + Sync>);

impl InterceptorInstance {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        InterceptorInstance(Arc::new(value))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn ptr_eq(&self, other: &InterceptorInstance) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for InterceptorInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("InterceptorInstance(..)")
    }
}

#[derive(Debug, Clone)]
pub struct InterceptorDescriptor {
    pub id: InterceptorId,
    pub type_name: String,
    pub category: InterceptorCategory,
    pub instance: InterceptorInstance,
}
