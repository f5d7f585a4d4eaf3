//! Common imports for writing instrumentation plugins and agents.
//!
//! This prelude is intentionally small: the types a plugin touches while
//! setting up and while transforming a class.

pub use crate::agent::InstrumentationAgent;
pub use crate::dispatcher::{ClassLoadEvent, InstrumentContext};
pub use crate::error::InstrumentError;
pub use crate::export_agent;
pub use crate::host::{ClassLoaderRef, ClassRef};
pub use crate::instrument::{Accessor, ClassFilters, Getter, InstrumentClass, InstrumentMethod};
pub use crate::interceptor::InterceptorManifest;
pub use crate::matcher::Matcher;
pub use crate::plugin::{
    ApplicationTypeDetector, ClassFileTransformer, DetectionContext, PluginSetupContext, ProfilerPlugin, ServiceType,
};
pub use crate::Agent;
