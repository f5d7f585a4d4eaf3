//! What a plugin sees while it sets itself up.
//!
//! A plugin gets a [`PluginSetupContext`], registers transformers, detectors
//! and groups on it, and returns. The agent then freezes the context and moves
//! the registered entries into the [`TransformerDispatcher`](crate::dispatcher::TransformerDispatcher),
//! so no transformer ever holds on to the context it came from.

use std::fmt;
use std::sync::{Arc, OnceLock};

use crate::config::ProfilerConfig;
use crate::dispatcher::{ClassLoadEvent, InstrumentContext};
use crate::error::{IllegalStateError, InstrumentError};
use crate::interceptor::{InterceptorGroup, InterceptorGroups};
use crate::matcher::Matcher;

/// Rewrites one class. `Ok(None)` keeps the original bytes.
pub trait ClassFileTransformer: Send + Sync {
    fn transform(&self, ctx: &InstrumentContext, event: &ClassLoadEvent<'_>) -> Result<Option<Vec<u8>>, InstrumentError>;
}

impl<F> ClassFileTransformer for F
where
    F: Fn(&InstrumentContext, &ClassLoadEvent<'_>) -> Result<Option<Vec<u8>>, InstrumentError> + Send + Sync,
{
    fn transform(&self, ctx: &InstrumentContext, event: &ClassLoadEvent<'_>) -> Result<Option<Vec<u8>>, InstrumentError> {
        self(ctx, event)
    }
}

#[derive(Clone)]
pub struct TransformerEntry {
    pub matcher: Matcher,
    pub transformer: Arc<dyn ClassFileTransformer>,
}

impl fmt::Debug for TransformerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransformerEntry").field("matcher", &self.matcher).finish_non_exhaustive()
    }
}

/// Server role the host application plays, as reported in traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceType {
    pub code: i16,
    pub name: &'static str,
}

impl ServiceType {
    pub const STAND_ALONE: ServiceType = ServiceType::new(1000, "STAND_ALONE");

    pub const fn new(code: i16, name: &'static str) -> Self {
        Self { code, name }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name, self.code)
    }
}

/// What a detector may inspect about the starting application.
#[derive(Debug, Clone, Default)]
pub struct DetectionContext {
    /// Main class or jar, the first word of `sun.java.command`.
    pub main_class: Option<String>,
    pub system_properties: std::collections::HashMap<String, String>,
}

impl DetectionContext {
    pub fn from_java_command(command: Option<&str>) -> Self {
        Self {
            main_class: command.and_then(|c| c.split_whitespace().next()).map(str::to_string),
            system_properties: Default::default(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.system_properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.system_properties.get(key).map(String::as_str)
    }
}

pub trait ApplicationTypeDetector: Send + Sync {
    fn application_type(&self) -> ServiceType;

    fn detect(&self, ctx: &DetectionContext) -> bool;
}

/// First detector in registration order that matches, or
/// [`ServiceType::STAND_ALONE`].
pub fn detect_application_type(detectors: &[Arc<dyn ApplicationTypeDetector>], ctx: &DetectionContext) -> ServiceType {
    detectors
        .iter()
        .find(|d| d.detect(ctx))
        .map(|d| d.application_type())
        .unwrap_or(ServiceType::STAND_ALONE)
}

/// Trace-side services, constructed after plugin setup.
pub trait TraceContext: Send + Sync {
    fn agent_id(&self) -> &str;

    fn application_name(&self) -> &str;

    fn service_type(&self) -> ServiceType;
}

/// Slot the agent fills once the trace context exists.
#[derive(Clone, Default)]
pub struct TraceContextHolder {
    slot: Arc<OnceLock<Arc<dyn TraceContext>>>,
}

impl TraceContextHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, context: Arc<dyn TraceContext>) -> Result<(), IllegalStateError> {
        self.slot.set(context).map_err(|_| IllegalStateError::new("TraceContext is already set"))
    }

    pub fn get(&self) -> Option<Arc<dyn TraceContext>> {
        self.slot.get().cloned()
    }
}

impl fmt::Debug for TraceContextHolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceContextHolder").field("set", &self.slot.get().is_some()).finish()
    }
}

pub trait ProfilerPlugin: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn setup(&self, ctx: &mut PluginSetupContext) -> anyhow::Result<()>;
}

/// What a frozen context hands over.
#[derive(Default)]
pub struct PluginSetupResult {
    pub transformers: Vec<TransformerEntry>,
    pub detectors: Vec<Arc<dyn ApplicationTypeDetector>>,
}

pub struct PluginSetupContext {
    config: Arc<ProfilerConfig>,
    groups: Arc<InterceptorGroups>,
    trace_context: TraceContextHolder,
    transformers: Vec<TransformerEntry>,
    detectors: Vec<Arc<dyn ApplicationTypeDetector>>,
    initialized: bool,
}

impl PluginSetupContext {
    pub fn new(config: Arc<ProfilerConfig>, groups: Arc<InterceptorGroups>, trace_context: TraceContextHolder) -> Self {
        Self {
            config,
            groups,
            trace_context,
            transformers: Vec::new(),
            detectors: Vec::new(),
            initialized: false,
        }
    }

    fn check_mutable(&self) -> Result<(), IllegalStateError> {
        if self.initialized {
            return Err(IllegalStateError::new("Context already initialized"));
        }
        Ok(())
    }

    /// Registers `transformer` for the class named `target_name`, in Java or
    /// internal form.
    pub fn add_class_file_transformer<T>(&mut self, target_name: &str, transformer: T) -> Result<(), IllegalStateError>
    where
        T: ClassFileTransformer + 'static,
    {
        self.add_matched_transformer(Matcher::class_name(target_name), Arc::new(transformer))
    }

    pub fn add_matched_transformer(
        &mut self,
        matcher: Matcher,
        transformer: Arc<dyn ClassFileTransformer>,
    ) -> Result<(), IllegalStateError> {
        self.check_mutable()?;
        self.transformers.push(TransformerEntry { matcher, transformer });
        Ok(())
    }

    pub fn add_application_type_detector<I>(&mut self, detectors: I) -> Result<(), IllegalStateError>
    where
        I: IntoIterator<Item = Arc<dyn ApplicationTypeDetector>>,
    {
        self.check_mutable()?;
        self.detectors.extend(detectors);
        Ok(())
    }

    pub fn get_interceptor_group(&self, name: &str) -> Arc<InterceptorGroup> {
        self.groups.get_or_create(name)
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    pub fn trace_context(&self) -> Result<Arc<dyn TraceContext>, IllegalStateError> {
        self.trace_context.get().ok_or_else(|| IllegalStateError::new("TraceContext is not created yet"))
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn transformers(&self) -> &[TransformerEntry] {
        &self.transformers
    }

    pub fn detectors(&self) -> &[Arc<dyn ApplicationTypeDetector>] {
        &self.detectors
    }

    /// Freezes the context and moves its registrations out.
    pub fn into_entries(mut self) -> PluginSetupResult {
        self.mark_initialized();
        PluginSetupResult { transformers: self.transformers, detectors: self.detectors }
    }
}

/// Runs every plugin against its own context, in order, and collects the
/// frozen results. A failing plugin aborts setup.
pub fn setup_plugins(
    plugins: &[Box<dyn ProfilerPlugin>],
    config: Arc<ProfilerConfig>,
    groups: Arc<InterceptorGroups>,
    trace_context: TraceContextHolder,
) -> anyhow::Result<PluginSetupResult> {
    use anyhow::Context as _;

    let mut all = PluginSetupResult::default();
    for plugin in plugins {
        let mut ctx = PluginSetupContext::new(config.clone(), groups.clone(), trace_context.clone());
        plugin.setup(&mut ctx).with_context(|| format!("setting up plugin {}", plugin.name()))?;
        let result = ctx.into_entries();
        log::info!(
            "plugin {} registered {} transformer(s), {} detector(s)",
            plugin.name(),
            result.transformers.len(),
            result.detectors.len()
        );
        all.transformers.extend(result.transformers);
        all.detectors.extend(result.detectors);
    }
    Ok(all)
}
