//! The JVMTI agent that wires everything to a running JVM.
//!
//! Lifecycle:
//!
//! 1. `Agent_OnLoad`: parse options, start logging, run plugin setup,
//!    request capabilities and enable `VMInit`.
//! 2. `VMInit`: define the runtime helper classes in the bootstrap loader,
//!    bind their natives, build the dispatcher, detect the application type
//!    and enable `ClassFileLoadHook`.
//! 3. `ClassFileLoadHook`: hand every class to the dispatcher and copy any
//!    rewritten bytes into JVMTI memory.
//!
//! Classes loaded before step 2 keep their original bytes unless a plugin
//! retransforms them later.

use std::ffi::{c_char, c_void, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use crate::config::ProfilerConfig;
use crate::dispatcher::{InstrumentContext, TransformerDispatcher};
use crate::env::{GlobalRef, JniEnv, Jvmti, LocalRef};
use crate::error::{InjectError, InstrumentError};
use crate::host::{
    ClassFileLocator, ClassLoaderRef, ClassRef, HostHandle, InstrumentHost, InterceptorFactory, LoaderId,
    Retransformer,
};
use crate::injector::{ClassDefiner, ClassInjector, GeneratedClassSource};
use crate::interceptor::{InterceptorGroups, InterceptorInstance, InterceptorManifest, InterceptorRegistry, InvokerHelper};
use crate::plugin::{
    detect_application_type, setup_plugins, DetectionContext, PluginSetupResult, ProfilerPlugin, ServiceType,
    TraceContextHolder,
};
use crate::runtime;
use crate::sys::{jni, jvmti};
use crate::Agent;

/// System properties handed to application type detectors.
const DETECTION_PROPERTIES: &[&str] = &["catalina.home", "jetty.home", "java.class.path"];

/// The process-wide JavaVM pointer.
#[derive(Debug, Clone, Copy)]
struct VmPtr(*mut jni::JavaVM);

// The JavaVM outlives every thread that can observe this pointer.
unsafe impl Send for VmPtr {}
unsafe impl Sync for VmPtr {}

impl VmPtr {
    fn env(&self) -> Result<JniEnv, InstrumentError> {
        unsafe { JniEnv::current(self.0) }
            .ok_or_else(|| InstrumentError::Unsupported("current thread is not attached to the JVM".to_string()))
    }
}

struct LoaderEntry {
    id: LoaderId,
    weak: jni::jweak,
}

// Weak global references are valid on every thread.
unsafe impl Send for LoaderEntry {}

/// Maps `ClassLoader` objects to stable ids through weak references, so the
/// table never keeps a loader alive.
#[derive(Default)]
struct LoaderTable {
    next_id: AtomicU64,
    entries: Mutex<Vec<LoaderEntry>>,
}

impl LoaderTable {
    fn lookup(&self, env: &JniEnv, loader: jni::jobject) -> ClassLoaderRef {
        if loader.is_null() {
            return ClassLoaderRef::Bootstrap;
        }
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        // A collected loader compares equal to null; drop it.
        entries.retain(|e| {
            let alive = !env.is_same_object(e.weak, std::ptr::null_mut());
            if !alive {
                env.delete_weak_global_ref(e.weak);
            }
            alive
        });
        if let Some(entry) = entries.iter().find(|e| env.is_same_object(e.weak, loader)) {
            return ClassLoaderRef::Loader(entry.id);
        }
        let id = LoaderId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        entries.push(LoaderEntry { id, weak: env.new_weak_global_ref(loader) });
        ClassLoaderRef::Loader(id)
    }

    /// A local reference to the loader, null for bootstrap. `None` if the
    /// loader is unknown or has been collected.
    fn resolve(&self, env: &JniEnv, loader: &ClassLoaderRef) -> Option<jni::jobject> {
        let ClassLoaderRef::Loader(id) = loader else {
            return Some(std::ptr::null_mut());
        };
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.iter().find(|e| e.id == *id)?;
        let local = env.new_local_ref(entry.weak);
        if local.is_null() { None } else { Some(local) }
    }
}

/// JNI implementation of the host traits.
struct JvmHost {
    vm: VmPtr,
    loaders: LoaderTable,
}

impl JvmHost {
    fn loader_object(&self, env: &JniEnv, loader: &ClassLoaderRef) -> Result<jni::jobject, InstrumentError> {
        self.loaders
            .resolve(env, loader)
            .ok_or_else(|| InstrumentError::not_found("class loader", loader.to_string()))
    }

    fn class_ref(&self, env: &JniEnv, loader: &ClassLoaderRef, name: &str, class: jni::jclass) -> ClassRef {
        let handle = unsafe { GlobalRef::new(self.vm.0, env, class) }.map(HostHandle::new);
        ClassRef::new(loader.clone(), name, handle)
    }

    fn read_resource(&self, env: &JniEnv, loader: jni::jobject, resource: &str) -> Result<Option<Vec<u8>>, String> {
        let class_loader = LocalRef::new(env, env.find_class("java/lang/ClassLoader").ok_or("no ClassLoader class")?);
        let name = LocalRef::new(env, env.new_string_utf(resource).ok_or("resource name")?);
        let args = [jni::jvalue { l: name.get() }];
        let stream = if loader.is_null() {
            // The system loader delegates to bootstrap first.
            let get = env
                .get_static_method_id(class_loader.get(), "getSystemResourceAsStream", "(Ljava/lang/String;)Ljava/io/InputStream;")
                .ok_or("no getSystemResourceAsStream")?;
            env.call_static_object_method(class_loader.get(), get, &args)
        } else {
            let get = env
                .get_method_id(class_loader.get(), "getResourceAsStream", "(Ljava/lang/String;)Ljava/io/InputStream;")
                .ok_or("no getResourceAsStream")?;
            env.call_object_method(loader, get, &args)
        };
        if let Some(thrown) = env.take_exception() {
            return Err(thrown);
        }
        let stream = LocalRef::new(env, stream);
        if stream.is_null() {
            return Ok(None);
        }
        let stream_class = LocalRef::new(env, env.get_object_class(stream.get()));
        let Some(read_all) = env.get_method_id(stream_class.get(), "readAllBytes", "()[B") else {
            env.exception_clear();
            return Err("InputStream.readAllBytes is not available".to_string());
        };
        let bytes = LocalRef::new(env, env.call_object_method(stream.get(), read_all, &[]));
        let thrown = env.take_exception();
        if let Some(close) = env.get_method_id(stream_class.get(), "close", "()V") {
            env.call_void_method(stream.get(), close, &[]);
        }
        env.exception_clear();
        match thrown {
            Some(thrown) => Err(thrown),
            None => Ok(Some(env.read_byte_array(bytes.get()))),
        }
    }
}

impl ClassFileLocator for JvmHost {
    fn locate(&self, loader: &ClassLoaderRef, internal_name: &str) -> Result<Option<Vec<u8>>, InstrumentError> {
        let env = self.vm.env()?;
        let resource = format!("{internal_name}.class");
        env.with_local_frame(16, |env| {
            let loader_obj = self.loader_object(env, loader)?;
            self.read_resource(env, loader_obj, &resource).map_err(|reason| {
                InstrumentError::Inject(InjectError::Read { class: internal_name.to_string(), reason })
            })
        })
        .unwrap_or_else(|| Err(InstrumentError::Unsupported("local frame allocation failed".to_string())))
    }
}

impl ClassDefiner for JvmHost {
    fn find_visible(&self, loader: &ClassLoaderRef, name: &str) -> Result<Option<ClassRef>, InjectError> {
        let read_error = |reason: String| InjectError::Read { class: name.to_string(), reason };
        let env = self.vm.env().map_err(|e| read_error(e.to_string()))?;
        let loader_obj = self.loaders.resolve(&env, loader).ok_or_else(|| read_error(format!("{loader} is gone")))?;
        let loader_obj = LocalRef::new(&env, loader_obj);
        let class_class = LocalRef::new(&env, env.find_class("java/lang/Class").ok_or_else(|| read_error("no Class".into()))?);
        let for_name = env
            .get_static_method_id(class_class.get(), "forName", "(Ljava/lang/String;ZLjava/lang/ClassLoader;)Ljava/lang/Class;")
            .ok_or_else(|| read_error("no Class.forName".into()))?;
        let java_name = LocalRef::new(
            &env,
            env.new_string_utf(&name.replace('/', ".")).ok_or_else(|| read_error("class name".into()))?,
        );
        let args = [jni::jvalue { l: java_name.get() }, jni::jvalue { z: jni::JNI_FALSE }, jni::jvalue { l: loader_obj.get() }];
        let class = LocalRef::new(&env, env.call_static_object_method(class_class.get(), for_name, &args));
        if env.take_exception().is_some() || class.is_null() {
            return Ok(None);
        }
        Ok(Some(self.class_ref(&env, loader, name, class.get())))
    }

    fn define(&self, loader: &ClassLoaderRef, name: &str, bytes: &[u8]) -> Result<ClassRef, InjectError> {
        let failed = |reason: String| InjectError::DefineFailed { class: name.to_string(), reason };
        let env = self.vm.env().map_err(|e| failed(e.to_string()))?;
        let loader_obj = self.loaders.resolve(&env, loader).ok_or_else(|| failed(format!("{loader} is gone")))?;
        let loader_obj = LocalRef::new(&env, loader_obj);
        match env.define_class(name, loader_obj.get(), bytes) {
            Some(class) => {
                let class = LocalRef::new(&env, class);
                Ok(self.class_ref(&env, loader, name, class.get()))
            }
            None => Err(failed(env.take_exception().unwrap_or_else(|| "DefineClass returned null".to_string()))),
        }
    }
}

/// Instantiates interceptors with their public no-arg constructor after
/// making the class visible from the target loader.
struct JvmInterceptorFactory {
    vm: VmPtr,
    injector: Arc<ClassInjector>,
}

impl InterceptorFactory for JvmInterceptorFactory {
    fn create(&self, loader: &ClassLoaderRef, manifest: &InterceptorManifest) -> Result<InterceptorInstance, InstrumentError> {
        let creation = |reason: String| InstrumentError::InterceptorCreation {
            type_name: manifest.type_name().to_string(),
            reason,
        };
        let class = self.injector.inject(loader, manifest.type_name())?;
        let class_ref = class
            .handle
            .as_ref()
            .and_then(|h| h.downcast_ref::<GlobalRef>())
            .ok_or_else(|| creation("no class handle".to_string()))?;
        let env = self.vm.env()?;
        let init = env
            .get_method_id(class_ref.get(), "<init>", "()V")
            .ok_or_else(|| creation(env.take_exception().unwrap_or_else(|| "no public no-arg constructor".into())))?;
        let instance = env
            .new_object(class_ref.get(), init, &[])
            .ok_or_else(|| creation(env.take_exception().unwrap_or_else(|| "constructor returned null".into())))?;
        let instance = LocalRef::new(&env, instance);
        let global = unsafe { GlobalRef::new(self.vm.0, &env, instance.get()) }
            .ok_or_else(|| creation("NewGlobalRef failed".to_string()))?;
        Ok(InterceptorInstance::new(global))
    }
}

struct JvmRetransformer {
    jvmti: Arc<Jvmti>,
}

impl Retransformer for JvmRetransformer {
    fn retransform(&self, class: &ClassRef) -> Result<(), InstrumentError> {
        let global = class
            .handle
            .as_ref()
            .and_then(|h| h.downcast_ref::<GlobalRef>())
            .ok_or_else(|| InstrumentError::Unsupported(format!("{} has no JVM class handle", class.name)))?;
        self.jvmti
            .retransform_classes(&[global.get()])
            .map_err(|e| InstrumentError::Unsupported(format!("RetransformClasses({}) failed: {e}", class.name)))
    }
}

/// Everything fixed at `Agent_OnLoad`.
struct Loaded {
    vm: VmPtr,
    jvmti: Arc<Jvmti>,
    config: Arc<ProfilerConfig>,
}

/// Builds an [`InstrumentationAgent`] from the plugins it should run.
#[derive(Default)]
pub struct AgentBuilder {
    plugins: Vec<Box<dyn ProfilerPlugin>>,
    trace_context: TraceContextHolder,
}

impl AgentBuilder {
    pub fn plugin<P: ProfilerPlugin + 'static>(mut self, plugin: P) -> Self {
        self.plugins.push(Box::new(plugin));
        self
    }

    /// Slot the embedding agent fills once its trace context exists.
    pub fn trace_context(mut self, holder: TraceContextHolder) -> Self {
        self.trace_context = holder;
        self
    }

    pub fn build(self) -> InstrumentationAgent {
        InstrumentationAgent {
            plugins: self.plugins,
            trace_context: self.trace_context,
            loaded: OnceLock::new(),
            host: OnceLock::new(),
            setup: Mutex::new(None),
            dispatcher: OnceLock::new(),
            application_type: OnceLock::new(),
        }
    }
}

/// An [`Agent`] that runs profiler plugins and rewrites the classes they
/// select.
///
/// ```rust,ignore
/// fn agent() -> InstrumentationAgent {
///     InstrumentationAgent::builder().plugin(JdbcPlugin).build()
/// }
///
/// export_agent!(factory = agent);
/// ```
pub struct InstrumentationAgent {
    plugins: Vec<Box<dyn ProfilerPlugin>>,
    trace_context: TraceContextHolder,
    loaded: OnceLock<Loaded>,
    host: OnceLock<Arc<JvmHost>>,
    setup: Mutex<Option<PluginSetupResult>>,
    dispatcher: OnceLock<TransformerDispatcher>,
    application_type: OnceLock<ServiceType>,
}

impl Default for InstrumentationAgent {
    fn default() -> Self {
        AgentBuilder::default().build()
    }
}

impl InstrumentationAgent {
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    pub fn application_type(&self) -> Option<ServiceType> {
        self.application_type.get().copied()
    }

    pub fn dispatcher(&self) -> Option<&TransformerDispatcher> {
        self.dispatcher.get()
    }

    fn init_logging(config: &ProfilerConfig) {
        let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        if let Some(filter) = config.log_filter() {
            builder.parse_filters(filter);
        }
        // Another agent in the process may already own the logger.
        let _ = builder.try_init();
    }

    fn load(&self, vm: *mut jni::JavaVM, options: &str) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let config = Arc::new(ProfilerConfig::parse(options));
        Self::init_logging(&config);
        log::info!("instrumentation agent loading with {} plugin(s)", self.plugins.len());

        let setup = setup_plugins(
            &self.plugins,
            config.clone(),
            Arc::new(InterceptorGroups::new()),
            self.trace_context.clone(),
        )?;
        *self.setup.lock().unwrap_or_else(|e| e.into_inner()) = Some(setup);

        let jvmti = Jvmti::new(vm).map_err(|code| anyhow::anyhow!("GetEnv(JVMTI) failed with {code}"))?;
        let mut caps = jvmti::jvmtiCapabilities::default();
        caps.set_can_generate_all_class_hook_events(true);
        if config.retransform_enabled() {
            caps.set_can_retransform_classes(true);
            caps.set_can_retransform_any_class(true);
        }
        jvmti.add_capabilities(&caps).context("adding capabilities")?;
        jvmti.set_event_callbacks(crate::get_default_callbacks()).context("setting event callbacks")?;
        jvmti
            .set_event_notification_mode(true, jvmti::JVMTI_EVENT_VM_INIT, std::ptr::null_mut())
            .context("enabling VMInit")?;

        let loaded = Loaded { vm: VmPtr(vm), jvmti: Arc::new(jvmti), config };
        if self.loaded.set(loaded).is_err() {
            anyhow::bail!("agent loaded twice");
        }
        Ok(())
    }

    fn start(&self, env: &JniEnv) -> anyhow::Result<()> {
        use anyhow::Context as _;

        let loaded = self.loaded.get().context("VMInit before Agent_OnLoad")?;
        log::debug!("JNI version {:#x}", env.get_version());

        bind_runtime(env).context("binding runtime helper classes")?;

        let host = Arc::new(JvmHost { vm: loaded.vm, loaders: LoaderTable::default() });
        let injector = ClassInjector::new(host.clone()).with_source(Arc::new(GeneratedClassSource::runtime()?));
        let injector = Arc::new(with_plugin_jars(injector, &loaded.config)?);
        let factory = Arc::new(JvmInterceptorFactory { vm: loaded.vm, injector: injector.clone() });
        let instrument_host = InstrumentHost::new(InterceptorRegistry::global(), factory, host.clone());
        let mut context = InstrumentContext::new(instrument_host).with_injector(injector);
        if loaded.config.retransform_enabled() {
            context = context.with_retransformer(Arc::new(JvmRetransformer { jvmti: loaded.jvmti.clone() }));
        }

        let setup = self.setup.lock().unwrap_or_else(|e| e.into_inner()).take().unwrap_or_default();
        let command = loaded.jvmti.get_system_property("sun.java.command").ok();
        let detection = DETECTION_PROPERTIES.iter().fold(
            DetectionContext::from_java_command(command.as_deref()),
            |ctx, key| match loaded.jvmti.get_system_property(key) {
                Ok(value) => ctx.with_property(key, &value),
                Err(_) => ctx,
            },
        );
        let application_type = detect_application_type(&setup.detectors, &detection);
        let _ = self.application_type.set(application_type);
        log::info!("application type {application_type}");

        let dispatcher = TransformerDispatcher::new(setup.transformers, context);
        log::info!("{} class file transformer(s) active", dispatcher.len());
        if self.dispatcher.set(dispatcher).is_err() || self.host.set(host).is_err() {
            anyhow::bail!("VMInit delivered twice");
        }
        loaded
            .jvmti
            .set_event_notification_mode(true, jvmti::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK, std::ptr::null_mut())
            .context("enabling ClassFileLoadHook")?;
        Ok(())
    }
}

#[cfg(feature = "plugin-jars")]
fn with_plugin_jars(mut injector: ClassInjector, config: &ProfilerConfig) -> anyhow::Result<ClassInjector> {
    use anyhow::Context as _;

    for jar in config.plugin_jars() {
        let source = crate::injector::JarClassSource::open(&jar).with_context(|| format!("opening {}", jar.display()))?;
        log::info!("plugin jar {} holds {} class(es)", jar.display(), source.class_names().len());
        injector = injector.with_source(Arc::new(source));
    }
    Ok(injector)
}

#[cfg(not(feature = "plugin-jars"))]
fn with_plugin_jars(injector: ClassInjector, config: &ProfilerConfig) -> anyhow::Result<ClassInjector> {
    if !config.plugin_jars().is_empty() {
        log::warn!("plugin jars configured but jar support is not compiled in");
    }
    Ok(injector)
}

/// Defines the runtime helpers in the bootstrap loader and binds their
/// natives to this library.
fn bind_runtime(env: &JniEnv) -> anyhow::Result<()> {
    let natives: [(&str, &str, &str, *mut c_void); 2] = [
        (
            runtime::REGISTRY_CLASS,
            "findInterceptor\0",
            "(I)Ljava/lang/Object;\0",
            native_find_interceptor as *mut c_void,
        ),
        (
            runtime::INVOKER_HELPER_CLASS,
            "handleException\0",
            "(Ljava/lang/Throwable;)V\0",
            native_handle_exception as *mut c_void,
        ),
    ];
    let classes = runtime::helper_classes()?;
    for (class_name, method, signature, fn_ptr) in natives {
        let bytes = classes
            .iter()
            .find(|(name, _)| *name == class_name)
            .map(|(_, bytes)| bytes)
            .ok_or_else(|| anyhow::anyhow!("no generated class {class_name}"))?;
        let class = match env.find_class(class_name) {
            Some(existing) => existing,
            None => {
                env.exception_clear();
                env.define_class(class_name, std::ptr::null_mut(), bytes).ok_or_else(|| {
                    anyhow::anyhow!("defining {class_name}: {}", env.take_exception().unwrap_or_default())
                })?
            }
        };
        let class = LocalRef::new(env, class);
        let method = jni::JNINativeMethod {
            name: method.as_ptr() as *const c_char,
            signature: signature.as_ptr() as *const c_char,
            fnPtr: fn_ptr,
        };
        env.register_natives(class.get(), &[method])
            .map_err(|code| anyhow::anyhow!("RegisterNatives({class_name}) failed with {code}"))?;
        log::debug!("bound natives of {class_name}");
    }
    Ok(())
}

/// `InterceptorRegistry.findInterceptor(int)`.
unsafe extern "system" fn native_find_interceptor(env: *mut jni::JNIEnv, _class: jni::jclass, id: jni::jint) -> jni::jobject {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let env = JniEnv::from_raw(env);
        let Some(descriptor) = InterceptorRegistry::global().find_raw(id) else {
            log::warn!("generated code asked for unknown interceptor {id}");
            InvokerHelper::set_current(None);
            return std::ptr::null_mut();
        };
        InvokerHelper::set_current(Some(descriptor.id));
        match descriptor.instance.downcast_ref::<GlobalRef>() {
            Some(global) => env.new_local_ref(global.get()),
            None => {
                log::warn!("interceptor {id} ({}) has no JVM instance", descriptor.type_name);
                std::ptr::null_mut()
            }
        }
    }));
    result.unwrap_or(std::ptr::null_mut())
}

/// `InterceptorInvokerHelper.handleException(Throwable)`.
unsafe extern "system" fn native_handle_exception(env: *mut jni::JNIEnv, _class: jni::jclass, throwable: jni::jthrowable) {
    let _ = panic::catch_unwind(AssertUnwindSafe(|| {
        let env = JniEnv::from_raw(env);
        InvokerHelper::handle_exception(&env.describe(throwable));
    }));
}

impl Agent for InstrumentationAgent {
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint {
        match self.load(vm, options) {
            Ok(()) => jni::JNI_OK,
            Err(e) => {
                log::error!("instrumentation agent failed to load: {e:#}");
                jni::JNI_ERR
            }
        }
    }

    fn vm_init(&self, jni_env: *mut jni::JNIEnv, _thread: jni::jthread) {
        let env = unsafe { JniEnv::from_raw(jni_env) };
        if let Err(e) = self.start(&env) {
            log::error!("instrumentation disabled: {e:#}");
        }
    }

    fn vm_death(&self, _jni_env: *mut jni::JNIEnv) {
        let registered = InterceptorRegistry::global().len();
        log::info!("VM shutting down with {registered} interceptor(s) registered");
    }

    fn class_file_load_hook(
        &self,
        jni_env: *mut jni::JNIEnv,
        class_being_redefined: jni::jclass,
        loader: jni::jobject,
        name: *const c_char,
        _protection_domain: jni::jobject,
        class_data_len: jni::jint,
        class_data: *const u8,
        new_class_data_len: *mut jni::jint,
        new_class_data: *mut *mut u8,
    ) {
        let (Some(dispatcher), Some(loaded), Some(host)) = (self.dispatcher.get(), self.loaded.get(), self.host.get())
        else {
            return;
        };
        if class_data.is_null() || class_data_len <= 0 {
            return;
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            let env = unsafe { JniEnv::from_raw(jni_env) };
            let class_name = (!name.is_null())
                .then(|| unsafe { CStr::from_ptr(name) }.to_str().ok())
                .flatten();
            let bytes = unsafe { std::slice::from_raw_parts(class_data, class_data_len as usize) };
            let loader_ref = host.loaders.lookup(&env, loader);
            let redefined = (!class_being_redefined.is_null()).then(|| {
                let handle = unsafe { GlobalRef::new(loaded.vm.0, &env, class_being_redefined) }.map(HostHandle::new);
                ClassRef::new(loader_ref.clone(), class_name.unwrap_or_default(), handle)
            });
            dispatcher.on_class_file_load(&loader_ref, class_name, redefined.as_ref(), None, bytes)
        }));
        let rewritten = match outcome {
            Ok(Some(rewritten)) => rewritten,
            Ok(None) => return,
            Err(_) => {
                log::error!("class file load hook panicked; loading original class");
                return;
            }
        };
        match loaded.jvmti.copy_out(&rewritten) {
            Ok((mem, len)) => unsafe {
                *new_class_data_len = len;
                *new_class_data = mem;
            },
            Err(e) => log::error!("could not hand rewritten class to the JVM: {e}"),
        }
    }
}

impl std::fmt::Debug for InstrumentationAgent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationAgent")
            .field("plugins", &self.plugins.iter().map(|p| p.name().to_string()).collect::<Vec<_>>())
            .field("application_type", &self.application_type.get())
            .finish_non_exhaustive()
    }
}
