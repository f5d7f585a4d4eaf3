//! # jvmti-instrument
//!
//! Load-time class instrumentation for JVM APM agents.
//!
//! Plugins pick classes and methods; the engine rewrites the class file inside
//! the JVMTI `ClassFileLoadHook` so every selected method calls its
//! interceptors' `before` on entry and `after` on every exit, normal or
//! exceptional.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use jvmti_instrument::prelude::*;
//!
//! struct JdbcPlugin;
//!
//! impl ProfilerPlugin for JdbcPlugin {
//!     fn setup(&self, ctx: &mut PluginSetupContext) -> anyhow::Result<()> {
//!         ctx.add_class_file_transformer("com.mysql.jdbc.StatementImpl", |ctx: &InstrumentContext, event: &ClassLoadEvent<'_>| {
//!             let Some(mut class) = ctx.get_instrument_class(event.loader, event.class_name, Some(event.bytes))? else {
//!                 return Ok(None);
//!             };
//!             if let Some(mut method) = class.get_declared_method("executeQuery", &["java.lang.String"])? {
//!                 method.add_interceptor(&InterceptorManifest::simple("com.example.ExecuteQueryInterceptor"))?;
//!             }
//!             Ok(Some(class.to_bytes()?))
//!         })?;
//!         Ok(())
//!     }
//! }
//!
//! fn agent() -> InstrumentationAgent {
//!     InstrumentationAgent::builder().plugin(JdbcPlugin).build()
//! }
//!
//! export_agent!(factory = agent);
//! ```
//!
//! ```bash
//! java -agentpath:./target/release/libmy_agent.so=log=debug,profiler.retransform=true MyApp
//! ```
//!
//! ## Layout
//!
//! ```text
//! agent        JVMTI lifecycle, JNI-backed host services
//! dispatcher   class-load routing, dynamic and static transformers
//! plugin       plugin setup context, detectors, trace context slot
//! instrument   InstrumentClass / InstrumentMethod, splicing, accessors
//! interceptor  registry, codegen, invoker helper, groups
//! injector     makes interceptor classes visible to target loaders
//! classfile    class file model, parser and writer
//! sys          raw JNI / JVMTI tables
//! ```

pub mod sys;

pub mod env;
#[doc(hidden)]
pub mod jni_wrapper;
#[doc(hidden)]
pub mod jvmti_wrapper;

pub mod bytecode;
pub mod classfile;
pub mod code_builder;
pub mod descriptor;
pub mod error;
pub mod matcher;

pub mod host;
pub mod injector;
pub mod instrument;
pub mod interceptor;
pub mod runtime;

pub mod agent;
pub mod config;
pub mod dispatcher;
pub mod plugin;

pub mod prelude;

pub use crate::sys::jni;

use std::os::raw::c_char;
use std::sync::OnceLock;

use crate::sys::jvmti;

/// The callbacks a JVMTI agent receives.
///
/// Only `on_load` is required. The other events reach the agent once it
/// enables them through `SetEventNotificationMode`.
pub trait Agent: Sync + Send {
    /// Return `JNI_OK` on success, `JNI_ERR` to abort JVM startup.
    fn on_load(&self, vm: *mut jni::JavaVM, options: &str) -> jni::jint;

    fn on_unload(&self) {}

    /// JNI is fully usable from here on.
    fn vm_init(&self, _jni: *mut jni::JNIEnv, _thread: jni::jthread) {}

    fn vm_death(&self, _jni: *mut jni::JNIEnv) {}

    /// A class file is about to be defined, redefined or retransformed.
    ///
    /// To replace it, allocate the new bytes with JVMTI `Allocate` and store
    /// them in `new_class_data`/`new_class_data_len`. Leaving them untouched
    /// keeps the original.
    #[allow(clippy::too_many_arguments)]
    fn class_file_load_hook(
        &self,
        _jni: *mut jni::JNIEnv,
        _class_being_redefined: jni::jclass,
        _loader: jni::jobject,
        _name: *const c_char,
        _protection_domain: jni::jobject,
        _class_data_len: jni::jint,
        _class_data: *const u8,
        _new_class_data_len: *mut jni::jint,
        _new_class_data: *mut *mut u8,
    ) {
    }
}

#[doc(hidden)]
pub static GLOBAL_AGENT: OnceLock<Box<dyn Agent>> = OnceLock::new();

/// Installs the process-wide agent. Fails if one is already installed.
pub fn set_global_agent(agent: Box<dyn Agent>) -> Result<(), Box<dyn Agent>> {
    GLOBAL_AGENT.set(agent)
}

unsafe extern "system" fn trampoline_vm_init(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv, thread: jni::jthread) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.vm_init(jni, thread);
    }
}

unsafe extern "system" fn trampoline_vm_death(_env: *mut jvmti::jvmtiEnv, jni: *mut jni::JNIEnv) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.vm_death(jni);
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "system" fn trampoline_class_file_load_hook(
    _env: *mut jvmti::jvmtiEnv,
    jni: *mut jni::JNIEnv,
    class_being_redefined: jni::jclass,
    loader: jni::jobject,
    name: *const c_char,
    protection_domain: jni::jobject,
    class_data_len: jni::jint,
    class_data: *const u8,
    new_class_data_len: *mut jni::jint,
    new_class_data: *mut *mut u8,
) {
    if let Some(agent) = GLOBAL_AGENT.get() {
        agent.class_file_load_hook(
            jni,
            class_being_redefined,
            loader,
            name,
            protection_domain,
            class_data_len,
            class_data,
            new_class_data_len,
            new_class_data,
        );
    }
}

/// Callbacks that forward every supported event to [`GLOBAL_AGENT`].
pub fn get_default_callbacks() -> jvmti::jvmtiEventCallbacks {
    jvmti::jvmtiEventCallbacks {
        VMInit: Some(trampoline_vm_init),
        VMDeath: Some(trampoline_vm_death),
        ClassFileLoadHook: Some(trampoline_class_file_load_hook),
        ..Default::default()
    }
}

/// Exports `Agent_OnLoad` and `Agent_OnUnload` for an [`Agent`].
///
/// Use the type form for agents with a `Default` impl, or
/// `export_agent!(factory = f)` to build the agent with a function.
#[macro_export]
macro_rules! export_agent {
    (factory = $factory:expr) => {
        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnLoad(
            vm: *mut $crate::sys::jni::JavaVM,
            options: *mut std::ffi::c_char,
            _reserved: *mut std::ffi::c_void,
        ) -> $crate::sys::jni::jint {
            let agent: Box<dyn $crate::Agent> = Box::new($factory());
            if $crate::set_global_agent(agent).is_err() {
                return $crate::sys::jni::JNI_ERR;
            }

            let options_str = if options.is_null() {
                ""
            } else {
                std::ffi::CStr::from_ptr(options).to_str().unwrap_or("")
            };

            match $crate::GLOBAL_AGENT.get() {
                Some(agent) => agent.on_load(vm, options_str),
                None => $crate::sys::jni::JNI_ERR,
            }
        }

        #[no_mangle]
        pub unsafe extern "system" fn Agent_OnUnload(_vm: *mut $crate::sys::jni::JavaVM) {
            if let Some(agent) = $crate::GLOBAL_AGENT.get() {
                agent.on_unload();
            }
        }
    };
    ($agent_type:ty) => {
        $crate::export_agent!(factory = <$agent_type as ::std::default::Default>::default);
    };
}
