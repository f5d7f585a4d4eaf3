use std::ffi::{CStr, CString};
use std::ptr;

use crate::sys::jni;
use crate::sys::jvmti;

/// Resolves a function table slot, reporting a missing one as
/// `NOT_AVAILABLE` instead of calling through null.
macro_rules! jvmti_fn {
    ($env:expr, $name:ident) => {
        match (*(*$env).functions).$name {
            Some(f) => f,
            None => return Err(jvmti::jvmtiError::NOT_AVAILABLE),
        }
    };
}

/// A safe wrapper around the raw JVMTI environment pointer.
pub struct Jvmti {
    env: *mut jvmti::jvmtiEnv,
}

// A JVMTI environment may be used from any thread.
unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Connects to the JVM and retrieves a JVMTI environment.
    pub fn new(vm: *mut jni::JavaVM) -> Result<Self, jni::jint> {
        if vm.is_null() {
            return Err(jni::JNI_ERR);
        }
        let mut env_ptr: *mut std::ffi::c_void = ptr::null_mut();
        let res = unsafe { ((**vm).GetEnv)(vm, &mut env_ptr, jvmti::JVMTI_VERSION_1_2) };
        if res != jni::JNI_OK || env_ptr.is_null() {
            return Err(if res == jni::JNI_OK { jni::JNI_ERR } else { res });
        }
        Ok(Jvmti { env: env_ptr as *mut jvmti::jvmtiEnv })
    }

    /// # Safety
    /// The pointer must stay valid for as long as the wrapper is used.
    pub unsafe fn from_raw(env: *mut jvmti::jvmtiEnv) -> Self {
        Jvmti { env }
    }

    pub fn raw(&self) -> *mut jvmti::jvmtiEnv {
        self.env
    }

    pub fn add_capabilities(&self, new_caps: &jvmti::jvmtiCapabilities) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let add_caps_fn = jvmti_fn!(self.env, AddCapabilities);
            let err = add_caps_fn(self.env, new_caps);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn set_event_callbacks(&self, callbacks: jvmti::jvmtiEventCallbacks) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let set_callbacks_fn = jvmti_fn!(self.env, SetEventCallbacks);
            let size = std::mem::size_of::<jvmti::jvmtiEventCallbacks>() as jni::jint;
            let err = set_callbacks_fn(self.env, &callbacks, size);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
        }
        Ok(())
    }

    /// `thread` null means all threads.
    pub fn set_event_notification_mode(
        &self,
        enable: bool,
        event_type: u32,
        thread: jni::jthread,
    ) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let set_mode_fn = jvmti_fn!(self.env, SetEventNotificationMode);
            let mode = if enable { jvmti::JVMTI_ENABLE } else { jvmti::JVMTI_DISABLE };
            let err = set_mode_fn(self.env, mode, event_type, thread);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn allocate(&self, size: jni::jlong) -> Result<*mut u8, jvmti::jvmtiError> {
        let mut mem_ptr: *mut u8 = ptr::null_mut();
        unsafe {
            let allocate_fn = jvmti_fn!(self.env, Allocate);
            let err = allocate_fn(self.env, size, &mut mem_ptr);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
        }
        Ok(mem_ptr)
    }

    pub fn deallocate(&self, mem: *mut u8) -> Result<(), jvmti::jvmtiError> {
        if mem.is_null() {
            return Ok(());
        }
        unsafe {
            let deallocate_fn = jvmti_fn!(self.env, Deallocate);
            let err = deallocate_fn(self.env, mem);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
        }
        Ok(())
    }

    /// Copies `bytes` into JVMTI-allocated memory, which is what
    /// `ClassFileLoadHook` must hand back. The JVM frees it.
    pub fn copy_out(&self, bytes: &[u8]) -> Result<(*mut u8, jni::jint), jvmti::jvmtiError> {
        let len = jni::jint::try_from(bytes.len()).map_err(|_| jvmti::jvmtiError::NOT_AVAILABLE)?;
        let mem = self.allocate(len as jni::jlong)?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok((mem, len))
    }

    pub fn retransform_classes(&self, classes: &[jni::jclass]) -> Result<(), jvmti::jvmtiError> {
        unsafe {
            let retransform_fn = jvmti_fn!(self.env, RetransformClasses);
            let err = retransform_fn(self.env, classes.len() as jni::jint, classes.as_ptr());
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
        }
        Ok(())
    }

    pub fn get_system_property(&self, property: &str) -> Result<String, jvmti::jvmtiError> {
        let c_property = CString::new(property).map_err(|_| jvmti::jvmtiError::NULL_POINTER)?;
        let mut value_ptr: *mut std::os::raw::c_char = ptr::null_mut();
        unsafe {
            let get_fn = jvmti_fn!(self.env, GetSystemProperty);
            let err = get_fn(self.env, c_property.as_ptr(), &mut value_ptr);
            if err != jvmti::jvmtiError::NONE {
                return Err(err);
            }
            let value = CStr::from_ptr(value_ptr).to_string_lossy().into_owned();
            self.deallocate(value_ptr as *mut u8)?;
            Ok(value)
        }
    }
}
