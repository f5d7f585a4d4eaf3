//! Safe wrapper around the JNI calls the agent makes.
//!
//! A `JniEnv` is tied to the thread it came from. Host objects that must
//! outlive a callback are held as [`GlobalRef`], which deletes itself through
//! whatever `JNIEnv` the dropping thread has.

use std::ffi::{CStr, CString};
use std::ptr;

use crate::sys::jni;

pub struct JniEnv {
    env: *mut jni::JNIEnv,
}

impl JniEnv {
    /// # Safety
    ///
    /// The pointer must be valid and belong to the current thread.
    pub unsafe fn from_raw(env: *mut jni::JNIEnv) -> Self {
        JniEnv { env }
    }

    /// JNIEnv of the current thread, if it is attached to `vm`.
    ///
    /// # Safety
    ///
    /// `vm` must be the live JavaVM pointer.
    pub unsafe fn current(vm: *mut jni::JavaVM) -> Option<Self> {
        if vm.is_null() {
            return None;
        }
        let mut env: *mut std::ffi::c_void = ptr::null_mut();
        let res = ((**vm).GetEnv)(vm, &mut env, jni::JNI_VERSION_1_8);
        if res != jni::JNI_OK || env.is_null() {
            return None;
        }
        Some(JniEnv { env: env as *mut jni::JNIEnv })
    }

    pub fn raw(&self) -> *mut jni::JNIEnv {
        self.env
    }

    pub fn get_version(&self) -> jni::jint {
        unsafe { ((**self.env).GetVersion)(self.env) }
    }

    // =========================================================================
    // Classes
    // =========================================================================

    /// `name` uses `/` as package separator.
    pub fn find_class(&self, name: &str) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        let cls = unsafe { ((**self.env).FindClass)(self.env, c_name.as_ptr()) };
        if cls.is_null() { None } else { Some(cls) }
    }

    /// Defines a class in `loader`; a null loader is the bootstrap loader.
    pub fn define_class(&self, name: &str, loader: jni::jobject, bytes: &[u8]) -> Option<jni::jclass> {
        let c_name = CString::new(name).ok()?;
        let len = jni::jsize::try_from(bytes.len()).ok()?;
        let cls = unsafe {
            ((**self.env).DefineClass)(self.env, c_name.as_ptr(), loader, bytes.as_ptr() as *const jni::jbyte, len)
        };
        if cls.is_null() { None } else { Some(cls) }
    }

    pub fn get_object_class(&self, obj: jni::jobject) -> jni::jclass {
        unsafe { ((**self.env).GetObjectClass)(self.env, obj) }
    }

    // =========================================================================
    // Exceptions
    // =========================================================================

    pub fn exception_check(&self) -> bool {
        unsafe { ((**self.env).ExceptionCheck)(self.env) != 0 }
    }

    pub fn exception_clear(&self) {
        unsafe { ((**self.env).ExceptionClear)(self.env) }
    }

    pub fn exception_occurred(&self) -> Option<jni::jthrowable> {
        let exc = unsafe { ((**self.env).ExceptionOccurred)(self.env) };
        if exc.is_null() { None } else { Some(exc) }
    }

    /// Clears the pending exception and returns its `toString()`.
    pub fn take_exception(&self) -> Option<String> {
        let exc = self.exception_occurred()?;
        self.exception_clear();
        let description = self.describe(exc);
        self.delete_local_ref(exc);
        Some(description)
    }

    /// `toString()` of any object, or a placeholder if that throws.
    pub fn describe(&self, obj: jni::jobject) -> String {
        if obj.is_null() {
            return "null".to_string();
        }
        let cls = LocalRef::new(self, self.get_object_class(obj));
        let Some(to_string) = self.get_method_id(cls.get(), "toString", "()Ljava/lang/String;") else {
            self.exception_clear();
            return "<no toString>".to_string();
        };
        let text = LocalRef::new(self, self.call_object_method(obj, to_string, &[]));
        if self.exception_check() {
            self.exception_clear();
            return "<toString threw>".to_string();
        }
        self.get_string_utf(text.get()).unwrap_or_else(|| "null".to_string())
    }

    // =========================================================================
    // Strings and arrays
    // =========================================================================

    pub fn new_string_utf(&self, s: &str) -> Option<jni::jstring> {
        let c_str = CString::new(s).ok()?;
        let jstr = unsafe { ((**self.env).NewStringUTF)(self.env, c_str.as_ptr()) };
        if jstr.is_null() { None } else { Some(jstr) }
    }

    /// `None` for a null string or one that is not valid UTF-8.
    pub fn get_string_utf(&self, s: jni::jstring) -> Option<String> {
        if s.is_null() {
            return None;
        }
        unsafe {
            let chars = ((**self.env).GetStringUTFChars)(self.env, s, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let result = CStr::from_ptr(chars).to_str().ok().map(str::to_string);
            ((**self.env).ReleaseStringUTFChars)(self.env, s, chars);
            result
        }
    }

    /// Copies a `byte[]` out of the heap.
    pub fn read_byte_array(&self, array: jni::jbyteArray) -> Vec<u8> {
        if array.is_null() {
            return Vec::new();
        }
        unsafe {
            let len = ((**self.env).GetArrayLength)(self.env, array).max(0);
            let mut buf = vec![0u8; len as usize];
            ((**self.env).GetByteArrayRegion)(self.env, array, 0, len, buf.as_mut_ptr() as *mut jni::jbyte);
            buf
        }
    }

    // =========================================================================
    // Methods and objects
    // =========================================================================

    pub fn get_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        let mid = unsafe { ((**self.env).GetMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr()) };
        if mid.is_null() { None } else { Some(mid) }
    }

    pub fn get_static_method_id(&self, cls: jni::jclass, name: &str, sig: &str) -> Option<jni::jmethodID> {
        let c_name = CString::new(name).ok()?;
        let c_sig = CString::new(sig).ok()?;
        let mid = unsafe { ((**self.env).GetStaticMethodID)(self.env, cls, c_name.as_ptr(), c_sig.as_ptr()) };
        if mid.is_null() { None } else { Some(mid) }
    }

    pub fn new_object(&self, cls: jni::jclass, method_id: jni::jmethodID, args: &[jni::jvalue]) -> Option<jni::jobject> {
        let obj = unsafe { ((**self.env).NewObjectA)(self.env, cls, method_id, args.as_ptr()) };
        if obj.is_null() { None } else { Some(obj) }
    }

    pub fn call_object_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) -> jni::jobject {
        unsafe { ((**self.env).CallObjectMethodA)(self.env, obj, method_id, args.as_ptr()) }
    }

    pub fn call_void_method(&self, obj: jni::jobject, method_id: jni::jmethodID, args: &[jni::jvalue]) {
        unsafe { ((**self.env).CallVoidMethodA)(self.env, obj, method_id, args.as_ptr()) }
    }

    pub fn call_static_object_method(
        &self,
        cls: jni::jclass,
        method_id: jni::jmethodID,
        args: &[jni::jvalue],
    ) -> jni::jobject {
        unsafe { ((**self.env).CallStaticObjectMethodA)(self.env, cls, method_id, args.as_ptr()) }
    }

    pub fn register_natives(&self, cls: jni::jclass, methods: &[jni::JNINativeMethod]) -> Result<(), jni::jint> {
        let result =
            unsafe { ((**self.env).RegisterNatives)(self.env, cls, methods.as_ptr(), methods.len() as jni::jint) };
        if result == jni::JNI_OK { Ok(()) } else { Err(result) }
    }

    // =========================================================================
    // References
    // =========================================================================

    pub fn is_same_object(&self, ref1: jni::jobject, ref2: jni::jobject) -> bool {
        unsafe { ((**self.env).IsSameObject)(self.env, ref1, ref2) != 0 }
    }

    pub fn new_global_ref(&self, obj: jni::jobject) -> jni::jobject {
        unsafe { ((**self.env).NewGlobalRef)(self.env, obj) }
    }

    pub fn delete_global_ref(&self, obj: jni::jobject) {
        unsafe { ((**self.env).DeleteGlobalRef)(self.env, obj) }
    }

    pub fn new_local_ref(&self, obj: jni::jobject) -> jni::jobject {
        unsafe { ((**self.env).NewLocalRef)(self.env, obj) }
    }

    pub fn delete_local_ref(&self, obj: jni::jobject) {
        unsafe { ((**self.env).DeleteLocalRef)(self.env, obj) }
    }

    pub fn new_weak_global_ref(&self, obj: jni::jobject) -> jni::jweak {
        unsafe { ((**self.env).NewWeakGlobalRef)(self.env, obj) }
    }

    pub fn delete_weak_global_ref(&self, obj: jni::jweak) {
        unsafe { ((**self.env).DeleteWeakGlobalRef)(self.env, obj) }
    }

    /// Runs `f` inside a local frame, so every local reference it creates is
    /// released on return.
    pub fn with_local_frame<T>(&self, capacity: jni::jint, f: impl FnOnce(&JniEnv) -> T) -> Option<T> {
        let pushed = unsafe { ((**self.env).PushLocalFrame)(self.env, capacity) };
        if pushed != jni::JNI_OK {
            self.exception_clear();
            return None;
        }
        let result = f(self);
        unsafe { ((**self.env).PopLocalFrame)(self.env, ptr::null_mut()) };
        Some(result)
    }
}

/// Deletes a local reference when dropped.
pub struct LocalRef<'a> {
    env: &'a JniEnv,
    obj: jni::jobject,
}

impl<'a> LocalRef<'a> {
    pub fn new(env: &'a JniEnv, obj: jni::jobject) -> Self {
        LocalRef { env, obj }
    }

    pub fn get(&self) -> jni::jobject {
        self.obj
    }

    pub fn is_null(&self) -> bool {
        self.obj.is_null()
    }
}

impl Drop for LocalRef<'_> {
    fn drop(&mut self) {
        if !self.obj.is_null() {
            self.env.delete_local_ref(self.obj);
        }
    }
}

/// A JNI global reference that can cross threads.
///
/// Deleting a global reference needs a `JNIEnv`, so the reference remembers
/// the `JavaVM` and asks it for the dropping thread's environment. A thread
/// the VM does not know leaks the reference rather than crash.
pub struct GlobalRef {
    vm: *mut jni::JavaVM,
    obj: jni::jobject,
}

// Global references are valid on every thread; the JavaVM pointer is
// process-wide.
unsafe impl Send for GlobalRef {}
unsafe impl Sync for GlobalRef {}

impl GlobalRef {
    /// # Safety
    ///
    /// `vm` must be the live JavaVM and `local_obj` a valid reference on
    /// `env`'s thread.
    pub unsafe fn new(vm: *mut jni::JavaVM, env: &JniEnv, local_obj: jni::jobject) -> Option<Self> {
        let obj = env.new_global_ref(local_obj);
        if obj.is_null() { None } else { Some(GlobalRef { vm, obj }) }
    }

    pub fn get(&self) -> jni::jobject {
        self.obj
    }
}

impl Drop for GlobalRef {
    fn drop(&mut self) {
        if self.obj.is_null() {
            return;
        }
        if let Some(env) = unsafe { JniEnv::current(self.vm) } {
            env.delete_global_ref(self.obj);
        }
    }
}

impl std::fmt::Debug for GlobalRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GlobalRef({:p})", self.obj)
    }
}
