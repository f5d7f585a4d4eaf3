// Raw JVMTI declarations for the instrumentation agent.
//
// Slot numbers follow jvmti.h, where the table is 1-based and slot 1 is
// reserved. The table stops at RetransformClasses (slot 152).

#![allow(non_upper_case_globals)]
#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::fmt;
use std::os::raw::{c_char, c_uchar, c_void};

use crate::sys::jni::{jclass, jint, jlong, jobject, jthread, JNIEnv};

pub const JVMTI_VERSION_1_2: jint = 0x30010200;

pub const JVMTI_EVENT_VM_INIT: u32 = 50;
pub const JVMTI_EVENT_VM_DEATH: u32 = 51;
pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: u32 = 54;

pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;

/// `jvmtiError`. A newtype rather than an enum: the JVM may return codes
/// this crate does not list.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct jvmtiError(pub u32);

impl jvmtiError {
    pub const NONE: jvmtiError = jvmtiError(0);
    pub const INVALID_CLASS: jvmtiError = jvmtiError(21);
    pub const UNMODIFIABLE_CLASS: jvmtiError = jvmtiError(79);
    pub const NOT_AVAILABLE: jvmtiError = jvmtiError(98);
    pub const MUST_POSSESS_CAPABILITY: jvmtiError = jvmtiError(99);
    pub const NULL_POINTER: jvmtiError = jvmtiError(100);
    pub const WRONG_PHASE: jvmtiError = jvmtiError(112);

    pub fn name(self) -> &'static str {
        match self {
            Self::NONE => "NONE",
            Self::INVALID_CLASS => "INVALID_CLASS",
            Self::UNMODIFIABLE_CLASS => "UNMODIFIABLE_CLASS",
            Self::NOT_AVAILABLE => "NOT_AVAILABLE",
            Self::MUST_POSSESS_CAPABILITY => "MUST_POSSESS_CAPABILITY",
            Self::NULL_POINTER => "NULL_POINTER",
            Self::WRONG_PHASE => "WRONG_PHASE",
            _ => "UNKNOWN",
        }
    }
}

impl fmt::Display for jvmtiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "JVMTI_ERROR_{}({})", self.name(), self.0)
    }
}

impl std::error::Error for jvmtiError {}

#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct jvmtiCapabilities {
    bits: [u32; 4],
}

impl jvmtiCapabilities {
    fn set_bit(&mut self, bit_offset: usize, value: bool) {
        let word_index = bit_offset / 32;
        let bit_index = bit_offset % 32;
        if value {
            self.bits[word_index] |= 1 << bit_index;
        } else {
            self.bits[word_index] &= !(1 << bit_index);
        }
    }

    fn get_bit(&self, bit_offset: usize) -> bool {
        (self.bits[bit_offset / 32] & (1 << (bit_offset % 32))) != 0
    }

    // [26]
    pub fn can_generate_all_class_hook_events(&self) -> bool { self.get_bit(26) }
    pub fn set_can_generate_all_class_hook_events(&mut self, v: bool) { self.set_bit(26, v); }

    // [37]
    pub fn can_retransform_classes(&self) -> bool { self.get_bit(37) }
    pub fn set_can_retransform_classes(&mut self, v: bool) { self.set_bit(37, v); }

    // [38]
    pub fn can_retransform_any_class(&self) -> bool { self.get_bit(38) }
    pub fn set_can_retransform_any_class(&mut self, v: bool) { self.set_bit(38, v); }
}

pub type JvmtiSetEventNotificationModeFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, mode: jint, event_type: u32, event_thread: jthread) -> jvmtiError;
pub type JvmtiAllocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, size: jlong, mem_ptr: *mut *mut c_uchar) -> jvmtiError;
pub type JvmtiDeallocateFn = unsafe extern "system" fn(env: *mut jvmtiEnv, mem: *mut c_uchar) -> jvmtiError;
pub type JvmtiSetEventCallbacksFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, callbacks: *const jvmtiEventCallbacks, size_of_callbacks: jint) -> jvmtiError;
pub type JvmtiGetSystemPropertyFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, property: *const c_char, value_ptr: *mut *mut c_char) -> jvmtiError;
pub type JvmtiAddCapabilitiesFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, capabilities_ptr: *const jvmtiCapabilities) -> jvmtiError;
pub type JvmtiRetransformClassesFn =
    unsafe extern "system" fn(env: *mut jvmtiEnv, class_count: jint, classes: *const jclass) -> jvmtiError;

type Slot = *mut c_void;

#[repr(C)]
pub struct jvmtiInterface_1_ {
    /*   1: RESERVED */
    _1: Slot,
    /*   2 */
    pub SetEventNotificationMode: Option<JvmtiSetEventNotificationModeFn>,
    _3_45: [Slot; 43],
    /*  46, 47 */
    pub Allocate: Option<JvmtiAllocateFn>,
    pub Deallocate: Option<JvmtiDeallocateFn>,
    _48_121: [Slot; 74],
    /* 122 */
    pub SetEventCallbacks: Option<JvmtiSetEventCallbacksFn>,
    _123_130: [Slot; 8],
    /* 131 */
    pub GetSystemProperty: Option<JvmtiGetSystemPropertyFn>,
    _132_141: [Slot; 10],
    /* 142 */
    pub AddCapabilities: Option<JvmtiAddCapabilitiesFn>,
    _143_151: [Slot; 9],
    /* 152 */
    pub RetransformClasses: Option<JvmtiRetransformClassesFn>,
}

#[repr(C)]
pub struct jvmtiEnv {
    pub functions: *const jvmtiInterface_1_,
}

pub type JvmtiVMInitFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv, thread: jthread);

pub type JvmtiVMDeathFn = unsafe extern "system" fn(jvmti_env: *mut jvmtiEnv, jni_env: *mut JNIEnv);

pub type JvmtiClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti_env: *mut jvmtiEnv,
    jni_env: *mut JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const c_uchar,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut c_uchar,
);

/// Leading part of `jvmtiEventCallbacks`, up to `ClassFileLoadHook`.
/// `SetEventCallbacks` takes the struct size, and the JVM clears every
/// callback past it.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct jvmtiEventCallbacks {
    pub VMInit: Option<JvmtiVMInitFn>,
    pub VMDeath: Option<JvmtiVMDeathFn>,
    pub _ThreadStart: Option<unsafe extern "system" fn()>,
    pub _ThreadEnd: Option<unsafe extern "system" fn()>,
    pub ClassFileLoadHook: Option<JvmtiClassFileLoadHookFn>,
}
