//! Raw JNI and JVMTI declarations.
//!
//! Only the function table slots the agent calls are typed. Every other slot
//! is an untyped pointer kept for layout, so indices still match `jni.h` and
//! `jvmti.h`.

pub mod jni;
pub mod jvmti;
