//! Environment wrappers for JVMTI and JNI.
//!
//! [`Jvmti`] is process-wide and may be shared between threads. [`JniEnv`]
//! belongs to one thread; code running off a JVMTI callback gets its own
//! with [`JniEnv::current`]. References that outlive a callback are
//! [`GlobalRef`]s, and [`LocalRef`] releases a local reference on drop:
//!
//! ```rust,ignore
//! fn loader_name(env: &JniEnv, loader: jni::jobject) -> String {
//!     let class = LocalRef::new(env, env.get_object_class(loader));
//!     env.describe(class.get())
//! }
//! ```

pub use crate::jni_wrapper::{GlobalRef, JniEnv, LocalRef};
pub use crate::jvmti_wrapper::Jvmti;
