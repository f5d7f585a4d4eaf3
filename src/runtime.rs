//! The Java side of the generated-code ABI.
//!
//! Rewritten classes call two static methods by name. Both are `native` and
//! bound to this crate at VM init, so the classes holding them are generated
//! here rather than shipped as a jar. Renaming anything below breaks every
//! class rewritten before the rename.

use crate::classfile::{
    ClassFile, ClassFileError, ConstantPool, MethodInfo, ACC_FINAL, ACC_NATIVE, ACC_PUBLIC, ACC_STATIC, ACC_SUPER,
};

/// Classes under this package are never transformed.
pub const RUNTIME_PACKAGE: &str = "jvmti/instrument/runtime/";

pub const REGISTRY_CLASS: &str = "jvmti/instrument/runtime/InterceptorRegistry";
pub const FIND_INTERCEPTOR: &str = "findInterceptor";
pub const FIND_INTERCEPTOR_DESC: &str = "(I)Ljava/lang/Object;";

pub const INVOKER_HELPER_CLASS: &str = "jvmti/instrument/runtime/InterceptorInvokerHelper";
pub const HANDLE_EXCEPTION: &str = "handleException";
pub const HANDLE_EXCEPTION_DESC: &str = "(Ljava/lang/Throwable;)V";

/// Java 8, the oldest release whose class files the agent rewrites without
/// falling back to old verifier rules.
const HELPER_MAJOR_VERSION: u16 = 52;

pub fn is_runtime_class(internal_name: &str) -> bool {
    internal_name.starts_with(RUNTIME_PACKAGE)
}

/// `public final class <name>` declaring the given `public static native` methods.
fn native_holder(name: &str, natives: &[(&str, &str)]) -> Result<Vec<u8>, ClassFileError> {
    let mut cp = ConstantPool::new();
    let this_class = cp.class(name)?;
    let super_class = cp.class("java/lang/Object")?;
    let mut methods = Vec::with_capacity(natives.len());
    for (method, descriptor) in natives {
        methods.push(MethodInfo {
            access_flags: ACC_PUBLIC | ACC_STATIC | ACC_NATIVE,
            name_index: cp.utf8(method)?,
            descriptor_index: cp.utf8(descriptor)?,
            attributes: Vec::new(),
        });
    }
    let class = ClassFile {
        minor_version: 0,
        major_version: HELPER_MAJOR_VERSION,
        constant_pool: cp,
        access_flags: ACC_PUBLIC | ACC_FINAL | ACC_SUPER,
        this_class,
        super_class,
        interfaces: Vec::new(),
        fields: Vec::new(),
        methods,
        attributes: Vec::new(),
    };
    class.to_bytes()
}

pub fn registry_class() -> Result<Vec<u8>, ClassFileError> {
    native_holder(REGISTRY_CLASS, &[(FIND_INTERCEPTOR, FIND_INTERCEPTOR_DESC)])
}

pub fn invoker_helper_class() -> Result<Vec<u8>, ClassFileError> {
    native_holder(INVOKER_HELPER_CLASS, &[(HANDLE_EXCEPTION, HANDLE_EXCEPTION_DESC)])
}

/// Every generated helper as `(internal name, class file)`.
pub fn helper_classes() -> Result<Vec<(&'static str, Vec<u8>)>, ClassFileError> {
    Ok(vec![(REGISTRY_CLASS, registry_class()?), (INVOKER_HELPER_CLASS, invoker_helper_class()?)])
}
