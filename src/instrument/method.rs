use crate::classfile::ACC_STATIC;
use crate::descriptor::{JavaType, MethodType};
use crate::error::InstrumentError;
use crate::interceptor::{InterceptorId, InterceptorManifest};

use super::{InstrumentClass, MethodDescriptor};

/// One method of an [`InstrumentClass`], borrowed for mutation.
pub struct InstrumentMethod<'a> {
    class: &'a mut InstrumentClass,
    index: usize,
    name: String,
    method_type: MethodType,
}

impl<'a> InstrumentMethod<'a> {
    pub(super) fn new(class: &'a mut InstrumentClass, index: usize, name: String, method_type: MethodType) -> Self {
        Self { class, index, name, method_type }
    }

    pub fn get_name(&self) -> &str {
        &self.name
    }

    pub fn get_descriptor(&self) -> String {
        self.method_type.descriptor()
    }

    /// Java names of the parameters, e.g. `["int", "java.lang.String"]`.
    pub fn get_parameter_types(&self) -> Vec<String> {
        self.method_type.params.iter().map(JavaType::java_name).collect()
    }

    pub fn get_return_type(&self) -> String {
        self.method_type.ret.java_name()
    }

    pub fn get_modifiers(&self) -> u16 {
        self.class.method_access(self.index)
    }

    pub fn is_static(&self) -> bool {
        self.get_modifiers() & ACC_STATIC != 0
    }

    pub fn is_constructor(&self) -> bool {
        self.name == "<init>"
    }

    pub fn descriptor(&self) -> MethodDescriptor {
        MethodDescriptor {
            declaring_class: self.class.get_name(),
            name: self.name.clone(),
            parameter_types: self.get_parameter_types(),
        }
    }

    /// Registers a new interceptor instance and wraps this method with its
    /// trampolines. The splice itself happens in
    /// [`InstrumentClass::to_bytes`].
    pub fn add_interceptor(&mut self, manifest: &InterceptorManifest) -> Result<InterceptorId, InstrumentError> {
        self.class.intercept(self.index, manifest, None)
    }

    /// Wraps this method with an interceptor that is already registered.
    pub fn add_registered_interceptor(
        &mut self,
        manifest: &InterceptorManifest,
        id: InterceptorId,
    ) -> Result<InterceptorId, InstrumentError> {
        self.class.intercept(self.index, manifest, Some(id))
    }
}
