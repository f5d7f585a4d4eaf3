//! Mutable view of one class file.
//!
//! Plugins find methods and fields, request accessors and interceptors, and
//! finally call [`InstrumentClass::to_bytes`]. Interceptors are recorded when
//! added and spliced into method bodies only at `to_bytes`, always starting
//! from the original code, so the order of requests never changes the result
//! beyond the order of the interceptor calls.

pub mod accessor;
pub mod filter;
pub mod method;
mod splice;

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::classfile::{
    Attribute, ClassFile, CodeAttribute, FieldInfo, ACC_ABSTRACT, ACC_NATIVE, ACC_PRIVATE, ACC_STATIC,
    ACC_TRANSIENT, STACK_MAP_MAJOR_VERSION,
};
use crate::descriptor::{internal_to_java_name, parse_java_names, JavaType, MethodType};
use crate::error::{IllegalStateError, InstrumentError};
use crate::host::{ClassLoaderRef, InstrumentHost};
use crate::interceptor::{check_manifest, InterceptorId, InterceptorManifest, InvokeCodeGenerator, TargetMethod, Trampoline};

pub use accessor::{Accessor, Getter};
pub use filter::{ClassFilter, ClassFilters};
pub use method::InstrumentMethod;

/// Static interface methods need Java 8 class files.
const INTERFACE_STATIC_MAJOR_VERSION: u16 = 52;

/// Declaring type, name and parameter list of a method, all as Java names.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodDescriptor {
    pub declaring_class: String,
    pub name: String,
    pub parameter_types: Vec<String>,
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.declaring_class, self.name, self.parameter_types.join(", "))
    }
}

#[derive(Debug)]
struct Interception {
    before: Option<Trampoline>,
    after: Option<Trampoline>,
}

pub struct InstrumentClass {
    class: ClassFile,
    name: String,
    loader: ClassLoaderRef,
    host: InstrumentHost,
    /// Keyed by method index, in registration order.
    interceptions: BTreeMap<usize, Vec<Interception>>,
    next_sequence: usize,
    emitted: bool,
}

impl fmt::Debug for InstrumentClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstrumentClass")
            .field("name", &self.name)
            .field("loader", &self.loader)
            .field("interceptions", &self.interceptions.len())
            .field("emitted", &self.emitted)
            .finish()
    }
}

impl InstrumentClass {
    pub fn parse(host: InstrumentHost, loader: ClassLoaderRef, bytes: &[u8]) -> Result<Self, InstrumentError> {
        let class = ClassFile::parse(bytes)?;
        let name = class.this_class_name()?.to_string();
        Ok(Self {
            class,
            name,
            loader,
            host,
            interceptions: BTreeMap::new(),
            next_sequence: 0,
            emitted: false,
        })
    }

    /// Java name, e.g. `com.example.Foo$1`.
    pub fn get_name(&self) -> String {
        internal_to_java_name(&self.name)
    }

    pub fn internal_name(&self) -> &str {
        &self.name
    }

    pub fn loader(&self) -> &ClassLoaderRef {
        &self.loader
    }

    pub fn major_version(&self) -> u16 {
        self.class.major_version
    }

    pub fn get_super_class(&self) -> Result<Option<String>, InstrumentError> {
        Ok(self.class.super_class_name()?.map(internal_to_java_name))
    }

    pub fn get_interfaces(&self) -> Result<Vec<String>, InstrumentError> {
        Ok(self.class.interface_names()?.into_iter().map(internal_to_java_name).collect())
    }

    pub fn is_interface(&self) -> bool {
        self.class.is_interface()
    }

    pub(crate) fn implements(&self, internal_name: &str) -> bool {
        self.class
            .interface_names()
            .map(|names| names.iter().any(|n| *n == internal_name))
            .unwrap_or(false)
    }

    /// `(class, method name, method type)` of the method this class is
    /// declared in, for local and anonymous classes.
    pub fn enclosing_method(&self) -> Result<Option<(String, String, MethodType)>, InstrumentError> {
        let Some(em) = self.class.enclosing_method()? else {
            return Ok(None);
        };
        if em.method_index == 0 {
            return Ok(None);
        }
        let cp = &self.class.constant_pool;
        let class = cp.class_name(em.class_index)?.to_string();
        let (name, descriptor) = cp.name_and_type(em.method_index)?;
        Ok(Some((class, name.to_string(), MethodType::parse(descriptor)?)))
    }

    fn method_signature(&self, index: usize) -> Option<(&str, MethodType)> {
        let m = self.class.methods.get(index)?;
        let cp = &self.class.constant_pool;
        let name = cp.get_utf8(m.name_index).ok()?;
        let method_type = MethodType::parse(cp.get_utf8(m.descriptor_index).ok()?).ok()?;
        Some((name, method_type))
    }

    pub(crate) fn method_access(&self, index: usize) -> u16 {
        self.class.methods.get(index).map_or(0, |m| m.access_flags)
    }

    fn find_method(&self, name: &str, params: &[JavaType]) -> Option<usize> {
        (0..self.class.methods.len()).find(|&i| {
            self.method_signature(i)
                .map_or(false, |(n, ty)| n == name && ty.params == params)
        })
    }

    fn method_view(&mut self, index: Option<usize>) -> Option<InstrumentMethod<'_>> {
        let index = index?;
        let (name, method_type) = self.method_signature(index)?;
        let name = name.to_string();
        Some(InstrumentMethod::new(self, index, name, method_type))
    }

    /// Methods other than constructors and static initializers.
    pub fn get_declared_methods(&self) -> Vec<MethodDescriptor> {
        let declaring_class = self.get_name();
        (0..self.class.methods.len())
            .filter_map(|i| self.method_signature(i))
            .filter(|(name, _)| !name.starts_with('<'))
            .map(|(name, ty)| MethodDescriptor {
                declaring_class: declaring_class.clone(),
                name: name.to_string(),
                parameter_types: ty.params.iter().map(JavaType::java_name).collect(),
            })
            .collect()
    }

    /// `params` are Java names such as `int` or `java.lang.String`.
    pub fn get_declared_method(
        &mut self,
        name: &str,
        params: &[&str],
    ) -> Result<Option<InstrumentMethod<'_>>, InstrumentError> {
        let params = parse_java_names(params)?;
        let index = self.find_method(name, &params);
        Ok(self.method_view(index))
    }

    pub fn has_declared_method(&self, name: &str, params: &[&str]) -> bool {
        parse_java_names(params).map_or(false, |p| self.find_method(name, &p).is_some())
    }

    pub fn get_constructor(&mut self, params: &[&str]) -> Result<Option<InstrumentMethod<'_>>, InstrumentError> {
        self.get_declared_method("<init>", params)
    }

    pub fn has_constructor(&self, params: &[&str]) -> bool {
        self.has_declared_method("<init>", params)
    }

    fn find_field(&self, name: &str) -> Option<&FieldInfo> {
        let cp = &self.class.constant_pool;
        self.class
            .fields
            .iter()
            .find(|f| cp.get_utf8(f.name_index).map_or(false, |n| n == name))
    }

    /// `ty` is a Java type name; `None` matches any type.
    pub fn has_field(&self, name: &str, ty: Option<&str>) -> bool {
        let Some(field) = self.find_field(name) else {
            return false;
        };
        match ty {
            None => true,
            Some(ty) => match (JavaType::from_java_name(ty), self.class.constant_pool.get_utf8(field.descriptor_index)) {
                (Ok(ty), Ok(descriptor)) => ty.descriptor() == descriptor,
                _ => false,
            },
        }
    }

    fn ensure_mutable(&self) -> Result<(), IllegalStateError> {
        if self.emitted {
            return Err(IllegalStateError::new(format!("{} was already converted to bytes", self.get_name())));
        }
        Ok(())
    }

    /// Adds the accessor's field, getter and setter and makes the class
    /// implement its interface. Does nothing if it already does.
    pub fn add_field(&mut self, accessor: &Accessor) -> Result<(), InstrumentError> {
        self.ensure_mutable()?;
        if self.implements(accessor.interface()) {
            return Ok(());
        }
        if self.is_interface() {
            return Err(InstrumentError::Unsupported(format!("cannot add a field to interface {}", self.get_name())));
        }
        let field_name = accessor.field_name();
        if self.find_field(&field_name).is_some() {
            return Err(InstrumentError::Unsupported(format!("{} already declares {field_name}", self.get_name())));
        }
        let ty = accessor.field_type();
        let cp = &mut self.class.constant_pool;
        let field = FieldInfo {
            access_flags: ACC_PRIVATE | ACC_TRANSIENT,
            name_index: cp.utf8(&field_name)?,
            descriptor_index: cp.utf8(&ty.descriptor())?,
            attributes: Vec::new(),
        };
        let getter = accessor::getter_method(cp, &self.name, &accessor.getter_name(), &field_name, ty)?;
        let setter = accessor::setter_method(cp, &self.name, &accessor.setter_name(), &field_name, ty)?;
        let interface = cp.class(accessor.interface())?;
        self.class.fields.push(field);
        self.class.methods.push(getter);
        self.class.methods.push(setter);
        self.class.interfaces.push(interface);
        log::debug!("added accessor {} to {}", internal_to_java_name(accessor.interface()), self.get_name());
        Ok(())
    }

    /// Exposes an existing instance field through `getter`.
    pub fn add_getter(&mut self, getter: &Getter, field_name: &str) -> Result<(), InstrumentError> {
        self.ensure_mutable()?;
        if self.implements(getter.interface()) {
            return Ok(());
        }
        let Some(field) = self.find_field(field_name) else {
            return Err(InstrumentError::not_found("field", format!("{}.{field_name}", self.get_name())));
        };
        if field.access_flags & ACC_STATIC != 0 {
            return Err(InstrumentError::Unsupported(format!("{}.{field_name} is static", self.get_name())));
        }
        let declared = self.class.constant_pool.get_utf8(field.descriptor_index)?;
        let expected = getter.field_type().descriptor();
        if declared != expected {
            return Err(InstrumentError::Unsupported(format!(
                "{}.{field_name} is {declared}, getter returns {expected}",
                self.get_name()
            )));
        }
        let cp = &mut self.class.constant_pool;
        let method = accessor::getter_method(cp, &self.name, getter.method_name(), field_name, getter.field_type())?;
        let interface = cp.class(getter.interface())?;
        self.class.methods.push(method);
        self.class.interfaces.push(interface);
        Ok(())
    }

    /// Applies one interceptor instance to every method the manifest targets.
    pub fn add_interceptor(&mut self, manifest: &InterceptorManifest) -> Result<InterceptorId, InstrumentError> {
        self.ensure_mutable()?;
        if manifest.targets().is_empty() {
            return Err(InstrumentError::Unsupported(format!("{} declares no target methods", manifest.type_name())));
        }
        let mut indices = Vec::new();
        for selector in manifest.targets() {
            let params = match &selector.params {
                Some(names) => {
                    let names: Vec<&str> = names.iter().map(String::as_str).collect();
                    Some(parse_java_names(&names)?)
                }
                None => None,
            };
            for i in 0..self.class.methods.len() {
                let Some((name, ty)) = self.method_signature(i) else { continue };
                let params_match = params.as_ref().map_or(true, |p| *p == ty.params);
                if name == selector.name && params_match && !indices.contains(&i) {
                    indices.push(i);
                }
            }
        }
        if indices.is_empty() {
            return Err(InstrumentError::not_found(
                "method",
                format!("{} targets of {}", self.get_name(), manifest.type_name()),
            ));
        }
        let mut targets = Vec::with_capacity(indices.len());
        for index in indices {
            targets.push((index, self.target_method(index)?));
        }
        check_manifest(manifest)?;
        let id = self.register(manifest)?;
        for (index, target) in targets {
            self.apply_interceptor(index, &target, manifest, id)?;
        }
        Ok(id)
    }

    fn register(&self, manifest: &InterceptorManifest) -> Result<InterceptorId, InstrumentError> {
        let instance = self.host.factory().create(&self.loader, manifest)?;
        self.host.registry().register(manifest, instance)
    }

    /// Registers `manifest` unless `id` is given. Nothing is registered when
    /// the method or the manifest cannot be intercepted.
    pub(crate) fn intercept(
        &mut self,
        index: usize,
        manifest: &InterceptorManifest,
        id: Option<InterceptorId>,
    ) -> Result<InterceptorId, InstrumentError> {
        self.ensure_mutable()?;
        let target = self.target_method(index)?;
        check_manifest(manifest)?;
        let id = match id {
            Some(id) => id,
            None => self.register(manifest)?,
        };
        self.apply_interceptor(index, &target, manifest, id)?;
        Ok(id)
    }

    fn target_method(&self, index: usize) -> Result<TargetMethod, InstrumentError> {
        let access = self.method_access(index);
        let Some((name, method_type)) = self.method_signature(index) else {
            return Err(InstrumentError::not_found("method", format!("#{index} of {}", self.get_name())));
        };
        let name = name.to_string();
        if access & (ACC_ABSTRACT | ACC_NATIVE) != 0 {
            return Err(InstrumentError::Unsupported(format!(
                "{}.{name} has no body to intercept",
                self.get_name()
            )));
        }
        if name == "<clinit>" {
            return Err(InstrumentError::Unsupported("static initializers cannot be intercepted".to_string()));
        }
        if self.is_interface() && self.major_version() < INTERFACE_STATIC_MAJOR_VERSION {
            return Err(InstrumentError::Unsupported(format!(
                "interface {} predates static interface methods",
                self.get_name()
            )));
        }
        Ok(TargetMethod {
            declaring_class: self.name.clone(),
            class_is_interface: self.is_interface(),
            name,
            method_type,
            is_static: access & ACC_STATIC != 0,
        })
    }

    fn apply_interceptor(
        &mut self,
        index: usize,
        target: &TargetMethod,
        manifest: &InterceptorManifest,
        id: InterceptorId,
    ) -> Result<(), InstrumentError> {
        let generator = InvokeCodeGenerator::new(id, manifest, target, self.next_sequence);
        let interception = Interception { before: generator.before()?, after: generator.after()? };
        self.next_sequence += 1;
        for trampoline in interception.before.iter().chain(interception.after.iter()) {
            if log::log_enabled!(log::Level::Debug) {
                log::debug!("{}.{}: {}", self.get_name(), trampoline.method_name, trampoline.render_source()?);
            }
        }
        self.interceptions.entry(index).or_default().push(interception);
        Ok(())
    }

    /// Classes declared inside this one whose class files the host can
    /// locate and that `filter` accepts.
    pub fn get_nested_classes(&self, filter: &dyn ClassFilter) -> Result<Vec<InstrumentClass>, InstrumentError> {
        let cp = &self.class.constant_pool;
        let own_prefix = format!("{}$", self.name);
        let mut seen = HashSet::new();
        let mut nested = Vec::new();
        for info in self.class.inner_classes()? {
            let inner = cp.class_name(info.inner_class_info_index)?;
            let declared_here = if info.outer_class_info_index != 0 {
                cp.class_name(info.outer_class_info_index)? == self.name
            } else {
                inner.starts_with(&own_prefix)
            };
            if inner == self.name || !declared_here || !seen.insert(inner.to_string()) {
                continue;
            }
            let Some(bytes) = self.host.locator().locate(&self.loader, inner)? else {
                log::debug!("class file of nested class {inner} not found in {}", self.loader);
                continue;
            };
            let class = InstrumentClass::parse(self.host.clone(), self.loader.clone(), &bytes)?;
            if filter.accept(&class) {
                nested.push(class);
            }
        }
        Ok(nested)
    }

    pub fn interceptor_count(&self) -> usize {
        self.interceptions.values().map(Vec::len).sum()
    }

    /// Serializes the class with every requested change applied. The class
    /// cannot be changed afterwards.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, InstrumentError> {
        self.ensure_mutable()?;
        self.emitted = true;
        let emit_stack_map = self.class.major_version >= STACK_MAP_MAJOR_VERSION;
        let class_is_interface = self.class.is_interface();
        let interceptions = std::mem::take(&mut self.interceptions);
        let count: usize = interceptions.values().map(Vec::len).sum();
        let ClassFile { constant_pool: cp, methods, .. } = &mut self.class;
        let mut trampolines = Vec::new();
        for (index, list) in &interceptions {
            let method = &methods[*index];
            let method_type = MethodType::parse(cp.get_utf8(method.descriptor_index)?)?;
            let is_constructor = cp.get_utf8(method.name_index)? == "<init>";
            let is_static = method.access_flags & ACC_STATIC != 0;
            let code_index = method
                .attributes
                .iter()
                .position(|a| cp.get_utf8(a.name_index).map_or(false, |n| n == "Code"))
                .ok_or_else(|| InstrumentError::Unsupported(format!("{}: method without Code", self.name)))?;
            let original = CodeAttribute::decode(&method.attributes[code_index].info)?;
            let site = splice::SpliceSite {
                class_name: &self.name,
                class_is_interface,
                method_type: &method_type,
                is_static,
                is_constructor,
            };
            let befores: Vec<&Trampoline> = list.iter().filter_map(|i| i.before.as_ref()).collect();
            let afters: Vec<&Trampoline> = list.iter().filter_map(|i| i.after.as_ref()).collect();
            let code = splice::splice(cp, &original, &site, &befores, &afters, emit_stack_map)?;
            let name_index = method.attributes[code_index].name_index;
            methods[*index].attributes[code_index] = Attribute { name_index, info: code.encode()? };
            for trampoline in befores.iter().chain(afters.iter()) {
                trampolines.push(trampoline.assemble(cp, emit_stack_map)?);
            }
        }
        methods.extend(trampolines);
        let bytes = self.class.to_bytes()?;
        if count > 0 {
            log::info!("transformed {} with {count} interceptor(s)", self.get_name());
        }
        Ok(bytes)
    }
}
