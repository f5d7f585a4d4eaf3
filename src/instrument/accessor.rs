//! Accessor and getter interfaces, and the members generated for them.

use crate::bytecode::Assembler;
use crate::classfile::{Attribute, ClassFileError, CodeAttribute, ConstantPool, MethodInfo, ACC_PUBLIC};
use crate::descriptor::{java_name_to_internal, JavaType, MethodType};
use crate::error::InstrumentError;
use crate::interceptor::codegen::RESERVED_PREFIX;

/// A capability interface backed by a generated field.
///
/// For property `databaseInfo` the class gets the field
/// `_$APM$_databaseInfo`, a getter `_$APM$_getDatabaseInfo()` and a setter
/// `_$APM$_setDatabaseInfo(value)`, which the interface must declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accessor {
    interface: String,
    property: String,
    field_type: JavaType,
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn reference_or_primitive(java_name: &str) -> Result<JavaType, InstrumentError> {
    let ty = JavaType::from_java_name(java_name)?;
    if ty == JavaType::Void {
        return Err(InstrumentError::Unsupported("void accessor type".to_string()));
    }
    Ok(ty)
}

impl Accessor {
    /// `interface` and `field_type` are Java names.
    pub fn new(interface: &str, property: &str, field_type: &str) -> Result<Self, InstrumentError> {
        if property.is_empty() {
            return Err(InstrumentError::Unsupported(format!("{interface}: empty accessor property")));
        }
        Ok(Self {
            interface: java_name_to_internal(interface),
            property: property.to_string(),
            field_type: reference_or_primitive(field_type)?,
        })
    }

    /// Internal name of the interface.
    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn field_type(&self) -> &JavaType {
        &self.field_type
    }

    pub fn field_name(&self) -> String {
        format!("{RESERVED_PREFIX}{}", self.property)
    }

    pub fn getter_name(&self) -> String {
        format!("{RESERVED_PREFIX}get{}", capitalize(&self.property))
    }

    pub fn setter_name(&self) -> String {
        format!("{RESERVED_PREFIX}set{}", capitalize(&self.property))
    }
}

/// An interface exposing a field the class already declares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Getter {
    interface: String,
    method_name: String,
    field_type: JavaType,
}

impl Getter {
    pub fn new(interface: &str, method_name: &str, field_type: &str) -> Result<Self, InstrumentError> {
        Ok(Self {
            interface: java_name_to_internal(interface),
            method_name: method_name.to_string(),
            field_type: reference_or_primitive(field_type)?,
        })
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn field_type(&self) -> &JavaType {
        &self.field_type
    }
}

fn public_method(
    cp: &mut ConstantPool,
    name: &str,
    method_type: &MethodType,
    max_stack: u16,
    code: Vec<u8>,
) -> Result<MethodInfo, ClassFileError> {
    let body = CodeAttribute {
        max_stack,
        max_locals: method_type.param_slots() + 1,
        code,
        exception_table: Vec::new(),
        attributes: Vec::new(),
    };
    Ok(MethodInfo {
        access_flags: ACC_PUBLIC,
        name_index: cp.utf8(name)?,
        descriptor_index: cp.utf8(&method_type.descriptor())?,
        attributes: vec![Attribute { name_index: cp.utf8("Code")?, info: body.encode()? }],
    })
}

/// `return this.<field>;`
pub(crate) fn getter_method(
    cp: &mut ConstantPool,
    class_name: &str,
    method_name: &str,
    field_name: &str,
    ty: &JavaType,
) -> Result<MethodInfo, ClassFileError> {
    let mut asm = Assembler::new(cp);
    asm.load(&JavaType::object(class_name), 0);
    asm.getfield(class_name, field_name, ty)?;
    asm.return_value(ty);
    let max_stack = asm.max_stack();
    let code = asm.into_code();
    public_method(cp, method_name, &MethodType::new(Vec::new(), ty.clone()), max_stack, code)
}

/// `this.<field> = value;`
pub(crate) fn setter_method(
    cp: &mut ConstantPool,
    class_name: &str,
    method_name: &str,
    field_name: &str,
    ty: &JavaType,
) -> Result<MethodInfo, ClassFileError> {
    let mut asm = Assembler::new(cp);
    asm.load(&JavaType::object(class_name), 0);
    asm.load(ty, 1);
    asm.putfield(class_name, field_name, ty)?;
    asm.return_value(&JavaType::Void);
    let max_stack = asm.max_stack();
    let code = asm.into_code();
    public_method(cp, method_name, &MethodType::new(vec![ty.clone()], JavaType::Void), max_stack, code)
}
