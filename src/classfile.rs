//! Class file reader and writer.
//!
//! Parsing keeps every attribute as raw bytes so that a class can be written
//! back unchanged apart from the members the instrumenter touches. The
//! attributes that instrumentation has to understand (`Code`,
//! `StackMapTable`, `LineNumberTable`, `LocalVariableTable`, `InnerClasses`,
//! `EnclosingMethod`) have typed decoders and encoders below.

use thiserror::Error;

pub const MAGIC: u32 = 0xCAFE_BABE;

pub const ACC_PUBLIC: u16 = 0x0001;
pub const ACC_PRIVATE: u16 = 0x0002;
pub const ACC_STATIC: u16 = 0x0008;
pub const ACC_FINAL: u16 = 0x0010;
pub const ACC_SUPER: u16 = 0x0020;
pub const ACC_TRANSIENT: u16 = 0x0080;
pub const ACC_NATIVE: u16 = 0x0100;
pub const ACC_INTERFACE: u16 = 0x0200;
pub const ACC_ABSTRACT: u16 = 0x0400;
pub const ACC_SYNTHETIC: u16 = 0x1000;

/// First class file version that requires a `StackMapTable` for verification.
pub const STACK_MAP_MAJOR_VERSION: u16 = 50;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassFileError {
    #[error("unexpected end of file")]
    UnexpectedEof,
    #[error("invalid magic: {0:#x}")]
    InvalidMagic(u32),
    #[error("invalid constant pool index: {0}")]
    InvalidConstantPoolIndex(u16),
    #[error("invalid constant pool tag: {0}")]
    InvalidConstantPoolTag(u8),
    #[error("invalid modified UTF-8")]
    InvalidUtf8,
    #[error("invalid attribute: {0}")]
    InvalidAttribute(String),
    #[error("invalid type descriptor: {0}")]
    InvalidDescriptor(String),
    #[error("constant pool overflow")]
    ConstantPoolOverflow,
    #[error("{0} exceeds class file limits")]
    TooLarge(&'static str),
}

#[derive(Debug, Clone)]
pub struct ClassFile {
    pub minor_version: u16,
    pub major_version: u16,
    pub constant_pool: ConstantPool,
    pub access_flags: u16,
    pub this_class: u16,
    pub super_class: u16,
    pub interfaces: Vec<u16>,
    pub fields: Vec<FieldInfo>,
    pub methods: Vec<MethodInfo>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct FieldInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone)]
pub struct MethodInfo {
    pub access_flags: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub attributes: Vec<Attribute>,
}

/// An attribute in its serialized form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name_index: u16,
    pub info: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CpInfo {
    Utf8(String),
    Integer(i32),
    Float(f32),
    Long(i64),
    Double(f64),
    Class { name_index: u16 },
    String { string_index: u16 },
    Fieldref { class_index: u16, name_and_type_index: u16 },
    Methodref { class_index: u16, name_and_type_index: u16 },
    InterfaceMethodref { class_index: u16, name_and_type_index: u16 },
    NameAndType { name_index: u16, descriptor_index: u16 },
    MethodHandle { reference_kind: u8, reference_index: u16 },
    MethodType { descriptor_index: u16 },
    Dynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    InvokeDynamic { bootstrap_method_attr_index: u16, name_and_type_index: u16 },
    Module { name_index: u16 },
    Package { name_index: u16 },
}

impl CpInfo {
    fn is_wide(&self) -> bool {
        matches!(self, CpInfo::Long(_) | CpInfo::Double(_))
    }
}

/// Constant pool with slot 0 and the upper halves of long/double entries
/// stored as `None`.
#[derive(Debug, Clone)]
pub struct ConstantPool {
    entries: Vec<Option<CpInfo>>,
}

impl Default for ConstantPool {
    fn default() -> Self {
        Self { entries: vec![None] }
    }
}

impl ConstantPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value of `constant_pool_count` in the serialized class.
    pub fn count(&self) -> usize {
        self.entries.len()
    }

    pub fn get(&self, index: u16) -> Result<&CpInfo, ClassFileError> {
        if index == 0 {
            return Err(ClassFileError::InvalidConstantPoolIndex(index));
        }
        self.entries
            .get(index as usize)
            .and_then(|e| e.as_ref())
            .ok_or(ClassFileError::InvalidConstantPoolIndex(index))
    }

    pub fn get_utf8(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Utf8(s) => Ok(s.as_str()),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// Internal name referenced by a `CONSTANT_Class` entry.
    pub fn class_name(&self, index: u16) -> Result<&str, ClassFileError> {
        match self.get(index)? {
            CpInfo::Class { name_index } => self.get_utf8(*name_index),
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    /// `(name, descriptor)` of a `CONSTANT_NameAndType` entry.
    pub fn name_and_type(&self, index: u16) -> Result<(&str, &str), ClassFileError> {
        match self.get(index)? {
            CpInfo::NameAndType { name_index, descriptor_index } => {
                Ok((self.get_utf8(*name_index)?, self.get_utf8(*descriptor_index)?))
            }
            _ => Err(ClassFileError::InvalidConstantPoolIndex(index)),
        }
    }

    fn position(&self, entry: &CpInfo) -> Option<u16> {
        self.entries
            .iter()
            .position(|e| e.as_ref() == Some(entry))
            .map(|i| i as u16)
    }

    /// Returns the index of an equal entry, appending one if none exists.
    pub fn intern(&mut self, entry: CpInfo) -> Result<u16, ClassFileError> {
        if let Some(index) = self.position(&entry) {
            return Ok(index);
        }
        let wide = entry.is_wide();
        let index = self.entries.len();
        let needed = if wide { 2 } else { 1 };
        if index + needed > u16::MAX as usize {
            return Err(ClassFileError::ConstantPoolOverflow);
        }
        self.entries.push(Some(entry));
        if wide {
            self.entries.push(None);
        }
        Ok(index as u16)
    }

    pub fn utf8(&mut self, value: &str) -> Result<u16, ClassFileError> {
        self.intern(CpInfo::Utf8(value.to_string()))
    }

    pub fn class(&mut self, internal_name: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(internal_name)?;
        self.intern(CpInfo::Class { name_index })
    }

    pub fn string(&mut self, value: &str) -> Result<u16, ClassFileError> {
        let string_index = self.utf8(value)?;
        self.intern(CpInfo::String { string_index })
    }

    pub fn integer(&mut self, value: i32) -> Result<u16, ClassFileError> {
        self.intern(CpInfo::Integer(value))
    }

    pub fn name_and_type_ref(&mut self, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let name_index = self.utf8(name)?;
        let descriptor_index = self.utf8(descriptor)?;
        self.intern(CpInfo::NameAndType { name_index, descriptor_index })
    }

    pub fn field_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type_ref(name, descriptor)?;
        self.intern(CpInfo::Fieldref { class_index, name_and_type_index })
    }

    pub fn method_ref(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type_ref(name, descriptor)?;
        self.intern(CpInfo::Methodref { class_index, name_and_type_index })
    }

    pub fn interface_method_ref(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
    ) -> Result<u16, ClassFileError> {
        let class_index = self.class(owner)?;
        let name_and_type_index = self.name_and_type_ref(name, descriptor)?;
        self.intern(CpInfo::InterfaceMethodref { class_index, name_and_type_index })
    }

    /// Resolves a field or method reference to `(owner, name, descriptor)`.
    pub fn member_ref(&self, index: u16) -> Result<(&str, &str, &str), ClassFileError> {
        let (class_index, nat) = match self.get(index)? {
            CpInfo::Fieldref { class_index, name_and_type_index }
            | CpInfo::Methodref { class_index, name_and_type_index }
            | CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                (*class_index, *name_and_type_index)
            }
            _ => return Err(ClassFileError::InvalidConstantPoolIndex(index)),
        };
        let owner = self.class_name(class_index)?;
        let (name, descriptor) = self.name_and_type(nat)?;
        Ok((owner, name, descriptor))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeAttribute {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub exception_table: Vec<ExceptionTableEntry>,
    pub attributes: Vec<Attribute>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionTableEntry {
    pub start_pc: u16,
    pub end_pc: u16,
    pub handler_pc: u16,
    pub catch_type: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StackMapFrame {
    Same { offset_delta: u16 },
    SameLocals1StackItem { offset_delta: u16, stack: VerificationTypeInfo },
    SameLocals1StackItemExtended { offset_delta: u16, stack: VerificationTypeInfo },
    Chop { offset_delta: u16, k: u8 },
    SameExtended { offset_delta: u16 },
    Append { offset_delta: u16, locals: Vec<VerificationTypeInfo> },
    Full { offset_delta: u16, locals: Vec<VerificationTypeInfo>, stack: Vec<VerificationTypeInfo> },
}

impl StackMapFrame {
    pub fn offset_delta(&self) -> u16 {
        match self {
            StackMapFrame::Same { offset_delta }
            | StackMapFrame::SameLocals1StackItem { offset_delta, .. }
            | StackMapFrame::SameLocals1StackItemExtended { offset_delta, .. }
            | StackMapFrame::Chop { offset_delta, .. }
            | StackMapFrame::SameExtended { offset_delta }
            | StackMapFrame::Append { offset_delta, .. }
            | StackMapFrame::Full { offset_delta, .. } => *offset_delta,
        }
    }

    /// Same frame with a new delta, widened to the extended form when the
    /// compact encoding cannot carry it.
    pub fn with_offset_delta(self, delta: u16) -> StackMapFrame {
        match self {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } => {
                if delta <= 63 {
                    StackMapFrame::Same { offset_delta: delta }
                } else {
                    StackMapFrame::SameExtended { offset_delta: delta }
                }
            }
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => {
                if delta <= 63 {
                    StackMapFrame::SameLocals1StackItem { offset_delta: delta, stack }
                } else {
                    StackMapFrame::SameLocals1StackItemExtended { offset_delta: delta, stack }
                }
            }
            StackMapFrame::Chop { k, .. } => StackMapFrame::Chop { offset_delta: delta, k },
            StackMapFrame::Append { locals, .. } => StackMapFrame::Append { offset_delta: delta, locals },
            StackMapFrame::Full { locals, stack, .. } => StackMapFrame::Full { offset_delta: delta, locals, stack },
        }
    }

    pub fn verification_types_mut(&mut self) -> Vec<&mut VerificationTypeInfo> {
        match self {
            StackMapFrame::Same { .. } | StackMapFrame::SameExtended { .. } | StackMapFrame::Chop { .. } => {
                Vec::new()
            }
            StackMapFrame::SameLocals1StackItem { stack, .. }
            | StackMapFrame::SameLocals1StackItemExtended { stack, .. } => vec![stack],
            StackMapFrame::Append { locals, .. } => locals.iter_mut().collect(),
            StackMapFrame::Full { locals, stack, .. } => locals.iter_mut().chain(stack.iter_mut()).collect(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationTypeInfo {
    Top,
    Integer,
    Float,
    Double,
    Long,
    Null,
    UninitializedThis,
    Object(u16),
    Uninitialized(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineNumberEntry {
    pub start_pc: u16,
    pub line_number: u16,
}

/// Entry of either `LocalVariableTable` or `LocalVariableTypeTable`; the
/// two share a layout and differ only in what `descriptor_index` names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalVariableEntry {
    pub start_pc: u16,
    pub length: u16,
    pub name_index: u16,
    pub descriptor_index: u16,
    pub index: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InnerClassInfo {
    pub inner_class_info_index: u16,
    pub outer_class_info_index: u16,
    pub inner_name_index: u16,
    pub inner_class_access_flags: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnclosingMethod {
    pub class_index: u16,
    /// Zero when the class is not enclosed by a method or constructor.
    pub method_index: u16,
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn read_u1(&mut self) -> Result<u8, ClassFileError> {
        if self.remaining() < 1 {
            return Err(ClassFileError::UnexpectedEof);
        }
        let v = self.data[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u2(&mut self) -> Result<u16, ClassFileError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn read_u4(&mut self) -> Result<u32, ClassFileError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], ClassFileError> {
        if self.remaining() < len {
            return Err(ClassFileError::UnexpectedEof);
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn finish(&self, attribute: &str) -> Result<(), ClassFileError> {
        if self.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute(attribute.to_string()));
        }
        Ok(())
    }
}

/// Big-endian output buffer.
#[derive(Default)]
pub(crate) struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn u1(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub(crate) fn u2(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn u4(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub(crate) fn bytes(&mut self, b: &[u8]) {
        self.buf.extend_from_slice(b);
    }

    pub(crate) fn len_u2(&mut self, len: usize, what: &'static str) -> Result<(), ClassFileError> {
        let len = u16::try_from(len).map_err(|_| ClassFileError::TooLarge(what))?;
        self.u2(len);
        Ok(())
    }

    pub(crate) fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

impl ClassFile {
    pub fn parse(bytes: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(bytes);
        let magic = r.read_u4()?;
        if magic != MAGIC {
            return Err(ClassFileError::InvalidMagic(magic));
        }

        let minor_version = r.read_u2()?;
        let major_version = r.read_u2()?;

        let constant_pool = parse_constant_pool(&mut r)?;

        let access_flags = r.read_u2()?;
        let this_class = r.read_u2()?;
        let super_class = r.read_u2()?;

        let interfaces_count = r.read_u2()?;
        let mut interfaces = Vec::with_capacity(interfaces_count as usize);
        for _ in 0..interfaces_count {
            interfaces.push(r.read_u2()?);
        }

        let fields_count = r.read_u2()?;
        let mut fields = Vec::with_capacity(fields_count as usize);
        for _ in 0..fields_count {
            let (access_flags, name_index, descriptor_index, attributes) = parse_member(&mut r)?;
            fields.push(FieldInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let methods_count = r.read_u2()?;
        let mut methods = Vec::with_capacity(methods_count as usize);
        for _ in 0..methods_count {
            let (access_flags, name_index, descriptor_index, attributes) = parse_member(&mut r)?;
            methods.push(MethodInfo { access_flags, name_index, descriptor_index, attributes });
        }

        let attributes = parse_attributes(&mut r)?;
        if r.remaining() != 0 {
            return Err(ClassFileError::InvalidAttribute("trailing bytes".to_string()));
        }

        Ok(Self {
            minor_version,
            major_version,
            constant_pool,
            access_flags,
            this_class,
            super_class,
            interfaces,
            fields,
            methods,
            attributes,
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ClassFileError> {
        let mut w = Writer::new();
        w.u4(MAGIC);
        w.u2(self.minor_version);
        w.u2(self.major_version);
        write_constant_pool(&mut w, &self.constant_pool)?;
        w.u2(self.access_flags);
        w.u2(self.this_class);
        w.u2(self.super_class);
        w.len_u2(self.interfaces.len(), "interfaces")?;
        for i in &self.interfaces {
            w.u2(*i);
        }
        w.len_u2(self.fields.len(), "fields")?;
        for f in &self.fields {
            write_member(&mut w, f.access_flags, f.name_index, f.descriptor_index, &f.attributes)?;
        }
        w.len_u2(self.methods.len(), "methods")?;
        for m in &self.methods {
            write_member(&mut w, m.access_flags, m.name_index, m.descriptor_index, &m.attributes)?;
        }
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_inner())
    }

    pub fn this_class_name(&self) -> Result<&str, ClassFileError> {
        self.constant_pool.class_name(self.this_class)
    }

    /// `None` for `java/lang/Object`.
    pub fn super_class_name(&self) -> Result<Option<&str>, ClassFileError> {
        if self.super_class == 0 {
            return Ok(None);
        }
        self.constant_pool.class_name(self.super_class).map(Some)
    }

    pub fn interface_names(&self) -> Result<Vec<&str>, ClassFileError> {
        self.interfaces.iter().map(|i| self.constant_pool.class_name(*i)).collect()
    }

    pub fn is_interface(&self) -> bool {
        self.access_flags & ACC_INTERFACE != 0
    }

    pub fn find_attribute<'a>(&self, attributes: &'a [Attribute], name: &str) -> Option<&'a Attribute> {
        attributes
            .iter()
            .find(|a| self.constant_pool.get_utf8(a.name_index).map_or(false, |n| n == name))
    }

    pub fn inner_classes(&self) -> Result<Vec<InnerClassInfo>, ClassFileError> {
        match self.find_attribute(&self.attributes, "InnerClasses") {
            Some(attr) => decode_inner_classes(&attr.info),
            None => Ok(Vec::new()),
        }
    }

    pub fn enclosing_method(&self) -> Result<Option<EnclosingMethod>, ClassFileError> {
        match self.find_attribute(&self.attributes, "EnclosingMethod") {
            Some(attr) => {
                let mut r = Reader::new(&attr.info);
                let em = EnclosingMethod { class_index: r.read_u2()?, method_index: r.read_u2()? };
                r.finish("EnclosingMethod")?;
                Ok(Some(em))
            }
            None => Ok(None),
        }
    }
}

fn parse_constant_pool(r: &mut Reader) -> Result<ConstantPool, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut entries: Vec<Option<CpInfo>> = Vec::with_capacity(count);
    entries.push(None);

    while entries.len() < count {
        let tag = r.read_u1()?;
        let entry = match tag {
            1 => {
                let len = r.read_u2()? as usize;
                CpInfo::Utf8(decode_modified_utf8(r.read_bytes(len)?)?)
            }
            3 => CpInfo::Integer(r.read_u4()? as i32),
            4 => CpInfo::Float(f32::from_bits(r.read_u4()?)),
            5 | 6 => {
                let high = r.read_u4()? as u64;
                let low = r.read_u4()? as u64;
                let bits = (high << 32) | low;
                let entry = if tag == 5 { CpInfo::Long(bits as i64) } else { CpInfo::Double(f64::from_bits(bits)) };
                entries.push(Some(entry));
                entries.push(None);
                continue;
            }
            7 => CpInfo::Class { name_index: r.read_u2()? },
            8 => CpInfo::String { string_index: r.read_u2()? },
            9 => CpInfo::Fieldref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            10 => CpInfo::Methodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            11 => CpInfo::InterfaceMethodref { class_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            12 => CpInfo::NameAndType { name_index: r.read_u2()?, descriptor_index: r.read_u2()? },
            15 => CpInfo::MethodHandle { reference_kind: r.read_u1()?, reference_index: r.read_u2()? },
            16 => CpInfo::MethodType { descriptor_index: r.read_u2()? },
            17 => CpInfo::Dynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            18 => CpInfo::InvokeDynamic { bootstrap_method_attr_index: r.read_u2()?, name_and_type_index: r.read_u2()? },
            19 => CpInfo::Module { name_index: r.read_u2()? },
            20 => CpInfo::Package { name_index: r.read_u2()? },
            _ => return Err(ClassFileError::InvalidConstantPoolTag(tag)),
        };
        entries.push(Some(entry));
    }

    Ok(ConstantPool { entries })
}

fn write_constant_pool(w: &mut Writer, cp: &ConstantPool) -> Result<(), ClassFileError> {
    w.len_u2(cp.entries.len(), "constant pool")?;
    for entry in cp.entries.iter().flatten() {
        match entry {
            CpInfo::Utf8(s) => {
                let bytes = encode_modified_utf8(s);
                w.u1(1);
                w.len_u2(bytes.len(), "UTF-8 constant")?;
                w.bytes(&bytes);
            }
            CpInfo::Integer(v) => {
                w.u1(3);
                w.u4(*v as u32);
            }
            CpInfo::Float(v) => {
                w.u1(4);
                w.u4(v.to_bits());
            }
            CpInfo::Long(v) => {
                w.u1(5);
                w.bytes(&v.to_be_bytes());
            }
            CpInfo::Double(v) => {
                w.u1(6);
                w.bytes(&v.to_bits().to_be_bytes());
            }
            CpInfo::Class { name_index } => {
                w.u1(7);
                w.u2(*name_index);
            }
            CpInfo::String { string_index } => {
                w.u1(8);
                w.u2(*string_index);
            }
            CpInfo::Fieldref { class_index, name_and_type_index } => {
                w.u1(9);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::Methodref { class_index, name_and_type_index } => {
                w.u1(10);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::InterfaceMethodref { class_index, name_and_type_index } => {
                w.u1(11);
                w.u2(*class_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::NameAndType { name_index, descriptor_index } => {
                w.u1(12);
                w.u2(*name_index);
                w.u2(*descriptor_index);
            }
            CpInfo::MethodHandle { reference_kind, reference_index } => {
                w.u1(15);
                w.u1(*reference_kind);
                w.u2(*reference_index);
            }
            CpInfo::MethodType { descriptor_index } => {
                w.u1(16);
                w.u2(*descriptor_index);
            }
            CpInfo::Dynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u1(17);
                w.u2(*bootstrap_method_attr_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::InvokeDynamic { bootstrap_method_attr_index, name_and_type_index } => {
                w.u1(18);
                w.u2(*bootstrap_method_attr_index);
                w.u2(*name_and_type_index);
            }
            CpInfo::Module { name_index } => {
                w.u1(19);
                w.u2(*name_index);
            }
            CpInfo::Package { name_index } => {
                w.u1(20);
                w.u2(*name_index);
            }
        }
    }
    Ok(())
}

fn parse_member(r: &mut Reader) -> Result<(u16, u16, u16, Vec<Attribute>), ClassFileError> {
    let access_flags = r.read_u2()?;
    let name_index = r.read_u2()?;
    let descriptor_index = r.read_u2()?;
    let attributes = parse_attributes(r)?;
    Ok((access_flags, name_index, descriptor_index, attributes))
}

fn write_member(
    w: &mut Writer,
    access_flags: u16,
    name_index: u16,
    descriptor_index: u16,
    attributes: &[Attribute],
) -> Result<(), ClassFileError> {
    w.u2(access_flags);
    w.u2(name_index);
    w.u2(descriptor_index);
    write_attributes(w, attributes)
}

fn parse_attributes(r: &mut Reader) -> Result<Vec<Attribute>, ClassFileError> {
    let count = r.read_u2()? as usize;
    let mut attrs = Vec::with_capacity(count);
    for _ in 0..count {
        let name_index = r.read_u2()?;
        let length = r.read_u4()? as usize;
        let info = r.read_bytes(length)?.to_vec();
        attrs.push(Attribute { name_index, info });
    }
    Ok(attrs)
}

pub(crate) fn write_attributes(w: &mut Writer, attributes: &[Attribute]) -> Result<(), ClassFileError> {
    w.len_u2(attributes.len(), "attributes")?;
    for a in attributes {
        w.u2(a.name_index);
        let len = u32::try_from(a.info.len()).map_err(|_| ClassFileError::TooLarge("attribute"))?;
        w.u4(len);
        w.bytes(&a.info);
    }
    Ok(())
}

impl CodeAttribute {
    pub fn decode(info: &[u8]) -> Result<Self, ClassFileError> {
        let mut r = Reader::new(info);
        let max_stack = r.read_u2()?;
        let max_locals = r.read_u2()?;
        let code_length = r.read_u4()? as usize;
        let code = r.read_bytes(code_length)?.to_vec();
        let exception_table_length = r.read_u2()? as usize;
        let mut exception_table = Vec::with_capacity(exception_table_length);
        for _ in 0..exception_table_length {
            exception_table.push(ExceptionTableEntry {
                start_pc: r.read_u2()?,
                end_pc: r.read_u2()?,
                handler_pc: r.read_u2()?,
                catch_type: r.read_u2()?,
            });
        }
        let attributes = parse_attributes(&mut r)?;
        r.finish("Code")?;
        Ok(CodeAttribute { max_stack, max_locals, code, exception_table, attributes })
    }

    pub fn encode(&self) -> Result<Vec<u8>, ClassFileError> {
        // The JVM caps code_length below 65536 even though the field is a u4.
        if self.code.is_empty() || self.code.len() > u16::MAX as usize {
            return Err(ClassFileError::TooLarge("method code"));
        }
        let mut w = Writer::new();
        w.u2(self.max_stack);
        w.u2(self.max_locals);
        w.u4(self.code.len() as u32);
        w.bytes(&self.code);
        w.len_u2(self.exception_table.len(), "exception table")?;
        for e in &self.exception_table {
            w.u2(e.start_pc);
            w.u2(e.end_pc);
            w.u2(e.handler_pc);
            w.u2(e.catch_type);
        }
        write_attributes(&mut w, &self.attributes)?;
        Ok(w.into_inner())
    }
}

pub fn decode_stack_map_table(info: &[u8]) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        let frame_type = r.read_u1()?;
        let frame = match frame_type {
            0..=63 => StackMapFrame::Same { offset_delta: frame_type as u16 },
            64..=127 => {
                let stack = decode_verification_type(&mut r)?;
                StackMapFrame::SameLocals1StackItem { offset_delta: (frame_type - 64) as u16, stack }
            }
            247 => {
                let offset_delta = r.read_u2()?;
                let stack = decode_verification_type(&mut r)?;
                StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack }
            }
            248..=250 => StackMapFrame::Chop { offset_delta: r.read_u2()?, k: 251u8 - frame_type },
            251 => StackMapFrame::SameExtended { offset_delta: r.read_u2()? },
            252..=254 => {
                let offset_delta = r.read_u2()?;
                let count = (frame_type - 251) as usize;
                let mut locals = Vec::with_capacity(count);
                for _ in 0..count {
                    locals.push(decode_verification_type(&mut r)?);
                }
                StackMapFrame::Append { offset_delta, locals }
            }
            255 => {
                let offset_delta = r.read_u2()?;
                let num_locals = r.read_u2()? as usize;
                let mut locals = Vec::with_capacity(num_locals);
                for _ in 0..num_locals {
                    locals.push(decode_verification_type(&mut r)?);
                }
                let num_stack = r.read_u2()? as usize;
                let mut stack = Vec::with_capacity(num_stack);
                for _ in 0..num_stack {
                    stack.push(decode_verification_type(&mut r)?);
                }
                StackMapFrame::Full { offset_delta, locals, stack }
            }
            _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
        };
        entries.push(frame);
    }
    r.finish("StackMapTable")?;
    Ok(entries)
}

pub fn encode_stack_map_table(frames: &[StackMapFrame]) -> Result<Vec<u8>, ClassFileError> {
    let mut w = Writer::new();
    w.len_u2(frames.len(), "stack map frames")?;
    for frame in frames {
        match frame {
            StackMapFrame::Same { offset_delta } => w.u1(*offset_delta as u8),
            StackMapFrame::SameLocals1StackItem { offset_delta, stack } => {
                w.u1(64 + *offset_delta as u8);
                encode_verification_type(&mut w, stack);
            }
            StackMapFrame::SameLocals1StackItemExtended { offset_delta, stack } => {
                w.u1(247);
                w.u2(*offset_delta);
                encode_verification_type(&mut w, stack);
            }
            StackMapFrame::Chop { offset_delta, k } => {
                w.u1(251 - *k);
                w.u2(*offset_delta);
            }
            StackMapFrame::SameExtended { offset_delta } => {
                w.u1(251);
                w.u2(*offset_delta);
            }
            StackMapFrame::Append { offset_delta, locals } => {
                w.u1(251 + locals.len() as u8);
                w.u2(*offset_delta);
                for l in locals {
                    encode_verification_type(&mut w, l);
                }
            }
            StackMapFrame::Full { offset_delta, locals, stack } => {
                w.u1(255);
                w.u2(*offset_delta);
                w.len_u2(locals.len(), "frame locals")?;
                for l in locals {
                    encode_verification_type(&mut w, l);
                }
                w.len_u2(stack.len(), "frame stack")?;
                for s in stack {
                    encode_verification_type(&mut w, s);
                }
            }
        }
    }
    Ok(w.into_inner())
}

fn decode_verification_type(r: &mut Reader) -> Result<VerificationTypeInfo, ClassFileError> {
    let tag = r.read_u1()?;
    let info = match tag {
        0 => VerificationTypeInfo::Top,
        1 => VerificationTypeInfo::Integer,
        2 => VerificationTypeInfo::Float,
        3 => VerificationTypeInfo::Double,
        4 => VerificationTypeInfo::Long,
        5 => VerificationTypeInfo::Null,
        6 => VerificationTypeInfo::UninitializedThis,
        7 => VerificationTypeInfo::Object(r.read_u2()?),
        8 => VerificationTypeInfo::Uninitialized(r.read_u2()?),
        _ => return Err(ClassFileError::InvalidAttribute("StackMapTable".to_string())),
    };
    Ok(info)
}

fn encode_verification_type(w: &mut Writer, info: &VerificationTypeInfo) {
    match info {
        VerificationTypeInfo::Top => w.u1(0),
        VerificationTypeInfo::Integer => w.u1(1),
        VerificationTypeInfo::Float => w.u1(2),
        VerificationTypeInfo::Double => w.u1(3),
        VerificationTypeInfo::Long => w.u1(4),
        VerificationTypeInfo::Null => w.u1(5),
        VerificationTypeInfo::UninitializedThis => w.u1(6),
        VerificationTypeInfo::Object(index) => {
            w.u1(7);
            w.u2(*index);
        }
        VerificationTypeInfo::Uninitialized(offset) => {
            w.u1(8);
            w.u2(*offset);
        }
    }
}

pub fn decode_line_numbers(info: &[u8]) -> Result<Vec<LineNumberEntry>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        entries.push(LineNumberEntry { start_pc: r.read_u2()?, line_number: r.read_u2()? });
    }
    r.finish("LineNumberTable")?;
    Ok(entries)
}

pub fn encode_line_numbers(entries: &[LineNumberEntry]) -> Result<Vec<u8>, ClassFileError> {
    let mut w = Writer::new();
    w.len_u2(entries.len(), "line numbers")?;
    for e in entries {
        w.u2(e.start_pc);
        w.u2(e.line_number);
    }
    Ok(w.into_inner())
}

pub fn decode_local_variables(info: &[u8]) -> Result<Vec<LocalVariableEntry>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut entries = Vec::with_capacity(num);
    for _ in 0..num {
        entries.push(LocalVariableEntry {
            start_pc: r.read_u2()?,
            length: r.read_u2()?,
            name_index: r.read_u2()?,
            descriptor_index: r.read_u2()?,
            index: r.read_u2()?,
        });
    }
    r.finish("LocalVariableTable")?;
    Ok(entries)
}

pub fn encode_local_variables(entries: &[LocalVariableEntry]) -> Result<Vec<u8>, ClassFileError> {
    let mut w = Writer::new();
    w.len_u2(entries.len(), "local variables")?;
    for e in entries {
        w.u2(e.start_pc);
        w.u2(e.length);
        w.u2(e.name_index);
        w.u2(e.descriptor_index);
        w.u2(e.index);
    }
    Ok(w.into_inner())
}

fn decode_inner_classes(info: &[u8]) -> Result<Vec<InnerClassInfo>, ClassFileError> {
    let mut r = Reader::new(info);
    let num = r.read_u2()? as usize;
    let mut classes = Vec::with_capacity(num);
    for _ in 0..num {
        classes.push(InnerClassInfo {
            inner_class_info_index: r.read_u2()?,
            outer_class_info_index: r.read_u2()?,
            inner_name_index: r.read_u2()?,
            inner_class_access_flags: r.read_u2()?,
        });
    }
    r.finish("InnerClasses")?;
    Ok(classes)
}

/// Decodes the JVM's modified UTF-8: `U+0000` is two bytes and
/// supplementary characters are surrogate pairs of three bytes each.
pub fn decode_modified_utf8(bytes: &[u8]) -> Result<String, ClassFileError> {
    if bytes.iter().all(|b| *b != 0 && *b < 0x80) {
        return std::str::from_utf8(bytes).map(str::to_string).map_err(|_| ClassFileError::InvalidUtf8);
    }
    let mut units: Vec<u16> = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        let (unit, width) = if b & 0x80 == 0 {
            if b == 0 {
                return Err(ClassFileError::InvalidUtf8);
            }
            (b as u16, 1)
        } else if b & 0xE0 == 0xC0 {
            let b2 = *bytes.get(i + 1).ok_or(ClassFileError::InvalidUtf8)?;
            (((b as u16 & 0x1F) << 6) | (b2 as u16 & 0x3F), 2)
        } else if b & 0xF0 == 0xE0 {
            let b2 = *bytes.get(i + 1).ok_or(ClassFileError::InvalidUtf8)?;
            let b3 = *bytes.get(i + 2).ok_or(ClassFileError::InvalidUtf8)?;
            (((b as u16 & 0x0F) << 12) | ((b2 as u16 & 0x3F) << 6) | (b3 as u16 & 0x3F), 3)
        } else {
            return Err(ClassFileError::InvalidUtf8);
        };
        units.push(unit);
        i += width;
    }
    String::from_utf16(&units).map_err(|_| ClassFileError::InvalidUtf8)
}

pub fn encode_modified_utf8(s: &str) -> Vec<u8> {
    if s.bytes().all(|b| b != 0 && b < 0x80) {
        return s.as_bytes().to_vec();
    }
    let mut out = Vec::with_capacity(s.len() + 8);
    for unit in s.encode_utf16() {
        match unit {
            0x0001..=0x007F => out.push(unit as u8),
            0x0000 | 0x0080..=0x07FF => {
                out.push(0xC0 | (unit >> 6) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
            _ => {
                out.push(0xE0 | (unit >> 12) as u8);
                out.push(0x80 | ((unit >> 6) & 0x3F) as u8);
                out.push(0x80 | (unit & 0x3F) as u8);
            }
        }
    }
    out
}
