#![allow(dead_code)]

pub mod interp;

use std::collections::HashMap;
use std::sync::Arc;

use jvmti_instrument::bytecode::{decode, INVOKESTATIC};
use jvmti_instrument::classfile::{
    encode_line_numbers, encode_stack_map_table, Attribute, ClassFile, CodeAttribute, ConstantPool, FieldInfo,
    LineNumberEntry, MethodInfo, StackMapFrame, ACC_ABSTRACT, ACC_INTERFACE, ACC_PUBLIC, ACC_SUPER,
};
use jvmti_instrument::error::InstrumentError;
use jvmti_instrument::host::{ClassLoaderRef, InstrumentHost};
use jvmti_instrument::interceptor::{InterceptorInstance, InterceptorManifest, InterceptorRegistry};

pub const OBJECT: &str = "java/lang/Object";

/// Method body before it is lowered into a `Code` attribute.
pub struct Body {
    pub max_stack: u16,
    pub max_locals: u16,
    pub code: Vec<u8>,
    pub frames: Vec<StackMapFrame>,
    pub lines: Vec<LineNumberEntry>,
}

impl Body {
    pub fn new(max_stack: u16, max_locals: u16, code: Vec<u8>) -> Self {
        Self { max_stack, max_locals, code, frames: Vec::new(), lines: Vec::new() }
    }

    pub fn frames(mut self, frames: Vec<StackMapFrame>) -> Self {
        self.frames = frames;
        self
    }

    pub fn lines(mut self, lines: &[(u16, u16)]) -> Self {
        self.lines = lines.iter().map(|&(start_pc, line_number)| LineNumberEntry { start_pc, line_number }).collect();
        self
    }
}

/// Builds class files through the crate's own constant pool.
pub struct ClassBuilder {
    cp: ConstantPool,
    major: u16,
    access: u16,
    this_class: u16,
    super_class: u16,
    interfaces: Vec<u16>,
    fields: Vec<FieldInfo>,
    methods: Vec<MethodInfo>,
    attributes: Vec<Attribute>,
}

impl ClassBuilder {
    pub fn new(name: &str) -> Self {
        Self::with_super(name, OBJECT)
    }

    pub fn with_super(name: &str, super_name: &str) -> Self {
        let mut cp = ConstantPool::new();
        let this_class = cp.class(name).unwrap();
        let super_class = cp.class(super_name).unwrap();
        Self {
            cp,
            major: 52,
            access: ACC_PUBLIC | ACC_SUPER,
            this_class,
            super_class,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            attributes: Vec::new(),
        }
    }

    pub fn major(mut self, major: u16) -> Self {
        self.major = major;
        self
    }

    pub fn interface(mut self) -> Self {
        self.access = ACC_PUBLIC | ACC_INTERFACE | ACC_ABSTRACT;
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        let index = self.cp.class(interface).unwrap();
        self.interfaces.push(index);
        self
    }

    pub fn cp(&mut self) -> &mut ConstantPool {
        &mut self.cp
    }

    pub fn field(mut self, access: u16, name: &str, descriptor: &str) -> Self {
        let field = FieldInfo {
            access_flags: access,
            name_index: self.cp.utf8(name).unwrap(),
            descriptor_index: self.cp.utf8(descriptor).unwrap(),
            attributes: Vec::new(),
        };
        self.fields.push(field);
        self
    }

    /// `body` gets the constant pool so it can reference members.
    pub fn method(mut self, access: u16, name: &str, descriptor: &str, body: impl FnOnce(&mut ConstantPool) -> Body) -> Self {
        let body = body(&mut self.cp);
        let mut attributes = Vec::new();
        if !body.frames.is_empty() {
            attributes.push(Attribute {
                name_index: self.cp.utf8("StackMapTable").unwrap(),
                info: encode_stack_map_table(&body.frames).unwrap(),
            });
        }
        if !body.lines.is_empty() {
            attributes.push(Attribute {
                name_index: self.cp.utf8("LineNumberTable").unwrap(),
                info: encode_line_numbers(&body.lines).unwrap(),
            });
        }
        let code = CodeAttribute {
            max_stack: body.max_stack,
            max_locals: body.max_locals,
            code: body.code,
            exception_table: Vec::new(),
            attributes,
        };
        let method = MethodInfo {
            access_flags: access,
            name_index: self.cp.utf8(name).unwrap(),
            descriptor_index: self.cp.utf8(descriptor).unwrap(),
            attributes: vec![Attribute { name_index: self.cp.utf8("Code").unwrap(), info: code.encode().unwrap() }],
        };
        self.methods.push(method);
        self
    }

    pub fn abstract_method(mut self, name: &str, descriptor: &str) -> Self {
        let method = MethodInfo {
            access_flags: ACC_PUBLIC | ACC_ABSTRACT,
            name_index: self.cp.utf8(name).unwrap(),
            descriptor_index: self.cp.utf8(descriptor).unwrap(),
            attributes: Vec::new(),
        };
        self.methods.push(method);
        self
    }

    /// `aload_0; invokespecial super.<init>()V; return`
    pub fn default_constructor(self) -> Self {
        let super_name = self.cp.class_name(self.super_class).unwrap().to_string();
        self.method(ACC_PUBLIC, "<init>", "()V", |cp| {
            let init = cp.method_ref(&super_name, "<init>", "()V").unwrap();
            let [hi, lo] = init.to_be_bytes();
            Body::new(1, 1, vec![0x2a, 0xb7, hi, lo, 0xb1])
        })
    }

    /// `outer` is `None` for anonymous and local classes.
    pub fn inner_classes(mut self, entries: &[(&str, Option<&str>)]) -> Self {
        let mut info = Vec::new();
        info.extend_from_slice(&(entries.len() as u16).to_be_bytes());
        for (inner, outer) in entries {
            let inner_index = self.cp.class(inner).unwrap();
            let outer_index = match outer {
                Some(outer) => self.cp.class(outer).unwrap(),
                None => 0,
            };
            info.extend_from_slice(&inner_index.to_be_bytes());
            info.extend_from_slice(&outer_index.to_be_bytes());
            info.extend_from_slice(&0u16.to_be_bytes());
            info.extend_from_slice(&0u16.to_be_bytes());
        }
        let name_index = self.cp.utf8("InnerClasses").unwrap();
        self.attributes.push(Attribute { name_index, info });
        self
    }

    pub fn enclosing_method(mut self, class: &str, method: &str, descriptor: &str) -> Self {
        let class_index = self.cp.class(class).unwrap();
        let method_index = self.cp.name_and_type_ref(method, descriptor).unwrap();
        let mut info = Vec::new();
        info.extend_from_slice(&class_index.to_be_bytes());
        info.extend_from_slice(&method_index.to_be_bytes());
        let name_index = self.cp.utf8("EnclosingMethod").unwrap();
        self.attributes.push(Attribute { name_index, info });
        self
    }

    pub fn build(self) -> Vec<u8> {
        ClassFile {
            minor_version: 0,
            major_version: self.major,
            constant_pool: self.cp,
            access_flags: self.access,
            this_class: self.this_class,
            super_class: self.super_class,
            interfaces: self.interfaces,
            fields: self.fields,
            methods: self.methods,
            attributes: self.attributes,
        }
        .to_bytes()
        .unwrap()
    }
}

/// Host whose factory hands out unit instances and whose locator serves
/// `classes`, keyed by internal name.
pub fn host_with_classes(classes: HashMap<String, Vec<u8>>) -> (InstrumentHost, Arc<InterceptorRegistry>) {
    let registry = Arc::new(InterceptorRegistry::new());
    let factory =
        |_: &ClassLoaderRef, _: &InterceptorManifest| Ok::<_, InstrumentError>(InterceptorInstance::new(()));
    let locator = move |_: &ClassLoaderRef, name: &str| Ok::<_, InstrumentError>(classes.get(name).cloned());
    (InstrumentHost::new(registry.clone(), Arc::new(factory), Arc::new(locator)), registry)
}

pub fn host() -> (InstrumentHost, Arc<InterceptorRegistry>) {
    host_with_classes(HashMap::new())
}

pub fn find_method<'a>(class: &'a ClassFile, name: &str) -> &'a MethodInfo {
    class
        .methods
        .iter()
        .find(|m| class.constant_pool.get_utf8(m.name_index).unwrap() == name)
        .unwrap_or_else(|| panic!("no method {name}"))
}

pub fn method_names(class: &ClassFile) -> Vec<String> {
    class.methods.iter().map(|m| class.constant_pool.get_utf8(m.name_index).unwrap().to_string()).collect()
}

pub fn code_of(class: &ClassFile, name: &str) -> CodeAttribute {
    let method = find_method(class, name);
    let attr = class.find_attribute(&method.attributes, "Code").expect("Code attribute");
    CodeAttribute::decode(&attr.info).unwrap()
}

/// `(owner, name)` of every `invokestatic` in `code`, in order.
pub fn static_calls(class: &ClassFile, code: &[u8]) -> Vec<(String, String)> {
    decode(code)
        .unwrap()
        .into_iter()
        .filter(|insn| insn.opcode == INVOKESTATIC)
        .map(|insn| {
            let index = u16::from_be_bytes([code[insn.offset + 1], code[insn.offset + 2]]);
            let (owner, name, _) = class.constant_pool.member_ref(index).unwrap();
            (owner.to_string(), name.to_string())
        })
        .collect()
}
