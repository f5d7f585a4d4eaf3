//! A small interpreter for rewritten methods.
//!
//! It runs the int and reference instructions that fixtures and the splicer
//! emit. The two runtime natives go to the crate's own registry and
//! [`InvokerHelper`], and interceptor calls go to Rust test doubles.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use jvmti_instrument::bytecode::{
    decode, AASTORE, ACONST_NULL, ALOAD, ALOAD_0, ANEWARRAY, ARETURN, ASTORE, ASTORE_0, ATHROW, BIPUSH, CHECKCAST,
    DUP, GETFIELD, GOTO, IADD, ICONST_0, ICONST_5, ICONST_M1, IFEQ, IFNE, IFNONNULL, IFNULL, ILOAD, ILOAD_0,
    INVOKEINTERFACE, INVOKESPECIAL, INVOKESTATIC, INVOKEVIRTUAL, IRETURN, ISTORE, ISTORE_0, LDC, LDC_W, NEW, NOP,
    POP, PUTFIELD, RETURN, SIPUSH, SWAP,
};
use jvmti_instrument::classfile::{ClassFile, CodeAttribute, ConstantPool, CpInfo, MethodInfo};
use jvmti_instrument::descriptor::{internal_to_java_name, JavaType, MethodType};
use jvmti_instrument::error::InstrumentError;
use jvmti_instrument::host::{ClassLoaderRef, InstrumentHost};
use jvmti_instrument::interceptor::{InterceptorInstance, InterceptorManifest, InterceptorRegistry, InvokerHelper};
use jvmti_instrument::runtime::{FIND_INTERCEPTOR, HANDLE_EXCEPTION, INVOKER_HELPER_CLASS, REGISTRY_CLASS};

const AALOAD: u8 = 0x32;
const ISUB: u8 = 0x64;
const IMUL: u8 = 0x68;

pub struct Object {
    pub class: String,
    fields: Mutex<HashMap<String, Value>>,
}

#[derive(Clone)]
pub enum Value {
    Void,
    Null,
    Int(i32),
    /// A primitive boxed through `valueOf`.
    Boxed(i32),
    Str(String),
    Object(Arc<Object>),
    Array(Arc<Mutex<Vec<Value>>>),
    /// What `findInterceptor` handed back, by id.
    Interceptor(i32),
}

impl Value {
    pub fn new_object(class: &str) -> Value {
        Value::Object(Arc::new(Object { class: class.to_string(), fields: Mutex::new(HashMap::new()) }))
    }

    pub fn str(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    pub fn class_name(&self) -> Option<&str> {
        match self {
            Value::Object(o) => Some(&o.class),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Value {
        match self {
            Value::Object(o) => o.fields.lock().unwrap().get(name).cloned().unwrap_or(Value::Null),
            other => panic!("field {name} of {other:?}"),
        }
    }

    pub fn set_field(&self, name: &str, value: Value) {
        match self {
            Value::Object(o) => {
                o.fields.lock().unwrap().insert(name.to_string(), value);
            }
            other => panic!("field {name} of {other:?}"),
        }
    }

    /// Elements of an `Object[]`.
    pub fn items(&self) -> Vec<Value> {
        match self {
            Value::Array(items) => items.lock().unwrap().clone(),
            other => panic!("{other:?} is not an array"),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn int(&self) -> i32 {
        match self {
            Value::Int(v) => *v,
            other => panic!("expected an int, got {other:?}"),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Void, Value::Void) | (Value::Null, Value::Null) => true,
            (Value::Int(a), Value::Int(b)) | (Value::Boxed(a), Value::Boxed(b)) => a == b,
            (Value::Interceptor(a), Value::Interceptor(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => Arc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Void => f.write_str("void"),
            Value::Null => f.write_str("null"),
            Value::Int(v) => write!(f, "{v}"),
            Value::Boxed(v) => write!(f, "boxed({v})"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::Object(o) => write!(f, "{}@{:p}", o.class, Arc::as_ptr(o)),
            Value::Array(items) => write!(f, "{:?}", items.lock().unwrap()),
            Value::Interceptor(id) => write!(f, "interceptor#{id}"),
        }
    }
}

/// Stands in for an interceptor object. Gets the method name (`before` or
/// `after`) and the arguments generated code passed; `Err` is a throw.
pub type Double = Arc<dyn Fn(&Vm, &str, &[Value]) -> Result<(), Value> + Send + Sync>;

pub fn double<F>(f: F) -> Double
where
    F: Fn(&Vm, &str, &[Value]) -> Result<(), Value> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Host whose factory hands out the double registered for the interceptor's
/// type name.
pub fn host_with_doubles(doubles: HashMap<String, Double>) -> (InstrumentHost, Arc<InterceptorRegistry>) {
    let registry = Arc::new(InterceptorRegistry::new());
    let factory = move |_: &ClassLoaderRef, manifest: &InterceptorManifest| {
        doubles
            .get(manifest.type_name())
            .cloned()
            .map(InterceptorInstance::new)
            .ok_or_else(|| InstrumentError::Unsupported(format!("no test double for {}", manifest.type_name())))
    };
    let locator = |_: &ClassLoaderRef, _: &str| Ok::<Option<Vec<u8>>, InstrumentError>(None);
    (InstrumentHost::new(registry.clone(), Arc::new(factory), Arc::new(locator)), registry)
}

fn u2(code: &[u8], pc: usize) -> u16 {
    u16::from_be_bytes([code[pc + 1], code[pc + 2]])
}

fn branch(code: &[u8], pc: usize) -> usize {
    (pc as i64 + i16::from_be_bytes([code[pc + 1], code[pc + 2]]) as i64) as usize
}

fn pop(stack: &mut Vec<Value>) -> Value {
    stack.pop().expect("operand stack underflow")
}

fn pop_args(stack: &mut Vec<Value>, count: usize) -> Vec<Value> {
    let args = stack.split_off(stack.len() - count);
    assert_eq!(args.len(), count);
    args
}

fn null_pointer() -> Value {
    Value::new_object("java/lang/NullPointerException")
}

fn describe(throwable: &Value) -> String {
    match throwable.class_name() {
        Some(class) => internal_to_java_name(class),
        None => format!("{throwable:?}"),
    }
}

fn catches(cp: &ConstantPool, catch_type: u16, thrown: &Value) -> bool {
    if catch_type == 0 {
        return true;
    }
    let name = cp.class_name(catch_type).unwrap();
    name == "java/lang/Throwable" || thrown.class_name() == Some(name)
}

pub struct Vm {
    classes: HashMap<String, ClassFile>,
    registry: Arc<InterceptorRegistry>,
}

impl Vm {
    pub fn new(registry: Arc<InterceptorRegistry>, classes: &[Vec<u8>]) -> Self {
        let classes = classes
            .iter()
            .map(|bytes| {
                let class = ClassFile::parse(bytes).unwrap();
                (class.this_class_name().unwrap().to_string(), class)
            })
            .collect();
        Self { classes, registry }
    }

    /// `new class()` through its no-argument constructor.
    pub fn instantiate(&self, class: &str) -> Result<Value, Value> {
        let object = Value::new_object(class);
        self.run_special(class, "<init>", "()V", vec![object.clone()])?;
        Ok(object)
    }

    /// Virtual call on `receiver`.
    pub fn invoke(&self, receiver: &Value, name: &str, descriptor: &str, args: &[Value]) -> Result<Value, Value> {
        match receiver {
            Value::Null => Err(null_pointer()),
            Value::Interceptor(id) => {
                let found = self.registry.find_raw(*id).expect("interceptor registered");
                let double = found.instance.downcast_ref::<Double>().expect("interceptor is a test double");
                (**double)(self, name, args).map(|()| Value::Void)
            }
            Value::Object(object) => {
                let mut locals = vec![receiver.clone()];
                locals.extend_from_slice(args);
                self.run_special(&object.class, name, descriptor, locals)
            }
            other => panic!("cannot call {name} on {other:?}"),
        }
    }

    pub fn invoke_static(&self, class: &str, name: &str, descriptor: &str, args: &[Value]) -> Result<Value, Value> {
        self.run_special(class, name, descriptor, args.to_vec())
    }

    /// Resolves `name` in `class` or its superclasses and runs it.
    fn run_special(&self, class: &str, name: &str, descriptor: &str, locals: Vec<Value>) -> Result<Value, Value> {
        let mut owner = class;
        loop {
            let Some(file) = self.classes.get(owner) else {
                // Constructors of JDK classes do nothing here.
                assert_eq!(name, "<init>", "{owner}.{name}{descriptor} is not loaded");
                return Ok(Value::Void);
            };
            if let Some(method) = find(file, name, descriptor) {
                let attr = file.find_attribute(&method.attributes, "Code").expect("method has code");
                let code = CodeAttribute::decode(&attr.info).unwrap();
                return self.execute(file, &code, locals);
            }
            owner = file.super_class_name().unwrap().expect("method resolves before java/lang/Object");
        }
    }

    fn call(&self, opcode: u8, owner: &str, name: &str, descriptor: &str, stack: &mut Vec<Value>) -> Result<(), Value> {
        let method_type = MethodType::parse(descriptor).unwrap();
        let mut args = pop_args(stack, method_type.params.len());
        let result = match opcode {
            INVOKESTATIC if owner == REGISTRY_CLASS && name == FIND_INTERCEPTOR => {
                let raw = args[0].int();
                match self.registry.find_raw(raw) {
                    Some(found) => {
                        InvokerHelper::set_current(Some(found.id));
                        Value::Interceptor(raw)
                    }
                    None => {
                        InvokerHelper::set_current(None);
                        Value::Null
                    }
                }
            }
            INVOKESTATIC if owner == INVOKER_HELPER_CLASS && name == HANDLE_EXCEPTION => {
                InvokerHelper::handle_exception(&describe(&args[0]));
                Value::Void
            }
            INVOKESTATIC if name == "valueOf" && owner.starts_with("java/lang/") => Value::Boxed(args[0].int()),
            INVOKESTATIC => self.run_special(owner, name, descriptor, args)?,
            INVOKESPECIAL => {
                args.insert(0, pop(stack));
                self.run_special(owner, name, descriptor, args)?
            }
            INVOKEVIRTUAL | INVOKEINTERFACE => {
                let receiver = pop(stack);
                self.invoke(&receiver, name, descriptor, &args)?
            }
            _ => unreachable!("not an invoke: {opcode:#x}"),
        };
        if method_type.ret != JavaType::Void {
            stack.push(result);
        }
        Ok(())
    }

    fn execute(&self, class: &ClassFile, code: &CodeAttribute, args: Vec<Value>) -> Result<Value, Value> {
        let cp = &class.constant_pool;
        let bytes = &code.code;
        let lengths: HashMap<usize, usize> =
            decode(bytes).unwrap().into_iter().map(|insn| (insn.offset, insn.len)).collect();
        let mut locals = args;
        locals.resize(locals.len().max(code.max_locals as usize), Value::Void);
        let mut stack: Vec<Value> = Vec::new();
        let mut pc = 0usize;
        loop {
            let opcode = bytes[pc];
            let mut next = pc + lengths[&pc];
            let outcome: Result<(), Value> = match opcode {
                NOP | CHECKCAST => Ok(()),
                ACONST_NULL => {
                    stack.push(Value::Null);
                    Ok(())
                }
                ICONST_M1..=ICONST_5 => {
                    stack.push(Value::Int(opcode as i32 - ICONST_0 as i32));
                    Ok(())
                }
                BIPUSH => {
                    stack.push(Value::Int(bytes[pc + 1] as i8 as i32));
                    Ok(())
                }
                SIPUSH => {
                    stack.push(Value::Int(u2(bytes, pc) as i16 as i32));
                    Ok(())
                }
                LDC | LDC_W => {
                    let index = if opcode == LDC { bytes[pc + 1] as u16 } else { u2(bytes, pc) };
                    let value = match cp.get(index).unwrap() {
                        CpInfo::String { string_index } => Value::Str(cp.get_utf8(*string_index).unwrap().to_string()),
                        CpInfo::Integer(v) => Value::Int(*v),
                        other => panic!("ldc of {other:?}"),
                    };
                    stack.push(value);
                    Ok(())
                }
                ILOAD | ALOAD => {
                    stack.push(locals[bytes[pc + 1] as usize].clone());
                    Ok(())
                }
                0x1a..=0x1d => {
                    stack.push(locals[(opcode - ILOAD_0) as usize].clone());
                    Ok(())
                }
                0x2a..=0x2d => {
                    stack.push(locals[(opcode - ALOAD_0) as usize].clone());
                    Ok(())
                }
                ISTORE | ASTORE => {
                    locals[bytes[pc + 1] as usize] = pop(&mut stack);
                    Ok(())
                }
                0x3b..=0x3e => {
                    locals[(opcode - ISTORE_0) as usize] = pop(&mut stack);
                    Ok(())
                }
                0x4b..=0x4e => {
                    locals[(opcode - ASTORE_0) as usize] = pop(&mut stack);
                    Ok(())
                }
                AALOAD => {
                    let index = pop(&mut stack).int() as usize;
                    let array = pop(&mut stack);
                    stack.push(array.items()[index].clone());
                    Ok(())
                }
                AASTORE => {
                    let value = pop(&mut stack);
                    let index = pop(&mut stack).int() as usize;
                    match pop(&mut stack) {
                        Value::Array(items) => items.lock().unwrap()[index] = value,
                        other => panic!("aastore into {other:?}"),
                    }
                    Ok(())
                }
                POP => {
                    pop(&mut stack);
                    Ok(())
                }
                DUP => {
                    let top = pop(&mut stack);
                    stack.push(top.clone());
                    stack.push(top);
                    Ok(())
                }
                SWAP => {
                    let a = pop(&mut stack);
                    let b = pop(&mut stack);
                    stack.push(a);
                    stack.push(b);
                    Ok(())
                }
                IADD | ISUB | IMUL => {
                    let b = pop(&mut stack).int();
                    let a = pop(&mut stack).int();
                    let v = match opcode {
                        IADD => a.wrapping_add(b),
                        ISUB => a.wrapping_sub(b),
                        _ => a.wrapping_mul(b),
                    };
                    stack.push(Value::Int(v));
                    Ok(())
                }
                IFEQ | IFNE | IFNULL | IFNONNULL => {
                    let v = pop(&mut stack);
                    let taken = match opcode {
                        IFEQ => v.int() == 0,
                        IFNE => v.int() != 0,
                        IFNULL => v.is_null(),
                        _ => !v.is_null(),
                    };
                    if taken {
                        next = branch(bytes, pc);
                    }
                    Ok(())
                }
                GOTO => {
                    next = branch(bytes, pc);
                    Ok(())
                }
                IRETURN | ARETURN => return Ok(pop(&mut stack)),
                RETURN => return Ok(Value::Void),
                GETFIELD => {
                    let (_, name, _) = cp.member_ref(u2(bytes, pc)).unwrap();
                    match pop(&mut stack) {
                        Value::Null => Err(null_pointer()),
                        object => {
                            stack.push(object.field(name));
                            Ok(())
                        }
                    }
                }
                PUTFIELD => {
                    let (_, name, _) = cp.member_ref(u2(bytes, pc)).unwrap();
                    let value = pop(&mut stack);
                    match pop(&mut stack) {
                        Value::Null => Err(null_pointer()),
                        object => {
                            object.set_field(name, value);
                            Ok(())
                        }
                    }
                }
                INVOKEVIRTUAL | INVOKESPECIAL | INVOKESTATIC | INVOKEINTERFACE => {
                    let (owner, name, descriptor) = cp.member_ref(u2(bytes, pc)).unwrap();
                    self.call(opcode, owner, name, descriptor, &mut stack)
                }
                NEW => {
                    stack.push(Value::new_object(cp.class_name(u2(bytes, pc)).unwrap()));
                    Ok(())
                }
                ANEWARRAY => {
                    let len = pop(&mut stack).int() as usize;
                    stack.push(Value::Array(Arc::new(Mutex::new(vec![Value::Null; len]))));
                    Ok(())
                }
                ATHROW => match pop(&mut stack) {
                    Value::Null => Err(null_pointer()),
                    thrown => Err(thrown),
                },
                other => panic!("unsupported opcode {other:#04x} at {pc}"),
            };
            if let Err(thrown) = outcome {
                let handler = code.exception_table.iter().find(|e| {
                    (e.start_pc as usize..e.end_pc as usize).contains(&pc) && catches(cp, e.catch_type, &thrown)
                });
                let Some(handler) = handler else {
                    return Err(thrown);
                };
                stack.clear();
                stack.push(thrown);
                next = handler.handler_pc as usize;
            }
            pc = next;
        }
    }
}

fn find<'a>(class: &'a ClassFile, name: &str, descriptor: &str) -> Option<&'a MethodInfo> {
    let cp = &class.constant_pool;
    class.methods.iter().find(|m| {
        cp.get_utf8(m.name_index).map_or(false, |n| n == name)
            && cp.get_utf8(m.descriptor_index).map_or(false, |d| d == descriptor)
    })
}
