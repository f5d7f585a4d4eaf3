//! Synthesis of the `before`/`after` trampolines for one interceptor.
//!
//! A trampoline is a private static method added to the instrumented class.
//! It looks the interceptor up by id, casts it to its declared type and calls
//! `before` or `after` with the argument list chosen by the interceptor's
//! category. The same [`Trampoline`] value is rendered to source for
//! diagnostics and lowered to bytecode, so both always agree.

use crate::bytecode::Assembler;
use crate::classfile::{
    encode_stack_map_table, Attribute, ClassFileError, CodeAttribute, ConstantPool, ExceptionTableEntry,
    MethodInfo, StackMapFrame, VerificationTypeInfo, ACC_PRIVATE, ACC_STATIC, ACC_SYNTHETIC,
};
use crate::code_builder::CodeBuilder;
use crate::descriptor::{internal_to_java_name, parameter_description, JavaType, MethodType};
use crate::error::InstrumentError;
use crate::runtime::{
    FIND_INTERCEPTOR, FIND_INTERCEPTOR_DESC, HANDLE_EXCEPTION, HANDLE_EXCEPTION_DESC, INVOKER_HELPER_CLASS,
    REGISTRY_CLASS,
};

use super::{InterceptorCategory, InterceptorId, InterceptorManifest};

pub const RESERVED_PREFIX: &str = "_$APM$_";

const OBJECT: &str = "java/lang/Object";
const THROWABLE: &str = "java/lang/Throwable";

const OBJECT_D: &str = "Ljava/lang/Object;";
const OBJECT_ARRAY_D: &str = "[Ljava/lang/Object;";
const STRING_D: &str = "Ljava/lang/String;";
const THROWABLE_D: &str = "Ljava/lang/Throwable;";

/// The method an interceptor is attached to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetMethod {
    /// Internal name of the declaring class.
    pub declaring_class: String,
    pub class_is_interface: bool,
    pub name: String,
    pub method_type: MethodType,
    pub is_static: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrampolineKind {
    Before,
    After,
}

/// One argument of the interceptor call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallArg {
    /// The receiver, or `null` for static targets.
    Target,
    Literal(String),
    /// Every original argument, boxed into an `Object[]`.
    Args,
    /// One original argument by position, boxed.
    Param(usize),
    Null,
    Result,
    Throwable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trampoline {
    pub kind: TrampolineKind,
    pub id: InterceptorId,
    /// Internal name of the interceptor type.
    pub interceptor_type: String,
    /// Name of the synthetic method added to the target class.
    pub method_name: String,
    /// Descriptor of the interceptor's `before`/`after`.
    pub call_descriptor: String,
    pub args: Vec<CallArg>,
    params: Vec<JavaType>,
    target_is_static: bool,
}

impl Trampoline {
    pub fn interceptor_method(&self) -> &'static str {
        match self.kind {
            TrampolineKind::Before => "before",
            TrampolineKind::After => "after",
        }
    }

    /// Parameters of the synthetic method itself.
    pub fn method_type(&self) -> MethodType {
        let mut params = Vec::with_capacity(self.params.len() + 3);
        if self.kind == TrampolineKind::After {
            params.push(JavaType::object(OBJECT));
            params.push(JavaType::object(THROWABLE));
        }
        params.push(JavaType::object(OBJECT));
        params.extend(self.params.iter().cloned());
        MethodType::new(params, JavaType::Void)
    }

    pub fn descriptor(&self) -> String {
        self.method_type().descriptor()
    }

    fn target_slot(&self) -> u16 {
        match self.kind {
            TrampolineKind::Before => 0,
            TrampolineKind::After => 2,
        }
    }

    fn param_slot(&self, index: usize) -> u16 {
        self.target_slot() + 1 + self.params[..index].iter().map(JavaType::slots).sum::<u16>()
    }

    fn holder(&self) -> String {
        format!("{RESERVED_PREFIX}holder{}", self.id)
    }

    /// Source form of the trampoline body.
    pub fn render_source(&self) -> Result<String, InstrumentError> {
        let mut b = CodeBuilder::new();
        let holder = self.holder();
        b.begin();
        b.append(" try ");
        b.begin();
        b.format(format_args!(
            " {holder} = {}.{FIND_INTERCEPTOR}({}); ",
            internal_to_java_name(REGISTRY_CLASS),
            self.id
        ));
        b.format(format_args!(
            "(({}){holder}).{}(",
            internal_to_java_name(&self.interceptor_type),
            self.interceptor_method()
        ));
        let rendered: Vec<String> = self.args.iter().map(|a| self.render_arg(a)).collect();
        b.append(&rendered.join(", "));
        b.append("); ");
        b.end()?;
        b.format(format_args!(" catch ({} {RESERVED_PREFIX}exception) ", internal_to_java_name(THROWABLE)));
        b.begin();
        b.format(format_args!(
            " {}.{HANDLE_EXCEPTION}({RESERVED_PREFIX}exception); ",
            internal_to_java_name(INVOKER_HELPER_CLASS)
        ));
        b.end()?;
        b.append(" ");
        b.end()?;
        Ok(b.build()?)
    }

    fn render_param(&self, index: usize) -> String {
        let ty = &self.params[index];
        match ty.box_class() {
            Some(wrapper) => format!("{}.valueOf(${})", internal_to_java_name(wrapper), index + 1),
            None => format!("${}", index + 1),
        }
    }

    fn render_arg(&self, arg: &CallArg) -> String {
        match arg {
            CallArg::Target if self.target_is_static => "null".to_string(),
            CallArg::Target => "this".to_string(),
            CallArg::Literal(s) => format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\"")),
            CallArg::Args if self.params.is_empty() => "new java.lang.Object[0]".to_string(),
            CallArg::Args => {
                let items: Vec<String> = (0..self.params.len()).map(|i| self.render_param(i)).collect();
                format!("new java.lang.Object[] {{ {} }}", items.join(", "))
            }
            CallArg::Param(i) => self.render_param(*i),
            CallArg::Null => "null".to_string(),
            CallArg::Result => "($w)$_".to_string(),
            CallArg::Throwable => format!("{RESERVED_PREFIX}throwable"),
        }
    }

    fn emit_param(&self, asm: &mut Assembler<'_>, index: usize) -> Result<(), ClassFileError> {
        let ty = &self.params[index];
        asm.load(ty, self.param_slot(index));
        asm.box_value(ty)
    }

    fn emit_arg(&self, asm: &mut Assembler<'_>, arg: &CallArg) -> Result<(), ClassFileError> {
        let object = JavaType::object(OBJECT);
        match arg {
            CallArg::Target => asm.load(&object, self.target_slot()),
            CallArg::Literal(s) => asm.push_string(s)?,
            CallArg::Args => {
                let len = i32::try_from(self.params.len()).map_err(|_| ClassFileError::TooLarge("arguments"))?;
                asm.push_int(len)?;
                asm.anewarray(OBJECT)?;
                for i in 0..self.params.len() {
                    asm.dup();
                    asm.push_int(i as i32)?;
                    self.emit_param(asm, i)?;
                    asm.aastore();
                }
            }
            CallArg::Param(i) => self.emit_param(asm, *i)?,
            CallArg::Null => asm.aconst_null(),
            CallArg::Result => asm.load(&object, 0),
            CallArg::Throwable => asm.load(&JavaType::object(THROWABLE), 1),
        }
        Ok(())
    }

    /// Lowers the trampoline into a method of the class owning `cp`.
    pub fn assemble(&self, cp: &mut ConstantPool, emit_stack_map: bool) -> Result<MethodInfo, ClassFileError> {
        let method_type = self.method_type();
        let mut asm = Assembler::new(cp);
        asm.push_int(self.id.as_java())?;
        asm.invoke_static(REGISTRY_CLASS, FIND_INTERCEPTOR, FIND_INTERCEPTOR_DESC, false)?;
        asm.checkcast(&self.interceptor_type)?;
        for arg in &self.args {
            self.emit_arg(&mut asm, arg)?;
        }
        asm.invoke_virtual(&self.interceptor_type, self.interceptor_method(), &self.call_descriptor)?;
        asm.return_value(&JavaType::Void);
        let handler = asm.len();
        asm.handler_entry();
        asm.invoke_static(INVOKER_HELPER_CLASS, HANDLE_EXCEPTION, HANDLE_EXCEPTION_DESC, false)?;
        asm.return_value(&JavaType::Void);
        let max_stack = asm.max_stack();
        let code = asm.into_code();

        let handler_pc = u16::try_from(handler).map_err(|_| ClassFileError::TooLarge("trampoline"))?;
        let throwable = cp.class(THROWABLE)?;
        let mut attributes = Vec::new();
        if emit_stack_map {
            let mut locals = Vec::new();
            for p in &method_type.params {
                locals.extend(p.verification_type(cp)?);
            }
            let frame = StackMapFrame::Full {
                offset_delta: handler_pc,
                locals,
                stack: vec![VerificationTypeInfo::Object(throwable)],
            };
            attributes.push(Attribute { name_index: cp.utf8("StackMapTable")?, info: encode_stack_map_table(&[frame])? });
        }
        let body = CodeAttribute {
            max_stack,
            max_locals: method_type.param_slots(),
            code,
            exception_table: vec![ExceptionTableEntry {
                start_pc: 0,
                end_pc: handler_pc,
                handler_pc,
                catch_type: throwable,
            }],
            attributes,
        };
        Ok(MethodInfo {
            access_flags: ACC_PRIVATE | ACC_STATIC | ACC_SYNTHETIC,
            name_index: cp.utf8(&self.method_name)?,
            descriptor_index: cp.utf8(&self.descriptor())?,
            attributes: vec![Attribute { name_index: cp.utf8("Code")?, info: body.encode()? }],
        })
    }
}

/// Builds the trampolines of one interceptor attached to one method.
pub struct InvokeCodeGenerator<'a> {
    id: InterceptorId,
    manifest: &'a InterceptorManifest,
    target: &'a TargetMethod,
    /// Distinguishes several methods sharing one interceptor id.
    sequence: usize,
}

impl<'a> InvokeCodeGenerator<'a> {
    pub fn new(id: InterceptorId, manifest: &'a InterceptorManifest, target: &'a TargetMethod, sequence: usize) -> Self {
        Self { id, manifest, target, sequence }
    }

    /// `call_params` are descriptors of the interceptor method's parameters.
    fn trampoline(&self, kind: TrampolineKind, args: Vec<CallArg>, call_params: Vec<&str>) -> Trampoline {
        let prefix = match kind {
            TrampolineKind::Before => "before",
            TrampolineKind::After => "after",
        };
        Trampoline {
            kind,
            id: self.id,
            interceptor_type: self.manifest.internal_name(),
            method_name: format!("{RESERVED_PREFIX}{prefix}_{}_{}", self.id, self.sequence),
            call_descriptor: format!("({})V", call_params.concat()),
            args,
            params: self.target.method_type.params.clone(),
            target_is_static: self.target.is_static,
        }
    }

    fn static_literals(&self) -> [CallArg; 3] {
        [
            CallArg::Literal(internal_to_java_name(&self.target.declaring_class)),
            CallArg::Literal(self.target.name.clone()),
            CallArg::Literal(parameter_description(&self.target.method_type.params)),
        ]
    }

    /// Target followed by `slots` positional arguments, null padded.
    fn positional(&self, slots: usize) -> Vec<CallArg> {
        let n = self.target.method_type.params.len();
        let mut args = vec![CallArg::Target];
        args.extend((0..slots).map(|i| if i < n { CallArg::Param(i) } else { CallArg::Null }));
        args
    }

    pub fn before(&self) -> Result<Option<Trampoline>, InstrumentError> {
        let Some(arity) = self.manifest.before_arity() else {
            return Ok(None);
        };
        let tramp = match self.manifest.category() {
            InterceptorCategory::Simple => {
                self.trampoline(TrampolineKind::Before, vec![CallArg::Target, CallArg::Args], vec![OBJECT_D, OBJECT_ARRAY_D])
            }
            InterceptorCategory::Static => {
                let mut args = vec![CallArg::Target];
                args.extend(self.static_literals());
                args.push(CallArg::Args);
                let params = vec![OBJECT_D, STRING_D, STRING_D, STRING_D, OBJECT_ARRAY_D];
                self.trampoline(TrampolineKind::Before, args, params)
            }
            InterceptorCategory::Custom => {
                let args = if arity == 0 { Vec::new() } else { self.positional(arity - 1) };
                self.trampoline(TrampolineKind::Before, args, vec![OBJECT_D; arity])
            }
        };
        Ok(Some(tramp))
    }

    pub fn after(&self) -> Result<Option<Trampoline>, InstrumentError> {
        let Some(arity) = self.manifest.after_arity() else {
            return Ok(None);
        };
        let tramp = match self.manifest.category() {
            InterceptorCategory::Simple => self.trampoline(
                TrampolineKind::After,
                vec![CallArg::Target, CallArg::Args, CallArg::Result, CallArg::Throwable],
                vec![OBJECT_D, OBJECT_ARRAY_D, OBJECT_D, THROWABLE_D],
            ),
            InterceptorCategory::Static => {
                let mut args = vec![CallArg::Target];
                args.extend(self.static_literals());
                args.extend([CallArg::Args, CallArg::Result, CallArg::Throwable]);
                let params = vec![OBJECT_D, STRING_D, STRING_D, STRING_D, OBJECT_ARRAY_D, OBJECT_D, THROWABLE_D];
                self.trampoline(TrampolineKind::After, args, params)
            }
            InterceptorCategory::Custom => match arity {
                0 => self.trampoline(TrampolineKind::After, Vec::new(), Vec::new()),
                1 | 2 => return Err(short_custom_after(self.manifest)),
                _ => {
                    let mut args = self.positional(arity - 3);
                    args.extend([CallArg::Result, CallArg::Throwable]);
                    let mut params = vec![OBJECT_D; arity - 1];
                    params.push(THROWABLE_D);
                    self.trampoline(TrampolineKind::After, args, params)
                }
            },
        };
        Ok(Some(tramp))
    }
}

/// Rejects a manifest before any instance is created or registered for it.
pub fn check_manifest(manifest: &InterceptorManifest) -> Result<(), InstrumentError> {
    if manifest.category() == InterceptorCategory::Custom && matches!(manifest.after_arity(), Some(1 | 2)) {
        return Err(short_custom_after(manifest));
    }
    Ok(())
}

fn short_custom_after(manifest: &InterceptorManifest) -> InstrumentError {
    InstrumentError::Unsupported(format!(
        "{}: custom after() must declare no parameters or at least target, result and throwable",
        manifest.type_name()
    ))
}
