//! Instruction decoding and a straight-line code assembler.
//!
//! Only what the instrumenter needs: walking existing method bodies to find
//! instruction boundaries and branch operands, and emitting the branch-free
//! sequences that make up trampolines, accessors and splices.

use crate::classfile::{ClassFileError, ConstantPool};
use crate::descriptor::{JavaType, MethodType};

pub const NOP: u8 = 0x00;
pub const ACONST_NULL: u8 = 0x01;
pub const ICONST_M1: u8 = 0x02;
pub const ICONST_0: u8 = 0x03;
pub const ICONST_5: u8 = 0x08;
pub const BIPUSH: u8 = 0x10;
pub const SIPUSH: u8 = 0x11;
pub const LDC: u8 = 0x12;
pub const LDC_W: u8 = 0x13;
pub const ILOAD: u8 = 0x15;
pub const LLOAD: u8 = 0x16;
pub const FLOAD: u8 = 0x17;
pub const DLOAD: u8 = 0x18;
pub const ALOAD: u8 = 0x19;
pub const ILOAD_0: u8 = 0x1a;
pub const LLOAD_0: u8 = 0x1e;
pub const FLOAD_0: u8 = 0x22;
pub const DLOAD_0: u8 = 0x26;
pub const ALOAD_0: u8 = 0x2a;
pub const ISTORE: u8 = 0x36;
pub const ASTORE: u8 = 0x3a;
pub const ISTORE_0: u8 = 0x3b;
pub const ASTORE_0: u8 = 0x4b;
pub const AASTORE: u8 = 0x53;
pub const POP: u8 = 0x57;
pub const DUP: u8 = 0x59;
pub const DUP2: u8 = 0x5c;
pub const SWAP: u8 = 0x5f;
pub const IADD: u8 = 0x60;
pub const IFEQ: u8 = 0x99;
pub const IFNE: u8 = 0x9a;
pub const GOTO: u8 = 0xa7;
pub const JSR: u8 = 0xa8;
pub const RET: u8 = 0xa9;
pub const TABLESWITCH: u8 = 0xaa;
pub const LOOKUPSWITCH: u8 = 0xab;
pub const IRETURN: u8 = 0xac;
pub const LRETURN: u8 = 0xad;
pub const FRETURN: u8 = 0xae;
pub const DRETURN: u8 = 0xaf;
pub const ARETURN: u8 = 0xb0;
pub const RETURN: u8 = 0xb1;
pub const GETFIELD: u8 = 0xb4;
pub const PUTFIELD: u8 = 0xb5;
pub const INVOKEVIRTUAL: u8 = 0xb6;
pub const INVOKESPECIAL: u8 = 0xb7;
pub const INVOKESTATIC: u8 = 0xb8;
pub const INVOKEINTERFACE: u8 = 0xb9;
pub const INVOKEDYNAMIC: u8 = 0xba;
pub const NEW: u8 = 0xbb;
pub const ANEWARRAY: u8 = 0xbd;
pub const ATHROW: u8 = 0xbf;
pub const CHECKCAST: u8 = 0xc0;
pub const WIDE: u8 = 0xc4;
pub const IFNULL: u8 = 0xc6;
pub const IFNONNULL: u8 = 0xc7;
pub const GOTO_W: u8 = 0xc8;
pub const JSR_W: u8 = 0xc9;

/// One decoded instruction of a method body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub offset: usize,
    pub opcode: u8,
    pub len: usize,
}

impl Instruction {
    pub fn is_return(&self) -> bool {
        (IRETURN..=RETURN).contains(&self.opcode)
    }

    /// Conditional branches, `goto`, `jsr` and the null checks, all with a
    /// signed 16-bit operand.
    pub fn is_short_branch(&self) -> bool {
        (IFEQ..=JSR).contains(&self.opcode) || self.opcode == IFNULL || self.opcode == IFNONNULL
    }

    pub fn is_wide_branch(&self) -> bool {
        self.opcode == GOTO_W || self.opcode == JSR_W
    }

    pub fn is_switch(&self) -> bool {
        self.opcode == TABLESWITCH || self.opcode == LOOKUPSWITCH
    }
}

fn invalid_code(reason: &str) -> ClassFileError {
    ClassFileError::InvalidAttribute(format!("Code: {reason}"))
}

pub(crate) fn read_i32(code: &[u8], at: usize) -> Result<i32, ClassFileError> {
    code.get(at..at + 4)
        .map(|b| i32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        .ok_or_else(|| invalid_code("truncated operand"))
}

pub(crate) fn read_i16(code: &[u8], at: usize) -> Result<i16, ClassFileError> {
    code.get(at..at + 2)
        .map(|b| i16::from_be_bytes([b[0], b[1]]))
        .ok_or_else(|| invalid_code("truncated operand"))
}

pub(crate) fn read_u16(code: &[u8], at: usize) -> Result<u16, ClassFileError> {
    read_i16(code, at).map(|v| v as u16)
}

/// Bytes of alignment padding after a switch opcode at `offset`.
pub fn switch_padding(offset: usize) -> usize {
    (4 - (offset + 1) % 4) % 4
}

fn instruction_length(code: &[u8], offset: usize) -> Result<usize, ClassFileError> {
    let opcode = code[offset];
    let len = match opcode {
        0x00..=0x0f => 1,
        BIPUSH | LDC => 2,
        SIPUSH | LDC_W | 0x14 => 3,
        0x15..=0x19 => 2,
        0x1a..=0x35 => 1,
        0x36..=0x3a => 2,
        0x3b..=0x83 => 1,
        0x84 => 3,
        0x85..=0x98 => 1,
        IFEQ..=JSR => 3,
        RET => 2,
        TABLESWITCH => {
            let base = offset + 1 + switch_padding(offset);
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            if high < low {
                return Err(invalid_code("tableswitch bounds"));
            }
            let count = (high as i64 - low as i64 + 1) as usize;
            base + 12 + count * 4 - offset
        }
        LOOKUPSWITCH => {
            let base = offset + 1 + switch_padding(offset);
            let npairs = read_i32(code, base + 4)?;
            if npairs < 0 {
                return Err(invalid_code("lookupswitch pairs"));
            }
            base + 8 + npairs as usize * 8 - offset
        }
        IRETURN..=RETURN => 1,
        0xb2..=INVOKESTATIC => 3,
        INVOKEINTERFACE | INVOKEDYNAMIC => 5,
        NEW => 3,
        0xbc => 2,
        ANEWARRAY => 3,
        0xbe | ATHROW => 1,
        CHECKCAST | 0xc1 => 3,
        0xc2 | 0xc3 => 1,
        WIDE => match code.get(offset + 1) {
            Some(0x84) => 6,
            Some(_) => 4,
            None => return Err(invalid_code("truncated wide")),
        },
        0xc5 => 4,
        IFNULL | IFNONNULL => 3,
        GOTO_W | JSR_W => 5,
        other => return Err(invalid_code(&format!("unknown opcode {other:#04x}"))),
    };
    Ok(len)
}

/// Splits a method body into instructions.
pub fn decode(code: &[u8]) -> Result<Vec<Instruction>, ClassFileError> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < code.len() {
        let len = instruction_length(code, offset)?;
        if offset + len > code.len() {
            return Err(invalid_code("instruction runs past end"));
        }
        out.push(Instruction { offset, opcode: code[offset], len });
        offset += len;
    }
    Ok(out)
}

pub fn return_opcode(ty: &JavaType) -> u8 {
    match ty {
        JavaType::Void => RETURN,
        JavaType::Long => LRETURN,
        JavaType::Float => FRETURN,
        JavaType::Double => DRETURN,
        JavaType::Object(_) | JavaType::Array(_) => ARETURN,
        _ => IRETURN,
    }
}

/// Emits straight-line code and tracks operand stack depth.
pub struct Assembler<'a> {
    cp: &'a mut ConstantPool,
    code: Vec<u8>,
    depth: i32,
    max_depth: i32,
}

impl<'a> Assembler<'a> {
    pub fn new(cp: &'a mut ConstantPool) -> Self {
        Self { cp, code: Vec::new(), depth: 0, max_depth: 0 }
    }

    /// Starts at a known stack depth, e.g. the return value at a splice site.
    pub fn with_depth(cp: &'a mut ConstantPool, depth: i32) -> Self {
        Self { cp, code: Vec::new(), depth, max_depth: depth }
    }

    /// Marks the start of an exception handler: the stack holds only the
    /// caught throwable.
    pub fn handler_entry(&mut self) {
        self.depth = 0;
        self.stack(1);
    }

    fn stack(&mut self, delta: i32) {
        self.depth += delta;
        self.max_depth = self.max_depth.max(self.depth);
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn max_stack(&self) -> u16 {
        self.max_depth.max(0) as u16
    }

    pub fn into_code(self) -> Vec<u8> {
        self.code
    }

    fn u1(&mut self, v: u8) {
        self.code.push(v);
    }

    fn u2(&mut self, v: u16) {
        self.code.extend_from_slice(&v.to_be_bytes());
    }

    pub fn aconst_null(&mut self) {
        self.u1(ACONST_NULL);
        self.stack(1);
    }

    pub fn dup(&mut self) {
        self.u1(DUP);
        self.stack(1);
    }

    /// `dup` or `dup2` depending on the width of the value on top.
    pub fn dup_value(&mut self, ty: &JavaType) {
        if ty.slots() == 2 {
            self.u1(DUP2);
            self.stack(2);
        } else {
            self.dup();
        }
    }

    pub fn swap(&mut self) {
        self.u1(SWAP);
    }

    pub fn athrow(&mut self) {
        self.u1(ATHROW);
        self.depth = 0;
    }

    pub fn return_value(&mut self, ty: &JavaType) {
        self.u1(return_opcode(ty));
        self.depth = 0;
    }

    pub fn push_int(&mut self, value: i32) -> Result<(), ClassFileError> {
        match value {
            -1..=5 => self.u1((ICONST_0 as i32 + value) as u8),
            -128..=127 => {
                self.u1(BIPUSH);
                self.u1(value as i8 as u8);
            }
            -32768..=32767 => {
                self.u1(SIPUSH);
                self.u2(value as i16 as u16);
            }
            _ => {
                let index = self.cp.integer(value)?;
                self.ldc(index);
                return Ok(());
            }
        }
        self.stack(1);
        Ok(())
    }

    fn ldc(&mut self, index: u16) {
        if index <= u8::MAX as u16 {
            self.u1(LDC);
            self.u1(index as u8);
        } else {
            self.u1(LDC_W);
            self.u2(index);
        }
        self.stack(1);
    }

    pub fn push_string(&mut self, value: &str) -> Result<(), ClassFileError> {
        let index = self.cp.string(value)?;
        self.ldc(index);
        Ok(())
    }

    pub fn load(&mut self, ty: &JavaType, slot: u16) {
        let (short_base, long_op) = match ty {
            JavaType::Long => (LLOAD_0, LLOAD),
            JavaType::Float => (FLOAD_0, FLOAD),
            JavaType::Double => (DLOAD_0, DLOAD),
            JavaType::Object(_) | JavaType::Array(_) => (ALOAD_0, ALOAD),
            _ => (ILOAD_0, ILOAD),
        };
        if slot <= 3 {
            self.u1(short_base + slot as u8);
        } else if slot <= u8::MAX as u16 {
            self.u1(long_op);
            self.u1(slot as u8);
        } else {
            self.u1(WIDE);
            self.u1(long_op);
            self.u2(slot);
        }
        self.stack(ty.slots() as i32);
    }

    pub fn checkcast(&mut self, class: &str) -> Result<(), ClassFileError> {
        let index = self.cp.class(class)?;
        self.u1(CHECKCAST);
        self.u2(index);
        Ok(())
    }

    pub fn anewarray(&mut self, class: &str) -> Result<(), ClassFileError> {
        let index = self.cp.class(class)?;
        self.u1(ANEWARRAY);
        self.u2(index);
        Ok(())
    }

    pub fn aastore(&mut self) {
        self.u1(AASTORE);
        self.stack(-3);
    }

    /// Boxes the primitive on top of the stack; references are left as is.
    pub fn box_value(&mut self, ty: &JavaType) -> Result<(), ClassFileError> {
        if let Some(wrapper) = ty.box_class() {
            let descriptor = format!("({})L{};", ty.descriptor(), wrapper);
            self.invoke_static(wrapper, "valueOf", &descriptor, false)?;
        }
        Ok(())
    }

    pub fn getfield(&mut self, owner: &str, name: &str, ty: &JavaType) -> Result<(), ClassFileError> {
        let index = self.cp.field_ref(owner, name, &ty.descriptor())?;
        self.u1(GETFIELD);
        self.u2(index);
        self.stack(ty.slots() as i32 - 1);
        Ok(())
    }

    pub fn putfield(&mut self, owner: &str, name: &str, ty: &JavaType) -> Result<(), ClassFileError> {
        let index = self.cp.field_ref(owner, name, &ty.descriptor())?;
        self.u1(PUTFIELD);
        self.u2(index);
        self.stack(-(ty.slots() as i32) - 1);
        Ok(())
    }

    pub fn invoke_static(
        &mut self,
        owner: &str,
        name: &str,
        descriptor: &str,
        owner_is_interface: bool,
    ) -> Result<(), ClassFileError> {
        let index = if owner_is_interface {
            self.cp.interface_method_ref(owner, name, descriptor)?
        } else {
            self.cp.method_ref(owner, name, descriptor)?
        };
        self.u1(INVOKESTATIC);
        self.u2(index);
        let ty = MethodType::parse(descriptor)?;
        self.stack(ty.ret.slots() as i32 - ty.param_slots() as i32);
        Ok(())
    }

    pub fn invoke_virtual(&mut self, owner: &str, name: &str, descriptor: &str) -> Result<(), ClassFileError> {
        let index = self.cp.method_ref(owner, name, descriptor)?;
        self.u1(INVOKEVIRTUAL);
        self.u2(index);
        let ty = MethodType::parse(descriptor)?;
        self.stack(ty.ret.slots() as i32 - ty.param_slots() as i32 - 1);
        Ok(())
    }
}
