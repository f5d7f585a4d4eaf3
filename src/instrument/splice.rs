//! Splices trampoline calls into an existing method body.
//!
//! The rewrite is always computed from the method's original code:
//!
//! * calls to every `before` trampoline at entry, or right after the
//!   `super(..)`/`this(..)` call of a constructor;
//! * calls to every `after` trampoline in front of each return instruction,
//!   passing a copy of the boxed return value;
//! * one catch-all handler appended after the body that reports the
//!   throwable to every `after` trampoline and rethrows it.
//!
//! Branches, exception ranges, debug tables and stack map frames are
//! relocated. A branch that jumps to a return lands on the inserted `after`
//! calls in front of it; nothing ever jumps into the entry splice.

use crate::bytecode::{decode, read_i16, read_i32, read_u16, switch_padding, Assembler, Instruction};
use crate::bytecode::{INVOKESPECIAL, LOOKUPSWITCH, NEW, TABLESWITCH};
use crate::classfile::{
    decode_line_numbers, decode_local_variables, decode_stack_map_table, encode_line_numbers,
    encode_local_variables, encode_stack_map_table, Attribute, ClassFileError, CodeAttribute, ConstantPool,
    ExceptionTableEntry, StackMapFrame, VerificationTypeInfo,
};
use crate::descriptor::{JavaType, MethodType};
use crate::error::InstrumentError;
use crate::interceptor::Trampoline;

const THROWABLE: &str = "java/lang/Throwable";

/// The method being rewritten.
pub(crate) struct SpliceSite<'a> {
    pub class_name: &'a str,
    pub class_is_interface: bool,
    pub method_type: &'a MethodType,
    pub is_static: bool,
    pub is_constructor: bool,
}

impl SpliceSite<'_> {
    fn load_target_and_params(&self, asm: &mut Assembler<'_>) {
        let mut slot = 0;
        if self.is_static {
            asm.aconst_null();
        } else {
            asm.load(&JavaType::object(self.class_name), 0);
            slot = 1;
        }
        for param in &self.method_type.params {
            asm.load(param, slot);
            slot += param.slots();
        }
    }

    fn call(&self, asm: &mut Assembler<'_>, trampoline: &Trampoline) -> Result<(), ClassFileError> {
        self.load_target_and_params(asm);
        asm.invoke_static(self.class_name, &trampoline.method_name, &trampoline.descriptor(), self.class_is_interface)
    }

    /// Locals live at the catch-all handler.
    fn handler_locals(&self, cp: &mut ConstantPool) -> Result<Vec<VerificationTypeInfo>, ClassFileError> {
        let mut locals = Vec::new();
        if !self.is_static {
            locals.push(VerificationTypeInfo::Object(cp.class(self.class_name)?));
        }
        for param in &self.method_type.params {
            locals.extend(param.verification_type(cp)?);
        }
        Ok(locals)
    }
}

struct Snippet {
    code: Vec<u8>,
    max_stack: u16,
}

fn entry_snippet(cp: &mut ConstantPool, site: &SpliceSite<'_>, befores: &[&Trampoline]) -> Result<Snippet, ClassFileError> {
    let mut asm = Assembler::new(cp);
    for trampoline in befores {
        site.call(&mut asm, trampoline)?;
    }
    Ok(Snippet { max_stack: asm.max_stack(), code: asm.into_code() })
}

/// Runs with the return value, if any, on top of the stack and leaves it there.
fn return_snippet(cp: &mut ConstantPool, site: &SpliceSite<'_>, afters: &[&Trampoline]) -> Result<Snippet, ClassFileError> {
    let ret = &site.method_type.ret;
    let value_slots = ret.slots();
    let mut asm = Assembler::with_depth(cp, value_slots as i32);
    for trampoline in afters.iter().rev() {
        if *ret == JavaType::Void {
            asm.aconst_null();
        } else {
            asm.dup_value(ret);
            asm.box_value(ret)?;
        }
        asm.aconst_null();
        site.call(&mut asm, trampoline)?;
    }
    Ok(Snippet { max_stack: asm.max_stack().saturating_sub(value_slots), code: asm.into_code() })
}

fn handler_snippet(cp: &mut ConstantPool, site: &SpliceSite<'_>, afters: &[&Trampoline]) -> Result<Snippet, ClassFileError> {
    let mut asm = Assembler::new(cp);
    asm.handler_entry();
    for trampoline in afters.iter().rev() {
        // result = null, throwable = the caught one
        asm.dup();
        asm.aconst_null();
        asm.swap();
        site.call(&mut asm, trampoline)?;
    }
    asm.athrow();
    Ok(Snippet { max_stack: asm.max_stack(), code: asm.into_code() })
}

/// Index of the instruction following the call that initializes `this`.
fn constructor_entry(cp: &ConstantPool, code: &[u8], insns: &[Instruction]) -> Result<usize, InstrumentError> {
    let mut pending_new = 0usize;
    for (i, insn) in insns.iter().enumerate() {
        match insn.opcode {
            NEW => pending_new += 1,
            INVOKESPECIAL => {
                let (_, name, _) = cp.member_ref(read_u16(code, insn.offset + 1)?)?;
                if name == "<init>" {
                    if pending_new == 0 {
                        return Ok(i + 1);
                    }
                    pending_new -= 1;
                }
            }
            _ => {}
        }
    }
    Err(InstrumentError::Unsupported("constructor without a super() or this() call".to_string()))
}

/// Where every original instruction ends up.
struct Layout {
    /// Start of the instruction, indexed by its old offset.
    position: Vec<Option<usize>>,
    /// Where a jump to the instruction lands: the return splice when there is one.
    target: Vec<Option<usize>>,
    starts: Vec<usize>,
    body_end: usize,
}

impl Layout {
    fn new(insns: &[Instruction], code_len: usize, entry_at: usize, entry_len: usize, return_len: usize) -> Self {
        let mut position = vec![None; code_len + 1];
        let mut target = vec![None; code_len + 1];
        let mut starts = Vec::with_capacity(insns.len());
        let mut pos = 0;
        for (i, insn) in insns.iter().enumerate() {
            if i == entry_at {
                pos += entry_len;
            }
            target[insn.offset] = Some(pos);
            if insn.is_return() {
                pos += return_len;
            }
            position[insn.offset] = Some(pos);
            starts.push(pos);
            pos += if insn.is_switch() {
                insn.len - switch_padding(insn.offset) + switch_padding(pos)
            } else {
                insn.len
            };
        }
        position[code_len] = Some(pos);
        target[code_len] = Some(pos);
        Layout { position, target, starts, body_end: pos }
    }

    fn lookup(table: &[Option<usize>], old: usize) -> Result<usize, ClassFileError> {
        table
            .get(old)
            .copied()
            .flatten()
            .ok_or_else(|| ClassFileError::InvalidAttribute(format!("Code: offset {old} is not an instruction boundary")))
    }

    fn position(&self, old: usize) -> Result<usize, ClassFileError> {
        Self::lookup(&self.position, old)
    }

    fn target(&self, old: usize) -> Result<usize, ClassFileError> {
        Self::lookup(&self.target, old)
    }

    fn target_u16(&self, old: u16) -> Result<u16, ClassFileError> {
        to_u16(self.target(old as usize)?)
    }
}

fn to_u16(value: usize) -> Result<u16, ClassFileError> {
    u16::try_from(value).map_err(|_| ClassFileError::TooLarge("code"))
}

fn relative(layout: &Layout, from_old: usize, rel: i64, new_pos: usize) -> Result<i64, ClassFileError> {
    let dest_old = usize::try_from(from_old as i64 + rel)
        .map_err(|_| ClassFileError::InvalidAttribute("Code: branch before method start".to_string()))?;
    Ok(layout.target(dest_old)? as i64 - new_pos as i64)
}

fn emit_instruction(
    out: &mut Vec<u8>,
    code: &[u8],
    insn: &Instruction,
    layout: &Layout,
) -> Result<(), InstrumentError> {
    let new_pos = out.len();
    let old = insn.offset;
    if insn.is_short_branch() {
        let rel = relative(layout, old, read_i16(code, old + 1)? as i64, new_pos)?;
        let rel = i16::try_from(rel)
            .map_err(|_| InstrumentError::Unsupported(format!("branch at {old} no longer fits a 16-bit offset")))?;
        out.push(insn.opcode);
        out.extend_from_slice(&rel.to_be_bytes());
    } else if insn.is_wide_branch() {
        let rel = relative(layout, old, read_i32(code, old + 1)? as i64, new_pos)?;
        let rel = i32::try_from(rel).map_err(|_| ClassFileError::TooLarge("code"))?;
        out.push(insn.opcode);
        out.extend_from_slice(&rel.to_be_bytes());
    } else if insn.is_switch() {
        let base = old + 1 + switch_padding(old);
        out.push(insn.opcode);
        out.resize(out.len() + switch_padding(new_pos), 0);
        let jump = |at: usize, out: &mut Vec<u8>| -> Result<(), ClassFileError> {
            let rel = relative(layout, old, read_i32(code, at)? as i64, new_pos)?;
            let rel = i32::try_from(rel).map_err(|_| ClassFileError::TooLarge("code"))?;
            out.extend_from_slice(&rel.to_be_bytes());
            Ok(())
        };
        jump(base, out)?;
        if insn.opcode == TABLESWITCH {
            let low = read_i32(code, base + 4)?;
            let high = read_i32(code, base + 8)?;
            out.extend_from_slice(&low.to_be_bytes());
            out.extend_from_slice(&high.to_be_bytes());
            let count = (high as i64 - low as i64 + 1) as usize;
            for k in 0..count {
                jump(base + 12 + k * 4, out)?;
            }
        } else if insn.opcode == LOOKUPSWITCH {
            let npairs = read_i32(code, base + 4)?;
            out.extend_from_slice(&npairs.to_be_bytes());
            for k in 0..npairs.max(0) as usize {
                let pair = base + 8 + k * 8;
                out.extend_from_slice(&read_i32(code, pair)?.to_be_bytes());
                jump(pair + 4, out)?;
            }
        }
    } else {
        out.extend_from_slice(&code[old..old + insn.len]);
    }
    Ok(())
}

fn relocate_frames(
    frames: Vec<StackMapFrame>,
    layout: &Layout,
    handler: Option<StackMapFrame>,
) -> Result<Vec<StackMapFrame>, ClassFileError> {
    let mut out = Vec::with_capacity(frames.len() + 1);
    let mut old_abs: Option<usize> = None;
    let mut new_abs: Option<usize> = None;
    let mut push = |frame: StackMapFrame, at: usize, out: &mut Vec<StackMapFrame>| -> Result<(), ClassFileError> {
        let delta = match new_abs {
            None => at,
            Some(prev) => at
                .checked_sub(prev + 1)
                .ok_or_else(|| ClassFileError::InvalidAttribute("StackMapTable: frames out of order".to_string()))?,
        };
        out.push(frame.with_offset_delta(to_u16(delta)?));
        new_abs = Some(at);
        Ok(())
    };
    for mut frame in frames {
        let abs = match old_abs {
            None => frame.offset_delta() as usize,
            Some(prev) => prev + frame.offset_delta() as usize + 1,
        };
        old_abs = Some(abs);
        for ty in frame.verification_types_mut() {
            if let VerificationTypeInfo::Uninitialized(offset) = ty {
                *offset = to_u16(layout.position(*offset as usize)?)?;
            }
        }
        push(frame, layout.target(abs)?, &mut out)?;
    }
    if let Some(frame) = handler {
        push(frame, layout.body_end, &mut out)?;
    }
    Ok(out)
}

/// Rewrites `original` so that `befores` run at entry and `afters` run at
/// every exit. `befores` and `afters` are in registration order.
pub(crate) fn splice(
    cp: &mut ConstantPool,
    original: &CodeAttribute,
    site: &SpliceSite<'_>,
    befores: &[&Trampoline],
    afters: &[&Trampoline],
    emit_stack_map: bool,
) -> Result<CodeAttribute, InstrumentError> {
    let code = &original.code;
    let insns = decode(code)?;
    let entry_at = if site.is_constructor {
        constructor_entry(cp, code, &insns)?
    } else {
        0
    };

    let entry = entry_snippet(cp, site, befores)?;
    let (ret, handler) = if afters.is_empty() {
        (Snippet { code: Vec::new(), max_stack: 0 }, None)
    } else {
        (return_snippet(cp, site, afters)?, Some(handler_snippet(cp, site, afters)?))
    };

    let layout = Layout::new(&insns, code.len(), entry_at, entry.code.len(), ret.code.len());
    let mut out = Vec::with_capacity(layout.body_end + handler.as_ref().map_or(0, |h| h.code.len()));
    for (i, insn) in insns.iter().enumerate() {
        if i == entry_at {
            out.extend_from_slice(&entry.code);
        }
        if insn.is_return() {
            out.extend_from_slice(&ret.code);
        }
        debug_assert_eq!(out.len(), layout.starts[i]);
        emit_instruction(&mut out, code, insn, &layout)?;
    }

    let mut exception_table = Vec::with_capacity(original.exception_table.len() + 1);
    for e in &original.exception_table {
        exception_table.push(ExceptionTableEntry {
            start_pc: layout.target_u16(e.start_pc)?,
            end_pc: layout.target_u16(e.end_pc)?,
            handler_pc: layout.target_u16(e.handler_pc)?,
            catch_type: e.catch_type,
        });
    }

    let mut handler_frame = None;
    if let Some(handler) = &handler {
        let covered_from = layout.starts.get(entry_at).copied().unwrap_or(layout.body_end);
        exception_table.push(ExceptionTableEntry {
            start_pc: to_u16(covered_from)?,
            end_pc: to_u16(layout.body_end)?,
            handler_pc: to_u16(layout.body_end)?,
            catch_type: 0,
        });
        out.extend_from_slice(&handler.code);
        if emit_stack_map {
            let throwable = cp.class(THROWABLE)?;
            handler_frame = Some(StackMapFrame::Full {
                offset_delta: 0,
                locals: site.handler_locals(cp)?,
                stack: vec![VerificationTypeInfo::Object(throwable)],
            });
        }
    }

    let mut attributes = Vec::with_capacity(original.attributes.len() + 1);
    let mut saw_stack_map = false;
    for attr in &original.attributes {
        let name = cp.get_utf8(attr.name_index)?;
        let info = match name {
            "StackMapTable" => {
                saw_stack_map = true;
                let frames = relocate_frames(decode_stack_map_table(&attr.info)?, &layout, handler_frame.take())?;
                encode_stack_map_table(&frames)?
            }
            "LineNumberTable" => {
                let mut lines = decode_line_numbers(&attr.info)?;
                for line in &mut lines {
                    if line.start_pc != 0 {
                        line.start_pc = layout.target_u16(line.start_pc)?;
                    }
                }
                encode_line_numbers(&lines)?
            }
            "LocalVariableTable" | "LocalVariableTypeTable" => {
                let mut vars = decode_local_variables(&attr.info)?;
                for var in &mut vars {
                    let end = layout.target(var.start_pc as usize + var.length as usize)?;
                    let start = if var.start_pc == 0 { 0 } else { layout.target(var.start_pc as usize)? };
                    var.start_pc = to_u16(start)?;
                    var.length = to_u16(end - start)?;
                }
                encode_local_variables(&vars)?
            }
            other => {
                log::debug!("dropping {other} from {}: offsets cannot be relocated", site.class_name);
                continue;
            }
        };
        attributes.push(Attribute { name_index: attr.name_index, info });
    }
    if !saw_stack_map {
        if let Some(frame) = handler_frame {
            let frames = relocate_frames(Vec::new(), &layout, Some(frame))?;
            attributes.push(Attribute { name_index: cp.utf8("StackMapTable")?, info: encode_stack_map_table(&frames)? });
        }
    }

    let extra = entry.max_stack.max(ret.max_stack);
    let max_stack = original
        .max_stack
        .saturating_add(extra)
        .max(handler.as_ref().map_or(0, |h| h.max_stack));
    let min_locals = site.method_type.param_slots() + u16::from(!site.is_static);
    Ok(CodeAttribute {
        max_stack,
        max_locals: original.max_locals.max(min_locals),
        code: out,
        exception_table,
        attributes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{ALOAD_0, GOTO, IFEQ, ILOAD_0, IRETURN, RETURN};

    #[test]
    fn jump_to_return_lands_on_return_splice() {
        let insns = decode(&[ILOAD_0 + 1, IFEQ, 0, 4, RETURN, RETURN]).unwrap();
        let layout = Layout::new(&insns, 6, 0, 3, 5);
        assert_eq!(layout.position(0).unwrap(), 3);
        assert_eq!(layout.target(4).unwrap(), 7);
        assert_eq!(layout.position(4).unwrap(), 12);
        assert_eq!(layout.target(5).unwrap(), 13);
        assert_eq!(layout.body_end, 19);
        assert!(layout.position(2).is_err());
    }

    #[test]
    fn relocates_backward_goto() {
        // 0: aload_0  1: goto 0  4: ireturn(unreachable)
        let code = vec![ALOAD_0, GOTO, 0xff, 0xff, IRETURN];
        let insns = decode(&code).unwrap();
        let layout = Layout::new(&insns, code.len(), 0, 2, 0);
        let mut out = vec![0, 0];
        emit_instruction(&mut out, &code, &insns[0], &layout).unwrap();
        emit_instruction(&mut out, &code, &insns[1], &layout).unwrap();
        assert_eq!(&out[3..6], &[GOTO, 0xff, 0xff]);
    }
}
