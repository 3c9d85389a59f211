use regex::Regex;
use serde::Serialize;
use strum_macros::Display;

use crate::disasm::Instruction;
use crate::functions::DisasmFunction;
use crate::pe::Bitness;
use crate::x86::{
    operand_mentions_register, parse_int_literal, split_operands, ECX_ALIASES, X64_ARG_REGISTERS,
};

/* How many leading instructions the register scan considers */
const REGISTER_SCAN_WINDOW: usize = 20;

/* Window for the ecx-before-write thiscall check */
const THISCALL_SCAN_WINDOW: usize = 10;

/* First x64 stack parameter slot, right above the 0x20 shadow space and
 * the return address */
const X64_STACK_PARAM_BASE: u64 = 0x28;

/* First x86 parameter offset above the saved ebp and return address */
const X86_PARAM_BASE: u64 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
pub enum CallingConvention {
    #[strum(serialize = "fastcall")]
    Fastcall,
    #[strum(serialize = "cdecl")]
    Cdecl,
    #[strum(serialize = "stdcall")]
    Stdcall,
    #[strum(serialize = "thiscall")]
    Thiscall,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct FunctionSignature {
    pub convention: CallingConvention,
    pub param_count: usize,
}

/// Heuristic calling convention and parameter count for one function. The
/// instruction stream covers the whole section; only the function's range
/// is considered.
pub fn infer_signature(
    function: &DisasmFunction,
    instructions: &[Instruction],
    bitness: Bitness,
) -> FunctionSignature {
    let body: Vec<&Instruction> = instructions
        .iter()
        .filter(|instruction| function.contains(instruction.address))
        .collect();

    match bitness {
        Bitness::Bits64 => return infer_x64(&body),
        Bitness::Bits32 => return infer_x86(&body),
    }
}

/*
 * Windows x64: everything is fastcall. A register argument exists when
 * rcx/rdx/r8/r9 is read before anything writes it; stack arguments show up
 * as [rsp + N] accesses above the shadow space.
 */
fn infer_x64(body: &[&Instruction]) -> FunctionSignature {
    let mut written = [false; 4];
    let mut read_before_write = [false; 4];

    for instruction in body.iter().take(REGISTER_SCAN_WINDOW) {
        for (slot, aliases) in X64_ARG_REGISTERS.iter().enumerate() {
            if register_read(instruction, aliases) && !written[slot] {
                read_before_write[slot] = true;
            }

            if register_written(instruction, aliases) {
                written[slot] = true;
            }
        }
    }

    let mut param_count = read_before_write
        .iter()
        .rposition(|&read| read)
        .map_or(0, |slot| slot + 1);

    let stack_slot = Regex::new(r"\[rsp \+ (0x[0-9a-fA-F]+|\d+)\]").expect("rsp operand pattern");

    for instruction in body.iter() {
        let Some(captures) = stack_slot.captures(&instruction.operands) else {
            continue;
        };

        if let Some(offset) = parse_int_literal(&captures[1]) {
            if offset >= X64_STACK_PARAM_BASE {
                let index = 5 + ((offset - X64_STACK_PARAM_BASE) / 8) as usize;
                param_count = param_count.max(index);
            }
        }
    }

    return FunctionSignature {
        convention: CallingConvention::Fastcall,
        param_count,
    };
}

/*
 * 32 bits: a ret with a positive immediate means the callee cleans the
 * stack (stdcall); an early ecx read without a prior write suggests a
 * this-pointer; everything else is cdecl.
 */
fn infer_x86(body: &[&Instruction]) -> FunctionSignature {
    if let Some(last) = body.last() {
        if last.is_return() && !last.operands.is_empty() {
            if let Some(cleanup) = parse_int_literal(&last.operands) {
                if cleanup > 0 {
                    return FunctionSignature {
                        convention: CallingConvention::Stdcall,
                        param_count: (cleanup / 4) as usize,
                    };
                }
            }
        }
    }

    let mut convention = CallingConvention::Cdecl;
    let mut ecx_written = false;

    for instruction in body.iter().take(THISCALL_SCAN_WINDOW) {
        if register_read(instruction, &ECX_ALIASES) && !ecx_written {
            convention = CallingConvention::Thiscall;
            break;
        }

        if register_written(instruction, &ECX_ALIASES) {
            ecx_written = true;
        }
    }

    let param_slot = Regex::new(r"\[ebp \+ (0x[0-9a-fA-F]+|\d+)\]").expect("ebp operand pattern");
    let mut highest: Option<u64> = None;

    for instruction in body.iter() {
        let Some(captures) = param_slot.captures(&instruction.operands) else {
            continue;
        };

        if let Some(offset) = parse_int_literal(&captures[1]) {
            if offset >= X86_PARAM_BASE {
                highest = Some(highest.map_or(offset, |h| h.max(offset)));
            }
        }
    }

    let param_count = highest.map_or(0, |offset| ((offset - X86_PARAM_BASE) / 4 + 1) as usize);

    return FunctionSignature {
        convention,
        param_count,
    };
}

fn register_read(instruction: &Instruction, aliases: &[&str]) -> bool {
    let operands = instruction.operands.as_str();
    let (destination, source) = split_operands(operands);

    match instruction.mnemonic.as_str() {
        "mov" | "lea" | "movzx" | "movsx" => {
            return operand_mentions_register(source, aliases)
                && !operand_mentions_register(destination, aliases);
        }
        "cmp" | "test" | "push" => {
            return operand_mentions_register(operands, aliases);
        }
        "call" => return false,
        "add" | "sub" | "and" | "or" | "xor" => {
            /* xor r, r and sub r, r zero the register without reading it */
            if matches!(instruction.mnemonic.as_str(), "xor" | "sub")
                && operand_mentions_register(destination, aliases)
                && operand_mentions_register(source, aliases)
            {
                return false;
            }

            return operand_mentions_register(destination, aliases);
        }
        _ => return false,
    }
}

fn register_written(instruction: &Instruction, aliases: &[&str]) -> bool {
    let (destination, source) = split_operands(&instruction.operands);

    match instruction.mnemonic.as_str() {
        "mov" | "lea" => return operand_mentions_register(destination, aliases),
        "xor" | "sub" => {
            return operand_mentions_register(destination, aliases)
                && operand_mentions_register(source, aliases);
        }
        _ => return false,
    }
}
