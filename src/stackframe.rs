use regex::Regex;
use serde::Serialize;

use std::collections::BTreeMap;

use crate::disasm::Instruction;
use crate::functions::DisasmFunction;
use crate::pe::Bitness;
use crate::x86::{operand_size_from_qualifier, parse_int_literal, split_operands};

/* Prologue window scanned for the frame allocation */
const FRAME_SCAN_WINDOW: usize = 10;

/* Lowest frame-pointer offset that can hold a parameter, above the saved
 * frame pointer and the return address */
const X64_PARAM_FLOOR: u64 = 0x10;
const X86_PARAM_FLOOR: u64 = 0x8;

#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StackVar {
    pub offset: u64,
    pub size: u32,
    pub access_count: u32,
    pub name: String,
    pub is_param: bool,
}

#[derive(Default, Clone, Debug, PartialEq, Eq, Serialize)]
pub struct StackFrame {
    pub frame_size: u64,
    pub vars: Vec<StackVar>,
}

/// Frame size and stack variable summary for one function, or None when
/// nothing frame-related is visible. Only the first prologue allocation is
/// honored, so frames split across a __chkstk helper are under-reported.
pub fn analyze_stack_frame(
    function: &DisasmFunction,
    instructions: &[Instruction],
    bitness: Bitness,
) -> Option<StackFrame> {
    let body: Vec<&Instruction> = instructions
        .iter()
        .filter(|instruction| function.contains(instruction.address))
        .collect();

    if body.is_empty() {
        return None;
    }

    let frame_size = detect_frame_size(&body);

    let local_below_frame =
        Regex::new(r"\[(?:rbp|ebp) - (0x[0-9a-fA-F]+|\d+)\]").expect("frame local pattern");
    let local_above_stack =
        Regex::new(r"\[(?:rsp|esp) \+ (0x[0-9a-fA-F]+|\d+)\]").expect("stack local pattern");
    let param_above_frame =
        Regex::new(r"\[(?:rbp|ebp) \+ (0x[0-9a-fA-F]+|\d+)\]").expect("frame param pattern");

    let param_floor = match bitness {
        Bitness::Bits64 => X64_PARAM_FLOOR,
        Bitness::Bits32 => X86_PARAM_FLOOR,
    };

    /* (is_param, offset) -> (access count, widest observed size) */
    let mut slots: BTreeMap<(bool, u64), (u32, u32)> = BTreeMap::new();

    for instruction in body.iter() {
        let size = operand_size_from_qualifier(&instruction.operands)
            .unwrap_or(bitness.pointer_width());

        for pattern in [&local_below_frame, &local_above_stack] {
            if let Some(captures) = pattern.captures(&instruction.operands) {
                if let Some(offset) = parse_int_literal(&captures[1]) {
                    record_access(&mut slots, false, offset, size);
                }
            }
        }

        if let Some(captures) = param_above_frame.captures(&instruction.operands) {
            if let Some(offset) = parse_int_literal(&captures[1]) {
                if offset >= param_floor {
                    record_access(&mut slots, true, offset, size);
                }
            }
        }
    }

    if slots.is_empty() && frame_size == 0 {
        return None;
    }

    let mut vars: Vec<StackVar> = slots
        .iter()
        .map(|((is_param, offset), (access_count, size))| StackVar {
            offset: *offset,
            size: *size,
            access_count: *access_count,
            name: String::new(),
            is_param: *is_param,
        })
        .collect();

    vars.sort_by_key(|var| var.offset);

    let mut param_index = 0usize;

    for var in vars.iter_mut() {
        if var.is_param {
            var.name = format!("arg_{}", param_index);
            param_index += 1;
        } else {
            var.name = format!("var_{:x}", var.offset);
        }
    }

    return Some(StackFrame { frame_size, vars });
}

/* First sub rsp/esp, imm in the prologue wins; anything later (or a second
 * allocation) is ignored on purpose */
fn detect_frame_size(body: &[&Instruction]) -> u64 {
    for instruction in body.iter().take(FRAME_SCAN_WINDOW) {
        if instruction.mnemonic != "sub" {
            continue;
        }

        let (destination, source) = split_operands(&instruction.operands);

        if destination != "rsp" && destination != "esp" {
            continue;
        }

        if let Some(size) = parse_int_literal(source) {
            return size;
        }
    }

    return 0;
}

fn record_access(slots: &mut BTreeMap<(bool, u64), (u32, u32)>, is_param: bool, offset: u64, size: u32) {
    let slot = slots.entry((is_param, offset)).or_insert((0, 0));
    slot.0 += 1;
    slot.1 = slot.1.max(size);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instruction(address: u64, size: usize, mnemonic: &str, operands: &str) -> Instruction {
        return Instruction {
            address,
            bytes: vec![0; size],
            mnemonic: mnemonic.to_string(),
            operands: operands.to_string(),
            size,
            comment: None,
        };
    }

    fn function(address: u64, size: u64) -> DisasmFunction {
        return DisasmFunction {
            name: String::new(),
            address,
            size,
        };
    }

    #[test]
    fn frame_size_comes_from_the_first_allocation() {
        let instructions = vec![
            instruction(0x1000, 4, "sub", "rsp, 0x28"),
            instruction(0x1004, 4, "sub", "rsp, 0x100"),
            instruction(0x1008, 1, "ret", ""),
        ];

        let frame =
            analyze_stack_frame(&function(0x1000, 9), &instructions, Bitness::Bits64).unwrap();

        assert_eq!(frame.frame_size, 0x28);
        assert!(frame.vars.is_empty());
    }

    #[test]
    fn locals_and_params_are_sorted_and_named() {
        let instructions = vec![
            instruction(0x1000, 4, "sub", "rsp, 0x20"),
            instruction(0x1004, 4, "mov", "dword ptr [rbp - 0x10], eax"),
            instruction(0x1008, 4, "mov", "dword ptr [rbp - 0x10], ecx"),
            instruction(0x100C, 5, "mov", "rax, qword ptr [rbp + 0x18]"),
            instruction(0x1011, 1, "ret", ""),
        ];

        let frame =
            analyze_stack_frame(&function(0x1000, 18), &instructions, Bitness::Bits64).unwrap();

        assert_eq!(frame.frame_size, 0x20);
        assert_eq!(frame.vars.len(), 2);

        assert_eq!(frame.vars[0].name, "var_10");
        assert_eq!(frame.vars[0].offset, 0x10);
        assert_eq!(frame.vars[0].access_count, 2);
        assert_eq!(frame.vars[0].size, 4);
        assert!(!frame.vars[0].is_param);

        assert_eq!(frame.vars[1].name, "arg_0");
        assert_eq!(frame.vars[1].offset, 0x18);
        assert_eq!(frame.vars[1].size, 8);
        assert!(frame.vars[1].is_param);
    }

    #[test]
    fn low_frame_offsets_are_not_params() {
        let instructions = vec![
            instruction(0x1000, 4, "mov", "rax, qword ptr [rbp + 8]"),
            instruction(0x1004, 1, "ret", ""),
        ];

        let frame = analyze_stack_frame(&function(0x1000, 5), &instructions, Bitness::Bits64);

        /* 0x8 holds the saved frame pointer in 64 bits mode */
        assert!(frame.is_none());
    }

    #[test]
    fn stack_pointer_offsets_count_as_locals() {
        let instructions = vec![
            instruction(0x1000, 5, "mov", "dword ptr [esp + 0x4], eax"),
            instruction(0x1005, 1, "ret", ""),
        ];

        let frame =
            analyze_stack_frame(&function(0x1000, 6), &instructions, Bitness::Bits32).unwrap();

        assert_eq!(frame.frame_size, 0);
        assert_eq!(frame.vars.len(), 1);
        assert_eq!(frame.vars[0].name, "var_4");
        assert_eq!(frame.vars[0].size, 4);
    }

    #[test]
    fn functions_without_frames_report_none() {
        let instructions = vec![
            instruction(0x1000, 3, "mov", "rax, rcx"),
            instruction(0x1003, 1, "ret", ""),
        ];

        let frame = analyze_stack_frame(&function(0x1000, 4), &instructions, Bitness::Bits64);

        assert!(frame.is_none());
    }
}
