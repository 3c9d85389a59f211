use regex::Regex;
use serde::Serialize;
use strum_macros::Display;

use std::collections::BTreeMap;

use crate::disasm::Instruction;
use crate::x86::{parse_int_literal, whole_operand_literal};

/* Literals at or below this look like constants, not addresses */
const DATA_XREF_FLOOR: u64 = 0x10000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
pub enum XrefKind {
    #[strum(serialize = "call")]
    Call,
    #[strum(serialize = "jmp")]
    Jmp,
    #[strum(serialize = "branch")]
    Branch,
    #[strum(serialize = "data")]
    Data,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct Xref {
    pub from: u64,
    pub kind: XrefKind,
}

/// Builds the target VA -> references map over a decoded instruction
/// stream. References are appended in encounter order, so per-target lists
/// are sorted by source address.
pub fn build_xref_map(instructions: &[Instruction]) -> BTreeMap<u64, Vec<Xref>> {
    let rip_relative =
        Regex::new(r"\[rip ([+-]) (0x[0-9a-fA-F]+|\d+)\]").expect("rip operand pattern");
    let hex_literal = Regex::new(r"0x[0-9a-fA-F]+").expect("hex literal pattern");

    let mut map: BTreeMap<u64, Vec<Xref>> = BTreeMap::new();

    for instruction in instructions.iter() {
        /* Direct control transfers print a lone hex target */
        if let Some(target) = whole_operand_literal(&instruction.operands) {
            let kind = match instruction.mnemonic.as_str() {
                "call" => Some(XrefKind::Call),
                "jmp" => Some(XrefKind::Jmp),
                mnemonic if mnemonic.starts_with('j') => Some(XrefKind::Branch),
                _ => None,
            };

            if let Some(kind) = kind {
                map.entry(target).or_default().push(Xref {
                    from: instruction.address,
                    kind,
                });

                continue;
            }
        }

        /* RIP-relative memory operands resolve to a concrete VA */
        if let Some(captures) = rip_relative.captures(&instruction.operands) {
            if let Some(displacement) = parse_int_literal(&captures[2]) {
                let end = instruction.end_address();

                let target = if &captures[1] == "+" {
                    end.wrapping_add(displacement)
                } else {
                    end.wrapping_sub(displacement)
                };

                let kind = match instruction.mnemonic.as_str() {
                    "call" => XrefKind::Call,
                    "jmp" => XrefKind::Jmp,
                    _ => XrefKind::Data,
                };

                map.entry(target).or_default().push(Xref {
                    from: instruction.address,
                    kind,
                });

                continue;
            }
        }

        /* Remaining literals on non-control instructions are data refs */
        if !instruction.is_control_flow() {
            for found in hex_literal.find_iter(&instruction.operands) {
                if let Some(value) = parse_int_literal(found.as_str()) {
                    if value > DATA_XREF_FLOOR {
                        map.entry(value).or_default().push(Xref {
                            from: instruction.address,
                            kind: XrefKind::Data,
                        });
                    }
                }
            }
        }
    }

    return map;
}
