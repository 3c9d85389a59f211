use regex::Regex;

use std::collections::{BTreeMap, HashMap};

use crate::disasm::Instruction;

/* Comments longer than this are truncated for display */
const MAX_COMMENT_LENGTH: usize = 60;

/// Resolves operand references against the string table and the IAT and
/// turns them into human readable comments. Pure; the maps are read-only
/// and may be shared.
pub struct Annotator<'a> {
    strings: &'a BTreeMap<u64, String>,
    iat: &'a HashMap<u64, (String, String)>,
    rip_relative: Regex,
    hex_literal: Regex,
}

impl<'a> Annotator<'a> {
    pub fn new(
        strings: &'a BTreeMap<u64, String>,
        iat: &'a HashMap<u64, (String, String)>,
    ) -> Annotator<'a> {
        return Annotator {
            strings,
            iat,
            rip_relative: Regex::new(r"\[rip ([+-]) (0x[0-9a-fA-F]+|\d+)\]")
                .expect("rip operand pattern"),
            hex_literal: Regex::new(r"0x[0-9a-fA-F]+").expect("hex literal pattern"),
        };
    }

    /// RIP-relative references win over absolute immediates, and strings win
    /// over IAT entries; comments must stay stable across runs.
    pub fn comment_for(&self, instruction: &Instruction) -> Option<String> {
        if let Some(captures) = self.rip_relative.captures(&instruction.operands) {
            if let Some(displacement) = crate::x86::parse_int_literal(&captures[2]) {
                let end = instruction.end_address();

                let target = if &captures[1] == "+" {
                    end.wrapping_add(displacement)
                } else {
                    end.wrapping_sub(displacement)
                };

                if let Some(text) = self.strings.get(&target) {
                    return Some(truncate_comment(text));
                }

                if let Some((library, function)) = self.iat.get(&target) {
                    return Some(format!("{}!{}", library, function));
                }
            }
        }

        for found in self.hex_literal.find_iter(&instruction.operands) {
            if let Some(value) = crate::x86::parse_int_literal(found.as_str()) {
                if let Some(text) = self.strings.get(&value) {
                    return Some(truncate_comment(text));
                }
            }
        }

        for found in self.hex_literal.find_iter(&instruction.operands) {
            if let Some(value) = crate::x86::parse_int_literal(found.as_str()) {
                if let Some((library, function)) = self.iat.get(&value) {
                    return Some(format!("{}!{}", library, function));
                }
            }
        }

        return None;
    }
}

fn truncate_comment(text: &str) -> String {
    if text.len() > MAX_COMMENT_LENGTH {
        return format!("{}...", &text[..MAX_COMMENT_LENGTH - 3]);
    }

    return text.to_string();
}
