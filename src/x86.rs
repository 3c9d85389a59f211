/*
 * Text-level helpers over decoded operand strings. The decoder emits Intel
 * syntax, so registers and literals can be classified without re-decoding.
 */

/* Windows x64 integer argument registers with their narrower aliases */
pub const X64_ARG_REGISTERS: [[&str; 4]; 4] = [
    ["rcx", "ecx", "cx", "cl"],
    ["rdx", "edx", "dx", "dl"],
    ["r8", "r8d", "r8w", "r8b"],
    ["r9", "r9d", "r9w", "r9b"],
];

/* Aliases of ecx checked for thiscall detection */
pub const ECX_ALIASES: [&str; 3] = ["ecx", "cx", "cl"];

/* int3 and nop bytes used by linkers to align functions */
pub fn is_pad_byte(byte: u8) -> bool {
    return byte == 0xCC || byte == 0x90;
}

/// Whether the operand text mentions any of the given register aliases as a
/// whole token (so "rcx" does not match inside "r8" scaling expressions or
/// partial register names).
pub fn operand_mentions_register(operands: &str, aliases: &[&str]) -> bool {
    return operands
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|token| aliases.contains(&token));
}

/// Splits "dst, src" operands. Instructions with a single operand yield an
/// empty source.
pub fn split_operands(operands: &str) -> (&str, &str) {
    match operands.split_once(',') {
        Some((destination, source)) => return (destination.trim(), source.trim()),
        None => return (operands.trim(), ""),
    }
}

/// Parses an integer literal as the decoder prints it: "0x28" for large
/// values, plain decimal for small ones.
pub fn parse_int_literal(text: &str) -> Option<u64> {
    if let Some(hex) = text.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok();
    }

    return text.parse::<u64>().ok();
}

/// An operand that consists solely of one hex literal, as printed for direct
/// call and jump targets. Anything else (registers, memory, operand lists)
/// yields None; this stays deliberately conservative.
pub fn whole_operand_literal(operands: &str) -> Option<u64> {
    let hex = operands.strip_prefix("0x")?;

    if hex.is_empty() || !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }

    return u64::from_str_radix(hex, 16).ok();
}

/// Access width from the memory operand qualifier, if any.
pub fn operand_size_from_qualifier(operands: &str) -> Option<u32> {
    if operands.contains("qword ptr") {
        return Some(8);
    }

    if operands.contains("dword ptr") {
        return Some(4);
    }

    if operands.contains("byte ptr") {
        return Some(1);
    }

    if operands.contains("word ptr") {
        return Some(2);
    }

    return None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_tokens_do_not_match_partially() {
        assert!(operand_mentions_register("rcx, rax", &X64_ARG_REGISTERS[0]));
        assert!(operand_mentions_register("dword ptr [r8 + 4]", &X64_ARG_REGISTERS[2]));
        assert!(!operand_mentions_register("r8d, 1", &X64_ARG_REGISTERS[3]));
        assert!(!operand_mentions_register("rax, rbx", &X64_ARG_REGISTERS[0]));
    }

    #[test]
    fn whole_operand_literal_is_conservative() {
        assert_eq!(whole_operand_literal("0x40000a"), Some(0x40000A));
        assert_eq!(whole_operand_literal("0x10, 0x20"), None);
        assert_eq!(whole_operand_literal("rax"), None);
        assert_eq!(whole_operand_literal("qword ptr [rip + 0x100]"), None);
    }

    #[test]
    fn int_literals_parse_both_spellings() {
        assert_eq!(parse_int_literal("0x28"), Some(0x28));
        assert_eq!(parse_int_literal("8"), Some(8));
        assert_eq!(parse_int_literal("rsp"), None);
    }

    #[test]
    fn qualifier_sizes() {
        assert_eq!(operand_size_from_qualifier("dword ptr [rbp - 8], 1"), Some(4));
        assert_eq!(operand_size_from_qualifier("word ptr [ebp + 8]"), Some(2));
        assert_eq!(operand_size_from_qualifier("byte ptr [rsp + 0x20]"), Some(1));
        assert_eq!(operand_size_from_qualifier("qword ptr [rsp + 0x28]"), Some(8));
        assert_eq!(operand_size_from_qualifier("rax, rcx"), None);
    }
}
