use capstone::prelude::*;
use serde::Serialize;

use std::collections::VecDeque;

use crate::annotate::Annotator;
use crate::cancel::CancelToken;
use crate::pe::Bitness;

/* Decode granularity; bounds decoder memory on large sections and gives
 * callers a cancellation point */
pub const DECODE_CHUNK_SIZE: usize = 64 * 1024;

/// One decoded instruction. Owns its bytes so it can outlive the image it
/// was decoded from.
#[derive(Default, Clone, Debug, Serialize)]
pub struct Instruction {
    pub address: u64,
    pub bytes: Vec<u8>,
    pub mnemonic: String,
    pub operands: String,
    pub size: usize,
    pub comment: Option<String>,
}

impl Instruction {
    pub fn end_address(&self) -> u64 {
        return self.address + self.size as u64;
    }

    /// Conditional branch (jne, jz, ja, ...), never jmp itself.
    pub fn is_branch(&self) -> bool {
        return self.mnemonic.starts_with('j') && self.mnemonic != "jmp";
    }

    pub fn is_return(&self) -> bool {
        return matches!(self.mnemonic.as_str(), "ret" | "retn");
    }

    pub fn is_control_flow(&self) -> bool {
        return self.mnemonic == "call" || self.mnemonic.starts_with('j') || self.is_return();
    }
}

/// Filler emitted by linkers between functions.
pub fn is_padding_instruction(instruction: &Instruction) -> bool {
    match (instruction.mnemonic.as_str(), instruction.operands.as_str()) {
        ("int3", _) => return true,
        ("nop", _) => return true,
        ("add", "byte ptr [rax], al") => return true,
        _ => return false,
    }
}

/*
 * Capstone wrapper. One instance per analysis; capstone handles are not
 * safe to share across threads, concurrent disassembly uses independent
 * decoders.
 */
pub struct Decoder {
    capstone: Capstone,
    bitness: Bitness,
}

impl Decoder {
    pub fn new(bitness: Bitness) -> Result<Decoder, capstone::Error> {
        let mode = match bitness {
            Bitness::Bits32 => arch::x86::ArchMode::Mode32,
            Bitness::Bits64 => arch::x86::ArchMode::Mode64,
        };

        let capstone = Capstone::new()
            .x86()
            .mode(mode)
            .syntax(arch::x86::ArchSyntax::Intel)
            .detail(false)
            .build()?;

        return Ok(Decoder { capstone, bitness });
    }

    pub fn get_bitness(&self) -> Bitness {
        return self.bitness;
    }

    /// Lazy linear sweep over the given bytes. The stream decodes one chunk
    /// at a time and may be abandoned at any point; emitted instructions
    /// stay valid.
    pub fn disassemble<'a>(
        &'a self,
        bytes: &'a [u8],
        base_va: u64,
        annotator: Option<&'a Annotator>,
        cancel: &CancelToken,
    ) -> InstructionStream<'a> {
        return InstructionStream {
            decoder: self,
            bytes,
            base_va,
            offset: 0,
            pending: VecDeque::new(),
            annotator,
            cancel: cancel.clone(),
        };
    }
}

pub struct InstructionStream<'a> {
    decoder: &'a Decoder,
    bytes: &'a [u8],
    base_va: u64,
    offset: usize,
    pending: VecDeque<Instruction>,
    annotator: Option<&'a Annotator<'a>>,
    cancel: CancelToken,
}

impl InstructionStream<'_> {
    fn decode_next_chunk(&mut self) {
        while self.pending.is_empty() && self.offset < self.bytes.len() {
            if self.cancel.is_cancelled() {
                self.offset = self.bytes.len();
                return;
            }

            let end = (self.offset + DECODE_CHUNK_SIZE).min(self.bytes.len());
            let chunk_va = self.base_va + self.offset as u64;

            let decoded = match self
                .decoder
                .capstone
                .disasm_all(&self.bytes[self.offset..end], chunk_va)
            {
                Ok(decoded) => decoded,
                Err(error) => {
                    log::debug!("Decoder gave up on chunk at {:#x}: {}", chunk_va, error);
                    self.offset = end;
                    continue;
                }
            };

            if decoded.is_empty() {
                /* Nothing decodable here, resynchronize one byte forward */
                self.offset += 1;
                continue;
            }

            let mut next_offset = self.offset;

            for insn in decoded.iter() {
                next_offset = (insn.address() - self.base_va) as usize + insn.bytes().len();
                self.pending.push_back(self.convert(insn));
            }

            self.offset = next_offset;
        }
    }

    fn convert(&self, insn: &capstone::Insn) -> Instruction {
        let mut instruction = Instruction {
            address: insn.address(),
            bytes: insn.bytes().to_vec(),
            mnemonic: insn.mnemonic().unwrap_or("").to_string(),
            operands: insn.op_str().unwrap_or("").to_string(),
            size: insn.bytes().len(),
            comment: None,
        };

        if let Some(annotator) = self.annotator {
            instruction.comment = annotator.comment_for(&instruction);
        }

        return instruction;
    }
}

impl Iterator for InstructionStream<'_> {
    type Item = Instruction;

    fn next(&mut self) -> Option<Instruction> {
        if self.pending.is_empty() {
            self.decode_next_chunk();
        }

        return self.pending.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decoder() -> Decoder {
        return Decoder::new(Bitness::Bits64).unwrap();
    }

    #[test]
    fn decodes_a_simple_sequence_in_order() {
        /* sub rsp, 0x28; mov eax, 1; add rsp, 0x28; ret */
        let bytes = [
            0x48, 0x83, 0xEC, 0x28, 0xB8, 0x01, 0x00, 0x00, 0x00, 0x48, 0x83, 0xC4, 0x28, 0xC3,
        ];

        let decoder = decoder();
        let cancel = CancelToken::new();
        let instructions: Vec<Instruction> =
            decoder.disassemble(&bytes, 0x180001000, None, &cancel).collect();

        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[0].address, 0x180001000);
        assert_eq!(instructions[0].mnemonic, "sub");
        assert_eq!(instructions[0].operands, "rsp, 0x28");
        assert_eq!(instructions[0].bytes, vec![0x48, 0x83, 0xEC, 0x28]);
        assert_eq!(instructions[3].mnemonic, "ret");
        assert_eq!(instructions[3].end_address(), 0x180001000 + 14);
    }

    #[test]
    fn resynchronizes_past_undecodable_bytes() {
        /* ret followed by a lone prefix byte that cannot decode */
        let bytes = [0xC3, 0x66];

        let decoder = decoder();
        let cancel = CancelToken::new();
        let instructions: Vec<Instruction> =
            decoder.disassemble(&bytes, 0x1000, None, &cancel).collect();

        assert_eq!(instructions.len(), 1);
        assert_eq!(instructions[0].mnemonic, "ret");
    }

    #[test]
    fn cancellation_stops_at_a_chunk_boundary() {
        let bytes = [0x90u8; 32];

        let decoder = decoder();
        let cancel = CancelToken::new();
        cancel.cancel();

        let instructions: Vec<Instruction> =
            decoder.disassemble(&bytes, 0x1000, None, &cancel).collect();

        assert!(instructions.is_empty());
    }

    #[test]
    fn padding_detection_covers_linker_filler() {
        let int3 = Instruction {
            mnemonic: "int3".to_string(),
            ..Instruction::default()
        };
        let nop = Instruction {
            mnemonic: "nop".to_string(),
            ..Instruction::default()
        };
        let mov = Instruction {
            mnemonic: "mov".to_string(),
            operands: "rax, rcx".to_string(),
            ..Instruction::default()
        };

        assert!(is_padding_instruction(&int3));
        assert!(is_padding_instruction(&nop));
        assert!(!is_padding_instruction(&mov));
    }
}
