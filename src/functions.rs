use serde::Serialize;

use std::collections::BTreeMap;

use crate::cancel::CancelToken;
use crate::disasm::Decoder;
use crate::pe::Bitness;
use crate::x86::{is_pad_byte, whole_operand_literal};

/* Sections larger than this skip the call-target pass; the other start
 * sources still apply */
const CALL_TARGET_SCAN_LIMIT: usize = 2 * 1024 * 1024;

/* Alignment padding runs must be at least this long to mark a start */
const MIN_PAD_RUN: usize = 2;

/* Function prologue byte signatures, matched without decoding. The pattern
 * length covers the trailing immediate bytes. */
const PROLOGUE_PATTERNS_64: [(&[u8], usize); 3] = [
    (&[0x55, 0x48, 0x89, 0xE5], 4), /* push rbp; mov rbp, rsp */
    (&[0x48, 0x83, 0xEC], 4),       /* sub rsp, imm8 */
    (&[0x48, 0x81, 0xEC], 7),       /* sub rsp, imm32 */
];

const PROLOGUE_PATTERNS_32: [(&[u8], usize); 2] = [
    (&[0x55, 0x8B, 0xEC], 3), /* push ebp; mov ebp, esp */
    (&[0x55, 0x89, 0xE5], 3),
];

#[derive(Default, Clone, Debug, Serialize)]
pub struct DisasmFunction {
    pub name: String,
    pub address: u64,
    pub size: u64,
}

impl DisasmFunction {
    pub fn end_address(&self) -> u64 {
        return self.address + self.size;
    }

    pub fn contains(&self, address: u64) -> bool {
        return address >= self.address && address < self.end_address();
    }
}

/// External knowledge fed into detection: the image entry point and the
/// export table, both carrying names the heuristics cannot invent.
#[derive(Default, Clone, Debug)]
pub struct DetectOptions {
    pub entry_point: Option<u64>,
    pub exports: Vec<(String, u64)>,
}

/// Unions four start sources over one code section, then derives sizes so
/// the returned functions tile the section in address order.
pub fn detect_functions(
    bytes: &[u8],
    base_va: u64,
    bitness: Bitness,
    options: &DetectOptions,
    decoder: &Decoder,
    cancel: &CancelToken,
) -> Vec<DisasmFunction> {
    let section_end = base_va + bytes.len() as u64;

    /* Start address -> externally provided name, if any */
    let mut starts: BTreeMap<u64, Option<String>> = BTreeMap::new();

    /* The section base always anchors the cover */
    starts.insert(base_va, None);

    if let Some(entry_point) = options.entry_point {
        if entry_point >= base_va && entry_point < section_end {
            starts.insert(entry_point, Some("entry_point".to_string()));
        }
    }

    for (name, va) in options.exports.iter() {
        if *va >= base_va && *va < section_end {
            starts.insert(*va, Some(name.clone()));
        }
    }

    scan_prologues(bytes, base_va, bitness, &mut starts);
    scan_alignment_pads(bytes, base_va, &mut starts);

    if bytes.len() < CALL_TARGET_SCAN_LIMIT {
        collect_call_targets(bytes, base_va, decoder, cancel, &mut starts);
    }

    let addresses: Vec<u64> = starts.keys().copied().collect();
    let mut functions: Vec<DisasmFunction> = Vec::with_capacity(addresses.len());

    for (i, address) in addresses.iter().enumerate() {
        let end = addresses.get(i + 1).copied().unwrap_or(section_end);

        let name = match starts.get(address) {
            Some(Some(name)) => name.clone(),
            _ => format!("sub_{:x}", address),
        };

        functions.push(DisasmFunction {
            name,
            address: *address,
            size: trimmed_size(bytes, base_va, *address, end),
        });
    }

    return functions;
}

/* Heuristic starts never overwrite a named one */
fn mark_start(starts: &mut BTreeMap<u64, Option<String>>, address: u64) {
    starts.entry(address).or_insert(None);
}

fn scan_prologues(
    bytes: &[u8],
    base_va: u64,
    bitness: Bitness,
    starts: &mut BTreeMap<u64, Option<String>>,
) {
    let patterns: &[(&[u8], usize)] = match bitness {
        Bitness::Bits64 => &PROLOGUE_PATTERNS_64,
        Bitness::Bits32 => &PROLOGUE_PATTERNS_32,
    };

    for i in 0..bytes.len() {
        for (prefix, length) in patterns.iter() {
            if i + length <= bytes.len() && bytes[i..].starts_with(prefix) {
                mark_start(starts, base_va + i as u64);
                break;
            }
        }
    }
}

fn scan_alignment_pads(bytes: &[u8], base_va: u64, starts: &mut BTreeMap<u64, Option<String>>) {
    let mut run_length = 0usize;

    for (i, &byte) in bytes.iter().enumerate() {
        if is_pad_byte(byte) {
            run_length += 1;
            continue;
        }

        if run_length >= MIN_PAD_RUN {
            mark_start(starts, base_va + i as u64);
        }

        run_length = 0;
    }
}

/*
 * Sweeps the whole section once and records the target of every direct
 * call that lands inside it.
 */
fn collect_call_targets(
    bytes: &[u8],
    base_va: u64,
    decoder: &Decoder,
    cancel: &CancelToken,
    starts: &mut BTreeMap<u64, Option<String>>,
) {
    let section_end = base_va + bytes.len() as u64;

    for instruction in decoder.disassemble(bytes, base_va, None, cancel) {
        if instruction.mnemonic != "call" {
            continue;
        }

        if let Some(target) = whole_operand_literal(&instruction.operands) {
            if target >= base_va && target < section_end {
                mark_start(starts, target);
            }
        }
    }
}

/*
 * Distance to the next start, with trailing alignment padding trimmed off.
 * A span that is nothing but padding keeps its untrimmed size.
 */
fn trimmed_size(bytes: &[u8], base_va: u64, start: u64, end: u64) -> u64 {
    let begin = (start - base_va) as usize;
    let mut finish = ((end - base_va) as usize).min(bytes.len());

    while finish > begin && is_pad_byte(bytes[finish - 1]) {
        finish -= 1;
    }

    if finish == begin {
        return end - start;
    }

    return (finish - begin) as u64;
}
