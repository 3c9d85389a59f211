use clap::Parser;
use regex::Regex;

use std::error::Error;

use pescope::analysis::{Analyzer, SectionAnalysis};
use pescope::disasm::{self, Instruction};
use pescope::pe::{self, PEImage, SectionHeader};

mod args;
mod dump;
mod format;

use crate::args::Args;
use crate::dump::Dump;

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();

    let bytes = std::fs::read(&args.file_path)?;
    let image = pe::parse(bytes)?;

    if args.json {
        return print_json(image);
    }

    if args.dos_header {
        dump_dos_header(&image).print(0, args.padding_size);
    }

    if args.coff_header {
        dump_coff_header(&image).print(0, args.padding_size);
    }

    if args.optional_header {
        dump_optional_header(&image).print(0, args.padding_size);
    }

    if args.sections {
        dump_sections(&image, &args.sections_filter)?.print(0, args.padding_size);
    }

    if args.imports {
        dump_imports(&image).print(0, args.padding_size);
    }

    if args.exports {
        dump_exports(&image).print(0, args.padding_size);
    }

    if args.strings {
        dump_strings(&image).print(0, args.padding_size);
    }

    if args.disasm || args.functions || args.xrefs || args.cfg {
        let mut analyzer = Analyzer::new(image)?;
        let sections = analyzer.analyze();

        for section in sections.iter() {
            if args.disasm {
                dump_disasm(section).print(0, args.padding_size);
            }

            if args.functions {
                dump_functions(&analyzer, section).print(0, args.padding_size);
            }

            if args.xrefs {
                dump_xrefs(section).print(0, args.padding_size);
            }

            if args.cfg {
                dump_cfg(&analyzer, section).print(0, args.padding_size);
            }
        }
    }

    return Ok(());
}

fn print_json(image: PEImage) -> Result<(), Box<dyn Error>> {
    let mut analyzer = Analyzer::new(image)?;
    let sections = analyzer.analyze();

    let mut section_reports: Vec<serde_json::Value> = Vec::new();

    for section in sections.iter() {
        let functions: Vec<serde_json::Value> = section
            .functions
            .iter()
            .map(|function| {
                let analysis = analyzer.analyze_function(function, section);

                serde_json::json!({
                    "name": &function.name,
                    "address": function.address,
                    "size": function.size,
                    "signature": analysis.signature,
                    "frame": analysis.frame,
                    "blocks": analysis.blocks,
                    "loops": analysis.loops,
                })
            })
            .collect();

        section_reports.push(serde_json::json!({
            "section": &section.section_name,
            "functions": functions,
            "xrefs": &section.xrefs,
        }));
    }

    let image = analyzer.get_image();

    let report = serde_json::json!({
        "machine": image.coff_header.get_machine_kind().to_string(),
        "coff_header": &image.coff_header,
        "optional_header": &image.optional_header,
        "sections": &image.sections,
        "imports": &image.imports,
        "exports": &image.exports,
        "strings": &image.strings,
        "analysis": section_reports,
    });

    println!("{}", serde_json::to_string_pretty(&report)?);

    return Ok(());
}

fn dump_dos_header(image: &PEImage) -> Dump {
    let mut dump = Dump::new("DOS Header");

    dump.push_field("e_magic", format!("{:#06x}", image.dos_header.e_magic));
    dump.push_field("e_lfanew", format!("{:#x}", image.dos_header.e_lfanew));

    return dump;
}

fn dump_coff_header(image: &PEImage) -> Dump {
    let header = &image.coff_header;
    let mut dump = Dump::new("COFF Header");

    dump.push_field(
        "machine",
        format!("{:#06x} ({})", header.machine, header.get_machine_kind()),
    );
    dump.push_field("number_of_sections", format!("{}", header.number_of_sections));
    dump.push_field(
        "time_date_stamp",
        format::Timestamp(header.time_date_stamp).to_string(),
    );
    dump.push_field(
        "size_of_optional_header",
        format!("{:#x}", header.size_of_optional_header),
    );
    dump.push_field("characteristics", format!("{:#06x}", header.characteristics));

    return dump;
}

fn dump_optional_header(image: &PEImage) -> Dump {
    let header = &image.optional_header;
    let mut dump = Dump::new("Optional Header");

    dump.push_field("magic", format!("{:#06x}", header.magic));
    dump.push_field(
        "address_of_entry_point",
        format!("{:#x}", header.address_of_entry_point),
    );
    dump.push_field("image_base", format!("{:#x}", header.image_base));
    dump.push_field("section_alignment", format!("{:#x}", header.section_alignment));
    dump.push_field("file_alignment", format!("{:#x}", header.file_alignment));
    dump.push_field("size_of_image", format!("{:#x}", header.size_of_image));
    dump.push_field("size_of_headers", format!("{:#x}", header.size_of_headers));
    dump.push_field("checksum", format!("{:#010x}", header.checksum));
    dump.push_field(
        "subsystem",
        format!("{} ({})", header.subsystem, pe::subsystem_name(header.subsystem)),
    );
    dump.push_field(
        "dll_characteristics",
        format!("{:#06x}", header.dll_characteristics),
    );
    dump.push_field(
        "number_of_rva_and_sizes",
        format!("{}", header.number_of_rva_and_sizes),
    );

    return dump;
}

fn dump_sections(image: &PEImage, filter: &str) -> Result<Dump, Box<dyn Error>> {
    let filter = Regex::new(filter)?;

    let mut dump = Dump::new("Sections");

    for section in image.sections.iter() {
        if !filter.is_match(&section.name) {
            continue;
        }

        let mut child = Dump::new(&section.name);

        child.push_field("virtual_address", format!("{:#x}", section.virtual_address));
        child.push_field("virtual_size", format!("{:#x}", section.virtual_size));
        child.push_field("raw_data_ptr", format!("{:#x}", section.ptr_to_raw_data));
        child.push_field("raw_data_size", format!("{:#x}", section.size_of_raw_data));
        child.push_field("permissions", section_permissions(section));

        dump.push_child(child);
    }

    return Ok(dump);
}

fn section_permissions(section: &SectionHeader) -> String {
    let mut permissions = String::new();

    permissions.push(if section.is_readable() { 'r' } else { '-' });
    permissions.push(if section.is_writable() { 'w' } else { '-' });
    permissions.push(if section.is_executable() { 'x' } else { '-' });

    return permissions;
}

fn dump_imports(image: &PEImage) -> Dump {
    let mut dump = Dump::new("Imports");

    for import in image.imports.iter() {
        let mut child = Dump::new(&import.library);

        for (function, va) in import.functions.iter().zip(import.iat_vas.iter()) {
            child.push_line(format!("{:#x}  {}", va, function));
        }

        dump.push_child(child);
    }

    return dump;
}

fn dump_exports(image: &PEImage) -> Dump {
    let mut dump = Dump::new("Exports");

    for export in image.exports.iter() {
        dump.push_line(format!(
            "{:#010x}  ordinal {:<5}  {}",
            export.rva, export.ordinal, export.name
        ));
    }

    return dump;
}

fn dump_strings(image: &PEImage) -> Dump {
    let mut dump = Dump::new("Strings");

    for (va, text) in image.strings.iter() {
        let encoding = image
            .string_encodings
            .get(va)
            .map(|encoding| encoding.to_string())
            .unwrap_or_default();

        dump.push_line(format!("{:#x}  [{}]  {}", va, encoding, text));
    }

    return dump;
}

fn dump_disasm(section: &SectionAnalysis) -> Dump {
    let mut dump = Dump::new(&format!("Disassembly of {}", section.section_name));

    let mut padding_run = 0usize;

    for instruction in section.instructions.iter() {
        if disasm::is_padding_instruction(instruction) {
            padding_run += 1;
            continue;
        }

        if padding_run > 0 {
            dump.push_line(format!("... {} padding instructions", padding_run));
            padding_run = 0;
        }

        dump.push_line(format_instruction(instruction));
    }

    if padding_run > 0 {
        dump.push_line(format!("... {} padding instructions", padding_run));
    }

    return dump;
}

fn format_instruction(instruction: &Instruction) -> String {
    let mut line = format!(
        "{:#014x}  {:<24}  {} {}",
        instruction.address,
        format::format_bytes(&instruction.bytes),
        instruction.mnemonic,
        instruction.operands,
    );

    if let Some(comment) = &instruction.comment {
        line.push_str(&format!("  ; {}", comment));
    }

    return line;
}

fn dump_functions(analyzer: &Analyzer, section: &SectionAnalysis) -> Dump {
    let mut dump = Dump::new(&format!("Functions in {}", section.section_name));

    for function in section.functions.iter() {
        let analysis = analyzer.analyze_function(function, section);

        let mut child = Dump::new(&function.name);

        child.push_field("address", format!("{:#x}", function.address));
        child.push_field("size", format!("{}", function.size));
        child.push_field("convention", analysis.signature.convention.to_string());
        child.push_field("params", format!("{}", analysis.signature.param_count));

        if let Some(frame) = &analysis.frame {
            child.push_field("frame_size", format!("{:#x}", frame.frame_size));

            for var in frame.vars.iter() {
                child.push_line(format!(
                    "{:<12} offset {:#x}, size {}, {} accesses",
                    var.name, var.offset, var.size, var.access_count
                ));
            }
        }

        dump.push_child(child);
    }

    return dump;
}

fn dump_xrefs(section: &SectionAnalysis) -> Dump {
    let mut dump = Dump::new(&format!("Cross references in {}", section.section_name));

    for (target, xrefs) in section.xrefs.iter() {
        for xref in xrefs.iter() {
            dump.push_line(format!("{:#x} <- {:#x} ({})", target, xref.from, xref.kind));
        }
    }

    return dump;
}

fn dump_cfg(analyzer: &Analyzer, section: &SectionAnalysis) -> Dump {
    let mut dump = Dump::new(&format!("Control flow in {}", section.section_name));

    for function in section.functions.iter() {
        let analysis = analyzer.analyze_function(function, section);

        let mut child = Dump::new(&function.name);

        for block in analysis.blocks.iter() {
            child.push_line(format!(
                "block {}: [{:#x}, {:#x}) -> {:?}",
                block.id, block.start_address, block.end_address, block.successors
            ));
        }

        for detected in analysis.loops.iter() {
            child.push_line(format!(
                "loop header {:#x}, back edge from {:#x}, depth {}",
                detected.header_address, detected.back_edge_from_address, detected.depth
            ));
        }

        dump.push_child(child);
    }

    return dump;
}
