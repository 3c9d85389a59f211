use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::annotate::Annotator;
use crate::cancel::CancelToken;
use crate::cfg::{self, BasicBlock, Loop};
use crate::disasm::{Decoder, Instruction};
use crate::functions::{self, DetectOptions, DisasmFunction};
use crate::pe::{PEImage, SectionHeader};
use crate::signature::{self, FunctionSignature};
use crate::stackframe::{self, StackFrame};
use crate::xref::{self, Xref};

/// Everything the pipeline produces for one executable section.
pub struct SectionAnalysis {
    pub section_name: String,
    pub base_va: u64,
    pub instructions: Arc<Vec<Instruction>>,
    pub functions: Vec<DisasmFunction>,
    pub xrefs: BTreeMap<u64, Vec<Xref>>,
}

/// Per-function passes over an already analyzed section.
pub struct FunctionAnalysis {
    pub blocks: Vec<BasicBlock>,
    pub loops: Vec<Loop>,
    pub signature: FunctionSignature,
    pub frame: Option<StackFrame>,
}

/*
 * Pipeline facade around one image. Owns the decoder and the memoized
 * disassembly; both die with the analyzer, so a new image always starts
 * from a cold cache.
 */
pub struct Analyzer {
    image: PEImage,
    decoder: Decoder,
    iat: HashMap<u64, (String, String)>,
    disasm_cache: HashMap<(u64, usize), Arc<Vec<Instruction>>>,
    cancel: CancelToken,
}

impl Analyzer {
    pub fn new(image: PEImage) -> Result<Analyzer, capstone::Error> {
        let decoder = Decoder::new(image.get_bitness())?;
        let iat = image.get_iat_map();

        return Ok(Analyzer {
            image,
            decoder,
            iat,
            disasm_cache: HashMap::new(),
            cancel: CancelToken::new(),
        });
    }

    pub fn get_image(&self) -> &PEImage {
        return &self.image;
    }

    /// Token shared with every pass; cancelling it stops the analysis at
    /// the next chunk boundary.
    pub fn get_cancel_token(&self) -> CancelToken {
        return self.cancel.clone();
    }

    /// Annotated disassembly of one section, memoized on (base VA, length).
    pub fn disassemble_section(&mut self, section: &SectionHeader) -> Arc<Vec<Instruction>> {
        let base_va = self.image.get_image_base() + section.virtual_address as u64;
        let key = (base_va, section.size_of_raw_data as usize);

        if let Some(cached) = self.disasm_cache.get(&key) {
            return cached.clone();
        }

        let annotator = Annotator::new(&self.image.strings, &self.iat);
        let data = self.image.get_section_data(section);

        let instructions: Arc<Vec<Instruction>> = Arc::new(
            self.decoder
                .disassemble(data, base_va, Some(&annotator), &self.cancel)
                .collect(),
        );

        self.disasm_cache.insert(key, instructions.clone());

        return instructions;
    }

    /// Runs the full section pipeline over every executable section.
    pub fn analyze(&mut self) -> Vec<SectionAnalysis> {
        let sections: Vec<SectionHeader> = self
            .image
            .sections
            .iter()
            .filter(|section| section.is_executable())
            .cloned()
            .collect();

        let options = DetectOptions {
            entry_point: self.image.get_entry_point_va(),
            exports: self.image.get_export_functions(),
        };

        let mut results: Vec<SectionAnalysis> = Vec::new();

        for section in sections.iter() {
            if self.cancel.is_cancelled() {
                break;
            }

            let base_va = self.image.get_image_base() + section.virtual_address as u64;
            let instructions = self.disassemble_section(section);

            let functions = functions::detect_functions(
                self.image.get_section_data(section),
                base_va,
                self.image.get_bitness(),
                &options,
                &self.decoder,
                &self.cancel,
            );

            let xrefs = xref::build_xref_map(&instructions);

            results.push(SectionAnalysis {
                section_name: section.name.clone(),
                base_va,
                instructions,
                functions,
                xrefs,
            });
        }

        return results;
    }

    /// Per-function passes: block decomposition, loops, signature, frame.
    pub fn analyze_function(
        &self,
        function: &DisasmFunction,
        section: &SectionAnalysis,
    ) -> FunctionAnalysis {
        let blocks = cfg::build_cfg(function, &section.instructions, &section.xrefs);
        let loops = cfg::detect_loops(&blocks);
        let signature =
            signature::infer_signature(function, &section.instructions, self.image.get_bitness());
        let frame = stackframe::analyze_stack_frame(
            function,
            &section.instructions,
            self.image.get_bitness(),
        );

        return FunctionAnalysis {
            blocks,
            loops,
            signature,
            frame,
        };
    }
}
