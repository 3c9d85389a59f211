use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about = "Static analyzer for Windows portable executable files")]
pub struct Args {
    /// Dumps the legacy MS-DOS compatible header
    #[arg(long, default_value_t = false)]
    pub dos_header: bool,

    /// Dumps the COFF file header
    #[arg(long, default_value_t = false)]
    pub coff_header: bool,

    /// Dumps the Optional (either 32/64) header
    #[arg(long, default_value_t = false)]
    pub optional_header: bool,

    /// Dumps the section headers
    #[arg(long, default_value_t = false)]
    pub sections: bool,

    /// Regular expression to filter the sections to display
    #[arg(long, default_value = ".*")]
    pub sections_filter: String,

    /// Dumps the import table
    #[arg(long, default_value_t = false)]
    pub imports: bool,

    /// Dumps the export table
    #[arg(long, default_value_t = false)]
    pub exports: bool,

    /// Dumps the strings found in read-only data
    #[arg(long, default_value_t = false)]
    pub strings: bool,

    /// Disassembles the executable sections
    #[arg(long, default_value_t = false)]
    pub disasm: bool,

    /// Dumps the detected functions with signature and frame summaries
    #[arg(long, default_value_t = false)]
    pub functions: bool,

    /// Dumps the cross-reference map of the executable sections
    #[arg(long, default_value_t = false)]
    pub xrefs: bool,

    /// Dumps the control flow graph and loops of every detected function
    #[arg(long, default_value_t = false)]
    pub cfg: bool,

    /// Prints everything as json instead of text
    #[arg(long, default_value_t = false)]
    pub json: bool,

    /// Padding size to apply when dumping information for better readability
    #[arg(long, default_value_t = 4)]
    pub padding_size: usize,

    pub file_path: PathBuf,
}
