use serde::Serialize;
use strum_macros::Display;

use std::collections::{BTreeMap, HashMap};

use crate::error::ParseError;
use crate::reader::ByteView;
use crate::strings::{self, StringEncoding};

/*
 * https://learn.microsoft.com/en-us/windows/win32/debug/pe-format
 */

/* Magic number for MS-DOS executables */
const DOS_MAGIC: u16 = 0x5a4d;

/* PE signature found at e_lfanew */
const NT_PE_SIGNATURE: u32 = 0x4550;

/* Magic number for 32 bits PE */
const PE_FORMAT_32_MAGIC: u16 = 0x10b;

/* Magic number for 64 bits PE (PE32+ in the doc) */
const PE_FORMAT_64_MAGIC: u16 = 0x20b;

/* Well-known data directory slots */
const EXPORT_DIRECTORY_INDEX: usize = 0;
const IMPORT_DIRECTORY_INDEX: usize = 1;

/* The directory table never exceeds 16 entries regardless of what the
 * header claims */
const MAX_DATA_DIRECTORIES: u32 = 16;

/* Hard caps against images with unterminated tables */
const MAX_IMPORT_DESCRIPTORS: usize = 256;
const MAX_IMPORT_THUNKS: usize = 4096;
const MAX_EXPORT_NAMES: u32 = 65536;

/* Section characteristics */
const IMAGE_SCN_CNT_CODE: u32 = 0x00000020;
const IMAGE_SCN_MEM_EXECUTE: u32 = 0x20000000;
const IMAGE_SCN_MEM_READ: u32 = 0x40000000;
const IMAGE_SCN_MEM_WRITE: u32 = 0x80000000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Bitness {
    Bits32,
    Bits64,
}

impl Bitness {
    pub fn pointer_width(&self) -> u32 {
        match self {
            Bitness::Bits32 => return 4,
            Bitness::Bits64 => return 8,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
pub enum MachineKind {
    #[strum(serialize = "x86")]
    I386,
    #[strum(serialize = "x86-64")]
    Amd64,
    #[strum(serialize = "arm64")]
    Arm64,
    #[strum(serialize = "unknown")]
    Unknown,
}

impl MachineKind {
    pub fn from_u16(machine: u16) -> MachineKind {
        match machine {
            0x14c => return MachineKind::I386,
            0x8664 => return MachineKind::Amd64,
            0xaa64 => return MachineKind::Arm64,
            _ => return MachineKind::Unknown,
        }
    }
}

pub fn subsystem_name(subsystem: u16) -> &'static str {
    match subsystem {
        1 => return "native",
        2 => return "windows gui",
        3 => return "windows console",
        5 => return "os/2 console",
        7 => return "posix console",
        9 => return "windows ce gui",
        10..=13 => return "efi",
        14 => return "xbox",
        _ => return "unknown",
    }
}

/*
 * MS-DOS Header. Only the magic and the offset to the NT header matter for
 * analysis.
 */

#[derive(Default, Clone, Debug, Serialize)]
pub struct DOSHeader {
    pub e_magic: u16,
    pub e_lfanew: u32,
}

impl DOSHeader {
    fn from_parser(view: &mut ByteView) -> Result<DOSHeader, ParseError> {
        let mut header = DOSHeader::default();

        header.e_magic = view.read_u16()?;

        if header.e_magic != DOS_MAGIC {
            return Err(ParseError::InvalidDosSignature(header.e_magic));
        }

        view.seek(0x3C);

        header.e_lfanew = view.read_u32()?;

        return Ok(header);
    }
}

/*
 * COFF Header
 */

#[derive(Default, Clone, Debug, Serialize)]
pub struct COFFHeader {
    pub machine: u16,
    pub number_of_sections: u16,
    pub time_date_stamp: u32,
    pub pointer_to_symbol_table: u32,
    pub number_of_symbols: u32,
    pub size_of_optional_header: u16,
    pub characteristics: u16,
}

impl COFFHeader {
    fn from_parser(view: &mut ByteView) -> Result<COFFHeader, ParseError> {
        let mut header = COFFHeader::default();

        header.machine = view.read_u16()?;
        header.number_of_sections = view.read_u16()?;
        header.time_date_stamp = view.read_u32()?;
        header.pointer_to_symbol_table = view.read_u32()?;
        header.number_of_symbols = view.read_u32()?;
        header.size_of_optional_header = view.read_u16()?;
        header.characteristics = view.read_u16()?;

        return Ok(header);
    }

    pub fn get_machine_kind(&self) -> MachineKind {
        return MachineKind::from_u16(self.machine);
    }
}

/*
 * Image Data Directory (tail of the Optional Header)
 */

#[derive(Default, Clone, Debug, Serialize)]
pub struct DataDirectory {
    pub virtual_address: u32,
    pub size: u32,
}

impl DataDirectory {
    fn from_parser(view: &mut ByteView) -> Result<DataDirectory, ParseError> {
        let mut directory = DataDirectory::default();

        directory.virtual_address = view.read_u32()?;
        directory.size = view.read_u32()?;

        return Ok(directory);
    }
}

/*
 * Optional Header, normalized over the 32/64 bits layouts. Fields the
 * analysis never looks at are read and dropped; image_base is widened to
 * u64 for both formats.
 */

#[derive(Default, Clone, Debug, Serialize)]
pub struct OptionalHeader {
    pub magic: u16,
    pub address_of_entry_point: u32,
    pub image_base: u64,
    pub section_alignment: u32,
    pub file_alignment: u32,
    pub size_of_image: u32,
    pub size_of_headers: u32,
    pub checksum: u32,
    pub subsystem: u16,
    pub dll_characteristics: u16,
    pub number_of_rva_and_sizes: u32,
}

impl OptionalHeader {
    fn from_parser(view: &mut ByteView) -> Result<OptionalHeader, ParseError> {
        let mut header = OptionalHeader::default();

        header.magic = view.read_u16()?;

        let is_pe32 = match header.magic {
            PE_FORMAT_32_MAGIC => true,
            PE_FORMAT_64_MAGIC => false,
            magic => return Err(ParseError::InvalidOptionalHeaderMagic(magic)),
        };

        let _linker_version = view.read_u16()?;
        let _size_of_code = view.read_u32()?;
        let _size_of_initialized_data = view.read_u32()?;
        let _size_of_uninitialized_data = view.read_u32()?;
        header.address_of_entry_point = view.read_u32()?;
        let _base_of_code = view.read_u32()?;

        if is_pe32 {
            let _base_of_data = view.read_u32()?;
            header.image_base = view.read_u32()? as u64;
        } else {
            header.image_base = view.read_u64()?;
        }

        header.section_alignment = view.read_u32()?;
        header.file_alignment = view.read_u32()?;
        let _operating_system_version = view.read_u32()?;
        let _image_version = view.read_u32()?;
        let _subsystem_version = view.read_u32()?;
        let _win32_version_value = view.read_u32()?;
        header.size_of_image = view.read_u32()?;
        header.size_of_headers = view.read_u32()?;
        header.checksum = view.read_u32()?;
        header.subsystem = view.read_u16()?;
        header.dll_characteristics = view.read_u16()?;

        /* Stack and heap reserve/commit sizes */
        for _ in 0..4 {
            if is_pe32 {
                view.read_u32()?;
            } else {
                view.read_u64()?;
            }
        }

        let _loader_flags = view.read_u32()?;
        header.number_of_rva_and_sizes = view.read_u32()?;

        return Ok(header);
    }

    pub fn is_64_bits(&self) -> bool {
        return self.magic == PE_FORMAT_64_MAGIC;
    }
}

/*
 * Section Header
 */

#[derive(Default, Clone, Debug, Serialize)]
pub struct SectionHeader {
    pub name: String,
    pub virtual_size: u32,
    pub virtual_address: u32,
    pub size_of_raw_data: u32,
    pub ptr_to_raw_data: u32,
    pub characteristics: u32,
}

impl SectionHeader {
    fn from_parser(view: &mut ByteView) -> Result<SectionHeader, ParseError> {
        let mut header = SectionHeader::default();

        let mut name_buffer: Vec<u8> = Vec::new();

        for _ in 0..8 {
            let c = view.read_u8()?;

            if c != 0x0 {
                name_buffer.push(c);
            }
        }

        header.name = String::from_utf8_lossy(&name_buffer).into_owned();

        header.virtual_size = view.read_u32()?;
        header.virtual_address = view.read_u32()?;
        header.size_of_raw_data = view.read_u32()?;
        header.ptr_to_raw_data = view.read_u32()?;
        let _pointer_to_relocations = view.read_u32()?;
        let _pointer_to_line_numbers = view.read_u32()?;
        let _number_of_relocations = view.read_u16()?;
        let _number_of_line_numbers = view.read_u16()?;
        header.characteristics = view.read_u32()?;

        return Ok(header);
    }

    pub fn is_executable(&self) -> bool {
        return (self.characteristics & (IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE)) != 0;
    }

    pub fn is_readable(&self) -> bool {
        return (self.characteristics & IMAGE_SCN_MEM_READ) != 0;
    }

    pub fn is_writable(&self) -> bool {
        return (self.characteristics & IMAGE_SCN_MEM_WRITE) != 0;
    }

    pub fn contains_rva(&self, rva: u64) -> bool {
        let start = self.virtual_address as u64;
        return rva >= start && rva < start + self.virtual_size as u64;
    }
}

/*
 * Import Address Table entry, one library with its ordered functions. The
 * iat_vas list aligns 1-to-1 with the function names.
 */

#[derive(Default, Clone, Debug, Serialize)]
pub struct ImportEntry {
    pub library: String,
    pub functions: Vec<String>,
    pub iat_vas: Vec<u64>,
}

#[derive(Default, Clone, Debug, Serialize)]
pub struct ExportEntry {
    pub name: String,
    pub ordinal: u16,
    pub rva: u32,
}

/*
 * Image Import Descriptor (struct found in the Import Table)
 */

#[derive(Default, Clone, Debug)]
struct ImageImportDescriptor {
    original_first_thunk: u32,
    time_date_stamp: u32,
    forwarder_chain: u32,
    name_rva: u32,
    first_thunk: u32,
}

impl ImageImportDescriptor {
    fn from_parser(view: &mut ByteView) -> std::io::Result<ImageImportDescriptor> {
        let mut descriptor = ImageImportDescriptor::default();

        descriptor.original_first_thunk = view.read_u32()?;
        descriptor.time_date_stamp = view.read_u32()?;
        descriptor.forwarder_chain = view.read_u32()?;
        descriptor.name_rva = view.read_u32()?;
        descriptor.first_thunk = view.read_u32()?;

        return Ok(descriptor);
    }

    fn is_zeroed_out(&self) -> bool {
        return self.original_first_thunk == 0
            && self.time_date_stamp == 0
            && self.forwarder_chain == 0
            && self.name_rva == 0
            && self.first_thunk == 0;
    }
}

/*
 * Export Directory table pointers
 */

#[derive(Default, Clone, Debug)]
struct ExportDirectory {
    number_of_names: u32,
    address_table_rva: u32,
    name_pointer_rva: u32,
    ordinal_table_rva: u32,
}

impl ExportDirectory {
    fn from_parser(view: &mut ByteView) -> std::io::Result<ExportDirectory> {
        let mut directory = ExportDirectory::default();

        let _characteristics = view.read_u32()?;
        let _time_date_stamp = view.read_u32()?;
        let _version = view.read_u32()?;
        let _name_rva = view.read_u32()?;
        let _ordinal_base = view.read_u32()?;
        let _number_of_functions = view.read_u32()?;
        directory.number_of_names = view.read_u32()?;
        directory.address_table_rva = view.read_u32()?;
        directory.name_pointer_rva = view.read_u32()?;
        directory.ordinal_table_rva = view.read_u32()?;

        return Ok(directory);
    }
}

/*
 * PE image. Constructed once by parse, immutable afterwards, owns its bytes.
 */

#[derive(Debug, Serialize)]
pub struct PEImage {
    pub dos_header: DOSHeader,
    pub coff_header: COFFHeader,
    pub optional_header: OptionalHeader,
    pub data_directories: Vec<DataDirectory>,
    pub sections: Vec<SectionHeader>,
    pub imports: Vec<ImportEntry>,
    pub exports: Vec<ExportEntry>,
    pub strings: BTreeMap<u64, String>,
    pub string_encodings: HashMap<u64, StringEncoding>,
    #[serde(skip)]
    data: Vec<u8>,
}

impl PEImage {
    pub fn get_bitness(&self) -> Bitness {
        if self.optional_header.is_64_bits() {
            return Bitness::Bits64;
        }

        return Bitness::Bits32;
    }

    pub fn get_image_base(&self) -> u64 {
        return self.optional_header.image_base;
    }

    pub fn get_data(&self) -> &[u8] {
        return &self.data;
    }

    /// Entry point VA, absent for images (some DLLs) that declare none.
    pub fn get_entry_point_va(&self) -> Option<u64> {
        if self.optional_header.address_of_entry_point == 0 {
            return None;
        }

        return Some(self.get_image_base() + self.optional_header.address_of_entry_point as u64);
    }

    pub fn find_section(&self, name: &str) -> Option<&SectionHeader> {
        return self.sections.iter().find(|section| section.name == name);
    }

    /// Raw bytes of a section. The parser rejected sections whose raw range
    /// escapes the image, so slicing a parser-produced header cannot panic.
    pub fn get_section_data(&self, section: &SectionHeader) -> &[u8] {
        let start = section.ptr_to_raw_data as usize;
        let end = start + section.size_of_raw_data as usize;

        return &self.data[start..end];
    }

    /// Translates an RVA to a file offset through the section table. An RVA
    /// outside every section is returned unchanged; legacy images with no
    /// section mapping store tables at their file offsets.
    pub fn rva_to_file_offset(&self, rva: u64) -> u64 {
        for section in self.sections.iter() {
            if section.contains_rva(rva) {
                return section.ptr_to_raw_data as u64 + (rva - section.virtual_address as u64);
            }
        }

        return rva;
    }

    /// IAT slot VA to (library, function), the lookup the annotator uses.
    pub fn get_iat_map(&self) -> HashMap<u64, (String, String)> {
        let mut map: HashMap<u64, (String, String)> = HashMap::new();

        for import in self.imports.iter() {
            for (va, function) in import.iat_vas.iter().zip(import.functions.iter()) {
                map.insert(*va, (import.library.clone(), function.clone()));
            }
        }

        return map;
    }

    /// Exported (name, VA) pairs, the seed list for function detection.
    pub fn get_export_functions(&self) -> Vec<(String, u64)> {
        return self
            .exports
            .iter()
            .map(|export| (export.name.clone(), self.get_image_base() + export.rva as u64))
            .collect();
    }
}

/*
 * Main parse entry point. Takes ownership of the byte image; the returned
 * PEImage keeps it alive for the whole analysis.
 */
pub fn parse(bytes: Vec<u8>) -> Result<PEImage, ParseError> {
    let image_length = bytes.len() as u64;

    let mut view = ByteView::new(&bytes);

    let dos_header = DOSHeader::from_parser(&mut view)?;

    if dos_header.e_lfanew as u64 >= image_length {
        return Err(ParseError::InvalidOffset);
    }

    view.seek(dos_header.e_lfanew as u64);

    let signature = view.read_u32()?;

    if signature != NT_PE_SIGNATURE {
        return Err(ParseError::InvalidPeSignature(signature));
    }

    let coff_header = COFFHeader::from_parser(&mut view)?;

    let optional_header_start = view.position();
    let optional_header = OptionalHeader::from_parser(&mut view)?;

    let directory_count = optional_header
        .number_of_rva_and_sizes
        .min(MAX_DATA_DIRECTORIES) as usize;

    let mut data_directories: Vec<DataDirectory> = Vec::with_capacity(directory_count);

    for _ in 0..directory_count {
        match DataDirectory::from_parser(&mut view) {
            Ok(directory) => data_directories.push(directory),
            Err(_) => {
                log::warn!("Truncated data directory table");
                break;
            }
        }
    }

    /* The section table starts right after the declared optional header
     * size, which may exceed what was actually parsed */
    view.seek(optional_header_start + coff_header.size_of_optional_header as u64);

    let mut sections: Vec<SectionHeader> = Vec::with_capacity(coff_header.number_of_sections as usize);

    for _ in 0..coff_header.number_of_sections {
        let section = SectionHeader::from_parser(&mut view)?;

        let raw_end = section.ptr_to_raw_data as u64 + section.size_of_raw_data as u64;

        if raw_end > image_length {
            return Err(ParseError::SectionOutOfBounds {
                name: section.name.clone(),
                end: raw_end,
                length: image_length,
            });
        }

        sections.push(section);
    }

    drop(view);

    let mut image = PEImage {
        dos_header,
        coff_header,
        optional_header,
        data_directories,
        sections,
        imports: Vec::new(),
        exports: Vec::new(),
        strings: BTreeMap::new(),
        string_encodings: HashMap::new(),
        data: bytes,
    };

    image.imports = parse_imports(&image);
    image.exports = parse_exports(&image);

    let (extracted, encodings) = strings::extract_strings(&image);
    image.strings = extracted;
    image.string_encodings = encodings;

    return Ok(image);
}

/*
 * Import table walk. Every failure in here is tolerated: the offending
 * descriptor or thunk is skipped and the walk continues.
 */
fn parse_imports(image: &PEImage) -> Vec<ImportEntry> {
    let mut imports: Vec<ImportEntry> = Vec::new();

    let Some(directory) = image.data_directories.get(IMPORT_DIRECTORY_INDEX) else {
        return imports;
    };

    if directory.virtual_address == 0 {
        return imports;
    }

    let mut view = ByteView::new(image.get_data());
    view.seek(image.rva_to_file_offset(directory.virtual_address as u64));

    let mut descriptors: Vec<ImageImportDescriptor> = Vec::new();

    loop {
        let descriptor = match ImageImportDescriptor::from_parser(&mut view) {
            Ok(descriptor) => descriptor,
            Err(_) => {
                log::warn!("Truncated import descriptor table");
                break;
            }
        };

        if descriptor.is_zeroed_out() {
            break;
        }

        descriptors.push(descriptor);

        if descriptors.len() > MAX_IMPORT_DESCRIPTORS {
            break;
        }
    }

    let bitness = image.get_bitness();
    let thunk_size = bitness.pointer_width() as u64;

    let ordinal_flag: u64 = match bitness {
        Bitness::Bits32 => 1 << 31,
        Bitness::Bits64 => 1 << 63,
    };

    for descriptor in descriptors.iter() {
        let library = match view.read_cstring_at(image.rva_to_file_offset(descriptor.name_rva as u64)) {
            Ok(name) if !name.is_empty() => name,
            _ => {
                log::warn!("Skipping import descriptor with unreadable library name");
                continue;
            }
        };

        /* The lookup table holds names; the bound IAT may have been
         * overwritten, so prefer original_first_thunk when present */
        let thunks_rva = if descriptor.original_first_thunk != 0 {
            descriptor.original_first_thunk
        } else {
            descriptor.first_thunk
        };

        let mut thunks: Vec<u64> = Vec::new();

        view.seek(image.rva_to_file_offset(thunks_rva as u64));

        loop {
            let thunk = match bitness {
                Bitness::Bits32 => view.read_u32().map(|value| value as u64),
                Bitness::Bits64 => view.read_u64(),
            };

            match thunk {
                Ok(0) | Err(_) => break,
                Ok(value) => thunks.push(value),
            }

            if thunks.len() > MAX_IMPORT_THUNKS {
                break;
            }
        }

        let mut entry = ImportEntry {
            library,
            functions: Vec::new(),
            iat_vas: Vec::new(),
        };

        for (i, thunk) in thunks.iter().enumerate() {
            let function = if (thunk & ordinal_flag) != 0 {
                format!("Ordinal_{}", thunk & 0xFFFF)
            } else {
                let hint_name_rva = thunk & 0x7FFF_FFFF;

                /* Skip the 2 bytes import hint before the name */
                match view.read_cstring_at(image.rva_to_file_offset(hint_name_rva) + 2) {
                    Ok(name) => name,
                    Err(_) => {
                        log::debug!("Skipping import thunk with unreadable name");
                        continue;
                    }
                }
            };

            entry.functions.push(function);
            entry
                .iat_vas
                .push(image.get_image_base() + descriptor.first_thunk as u64 + i as u64 * thunk_size);
        }

        imports.push(entry);
    }

    return imports;
}

/*
 * Export table walk, same tolerance as imports
 */
fn parse_exports(image: &PEImage) -> Vec<ExportEntry> {
    let Some(directory) = image.data_directories.get(EXPORT_DIRECTORY_INDEX) else {
        return Vec::new();
    };

    if directory.virtual_address == 0 {
        return Vec::new();
    }

    let mut view = ByteView::new(image.get_data());
    view.seek(image.rva_to_file_offset(directory.virtual_address as u64));

    let tables = match ExportDirectory::from_parser(&mut view) {
        Ok(tables) => tables,
        Err(_) => {
            log::warn!("Truncated export directory");
            return Vec::new();
        }
    };

    let mut exports: Vec<ExportEntry> = Vec::new();

    for i in 0..tables.number_of_names.min(MAX_EXPORT_NAMES) {
        match parse_export_entry(image, &mut view, &tables, i) {
            Ok(entry) => exports.push(entry),
            Err(_) => log::debug!("Skipping malformed export entry {}", i),
        }
    }

    return exports;
}

fn parse_export_entry(
    image: &PEImage,
    view: &mut ByteView,
    tables: &ExportDirectory,
    index: u32,
) -> std::io::Result<ExportEntry> {
    view.seek(image.rva_to_file_offset(tables.ordinal_table_rva as u64 + index as u64 * 2));
    let ordinal = view.read_u16()?;

    view.seek(image.rva_to_file_offset(tables.name_pointer_rva as u64 + index as u64 * 4));
    let name_rva = view.read_u32()?;
    let name = view.read_cstring_at(image.rva_to_file_offset(name_rva as u64))?;

    view.seek(image.rva_to_file_offset(tables.address_table_rva as u64 + ordinal as u64 * 4));
    let rva = view.read_u32()?;

    return Ok(ExportEntry { name, ordinal, rva });
}
