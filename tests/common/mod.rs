use byteorder::{LittleEndian, WriteBytesExt};

/* IMAGE_SCN_CNT_CODE | IMAGE_SCN_MEM_EXECUTE | IMAGE_SCN_MEM_READ */
pub const CODE: u32 = 0x60000020;

/* IMAGE_SCN_CNT_INITIALIZED_DATA | IMAGE_SCN_MEM_READ */
pub const RDATA: u32 = 0x40000040;

const PE_OFFSET: usize = 0x80;
const OPTIONAL_HEADER_SIZE: u16 = 112 + 16 * 8;
const FILE_ALIGNMENT: u32 = 0x200;
const FIRST_RAW_OFFSET: u32 = 0x400;

pub struct SectionSpec {
    pub name: &'static str,
    pub rva: u32,
    pub data: Vec<u8>,
    pub characteristics: u32,
}

pub struct ImageSpec {
    pub image_base: u64,
    pub entry_rva: u32,
    pub sections: Vec<SectionSpec>,
    pub export_dir_rva: u32,
    pub import_dir_rva: u32,
}

impl ImageSpec {
    pub fn new(image_base: u64) -> ImageSpec {
        return ImageSpec {
            image_base,
            entry_rva: 0,
            sections: Vec::new(),
            export_dir_rva: 0,
            import_dir_rva: 0,
        };
    }
}

fn pad_to(bytes: &mut Vec<u8>, offset: usize) {
    while bytes.len() < offset {
        bytes.push(0);
    }
}

fn align_up(value: u32, alignment: u32) -> u32 {
    return (value + alignment - 1) / alignment * alignment;
}

/// Builds a well-formed PE32+ byte image from the given sections. Raw data
/// is laid out file-aligned starting at 0x400, in section order.
pub fn build_pe64(spec: &ImageSpec) -> Vec<u8> {
    let mut raw_offsets: Vec<u32> = Vec::new();
    let mut raw_offset = FIRST_RAW_OFFSET;

    for section in spec.sections.iter() {
        raw_offsets.push(raw_offset);
        raw_offset += align_up((section.data.len() as u32).max(1), FILE_ALIGNMENT);
    }

    let mut bytes: Vec<u8> = Vec::new();

    /* DOS header, magic and e_lfanew only */
    bytes.extend_from_slice(b"MZ");
    pad_to(&mut bytes, 0x3C);
    bytes.write_u32::<LittleEndian>(PE_OFFSET as u32).unwrap();
    pad_to(&mut bytes, PE_OFFSET);

    /* PE signature and COFF header */
    bytes.extend_from_slice(b"PE\0\0");
    bytes.write_u16::<LittleEndian>(0x8664).unwrap();
    bytes.write_u16::<LittleEndian>(spec.sections.len() as u16).unwrap();
    bytes.write_u32::<LittleEndian>(0).unwrap();
    bytes.write_u32::<LittleEndian>(0).unwrap();
    bytes.write_u32::<LittleEndian>(0).unwrap();
    bytes.write_u16::<LittleEndian>(OPTIONAL_HEADER_SIZE).unwrap();
    bytes.write_u16::<LittleEndian>(0x2022).unwrap();

    /* Optional header, PE32+ layout */
    bytes.write_u16::<LittleEndian>(0x20B).unwrap();
    bytes.push(14);
    bytes.push(0);
    bytes.write_u32::<LittleEndian>(0).unwrap(); /* size of code */
    bytes.write_u32::<LittleEndian>(0).unwrap(); /* size of initialized data */
    bytes.write_u32::<LittleEndian>(0).unwrap(); /* size of uninitialized data */
    bytes.write_u32::<LittleEndian>(spec.entry_rva).unwrap();
    bytes.write_u32::<LittleEndian>(0x1000).unwrap(); /* base of code */
    bytes.write_u64::<LittleEndian>(spec.image_base).unwrap();
    bytes.write_u32::<LittleEndian>(0x1000).unwrap(); /* section alignment */
    bytes.write_u32::<LittleEndian>(FILE_ALIGNMENT).unwrap();
    bytes.write_u16::<LittleEndian>(6).unwrap();
    bytes.write_u16::<LittleEndian>(0).unwrap();
    bytes.write_u16::<LittleEndian>(0).unwrap();
    bytes.write_u16::<LittleEndian>(0).unwrap();
    bytes.write_u16::<LittleEndian>(6).unwrap();
    bytes.write_u16::<LittleEndian>(0).unwrap();
    bytes.write_u32::<LittleEndian>(0).unwrap(); /* win32 version */
    bytes.write_u32::<LittleEndian>(0x10000).unwrap(); /* size of image */
    bytes.write_u32::<LittleEndian>(0x400).unwrap(); /* size of headers */
    bytes.write_u32::<LittleEndian>(0).unwrap(); /* checksum */
    bytes.write_u16::<LittleEndian>(3).unwrap(); /* console subsystem */
    bytes.write_u16::<LittleEndian>(0).unwrap();
    bytes.write_u64::<LittleEndian>(0x100000).unwrap();
    bytes.write_u64::<LittleEndian>(0x1000).unwrap();
    bytes.write_u64::<LittleEndian>(0x100000).unwrap();
    bytes.write_u64::<LittleEndian>(0x1000).unwrap();
    bytes.write_u32::<LittleEndian>(0).unwrap(); /* loader flags */
    bytes.write_u32::<LittleEndian>(16).unwrap();

    /* Data directories; export is slot 0, import slot 1 */
    for slot in 0..16u32 {
        let rva = match slot {
            0 => spec.export_dir_rva,
            1 => spec.import_dir_rva,
            _ => 0,
        };

        bytes.write_u32::<LittleEndian>(rva).unwrap();
        bytes.write_u32::<LittleEndian>(if rva != 0 { 0x100 } else { 0 }).unwrap();
    }

    /* Section headers */
    for (section, raw) in spec.sections.iter().zip(raw_offsets.iter()) {
        let mut name = [0u8; 8];

        for (i, byte) in section.name.bytes().take(8).enumerate() {
            name[i] = byte;
        }

        bytes.extend_from_slice(&name);
        bytes.write_u32::<LittleEndian>(section.data.len() as u32).unwrap();
        bytes.write_u32::<LittleEndian>(section.rva).unwrap();
        bytes.write_u32::<LittleEndian>(section.data.len() as u32).unwrap();
        bytes.write_u32::<LittleEndian>(*raw).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u16::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(section.characteristics).unwrap();
    }

    /* Raw section data */
    for (section, raw) in spec.sections.iter().zip(raw_offsets.iter()) {
        pad_to(&mut bytes, *raw as usize);
        bytes.extend_from_slice(&section.data);
    }

    return bytes;
}

/// Import area for one library with the given thunks, laid out at the
/// section RVA. Returns (section data, import directory RVA relative to the
/// section start).
pub fn build_import_section(section_rva: u32, library: &str, thunks: &[u64]) -> (Vec<u8>, u32) {
    let mut data: Vec<u8> = Vec::new();

    /* +0x00: hint/name entry used by name thunks in the tests */
    data.write_u16::<LittleEndian>(0).unwrap();
    data.extend_from_slice(b"connect\0");
    pad_to(&mut data, 0x10);

    /* +0x10: library name */
    data.extend_from_slice(library.as_bytes());
    data.push(0);
    pad_to(&mut data, 0x20);

    /* +0x20: import lookup table */
    for thunk in thunks.iter() {
        data.write_u64::<LittleEndian>(*thunk).unwrap();
    }
    data.write_u64::<LittleEndian>(0).unwrap();
    pad_to(&mut data, 0x40);

    /* +0x40: import address table */
    for thunk in thunks.iter() {
        data.write_u64::<LittleEndian>(*thunk).unwrap();
    }
    data.write_u64::<LittleEndian>(0).unwrap();
    pad_to(&mut data, 0x60);

    /* +0x60: descriptor for the library, then the terminator */
    data.write_u32::<LittleEndian>(section_rva + 0x20).unwrap();
    data.write_u32::<LittleEndian>(0).unwrap();
    data.write_u32::<LittleEndian>(0).unwrap();
    data.write_u32::<LittleEndian>(section_rva + 0x10).unwrap();
    data.write_u32::<LittleEndian>(section_rva + 0x40).unwrap();

    for _ in 0..5 {
        data.write_u32::<LittleEndian>(0).unwrap();
    }

    return (data, section_rva + 0x60);
}

/// Export area with one named export. Returns (section data, export
/// directory RVA).
pub fn build_export_section(section_rva: u32, name: &str, ordinal: u16, target_rva: u32) -> (Vec<u8>, u32) {
    let mut data: Vec<u8> = Vec::new();

    /* Directory header */
    data.write_u32::<LittleEndian>(0).unwrap();
    data.write_u32::<LittleEndian>(0).unwrap();
    data.write_u32::<LittleEndian>(0).unwrap();
    data.write_u32::<LittleEndian>(0).unwrap(); /* image name */
    data.write_u32::<LittleEndian>(1).unwrap(); /* ordinal base */
    data.write_u32::<LittleEndian>(ordinal as u32 + 1).unwrap(); /* function count */
    data.write_u32::<LittleEndian>(1).unwrap(); /* name count */
    data.write_u32::<LittleEndian>(section_rva + 0x28).unwrap(); /* addresses */
    data.write_u32::<LittleEndian>(section_rva + 0x40).unwrap(); /* name pointers */
    data.write_u32::<LittleEndian>(section_rva + 0x48).unwrap(); /* ordinals */

    /* +0x28: address table, indexed directly by ordinal */
    pad_to(&mut data, 0x28);
    for i in 0..=ordinal as u32 {
        data.write_u32::<LittleEndian>(if i == ordinal as u32 { target_rva } else { 0 })
            .unwrap();
    }

    /* +0x40: name pointer table */
    pad_to(&mut data, 0x40);
    data.write_u32::<LittleEndian>(section_rva + 0x50).unwrap();

    /* +0x48: ordinal table */
    pad_to(&mut data, 0x48);
    data.write_u16::<LittleEndian>(ordinal).unwrap();

    /* +0x50: the export name */
    pad_to(&mut data, 0x50);
    data.extend_from_slice(name.as_bytes());
    data.push(0);

    return (data, section_rva);
}
