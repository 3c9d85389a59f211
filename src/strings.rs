use serde::Serialize;
use strum_macros::Display;

use std::collections::{BTreeMap, HashMap};

use crate::pe::PEImage;

/* Sections swept for string data, in preference order */
const STRING_SECTION_NAMES: [&str; 3] = [".rdata", ".rodata", ".data"];

/* Runs shorter than this are noise, not strings */
const MIN_STRING_LENGTH: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Display)]
pub enum StringEncoding {
    #[strum(serialize = "ascii")]
    Ascii,
    #[strum(serialize = "utf16le")]
    Utf16le,
}

fn is_printable(byte: u8) -> bool {
    return (0x20..=0x7E).contains(&byte);
}

/// Sweeps the first read-only data section for ASCII and UTF-16LE
/// C-strings. Each string is keyed by the VA of its first byte.
pub fn extract_strings(image: &PEImage) -> (BTreeMap<u64, String>, HashMap<u64, StringEncoding>) {
    let mut strings: BTreeMap<u64, String> = BTreeMap::new();
    let mut encodings: HashMap<u64, StringEncoding> = HashMap::new();

    let Some(section) = STRING_SECTION_NAMES
        .iter()
        .find_map(|name| image.find_section(name))
    else {
        return (strings, encodings);
    };

    let data = image.get_section_data(section);
    let base_va = image.get_image_base() + section.virtual_address as u64;

    scan_ascii(data, base_va, &mut strings, &mut encodings);
    scan_utf16le(data, base_va, &mut strings, &mut encodings);

    return (strings, encodings);
}

/*
 * ASCII pass: runs of printable bytes terminated by a null or any
 * non-printable byte (or the end of the section).
 */
fn scan_ascii(
    data: &[u8],
    base_va: u64,
    strings: &mut BTreeMap<u64, String>,
    encodings: &mut HashMap<u64, StringEncoding>,
) {
    let mut start: Option<usize> = None;

    for (i, &byte) in data.iter().enumerate() {
        if is_printable(byte) {
            if start.is_none() {
                start = Some(i);
            }

            continue;
        }

        if let Some(begin) = start.take() {
            emit_ascii(data, base_va, begin, i, strings, encodings);
        }
    }

    if let Some(begin) = start {
        emit_ascii(data, base_va, begin, data.len(), strings, encodings);
    }
}

fn emit_ascii(
    data: &[u8],
    base_va: u64,
    begin: usize,
    end: usize,
    strings: &mut BTreeMap<u64, String>,
    encodings: &mut HashMap<u64, StringEncoding>,
) {
    if end - begin < MIN_STRING_LENGTH {
        return;
    }

    let va = base_va + begin as u64;

    strings.insert(va, String::from_utf8_lossy(&data[begin..end]).into_owned());
    encodings.insert(va, StringEncoding::Ascii);
}

/*
 * UTF-16LE pass: runs of (printable, 0x00) pairs. Only the basic-latin
 * plane is recognized, which is what compilers emit for wide literals.
 */
fn scan_utf16le(
    data: &[u8],
    base_va: u64,
    strings: &mut BTreeMap<u64, String>,
    encodings: &mut HashMap<u64, StringEncoding>,
) {
    let mut i = 0usize;

    while i + 1 < data.len() {
        if !is_printable(data[i]) || data[i + 1] != 0x00 {
            i += 1;
            continue;
        }

        let begin = i;
        let mut text = String::new();

        while i + 1 < data.len() && is_printable(data[i]) && data[i + 1] == 0x00 {
            text.push(data[i] as char);
            i += 2;
        }

        if text.len() >= MIN_STRING_LENGTH {
            let va = base_va + begin as u64;

            strings.insert(va, text);
            encodings.insert(va, StringEncoding::Utf16le);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_runs_need_four_printable_bytes() {
        let data = b"ok\0Hello\0\x01Hi\0World";
        let mut strings = BTreeMap::new();
        let mut encodings = HashMap::new();

        scan_ascii(data, 0x1000, &mut strings, &mut encodings);

        assert_eq!(strings.get(&0x1003).map(String::as_str), Some("Hello"));
        assert_eq!(strings.get(&0x100D).map(String::as_str), Some("World"));
        assert_eq!(strings.len(), 2);
        assert_eq!(encodings.get(&0x1003), Some(&StringEncoding::Ascii));
    }

    #[test]
    fn utf16le_runs_are_decoded_from_pairs() {
        let data = b"H\0e\0l\0l\0o\0\0\0";
        let mut strings = BTreeMap::new();
        let mut encodings = HashMap::new();

        scan_utf16le(data, 0x2000, &mut strings, &mut encodings);

        assert_eq!(strings.get(&0x2000).map(String::as_str), Some("Hello"));
        assert_eq!(encodings.get(&0x2000), Some(&StringEncoding::Utf16le));
    }

    #[test]
    fn short_wide_runs_are_ignored(){
        let data = b"H\0i\0\0\0";
        let mut strings = BTreeMap::new();
        let mut encodings = HashMap::new();

        scan_utf16le(data, 0x2000, &mut strings, &mut encodings);

        assert!(strings.is_empty());
    }
}
