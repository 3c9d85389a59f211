use byteorder::{LittleEndian, ReadBytesExt};

use std::io::Cursor;

/// Little endian reader over an immutable byte image. Every parser goes
/// through this; PE images carry no big endian fields.
#[derive(Debug)]
pub struct ByteView<'a> {
    cursor: Cursor<&'a [u8]>,
}

impl<'a> ByteView<'a> {
    pub fn new(data: &'a [u8]) -> ByteView<'a> {
        return ByteView {
            cursor: Cursor::new(data),
        };
    }

    pub fn seek(&mut self, position: u64) {
        self.cursor.set_position(position);
    }

    pub fn position(&self) -> u64 {
        return self.cursor.position();
    }

    pub fn len(&self) -> usize {
        return self.cursor.get_ref().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.cursor.get_ref().is_empty();
    }

    pub fn read_u8(&mut self) -> std::io::Result<u8> {
        return self.cursor.read_u8();
    }

    pub fn read_u16(&mut self) -> std::io::Result<u16> {
        return self.cursor.read_u16::<LittleEndian>();
    }

    pub fn read_u32(&mut self) -> std::io::Result<u32> {
        return self.cursor.read_u32::<LittleEndian>();
    }

    pub fn read_u64(&mut self) -> std::io::Result<u64> {
        return self.cursor.read_u64::<LittleEndian>();
    }

    /// Reads a null-terminated ASCII string at the current position.
    pub fn read_cstring(&mut self) -> std::io::Result<String> {
        let mut buffer: Vec<u8> = Vec::new();

        loop {
            let c = self.read_u8()?;

            if c == 0x0 {
                break;
            }

            buffer.push(c);
        }

        return Ok(String::from_utf8_lossy(&buffer).into_owned());
    }

    pub fn read_cstring_at(&mut self, position: u64) -> std::io::Result<String> {
        self.seek(position);
        return self.read_cstring();
    }
}
