//! Library metadata table (§3): tiny (tens to hundreds), kept entirely in memory and
//! written/read as a flat array, the same way the read record table is.

use byteorder::{ByteOrder, LittleEndian};
use std::io::{self, Read, Write};

/// Fixed size of one serialized [`Library`] record: a 4-byte name length prefix plus
/// up to 124 bytes of name, rounded to keep the table easy to seek (one record = 128
/// bytes).
pub const SIZE_LIBRARY_RECORD: usize = 128;
const MAX_NAME_BYTES: usize = SIZE_LIBRARY_RECORD - 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Library {
    pub lid: u32,
    pub name: String,
}

impl Library {
    #[must_use]
    pub fn new(lid: u32, name: impl Into<String>) -> Self {
        Self {
            lid,
            name: name.into(),
        }
    }

    pub fn write_bytes<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let mut buf = [0u8; SIZE_LIBRARY_RECORD];
        let name_bytes = self.name.as_bytes();
        let len = name_bytes.len().min(MAX_NAME_BYTES);
        LittleEndian::write_u32(&mut buf[0..4], len as u32);
        buf[4..4 + len].copy_from_slice(&name_bytes[..len]);
        writer.write_all(&buf)
    }

    pub fn from_reader<R: Read>(reader: &mut R, lid: u32) -> io::Result<Self> {
        let mut buf = [0u8; SIZE_LIBRARY_RECORD];
        reader.read_exact(&mut buf)?;
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        let name = String::from_utf8_lossy(&buf[4..4 + len.min(MAX_NAME_BYTES)]).into_owned();
        Ok(Self { lid, name })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_library_name() {
        let lib = Library::new(1, "HiSeq-prep-A");
        let mut buf = Vec::new();
        lib.write_bytes(&mut buf).unwrap();
        assert_eq!(buf.len(), SIZE_LIBRARY_RECORD);
        let mut cursor = std::io::Cursor::new(buf);
        let back = Library::from_reader(&mut cursor, 1).unwrap();
        assert_eq!(back, lib);
    }
}
