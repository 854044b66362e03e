use binrw::{binrw, BinReaderExt, BinWriterExt};
use std::io::Cursor;
use std::path::Path;

pub const OVERLAY_FLAG_COMPRESSED: u8 = 1 << 0;

/// One record of `arm{7,9}ovt.bin`. 32 bytes, little-endian, preserved
/// verbatim. The last word packs the compressed size (low 24 bits) and the
/// flag byte (high 8 bits).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OvtEntry {
    pub overlay_id: u32,
    pub ram_address: u32,
    pub ram_size: u32,
    pub bss_size: u32,
    pub sinit_start: u32,
    pub sinit_end: u32,
    pub file_id: u32,
    pub compressed: u32,
}

pub const OVT_ENTRY_SIZE: usize = 32;

impl OvtEntry {
    pub fn flags(&self) -> u8 {
        (self.compressed >> 24) as u8
    }

    pub fn set_flags(&mut self, flags: u8) {
        self.compressed = (self.compressed & 0xFFFFFF) | ((flags as u32) << 24);
    }

    pub fn is_compressed(&self) -> bool {
        self.flags() & OVERLAY_FLAG_COMPRESSED != 0
    }

    /// Wipes both the compressed size and the flag byte, marking the
    /// overlay as stored uncompressed.
    pub fn clear_compression(&mut self) {
        self.compressed = 0;
    }
}

#[derive(thiserror::Error, Debug)]
pub enum OvtError {
    #[error("could not access overlay table: {0}")]
    Io(#[from] std::io::Error),

    #[error("overlay table size {0} is not a multiple of {OVT_ENTRY_SIZE}")]
    BadSize(usize),

    #[error("could not decode overlay table: {0}")]
    Decode(#[from] binrw::Error),
}

pub fn load(path: impl AsRef<Path>) -> Result<Vec<OvtEntry>, OvtError> {
    let data = std::fs::read(path.as_ref())?;
    if data.len() % OVT_ENTRY_SIZE != 0 {
        return Err(OvtError::BadSize(data.len()));
    }

    let count = data.len() / OVT_ENTRY_SIZE;
    let mut cursor = Cursor::new(data);
    let mut entries = Vec::with_capacity(count);
    for _ in 0..count {
        entries.push(cursor.read_ne::<OvtEntry>()?);
    }
    Ok(entries)
}

pub fn save(path: impl AsRef<Path>, entries: &[OvtEntry]) -> Result<(), OvtError> {
    let mut cursor = Cursor::new(Vec::with_capacity(entries.len() * OVT_ENTRY_SIZE));
    for entry in entries {
        cursor.write_ne(entry)?;
    }
    std::fs::write(path.as_ref(), cursor.into_inner())?;
    Ok(())
}
