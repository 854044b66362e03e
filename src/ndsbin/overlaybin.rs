use super::blz;
use super::codebin::CodeBin;
use std::path::Path;

#[derive(thiserror::Error, Debug)]
pub enum OverlayError {
    #[error("could not access overlay {1}: {0}")]
    Io(std::io::Error, u32),

    #[error("could not decompress overlay {1}: {0}")]
    Blz(blz::BlzError, u32),
}

pub struct OverlayBin {
    data: Vec<u8>,
    ram_address: u32,
    id: u32,
    dirty: bool,
    backup_data: Vec<u8>,
}

impl OverlayBin {
    pub fn load(
        path: impl AsRef<Path>,
        ram_address: u32,
        compressed: bool,
        id: u32,
    ) -> Result<Self, OverlayError> {
        let mut data = std::fs::read(path.as_ref()).map_err(|e| OverlayError::Io(e, id))?;
        if compressed {
            data = blz::decompress(&data).map_err(|e| OverlayError::Blz(e, id))?;
        }

        Ok(OverlayBin {
            data,
            ram_address,
            id,
            dirty: false,
            backup_data: Vec::new(),
        })
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        self.dirty = true;
        &mut self.data
    }

    pub fn dirty(&self) -> bool {
        self.dirty
    }

    /// Pristine bytes captured the first time the overlay was read from
    /// the ROM tree; empty when the overlay came from a backup.
    pub fn backup_data(&self) -> &[u8] {
        &self.backup_data
    }

    pub fn capture_backup(&mut self) {
        self.backup_data = self.data.clone();
    }
}

impl CodeBin for OverlayBin {
    fn base_address(&self) -> u32 {
        self.ram_address
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    fn mark_dirty(&mut self) {
        self.dirty = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndsbin::codebin::CodeBin;

    #[test]
    fn test_load_and_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("overlay9_3.bin");
        std::fs::write(&path, [0u8; 16]).unwrap();

        let mut ov = OverlayBin::load(&path, 0x02180000, false, 3).unwrap();
        ov.capture_backup();
        assert!(!ov.dirty());
        assert_eq!(ov.backup_data().len(), 16);

        ov.write_u32(0x02180004, 0xE1A00000).unwrap();
        assert!(ov.dirty());
        assert_eq!(ov.read_u32(0x02180004).unwrap(), 0xE1A00000);

        // The captured backup is unaffected by later writes.
        assert_eq!(&ov.backup_data()[4..8], &[0, 0, 0, 0]);
    }
}
