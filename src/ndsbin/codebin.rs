#[derive(thiserror::Error, Debug, PartialEq)]
pub enum BinError {
    #[error("out of bounds read at 0x{0:08x} with size 0x{1:x}")]
    OutOfBoundsRead(u32, usize),

    #[error("out of bounds write at 0x{0:08x} with size 0x{1:x}")]
    OutOfBoundsWrite(u32, usize),
}

/// Byte access into a loaded binary, indexed by ARM RAM address.
/// All fixed-width traffic is little-endian.
pub trait CodeBin {
    fn base_address(&self) -> u32;
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];

    /// Overlays track whether they were modified; the main binary does not
    /// need to.
    fn mark_dirty(&mut self) {}

    fn end_address(&self) -> u32 {
        self.base_address() + self.bytes().len() as u32
    }

    fn check_range(&self, address: u32, len: usize, write: bool) -> Result<usize, BinError> {
        let err = if write {
            BinError::OutOfBoundsWrite(address, len)
        } else {
            BinError::OutOfBoundsRead(address, len)
        };

        if address < self.base_address() {
            return Err(err);
        }
        let offset = (address - self.base_address()) as usize;
        if offset + len > self.bytes().len() {
            return Err(err);
        }
        Ok(offset)
    }

    fn read<const N: usize>(&self, address: u32) -> Result<[u8; N], BinError>
    where
        Self: Sized,
    {
        let offset = self.check_range(address, N, false)?;
        let mut data = [0; N];
        data.copy_from_slice(&self.bytes()[offset..offset + N]);
        Ok(data)
    }

    fn read_u32(&self, address: u32) -> Result<u32, BinError> {
        let offset = self.check_range(address, 4, false)?;
        let mut data = [0; 4];
        data.copy_from_slice(&self.bytes()[offset..offset + 4]);
        Ok(u32::from_le_bytes(data))
    }

    fn write(&mut self, address: u32, data: &[u8]) -> Result<(), BinError> {
        let offset = self.check_range(address, data.len(), true)?;
        self.bytes_mut()[offset..offset + data.len()].copy_from_slice(data);
        self.mark_dirty();
        Ok(())
    }

    fn write_u32(&mut self, address: u32, value: u32) -> Result<(), BinError> {
        self.write(address, &value.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestBin {
        base: u32,
        data: Vec<u8>,
    }

    impl CodeBin for TestBin {
        fn base_address(&self) -> u32 {
            self.base
        }
        fn bytes(&self) -> &[u8] {
            &self.data
        }
        fn bytes_mut(&mut self) -> &mut [u8] {
            &mut self.data
        }
    }

    #[test]
    fn test_read() {
        let bin = TestBin {
            base: 0x02000000,
            data: vec![0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07],
        };

        assert_eq!(bin.read::<1>(0x02000000).unwrap(), [0x00]);
        assert_eq!(bin.read::<4>(0x02000004).unwrap(), [0x04, 0x05, 0x06, 0x07]);
        assert_eq!(bin.read_u32(0x02000000).unwrap(), 0x03020100);
        assert_eq!(bin.end_address(), 0x02000008);

        assert_eq!(
            bin.read::<1>(0x01FFFFFF).unwrap_err(),
            BinError::OutOfBoundsRead(0x01FFFFFF, 1)
        );
        assert_eq!(
            bin.read::<4>(0x02000005).unwrap_err(),
            BinError::OutOfBoundsRead(0x02000005, 4)
        );
        assert_eq!(
            bin.read::<1>(0x02000008).unwrap_err(),
            BinError::OutOfBoundsRead(0x02000008, 1)
        );
    }

    #[test]
    fn test_write() {
        let mut bin = TestBin {
            base: 0x02000000,
            data: vec![0; 8],
        };

        bin.write_u32(0x02000004, 0xEA001234).unwrap();
        assert_eq!(bin.read::<8>(0x02000000).unwrap()[4..], [0x34, 0x12, 0x00, 0xEA]);

        assert_eq!(
            bin.write(0x02000006, &[0; 4]).unwrap_err(),
            BinError::OutOfBoundsWrite(0x02000006, 4)
        );
        assert_eq!(
            bin.write(0x01FFFFFC, &[0; 4]).unwrap_err(),
            BinError::OutOfBoundsWrite(0x01FFFFFC, 4)
        );
    }
}
