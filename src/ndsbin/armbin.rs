use super::blz;
use super::codebin::{BinError, CodeBin};
use binrw::{binrw, BinReaderExt};
use std::io::Cursor;
use std::path::Path;

/// The module-params block embedded in the main binary's crt0. A pointer
/// to it is stored one word before the autoload-list hook.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct ModuleParams {
    pub autoload_list_start: u32,
    pub autoload_list_end: u32,
    pub autoload_start: u32,
    pub static_bss_start: u32,
    pub static_bss_end: u32,
    pub compressed_static_end: u32,
    pub sdk_version: u32,
    pub nitro_code_le: u32,
    pub nitro_code_be: u32,
}

pub const MODULE_PARAMS_SIZE: usize = 36;

/// One autoload descriptor: where the bootstrap copies a segment to, how
/// much of it is file data and how much zero-filled bss. `data_off` is the
/// segment's offset inside the binary, derived cumulatively at load time;
/// only address/size/bss_size are persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct AutoLoadEntry {
    pub address: u32,
    pub size: u32,
    pub bss_size: u32,
    pub data_off: u32,
}

#[derive(thiserror::Error, Debug)]
pub enum ArmError {
    #[error("could not access ARM binary: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Bounds(#[from] BinError),

    #[error("could not decode module params: {0}")]
    Decode(#[from] binrw::Error),

    #[error(transparent)]
    Blz(#[from] blz::BlzError),

    #[error("module params block out of range at 0x{0:08x}")]
    BadModuleParams(u32),

    #[error("autoload list out of range (0x{0:08x}..0x{1:08x})")]
    BadAutoloadList(u32, u32),
}

#[derive(Debug)]
pub struct ArmBin {
    data: Vec<u8>,
    ram_address: u32,
    entry_address: u32,
    module_params_addr: u32,
    module_params: ModuleParams,
    autoload_list: Vec<AutoLoadEntry>,
    is_arm9: bool,
}

fn get_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset + 4)?;
    Some(u32::from_le_bytes(bytes.try_into().unwrap()))
}

fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

impl ArmBin {
    pub fn load(
        path: impl AsRef<Path>,
        entry_address: u32,
        ram_address: u32,
        autoload_hook: u32,
        is_arm9: bool,
    ) -> Result<Self, ArmError> {
        let mut data = std::fs::read(path.as_ref())?;

        let ptr_off = autoload_hook
            .checked_sub(ram_address + 4)
            .ok_or(ArmError::BadModuleParams(autoload_hook))? as usize;
        let module_params_addr =
            get_u32(&data, ptr_off).ok_or(ArmError::BadModuleParams(autoload_hook))?;
        let params_off = module_params_addr
            .checked_sub(ram_address)
            .ok_or(ArmError::BadModuleParams(module_params_addr))?
            as usize;
        if params_off + MODULE_PARAMS_SIZE > data.len() {
            return Err(ArmError::BadModuleParams(module_params_addr));
        }

        let mut module_params: ModuleParams =
            Cursor::new(&data[params_off..params_off + MODULE_PARAMS_SIZE]).read_ne()?;

        // A non-zero compressed-static end marks a BLZ'd static region;
        // everything past it (typically the nitro footer) is kept as-is.
        if module_params.compressed_static_end != 0 {
            let end = module_params
                .compressed_static_end
                .checked_sub(ram_address)
                .filter(|&end| end as usize <= data.len())
                .ok_or(ArmError::BadModuleParams(module_params.compressed_static_end))?
                as usize;

            let tail = data.split_off(end);
            data = blz::decompress(&data)?;
            data.extend_from_slice(&tail);

            module_params.compressed_static_end = 0;
            put_u32(&mut data, params_off + 20, 0);
        }

        let list_start = module_params.autoload_list_start;
        let list_end = module_params.autoload_list_end;
        let bad_list = || ArmError::BadAutoloadList(list_start, list_end);

        let start_off = list_start.checked_sub(ram_address).ok_or_else(bad_list)? as usize;
        let end_off = list_end.checked_sub(ram_address).ok_or_else(bad_list)? as usize;
        if start_off > end_off || end_off > data.len() || (end_off - start_off) % 12 != 0 {
            return Err(bad_list());
        }

        let mut data_off = module_params
            .autoload_start
            .checked_sub(ram_address)
            .ok_or_else(bad_list)?;
        let mut autoload_list = Vec::with_capacity((end_off - start_off) / 12);
        for chunk in data[start_off..end_off].chunks_exact(12) {
            let entry = AutoLoadEntry {
                address: u32::from_le_bytes(chunk[0..4].try_into().unwrap()),
                size: u32::from_le_bytes(chunk[4..8].try_into().unwrap()),
                bss_size: u32::from_le_bytes(chunk[8..12].try_into().unwrap()),
                data_off,
            };
            data_off += entry.size;
            autoload_list.push(entry);
        }

        Ok(ArmBin {
            data,
            ram_address,
            entry_address,
            module_params_addr,
            module_params,
            autoload_list,
            is_arm9,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn entry_address(&self) -> u32 {
        self.entry_address
    }

    pub fn is_arm9(&self) -> bool {
        self.is_arm9
    }

    pub fn module_params(&self) -> &ModuleParams {
        &self.module_params
    }

    pub fn autoload_list(&self) -> &[AutoLoadEntry] {
        &self.autoload_list
    }

    /// Grafts `newcode` into the binary: the autoload data blob is shifted
    /// to open a gap at its old start, the new code goes into the gap, a
    /// new autoload entry is prepended, the list bounds move by
    /// `len`/`len + 12`, and the heap floor stored at `arena_lo` is raised
    /// past the new code and its bss.
    pub fn extend_for_newcode(
        &mut self,
        newcode: &[u8],
        bss_size: u32,
        bss_align: u32,
        newcode_addr: u32,
        arena_lo: u32,
    ) -> Result<(), ArmError> {
        let bin_size = newcode.len() as u32;
        let bss_align = bss_align.max(1);

        let heap_reloc = newcode_addr
            .wrapping_add(bin_size)
            .wrapping_add(bss_align - bin_size % bss_align)
            .wrapping_add(bss_size);
        self.write_u32(arena_lo, heap_reloc)?;

        let list_start = self.module_params.autoload_list_start;
        let list_end = self.module_params.autoload_list_end;
        let start_off = (list_start - self.ram_address) as usize;
        let blob_off = (self.module_params.autoload_start - self.ram_address) as usize;

        self.autoload_list.insert(
            0,
            AutoLoadEntry {
                address: newcode_addr,
                size: bin_size,
                bss_size,
                data_off: blob_off as u32,
            },
        );

        let old_len = self.data.len();
        self.data.resize(old_len + newcode.len() + 12, 0);

        if !newcode.is_empty() {
            self.data
                .copy_within(blob_off..start_off, blob_off + newcode.len());
            self.data[blob_off..blob_off + newcode.len()].copy_from_slice(newcode);
        }

        self.module_params.autoload_list_start = list_start + bin_size;
        self.module_params.autoload_list_end = list_end + bin_size + 12;

        let params_off = (self.module_params_addr - self.ram_address) as usize;
        put_u32(&mut self.data, params_off, self.module_params.autoload_list_start);
        put_u32(
            &mut self.data,
            params_off + 4,
            self.module_params.autoload_list_end,
        );

        let mut off = start_off + newcode.len();
        for entry in &self.autoload_list {
            put_u32(&mut self.data, off, entry.address);
            put_u32(&mut self.data, off + 4, entry.size);
            put_u32(&mut self.data, off + 8, entry.bss_size);
            off += 12;
        }

        Ok(())
    }
}

impl CodeBin for ArmBin {
    fn base_address(&self) -> u32 {
        self.ram_address
    }

    fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
