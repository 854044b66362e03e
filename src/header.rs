use binrw::{binrw, BinReaderExt};
use std::path::Path;

#[binrw]
#[derive(Debug, Clone, Copy)]
pub struct BinarySlot {
    pub rom_offset: u32,
    pub entry_address: u32,
    pub ram_address: u32,
    pub size: u32,
}

/// The leading portion of `header.bin`, up to the autoload hook offsets.
/// Everything the patch maker needs lives below 0x78.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct HeaderBin {
    pub game_title: [u8; 12],
    pub game_code: [u8; 4],
    pub maker_code: [u8; 2],
    pub unit_code: u8,
    pub encryption_seed: u8,
    pub device_capacity: u8,
    pub _reserved1: [u8; 7],
    pub _dsi_flags: u8,
    pub region: u8,
    pub rom_version: u8,
    pub autostart: u8,
    pub arm9: BinarySlot,
    pub arm7: BinarySlot,
    pub fnt_offset: u32,
    pub fnt_size: u32,
    pub fat_offset: u32,
    pub fat_size: u32,
    pub arm9_ovt_offset: u32,
    pub arm9_ovt_size: u32,
    pub arm7_ovt_offset: u32,
    pub arm7_ovt_size: u32,
    pub port_normal: u32,
    pub port_key1: u32,
    pub icon_offset: u32,
    pub secure_crc: u16,
    pub secure_timeout: u16,
    pub arm9_autoload_hook: u32,
    pub arm7_autoload_hook: u32,
}

impl HeaderBin {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let mut file = std::io::BufReader::new(std::fs::File::open(path.as_ref())?);
        let header: HeaderBin = file.read_ne()?;
        Ok(header)
    }
}
