use super::arm::{
    arm_branch, fixup_opcode, thumb_branch, ARM_HOOK_POP, ARM_HOOK_PUSH, ARM_LDR_PC, ARM_OPCODE_B,
    ARM_OPCODE_BL, ARM_OPCODE_BLX, THUMB_OPCODE_BL1, THUMB_OPCODE_BLX1, THUMB_OPCODE_POP_PC,
    THUMB_OPCODE_PUSH_LR,
};
use super::info::{PatchInfo, PatchKind};
use super::{NewcodeBlock, PatchMaker};
use crate::config::{Mode, Region};
use crate::log;
use anyhow::{anyhow, bail, Context};
use object::{Object, ObjectSection};

pub(crate) const HOOK_BRIDGE_SIZE: usize = 20;
pub(crate) const ARM_TO_THUMB_BRIDGE_SIZE: usize = 8;

/// The bridge a hooked instruction is detoured through: preserve the
/// caller-saved registers around the hook call, replay the displaced
/// instruction, then resume after the hook site.
pub(crate) fn hook_bridge(
    og_opcode: u32,
    bridge_addr: u32,
    src_addr: u32,
    dest_addr: u32,
) -> [u8; HOOK_BRIDGE_SIZE] {
    let words = [
        ARM_HOOK_PUSH,
        arm_branch(ARM_OPCODE_BL, bridge_addr + 4, src_addr),
        ARM_HOOK_POP,
        fixup_opcode(og_opcode, dest_addr, bridge_addr + 12),
        arm_branch(ARM_OPCODE_B, bridge_addr + 16, dest_addr + 4),
    ];

    let mut bytes = [0; HOOK_BRIDGE_SIZE];
    for (chunk, word) in bytes.chunks_exact_mut(4).zip(words) {
        chunk.copy_from_slice(&word.to_le_bytes());
    }
    bytes
}

/// `LDR PC, [PC,#-4]` followed by the THUMB entry point, so an ARM branch
/// can land in THUMB code.
pub(crate) fn arm_to_thumb_bridge(src_addr: u32) -> [u8; ARM_TO_THUMB_BRIDGE_SIZE] {
    let mut bytes = [0; ARM_TO_THUMB_BRIDGE_SIZE];
    bytes[..4].copy_from_slice(&ARM_LDR_PC.to_le_bytes());
    bytes[4..].copy_from_slice(&(src_addr | 1).to_le_bytes());
    bytes
}

/// The three halfwords written at a THUMB jump site: PUSH {LR}, the branch
/// half selected by `op1`, POP {PC}.
pub(crate) fn thumb_jump_sequence(op1: u16, dest_addr: u32, src_addr: u32) -> [u8; 6] {
    let halves = [
        THUMB_OPCODE_PUSH_LR,
        thumb_branch(op1, dest_addr, src_addr) as u16,
        THUMB_OPCODE_POP_PC,
    ];

    let mut bytes = [0; 6];
    for (chunk, half) in bytes.chunks_exact_mut(2).zip(halves) {
        chunk.copy_from_slice(&half.to_le_bytes());
    }
    bytes
}

fn arm_or_thumb(thumb: bool) -> &'static str {
    if thumb {
        "THUMB"
    } else {
        "ARM"
    }
}

impl PatchMaker<'_> {
    pub(crate) fn apply_patches(&mut self, elf: &object::File) -> anyhow::Result<()> {
        log::info("Patching the binaries...");

        let patches = self.patches.clone();
        for patch in &patches {
            self.apply_one(patch, elf).with_context(|| {
                format!(
                    "Could not apply patch \"{}\" (\"{}\")",
                    patch.symbol,
                    self.jobs[patch.job].src_path.display()
                )
            })?;
        }

        self.install_newcode()
    }

    fn apply_one(&mut self, patch: &PatchInfo, elf: &object::File) -> anyhow::Result<()> {
        let dest = patch.dest_address;
        let src = patch.src_address;

        match patch.kind {
            PatchKind::Jump => match (patch.dest_thumb, patch.src_thumb) {
                (false, false) => {
                    let bin = self.code_bin(patch.dest_dest)?;
                    bin.write_u32(dest, arm_branch(ARM_OPCODE_B, dest, src))?;
                }
                (false, true) => {
                    let bridge_addr = self.autogen_cursor(patch.src_dest)?;
                    self.autogen_push(patch.src_dest, &arm_to_thumb_bridge(src))?;

                    let bin = self.code_bin(patch.dest_dest)?;
                    bin.write_u32(dest, arm_branch(ARM_OPCODE_B, dest, bridge_addr))?;
                }
                (true, false) => {
                    let bin = self.code_bin(patch.dest_dest)?;
                    bin.write(dest, &thumb_jump_sequence(THUMB_OPCODE_BLX1, dest, src))?;
                }
                (true, true) => {
                    let bin = self.code_bin(patch.dest_dest)?;
                    bin.write(dest, &thumb_jump_sequence(THUMB_OPCODE_BL1, dest, src))?;
                }
            },
            PatchKind::Call => {
                if patch.dest_thumb != patch.src_thumb && !self.target.is_arm9 {
                    bail!("Cannot create thumb-interworking veneer: BLX not supported on armv4.");
                }

                let opcode = match (patch.dest_thumb, patch.src_thumb) {
                    (false, false) => arm_branch(ARM_OPCODE_BL, dest, src),
                    (false, true) => {
                        // The H bit of BLX encodes the halfword offset.
                        let base = ARM_OPCODE_BLX | (((src % 4) >> 1) << 23);
                        arm_branch(base, dest, src)
                    }
                    (true, false) => thumb_branch(THUMB_OPCODE_BLX1, dest, src),
                    (true, true) => thumb_branch(THUMB_OPCODE_BL1, dest, src),
                };
                self.code_bin(patch.dest_dest)?.write_u32(dest, opcode)?;
            }
            PatchKind::Hook => {
                if patch.dest_thumb || patch.src_thumb {
                    bail!(
                        "Injecting hook from {} to {} is not supported.",
                        arm_or_thumb(patch.dest_thumb),
                        arm_or_thumb(patch.src_thumb),
                    );
                }

                let og_opcode = self.code_bin(patch.dest_dest)?.read_u32(dest)?;

                let bridge_addr = self.autogen_cursor(patch.src_dest)?;
                self.autogen_push(patch.src_dest, &hook_bridge(og_opcode, bridge_addr, src, dest))?;

                let bin = self.code_bin(patch.dest_dest)?;
                bin.write_u32(dest, arm_branch(ARM_OPCODE_B, dest, bridge_addr))?;
            }
            PatchKind::Over => {
                let section_idx = patch
                    .section_idx
                    .ok_or_else(|| anyhow!("over patch has no linked section"))?;
                let section = elf.section_by_index(object::SectionIndex(section_idx))?;
                let data = section.data()?;
                self.code_bin(patch.dest_dest)?.write(dest, data)?;
            }
        }
        Ok(())
    }

    /// New code for a destination, with the linker's zero-filled autogen
    /// reservation replaced by the synthesized bridges.
    fn merged_newcode(&self, dest: i32, block: &NewcodeBlock) -> anyhow::Result<Vec<u8>> {
        let written = self.autogen.get(&dest).map(|a| a.data.len()).unwrap_or(0);
        if written > block.bin.len() {
            bail!("Autogen data for destination {dest} exceeds its new-code section.");
        }

        let mut merged = block.bin[..block.bin.len() - written].to_vec();
        if written != 0 {
            merged.extend_from_slice(&self.autogen[&dest].data);
        }
        Ok(merged)
    }

    fn install_newcode(&mut self) -> anyhow::Result<()> {
        let target = self.target;
        let newcode = std::mem::take(&mut self.newcode);

        for (dest, block) in &newcode {
            let dest = *dest;
            let newcode_addr = *self
                .newcode_addr
                .get(&dest)
                .ok_or_else(|| anyhow!("No new-code address for destination {dest}."))?;
            let merged = self.merged_newcode(dest, block)?;

            if log::verbose() {
                log::info(format!(
                    "newcode dest={dest}: bin=0x{:x} (align {}), bss=0x{:x} (align {})",
                    block.bin.len(),
                    block.bin_align,
                    block.bss_size,
                    block.bss_align,
                ));
            }

            if dest == -1 {
                if block.bin.is_empty() && block.bss_size == 0 {
                    continue;
                }
                let arena_lo = target.arena_lo;
                self.arm_mut()?.extend_for_newcode(
                    &merged,
                    block.bss_size,
                    block.bss_align,
                    newcode_addr,
                    arena_lo,
                )?;
            } else {
                let region = target
                    .regions
                    .iter()
                    .find(|r| r.destination == dest)
                    .ok_or_else(|| {
                        anyhow!("Region of overlay {dest} set to add code could not be found!")
                    })?;

                match region.mode {
                    Mode::Append => self.install_overlay_append(dest, &merged, block, region)?,
                    Mode::Replace => {
                        self.install_overlay_replace(dest, newcode_addr, &merged, block, region)?
                    }
                    Mode::Create => bail!("Creating new overlays is not yet supported."),
                }
            }
        }
        Ok(())
    }

    fn install_overlay_append(
        &mut self,
        dest: i32,
        merged: &[u8],
        block: &NewcodeBlock,
        region: &Region,
    ) -> anyhow::Result<()> {
        self.ensure_loaded_for_install(dest)?;
        let entry = &mut self.ovt[dest as usize];
        let overlay = self
            .overlays
            .get_mut(&(dest as u32))
            .ok_or_else(|| anyhow!("Overlay {dest} is not loaded."))?;

        entry.clear_compression();

        let old_size = overlay.data().len();
        let total = old_size + entry.bss_size as usize + block.bin.len() + block.bss_size as usize;
        if total > region.length as usize {
            bail!(
                "Overlay {dest} exceeds max length of {} bytes, got {total} bytes.",
                region.length
            );
        }

        if !block.bin.is_empty() {
            // The old bss becomes zero-filled file data so the new code
            // can live past it.
            let new_size = old_size + entry.bss_size as usize + merged.len();
            let data = overlay.data_mut();
            data.resize(new_size, 0);
            data[new_size - merged.len()..].copy_from_slice(merged);

            entry.ram_size = new_size as u32;
            entry.bss_size = block.bss_size;
        } else {
            entry.bss_size += block.bss_size;
        }
        Ok(())
    }

    fn install_overlay_replace(
        &mut self,
        dest: i32,
        newcode_addr: u32,
        merged: &[u8],
        block: &NewcodeBlock,
        region: &Region,
    ) -> anyhow::Result<()> {
        self.ensure_loaded_for_install(dest)?;
        let entry = &mut self.ovt[dest as usize];
        let overlay = self
            .overlays
            .get_mut(&(dest as u32))
            .ok_or_else(|| anyhow!("Overlay {dest} is not loaded."))?;

        entry.ram_address = newcode_addr;
        entry.ram_size = block.bin.len() as u32;
        entry.bss_size = block.bss_size;
        entry.sinit_start = 0;
        entry.sinit_end = 0;
        entry.clear_compression();

        let total = block.bin.len() + block.bss_size as usize;
        if total > region.length as usize {
            bail!(
                "Overlay {dest} exceeds max length of {} bytes, got {total} bytes.",
                region.length
            );
        }

        let data = overlay.data_mut();
        data.clear();
        data.extend_from_slice(merged);
        Ok(())
    }

    fn ensure_loaded_for_install(&mut self, dest: i32) -> anyhow::Result<()> {
        if dest < 0 {
            bail!("Destination {dest} is not an overlay.");
        }
        self.overlay_mut(dest as u32)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_bridge() {
        // The displaced instruction is not a branch, so it is replayed
        // verbatim between the wrapped call and the resume branch.
        let bytes = hook_bridge(0xE1A00000, 0x02070000, 0x02030000, 0x0200ABCC);

        assert_eq!(&bytes[0..4], &[0x0F, 0x50, 0x2D, 0xE9]); // PUSH
        assert_eq!(&bytes[4..8], &0xEBFEFFFDu32.to_le_bytes()); // BL 0x02030000
        assert_eq!(&bytes[8..12], &[0x0F, 0x50, 0xBD, 0xE8]); // POP
        assert_eq!(&bytes[12..16], &[0x00, 0x00, 0xA0, 0xE1]); // MOV R0, R0
        assert_eq!(&bytes[16..20], &0xEAFE6AEEu32.to_le_bytes()); // B 0x0200ABD0
    }

    #[test]
    fn test_hook_bridge_relocates_branch() {
        // A displaced BL keeps reaching its old destination from inside
        // the bridge.
        let displaced = arm_branch(ARM_OPCODE_BL, 0x02001000, 0x02005000);
        let bytes = hook_bridge(displaced, 0x02070000, 0x02030000, 0x02001000);

        let replayed = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(replayed & 0xFF000000, ARM_OPCODE_BL);
        assert_eq!(replayed, arm_branch(ARM_OPCODE_BL, 0x0207000C, 0x02005000));
    }

    #[test]
    fn test_arm_to_thumb_bridge() {
        let bytes = arm_to_thumb_bridge(0x02020001);
        assert_eq!(bytes, [0x04, 0xF0, 0x1F, 0xE5, 0x01, 0x00, 0x02, 0x02]);

        // The THUMB bit is forced on even entry points.
        let bytes = arm_to_thumb_bridge(0x02020000);
        assert_eq!(&bytes[4..], &[0x01, 0x00, 0x02, 0x02]);
    }

    #[test]
    fn test_thumb_jump_sequence() {
        let bytes = thumb_jump_sequence(THUMB_OPCODE_BL1, 0x02000000, 0x02000100);
        assert_eq!(&bytes[0..2], &[0x00, 0xB5]); // PUSH {LR}
        assert_eq!(&bytes[2..4], &[0x00, 0xF0]); // branch prefix half
        assert_eq!(&bytes[4..6], &[0x00, 0xBD]); // POP {PC}
    }

    mod install {
        use crate::config::Mode;
        use crate::ndsbin::{CodeBin, OvtEntry};
        use crate::patch::apply::{arm_to_thumb_bridge, ARM_TO_THUMB_BRIDGE_SIZE};
        use crate::patch::arm::{arm_branch, ARM_OPCODE_B};
        use crate::patch::info::PatchKind;
        use crate::patch::tests::{
            harness, main_region, overlay_region, patch, write_arm_fixture, Harness,
        };
        use crate::patch::{AutogenData, NewcodeBlock};

        fn empty_elf_bytes() -> Vec<u8> {
            object::write::Object::new(
                object::BinaryFormat::Elf,
                object::Architecture::Arm,
                object::Endianness::Little,
            )
            .write()
            .unwrap()
        }

        fn overlay_harness(mode: Mode, length: u32) -> Harness {
            let harness = harness(vec![overlay_region(3, mode, length)], &[0]);
            std::fs::write(
                harness.dir.path().join("fs/overlay9/overlay9_3.bin"),
                [0x5A; 0x1000],
            )
            .unwrap();
            harness
        }

        fn overlay_ovt() -> Vec<OvtEntry> {
            (0..4)
                .map(|i| OvtEntry {
                    overlay_id: i,
                    ram_address: 0x02180000,
                    ram_size: 0x1000,
                    bss_size: 0x100,
                    ..OvtEntry::default()
                })
                .collect()
        }

        #[test]
        fn test_apply_jump() {
            let harness = harness(vec![main_region()], &[0]);
            write_arm_fixture(&harness.dir.path().join("fs/arm9.bin"));

            let elf_bytes = empty_elf_bytes();
            let elf = object::File::parse(&*elf_bytes).unwrap();

            let mut maker = harness.maker();
            maker.load_arm_bin().unwrap();

            let mut jump = patch("ncp_jump_02000090", PatchKind::Jump, 0x02000090, -1);
            jump.src_address = 0x02020000;
            maker.apply_one(&jump, &elf).unwrap();
            assert_eq!(
                maker.arm().unwrap().read_u32(0x02000090).unwrap(),
                0xEA007FDA
            );
        }

        #[test]
        fn test_apply_jump_to_thumb() {
            let harness = harness(vec![main_region()], &[0]);
            write_arm_fixture(&harness.dir.path().join("fs/arm9.bin"));

            let elf_bytes = empty_elf_bytes();
            let elf = object::File::parse(&*elf_bytes).unwrap();

            let mut maker = harness.maker();
            maker.load_arm_bin().unwrap();
            maker.autogen.insert(
                -1,
                AutogenData {
                    base: 0x02064000,
                    cursor: 0x02064000,
                    data: Vec::new(),
                },
            );
            maker.autogen_reserved.insert(-1, ARM_TO_THUMB_BRIDGE_SIZE);

            let mut jump = patch("ncp_jump_02000090", PatchKind::Jump, 0x02000090, -1);
            jump.src_address = 0x02021001;
            jump.src_thumb = true;
            maker.apply_one(&jump, &elf).unwrap();

            // Each such jump costs exactly one 8-byte bridge.
            let autogen = &maker.autogen[&-1];
            assert_eq!(autogen.data, arm_to_thumb_bridge(0x02021001));
            assert_eq!(autogen.cursor, 0x02064008);

            // The patched site branches to the bridge, not the body.
            assert_eq!(
                maker.arm().unwrap().read_u32(0x02000090).unwrap(),
                arm_branch(ARM_OPCODE_B, 0x02000090, 0x02064000)
            );

            // A second one would overflow the reservation.
            assert!(maker.apply_one(&jump, &elf).is_err());
        }

        #[test]
        fn test_apply_interworking_call_on_arm7() {
            let mut harness = harness(vec![main_region()], &[0]);
            harness.target.is_arm9 = false;
            write_arm_fixture(&harness.dir.path().join("fs/arm9.bin"));

            let elf_bytes = empty_elf_bytes();
            let elf = object::File::parse(&*elf_bytes).unwrap();

            let mut maker = harness.maker();
            let mut call = patch("ncp_tcall_02000090", PatchKind::Call, 0x02000090, -1);
            call.dest_thumb = true;
            call.src_address = 0x02020000;

            let err = maker.apply_one(&call, &elf).unwrap_err();
            assert!(err.to_string().contains("BLX not supported on armv4"));
        }

        #[test]
        fn test_overlay_append_install() {
            let harness = overlay_harness(Mode::Append, 0x1380);
            let mut maker = harness.maker();
            maker.ovt = overlay_ovt();
            maker.newcode_addr.insert(3, 0x02181100);
            maker.newcode.insert(
                3,
                NewcodeBlock {
                    bin: vec![0xC3; 0x200],
                    bin_align: 4,
                    bss_size: 0x80,
                    bss_align: 4,
                },
            );

            maker.install_newcode().unwrap();

            let overlay = &maker.overlays[&3];
            assert_eq!(overlay.data().len(), 0x1300);
            assert!(overlay.data()[..0x1000].iter().all(|b| *b == 0x5A));
            assert!(overlay.data()[0x1000..0x1100].iter().all(|b| *b == 0));
            assert!(overlay.data()[0x1100..].iter().all(|b| *b == 0xC3));
            assert!(overlay.dirty());

            assert_eq!(maker.ovt[3].ram_size, 0x1300);
            assert_eq!(maker.ovt[3].bss_size, 0x80);
            assert_eq!(maker.ovt[3].compressed, 0);
        }

        #[test]
        fn test_overlay_append_overflow() {
            let harness = overlay_harness(Mode::Append, 0x1000);
            let mut maker = harness.maker();
            maker.ovt = overlay_ovt();
            maker.newcode_addr.insert(3, 0x02181100);
            maker.newcode.insert(
                3,
                NewcodeBlock {
                    bin: vec![0xC3; 0x200],
                    bin_align: 4,
                    bss_size: 0x80,
                    bss_align: 4,
                },
            );

            let err = maker.install_newcode().unwrap_err();
            assert!(err.to_string().contains("exceeds max length"));
        }

        #[test]
        fn test_overlay_replace_install() {
            let harness = overlay_harness(Mode::Replace, 0x1000);
            let mut maker = harness.maker();
            maker.ovt = overlay_ovt();
            maker.newcode_addr.insert(3, 0x02300000);
            maker.newcode.insert(
                3,
                NewcodeBlock {
                    bin: vec![0xC3; 0x80],
                    bin_align: 4,
                    bss_size: 0x10,
                    bss_align: 4,
                },
            );

            maker.install_newcode().unwrap();

            let overlay = &maker.overlays[&3];
            assert_eq!(overlay.data().len(), 0x80);
            assert!(overlay.data().iter().all(|b| *b == 0xC3));

            let entry = &maker.ovt[3];
            assert_eq!(entry.ram_address, 0x02300000);
            assert_eq!(entry.ram_size, 0x80);
            assert_eq!(entry.bss_size, 0x10);
            assert_eq!(entry.sinit_start, 0);
            assert_eq!(entry.sinit_end, 0);
            assert_eq!(entry.compressed, 0);
        }

        #[test]
        fn test_merged_newcode() {
            let harness = harness(vec![main_region()], &[0]);
            let mut maker = harness.maker();
            maker.autogen.insert(
                -1,
                AutogenData {
                    base: 0x02064010,
                    cursor: 0x02064010,
                    data: vec![0xBB; 8],
                },
            );

            let block = NewcodeBlock {
                bin: vec![0xAA; 16],
                bin_align: 4,
                bss_size: 0,
                bss_align: 4,
            };
            let merged = maker.merged_newcode(-1, &block).unwrap();
            assert_eq!(&merged[..8], &[0xAA; 8]);
            assert_eq!(&merged[8..], &[0xBB; 8]);
        }
    }
}
