pub mod apply;
pub mod arm;
pub mod info;
pub mod ldscript;

use crate::config::{BuildConfig, BuildTarget, Mode, RebuildConfig, ADDRESS_KEEP};
use crate::header::HeaderBin;
use crate::jobs::SourceFileJob;
use crate::log;
use crate::ndsbin::{ovtable, ArmBin, CodeBin, OverlayBin, OvtEntry};
use anyhow::{anyhow, bail, Context};
use info::{Directive, DirectiveError, PatchInfo, PatchKind, RtReplPatch};
use object::{Object, ObjectSection, ObjectSymbol};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Synthesized bridge code for one destination, placed at the address the
/// linker assigned to `ncp_autogendata[_ovN]`.
#[derive(Debug, Default)]
pub struct AutogenData {
    pub base: u32,
    pub cursor: u32,
    pub data: Vec<u8>,
}

/// New code and bss extracted from the linked ELF for one destination.
#[derive(Debug, Default, Clone)]
pub struct NewcodeBlock {
    pub bin: Vec<u8>,
    pub bin_align: u32,
    pub bss_size: u32,
    pub bss_align: u32,
}

pub struct PatchMaker<'a> {
    config: &'a BuildConfig,
    target: &'a BuildTarget,
    target_dir: PathBuf,
    build_dir: PathBuf,
    rom_dir: PathBuf,
    backup_dir: PathBuf,
    header: &'a HeaderBin,
    jobs: &'a [SourceFileJob],

    ldscript_path: PathBuf,
    elf_path: PathBuf,

    arm: Option<ArmBin>,
    ovt: Vec<OvtEntry>,
    bak_ovt: Option<Vec<OvtEntry>>,
    overlays: BTreeMap<u32, OverlayBin>,

    patches: Vec<PatchInfo>,
    rtrepl_patches: Vec<RtReplPatch>,
    extern_symbols: Vec<String>,
    dests_with_ncp_set: Vec<i32>,
    jobs_with_ncp_set: Vec<usize>,
    newcode_addr: BTreeMap<i32, u32>,
    autogen: BTreeMap<i32, AutogenData>,
    autogen_reserved: BTreeMap<i32, usize>,
    newcode: BTreeMap<i32, NewcodeBlock>,
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

impl<'a> PatchMaker<'a> {
    pub fn new(
        config: &'a BuildConfig,
        target: &'a BuildTarget,
        target_dir: &Path,
        build_dir: &Path,
        work_dir: &Path,
        header: &'a HeaderBin,
        jobs: &'a [SourceFileJob],
    ) -> Self {
        let (ldscript_name, elf_name) = if target.is_arm9 {
            ("ldscript9.x", "arm9.elf")
        } else {
            ("ldscript7.x", "arm7.elf")
        };

        PatchMaker {
            config,
            target,
            target_dir: target_dir.to_path_buf(),
            build_dir: build_dir.to_path_buf(),
            rom_dir: absolutize(&config.filesystem_dir, work_dir),
            backup_dir: absolutize(&config.backup_dir, work_dir),
            header,
            jobs,
            ldscript_path: build_dir.join(ldscript_name),
            elf_path: build_dir.join(elf_name),
            arm: None,
            ovt: Vec::new(),
            bak_ovt: None,
            overlays: BTreeMap::new(),
            patches: Vec::new(),
            rtrepl_patches: Vec::new(),
            extern_symbols: Vec::new(),
            dests_with_ncp_set: Vec::new(),
            jobs_with_ncp_set: Vec::new(),
            newcode_addr: BTreeMap::new(),
            autogen: BTreeMap::new(),
            autogen_reserved: BTreeMap::new(),
            newcode: BTreeMap::new(),
        }
    }

    pub fn run(&mut self, rebuild: &mut RebuildConfig) -> anyhow::Result<()> {
        let is_arm9 = self.target.is_arm9;

        if self.jobs.is_empty() {
            bail!("There are no source files to link.");
        }

        self.create_directories()?;
        self.load_arm_bin()?;
        self.load_overlay_table()?;

        for id in rebuild.patched_overlays(is_arm9).to_vec() {
            self.ensure_overlay_loaded(id)?;
        }

        self.fetch_newcode_addrs()?;
        self.gather_info_from_objects()?;
        self.create_linker_script()?;
        self.link_elf()?;

        let elf_data = std::fs::read(&self.elf_path)
            .with_context(|| format!("Could not read \"{}\"", self.elf_path.display()))?;
        let elf = object::File::parse(&*elf_data).context("Could not parse the linked ELF file.")?;
        self.gather_info_from_elf(&elf)?;
        self.apply_patches(&elf).context(if is_arm9 {
            "Failed to apply patches for ARM9 target."
        } else {
            "Failed to apply patches for ARM7 target."
        })?;
        drop(elf);

        let dirty: Vec<u32> = self
            .overlays
            .iter()
            .filter(|(_, ov)| ov.dirty())
            .map(|(id, _)| *id)
            .collect();
        rebuild.set_patched_overlays(is_arm9, dirty);

        self.save_overlay_bins()?;
        self.save_overlay_table()?;
        self.save_arm_bin()?;
        Ok(())
    }

    fn create_directories(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.build_dir).with_context(|| {
            format!("Could not create build directory: \"{}\"", self.build_dir.display())
        })?;

        let overlay_dir = self.backup_dir.join(self.overlay_prefix());
        std::fs::create_dir_all(&overlay_dir).with_context(|| {
            format!("Could not create backup directory: \"{}\"", overlay_dir.display())
        })?;
        Ok(())
    }

    fn overlay_prefix(&self) -> &'static str {
        if self.target.is_arm9 {
            "overlay9"
        } else {
            "overlay7"
        }
    }

    fn overlay_rel_path(&self, id: u32) -> PathBuf {
        let prefix = self.overlay_prefix();
        Path::new(prefix).join(format!("{prefix}_{id}.bin"))
    }

    fn arm(&self) -> anyhow::Result<&ArmBin> {
        self.arm.as_ref().ok_or_else(|| anyhow!("the ARM binary is not loaded"))
    }

    fn arm_mut(&mut self) -> anyhow::Result<&mut ArmBin> {
        self.arm.as_mut().ok_or_else(|| anyhow!("the ARM binary is not loaded"))
    }

    fn load_arm_bin(&mut self) -> anyhow::Result<()> {
        let header = self.header;
        let (name, entry_address, ram_address, autoload_hook) = if self.target.is_arm9 {
            (
                "arm9.bin",
                header.arm9.entry_address,
                header.arm9.ram_address,
                header.arm9_autoload_hook,
            )
        } else {
            (
                "arm7.bin",
                header.arm7.entry_address,
                header.arm7.ram_address,
                header.arm7_autoload_hook,
            )
        };

        let bak_path = self.backup_dir.join(name);
        let arm = if bak_path.exists() {
            ArmBin::load(&bak_path, entry_address, ram_address, autoload_hook, self.target.is_arm9)
                .with_context(|| format!("Could not load \"{}\"", bak_path.display()))?
        } else {
            let rom_path = self.rom_dir.join(name);
            let arm = ArmBin::load(&rom_path, entry_address, ram_address, autoload_hook, self.target.is_arm9)
                .with_context(|| format!("Could not load \"{}\"", rom_path.display()))?;
            std::fs::write(&bak_path, arm.data())
                .with_context(|| format!("Could not write \"{}\"", bak_path.display()))?;
            arm
        };

        if log::verbose() {
            log::info(format!(
                "{} binary: 0x{:08x}..0x{:08x}, entry 0x{:08x}",
                if arm.is_arm9() { "ARM9" } else { "ARM7" },
                arm.base_address(),
                arm.end_address(),
                arm.entry_address(),
            ));
        }

        self.arm = Some(arm);
        Ok(())
    }

    fn save_arm_bin(&self) -> anyhow::Result<()> {
        let name = if self.target.is_arm9 { "arm9.bin" } else { "arm7.bin" };
        let path = self.rom_dir.join(name);
        std::fs::write(&path, self.arm()?.data())
            .with_context(|| format!("Could not write \"{}\"", path.display()))
    }

    fn load_overlay_table(&mut self) -> anyhow::Result<()> {
        log::info("Loading overlay table...");

        let name = if self.target.is_arm9 { "arm9ovt.bin" } else { "arm7ovt.bin" };
        let bak_path = self.backup_dir.join(name);

        if bak_path.exists() {
            self.ovt = ovtable::load(&bak_path)
                .with_context(|| format!("Could not load \"{}\"", bak_path.display()))?;
            self.bak_ovt = None;
        } else {
            let rom_path = self.rom_dir.join(name);
            if !rom_path.exists() {
                bail!("Could not find \"{}\"", rom_path.display());
            }
            self.ovt = ovtable::load(&rom_path)
                .with_context(|| format!("Could not load \"{}\"", rom_path.display()))?;
            self.bak_ovt = Some(self.ovt.clone());
        }
        Ok(())
    }

    fn save_overlay_table(&self) -> anyhow::Result<()> {
        let name = if self.target.is_arm9 { "arm9ovt.bin" } else { "arm7ovt.bin" };

        if let Some(bak_ovt) = &self.bak_ovt {
            let bak_path = self.backup_dir.join(name);
            ovtable::save(&bak_path, bak_ovt)
                .with_context(|| format!("Could not write \"{}\"", bak_path.display()))?;
        }

        let rom_path = self.rom_dir.join(name);
        ovtable::save(&rom_path, &self.ovt)
            .with_context(|| format!("Could not write \"{}\"", rom_path.display()))
    }

    fn ensure_overlay_loaded(&mut self, id: u32) -> anyhow::Result<()> {
        if self.overlays.contains_key(&id) {
            return Ok(());
        }

        let idx = id as usize;
        if idx >= self.ovt.len() {
            bail!("Overlay {id} is not present in the overlay table.");
        }

        let rel = self.overlay_rel_path(id);
        let bak_path = self.backup_dir.join(&rel);

        // A backup always holds decompressed bytes.
        let overlay = if bak_path.exists() {
            OverlayBin::load(&bak_path, self.ovt[idx].ram_address, false, id)?
        } else {
            let rom_path = self.rom_dir.join(&rel);
            let mut overlay =
                OverlayBin::load(&rom_path, self.ovt[idx].ram_address, self.ovt[idx].is_compressed(), id)?;
            overlay.capture_backup();
            overlay
        };

        self.ovt[idx].set_flags(0);
        if let Some(bak_ovt) = &mut self.bak_ovt {
            bak_ovt[idx].set_flags(0);
        }

        if log::verbose() {
            log::info(format!(
                "Loaded overlay {} (0x{:x} bytes)",
                overlay.id(),
                overlay.data().len()
            ));
        }

        self.overlays.insert(id, overlay);
        Ok(())
    }

    fn overlay_mut(&mut self, id: u32) -> anyhow::Result<&mut OverlayBin> {
        self.ensure_overlay_loaded(id)?;
        self.overlays
            .get_mut(&id)
            .ok_or_else(|| anyhow!("Overlay {id} is not loaded."))
    }

    pub(crate) fn code_bin(&mut self, dest: i32) -> anyhow::Result<&mut dyn CodeBin> {
        if dest == -1 {
            Ok(self.arm_mut()?)
        } else {
            Ok(self.overlay_mut(dest as u32)?)
        }
    }

    fn save_overlay_bins(&self) -> anyhow::Result<()> {
        for (id, overlay) in &self.overlays {
            let rel = self.overlay_rel_path(*id);

            let rom_path = self.rom_dir.join(&rel);
            std::fs::write(&rom_path, overlay.data())
                .with_context(|| format!("Could not write \"{}\"", rom_path.display()))?;

            // First-run loads keep their pristine bytes around; those, not
            // the patched buffer, become the backup.
            if !overlay.backup_data().is_empty() {
                let bak_path = self.backup_dir.join(&rel);
                std::fs::write(&bak_path, overlay.backup_data())
                    .with_context(|| format!("Could not write \"{}\"", bak_path.display()))?;
            }
        }
        Ok(())
    }

    /// Decides where new code goes for every destination: the heap floor
    /// read from `arena_lo` for the main binary, and the region's
    /// mode-dependent address for overlays.
    fn fetch_newcode_addrs(&mut self) -> anyhow::Result<()> {
        let target = self.target;

        let arena = self.arm()?.read_u32(target.arena_lo).with_context(|| {
            format!("Could not read the heap floor at 0x{:08x}", target.arena_lo)
        })?;
        self.newcode_addr.insert(-1, arena);

        for region in &target.regions {
            let dest = region.destination;
            if dest == -1 {
                continue;
            }

            let entry = self
                .ovt
                .get(dest as usize)
                .ok_or_else(|| anyhow!("Overlay {dest} is not present in the overlay table."))?;

            let addr = match region.mode {
                Mode::Append => entry.ram_address + entry.ram_size + entry.bss_size,
                Mode::Replace => {
                    if region.address == ADDRESS_KEEP {
                        entry.ram_address
                    } else {
                        region.address
                    }
                }
                Mode::Create => region.address,
            };
            self.newcode_addr.insert(dest, addr);
        }
        Ok(())
    }

    fn add_directive(
        &mut self,
        name: &str,
        declared_as_section: bool,
        section_idx: Option<usize>,
        section_size: u32,
        symbol_value: u32,
        job: usize,
        region_dest: i32,
    ) {
        match info::parse_directive(name, declared_as_section) {
            Ok(Directive::RtRepl) => {
                // Labels inside rtrepl sections are placeholders.
                if declared_as_section {
                    self.rtrepl_patches.push(RtReplPatch {
                        symbol: name.to_string(),
                        job,
                    });
                }
            }
            Ok(Directive::Patch {
                kind,
                is_ncp_set,
                dest_address,
                dest_thumb,
                dest_overlay,
            }) => {
                let src_dest = if kind == PatchKind::Over {
                    dest_overlay
                } else {
                    region_dest
                };
                self.patches.push(PatchInfo {
                    src_address: 0,
                    src_dest,
                    dest_address,
                    dest_dest: dest_overlay,
                    kind,
                    is_ncp_set,
                    src_thumb: symbol_value & 1 != 0,
                    dest_thumb,
                    declared_as_section,
                    section_idx,
                    section_size,
                    symbol: name.to_string(),
                    job,
                });
            }
            Err(DirectiveError::MissingSeparator) => {}
            Err(e) => log::warn(e.to_string()),
        }
    }

    /// Scans every object for patch directives declared through section
    /// and symbol names.
    pub(crate) fn gather_info_from_objects(&mut self) -> anyhow::Result<()> {
        log::info("Getting patches from objects...");

        for (job_idx, job) in self.jobs.iter().enumerate() {
            let region_dest = self.target.regions[job.region].destination;

            let data = std::fs::read(&job.obj_path)
                .with_context(|| format!("Could not read \"{}\"", job.obj_path.display()))?;
            let elf = object::File::parse(&*data)
                .with_context(|| format!("Could not parse \"{}\"", job.obj_path.display()))?;

            let first_patch = self.patches.len();

            for section in elf.sections() {
                let Ok(name) = section.name() else {
                    continue;
                };
                if !name.starts_with(info::SECTION_PREFIX) {
                    continue;
                }

                if name[info::SECTION_PREFIX.len()..].starts_with("set") {
                    if !self.dests_with_ncp_set.contains(&region_dest) {
                        self.dests_with_ncp_set.push(region_dest);
                    }
                    if !self.jobs_with_ncp_set.contains(&job_idx) {
                        self.jobs_with_ncp_set.push(job_idx);
                    }
                    continue;
                }

                self.add_directive(
                    name,
                    true,
                    Some(section.index().0),
                    section.size() as u32,
                    0,
                    job_idx,
                    region_dest,
                );
            }

            // Whether a section patch's implementation is THUMB comes from
            // the function symbol living in the directive's section.
            for sym in elf.symbols() {
                if sym.kind() != object::SymbolKind::Text {
                    continue;
                }
                let Some(section_idx) = sym.section_index() else {
                    continue;
                };
                for patch in &mut self.patches[first_patch..] {
                    if patch.declared_as_section && patch.section_idx == Some(section_idx.0) {
                        patch.src_thumb = sym.address() & 1 != 0;
                        break;
                    }
                }
            }

            for sym in elf.symbols() {
                let Ok(name) = sym.name() else {
                    continue;
                };
                if !name.starts_with(info::SYMBOL_PREFIX)
                    || &name[info::SYMBOL_PREFIX.len()..] == "dest"
                {
                    continue;
                }
                self.add_directive(name, false, None, 0, sym.address() as u32, job_idx, region_dest);
            }

            for patch in &self.patches[first_patch..] {
                if !patch.declared_as_section {
                    self.extern_symbols.push(patch.symbol.clone());
                }
            }
        }

        if log::verbose() {
            for p in &self.patches {
                log::info(format!(
                    "  {} kind={} dest=0x{:08x} ov={} set={} src_thumb={} dest_thumb={}",
                    p.symbol, p.kind, p.dest_address, p.dest_dest, p.is_ncp_set, p.src_thumb, p.dest_thumb,
                ));
            }
        }
        Ok(())
    }

    fn link_elf(&self) -> anyhow::Result<()> {
        log::info("Linking the ARM binary...");

        let gcc = format!("{}gcc", self.config.toolchain);

        let ldscript_name = self
            .ldscript_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut wl_arg = format!("-Wl,--gc-sections,-T{ldscript_name}");
        if !self.target.ld_flags.is_empty() {
            wl_arg.push(',');
            wl_arg.push_str(&self.target.ld_flags);
        }

        let output = std::process::Command::new(&gcc)
            .current_dir(&self.build_dir)
            .arg(wl_arg)
            .output()
            .with_context(|| format!("Could not run \"{gcc}\""))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.is_empty() {
            log::info(stderr.trim_end());
        }
        if !output.status.success() {
            bail!("Could not link the ELF file.");
        }
        Ok(())
    }

    /// Re-reads the linked ELF: installs final source addresses, collects
    /// autogen bases, resolves `ncp_set` tables, verifies that no two
    /// patches overlap and captures the per-destination new-code blocks.
    pub(crate) fn gather_info_from_elf(&mut self, elf: &object::File) -> anyhow::Result<()> {
        log::info("Getting patches from elf...");

        for sym in elf.symbols() {
            let Ok(name) = sym.name() else {
                continue;
            };
            let address = sym.address() as u32;
            let section_idx = sym.section_index().map(|i| i.0);

            for patch in &mut self.patches {
                if patch.declared_as_section {
                    if patch.symbol.strip_prefix('.') == Some(name) {
                        patch.src_address = address;
                        patch.section_idx = section_idx;
                        patch.symbol = name.to_string();
                    }
                } else if patch.symbol == name {
                    patch.src_address = address;
                    patch.section_idx = section_idx;
                }
            }

            if let Some(rest) = name.strip_prefix("ncp_autogendata") {
                let dest = if rest.is_empty() {
                    Some(-1)
                } else if let Some(number) = rest.strip_prefix("_ov") {
                    match number.parse::<i32>() {
                        Ok(n) => Some(n),
                        Err(_) => {
                            log::warn(format!(
                                "Found invalid overlay parsing ncp_autogendata symbol: {name}"
                            ));
                            None
                        }
                    }
                } else {
                    None
                };

                if let Some(dest) = dest {
                    self.autogen.insert(
                        dest,
                        AutogenData {
                            base: address,
                            cursor: address,
                            data: Vec::new(),
                        },
                    );
                }
            }
        }

        for section in elf.sections() {
            let Ok(name) = section.name() else {
                continue;
            };
            let address = section.address() as u32;

            for patch in &mut self.patches {
                if patch.kind == PatchKind::Over && patch.symbol == name {
                    patch.src_address = address;
                    patch.section_idx = Some(section.index().0);
                }
            }

            if let Some(rest) = name.strip_prefix(".ncp_set") {
                let valid = if rest.is_empty() {
                    true
                } else if let Some(number) = rest.strip_prefix("_ov") {
                    let ok = number.parse::<i32>().is_ok();
                    if !ok {
                        log::warn(format!("Found invalid overlay reading ncp_set section: {name}"));
                    }
                    ok
                } else {
                    false
                };

                if valid {
                    let data = section
                        .data()
                        .with_context(|| format!("Could not read section \"{name}\""))?;

                    // Set-style patches carry an offset into this table;
                    // the stored word is the real hook target.
                    for patch in &mut self.patches {
                        if !patch.is_ncp_set {
                            continue;
                        }
                        let Some(offset) = patch.src_address.checked_sub(address) else {
                            continue;
                        };
                        let offset = offset as usize;
                        if offset + 4 <= data.len() {
                            patch.src_address =
                                u32::from_le_bytes(data[offset..offset + 4].try_into().unwrap());
                        }
                    }
                }
            }
        }

        self.check_overlapping_patches()?;

        for section in elf.sections() {
            let Ok(name) = section.name() else {
                continue;
            };

            if let Some(rest) = name.strip_prefix(".arm.") {
                let is_bss = rest == "bss";
                self.capture_newcode(-1, is_bss, &section)?;
            } else if let Some(rest) = name.strip_prefix(".ov") {
                if let Some(dot) = rest.find('.') {
                    if let Ok(dest) = rest[..dot].parse::<i32>() {
                        let is_bss = &rest[dot + 1..] == "bss";
                        self.capture_newcode(dest, is_bss, &section)?;
                    }
                }
            }
        }

        Ok(())
    }

    fn capture_newcode(
        &mut self,
        dest: i32,
        is_bss: bool,
        section: &object::Section,
    ) -> anyhow::Result<()> {
        let block = self.newcode.entry(dest).or_default();
        if is_bss {
            block.bss_size = section.size() as u32;
            block.bss_align = section.align() as u32;
        } else {
            block.bin = section
                .data()
                .with_context(|| format!("Could not read new-code section for destination {dest}"))?
                .to_vec();
            block.bin_align = section.align() as u32;
        }
        Ok(())
    }

    fn check_overlapping_patches(&self) -> anyhow::Result<()> {
        let mut found = false;
        for (i, a) in self.patches.iter().enumerate() {
            for b in &self.patches[i + 1..] {
                if a.dest_dest != b.dest_dest {
                    continue;
                }
                let a_end = a.dest_address + a.dest_size();
                let b_end = b.dest_address + b.dest_size();
                if a.dest_address < b_end && b.dest_address < a_end {
                    log::error(format!(
                        "\"{}\"[sz={}] (\"{}\") overlaps with \"{}\"[sz={}] (\"{}\")",
                        a.symbol,
                        a.dest_size(),
                        self.jobs[a.job].src_path.display(),
                        b.symbol,
                        b.dest_size(),
                        self.jobs[b.job].src_path.display(),
                    ));
                    found = true;
                }
            }
        }
        if found {
            bail!("Overlapping patches were detected.");
        }
        Ok(())
    }

    pub(crate) fn autogen_cursor(&self, dest: i32) -> anyhow::Result<u32> {
        self.autogen
            .get(&dest)
            .map(|a| a.cursor)
            .ok_or_else(|| anyhow!("No autogen region was allocated for destination {dest}."))
    }

    pub(crate) fn autogen_push(&mut self, dest: i32, bytes: &[u8]) -> anyhow::Result<()> {
        let reserved = self.autogen_reserved.get(&dest).copied().unwrap_or(0);
        let autogen = self
            .autogen
            .get_mut(&dest)
            .ok_or_else(|| anyhow!("No autogen region was allocated for destination {dest}."))?;

        autogen.data.extend_from_slice(bytes);
        autogen.cursor += bytes.len() as u32;
        debug_assert_eq!(autogen.cursor - autogen.base, autogen.data.len() as u32);
        if autogen.data.len() > reserved {
            bail!("Autogen region for destination {dest} overflowed its {reserved} reserved bytes.");
        }
        Ok(())
    }
}
