use super::apply::{ARM_TO_THUMB_BRIDGE_SIZE, HOOK_BRIDGE_SIZE};
use super::info::PatchKind;
use super::PatchMaker;
use crate::log;
use anyhow::Context;
use std::fmt::Write;

const COLLECTED_TEXT_SECTIONS: [&str; 8] = [
    "text",
    "rodata",
    "init_array",
    "data",
    "text.*",
    "rodata.*",
    "init_array.*",
    "data.*",
];

struct ScriptRegion {
    dest: i32,
    mem_name: String,
    autogen_size: usize,
    section_patches: Vec<usize>,
}

impl PatchMaker<'_> {
    pub(crate) fn create_linker_script(&mut self) -> anyhow::Result<()> {
        log::info("Generating the linker script...");

        let script = self.render_linker_script()?;
        std::fs::write(&self.ldscript_path, script)
            .with_context(|| format!("Could not write \"{}\"", self.ldscript_path.display()))
    }

    pub(crate) fn render_linker_script(&mut self) -> anyhow::Result<String> {
        let target = self.target;

        // Overlays link before the main binary.
        let mut regions: Vec<&crate::config::Region> = target.regions.iter().collect();
        regions.sort_by(|a, b| b.destination.cmp(&a.destination));

        let mut script_regions: Vec<ScriptRegion> = regions
            .iter()
            .map(|region| ScriptRegion {
                dest: region.destination,
                mem_name: if region.destination == -1 {
                    "arm".to_string()
                } else {
                    format!("ov{}", region.destination)
                },
                autogen_size: 0,
                section_patches: Vec::new(),
            })
            .collect();

        // Over patches get their own fixed memory; everything else is
        // grouped under its job's region, accumulating bridge space.
        let mut over_patches: Vec<(usize, String)> = Vec::new();
        for (patch_idx, patch) in self.patches.iter().enumerate() {
            if patch.kind == PatchKind::Over {
                let mut mem_name = format!("over_{:08x}", patch.dest_address);
                if patch.dest_dest != -1 {
                    write!(mem_name, "_{}", patch.dest_dest).unwrap();
                }
                over_patches.push((patch_idx, mem_name));
            } else {
                let job_dest = target.regions[self.jobs[patch.job].region].destination;
                for script_region in &mut script_regions {
                    if script_region.dest != job_dest {
                        continue;
                    }
                    if patch.declared_as_section {
                        script_region.section_patches.push(patch_idx);
                    }
                    if patch.kind == PatchKind::Hook {
                        script_region.autogen_size += HOOK_BRIDGE_SIZE;
                    } else if patch.kind == PatchKind::Jump && !patch.dest_thumb && patch.src_thumb {
                        script_region.autogen_size += ARM_TO_THUMB_BRIDGE_SIZE;
                    }
                }
            }
        }

        for script_region in &script_regions {
            if script_region.autogen_size != 0 {
                self.autogen_reserved
                    .insert(script_region.dest, script_region.autogen_size);
            }
        }

        let mut o = String::with_capacity(0x10000);
        o.push_str("/* nitropatch: auto-generated linker script */\n\n");

        let symbols = if target.symbols.is_absolute() {
            target.symbols.clone()
        } else {
            self.target_dir.join(&target.symbols)
        };
        writeln!(o, "INCLUDE \"{}\"\n", symbols.display()).unwrap();

        o.push_str("INPUT (\n");
        for job in self.jobs {
            writeln!(o, "\t\"{}\"", job.obj_path.display()).unwrap();
        }
        o.push_str(")\n\n");

        let elf_name = self
            .elf_path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        writeln!(o, "OUTPUT (\"{elf_name}\")\n").unwrap();

        o.push_str("MEMORY {\n");
        o.push_str("\tbin (rwx): ORIGIN = 0x00000000, LENGTH = 0x00100000\n");
        for script_region in &script_regions {
            let origin = *self
                .newcode_addr
                .get(&script_region.dest)
                .with_context(|| format!("No new-code address for destination {}", script_region.dest))?;
            let length = regions
                .iter()
                .find(|r| r.destination == script_region.dest)
                .map(|r| r.length)
                .unwrap_or(0);
            writeln!(
                o,
                "\t{} (rwx): ORIGIN = 0x{origin:08x}, LENGTH = 0x{length:08x}",
                script_region.mem_name
            )
            .unwrap();
        }
        for (patch_idx, mem_name) in &over_patches {
            let patch = &self.patches[*patch_idx];
            writeln!(
                o,
                "\t{mem_name} (rwx): ORIGIN = 0x{:08x}, LENGTH = 0x{:08x}",
                patch.dest_address, patch.section_size
            )
            .unwrap();
        }
        if !self.dests_with_ncp_set.is_empty() {
            o.push_str("\tncp_set (rwx): ORIGIN = 0x00000000, LENGTH = 0x00100000\n");
        }
        o.push_str("}\n\nSECTIONS {\n");

        for script_region in &script_regions {
            let mem = &script_region.mem_name;

            writeln!(o, "\t.{mem}.text : ALIGN(4) {{").unwrap();
            for &patch_idx in &script_region.section_patches {
                // Section patches become labels so their final addresses
                // are visible after the link.
                let symbol = &self.patches[patch_idx].symbol;
                writeln!(o, "\t\t{} = .;", &symbol[1..]).unwrap();
                writeln!(o, "\t\tKEEP(* ({symbol}))").unwrap();
            }
            for rtrepl in &self.rtrepl_patches {
                if target.regions[self.jobs[rtrepl.job].region].destination != script_region.dest {
                    continue;
                }
                let stem = &rtrepl.symbol[1..];
                writeln!(o, "\t\t{stem}_start = .;").unwrap();
                writeln!(o, "\t\t* ({})", rtrepl.symbol).unwrap();
                writeln!(o, "\t\t{stem}_end = .;").unwrap();
            }

            if script_region.dest == -1 {
                for collected in COLLECTED_TEXT_SECTIONS {
                    writeln!(o, "\t\t* (.{collected})").unwrap();
                }
            } else {
                for job in self.jobs_in_dest(script_region.dest) {
                    for collected in COLLECTED_TEXT_SECTIONS {
                        writeln!(o, "\t\t\"{}\" (.{collected})", job.obj_path.display()).unwrap();
                    }
                }
            }

            if script_region.autogen_size != 0 {
                let symbol = if script_region.dest == -1 {
                    "ncp_autogendata".to_string()
                } else {
                    format!("ncp_autogendata_{mem}")
                };
                o.push_str("\t\t. = ALIGN(4);\n");
                writeln!(o, "\t\t{symbol} = .;").unwrap();
                o.push_str("\t\tFILL(0)\n");
                writeln!(o, "\t\t. = {symbol} + {};", script_region.autogen_size).unwrap();
            }
            o.push_str("\t\t. = ALIGN(4);\n");
            writeln!(o, "\t}} > {mem} AT > bin\n").unwrap();

            writeln!(o, "\t.{mem}.bss : ALIGN(4) {{").unwrap();
            if script_region.dest == -1 {
                o.push_str("\t\t* (.bss)\n\t\t* (.bss.*)\n");
            } else {
                for job in self.jobs_in_dest(script_region.dest) {
                    writeln!(o, "\t\t\"{}\" (.bss)", job.obj_path.display()).unwrap();
                    writeln!(o, "\t\t\"{}\" (.bss.*)", job.obj_path.display()).unwrap();
                }
            }
            o.push_str("\t\t. = ALIGN(4);\n");
            writeln!(o, "\t}} > {mem} AT > bin\n").unwrap();
        }

        for (patch_idx, mem_name) in &over_patches {
            let symbol = &self.patches[*patch_idx].symbol;
            writeln!(o, "\t{symbol} : {{ KEEP(* ({symbol})) }} > {mem_name} AT > bin").unwrap();
        }
        if !over_patches.is_empty() {
            o.push('\n');
        }

        for &dest in &self.dests_with_ncp_set {
            if dest == -1 {
                o.push_str("\t.ncp_set : { KEEP(* (.ncp_set)) } > ncp_set AT > bin\n");
            } else {
                writeln!(o, "\t.ncp_set_ov{dest} : {{").unwrap();
                for &job_idx in &self.jobs_with_ncp_set {
                    let job = &self.jobs[job_idx];
                    if target.regions[job.region].destination == dest {
                        writeln!(o, "\t\tKEEP(\"{}\" (.ncp_set))", job.obj_path.display()).unwrap();
                    }
                }
                o.push_str("\t} > ncp_set AT > bin\n");
            }
        }
        if !self.dests_with_ncp_set.is_empty() {
            o.push('\n');
        }

        o.push_str("\t/DISCARD/ : {*(.*)}\n}\n");

        if !self.extern_symbols.is_empty() {
            o.push_str("\nEXTERN (\n");
            for symbol in &self.extern_symbols {
                writeln!(o, "\t{symbol}").unwrap();
            }
            o.push_str(")\n");
        }

        Ok(o)
    }

    fn jobs_in_dest(&self, dest: i32) -> impl Iterator<Item = &crate::jobs::SourceFileJob> {
        self.jobs
            .iter()
            .filter(move |job| self.target.regions[job.region].destination == dest)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{harness, main_region, overlay_region, patch};
    use super::super::info::{PatchKind, RtReplPatch};
    use crate::config::Mode;

    #[test]
    fn test_render_linker_script() {
        let harness = harness(
            vec![main_region(), overlay_region(3, Mode::Append, 0x40000)],
            &[0, 1],
        );
        let mut maker = harness.maker();

        maker.newcode_addr.insert(-1, 0x02064000);
        maker.newcode_addr.insert(3, 0x021B1100);

        let mut jump = patch(".ncp_jump_02000000", PatchKind::Jump, 0x02000000, -1);
        jump.declared_as_section = true;
        jump.section_idx = Some(1);

        let hook = patch("ncp_hook_02000900", PatchKind::Hook, 0x02000900, -1);

        let mut thumb_jump = patch("ncp_jump_02001000", PatchKind::Jump, 0x02001000, -1);
        thumb_jump.src_thumb = true;

        let mut over = patch(".ncp_over_021B0040_ov3", PatchKind::Over, 0x021B0040, 3);
        over.declared_as_section = true;
        over.section_size = 0x20;
        over.job = 1;

        let mut ov_call = patch("ncp_call_021B0000_ov3", PatchKind::Call, 0x021B0000, 3);
        ov_call.job = 1;

        maker.patches = vec![jump, hook, thumb_jump, over, ov_call];
        maker.extern_symbols = vec![
            "ncp_hook_02000900".into(),
            "ncp_jump_02001000".into(),
            "ncp_call_021B0000_ov3".into(),
        ];
        maker.rtrepl_patches = vec![RtReplPatch {
            symbol: ".ncp_rtrepl_anim_table".into(),
            job: 0,
        }];
        maker.dests_with_ncp_set = vec![3];
        maker.jobs_with_ncp_set = vec![1];

        let script = maker.render_linker_script().unwrap();

        // Overlay memory precedes the main memory.
        let ov_mem = script.find("\tov3 (rwx): ORIGIN = 0x021b1100, LENGTH = 0x00040000").unwrap();
        let arm_mem = script.find("\tarm (rwx): ORIGIN = 0x02064000, LENGTH = 0x00008000").unwrap();
        assert!(ov_mem < arm_mem);

        assert!(script.contains("\tover_021b0040_3 (rwx): ORIGIN = 0x021b0040, LENGTH = 0x00000020"));
        assert!(script.contains("\tncp_set (rwx): ORIGIN = 0x00000000, LENGTH = 0x00100000"));

        // Section patches turn into labels inside their text section.
        assert!(script.contains("\t\tncp_jump_02000000 = .;"));
        assert!(script.contains("\t\tKEEP(* (.ncp_jump_02000000))"));

        // The rtrepl pair brackets its input section.
        assert!(script.contains("\t\tncp_rtrepl_anim_table_start = .;"));
        assert!(script.contains("\t\t* (.ncp_rtrepl_anim_table)"));
        assert!(script.contains("\t\tncp_rtrepl_anim_table_end = .;"));

        // One hook and one ARM-to-THUMB jump reserve 28 bridge bytes.
        assert!(script.contains("\t\tncp_autogendata = .;"));
        assert!(script.contains("\t\t. = ncp_autogendata + 28;"));
        assert_eq!(maker.autogen_reserved[&-1], 28);
        assert!(maker.autogen_reserved.get(&3).is_none());

        // Overlay text collects only its own objects.
        let ov3_text = &script[script.find("\t.ov3.text").unwrap()..script.find("\t.ov3.bss").unwrap()];
        assert!(ov3_text.contains("file1.c.o\" (.text)"));
        assert!(!ov3_text.contains("file0.c.o"));

        assert!(script.contains(
            "\t.ncp_over_021B0040_ov3 : { KEEP(* (.ncp_over_021B0040_ov3)) } > over_021b0040_3 AT > bin"
        ));
        assert!(script.contains("\t.ncp_set_ov3 : {"));
        assert!(script.contains("file1.c.o\" (.ncp_set))"));
        assert!(script.contains("\t/DISCARD/ : {*(.*)}"));
        assert!(script.contains("EXTERN (\n\tncp_hook_02000900\n\tncp_jump_02001000\n\tncp_call_021B0000_ov3\n)"));
    }
}
