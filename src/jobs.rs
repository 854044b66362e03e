use crate::config::BuildTarget;
use std::path::{Path, PathBuf};

/// One prebuilt object file belonging to a region. `src_path` is the
/// source the object was compiled from, kept for diagnostics only.
#[derive(Debug, PartialEq, Clone)]
pub struct SourceFileJob {
    pub src_path: PathBuf,
    pub obj_path: PathBuf,
    pub region: usize,
}

fn find_jobs_impl(
    current_path: impl AsRef<Path>,
    region: usize,
    jobs: &mut Vec<SourceFileJob>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(current_path)? {
        let entry = entry?;
        let entry_type = entry.file_type()?;
        let entry_path = entry.path();

        if entry_type.is_dir() {
            find_jobs_impl(&entry_path, region, jobs)?;
        } else if entry_type.is_file() {
            if entry_path.extension() == Some(std::ffi::OsStr::new("o")) {
                let mut src_path = entry_path.clone();
                src_path.set_extension("");

                jobs.push(SourceFileJob {
                    src_path,
                    obj_path: entry_path,
                    region,
                });
            }
        }
    }

    Ok(())
}

/// Collects every object file under each region's source directories.
/// Paths are resolved against `target_dir`; missing directories are an
/// error. The result is sorted so linker inputs are deterministic.
pub fn find_jobs(target: &BuildTarget, target_dir: &Path) -> std::io::Result<Vec<SourceFileJob>> {
    let mut jobs = Vec::new();

    for (region_idx, region) in target.regions.iter().enumerate() {
        for dir in &region.sources {
            let dir = if dir.is_absolute() {
                dir.clone()
            } else {
                target_dir.join(dir)
            };
            find_jobs_impl(&dir, region_idx, &mut jobs)?;
        }
    }

    jobs.sort_by(|a, b| a.obj_path.cmp(&b.obj_path));
    Ok(jobs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Mode, Region};

    fn region(sources: Vec<PathBuf>) -> Region {
        Region {
            destination: -1,
            mode: Mode::Append,
            address: 0xFFFFFFFF,
            length: 0x1000,
            sources,
        }
    }

    #[test]
    fn test_find_jobs() {
        let tempdir = tempfile::tempdir().unwrap();
        let root = tempdir.path();

        std::fs::create_dir_all(root.join("obj/main/sub")).unwrap();
        std::fs::create_dir_all(root.join("obj/ov3")).unwrap();

        std::fs::write(root.join("obj/main/a.c.o"), "").unwrap();
        std::fs::write(root.join("obj/main/sub/b.cpp.o"), "").unwrap();
        std::fs::write(root.join("obj/main/notes.txt"), "").unwrap();
        std::fs::write(root.join("obj/ov3/c.s.o"), "").unwrap();

        let target = BuildTarget {
            symbols: PathBuf::from("symbols.x"),
            ld_flags: String::new(),
            arena_lo: 0,
            regions: vec![
                region(vec![PathBuf::from("obj/main")]),
                region(vec![PathBuf::from("obj/ov3")]),
            ],
            is_arm9: true,
        };

        let jobs = find_jobs(&target, root).unwrap();
        assert_eq!(jobs.len(), 3);

        assert_eq!(jobs[0].obj_path, root.join("obj/main/a.c.o"));
        assert_eq!(jobs[0].src_path, root.join("obj/main/a.c"));
        assert_eq!(jobs[0].region, 0);

        assert_eq!(jobs[1].obj_path, root.join("obj/main/sub/b.cpp.o"));
        assert_eq!(jobs[1].region, 0);

        assert_eq!(jobs[2].obj_path, root.join("obj/ov3/c.s.o"));
        assert_eq!(jobs[2].region, 1);
    }

    #[test]
    fn test_missing_dir() {
        let tempdir = tempfile::tempdir().unwrap();
        let target = BuildTarget {
            symbols: PathBuf::from("symbols.x"),
            ld_flags: String::new(),
            arena_lo: 0,
            regions: vec![region(vec![PathBuf::from("does/not/exist")])],
            is_arm9: false,
        };

        assert!(find_jobs(&target, tempdir.path()).is_err());
    }
}
