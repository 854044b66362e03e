mod config;
mod header;
mod jobs;
mod log;
mod ndsbin;
mod patch;

use anyhow::{bail, Context};
use config::{BuildConfig, BuildTarget, RebuildConfig, TargetRef};
use header::HeaderBin;
use patch::PatchMaker;

use std::path::{Path, PathBuf};
use std::process::Command;

const APP_NAME: &str = env!("CARGO_PKG_NAME");
const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    println!(
        "{}",
        console::style(format!("{APP_NAME} v{APP_VERSION}")).bold()
    );

    let mut project_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--verbose" | "-v" => log::set_verbose(true),
            _ => project_path = Some(PathBuf::from(arg)),
        }
    }

    if let Some(path) = &project_path {
        if let Err(e) = std::env::set_current_dir(path) {
            log::error(format!("Could not enter \"{}\": {e}", path.display()));
            std::process::exit(1);
        }
    }

    if let Err(e) = run() {
        let mut chain = e.chain();
        if let Some(cause) = chain.next() {
            log::error(cause.to_string());
        }
        for cause in chain {
            println!(
                "  {} {}",
                console::style("caused by:").red().bold(),
                cause
            );
        }
        std::process::exit(1);
    }

    println!("{}", console::style("All tasks finished.").green().bold());
}

fn run() -> anyhow::Result<()> {
    let work_dir = std::env::current_dir().context("Could not query the work directory.")?;

    let config = BuildConfig::load(work_dir.join(BuildConfig::FILE_NAME))
        .context("Could not load the build configuration.")?;

    check_toolchain(&config.toolchain)?;

    let rebuild_path = work_dir.join(RebuildConfig::FILE_NAME);
    let mut rebuild = RebuildConfig::load(&rebuild_path)
        .context("Could not load the rebuild configuration.")?;

    let rom_dir = absolutize(&config.filesystem_dir, &work_dir);
    let header = HeaderBin::load(rom_dir.join("header.bin"))
        .context("Could not load the ROM header.")?;

    run_command_list(&config.pre_build, "Running pre-build commands...")
        .context("Not all pre-build commands succeeded.")?;

    let num_targets = config.arm7.is_some() as usize + config.arm9.is_some() as usize;
    let mut step = 0;

    if let Some(target_ref) = config.arm7.clone() {
        step += 1;
        log::step(step, num_targets, "Patching the ARM7 target...");
        run_target(&config, &target_ref, false, &work_dir, &header, &mut rebuild)?;
    }
    if let Some(target_ref) = config.arm9.clone() {
        step += 1;
        log::step(step, num_targets, "Patching the ARM9 target...");
        run_target(&config, &target_ref, true, &work_dir, &header, &mut rebuild)?;
    }

    rebuild.save(&rebuild_path)?;

    run_command_list(&config.post_build, "Running post-build commands...")
        .context("Not all post-build commands succeeded.")?;

    Ok(())
}

fn run_target(
    config: &BuildConfig,
    target_ref: &TargetRef,
    is_arm9: bool,
    work_dir: &Path,
    header: &HeaderBin,
    rebuild: &mut RebuildConfig,
) -> anyhow::Result<()> {
    let cpu = if is_arm9 { "ARM9" } else { "ARM7" };

    let target_path = absolutize(&target_ref.target, work_dir);
    let target = BuildTarget::load(&target_path, is_arm9)
        .with_context(|| format!("Could not load the {cpu} target configuration."))?;
    let target_dir = target_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| work_dir.to_path_buf());

    let jobs = jobs::find_jobs(&target, &target_dir)
        .with_context(|| format!("Could not collect the {cpu} object files."))?;

    let build_dir = absolutize(&target_ref.build, work_dir);
    let mut maker = PatchMaker::new(config, &target, &target_dir, &build_dir, work_dir, header, &jobs);
    maker
        .run(rebuild)
        .with_context(|| format!("Could not patch the {cpu} target."))
}

fn absolutize(path: &Path, base: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

fn check_toolchain(toolchain: &str) -> anyhow::Result<()> {
    let gcc = format!("{toolchain}gcc");
    let found = Command::new(&gcc)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();

    if !found {
        bail!(
            "The building toolchain \"{toolchain}\" was not found.\n\
             Make sure that it is correctly specified in the \"{}\" file and that it is present on your system.",
            BuildConfig::FILE_NAME
        );
    }
    Ok(())
}

fn run_command_list(commands: &[String], msg: &str) -> anyhow::Result<()> {
    if commands.is_empty() {
        return Ok(());
    }

    log::info(msg);
    for (i, command) in commands.iter().enumerate() {
        log::info(format!(
            "{} {}",
            console::style(format!("[#{}]", i + 1)).bold(),
            console::style(command).yellow()
        ));

        let status = shell_command(command)
            .status()
            .with_context(|| format!("Could not run \"{command}\""))?;
        if !status.success() {
            bail!("Process returned: {}", status.code().unwrap_or(-1));
        }
    }
    Ok(())
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}
