use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);

pub fn set_verbose(enabled: bool) {
    VERBOSE.store(enabled, Ordering::Relaxed);
}

pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed)
}

pub fn step(step: usize, num_steps: usize, name: &str) {
    println!(
        "{} {}",
        console::style(format!("[{step}/{num_steps}]")).bold(),
        console::style(name).cyan().bold(),
    );
}

pub fn info(msg: impl AsRef<str>) {
    println!("{}", msg.as_ref());
}

pub fn warn(msg: impl AsRef<str>) {
    println!(
        "{} {}",
        console::style("warning:").yellow().bold(),
        msg.as_ref()
    );
}

pub fn error(msg: impl AsRef<str>) {
    println!(
        "{} {}",
        console::style("error:").red().bold(),
        msg.as_ref()
    );
}
