//! Logger setup shared by the daemon and the proxy binaries.

use anyhow::Result;
use std::fs;
use std::path::Path;

/// Configure the `fern` logger to write to stderr and a log file.
///
/// Each record carries its module tag in the target position, so subsystem
/// lines read `[web]`, `[proxy]`, `[update]` and so on. `ODAC_LOG_NAME`
/// overrides the file stem, which the updater uses to keep the second
/// instance's log separate during a handover.
pub fn setup_logging(log_dir: &Path, default_stem: &str, log_level: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let stem = match std::env::var("ODAC_LOG_NAME") {
        Ok(name) if !name.is_empty() => name,
        _ => default_stem.to_string(),
    };
    let log_path = log_dir.join(format!("{stem}.log"));

    let level = match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        _ => log::LevelFilter::Info,
    };

    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S]"),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(level)
        .chain(std::io::stderr())
        .chain(fern::log_file(log_path)?)
        .apply()?;

    Ok(())
}
