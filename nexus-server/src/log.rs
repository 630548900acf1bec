use anyhow::Context as _;
use camino::Utf8Path;
use nexus_log::LoggerGuard;

pub struct NexusLog;

impl nexus_log::StaticLogConfig for NexusLog {
    const MAX_BYTES_PER_LOG_FILE: u64 = 3_000_000; // 3 MB
    const MAX_LOG_FILES: usize = 10;
    const LOG_FILE_PREFIX: &'static str = "nexus";
}

pub fn init(log_dir: &Utf8Path, debug: bool) -> anyhow::Result<LoggerGuard> {
    let filter = if debug { "info,nexus_server=debug" } else { "info" };
    nexus_log::init::<NexusLog>(log_dir, filter, None).context("failed to initialize logger")
}
