use flexi_logger::{
    Cleanup, Criterion, Duplicate, FileSpec, FlexiLoggerError, Logger, LoggerHandle, Naming,
};
use std::path::Path;

/// Install the global logger.
///
/// `RUST_LOG` overrides `base_level` when set. Without `log_dir` everything
/// goes to stderr; with it, records go to rotating files and warnings are
/// still echoed to stderr. Keep the returned handle alive for the lifetime of
/// the program.
pub fn setup_logging(
    base_level: &str,
    log_dir: Option<&Path>,
) -> Result<LoggerHandle, FlexiLoggerError> {
    let logger = Logger::try_with_env_or_str(base_level)?;
    match log_dir {
        Some(dir) => logger
            .log_to_file(FileSpec::default().directory(dir))
            .duplicate_to_stderr(Duplicate::Warn)
            .rotate(
                Criterion::Size(1024 * 1024), //1MB
                Naming::Timestamps,
                Cleanup::KeepLogFiles(5),
            )
            .start(),
        None => logger.log_to_stderr().start(),
    }
}
