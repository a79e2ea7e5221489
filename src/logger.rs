use env_logger::Builder;
use log::LevelFilter;
use std::io::Write;
use std::str::FromStr;

/// Starts the process logger. `level` is a `log` level name; unknown names fall back to info.
pub fn start_log(level: &str) {
    let filter = LevelFilter::from_str(level.trim()).unwrap_or(LevelFilter::Info);

    let mut builder = Builder::new();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{}: {}: {}: {}",
                buf.timestamp(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .filter_level(filter);

    // A second init (tests, embedding) keeps the first logger.
    if builder.try_init().is_err() {
        log::debug!("logger already initialized");
    }
}
