//! Terminal logging setup

use slog::{Drain, Level};

/// Maps a `-v` count to a level: warnings by default, then info, debug and
/// trace.
pub fn level_for(verbosity: u8) -> Level {
    match verbosity {
        0 => Level::Warning,
        1 => Level::Info,
        2 => Level::Debug,
        _ => Level::Trace,
    }
}

/// Installs an asynchronous stderr logger as the global `slog_scope` logger.
///
/// Logging stays active for as long as the returned guard is alive.
pub fn init(level: Level) -> slog_scope::GlobalLoggerGuard {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, level).fuse();
    let logger = slog::Logger::root(drain, slog::o!("app" => env!("CARGO_PKG_NAME")));
    slog_scope::set_global_logger(logger)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(level_for(0), Level::Warning);
        assert_eq!(level_for(1), Level::Info);
        assert_eq!(level_for(2), Level::Debug);
        assert_eq!(level_for(7), Level::Trace);
    }
}
