pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};
use std::path::Path;

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the root terminal logger used by binaries. Library objects take a
/// parent `Logger` instead and derive children with `log.new(o!(..))`.
pub fn init() -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_str(DEFAULT_CONFIG).expect("Error parsing logger configuration");
    config.build_logger().expect("Error building logger")
}

/// Builds a logger from a sloggers TOML configuration file.
pub fn init_from_file<P: AsRef<Path>>(path: P) -> Logger {
    let config: LoggerConfig =
        serdeconv::from_toml_file(path).expect("Error loading logger configuration file");
    config.build_logger().expect("Error building logger")
}

/// Derives a child logger from an optional parent, falling back to a
/// discarding root so callers never have to branch on logging being wired.
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        _ => Logger::root(Discard, o!()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_builds_usable_logger() {
        let logger = init();
        info!(logger, "logger built"; "context" => "test");
    }

    #[test]
    fn test_discard_logger_swallows_records() {
        let logger = Logger::root(Discard, o!());
        debug!(logger, "nobody hears this"; "context" => "test");
    }
}
