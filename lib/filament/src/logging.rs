//! Thin facade over the structured logging stack shared by all crates.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds the default stderr terminal logger.
pub fn terminal() -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(
        r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#,
    )
    .expect("Default logging config must parse");

    config.build_logger().expect("Terminal logger construction failed")
}
