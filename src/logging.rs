use std::path::Path;

use log4rs::config::Deserializers;

/// File the logging configuration is read from by default.
pub const LOG_CONFIG_FILE: &str = "log4rs.yaml";

/// Initialise `log4rs` from a YAML configuration file.
///
/// Intended for processes that embed the registry; the library itself only
/// ever talks to the `log` facade. Fails if the file cannot be read or a
/// logger is already installed.
pub fn init(path: impl AsRef<Path>) -> anyhow::Result<()> {
    log4rs::init_file(path, Deserializers::default())?;
    info!("Initialised logging");
    Ok(())
}
