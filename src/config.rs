//! Layered configuration: `tablero.toml` → environment → CLI flags.
//!
//! Every knob is optional at every layer; later layers win. The file is
//! optional too, so a bare `tablero serve` works out of the box.
//!
//! ```toml
//! [server]
//! port = 8080
//! db_path = "tablero.db"
//! dev = false
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_CONFIG_FILE: &str = "tablero.toml";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerSection {
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: Option<bool>,
}

/// Fully resolved settings the server runs with.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 8080,
            db_path: PathBuf::from("tablero.db"),
            dev_mode: false,
        }
    }
}

impl Settings {
    /// Resolve settings. `config_path` of `None` tries `tablero.toml` in
    /// the working directory and silently skips it when absent; an explicit
    /// path that is missing or malformed is an error.
    pub fn load(
        config_path: Option<&Path>,
        cli_port: Option<u16>,
        cli_db_path: Option<PathBuf>,
        cli_dev: bool,
    ) -> Result<Self> {
        let file = match config_path {
            Some(path) => Some(read_file_config(path)?),
            None => {
                let default = Path::new(DEFAULT_CONFIG_FILE);
                if default.exists() {
                    Some(read_file_config(default)?)
                } else {
                    None
                }
            }
        };
        let server = file.map(|f| f.server).unwrap_or_default();
        let mut settings = Settings::default();

        if let Some(port) = server.port {
            settings.port = port;
        }
        if let Some(db_path) = server.db_path {
            settings.db_path = db_path;
        }
        if let Some(dev) = server.dev {
            settings.dev_mode = dev;
        }

        if let Ok(port) = std::env::var("TABLERO_PORT") {
            settings.port = port
                .parse()
                .with_context(|| format!("Invalid TABLERO_PORT: {}", port))?;
        }
        if let Ok(db_path) = std::env::var("TABLERO_DB") {
            settings.db_path = PathBuf::from(db_path);
        }

        if let Some(port) = cli_port {
            settings.port = port;
        }
        if let Some(db_path) = cli_db_path {
            settings.db_path = db_path;
        }
        if cli_dev {
            settings.dev_mode = true;
        }
        Ok(settings)
    }
}

fn read_file_config(path: &Path) -> Result<FileConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("Invalid config file {}", path.display()))
}
