//! Service configuration, loaded as JSON relative to the executable.

use std::path::Path;

use serde_derive::{Deserialize, Serialize};

const DEFAULT_DATA_DIR: &str = "storage/flagdb";
const DEFAULT_BIND: &str = "127.0.0.1:7205";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigLoad {
    version: u8,

    /// Address the `serve` subcommand binds its TCP listener to.
    pub bind: String,

    /// Directory holding each tenant's `db_{chain}` subdirectory.
    pub data_dir: String,

    /// Directory log files are rotated into.
    pub log_dir: Option<String>,

    pub log_level: Option<String>,
}

impl Default for ConfigLoad {
    fn default() -> Self {
        ConfigLoad {
            version: 1,
            bind: DEFAULT_BIND.to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            log_dir: None,
            log_level: Some("info".to_string()),
        }
    }
}

impl ConfigLoad {
    /// Reads a JSON config file, falling back to `ConfigLoad::default()` if
    /// it is absent.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
