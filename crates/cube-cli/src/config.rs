use anyhow::{Context, Result};
use cube_executor::ServiceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// CLI settings plus the proxy sections (`cache`, `hypercube`,
/// `invalidator`, `persistence`) at the top level of the same JSON file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub show_timing: bool,
    /// Rows printed per result
    pub max_rows: usize,
    #[serde(flatten)]
    pub service: ServiceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            show_timing: true,
            max_rows: 1000,
            service: ServiceConfig::default(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        Ok(config)
    }

    #[allow(dead_code)]
    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}
