// Licensed under the MIT License

//! Flow configuration (SPEC_FULL §6): an optional `latticeflow.toml`
//! describing the flow's root working directory and default task-manager
//! concurrency. Falls back to the current directory, mirroring the
//! original's implicit cwd-rooted `workdir`.

use std::env::current_dir;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};
use crate::taskmanager::ManagerConfig;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowSection {
    pub workdir: PathBuf,
    pub default_ncpus: u32,
}

impl Default for FlowSection {
    fn default() -> Self {
        FlowSection {
            workdir: PathBuf::from("."),
            default_ncpus: 1,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub flow: FlowSection,
}

impl Config {
    /// Load `path` if it exists, otherwise return the default config rooted
    /// at the current directory.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let text = std::fs::read_to_string(path)?;
        toml::from_str(&text)
            .map_err(|e| FlowError::Config(format!("invalid config `{}`: {e}", path.display())))
    }

    /// Load `latticeflow.toml` from the current directory if present, else
    /// fall back to defaults (spec §6: "falls back to the current
    /// directory").
    pub fn load_default() -> Result<Self> {
        Config::load(Path::new("latticeflow.toml"))
    }

    pub fn workdir(&self) -> Result<PathBuf> {
        if self.flow.workdir == Path::new(".") {
            Ok(current_dir()?)
        } else {
            Ok(self.flow.workdir.clone())
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            workers: num_cpus::get().max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let cfg = Config::load(Path::new("/nonexistent/latticeflow.toml")).unwrap();
        assert_eq!(cfg.flow.default_ncpus, 1);
    }

    #[test]
    fn parses_flow_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("latticeflow.toml");
        std::fs::write(&path, "[flow]\nworkdir = \"/tmp/run\"\ndefault_ncpus = 4\n").unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.flow.workdir, PathBuf::from("/tmp/run"));
        assert_eq!(cfg.flow.default_ncpus, 4);
    }
}
