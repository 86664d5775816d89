//! Durable storage of service definitions

use crate::config::{Config, SpecSet};
use crate::error::{HotifyError, Result};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Load/save of the full set of service definitions.
///
/// The registry calls [`save`](ConfigStore::save) with the complete set after
/// every create and delete; implementations replace what they hold.
pub trait ConfigStore: Send + Sync {
    fn load(&self) -> Result<SpecSet>;
    fn save(&self, specs: &SpecSet) -> Result<()>;
}

/// Stores services inside the daemon's TOML config file.
///
/// Settings other than `services` are preserved from the file as last
/// loaded. Writes go to a temporary file in the same directory which is then
/// renamed over the original.
pub struct TomlConfigStore {
    path: PathBuf,
    base: Mutex<Config>,
}

impl TomlConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            path: path.into(),
            base: Mutex::new(config),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConfigStore for TomlConfigStore {
    fn load(&self) -> Result<SpecSet> {
        let config = Config::load(&self.path)?;
        let specs = config.services.clone();
        *self.base.lock() = config;
        Ok(specs)
    }

    fn save(&self, specs: &SpecSet) -> Result<()> {
        let content = {
            let mut base = self.base.lock();
            base.services = specs.clone();
            base.to_toml()?
        };

        let dir = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let write = || -> std::io::Result<()> {
            let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
            tmp.write_all(content.as_bytes())?;
            tmp.as_file().sync_all()?;
            tmp.persist(&self.path).map_err(|e| e.error)?;
            Ok(())
        };
        write().map_err(|e| {
            HotifyError::Config(format!("failed to write {}: {}", self.path.display(), e))
        })?;

        debug!(path = %self.path.display(), services = specs.len(), "Configuration saved");
        Ok(())
    }
}

/// In-memory store, for embedding and tests
#[derive(Default)]
pub struct MemoryConfigStore {
    specs: Mutex<SpecSet>,
    saves: Mutex<usize>,
}

impl MemoryConfigStore {
    pub fn new(specs: SpecSet) -> Self {
        Self {
            specs: Mutex::new(specs),
            saves: Mutex::new(0),
        }
    }

    pub fn snapshot(&self) -> SpecSet {
        self.specs.lock().clone()
    }

    /// Number of successful saves so far
    pub fn save_count(&self) -> usize {
        *self.saves.lock()
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&self) -> Result<SpecSet> {
        Ok(self.specs.lock().clone())
    }

    fn save(&self, specs: &SpecSet) -> Result<()> {
        *self.specs.lock() = specs.clone();
        *self.saves.lock() += 1;
        Ok(())
    }
}
