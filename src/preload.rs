use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::errors::BenchError;
use crate::types::PreloadSetting;

/// Process-wide preload toggle for the target's primary binary.
pub trait PreloadStore {
    fn get(&self) -> Result<PreloadSetting, BenchError>;
    fn set(&mut self, setting: PreloadSetting) -> Result<(), BenchError>;
}

/// Preload setting persisted as a small TOML file. A missing file reads as the default.
#[derive(Debug, Clone)]
pub struct TomlPreloadStore {
    path: PathBuf,
}

impl TomlPreloadStore {
    pub fn new(path: &Path) -> Self {
        TomlPreloadStore {
            path: path.to_path_buf(),
        }
    }
}

impl PreloadStore for TomlPreloadStore {
    fn get(&self) -> Result<PreloadSetting, BenchError> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(PreloadSetting::default());
            }
            Err(e) => return Err(BenchError::io(&self.path, e)),
        };
        toml::from_str(&text).map_err(|e| {
            BenchError::Configuration(format!(
                "invalid preload settings in {}: {e}",
                self.path.display()
            ))
        })
    }

    fn set(&mut self, setting: PreloadSetting) -> Result<(), BenchError> {
        let text = toml::to_string(&setting).map_err(|e| {
            BenchError::Configuration(format!("cannot encode preload settings: {e}"))
        })?;
        fs::write(&self.path, text).map_err(|e| BenchError::io(&self.path, e))
    }
}

/// Applies a preload setting and puts the previous one back exactly once.
///
/// Restoring happens through [`PreloadGuard::restore`] on the normal path;
/// dropping an unrestored guard restores as well, so an unwinding run still
/// leaves the environment as it found it.
pub struct PreloadGuard {
    store: Box<dyn PreloadStore>,
    previous: PreloadSetting,
    restored: bool,
}

impl PreloadGuard {
    pub fn apply(
        mut store: Box<dyn PreloadStore>,
        setting: PreloadSetting,
    ) -> Result<Self, BenchError> {
        let previous = store.get()?;
        info!(?previous, ?setting, "applying preload setting");
        store.set(setting)?;
        Ok(PreloadGuard {
            store,
            previous,
            restored: false,
        })
    }

    pub fn previous(&self) -> PreloadSetting {
        self.previous
    }

    pub fn restore(mut self) -> Result<(), BenchError> {
        self.restored = true;
        info!(setting = ?self.previous, "restoring preload setting");
        self.store.set(self.previous)
    }
}

impl Drop for PreloadGuard {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        self.restored = true;
        if let Err(e) = self.store.set(self.previous) {
            warn!(error = %e, "failed to restore preload setting");
        }
    }
}
