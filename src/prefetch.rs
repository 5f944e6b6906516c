use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::errors::BenchError;

/// The OS startup-acceleration cache for the target executable.
pub trait PrefetchCache {
    /// Deletes every cache entry for the target. Returns how many were removed.
    fn clear(&mut self) -> Result<usize, BenchError>;
}

/// Prefetch files named `<EXECUTABLE>-<HASH>.pf` in a prefetch directory.
#[derive(Debug, Clone)]
pub struct PrefetchDir {
    dir: PathBuf,
    prefix: String,
}

impl PrefetchDir {
    /// `exe_name` is the executable file name, e.g. `chrome.exe`.
    pub fn new(dir: &Path, exe_name: &str) -> Self {
        PrefetchDir {
            dir: dir.to_path_buf(),
            prefix: exe_name.to_ascii_lowercase(),
        }
    }

    fn matches(&self, file_name: &str) -> bool {
        let lower = file_name.to_ascii_lowercase();
        lower.starts_with(&self.prefix) && lower.ends_with(".pf")
    }
}

impl PrefetchCache for PrefetchDir {
    fn clear(&mut self) -> Result<usize, BenchError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(BenchError::io(&self.dir, e)),
        };

        let mut removed = 0;
        for entry in entries {
            let entry = entry.map_err(|e| BenchError::io(&self.dir, e))?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !self.matches(name) {
                continue;
            }
            let path = entry.path();
            debug!(path = %path.display(), "deleting prefetch file");
            fs::remove_file(&path).map_err(|e| BenchError::io(&path, e))?;
            removed += 1;
        }

        info!(removed, dir = %self.dir.display(), "cleared prefetch files");
        Ok(removed)
    }
}
