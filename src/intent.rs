//! Persisted run intent
//!
//! `want_running` survives process restarts. It is written on every
//! explicit start or stop and read back when the OS restarts the service.

use crate::error::{LifecycleError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Durable storage for the `want_running` flag
pub trait IntentStore: Send + Sync {
    fn load(&self) -> Result<bool>;

    fn store(&self, want_running: bool) -> Result<()>;
}

/// Intent kept in memory only
#[derive(Debug, Default)]
pub struct MemoryIntentStore {
    want_running: AtomicBool,
}

impl MemoryIntentStore {
    pub fn new(want_running: bool) -> Self {
        Self {
            want_running: AtomicBool::new(want_running),
        }
    }
}

impl IntentStore for MemoryIntentStore {
    fn load(&self) -> Result<bool> {
        Ok(self.want_running.load(Ordering::SeqCst))
    }

    fn store(&self, want_running: bool) -> Result<()> {
        self.want_running.store(want_running, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct IntentFile {
    #[serde(default)]
    want_running: bool,
}

/// Intent persisted as a small TOML state file
#[derive(Debug, Clone)]
pub struct FileIntentStore {
    path: PathBuf,
}

impl FileIntentStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IntentStore for FileIntentStore {
    /// A missing file means the service was never started
    fn load(&self) -> Result<bool> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => {
                return Err(LifecycleError::Persistence(format!(
                    "Failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        let file: IntentFile = toml::from_str(&contents).map_err(|e| {
            LifecycleError::Persistence(format!("Malformed {}: {e}", self.path.display()))
        })?;
        Ok(file.want_running)
    }

    fn store(&self, want_running: bool) -> Result<()> {
        let contents = toml::to_string(&IntentFile { want_running })
            .map_err(|e| LifecycleError::Persistence(format!("Failed to serialize intent: {e}")))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        // Readers never observe a partially written file
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, contents)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
