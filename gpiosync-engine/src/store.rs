//! Persistent pin state.
//!
//! One JSON document per namespace at `<root>/<namespace>.json`, holding one
//! record per pin under the key [`storage_key`]. Writes use the atomic
//! `.tmp` + rename pattern so a power cut leaves either the old or the new
//! document, never a torn one.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use gpiosync_core::types::{Level, PinId};

use crate::error::{io_err, StorageError};

/// Durable pin → level records.
pub trait StateStore: Send + Sync {
    /// Last persisted level. A missing record is `Level::Off`, not an error.
    fn get(&self, pin: PinId) -> Level;

    /// Persist `level` for `pin` and commit it to the medium.
    fn set(&self, pin: PinId, level: Level) -> Result<(), StorageError>;
}

/// Record key for a pin: `gpio_state_<id>`. Stable across releases.
pub fn storage_key(pin: PinId) -> String {
    format!("gpio_state_{pin}")
}

/// On-disk namespace payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NamespaceFile {
    pub updated_at: DateTime<Utc>,
    pub records: BTreeMap<String, u8>,
}

impl NamespaceFile {
    fn empty() -> Self {
        Self {
            updated_at: Utc::now(),
            records: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NamespaceCompat {
    Structured(NamespaceFile),
    Legacy(BTreeMap<String, u8>),
}

/// File-backed [`StateStore`].
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl FileStore {
    /// `<root>/<namespace>.json`
    pub fn namespace_path(root: &Path, namespace: &str) -> PathBuf {
        root.join(format!("{namespace}.json"))
    }

    /// Open (creating the directory if needed) the namespace under `root`.
    ///
    /// An existing namespace file must parse; a store that cannot be read is
    /// a startup failure, not something to paper over with defaults.
    pub fn open(root: &Path, namespace: &str) -> Result<Self, StorageError> {
        std::fs::create_dir_all(root).map_err(|e| io_err(root, e))?;
        let store = Self {
            path: Self::namespace_path(root, namespace),
            lock: Mutex::new(()),
        };
        store.read_file()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The persisted level for `pin`, `None` when there is no record.
    pub fn lookup(&self, pin: PinId) -> Result<Option<Level>, StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let file = self.read_file()?;
        Ok(file.records.get(&storage_key(pin)).copied().map(Level::from_bit))
    }

    fn read_file(&self) -> Result<NamespaceFile, StorageError> {
        if !self.path.exists() {
            return Ok(NamespaceFile::empty());
        }
        let contents = std::fs::read_to_string(&self.path).map_err(|e| io_err(&self.path, e))?;
        let parsed = serde_json::from_str::<NamespaceCompat>(&contents).map_err(|source| {
            StorageError::Json {
                path: self.path.clone(),
                source,
            }
        })?;
        Ok(match parsed {
            NamespaceCompat::Structured(file) => file,
            NamespaceCompat::Legacy(records) => NamespaceFile {
                updated_at: Utc::now(),
                records,
            },
        })
    }

    fn write_file(&self, file: &NamespaceFile) -> Result<(), StorageError> {
        let json = serde_json::to_string_pretty(file).map_err(|source| StorageError::Json {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &self.path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(&self.path, e));
        }
        Ok(())
    }
}

impl StateStore for FileStore {
    fn get(&self, pin: PinId) -> Level {
        match self.lookup(pin) {
            Ok(Some(level)) => level,
            Ok(None) => {
                tracing::debug!(pin = %pin, "no persisted state, defaulting to OFF");
                Level::Off
            }
            Err(err) => {
                tracing::error!(pin = %pin, error = %err, "failed to read persisted state, defaulting to OFF");
                Level::Off
            }
        }
    }

    fn set(&self, pin: PinId, level: Level) -> Result<(), StorageError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = self.read_file()?;
        file.records.insert(storage_key(pin), level.as_bit());
        file.updated_at = Utc::now();
        self.write_file(&file)?;
        tracing::debug!(pin = %pin, level = %level, "pin state persisted");
        Ok(())
    }
}
