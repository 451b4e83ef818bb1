//! File-backed storage: one checksummed file per key.

use super::KeyValueStorage;
use crate::error::{Result, StoreError};
use fs2::FileExt;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for the storage manifest.
const STORAGE_MAGIC: &[u8; 4] = b"UKV\0";

/// Magic bytes for entry files.
const ENTRY_MAGIC: &[u8; 4] = b"UKE\0";

/// Current format version (manifest and entries).
const FORMAT_VERSION: u8 = 1;

/// Entry file extension.
const ENTRY_EXT: &str = "kv";

/// Bytes in an entry file besides the payload: magic, version, length, crc32.
const ENTRY_OVERHEAD: u64 = 4 + 1 + 8 + 4;

/// File storage configuration.
#[derive(Clone, Debug)]
pub struct FileStorageConfig {
    /// Directory holding the entries.
    pub path: PathBuf,

    /// Whether to create the directory if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for FileStorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./unread-store"),
            create_if_missing: true,
        }
    }
}

/// Durable key-value storage in a directory.
///
/// Each key maps to `<hex(key)>.kv`, framed as
/// `magic | version | len (u64 LE) | payload | crc32 (LE)`. Writes go to a
/// temporary file first and are renamed into place, so a crash leaves
/// either the old or the new value. The directory is held under an
/// exclusive lock for the lifetime of the storage.
pub struct FileStorage {
    path: PathBuf,

    /// Lock file for exclusive access.
    _lock_file: File,
}

impl FileStorage {
    /// Open existing storage or create it.
    pub fn open_or_create(config: FileStorageConfig) -> Result<Self> {
        if config.path.join("MANIFEST").exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized(
                config.path.display().to_string(),
            ))
        }
    }

    /// Create new storage at the configured path.
    pub fn create(config: FileStorageConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        Self::write_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Ok(Self {
            path: config.path,
            _lock_file: lock_file,
        })
    }

    /// Open existing storage.
    pub fn open(config: FileStorageConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        Ok(Self {
            path: config.path,
            _lock_file: lock_file,
        })
    }

    /// Base directory.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the entry for `key`. Returns true if it existed.
    pub fn remove(&self, key: &str) -> Result<bool> {
        let entry_path = self.entry_path(key);
        if entry_path.exists() {
            fs::remove_file(&entry_path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// All stored keys.
    pub fn keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry_path = entry?.path();
            if entry_path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if let Ok(bytes) = hex::decode(stem) {
                if let Ok(key) = String::from_utf8(bytes) {
                    keys.push(key);
                }
            }
        }
        Ok(keys)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.path
            .join(format!("{}.{}", hex::encode(key.as_bytes()), ENTRY_EXT))
    }

    fn read_entry(&self, entry_path: &Path) -> Result<String> {
        let mut file = File::open(entry_path)?;
        let file_len = file.metadata()?.len();

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != ENTRY_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid entry magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported entry version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 8];
        file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);
        if len > file_len.saturating_sub(ENTRY_OVERHEAD) {
            return Err(StoreError::InvalidFormat(format!(
                "Entry length {} exceeds file size {}",
                len, file_len
            )));
        }

        let mut payload = vec![0u8; len as usize];
        file.read_exact(&mut payload)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored_checksum = u32::from_le_bytes(checksum_bytes);
        let computed_checksum = crc32fast::hash(&payload);
        if stored_checksum != computed_checksum {
            return Err(StoreError::ChecksumMismatch {
                expected: stored_checksum,
                got: computed_checksum,
            });
        }

        String::from_utf8(payload)
            .map_err(|e| StoreError::InvalidFormat(format!("Entry is not UTF-8: {}", e)))
    }

    fn write_manifest(path: &Path) -> Result<()> {
        let mut file = File::create(path.join("MANIFEST"))?;
        file.write_all(STORAGE_MAGIC)?;
        file.write_all(&[FORMAT_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let mut file = File::open(path.join("MANIFEST"))?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORAGE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid storage magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != FORMAT_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported storage version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;
        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;
        Ok(lock_file)
    }
}

impl KeyValueStorage for FileStorage {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entry_path = self.entry_path(key);
        if !entry_path.exists() {
            return Ok(None);
        }
        self.read_entry(&entry_path).map(Some)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let entry_path = self.entry_path(key);
        let tmp_path = entry_path.with_extension("tmp");

        {
            let mut file = File::create(&tmp_path)?;
            let payload = value.as_bytes();
            file.write_all(ENTRY_MAGIC)?;
            file.write_all(&[FORMAT_VERSION])?;
            file.write_all(&(payload.len() as u64).to_le_bytes())?;
            file.write_all(payload)?;
            file.write_all(&crc32fast::hash(payload).to_le_bytes())?;
            file.sync_all()?;
        }

        fs::rename(&tmp_path, &entry_path)?;
        Ok(())
    }
}
