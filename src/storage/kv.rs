use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;

use super::StorageError;

const MAX_KEY_LEN: usize = 128;

/// Keys become file names, so no separators and no leading dot
static KEY_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[a-zA-Z0-9_-][a-zA-Z0-9._-]*$").expect("Invalid store key regex")
});

/// Write a file through a temp file in the same directory and rename it into
/// place, so readers see either the old or the new contents.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)?;

    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(contents)?;
    temp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// A directory of small files addressed by key.
///
/// Missing entries are `None`/`false`, never errors, and deleting an entry
/// someone else already removed counts as success. Hidden files (leading dot)
/// are not keys: that covers in-flight temp files and lock-only files.
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
    extension: Option<&'static str>,
}

impl DirStore {
    pub fn new(dir: impl Into<PathBuf>, extension: Option<&'static str>) -> Self {
        Self {
            dir: dir.into(),
            extension,
        }
    }

    pub fn validate_key(key: &str) -> Result<(), StorageError> {
        if key.len() > MAX_KEY_LEN || !KEY_REGEX.is_match(key) {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        Ok(())
    }

    /// Path of the file backing `key`
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        Self::validate_key(key)?;
        let file_name = match self.extension {
            Some(ext) => format!("{}.{}", key, ext),
            None => key.to_string(),
        };
        Ok(self.dir.join(file_name))
    }

    fn key_of(&self, file_name: &str) -> Option<String> {
        if file_name.starts_with('.') {
            return None;
        }
        match self.extension {
            Some(ext) => file_name
                .strip_suffix(ext)
                .and_then(|stem| stem.strip_suffix('.'))
                .filter(|stem| !stem.is_empty())
                .map(str::to_string),
            None => Some(file_name.to_string()),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<String>, StorageError> {
        match fs::read_to_string(self.path_for(key)?) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub fn put(&self, key: &str, value: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        write_atomic(&path, value.as_bytes())?;
        Ok(())
    }

    /// Create an empty entry if it does not exist; existing contents are kept
    pub fn touch(&self, key: &str) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        fs::create_dir_all(&self.dir)?;
        OpenOptions::new().create(true).append(true).open(path)?;
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Remove an entry. Returns false if it was already gone.
    pub fn delete(&self, key: &str) -> Result<bool, StorageError> {
        match fs::remove_file(self.path_for(key)?) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// All keys currently present, sorted
    pub fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys: Vec<String> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| self.key_of(&entry.file_name().to_string_lossy()))
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Delete every entry, returning how many this call removed
    pub fn clear(&self) -> Result<usize, StorageError> {
        let mut removed = 0;
        for key in self.keys()? {
            if self.delete(&key)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
