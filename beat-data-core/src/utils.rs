//! Scoped file access and safe removal helpers

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde_json::Value as JsonValue;

use crate::error::{Error, Result};
use crate::json;

/// A file on disk, read and written as a whole
///
/// Writing creates missing parent directories and keeps the previous
/// content, if any, as a single `<name>~` backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Bind to a path; nothing is touched on disk
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Path of this file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the backup generation
    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push("~");
        PathBuf::from(name)
    }

    /// Whether the file exists
    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Read the content as text
    pub fn load(&self) -> Result<String> {
        fs::read_to_string(&self.path).map_err(|e| self.not_found_or(e))
    }

    /// Read the raw content
    pub fn load_bytes(&self) -> Result<Vec<u8>> {
        fs::read(&self.path).map_err(|e| self.not_found_or(e))
    }

    /// Read and parse the content as JSON, refusing duplicate keys
    pub fn load_json(&self) -> Result<JsonValue> {
        json::parse_strict(&self.load()?)
    }

    /// Replace the content, backing up the previous one
    pub fn save<C: AsRef<[u8]>>(&self, contents: C) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        if self.exists() {
            fs::rename(&self.path, self.backup_path())?;
        }
        write_atomic(&self.path, contents.as_ref())
    }

    /// Replace the content with an indented JSON document
    pub fn save_json(&self, value: &JsonValue) -> Result<()> {
        self.save(json::to_pretty_vec(value)?)
    }

    /// Remove the file and its backup
    pub fn remove(&self) -> Result<()> {
        safe_rmfile(&self.path)?;
        safe_rmfile(&self.backup_path())
    }

    fn not_found_or(&self, e: std::io::Error) -> Error {
        if e.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("`{}'", self.path.display()))
        } else {
            Error::Io(e)
        }
    }
}

/// Write `contents` next to `path` under a temporary name, then rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let name = path
        .file_name()
        .ok_or_else(|| Error::InvalidArgument(format!("`{}' has no file name", path.display())))?;
    let mut tmp_name = name.to_owned();
    tmp_name.push(format!(".{}.tmp", uuid::Uuid::new_v4().simple()));
    let tmp = path.with_file_name(tmp_name);

    let result = (|| {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result.map_err(Error::Io)
}

/// Remove a file, succeeding if it does not exist
pub fn safe_rmfile(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::Io(e)),
    }
}

/// Remove a directory if it is empty, succeeding if it does not exist
///
/// Returns whether the directory was removed.
pub fn safe_rmdir(path: &Path) -> Result<bool> {
    match fs::read_dir(path) {
        Ok(mut entries) => {
            if entries.next().is_some() {
                return Ok(false);
            }
            fs::remove_dir(path)?;
            Ok(true)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::Io(e)),
    }
}
