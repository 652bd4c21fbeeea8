//! Logical file ids and the persistent name to id map.
//!
//! The map lives in `name_id_map.cm` inside the storage directory as a
//! sequence of append-only records:
//!
//! ```text
//! name length: u32 LE | name: UTF-8 bytes | id: i64 LE
//! ```
//!
//! Later records override earlier ones. A negative id marks a deleted file
//! whose id is handed out again if a file with the same name comes back,
//! id 0 means the name was dropped entirely (after a rename).

use super::PageFile;
use crate::{Result, StorageError};
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NAME_ID_MAP: &str = "name_id_map.cm";

/// Longest file name accepted, in bytes.
pub const MAX_NAME_LEN: usize = 255;

/// Logical id of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

pub type SharedFile = Arc<Mutex<PageFile>>;

pub struct FileRegistry {
    storage_path: PathBuf,
    page_size: usize,
    name_ids: HashMap<String, i64>,
    files: HashMap<FileId, SharedFile>,
    next_id: u64,
    map_file: File,
}

impl FileRegistry {
    /// Opens the registry of `storage_path`, creating the directory and the
    /// name/id map when they do not exist yet.
    pub fn open(storage_path: &Path, page_size: usize) -> Result<Self> {
        fs::create_dir_all(storage_path).map_err(StorageError::Io)?;

        let map_path = storage_path.join(NAME_ID_MAP);
        let (name_ids, torn) = if map_path.exists() {
            Self::replay(&map_path)?
        } else {
            (HashMap::new(), false)
        };

        let next_id = name_ids.values().map(|id| id.unsigned_abs()).max().unwrap_or(0);

        let map_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&map_path)
            .map_err(StorageError::Io)?;

        debug!(
            "Opened file registry at {} with {} known files",
            storage_path.display(),
            name_ids.len()
        );

        let mut registry = Self {
            storage_path: storage_path.to_path_buf(),
            page_size,
            name_ids,
            files: HashMap::new(),
            next_id,
            map_file,
        };

        // Appending after a torn record would corrupt every later record.
        if torn {
            registry.compact()?;
        }

        Ok(registry)
    }

    fn replay(map_path: &Path) -> Result<(HashMap<String, i64>, bool)> {
        let mut reader = BufReader::new(File::open(map_path).map_err(StorageError::Io)?);
        let mut name_ids = HashMap::new();
        let mut torn = false;

        loop {
            let mut len = [0u8; 4];
            match reader.read_exact(&mut len) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(StorageError::Io(e)),
            }

            let len = u32::from_le_bytes(len) as usize;
            let mut name = Vec::with_capacity(len.min(MAX_NAME_LEN));
            let mut id = [0u8; 8];
            let complete = len <= MAX_NAME_LEN
                && (&mut reader).take(len as u64).read_to_end(&mut name).is_ok()
                && name.len() == len
                && reader.read_exact(&mut id).is_ok();
            if !complete {
                warn!("Ignoring truncated record at the end of {}", map_path.display());
                torn = true;
                break;
            }

            let name = String::from_utf8(name).map_err(|_| {
                StorageError::Corrupted(format!("non UTF-8 file name in {}", map_path.display()))
            })?;

            match i64::from_le_bytes(id) {
                0 => {
                    name_ids.remove(&name);
                }
                id => {
                    name_ids.insert(name, id);
                }
            }
        }

        Ok((name_ids, torn))
    }

    fn encode(name: &str, id: i64) -> Vec<u8> {
        let mut record = Vec::with_capacity(12 + name.len());
        record.extend_from_slice(&(name.len() as u32).to_le_bytes());
        record.extend_from_slice(name.as_bytes());
        record.extend_from_slice(&id.to_le_bytes());
        record
    }

    fn append_record(&mut self, name: &str, id: i64) -> Result<()> {
        self.map_file
            .write_all(&Self::encode(name, id))
            .map_err(StorageError::Io)?;
        self.map_file.sync_data().map_err(StorageError::Io)
    }

    /// File names are plain names inside the storage directory.
    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && name.len() <= MAX_NAME_LEN
            && name != "."
            && name != ".."
            && name != NAME_ID_MAP
            && !name.contains(&['/', '\\', '\0'][..]);
        if !valid {
            return Err(StorageError::InvalidFileName(name.to_string()));
        }
        Ok(())
    }

    /// Opens the file registered under `name`, creating it if needed.
    ///
    /// Returns the id the file already had, including the id of a deleted
    /// file with the same name.
    pub fn open_file(&mut self, name: &str) -> Result<FileId> {
        Self::validate_name(name)?;
        let (id, record) = match self.name_ids.get(name).copied() {
            Some(id) if id > 0 => {
                let id = FileId(id as u64);
                if self.files.contains_key(&id) {
                    return Ok(id);
                }
                (id, false)
            }
            Some(id) => (FileId(id.unsigned_abs()), true),
            None => {
                self.next_id += 1;
                (FileId(self.next_id), true)
            }
        };

        let path = self.storage_path.join(name);
        let file = PageFile::open_or_create(&path, self.page_size)?;

        if record {
            self.append_record(name, id.0 as i64)?;
            self.name_ids.insert(name.to_string(), id.0 as i64);
        }
        self.files.insert(id, Arc::new(Mutex::new(file)));

        debug!("Opened file {} as {}", name, id);
        Ok(id)
    }

    pub fn file(&self, id: FileId) -> Result<SharedFile> {
        self.files
            .get(&id)
            .cloned()
            .ok_or(StorageError::FileNotOpen(id.0))
    }

    pub fn is_open(&self, id: FileId) -> bool {
        self.files.contains_key(&id)
    }

    /// Whether a live file with this name is registered, open or not.
    pub fn exists(&self, name: &str) -> bool {
        matches!(self.name_ids.get(name), Some(id) if *id > 0)
    }

    pub fn file_id(&self, name: &str) -> Option<FileId> {
        match self.name_ids.get(name) {
            Some(id) if *id > 0 => Some(FileId(*id as u64)),
            _ => None,
        }
    }

    pub fn file_name(&self, id: FileId) -> Option<String> {
        self.name_ids
            .iter()
            .find(|(_, v)| **v == id.0 as i64)
            .map(|(name, _)| name.clone())
    }

    pub fn open_files(&self) -> Vec<(FileId, SharedFile)> {
        let mut files: Vec<_> = self
            .files
            .iter()
            .map(|(id, file)| (*id, Arc::clone(file)))
            .collect();
        files.sort_by_key(|(id, _)| *id);
        files
    }

    /// Forgets the open handle, the name stays registered.
    pub fn close_file(&mut self, id: FileId) -> Option<SharedFile> {
        self.files.remove(&id)
    }

    /// Removes the backing file and keeps its id reserved for the name.
    pub fn delete_file(&mut self, id: FileId) -> Result<()> {
        let file = self.files.remove(&id).ok_or(StorageError::FileNotOpen(id.0))?;
        let name = self.file_name(id);

        let path = file.lock().path().to_path_buf();
        drop(file);
        fs::remove_file(&path).map_err(StorageError::Io)?;

        if let Some(name) = name {
            self.append_record(&name, -(id.0 as i64))?;
            self.name_ids.insert(name, -(id.0 as i64));
        }

        debug!("Deleted file {}", id);
        Ok(())
    }

    pub fn rename_file(&mut self, id: FileId, old_name: &str, new_name: &str) -> Result<()> {
        if self.name_ids.get(old_name) != Some(&(id.0 as i64)) {
            return Err(StorageError::FileNotFound(old_name.to_string()));
        }
        if self.exists(new_name) {
            return Err(StorageError::FileExists(new_name.to_string()));
        }
        Self::validate_name(new_name)?;

        let file = self.file(id)?;
        file.lock().rename(&self.storage_path.join(new_name))?;

        self.append_record(old_name, 0)?;
        self.append_record(new_name, id.0 as i64)?;
        self.name_ids.remove(old_name);
        self.name_ids.insert(new_name.to_string(), id.0 as i64);

        debug!("Renamed file {} from {} to {}", id, old_name, new_name);
        Ok(())
    }

    /// Rewrites the map with one record per name.
    pub fn compact(&mut self) -> Result<()> {
        let map_path = self.storage_path.join(NAME_ID_MAP);
        let tmp_path = self.storage_path.join(format!("{}.tmp", NAME_ID_MAP));

        let mut names: Vec<_> = self.name_ids.iter().collect();
        names.sort();

        let mut bytes = Vec::new();
        for (name, id) in names {
            bytes.extend_from_slice(&Self::encode(name, *id));
        }

        {
            let mut tmp = File::create(&tmp_path).map_err(StorageError::Io)?;
            tmp.write_all(&bytes).map_err(StorageError::Io)?;
            tmp.sync_all().map_err(StorageError::Io)?;
        }
        fs::rename(&tmp_path, &map_path).map_err(StorageError::Io)?;

        self.map_file = OpenOptions::new()
            .append(true)
            .open(&map_path)
            .map_err(StorageError::Io)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const PAGE_SIZE: usize = 256;

    #[test]
    fn test_ids_are_monotonic() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();

        let a = registry.open_file("a.pcl").unwrap();
        let b = registry.open_file("b.pcl").unwrap();
        assert!(b > a);
        assert_eq!(registry.open_file("a.pcl").unwrap(), a);
        assert_eq!(registry.file_name(b).as_deref(), Some("b.pcl"));
    }

    #[test]
    fn test_ids_survive_reopen() {
        let dir = tempdir().unwrap();
        let (a, b) = {
            let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
            (
                registry.open_file("a.pcl").unwrap(),
                registry.open_file("b.pcl").unwrap(),
            )
        };

        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert!(registry.exists("a.pcl"));
        assert!(!registry.is_open(a));
        assert_eq!(registry.open_file("b.pcl").unwrap(), b);

        let c = registry.open_file("c.pcl").unwrap();
        assert!(c > b);
    }

    #[test]
    fn test_deleted_id_is_reused() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();

        let a = registry.open_file("a.pcl").unwrap();
        registry.delete_file(a).unwrap();
        assert!(!registry.exists("a.pcl"));
        assert!(!dir.path().join("a.pcl").exists());

        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert_eq!(registry.open_file("a.pcl").unwrap(), a);
    }

    #[test]
    fn test_rename_moves_the_name() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();

        let a = registry.open_file("a.pcl").unwrap();
        let b = registry.open_file("b.pcl").unwrap();

        assert!(matches!(
            registry.rename_file(a, "a.pcl", "b.pcl"),
            Err(StorageError::FileExists(_))
        ));
        assert!(matches!(
            registry.rename_file(a, "b.pcl", "c.pcl"),
            Err(StorageError::FileNotFound(_))
        ));

        registry.rename_file(a, "a.pcl", "c.pcl").unwrap();
        assert_eq!(registry.file_id("c.pcl"), Some(a));
        assert!(!registry.exists("a.pcl"));
        assert!(dir.path().join("c.pcl").exists());

        registry.compact().unwrap();
        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert_eq!(registry.file_id("c.pcl"), Some(a));
        assert_eq!(registry.file_id("b.pcl"), Some(b));

        // A fresh file under the old name must not collide with `a`.
        let fresh = registry.open_file("a.pcl").unwrap();
        assert!(fresh > b);
    }

    #[test]
    fn test_truncated_map_is_tolerated() {
        let dir = tempdir().unwrap();
        let a = {
            let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
            registry.open_file("a.pcl").unwrap()
        };

        let map_path = dir.path().join(NAME_ID_MAP);
        let mut bytes = fs::read(&map_path).unwrap();
        bytes.extend_from_slice(&[5, 0, 0, 0, b'x']);
        fs::write(&map_path, bytes).unwrap();

        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert_eq!(registry.file_id("a.pcl"), Some(a));

        let b = registry.open_file("b.pcl").unwrap();
        let registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert_eq!(registry.file_id("b.pcl"), Some(b));
    }

    #[test]
    fn test_names_outside_the_directory_are_rejected() {
        let dir = tempdir().unwrap();
        let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();

        for name in ["", "..", "../escape.pcl", "/tmp/abs.pcl", "a/b.pcl", NAME_ID_MAP] {
            assert!(
                matches!(registry.open_file(name), Err(StorageError::InvalidFileName(_))),
                "{:?} was accepted",
                name
            );
        }
        assert!(registry
            .open_file(&"x".repeat(MAX_NAME_LEN + 1))
            .is_err());

        let a = registry.open_file("a.pcl").unwrap();
        assert!(matches!(
            registry.rename_file(a, "a.pcl", "../a.pcl"),
            Err(StorageError::InvalidFileName(_))
        ));
        assert_eq!(registry.file_id("a.pcl"), Some(a));
    }

    #[test]
    fn test_oversized_name_length_is_a_torn_record() {
        let dir = tempdir().unwrap();
        let a = {
            let mut registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
            registry.open_file("a.pcl").unwrap()
        };

        let map_path = dir.path().join(NAME_ID_MAP);
        let mut bytes = fs::read(&map_path).unwrap();
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        bytes.extend_from_slice(b"b.pcl");
        fs::write(&map_path, bytes).unwrap();

        let registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert_eq!(registry.file_id("a.pcl"), Some(a));
        assert_eq!(registry.file_id("b.pcl"), None);
    }

    #[test]
    fn test_unknown_file_id() {
        let dir = tempdir().unwrap();
        let registry = FileRegistry::open(dir.path(), PAGE_SIZE).unwrap();
        assert!(matches!(
            registry.file(FileId(42)),
            Err(StorageError::FileNotOpen(42))
        ));
    }
}
