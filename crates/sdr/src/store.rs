// Copyright 2025-2026 CEMAXECUTER LLC

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid key: {0}")]
    InvalidKey(String),

    #[error("storage I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },
}

/// Object storage as seen by the replay backend: flat string keys with
/// `/`-separated prefixes.
pub trait ObjectStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;

    /// Keys starting with `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// One listing per prefix, in input order.
    fn list_batch(&self, prefixes: &[String]) -> Vec<Result<Vec<String>, StoreError>> {
        prefixes.iter().map(|prefix| self.list(prefix)).collect()
    }
}

fn validate_key(key: &str) -> Result<(), StoreError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.contains('\\')
        || key.split('/').any(|part| part == "..");
    if bad {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Split a prefix into its directory part and the file name prefix.
fn split_prefix(prefix: &str) -> Result<(&str, &str), StoreError> {
    if !prefix.is_empty() {
        validate_key(prefix)?;
    }
    Ok(match prefix.rfind('/') {
        Some(pos) => (&prefix[..pos], &prefix[pos + 1..]),
        None => ("", prefix),
    })
}

fn join_key(dir_part: &str, name: &str) -> String {
    if dir_part.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir_part, name)
    }
}

/// Object store backed by a directory tree: key `a/b_c` lives at
/// `root/a/b_c`.
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Sorted names of the regular files in `dir_part`. A missing directory
    /// lists as empty.
    fn file_names(&self, dir_part: &str, prefix: &str) -> Result<Vec<String>, StoreError> {
        let io_err = |source: io::Error| StoreError::Io {
            key: prefix.to_string(),
            source,
        };
        let entries = match fs::read_dir(self.root.join(dir_part)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_err(e)),
        };

        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(io_err)?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

impl ObjectStore for DirStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        validate_key(key)?;
        let path = self.root.join(key);
        fs::read(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => StoreError::NotFound(key.to_string()),
            _ => StoreError::Io {
                key: key.to_string(),
                source: e,
            },
        })
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let (dir_part, name_prefix) = split_prefix(prefix)?;
        Ok(self
            .file_names(dir_part, prefix)?
            .into_iter()
            .filter(|name| name.starts_with(name_prefix))
            .map(|name| join_key(dir_part, &name))
            .collect())
    }

    /// Each directory is read once per batch, however many prefixes
    /// point into it.
    fn list_batch(&self, prefixes: &[String]) -> Vec<Result<Vec<String>, StoreError>> {
        let mut scanned: HashMap<String, Vec<String>> = HashMap::new();
        prefixes
            .iter()
            .map(|prefix| -> Result<Vec<String>, StoreError> {
                let (dir_part, name_prefix) = split_prefix(prefix)?;
                let names = match scanned.entry(dir_part.to_string()) {
                    Entry::Occupied(names) => names.into_mut(),
                    Entry::Vacant(slot) => slot.insert(self.file_names(dir_part, prefix)?),
                };
                Ok(names
                    .iter()
                    .filter(|name| name.starts_with(name_prefix))
                    .map(|name| join_key(dir_part, name))
                    .collect())
            })
            .collect()
    }
}

/// In-memory object store.
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, key: impl Into<String>, data: Vec<u8>) {
        let mut objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.insert(key.into(), data);
    }

    pub fn len(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        Ok(objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
