//! Filesystem-backed hierarchical key/value store.
//!
//! A key is a list of segments: every segment but the last is a namespace
//! (directory), the last names an entry stored as `<segment>.json`.
//! Writes go to a hidden temporary sibling first and are renamed into
//! place, so a reader never sees a half-written entry under its real name.

use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::gid::Gid;

const ENTRY_EXT: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Invalid store key: {0}")]
    InvalidKey(String),

    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Partial write to {key}: {written} of {expected} bytes")]
    PartialWrite {
        key: String,
        written: usize,
        expected: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Store I/O error at {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreKey(Vec<String>);

impl StoreKey {
    pub fn new<I, S>(segments: I) -> Result<Self, StoreError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(StoreError::InvalidKey("empty key".to_string()));
        }
        for s in &segments {
            validate_segment(s)?;
        }
        Ok(Self(segments))
    }

    /// `<kind>/<id hex>`; both parts are always valid segments.
    pub fn entity(kind: &str, id: Gid) -> Self {
        Self(vec![kind.to_string(), id.to_hex()])
    }

    pub fn child(&self, segment: &str) -> Result<Self, StoreError> {
        validate_segment(segment)?;
        let mut segments = self.0.clone();
        segments.push(segment.to_string());
        Ok(Self(segments))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn name(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or_default()
    }

    pub fn namespace(&self) -> &[String] {
        &self.0[..self.0.len() - 1]
    }
}

impl fmt::Display for StoreKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

fn validate_segment(s: &str) -> Result<(), StoreError> {
    let ok = !s.is_empty()
        && s.len() <= 128
        && !s.starts_with('.')
        && s.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(s.to_string()))
    }
}

/// Contents of one namespace.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Listing {
    pub entries: Vec<String>,
    pub namespaces: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).await.map_err(|source| StoreError::Io {
            key: root.display().to_string(),
            source,
        })?;
        tracing::info!("[store] [open] root={}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn dir_of(&self, namespace: &[String]) -> PathBuf {
        let mut dir = self.root.clone();
        for s in namespace {
            dir.push(s);
        }
        dir
    }

    fn path_of(&self, key: &StoreKey) -> PathBuf {
        self.dir_of(key.namespace()).join(format!("{}.{}", key.name(), ENTRY_EXT))
    }

    fn temp_path_of(&self, key: &StoreKey) -> PathBuf {
        self.dir_of(key.namespace()).join(format!(".{}.{}.tmp", key.name(), ENTRY_EXT))
    }

    /// Writes `data` under `key`, creating namespaces as needed.
    ///
    /// On failure the temporary file is removed and the error reports how
    /// many bytes reached it.
    pub async fn write(&self, key: &StoreKey, data: &[u8]) -> Result<(), StoreError> {
        let dir = self.dir_of(key.namespace());
        let tmp = self.temp_path_of(key);

        // A concurrent delete may prune the directory between creating it
        // and opening the file; one retry covers that window.
        let mut file = None;
        for _ in 0..2 {
            fs::create_dir_all(&dir).await.map_err(|source| io_err(key, source))?;
            match fs::File::create(&tmp).await {
                Ok(f) => {
                    file = Some(f);
                    break;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(source) => return Err(io_err(key, source)),
            }
        }
        let mut file = file.ok_or_else(|| io_err(key, ErrorKind::NotFound.into()))?;

        let mut written = 0usize;
        while written < data.len() {
            match file.write(&data[written..]).await {
                Ok(0) => {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(StoreError::PartialWrite {
                        key: key.to_string(),
                        written,
                        expected: data.len(),
                        source: ErrorKind::WriteZero.into(),
                    });
                }
                Ok(n) => {
                    // tokio buffers the chunk; its outcome is known after flush
                    if let Err(source) = file.flush().await {
                        let _ = fs::remove_file(&tmp).await;
                        return Err(StoreError::PartialWrite {
                            key: key.to_string(),
                            written,
                            expected: data.len(),
                            source,
                        });
                    }
                    written += n;
                }
                Err(source) => {
                    let _ = fs::remove_file(&tmp).await;
                    return Err(StoreError::PartialWrite {
                        key: key.to_string(),
                        written,
                        expected: data.len(),
                        source,
                    });
                }
            }
        }

        if let Err(source) = file.sync_all().await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::PartialWrite { key: key.to_string(), written, expected: data.len(), source });
        }
        drop(file);

        fs::rename(&tmp, self.path_of(key)).await.map_err(|source| io_err(key, source))?;
        tracing::trace!("[store] [write] key={} bytes={}", key, written);
        Ok(())
    }

    pub async fn read(&self, key: &StoreKey) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path_of(key)).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(StoreError::NotFound(key.to_string())),
            Err(source) => Err(io_err(key, source)),
        }
    }

    pub async fn exists(&self, key: &StoreKey) -> bool {
        fs::try_exists(self.path_of(key)).await.unwrap_or(false)
    }

    /// Lists a namespace. A namespace that does not exist is empty.
    pub async fn list(&self, namespace: &[&str]) -> Result<Listing, StoreError> {
        for s in namespace {
            validate_segment(s)?;
        }
        let label = namespace.join("/");
        let dir = self.dir_of(&namespace.iter().map(|s| s.to_string()).collect::<Vec<_>>());

        let mut rd = match fs::read_dir(&dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Listing::default()),
            Err(source) => return Err(StoreError::Io { key: label, source }),
        };

        let mut listing = Listing::default();
        loop {
            let entry = match rd.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => return Err(StoreError::Io { key: label, source }),
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let file_type = match entry.file_type().await {
                Ok(t) => t,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                listing.namespaces.push(name);
            } else if let Some(stem) = name.strip_suffix(&format!(".{}", ENTRY_EXT)) {
                listing.entries.push(stem.to_string());
            }
        }
        listing.entries.sort();
        listing.namespaces.sort();
        Ok(listing)
    }

    /// Deletes `key`, then removes every ancestor namespace left empty,
    /// stopping at the first non-empty one and never removing the root.
    /// Returns false if the entry did not exist.
    pub async fn delete(&self, key: &StoreKey) -> Result<bool, StoreError> {
        match fs::remove_file(self.path_of(key)).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => return Err(io_err(key, source)),
        }

        let mut dir = self.dir_of(key.namespace());
        while dir != self.root && dir.starts_with(&self.root) {
            if !is_empty_dir(&dir).await {
                break;
            }
            // fails if an entry appeared since the check; the directory stays
            if fs::remove_dir(&dir).await.is_err() {
                break;
            }
            tracing::trace!("[store] [prune] dir={}", dir.display());
            match dir.parent() {
                Some(parent) => dir = parent.to_path_buf(),
                None => break,
            }
        }
        Ok(true)
    }
}

async fn is_empty_dir(dir: &Path) -> bool {
    match fs::read_dir(dir).await {
        Ok(mut rd) => matches!(rd.next_entry().await, Ok(None)),
        Err(_) => false,
    }
}

fn io_err(key: &StoreKey, source: std::io::Error) -> StoreError {
    StoreError::Io { key: key.to_string(), source }
}
