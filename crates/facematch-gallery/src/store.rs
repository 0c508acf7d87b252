//! Durable storage for the gallery blob.
//!
//! The whole gallery is written as one JSON document and replaced
//! atomically on every save: after a crash the file is either the old
//! gallery or the new one, never a mix.

use facematch_core::{Gallery, GalleryEntry};
use serde::{Deserialize, Serialize};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Current on-disk format version.
pub const GALLERY_FORMAT_VERSION: u32 = 1;

/// File name used when no explicit gallery path is configured.
pub const DEFAULT_GALLERY_FILE: &str = "gallery.json";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("gallery I/O failed at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery at {} is corrupt: {reason}", .path.display())]
    Corrupt { path: PathBuf, reason: String },
    #[error("gallery at {} has unsupported format version {found}", .path.display())]
    UnsupportedVersion { path: PathBuf, found: u32 },
    #[error("failed to encode gallery: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Where a loaded gallery came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// No persisted data anywhere; a normal first start.
    Empty,
    /// User-writable storage.
    User,
    /// Read-only defaults shipped with the application.
    Bundled,
}

#[derive(Serialize)]
struct GalleryFileRef<'a> {
    version: u32,
    entries: &'a [GalleryEntry],
}

#[derive(Deserialize)]
struct GalleryFile {
    version: u32,
    entries: Vec<GalleryEntry>,
}

/// Serialize a gallery into the versioned blob format.
pub fn encode(gallery: &Gallery) -> Result<Vec<u8>, StoreError> {
    let file = GalleryFileRef {
        version: GALLERY_FORMAT_VERSION,
        entries: gallery.entries(),
    };
    Ok(serde_json::to_vec_pretty(&file)?)
}

/// Parse a blob. `origin` is only used for error messages.
pub fn decode(bytes: &[u8], origin: &Path) -> Result<Gallery, StoreError> {
    let file: GalleryFile = serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
        path: origin.to_path_buf(),
        reason: e.to_string(),
    })?;

    if file.version != GALLERY_FORMAT_VERSION {
        return Err(StoreError::UnsupportedVersion {
            path: origin.to_path_buf(),
            found: file.version,
        });
    }

    if let Some((i, _)) = file
        .entries
        .iter()
        .enumerate()
        .find(|(_, e)| e.identity.trim().is_empty())
    {
        return Err(StoreError::Corrupt {
            path: origin.to_path_buf(),
            reason: format!("entry {i} has an empty identity"),
        });
    }

    Ok(file.entries.into())
}

/// Backend that owns the persisted gallery blob.
pub trait GalleryStore: Send + Sync {
    /// Read the persisted gallery. Absence is `Ok` with [`LoadSource::Empty`];
    /// unparsable data is an error.
    fn load(&self) -> Result<(Gallery, LoadSource), StoreError>;

    /// Replace the persisted gallery with `gallery` in full.
    fn save(&self, gallery: &Gallery) -> Result<(), StoreError>;

    /// Human-readable location for logs.
    fn describe(&self) -> String;
}

/// JSON file store with an optional read-only bundled seed.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
    bundled: Option<PathBuf>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            bundled: None,
        }
    }

    /// Seed from `bundled` when the user file does not exist yet.
    pub fn with_bundled(mut self, bundled: impl Into<PathBuf>) -> Self {
        self.bundled = Some(bundled.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bundled_path(&self) -> Option<&Path> {
        self.bundled.as_deref()
    }

    /// Sibling path of the debug text dump.
    pub fn text_dump_path(&self) -> PathBuf {
        self.path.with_extension("txt")
    }

    fn read(path: &Path) -> Result<Option<Gallery>, StoreError> {
        match std::fs::read(path) {
            Ok(bytes) => decode(&bytes, path).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    fn io_err(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl GalleryStore for FileStore {
    fn load(&self) -> Result<(Gallery, LoadSource), StoreError> {
        if let Some(gallery) = Self::read(&self.path)? {
            tracing::info!(path = %self.path.display(), entries = gallery.len(), "loaded gallery");
            return Ok((gallery, LoadSource::User));
        }

        if let Some(bundled) = &self.bundled {
            if let Some(gallery) = Self::read(bundled)? {
                tracing::info!(
                    path = %bundled.display(),
                    entries = gallery.len(),
                    "seeded gallery from bundled defaults"
                );
                return Ok((gallery, LoadSource::Bundled));
            }
        }

        tracing::info!(path = %self.path.display(), "no persisted gallery; starting empty");
        Ok((Gallery::new(), LoadSource::Empty))
    }

    fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(|e| self.io_err(e))?;

        // Write beside the target, then rename over it.
        let bytes = encode(gallery)?;
        let mut tmp = NamedTempFile::new_in(&dir).map_err(|e| self.io_err(e))?;
        tmp.write_all(&bytes).map_err(|e| self.io_err(e))?;
        tmp.as_file().sync_all().map_err(|e| self.io_err(e))?;
        tmp.persist(&self.path).map_err(|e| self.io_err(e.error))?;

        tracing::info!(path = %self.path.display(), entries = gallery.len(), "saved gallery");
        Ok(())
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-process store holding the encoded blob; nothing touches disk.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blob: Mutex<Option<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start with raw bytes, e.g. to exercise corrupt-data handling.
    pub fn with_blob(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            blob: Mutex::new(Some(bytes.into())),
        }
    }

    pub fn blob(&self) -> Option<Vec<u8>> {
        self.blob.lock().ok().and_then(|b| b.clone())
    }
}

impl GalleryStore for MemoryStore {
    fn load(&self) -> Result<(Gallery, LoadSource), StoreError> {
        match self.blob() {
            Some(bytes) => Ok((decode(&bytes, Path::new("<memory>"))?, LoadSource::User)),
            None => Ok((Gallery::new(), LoadSource::Empty)),
        }
    }

    fn save(&self, gallery: &Gallery) -> Result<(), StoreError> {
        let bytes = encode(gallery)?;
        match self.blob.lock() {
            Ok(mut blob) => {
                *blob = Some(bytes);
                Ok(())
            }
            Err(_) => Err(StoreError::Io {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::other("memory store lock poisoned"),
            }),
        }
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}
