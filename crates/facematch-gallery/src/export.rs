//! Human-readable debug dump of a gallery: the identity on one line, its
//! embedding as comma-joined floats on the next. Write-only; never parsed.

use crate::store::{FileStore, StoreError};
use facematch_core::Gallery;
use std::io::Write;
use std::path::PathBuf;

pub fn write_text_dump<W: Write>(gallery: &Gallery, out: &mut W) -> std::io::Result<()> {
    for entry in gallery.iter() {
        writeln!(out, "{}", entry.identity)?;
        let joined = entry
            .embedding
            .values
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(out, "{joined}")?;
    }
    Ok(())
}

impl FileStore {
    /// Replace the text dump next to the gallery file. Returns its path.
    pub fn export_text_dump(&self, gallery: &Gallery) -> Result<PathBuf, StoreError> {
        let path = self.text_dump_path();
        let mut buf = Vec::new();
        write_text_dump(gallery, &mut buf).and_then(|_| std::fs::write(&path, &buf)).map_err(
            |source| StoreError::Io {
                path: path.clone(),
                source,
            },
        )?;
        tracing::debug!(path = %path.display(), entries = gallery.len(), "wrote gallery text dump");
        Ok(path)
    }
}
