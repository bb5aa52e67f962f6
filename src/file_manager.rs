use anyhow::{bail, Context, Result};
use std::fs;
use std::io::{Cursor, Write};
use std::path::{Component, Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, DateTime, ZipWriter};

use crate::error::CloneError;

pub const INDEX_FILE: &str = "index.html";

/// Final archive entries: the rewritten `index.html` first, then every other
/// file in store order.
#[derive(Debug, Default, Clone)]
pub struct ArchiveContents {
    entries: Vec<(String, Vec<u8>)>,
}

impl ArchiveContents {
    pub fn new(index_html: impl Into<Vec<u8>>) -> Self {
        Self {
            entries: vec![(INDEX_FILE.to_string(), index_html.into())],
        }
    }

    /// Add a file. A second `index.html` is ignored; the rewritten page wins.
    pub fn push(&mut self, path: &str, bytes: impl Into<Vec<u8>>) {
        if path == INDEX_FILE {
            return;
        }
        self.entries.push((path.to_string(), bytes.into()));
    }

    pub fn get(&self, path: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, bytes)| bytes.as_slice())
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(p, _)| p.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(p, b)| (p.as_str(), b.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> usize {
        self.entries.iter().map(|(_, b)| b.len()).sum()
    }
}

/// Compress `contents` into an in-memory ZIP (DEFLATE, level 9, fixed
/// timestamps so identical input gives identical bytes).
pub fn write_zip(contents: &ArchiveContents) -> Result<Vec<u8>, CloneError> {
    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    let fixed_time = DateTime::from_date_and_time(1980, 1, 1, 0, 0, 0).map_err(CloneError::packaging)?;
    let options = SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9))
        .last_modified_time(fixed_time);

    for (path, bytes) in contents.iter() {
        zip.start_file(path, options).map_err(CloneError::packaging)?;
        zip.write_all(bytes).map_err(CloneError::packaging)?;
    }
    let cursor = zip.finish().map_err(CloneError::packaging)?;
    Ok(cursor.into_inner())
}

/// Writes archives and extracted clones to disk.
#[derive(Clone)]
pub struct FileManager {
    base_dir: PathBuf,
}

impl FileManager {
    pub fn new(base_dir: &Path) -> Result<Self> {
        let base_dir = base_dir.to_path_buf();
        fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create base directory: {:?}", base_dir))?;

        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Write the packaged archive to `path`, creating parent directories.
    pub fn save_archive(path: &Path, archive: &[u8]) -> Result<PathBuf> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        fs::write(path, archive).with_context(|| format!("Failed to write archive: {:?}", path))?;
        Ok(path.to_path_buf())
    }

    pub fn path_for(&self, relative: &str) -> Result<PathBuf> {
        let relative_path = Path::new(relative);
        if relative_path
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            bail!("Refusing to write outside the output directory: {}", relative);
        }
        Ok(self.base_dir.join(relative_path))
    }

    pub fn save_file(&self, relative: &str, content: &[u8]) -> Result<PathBuf> {
        let file_path = self.path_for(relative)?;
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        fs::write(&file_path, content)
            .with_context(|| format!("Failed to write to file: {:?}", file_path))?;
        Ok(file_path)
    }

    /// Write every entry under the base directory for local preview.
    pub fn extract(&self, contents: &ArchiveContents) -> Result<usize> {
        let mut written = 0;
        for (path, bytes) in contents.iter() {
            self.save_file(path, bytes)?;
            written += 1;
        }
        Ok(written)
    }

    pub fn file_exists(&self, relative: &str) -> bool {
        self.path_for(relative).map(|p| p.exists()).unwrap_or(false)
    }
}
