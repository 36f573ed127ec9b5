//! Sync payload codec: a file set packed as a gzip-compressed tar archive.

use std::io::Read;
use std::path::PathBuf;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder, EntryType, Header};

use crate::sync::{FileEntry, FileSet, SyncError};

/// Pack `files` into a `.tar.gz` blob.
pub fn compress(files: &FileSet) -> Result<Vec<u8>, SyncError> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    for file in files.iter() {
        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(file.contents.len() as u64);
        header.set_mode(file.mode);
        header.set_mtime(0);
        builder
            .append_data(&mut header, &file.path, file.contents.as_slice())
            .map_err(|e| SyncError::Archive(format!("add {}: {e}", file.path.display())))?;
    }
    let encoder = builder
        .into_inner()
        .map_err(|e| SyncError::Archive(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| SyncError::Archive(e.to_string()))
}

/// Unpack a `.tar.gz` blob. Only regular files are kept; absolute or escaping
/// paths fail the whole archive.
pub fn decompress(bytes: &[u8]) -> Result<FileSet, SyncError> {
    let mut archive = Archive::new(GzDecoder::new(bytes));
    let entries = archive
        .entries()
        .map_err(|e| SyncError::Archive(format!("read entries: {e}")))?;

    let mut files = FileSet::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| SyncError::Archive(format!("read entry: {e}")))?;
        if entry.header().entry_type() != EntryType::Regular {
            continue;
        }
        let path: PathBuf = entry
            .path()
            .map_err(|e| SyncError::Archive(format!("entry path: {e}")))?
            .into_owned();
        let mode = entry.header().mode().unwrap_or(crate::sync::DEFAULT_MODE);
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry
            .read_to_end(&mut contents)
            .map_err(|e| SyncError::Archive(format!("read {}: {e}", path.display())))?;
        files.insert(FileEntry {
            path,
            contents,
            mode,
        })?;
    }
    Ok(files)
}
