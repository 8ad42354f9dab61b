//! Streaming tar+gzip extraction for manifests fetched from object storage or
//! an HTTP(S) source. The extractor trusts nothing about entry names: every
//! path is checked against the destination root before anything is written.

use ccm_error::{CcmError, ErrorCodes};
use flate2::read::GzDecoder;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use tar::{Archive, EntryType};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("archive entry {0:?} escapes the destination directory")]
    PathTraversal(PathBuf),
    #[error("archive entry {0:?} has unsupported type {1:?}")]
    UnsupportedEntryType(PathBuf, EntryType),
    #[error("archive entry has no path")]
    MissingPath,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CcmError for ExtractError {
    fn code(&self) -> ErrorCodes {
        match self {
            ExtractError::PathTraversal(_) | ExtractError::UnsupportedEntryType(_, _) => {
                ErrorCodes::InvalidArgument
            }
            ExtractError::MissingPath => ErrorCodes::InvalidArgument,
            ExtractError::Io(_) => ErrorCodes::Unknown,
        }
    }
}

/// Reads a gzip'd tar stream and extracts it under `dest`, which must already
/// exist. Returns the absolute paths of every file and directory created, in
/// archive order.
pub fn extract<R: Read>(reader: R, dest: &Path) -> Result<Vec<PathBuf>, ExtractError> {
    let dest = dest.canonicalize()?;
    let decoder = GzDecoder::new(reader);
    let mut archive = Archive::new(decoder);
    let mut created = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_type = entry.header().entry_type();
        let raw_path = entry.path()?.into_owned();

        if raw_path.components().any(|c| c.as_os_str() == "..") {
            return Err(ExtractError::PathTraversal(raw_path));
        }
        if raw_path.as_os_str().is_empty() {
            return Err(ExtractError::MissingPath);
        }

        let joined = dest.join(&raw_path);
        if !joined.starts_with(&dest) {
            return Err(ExtractError::PathTraversal(raw_path));
        }

        let mode = entry.header().mode()?;

        match entry_type {
            EntryType::Directory => {
                fs::create_dir_all(&joined)?;
                set_mode(&joined, mode)?;
                created.push(joined);
            }
            EntryType::Regular => {
                if let Some(parent) = joined.parent() {
                    fs::create_dir_all(parent)?;
                }
                let mut file = fs::OpenOptions::new()
                    .write(true)
                    .create(true)
                    .truncate(true)
                    .open(&joined)?;
                std::io::copy(&mut entry, &mut file)?;
                drop(file);
                set_mode(&joined, mode)?;
                created.push(joined);
            }
            other => {
                return Err(ExtractError::UnsupportedEntryType(raw_path, other));
            }
        }
    }

    Ok(created)
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

/// Finds `manifest.yaml` among a set of extracted paths, preferring the
/// shallowest match if more than one is present.
pub fn find_manifest(created: &[PathBuf]) -> Option<&Path> {
    created
        .iter()
        .filter(|p| p.file_name().map(|n| n == "manifest.yaml").unwrap_or(false))
        .min_by_key(|p| p.components().count())
        .map(|p| p.as_path())
}

/// Maps a source identifier to a filesystem-safe directory name: slashes and
/// colons are replaced with underscores and a trailing archive suffix is
/// stripped.
pub fn identifier_to_dir_name(identifier: &str) -> String {
    let stripped = identifier
        .strip_suffix(".tar.gz")
        .or_else(|| identifier.strip_suffix(".tgz"))
        .unwrap_or(identifier);
    stripped.replace(['/', ':'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;
    use tar::{Builder, Header};

    fn build_archive(entries: &[(&str, EntryType, &[u8])]) -> Vec<u8> {
        let mut tar_bytes = Vec::new();
        {
            let mut builder = Builder::new(&mut tar_bytes);
            for (path, kind, data) in entries {
                let mut header = Header::new_gnu();
                header.set_entry_type(*kind);
                header.set_size(data.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                builder.append_data(&mut header, path, *data).unwrap();
            }
            builder.finish().unwrap();
        }
        let mut gz_bytes = Vec::new();
        {
            let mut encoder = GzEncoder::new(&mut gz_bytes, Compression::default());
            encoder.write_all(&tar_bytes).unwrap();
            encoder.finish().unwrap();
        }
        gz_bytes
    }

    #[test]
    fn extracts_files_and_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[
            ("sub", EntryType::Directory, b""),
            ("sub/manifest.yaml", EntryType::Regular, b"modules: []"),
        ]);
        let created = extract(&archive[..], dir.path()).unwrap();
        assert_eq!(created.len(), 2);
        let manifest = find_manifest(&created).unwrap();
        assert_eq!(fs::read_to_string(manifest).unwrap(), "modules: []");
    }

    #[test]
    fn rejects_parent_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[("../escape.yaml", EntryType::Regular, b"x")]);
        let err = extract(&archive[..], dir.path()).unwrap_err();
        assert!(matches!(err, ExtractError::PathTraversal(_)));
    }

    #[test]
    fn rejects_unsupported_entry_type() {
        let dir = tempfile::tempdir().unwrap();
        let archive = build_archive(&[("dev", EntryType::Char, b"")]);
        let err = extract(&archive[..], dir.path()).unwrap_err();
        assert!(matches!(err, ExtractError::UnsupportedEntryType(_, _)));
    }

    #[test]
    fn identifier_mapping_strips_suffix_and_separators() {
        assert_eq!(
            identifier_to_dir_name("obj://bucket/path/to/manifest.tar.gz"),
            "obj___bucket_path_to_manifest"
        );
    }
}
