//! Versioned state documents on disk.
//!
//! Each document is written to `<location>/_state/<prefix><version>.st` with
//! the layout:
//!
//! ```text
//! magic (u32 BE) | codec name (u32 BE len + bytes) | format version (u32 BE)
//! | content type (u8) | body | crc32 of everything before it (u32 BE)
//! ```
//!
//! Files named `<prefix><version>` without the extension predate the header
//! and are read as plain JSON.

use crate::error::{Result, SyncError};
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, trace, warn};

pub const STATE_DIR_NAME: &str = "_state";
pub const STATE_FILE_EXTENSION: &str = ".st";
pub const GLOBAL_STATE_FILE_PREFIX: &str = "global-";
pub const INDEX_STATE_FILE_PREFIX: &str = "state-";

const MAGIC: u32 = 0x3fd7_6c17;
const CODEC_NAME: &str = "state";
const FORMAT_VERSION: u32 = 1;
const TEMP_SUFFIX: &str = ".tmp";

/// Serialization used for a document body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DocumentContentType {
    #[serde(rename = "json")]
    Json,
    #[default]
    #[serde(rename = "msgpack", alias = "messagepack")]
    MessagePack,
}

impl DocumentContentType {
    fn to_byte(self) -> u8 {
        match self {
            DocumentContentType::Json => 0,
            DocumentContentType::MessagePack => 1,
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(DocumentContentType::Json),
            1 => Some(DocumentContentType::MessagePack),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentContentType::Json => write!(f, "json"),
            DocumentContentType::MessagePack => write!(f, "msgpack"),
        }
    }
}

impl FromStr for DocumentContentType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "json" => Ok(DocumentContentType::Json),
            "msgpack" | "messagepack" => Ok(DocumentContentType::MessagePack),
            _ => Err(SyncError::InvalidArgument(format!("unknown document format [{}]", s))),
        }
    }
}

/// Byte layout of a single document.
#[derive(Debug, Clone, Copy)]
pub struct DocumentFormat {
    content_type: DocumentContentType,
}

impl DocumentFormat {
    pub fn new(content_type: DocumentContentType) -> Self {
        Self { content_type }
    }

    pub fn content_type(&self) -> DocumentContentType {
        self.content_type
    }

    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let body = match self.content_type {
            DocumentContentType::Json => serde_json::to_vec(value)?,
            DocumentContentType::MessagePack => rmp_serde::to_vec_named(value)?,
        };

        let mut out = Vec::with_capacity(body.len() + 32);
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&(CODEC_NAME.len() as u32).to_be_bytes());
        out.extend_from_slice(CODEC_NAME.as_bytes());
        out.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
        out.push(self.content_type.to_byte());
        out.extend_from_slice(&body);
        let crc = crc32fast::hash(&out);
        out.extend_from_slice(&crc.to_be_bytes());
        Ok(out)
    }

    /// Decode a document. The content type is taken from the header, not from `self`.
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let corrupted = |reason: &str| SyncError::CorruptedState {
            path: String::new(),
            reason: reason.to_string(),
        };

        if bytes.len() < 4 + 4 + 4 + 1 + 4 {
            return Err(corrupted("document too short"));
        }
        let (content, footer) = bytes.split_at(bytes.len() - 4);
        let expected = read_u32(footer, 0);
        let actual = crc32fast::hash(content);
        if expected != actual {
            return Err(SyncError::ChecksumMismatch { expected, actual });
        }

        if read_u32(content, 0) != MAGIC {
            return Err(corrupted("bad magic"));
        }
        let name_len = read_u32(content, 4) as usize;
        let mut pos = 8;
        let name = content
            .get(pos..pos + name_len)
            .ok_or_else(|| corrupted("truncated codec name"))?;
        if name != CODEC_NAME.as_bytes() {
            return Err(corrupted("unexpected codec name"));
        }
        pos += name_len;
        let header = content
            .get(pos..pos + 5)
            .ok_or_else(|| corrupted("truncated header"))?;
        let version = read_u32(header, 0);
        if version > FORMAT_VERSION {
            return Err(corrupted(&format!("unsupported format version {}", version)));
        }
        let content_type = DocumentContentType::from_byte(header[4])
            .ok_or_else(|| corrupted("unknown content type"))?;
        let body = &content[pos + 5..];

        match content_type {
            DocumentContentType::Json => serde_json::from_slice(body)
                .map_err(|e| SyncError::Deserialization(e.to_string())),
            DocumentContentType::MessagePack => Ok(rmp_serde::from_slice(body)?),
        }
    }
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[at..at + 4]);
    u32::from_be_bytes(buf)
}

/// A state document found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateFile {
    pub path: PathBuf,
    pub version: u64,
    /// Written before documents carried a header.
    pub legacy: bool,
}

/// Reads and writes one kind of versioned document (`global-` or `state-`).
pub struct MetaStateFormat<T> {
    format: DocumentFormat,
    prefix: &'static str,
    pattern: Regex,
    _marker: PhantomData<fn() -> T>,
}

impl<T> MetaStateFormat<T>
where
    T: Serialize + DeserializeOwned,
{
    pub fn new(content_type: DocumentContentType, prefix: &'static str) -> Self {
        let pattern = Regex::new(&format!(
            r"^{}(\d+)({})?$",
            regex::escape(prefix),
            regex::escape(STATE_FILE_EXTENSION)
        ))
        .expect("escaped prefix is a valid pattern");
        Self {
            format: DocumentFormat::new(content_type),
            prefix,
            pattern,
            _marker: PhantomData,
        }
    }

    pub fn prefix(&self) -> &'static str {
        self.prefix
    }

    fn file_name(&self, version: u64) -> String {
        format!("{}{}{}", self.prefix, version, STATE_FILE_EXTENSION)
    }

    /// Write `state` under every location, then optionally prune other versions.
    pub fn write(
        &self,
        state: &T,
        version: u64,
        locations: &[PathBuf],
        delete_old_files: bool,
    ) -> Result<()> {
        if locations.is_empty() {
            return Err(SyncError::InvalidArgument("no locations to write state to".into()));
        }
        let bytes = self.format.encode(state)?;
        let file_name = self.file_name(version);

        for location in locations {
            let dir = location.join(STATE_DIR_NAME);
            let target = dir.join(&file_name);
            let tmp = dir.join(format!("{}{}", file_name, TEMP_SUFFIX));
            write_atomic(&dir, &tmp, &target, &bytes)
                .map_err(|e| SyncError::persistence(target.display().to_string(), e))?;
            trace!(path = %target.display(), "Wrote state document");
        }

        if delete_old_files {
            self.prune(version, locations)?;
        }
        Ok(())
    }

    /// Remove every document of this kind except `keep_version`.
    fn prune(&self, keep_version: u64, locations: &[PathBuf]) -> Result<()> {
        for file in self.find_state_files(locations)? {
            if file.version != keep_version || file.legacy {
                trace!(path = %file.path.display(), "Removing superseded state document");
                match fs::remove_file(&file.path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }

    /// Every document of this kind, newest first; `.st` files before legacy ones.
    pub fn find_state_files(&self, locations: &[PathBuf]) -> Result<Vec<StateFile>> {
        let mut files = Vec::new();
        for location in locations {
            let dir = location.join(STATE_DIR_NAME);
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            for entry in entries {
                let entry = entry?;
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let Some(caps) = self.pattern.captures(name) else { continue };
                let Ok(version) = caps[1].parse::<u64>() else { continue };
                files.push(StateFile {
                    path: entry.path(),
                    version,
                    legacy: caps.get(2).is_none(),
                });
            }
        }
        files.sort_by(|a, b| b.version.cmp(&a.version).then(a.legacy.cmp(&b.legacy)));
        Ok(files)
    }

    /// Read one document.
    pub fn read(&self, file: &StateFile) -> Result<T> {
        let bytes = fs::read(&file.path)?;
        let result = if file.legacy {
            serde_json::from_slice(&bytes).map_err(|e| SyncError::Deserialization(e.to_string()))
        } else {
            self.format.decode(&bytes)
        };
        result.map_err(|e| match e {
            SyncError::CorruptedState { reason, .. } => SyncError::CorruptedState {
                path: file.path.display().to_string(),
                reason,
            },
            other => SyncError::CorruptedState {
                path: file.path.display().to_string(),
                reason: other.to_string(),
            },
        })
    }

    /// Load the newest readable document across `locations`.
    ///
    /// Unreadable files are logged and skipped. Fails only when documents
    /// exist but none of them can be read.
    pub fn load_latest(&self, locations: &[PathBuf]) -> Result<Option<T>> {
        let files = self.find_state_files(locations)?;
        let mut last_error = None;
        for file in &files {
            match self.read(file) {
                Ok(state) => {
                    debug!(path = %file.path.display(), version = file.version, "Loaded state document");
                    return Ok(Some(state));
                }
                Err(e) => {
                    warn!(path = %file.path.display(), error = %e, "Failed to read state document, trying older");
                    last_error = Some(e);
                }
            }
        }
        match last_error {
            Some(e) => Err(e),
            None => Ok(None),
        }
    }

    /// Remove the `_state` directories under every location.
    pub fn delete_meta_state(&self, locations: &[PathBuf]) -> Result<()> {
        for location in locations {
            let dir = location.join(STATE_DIR_NAME);
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// Whether `dir` holds files from a state layout that can no longer be read.
pub(crate) fn contains_pre_019_state(dir: &Path) -> Result<Option<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        if entry
            .file_name()
            .to_str()
            .map_or(false, |n| n.starts_with("metadata-"))
        {
            return Ok(Some(entry.path()));
        }
    }
    Ok(None)
}

fn write_atomic(dir: &Path, tmp: &Path, target: &Path, bytes: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    if let Err(e) = fs::rename(tmp, target) {
        let _ = fs::remove_file(tmp);
        return Err(e);
    }
    File::open(dir)?.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{IndexMetaData, MetaData};

    fn index_format(content_type: DocumentContentType) -> MetaStateFormat<IndexMetaData> {
        MetaStateFormat::new(content_type, INDEX_STATE_FILE_PREFIX)
    }

    #[test]
    fn test_write_and_load_both_content_types() {
        for content_type in [DocumentContentType::Json, DocumentContentType::MessagePack] {
            let dir = tempfile::tempdir().unwrap();
            let locations = vec![dir.path().to_path_buf()];
            let format = index_format(content_type);
            let index = IndexMetaData::new("logs").with_version(4).with_mapping("doc", "{}");

            format.write(&index, 4, &locations, false).unwrap();
            assert!(dir.path().join("_state/state-4.st").exists());
            assert_eq!(format.load_latest(&locations).unwrap(), Some(index));
        }
    }

    #[test]
    fn test_reader_ignores_configured_content_type() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        let index = IndexMetaData::new("logs");
        index_format(DocumentContentType::Json)
            .write(&index, 1, &locations, false)
            .unwrap();

        let loaded = index_format(DocumentContentType::MessagePack)
            .load_latest(&locations)
            .unwrap();
        assert_eq!(loaded, Some(index));
    }

    #[test]
    fn test_prune_keeps_only_written_version() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        let format = index_format(DocumentContentType::Json);
        let index = IndexMetaData::new("logs");

        format.write(&index.clone().with_version(1), 1, &locations, false).unwrap();
        format.write(&index.clone().with_version(2), 2, &locations, false).unwrap();
        assert_eq!(format.find_state_files(&locations).unwrap().len(), 2);

        format.write(&index.clone().with_version(3), 3, &locations, true).unwrap();
        let files = format.find_state_files(&locations).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].version, 3);
    }

    #[test]
    fn test_rewriting_same_version_is_idempotent() {
        for delete_old_files in [false, true] {
            let dir = tempfile::tempdir().unwrap();
            let locations = vec![dir.path().to_path_buf()];
            let format = index_format(DocumentContentType::MessagePack);
            let index = IndexMetaData::new("logs").with_version(6).with_mapping("doc", "{}");

            format.write(&index, 6, &locations, delete_old_files).unwrap();
            format.write(&index, 6, &locations, delete_old_files).unwrap();

            let files = format.find_state_files(&locations).unwrap();
            assert_eq!(files.len(), 1);
            assert_eq!(files[0].version, 6);
            assert_eq!(format.load_latest(&locations).unwrap(), Some(index));
        }
    }

    #[test]
    fn test_write_failure_names_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        fs::write(dir.path().join("_state"), b"not a directory").unwrap();

        let err = index_format(DocumentContentType::Json)
            .write(&IndexMetaData::new("logs"), 1, &locations, false)
            .unwrap_err();
        assert!(err.is_retryable());
        match err {
            SyncError::Persistence { what, .. } => assert!(what.ends_with("state-1.st")),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_load_latest_skips_corrupt_newest() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        let format = index_format(DocumentContentType::MessagePack);

        format
            .write(&IndexMetaData::new("logs").with_version(1), 1, &locations, false)
            .unwrap();
        fs::write(dir.path().join("_state/state-2.st"), b"torn write").unwrap();

        let loaded = format.load_latest(&locations).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn test_all_corrupt_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        fs::create_dir_all(dir.path().join("_state")).unwrap();
        fs::write(dir.path().join("_state/state-2.st"), b"torn write").unwrap();

        let err = index_format(DocumentContentType::Json)
            .load_latest(&locations)
            .unwrap_err();
        assert!(matches!(err, SyncError::CorruptedState { .. }));
    }

    #[test]
    fn test_checksum_detects_bit_flip() {
        let format = DocumentFormat::new(DocumentContentType::Json);
        let mut bytes = format.encode(&MetaData::new("uuid")).unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0x01;
        let err = format.decode::<MetaData>(&bytes).unwrap_err();
        assert!(matches!(err, SyncError::ChecksumMismatch { .. }));
    }

    #[test]
    fn test_legacy_file_read_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        fs::create_dir_all(dir.path().join("_state")).unwrap();
        let index = IndexMetaData::new("old").with_version(5);
        fs::write(
            dir.path().join("_state/state-5"),
            serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();

        let format = index_format(DocumentContentType::MessagePack);
        let files = format.find_state_files(&locations).unwrap();
        assert!(files[0].legacy);
        assert_eq!(format.load_latest(&locations).unwrap(), Some(index));
    }

    #[test]
    fn test_st_file_preferred_over_legacy_on_tie() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        let format = index_format(DocumentContentType::Json);
        fs::create_dir_all(dir.path().join("_state")).unwrap();
        fs::write(dir.path().join("_state/state-3"), b"{}").unwrap();
        format
            .write(&IndexMetaData::new("logs").with_version(3), 3, &locations, false)
            .unwrap();

        let files = format.find_state_files(&locations).unwrap();
        assert!(!files[0].legacy);
        assert!(files[1].legacy);
    }

    #[test]
    fn test_temp_files_are_not_documents() {
        let dir = tempfile::tempdir().unwrap();
        let locations = vec![dir.path().to_path_buf()];
        fs::create_dir_all(dir.path().join("_state")).unwrap();
        fs::write(dir.path().join("_state/state-9.st.tmp"), b"partial").unwrap();

        let format = index_format(DocumentContentType::Json);
        assert!(format.find_state_files(&locations).unwrap().is_empty());
        assert_eq!(format.load_latest(&locations).unwrap(), None);
    }

    #[test]
    fn test_detects_pre_019_files() {
        let dir = tempfile::tempdir().unwrap();
        assert!(contains_pre_019_state(dir.path()).unwrap().is_none());
        fs::write(dir.path().join("metadata-3"), b"{}").unwrap();
        assert!(contains_pre_019_state(dir.path()).unwrap().is_some());
    }
}
