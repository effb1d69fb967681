use std::fmt;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::JournalError;

/// Size of one journal page.
pub const PAGE_SIZE: u64 = 64 * 1024;
pub const MIN_FILES: u32 = 4;
pub const MAX_FILES: u32 = 64;
pub const MIN_FILE_PAGES: u32 = 1;
pub const MAX_FILE_PAGES: u32 = 32_768;
/// Enqueues are refused once the live window would exceed this share of capacity.
pub const ENQUEUE_THRESHOLD_PCT: u64 = 80;

pub const DEFAULT_NUM_FILES: u32 = 8;
pub const DEFAULT_FILE_PAGES: u32 = 24;

pub(crate) const INFO_FILE: &str = "journal.toml";
const INFO_VERSION: u32 = 1;

/// File count and file size of a queue journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalGeometry {
    pub num_files: u32,
    pub file_size_pages: u32,
}

impl Default for JournalGeometry {
    fn default() -> Self {
        Self {
            num_files: DEFAULT_NUM_FILES,
            file_size_pages: DEFAULT_FILE_PAGES,
        }
    }
}

impl fmt::Display for JournalGeometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} files x {} pages ({} bytes)",
            self.num_files,
            self.file_size_pages,
            self.capacity()
        )
    }
}

impl JournalGeometry {
    pub fn new(num_files: u32, file_size_pages: u32) -> Result<Self, JournalError> {
        let geometry = Self {
            num_files,
            file_size_pages,
        };
        geometry.validate()?;
        Ok(geometry)
    }

    pub fn validate(&self) -> Result<(), JournalError> {
        if !(MIN_FILES..=MAX_FILES).contains(&self.num_files) {
            return Err(JournalError::InvalidGeometry(format!(
                "number of files {} out of range [{MIN_FILES}, {MAX_FILES}]",
                self.num_files
            )));
        }
        if !(MIN_FILE_PAGES..=MAX_FILE_PAGES).contains(&self.file_size_pages) {
            return Err(JournalError::InvalidGeometry(format!(
                "file size {} pages out of range [{MIN_FILE_PAGES}, {MAX_FILE_PAGES}]",
                self.file_size_pages
            )));
        }
        Ok(())
    }

    /// Bytes of record stream held by one file.
    pub fn file_capacity(&self) -> u64 {
        u64::from(self.file_size_pages) * PAGE_SIZE
    }

    /// Bytes of record stream held by the whole ring.
    pub fn capacity(&self) -> u64 {
        u64::from(self.num_files) * self.file_capacity()
    }

    /// Largest live window an enqueue may produce.
    pub fn enqueue_limit(&self) -> u64 {
        self.capacity() * ENQUEUE_THRESHOLD_PCT / 100
    }

    /// Largest window whose live records plus their settle reserve can be
    /// written without reusing the file that holds the oldest live record.
    pub fn settle_limit(&self) -> u64 {
        self.capacity() - self.file_capacity()
    }
}

/// Contents of `journal.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct JournalInfo {
    pub version: u32,
    pub queue: String,
    pub geometry: JournalGeometry,
}

impl JournalInfo {
    pub(crate) fn new(queue: &str, geometry: JournalGeometry) -> Self {
        Self {
            version: INFO_VERSION,
            queue: queue.to_string(),
            geometry,
        }
    }

    pub(crate) fn load(dir: &Path) -> Result<Self, JournalError> {
        let raw = fs::read_to_string(dir.join(INFO_FILE))?;
        let info: JournalInfo = toml::from_str(&raw)
            .map_err(|e| JournalError::Corruption(format!("unreadable {INFO_FILE}: {e}")))?;
        if info.version != INFO_VERSION {
            return Err(JournalError::Corruption(format!(
                "unsupported journal version {}",
                info.version
            )));
        }
        info.geometry.validate()?;
        Ok(info)
    }

    pub(crate) fn store(&self, dir: &Path) -> Result<(), JournalError> {
        let raw = toml::to_string(self)
            .map_err(|e| JournalError::Corruption(format!("cannot encode {INFO_FILE}: {e}")))?;
        fs::write(dir.join(INFO_FILE), raw)?;
        Ok(())
    }
}
