//! Single-file write-ahead log used for the entity catalog and the transaction
//! decision log.
//!
//! Layout: a 32-byte header (`BLIPWAL\0`, version) followed by records framed as
//! `id u64 | len u32 | crc32 u32 | payload`. A damaged record with nothing intact
//! after it is a torn write and is cut off on open; a damaged record followed by
//! the next one is corruption.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crc32fast::Hasher as Crc32Hasher;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{error, warn};

use crate::core::codec::CodecError;

const HEADER_MAGIC: &[u8; 8] = b"BLIPWAL\0";
const HEADER_VERSION: u32 = 1;
const HEADER_LEN: u64 = 32;
pub(crate) const RECORD_HEADER_LEN: usize = 8 + 4 + 4;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("log corruption: {0}")]
    Corruption(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Flush policy shared by the write-ahead logs and the queue journals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalConfig {
    /// Call fsync every N records. If `None`, do not fsync based on record count.
    pub fsync_every_n: Option<usize>,
    /// Call fsync if at least this duration has elapsed since the last fsync.
    /// Checked on each append. If `None`, do not fsync based on time.
    pub fsync_interval: Option<Duration>,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            fsync_every_n: Some(64),
            fsync_interval: None,
        }
    }
}

impl WalConfig {
    /// Parse a policy string: `always`, `none`, `every_n:<n>` or `interval_ms:<ms>`.
    pub fn from_policy(raw: &str) -> Result<Self, String> {
        let p = raw.trim().to_ascii_lowercase();
        let mut cfg = WalConfig::default();
        if p == "always" {
            cfg.fsync_every_n = Some(1);
            cfg.fsync_interval = None;
        } else if p == "none" {
            cfg.fsync_every_n = None;
            cfg.fsync_interval = None;
        } else if let Some(rest) = p.strip_prefix("every_n:") {
            let n = rest
                .parse::<usize>()
                .map_err(|e| format!("invalid every_n value {rest:?}: {e}"))?;
            cfg.fsync_every_n = Some(n.max(1));
        } else if let Some(rest) = p.strip_prefix("interval_ms:") {
            let ms = rest
                .parse::<u64>()
                .map_err(|e| format!("invalid interval_ms value {rest:?}: {e}"))?;
            cfg.fsync_every_n = None;
            cfg.fsync_interval = Some(Duration::from_millis(ms));
        } else {
            return Err(format!("unknown fsync policy {raw:?}"));
        }
        Ok(cfg)
    }
}

/// Bookkeeping for `WalConfig`-driven fsyncs.
#[derive(Debug)]
pub(crate) struct SyncState {
    config: WalConfig,
    unflushed_records: usize,
    last_fsync: Instant,
}

impl SyncState {
    pub(crate) fn new(config: WalConfig) -> Self {
        Self {
            config,
            unflushed_records: 0,
            last_fsync: Instant::now(),
        }
    }

    pub(crate) fn record_appended(&mut self) {
        self.unflushed_records += 1;
    }

    pub(crate) fn should_sync(&self) -> bool {
        if self.unflushed_records == 0 {
            return false;
        }
        if let Some(every_n) = self.config.fsync_every_n {
            if self.unflushed_records >= every_n {
                return true;
            }
        }
        if let Some(interval) = self.config.fsync_interval {
            if self.last_fsync.elapsed() >= interval {
                return true;
            }
        }
        false
    }

    pub(crate) fn synced(&mut self) {
        self.unflushed_records = 0;
        self.last_fsync = Instant::now();
    }
}

#[derive(Debug, Clone)]
pub struct WalRecord {
    pub id: u64,
    pub payload: Bytes,
}

#[derive(Debug)]
struct WalInner {
    file: File,
    /// Next logical id to assign.
    next_id: u64,
    /// Offset in the file where the next record will be written.
    write_offset: u64,
    sync: SyncState,
}

#[derive(Debug)]
pub struct WriteAheadLog {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl WriteAheadLog {
    /// Open or create a log at `path`, returning it together with every record it
    /// already holds.
    pub fn open(path: impl AsRef<Path>, config: WalConfig) -> Result<(Self, Vec<WalRecord>), WalError> {
        let path_ref = path.as_ref();
        if let Some(parent) = path_ref.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path_ref)?;

        let len = file.metadata()?.len();
        if len == 0 {
            write_header(&mut file)?;
        } else if len < HEADER_LEN {
            return Err(WalError::Corruption(
                "file too small to contain header".to_string(),
            ));
        } else {
            validate_header(&mut file)?;
        }

        let (records, write_offset) = read_all(&mut file)?;
        let file_len = file.metadata()?.len();
        if write_offset < file_len {
            warn!(
                path = %path_ref.display(),
                torn_bytes = file_len - write_offset,
                "truncating torn tail of write-ahead log"
            );
            file.set_len(write_offset)?;
            file.sync_data()?;
        }
        let next_id = records.last().map(|r| r.id + 1).unwrap_or(1);

        let inner = WalInner {
            file,
            next_id,
            write_offset,
            sync: SyncState::new(config),
        };

        Ok((
            Self {
                path: path_ref.to_path_buf(),
                inner: Mutex::new(inner),
            },
            records,
        ))
    }

    /// Append a record to the log, returning its logical id.
    #[tracing::instrument(skip(self, data), fields(path = %self.path.display()))]
    pub fn append(&self, data: &[u8]) -> Result<u64, WalError> {
        let mut inner = self.inner.lock();

        let id = inner.next_id;
        let frame = encode_frame(id, data)?;
        let offset = inner.write_offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(&frame)?;

        inner.next_id += 1;
        inner.write_offset += frame.len() as u64;
        inner.sync.record_appended();
        if inner.sync.should_sync() {
            let span = tracing::trace_span!("wal_flush");
            let _guard = span.enter();
            inner.file.sync_data()?;
            inner.sync.synced();
        }

        Ok(id)
    }

    /// Force an fsync, regardless of configuration.
    pub fn flush(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        inner.file.flush()?;
        inner.file.sync_data()?;
        inner.sync.synced();
        Ok(())
    }

    /// Drop every record, keeping the header. Ids keep increasing.
    pub fn reset(&self) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        inner.file.set_len(HEADER_LEN)?;
        inner.file.sync_data()?;
        inner.write_offset = HEADER_LEN;
        inner.sync.synced();
        Ok(())
    }

    /// Atomically replace the log contents with `payloads` (write to a sibling
    /// temp file, fsync, rename).
    pub fn rewrite(&self, payloads: &[Vec<u8>]) -> Result<(), WalError> {
        let mut inner = self.inner.lock();
        let tmp_path = self.path.with_extension("compact");
        let mut tmp = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&tmp_path)?;
        write_header(&mut tmp)?;
        let mut next_id = 1u64;
        for payload in payloads {
            tmp.write_all(&encode_frame(next_id, payload)?)?;
            next_id += 1;
        }
        tmp.sync_data()?;
        let write_offset = tmp.seek(SeekFrom::End(0))?;
        fs::rename(&tmp_path, &self.path)?;
        if let Some(parent) = self.path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        inner.file = tmp;
        inner.next_id = next_id;
        inner.write_offset = write_offset;
        inner.sync.synced();
        Ok(())
    }

    /// Access the underlying log path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn encode_frame(id: u64, data: &[u8]) -> Result<Vec<u8>, WalError> {
    let len_u32 = u32::try_from(data.len())
        .map_err(|_| WalError::Corruption("record too large".to_string()))?;
    let mut hasher = Crc32Hasher::new();
    hasher.update(data);
    let crc = hasher.finalize();

    let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(&len_u32.to_le_bytes());
    frame.extend_from_slice(&crc.to_le_bytes());
    frame.extend_from_slice(data);
    Ok(frame)
}

fn write_header(file: &mut File) -> Result<(), WalError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    buf[..8].copy_from_slice(HEADER_MAGIC);
    buf[8..12].copy_from_slice(&HEADER_VERSION.to_le_bytes());
    // Remaining bytes are reserved / zero.
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    file.flush()?;
    file.sync_data()?;
    Ok(())
}

fn validate_header(file: &mut File) -> Result<(), WalError> {
    let mut buf = [0u8; HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf).map_err(|e| {
        WalError::Corruption(format!("unexpected EOF while reading WAL header: {e}"))
    })?;

    if &buf[..8] != HEADER_MAGIC {
        return Err(WalError::Corruption("invalid WAL magic".to_string()));
    }

    let mut version_bytes = [0u8; 4];
    version_bytes.copy_from_slice(&buf[8..12]);
    let version = u32::from_le_bytes(version_bytes);
    if version != HEADER_VERSION {
        return Err(WalError::Corruption(format!(
            "unsupported WAL version: {version}"
        )));
    }

    Ok(())
}

/// Read every complete record after the header. Returns the records and the
/// offset just past the last complete one.
///
/// Ids must increase by one from record to record. A record that is cut short,
/// fails its CRC or carries the wrong id ends the log when nothing intact
/// follows it; if the next record can still be found further on, the damage is
/// in the middle of the log and is reported as corruption.
fn read_all(file: &mut File) -> Result<(Vec<WalRecord>, u64), WalError> {
    let mut data = Vec::new();
    file.seek(SeekFrom::Start(HEADER_LEN))?;
    file.read_to_end(&mut data)?;

    let mut records = Vec::new();
    let mut pos = 0usize;
    let mut expected: Option<u64> = None;
    while data.len() - pos >= RECORD_HEADER_LEN {
        let id = match expected.or_else(|| frame_id(&data, pos)) {
            Some(id) => id,
            None => break,
        };
        match frame_at(&data, pos) {
            Some(frame) if frame.id == id && frame.intact => {
                records.push(WalRecord {
                    id,
                    payload: Bytes::copy_from_slice(frame.payload),
                });
                pos += RECORD_HEADER_LEN + frame.payload.len();
                expected = Some(id + 1);
            }
            _ => {
                let offset = HEADER_LEN + pos as u64;
                if frame_follows(&data, pos + RECORD_HEADER_LEN, id + 1) {
                    error!(
                        offset,
                        id,
                        "WAL corruption detected: damaged record before intact ones"
                    );
                    return Err(WalError::Corruption(format!(
                        "record {id} at offset {offset} is damaged but record {} follows it",
                        id + 1
                    )));
                }
                break;
            }
        }
    }

    Ok((records, HEADER_LEN + pos as u64))
}

struct Frame<'a> {
    id: u64,
    payload: &'a [u8],
    intact: bool,
}

fn frame_id(data: &[u8], pos: usize) -> Option<u64> {
    let raw: [u8; 8] = data.get(pos..pos.checked_add(8)?)?.try_into().ok()?;
    Some(u64::from_le_bytes(raw))
}

/// The frame starting at `pos`, if its header and payload lie within `data`.
fn frame_at(data: &[u8], pos: usize) -> Option<Frame<'_>> {
    let header = data.get(pos..pos.checked_add(RECORD_HEADER_LEN)?)?;
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[8..12]);
    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut crc_bytes = [0u8; 4];
    crc_bytes.copy_from_slice(&header[12..16]);
    let expected_crc = u32::from_le_bytes(crc_bytes);

    let start = pos + RECORD_HEADER_LEN;
    let payload = data.get(start..start.checked_add(len)?)?;
    let mut hasher = Crc32Hasher::new();
    hasher.update(payload);
    Some(Frame {
        id: frame_id(data, pos)?,
        payload,
        intact: hasher.finalize() == expected_crc,
    })
}

/// Whether an intact record with id `id` starts anywhere at or after `from`.
fn frame_follows(data: &[u8], from: usize, id: u64) -> bool {
    let id_bytes = id.to_le_bytes();
    (from..data.len()).any(|pos| {
        data.get(pos..pos + 8) == Some(&id_bytes[..])
            && frame_at(data, pos).is_some_and(|frame| frame.intact)
    })
}
