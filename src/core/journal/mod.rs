//! Per-queue durable record log.
//!
//! Each durable queue owns a directory holding `journal.toml` (geometry) and a
//! ring of `NNNN.jdat` files. Records are framed as
//! `rid u64 | len u32 | crc32(rid, payload) u32 | payload`, ids increase by one per
//! record, and a record may span files.
//!
//! Liveness is tracked for enqueue records only: a file slot is recycled once the
//! oldest live enqueue lies past it. Dequeue, delivered and marker records always
//! follow the enqueue they refer to, so they are retained for as long as needed.

mod file;
pub mod geometry;
pub mod record;
pub(crate) mod replay;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32Hasher;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::codec::CodecError;
use crate::core::message::Message;
use crate::core::wal::{SyncState, WalConfig, RECORD_HEADER_LEN};

use file::RingFiles;
pub(crate) use geometry::JournalInfo;
pub use geometry::{
    JournalGeometry, DEFAULT_FILE_PAGES, DEFAULT_NUM_FILES, ENQUEUE_THRESHOLD_PCT, MAX_FILES,
    MAX_FILE_PAGES, MIN_FILES, MIN_FILE_PAGES, PAGE_SIZE,
};
pub use record::JournalRecord;

/// Stream bytes held back for every live enqueue so that it can always be
/// settled: one delivered marker, one transactional dequeue and one commit or
/// abort marker.
pub const SETTLE_RESERVE: u64 = 3 * RECORD_HEADER_LEN as u64 + 9 + 26 + 17;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("journal corruption: {0}")]
    Corruption(String),

    #[error("journal full: {0}")]
    Full(String),

    #[error("invalid journal geometry: {0}")]
    InvalidGeometry(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// A record read back from a journal, in stream order.
#[derive(Debug, Clone)]
pub struct ScannedRecord {
    pub rid: u64,
    pub offset: u64,
    pub len: u64,
    pub record: JournalRecord,
}

/// Result of reading a journal directory without modifying it.
#[derive(Debug)]
pub struct JournalScan {
    pub queue: String,
    pub geometry: JournalGeometry,
    pub records: Vec<ScannedRecord>,
    pub head: u64,
    pub next_rid: u64,
    /// Offset of a torn record at the tail, if one was found.
    pub torn_at: Option<u64>,
}

/// Space accounting snapshot of a journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalUsage {
    pub capacity: u64,
    pub enqueue_limit: u64,
    /// Bytes between the oldest live enqueue and the write head.
    pub window: u64,
    pub live_records: usize,
}

#[derive(Debug)]
struct JournalInner {
    ring: RingFiles,
    head: u64,
    next_rid: u64,
    /// Live enqueue records: offset -> rid.
    live: BTreeMap<u64, u64>,
    /// Live enqueue records: rid -> (offset, frame length).
    index: HashMap<u64, (u64, u64)>,
    sync: SyncState,
}

impl JournalInner {
    fn oldest_live(&self) -> u64 {
        self.live.keys().next().copied().unwrap_or(self.head)
    }
}

#[derive(Debug)]
pub struct Journal {
    dir: PathBuf,
    queue: String,
    geometry: JournalGeometry,
    inner: Mutex<JournalInner>,
    #[cfg(test)]
    fail_next_flush: std::sync::atomic::AtomicBool,
}

impl Journal {
    /// Create an empty journal in `dir`, replacing anything already there.
    pub fn create(
        dir: &Path,
        queue: &str,
        geometry: JournalGeometry,
        config: WalConfig,
    ) -> Result<Self, JournalError> {
        geometry.validate()?;
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        JournalInfo::new(queue, geometry).store(dir)?;
        let ring = RingFiles::create(dir, geometry)?;
        debug!(queue, dir = %dir.display(), %geometry, "created journal");
        Ok(Self {
            dir: dir.to_path_buf(),
            queue: queue.to_string(),
            geometry,
            inner: Mutex::new(JournalInner {
                ring,
                head: 0,
                next_rid: 1,
                live: BTreeMap::new(),
                index: HashMap::new(),
                sync: SyncState::new(config),
            }),
            #[cfg(test)]
            fail_next_flush: Default::default(),
        })
    }

    /// Read every record of the journal in `dir` without touching the files.
    pub fn scan(dir: &Path) -> Result<JournalScan, JournalError> {
        let info = JournalInfo::load(dir)?;
        let mut ring = RingFiles::open(dir, info.geometry, false)?;
        scan_ring(&mut ring, info)
    }

    /// Open an existing journal, cutting off a torn tail. Every enqueue record
    /// starts out live; recovery narrows that down with [`Journal::retain_live`].
    pub fn open(dir: &Path, config: WalConfig) -> Result<(Self, Vec<ScannedRecord>), JournalError> {
        let info = JournalInfo::load(dir)?;
        let mut ring = RingFiles::open(dir, info.geometry, true)?;
        let scan = scan_ring(&mut ring, info)?;
        if let Some(at) = scan.torn_at {
            warn!(
                queue = %scan.queue,
                offset = at,
                "discarding torn record at journal tail"
            );
            ring.discard_from(at)?;
            ring.sync()?;
        }

        let mut live = BTreeMap::new();
        let mut index = HashMap::new();
        for rec in scan.records.iter().filter(|r| r.record.is_enqueue()) {
            live.insert(rec.offset, rec.rid);
            index.insert(rec.rid, (rec.offset, rec.len));
        }

        let journal = Self {
            dir: dir.to_path_buf(),
            queue: scan.queue,
            geometry: scan.geometry,
            inner: Mutex::new(JournalInner {
                ring,
                head: scan.head,
                next_rid: scan.next_rid,
                live,
                index,
                sync: SyncState::new(config),
            }),
            #[cfg(test)]
            fail_next_flush: Default::default(),
        };
        Ok((journal, scan.records))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn geometry(&self) -> JournalGeometry {
        self.geometry
    }

    /// Append a record and return its id.
    ///
    /// Enqueues are refused with [`JournalError::Full`] when they would push the
    /// live window past the enqueue threshold, or when the window plus
    /// [`SETTLE_RESERVE`] for every live enqueue would no longer fit beside the
    /// file holding the oldest live record. Any record is refused when the file
    /// slot it needs still holds live data.
    pub fn append(&self, record: &JournalRecord) -> Result<u64, JournalError> {
        let payload = record.encode()?;
        let mut inner = self.inner.lock();

        let rid = inner.next_rid;
        let frame = encode_frame(rid, &payload)?;
        let len = frame.len() as u64;
        let head = inner.head;
        let oldest = inner.oldest_live();
        let window = head + len - oldest;

        if window > self.geometry.capacity() {
            return Err(JournalError::Full(format!(
                "record of {len} bytes does not fit ({window} of {} bytes)",
                self.geometry.capacity()
            )));
        }
        if record.is_enqueue() && window > self.geometry.enqueue_limit() {
            return Err(JournalError::Full(format!(
                "enqueue of {len} bytes would use {window} of {} bytes ({ENQUEUE_THRESHOLD_PCT}% of {})",
                self.geometry.enqueue_limit(),
                self.geometry.capacity()
            )));
        }
        if record.is_enqueue() {
            let reserve = SETTLE_RESERVE * (inner.index.len() as u64 + 1);
            if window + reserve > self.geometry.settle_limit() {
                return Err(JournalError::Full(format!(
                    "enqueue of {len} bytes would use {window} bytes with {reserve} more held back \
                     to settle live records, over {} bytes",
                    self.geometry.settle_limit()
                )));
            }
        }

        let file_capacity = inner.ring.file_capacity();
        let num_files = inner.ring.num_files();
        let first = head / file_capacity;
        let last = (head + len - 1) / file_capacity;
        for idx in first..=last {
            if inner.ring.holds(idx) {
                continue;
            }
            if idx >= num_files && oldest < (idx - num_files + 1) * file_capacity {
                return Err(JournalError::Full(format!(
                    "file slot for journal file {idx} still holds live records"
                )));
            }
            let (first_record, first_rid) = if head >= idx * file_capacity {
                (head, rid)
            } else {
                (head + len, rid + 1)
            };
            inner.ring.begin(idx, first_record, first_rid)?;
        }

        inner.ring.write_at(head, &frame)?;
        inner.head += len;
        inner.next_rid += 1;
        if record.is_enqueue() {
            inner.live.insert(head, rid);
            inner.index.insert(rid, (head, len));
        }

        inner.sync.record_appended();
        if inner.sync.should_sync() {
            let span = tracing::trace_span!("journal_flush", queue = %self.queue);
            let _guard = span.enter();
            inner.ring.sync()?;
            inner.sync.synced();
        }
        Ok(rid)
    }

    /// Force an fsync of every file written since the last one.
    pub fn flush(&self) -> Result<(), JournalError> {
        self.injected_flush_failure()?;
        let mut inner = self.inner.lock();
        inner.ring.sync()?;
        inner.sync.synced();
        Ok(())
    }

    /// Make the next [`Journal::flush`] fail without syncing.
    #[cfg(test)]
    pub(crate) fn fail_next_flush(&self) {
        self.fail_next_flush
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    #[cfg(test)]
    fn injected_flush_failure(&self) -> Result<(), JournalError> {
        if self
            .fail_next_flush
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err(JournalError::Io(std::io::Error::other("injected flush failure")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn injected_flush_failure(&self) -> Result<(), JournalError> {
        Ok(())
    }

    /// Read back the message of a live enqueue record.
    pub fn read_message(&self, rid: u64) -> Result<Message, JournalError> {
        let mut inner = self.inner.lock();
        let (offset, len) = inner.index.get(&rid).copied().ok_or_else(|| {
            JournalError::Corruption(format!("no live enqueue record with id {rid}"))
        })?;
        let mut frame = vec![0u8; len as usize];
        if !inner.ring.read_at(offset, &mut frame)? {
            return Err(JournalError::Corruption(format!(
                "enqueue record {rid} lies outside the ring"
            )));
        }
        let (frame_rid, payload) = decode_frame(&frame)
            .ok_or_else(|| JournalError::Corruption(format!("enqueue record {rid} is damaged")))?;
        if frame_rid != rid {
            return Err(JournalError::Corruption(format!(
                "expected record {rid} at offset {offset}, found {frame_rid}"
            )));
        }
        match JournalRecord::decode(payload)? {
            JournalRecord::Enqueue { message, .. } => Ok(message),
            other => Err(JournalError::Corruption(format!(
                "record {rid} is not an enqueue: {other:?}"
            ))),
        }
    }

    /// Mark an enqueue record dead so its space can be reclaimed.
    pub fn release(&self, rid: u64) {
        let mut inner = self.inner.lock();
        if let Some((offset, _)) = inner.index.remove(&rid) {
            inner.live.remove(&offset);
        }
    }

    /// Keep only the listed enqueue records live.
    pub fn retain_live(&self, keep: &HashSet<u64>) {
        let mut inner = self.inner.lock();
        inner.index.retain(|rid, _| keep.contains(rid));
        inner.live.retain(|_, rid| keep.contains(rid));
    }

    pub fn usage(&self) -> JournalUsage {
        let inner = self.inner.lock();
        JournalUsage {
            capacity: self.geometry.capacity(),
            enqueue_limit: self.geometry.enqueue_limit(),
            window: inner.head - inner.oldest_live(),
            live_records: inner.index.len(),
        }
    }

    /// Remove the journal directory. The journal must not be used afterwards.
    pub fn destroy(&self) -> Result<(), JournalError> {
        let _inner = self.inner.lock();
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir)?;
        }
        Ok(())
    }
}

/// Bytes a record occupies in the stream once framed.
pub fn framed_len(record: &JournalRecord) -> Result<u64, JournalError> {
    Ok((RECORD_HEADER_LEN + record.encode()?.len()) as u64)
}

fn encode_frame(rid: u64, payload: &[u8]) -> Result<Vec<u8>, JournalError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| JournalError::Full(format!("record of {} bytes too large", payload.len())))?;
    let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + payload.len());
    frame.extend_from_slice(&rid.to_le_bytes());
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&frame_crc(rid, payload).to_le_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

fn frame_crc(rid: u64, payload: &[u8]) -> u32 {
    let mut hasher = Crc32Hasher::new();
    hasher.update(&rid.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

struct FrameHeader {
    rid: u64,
    len: u64,
    crc: u32,
}

fn parse_header(raw: &[u8; RECORD_HEADER_LEN]) -> FrameHeader {
    let mut rid = [0u8; 8];
    rid.copy_from_slice(&raw[..8]);
    let mut len = [0u8; 4];
    len.copy_from_slice(&raw[8..12]);
    let mut crc = [0u8; 4];
    crc.copy_from_slice(&raw[12..16]);
    FrameHeader {
        rid: u64::from_le_bytes(rid),
        len: u64::from(u32::from_le_bytes(len)),
        crc: u32::from_le_bytes(crc),
    }
}

/// Split a complete frame into id and payload, checking its CRC.
fn decode_frame(frame: &[u8]) -> Option<(u64, &[u8])> {
    let raw: &[u8; RECORD_HEADER_LEN] = frame.get(..RECORD_HEADER_LEN)?.try_into().ok()?;
    let header = parse_header(raw);
    let payload = frame.get(RECORD_HEADER_LEN..)?;
    (payload.len() as u64 == header.len && frame_crc(header.rid, payload) == header.crc)
        .then_some((header.rid, payload))
}

fn scan_ring(ring: &mut RingFiles, info: JournalInfo) -> Result<JournalScan, JournalError> {
    let mut scan = JournalScan {
        queue: info.queue,
        geometry: info.geometry,
        records: Vec::new(),
        head: 0,
        next_rid: 1,
        torn_at: None,
    };
    let (Some(oldest), Some(newest)) = (ring.oldest(), ring.newest()) else {
        return Ok(scan);
    };
    let Some(oldest_header) = ring.header(oldest) else {
        return Ok(scan);
    };
    let end = (newest + 1) * ring.file_capacity();
    let mut offset = oldest_header.first_record;
    let mut expected = oldest_header.first_rid;
    let header_len = RECORD_HEADER_LEN as u64;

    loop {
        if offset + header_len > end {
            break;
        }
        let mut raw = [0u8; RECORD_HEADER_LEN];
        if !ring.read_at(offset, &mut raw)? {
            break;
        }
        let header = parse_header(&raw);
        if header.rid == 0 && header.len == 0 && header.crc == 0 {
            break;
        }
        let frame_end = offset + header_len + header.len;
        if header.rid != expected || frame_end > end {
            scan.torn_at = Some(offset);
            break;
        }
        let mut payload = vec![0u8; header.len as usize];
        if !ring.read_at(offset + header_len, &mut payload)? {
            scan.torn_at = Some(offset);
            break;
        }
        if frame_crc(header.rid, &payload) != header.crc {
            if next_frame_follows(ring, frame_end, header.rid + 1, end)? {
                return Err(JournalError::Corruption(format!(
                    "CRC mismatch in record {} at stream offset {offset}",
                    header.rid
                )));
            }
            scan.torn_at = Some(offset);
            break;
        }
        let record = JournalRecord::decode(&payload).map_err(|e| {
            JournalError::Corruption(format!("record {} undecodable: {e}", header.rid))
        })?;
        scan.records.push(ScannedRecord {
            rid: header.rid,
            offset,
            len: frame_end - offset,
            record,
        });
        expected = header.rid + 1;
        offset = frame_end;
    }

    scan.head = scan.torn_at.unwrap_or(offset);
    scan.next_rid = expected;
    Ok(scan)
}

/// Whether a well-formed record with id `rid` starts at `offset`; used to tell a
/// damaged record in the middle of the log from a torn one at its end.
fn next_frame_follows(
    ring: &mut RingFiles,
    offset: u64,
    rid: u64,
    end: u64,
) -> Result<bool, JournalError> {
    let header_len = RECORD_HEADER_LEN as u64;
    if offset + header_len > end {
        return Ok(false);
    }
    let mut raw = [0u8; RECORD_HEADER_LEN];
    if !ring.read_at(offset, &mut raw)? {
        return Ok(false);
    }
    let header = parse_header(&raw);
    if header.rid != rid || offset + header_len + header.len > end {
        return Ok(false);
    }
    let mut payload = vec![0u8; header.len as usize];
    if !ring.read_at(offset + header_len, &mut payload)? {
        return Ok(false);
    }
    Ok(frame_crc(header.rid, &payload) == header.crc)
}
