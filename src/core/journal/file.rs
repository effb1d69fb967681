//! Ring of fixed-size journal data files.
//!
//! The record stream is addressed by a logical offset that only grows. Stream
//! byte `x` lives in file index `x / file_capacity`, stored in slot
//! `index % num_files`. Every data file starts with a 64-byte header naming the
//! file index it currently holds, so a slot can be recycled once everything it
//! held is dead.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::{JournalError, JournalGeometry};

const FILE_MAGIC: &[u8; 8] = b"BLIPJRN\0";
const FILE_VERSION: u32 = 1;
pub(crate) const FILE_HEADER_LEN: u64 = 64;
const UNUSED_INDEX: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FileHeader {
    pub index: Option<u64>,
    /// Stream offset of the first record that starts in this file.
    pub first_record: u64,
    /// Record id the first record starting in this file carries.
    pub first_rid: u64,
}

impl FileHeader {
    const UNUSED: FileHeader = FileHeader {
        index: None,
        first_record: 0,
        first_rid: 0,
    };
}

pub(crate) fn data_file_path(dir: &Path, slot: usize) -> PathBuf {
    dir.join(format!("{slot:04}.jdat"))
}

#[derive(Debug)]
pub(crate) struct RingFiles {
    file_pages: u32,
    file_capacity: u64,
    files: Vec<File>,
    headers: Vec<FileHeader>,
    dirty: Vec<bool>,
}

impl RingFiles {
    pub(crate) fn create(dir: &Path, geometry: JournalGeometry) -> Result<Self, JournalError> {
        let file_capacity = geometry.file_capacity();
        let mut files = Vec::with_capacity(geometry.num_files as usize);
        for slot in 0..geometry.num_files as usize {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .read(true)
                .write(true)
                .open(data_file_path(dir, slot))?;
            file.set_len(FILE_HEADER_LEN + file_capacity)?;
            write_header(&mut file, geometry.file_size_pages, &FileHeader::UNUSED)?;
            file.sync_all()?;
            files.push(file);
        }
        Ok(Self {
            file_pages: geometry.file_size_pages,
            file_capacity,
            headers: vec![FileHeader::UNUSED; files.len()],
            dirty: vec![false; files.len()],
            files,
        })
    }

    pub(crate) fn open(
        dir: &Path,
        geometry: JournalGeometry,
        writable: bool,
    ) -> Result<Self, JournalError> {
        let file_capacity = geometry.file_capacity();
        let mut files = Vec::with_capacity(geometry.num_files as usize);
        let mut headers = Vec::with_capacity(geometry.num_files as usize);
        for slot in 0..geometry.num_files as usize {
            let path = data_file_path(dir, slot);
            let mut file = OpenOptions::new().read(true).write(writable).open(&path)?;
            let len = file.metadata()?.len();
            if len < FILE_HEADER_LEN + file_capacity {
                return Err(JournalError::Corruption(format!(
                    "{} is {len} bytes, expected {}",
                    path.display(),
                    FILE_HEADER_LEN + file_capacity
                )));
            }
            headers.push(read_header(&mut file, geometry.file_size_pages, &path)?);
            files.push(file);
        }
        Ok(Self {
            file_pages: geometry.file_size_pages,
            file_capacity,
            dirty: vec![false; files.len()],
            files,
            headers,
        })
    }

    pub(crate) fn file_capacity(&self) -> u64 {
        self.file_capacity
    }

    pub(crate) fn num_files(&self) -> u64 {
        self.files.len() as u64
    }

    fn slot(&self, index: u64) -> usize {
        (index % self.num_files()) as usize
    }

    pub(crate) fn holds(&self, index: u64) -> bool {
        self.headers[self.slot(index)].index == Some(index)
    }

    pub(crate) fn header(&self, index: u64) -> Option<FileHeader> {
        self.holds(index).then(|| self.headers[self.slot(index)])
    }

    pub(crate) fn newest(&self) -> Option<u64> {
        self.headers.iter().filter_map(|h| h.index).max()
    }

    /// Oldest file index still present in the ring.
    pub(crate) fn oldest(&self) -> Option<u64> {
        let newest = self.newest()?;
        let low = newest.saturating_sub(self.num_files() - 1);
        (low..=newest).find(|idx| self.holds(*idx))
    }

    /// Read stream bytes at `offset`. Returns `false` when any part of the range
    /// lies in a file the ring does not currently hold.
    pub(crate) fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<bool, JournalError> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = offset + done as u64;
            let index = at / self.file_capacity;
            if !self.holds(index) {
                return Ok(false);
            }
            let within = at % self.file_capacity;
            let take = ((self.file_capacity - within) as usize).min(buf.len() - done);
            let slot = self.slot(index);
            let file = &mut self.files[slot];
            file.seek(SeekFrom::Start(FILE_HEADER_LEN + within))?;
            file.read_exact(&mut buf[done..done + take])?;
            done += take;
        }
        Ok(true)
    }

    pub(crate) fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<(), JournalError> {
        let mut done = 0usize;
        while done < data.len() {
            let at = offset + done as u64;
            let index = at / self.file_capacity;
            if !self.holds(index) {
                return Err(JournalError::Corruption(format!(
                    "write at stream offset {at} outside the ring"
                )));
            }
            let within = at % self.file_capacity;
            let take = ((self.file_capacity - within) as usize).min(data.len() - done);
            let slot = self.slot(index);
            let file = &mut self.files[slot];
            file.seek(SeekFrom::Start(FILE_HEADER_LEN + within))?;
            file.write_all(&data[done..done + take])?;
            self.dirty[slot] = true;
            done += take;
        }
        Ok(())
    }

    /// Start using the slot for file `index`, wiping whatever it held before.
    pub(crate) fn begin(
        &mut self,
        index: u64,
        first_record: u64,
        first_rid: u64,
    ) -> Result<(), JournalError> {
        let slot = self.slot(index);
        let header = FileHeader {
            index: Some(index),
            first_record,
            first_rid,
        };
        self.reset_slot(slot, header)?;
        Ok(())
    }

    /// Drop everything from stream offset `offset` onwards.
    pub(crate) fn discard_from(&mut self, offset: u64) -> Result<(), JournalError> {
        let index = offset / self.file_capacity;
        let within = offset % self.file_capacity;
        for slot in 0..self.files.len() {
            let Some(held) = self.headers[slot].index else {
                continue;
            };
            if held > index || (held == index && within == 0) {
                self.reset_slot(slot, FileHeader::UNUSED)?;
            } else if held == index {
                let file = &mut self.files[slot];
                file.set_len(FILE_HEADER_LEN + within)?;
                file.set_len(FILE_HEADER_LEN + self.file_capacity)?;
                self.dirty[slot] = true;
            }
        }
        Ok(())
    }

    pub(crate) fn sync(&mut self) -> Result<(), JournalError> {
        for (slot, dirty) in self.dirty.iter_mut().enumerate() {
            if *dirty {
                self.files[slot].sync_data()?;
                *dirty = false;
            }
        }
        Ok(())
    }

    fn reset_slot(&mut self, slot: usize, header: FileHeader) -> Result<(), JournalError> {
        let file = &mut self.files[slot];
        file.set_len(FILE_HEADER_LEN)?;
        file.set_len(FILE_HEADER_LEN + self.file_capacity)?;
        write_header(file, self.file_pages, &header)?;
        self.headers[slot] = header;
        self.dirty[slot] = true;
        Ok(())
    }
}

fn write_header(file: &mut File, file_pages: u32, header: &FileHeader) -> Result<(), JournalError> {
    let mut buf = [0u8; FILE_HEADER_LEN as usize];
    buf[..8].copy_from_slice(FILE_MAGIC);
    buf[8..12].copy_from_slice(&FILE_VERSION.to_le_bytes());
    buf[12..16].copy_from_slice(&file_pages.to_le_bytes());
    buf[16..24].copy_from_slice(&header.index.unwrap_or(UNUSED_INDEX).to_le_bytes());
    buf[24..32].copy_from_slice(&header.first_record.to_le_bytes());
    buf[32..40].copy_from_slice(&header.first_rid.to_le_bytes());
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&buf)?;
    Ok(())
}

fn read_header(file: &mut File, file_pages: u32, path: &Path) -> Result<FileHeader, JournalError> {
    let mut buf = [0u8; FILE_HEADER_LEN as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut buf)?;
    if &buf[..8] != FILE_MAGIC {
        return Err(JournalError::Corruption(format!(
            "{}: invalid journal file magic",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(le4(&buf[8..12]));
    if version != FILE_VERSION {
        return Err(JournalError::Corruption(format!(
            "{}: unsupported journal file version {version}",
            path.display()
        )));
    }
    let pages = u32::from_le_bytes(le4(&buf[12..16]));
    if pages != file_pages {
        return Err(JournalError::Corruption(format!(
            "{}: file holds {pages} pages, journal geometry says {file_pages}",
            path.display()
        )));
    }
    let index = u64::from_le_bytes(le8(&buf[16..24]));
    Ok(FileHeader {
        index: (index != UNUSED_INDEX).then_some(index),
        first_record: u64::from_le_bytes(le8(&buf[24..32])),
        first_rid: u64::from_le_bytes(le8(&buf[32..40])),
    })
}

fn le4(raw: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(raw);
    out
}

fn le8(raw: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(raw);
    out
}
