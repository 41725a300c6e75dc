//! On-disk log and index file formats.
//!
//! Per partition, a sequence of file pairs `<partition>-<NNNNNN>.log` and
//! `<partition>-<NNNNNN>.idx`. Both start with a one-byte version header.
//! Log records are a u32 big-endian payload size followed by the payload;
//! index records are fixed-width `id u64 | offset u64 | size u32`, all
//! big-endian. Offsets point at the payload, past the size prefix.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::index_list::{IndexEntry, IndexList};
use crate::store::StoreError;

pub(crate) const LOG_FILE_VERSION: u8 = 1;
pub(crate) const INDEX_FILE_VERSION: u8 = 1;
pub(crate) const INDEX_RECORD_LEN: usize = 20;

pub(crate) fn log_file_name(partition: &str, file_id: u64) -> String {
    format!("{partition}-{file_id:06}.log")
}

pub(crate) fn index_file_name(partition: &str, file_id: u64) -> String {
    format!("{partition}-{file_id:06}.idx")
}

/// Parse the file id out of an index file name for the given partition.
pub(crate) fn parse_index_file_id(partition: &str, file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(partition)?.strip_prefix('-')?;
    rest.strip_suffix(".idx")?.parse().ok()
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io {
        path: Some(path.to_path_buf()),
        source,
    }
}

/// Open a file for appending, writing the version byte when the file is
/// new and validating it otherwise. Returns the file and its length.
fn open_versioned(path: &Path, version: u8) -> Result<(File, u64), StoreError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .create(true)
        .open(path)
        .map_err(io_error(path))?;
    let len = file.metadata().map_err(io_error(path))?.len();
    if len == 0 {
        file.write_all(&[version]).map_err(io_error(path))?;
        return Ok((file, 1));
    }

    let mut header = [0u8; 1];
    file.seek(SeekFrom::Start(0)).map_err(io_error(path))?;
    file.read_exact(&mut header).map_err(io_error(path))?;
    if header[0] != version {
        return Err(StoreError::UnsupportedVersion {
            got: header[0],
            supported: version,
        });
    }
    Ok((file, len))
}

/// Append half of a partition log file.
pub(crate) struct LogWriter {
    file: File,
    path: PathBuf,
    len: u64,
}

impl LogWriter {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let (file, len) = open_versioned(&path, LOG_FILE_VERSION)?;
        Ok(Self { file, path, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    /// Append one record; returns the payload's offset and size.
    pub fn append(&mut self, payload: &[u8]) -> Result<(u64, u32), StoreError> {
        let size = u32::try_from(payload.len()).map_err(|_| StoreError::Corrupt {
            path: self.path.clone(),
            reason: "payload exceeds u32 size".to_string(),
        })?;
        self.file
            .write_all(&size.to_be_bytes())
            .map_err(io_error(&self.path))?;
        self.file
            .write_all(payload)
            .map_err(io_error(&self.path))?;
        let offset = self.len + 4;
        self.len += 4 + u64::from(size);
        Ok((offset, size))
    }
}

/// Append half of a partition index file.
#[derive(Debug)]
pub(crate) struct IndexWriter {
    file: File,
    path: PathBuf,
    records: u64,
}

impl IndexWriter {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let (file, len) = open_versioned(&path, INDEX_FILE_VERSION)?;
        let body = len.saturating_sub(1);
        if body % INDEX_RECORD_LEN as u64 != 0 {
            return Err(StoreError::Corrupt {
                path,
                reason: format!("index body of {body} bytes is not record-aligned"),
            });
        }
        Ok(Self {
            file,
            path,
            records: body / INDEX_RECORD_LEN as u64,
        })
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn append(&mut self, entry: &IndexEntry) -> Result<(), StoreError> {
        let mut record = [0u8; INDEX_RECORD_LEN];
        record[0..8].copy_from_slice(&entry.id.to_be_bytes());
        record[8..16].copy_from_slice(&entry.offset.to_be_bytes());
        record[16..20].copy_from_slice(&entry.size.to_be_bytes());
        self.file
            .write_all(&record)
            .map_err(io_error(&self.path))?;
        self.records += 1;
        Ok(())
    }
}

/// Load a whole index file into a sorted in-memory list.
pub(crate) fn read_index_file(path: &Path, file_id: u64) -> Result<IndexList, StoreError> {
    let mut file = File::open(path).map_err(io_error(path))?;
    let mut header = [0u8; 1];
    file.read_exact(&mut header).map_err(io_error(path))?;
    if header[0] != INDEX_FILE_VERSION {
        return Err(StoreError::UnsupportedVersion {
            got: header[0],
            supported: INDEX_FILE_VERSION,
        });
    }

    let mut body = Vec::new();
    file.read_to_end(&mut body).map_err(io_error(path))?;
    if body.len() % INDEX_RECORD_LEN != 0 {
        return Err(StoreError::Corrupt {
            path: path.to_path_buf(),
            reason: format!("index body of {} bytes is not record-aligned", body.len()),
        });
    }

    let list = IndexList::with_capacity(body.len() / INDEX_RECORD_LEN);
    for record in body.chunks_exact(INDEX_RECORD_LEN) {
        list.insert([IndexEntry {
            id: u64::from_be_bytes(record[0..8].try_into().expect("8-byte slice")),
            file_id,
            offset: u64::from_be_bytes(record[8..16].try_into().expect("8-byte slice")),
            size: u32::from_be_bytes(record[16..20].try_into().expect("4-byte slice")),
        }]);
    }
    Ok(list)
}

/// Read-only access to a partition log file.
pub(crate) struct LogReader {
    file: File,
    path: PathBuf,
}

impl LogReader {
    pub fn open(path: PathBuf) -> Result<Self, StoreError> {
        let mut file = File::open(&path).map_err(io_error(&path))?;
        let mut header = [0u8; 1];
        file.read_exact(&mut header).map_err(io_error(&path))?;
        if header[0] != LOG_FILE_VERSION {
            return Err(StoreError::UnsupportedVersion {
                got: header[0],
                supported: LOG_FILE_VERSION,
            });
        }
        Ok(Self { file, path })
    }

    pub fn read_payload(&mut self, offset: u64, size: u32) -> Result<Vec<u8>, StoreError> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map_err(io_error(&self.path))?;
        let mut payload = vec![0u8; size as usize];
        self.file
            .read_exact(&mut payload)
            .map_err(io_error(&self.path))?;
        Ok(payload)
    }
}
