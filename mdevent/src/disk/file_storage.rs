//! File-backed paging storage.
//!
//! Each evicted leaf is written as one length-prefixed [`EventBlock`]. Blocks
//! are first staged in a write buffer and written to the file once the buffer
//! exceeds its capacity (or on `flush`). Released blocks go onto a free list
//! and their space is reused first-fit.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};

use super::file_backend::{BoxId, EventBlock, FileBackend, FileOffset};
use crate::errors::{MdError, MdResult};

/// Default write buffer capacity (4MB)
pub const DEFAULT_WRITE_BUFFER_BYTES: u64 = 4 * 1024 * 1024;

/// Size of the little-endian length prefix in front of every block.
const LEN_PREFIX: u64 = 8;

/// I/O counters for a [`FileEventStorage`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    pub disk_reads: u64,
    pub disk_writes: u64,
    pub buffer_hits: u64,
    pub free_slots: u64,
    pub file_length: u64,
}

struct StorageCounters {
    disk_reads: AtomicU64,
    disk_writes: AtomicU64,
    buffer_hits: AtomicU64,
}

impl StorageCounters {
    fn new() -> Self {
        Self {
            disk_reads: AtomicU64::new(0),
            disk_writes: AtomicU64::new(0),
            buffer_hits: AtomicU64::new(0),
        }
    }
}

/// Allocation state, guarded by one lock.
struct Allocation {
    /// First byte past the last allocated block.
    end_of_file: u64,
    /// Free ranges as `offset -> length`, kept coalesced.
    free: BTreeMap<u64, u64>,
    /// Blocks not yet written to the file, keyed by offset.
    staged: BTreeMap<FileOffset, Vec<u8>>,
    staged_bytes: u64,
    /// Length (prefix included) of every live block.
    lengths: BTreeMap<FileOffset, u64>,
}

impl Allocation {
    fn new() -> Self {
        Self {
            end_of_file: 0,
            free: BTreeMap::new(),
            staged: BTreeMap::new(),
            staged_bytes: 0,
            lengths: BTreeMap::new(),
        }
    }

    /// First-fit allocation from the free list, else append.
    fn allocate(&mut self, len: u64) -> u64 {
        let slot = self
            .free
            .iter()
            .find(|(_, &free_len)| free_len >= len)
            .map(|(&offset, &free_len)| (offset, free_len));

        match slot {
            Some((offset, free_len)) => {
                self.free.remove(&offset);
                if free_len > len {
                    self.free.insert(offset + len, free_len - len);
                }
                offset
            }
            None => {
                let offset = self.end_of_file;
                self.end_of_file += len;
                offset
            }
        }
    }

    /// Returns a range to the free list, merging with its neighbours.
    fn free_range(&mut self, mut offset: u64, mut len: u64) {
        if let Some((&prev_offset, &prev_len)) = self.free.range(..offset).next_back() {
            if prev_offset + prev_len == offset {
                self.free.remove(&prev_offset);
                offset = prev_offset;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(offset + len)) {
            self.free.remove(&(offset + len));
            len += next_len;
        }
        if offset + len == self.end_of_file {
            self.end_of_file = offset;
        } else {
            self.free.insert(offset, len);
        }
    }
}

/// Pages leaf events to a single file.
///
/// The file is scratch space for one tree: it is truncated on creation and its
/// layout is private to this type.
pub struct FileEventStorage {
    file: RwLock<File>,
    path: PathBuf,
    allocation: Mutex<Allocation>,
    buffer_capacity: u64,
    counters: StorageCounters,
}

impl FileEventStorage {
    /// Create a new storage file with the default write buffer
    pub fn create(path: impl AsRef<Path>) -> MdResult<Self> {
        Self::create_with_buffer_capacity(path, DEFAULT_WRITE_BUFFER_BYTES)
    }

    /// Create with a custom write buffer capacity in bytes. A capacity of zero
    /// writes every block through immediately.
    pub fn create_with_buffer_capacity(
        path: impl AsRef<Path>,
        buffer_capacity: u64,
    ) -> MdResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        Ok(Self {
            file: RwLock::new(file),
            path: path.as_ref().to_path_buf(),
            allocation: Mutex::new(Allocation::new()),
            buffer_capacity,
            counters: StorageCounters::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn stats(&self) -> StorageStats {
        let allocation = self.allocation.lock();
        StorageStats {
            disk_reads: self.counters.disk_reads.load(Ordering::Relaxed),
            disk_writes: self.counters.disk_writes.load(Ordering::Relaxed),
            buffer_hits: self.counters.buffer_hits.load(Ordering::Relaxed),
            free_slots: allocation.free.len() as u64,
            file_length: allocation.end_of_file,
        }
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> MdResult<()> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(bytes)?;
        self.counters.disk_writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn read_at(&self, offset: u64, len: u64) -> MdResult<Vec<u8>> {
        let mut file = self.file.write();
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len as usize];
        file.read_exact(&mut buffer)?;
        self.counters.disk_reads.fetch_add(1, Ordering::Relaxed);
        Ok(buffer)
    }

    /// Writes every staged block to the file. Called with the allocation lock
    /// held so no block is read from a half-written state.
    ///
    /// A block leaves the buffer only once its write succeeded, so after a
    /// failure the remaining blocks stay staged and readable for a retry.
    fn write_staged(&self, allocation: &mut Allocation) -> MdResult<()> {
        if allocation.staged.is_empty() {
            return Ok(());
        }
        log::debug!(
            "Writing {} staged event blocks ({} bytes) to {:?}",
            allocation.staged.len(),
            allocation.staged_bytes,
            self.path
        );
        while let Some(entry) = allocation.staged.first_entry() {
            self.write_at(*entry.key(), entry.get())?;
            let bytes = entry.remove();
            allocation.staged_bytes -= bytes.len() as u64;
        }
        Ok(())
    }
}

impl FileBackend for FileEventStorage {
    fn evict(&self, leaf_id: BoxId, records: &[f64]) -> MdResult<FileOffset> {
        let payload = EventBlock::new(leaf_id, records.to_vec()).encode()?;
        let mut bytes = Vec::with_capacity(payload.len() + LEN_PREFIX as usize);
        bytes.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&payload);
        let len = bytes.len() as u64;

        let mut allocation = self.allocation.lock();
        let offset = allocation.allocate(len);
        allocation.lengths.insert(offset, len);
        allocation.staged_bytes += len;
        allocation.staged.insert(offset, bytes);

        if allocation.staged_bytes > self.buffer_capacity {
            if let Err(e) = self.write_staged(&mut allocation) {
                // The caller keeps its events on error, so an unwritten block
                // is dropped. A block already on disk is kept.
                let Some(staged) = allocation.staged.remove(&offset) else {
                    log::warn!("Flushing staged blocks after box {}: {}", leaf_id, e);
                    return Ok(offset);
                };
                allocation.staged_bytes -= staged.len() as u64;
                allocation.lengths.remove(&offset);
                allocation.free_range(offset, len);
                return Err(e);
            }
        }
        Ok(offset)
    }

    fn load(&self, leaf_id: BoxId, offset: FileOffset) -> MdResult<Vec<f64>> {
        let allocation = self.allocation.lock();
        let len = *allocation.lengths.get(&offset).ok_or_else(|| {
            MdError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("No event block at offset {} for box {}", offset, leaf_id),
            ))
        })?;

        let bytes = match allocation.staged.get(&offset) {
            Some(staged) => {
                self.counters.buffer_hits.fetch_add(1, Ordering::Relaxed);
                staged.clone()
            }
            None => self.read_at(offset, len)?,
        };
        drop(allocation);

        let payload = bytes.get(LEN_PREFIX as usize..).ok_or_else(|| {
            MdError::Serialization(format!("Truncated event block at offset {}", offset))
        })?;
        EventBlock::decode(payload)?.into_values(leaf_id)
    }

    fn release(&self, leaf_id: BoxId, offset: FileOffset) -> MdResult<()> {
        let mut allocation = self.allocation.lock();
        let len = allocation.lengths.remove(&offset).ok_or_else(|| {
            MdError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("Box {} released unknown block at offset {}", leaf_id, offset),
            ))
        })?;
        if let Some(staged) = allocation.staged.remove(&offset) {
            allocation.staged_bytes -= staged.len() as u64;
        }
        allocation.free_range(offset, len);
        Ok(())
    }

    fn buffer_used(&self) -> u64 {
        self.allocation.lock().staged_bytes
    }

    fn buffer_capacity(&self) -> u64 {
        self.buffer_capacity
    }

    fn flush(&self) -> MdResult<()> {
        let mut allocation = self.allocation.lock();
        self.write_staged(&mut allocation)?;
        self.file.write().sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileEventStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileEventStorage")
            .field("path", &self.path)
            .field("buffer_capacity", &self.buffer_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_storage_create() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("events.bin");
        let storage = FileEventStorage::create(&path).unwrap();
        assert!(path.exists());
        assert_eq!(storage.path(), path.as_path());
        assert_eq!(storage.buffer_capacity(), DEFAULT_WRITE_BUFFER_BYTES);
    }

    #[test]
    fn test_evict_and_load_from_buffer() {
        let dir = tempdir().unwrap();
        let storage = FileEventStorage::create(dir.path().join("events.bin")).unwrap();

        let offset = storage.evict(4, &[1.0, 2.0, 3.0]).unwrap();
        assert!(storage.buffer_used() > 0);
        assert_eq!(storage.load(4, offset).unwrap(), vec![1.0, 2.0, 3.0]);

        let stats = storage.stats();
        assert_eq!(stats.buffer_hits, 1);
        assert_eq!(stats.disk_reads, 0);
    }

    #[test]
    fn test_load_after_flush_reads_disk() {
        let dir = tempdir().unwrap();
        let storage = FileEventStorage::create(dir.path().join("events.bin")).unwrap();

        let a = storage.evict(1, &[1.0, 1.5]).unwrap();
        let b = storage.evict(2, &[2.0, 2.5, 3.0]).unwrap();
        storage.flush().unwrap();
        assert_eq!(storage.buffer_used(), 0);

        assert_eq!(storage.load(2, b).unwrap(), vec![2.0, 2.5, 3.0]);
        assert_eq!(storage.load(1, a).unwrap(), vec![1.0, 1.5]);
        assert_eq!(storage.stats().disk_reads, 2);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_flush_keeps_blocks_staged() {
        let storage = FileEventStorage::create("/dev/full").unwrap();
        let a = storage.evict(1, &[1.0, 2.0, 3.0, 4.0]).unwrap();
        let b = storage.evict(2, &[5.0]).unwrap();
        let staged = storage.buffer_used();

        let err = storage.flush().unwrap_err();
        assert!(err.is_backend_error());
        assert_eq!(storage.buffer_used(), staged);
        assert_eq!(storage.load(1, a).unwrap(), vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(storage.load(2, b).unwrap(), vec![5.0]);
        assert!(storage.flush().is_err());
        assert_eq!(storage.load(2, b).unwrap(), vec![5.0]);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_failed_write_through_rolls_back_block() {
        let storage = FileEventStorage::create_with_buffer_capacity("/dev/full", 0).unwrap();
        assert!(storage.evict(7, &[1.0, 2.0]).is_err());
        assert_eq!(storage.buffer_used(), 0);
        assert_eq!(storage.stats().file_length, 0);
    }

    #[test]
    fn test_zero_capacity_writes_through() {
        let dir = tempdir().unwrap();
        let storage =
            FileEventStorage::create_with_buffer_capacity(dir.path().join("events.bin"), 0)
                .unwrap();

        let offset = storage.evict(9, &[5.0]).unwrap();
        assert_eq!(storage.buffer_used(), 0);
        assert_eq!(storage.stats().disk_writes, 1);
        assert_eq!(storage.load(9, offset).unwrap(), vec![5.0]);
    }

    #[test]
    fn test_load_wrong_leaf_fails() {
        let dir = tempdir().unwrap();
        let storage = FileEventStorage::create(dir.path().join("events.bin")).unwrap();
        let offset = storage.evict(1, &[1.0]).unwrap();
        assert!(storage.load(2, offset).is_err());
    }

    #[test]
    fn test_load_unknown_offset_fails() {
        let dir = tempdir().unwrap();
        let storage = FileEventStorage::create(dir.path().join("events.bin")).unwrap();
        let err = storage.load(1, 12345).unwrap_err();
        assert!(matches!(err, MdError::BackendIo(_)));
    }

    #[test]
    fn test_released_space_is_reused() {
        let dir = tempdir().unwrap();
        let storage =
            FileEventStorage::create_with_buffer_capacity(dir.path().join("events.bin"), 0)
                .unwrap();

        let a = storage.evict(1, &[1.0; 16]).unwrap();
        let _b = storage.evict(2, &[2.0; 16]).unwrap();
        let length_before = storage.stats().file_length;

        storage.release(1, a).unwrap();
        assert_eq!(storage.stats().free_slots, 1);

        // A smaller block fits in the released slot.
        let c = storage.evict(3, &[3.0; 4]).unwrap();
        assert_eq!(c, a);
        assert_eq!(storage.stats().file_length, length_before);
        assert_eq!(storage.load(3, c).unwrap(), vec![3.0; 4]);
    }

    #[test]
    fn test_release_tail_shrinks_file() {
        let dir = tempdir().unwrap();
        let storage = FileEventStorage::create(dir.path().join("events.bin")).unwrap();

        let a = storage.evict(1, &[1.0]).unwrap();
        let b = storage.evict(2, &[2.0]).unwrap();
        storage.release(2, b).unwrap();
        storage.release(1, a).unwrap();

        let stats = storage.stats();
        assert_eq!(stats.file_length, 0);
        assert_eq!(stats.free_slots, 0);
        assert_eq!(storage.buffer_used(), 0);
    }

    #[test]
    fn test_release_twice_fails() {
        let dir = tempdir().unwrap();
        let storage = FileEventStorage::create(dir.path().join("events.bin")).unwrap();
        let a = storage.evict(1, &[1.0]).unwrap();
        storage.release(1, a).unwrap();
        assert!(storage.release(1, a).is_err());
    }
}
