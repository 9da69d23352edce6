//! The pluggable paging interface and the block format used by the bundled
//! file storage.
//!
//! The tree only ever talks to a backend from leaf boxes, passing the leaf's
//! events as flattened `f64` records. The returned offset is an opaque handle:
//! nothing outside the backend interprets it.

use serde::{Deserialize, Serialize};

use crate::errors::{MdError, MdResult};

/// Identifier of a box, unique within one tree.
pub type BoxId = u64;

/// Opaque handle returned by [`FileBackend::evict`].
pub type FileOffset = u64;

/// Storage for the events of evicted leaves.
///
/// Implementations must be internally synchronized: split and refresh tasks
/// call into the backend from several worker threads at once.
pub trait FileBackend: Send + Sync {
    /// Stores the complete event records of a leaf and returns a handle to them.
    fn evict(&self, leaf_id: BoxId, records: &[f64]) -> MdResult<FileOffset>;

    /// Reads back the records stored by `evict` under `offset`.
    fn load(&self, leaf_id: BoxId, offset: FileOffset) -> MdResult<Vec<f64>>;

    /// Frees the block at `offset`; the handle is invalid afterwards.
    fn release(&self, leaf_id: BoxId, offset: FileOffset) -> MdResult<()>;

    /// Bytes currently staged in the write buffer.
    fn buffer_used(&self) -> u64;

    /// Write buffer size at which staged blocks are written out.
    fn buffer_capacity(&self) -> u64;

    /// Writes all staged blocks and syncs the underlying storage.
    fn flush(&self) -> MdResult<()>;
}

/// One leaf's events as stored on disk, wrapped with a CRC32 checksum.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBlock {
    pub leaf_id: BoxId,
    pub checksum: u32,
    pub values: Vec<f64>,
}

impl EventBlock {
    pub fn new(leaf_id: BoxId, values: Vec<f64>) -> Self {
        let checksum = Self::calculate_checksum(leaf_id, &values);
        Self {
            leaf_id,
            checksum,
            values,
        }
    }

    pub fn calculate_checksum(leaf_id: BoxId, values: &[f64]) -> u32 {
        let mut bytes = Vec::with_capacity(8 + values.len() * 8);
        bytes.extend_from_slice(&leaf_id.to_le_bytes());
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        crc32(&bytes)
    }

    pub fn encode(&self) -> MdResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::legacy())
            .map_err(|e| MdError::Serialization(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> MdResult<Self> {
        bincode::serde::decode_from_slice(bytes, bincode::config::legacy())
            .map(|(block, _)| block)
            .map_err(|e| MdError::Serialization(e.to_string()))
    }

    /// Verifies owner and checksum and returns the records.
    pub fn into_values(self, expected_leaf: BoxId) -> MdResult<Vec<f64>> {
        if self.leaf_id != expected_leaf {
            return Err(MdError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "Event block belongs to box {} (expected {})",
                    self.leaf_id, expected_leaf
                ),
            )));
        }
        let expected = Self::calculate_checksum(self.leaf_id, &self.values);
        if self.checksum != expected {
            return Err(MdError::BackendIo(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!(
                    "Event block checksum mismatch - possible corruption (expected: {:x}, got: {:x})",
                    expected, self.checksum
                ),
            )));
        }
        Ok(self.values)
    }
}

/// CRC32 over the MPEG-2 polynomial with inverted output, i.e. CRC-32/BZIP2.
fn crc32(data: &[u8]) -> u32 {
    let mut crc: u32 = 0xFFFFFFFF;
    const POLY: u32 = 0x04C11DB7;

    for &byte in data {
        crc ^= (byte as u32) << 24;
        for _ in 0..8 {
            crc = if crc & 0x80000000 != 0 {
                (crc << 1) ^ POLY
            } else {
                crc << 1
            };
        }
    }

    crc ^ 0xFFFFFFFF
}
