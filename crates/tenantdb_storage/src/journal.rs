//! Journal record format.
//!
//! Every committed write transaction becomes exactly one record:
//!
//! ```text
//! ┌────────┬─────────┬────────┬──────────────────┬────────┐
//! │ "TJNL" │ version │ length │ CBOR payload     │ crc32  │
//! │ 4 B    │ u16 LE  │ u32 LE │ `length` bytes   │ u32 LE │
//! └────────┴─────────┴────────┴──────────────────┴────────┘
//! ```
//!
//! The checksum covers everything before it. Replay stops at the first
//! record that is short or fails validation; that tail is what a crash
//! during a durability write leaves behind.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};

/// Magic bytes opening every record.
pub const JOURNAL_MAGIC: [u8; 4] = *b"TJNL";

/// Current record format version.
pub const JOURNAL_VERSION: u16 = 1;

/// magic (4) + version (2) + length (4)
const HEADER_SIZE: usize = 10;

const CRC_SIZE: usize = 4;

/// One key written (or removed) by a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalWrite {
    /// Table the key belongs to.
    pub table: String,
    /// Key within the table.
    pub key: String,
    /// New value; `None` removes the key.
    pub value: Option<Vec<u8>>,
}

/// The payload of one journal record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    /// Generation the transaction committed as.
    pub generation: u64,
    /// Writes in key order.
    pub writes: Vec<JournalWrite>,
}

impl JournalRecord {
    /// Encodes the record with its envelope.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Encode`] if serialization fails or the
    /// payload does not fit the 4-byte length field.
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut payload = Vec::new();
        ciborium::into_writer(self, &mut payload)
            .map_err(|e| StorageError::Encode(e.to_string()))?;
        let len = u32::try_from(payload.len())
            .map_err(|_| StorageError::Encode("record payload exceeds 4 GiB".into()))?;

        let mut data = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        data.extend_from_slice(&JOURNAL_MAGIC);
        data.extend_from_slice(&JOURNAL_VERSION.to_le_bytes());
        data.extend_from_slice(&len.to_le_bytes());
        data.extend_from_slice(&payload);
        let crc = compute_crc32(&data);
        data.extend_from_slice(&crc.to_le_bytes());
        Ok(data)
    }

    /// Reads the record starting at `offset`.
    ///
    /// Returns `Ok(None)` when `offset` is exactly the end of the journal,
    /// otherwise the record and the offset of the next one.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Corrupted`] for a torn or invalid record.
    pub fn read_at(
        backend: &dyn StorageBackend,
        offset: u64,
    ) -> StorageResult<Option<(Self, u64)>> {
        let size = backend.size()?;
        if offset == size {
            return Ok(None);
        }
        if offset > size {
            return Err(StorageError::corrupted(offset, "offset beyond journal end"));
        }
        if size - offset < (HEADER_SIZE + CRC_SIZE) as u64 {
            return Err(StorageError::corrupted(offset, "truncated record header"));
        }

        let header = backend.read_at(offset, HEADER_SIZE)?;
        if header[0..4] != JOURNAL_MAGIC {
            return Err(StorageError::corrupted(offset, "bad magic"));
        }
        let version = u16::from_le_bytes([header[4], header[5]]);
        if version != JOURNAL_VERSION {
            return Err(StorageError::corrupted(
                offset,
                format!("unsupported record version {version}"),
            ));
        }
        let len = u32::from_le_bytes([header[6], header[7], header[8], header[9]]) as usize;

        let total = (HEADER_SIZE + len + CRC_SIZE) as u64;
        if size - offset < total {
            return Err(StorageError::corrupted(offset, "truncated record body"));
        }

        let body = backend.read_at(offset, HEADER_SIZE + len + CRC_SIZE)?;
        let (covered, crc_bytes) = body.split_at(HEADER_SIZE + len);
        let expected = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
        let actual = compute_crc32(covered);
        if expected != actual {
            return Err(StorageError::corrupted(
                offset,
                format!("checksum mismatch: expected {expected:08x}, got {actual:08x}"),
            ));
        }

        let record: Self = ciborium::from_reader(&covered[HEADER_SIZE..])
            .map_err(|e| StorageError::corrupted(offset, e.to_string()))?;
        Ok(Some((record, offset + total)))
    }
}

/// Result of scanning a journal from the start.
#[derive(Debug, Default)]
pub struct JournalScan {
    /// Every valid record, in order.
    pub records: Vec<JournalRecord>,
    /// Offset just past the last valid record.
    pub valid_len: u64,
    /// Whether invalid bytes followed the last valid record.
    pub torn_tail: bool,
}

/// Reads every valid record, stopping at the first invalid one.
///
/// # Errors
///
/// Only I/O errors are returned; corruption ends the scan instead.
pub fn scan(backend: &dyn StorageBackend) -> StorageResult<JournalScan> {
    let mut scan = JournalScan::default();
    loop {
        match JournalRecord::read_at(backend, scan.valid_len) {
            Ok(Some((record, next))) => {
                scan.records.push(record);
                scan.valid_len = next;
            }
            Ok(None) => return Ok(scan),
            Err(StorageError::Corrupted { offset, message }) => {
                tracing::warn!(offset, %message, "journal tail is invalid, stopping replay");
                scan.torn_tail = true;
                return Ok(scan);
            }
            Err(e) => return Err(e),
        }
    }
}

/// CRC-32 (IEEE).
pub fn compute_crc32(data: &[u8]) -> u32 {
    const TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                crc = if crc & 1 != 0 {
                    (crc >> 1) ^ 0xEDB8_8320
                } else {
                    crc >> 1
                };
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    !data.iter().fold(0xFFFF_FFFF_u32, |crc, &byte| {
        (crc >> 8) ^ TABLE[((crc ^ u32::from(byte)) & 0xFF) as usize]
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBackend;
    use proptest::prelude::*;

    fn record(generation: u64) -> JournalRecord {
        JournalRecord {
            generation,
            writes: vec![
                JournalWrite {
                    table: "docs".into(),
                    key: format!("users/{generation}"),
                    value: Some(vec![1, 2, 3]),
                },
                JournalWrite {
                    table: "docs".into(),
                    key: "users/0".into(),
                    value: None,
                },
            ],
        }
    }

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn scan_reads_records_in_order() {
        let mut backend = InMemoryBackend::new();
        for generation in 1..=3 {
            backend.append(&record(generation).encode().unwrap()).unwrap();
        }

        let scan = scan(&backend).unwrap();
        assert_eq!(scan.records.len(), 3);
        assert_eq!(scan.records[2], record(3));
        assert_eq!(scan.valid_len, backend.size().unwrap());
        assert!(!scan.torn_tail);
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let mut backend = InMemoryBackend::new();
        backend.append(&record(1).encode().unwrap()).unwrap();
        let good = backend.size().unwrap();
        let second = record(2).encode().unwrap();
        backend.append(&second[..second.len() - 3]).unwrap();

        let scan = scan(&backend).unwrap();
        assert_eq!(scan.records.len(), 1);
        assert_eq!(scan.valid_len, good);
        assert!(scan.torn_tail);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut bytes = record(7).encode().unwrap();
        bytes[HEADER_SIZE + 2] ^= 0xFF;
        let backend = InMemoryBackend::with_data(bytes);

        assert!(matches!(
            JournalRecord::read_at(&backend, 0),
            Err(StorageError::Corrupted { offset: 0, .. })
        ));
    }

    proptest! {
        #[test]
        fn any_truncation_is_detected(cut in 1usize..40) {
            let bytes = record(9).encode().unwrap();
            let cut = cut.min(bytes.len() - 1);
            let backend = InMemoryBackend::with_data(bytes[..bytes.len() - cut].to_vec());
            let scan = scan(&backend).unwrap();
            prop_assert!(scan.records.is_empty());
            prop_assert!(scan.torn_tail);
        }
    }
}
