//! Segment record encoding and decoding
//!
//! The log-structured backend appends one record per committed batch.
//!
//! ## Record Format
//!
//! ```text
//! [length: u32][type: u8][payload: bytes][crc32: u32]
//! ```
//!
//! - **length**: size of type + payload + crc (not including length itself)
//! - **type**: record type tag (1=Batch, 2=Clear)
//! - **payload**: bincode-serialized mutations (empty for Clear)
//! - **crc32**: CRC32 over \[type\]\[payload\]
//!
//! A record that fails to decode at the tail of a segment is a torn write
//! from a crash and is discarded on replay.

use crate::kv::Mutation;
use byteorder::{ByteOrder, LittleEndian};
use chainstore_core::error::{Error, Result};
use crc32fast::Hasher;

const TYPE_BATCH: u8 = 1;
const TYPE_CLEAR: u8 = 2;

/// Minimum valid record: type(1) + crc(4)
const MIN_RECORD_LEN: usize = 5;

/// One committed unit of the segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentRecord {
    /// Mutations applied atomically
    Batch(Vec<Mutation>),
    /// Every key removed
    Clear,
}

/// Why a record could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeFailure {
    /// Buffer ends before the record does
    Incomplete {
        /// Bytes available
        have: usize,
        /// Bytes required
        needed: usize,
    },
    /// Record is complete but invalid
    Corrupt(String),
}

/// Encode a record to bytes ready for appending.
pub fn encode_record(record: &SegmentRecord) -> Result<Vec<u8>> {
    let (type_tag, payload) = match record {
        SegmentRecord::Batch(mutations) => (TYPE_BATCH, bincode::serialize(mutations)?),
        SegmentRecord::Clear => (TYPE_CLEAR, Vec::new()),
    };

    let total_len = 1 + payload.len() + 4;
    let total_len_u32 = u32::try_from(total_len)
        .map_err(|_| Error::Storage(format!("segment record of {} bytes is too large", total_len)))?;

    let mut buf = vec![0u8; 4 + total_len];
    LittleEndian::write_u32(&mut buf[0..4], total_len_u32);
    buf[4] = type_tag;
    buf[5..5 + payload.len()].copy_from_slice(&payload);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(&payload);
    LittleEndian::write_u32(&mut buf[5 + payload.len()..], hasher.finalize());

    Ok(buf)
}

/// Decode one record from the front of `buf`.
///
/// Returns the record and the number of bytes consumed.
pub fn decode_record(buf: &[u8]) -> std::result::Result<(SegmentRecord, usize), DecodeFailure> {
    if buf.len() < 4 {
        return Err(DecodeFailure::Incomplete {
            have: buf.len(),
            needed: 4,
        });
    }
    let total_len = LittleEndian::read_u32(&buf[0..4]) as usize;
    if total_len < MIN_RECORD_LEN {
        return Err(DecodeFailure::Corrupt(format!(
            "invalid record length {}",
            total_len
        )));
    }
    if buf.len() < 4 + total_len {
        return Err(DecodeFailure::Incomplete {
            have: buf.len(),
            needed: 4 + total_len,
        });
    }

    let type_tag = buf[4];
    let payload = &buf[5..4 + total_len - 4];
    let stored_crc = LittleEndian::read_u32(&buf[4 + total_len - 4..4 + total_len]);

    let mut hasher = Hasher::new();
    hasher.update(&[type_tag]);
    hasher.update(payload);
    let computed_crc = hasher.finalize();
    if computed_crc != stored_crc {
        return Err(DecodeFailure::Corrupt(format!(
            "CRC mismatch: expected {:#010x}, got {:#010x}",
            stored_crc, computed_crc
        )));
    }

    let record = match type_tag {
        TYPE_BATCH => SegmentRecord::Batch(
            bincode::deserialize(payload).map_err(|e| DecodeFailure::Corrupt(e.to_string()))?,
        ),
        TYPE_CLEAR => SegmentRecord::Clear,
        other => {
            return Err(DecodeFailure::Corrupt(format!(
                "unknown record type {}",
                other
            )))
        }
    };

    Ok((record, 4 + total_len))
}

/// Decode every record in a segment.
///
/// Returns the records and the length of the valid prefix; bytes past it are
/// a torn or corrupt tail.
pub fn decode_segment(buf: &[u8]) -> (Vec<SegmentRecord>, usize, Option<DecodeFailure>) {
    let mut records = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        match decode_record(&buf[offset..]) {
            Ok((record, consumed)) => {
                records.push(record);
                offset += consumed;
            }
            Err(failure) => return (records, offset, Some(failure)),
        }
    }
    (records, offset, None)
}
