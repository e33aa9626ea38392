//! On-disk encoding of update records.
//!
//! ```text
//! ┌──────┬──────┬────────────┬──────────────────────┬──────────┐
//! │ id   │ kind │ created_at │ payload (LZ4 JSON)   │ checksum │
//! └──────┴──────┴────────────┴──────────────────────┴──────────┘
//! ```
//!
//! The envelope is bincode-encoded. The payload is kept as JSON text
//! because `serde_json::Value` is self-describing and bincode is not.
//! A checksum mismatch or decode failure marks the stored bytes as a
//! malformed record; readers skip it and keep going.

use serde::{Deserialize, Serialize};

use super::StoreError;
use crate::protocol::{UpdateKind, UpdateRecord};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RecordEnvelope {
    id: u64,
    kind: UpdateKind,
    created_at: u64,
    payload: Vec<u8>,
    checksum: u32,
}

impl RecordEnvelope {
    fn compute_checksum(id: u64, kind: UpdateKind, created_at: u64, payload: &[u8]) -> u32 {
        // FNV-1a over all fields
        let mut hash: u32 = 0x811c_9dc5;
        let mut mix = |byte: u8| {
            hash ^= byte as u32;
            hash = hash.wrapping_mul(0x0100_0193);
        };
        id.to_le_bytes().into_iter().for_each(&mut mix);
        mix(kind as u8);
        created_at.to_le_bytes().into_iter().for_each(&mut mix);
        payload.iter().copied().for_each(&mut mix);
        hash
    }

    fn verify(&self) -> bool {
        self.checksum == Self::compute_checksum(self.id, self.kind, self.created_at, &self.payload)
    }
}

/// Encode a record for storage.
pub fn encode_record(record: &UpdateRecord) -> Result<Vec<u8>, StoreError> {
    let json = serde_json::to_vec(&record.payload)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    let payload = lz4_flex::compress_prepend_size(&json);
    let checksum =
        RecordEnvelope::compute_checksum(record.id, record.kind, record.created_at, &payload);
    let envelope = RecordEnvelope {
        id: record.id,
        kind: record.kind,
        created_at: record.created_at,
        payload,
        checksum,
    };
    bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
        .map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Decode stored bytes back into a record, verifying integrity.
pub fn decode_record(bytes: &[u8]) -> Result<UpdateRecord, StoreError> {
    let (envelope, _): (RecordEnvelope, _) =
        bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
    if !envelope.verify() {
        return Err(StoreError::ChecksumMismatch { id: envelope.id });
    }
    let json = lz4_flex::decompress_size_prepended(&envelope.payload)
        .map_err(|e| StoreError::Compression(e.to_string()))?;
    let payload =
        serde_json::from_slice(&json).map_err(|e| StoreError::Deserialization(e.to_string()))?;
    Ok(UpdateRecord {
        id: envelope.id,
        kind: envelope.kind,
        payload,
        created_at: envelope.created_at,
    })
}
