//! Wire Codec
//!
//! Binary encodings for the two payloads the replication core exchanges:
//! single mutations (broadcast) and full-state snapshots (state transfer).
//!
//! Snapshots are framed as `MAGIC | version (u32 LE) | bincode body`. Entries are
//! sorted by key before encoding so equal maps produce identical bytes. Decoding
//! is all-or-nothing: any defect yields a `DecodeError` and no partial mapping.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use thiserror::Error;

use super::types::{MutationMessage, Snapshot};
use crate::error::DecodeError;

/// Leading bytes of every snapshot.
pub const SNAPSHOT_MAGIC: [u8; 4] = *b"RMAP";
/// Current snapshot layout version.
pub const SNAPSHOT_VERSION: u32 = 1;
/// Upper bound accepted when decoding any payload.
pub const MAX_PAYLOAD_BYTES: u64 = 64 * 1024 * 1024;

/// Number of `MutationMessage` variants this build understands.
const MUTATION_VARIANTS: u32 = 2;
const HEADER_LEN: usize = SNAPSHOT_MAGIC.len() + 4;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to encode payload: {0}")]
pub struct EncodeError(pub String);

impl From<bincode::Error> for EncodeError {
    fn from(e: bincode::Error) -> Self {
        EncodeError(e.to_string())
    }
}

#[derive(Serialize)]
struct SnapshotBody<'a> {
    entries: Vec<(&'a str, i32)>,
}

#[derive(Deserialize)]
struct OwnedSnapshotBody {
    entries: Vec<(String, i32)>,
}

fn wire() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(MAX_PAYLOAD_BYTES)
        .reject_trailing_bytes()
}

pub fn encode_mutation(message: &MutationMessage) -> Result<Vec<u8>, EncodeError> {
    Ok(wire().serialize(message)?)
}

/// Decodes one broadcast mutation.
///
/// The variant tag is the leading little-endian `u32`; tags from newer peers
/// are reported as `UnknownVariant` so callers can ignore them.
pub fn decode_mutation(bytes: &[u8]) -> Result<MutationMessage, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if let Some(tag) = bytes.get(..4) {
        let tag = u32::from_le_bytes([tag[0], tag[1], tag[2], tag[3]]);
        if tag >= MUTATION_VARIANTS {
            return Err(DecodeError::UnknownVariant(tag));
        }
    }
    Ok(wire().deserialize(bytes)?)
}

pub fn encode_snapshot<'a, I>(entries: I) -> Result<Snapshot, EncodeError>
where
    I: IntoIterator<Item = (&'a String, &'a i32)>,
{
    let mut entries: Vec<(&str, i32)> = entries
        .into_iter()
        .map(|(key, value)| (key.as_str(), *value))
        .collect();
    entries.sort_unstable_by(|a, b| a.0.cmp(b.0));

    let body = wire().serialize(&SnapshotBody { entries })?;

    let mut bytes = Vec::with_capacity(HEADER_LEN + body.len());
    bytes.extend_from_slice(&SNAPSHOT_MAGIC);
    bytes.extend_from_slice(&SNAPSHOT_VERSION.to_le_bytes());
    bytes.extend_from_slice(&body);
    Ok(Snapshot::from_bytes(bytes))
}

pub fn decode_snapshot(snapshot: &Snapshot) -> Result<HashMap<String, i32>, DecodeError> {
    let bytes = snapshot.as_bytes();
    if bytes.is_empty() {
        return Err(DecodeError::Empty);
    }
    if bytes.len() < HEADER_LEN || bytes[..SNAPSHOT_MAGIC.len()] != SNAPSHOT_MAGIC {
        return Err(DecodeError::Malformed("missing snapshot header".to_string()));
    }

    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != SNAPSHOT_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let body: OwnedSnapshotBody = wire().deserialize(&bytes[HEADER_LEN..])?;

    let mut map = HashMap::with_capacity(body.entries.len());
    for (key, value) in body.entries {
        match map.entry(key) {
            MapEntry::Vacant(slot) => {
                slot.insert(value);
            }
            MapEntry::Occupied(slot) => {
                return Err(DecodeError::DuplicateKey(slot.key().clone()));
            }
        }
    }
    Ok(map)
}
