//! Bit-exact conversion between numeric slices and storage bytes, plus
//! the per-point key scheme.
//!
//! Floats and words are stored as little-endian streams with no framing;
//! the reader derives the element count from the byte length. Point keys
//! are a one-byte tag followed by the id in big-endian, so all keys of a
//! tag sort contiguously and in id order.

/// Key tag for a point's raw float vector.
pub const VECTOR_TAG: u8 = b'v';
/// Key tag for a point's quantized code.
pub const CODE_TAG: u8 = b'q';

/// Encode a float slice as little-endian IEEE-754 bytes.
#[must_use]
pub fn floats_to_bytes(values: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 4);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian IEEE-754 byte stream. Trailing bytes that do
/// not form a full float are ignored.
#[must_use]
pub fn bytes_to_floats(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Encode a word slice as little-endian bytes.
#[must_use]
pub fn words_to_bytes(values: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(values.len() * 8);
    for value in values {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Decode a little-endian word stream. Trailing bytes that do not form a
/// full word are ignored.
#[must_use]
pub fn bytes_to_words(bytes: &[u8]) -> Vec<u64> {
    bytes
        .chunks_exact(8)
        .map(|chunk| {
            u64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ])
        })
        .collect()
}

/// Build the storage key for a point id under the given tag.
#[must_use]
pub fn node_key(id: u64, tag: u8) -> [u8; 9] {
    let mut key = [0u8; 9];
    key[0] = tag;
    key[1..].copy_from_slice(&id.to_be_bytes());
    key
}

/// Recover a point id from a storage key, if the key carries `tag`.
#[must_use]
pub fn node_id_from_key(key: &[u8], tag: u8) -> Option<u64> {
    if key.len() != 9 || key[0] != tag {
        return None;
    }
    let id_bytes: [u8; 8] = key[1..9].try_into().ok()?;
    Some(u64::from_be_bytes(id_bytes))
}
