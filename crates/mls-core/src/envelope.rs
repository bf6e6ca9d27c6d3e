//! Padding envelope around application ciphertexts.
//!
//! Senders may pad ciphertexts to a bucket size to hide message lengths:
//! a 4-byte big-endian length prefix, the inner ciphertext, then zeros to
//! the bucket boundary. Receivers unwrap opportunistically: anything that
//! does not parse as a well-formed envelope is passed through unchanged,
//! because a raw MLS message can legitimately begin with any bytes.

const LENGTH_PREFIX: usize = 4;

/// Strip the padding envelope if `data` carries one; otherwise return
/// `data` as-is.
pub fn unwrap(data: &[u8]) -> &[u8] {
    let Some(prefix) = data.get(..LENGTH_PREFIX) else {
        return data;
    };
    let inner_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;

    let Some(end) = LENGTH_PREFIX.checked_add(inner_len) else {
        return data;
    };
    let Some(inner) = data.get(LENGTH_PREFIX..end) else {
        return data;
    };
    let trailer = &data[end..];
    if trailer.iter().all(|&b| b == 0) {
        inner
    } else {
        data
    }
}

/// Wrap `data` in a padding envelope of exactly `padded_size` bytes.
/// Returns `None` when the bucket cannot fit the prefix and payload.
pub fn wrap(data: &[u8], padded_size: usize) -> Option<Vec<u8>> {
    if padded_size < data.len() + LENGTH_PREFIX || data.len() > u32::MAX as usize {
        return None;
    }
    let mut out = Vec::with_capacity(padded_size);
    out.extend_from_slice(&(data.len() as u32).to_be_bytes());
    out.extend_from_slice(data);
    out.resize(padded_size, 0);
    Some(out)
}
