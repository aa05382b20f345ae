//! Variable-length integer packing for snapshot payloads
//!
//! First byte: `[extend:1][sign:1][bits:6]`, following bytes `[extend:1][bits:7]`.
//! Negative values are stored as their bitwise complement with the sign bit
//! set, so small magnitudes of either sign take one byte.

/// Errors from unpacking a compressed payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VarIntError {
    #[error("compressed payload truncated")]
    Truncated,
    #[error("variable-length integer longer than 5 bytes")]
    Overlong,
}

/// Upper bound on packed bytes for one word
pub const MAX_BYTES_PER_INT: usize = 5;

pub fn pack_int(out: &mut Vec<u8>, value: i32) {
    let sign = ((value >> 31) & 1) as u32;
    let mut rest = (value ^ (value >> 31)) as u32;

    let mut byte = ((sign << 6) | (rest & 0x3f)) as u8;
    rest >>= 6;
    while rest != 0 {
        out.push(byte | 0x80);
        byte = (rest & 0x7f) as u8;
        rest >>= 7;
    }
    out.push(byte);
}

/// Unpack one word, returning it and the number of bytes consumed
pub fn unpack_int(input: &[u8]) -> Result<(i32, usize), VarIntError> {
    let first = *input.first().ok_or(VarIntError::Truncated)?;
    let sign = (first >> 6) & 1;
    let mut value = (first & 0x3f) as u32;
    let mut used = 1;
    let mut shift = 6;
    let mut byte = first;

    while byte & 0x80 != 0 {
        if used == MAX_BYTES_PER_INT {
            return Err(VarIntError::Overlong);
        }
        byte = *input.get(used).ok_or(VarIntError::Truncated)?;
        value |= ((byte & 0x7f) as u32) << shift;
        shift += 7;
        used += 1;
    }

    let value = value as i32 ^ -(sign as i32);
    Ok((value, used))
}

pub fn compress(words: &[i32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(words.len() * 2);
    for &word in words {
        pack_int(&mut out, word);
    }
    out
}

pub fn decompress(mut bytes: &[u8]) -> Result<Vec<i32>, VarIntError> {
    let mut words = Vec::with_capacity(bytes.len());
    while !bytes.is_empty() {
        let (word, used) = unpack_int(bytes)?;
        words.push(word);
        bytes = &bytes[used..];
    }
    Ok(words)
}
