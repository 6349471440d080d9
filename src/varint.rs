//! Unsigned LEB128 varints: seven bits per byte, least significant
//! group first, high bit set on every byte except the last.

/// The most bytes a `u64` varint may occupy.
pub const MAX_LEN: usize = 10;

/// Returns the number of bytes that this varint will need
pub const fn size(int: u64) -> usize {
    let bits = 64 - (int | 1).leading_zeros() as usize;
    (bits + 6) / 7
}

/// Returns how many bytes the varint consumed while serializing
pub fn serialize_into(mut int: u64, buf: &mut [u8]) -> usize {
    let mut idx = 0;
    while int >= 0x80 {
        buf[idx] = (int as u8) | 0x80;
        int >>= 7;
        idx += 1;
    }
    buf[idx] = int as u8;
    idx + 1
}

/// Appends the varint to the end of `buf`.
pub fn push(int: u64, buf: &mut Vec<u8>) {
    let mut scratch = [0; MAX_LEN];
    let sz = serialize_into(int, &mut scratch);
    buf.extend_from_slice(&scratch[..sz]);
}

/// Returns the deserialized varint, along with how many bytes
/// were taken up by the varint.
///
/// Fails on an empty or truncated buffer, on encodings that
/// would overflow a `u64`, and on non-minimal encodings whose
/// last byte carries no bits.
pub fn deserialize(buf: &[u8]) -> crate::Result<(u64, usize)> {
    let mut ret: u64 = 0;
    for (idx, byte) in buf.iter().take(MAX_LEN).enumerate() {
        let group = u64::from(byte & 0x7F);
        if idx == MAX_LEN - 1 && *byte > 1 {
            return Err(crate::Error::corruption(idx, "varint"));
        }
        ret |= group << (7 * idx);
        if byte & 0x80 == 0 {
            if *byte == 0 && idx > 0 {
                return Err(crate::Error::corruption(idx, "varint"));
            }
            return Ok((ret, idx + 1));
        }
    }
    Err(crate::Error::corruption(buf.len().min(MAX_LEN), "varint"))
}
