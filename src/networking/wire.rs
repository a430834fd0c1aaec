//! Primitive field readers and writers shared by every payload type.
//!
//! Readers take `&mut &[u8]` and advance it; running out of bytes is a
//! `Truncated` error rather than a panic.

use bytes::{Buf, BufMut};

use crate::{Error, Result};

fn ensure(buf: &&[u8], needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(Error::Truncated {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16_le(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16_le())
}

pub fn read_u16_be(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_u32_le(buf: &mut &[u8]) -> Result<u32> {
    ensure(buf, 4)?;
    Ok(buf.get_u32_le())
}

pub fn read_i32_le(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    Ok(buf.get_i32_le())
}

pub fn read_u64_le(buf: &mut &[u8]) -> Result<u64> {
    ensure(buf, 8)?;
    Ok(buf.get_u64_le())
}

pub fn read_i64_le(buf: &mut &[u8]) -> Result<i64> {
    ensure(buf, 8)?;
    Ok(buf.get_i64_le())
}

pub fn read_bytes(buf: &mut &[u8], len: usize) -> Result<Vec<u8>> {
    ensure(buf, len)?;
    let out = buf[..len].to_vec();
    buf.advance(len);
    Ok(out)
}

pub fn read_array<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

/// Size of the compact-size encoding of `value`: 1, 3, 5 or 9 bytes.
pub fn compact_size_len(value: u64) -> usize {
    match value {
        0..=252 => 1,
        253..=0xffff => 3,
        0x1_0000..=0xffff_ffff => 5,
        _ => 9,
    }
}

pub fn write_compact_size(out: &mut Vec<u8>, value: u64) {
    match value {
        0..=252 => out.put_u8(value as u8),
        253..=0xffff => {
            out.put_u8(253);
            out.put_u16_le(value as u16);
        }
        0x1_0000..=0xffff_ffff => {
            out.put_u8(254);
            out.put_u32_le(value as u32);
        }
        _ => {
            out.put_u8(255);
            out.put_u64_le(value);
        }
    }
}

pub fn read_compact_size(buf: &mut &[u8]) -> Result<u64> {
    match read_u8(buf)? {
        253 => Ok(read_u16_le(buf)? as u64),
        254 => Ok(read_u32_le(buf)? as u64),
        255 => read_u64_le(buf),
        small => Ok(small as u64),
    }
}

/// NUL-terminated string.
pub fn write_nt_string(out: &mut Vec<u8>, value: &str) {
    out.put_slice(value.as_bytes());
    out.put_u8(0);
}

pub fn read_nt_string(buf: &mut &[u8]) -> Result<String> {
    let end = buf.iter().position(|b| *b == 0).ok_or(Error::Truncated {
        needed: buf.len() + 1,
        available: buf.len(),
    })?;
    let value = String::from_utf8_lossy(&buf[..end]).into_owned();
    buf.advance(end + 1);
    Ok(value)
}

/// Compact-size prefixed string.
pub fn write_var_string(out: &mut Vec<u8>, value: &str) {
    write_compact_size(out, value.len() as u64);
    out.put_slice(value.as_bytes());
}

pub fn read_var_string(buf: &mut &[u8]) -> Result<String> {
    let len = read_compact_size(buf)? as usize;
    let bytes = read_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|err| Error::Malformed(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compact_size_boundaries_test() {
        for (value, len, marker) in [
            (252u64, 1usize, 252u8),
            (253, 3, 253),
            (65535, 3, 253),
            (65536, 5, 254),
        ] {
            let mut out = vec![];
            write_compact_size(&mut out, value);
            assert_eq!(out.len(), len);
            assert_eq!(compact_size_len(value), len);
            assert_eq!(out[0], marker);
            assert_eq!(read_compact_size(&mut out.as_slice()).unwrap(), value);
        }
    }

    #[test]
    fn nt_string_test() {
        let mut out = vec![];
        write_nt_string(&mut out, "BLOCK");
        write_nt_string(&mut out, "");
        out.push(7);

        let mut buf = out.as_slice();
        assert_eq!(read_nt_string(&mut buf).unwrap(), "BLOCK");
        assert_eq!(read_nt_string(&mut buf).unwrap(), "");
        assert_eq!(buf, &[7]);
        assert!(matches!(
            read_nt_string(&mut buf),
            Err(Error::Truncated { .. })
        ));
    }

    #[test]
    fn truncated_reads_test() {
        let mut buf: &[u8] = &[1, 2, 3];
        assert!(read_u32_le(&mut buf).is_err());
        assert_eq!(read_u16_le(&mut buf).unwrap(), 0x0201);
        assert!(read_array::<2>(&mut buf).is_err());
    }
}
