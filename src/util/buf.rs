use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};

pub fn put_string(buf: &mut impl BufMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

pub fn try_get_string(buf: &mut impl Buf) -> anyhow::Result<String> {
    let raw = try_get_bytes(buf)?;
    Ok(String::from_utf8(raw)?)
}

/// length-prefixed byte sequence, the length written as a varint
pub fn put_bytes(buf: &mut impl BufMut, bytes: &[u8]) {
    buf.put_usize_varint(bytes.len());
    buf.put_slice(bytes);
}

pub fn try_get_bytes(buf: &mut impl Buf) -> anyhow::Result<Vec<u8>> {
    let len = buf.try_get_usize_varint()
        .map_err(|e| anyhow!("invalid length prefix: {:?}", e))?;
    if buf.remaining() < len {
        bail!("buffer underflow: expected {} bytes, {} remaining", len, buf.remaining());
    }
    let mut result = vec![0u8; len];
    buf.copy_to_slice(&mut result);
    Ok(result)
}

pub fn try_get_array<const N: usize>(buf: &mut impl Buf) -> anyhow::Result<[u8; N]> {
    if buf.remaining() < N {
        bail!("buffer underflow: expected {} bytes, {} remaining", N, buf.remaining());
    }
    let mut result = [0u8; N];
    buf.copy_to_slice(&mut result);
    Ok(result)
}
