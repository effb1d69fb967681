//! Field-level helpers shared by the journal, catalog and transaction log codecs.
//!
//! Everything is big-endian via `bytes`, strings are length-prefixed UTF-8.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("codec error: {0}")]
pub struct CodecError(pub String);

pub(crate) fn put_str(buf: &mut BytesMut, value: &str) -> Result<(), CodecError> {
    let len = u16::try_from(value.len())
        .map_err(|_| CodecError(format!("string of {} bytes too long", value.len())))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

pub(crate) fn get_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    need(buf, 2, "string length")?;
    let len = buf.get_u16() as usize;
    need(buf, len, "string")?;
    let raw = buf.copy_to_bytes(len);
    String::from_utf8(raw.to_vec()).map_err(|_| CodecError("string is not valid UTF-8".into()))
}

pub(crate) fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) -> Result<(), CodecError> {
    match value {
        Some(v) => {
            buf.put_u8(1);
            put_str(buf, v)
        }
        None => {
            buf.put_u8(0);
            Ok(())
        }
    }
}

pub(crate) fn get_opt_str(buf: &mut &[u8]) -> Result<Option<String>, CodecError> {
    if get_flag(buf)? {
        Ok(Some(get_str(buf)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn put_opt_u64(buf: &mut BytesMut, value: Option<u64>) {
    match value {
        Some(v) => {
            buf.put_u8(1);
            buf.put_u64(v);
        }
        None => buf.put_u8(0),
    }
}

pub(crate) fn get_opt_u64(buf: &mut &[u8]) -> Result<Option<u64>, CodecError> {
    if get_flag(buf)? {
        Ok(Some(get_u64(buf)?))
    } else {
        Ok(None)
    }
}

pub(crate) fn get_flag(buf: &mut &[u8]) -> Result<bool, CodecError> {
    need(buf, 1, "flag")?;
    match buf.get_u8() {
        0 => Ok(false),
        1 => Ok(true),
        other => Err(CodecError(format!("invalid flag byte {other}"))),
    }
}

pub(crate) fn get_u8(buf: &mut &[u8]) -> Result<u8, CodecError> {
    need(buf, 1, "u8")?;
    Ok(buf.get_u8())
}

pub(crate) fn get_u16(buf: &mut &[u8]) -> Result<u16, CodecError> {
    need(buf, 2, "u16")?;
    Ok(buf.get_u16())
}

pub(crate) fn get_u32(buf: &mut &[u8]) -> Result<u32, CodecError> {
    need(buf, 4, "u32")?;
    Ok(buf.get_u32())
}

pub(crate) fn get_u64(buf: &mut &[u8]) -> Result<u64, CodecError> {
    need(buf, 8, "u64")?;
    Ok(buf.get_u64())
}

pub(crate) fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub(crate) fn get_uuid(buf: &mut &[u8]) -> Result<Uuid, CodecError> {
    need(buf, 16, "uuid")?;
    let mut raw = [0u8; 16];
    buf.copy_to_slice(&mut raw);
    Ok(Uuid::from_bytes(raw))
}

pub(crate) fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<(), CodecError> {
    let len = u32::try_from(data.len())
        .map_err(|_| CodecError(format!("blob of {} bytes too large", data.len())))?;
    buf.put_u32(len);
    buf.put_slice(data);
    Ok(())
}

pub(crate) fn get_blob(buf: &mut &[u8]) -> Result<Bytes, CodecError> {
    let len = get_u32(buf)? as usize;
    need(buf, len, "blob")?;
    Ok(buf.copy_to_bytes(len))
}

pub(crate) fn put_map(buf: &mut BytesMut, map: &BTreeMap<String, String>) -> Result<(), CodecError> {
    let count = u16::try_from(map.len())
        .map_err(|_| CodecError(format!("{} map entries is too many", map.len())))?;
    buf.put_u16(count);
    for (key, value) in map {
        put_str(buf, key)?;
        put_blob(buf, value.as_bytes())?;
    }
    Ok(())
}

pub(crate) fn get_map(buf: &mut &[u8]) -> Result<BTreeMap<String, String>, CodecError> {
    need(buf, 2, "map length")?;
    let count = buf.get_u16();
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key = get_str(buf)?;
        let value = get_blob(buf)?;
        let value = String::from_utf8(value.to_vec())
            .map_err(|_| CodecError(format!("value of {key} is not valid UTF-8")))?;
        map.insert(key, value);
    }
    Ok(map)
}

fn need(buf: &&[u8], len: usize, what: &str) -> Result<(), CodecError> {
    if buf.remaining() < len {
        return Err(CodecError(format!(
            "truncated while reading {what}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    Ok(())
}
