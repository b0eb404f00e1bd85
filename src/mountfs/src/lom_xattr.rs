use crate::XATTR_LOM;
use ostore_lib::{Checksum, ChecksumType, StoreError, StoreResult};
use std::path::Path;
use xxhash_rust::xxh64::xxh64;

const LOM_META_MAGIC: &[u8; 4] = b"OSLM";
const LOM_META_VERSION: u8 = 1;
const LOM_META_CKSUM_LEN: u8 = 8;

/// The fields of the per-object metadata record persisted in one extended
/// attribute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LomXattr {
    pub cksum: Option<Checksum>,
    pub version: Option<String>,
    pub copy_fqn: Vec<String>,
}

fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u16).to_be_bytes());
    out.extend_from_slice(field);
}

fn take_field<'a>(buf: &mut &'a [u8]) -> StoreResult<&'a [u8]> {
    if buf.len() < 2 {
        return Err(StoreError::CorruptedMeta("truncated field length".to_string()));
    }
    let len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + len {
        return Err(StoreError::CorruptedMeta("truncated field".to_string()));
    }
    let field = &buf[2..2 + len];
    *buf = &buf[2 + len..];
    Ok(field)
}

fn take_str(buf: &mut &[u8]) -> StoreResult<String> {
    let field = take_field(buf)?;
    String::from_utf8(field.to_vec())
        .map_err(|_| StoreError::CorruptedMeta("field is not utf-8".to_string()))
}

/// Marshals the record: magic, format version, metadata-checksum prefix,
/// then length-prefixed fields. The checksum covers everything after
/// itself, so torn writes and bit flips are detected on load.
pub fn encode_lom_xattr(meta: &LomXattr) -> Vec<u8> {
    let mut payload = Vec::with_capacity(64);
    let (cksum_type, cksum_value) = match &meta.cksum {
        Some(c) => (c.ty.as_str(), c.value.as_str()),
        None => ("", ""),
    };
    put_field(&mut payload, cksum_type.as_bytes());
    put_field(&mut payload, cksum_value.as_bytes());
    put_field(&mut payload, meta.version.as_deref().unwrap_or("").as_bytes());
    payload.extend_from_slice(&(meta.copy_fqn.len() as u16).to_be_bytes());
    for fqn in &meta.copy_fqn {
        put_field(&mut payload, fqn.as_bytes());
    }

    let digest = xxh64(&payload, 0);
    let mut out = Vec::with_capacity(6 + 8 + payload.len());
    out.extend_from_slice(LOM_META_MAGIC);
    out.push(LOM_META_VERSION);
    out.push(LOM_META_CKSUM_LEN);
    out.extend_from_slice(&digest.to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

pub fn decode_lom_xattr(buf: &[u8]) -> StoreResult<LomXattr> {
    if buf.len() < 6 + LOM_META_CKSUM_LEN as usize {
        return Err(StoreError::CorruptedMeta("metadata record too short".to_string()));
    }
    if &buf[..4] != LOM_META_MAGIC {
        return Err(StoreError::CorruptedMeta("bad metadata magic".to_string()));
    }
    if buf[4] != LOM_META_VERSION {
        return Err(StoreError::CorruptedMeta(format!(
            "unsupported metadata version {}",
            buf[4]
        )));
    }
    if buf[5] != LOM_META_CKSUM_LEN {
        return Err(StoreError::CorruptedMeta(format!(
            "unexpected metadata checksum length {}",
            buf[5]
        )));
    }
    let stored = u64::from_be_bytes(buf[6..14].try_into().unwrap());
    let payload = &buf[14..];
    if xxh64(payload, 0) != stored {
        return Err(StoreError::CorruptedMeta(
            "metadata checksum mismatch".to_string(),
        ));
    }

    let mut rest = payload;
    let cksum_type = take_str(&mut rest)?;
    let cksum_value = take_str(&mut rest)?;
    let version = take_str(&mut rest)?;
    if rest.len() < 2 {
        return Err(StoreError::CorruptedMeta("truncated copy count".to_string()));
    }
    let count = u16::from_be_bytes([rest[0], rest[1]]) as usize;
    rest = &rest[2..];
    let mut copy_fqn = Vec::with_capacity(count);
    for _ in 0..count {
        copy_fqn.push(take_str(&mut rest)?);
    }

    let cksum = if cksum_type.is_empty() {
        None
    } else {
        let ty = ChecksumType::parse(&cksum_type)
            .map_err(|e| StoreError::CorruptedMeta(e.to_string()))?;
        Some(Checksum::new(ty, cksum_value))
    };
    Ok(LomXattr {
        cksum,
        version: if version.is_empty() { None } else { Some(version) },
        copy_fqn,
    })
}

pub fn read_lom_xattr(fqn: &str) -> StoreResult<LomXattr> {
    let raw = xattr::get(Path::new(fqn), XATTR_LOM)
        .map_err(|e| StoreError::Io(format!("getxattr {}: {}", fqn, e)))?
        .ok_or_else(|| StoreError::NotFound(format!("{} has no metadata record", fqn)))?;
    decode_lom_xattr(&raw)
}

pub fn write_lom_xattr(fqn: &str, meta: &LomXattr) -> StoreResult<()> {
    let raw = encode_lom_xattr(meta);
    xattr::set(Path::new(fqn), XATTR_LOM, &raw)
        .map_err(|e| StoreError::Io(format!("setxattr {}: {}", fqn, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> LomXattr {
        LomXattr {
            cksum: Some(Checksum::new(ChecksumType::XXHash, "deadbeefdeadbeef")),
            version: Some("3".to_string()),
            copy_fqn: vec!["/mp2/obj/local/B/a".to_string(), "/mp3/obj/local/B/a".to_string()],
        }
    }

    #[test]
    fn test_roundtrip() {
        let meta = sample();
        let buf = encode_lom_xattr(&meta);
        assert_eq!(decode_lom_xattr(&buf).unwrap(), meta);

        let empty = LomXattr::default();
        let buf = encode_lom_xattr(&empty);
        assert_eq!(decode_lom_xattr(&buf).unwrap(), empty);
    }

    #[test]
    fn test_any_flipped_byte_is_detected() {
        let buf = encode_lom_xattr(&sample());
        for i in 0..buf.len() {
            let mut bad = buf.clone();
            bad[i] ^= 0x01;
            assert!(
                decode_lom_xattr(&bad).is_err(),
                "flip at offset {} went undetected",
                i
            );
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_lom_xattr(b"1321\nwr;as\n;, ;\n\n;;,,dadsa;aa\n").is_err());
        assert!(decode_lom_xattr(b"").is_err());
    }
}
