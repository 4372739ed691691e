//! Prefix-compressed key entries.
//!
//! A key entry is `varint(prefix_len) || varint(suffix_len << 3 | value_type)
//! || suffix`, where the prefix is shared with the previous key in the block.
//! The first entry after a restart point always has `prefix_len == 0`, which
//! is also how restart keys are recognised when decoding them standalone.

use super::varint::{get_varint, put_varint};
use crate::error::Result;
use crate::errfmt;

/// Length of the longest shared prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    let max = a.len().min(b.len());
    let mut p = 0;
    while p < max && a[p] == b[p] {
        p += 1;
    }
    p
}

/// Writes the key entry for `key` following `prev_key` into `buf`. `extra`
/// is the record's 3-bit value type. Returns the number of bytes written and
/// whether the entry is a restart (no shared prefix), or `None` if the entry
/// does not fit.
pub fn encode_key(
    buf: &mut [u8],
    prev_key: &[u8],
    key: &[u8],
    extra: u8,
) -> Option<(usize, bool)> {
    let prefix_len = common_prefix_len(prev_key, key);
    let restart = prefix_len == 0;

    let mut n = put_varint(buf, prefix_len as u64)?;

    let suffix_len = key.len() - prefix_len;
    n += put_varint(&mut buf[n..], (suffix_len as u64) << 3 | extra as u64)?;

    if buf.len() - n < suffix_len {
        return None;
    }
    buf[n..n + suffix_len].copy_from_slice(&key[prefix_len..]);
    Some((n + suffix_len, restart))
}

/// Reads a key entry from `buf`, reconstructing the full key from
/// `prev_key`. Returns the bytes consumed, the key, and the value type.
pub fn decode_key(buf: &[u8], prev_key: &[u8]) -> Option<(usize, Vec<u8>, u8)> {
    let (prefix_len, mut n) = get_varint(buf)?;
    let (suffix_and_type, s) = get_varint(&buf[n..])?;
    n += s;

    let val_type = (suffix_and_type & 0x7) as u8;
    let suffix_len = (suffix_and_type >> 3) as usize;

    if suffix_len > buf.len() - n {
        return None;
    }
    let prefix_len = prefix_len as usize;
    if prefix_len > prev_key.len() {
        return None;
    }

    let mut key = Vec::with_capacity(prefix_len + suffix_len);
    key.extend_from_slice(&prev_key[..prefix_len]);
    key.extend_from_slice(&buf[n..n + suffix_len]);
    Some((n + suffix_len, key, val_type))
}

/// Decodes the full key stored at a restart offset. The byte at `off` is the
/// prefix-length varint, which must be zero there.
pub fn decode_restart_key(block: &[u8], off: usize) -> Result<Vec<u8>> {
    if block.len() <= off {
        return errfmt!("restart offset {off} beyond block end");
    }
    if block[off] != 0 {
        return errfmt!("restart entry has a shared prefix");
    }
    let buf = &block[off + 1..];

    let (suffix_and_type, n) = match get_varint(buf) {
        Some(v) => v,
        None => return errfmt!("truncated restart key"),
    };
    let len = (suffix_and_type >> 3) as usize;
    if buf.len() - n < len {
        return errfmt!("truncated restart key");
    }
    Ok(buf[n..n + len].to_vec())
}

/// Writes `varint(len) || bytes` into `buf`.
pub fn encode_string(buf: &mut [u8], val: &str) -> Option<usize> {
    let n = put_varint(buf, val.len() as u64)?;
    if buf.len() - n < val.len() {
        return None;
    }
    buf[n..n + val.len()].copy_from_slice(val.as_bytes());
    Some(n + val.len())
}

/// Reads a `varint(len) || bytes` string from `buf`.
pub fn decode_string(buf: &[u8]) -> Option<(usize, String)> {
    let (len, n) = get_varint(buf)?;
    let len = len as usize;
    if buf.len() - n < len {
        return None;
    }
    let val = String::from_utf8(buf[n..n + len].to_vec()).ok()?;
    Some((n + len, val))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_common_prefix() {
        for (a, b, want) in [
            (&b"abc"[..], &b"ab"[..], 2),
            (b"", b"abc", 0),
            (b"abc", b"abd", 2),
            (b"abc", b"pqr", 0),
        ] {
            assert_eq!(common_prefix_len(a, b), want, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_key_roundtrip() {
        let keys: &[&[u8]] = &[b"refs/heads/master", b"refs/heads/next", b"refs/tags/v1.0"];
        let mut buf = [0u8; 256];
        let mut n = 0;

        let mut prev: &[u8] = b"";
        for key in keys {
            let (s, restart) = encode_key(&mut buf[n..], prev, key, 3).expect("encode_key");
            assert_eq!(restart, prev.is_empty());
            n += s;
            prev = key;
        }

        let mut prev = Vec::new();
        let mut off = 0;
        for key in keys {
            let (s, got, val_type) = decode_key(&buf[off..n], &prev).expect("decode_key");
            assert_eq!(&got, key);
            assert_eq!(val_type, 3);
            off += s;
            prev = got;
        }
        assert_eq!(off, n);
    }

    #[test]
    fn test_restart_key() {
        let mut buf = [0u8; 64];
        let (n, restart) = encode_key(&mut buf, b"", b"refs/heads/main", 1).unwrap();
        assert!(restart);
        let key = decode_restart_key(&buf[..n], 0).expect("decode_restart_key");
        assert_eq!(key, b"refs/heads/main");
    }

    #[test]
    fn test_restart_key_rejects_prefixed_entry() {
        let mut buf = [0u8; 64];
        let (n, restart) = encode_key(&mut buf, b"refs/a", b"refs/b", 1).unwrap();
        assert!(!restart);
        assert!(decode_restart_key(&buf[..n], 0).is_err());
    }

    #[test]
    fn test_decode_key_truncated() {
        let mut buf = [0u8; 64];
        let (n, _) = encode_key(&mut buf, b"", b"refs/heads/main", 1).unwrap();
        assert!(decode_key(&buf[..n - 1], b"").is_none());
    }

    #[test]
    fn test_decode_key_prefix_longer_than_prev() {
        let mut buf = [0u8; 64];
        let (n, _) = encode_key(&mut buf, b"refs/heads/x", b"refs/heads/y", 1).unwrap();
        // Decoding against a shorter previous key must fail, not panic.
        assert!(decode_key(&buf[..n], b"refs").is_none());
    }

    #[test]
    fn test_string_roundtrip() {
        let mut buf = [0u8; 64];
        let n = encode_string(&mut buf, "committer@host.invalid").unwrap();
        let (m, s) = decode_string(&buf[..n]).unwrap();
        assert_eq!(n, m);
        assert_eq!(s, "committer@host.invalid");
    }

    #[test]
    fn test_string_empty() {
        let mut buf = [0u8; 4];
        let n = encode_string(&mut buf, "").unwrap();
        assert_eq!(n, 1);
        let (m, s) = decode_string(&buf[..n]).unwrap();
        assert_eq!(m, 1);
        assert_eq!(s, "");
    }
}
