//! Typed records and their wire bodies.
//!
//! Four record shapes share one on-disk framing: a prefix-compressed key
//! entry followed by a type-specific body. The [`Record`] trait is the seam
//! the block, table and merged layers are generic over; each implementation
//! carries its own encode/decode.

use byteorder::{BigEndian, ByteOrder};

use crate::encoding::{decode_string, encode_string, get_varint, put_varint};

/// Block type bytes; the first byte of every block.
pub(crate) const BLOCK_TYPE_REF: u8 = b'r';
pub(crate) const BLOCK_TYPE_LOG: u8 = b'g';
pub(crate) const BLOCK_TYPE_OBJ: u8 = b'o';
pub(crate) const BLOCK_TYPE_INDEX: u8 = b'i';
pub(crate) const BLOCK_TYPE_ANY: u8 = 0;

pub(crate) fn is_block_type(typ: u8) -> bool {
    matches!(
        typ,
        BLOCK_TYPE_REF | BLOCK_TYPE_LOG | BLOCK_TYPE_OBJ | BLOCK_TYPE_INDEX
    )
}

/// A single piece of keyed data stored in a reftable.
pub trait Record: Clone + Default + std::fmt::Debug {
    /// The block type this record is stored in.
    fn typ() -> u8;

    /// The sort key. Sections are strictly ascending by it.
    fn key(&self) -> Vec<u8>;

    /// The 3-bit tag stored alongside the key.
    fn val_type(&self) -> u8;

    /// Whether this record is a tombstone masking older records.
    fn is_deletion(&self) -> bool;

    /// Serialises the body (everything after the key entry) into `buf`,
    /// returning the bytes written, or `None` if it does not fit.
    fn encode(&self, buf: &mut [u8], hash_size: usize) -> Option<usize>;

    /// Reads the body from `buf` for the given key and value type,
    /// returning the bytes consumed, or `None` on malformed data.
    fn decode(&mut self, buf: &[u8], key: &[u8], val_type: u8, hash_size: usize) -> Option<usize>;

    /// Re-biases the update index of a record read from a table whose
    /// records are serialised relative to the table minimum.
    fn shift_update_index(&mut self, _min: u64) {}
}

/// A record from the ref database: one name mapped to a value shape.
///
/// Exactly one of three shapes is populated: direct (`value`), peeled
/// (`value` + `target_value`), or symbolic (`target`). All three empty is a
/// deletion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefRecord {
    pub ref_name: String,
    pub update_index: u64,
    pub value: Option<Vec<u8>>,
    pub target_value: Option<Vec<u8>>,
    pub target: String,
}

impl Record for RefRecord {
    fn typ() -> u8 {
        BLOCK_TYPE_REF
    }

    fn key(&self) -> Vec<u8> {
        self.ref_name.clone().into_bytes()
    }

    fn val_type(&self) -> u8 {
        if self.value.is_some() {
            if self.target_value.is_some() {
                2
            } else {
                1
            }
        } else if !self.target.is_empty() {
            3
        } else {
            0
        }
    }

    fn is_deletion(&self) -> bool {
        self.value.is_none() && self.target_value.is_none() && self.target.is_empty()
    }

    fn encode(&self, buf: &mut [u8], _hash_size: usize) -> Option<usize> {
        let mut n = put_varint(buf, self.update_index)?;

        if let Some(value) = &self.value {
            if buf.len() - n < value.len() {
                return None;
            }
            buf[n..n + value.len()].copy_from_slice(value);
            n += value.len();
        }
        if let Some(target_value) = &self.target_value {
            if buf.len() - n < target_value.len() {
                return None;
            }
            buf[n..n + target_value.len()].copy_from_slice(target_value);
            n += target_value.len();
        }
        if !self.target.is_empty() {
            n += encode_string(&mut buf[n..], &self.target)?;
        }
        Some(n)
    }

    fn decode(&mut self, buf: &[u8], key: &[u8], val_type: u8, hash_size: usize) -> Option<usize> {
        *self = RefRecord {
            ref_name: String::from_utf8(key.to_vec()).ok()?,
            ..RefRecord::default()
        };

        let (update_index, mut n) = get_varint(buf)?;
        self.update_index = update_index;

        match val_type {
            1 | 2 => {
                if buf.len() - n < hash_size {
                    return None;
                }
                self.value = Some(buf[n..n + hash_size].to_vec());
                n += hash_size;
                if val_type == 2 {
                    if buf.len() - n < hash_size {
                        return None;
                    }
                    self.target_value = Some(buf[n..n + hash_size].to_vec());
                    n += hash_size;
                }
            }
            3 => {
                let (s, target) = decode_string(&buf[n..])?;
                self.target = target;
                n += s;
            }
            _ => {}
        }
        Some(n)
    }

    fn shift_update_index(&mut self, min: u64) {
        self.update_index += min;
    }
}

/// Number of bytes appended to the ref name to form a log key.
const LOG_KEY_SUFFIX_LEN: usize = 9;

/// A record from the reflog: one update of one ref.
///
/// Keyed by `ref_name || 0x00 || be64(!update_index)`, so newer entries for
/// a ref sort before older ones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogRecord {
    pub ref_name: String,
    pub update_index: u64,
    pub new: Option<Vec<u8>>,
    pub old: Option<Vec<u8>>,
    pub name: String,
    pub email: String,
    pub time: u64,
    pub tz_offset: i16,
    pub message: String,
}

impl LogRecord {
    fn decode_log_key(&mut self, key: &[u8]) -> Option<()> {
        if key.len() < LOG_KEY_SUFFIX_LEN + 1 {
            return None;
        }
        let (name, suffix) = key.split_at(key.len() - LOG_KEY_SUFFIX_LEN);
        if suffix[0] != 0 {
            return None;
        }
        self.ref_name = String::from_utf8(name.to_vec()).ok()?;
        self.update_index = !BigEndian::read_u64(&suffix[1..]);
        Some(())
    }
}

/// The log key for the given name and update index.
pub(crate) fn log_key(ref_name: &str, update_index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(ref_name.len() + LOG_KEY_SUFFIX_LEN);
    key.extend_from_slice(ref_name.as_bytes());
    key.push(0);
    let mut suffix = [0u8; 8];
    BigEndian::write_u64(&mut suffix, !update_index);
    key.extend_from_slice(&suffix);
    key
}

impl Record for LogRecord {
    fn typ() -> u8 {
        BLOCK_TYPE_LOG
    }

    fn key(&self) -> Vec<u8> {
        log_key(&self.ref_name, self.update_index)
    }

    fn val_type(&self) -> u8 {
        if self.is_deletion() {
            0
        } else {
            1
        }
    }

    fn is_deletion(&self) -> bool {
        self.old.is_none()
            && self.new.is_none()
            && self.name.is_empty()
            && self.email.is_empty()
            && self.time == 0
            && self.tz_offset == 0
            && self.message.is_empty()
    }

    fn encode(&self, buf: &mut [u8], hash_size: usize) -> Option<usize> {
        if self.is_deletion() {
            return Some(0);
        }

        let zero_hash = vec![0u8; hash_size];
        let old = self.old.as_deref().unwrap_or(&zero_hash);
        let new = self.new.as_deref().unwrap_or(&zero_hash);
        if old.len() != hash_size || new.len() != hash_size {
            panic!("log record hash size mismatch");
        }

        if buf.len() < 2 * hash_size {
            return None;
        }
        buf[..hash_size].copy_from_slice(old);
        buf[hash_size..2 * hash_size].copy_from_slice(new);
        let mut n = 2 * hash_size;

        n += encode_string(&mut buf[n..], &self.name)?;
        n += encode_string(&mut buf[n..], &self.email)?;
        n += put_varint(&mut buf[n..], self.time)?;

        if buf.len() - n < 2 {
            return None;
        }
        BigEndian::write_u16(&mut buf[n..], self.tz_offset as u16);
        n += 2;

        n += encode_string(&mut buf[n..], &self.message)?;
        Some(n)
    }

    fn decode(&mut self, buf: &[u8], key: &[u8], val_type: u8, hash_size: usize) -> Option<usize> {
        *self = LogRecord::default();
        self.decode_log_key(key)?;

        if val_type == 0 {
            return Some(0);
        }

        if buf.len() < 2 * hash_size {
            return None;
        }
        self.old = Some(buf[..hash_size].to_vec());
        self.new = Some(buf[hash_size..2 * hash_size].to_vec());
        let mut n = 2 * hash_size;

        let (s, name) = decode_string(&buf[n..])?;
        self.name = name;
        n += s;

        let (s, email) = decode_string(&buf[n..])?;
        self.email = email;
        n += s;

        let (time, s) = get_varint(&buf[n..])?;
        self.time = time;
        n += s;

        if buf.len() - n < 2 {
            return None;
        }
        self.tz_offset = BigEndian::read_u16(&buf[n..]) as i16;
        n += 2;

        let (s, message) = decode_string(&buf[n..])?;
        self.message = message;
        n += s;

        Some(n)
    }
}

/// Reverse-index record: a hash prefix mapped to the offsets of the ref
/// blocks holding refs with that value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjRecord {
    pub hash_prefix: Vec<u8>,
    pub offsets: Vec<u64>,
}

impl Record for ObjRecord {
    fn typ() -> u8 {
        BLOCK_TYPE_OBJ
    }

    fn key(&self) -> Vec<u8> {
        self.hash_prefix.clone()
    }

    fn val_type(&self) -> u8 {
        // Offset counts 1..=7 ride in the value type; larger counts are a
        // leading varint in the body.
        match self.offsets.len() {
            l if l > 0 && l < 8 => l as u8,
            _ => 0,
        }
    }

    fn is_deletion(&self) -> bool {
        false
    }

    fn encode(&self, buf: &mut [u8], _hash_size: usize) -> Option<usize> {
        let mut n = 0;
        if self.offsets.is_empty() || self.offsets.len() >= 8 {
            n += put_varint(buf, self.offsets.len() as u64)?;
        }
        if self.offsets.is_empty() {
            return Some(n);
        }

        n += put_varint(&mut buf[n..], self.offsets[0])?;
        let mut last = self.offsets[0];
        for &off in &self.offsets[1..] {
            n += put_varint(&mut buf[n..], off - last)?;
            last = off;
        }
        Some(n)
    }

    fn decode(&mut self, buf: &[u8], key: &[u8], val_type: u8, _hash_size: usize) -> Option<usize> {
        *self = ObjRecord {
            hash_prefix: key.to_vec(),
            ..ObjRecord::default()
        };

        let mut n = 0;
        let count = if val_type == 0 {
            let (count, s) = get_varint(buf)?;
            n += s;
            count
        } else {
            val_type as u64
        };
        if count == 0 {
            return Some(n);
        }

        let (first, s) = get_varint(&buf[n..])?;
        n += s;
        self.offsets = Vec::with_capacity(count as usize);
        self.offsets.push(first);

        let mut last = first;
        for _ in 1..count {
            let (delta, s) = get_varint(&buf[n..])?;
            n += s;
            last += delta;
            self.offsets.push(last);
        }
        Some(n)
    }
}

/// Index record: the largest key of a block, mapped to its offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexRecord {
    pub last_key: Vec<u8>,
    pub offset: u64,
}

impl Record for IndexRecord {
    fn typ() -> u8 {
        BLOCK_TYPE_INDEX
    }

    fn key(&self) -> Vec<u8> {
        self.last_key.clone()
    }

    fn val_type(&self) -> u8 {
        0
    }

    fn is_deletion(&self) -> bool {
        false
    }

    fn encode(&self, buf: &mut [u8], _hash_size: usize) -> Option<usize> {
        put_varint(buf, self.offset)
    }

    fn decode(&mut self, buf: &[u8], key: &[u8], _val_type: u8, _hash_size: usize) -> Option<usize> {
        let (offset, n) = get_varint(buf)?;
        *self = IndexRecord {
            last_key: key.to_vec(),
            offset,
        };
        Some(n)
    }
}
