//! Writing and reading single blocks.
//!
//! A block is `type_byte(1) || payload_len_u24(3) || entries... ||
//! restart_offsets_u24[R] || restart_count_u16`. Block 0 additionally
//! reserves the first `header_size` bytes of the buffer for the file header,
//! so the block header always starts at `header_off`. Log blocks are
//! zlib-compressed after the block header.

use std::io::{Read, Write};

use byteorder::{BigEndian, ByteOrder};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;

use crate::encoding::{decode_key, decode_restart_key, encode_key};
use crate::errfmt;
use crate::error::Result;
use crate::record::{is_block_type, Record, BLOCK_TYPE_LOG};

pub(crate) const MAX_RESTARTS: usize = (1 << 16) - 1;

pub(crate) fn put_u24(out: &mut [u8], v: u32) {
    out[0] = (v >> 16) as u8;
    out[1] = (v >> 8) as u8;
    out[2] = v as u8;
}

pub(crate) fn get_u24(buf: &[u8]) -> u32 {
    (buf[0] as u32) << 16 | (buf[1] as u32) << 8 | buf[2] as u32
}

/// Writes a single block into a fixed-size buffer.
pub(crate) struct BlockWriter {
    buf: Vec<u8>,
    header_off: usize,
    restart_interval: usize,
    hash_size: usize,

    next: usize,
    restarts: Vec<u32>,
    last_key: Vec<u8>,
    entries: usize,
}

impl BlockWriter {
    pub fn new(
        typ: u8,
        block_size: usize,
        header_off: usize,
        restart_interval: usize,
        hash_size: usize,
    ) -> Self {
        let mut buf = vec![0u8; block_size];
        buf[header_off] = typ;
        BlockWriter {
            buf,
            header_off,
            restart_interval,
            hash_size,
            next: header_off + 4,
            restarts: Vec::new(),
            last_key: Vec::new(),
            entries: 0,
        }
    }

    pub fn block_type(&self) -> u8 {
        self.buf[self.header_off]
    }

    pub fn entries(&self) -> usize {
        self.entries
    }

    pub fn restart_count(&self) -> usize {
        self.restarts.len()
    }

    pub fn last_key(&self) -> &[u8] {
        &self.last_key
    }

    /// Appends one record, returning false (and leaving the writer
    /// unchanged) if it does not fit.
    pub fn add<R: Record>(&mut self, rec: &R) -> bool {
        let at_restart = self.entries % self.restart_interval == 0;
        let key = rec.key();

        let prev: &[u8] = if at_restart { &[] } else { &self.last_key };
        let buf = &mut self.buf[self.next..];
        let Some((n, restart)) = encode_key(buf, prev, &key, rec.val_type()) else {
            return false;
        };
        let Some(m) = rec.encode(&mut buf[n..], self.hash_size) else {
            return false;
        };

        self.register_restart(n + m, restart, key)
    }

    fn register_restart(&mut self, n: usize, restart: bool, key: Vec<u8>) -> bool {
        let mut restart = restart;
        let mut rlen = self.restarts.len();
        if rlen >= MAX_RESTARTS {
            restart = false;
        }
        if restart {
            rlen += 1;
        }

        if 2 + 3 * rlen + n > self.buf.len() - self.next {
            return false;
        }
        if restart {
            self.restarts.push(self.next as u32);
        }
        self.next += n;
        self.last_key = key;
        self.entries += 1;
        true
    }

    /// Finalises the block and returns the unpadded bytes, compressed for
    /// log blocks.
    pub fn finish(mut self) -> Vec<u8> {
        let restarts = std::mem::take(&mut self.restarts);
        for &r in &restarts {
            put_u24(&mut self.buf[self.next..], r);
            self.next += 3;
        }
        BigEndian::write_u16(&mut self.buf[self.next..], restarts.len() as u16);
        self.next += 2;
        put_u24(&mut self.buf[self.header_off + 1..], self.next as u32);

        self.buf.truncate(self.next);

        if self.block_type() == BLOCK_TYPE_LOG {
            let mut out = Vec::with_capacity(self.next);
            out.extend_from_slice(&self.buf[..self.header_off + 4]);
            let mut enc = ZlibEncoder::new(out, Compression::new(9));
            enc.write_all(&self.buf[self.header_off + 4..])
                .expect("in-memory zlib write");
            return enc.finish().expect("in-memory zlib finish");
        }

        self.buf
    }
}

/// Read-side view of one block. Immutable once constructed, so it is safe
/// to share by reference across iterators.
#[derive(Debug, Clone)]
pub(crate) struct BlockReader {
    /// Block data including the (file-)header prefix and restart array, cut
    /// to the payload length; decompressed for log blocks.
    block: Vec<u8>,
    header_off: usize,
    /// Offset where the restart array begins; entries end here.
    restart_start: usize,
    restart_count: u16,
    /// Size of the block as stored, including compression and padding. The
    /// next block starts this many bytes after this one.
    full_block_size: u32,
    hash_size: usize,
}

impl BlockReader {
    pub fn new(
        mut block: Vec<u8>,
        header_off: usize,
        table_block_size: u32,
        hash_size: usize,
    ) -> Result<BlockReader> {
        if block.len() < header_off + 4 {
            return errfmt!("block too short for header");
        }
        let typ = block[header_off];
        if !is_block_type(typ) {
            return errfmt!("unknown block type '{}'", typ as char);
        }
        let sz = get_u24(&block[header_off + 1..]) as usize;

        let mut full_block_size = table_block_size;
        if typ == BLOCK_TYPE_LOG {
            let mut out = Vec::with_capacity(sz);
            out.extend_from_slice(&block[..header_off + 4]);

            let mut dec = ZlibDecoder::new(&block[header_off + 4..]);
            dec.read_to_end(&mut out).map_err(|e| {
                crate::error::Error::Format(format!("log block decompression: {e}"))
            })?;
            if out.len() != sz {
                return errfmt!(
                    "log block decompressed to {} bytes, header says {sz}",
                    out.len()
                );
            }
            full_block_size = (header_off + 4) as u32 + dec.total_in() as u32;
            block = out;
        } else if full_block_size == 0 {
            // Unaligned table.
            full_block_size = sz as u32;
        } else if sz < full_block_size as usize && sz < block.len() && block[sz] != 0 {
            // Smaller than the block size and not followed by padding: the
            // next block starts right after this one.
            full_block_size = sz as u32;
        }

        if block.len() < sz {
            return errfmt!("block truncated: have {} bytes, want {sz}", block.len());
        }
        block.truncate(sz);

        if block.len() < header_off + 4 + 2 {
            return errfmt!("block too short for restart count");
        }
        let restart_count = BigEndian::read_u16(&block[block.len() - 2..]);
        let tail = 2 + 3 * restart_count as usize;
        if block.len() < header_off + 4 + tail {
            return errfmt!("block too short for {restart_count} restarts");
        }
        let restart_start = block.len() - tail;

        Ok(BlockReader {
            block,
            header_off,
            restart_start,
            restart_count,
            full_block_size,
            hash_size,
        })
    }

    pub fn block_type(&self) -> u8 {
        self.block[self.header_off]
    }

    pub fn full_block_size(&self) -> u32 {
        self.full_block_size
    }

    /// Block-relative offset of the i-th restart key.
    fn restart_offset(&self, i: usize) -> usize {
        get_u24(&self.block[self.restart_start + 3 * i..]) as usize
    }

    /// An iterator positioned at the first entry.
    pub fn start(&self) -> BlockIter {
        BlockIter {
            next_offset: self.header_off + 4,
            last_key: Vec::new(),
        }
    }

    /// Decodes one entry into `rec`, or returns false at the end of the
    /// block.
    pub fn next_record<R: Record>(&self, it: &mut BlockIter, rec: &mut R) -> Result<bool> {
        if it.next_offset >= self.restart_start {
            return Ok(false);
        }

        let buf = &self.block[it.next_offset..self.restart_start];
        let Some((n, key, val_type)) = decode_key(buf, &it.last_key) else {
            return errfmt!("malformed key at block offset {}", it.next_offset);
        };
        let Some(m) = rec.decode(&buf[n..], &key, val_type, self.hash_size) else {
            return errfmt!("malformed record at block offset {}", it.next_offset);
        };

        it.last_key = key;
        it.next_offset += n + m;
        Ok(true)
    }

    /// An iterator positioned just before the first entry with key >= `key`.
    pub fn seek<R: Record>(&self, key: &[u8]) -> Result<BlockIter> {
        // Find the first restart key beyond the wanted key, then go one
        // restart back and advance linearly.
        let mut lo = 0usize;
        let mut hi = self.restart_count as usize;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let rkey = decode_restart_key(&self.block, self.restart_offset(mid))?;
            if key < rkey.as_slice() {
                hi = mid;
            } else {
                lo = mid + 1;
            }
        }

        let mut it = BlockIter {
            next_offset: if lo > 0 {
                self.restart_offset(lo - 1)
            } else {
                self.header_off + 4
            },
            last_key: Vec::new(),
        };

        let mut rec = R::default();
        loop {
            let mut next = it.clone();
            let ok = self.next_record(&mut next, &mut rec)?;
            if !ok || rec.key().as_slice() >= key {
                return Ok(it);
            }
            it = next;
        }
    }
}

/// Iteration state within one block. A plain value: cheap to clone, valid
/// only against the block it came from.
#[derive(Debug, Clone, Default)]
pub(crate) struct BlockIter {
    next_offset: usize,
    last_key: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::test_hash;
    use crate::record::{LogRecord, RefRecord, BLOCK_TYPE_REF};

    fn ref_rec(name: &str, j: usize) -> RefRecord {
        RefRecord {
            ref_name: name.into(),
            update_index: 0,
            value: Some(test_hash(j)),
            ..RefRecord::default()
        }
    }

    fn build_ref_block(names: &[String], block_size: usize) -> Vec<u8> {
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, block_size, 0, 16, 20);
        for (j, name) in names.iter().enumerate() {
            assert!(w.add(&ref_rec(name, j)), "add {name}");
        }
        w.finish()
    }

    #[test]
    fn test_block_seek_all_keys() {
        let names: Vec<String> = (0..30).map(|i| format!("refs/heads/{i:02}")).collect();
        let data = build_ref_block(&names, 1024);
        let br = BlockReader::new(data, 0, 1024, 20).expect("open");

        for (j, name) in names.iter().enumerate() {
            let mut it = br.seek::<RefRecord>(name.as_bytes()).expect("seek");
            let mut rec = RefRecord::default();
            assert!(br.next_record(&mut it, &mut rec).unwrap());
            assert_eq!(&rec.ref_name, name);
            assert_eq!(rec.value, Some(test_hash(j)));
        }
    }

    #[test]
    fn test_block_seek_missing_key_lands_after() {
        let names: Vec<String> = (0..10).map(|i| format!("b{i:02}")).collect();
        let data = build_ref_block(&names, 1024);
        let br = BlockReader::new(data, 0, 1024, 20).expect("open");

        // Between b04 and b05.
        let mut it = br.seek::<RefRecord>(b"b041").expect("seek");
        let mut rec = RefRecord::default();
        assert!(br.next_record(&mut it, &mut rec).unwrap());
        assert_eq!(rec.ref_name, "b05");

        // Past the end.
        let mut it = br.seek::<RefRecord>(b"zzz").expect("seek");
        assert!(!br.next_record(&mut it, &mut rec).unwrap());
    }

    #[test]
    fn test_block_sequential_iteration() {
        let names: Vec<String> = (0..50).map(|i| format!("refs/tags/v{i:03}")).collect();
        let data = build_ref_block(&names, 4096);
        let br = BlockReader::new(data, 0, 4096, 20).expect("open");

        let mut it = br.start();
        let mut rec = RefRecord::default();
        let mut got = Vec::new();
        while br.next_record(&mut it, &mut rec).unwrap() {
            got.push(rec.ref_name.clone());
        }
        assert_eq!(got, names);
    }

    #[test]
    fn test_block_restart_every_interval() {
        let names: Vec<String> = (0..33).map(|i| format!("refs/heads/{i:02}")).collect();
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 4096, 0, 16, 20);
        for (j, name) in names.iter().enumerate() {
            assert!(w.add(&ref_rec(name, j)));
        }
        // 33 entries at interval 16: restarts at entries 0, 16 and 32.
        assert_eq!(w.restart_count(), 3);
    }

    #[test]
    fn test_block_add_rejects_when_full() {
        let mut w = BlockWriter::new(BLOCK_TYPE_REF, 128, 0, 16, 20);
        let mut added = 0;
        loop {
            if !w.add(&ref_rec(&format!("refs/heads/branch{added:04}"), added)) {
                break;
            }
            added += 1;
        }
        assert!(added > 0);
        let entries = w.entries();
        // A failed add leaves the writer unchanged.
        assert!(!w.add(&ref_rec("refs/heads/one-more", 0)));
        assert_eq!(w.entries(), entries);

        let data = w.finish();
        assert!(data.len() <= 128);
        let br = BlockReader::new(data, 0, 128, 20).expect("open");
        let mut it = br.start();
        let mut rec = RefRecord::default();
        let mut count = 0;
        while br.next_record(&mut it, &mut rec).unwrap() {
            count += 1;
        }
        assert_eq!(count, added);
    }

    #[test]
    fn test_log_block_compression_roundtrip() {
        let mut w = BlockWriter::new(BLOCK_TYPE_LOG, 4096, 0, 16, 20);
        let mut want = Vec::new();
        for i in (0..20).rev() {
            let rec = LogRecord {
                ref_name: "refs/heads/master".into(),
                update_index: i + 1,
                old: Some(test_hash(i as usize)),
                new: Some(test_hash(i as usize + 1)),
                name: "A U Thor".into(),
                email: "author@host.invalid".into(),
                time: 1_500_000_000 + i,
                tz_offset: 120,
                message: "commit\n".into(),
            };
            assert!(w.add(&rec));
            want.push(rec);
        }
        let data = w.finish();
        // zlib must beat the highly repetitive plaintext.
        assert!(data.len() < 4096 / 2);

        let full_len = data.len();
        let br = BlockReader::new(data, 0, 4096, 20).expect("open");
        assert_eq!(br.full_block_size() as usize, full_len);

        let mut it = br.start();
        let mut rec = LogRecord::default();
        let mut got = Vec::new();
        while br.next_record(&mut it, &mut rec).unwrap() {
            got.push(rec.clone());
        }
        assert_eq!(got, want);
    }

    #[test]
    fn test_padded_block_keeps_full_size() {
        let names: Vec<String> = (0..4).map(|i| format!("b{i}")).collect();
        let mut data = build_ref_block(&names, 512);
        let payload = data.len();
        data.resize(512, 0);

        let br = BlockReader::new(data, 0, 512, 20).expect("open");
        assert_eq!(br.full_block_size(), 512);
        let _ = payload;
    }

    #[test]
    fn test_unpadded_follower_block_detected() {
        let names: Vec<String> = (0..4).map(|i| format!("b{i}")).collect();
        let mut data = build_ref_block(&names, 512);
        let payload = data.len();
        // Simulate the next (unaligned) block starting immediately.
        data.push(BLOCK_TYPE_REF);

        let br = BlockReader::new(data, 0, 512, 20).expect("open");
        assert_eq!(br.full_block_size() as usize, payload);
    }

    #[test]
    fn test_unaligned_table_uses_payload_len() {
        let names: Vec<String> = (0..4).map(|i| format!("b{i}")).collect();
        let data = build_ref_block(&names, 512);
        let payload = data.len();

        let br = BlockReader::new(data, 0, 0, 20).expect("open");
        assert_eq!(br.full_block_size() as usize, payload);
    }

    #[test]
    fn test_bad_block_type() {
        let data = vec![b'x', 0, 0, 10, 0, 0];
        assert!(BlockReader::new(data, 0, 0, 20).is_err());
    }

    #[test]
    fn test_truncated_block() {
        let names: Vec<String> = (0..4).map(|i| format!("b{i}")).collect();
        let mut data = build_ref_block(&names, 512);
        data.truncate(data.len() - 4);
        assert!(BlockReader::new(data, 0, 0, 20).is_err());
    }
}
