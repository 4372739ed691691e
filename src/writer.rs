//! Streaming one reftable to a byte sink.
//!
//! Records are packed into blocks section by section: refs, then the
//! object index, then logs. Block indexes are emitted per section once it
//! spans enough blocks, additional index levels are stacked until one level
//! fits the threshold, and the file ends with a footer that echoes the
//! header and carries the section offset table plus a CRC.

use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{BigEndian, WriteBytesExt};
use crc::{Crc, CRC_32_ISO_HDLC};

use crate::block::BlockWriter;
use crate::config::{header_size, Config, MAGIC};
use crate::encoding::common_prefix_len;
use crate::errinput;
use crate::error::{Error, Result};
use crate::record::{
    IndexRecord, LogRecord, ObjRecord, Record, RefRecord, BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG,
    BLOCK_TYPE_OBJ, BLOCK_TYPE_REF,
};

pub(crate) const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Write statistics for one block type.
#[derive(Debug, Default, Clone, Copy)]
pub struct BlockStats {
    pub entries: usize,
    pub restarts: usize,
    pub blocks: usize,
    pub index_blocks: usize,
    pub max_index_level: usize,

    /// Offset of the first block of this type.
    pub offset: u64,
    /// Offset of the top-level index, or 0 if none was written.
    pub index_offset: u64,
}

/// Write statistics for one table.
#[derive(Debug, Default, Clone, Copy)]
pub struct Stats {
    pub ref_stats: BlockStats,
    pub obj_stats: BlockStats,
    pub log_stats: BlockStats,
    pub idx_stats: BlockStats,

    pub blocks: usize,

    /// Hash prefix length used by the object index.
    pub object_id_len: usize,
}

/// Pads the previous block out to the block size just before the next
/// write, so trailing padding is never emitted.
struct PaddedWriter<W: Write> {
    out: W,
    pending_padding: usize,
}

impl<W: Write> PaddedWriter<W> {
    fn write(&mut self, buf: &[u8], padding: usize) -> Result<usize> {
        if self.pending_padding > 0 {
            let pad = vec![0u8; self.pending_padding];
            self.out.write_all(&pad)?;
            self.pending_padding = 0;
        }
        self.pending_padding = padding;
        self.out.write_all(buf)?;
        Ok(buf.len() + padding)
    }
}

/// Writes a single reftable.
pub struct Writer<W: Write> {
    out: PaddedWriter<W>,
    cfg: Config,

    last_key: Vec<u8>,

    /// Offset of the next block to write.
    next: u64,

    min_update_index: u64,
    max_update_index: u64,

    block_writer: Option<BlockWriter>,
    index: Vec<IndexRecord>,

    /// hash value => offsets of the ref blocks mentioning it.
    obj_index: Option<BTreeMap<Vec<u8>, Vec<u64>>>,

    stats: Stats,
}

impl<W: Write> Writer<W> {
    pub fn new(out: W, cfg: &Config) -> Result<Writer<W>> {
        let cfg = cfg.normalized();
        if cfg.block_size >= 1 << 24 {
            return errinput!("invalid block size {}", cfg.block_size);
        }

        let mut w = Writer {
            out: PaddedWriter {
                out,
                pending_padding: 0,
            },
            obj_index: if cfg.skip_index_objects {
                None
            } else {
                Some(BTreeMap::new())
            },
            cfg,
            last_key: Vec::new(),
            next: 0,
            min_update_index: 0,
            max_update_index: 0,
            block_writer: None,
            index: Vec::new(),
            stats: Stats::default(),
        };
        w.block_writer = Some(w.new_block_writer(BLOCK_TYPE_REF));
        Ok(w)
    }

    /// Sets the update-index range of the records to be written. Must be
    /// called before `add_ref` or `add_log`.
    pub fn set_limits(&mut self, min: u64, max: u64) {
        self.min_update_index = min;
        self.max_update_index = max;
    }

    pub fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    pub fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    fn header_bytes(&self) -> Vec<u8> {
        let v = self.cfg.hash_id.version();
        let mut buf = Vec::with_capacity(header_size(v));
        buf.extend_from_slice(&MAGIC);
        buf.write_u32::<BigEndian>(self.cfg.block_size | v << 24)
            .unwrap();
        buf.write_u64::<BigEndian>(self.min_update_index).unwrap();
        buf.write_u64::<BigEndian>(self.max_update_index).unwrap();
        if v == 2 {
            buf.extend_from_slice(&self.cfg.hash_id.0);
        }
        buf
    }

    fn new_block_writer(&self, typ: u8) -> BlockWriter {
        // Block 0 reserves room for the file header.
        let header_off = if self.next == 0 {
            header_size(self.cfg.hash_id.version())
        } else {
            0
        };
        BlockWriter::new(
            typ,
            self.cfg.block_size as usize,
            header_off,
            self.cfg.restart_interval,
            self.cfg.hash_id.size(),
        )
    }

    fn index_hash(&mut self, hash: Option<&[u8]>) {
        let Some(obj_index) = &mut self.obj_index else {
            return;
        };
        let Some(hash) = hash else {
            return;
        };

        let offsets = obj_index.entry(hash.to_vec()).or_default();
        if offsets.last() == Some(&self.next) {
            return;
        }
        offsets.push(self.next);
    }

    /// Adds a RefRecord. Keys must be added in ascending order, and the
    /// update index must lie within the configured limits.
    pub fn add_ref(&mut self, rec: &RefRecord) -> Result<()> {
        if rec.ref_name.is_empty() {
            return errinput!("refs must have a name");
        }
        if rec.update_index < self.min_update_index || rec.update_index > self.max_update_index {
            return errinput!(
                "update index {} outside bounds [{}, {}]",
                rec.update_index,
                self.min_update_index,
                self.max_update_index
            );
        }

        let mut cpy = rec.clone();
        cpy.update_index -= self.min_update_index;
        self.add(&cpy)?;

        self.index_hash(rec.value.as_deref());
        self.index_hash(rec.target_value.as_deref());
        Ok(())
    }

    /// Adds a LogRecord. Keys must be added in ascending order; refs cannot
    /// be added once the log section has started.
    pub fn add_log(&mut self, rec: &LogRecord) -> Result<()> {
        if rec.ref_name.is_empty() {
            return errinput!("logs must have a ref name");
        }

        let mut cpy = rec.clone();
        if !self.cfg.exact_log_message && !cpy.is_deletion() {
            let mut message = std::mem::take(&mut cpy.message);
            if message.ends_with('\n') {
                message.pop();
            }
            if message.contains('\n') {
                return errinput!("reflog message for {} spans multiple lines", rec.ref_name);
            }
            message.push('\n');
            cpy.message = message;
        }

        let in_ref_section =
            matches!(&self.block_writer, Some(bw) if bw.block_type() == BLOCK_TYPE_REF);
        if in_ref_section {
            self.finish_public_section()?;
        }

        // Log blocks start immediately after the ref/obj section.
        self.next -= self.out.pending_padding as u64;
        self.out.pending_padding = 0;

        self.add(&cpy)
    }

    fn add<R: Record>(&mut self, rec: &R) -> Result<()> {
        let key = rec.key();
        if self.last_key.as_slice() >= key.as_slice() {
            panic!(
                "keys must be ascending: got {:?} last {:?}",
                key, self.last_key
            );
        }
        self.last_key = key;

        if self.block_writer.is_none() {
            self.block_writer = Some(self.new_block_writer(R::typ()));
        }
        let bw = self.block_writer.as_mut().unwrap();
        if bw.block_type() != R::typ() {
            panic!(
                "add '{}' record on '{}' block",
                R::typ() as char,
                bw.block_type() as char
            );
        }
        if bw.add(rec) {
            return Ok(());
        }

        self.flush_block()?;
        self.block_writer = Some(self.new_block_writer(R::typ()));
        if !self.block_writer.as_mut().unwrap().add(rec) {
            return errinput!("record {rec:?} too large for block size");
        }
        Ok(())
    }

    fn block_stats_mut(&mut self, typ: u8) -> &mut BlockStats {
        match typ {
            BLOCK_TYPE_REF => &mut self.stats.ref_stats,
            BLOCK_TYPE_LOG => &mut self.stats.log_stats,
            BLOCK_TYPE_OBJ => &mut self.stats.obj_stats,
            BLOCK_TYPE_INDEX => &mut self.stats.idx_stats,
            _ => panic!("unknown block type '{}'", typ as char),
        }
    }

    fn flush_block(&mut self) -> Result<()> {
        let Some(bw) = self.block_writer.take() else {
            return Ok(());
        };
        if bw.entries() == 0 {
            self.block_writer = Some(bw);
            return Ok(());
        }

        let typ = bw.block_type();
        let next = self.next;
        {
            let stats = self.block_stats_mut(typ);
            // stats.offset may be 0 legitimately, so look at the block
            // count instead.
            if stats.blocks == 0 {
                stats.offset = next;
            }
            stats.entries += bw.entries();
            stats.restarts += bw.restart_count();
            stats.blocks += 1;
        }
        self.stats.blocks += 1;

        let last_key = bw.last_key().to_vec();
        let mut raw = bw.finish();
        if self.next == 0 {
            let hb = self.header_bytes();
            raw[..hb.len()].copy_from_slice(&hb);
        }

        let padding = if self.cfg.unaligned || typ == BLOCK_TYPE_LOG {
            0
        } else {
            self.cfg.block_size as usize - raw.len()
        };

        let n = self.out.write(&raw, padding)?;
        self.index.push(IndexRecord {
            last_key,
            offset: self.next,
        });
        self.next += n as u64;
        Ok(())
    }

    fn finish_section(&mut self) -> Result<()> {
        let typ = self
            .block_writer
            .as_ref()
            .expect("finishing a section without a block writer")
            .block_type();
        self.flush_block()?;

        let mut index_start = 0u64;
        let mut max_level = 0usize;
        let threshold = if self.cfg.unaligned { 1 } else { 3 };
        let blocks_before = self.stats.idx_stats.blocks;

        while self.index.len() > threshold {
            max_level += 1;
            index_start = self.next;
            let idx = std::mem::take(&mut self.index);
            self.block_writer = Some(self.new_block_writer(BLOCK_TYPE_INDEX));
            for rec in &idx {
                if self.block_writer.as_mut().unwrap().add(rec) {
                    continue;
                }
                self.flush_block()?;
                self.block_writer = Some(self.new_block_writer(BLOCK_TYPE_INDEX));
                if !self.block_writer.as_mut().unwrap().add(rec) {
                    panic!("index record does not fit a fresh block");
                }
            }
            self.flush_block()?;
        }
        self.index.clear();
        self.block_writer = None;

        let index_blocks = self.stats.idx_stats.blocks - blocks_before;
        let stats = self.block_stats_mut(typ);
        stats.index_blocks = index_blocks;
        stats.index_offset = index_start;
        stats.max_index_level = max_level;

        // The next section can start with any key.
        self.last_key.clear();
        Ok(())
    }

    fn finish_public_section(&mut self) -> Result<()> {
        let Some(bw) = &self.block_writer else {
            return Ok(());
        };
        let typ = bw.block_type();
        self.finish_section()?;

        if typ == BLOCK_TYPE_REF
            && !self.cfg.skip_index_objects
            && self.stats.ref_stats.index_blocks > 0
        {
            self.dump_object_index()?;
        }

        self.block_writer = None;
        Ok(())
    }

    fn dump_object_index(&mut self) -> Result<()> {
        let obj_index = self.obj_index.take().unwrap_or_default();

        let mut max_common = 0;
        let mut last: &[u8] = &[];
        for hash in obj_index.keys() {
            let c = common_prefix_len(last, hash);
            if c > max_common {
                max_common = c;
            }
            last = hash;
        }
        self.stats.object_id_len = max_common + 1;

        self.block_writer = Some(self.new_block_writer(BLOCK_TYPE_OBJ));
        for (hash, offsets) in &obj_index {
            let rec = ObjRecord {
                hash_prefix: hash[..self.stats.object_id_len].to_vec(),
                offsets: offsets.clone(),
            };
            if self.block_writer.as_mut().unwrap().add(&rec) {
                continue;
            }

            self.flush_block()?;
            self.block_writer = Some(self.new_block_writer(BLOCK_TYPE_OBJ));
            if !self.block_writer.as_mut().unwrap().add(&rec) {
                // Too many offsets to fit anywhere; keep the prefix and let
                // readers fall back to scanning.
                let rec = ObjRecord {
                    hash_prefix: rec.hash_prefix,
                    offsets: Vec::new(),
                };
                if !self.block_writer.as_mut().unwrap().add(&rec) {
                    panic!("truncated obj record does not fit a fresh block");
                }
            }
        }

        self.finish_section()
    }

    /// Writes the footer and flushes the sink. Returns `Error::EmptyTable`
    /// if no records were added; the file then holds only a header and
    /// footer.
    pub fn finish(&mut self) -> Result<()> {
        self.finish_public_section()?;
        self.out.pending_padding = 0;

        let hb = self.header_bytes();
        let empty_table = self.next == 0;
        if empty_table {
            // Even an empty file needs a file header, separate from the
            // footer's echo of it.
            self.out.write(&hb, 0)?;
        }

        let mut footer = hb;
        footer
            .write_u64::<BigEndian>(self.stats.ref_stats.index_offset)
            .unwrap();
        footer
            .write_u64::<BigEndian>(
                self.stats.obj_stats.offset << 5 | self.stats.object_id_len as u64,
            )
            .unwrap();
        footer
            .write_u64::<BigEndian>(self.stats.obj_stats.index_offset)
            .unwrap();
        footer
            .write_u64::<BigEndian>(self.stats.log_stats.offset)
            .unwrap();
        footer
            .write_u64::<BigEndian>(self.stats.log_stats.index_offset)
            .unwrap();

        let crc = CRC32.checksum(&footer);
        footer.write_u32::<BigEndian>(crc).unwrap();

        self.out.write(&footer, 0)?;
        self.out.out.flush()?;

        if empty_table {
            return Err(Error::EmptyTable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::footer_size;
    use crate::record::tests::test_hash;

    fn ref_rec(name: &str, j: usize) -> RefRecord {
        RefRecord {
            ref_name: name.into(),
            update_index: 1,
            value: Some(test_hash(j)),
            ..RefRecord::default()
        }
    }

    #[test]
    fn test_empty_table_sentinel() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &Config::default()).unwrap();
        w.set_limits(1, 1);
        assert_eq!(w.finish(), Err(Error::EmptyTable));
        // Header plus footer, nothing else.
        assert_eq!(buf.len(), header_size(1) + footer_size(1));
        assert_eq!(&buf[..4], b"REFT");
        assert_eq!(&buf[header_size(1)..header_size(1) + 4], b"REFT");
    }

    #[test]
    fn test_update_index_bounds() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &Config::default()).unwrap();
        w.set_limits(2, 4);
        for idx in [1, 5] {
            let rec = RefRecord {
                ref_name: "ref".into(),
                update_index: idx,
                ..RefRecord::default()
            };
            assert!(matches!(w.add_ref(&rec), Err(Error::InvalidInput(_))));
        }
    }

    #[test]
    fn test_nameless_ref_rejected() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &Config::default()).unwrap();
        w.set_limits(1, 1);
        assert!(w.add_ref(&RefRecord::default()).is_err());
    }

    #[test]
    #[should_panic(expected = "keys must be ascending")]
    fn test_out_of_order_keys_panic() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &Config::default()).unwrap();
        w.set_limits(1, 1);
        w.add_ref(&ref_rec("b", 1)).unwrap();
        let _ = w.add_ref(&ref_rec("a", 2));
    }

    #[test]
    fn test_block_boundary_stats() {
        let mut buf = Vec::new();
        let cfg = Config::default().block_size(256);
        let mut w = Writer::new(&mut buf, &cfg).unwrap();
        w.set_limits(2, 2);
        w.add_ref(&RefRecord {
            ref_name: format!("A{:0200}", 0),
            update_index: 2,
            ..RefRecord::default()
        })
        .unwrap();
        w.add_ref(&RefRecord {
            ref_name: format!("B{:0200}", 0),
            update_index: 2,
            ..RefRecord::default()
        })
        .unwrap();
        w.finish().unwrap();

        assert_eq!(w.stats().ref_stats.blocks, 2);
        assert_eq!(w.stats().ref_stats.entries, 2);
    }

    #[test]
    fn test_log_message_normalized() {
        let mut buf = Vec::new();
        let mut w = Writer::new(&mut buf, &Config::default()).unwrap();
        w.set_limits(1, 1);

        let multiline = LogRecord {
            ref_name: "branch".into(),
            update_index: 1,
            new: Some(test_hash(1)),
            old: Some(test_hash(2)),
            message: "a\nb".into(),
            ..LogRecord::default()
        };
        assert!(matches!(
            w.add_log(&multiline),
            Err(Error::InvalidInput(_))
        ));

        let single = LogRecord {
            message: "message".into(),
            ..multiline
        };
        w.add_log(&single).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_exact_log_message_kept() {
        let mut buf = Vec::new();
        let cfg = Config::default().exact_log_message(true);
        let mut w = Writer::new(&mut buf, &cfg).unwrap();
        w.set_limits(1, 1);
        let rec = LogRecord {
            ref_name: "branch".into(),
            update_index: 1,
            new: Some(test_hash(1)),
            message: "a\nb\nc".into(),
            ..LogRecord::default()
        };
        w.add_log(&rec).unwrap();
        w.finish().unwrap();
    }

    #[test]
    fn test_unaligned_log_blocks_small() {
        let mut buf = Vec::new();
        let cfg = Config::default().block_size(4096);
        let mut w = Writer::new(&mut buf, &cfg).unwrap();
        w.set_limits(0, 0);
        for i in 0..50 {
            w.add_log(&LogRecord {
                ref_name: format!("{i:04}"),
                update_index: 0,
                message: "x".repeat(4000),
                new: Some(test_hash(i)),
                ..LogRecord::default()
            })
            .unwrap();
        }
        w.finish().unwrap();
        assert_eq!(w.stats().log_stats.blocks, 50);
        // Each 4k message compresses to almost nothing.
        assert!(buf.len() < 4000);
    }

    #[test]
    fn test_oversized_block_size_rejected() {
        let cfg = Config::default().block_size(1 << 24);
        assert!(Writer::new(Vec::new(), &cfg).is_err());
    }
}
