//! Random-access reading of one reftable.
//!
//! Opening a table verifies the header/footer echo and the footer CRC, then
//! resolves where each section starts. Seeks go through the section's
//! multi-level index when one exists and fall back to a linear block walk
//! otherwise.

use std::collections::VecDeque;
use std::marker::PhantomData;

use byteorder::{BigEndian, ByteOrder};

use crate::block::{BlockIter, BlockReader};
use crate::config::{footer_size, header_size, HashId, DEFAULT_BLOCK_SIZE, MAGIC};
use crate::errfmt;
use crate::error::Result;
use crate::iter::{FilteringRefIter, Iter, RecordIter};
use crate::record::{
    is_block_type, log_key, IndexRecord, LogRecord, ObjRecord, Record, RefRecord, BLOCK_TYPE_ANY,
    BLOCK_TYPE_INDEX, BLOCK_TYPE_LOG, BLOCK_TYPE_OBJ, BLOCK_TYPE_REF,
};
use crate::source::BlockSource;
use crate::writer::CRC32;
use crate::Table;

/// Where one section's blocks live in the file.
#[derive(Debug, Clone, Copy, Default)]
struct SectionOffsets {
    present: bool,
    /// Offset of the first block of this type.
    offset: u64,
    /// Offset of the top-level index, or 0 if there is none.
    index_offset: u64,
}

/// Reads one reftable through a [`BlockSource`].
///
/// A Reader is immutable after open; it can be shared across threads as
/// long as each thread drives its own iterators.
pub struct Reader {
    src: Box<dyn BlockSource>,
    name: String,

    /// Size of the data area: file size minus the footer.
    size: u64,
    version: u32,
    block_size: u32,
    min_update_index: u64,
    max_update_index: u64,
    hash_id: HashId,
    object_id_len: usize,

    ref_offsets: SectionOffsets,
    obj_offsets: SectionOffsets,
    log_offsets: SectionOffsets,
}

impl Reader {
    pub fn new(src: Box<dyn BlockSource>, name: &str) -> Result<Reader> {
        let total = src.size();

        let head = src.read_block(0, header_size(2))?;
        if head.len() < header_size(1) {
            return errfmt!("{name}: too small to hold a header");
        }
        if head[..4] != MAGIC {
            return errfmt!("{name}: bad magic {:?}", &head[..4]);
        }

        let block_size_field = BigEndian::read_u32(&head[4..8]);
        let version = block_size_field >> 24;
        if version != 1 && version != 2 {
            return errfmt!("{name}: no support for format version {version}");
        }
        let header_sz = header_size(version);
        let footer_sz = footer_size(version);
        if total < (header_sz + footer_sz) as u64 {
            return errfmt!("{name}: too small to hold header and footer");
        }

        let size = total - footer_sz as u64;
        let footer = src.read_block(size, footer_sz)?;
        if footer.len() != footer_sz {
            return errfmt!("{name}: short footer read");
        }
        if footer[..header_sz] != head[..header_sz] {
            return errfmt!("{name}: start header differs from tail header");
        }

        let got_crc = BigEndian::read_u32(&footer[footer_sz - 4..]);
        let want_crc = CRC32.checksum(&footer[..footer_sz - 4]);
        if got_crc != want_crc {
            return errfmt!("{name}: got CRC {got_crc:08x}, want CRC {want_crc:08x}");
        }

        let block_size = block_size_field & ((1 << 24) - 1);
        let min_update_index = BigEndian::read_u64(&head[8..16]);
        let max_update_index = BigEndian::read_u64(&head[16..24]);
        let hash_id = if version == 2 {
            match HashId([head[24], head[25], head[26], head[27]]) {
                HashId::NULL => HashId::SHA1,
                id @ (HashId::SHA1 | HashId::SHA256) => id,
                id => return errfmt!("{name}: unknown hash id {:?}", id.0),
            }
        } else {
            HashId::SHA1
        };

        let mut fields = &footer[header_sz..];
        let mut next_u64 = || {
            let v = BigEndian::read_u64(fields);
            fields = &fields[8..];
            v
        };
        let ref_index_offset = next_u64();
        let obj_offset_field = next_u64();
        let obj_index_offset = next_u64();
        let log_offset = next_u64();
        let log_index_offset = next_u64();

        let object_id_len = (obj_offset_field & 0x1f) as usize;
        let obj_offset = obj_offset_field >> 5;

        // The footer does not say whether the file starts with refs or
        // logs; probe the first block's type byte.
        let first = src.read_block(0, header_sz + 1)?;
        if first.len() < header_sz + 1 {
            return errfmt!("{name}: short read probing the first block");
        }
        let first_block_typ = first[header_sz];

        Ok(Reader {
            src,
            name: name.to_string(),
            size,
            version,
            block_size,
            min_update_index,
            max_update_index,
            hash_id,
            object_id_len,
            ref_offsets: SectionOffsets {
                present: first_block_typ == BLOCK_TYPE_REF,
                offset: 0,
                index_offset: ref_index_offset,
            },
            obj_offsets: SectionOffsets {
                present: obj_offset > 0,
                offset: obj_offset,
                index_offset: obj_index_offset,
            },
            log_offsets: SectionOffsets {
                present: first_block_typ == BLOCK_TYPE_LOG || log_offset > 0,
                offset: log_offset,
                index_offset: log_index_offset,
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total size of the backing file.
    pub fn file_size(&self) -> u64 {
        self.size + footer_size(self.version) as u64
    }

    pub(crate) fn object_id_len(&self) -> usize {
        self.object_id_len
    }

    fn offsets(&self, typ: u8) -> &SectionOffsets {
        match typ {
            BLOCK_TYPE_REF => &self.ref_offsets,
            BLOCK_TYPE_OBJ => &self.obj_offsets,
            BLOCK_TYPE_LOG => &self.log_offsets,
            _ => panic!("no section for block type '{}'", typ as char),
        }
    }

    fn get_block(&self, off: u64, sz: usize) -> Result<Vec<u8>> {
        let mut sz = sz as u64;
        if off + sz > self.size {
            sz = self.size - off;
        }
        self.src.read_block(off, sz as usize)
    }

    /// Opens the block at `next_off`. Reading beyond the data area or
    /// hitting a block of a different type than `want_typ` yields `None`.
    fn new_block_reader(&self, next_off: u64, want_typ: u8) -> Result<Option<BlockReader>> {
        if next_off >= self.size {
            return Ok(None);
        }

        let guess = if self.block_size == 0 {
            DEFAULT_BLOCK_SIZE
        } else {
            self.block_size
        };
        let mut block = self.get_block(next_off, guess as usize)?;

        let header_off = if next_off == 0 {
            header_size(self.version)
        } else {
            0
        };
        if block.len() < header_off + 4 {
            return errfmt!("{}: truncated block at {next_off}", self.name);
        }
        let typ = block[header_off];
        if !is_block_type(typ) {
            return errfmt!("{}: unknown block type '{}'", self.name, typ as char);
        }
        if want_typ != BLOCK_TYPE_ANY && typ != want_typ {
            return Ok(None);
        }

        let payload_len = crate::block::get_u24(&block[header_off + 1..]) as usize;
        if payload_len > block.len() {
            block = self.get_block(next_off, payload_len)?;
        }

        BlockReader::new(block, header_off, self.block_size, self.hash_id.size()).map(Some)
    }

    fn tab_iter_at<R: Record>(&self, off: u64, want_typ: u8) -> Result<Option<TableIter<'_, R>>> {
        match self.new_block_reader(off, want_typ)? {
            Some(br) => Ok(Some(TableIter::new(self, off, br))),
            None => Ok(None),
        }
    }

    /// An iterator at the start of R's section.
    fn start_section<R: Record>(&self) -> Result<Option<TableIter<'_, R>>> {
        self.tab_iter_at(self.offsets(R::typ()).offset, R::typ())
    }

    /// An iterator at the start of the top-level index of `typ`'s section.
    fn start_index(&self, typ: u8) -> Result<Option<TableIter<'_, IndexRecord>>> {
        let off = self.offsets(typ).index_offset;
        if off == 0 {
            return Ok(None);
        }
        self.tab_iter_at(off, BLOCK_TYPE_INDEX)
    }

    /// Iterates `it` block by block to just before `want_key`.
    fn seek_linear<R: Record>(&self, it: &mut TableIter<'_, R>, want_key: &[u8]) -> Result<()> {
        let mut rec = R::default();
        loop {
            let mut probe = it.clone();
            if !probe.next_block()? {
                break;
            }
            if !probe.next(&mut rec)? {
                panic!("read from a fresh block failed");
            }
            if rec.key().as_slice() > want_key {
                break;
            }
            *it = probe;
        }
        it.bi = it.block.seek::<R>(want_key)?;
        Ok(())
    }

    /// Seeks through the index levels down to the data block holding
    /// `want_key`.
    fn seek_indexed<R: Record>(&self, want_key: &[u8]) -> Result<Option<TableIter<'_, R>>> {
        let Some(mut idx_iter) = self.start_index(R::typ())? else {
            return Ok(None);
        };
        self.seek_linear(&mut idx_iter, want_key)?;

        loop {
            let mut rec = IndexRecord::default();
            if !idx_iter.next(&mut rec)? {
                return Ok(None);
            }

            let Some(br) = self.new_block_reader(rec.offset, BLOCK_TYPE_ANY)? else {
                return errfmt!(
                    "{}: index entry points at missing block {}",
                    self.name,
                    rec.offset
                );
            };

            let typ = br.block_type();
            if typ == R::typ() {
                let mut it = TableIter::<R>::new(self, rec.offset, br);
                it.bi = it.block.seek::<R>(want_key)?;
                return Ok(Some(it));
            }
            if typ != BLOCK_TYPE_INDEX {
                panic!("got block type '{}' following indexes", typ as char);
            }

            let mut it = TableIter::<IndexRecord>::new(self, rec.offset, br);
            it.bi = it.block.seek::<IndexRecord>(want_key)?;
            idx_iter = it;
        }
    }

    /// An iterator positioned just before `key` within R's section, or
    /// `None` when the section is absent or the seek runs past its end.
    pub(crate) fn seek<R: Record>(&self, key: &[u8]) -> Result<Option<TableIter<'_, R>>> {
        if !self.offsets(R::typ()).present {
            return Ok(None);
        }
        if key == R::default().key().as_slice() {
            return self.start_section::<R>();
        }
        if self.offsets(R::typ()).index_offset > 0 {
            return self.seek_indexed(key);
        }

        let Some(mut it) = self.start_section::<R>()? else {
            return Ok(None);
        };
        self.seek_linear(&mut it, key)?;
        Ok(Some(it))
    }

    fn refs_for_indexed(&self, oid: &[u8]) -> Result<Iter<'_, RefRecord>> {
        let want = &oid[..self.object_id_len];

        let Some(mut it) = self.seek::<ObjRecord>(want)? else {
            return Ok(Iter::empty());
        };
        let mut got = ObjRecord::default();
        if !it.next(&mut got)? || got.hash_prefix != want {
            return Ok(Iter::empty());
        }

        let mut iter = IndexedTableRefIter {
            r: self,
            oid: oid.to_vec(),
            offsets: got.offsets.into(),
            block: None,
            bi: BlockIter::default(),
            finished: false,
        };
        iter.next_block()?;
        Ok(Iter::new(Box::new(iter)))
    }
}

impl Table for Reader {
    fn min_update_index(&self) -> u64 {
        self.min_update_index
    }

    fn max_update_index(&self) -> u64 {
        self.max_update_index
    }

    fn hash_id(&self) -> HashId {
        self.hash_id
    }

    fn seek_ref(&self, name: &str) -> Result<Iter<'_, RefRecord>> {
        match self.seek::<RefRecord>(name.as_bytes())? {
            Some(it) => Ok(Iter::new(Box::new(it))),
            None => Ok(Iter::empty()),
        }
    }

    fn seek_log(&self, name: &str, update_index: u64) -> Result<Iter<'_, LogRecord>> {
        match self.seek::<LogRecord>(&log_key(name, update_index))? {
            Some(it) => Ok(Iter::new(Box::new(it))),
            None => Ok(Iter::empty()),
        }
    }

    /// Iterates over the refs whose value or target value is `oid`, via the
    /// object index when the table has one.
    fn refs_for(&self, oid: &[u8]) -> Result<Iter<'_, RefRecord>> {
        if self.obj_offsets.present {
            return self.refs_for_indexed(oid);
        }

        let Some(it) = self.start_section::<RefRecord>()? else {
            return Ok(Iter::empty());
        };
        Ok(Iter::new(Box::new(FilteringRefIter::new(
            oid.to_vec(),
            Box::new(it),
            None,
        ))))
    }
}

/// Iterates one section of one table, advancing block by block.
#[derive(Clone)]
pub(crate) struct TableIter<'r, R: Record> {
    r: &'r Reader,
    block_off: u64,
    block: BlockReader,
    bi: BlockIter,
    finished: bool,
    _marker: PhantomData<R>,
}

impl<'r, R: Record> TableIter<'r, R> {
    fn new(r: &'r Reader, block_off: u64, block: BlockReader) -> TableIter<'r, R> {
        let bi = block.start();
        TableIter {
            r,
            block_off,
            block,
            bi,
            finished: false,
            _marker: PhantomData,
        }
    }

    fn next_block(&mut self) -> Result<bool> {
        let next_off = self.block_off + self.block.full_block_size() as u64;
        match self.r.new_block_reader(next_off, R::typ())? {
            Some(br) => {
                self.bi = br.start();
                self.block = br;
                self.block_off = next_off;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn next(&mut self, rec: &mut R) -> Result<bool> {
        loop {
            if self.finished {
                return Ok(false);
            }
            if self.block.next_record(&mut self.bi, rec)? {
                rec.shift_update_index(self.r.min_update_index);
                return Ok(true);
            }
            if !self.next_block()? {
                self.finished = true;
            }
        }
    }
}

impl<R: Record> RecordIter<R> for TableIter<'_, R> {
    fn next(&mut self, rec: &mut R) -> Result<bool> {
        TableIter::next(self, rec)
    }
}

/// Iterates the ref blocks named by one object-index record, filtering for
/// the wanted object id.
struct IndexedTableRefIter<'r> {
    r: &'r Reader,
    oid: Vec<u8>,

    /// Offsets of the ref blocks left to scan.
    offsets: VecDeque<u64>,
    block: Option<BlockReader>,
    bi: BlockIter,
    finished: bool,
}

impl IndexedTableRefIter<'_> {
    fn next_block(&mut self) -> Result<()> {
        let Some(off) = self.offsets.pop_front() else {
            self.finished = true;
            return Ok(());
        };
        match self.r.new_block_reader(off, BLOCK_TYPE_REF)? {
            Some(br) => {
                self.bi = br.start();
                self.block = Some(br);
                Ok(())
            }
            None => errfmt!("{}: indexed ref block at {off} does not exist", self.r.name),
        }
    }
}

impl RecordIter<RefRecord> for IndexedTableRefIter<'_> {
    fn next(&mut self, rec: &mut RefRecord) -> Result<bool> {
        loop {
            if self.finished {
                return Ok(false);
            }
            let block = self.block.as_ref().expect("positioned on a block");
            if !block.next_record(&mut self.bi, rec)? {
                self.next_block()?;
                continue;
            }
            rec.shift_update_index(self.r.min_update_index);

            if rec.value.as_deref() == Some(self.oid.as_slice())
                || rec.target_value.as_deref() == Some(self.oid.as_slice())
            {
                return Ok(true);
            }
        }
    }
}
