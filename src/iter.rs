//! Pull-based record cursors.
//!
//! Every layer (block, table, merged, filters) yields records through the
//! same contract: decode the next record into a caller-supplied buffer and
//! report whether one was produced. [`Iter`] is the public face over the
//! layered implementations.

use crate::error::Result;
use crate::record::{Record, RefRecord};
use crate::Table;

/// One layer of a record cursor chain.
pub(crate) trait RecordIter<R: Record> {
    /// Reads the next record into `rec` (returning true), or returns false
    /// when there are none left.
    fn next(&mut self, rec: &mut R) -> Result<bool>;
}

/// An iterator over the records of one section, one table, or one merged
/// stack.
pub struct Iter<'a, R: Record> {
    inner: Box<dyn RecordIter<R> + 'a>,
}

impl<'a, R: Record> Iter<'a, R> {
    pub(crate) fn new(inner: Box<dyn RecordIter<R> + 'a>) -> Iter<'a, R> {
        Iter { inner }
    }

    pub(crate) fn empty() -> Iter<'a, R> {
        Iter {
            inner: Box::new(EmptyIter),
        }
    }

    pub(crate) fn into_inner(self) -> Box<dyn RecordIter<R> + 'a> {
        self.inner
    }

    /// Reads the next record into `rec`, returning false at the end.
    pub fn next(&mut self, rec: &mut R) -> Result<bool> {
        self.inner.next(rec)
    }

    /// Drains the iterator into a vector. Convenience for tests and tools.
    pub fn collect_all(mut self) -> Result<Vec<R>> {
        let mut out = Vec::new();
        let mut rec = R::default();
        while self.next(&mut rec)? {
            out.push(rec.clone());
        }
        Ok(out)
    }
}

pub(crate) struct EmptyIter;

impl<R: Record> RecordIter<R> for EmptyIter {
    fn next(&mut self, _rec: &mut R) -> Result<bool> {
        Ok(false)
    }
}

/// Filters a ref iterator down to refs whose value or target value equals
/// one object id.
pub(crate) struct FilteringRefIter<'a> {
    oid: Vec<u8>,

    /// When set, every hit is re-seeked by name against this table, so
    /// stale object-index entries under concurrent compaction are dropped.
    double_check: Option<&'a dyn Table>,

    it: Box<dyn RecordIter<RefRecord> + 'a>,
}

impl<'a> FilteringRefIter<'a> {
    pub(crate) fn new(
        oid: Vec<u8>,
        it: Box<dyn RecordIter<RefRecord> + 'a>,
        double_check: Option<&'a dyn Table>,
    ) -> FilteringRefIter<'a> {
        FilteringRefIter {
            oid,
            double_check,
            it,
        }
    }
}

impl RecordIter<RefRecord> for FilteringRefIter<'_> {
    fn next(&mut self, rec: &mut RefRecord) -> Result<bool> {
        loop {
            if !self.it.next(rec)? {
                return Ok(false);
            }

            if let Some(tab) = self.double_check {
                let mut seek = tab.seek_ref(&rec.ref_name)?;
                let mut fresh = RefRecord::default();
                if !seek.next(&mut fresh)? || fresh.ref_name != rec.ref_name {
                    continue;
                }
                *rec = fresh;
            }

            if rec.value.as_deref() == Some(self.oid.as_slice())
                || rec.target_value.as_deref() == Some(self.oid.as_slice())
            {
                return Ok(true);
            }
        }
    }
}
