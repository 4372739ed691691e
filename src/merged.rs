//! The merged view over a stack of tables.
//!
//! Iteration runs one sub-iterator per table and a small min-heap over their
//! current records. When several tables hold the same key, the youngest
//! table wins and the older shadows are drained. Deletion suppression is a
//! property of the view: reader-facing views hide tombstones, compaction
//! views keep them so they propagate into the compacted output.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::config::HashId;
use crate::error::Result;
use crate::iter::{EmptyIter, FilteringRefIter, Iter, RecordIter};
use crate::reader::Reader;
use crate::record::{log_key, LogRecord, Record, RefRecord};
use crate::Table;

/// A read-only view over an ordered list of tables, youngest last.
pub struct Merged {
    stack: Vec<Arc<Reader>>,
    hash_id: HashId,
    suppress_deletions: bool,
}

impl Merged {
    /// Builds a merged view. The tables must share `hash_id` and carry
    /// strictly increasing update-index ranges; violations are programmer
    /// errors.
    pub fn new(tabs: Vec<Arc<Reader>>, hash_id: HashId) -> Merged {
        let mut last_max: Option<u64> = None;
        for (i, tab) in tabs.iter().enumerate() {
            if let Some(last_max) = last_max {
                if last_max >= tab.min_update_index() {
                    panic!(
                        "table {i} has min update index {}, previous table has max {last_max}; ranges must be increasing",
                        tab.min_update_index()
                    );
                }
            }
            if tab.hash_id() != hash_id {
                panic!(
                    "table {i} has hash id {:?}, want {:?}",
                    tab.hash_id().0,
                    hash_id.0
                );
            }
            last_max = Some(tab.max_update_index());
        }

        Merged {
            stack: tabs,
            hash_id,
            suppress_deletions: false,
        }
    }

    pub(crate) fn with_suppress_deletions(mut self, suppress: bool) -> Merged {
        self.suppress_deletions = suppress;
        self
    }

    fn seek<'a, R: Record + 'a>(&'a self, key: &[u8]) -> Result<MergedIter<'a, R>> {
        let mut iters: Vec<Box<dyn RecordIter<R> + '_>> = Vec::with_capacity(self.stack.len());
        for tab in &self.stack {
            match tab.seek::<R>(key)? {
                Some(it) => iters.push(Box::new(it)),
                None => iters.push(Box::new(EmptyIter)),
            }
        }
        MergedIter::new(iters, self.suppress_deletions)
    }
}

impl Table for Merged {
    fn min_update_index(&self) -> u64 {
        self.stack.first().map_or(0, |t| t.min_update_index())
    }

    fn max_update_index(&self) -> u64 {
        self.stack.last().map_or(0, |t| t.max_update_index())
    }

    fn hash_id(&self) -> HashId {
        self.hash_id
    }

    fn seek_ref(&self, name: &str) -> Result<Iter<'_, RefRecord>> {
        let it = self.seek::<RefRecord>(name.as_bytes())?;
        Ok(Iter::new(Box::new(it)))
    }

    fn seek_log(&self, name: &str, update_index: u64) -> Result<Iter<'_, LogRecord>> {
        let it = self.seek::<LogRecord>(&log_key(name, update_index))?;
        Ok(Iter::new(Box::new(it)))
    }

    fn refs_for(&self, oid: &[u8]) -> Result<Iter<'_, RefRecord>> {
        let mut iters: Vec<Box<dyn RecordIter<RefRecord> + '_>> =
            Vec::with_capacity(self.stack.len());
        for tab in &self.stack {
            iters.push(tab.refs_for(oid)?.into_inner());
        }
        // Per-table object indexes know nothing about newer tombstones, so
        // every hit is double-checked against the merged view by name.
        let mit = MergedIter::new(iters, false)?;
        Ok(Iter::new(Box::new(FilteringRefIter::new(
            oid.to_vec(),
            Box::new(mit),
            Some(self),
        ))))
    }
}

/// One table's current record, ordered for the merge heap: ascending by
/// key, and on equal keys the younger (higher-indexed) table first.
struct PqEntry<R: Record> {
    key: Vec<u8>,
    rec: R,
    index: usize,
}

impl<R: Record> PartialEq for PqEntry<R> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.index == other.index
    }
}

impl<R: Record> Eq for PqEntry<R> {}

impl<R: Record> PartialOrd for PqEntry<R> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<R: Record> Ord for PqEntry<R> {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.index.cmp(&other.index),
            ord => ord.reverse(), // Reverse for min-heap behavior.
        }
    }
}

/// Merges the per-table iterators.
pub(crate) struct MergedIter<'a, R: Record> {
    heap: BinaryHeap<PqEntry<R>>,
    stack: Vec<Option<Box<dyn RecordIter<R> + 'a>>>,
    suppress_deletions: bool,
}

impl<'a, R: Record> MergedIter<'a, R> {
    fn new(
        iters: Vec<Box<dyn RecordIter<R> + 'a>>,
        suppress_deletions: bool,
    ) -> Result<MergedIter<'a, R>> {
        let mut merged = MergedIter {
            heap: BinaryHeap::with_capacity(iters.len()),
            stack: iters.into_iter().map(Some).collect(),
            suppress_deletions,
        };
        for index in 0..merged.stack.len() {
            merged.advance_sub_iter(index)?;
        }
        Ok(merged)
    }

    /// Pulls one record from the given table into the heap, dropping the
    /// sub-iterator once it is exhausted.
    fn advance_sub_iter(&mut self, index: usize) -> Result<()> {
        let Some(it) = &mut self.stack[index] else {
            return Ok(());
        };
        let mut rec = R::default();
        if it.next(&mut rec)? {
            self.heap.push(PqEntry {
                key: rec.key(),
                rec,
                index,
            });
        } else {
            self.stack[index] = None;
        }
        Ok(())
    }

    fn next_entry(&mut self, rec: &mut R) -> Result<bool> {
        let Some(entry) = self.heap.pop() else {
            return Ok(false);
        };
        self.advance_sub_iter(entry.index)?;

        // Drain older shadows of the same key.
        while let Some(top) = self.heap.peek() {
            if top.key > entry.key {
                break;
            }
            let top = self.heap.pop().expect("peeked entry");
            self.advance_sub_iter(top.index)?;
        }

        *rec = entry.rec;
        Ok(true)
    }
}

impl<R: Record> RecordIter<R> for MergedIter<'_, R> {
    fn next(&mut self, rec: &mut R) -> Result<bool> {
        loop {
            let ok = self.next_entry(rec)?;
            if ok && self.suppress_deletions && rec.is_deletion() {
                continue;
            }
            return Ok(ok);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::reader::tests::construct_test_table;
    use crate::record::tests::test_hash;

    fn construct_merged(tables: &[Vec<RefRecord>]) -> Merged {
        let mut tabs = Vec::new();
        for refs in tables {
            let (_, reader) = construct_test_table(refs, &[], &Config::default());
            tabs.push(Arc::new(reader));
        }
        Merged::new(tabs, HashId::SHA1)
    }

    fn ref_at(name: &str, update_index: u64, value: Option<usize>) -> RefRecord {
        RefRecord {
            ref_name: name.into(),
            update_index,
            value: value.map(test_hash),
            ..RefRecord::default()
        }
    }

    #[test]
    fn test_heap_orders_by_key_then_newest_table() {
        let mut heap = BinaryHeap::new();
        for (key, index) in [("b", 0), ("a", 0), ("a", 2), ("c", 1), ("a", 1)] {
            heap.push(PqEntry {
                key: key.as_bytes().to_vec(),
                rec: ref_at(key, 0, None),
                index,
            });
        }

        let mut got = Vec::new();
        while let Some(e) = heap.pop() {
            got.push((String::from_utf8(e.key).unwrap(), e.index));
        }
        assert_eq!(
            got,
            vec![
                ("a".to_string(), 2),
                ("a".to_string(), 1),
                ("a".to_string(), 0),
                ("b".to_string(), 0),
                ("c".to_string(), 1),
            ]
        );
    }

    #[test]
    fn test_merged_shadowing_and_deletions() {
        let t1 = vec![
            ref_at("a", 1, Some(1)),
            ref_at("b", 1, Some(1)),
            ref_at("c", 1, Some(1)),
        ];
        let t2 = vec![ref_at("a", 2, None)];
        let t3 = vec![ref_at("c", 3, Some(2)), ref_at("d", 3, Some(1))];

        // Tombstones stay visible for compaction.
        let merged = construct_merged(&[t1.clone(), t2.clone(), t3.clone()]);
        let got = merged.seek_ref("a").unwrap().collect_all().unwrap();
        assert_eq!(got, vec![t2[0].clone(), t1[1].clone(), t3[0].clone(), t3[1].clone()]);

        // A reader-facing view hides them.
        let merged = construct_merged(&[t1.clone(), t2, t3.clone()]).with_suppress_deletions(true);
        let got = merged.seek_ref("a").unwrap().collect_all().unwrap();
        assert_eq!(got, vec![t1[1].clone(), t3[0].clone(), t3[1].clone()]);
    }

    #[test]
    fn test_merged_seek_mid_stack() {
        let merged = construct_merged(&[
            vec![ref_at("a", 1, Some(1)), ref_at("m", 1, Some(1))],
            vec![ref_at("z", 2, Some(2))],
        ]);
        let got = merged.seek_ref("n").unwrap().collect_all().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].ref_name, "z");
    }

    #[test]
    fn test_merged_refs_for_masks_deleted() {
        let t1 = vec![
            ref_at("a", 1, Some(1)),
            ref_at("b", 1, Some(1)),
            ref_at("c", 1, Some(1)),
        ];
        // b is deleted later; a lookup by value must not resurrect it.
        let t2 = vec![ref_at("b", 2, None)];

        let merged =
            construct_merged(&[t1.clone(), t2]).with_suppress_deletions(true);
        let got = merged.refs_for(&test_hash(1)).unwrap().collect_all().unwrap();
        let names: Vec<&str> = got.iter().map(|r| r.ref_name.as_str()).collect();
        assert_eq!(names, vec!["a", "c"]);
    }

    #[test]
    fn test_merged_logs_newest_first_across_tables() {
        let mk_log = |idx: u64| LogRecord {
            ref_name: "branch".into(),
            update_index: idx,
            new: Some(test_hash(idx as usize)),
            message: format!("m{idx}\n"),
            ..LogRecord::default()
        };

        let mut tabs = Vec::new();
        for idx in 1..=3u64 {
            let mut buf = Vec::new();
            let mut w = crate::writer::Writer::new(&mut buf, &Config::default()).unwrap();
            w.set_limits(idx, idx);
            w.add_log(&mk_log(idx)).unwrap();
            w.finish().unwrap();
            drop(w);
            let reader = crate::reader::Reader::new(
                Box::new(crate::source::BytesBlockSource::new(buf)),
                &format!("t{idx}"),
            )
            .unwrap();
            tabs.push(Arc::new(reader));
        }

        let merged = Merged::new(tabs, HashId::SHA1);
        let got = merged.seek_log("branch", u64::MAX).unwrap().collect_all().unwrap();
        let indexes: Vec<u64> = got.iter().map(|l| l.update_index).collect();
        assert_eq!(indexes, vec![3, 2, 1]);
    }

    #[test]
    #[should_panic(expected = "ranges must be increasing")]
    fn test_merged_rejects_overlapping_ranges() {
        let (_, r1) = construct_test_table(&[ref_at("a", 5, Some(1))], &[], &Config::default());
        let (_, r2) = construct_test_table(&[ref_at("b", 5, Some(1))], &[], &Config::default());
        Merged::new(vec![Arc::new(r1), Arc::new(r2)], HashId::SHA1);
    }
}
