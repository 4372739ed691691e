//! The auto-compacting stack of reftables backing one reference database.
//!
//! On disk a stack is a directory holding `tables.list` plus the table
//! files it names, youngest last. Writes append a fresh table under the
//! `tables.list.lock` file and commit by renaming the lockfile onto the
//! list. Reads go through a merged view that is rebuilt whenever the list
//! changes. After every committed write, a geometric compaction policy
//! keeps the stack depth logarithmic in the number of writes.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{footer_size, header_size, Config, HashId, LogExpirationConfig};
use crate::errinput;
use crate::error::{Error, Result};
use crate::lockfile::{lock_path, LockFile};
use crate::merged::Merged;
use crate::reader::Reader;
use crate::record::{LogRecord, Record, RefRecord};
use crate::refname::validate_ref_record_addition;
use crate::source::FileBlockSource;
use crate::writer::Writer;
use crate::Table;

/// Compaction statistics over the lifetime of the stack.
#[derive(Debug, Default, Clone, Copy)]
pub struct CompactionStats {
    /// Bytes written by compactions.
    pub bytes: u64,
    pub attempts: usize,
    pub failures: usize,
    /// Records written to tables, by additions and compactions alike.
    pub entries_written: u64,
}

/// The writer handed to `Stack::add` callbacks.
pub type TableWriter = Writer<BufWriter<fs::File>>;

/// An auto-compacting stack of reftables.
pub struct Stack {
    list_file: PathBuf,
    reftable_dir: PathBuf,
    cfg: Config,

    stack: Vec<Arc<Reader>>,
    merged: Merged,
    auto_compact_disabled: bool,

    pub stats: CompactionStats,
}

fn format_name(min: u64, max: u64) -> String {
    format!("0x{min:012x}-0x{max:012x}")
}

enum ReloadError {
    /// A listed table vanished between the list read and the open.
    Missing(String),
    Err(Error),
}

impl Stack {
    /// Opens the stack in `dir`, reading `tables.list` if present.
    pub fn open<P: AsRef<Path>>(dir: P, cfg: Config) -> Result<Stack> {
        let cfg = cfg.normalized();
        if cfg.hash_id != HashId::SHA1 && cfg.hash_id != HashId::SHA256 {
            return errinput!("unknown hash id {:?}", cfg.hash_id.0);
        }

        let dir = dir.as_ref().to_path_buf();
        let mut st = Stack {
            list_file: dir.join("tables.list"),
            reftable_dir: dir,
            merged: Merged::new(Vec::new(), cfg.hash_id).with_suppress_deletions(true),
            cfg,
            stack: Vec::new(),
            auto_compact_disabled: false,
            stats: CompactionStats::default(),
        };
        st.reload(true)?;
        Ok(st)
    }

    /// The merged view of the stack. Valid until the next write, as writes
    /// may trigger reloads.
    pub fn merged(&self) -> &Merged {
        &self.merged
    }

    /// The update index at which the next table will be written.
    pub fn next_update_index(&self) -> u64 {
        self.stack.last().map_or(1, |r| r.max_update_index() + 1)
    }

    pub fn disable_auto_compact(&mut self, disable: bool) {
        self.auto_compact_disabled = disable;
    }

    fn read_names(&self) -> Result<Vec<String>> {
        match fs::read_to_string(&self.list_file) {
            Ok(content) => Ok(content
                .lines()
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn reload_once(
        &mut self,
        names: &[String],
        reuse_open: bool,
    ) -> std::result::Result<(), ReloadError> {
        let cur: HashMap<&str, &Arc<Reader>> =
            self.stack.iter().map(|r| (r.name(), r)).collect();

        let mut new_tables = Vec::with_capacity(names.len());
        for name in names {
            if reuse_open {
                if let Some(rd) = cur.get(name.as_str()) {
                    new_tables.push(Arc::clone(rd));
                    continue;
                }
            }

            let path = self.reftable_dir.join(name);
            let src = match FileBlockSource::open(&path) {
                Ok(src) => src,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(ReloadError::Missing(name.clone()))
                }
                Err(e) => return Err(ReloadError::Err(e.into())),
            };
            let rd = Reader::new(Box::new(src), name).map_err(ReloadError::Err)?;
            new_tables.push(Arc::new(rd));
        }

        drop(cur);
        // Readers that dropped out close once their last iterator goes.
        self.stack = new_tables;
        Ok(())
    }

    /// Re-reads `tables.list` until it is stable across the open of every
    /// listed table, then rebuilds the merged view.
    fn reload(&mut self, reuse_open: bool) -> Result<()> {
        let deadline = Instant::now() + Duration::from_millis(2500);
        let mut delay = Duration::ZERO;
        loop {
            let names = self.read_names()?;
            match self.reload_once(&names, reuse_open) {
                Ok(()) => break,
                Err(ReloadError::Err(e)) => return Err(e),
                Err(ReloadError::Missing(missing)) => {
                    // A concurrent compaction may have renamed tables
                    // between the list read and the open. Only report the
                    // missing table once the list has stabilised.
                    let after = self.read_names()?;
                    if after == names || Instant::now() >= deadline {
                        return Err(Error::Io(format!("table {missing} does not exist")));
                    }
                    delay = delay * 2 + Duration::from_millis(1);
                    std::thread::sleep(delay);
                }
            }
        }

        for rd in &self.stack {
            if rd.hash_id() != self.cfg.hash_id {
                return errinput!(
                    "table {} has hash id {:?}, want {:?}",
                    rd.name(),
                    rd.hash_id().0,
                    self.cfg.hash_id.0
                );
            }
        }

        self.merged = Merged::new(self.stack.clone(), self.cfg.hash_id)
            .with_suppress_deletions(true);
        Ok(())
    }

    /// Whether the in-memory stack matches `tables.list` on disk.
    fn up_to_date(&self) -> Result<bool> {
        let names = self.read_names()?;
        if names.len() != self.stack.len() {
            return Ok(false);
        }
        Ok(self.stack.iter().zip(&names).all(|(r, n)| r.name() == n))
    }

    /// Adds a new table to the stack, transactionally. The callback must
    /// call `set_limits` and add records in ascending key order.
    ///
    /// On `Error::LockFailure` the stack has been reloaded; the caller may
    /// retry the transaction on fresh data.
    pub fn add<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut TableWriter) -> Result<()>,
    {
        if let Err(e) = self.try_add(write) {
            if e == Error::LockFailure {
                if let Err(reload_err) = self.reload(true) {
                    warn!(error = %reload_err, "reload after lock failure failed");
                }
            }
            return Err(e);
        }

        if self.auto_compact_disabled {
            return Ok(());
        }
        self.auto_compact()
    }

    fn try_add<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut TableWriter) -> Result<()>,
    {
        let mut tr = self.new_addition()?;
        tr.add(write)?;
        tr.commit()
    }

    /// Starts an addition transaction, taking the stack lockfile.
    pub fn new_addition(&mut self) -> Result<Addition<'_>> {
        let lock = LockFile::acquire(lock_path(&self.list_file))?;

        if !self.up_to_date()? {
            return Err(Error::LockFailure);
        }

        let names = self.stack.iter().map(|r| r.name().to_string()).collect();
        let next_update_index = self.next_update_index();
        Ok(Addition {
            stack: self,
            lock: Some(lock),
            names,
            new_tables: Vec::new(),
            next_update_index,
        })
    }

    /// Table sizes with the fixed per-file overhead removed, so size
    /// buckets reflect the stored records.
    fn table_sizes_for_compaction(&self) -> Vec<u64> {
        let version = self.cfg.hash_id.version();
        let overhead = (header_size(version) + footer_size(version) - 1) as u64;
        self.stack.iter().map(|r| r.file_size() - overhead).collect()
    }

    /// Compacts the stack if it looks imbalanced.
    pub fn auto_compact(&mut self) -> Result<()> {
        let sizes = self.table_sizes_for_compaction();
        if let Some(seg) = suggest_compaction_segment(&sizes) {
            self.compact_range_stats(seg.start, seg.end - 1, None)?;
        }
        Ok(())
    }

    /// Compacts the entire stack, optionally expiring log entries.
    pub fn compact_all(&mut self, expiration: Option<&LogExpirationConfig>) -> Result<()> {
        if self.stack.is_empty() {
            return Ok(());
        }
        self.compact_range(0, self.stack.len() - 1, expiration)?;
        Ok(())
    }

    fn compact_range_stats(
        &mut self,
        first: usize,
        last: usize,
        expiration: Option<&LogExpirationConfig>,
    ) -> Result<bool> {
        let res = self.compact_range(first, last, expiration);
        if !matches!(res, Ok(true)) {
            self.stats.failures += 1;
        }
        res
    }

    /// Merges tables `[first, last]` into one. Busy locks are a benign
    /// no-op (`Ok(false)`), so concurrent compactions never starve each
    /// other.
    fn compact_range(
        &mut self,
        first: usize,
        last: usize,
        expiration: Option<&LogExpirationConfig>,
    ) -> Result<bool> {
        if first >= last && expiration.is_none() {
            return Ok(true);
        }
        self.stats.attempts += 1;

        let list_lock_path = lock_path(&self.list_file);
        let stack_lock = match LockFile::acquire(&list_lock_path) {
            Ok(lock) => lock,
            Err(Error::LockFailure) => return Ok(false),
            Err(e) => return Err(e),
        };

        if !self.up_to_date()? {
            return Ok(false);
        }

        let mut table_locks = Vec::new();
        let mut delete_on_success = Vec::new();
        for i in first..=last {
            let table_path = self.reftable_dir.join(self.stack[i].name());
            match LockFile::acquire(lock_path(&table_path)) {
                Ok(lock) => table_locks.push(lock),
                Err(Error::LockFailure) => return Ok(false),
                Err(e) => return Err(e),
            }
            delete_on_success.push(table_path);
        }

        // The merge can run without the stack lock; the per-table locks
        // keep competing compactions off this range.
        drop(stack_lock);

        let mut empty_table = false;
        let mut compacted = None;
        match self.compact_locked(first, last, expiration) {
            Ok((tmp, entries)) => {
                self.stats.entries_written += entries;
                compacted = Some(tmp);
            }
            // Compaction plus tombstones can empty out non-empty tables.
            Err(Error::EmptyTable) => empty_table = true,
            Err(e) => return Err(e),
        }

        let mut stack_lock = LockFile::acquire(&list_lock_path)?;

        let file_name = format!(
            "{}.ref",
            format_name(
                self.stack[first].min_update_index(),
                self.stack[last].max_update_index()
            )
        );
        let dest_table = self.reftable_dir.join(&file_name);

        if let Some(tmp) = compacted {
            let size = tmp.as_file().metadata()?.len();
            tmp.persist(&dest_table)
                .map_err(|e| Error::Io(e.to_string()))?;
            self.stats.bytes += size;
        }

        let mut names = Vec::new();
        for rd in &self.stack[..first] {
            names.push(rd.name().to_string());
        }
        if !empty_table {
            names.push(file_name.clone());
        }
        for rd in &self.stack[last + 1..] {
            names.push(rd.name().to_string());
        }

        if let Err(e) = stack_lock.write_all(names.join("\n").as_bytes()) {
            let _ = fs::remove_file(&dest_table);
            return Err(e);
        }
        if let Err(e) = stack_lock.commit(&self.list_file) {
            let _ = fs::remove_file(&dest_table);
            return Err(e);
        }

        for path in &delete_on_success {
            // Reflog expiry over a full compaction can produce a new file
            // under the same (min, max) name; leave that one alone.
            if *path != dest_table {
                let _ = fs::remove_file(path);
            }
        }
        drop(table_locks);

        info!(
            first,
            last,
            output = %file_name,
            empty = empty_table,
            "compacted tables"
        );

        // After a reflog expiry the same name can hold different contents,
        // so open readers must not be reused.
        self.reload(expiration.is_none())?;
        Ok(true)
    }

    /// Writes the compacted version of tables `[first, last]` into a
    /// temporary file, returning it together with the entry count.
    fn compact_locked(
        &self,
        first: usize,
        last: usize,
        expiration: Option<&LogExpirationConfig>,
    ) -> Result<(tempfile::NamedTempFile, u64)> {
        let name = format_name(
            self.stack[first].min_update_index(),
            self.stack[last].max_update_index(),
        );
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{name}_"))
            .suffix(".ref")
            .tempfile_in(&self.reftable_dir)
            .map_err(Error::from)?;

        let file = tmp.reopen().map_err(Error::from)?;
        let mut w = Writer::new(BufWriter::new(file), &self.cfg)?;
        self.write_compact(&mut w, first, last, expiration)?;
        w.finish()?;
        tmp.as_file().sync_all()?;

        let entries =
            (w.stats().ref_stats.entries + w.stats().log_stats.entries) as u64;
        debug!(first, last, entries, "wrote compacted table");
        Ok((tmp, entries))
    }

    fn write_compact(
        &self,
        w: &mut TableWriter,
        first: usize,
        last: usize,
        expiration: Option<&LogExpirationConfig>,
    ) -> Result<()> {
        w.set_limits(
            self.stack[first].min_update_index(),
            self.stack[last].max_update_index(),
        );

        let merged = Merged::new(self.stack[first..=last].to_vec(), self.cfg.hash_id);

        let mut it = merged.seek_ref("")?;
        let mut ref_rec = RefRecord::default();
        while it.next(&mut ref_rec)? {
            // Tombstones are dropped once nothing older can lurk below.
            if first == 0 && ref_rec.is_deletion() {
                continue;
            }
            w.add_ref(&ref_rec)?;
        }

        let mut it = merged.seek_log("", u64::MAX)?;
        let mut log_rec = LogRecord::default();
        while it.next(&mut log_rec)? {
            if let Some(exp) = expiration {
                if exp.time > 0 && log_rec.time < exp.time {
                    continue;
                }
                if exp.max_update_index != 0 && log_rec.update_index > exp.max_update_index {
                    continue;
                }
                if exp.min_update_index != 0 && log_rec.update_index < exp.min_update_index {
                    continue;
                }
            }
            w.add_log(&log_rec)?;
        }
        Ok(())
    }
}

/// A transaction adding tables to the top of the stack. Dropping it without
/// committing removes all staged files and releases the lock.
pub struct Addition<'s> {
    stack: &'s mut Stack,
    lock: Option<LockFile>,
    names: Vec<String>,
    new_tables: Vec<String>,
    next_update_index: u64,
}

impl Addition<'_> {
    /// Stages one new table written by `write`. An empty table is a
    /// successful no-op. May be called multiple times per transaction.
    pub fn add<F>(&mut self, write: F) -> Result<()>
    where
        F: FnOnce(&mut TableWriter) -> Result<()>,
    {
        let staged = format_name(self.next_update_index, self.next_update_index);
        let tmp = tempfile::Builder::new()
            .prefix(&format!("{staged}-tmp-"))
            .suffix(".ref")
            .tempfile_in(&self.stack.reftable_dir)
            .map_err(Error::from)?;

        let file = tmp.reopen().map_err(Error::from)?;
        let mut w = Writer::new(BufWriter::new(file), &self.stack.cfg)?;
        write(&mut w)?;
        match w.finish() {
            Ok(()) => {}
            Err(Error::EmptyTable) => return Ok(()),
            Err(e) => return Err(e),
        }

        if w.min_update_index() < self.next_update_index {
            return Err(Error::LockFailure);
        }

        tmp.as_file().sync_all()?;

        let file_name = format!(
            "{}.ref",
            format_name(w.min_update_index(), w.max_update_index())
        );
        let dest = self.stack.reftable_dir.join(&file_name);
        tmp.persist(&dest).map_err(|e| Error::Io(e.to_string()))?;

        // Stage before validating, so a failed check cleans the file up.
        self.names.push(file_name.clone());
        self.new_tables.push(file_name);
        self.next_update_index = w.max_update_index() + 1;
        self.stack.stats.entries_written +=
            (w.stats().ref_stats.entries + w.stats().log_stats.entries) as u64;

        if !self.stack.cfg.skip_name_check {
            self.validate_new_table(&dest)?;
        }
        Ok(())
    }

    /// Reads the staged table back and checks its ref names against the
    /// current database.
    fn validate_new_table(&self, path: &Path) -> Result<()> {
        let src = FileBlockSource::open(path).map_err(Error::from)?;
        let rd = Reader::new(Box::new(src), "staged")?;
        let refs = rd.seek_ref("")?.collect_all()?;
        validate_ref_record_addition(self.stack.merged(), &refs)
    }

    /// Commits the staged tables and releases the lock.
    pub fn commit(mut self) -> Result<()> {
        if self.new_tables.is_empty() {
            return Ok(());
        }

        let mut lock = self.lock.take().expect("transaction holds the lock");
        lock.write_all(self.names.join("\n").as_bytes())?;
        lock.commit(&self.stack.list_file)?;
        self.new_tables.clear();

        self.stack.reload(true)
    }
}

impl Drop for Addition<'_> {
    fn drop(&mut self) {
        for name in &self.new_tables {
            let _ = fs::remove_file(self.stack.reftable_dir.join(name));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Segment {
    start: usize,
    /// Exclusive.
    end: usize,
    log: u32,
    bytes: u64,
}

impl Segment {
    fn size(&self) -> usize {
        self.end - self.start
    }
}

fn log2(sz: u64) -> u32 {
    assert!(sz > 0, "log2(0)");
    63 - sz.leading_zeros()
}

/// Partitions sizes into maximal runs of constant floor(log2(size)).
fn sizes_to_segments(sizes: &[u64]) -> Vec<Segment> {
    let mut res = Vec::new();
    let mut cur = Segment {
        start: 0,
        end: 0,
        log: 0,
        bytes: 0,
    };
    for (i, &sz) in sizes.iter().enumerate() {
        let log = log2(sz);
        if cur.log != log && cur.bytes > 0 {
            res.push(cur);
            cur = Segment {
                start: i,
                end: i,
                log: 0,
                bytes: 0,
            };
        }
        cur.log = log;
        cur.end = i + 1;
        cur.bytes += sz;
    }
    res.push(cur);
    res
}

/// Picks the lowest-log run of at least two tables, extended leftwards over
/// any earlier table no larger than the running sum.
fn suggest_compaction_segment(sizes: &[u64]) -> Option<Segment> {
    if sizes.is_empty() {
        return None;
    }

    let mut min_seg = Segment {
        start: 0,
        end: 0,
        log: 64,
        bytes: 0,
    };
    for seg in sizes_to_segments(sizes) {
        if seg.size() == 1 {
            continue;
        }
        if seg.log < min_seg.log {
            min_seg = seg;
        }
    }
    if min_seg.size() == 0 {
        return None;
    }

    while min_seg.start > 0 {
        let prev = min_seg.start - 1;
        if log2(min_seg.bytes) < log2(sizes[prev]) {
            break;
        }
        min_seg.start = prev;
        min_seg.bytes += sizes[prev];
    }

    Some(min_seg)
}
