//! Reftable: compact, append-only storage for a reference database.
//!
//! A reference database maps hierarchical names like `refs/heads/master` to
//! fixed-size binary identifiers and keeps a log of every update. The
//! on-disk unit is a [table](Reader): one immutable file of
//! prefix-compressed blocks with optional multi-level indexes and a
//! CRC-protected footer. A [`Stack`] layers tables youngest-on-top, appends
//! a fresh table per write transaction, and compacts contiguous runs so
//! read cost stays bounded.

pub mod error;

mod block;
mod config;
mod encoding;
mod iter;
mod lockfile;
mod merged;
mod reader;
mod record;
mod refname;
mod source;
mod stack;
mod writer;

pub use config::{Config, HashId, LogExpirationConfig};
pub use error::{Error, Result};
pub use iter::Iter;
pub use merged::Merged;
pub use reader::Reader;
pub use record::{LogRecord, Record, RefRecord};
pub use refname::validate_ref_name;
pub use source::{BlockSource, BytesBlockSource, FileBlockSource};
pub use stack::{Addition, CompactionStats, Stack, TableWriter};
pub use writer::{BlockStats, Stats, Writer};

/// Read access shared by single tables and merged stacks.
pub trait Table {
    fn min_update_index(&self) -> u64;
    fn max_update_index(&self) -> u64;
    fn hash_id(&self) -> HashId;

    /// An iterator over refs, positioned just before `name`.
    fn seek_ref(&self, name: &str) -> Result<Iter<'_, RefRecord>>;

    /// An iterator over log entries, positioned just before the entry for
    /// `name` at `update_index`. Entries come back newest first.
    fn seek_log(&self, name: &str, update_index: u64) -> Result<Iter<'_, LogRecord>>;

    /// An iterator over the refs whose value or target value is `oid`.
    fn refs_for(&self, oid: &[u8]) -> Result<Iter<'_, RefRecord>>;
}

/// Reads the ref `name`, or `None` if it does not exist.
pub fn read_ref(tab: &(impl Table + ?Sized), name: &str) -> Result<Option<RefRecord>> {
    let mut it = tab.seek_ref(name)?;
    let mut rec = RefRecord::default();
    if !it.next(&mut rec)? || rec.ref_name != name {
        return Ok(None);
    }
    Ok(Some(rec))
}

/// Reads the newest log entry for `name` at or below `update_index`, or
/// `None` if there is none.
pub fn read_log_at(
    tab: &(impl Table + ?Sized),
    name: &str,
    update_index: u64,
) -> Result<Option<LogRecord>> {
    let mut it = tab.seek_log(name, update_index)?;
    let mut rec = LogRecord::default();
    if !it.next(&mut rec)? || rec.ref_name != name {
        return Ok(None);
    }
    Ok(Some(rec))
}
