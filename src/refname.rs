//! Ref-name validation and dir/file conflict checks.
//!
//! A ref name is a slash-separated path; no component may be empty, `.` or
//! `..`. Beyond shape, additions must not conflict with the existing
//! database: a ref `a` cannot coexist with a ref `a/b` in either direction.

use std::collections::HashSet;

use crate::errinput;
use crate::error::Result;
use crate::record::{Record, RefRecord};
use crate::Table;

/// Whether `name` is a well-formed ref name.
pub fn validate_ref_name(name: &str) -> bool {
    name.split('/')
        .all(|comp| !comp.is_empty() && comp != "." && comp != "..")
}

/// Whether `name` exists, looking at staged additions and deletions before
/// the table.
fn has_ref(
    tab: &dyn Table,
    additions: &[String],
    deletions: &HashSet<String>,
    name: &str,
) -> Result<bool> {
    if additions.binary_search_by(|a| a.as_str().cmp(name)).is_ok() {
        return Ok(true);
    }
    if deletions.contains(name) {
        return Ok(false);
    }

    let mut it = tab.seek_ref(name)?;
    let mut rec = RefRecord::default();
    if !it.next(&mut rec)? {
        return Ok(false);
    }
    Ok(rec.ref_name == name)
}

/// Whether any ref starting with `prefix` exists.
fn has_ref_with_prefix(
    tab: &dyn Table,
    additions: &[String],
    deletions: &HashSet<String>,
    prefix: &str,
) -> Result<bool> {
    let idx = additions.partition_point(|a| a.as_str() < prefix);
    if idx < additions.len() && additions[idx].starts_with(prefix) {
        return Ok(true);
    }

    let mut it = tab.seek_ref(prefix)?;
    let mut rec = RefRecord::default();
    loop {
        if !it.next(&mut rec)? {
            return Ok(false);
        }
        if deletions.contains(&rec.ref_name) {
            continue;
        }
        return Ok(rec.ref_name.starts_with(prefix));
    }
}

/// Validates the refs of a staged table against the current database.
pub(crate) fn validate_ref_record_addition(tab: &dyn Table, refs: &[RefRecord]) -> Result<()> {
    let mut additions = Vec::new();
    let mut deletions = HashSet::new();
    for rec in refs {
        if rec.is_deletion() {
            deletions.insert(rec.ref_name.clone());
        } else {
            additions.push(rec.ref_name.clone());
        }
    }
    additions.sort();
    validate_addition(tab, &additions, &deletions)
}

fn validate_addition(
    tab: &dyn Table,
    additions: &[String],
    deletions: &HashSet<String>,
) -> Result<()> {
    for name in additions {
        if !validate_ref_name(name) {
            return errinput!("ref {name:?} has an invalid name");
        }

        if has_ref_with_prefix(tab, additions, deletions, &format!("{name}/"))? {
            return errinput!("{name:?} is an existing ref prefix");
        }

        let mut cur = name.as_str();
        while let Some(idx) = cur.rfind('/') {
            let dir = &cur[..idx];
            if has_ref(tab, additions, deletions, dir)? {
                return errinput!("{dir:?} is an existing ref");
            }
            cur = dir;
        }
    }
    Ok(())
}
