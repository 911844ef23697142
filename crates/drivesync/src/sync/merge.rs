//! Last-write-wins record merge
//!
//! Incoming records replace local ones with the same id only when their
//! `updatedAt` is strictly newer. When either side has no readable timestamp
//! the local record is kept. Merging never deletes: local records absent from
//! the incoming set stay.

use std::collections::HashMap;

use crate::models::Versioned;

/// Merge result with per-outcome counts
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport<T> {
    /// Local records with incoming changes applied, local order first
    pub merged: Vec<T>,
    /// Records that must be written back (inserted or replaced)
    pub changed: Vec<T>,
    pub inserted: usize,
    pub replaced: usize,
    /// Incoming records discarded because the local copy was not older
    pub kept_local: usize,
    /// Incoming records without an id
    pub skipped: usize,
}

impl<T> MergeReport<T> {
    pub fn has_changes(&self) -> bool {
        !self.changed.is_empty()
    }
}

/// Merge `incoming` into `existing`, newest `updatedAt` wins per id
pub fn merge<T: Versioned + Clone>(existing: Vec<T>, incoming: Vec<T>) -> Vec<T> {
    merge_with_report(existing, incoming).merged
}

/// Merge and report what changed
pub fn merge_with_report<T: Versioned + Clone>(existing: Vec<T>, incoming: Vec<T>) -> MergeReport<T> {
    let mut merged = existing;
    let mut index: HashMap<String, usize> = HashMap::with_capacity(merged.len());
    for (position, record) in merged.iter().enumerate() {
        if !record.id().is_empty() {
            index.insert(record.id().to_string(), position);
        }
    }

    // Positions in `merged` of records written by this merge
    let mut changed_positions: Vec<usize> = Vec::new();
    let (mut inserted, mut replaced, mut kept_local, mut skipped) = (0, 0, 0, 0);

    for record in incoming {
        if record.id().is_empty() {
            skipped += 1;
            continue;
        }

        match index.get(record.id()).copied() {
            None => {
                index.insert(record.id().to_string(), merged.len());
                changed_positions.push(merged.len());
                merged.push(record);
                inserted += 1;
            }
            Some(position) => {
                if is_newer(&record, &merged[position]) {
                    merged[position] = record;
                    if !changed_positions.contains(&position) {
                        changed_positions.push(position);
                        replaced += 1;
                    }
                } else {
                    kept_local += 1;
                }
            }
        }
    }

    changed_positions.sort_unstable();
    let changed = changed_positions
        .iter()
        .map(|&position| merged[position].clone())
        .collect();

    MergeReport {
        merged,
        changed,
        inserted,
        replaced,
        kept_local,
        skipped,
    }
}

/// Whether `incoming` is strictly newer than `local`
///
/// False unless both timestamps are readable.
pub fn is_newer<T: Versioned>(incoming: &T, local: &T) -> bool {
    match (incoming.updated_at(), local.updated_at()) {
        (Some(incoming), Some(local)) => incoming > local,
        _ => false,
    }
}
