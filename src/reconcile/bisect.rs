// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Ordered bisection diff.
//!
//! Both sequences are sorted by the same key, ties included, and the target
//! is expected to be a superset of the source (rows only go missing from the
//! source). A record placed differently on the two sides can land in the
//! wrong half and be reported as deleted. Ranges of equal length are assumed to be reconciled, which is
//! what makes this fast on large, mostly stable collections.
//!
//! # Known Limitation
//!
//! Equal lengths don't prove equal membership. If a range lost one record
//! on the source and gained an unrelated one, the lengths match and the
//! stale target row survives:
//!
//! ```text
//! source: [a, b, c, d]
//! target: [a, b, X, d]   → nothing deleted
//! ```

use std::collections::HashSet;
use std::hash::Hash;

/// Target keys with no counterpart on the source side, in target order.
pub fn find_deleted<K>(source: &[K], target: &[K]) -> Vec<K>
where
    K: Eq + Hash + Clone,
{
    let mut doomed = Vec::new();
    bisect(source, target, &mut doomed);
    doomed
}

fn bisect<K>(source: &[K], target: &[K], doomed: &mut Vec<K>)
where
    K: Eq + Hash + Clone,
{
    if source.len() == target.len() {
        return;
    }
    if source.len() <= 1 || target.len() <= 1 {
        exact_diff(source, target, doomed);
        return;
    }

    let mid = source.len() / 2;
    let boundary = &source[mid];

    // Earlier deletions shift the boundary record right on the target side.
    let start = mid.min(target.len());
    let Some(offset) = target[start..].iter().position(|k| k == boundary) else {
        exact_diff(source, target, doomed);
        return;
    };
    let split = start + offset;

    bisect(&source[..mid], &target[..split], doomed);
    bisect(&source[mid..], &target[split..], doomed);
}

fn exact_diff<K>(source: &[K], target: &[K], doomed: &mut Vec<K>)
where
    K: Eq + Hash + Clone,
{
    let present: HashSet<&K> = source.iter().collect();
    doomed.extend(target.iter().filter(|k| !present.contains(k)).cloned());
}
