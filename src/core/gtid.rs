// src/core/gtid.rs

//! Ordering of MariaDB-style global transaction identifiers (`A-B-C`).
//!
//! Only the elector consumes this ordering, to refuse candidates that lag
//! behind the last known position of a failed master.

use std::cmp::Ordering;

/// Compares two GTID strings of the form `domain-server-sequence`.
///
/// The middle component dominates: if it differs, the greater one wins,
/// compared as a plain string. Equal middles fall through to an integer
/// comparison of the sequence.
///
/// Malformed input always compares as `Less`, never as `Equal`, so a
/// candidate with a garbled position can never be mistaken for "caught up".
pub fn compare_gtid(a: &str, b: &str) -> Ordering {
    let parts_a: Vec<&str> = a.split('-').collect();
    let parts_b: Vec<&str> = b.split('-').collect();

    if parts_a.len() != 3 || parts_b.len() != 3 {
        return Ordering::Less;
    }

    if parts_a[1] != parts_b[1] {
        return parts_a[1].cmp(parts_b[1]);
    }

    match (parts_a[2].parse::<i64>(), parts_b[2].parse::<i64>()) {
        (Ok(seq_a), Ok(seq_b)) => seq_a.cmp(&seq_b),
        _ => Ordering::Less,
    }
}

/// True when `candidate` is at least as advanced as `baseline`.
pub fn is_caught_up(candidate: &str, baseline: &str) -> bool {
    compare_gtid(candidate, baseline) != Ordering::Less
}
