//
// cache/rank.rs
//
// Deterministic traversal order for the global cache
//

use std::cmp::Ordering;

/// Ids containing this character look like versioned or external module
/// paths (`github.com/x/y`); ids without it look like built-ins (`fmt`).
const EXTERNAL_MARKER: char = '.';

/// Rank of a unit id for traversal (lower = visited earlier).
///
/// - `i` when `prefixes[i]` is the first prefix the id starts with
/// - `prefixes.len()` for external-looking ids
/// - `prefixes.len() + 1` for everything else
pub fn rank(id: &str, prefixes: &[String]) -> usize {
    if let Some(i) = prefixes.iter().position(|p| id.starts_with(p.as_str())) {
        return i;
    }
    if id.contains(EXTERNAL_MARKER) {
        prefixes.len()
    } else {
        prefixes.len() + 1
    }
}

/// Orders ids by ascending rank, then lexicographically.
pub fn compare(a: &str, b: &str, prefixes: &[String]) -> Ordering {
    rank(a, prefixes)
        .cmp(&rank(b, prefixes))
        .then_with(|| a.cmp(b))
}
