//! Highest-random-weight (rendezvous) hashing.
//!
//! Every replica that sees the same candidate set and key picks the same
//! winner without coordinating. Used to elect a merge leader per document.

use crate::checksum::checksum_multi;

/// Score of `candidate` for `key`.
pub fn rendezvous_score(key: &str, candidate: &str) -> u64 {
    checksum_multi([key.as_bytes(), &[0u8][..], candidate.as_bytes()]).prefix_u64()
}

/// Pick the candidate with the highest score for `key`.
///
/// Ties fall to the lexicographically greater candidate. Returns `None` for
/// an empty candidate set.
pub fn rendezvous_pick<'a, I>(key: &str, candidates: I) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    candidates
        .into_iter()
        .map(|c| (rendezvous_score(key, c), c))
        .max()
        .map(|(_, c)| c)
}
