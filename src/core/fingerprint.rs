//! 64-bit SimHash fingerprints and cross-snapshot identity matching.
//!
//! Each distinct token is hashed with blake3; its frequency is added to the
//! bit positions where the hash has a 1 and subtracted where it has a 0. A
//! final bit is set when its weight is non-negative, so near-identical texts
//! land a few Hamming steps apart.

use std::collections::{HashMap, HashSet};

use indexmap::IndexMap;
use serde::Serialize;
use tracing::debug;

use crate::core::model::{Chunk, SourceKind, fresh_chunk_id};
use crate::core::text;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FingerprintError
{
    #[error("fingerprint `{0}` is not 16 hex digits")]
    Malformed(String),
}

/// First 8 bytes of the token's blake3 digest, big-endian
fn token_hash(token: &str) -> u64
{
    let digest = blake3::hash(token.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest.as_bytes()[..8]);

    u64::from_be_bytes(head)
}

/// SimHash over a token stream
pub fn simhash<I, S>(tokens: I) -> u64
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    // Frequencies in first-seen order
    let mut freq: IndexMap<String, i64> = IndexMap::new();
    for t in tokens
    {
        *freq
            .entry(
                t.as_ref()
                    .to_string(),
            )
            .or_insert(0) += 1;
    }

    let mut weights = [0i64; 64];

    for (token, count) in &freq
    {
        let h = token_hash(token);

        for (bit, w) in weights
            .iter_mut()
            .enumerate()
        {
            if (h >> bit) & 1 == 1
            {
                *w += count;
            }
            else
            {
                *w -= count;
            }
        }
    }

    weights
        .iter()
        .enumerate()
        .filter(|(_, w)| **w >= 0)
        .fold(0u64, |acc, (bit, _)| acc | (1u64 << bit))
}

/// Fingerprint of a chunk text (numeric tokens excluded)
pub fn fingerprint_text(text: &str) -> u64
{
    simhash(text::tokens(text))
}

pub fn to_hex(fp: u64) -> String
{
    format!("{fp:016x}")
}

pub fn parse_hex(s: &str) -> Result<u64, FingerprintError>
{
    if s.len() != 16
    {
        return Err(FingerprintError::Malformed(s.to_string()));
    }

    u64::from_str_radix(s, 16).map_err(|_| FingerprintError::Malformed(s.to_string()))
}

/// 1 - Hamming distance / 64
pub fn similarity(
    a: u64,
    b: u64,
) -> f64
{
    1.0 - f64::from((a ^ b).count_ones()) / 64.0
}

/// Greedy one-to-one identity assignment between consecutive chunk sets
#[derive(Debug, Clone, Copy)]
pub struct FingerprintMatcher
{
    pub min_similarity: f64,
}

impl Default for FingerprintMatcher
{
    fn default() -> Self
    {
        Self { min_similarity: 0.75 }
    }
}

/// Outcome counters of one stabilisation pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MatchStats
{
    pub inherited: usize,
    pub fresh: usize,
}

impl FingerprintMatcher
{
    pub fn new(min_similarity: f64) -> Self
    {
        Self { min_similarity }
    }

    /// Rewrite `current` ids so chunks similar to a previous chunk keep its id.
    ///
    /// Each source category is matched on its own. New chunks are visited in
    /// order and take the unused previous chunk with the highest similarity
    /// (first one wins ties); below the threshold they get a fresh id.
    pub fn stabilize(
        &self,
        previous: &[Chunk],
        current: &mut [Chunk],
    ) -> MatchStats
    {
        let mut stats = MatchStats::default();

        // Previous chunks with a decodable fingerprint, grouped by source
        let mut pools: HashMap<SourceKind, Vec<(u64, &str)>> = HashMap::new();
        for p in previous
        {
            if let Ok(fp) = p.fingerprint_value()
            {
                pools
                    .entry(p.source)
                    .or_default()
                    .push((fp, p.id.as_str()));
            }
        }

        let mut used: HashMap<SourceKind, Vec<bool>> = pools
            .iter()
            .map(|(k, v)| (*k, vec![false; v.len()]))
            .collect();

        let mut taken: HashSet<String> = HashSet::with_capacity(current.len());

        for chunk in current.iter_mut()
        {
            let inherited = match (
                chunk.fingerprint_value(),
                pools.get(&chunk.source),
                used.get_mut(&chunk.source),
            )
            {
                (Ok(fp), Some(pool), Some(flags)) => self.best_match(fp, pool, flags),
                _ => None,
            };

            let mut id = match inherited
            {
                Some(prev_id) =>
                {
                    stats.inherited += 1;
                    prev_id.to_string()
                }
                None =>
                {
                    stats.fresh += 1;
                    fresh_chunk_id(chunk.source, chunk.order, &chunk.fingerprint)
                }
            };

            // Keep ids unique inside the set
            if taken.contains(&id)
            {
                id = format!("{id}_{}", chunk.order);
            }
            taken.insert(id.clone());
            chunk.id = id;
        }

        debug!(inherited = stats.inherited, fresh = stats.fresh, "chunk_ids_stabilized");

        stats
    }

    fn best_match<'a>(
        &self,
        fp: u64,
        pool: &[(u64, &'a str)],
        used: &mut [bool],
    ) -> Option<&'a str>
    {
        let mut best: Option<(usize, f64)> = None;

        for (idx, (prev_fp, _)) in pool
            .iter()
            .enumerate()
        {
            if used
                .get(idx)
                .copied()
                .unwrap_or(true)
            {
                continue;
            }

            let sim = similarity(fp, *prev_fp);
            if best.is_none_or(|(_, s)| sim > s)
            {
                best = Some((idx, sim));
            }
        }

        match best
        {
            Some((idx, sim)) if sim >= self.min_similarity =>
            {
                used[idx] = true;
                Some(pool[idx].1)
            }
            _ => None,
        }
    }
}
