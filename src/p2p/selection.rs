//! Weighted random peer choice.

use rand::Rng;
use std::collections::HashSet;

/// Pick one item from `(item, weight)` candidates.
///
/// Without hallmark protection, and on one draw in three with it, the pick is
/// uniform. Otherwise it is proportional to weight, with zero weights counted
/// as 1 so unhallmarked peers are never starved.
pub fn pick_weighted<'a, T, R: Rng + ?Sized>(
    candidates: &'a [(T, u64)],
    hallmark_protection: bool,
    rng: &mut R,
) -> Option<&'a T> {
    if candidates.is_empty() {
        return None;
    }
    if !hallmark_protection || rng.gen_range(0..3) == 0 {
        return Some(&candidates[rng.gen_range(0..candidates.len())].0);
    }
    let total: u64 = candidates
        .iter()
        .map(|(_, w)| (*w).max(1))
        .fold(0u64, u64::saturating_add);
    let mut hit = rng.gen_range(0..total);
    for (item, weight) in candidates {
        let weight = (*weight).max(1);
        if hit < weight {
            return Some(item);
        }
        hit -= weight;
    }
    candidates.last().map(|(item, _)| item)
}

/// Draw up to `want` distinct items, switching at random between the
/// `preferred` and `others` pools and falling back to whichever is non-empty.
pub fn pick_connect_set<T: Clone, R: Rng + ?Sized>(
    preferred: &[T],
    others: &[T],
    want: usize,
    rng: &mut R,
) -> Vec<T> {
    let want = want.min(preferred.len() + others.len());
    let mut seen = HashSet::new();
    let mut picked = Vec::with_capacity(want);
    for _ in 0..want.saturating_mul(8) {
        if picked.len() >= want {
            break;
        }
        let from_preferred = if rng.gen_bool(0.5) {
            !preferred.is_empty()
        } else {
            others.is_empty()
        };
        let pool = if from_preferred { preferred } else { others };
        let i = rng.gen_range(0..pool.len());
        if seen.insert((from_preferred, i)) {
            picked.push(pool[i].clone());
        }
    }
    picked
}
