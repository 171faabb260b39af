use rayon::prelude::*;

use crate::codec::{metric, Pattern};

use super::{Level, Pivot};

/// Picks up to `count` pivots from `candidates` by farthest-first traversal.
///
/// The walk starts at the candidate farthest from the black origin pattern and
/// repeatedly adds the candidate farthest from every pivot chosen so far. Ties
/// go to the lowest artwork id, so the result only depends on the input set.
/// Selection stops early once every remaining candidate duplicates a pivot.
///
/// Levels are the rank of each pivot's distance from the origin, so level `0`
/// is the darkest/closest band.
pub fn select_pivots(candidates: &[(u64, Pattern)], count: usize) -> Vec<Pivot> {
    if candidates.is_empty() || count == 0 {
        return Vec::new();
    }

    let mut order: Vec<usize> = (0..candidates.len()).collect();
    order.sort_by_key(|&i| candidates[i].0);

    let origin = Pattern::uniform([0, 0, 0]);
    let from_origin: Vec<f32> = candidates
        .par_iter()
        .map(|(_, p)| metric(&origin, p))
        .collect();

    let first = farthest(&order, &from_origin);
    let mut chosen = vec![first];
    let mut nearest_chosen: Vec<f32> = candidates
        .par_iter()
        .map(|(_, p)| metric(&candidates[first].1, p))
        .collect();

    while chosen.len() < count.min(candidates.len()) {
        let next = farthest(&order, &nearest_chosen);
        if nearest_chosen[next] <= 0.0 {
            break;
        }
        chosen.push(next);
        let pivot = &candidates[next].1;
        nearest_chosen
            .par_iter_mut()
            .zip(candidates.par_iter())
            .for_each(|(best, (_, p))| {
                let d = metric(pivot, p);
                if d < *best {
                    *best = d;
                }
            });
    }

    chosen.sort_by(|&a, &b| {
        from_origin[a]
            .total_cmp(&from_origin[b])
            .then_with(|| candidates[a].0.cmp(&candidates[b].0))
    });
    chosen
        .into_iter()
        .enumerate()
        .map(|(rank, idx)| Pivot::new(rank as Level, candidates[idx].1.clone()))
        .collect()
}

fn farthest(order: &[usize], scores: &[f32]) -> usize {
    let mut best = order[0];
    for &i in order {
        if scores[i] > scores[best] {
            best = i;
        }
    }
    best
}
