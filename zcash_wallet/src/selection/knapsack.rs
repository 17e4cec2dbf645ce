//! The randomized knapsack fallback used when branch-and-bound finds no solution.

use rand::{seq::SliceRandom, Rng};
use rand_core::RngCore;
use tracing::trace;

use super::{OutputGroup, Selection, MIN_CHANGE};

const APPROXIMATION_ITERATIONS: usize = 1000;

/// Selects groups whose value is at least `target`, preferring an exact match, then a
/// subset leaving at least [`MIN_CHANGE`], then the smallest single larger group.
pub fn knapsack_solver<R: RngCore>(
    target: u64,
    mut groups: Vec<OutputGroup>,
    rng: &mut R,
) -> Option<Selection> {
    groups.shuffle(rng);

    let mut lowest_larger: Option<OutputGroup> = None;
    let mut applicable = vec![];
    let mut total_lower = 0u64;
    for group in groups {
        if group.value == target {
            return Some(Selection::from_groups([&group], false));
        } else if group.value < target + MIN_CHANGE {
            total_lower += group.value;
            applicable.push(group);
        } else if lowest_larger
            .as_ref()
            .map_or(true, |larger| group.value < larger.value)
        {
            lowest_larger = Some(group);
        }
    }

    if total_lower == target {
        return Some(Selection::from_groups(&applicable, false));
    }
    if total_lower < target {
        return lowest_larger.map(|g| Selection::from_groups([&g], false));
    }

    applicable.sort_by(|a, b| b.value.cmp(&a.value));
    let (mut best, mut best_value) = approximate_best_subset(&applicable, total_lower, target, rng);
    if best_value != target && total_lower >= target + MIN_CHANGE {
        (best, best_value) = approximate_best_subset(&applicable, total_lower, target + MIN_CHANGE, rng);
    }

    match lowest_larger {
        Some(larger)
            if (best_value != target && best_value < target + MIN_CHANGE)
                || larger.value <= best_value =>
        {
            Some(Selection::from_groups([&larger], false))
        }
        _ => {
            trace!("Knapsack selected a subset totalling {}", best_value);
            Some(Selection::from_groups(
                applicable
                    .iter()
                    .zip(best)
                    .filter_map(|(g, included)| included.then_some(g)),
                false,
            ))
        }
    }
}

/// Searches randomly for the subset of `groups` with the smallest total at least
/// `target`. Returns the inclusion flags and the total.
fn approximate_best_subset<R: RngCore>(
    groups: &[OutputGroup],
    total_lower: u64,
    target: u64,
    rng: &mut R,
) -> (Vec<bool>, u64) {
    let mut best = vec![true; groups.len()];
    let mut best_value = total_lower;

    for _ in 0..APPROXIMATION_ITERATIONS {
        if best_value == target {
            break;
        }
        let mut included = vec![false; groups.len()];
        let mut total = 0;
        let mut reached_target = false;
        for pass in 0..2 {
            if reached_target {
                break;
            }
            for (i, group) in groups.iter().enumerate() {
                // The first pass includes at random; the second includes everything
                // left out by the first.
                let include = if pass == 0 { rng.gen_bool(0.5) } else { !included[i] };
                if include {
                    total += group.value;
                    included[i] = true;
                    if total >= target {
                        reached_target = true;
                        if total < best_value {
                            best_value = total;
                            best = included.clone();
                        }
                        total -= group.value;
                        included[i] = false;
                    }
                }
            }
        }
    }
    (best, best_value)
}
