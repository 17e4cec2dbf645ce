//! Branch-and-bound search for a selection that needs no change output.
//!
//! Groups are explored largest first as a binary tree of include/omit decisions. A
//! branch is abandoned once it can no longer reach the target, once it overshoots the
//! target by more than the cost of making change, or once its waste exceeds the best
//! solution found so far while fees are above their long-term level. The solution with
//! the lowest waste (input fees above long-term fees, plus any excess over the target)
//! is returned.

use tracing::trace;

use super::{OutputGroup, Selection};

/// The number of tree nodes visited before giving up.
pub const TOTAL_TRIES: usize = 100_000;

pub fn select_coins_bnb(
    mut pool: Vec<OutputGroup>,
    target: u64,
    cost_of_change: u64,
    not_input_fees: u64,
) -> Option<Selection> {
    let actual_target = (not_input_fees + target) as i64;
    let cost_of_change = cost_of_change as i64;

    let mut curr_available_value: i64 = pool.iter().map(|g| g.effective_value).sum();
    if curr_available_value < actual_target {
        return None;
    }

    pool.sort_by(|a, b| b.effective_value.cmp(&a.effective_value));

    let mut curr_value: i64 = 0;
    let mut curr_waste: i64 = 0;
    let mut curr_selection: Vec<bool> = Vec::with_capacity(pool.len());
    let mut best_selection: Vec<bool> = vec![];
    let mut best_waste = i64::MAX;
    let fees_above_long_term = pool
        .first()
        .is_some_and(|g| g.fee - g.long_term_fee > 0);

    for _ in 0..TOTAL_TRIES {
        let mut backtrack = false;
        if curr_value + curr_available_value < actual_target
            || curr_value > actual_target + cost_of_change
            || (curr_waste > best_waste && fees_above_long_term)
        {
            backtrack = true;
        } else if curr_value >= actual_target {
            let excess = curr_value - actual_target;
            if curr_waste + excess <= best_waste {
                best_selection = curr_selection.clone();
                best_selection.resize(pool.len(), false);
                best_waste = curr_waste + excess;
            }
            backtrack = true;
        }

        if backtrack {
            // Walk back to the most recent inclusion and omit it instead.
            while curr_selection.last() == Some(&false) {
                curr_selection.pop();
                curr_available_value += pool[curr_selection.len()].effective_value;
            }
            let Some(last) = curr_selection.last_mut() else {
                break;
            };
            *last = false;
            let group = &pool[curr_selection.len() - 1];
            curr_value -= group.effective_value;
            curr_waste -= group.fee - group.long_term_fee;
        } else {
            let index = curr_selection.len();
            let group = &pool[index];
            curr_available_value -= group.effective_value;
            // Omitting a group equivalent to one just omitted explores the same subtree.
            let duplicate_of_omitted = index > 0
                && curr_selection.last() == Some(&false)
                && group.effective_value == pool[index - 1].effective_value
                && group.fee == pool[index - 1].fee;
            if duplicate_of_omitted {
                curr_selection.push(false);
            } else {
                curr_selection.push(true);
                curr_value += group.effective_value;
                curr_waste += group.fee - group.long_term_fee;
            }
        }
    }

    if best_selection.is_empty() {
        return None;
    }
    trace!("Branch and bound found a solution with waste {}", best_waste);
    Some(Selection::from_groups(
        pool.iter()
            .zip(best_selection)
            .filter_map(|(g, selected)| selected.then_some(g)),
        true,
    ))
}
