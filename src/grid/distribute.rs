use rand::Rng;
use std::cmp::Ordering;

use super::record::Score;
use super::validate::round_half_up;

/// Largest amount moved between a pair of slots by the variation pass.
const VARIATION_MAX: Score = 2;

/// Source of the variation draws, injectable so outputs can be pinned in tests.
pub trait RandomSource {
    /// Uniform integer in `low..=high`.
    fn next_in(&mut self, low: Score, high: Score) -> Score;
}

/// Thread-local generator from `rand`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_in(&mut self, low: Score, high: Score) -> Score {
        rand::rng().random_range(low..=high)
    }
}

/// Replays a fixed sequence of draws, cycling when exhausted.
#[cfg(test)]
#[derive(Debug, Clone)]
pub struct ScriptedRandom {
    values: Vec<Score>,
    pos: usize,
}

#[cfg(test)]
impl ScriptedRandom {
    pub fn new(values: Vec<Score>) -> Self {
        Self { values, pos: 0 }
    }
}

#[cfg(test)]
impl RandomSource for ScriptedRandom {
    fn next_in(&mut self, low: Score, high: Score) -> Score {
        if self.values.is_empty() {
            return low;
        }
        let v = self.values[self.pos % self.values.len()];
        self.pos += 1;
        v.clamp(low, high)
    }
}

/// Spreads `target_sum` over the slots of `existing`.
///
/// Unset and zero slots are empty; the rest are fixed and kept whenever the
/// target can be reached by filling the empty slots alone. Otherwise every
/// slot is rebuilt around the mean. Each output lies in `[0, max_per_slot]` and
/// the outputs sum to the rounded target unless `max_per_slot * len` is
/// smaller than it, in which case the shortfall is left in place.
pub fn distribute(
    existing: &[Option<Score>],
    target_sum: f64,
    max_per_slot: Score,
    allow_variation: bool,
    rng: &mut dyn RandomSource,
) -> Vec<Score> {
    let values: Vec<Score> = existing.iter().map(|v| v.unwrap_or(0)).collect();
    if values.is_empty() {
        return values;
    }
    let max = max_per_slot.max(0);
    let target = round_half_up(target_sum) as Score;

    let empty: Vec<usize> = (0..values.len()).filter(|&i| values[i] == 0).collect();
    let fixed_sum: Score = values.iter().sum();
    let remaining = target - fixed_sum;

    if remaining < 0 || remaining > max * empty.len() as Score {
        return rebuild(&values, target, max);
    }
    if empty.is_empty() {
        return values;
    }

    let mut result = values;
    fill_evenly(&mut result, &empty, remaining, max);
    if allow_variation && empty.len() > 1 {
        vary_pairs(&mut result, &empty, max, rng);
    }
    result
}

/// Integer share of `remaining` per empty slot, with the remainder handed out
/// as +1 in slot order.
fn fill_evenly(result: &mut [Score], empty: &[usize], remaining: Score, max: Score) {
    let n = empty.len() as Score;
    let base = remaining.div_euclid(n);
    let extra = remaining - base * n;
    for (k, &idx) in empty.iter().enumerate() {
        let bump = if (k as Score) < extra { 1 } else { 0 };
        result[idx] = (base + bump).min(max);
    }
}

/// Moves 1..=2 marks inside each disjoint pair of empty slots. A move that
/// would leave `[0, max]` is tried in the other direction, then skipped.
fn vary_pairs(result: &mut [Score], empty: &[usize], max: Score, rng: &mut dyn RandomSource) {
    for pair in empty.chunks_exact(2) {
        let (a, b) = (pair[0], pair[1]);
        let v = rng.next_in(1, VARIATION_MAX);
        if result[a] + v <= max && result[b] - v >= 0 {
            result[a] += v;
            result[b] -= v;
        } else if result[a] - v >= 0 && result[b] + v <= max {
            result[a] -= v;
            result[b] += v;
        }
    }
}

/// Discards the existing values and rebuilds them around `target / len`.
///
/// Slots are visited closest-to-mean first; all but the last get the rounded
/// mean, the last gets what is left. Any leftover from clamping is then
/// settled from the last-visited slot backwards.
fn rebuild(values: &[Score], target: Score, max: Score) -> Vec<Score> {
    let count = values.len();
    let ideal = target as f64 / count as f64;

    let mut order: Vec<usize> = (0..count).collect();
    order.sort_by(|&a, &b| {
        let da = (values[a] as f64 - ideal).abs();
        let db = (values[b] as f64 - ideal).abs();
        da.partial_cmp(&db).unwrap_or(Ordering::Equal)
    });

    let even = (round_half_up(ideal) as Score).clamp(0, max);
    let mut result = vec![0; count];
    let mut left = target;
    for (k, &idx) in order.iter().enumerate() {
        if k + 1 == count {
            result[idx] = left.clamp(0, max);
        } else {
            result[idx] = even;
            left -= even;
        }
    }

    settle(&mut result, &order, target, max);
    result
}

fn settle(result: &mut [Score], order: &[usize], target: Score, max: Score) {
    let mut diff = target - result.iter().sum::<Score>();
    for &idx in order.iter().rev() {
        if diff == 0 {
            break;
        }
        if diff > 0 {
            let room = (max - result[idx]).min(diff);
            result[idx] += room;
            diff -= room;
        } else {
            let give = result[idx].min(-diff);
            result[idx] -= give;
            diff += give;
        }
    }
}
