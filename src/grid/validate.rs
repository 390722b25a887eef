use crate::config::{MAX_EXPERIMENT_MARKS, MAX_GRAND_TOTAL, MAX_INDICATOR_MARKS};

/// Which level of the score hierarchy a value belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Indicator,
    Experiment,
    GrandTotal,
}

impl Level {
    pub fn max(self) -> f64 {
        match self {
            Level::Indicator => MAX_INDICATOR_MARKS as f64,
            Level::Experiment => MAX_EXPERIMENT_MARKS as f64,
            Level::GrandTotal => MAX_GRAND_TOTAL,
        }
    }
}

/// Half-up rounding to an integer: `Int(x + 0.5)`.
pub fn round_half_up(x: f64) -> f64 {
    (x + 0.5).floor()
}

/// Half-up rounding to 2 decimal places, used for the grand total.
pub fn round_2_decimals(x: f64) -> f64 {
    ((100.0 * x) + 0.5).floor() / 100.0
}

/// Turns raw cell text into a legal mark for `level`.
///
/// Blank or non-numeric text clears the cell (`None`). Numbers are clamped to
/// `[0, level.max()]`; indicator and experiment values round to integers and the
/// grand total to 2 decimal places.
pub fn validate(raw: &str, level: Level) -> Option<f64> {
    let t = raw.trim();
    if t.is_empty() {
        return None;
    }
    let num = t.parse::<f64>().ok().filter(|v| v.is_finite())?;

    let max = level.max();
    if num < 0.0 {
        return Some(0.0);
    }
    if num > max {
        return Some(max);
    }

    match level {
        Level::GrandTotal => Some(round_2_decimals(num)),
        Level::Indicator | Level::Experiment => Some(round_half_up(num)),
    }
}
