use thiserror::Error;

use crate::config::{MAX_EXPERIMENT_MARKS, MAX_INDICATOR_MARKS};

use super::distribute::{distribute, RandomSource};
use super::record::{GridShape, Score, StudentMarks, GRAND_TOTAL_FIELD};
use super::validate::{validate, Level};

/// The cell an edit lands on, resolved against a class layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditTarget {
    Indicator { experiment: usize, indicator: usize },
    ExperimentTotal { experiment: usize },
    GrandTotal,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EditError {
    #[error("field must be Exp<N> or totalMarks: {0}")]
    BadField(String),
    #[error("experiment not found: {0}")]
    UnknownExperiment(String),
    #[error("indicator not found: {0}")]
    UnknownIndicator(String),
    #[error("the grand total has no indicator rows")]
    IndicatorOnGrandTotal,
}

impl EditError {
    pub fn code(&self) -> &'static str {
        match self {
            EditError::BadField(_) | EditError::IndicatorOnGrandTotal => "bad_params",
            EditError::UnknownExperiment(_) | EditError::UnknownIndicator(_) => "not_found",
        }
    }
}

impl EditTarget {
    pub fn resolve(
        shape: &GridShape,
        field: &str,
        indicator: Option<&str>,
    ) -> Result<EditTarget, EditError> {
        if field == GRAND_TOTAL_FIELD {
            if indicator.is_some() {
                return Err(EditError::IndicatorOnGrandTotal);
            }
            return Ok(EditTarget::GrandTotal);
        }
        if !field.starts_with("Exp") {
            return Err(EditError::BadField(field.to_string()));
        }
        let experiment = shape
            .experiment_index(field)
            .ok_or_else(|| EditError::UnknownExperiment(field.to_string()))?;
        match indicator {
            None => Ok(EditTarget::ExperimentTotal { experiment }),
            Some(label) => {
                let indicator = shape
                    .indicator_index(label)
                    .ok_or_else(|| EditError::UnknownIndicator(label.to_string()))?;
                Ok(EditTarget::Indicator {
                    experiment,
                    indicator,
                })
            }
        }
    }

    pub fn level(&self) -> Level {
        match self {
            EditTarget::Indicator { .. } => Level::Indicator,
            EditTarget::ExperimentTotal { .. } => Level::Experiment,
            EditTarget::GrandTotal => Level::GrandTotal,
        }
    }

    /// `(field, indicator)` in wire form.
    pub fn field_names(&self, shape: &GridShape) -> (String, Option<String>) {
        match *self {
            EditTarget::Indicator {
                experiment,
                indicator,
            } => (
                GridShape::experiment_key(experiment),
                shape.indicators.get(indicator).cloned(),
            ),
            EditTarget::ExperimentTotal { experiment } => {
                (GridShape::experiment_key(experiment), None)
            }
            EditTarget::GrandTotal => (GRAND_TOTAL_FIELD.to_string(), None),
        }
    }
}

/// Applies one raw edit to a student's record and recomputes every
/// dependent value.
///
/// - indicator: the experiment total becomes the indicator sum (unset = 0),
///   then the grand total is re-averaged.
/// - experiment total: the indicators are redistributed to the new total,
///   then the grand total is re-averaged.
/// - grand total: experiment totals are spread (with variation) to
///   `total * N`, each experiment's indicators follow, and the grand total
///   keeps the entered value.
pub fn apply_edit(
    record: &StudentMarks,
    target: EditTarget,
    raw_value: &str,
    rng: &mut dyn RandomSource,
) -> StudentMarks {
    let value = validate(raw_value, target.level());
    let mut next = record.clone();

    match target {
        EditTarget::Indicator {
            experiment,
            indicator,
        } => {
            let Some(exp) = next.experiments.get_mut(experiment) else {
                return next;
            };
            let Some(slot) = exp.scores.get_mut(indicator) else {
                return next;
            };
            *slot = value.map(|v| v as Score);
            exp.total = Some(exp.indicator_sum());
            next.total_marks = next.average_of_totals();
        }
        EditTarget::ExperimentTotal { experiment } => {
            let Some(exp) = next.experiments.get_mut(experiment) else {
                return next;
            };
            let total = value.map(|v| v as Score);
            exp.total = total;
            if let Some(t) = total {
                spread_experiment(&mut exp.scores, t, rng);
            }
            next.total_marks = next.average_of_totals();
        }
        EditTarget::GrandTotal => {
            next.total_marks = value;
            if let Some(g) = value {
                spread_grand_total(&mut next, g, rng);
            }
        }
    }

    next
}

fn spread_experiment(scores: &mut [Option<Score>], total: Score, rng: &mut dyn RandomSource) {
    let spread = distribute(scores, total as f64, MAX_INDICATOR_MARKS, false, rng);
    for (slot, v) in scores.iter_mut().zip(spread) {
        *slot = Some(v);
    }
}

fn spread_grand_total(record: &mut StudentMarks, grand_total: f64, rng: &mut dyn RandomSource) {
    let n = record.experiments.len();
    if n == 0 {
        return;
    }
    let current: Vec<Option<Score>> = record.experiments.iter().map(|e| e.total).collect();
    let totals = distribute(
        &current,
        grand_total * n as f64,
        MAX_EXPERIMENT_MARKS,
        true,
        rng,
    );
    for (exp, total) in record.experiments.iter_mut().zip(totals) {
        exp.total = Some(total);
        spread_experiment(&mut exp.scores, total, rng);
    }
    record.total_marks = Some(grand_total);
}
