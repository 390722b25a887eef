use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;

use crate::config::{MAX_EXPERIMENT_MARKS, MAX_GRAND_TOTAL, MAX_INDICATOR_MARKS};

use super::validate::round_2_decimals;

/// Integer mark held by an indicator or an experiment total.
pub type Score = i64;

pub const EMPTY_DISPLAY: &str = "\u{2014}";
pub const GRAND_TOTAL_FIELD: &str = "totalMarks";
const EXPERIMENT_PREFIX: &str = "Exp";

/// Column layout of one class: its indicator labels and experiment count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridShape {
    pub indicators: Vec<String>,
    pub num_experiments: usize,
}

impl GridShape {
    pub fn new(indicators: Vec<String>, num_experiments: usize) -> Self {
        Self {
            indicators,
            num_experiments,
        }
    }

    /// Wire key of a 0-based experiment index (`Exp1`, `Exp2`, ...).
    pub fn experiment_key(idx: usize) -> String {
        format!("{}{}", EXPERIMENT_PREFIX, idx + 1)
    }

    /// 0-based index of an `Exp<N>` key, if it names an experiment of this class.
    pub fn experiment_index(&self, key: &str) -> Option<usize> {
        let n: usize = key.strip_prefix(EXPERIMENT_PREFIX)?.parse().ok()?;
        if n == 0 || n > self.num_experiments {
            return None;
        }
        Some(n - 1)
    }

    pub fn indicator_index(&self, label: &str) -> Option<usize> {
        self.indicators.iter().position(|l| l == label)
    }

    pub fn empty_record(&self) -> StudentMarks {
        StudentMarks {
            experiments: (0..self.num_experiments)
                .map(|_| Experiment {
                    scores: vec![None; self.indicators.len()],
                    total: None,
                })
                .collect(),
            total_marks: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Experiment {
    pub scores: Vec<Option<Score>>,
    pub total: Option<Score>,
}

impl Experiment {
    /// Sum of the indicator scores with unset scores counted as 0.
    pub fn indicator_sum(&self) -> Score {
        self.scores.iter().map(|s| s.unwrap_or(0)).sum()
    }
}

/// One student's marks for a class, in experiment then indicator order.
#[derive(Debug, Clone, PartialEq)]
pub struct StudentMarks {
    pub experiments: Vec<Experiment>,
    pub total_marks: Option<f64>,
}

impl StudentMarks {
    /// Average of the experiment totals that are set, to 2 decimal places.
    pub fn average_of_totals(&self) -> Option<f64> {
        let known: Vec<Score> = self.experiments.iter().filter_map(|e| e.total).collect();
        if known.is_empty() {
            return None;
        }
        let sum: Score = known.iter().sum();
        Some(round_2_decimals(sum as f64 / known.len() as f64))
    }

    pub fn to_wire(&self, shape: &GridShape) -> MarksRecord {
        let mut experiments = BTreeMap::new();
        let mut experiment_totals = BTreeMap::new();
        for (e_idx, exp) in self.experiments.iter().enumerate() {
            let key = GridShape::experiment_key(e_idx);
            let scores: BTreeMap<String, Option<Score>> = shape
                .indicators
                .iter()
                .zip(exp.scores.iter())
                .map(|(label, v)| (label.clone(), *v))
                .collect();
            experiments.insert(key.clone(), scores);
            experiment_totals.insert(key, exp.total);
        }
        MarksRecord {
            experiments,
            experiment_totals,
            total_marks: self.total_marks,
        }
    }

    /// Builds a record from the wire shape, rejecting unknown keys and
    /// out-of-range values. Missing entries are unset.
    pub fn from_wire(shape: &GridShape, wire: &MarksRecord) -> Result<StudentMarks, String> {
        let mut out = shape.empty_record();

        for (key, scores) in &wire.experiments {
            let e_idx = shape
                .experiment_index(key)
                .ok_or_else(|| format!("unknown experiment: {key}"))?;
            for (label, v) in scores {
                let i_idx = shape
                    .indicator_index(label)
                    .ok_or_else(|| format!("unknown indicator: {label}"))?;
                if let Some(v) = v {
                    if !(0..=MAX_INDICATOR_MARKS).contains(v) {
                        return Err(format!(
                            "{key}/{label} must be between 0 and {MAX_INDICATOR_MARKS}"
                        ));
                    }
                }
                out.experiments[e_idx].scores[i_idx] = *v;
            }
        }

        for (key, v) in &wire.experiment_totals {
            let e_idx = shape
                .experiment_index(key)
                .ok_or_else(|| format!("unknown experiment: {key}"))?;
            if let Some(v) = v {
                if !(0..=MAX_EXPERIMENT_MARKS).contains(v) {
                    return Err(format!(
                        "{key} total must be between 0 and {MAX_EXPERIMENT_MARKS}"
                    ));
                }
            }
            out.experiments[e_idx].total = *v;
        }

        if let Some(t) = wire.total_marks {
            if !t.is_finite() || !(0.0..=MAX_GRAND_TOTAL).contains(&t) {
                return Err(format!("totalMarks must be between 0 and {MAX_GRAND_TOTAL}"));
            }
            out.total_marks = Some(round_2_decimals(t));
        }

        Ok(out)
    }

    /// Display strings for every cell of the record.
    pub fn display(&self, shape: &GridShape) -> serde_json::Value {
        let mut experiments = serde_json::Map::new();
        let mut totals = serde_json::Map::new();
        for (e_idx, exp) in self.experiments.iter().enumerate() {
            let key = GridShape::experiment_key(e_idx);
            let scores: serde_json::Map<String, serde_json::Value> = shape
                .indicators
                .iter()
                .zip(exp.scores.iter())
                .map(|(label, v)| (label.clone(), json!(format_score(*v))))
                .collect();
            experiments.insert(key.clone(), serde_json::Value::Object(scores));
            totals.insert(key, json!(format_score(exp.total)));
        }
        json!({
            "experiments": experiments,
            "experimentTotals": totals,
            "totalMarks": format_total_marks(self.total_marks),
        })
    }
}

/// The `{experiments, experimentTotals, totalMarks}` record exchanged with
/// storage and clients.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarksRecord {
    #[serde(default)]
    pub experiments: BTreeMap<String, BTreeMap<String, Option<Score>>>,
    #[serde(default)]
    pub experiment_totals: BTreeMap<String, Option<Score>>,
    #[serde(default)]
    pub total_marks: Option<f64>,
}

pub fn format_score(v: Option<Score>) -> String {
    match v {
        Some(v) => v.to_string(),
        None => EMPTY_DISPLAY.to_string(),
    }
}

pub fn format_total_marks(v: Option<f64>) -> String {
    match v {
        Some(v) => format!("{:.2}", v),
        None => EMPTY_DISPLAY.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shape() -> GridShape {
        GridShape::new(
            ["K", "S", "A", "C", "P"].iter().map(|s| s.to_string()).collect(),
            10,
        )
    }

    #[test]
    fn experiment_keys_are_one_based_and_bounded() {
        let s = shape();
        assert_eq!(GridShape::experiment_key(0), "Exp1");
        assert_eq!(s.experiment_index("Exp1"), Some(0));
        assert_eq!(s.experiment_index("Exp10"), Some(9));
        assert_eq!(s.experiment_index("Exp11"), None);
        assert_eq!(s.experiment_index("Exp0"), None);
        assert_eq!(s.experiment_index("totalMarks"), None);
    }

    #[test]
    fn average_ignores_unset_totals() {
        let s = shape();
        let mut r = s.empty_record();
        assert_eq!(r.average_of_totals(), None);
        r.experiments[0].total = Some(20);
        r.experiments[3].total = Some(15);
        r.experiments[4].total = Some(0);
        assert_eq!(r.average_of_totals(), Some(11.67));
    }

    #[test]
    fn wire_roundtrip_keeps_nulls_and_values() {
        let s = shape();
        let mut r = s.empty_record();
        r.experiments[1].scores = vec![Some(5), None, Some(3), Some(0), None];
        r.experiments[1].total = Some(8);
        r.total_marks = Some(8.0);
        let back = StudentMarks::from_wire(&s, &r.to_wire(&s)).expect("from wire");
        assert_eq!(back, r);
    }

    #[test]
    fn from_wire_rejects_out_of_range_and_unknown_keys() {
        let s = shape();
        let mut w = MarksRecord::default();
        w.experiment_totals.insert("Exp2".into(), Some(26));
        assert!(StudentMarks::from_wire(&s, &w).is_err());

        let mut w = MarksRecord::default();
        w.experiment_totals.insert("Exp12".into(), Some(3));
        assert!(StudentMarks::from_wire(&s, &w)
            .unwrap_err()
            .contains("unknown experiment"));

        let mut w = MarksRecord::default();
        w.experiments
            .entry("Exp1".into())
            .or_default()
            .insert("Z".into(), Some(1));
        assert!(StudentMarks::from_wire(&s, &w)
            .unwrap_err()
            .contains("unknown indicator"));
    }

    #[test]
    fn display_uses_integers_two_decimals_and_dash() {
        assert_eq!(format_score(Some(4)), "4");
        assert_eq!(format_score(None), "\u{2014}");
        assert_eq!(format_total_marks(Some(18.0)), "18.00");
        assert_eq!(format_total_marks(Some(11.666)), "11.67");
        assert_eq!(format_total_marks(None), "\u{2014}");

        let s = shape();
        let mut r = s.empty_record();
        r.experiments[0].total = Some(7);
        let d = r.display(&s);
        assert_eq!(d["experimentTotals"]["Exp1"], "7");
        assert_eq!(d["experiments"]["Exp1"]["K"], "\u{2014}");
        assert_eq!(d["totalMarks"], "\u{2014}");
    }
}
