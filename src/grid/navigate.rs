use thiserror::Error;

use super::propagate::EditTarget;
use super::record::StudentMarks;

/// Delay between committing the outgoing cell and activating the next one.
pub const ACTIVATE_DELAY_MS: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Experiment(usize),
    GrandTotal,
}

/// A cursor position: `(studentId, field, indicator?)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub student_id: String,
    pub column: Column,
    pub indicator: Option<usize>,
}

impl Cell {
    pub fn from_target(student_id: &str, target: EditTarget) -> Cell {
        let (column, indicator) = match target {
            EditTarget::Indicator {
                experiment,
                indicator,
            } => (Column::Experiment(experiment), Some(indicator)),
            EditTarget::ExperimentTotal { experiment } => (Column::Experiment(experiment), None),
            EditTarget::GrandTotal => (Column::GrandTotal, None),
        };
        Cell {
            student_id: student_id.to_string(),
            column,
            indicator,
        }
    }

    pub fn target(&self) -> Option<EditTarget> {
        match (self.column, self.indicator) {
            (Column::Experiment(experiment), Some(indicator)) => Some(EditTarget::Indicator {
                experiment,
                indicator,
            }),
            (Column::Experiment(experiment), None) => {
                Some(EditTarget::ExperimentTotal { experiment })
            }
            (Column::GrandTotal, None) => Some(EditTarget::GrandTotal),
            (Column::GrandTotal, Some(_)) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Left,
    Right,
    Up,
    Down,
    Enter,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Direction> {
        match s.to_ascii_lowercase().as_str() {
            "left" | "arrowleft" => Some(Direction::Left),
            "right" | "arrowright" => Some(Direction::Right),
            "up" | "arrowup" => Some(Direction::Up),
            "down" | "arrowdown" => Some(Direction::Down),
            "enter" => Some(Direction::Enter),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CellState {
    Viewing,
    Editing { cell: Cell, buffer: String },
}

/// One step of a cursor move, executed in order by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    ClearEdit,
    Commit { cell: Cell, raw: String },
    Activate { cell: Cell, after_ms: u64 },
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NavError {
    #[error("no cell is being edited")]
    NotEditing,
    #[error("student is not on this grid: {0}")]
    UnknownStudent(String),
    #[error("cell is outside the grid")]
    OutOfGrid,
}

/// Cursor over the (student x field x indicator) grid of one class.
#[derive(Debug, Clone)]
pub struct Navigator {
    students: Vec<String>,
    num_experiments: usize,
    num_indicators: usize,
    state: CellState,
    expanded: Option<String>,
}

impl Navigator {
    pub fn new(students: Vec<String>, num_experiments: usize, num_indicators: usize) -> Self {
        Self {
            students,
            num_experiments,
            num_indicators,
            state: CellState::Viewing,
            expanded: None,
        }
    }

    pub fn state(&self) -> &CellState {
        &self.state
    }

    pub fn expanded(&self) -> Option<&str> {
        self.expanded.as_deref()
    }

    /// Returns whether the student is expanded afterwards.
    pub fn toggle_expand(&mut self, student_id: &str) -> Result<bool, NavError> {
        self.row_of(student_id)?;
        if self.expanded.as_deref() == Some(student_id) {
            self.expanded = None;
            Ok(false)
        } else {
            self.expanded = Some(student_id.to_string());
            Ok(true)
        }
    }

    /// Viewing -> Editing. Expands the student's indicator rows.
    pub fn start_edit(&mut self, cell: Cell, initial: String) -> Result<(), NavError> {
        self.row_of(&cell.student_id)?;
        if cell.target().is_none() || !self.in_grid(&cell) {
            return Err(NavError::OutOfGrid);
        }
        self.expanded = Some(cell.student_id.clone());
        self.state = CellState::Editing {
            cell,
            buffer: initial,
        };
        Ok(())
    }

    /// Replaces the edit buffer; only digits and `.` are kept.
    pub fn set_buffer(&mut self, text: &str) -> Result<&str, NavError> {
        let CellState::Editing { buffer, .. } = &mut self.state else {
            return Err(NavError::NotEditing);
        };
        *buffer = text
            .chars()
            .filter(|c| c.is_ascii_digit() || *c == '.')
            .collect();
        Ok(buffer.as_str())
    }

    /// Enter/blur: leaves edit mode and hands back the cell to commit.
    pub fn commit(&mut self) -> Result<(Cell, String), NavError> {
        match std::mem::replace(&mut self.state, CellState::Viewing) {
            CellState::Editing { cell, buffer } => Ok((cell, buffer)),
            CellState::Viewing => Err(NavError::NotEditing),
        }
    }

    /// Escape: drops the buffer and collapses the expanded row.
    pub fn cancel(&mut self) -> Result<Cell, NavError> {
        match std::mem::replace(&mut self.state, CellState::Viewing) {
            CellState::Editing { cell, .. } => {
                self.expanded = None;
                Ok(cell)
            }
            CellState::Viewing => Err(NavError::NotEditing),
        }
    }

    /// Puts an edit back after its commit was refused. Expansion is left alone.
    pub fn resume(&mut self, cell: Cell, buffer: String) {
        self.state = CellState::Editing { cell, buffer };
    }

    /// Leaves edit mode and plans the move: clear the edit, commit the old
    /// cell if its buffer is not empty, then activate the destination.
    pub fn plan_move(&mut self, direction: Direction) -> Result<Vec<Step>, NavError> {
        let CellState::Editing { cell, buffer } =
            std::mem::replace(&mut self.state, CellState::Viewing)
        else {
            return Err(NavError::NotEditing);
        };

        let destination = self.destination(&cell, direction);
        let mut steps = vec![Step::ClearEdit];
        if !buffer.is_empty() {
            steps.push(Step::Commit { cell, raw: buffer });
        }
        steps.push(Step::Activate {
            cell: destination,
            after_ms: ACTIVATE_DELAY_MS,
        });
        Ok(steps)
    }

    /// Where `direction` leads from `from`. Edges keep the cursor in place.
    pub fn destination(&self, from: &Cell, direction: Direction) -> Cell {
        let mut next = from.clone();
        let Ok(row) = self.row_of(&from.student_id) else {
            return next;
        };
        let last_indicator = self.num_indicators.saturating_sub(1);
        let next_student = self.students.get(row + 1).cloned();

        match (direction, from.indicator) {
            (Direction::Left | Direction::Right, Some(_)) => {}
            (Direction::Left, None) => {
                next.column = match from.column {
                    Column::GrandTotal if self.num_experiments > 0 => {
                        Column::Experiment(self.num_experiments - 1)
                    }
                    Column::Experiment(e) if e > 0 => Column::Experiment(e - 1),
                    other => other,
                };
            }
            (Direction::Right, None) => {
                next.column = match from.column {
                    Column::Experiment(e) if e + 1 < self.num_experiments => {
                        Column::Experiment(e + 1)
                    }
                    Column::Experiment(_) => Column::GrandTotal,
                    Column::GrandTotal => Column::GrandTotal,
                };
            }
            (Direction::Up, Some(i)) => {
                next.indicator = if i > 0 { Some(i - 1) } else { None };
            }
            (Direction::Up, None) => {
                if row > 0 {
                    next.student_id = self.students[row - 1].clone();
                }
            }
            (Direction::Down, None) => {
                if let Some(s) = next_student {
                    next.student_id = s;
                }
            }
            (Direction::Down | Direction::Enter, Some(i)) => {
                if i < last_indicator {
                    next.indicator = Some(i + 1);
                } else if let Some(s) = next_student {
                    next.student_id = s;
                    next.indicator = None;
                }
            }
            (Direction::Enter, None) => match from.column {
                Column::Experiment(_) if self.num_indicators > 0 => next.indicator = Some(0),
                Column::Experiment(_) => {}
                Column::GrandTotal => {
                    if let Some(s) = next_student {
                        next.student_id = s;
                    }
                }
            },
        }
        next
    }

    fn row_of(&self, student_id: &str) -> Result<usize, NavError> {
        self.students
            .iter()
            .position(|s| s == student_id)
            .ok_or_else(|| NavError::UnknownStudent(student_id.to_string()))
    }

    fn in_grid(&self, cell: &Cell) -> bool {
        let column_ok = match cell.column {
            Column::Experiment(e) => e < self.num_experiments,
            Column::GrandTotal => true,
        };
        column_ok && cell.indicator.map_or(true, |i| i < self.num_indicators)
    }
}

/// Text an edit starts from. Unset and zero cells start empty, so walking
/// over them with the cursor never writes a zero back.
///
/// The grand total starts from the stored average. Moving off that cell
/// commits it as an explicit grand-total edit, which redistributes the value
/// and fills every empty experiment.
pub fn initial_buffer(record: &StudentMarks, target: EditTarget) -> String {
    match target {
        EditTarget::Indicator {
            experiment,
            indicator,
        } => record
            .experiments
            .get(experiment)
            .and_then(|e| e.scores.get(indicator).copied().flatten())
            .filter(|v| *v != 0)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        EditTarget::ExperimentTotal { experiment } => record
            .experiments
            .get(experiment)
            .and_then(|e| e.total)
            .filter(|v| *v != 0)
            .map(|v| v.to_string())
            .unwrap_or_default(),
        EditTarget::GrandTotal => record
            .total_marks
            .filter(|v| *v != 0.0)
            .map(|v| v.to_string())
            .unwrap_or_default(),
    }
}
