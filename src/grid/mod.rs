//! Score grid engine: validation, mark redistribution, propagation through
//! the indicator -> experiment -> grand total hierarchy, and cursor navigation.

pub mod distribute;
pub mod navigate;
pub mod propagate;
pub mod record;
pub mod validate;

pub use distribute::ThreadRandom;
pub use navigate::{initial_buffer, Cell, CellState, Direction, NavError, Navigator, Step};
pub use propagate::{apply_edit, EditTarget};
pub use record::{GridShape, MarksRecord, StudentMarks};
