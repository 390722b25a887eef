use rusqlite::Connection;
use std::collections::HashMap;

use crate::db::{self, RosterEntry};
use crate::grid::{GridShape, StudentMarks};

/// In-memory grid of one class. Edits land here first and are written back
/// by the commit worker.
#[derive(Debug, Clone)]
pub struct ClassGrid {
    pub shape: GridShape,
    pub roster: Vec<RosterEntry>,
    pub records: HashMap<String, StudentMarks>,
}

impl ClassGrid {
    pub fn load(conn: &Connection, class_id: &str) -> anyhow::Result<Option<ClassGrid>> {
        let Some(shape) = db::load_shape(conn, class_id)? else {
            return Ok(None);
        };
        let roster = db::load_roster(conn, class_id)?;
        let records = db::load_marks(conn, class_id, &shape, &roster)?;
        Ok(Some(ClassGrid {
            shape,
            roster,
            records,
        }))
    }

    /// Student ids in roster order.
    pub fn student_ids(&self) -> Vec<String> {
        self.roster.iter().map(|s| s.id.clone()).collect()
    }
}

#[derive(Debug, Default)]
pub struct GridCache {
    classes: HashMap<String, ClassGrid>,
}

impl GridCache {
    pub fn get_or_load(
        &mut self,
        conn: &Connection,
        class_id: &str,
    ) -> anyhow::Result<Option<&mut ClassGrid>> {
        if !self.classes.contains_key(class_id) {
            let Some(grid) = ClassGrid::load(conn, class_id)? else {
                return Ok(None);
            };
            log::debug!(
                "loaded grid for class {class_id}: {} students",
                grid.roster.len()
            );
            self.classes.insert(class_id.to_string(), grid);
        }
        Ok(self.classes.get_mut(class_id))
    }

    pub fn get(&self, class_id: &str) -> Option<&ClassGrid> {
        self.classes.get(class_id)
    }

    pub fn get_mut(&mut self, class_id: &str) -> Option<&mut ClassGrid> {
        self.classes.get_mut(class_id)
    }

    pub fn invalidate(&mut self, class_id: &str) {
        self.classes.remove(class_id);
    }

    pub fn clear(&mut self) {
        self.classes.clear();
    }
}
