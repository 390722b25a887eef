pub mod classes;
pub mod core;
pub mod cursor;
pub mod grid;
pub mod marks;
pub mod reports;
pub mod students;
