pub mod classes;
pub mod core;
pub mod evaluations;
pub mod recovery;
pub mod reports;
pub mod scores;
pub mod students;
