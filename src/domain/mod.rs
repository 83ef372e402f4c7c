pub mod prompt;
pub mod tool;
pub mod types;
