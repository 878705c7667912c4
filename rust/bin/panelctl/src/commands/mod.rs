pub mod ignored;
pub mod tasks;
