//! Flush pipeline: stack construction, execution and junction tables.

pub mod executor;
pub mod join_table;
pub mod stack;

pub use executor::{FlushExecutor, FlushReport};
pub use join_table::{JoinTableData, JoinTableOperation};
pub use stack::{build_flush_stack, FlushEvent, FlushStack};
