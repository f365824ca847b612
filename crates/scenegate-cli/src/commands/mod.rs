//! CLI command handlers.

pub mod audit;
pub mod run;
pub mod send;
pub mod status;
