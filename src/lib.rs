//! stackclaw: declarative resource graphs: plan, apply, destroy
//!
//! The command line front end: stack files, configuration, output
//! formatting and the glue that drives the engine crates.

pub mod commands;
pub mod config;
pub mod declaration;
pub mod format;

#[cfg(test)]
mod tests;
