//! Command-line surface: argument parsing, packet formatting and dump files.

pub mod cli;
pub mod dump;
pub mod output;
