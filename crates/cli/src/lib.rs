//! Library half of the `telco` binary: argument definitions, command
//! execution and the result envelope, kept here so they can be tested
//! without spawning the executable.

pub mod cli;
pub mod commands;
pub mod error;
pub mod logging;
pub mod output;
