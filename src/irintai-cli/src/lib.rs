//! Irintai command-line tool.
//!
//! - `cli` - argument parsing, logging setup and dispatch
//! - `plugin_cmd` - plugin inspection and management commands

pub mod cli;
pub mod plugin_cmd;
