//! Command line shell for bofhd.

pub mod config;
pub mod parser;
pub mod prompt;
pub mod repl;

pub use config::Settings;
pub use prompt::{Prompter, TerminalPrompter};
pub use repl::{Flow, Shell};
