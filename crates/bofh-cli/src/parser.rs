//! Tokenizing REPL input into internal commands and remote command calls.

/// Errors from reading a line.
#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("Unbalanced quotes in input")]
    UnbalancedQuotes,

    #[error("Usage: source [--ignore-errors] <file>")]
    SourceUsage,
}

/// One parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Line {
    /// Blank or a `#` comment.
    Empty,
    Help(Vec<String>),
    Commands,
    Source { path: String, ignore_errors: bool },
    Reload,
    Quit,
    /// A remote command, still unresolved. `command` is `None` when only a
    /// group was given.
    Command {
        group: String,
        command: Option<String>,
        args: Vec<String>,
    },
}

/// Names handled locally, for completion.
pub const INTERNAL_COMMANDS: &[&str] = &["commands", "exit", "help", "quit", "reload", "source"];

pub fn parse_line(line: &str) -> Result<Line, ParseError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(Line::Empty);
    }

    let words = shlex::split(trimmed).ok_or(ParseError::UnbalancedQuotes)?;
    let Some((first, rest)) = words.split_first() else {
        return Ok(Line::Empty);
    };

    let parsed = match first.as_str() {
        "quit" | "exit" => Line::Quit,
        "help" => Line::Help(rest.to_vec()),
        "commands" => Line::Commands,
        "reload" => Line::Reload,
        "source" => parse_source(rest)?,
        _ => {
            let mut rest = rest.iter().cloned();
            Line::Command {
                group: first.clone(),
                command: rest.next(),
                args: rest.collect(),
            }
        }
    };
    Ok(parsed)
}

fn parse_source(words: &[String]) -> Result<Line, ParseError> {
    match words {
        [path] => Ok(Line::Source {
            path: path.clone(),
            ignore_errors: false,
        }),
        [flag, path] if flag == "--ignore-errors" => Ok(Line::Source {
            path: path.clone(),
            ignore_errors: true,
        }),
        _ => Err(ParseError::SourceUsage),
    }
}
