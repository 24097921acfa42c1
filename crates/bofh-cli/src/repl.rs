//! Interactive bofh shell.
//!
//! [`Shell`] executes lines against a logged-in [`Bofh`]; [`run`] wraps it in
//! a rustyline editor with history and completion of groups and commands.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rustyline::completion::{Completer, Pair};
use rustyline::config::CompletionType;
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::validate::Validator;
use rustyline::{
    Cmd, ConditionalEventHandler, Config, Editor, Event, EventContext, EventHandler, Helper,
    KeyEvent, RepeatCount,
};

use bofh::{Bofh, BofhError, CommandTable, FaultKind};

use crate::parser::{parse_line, Line, INTERNAL_COMMANDS};
use crate::prompt::{collect_args, Prompter};

const PROMPT: &str = "bofh> ";

/// What the caller should do after a line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Line executor. Command output goes to `out`, diagnostics to stderr.
pub struct Shell<P: Prompter, W: Write> {
    bofh: Bofh,
    prompter: P,
    out: W,
    user: String,
    /// Scripts being sourced, outermost first.
    sourcing: Vec<PathBuf>,
}

impl<P: Prompter, W: Write> Shell<P, W> {
    pub fn new(bofh: Bofh, prompter: P, out: W, user: impl Into<String>) -> Self {
        Self {
            bofh,
            prompter,
            out,
            user: user.into(),
            sourcing: Vec::new(),
        }
    }

    pub fn bofh(&self) -> &Bofh {
        &self.bofh
    }

    pub fn bofh_mut(&mut self) -> &mut Bofh {
        &mut self.bofh
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn commands(&self) -> &CommandTable {
        self.bofh.commands()
    }

    /// Execute one line. Server faults that invalidate local state are
    /// handled before the error is returned.
    pub fn execute_line(&mut self, line: &str) -> anyhow::Result<Flow> {
        let result = parse_line(line)
            .map_err(anyhow::Error::from)
            .and_then(|parsed| self.dispatch(parsed));
        if let Err(e) = &result {
            self.recover(e);
        }
        result
    }

    /// Run every line of `path`. Stops at the first error unless
    /// `ignore_errors` is set. A script may not source itself, directly or
    /// through another script.
    pub fn source(&mut self, path: &Path, ignore_errors: bool) -> anyhow::Result<Flow> {
        let canonical = fs::canonicalize(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;
        if self.sourcing.contains(&canonical) {
            anyhow::bail!("{} is already being sourced", path.display());
        }
        let script = fs::read_to_string(&canonical)
            .map_err(|e| anyhow::anyhow!("Cannot read {}: {e}", path.display()))?;

        self.sourcing.push(canonical);
        let result = self.source_lines(path, &script, ignore_errors);
        self.sourcing.pop();
        result
    }

    fn source_lines(
        &mut self,
        path: &Path,
        script: &str,
        ignore_errors: bool,
    ) -> anyhow::Result<Flow> {
        for (number, line) in script.lines().enumerate() {
            match self.execute_line(line) {
                Ok(Flow::Quit) => return Ok(Flow::Quit),
                Ok(Flow::Continue) => {}
                Err(e) if ignore_errors => {
                    eprintln!("{}:{}: {e}", path.display(), number + 1);
                }
                Err(e) => {
                    return Err(e.context(format!("{}:{}", path.display(), number + 1)));
                }
            }
        }
        Ok(Flow::Continue)
    }

    fn dispatch(&mut self, line: Line) -> anyhow::Result<Flow> {
        match line {
            Line::Empty => {}
            Line::Quit => return Ok(Flow::Quit),
            Line::Help(topic) => self.help(&topic)?,
            Line::Commands => self.list_commands()?,
            Line::Reload => {
                let count = self.bofh.rebuild_commands()?.len();
                eprintln!("Loaded {count} commands");
            }
            Line::Source {
                path,
                ignore_errors,
            } => return self.source(Path::new(&path), ignore_errors),
            Line::Command {
                group,
                command: None,
                ..
            } => self.group_usage(&group)?,
            Line::Command {
                group,
                command: Some(command),
                args,
            } => self.run_command(&group, &command, args)?,
        }
        Ok(Flow::Continue)
    }

    fn run_command(&mut self, group: &str, command: &str, given: Vec<String>) -> anyhow::Result<()> {
        let descriptor = self.bofh.commands().resolve(group, command)?.clone();
        tracing::debug!("Running {} as {}", descriptor.full_name(), descriptor.key);

        let args = collect_args(&mut self.bofh, &descriptor, given, &mut self.prompter)?;
        let rendered = self.bofh.run_and_format(&descriptor.key, args)?;
        if !rendered.is_empty() {
            writeln!(self.out, "{rendered}")?;
        }
        Ok(())
    }

    fn help(&mut self, topic: &[String]) -> anyhow::Result<()> {
        // Expand prefixes locally when the table knows them.
        let table = self.bofh.commands();
        let expanded: Vec<String> = match topic {
            [group] => vec![table
                .resolve_group(group)
                .map(str::to_string)
                .unwrap_or_else(|_| group.clone())],
            [group, command, ..] => match table.resolve(group, command) {
                Ok(found) => vec![found.group.clone(), found.name.clone()],
                Err(_) => topic.to_vec(),
            },
            [] => Vec::new(),
        };

        let words: Vec<&str> = expanded.iter().map(String::as_str).collect();
        let text = self.bofh.help(&words)?;
        writeln!(self.out, "{text}")?;
        Ok(())
    }

    fn list_commands(&mut self) -> anyhow::Result<()> {
        let table = self.bofh.commands();
        for group in table.groups() {
            for command in table.commands(group) {
                writeln!(self.out, "{}", command.usage())?;
            }
        }
        Ok(())
    }

    fn group_usage(&mut self, group: &str) -> anyhow::Result<()> {
        let table = self.bofh.commands();
        let group = table.resolve_group(group)?;
        for command in table.commands(group) {
            writeln!(self.out, "{}", command.usage())?;
        }
        Ok(())
    }

    fn recover(&mut self, error: &anyhow::Error) {
        let Some(kind) = error.downcast_ref::<BofhError>().and_then(BofhError::fault_kind) else {
            return;
        };

        match kind {
            FaultKind::ServerRestarted => {
                tracing::warn!("bofhd restarted, reloading commands");
                if let Err(e) = self.bofh.rebuild_commands() {
                    eprintln!("Reloading commands failed: {e}");
                }
            }
            FaultKind::SessionExpired => {
                if let Err(e) = self.relogin() {
                    eprintln!("Login failed: {e}");
                }
            }
            FaultKind::Cerebrum | FaultKind::Other => {}
        }
    }

    fn relogin(&mut self) -> anyhow::Result<()> {
        if !self.prompter.confirm("Session expired. Log in again?")? {
            return Ok(());
        }
        let password = self
            .prompter
            .ask_secret(&format!("Password for {}", self.user))?;
        self.bofh.login(&self.user, &password)?;
        self.bofh.rebuild_commands()?;
        Ok(())
    }
}

/// Completes internal commands, groups and the commands of a group.
struct BofhHelper {
    table: CommandTable,
}

impl BofhHelper {
    fn first_words(&self) -> Vec<String> {
        let mut words: Vec<String> = INTERNAL_COMMANDS.iter().map(|c| c.to_string()).collect();
        words.extend(self.table.groups().map(str::to_string));
        words.sort();
        words
    }
}

impl Completer for BofhHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let input = &line[..pos];
        let words: Vec<&str> = input.split_whitespace().collect();
        let typing_new_word = input.ends_with(char::is_whitespace);

        match (words.as_slice(), typing_new_word) {
            ([], _) | ([_], false) => {
                let partial = words.first().copied().unwrap_or("");
                let start = pos - partial.len();
                let matches = self
                    .first_words()
                    .into_iter()
                    .filter(|w| w.starts_with(partial))
                    .map(|w| Pair {
                        display: w.clone(),
                        replacement: format!("{w} "),
                    })
                    .collect();
                Ok((start, matches))
            }
            ([group], true) | ([group, _], false) => {
                let partial = if typing_new_word { "" } else { words[1] };
                let start = pos - partial.len();
                let Ok(group) = self.table.resolve_group(group) else {
                    return Ok((pos, Vec::new()));
                };
                let matches = self
                    .table
                    .commands(group)
                    .filter(|c| c.name.starts_with(partial))
                    .map(|c| Pair {
                        display: format!("{:<20} {}", c.name, c.usage()),
                        replacement: format!("{} ", c.name),
                    })
                    .collect();
                Ok((start, matches))
            }
            _ => Ok((pos, Vec::new())),
        }
    }
}

impl Hinter for BofhHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<String> {
        if pos < line.len() || line.is_empty() || line.contains(' ') {
            return None;
        }
        let mut candidates = self.first_words().into_iter().filter(|w| w.starts_with(line));
        match (candidates.next(), candidates.next()) {
            (Some(only), None) if only != line => Some(only[line.len()..].to_string()),
            _ => None,
        }
    }
}

impl Highlighter for BofhHelper {}
impl Validator for BofhHelper {}
impl Helper for BofhHelper {}

struct TabCompleteOrAcceptHint;

impl ConditionalEventHandler for TabCompleteOrAcceptHint {
    fn handle(
        &self,
        _evt: &Event,
        _n: RepeatCount,
        _positive: bool,
        ctx: &EventContext<'_>,
    ) -> Option<Cmd> {
        if ctx.has_hint() {
            Some(Cmd::CompleteHint)
        } else {
            Some(Cmd::Complete)
        }
    }
}

/// Run the interactive loop until `quit` or end of input.
pub fn run<P: Prompter, W: Write>(shell: &mut Shell<P, W>) -> anyhow::Result<()> {
    let config = Config::builder()
        .history_ignore_space(true)
        .auto_add_history(true)
        .completion_type(CompletionType::List)
        .completion_prompt_limit(50)
        .build();

    let mut rl: Editor<BofhHelper, rustyline::history::DefaultHistory> =
        Editor::with_config(config)?;
    rl.set_helper(Some(BofhHelper {
        table: shell.commands().clone(),
    }));
    rl.bind_sequence(
        KeyEvent::from('\t'),
        EventHandler::Conditional(Box::new(TabCompleteOrAcceptHint)),
    );

    let hist_path = crate::config::history_path();
    if hist_path.exists() {
        let _ = rl.load_history(&hist_path);
    }

    loop {
        match rl.readline(PROMPT) {
            Ok(line) => {
                match shell.execute_line(&line) {
                    Ok(Flow::Quit) => break,
                    Ok(Flow::Continue) => {}
                    Err(e) => eprintln!("Error: {e:#}"),
                }
                if let Some(helper) = rl.helper_mut() {
                    helper.table = shell.commands().clone();
                }
            }
            Err(ReadlineError::Interrupted) => {
                eprintln!("(Ctrl+C) Type quit to leave.");
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("Error: {err}");
                break;
            }
        }
    }

    if let Err(e) = rl.save_history(&hist_path) {
        tracing::warn!("Cannot save history to {}: {e}", hist_path.display());
    }
    Ok(())
}
