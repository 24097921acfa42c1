//! Server-provided command table.
//!
//! `get_commands` returns a flat mapping `key -> [[group, command], args]`.
//! The table groups those entries into `group -> command -> descriptor` and
//! resolves user input against it, accepting unique prefixes.

use std::collections::BTreeMap;

use crate::types::{BofhError, BofhResult};
use crate::value::Value;

/// Marker bofhd uses for commands whose arguments are prompted server-side.
const PROMPT_FUNC: &str = "prompt_func";

/// Where an argument's default comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgDefault {
    None,
    Literal(String),
    /// Ask the server with `get_default_param`.
    FromServer,
}

/// Description of one command argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgDescriptor {
    pub optional: bool,
    pub repeat: bool,
    pub default: ArgDefault,
    pub arg_type: String,
    pub help_ref: Option<String>,
    pub prompt: String,
}

impl ArgDescriptor {
    fn from_value(value: &Value) -> Option<Self> {
        let map = value.as_struct()?;
        let flag = |name: &str| map.get(name).and_then(Value::as_bool).unwrap_or(false);
        let text = |name: &str| map.get(name).and_then(Value::as_str).map(str::to_string);

        let default = match map.get("default") {
            Some(Value::String(s)) => ArgDefault::Literal(s.clone()),
            Some(Value::Boolean(true)) | Some(Value::Int(1)) => ArgDefault::FromServer,
            _ => ArgDefault::None,
        };

        let arg_type = text("type").unwrap_or_default();
        let help_ref = text("help_ref");
        let prompt = text("prompt")
            .or_else(|| help_ref.clone())
            .unwrap_or_else(|| arg_type.clone());

        Some(Self {
            optional: flag("optional"),
            repeat: flag("repeat"),
            default,
            arg_type,
            help_ref,
            prompt,
        })
    }

    /// Passwords are read without echo.
    pub fn is_secret(&self) -> bool {
        self.arg_type.to_ascii_lowercase().contains("password")
    }
}

/// How a command's arguments are obtained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArgSpec {
    Static(Vec<ArgDescriptor>),
    /// Arguments are requested one by one via `call_prompt_func`.
    PromptFunc,
}

/// One invokable remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    /// Flat server key, e.g. `user_info`.
    pub key: String,
    pub group: String,
    pub name: String,
    pub args: ArgSpec,
}

impl CommandDescriptor {
    /// Parse one `get_commands` entry.
    pub fn from_entry(key: &str, entry: &Value) -> Option<Self> {
        let parts = entry.as_array()?;
        let names = parts.first()?.as_array()?;
        let group = names.first()?.as_str()?.to_string();
        let name = names.get(1)?.as_str()?.to_string();

        let args = match parts.get(1) {
            Some(Value::String(s)) if s == PROMPT_FUNC => ArgSpec::PromptFunc,
            Some(Value::Array(items)) => ArgSpec::Static(
                items
                    .iter()
                    .map(ArgDescriptor::from_value)
                    .collect::<Option<Vec<_>>>()?,
            ),
            Some(Value::Nil) | None => ArgSpec::Static(Vec::new()),
            Some(_) => return None,
        };
        let args = match parts.get(2).and_then(Value::as_str) {
            Some(PROMPT_FUNC) => ArgSpec::PromptFunc,
            _ => args,
        };

        Some(Self {
            key: key.to_string(),
            group,
            name,
            args,
        })
    }

    pub fn full_name(&self) -> String {
        format!("{} {}", self.group, self.name)
    }

    /// Static argument descriptors, empty for prompt-func commands.
    pub fn arg_descriptors(&self) -> &[ArgDescriptor] {
        match &self.args {
            ArgSpec::Static(args) => args,
            ArgSpec::PromptFunc => &[],
        }
    }

    /// Short usage line, e.g. `user info <username> [<type>...]`.
    pub fn usage(&self) -> String {
        let mut usage = self.full_name();
        if self.args == ArgSpec::PromptFunc {
            usage.push_str(" ...");
        }
        for arg in self.arg_descriptors() {
            let label = if arg.repeat {
                format!("<{}>...", arg.arg_type)
            } else {
                format!("<{}>", arg.arg_type)
            };
            if arg.optional {
                usage.push_str(&format!(" [{label}]"));
            } else {
                usage.push(' ');
                usage.push_str(&label);
            }
        }
        usage
    }
}

/// All known commands, keyed by group then command name.
#[derive(Debug, Clone, Default)]
pub struct CommandTable {
    groups: BTreeMap<String, BTreeMap<String, CommandDescriptor>>,
}

impl CommandTable {
    /// Build a table from a washed `get_commands` response.
    ///
    /// Malformed entries are skipped with a warning.
    pub fn from_response(response: &Value) -> BofhResult<Self> {
        let entries = response.as_struct().ok_or_else(|| {
            BofhError::UnexpectedResponse(format!("get_commands returned {}", response.repr()))
        })?;

        let mut table = Self::default();
        for (key, entry) in entries {
            match CommandDescriptor::from_entry(key, entry) {
                Some(command) => table.insert(command),
                None => tracing::warn!("Skipping malformed command descriptor '{key}'"),
            }
        }

        tracing::debug!(
            "Command table has {} groups, {} commands",
            table.groups.len(),
            table.len()
        );
        Ok(table)
    }

    fn insert(&mut self, command: CommandDescriptor) {
        self.groups
            .entry(command.group.clone())
            .or_default()
            .insert(command.name.clone(), command);
    }

    pub fn len(&self) -> usize {
        self.groups.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Group names, sorted.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Commands in a group, sorted by name.
    pub fn commands(&self, group: &str) -> impl Iterator<Item = &CommandDescriptor> {
        self.groups.get(group).into_iter().flat_map(BTreeMap::values)
    }

    pub fn get(&self, group: &str, name: &str) -> Option<&CommandDescriptor> {
        self.groups.get(group)?.get(name)
    }

    pub fn by_key(&self, key: &str) -> Option<&CommandDescriptor> {
        self.groups
            .values()
            .flat_map(BTreeMap::values)
            .find(|c| c.key == key)
    }

    /// Resolve a group name or unique prefix.
    pub fn resolve_group(&self, input: &str) -> BofhResult<&str> {
        pick(&self.groups, input).map(|(name, _)| name.as_str())
    }

    /// Resolve `group command`, each part an exact name or unique prefix.
    pub fn resolve(&self, group: &str, command: &str) -> BofhResult<&CommandDescriptor> {
        let (group_name, commands) = pick(&self.groups, group)?;
        pick(commands, command)
            .map(|(_, descriptor)| descriptor)
            .map_err(|e| match e {
                BofhError::UnknownCommand(_) => {
                    BofhError::UnknownCommand(format!("{group_name} {command}"))
                }
                BofhError::AmbiguousCommand { candidates, .. } => BofhError::AmbiguousCommand {
                    input: format!("{group_name} {command}"),
                    candidates,
                },
                other => other,
            })
    }
}

/// Exact match first, then a unique prefix.
fn pick<'a, V>(map: &'a BTreeMap<String, V>, input: &str) -> BofhResult<(&'a String, &'a V)> {
    if let Some(found) = map.get_key_value(input) {
        return Ok(found);
    }

    let matches: Vec<_> = map
        .range(input.to_string()..)
        .take_while(|(name, _)| name.starts_with(input))
        .collect();

    match matches.as_slice() {
        [] => Err(BofhError::UnknownCommand(input.to_string())),
        [only] => Ok(*only),
        many => Err(BofhError::AmbiguousCommand {
            input: input.to_string(),
            candidates: many.iter().map(|(name, _)| (*name).clone()).collect(),
        }),
    }
}
