//! Collecting command arguments interactively.
//!
//! Static commands are prompted argument by argument from their descriptors.
//! Prompt-func commands run a dialogue with the server, one
//! `call_prompt_func` round per argument, until it reports the last one.

use bofh::format::percent_format;
use bofh::{ArgDefault, ArgDescriptor, ArgSpec, Bofh, CommandDescriptor, Value};

/// Terminal input, behind a trait so scripted answers can stand in.
pub trait Prompter {
    fn ask(&mut self, prompt: &str, default: Option<&str>) -> anyhow::Result<String>;

    /// Read without echo.
    fn ask_secret(&mut self, prompt: &str) -> anyhow::Result<String>;

    fn confirm(&mut self, prompt: &str) -> anyhow::Result<bool>;

    fn show(&mut self, text: &str) {
        eprintln!("{text}");
    }
}

/// Prompts on the controlling terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, prompt: &str, default: Option<&str>) -> anyhow::Result<String> {
        let mut input = dialoguer::Input::<String>::new()
            .with_prompt(prompt)
            .allow_empty(true);
        if let Some(default) = default {
            input = input.default(default.to_string());
        }
        Ok(input.interact_text()?)
    }

    fn ask_secret(&mut self, prompt: &str) -> anyhow::Result<String> {
        Ok(dialoguer::Password::new()
            .with_prompt(prompt)
            .allow_empty_password(true)
            .interact()?)
    }

    fn confirm(&mut self, prompt: &str) -> anyhow::Result<bool> {
        Ok(dialoguer::Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()?)
    }
}

/// Complete `given` into the full argument list for `command`.
pub fn collect_args(
    bofh: &mut Bofh,
    command: &CommandDescriptor,
    given: Vec<String>,
    prompter: &mut dyn Prompter,
) -> anyhow::Result<Vec<Value>> {
    match &command.args {
        ArgSpec::Static(descriptors) => {
            static_args(bofh, &command.key, descriptors, given, prompter)
        }
        ArgSpec::PromptFunc => prompt_func_args(bofh, &command.key, given, prompter),
    }
}

fn static_args(
    bofh: &mut Bofh,
    key: &str,
    descriptors: &[ArgDescriptor],
    given: Vec<String>,
    prompter: &mut dyn Prompter,
) -> anyhow::Result<Vec<Value>> {
    let mut given = given.into_iter();
    let mut args: Vec<Value> = Vec::new();

    for descriptor in descriptors {
        if descriptor.repeat {
            let rest: Vec<Value> = given.by_ref().map(Value::from).collect();
            if !rest.is_empty() {
                args.extend(rest);
                continue;
            }
        } else if let Some(arg) = given.next() {
            args.push(Value::from(arg));
            continue;
        }

        // Optional arguments are only sent when typed.
        if descriptor.optional {
            break;
        }
        let answer = ask_for(bofh, key, descriptor, &args, prompter)?;
        args.push(Value::from(answer));
    }

    args.extend(given.map(Value::from));
    Ok(args)
}

fn ask_for(
    bofh: &mut Bofh,
    key: &str,
    descriptor: &ArgDescriptor,
    collected: &[Value],
    prompter: &mut dyn Prompter,
) -> anyhow::Result<String> {
    if descriptor.is_secret() {
        return prompter.ask_secret(&descriptor.prompt);
    }

    let default = match &descriptor.default {
        ArgDefault::Literal(value) => Some(value.clone()),
        ArgDefault::FromServer => {
            let value = bofh.get_default_param(key, collected.to_vec())?;
            (!value.is_nil()).then(|| value.to_string())
        }
        ArgDefault::None => None,
    };

    let answer = prompter.ask(&descriptor.prompt, default.as_deref())?;
    Ok(match (answer.is_empty(), default) {
        (true, Some(default)) => default,
        _ => answer,
    })
}

fn prompt_func_args(
    bofh: &mut Bofh,
    key: &str,
    given: Vec<String>,
    prompter: &mut dyn Prompter,
) -> anyhow::Result<Vec<Value>> {
    let mut args: Vec<Value> = given.into_iter().map(Value::from).collect();

    loop {
        let response = bofh.call_prompt_func(key, args.clone())?;
        let Some(step) = PromptStep::from_value(&response) else {
            break;
        };
        tracing::debug!("Server asks for argument {} of {key}", args.len() + 1);
        args.push(step.ask(prompter)?);
        if step.last_arg {
            break;
        }
    }
    Ok(args)
}

#[derive(Debug)]
struct MenuEntry {
    label: String,
    value: Value,
}

/// One round of the `call_prompt_func` dialogue.
#[derive(Debug)]
struct PromptStep {
    prompt: String,
    default: Option<String>,
    header: Option<String>,
    menu: Vec<MenuEntry>,
    /// Free text is accepted alongside menu choices.
    raw: bool,
    last_arg: bool,
}

impl PromptStep {
    /// `None` once the server has no more questions.
    fn from_value(value: &Value) -> Option<Self> {
        let prompt = value.get("prompt")?.as_str()?.to_string();
        let flag = |name: &str| value.get(name).and_then(Value::as_bool).unwrap_or(false);

        let mut header = None;
        let mut menu = Vec::new();
        if let Some(items) = value.get("map").and_then(Value::as_array) {
            for (index, item) in items.iter().enumerate() {
                let Some([label, choice]) = item.as_array().and_then(|pair| pair.get(..2)) else {
                    continue;
                };
                let label = menu_label(label);
                if index == 0 && choice.is_nil() {
                    header = Some(label);
                } else {
                    menu.push(MenuEntry {
                        label,
                        value: choice.clone(),
                    });
                }
            }
        }

        Some(Self {
            prompt,
            default: value
                .get("default")
                .filter(|d| !d.is_nil())
                .map(Value::to_string),
            header,
            menu,
            raw: flag("raw"),
            last_arg: flag("last_arg"),
        })
    }

    fn ask(&self, prompter: &mut dyn Prompter) -> anyhow::Result<Value> {
        if self.menu.is_empty() {
            return Ok(Value::from(self.read(prompter)?));
        }

        let mut listing: Vec<String> = self.header.iter().map(|h| format!("      {h}")).collect();
        for (n, entry) in self.menu.iter().enumerate() {
            listing.push(format!("{:>4}: {}", n + 1, entry.label));
        }
        prompter.show(&listing.join("\n"));

        let answer = self.read(prompter)?;
        match answer.trim().parse::<usize>() {
            Ok(n) if (1..=self.menu.len()).contains(&n) => Ok(self.menu[n - 1].value.clone()),
            _ if self.raw => Ok(Value::from(answer)),
            _ => anyhow::bail!("Invalid choice '{answer}', pick 1-{}", self.menu.len()),
        }
    }

    fn read(&self, prompter: &mut dyn Prompter) -> anyhow::Result<String> {
        let answer = prompter.ask(&self.prompt, self.default.as_deref())?;
        Ok(match (answer.is_empty(), &self.default) {
            (true, Some(default)) => default.clone(),
            _ => answer,
        })
    }
}

/// Menu labels come as `[template, args...]`.
fn menu_label(label: &Value) -> String {
    match label.as_array() {
        Some([template, args @ ..]) => template
            .as_str()
            .and_then(|t| percent_format(t, args).ok())
            .unwrap_or_else(|| label.repr()),
        _ => label.to_string(),
    }
}
