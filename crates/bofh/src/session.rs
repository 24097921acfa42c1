//! bofhd session: login state, call dispatch and the named server operations.

use crate::commands::CommandTable;
use crate::connector::ConnectorConfig;
use crate::format::{self, FormatSuggestion};
use crate::transport::{HttpsTransport, Transport};
use crate::types::{BofhError, BofhResult};
use crate::value::Value;
use crate::wash::{escape, wash};

/// Client identifier sent with `get_motd`.
pub const CLIENT_ID: &str = "bofh";

/// A connection to bofhd plus the session state riding on it.
pub struct Bofh {
    transport: Box<dyn Transport>,
    session: Option<String>,
    commands: CommandTable,
}

impl Bofh {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            session: None,
            commands: CommandTable::default(),
        }
    }

    /// Set up an HTTPS transport to `url`. No connection is made until the
    /// first call.
    pub fn connect(url: &str, config: &ConnectorConfig) -> BofhResult<Self> {
        let transport = HttpsTransport::new(url, config)?;
        tracing::debug!("Using bofhd at {}", transport.endpoint().destination());
        Ok(Self::new(Box::new(transport)))
    }

    pub fn is_authenticated(&self) -> bool {
        self.session.is_some()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session.as_deref()
    }

    pub fn commands(&self) -> &CommandTable {
        &self.commands
    }

    /// Unscoped call: escape arguments, send, wash the result.
    fn raw_call(&mut self, method: &str, params: Vec<Value>) -> BofhResult<Value> {
        let params = params.into_iter().map(escape).collect();
        let raw = self.transport.call(method, params)?;
        Ok(wash(raw))
    }

    /// Session-scoped call. Fails without touching the network when not
    /// logged in.
    pub fn call(&mut self, name: &str, args: Vec<Value>) -> BofhResult<Value> {
        let token = self
            .session
            .clone()
            .ok_or_else(|| BofhError::NotAuthenticated(name.to_string()))?;

        let mut params = Vec::with_capacity(args.len() + 1);
        params.push(Value::String(token));
        params.extend(args);
        self.raw_call(name, params)
    }

    /// Log in and remember the session token.
    pub fn login(&mut self, user: &str, password: &str) -> BofhResult<String> {
        let response = self.raw_call("login", vec![user.into(), password.into()])?;
        let token = response
            .as_str()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                BofhError::UnexpectedResponse(format!("login returned {}", response.repr()))
            })?
            .to_string();

        tracing::info!("Logged in as {user}");
        self.session = Some(token.clone());
        Ok(token)
    }

    /// End the session. The token is dropped and channels are closed even if
    /// the server call fails.
    pub fn logout(&mut self) -> BofhResult<()> {
        let result = match self.session.take() {
            Some(token) => self.raw_call("logout", vec![Value::String(token)]).map(|_| ()),
            None => Ok(()),
        };
        self.transport.close();
        tracing::info!("Logged out");
        result
    }

    /// Message of the day.
    pub fn motd(&mut self, client_id: &str) -> BofhResult<String> {
        let motd = self.raw_call(
            "get_motd",
            vec![client_id.into(), env!("CARGO_PKG_VERSION").into()],
        )?;
        Ok(format::render_plain(&motd))
    }

    /// Raw `get_commands` mapping, `key -> [[group, command], args]`.
    pub fn get_commands(&mut self) -> BofhResult<Value> {
        self.call("get_commands", Vec::new())
    }

    /// Fetch the command table and replace the current one wholesale.
    pub fn rebuild_commands(&mut self) -> BofhResult<&CommandTable> {
        let response = self.get_commands()?;
        self.commands = CommandTable::from_response(&response)?;
        Ok(&self.commands)
    }

    /// Server-side help text, e.g. `help(&["user", "info"])`.
    pub fn help(&mut self, args: &[&str]) -> BofhResult<String> {
        let args = args.iter().map(|a| Value::from(*a)).collect();
        let text = self.call("help", args)?;
        Ok(format::render_plain(&text))
    }

    pub fn run_command(&mut self, key: &str, args: Vec<Value>) -> BofhResult<Value> {
        self.call("run_command", with_key(key, args))
    }

    pub fn call_prompt_func(&mut self, key: &str, args: Vec<Value>) -> BofhResult<Value> {
        self.call("call_prompt_func", with_key(key, args))
    }

    pub fn get_default_param(&mut self, key: &str, args: Vec<Value>) -> BofhResult<Value> {
        self.call("get_default_param", with_key(key, args))
    }

    pub fn get_format_suggestion(&mut self, key: &str) -> BofhResult<Option<FormatSuggestion>> {
        let suggestion = self.raw_call("get_format_suggestion", vec![key.into()])?;
        Ok(FormatSuggestion::from_value(&suggestion))
    }

    /// Run a command and render its result with the server's suggestion.
    pub fn run_and_format(&mut self, key: &str, args: Vec<Value>) -> BofhResult<String> {
        let result = self.run_command(key, args)?;
        let suggestion = self.get_format_suggestion(key)?;
        format::render(suggestion.as_ref(), &result)
    }
}

impl Drop for Bofh {
    fn drop(&mut self) {
        self.transport.close();
    }
}

fn with_key(key: &str, args: Vec<Value>) -> Vec<Value> {
    let mut params = Vec::with_capacity(args.len() + 1);
    params.push(Value::from(key));
    params.extend(args);
    params
}
