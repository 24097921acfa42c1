//! bofh command line client: entry point.

use std::time::Duration;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell as CompletionShell;

use bofh::{Bofh, CLIENT_ID, DEFAULT_TIMEOUT};
use bofh_cli::config::{resolve_ca_file, resolve_url, resolve_user};
use bofh_cli::{repl, Flow, Prompter, Settings, Shell, TerminalPrompter};

#[derive(Parser)]
#[command(
    name = "bofh",
    about = "Command line client for the Cerebrum bofhd administration service",
    version
)]
struct Cli {
    /// bofhd URL (env BOFH_URL, default https://cerebrum-uio.uio.no:8000).
    #[arg(short, long)]
    url: Option<String>,

    /// User to log in as (env USER).
    #[arg(long)]
    user: Option<String>,

    /// PEM file with trusted CA certificates (env BOFH_CA_FILE).
    #[arg(long)]
    cert: Option<String>,

    /// Do not check that the certificate matches the hostname.
    #[arg(long)]
    insecure: bool,

    /// Connect and read timeout in seconds.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT.as_secs())]
    timeout: u64,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "warn")]
    log_level: String,

    /// Run a single command and exit.
    #[arg(short, long)]
    command: Option<String>,

    #[command(subcommand)]
    subcommand: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate shell completion scripts.
    ///
    /// Examples:
    ///   bofh completions bash > ~/.local/share/bash-completion/completions/bofh
    ///   bofh completions zsh > ~/.zfunc/_bofh
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        shell: CompletionShell,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Some(Commands::Completions { shell }) = cli.subcommand {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "bofh", &mut std::io::stdout());
        return Ok(());
    }

    let settings = Settings {
        url: resolve_url(cli.url.as_deref()),
        user: resolve_user(cli.user.as_deref())?,
        ca_file: resolve_ca_file(cli.cert.as_deref()),
        validate_hostname: !cli.insecure,
        timeout: Duration::from_secs(cli.timeout),
    };
    if cli.insecure {
        tracing::warn!("Hostname validation disabled");
    }

    let mut bofh = Bofh::connect(&settings.url, &settings.connector_config())?;
    let mut prompter = TerminalPrompter;

    if cli.command.is_none() {
        let motd = bofh.motd(CLIENT_ID)?;
        if !motd.is_empty() {
            eprintln!("{motd}");
        }
    }

    let password = prompter.ask_secret(&format!("Password for {}", settings.user))?;
    bofh.login(&settings.user, &password)?;
    bofh.rebuild_commands()?;

    let mut shell = Shell::new(bofh, prompter, std::io::stdout(), settings.user.clone());
    let outcome = match cli.command {
        Some(line) => shell.execute_line(&line).map(|_: Flow| ()),
        None => repl::run(&mut shell),
    };

    if let Err(e) = shell.bofh_mut().logout() {
        tracing::warn!("Logout failed: {e}");
    }
    outcome
}
