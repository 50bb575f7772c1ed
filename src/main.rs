//! sbxterm - remote sandbox terminal client
//!
//! `sbxterm connect <name>` waits until the registry lists the sandbox,
//! then attaches the local terminal to it through the terminal proxy.
//! Type `Ctrl-]` followed by `r` to retry, `n` to re-create the session or
//! `q` to quit.
//!
//! `sbxterm list` prints the sandboxes the registry knows about.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser as ClapParser, Subcommand};
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sbxterm::broker::LaunchBroker;
use sbxterm::config::{Config, ConfigError};
use sbxterm::connection::SessionHandle;
use sbxterm::controller::ConnectionState;
use sbxterm::escalation::{EscalationPolicy, FallbackActions};
use sbxterm::identity::Credential;
use sbxterm::launcher::{LaunchOutcome, Launcher, Match};
use sbxterm::registry::{
    resolve_token, HttpRegistry, RegistryError, SandboxRegistry, StaticCredentials,
};
use sbxterm::shell::{PresentationShell, SessionFactory, StatusView};
use sbxterm::surface::{ShellCommand, StdinPump, StdioSurface};
use sbxterm::terminal::{self, TerminalError};

/// sbxterm - remote sandbox terminal client
#[derive(ClapParser, Debug)]
#[command(name = "sbxterm", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: $XDG_CONFIG_HOME/sbxterm/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Operator bearer token (overrides the config file)
    #[arg(long, env = "SBXTERM_TOKEN", global = true, hide_env_values = true)]
    token: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Open a terminal on a sandbox
    Connect {
        /// Sandbox name as listed by the registry
        name: String,
    },
    /// List sandboxes known to the registry
    List,
}

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("{0} is not set (use the config file)")]
    MissingSetting(&'static str),

    #[error("no token: pass --token, set SBXTERM_TOKEN or add `token` to the config file")]
    MissingToken,

    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("sandbox '{0}' did not show up in the registry in time")]
    Expired(String),

    #[error("terminal error: {0}")]
    Terminal(#[from] TerminalError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = match cli.command {
        Commands::Connect { ref name } => run_connect(&cli, name.clone()).await,
        Commands::List => run_list(&cli).await,
    };

    if let Err(e) = result {
        eprintln!("sbxterm: {}", e);
        std::process::exit(1);
    }
}

/// Tracing goes to stderr: stdout belongs to the remote terminal.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "sbxterm=warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

struct Context {
    config: Config,
    token: Option<Credential>,
    credentials: Arc<StaticCredentials>,
    registry: Arc<HttpRegistry>,
}

fn load_context(cli: &Cli) -> Result<Context, CliError> {
    let config = Config::load_or_default(cli.config.as_deref())?;

    // clap already folds SBXTERM_TOKEN into --token.
    let token = resolve_token(cli.token.as_deref(), None, config.token.as_deref());
    let credentials = Arc::new(StaticCredentials::new(token.clone()));

    let registry_url = config
        .registry_url
        .clone()
        .ok_or(CliError::MissingSetting("registry_url"))?;
    let registry = Arc::new(HttpRegistry::new(registry_url, credentials.clone()));

    Ok(Context {
        config,
        token,
        credentials,
        registry,
    })
}

impl Context {
    /// The resolved operator token. Blank values count as missing.
    fn require_token(&self) -> Result<&Credential, CliError> {
        self.token.as_ref().ok_or(CliError::MissingToken)
    }
}

// ── List ───────────────────────────────────────────────────────────

async fn run_list(cli: &Cli) -> Result<(), CliError> {
    let ctx = load_context(cli)?;
    let sandboxes = ctx.registry.list().await?;

    if sandboxes.is_empty() {
        println!("No sandboxes.");
    } else {
        println!("{:<24} {:<24} {}", "NAME", "SANDBOX", "ACCESS");
        for s in &sandboxes {
            let access = if s.access_key.is_some() { "yes" } else { "no" };
            println!("{:<24} {:<24} {}", s.name, s.sandbox_id, access);
        }
    }
    Ok(())
}

// ── Connect ────────────────────────────────────────────────────────

async fn run_connect(cli: &Cli, name: String) -> Result<(), CliError> {
    let ctx = load_context(cli)?;
    if ctx.config.proxy_url.is_none() {
        return Err(CliError::MissingSetting("proxy_url"));
    }
    ctx.require_token()?;

    let matched = match wait_for_match(&ctx, &name).await? {
        Some(m) => m,
        None => return Ok(()),
    };

    let (pump, mut commands) = StdinPump::start()?;
    let settings = ctx.config.controller_settings();
    let view = StatusView::new(
        name.clone(),
        EscalationPolicy::new(settings.max_attempts),
        FallbackActions::from_templates(
            &name,
            &ctx.config.fallback_command,
            ctx.config.browser_url.as_deref(),
        ),
    );

    let proxy_url = ctx.config.proxy_url.clone();
    let factory: SessionFactory = Box::new(move |events| {
        // Re-read the size so a re-created session starts at the current geometry.
        let geometry = terminal::terminal_size().unwrap_or_default();
        let surface = StdioSurface::new(pump.clone())?;
        Ok(SessionHandle::open(
            matched.identity(proxy_url.clone(), geometry),
            matched.credential.clone(),
            settings,
            surface,
            events,
        ))
    });

    let mut shell = PresentationShell::start(view, factory)?;
    let mut last_rendered = String::new();

    loop {
        tokio::select! {
            event = shell.next_event() => {
                if event.is_none() {
                    break;
                }
                render(shell.view(), &mut last_rendered);
            }
            cmd = commands.recv() => match cmd {
                Some(ShellCommand::Retry) => shell.retry(),
                Some(ShellCommand::Recreate) => {
                    last_rendered.clear();
                    shell.force_recreate().await?;
                }
                Some(ShellCommand::Quit) | None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    shell.close().await;
    eprint!("\r\n");
    Ok(())
}

/// Publish the open request and wait for the launcher to match or give up.
/// Returns None if the operator interrupted the wait.
async fn wait_for_match(ctx: &Context, name: &str) -> Result<Option<Match>, CliError> {
    let broker = LaunchBroker::new();
    let (launcher, mut outcomes) = Launcher::spawn(
        &broker,
        ctx.registry.clone(),
        ctx.credentials.clone(),
        ctx.config.launcher_settings(),
    );

    broker.request_open(name);
    eprintln!("Waiting for sandbox '{}'...", name);

    let result = loop {
        tokio::select! {
            outcome = outcomes.recv() => match requested_outcome(name, outcome) {
                Some(done) => break done.map(Some),
                None => continue,
            },
            _ = tokio::signal::ctrl_c() => break Ok(None),
        }
    };

    launcher.shutdown();
    launcher.join().await;
    result
}

/// Settle the wait for `name`, or None while it is still pending. Outcomes
/// for other names come from requests this process did not make.
fn requested_outcome(
    name: &str,
    outcome: Option<LaunchOutcome>,
) -> Option<Result<Match, CliError>> {
    match outcome {
        Some(LaunchOutcome::Matched(m)) if m.name() == name => Some(Ok(m)),
        Some(LaunchOutcome::Expired { name: expired }) if expired == name => {
            Some(Err(CliError::Expired(expired)))
        }
        Some(other) => {
            tracing::debug!(
                requested = name,
                ?other,
                "ignoring launch outcome for another sandbox"
            );
            None
        }
        None => Some(Err(CliError::Expired(name.to_string()))),
    }
}

/// Draw the shell state below the remote output. The terminal is in raw
/// mode, so lines end in CRLF.
fn render(view: &StatusView, last_rendered: &mut String) {
    let text = match view.overlay() {
        Some(overlay) => overlay.render(),
        None => {
            let hint = match view.state() {
                ConnectionState::Disconnected | ConnectionState::Error if view.can_retry() => {
                    " (Ctrl-] r to reconnect, Ctrl-] q to quit)"
                }
                ConnectionState::Disconnected | ConnectionState::Error => " (Ctrl-] q to quit)",
                _ => "",
            };
            format!("[sbxterm] {}{}\n", view.status_line(), hint)
        }
    };
    if text == *last_rendered {
        return;
    }
    eprint!("\r\n{}", text.replace('\n', "\r\n"));
    *last_rendered = text;
}
