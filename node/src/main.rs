use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use log::{error, info, warn};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use flynn_node::auth::{AccountRecord, AccountStore, AuthClient, AuthSession};
use flynn_node::session::WsConnector;
use flynn_node::state::keys;
use flynn_node::status::StatusPanel;
use flynn_node::{Config, ConnectionManager, SessionError, StateStore};

#[derive(Parser, Debug)]
#[command(
    name = "flynn-node",
    version,
    about = "🌐 Flynn Node - keeps your node session online and tracks rewards",
    long_about = None
)]
struct Cli {
    /// Config file path (default: ~/.flynn/node-config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding state.json and account.json
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    /// Quiet mode (warnings and errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect and keep the session alive until Ctrl+C
    Run {
        /// Use this user id instead of the persisted one
        #[arg(long)]
        user_id: Option<String>,

        /// Override the WebSocket endpoint
        #[arg(long)]
        endpoint: Option<String>,
    },

    /// Log in with email and password; stores tokens and the user id
    Login {
        #[arg(long)]
        email: Option<String>,

        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,
    },

    /// Set the user id manually (no account login)
    SetUser { user_id: String },

    /// Forget the session state and stored account
    Logout,

    /// Write a default config file (to --config or ~/.flynn/node-config.json)
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Show the persisted session state
    Status {
        /// Print JSON instead of the panel
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Command::InitConfig { force } = &cli.command {
        init_logging(&cli, log::LevelFilter::Info);
        let path = Config::write_default(cli.config.as_deref(), *force)?;
        println!("{} config written to {}", " ✓ ".bright_green().bold(), path.display().to_string().bright_white());
        return Ok(());
    }

    let mut config = Config::load(cli.config.as_deref())?;
    init_logging(&cli, config.log_level()?);
    if let Some(dir) = &cli.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }
    if cli.no_color || config.logging.no_color {
        colored::control::set_override(false);
    }

    let store = StateStore::open(config.state_path()?);
    let accounts = AccountStore::open(config.account_path()?);

    match cli.command {
        Command::Run { user_id, endpoint } => {
            if let Some(endpoint) = endpoint {
                config.endpoint.url = endpoint;
            }
            config.validate()?;
            if !(cli.quiet || config.logging.quiet) {
                print_banner(&config);
            }
            run(config, store, accounts, user_id).await
        }
        Command::Login { email, password } => login(&config, &store, &accounts, email, password).await,
        Command::SetUser { user_id } => {
            claim_user(&store, &user_id)?;
            println!("{} user id set to {}", " ✓ ".bright_green().bold(), user_id.bright_white());
            Ok(())
        }
        Command::Logout => {
            store.clear().context("Failed to clear session state")?;
            accounts.clear().context("Failed to clear account")?;
            println!("{} logged out; local state removed", " ✓ ".bright_green().bold());
            Ok(())
        }
        Command::InitConfig { .. } => Ok(()),
        Command::Status { json } => {
            let state = store.snapshot();
            let panel = StatusPanel::new(&state);
            if json {
                println!("{}", serde_json::to_string_pretty(&panel.to_json())?);
            } else {
                panel.print();
            }
            Ok(())
        }
    }
}

/// `--debug` and `--quiet` win over the configured level
fn init_logging(cli: &Cli, configured: log::LevelFilter) {
    let level = if cli.debug {
        log::LevelFilter::Debug
    } else if cli.quiet {
        log::LevelFilter::Warn
    } else {
        configured
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .init();
}

async fn run(config: Config, store: StateStore, accounts: AccountStore, user_id: Option<String>) -> Result<()> {
    let user_id = match user_id.or_else(|| store.snapshot().user_id) {
        Some(id) => id,
        None => bail!("No user id known. Run `flynn-node login` or `flynn-node set-user <id>` first"),
    };
    let user_id = user_id.trim().to_string();
    claim_user(&store, &user_id)?;

    let manager = ConnectionManager::new(config.session_settings(), store.clone(), Arc::new(WsConnector));
    manager.connect(&user_id).await?;

    let background = CancellationToken::new();

    // Ctrl+C → orderly disconnect
    let shutdown_manager = manager.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            println!();
            info!("🛑 Shutting down...");
            shutdown_manager.disconnect().await;
        }
    });

    if config.session.status_interval_secs > 0 {
        tokio::spawn(status_loop(
            manager.clone(),
            Duration::from_secs(config.session.status_interval_secs),
            background.clone(),
        ));
    }

    match accounts.load() {
        Some(account) if config.auth.auto_login_interval_secs > 0 && !config.auth.api_key.is_empty() => {
            let client = AuthClient::new(&config.auth.api_url, &config.auth.api_key)?;
            tokio::spawn(refresh_loop(
                client,
                accounts,
                account,
                Duration::from_secs(config.auth.auto_login_interval_secs),
                background.clone(),
            ));
        }
        Some(_) => info!("Account token refresh disabled (no API key or interval is 0)"),
        None => {}
    }

    let outcome = manager.wait().await;
    background.cancel();

    match outcome {
        Ok(()) => {
            StatusPanel::new(&store.snapshot()).print();
            Ok(())
        }
        Err(e @ SessionError::ReconnectExhausted { .. }) => {
            error!("❌ {}", e);
            Err(e).context("Session failed; restart the node to try again")
        }
        Err(e) => Err(e.into()),
    }
}

async fn status_loop(manager: ConnectionManager, period: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let state = manager.store().snapshot();
                StatusPanel::new(&state)
                    .with_connection(manager.state(), manager.attempts())
                    .print();
            }
        }
    }
}

/// Keep the stored tokens fresh while the node runs
async fn refresh_loop(
    client: AuthClient,
    accounts: AccountStore,
    mut account: AccountRecord,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => match client.refresh(&account.refresh_token).await {
                Ok(session) => {
                    account.access_token = session.access_token;
                    account.refresh_token = session.refresh_token;
                    match accounts.save(&account) {
                        Ok(()) => info!("🔑 Account tokens refreshed"),
                        Err(e) => warn!("Failed to store refreshed tokens: {}", e),
                    }
                }
                Err(e) => warn!("Token refresh failed: {}", e),
            },
        }
    }
}

async fn login(
    config: &Config,
    store: &StateStore,
    accounts: &AccountStore,
    email: Option<String>,
    password: Option<String>,
) -> Result<()> {
    let email = match email {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = match password {
        Some(password) => password,
        None => prompt("Password: ")?,
    };
    if email.is_empty() || password.is_empty() {
        bail!("Email and password are required");
    }

    let client = AuthClient::new(&config.auth.api_url, &config.auth.api_key)?;
    let session: AuthSession = client.login(&email, &password).await.context("Login failed")?;
    claim_user(store, &session.user_id)?;

    let personal_code = match client.personal_code(&session).await {
        Ok(code) => code,
        Err(e) => {
            warn!("Could not fetch personal code: {}", e);
            None
        }
    };

    accounts.save(&AccountRecord {
        email,
        access_token: session.access_token,
        refresh_token: session.refresh_token,
        personal_code: personal_code.clone(),
    })?;

    println!("{} logged in as {}", " ✓ ".bright_green().bold(), session.user_id.bright_white());
    if let Some(code) = personal_code {
        println!("{}  {:<14} {}", "   ".bright_black(), "personal code".bright_black(), code.bright_cyan());
    }
    Ok(())
}

/// Persist `user_id`, refusing to replace a different one already on disk.
fn claim_user(store: &StateStore, user_id: &str) -> Result<()> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        bail!("User id must not be empty");
    }
    if let Some(existing) = store.snapshot().user_id {
        if existing != user_id {
            bail!(
                "State already belongs to user {}. Run `flynn-node logout` first",
                existing
            );
        }
        return Ok(());
    }
    store
        .merge(serde_json::json!({ keys::USER_ID: user_id }))
        .context("Failed to persist user id")
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

fn print_banner(config: &Config) {
    println!();
    println!("{}", " ╔════════════════════════════════════════════════════╗".bright_cyan());
    println!("{}{}{}", " ║ ".bright_cyan(), format!("      FLYNN NODE  v{:<8}                         ", env!("CARGO_PKG_VERSION")).bright_white().bold(), " ║".bright_cyan());
    println!("{}{}{}", " ║ ".bright_cyan(), "      Heartbeat · Reward window · Auto-reconnect    ".bright_black(), " ║".bright_cyan());
    println!("{}", " ╚════════════════════════════════════════════════════╝".bright_cyan());
    println!();
    println!("{} {}", " * ".bright_green().bold(), "CONFIG".bright_white().bold());
    println!("{}  {:<12} {}", "   ".bright_black(), "endpoint".bright_black(), config.endpoint.url.bright_white());
    println!("{}  {:<12} {}", "   ".bright_black(), "version".bright_black(), config.endpoint.version.bright_white());
    println!("{}  {:<12} {}s", "   ".bright_black(), "ping".bright_black(), config.session.ping_interval_secs.to_string().bright_magenta());
    println!("{}  {:<12} {} attempts", "   ".bright_black(), "reconnect".bright_black(), config.reconnect.max_attempts.to_string().bright_magenta());
    println!();
}
