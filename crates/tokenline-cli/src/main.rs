//! tokenline - command-line front end for the tokenline API client.
//!
//! Signs in against the configured backend, keeps credentials in the OS
//! keychain (or a file), and issues authenticated requests with automatic
//! token refresh.

use std::io::{self, Write};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::Value;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tokenline_core::{
    format_error_message, ApiClient, ApiError, AuthService, Config, CredentialStore, FileStore,
    KeyringStore, QueryCache, SessionState,
};

/// Credentials file name in the cache directory, for `--store file`
const CREDENTIALS_FILE: &str = "credentials.json";

/// Log file name in the cache directory, written when logging is enabled
const LOG_FILE: &str = "tokenline.log";

#[derive(Parser)]
#[command(name = "tokenline", version, about = "Authenticated REST client with automatic token refresh")]
struct Cli {
    /// Where credentials are kept
    #[arg(long, value_enum, default_value_t = StoreKind::Keyring, global = true)]
    store: StoreKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum StoreKind {
    Keyring,
    File,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and sign in
    Signup {
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        name: Option<String>,
    },
    /// Sign out and forget stored credentials
    Logout,
    /// Show who is signed in
    Status,
    /// GET a path and print the JSON response
    Get { path: String },
    /// POST a JSON body to a path
    Post { path: String, body: String },
    /// PUT a JSON body to a path
    Put { path: String, body: String },
    /// DELETE a path
    Delete { path: String },
    /// Show or change configuration
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    SetBaseUrl { url: String },
    SetTimeout { ms: u64 },
    SetMaxRetries { count: u32 },
    SetLogging { enabled: bool },
}

/// Initialize the tracing subscriber for logging.
///
/// RUST_LOG controls stderr output (default `warn`). With logging enabled
/// in the config, debug output also goes to a file in the cache directory.
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let stderr_layer = fmt::layer().with_writer(io::stderr).with_filter(filter);

    let (file_layer, guard) = match (config.logging, Config::cache_dir()) {
        (true, Ok(dir)) => {
            let appender = tracing_appender::rolling::never(dir, LOG_FILE);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(EnvFilter::new("tokenline_core=debug,tokenline=debug"));
            (Some(layer), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}

fn open_store(kind: StoreKind) -> Result<Arc<dyn CredentialStore>> {
    Ok(match kind {
        StoreKind::Keyring => Arc::new(KeyringStore::new()),
        StoreKind::File => Arc::new(FileStore::new(Config::cache_dir()?.join(CREDENTIALS_FILE))),
    })
}

fn prompt(label: &str) -> Result<String> {
    print!("{}: ", label);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().to_string())
}

fn prompt_password() -> Result<String> {
    let password = rpassword::prompt_password("Password: ")?;
    Ok(password)
}

fn parse_body(raw: &str) -> Result<Value> {
    serde_json::from_str(raw).context("Request body must be valid JSON")
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cache keys are request paths; a mutation invalidates everything under
/// the first path segment.
fn resource_prefix(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    let first = trimmed.split(['/', '?']).next().unwrap_or_default();
    format!("/{}", first)
}

async fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Command::Config { action } => run_config(config, action),
        command => run_api(command, cli.store, &config).await,
    }
}

async fn run_api(command: Command, store: StoreKind, config: &Config) -> Result<()> {
    let session = SessionState::new();
    let api = ApiClient::new(config, open_store(store)?, session.clone())?;
    let cache = QueryCache::from_config(config);
    let auth = AuthService::new(api.clone()).with_cache(cache.clone());

    auth.restore().await;
    debug!(authenticated = session.is_authenticated(), "Session restored");

    match command {
        Command::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => prompt("Email")?,
            };
            let password = prompt_password()?;
            let user = auth.login(&email, &password).await?;
            println!("Signed in as {}", user.display_name());
        }
        Command::Signup { email, name } => {
            let email = match email {
                Some(email) => email,
                None => prompt("Email")?,
            };
            let password = prompt_password()?;
            let user = auth.signup(&email, &password, name.as_deref()).await?;
            println!("Account created, signed in as {}", user.display_name());
        }
        Command::Logout => {
            auth.logout().await;
            println!("Signed out");
        }
        Command::Status => match session.user() {
            Some(user) if session.is_authenticated() => {
                println!("Signed in as {} <{}>", user.display_name(), user.email)
            }
            _ => println!("Not signed in"),
        },
        Command::Get { path } => {
            let value: Value = cache.fetch(&path, || api.get::<Value>(&path)).await?;
            print_json(&value)?;
        }
        Command::Post { path, body } => {
            let body = parse_body(&body)?;
            let prefix = resource_prefix(&path);
            let value: Value = cache.mutate(api.post(&path, &body), &[&prefix]).await?;
            print_json(&value)?;
        }
        Command::Put { path, body } => {
            let body = parse_body(&body)?;
            let prefix = resource_prefix(&path);
            let value: Value = cache.mutate(api.put(&path, &body), &[&prefix]).await?;
            print_json(&value)?;
        }
        Command::Delete { path } => {
            let prefix = resource_prefix(&path);
            let value: Value = cache.mutate(api.delete(&path), &[&prefix]).await?;
            print_json(&value)?;
        }
        Command::Config { action } => run_config(config.clone(), action)?,
    }

    Ok(())
}

fn run_config(mut config: Config, action: Option<ConfigAction>) -> Result<()> {
    let Some(action) = action else {
        println!("{}", serde_json::to_string_pretty(&config)?);
        return Ok(());
    };

    match action {
        ConfigAction::SetBaseUrl { url } => config.base_url = url,
        ConfigAction::SetTimeout { ms } => config.timeout_ms = ms,
        ConfigAction::SetMaxRetries { count } => config.max_retries = count,
        ConfigAction::SetLogging { enabled } => config.logging = enabled,
    }
    config.validate()?;
    config.save().context("Failed to save config")?;
    println!("Configuration saved");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    let _guard = init_tracing(&config);
    info!(base_url = %config.base_url, "tokenline starting");

    match run(cli, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Typed API failures get their user-facing message
            if e.downcast_ref::<ApiError>().is_some() {
                let err: &(dyn std::error::Error + 'static) = e.as_ref();
                eprintln!("Error: {}", format_error_message(Some(err)));
            } else {
                eprintln!("Error: {:#}", e);
            }
            ExitCode::FAILURE
        }
    }
}
