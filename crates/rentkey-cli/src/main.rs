//! rentkey - command-line front end for the rental-management session.
//!
//! Signs in, shows the current identity and keeps the session alive. All
//! token handling goes through `rentkey-core`.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use rentkey_core::auth::CredentialStore;
use rentkey_core::{
    ApiClient, Config, NewAccount, SessionClient, SessionContext, SessionSnapshot, TokenManager,
};

#[derive(Parser)]
#[command(name = "rentkey", version, about = "Manage your rental-management session")]
struct Cli {
    /// API base URL (overrides the config file)
    #[arg(long, env = "RENTKEY_API_URL")]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        #[arg(long)]
        email: Option<String>,
    },
    /// Create an account and sign in
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        email: String,
    },
    /// Show the signed-in user
    Whoami,
    /// Show credential lifetime and refresh schedule
    Status,
    /// Renew the credential now
    Refresh,
    /// Sign out and forget the stored credential
    Logout,
    /// Keep the session alive, printing identity changes until Ctrl+C
    Watch,
    /// GET a path with the session credential attached and print the JSON
    Get { path: String },
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match config.cache_dir() {
        Ok(dir) if config.log_to_file => {
            let appender = tracing_appender::rolling::daily(dir.join("logs"), "rentkey.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_writer(writer).with_ansi(false)), Some(guard))
        }
        _ => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

struct Session {
    context: SessionContext,
    client: SessionClient,
}

fn open_session(config: &Config) -> Result<Session> {
    let timings = config.timings();
    let api = ApiClient::new(&config.api_base_url, timings.request_timeout)
        .context("Failed to build HTTP client")?;
    let store = CredentialStore::open(config.open_storage()?);
    let backend = Arc::new(api.clone());
    let manager = TokenManager::new(store, backend.clone(), timings);

    Ok(Session {
        context: SessionContext::new(manager.clone(), backend),
        client: SessionClient::new(api, manager),
    })
}

fn prompt(label: &str, default: Option<&str>) -> Result<String> {
    match default {
        Some(value) => print!("{} [{}]: ", label, value),
        None => print!("{}: ", label),
    }
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    let input = input.trim();
    Ok(match (input.is_empty(), default) {
        (true, Some(value)) => value.to_string(),
        _ => input.to_string(),
    })
}

fn format_ttl(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m {:02}s", minutes, seconds)
    }
}

fn print_identity(snapshot: &SessionSnapshot) {
    match &snapshot.user {
        Some(user) => {
            println!("Signed in as {} <{}>", user.display_name(), user.email);
            if let Some(role) = &user.role {
                println!("  Role: {}", role);
            }
            if let Some(expires_at) = snapshot.expires_at {
                println!("  Credential expires: {}", expires_at.format("%Y-%m-%d %H:%M:%S UTC"));
            }
            if snapshot.expiring_soon {
                println!("  Warning: session is about to expire");
            }
        }
        None if snapshot.loading => println!("Checking session..."),
        None => println!("Not signed in"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load().unwrap_or_else(|e| {
        eprintln!("Warning: failed to load config ({}), using defaults", e);
        Config::default()
    });
    if let Some(url) = cli.api_url {
        config.api_base_url = url;
    }

    let _log_guard = init_tracing(&config);
    info!(api = %config.api_base_url, "rentkey starting");

    let session = open_session(&config)?;
    let context = &session.context;

    match cli.command {
        Command::Login { email } => {
            let email = match email {
                Some(email) => email,
                None => prompt("Email", config.last_email.as_deref())?,
            };
            let password = rpassword::prompt_password("Password: ")?;

            let snapshot = context.login(&email, &password).await?;
            config.last_email = Some(email);
            if let Err(e) = config.save() {
                tracing::warn!(error = %e, "Failed to save config");
            }
            print_identity(&snapshot);
        }
        Command::Register { name, email } => {
            let password = rpassword::prompt_password("Choose a password: ")?;
            let account = NewAccount {
                name,
                email: email.clone(),
                password,
            };
            let snapshot = context.register(&account).await?;
            config.last_email = Some(email);
            if let Err(e) = config.save() {
                tracing::warn!(error = %e, "Failed to save config");
            }
            print_identity(&snapshot);
        }
        Command::Whoami => {
            let snapshot = context.start().await?;
            print_identity(&snapshot);
        }
        Command::Status => {
            let manager = context.manager();
            match manager.current() {
                Some(credential) => {
                    let now = Utc::now();
                    let timings = manager.timings();
                    println!("Subject: {}", credential.subject().unwrap_or("(none)"));
                    if credential.is_expired(now) {
                        println!("Expired");
                    } else {
                        println!("Expires in: {}", format_ttl(credential.time_to_live(now)));
                        println!(
                            "Expiring soon: {}",
                            credential.is_expiring_soon(now, timings.expiring_soon)
                        );
                        let refresh_in = credential
                            .time_to_live(now)
                            .saturating_sub(timings.refresh_margin.as_secs());
                        println!("Proactive refresh in: {}", format_ttl(refresh_in));
                    }
                }
                None => println!("Not signed in"),
            }
        }
        Command::Refresh => {
            let credential = context.manager().refresh().await?;
            println!(
                "Credential renewed, expires in {}",
                format_ttl(credential.time_to_live(Utc::now()))
            );
        }
        Command::Logout => {
            context.logout();
            println!("Signed out");
        }
        Command::Watch => {
            let snapshot = context.start().await?;
            print_identity(&snapshot);
            if !snapshot.is_authenticated() {
                return Ok(());
            }

            context.spawn_revalidation();
            let mut changes = context.watch();
            loop {
                tokio::select! {
                    changed = changes.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let snapshot = changes.borrow_and_update().clone();
                        print_identity(&snapshot);
                        if !snapshot.loading && !snapshot.is_authenticated() {
                            break;
                        }
                    }
                    _ = tokio::signal::ctrl_c() => break,
                }
            }
        }
        Command::Get { path } => {
            context.start().await?;
            let body: serde_json::Value = session.client.get(&path).await?;
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
    }

    info!("rentkey shutting down");
    Ok(())
}
