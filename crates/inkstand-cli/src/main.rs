//! inkstand - command-line client for the CMS session layer.
//!
//! Signs in (including the two-factor step), restores the stored session,
//! and sends authenticated requests that are refreshed and retried on 401.

use std::io::{self, BufRead, Write};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::{debug, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use inkstand_core::auth::{AuthError, Session, SessionEvent};
use inkstand_core::config::StorageKind;
use inkstand_core::models::{LoginCredentials, RegisterRequest};
use inkstand_core::{ApiRequest, ApiResponse, Config, LoginOutcome};

/// Log file written next to the stored credentials
const LOG_FILE: &str = "inkstand.log";

/// Attempts at the one-time code before giving up
const MAX_TOTP_ATTEMPTS: u32 = 3;

#[derive(Parser)]
#[command(name = "inkstand", version, about = "Sign in to a CMS and call its API")]
struct Cli {
    /// CMS API base URL (overrides config and INKSTAND_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    /// Where to keep credentials: file, keyring or memory
    #[arg(long, global = true)]
    storage: Option<StorageKind>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Sign in with email and password
    Login {
        /// Defaults to the last email used
        email: Option<String>,
    },
    /// Create an account and sign in
    Register {
        email: String,
        #[arg(long)]
        firstname: String,
        #[arg(long)]
        lastname: String,
        /// Invitation to accept while registering
        #[arg(long)]
        invite: Option<String>,
    },
    /// Sign out and forget stored credentials
    Logout,
    /// Restore the stored session and show the signed-in user
    #[command(alias = "status")]
    Whoami,
    /// Exchange the refresh token now
    Refresh,
    /// Send an authenticated GET request
    Get {
        path: String,
        /// Query parameters as key=value
        #[arg(short, long = "query", value_parser = parse_key_value)]
        query: Vec<(String, String)>,
    },
    /// Send an authenticated POST request with a JSON body
    Post {
        path: String,
        /// JSON body, e.g. '{"title": "Hello"}'
        body: Option<String>,
    },
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{}'", raw))
}

/// Initialize the tracing subscriber for logging
fn init_tracing(config: &Config) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file = config
        .cache_dir()
        .ok()
        .filter(|dir| std::fs::create_dir_all(dir).is_ok())
        .map(|dir| tracing_appender::non_blocking(tracing_appender::rolling::never(dir, LOG_FILE)));
    let (file_layer, guard) = match file {
        Some((writer, guard)) => (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        ),
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(url) = cli.api_url.clone() {
        config.api_base_url = url;
    }
    if let Some(storage) = cli.storage {
        config.storage = storage;
    }

    let _guard = init_tracing(&config);
    debug!(api = %config.api_base_url, storage = ?config.storage, "inkstand starting");

    let session = inkstand_core::connect(&config)?;
    let mut events = session.subscribe();

    let signing_out = matches!(cli.command, Command::Logout);
    let result = run(cli.command, &session, &mut config).await;
    if !signing_out {
        report_login_required(&mut events);
    }
    result
}

async fn run(command: Command, session: &Arc<Session>, config: &mut Config) -> Result<()> {
    match command {
        Command::Login { email } => login(session, config, email).await,
        Command::Register {
            email,
            firstname,
            lastname,
            invite,
        } => {
            let password = rpassword::prompt_password("Choose a password: ")?;
            let registration = RegisterRequest {
                email: email.clone(),
                password,
                firstname,
                lastname,
                invite_id: invite,
            };
            let user = session
                .register(&registration)
                .await
                .context("Registration failed")?;
            remember_email(config, email);
            println!("Registered and signed in as {}", user.full_name());
            Ok(())
        }
        Command::Logout => {
            session.logout().await;
            println!("Signed out");
            Ok(())
        }
        Command::Whoami => match session.init_auth().await? {
            Some(user) => print_json(&serde_json::to_value(user)?),
            None => bail!("Not signed in. Run `inkstand login`."),
        },
        Command::Refresh => {
            session.refresh_token().await.context("Token refresh failed")?;
            let expires = session.credentials().time_until_expiry();
            println!("Token refreshed, valid for {}s", expires.as_secs());
            Ok(())
        }
        Command::Get { path, query } => {
            let request = query
                .into_iter()
                .fold(ApiRequest::get(path), |req, (k, v)| req.query(k, v));
            send(session, request).await
        }
        Command::Post { path, body } => {
            let body: Value = match body {
                Some(raw) => serde_json::from_str(&raw).context("Body is not valid JSON")?,
                None => Value::Object(Default::default()),
            };
            send(session, ApiRequest::post(path).json(&body)?).await
        }
    }
}

async fn login(session: &Session, config: &mut Config, email: Option<String>) -> Result<()> {
    let email = match email.or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => prompt("Email: ")?,
    };
    let password = rpassword::prompt_password(format!("Password for {}: ", email))?;

    let mut outcome = session
        .login(LoginCredentials::new(email.clone(), password), None)
        .await
        .context("Login failed")?;

    let mut attempts = 0;
    while outcome == LoginOutcome::TwoFactorRequired {
        attempts += 1;
        let code = prompt("Two-factor code: ")?;
        outcome = match session.verify_two_factor(&code).await {
            Err(AuthError::InvalidTwoFactorCode) if attempts < MAX_TOTP_ATTEMPTS => {
                eprintln!("Invalid code, try again.");
                LoginOutcome::TwoFactorRequired
            }
            other => other.context("Two-factor verification failed")?,
        };
    }

    if let LoginOutcome::Authenticated(user) = outcome {
        info!(email = %user.email, "Signed in from CLI");
        println!("Signed in as {}", user.full_name());
    }
    remember_email(config, email);
    Ok(())
}

async fn send(session: &Session, request: ApiRequest) -> Result<()> {
    let response = session
        .api()
        .send(&request)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))
        .with_context(|| format!("{} {} failed", request.method, request.endpoint))?;

    match response {
        ApiResponse::Json(value) => print_json(&value),
        ApiResponse::Text(text) => {
            println!("{}", text);
            Ok(())
        }
        ApiResponse::Empty => Ok(()),
    }
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn prompt(label: &str) -> Result<String> {
    print!("{}", label);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    let value = line.trim().to_string();
    if value.is_empty() {
        bail!("No input given");
    }
    Ok(value)
}

fn remember_email(config: &mut Config, email: String) {
    config.last_email = Some(email);
    if let Err(e) = config.save() {
        debug!(error = %e, "Could not save config");
    }
}

fn report_login_required(events: &mut broadcast::Receiver<SessionEvent>) {
    while let Ok(event) = events.try_recv() {
        if let SessionEvent::LoginRequired { .. } = event {
            eprintln!("Session expired. Run `inkstand login` to sign in again.");
        }
    }
}
