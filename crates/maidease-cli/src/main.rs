//! MaidEase CLI - a command-line front end for the MaidEase booking API.
//!
//! Logs in once, keeps the session in the configured credential store, and
//! sends authenticated requests through the refreshing pipeline.

use std::io::{self, Write};
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use maidease_client::{
    ApiClient, ApiError, ApiRequest, ClientConfig, CredentialStore, MultipartPart, Navigator,
};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

// ============================================================================
// Constants
// ============================================================================

/// Directory for rolling log files; logs go to stderr only when unset
const LOG_DIR_ENV: &str = "MAIDEASE_LOG_DIR";

const USAGE: &str = "\
Usage: maidease <command> [args]

Commands:
  login [email]                 Log in and store the session
  logout                        Forget the stored session
  whoami                        Show the logged-in user
  status                        Show configuration and session state
  get <path>                    GET an API path and print the JSON body
  post <path> <json>            POST a JSON body
  delete <path>                 DELETE an API path
  upload <path> <field> <file>  Upload a file as multipart/form-data";

/// Initialize the tracing subscriber for logging.
///
/// Returns the file appender guard, which must live until exit.
fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match std::env::var(LOG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => {
            let appender = tracing_appender::rolling::daily(dir, "maidease.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(fmt::layer().with_ansi(false).with_writer(writer)), Some(guard))
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

/// Tells the terminal user to log in again.
struct TerminalNavigator;

impl Navigator for TerminalNavigator {
    fn to_login(&self) {
        eprintln!("Your session has expired. Run `maidease login` to sign in again.");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();
    let _guard = init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let mut config = ClientConfig::load().context("Failed to load configuration")?;
    let store = config
        .open_credential_store()
        .context("Failed to open credential store")?;
    let client = ApiClient::new(&config, store, Arc::new(TerminalNavigator))?;
    info!(command = %command, base_url = %config.base_url, "MaidEase CLI starting");

    let result = match (command.as_str(), &args[1..]) {
        ("login", rest) => login(&client, &mut config, rest.first().map(String::as_str)).await,
        ("logout", []) => {
            client.logout();
            println!("Logged out.");
            Ok(())
        }
        ("whoami", []) => whoami(&client).await,
        ("status", []) => {
            status(&client, &config);
            Ok(())
        }
        ("get", [path]) => print_json(client.get_json(path).await),
        ("post", [path, body]) => {
            let body: serde_json::Value =
                serde_json::from_str(body).context("Request body is not valid JSON")?;
            print_json(client.post_json(path, &body).await)
        }
        ("delete", [path]) => {
            client.delete(path).await?;
            println!("Deleted {}", path);
            Ok(())
        }
        ("upload", [path, field, file]) => upload(&client, path, field, Path::new(file)).await,
        _ => {
            eprintln!("{}", USAGE);
            bail!("Unknown command or wrong arguments: {}", args.join(" "));
        }
    };

    if let Err(e) = &result {
        if let Some(api_error) = e.downcast_ref::<ApiError>() {
            if api_error.is_auth_failure() {
                eprintln!("Not logged in.");
            }
        }
    }
    result
}

async fn login(client: &ApiClient, config: &mut ClientConfig, email: Option<&str>) -> Result<()> {
    let email = match email.map(str::to_string).or_else(|| config.last_email.clone()) {
        Some(email) => email,
        None => {
            print!("Email: ");
            io::stdout().flush()?;
            let mut line = String::new();
            io::stdin().read_line(&mut line)?;
            line.trim().to_string()
        }
    };
    if email.is_empty() {
        bail!("Email is required");
    }

    let password = rpassword::prompt_password(format!("Password for {}: ", email))
        .context("Failed to read password")?;

    let profile = client.login(&email, &password).await?;
    println!("Logged in as {} ({})", profile.display_name(), profile.role_display());

    config.last_email = Some(email);
    config.save().context("Failed to save configuration")?;
    Ok(())
}

async fn whoami(client: &ApiClient) -> Result<()> {
    if !client.is_authenticated() {
        bail!("Not logged in");
    }
    let profile = client.current_user().await?;
    println!("{} <{}>", profile.display_name(), profile.email);
    println!("Role: {}", profile.role_display());
    Ok(())
}

fn status(client: &ApiClient, config: &ClientConfig) {
    println!("API:         {}", config.base_url);
    println!("Credentials: {}", client.store().name());
    match client.store().profile() {
        Some(profile) => println!("Session:     logged in as {}", profile.email),
        None if client.is_authenticated() => println!("Session:     logged in"),
        None => println!("Session:     not logged in"),
    }
}

async fn upload(client: &ApiClient, path: &str, field: &str, file: &Path) -> Result<()> {
    let data = std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let response = client
        .send(ApiRequest::post(path).multipart(vec![MultipartPart::file(field, file_name, data)]))
        .await?
        .error_for_status()?;
    println!("{}", response.text());
    Ok(())
}

fn print_json(result: Result<serde_json::Value, ApiError>) -> Result<()> {
    let value = result?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
