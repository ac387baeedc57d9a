//! Clientgate - command-line driver for the client portal sign-in flow.
//!
//! Each invocation runs one step of the flow against the portal's data
//! directory, so a whole sign-in can be walked through by hand:
//!
//! ```text
//! clientgate send client@example.com
//! clientgate redeem 'https://portal.example.com/portal/login.html?token=...'
//! clientgate contacts
//! clientgate whoami
//! clientgate sign-out
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use clientgate_core::auth::{
    AuthEngine, ContactResolution, CredentialStore, Navigator, RedeemOutcome, SessionGuard,
    SubmitOutcome, TokenStore,
};
use clientgate_core::config::{Config, CrmConfig};
use clientgate_core::crm::CrmClient;
use clientgate_core::mail::{ConsoleMailer, Delivery, Mailer, RelayMailer};
use clientgate_core::storage::{FileStore, KeyValueStore};

/// Log file name prefix inside the data directory's `logs/` folder.
const LOG_FILE_PREFIX: &str = "clientgate.log";

#[derive(Parser)]
#[command(name = "clientgate")]
#[command(about = "Client portal sign-in from the command line", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Request a sign-in link
    Send {
        /// Client email address
        email: String,
    },

    /// Redeem a sign-in link
    Redeem {
        /// Token value or the full sign-in link
        token: String,
    },

    /// Show the current session
    Whoami,

    /// Resolve the CRM contact for the session
    Contacts,

    /// Bind the session to one of several contacts
    Select {
        /// CRM contact id
        contact_id: String,
    },

    /// Re-fetch the bound contact
    Restore,

    /// End the session
    SignOut,

    /// Drop expired sign-in links
    Purge,

    /// Save the CRM instance URL and access token
    ConfigureCrm {
        /// Instance URL, e.g. https://firm.my.salesforce.com
        instance_url: String,

        /// REST API version
        #[arg(long)]
        api_version: Option<String>,
    },

    /// Save the mail relay secret in the keychain
    SetRelaySecret,
}

/// Initialize the tracing subscriber for logging.
///
/// Use RUST_LOG to control the level (e.g., RUST_LOG=debug). Output goes to
/// stderr and to a daily log file under the data directory.
fn init_tracing(data_dir: &Path) -> WorkerGuard {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let file_appender = tracing_appender::rolling::daily(data_dir.join("logs"), LOG_FILE_PREFIX);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(file_writer))
        .with(filter)
        .init();

    guard
}

/// Prints the navigation a browser would perform.
struct ConsoleNavigator;

impl Navigator for ConsoleNavigator {
    fn replace(&self, location: &str) {
        println!("Not signed in. Continue at {}", location);
    }
}

fn build_mailer(config: &Config) -> Result<Mailer> {
    match (&config.mail_relay_url, CredentialStore::mail_relay_secret()) {
        (Some(url), Some(secret)) => Ok(Mailer::Relay(RelayMailer::new(url.clone(), secret)?)),
        (Some(_), None) => {
            eprintln!("Mail relay configured but no secret found; links will be printed instead.");
            Ok(Mailer::Console(ConsoleMailer))
        }
        _ => Ok(Mailer::Console(ConsoleMailer)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let config = Config::load()?;
    let store = Arc::new(FileStore::new(config.data_dir()?)?);
    let _log_guard = init_tracing(store.data_dir());
    info!(command = ?cli.command, data_dir = %store.data_dir().display(), "Clientgate starting");

    match &cli.command {
        Command::ConfigureCrm {
            instance_url,
            api_version,
        } => return configure_crm(store.as_ref(), instance_url, api_version.clone()),
        Command::SetRelaySecret => return set_relay_secret(),
        _ => {}
    }

    let crm_config = CrmConfig::load(store.as_ref())?.with_env_overrides();
    let crm = CrmClient::new(crm_config, config.gateway_timeout())?;
    let engine = AuthEngine::new(store.clone(), &config, crm, build_mailer(&config)?);
    engine.sync().await?;

    match cli.command {
        Command::Send { email } => send(&engine, &email).await,
        Command::Redeem { token } => redeem(&engine, &token).await,
        Command::Whoami => {
            whoami(&engine);
            Ok(())
        }
        Command::Contacts => contacts(&engine).await,
        Command::Select { contact_id } => select(&engine, &contact_id).await,
        Command::Restore => restore(&engine).await,
        Command::SignOut => {
            let redirect = engine.sign_out().await?;
            println!("Signed out. Continue at {}", redirect.location);
            Ok(())
        }
        Command::Purge => {
            let removed = engine.tokens().purge_expired()?;
            println!(
                "Removed {} expired link(s); {} still live.",
                removed,
                engine.tokens().live_count()?
            );
            Ok(())
        }
        Command::ConfigureCrm { .. } | Command::SetRelaySecret => Ok(()),
    }
}

async fn send(engine: &AuthEngine, email: &str) -> Result<()> {
    let outcome = engine.submit(email).await?;
    println!("{}", outcome.user_message());

    if let SubmitOutcome::LinkSent {
        delivery,
        verification,
        ..
    } = outcome
    {
        if verification.is_degraded() {
            info!("CRM unavailable; link issued without verification");
        }
        if let Delivery::Surfaced(message) = delivery {
            println!("\nThe email could not be sent. Sign-in link:\n  {}", message.link);
        }
    }
    Ok(())
}

async fn redeem(engine: &AuthEngine, input: &str) -> Result<()> {
    let outcome = match TokenStore::extract_token(input) {
        Some(token) => engine.redeem(&token).await?,
        None => RedeemOutcome::LinkInvalid,
    };
    println!("{}", outcome.user_message());

    if let RedeemOutcome::Authenticated(session) = outcome {
        println!(
            "Welcome, {}. Session expires at {}.",
            session.display_name,
            session.expires_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

fn whoami(engine: &AuthEngine) {
    let guard = SessionGuard::new(engine.sessions().clone());
    if let Some(session) = guard.require_session(&ConsoleNavigator) {
        println!("Signed in as {}", session.email);
        if let Some(ref name) = session.contact_name {
            println!("Client:  {}", name);
        }
        println!("Expires in {} minute(s)", session.minutes_until_expiry());
    }
}

async fn contacts(engine: &AuthEngine) -> Result<()> {
    match engine.resolve_contacts().await? {
        ContactResolution::Bound(contact) => {
            println!("Client: {} ({})", contact.full_name(), contact.id);
            match (&contact.upload_link, &contact.view_link) {
                (None, None) => println!("Your document folders are being set up."),
                (upload, view) => {
                    if let Some(link) = upload {
                        println!("Upload documents: {}", link);
                    }
                    if let Some(link) = view {
                        println!("View documents:   {}", link);
                    }
                }
            }
        }
        ContactResolution::Choose(candidates) => {
            println!("Several clients share this email. Choose one with `clientgate select <id>`:");
            for contact in candidates {
                println!("  {}  {}", contact.id, contact.full_name());
            }
        }
        ContactResolution::Pending => {
            println!("Your client record is being set up. Please check back later.");
        }
        ContactResolution::NoSession => ConsoleNavigator.replace(engine.sessions().sign_in_url()),
        ContactResolution::Superseded => {}
    }
    Ok(())
}

async fn select(engine: &AuthEngine, id: &str) -> Result<()> {
    let candidates = match engine.resolve_contacts().await? {
        ContactResolution::Choose(candidates) => candidates,
        ContactResolution::Bound(contact) if contact.id == id => vec![contact],
        ContactResolution::NoSession => {
            ConsoleNavigator.replace(engine.sessions().sign_in_url());
            return Ok(());
        }
        _ => Vec::new(),
    };

    let contact = match candidates.into_iter().find(|c| c.id == id) {
        Some(contact) => contact,
        None => bail!("No contact {} for this session", id),
    };

    match engine.select_contact(&contact).await? {
        Some(_) => println!("Now viewing {}", contact.full_name()),
        None => ConsoleNavigator.replace(engine.sessions().sign_in_url()),
    }
    Ok(())
}

async fn restore(engine: &AuthEngine) -> Result<()> {
    match engine.restore_contact().await? {
        Some(contact) => println!("Client: {} ({})", contact.full_name(), contact.id),
        None => println!("No client selected."),
    }
    Ok(())
}

fn configure_crm(
    store: &dyn KeyValueStore,
    instance_url: &str,
    api_version: Option<String>,
) -> Result<()> {
    let access_token = match std::env::var("SF_ACCESS_TOKEN") {
        Ok(token) if !token.trim().is_empty() => token,
        _ => rpassword::prompt_password("CRM access token: ")
            .context("Failed to read access token")?,
    };

    let mut crm = CrmConfig::new(instance_url.trim(), access_token.trim());
    crm.api_version = api_version;
    crm.save(store)?;
    println!("CRM configured for {} (API v{})", crm.instance_url, crm.api_version());
    Ok(())
}

fn set_relay_secret() -> Result<()> {
    let secret = rpassword::prompt_password("Mail relay secret: ")
        .context("Failed to read relay secret")?;
    if secret.trim().is_empty() {
        CredentialStore::delete_mail_relay_secret()?;
        println!("Mail relay secret removed.");
    } else {
        CredentialStore::store_mail_relay_secret(secret.trim())?;
        println!("Mail relay secret saved to the keychain.");
    }
    Ok(())
}
