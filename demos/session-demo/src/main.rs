//! Interactive console over the session coordinator.
//!
//! Run with: cargo run -p session-demo
//!
//! Drives the coordinator against the in-memory provider and prints every
//! committed state. Type `help` for the command list.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use anyhow::{Context, Result, bail};
use futures::StreamExt;
use portfolio_auth_core::{OperationResult, ProfileMetadata, StateSnapshot};
use portfolio_auth_session::{
    CoordinatorConfig, SessionCoordinator, provider::MemoryIdentityProvider,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEMO_EMAIL: &str = "demo@example.com";
const DEMO_PASSWORD: &str = "password";

const HELP: &str = "\
commands:
  signup <email> <password> [full name]
  signin <email> <password>
  signout | refresh | clear | state
provider events:
  rotate | expire | revoke | offline | online | confirm-emails on|off | confirm <email>
  help | quit";

#[derive(Debug, PartialEq, Eq)]
enum Command {
    SignUp {
        email: String,
        password: String,
        full_name: Option<String>,
    },
    SignIn {
        email: String,
        password: String,
    },
    SignOut,
    Refresh,
    Clear,
    State,
    Rotate,
    Expire,
    Revoke,
    Offline(bool),
    RequireConfirmation(bool),
    Confirm(String),
    Help,
    Quit,
}

fn parse(line: &str) -> Result<Command> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        bail!("empty command");
    };
    let mut arg = |name: &str| {
        words
            .next()
            .map(str::to_string)
            .with_context(|| format!("missing <{name}>"))
    };

    let command = match verb {
        "signup" => Command::SignUp {
            email: arg("email")?,
            password: arg("password")?,
            full_name: {
                let rest: Vec<&str> = words.collect();
                (!rest.is_empty()).then(|| rest.join(" "))
            },
        },
        "signin" => Command::SignIn {
            email: arg("email")?,
            password: arg("password")?,
        },
        "signout" => Command::SignOut,
        "refresh" => Command::Refresh,
        "clear" => Command::Clear,
        "state" => Command::State,
        "rotate" => Command::Rotate,
        "expire" => Command::Expire,
        "revoke" => Command::Revoke,
        "offline" => Command::Offline(true),
        "online" => Command::Offline(false),
        "confirm-emails" => match arg("on|off")?.as_str() {
            "on" => Command::RequireConfirmation(true),
            "off" => Command::RequireConfirmation(false),
            other => bail!("expected on or off, got {other}"),
        },
        "confirm" => Command::Confirm(arg("email")?),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command: {other}"),
    };
    Ok(command)
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

fn render(snapshot: &StateSnapshot) -> String {
    let state = &snapshot.state;
    let who = match state.session() {
        Some(session) => {
            let name = session
                .identity
                .metadata
                .full_name
                .as_deref()
                .unwrap_or("no name");
            format!(
                "signed in as {} ({name}), expires in {}s",
                session.identity.email,
                session.expires_in(now())
            )
        }
        None => "signed out".to_string(),
    };
    let busy = if state.is_loading() { " [loading]" } else { "" };
    match state.error() {
        Some(error) => format!("[rev {}] {who}{busy} error: {error}", snapshot.revision),
        None => format!("[rev {}] {who}{busy}", snapshot.revision),
    }
}

fn report(result: &OperationResult) {
    match &result.error {
        None => println!("-> ok"),
        Some(error) => println!("-> failed: {error}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let provider = Arc::new(MemoryIdentityProvider::new());
    provider.seed_user(
        DEMO_EMAIL,
        DEMO_PASSWORD,
        Some(ProfileMetadata::with_full_name("Demo User")),
    );

    let coordinator = SessionCoordinator::new(Arc::clone(&provider), CoordinatorConfig::from_env());

    // Print every committed state
    let mut states = coordinator.view().stream();
    let printer = tokio::spawn(async move {
        while let Some(snapshot) = states.next().await {
            println!("{}", render(&snapshot));
        }
    });

    coordinator.initialize().await;
    tracing::info!(
        reject_stale_results = coordinator.config().reject_stale_results,
        "session demo ready"
    );
    println!("seeded {DEMO_EMAIL} / {DEMO_PASSWORD}; type `help` for commands");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await.context("failed to read stdin")? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match parse(&line) {
            Ok(command) => command,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        match command {
            Command::SignUp {
                email,
                password,
                full_name,
            } => {
                let metadata = full_name.map(ProfileMetadata::with_full_name);
                report(&coordinator.sign_up(&email, &password, metadata).await);
            }
            Command::SignIn { email, password } => {
                report(&coordinator.sign_in(&email, &password).await);
            }
            Command::SignOut => report(&coordinator.sign_out().await),
            Command::Refresh => report(&coordinator.refresh_session().await),
            Command::Clear => coordinator.clear_error(),
            Command::State => println!("{}", render(&coordinator.view().snapshot())),
            Command::Rotate => {
                if provider.refresh_tokens().is_none() {
                    println!("no active session to rotate");
                }
            }
            Command::Expire => provider.expire_session(),
            Command::Revoke => provider.revoke_session(),
            Command::Offline(offline) => provider.set_offline(offline),
            Command::RequireConfirmation(required) => provider.set_email_confirmation(required),
            Command::Confirm(email) => {
                if !provider.confirm_email(&email) {
                    println!("no such user: {email}");
                }
            }
            Command::Help => println!("{HELP}"),
            Command::Quit => break,
        }
    }

    coordinator.shutdown().await;
    printer.abort();
    tracing::info!("session demo stopped");
    Ok(())
}
