//! Command-line front end.
//!
//! Every command builds a fresh controller against the configured backend,
//! starts it, optionally signs in with `--email`/`--password`, and prints the
//! resulting session state as JSON on stdout:
//! - `status` - Resolve the session and show it
//! - `sign-in` - Sign in with the given credentials
//! - `sign-up` - Register a new account
//! - `sign-out` - Sign in, then sign out again
//! - `update-profile` - Write profile fields for the signed-in user
//! - `watch` - Print every state change until interrupted

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::controller::SessionController;
use crate::identity::{AuthIdentity, BearerToken, HttpConnector, IdentityAdapter, Metadata};
use crate::profile::{
    ProfileError, ProfileLookup, ProfileRecord, ProfileStore, ProfileUpdate, RestProfileStore,
};
use crate::surface::{AuthContext, AuthState};

/// CLI arguments structure
#[derive(Parser, Debug)]
#[command(name = "agri-session")]
#[command(author, version, about = "Session and profile sync for the agricultural dashboard", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "agri-session.toml")]
    pub config: PathBuf,

    /// Override log level
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Account e-mail used to sign in before running the command
    #[arg(long, env = "AGRI_EMAIL", global = true)]
    pub email: Option<String>,

    /// Account password (can also be set via AGRI_PASSWORD env var)
    #[arg(long, env = "AGRI_PASSWORD", hide_env_values = true, global = true)]
    pub password: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Resolve the current session and print it
    Status,

    /// Sign in with --email/--password
    SignIn,

    /// Register a new account with --email/--password
    SignUp {
        /// Display name stored in the account metadata
        #[arg(long)]
        name: Option<String>,
    },

    /// Sign in, then sign out and show the cleared state
    SignOut,

    /// Update profile fields of the signed-in user
    UpdateProfile(ProfileArgs),

    /// Print every state change as a JSON line until Ctrl+C
    Watch,
}

/// Profile fields accepted by `update-profile`
#[derive(Args, Debug, Default)]
pub struct ProfileArgs {
    #[arg(long)]
    pub full_name: Option<String>,
    #[arg(long)]
    pub organization: Option<String>,
    #[arg(long)]
    pub location: Option<String>,
    #[arg(long)]
    pub language: Option<String>,
    #[arg(long)]
    pub preference: Option<String>,
    #[arg(long)]
    pub plantation_type: Option<String>,
    #[arg(long)]
    pub soil_type: Option<String>,
    #[arg(long)]
    pub focus: Option<String>,
    #[arg(long)]
    pub land_size: Option<f64>,
    #[arg(long)]
    pub experience_years: Option<u32>,
}

impl From<&ProfileArgs> for ProfileUpdate {
    fn from(args: &ProfileArgs) -> Self {
        ProfileUpdate {
            full_name: args.full_name.clone(),
            organization: args.organization.clone(),
            role: None,
            location: args.location.clone(),
            preferred_language: args.language.clone(),
            agricultural_preference: args.preference.clone(),
            default_plantation_type: args.plantation_type.clone(),
            default_soil_type: args.soil_type.clone(),
            default_focus: args.focus.clone(),
            land_size: args.land_size,
            experience_years: args.experience_years,
        }
    }
}

/// Stand-in store used when no backend is configured. The identity side is
/// unavailable in that case too, so it is never reached in practice.
struct UnconfiguredStore;

impl UnconfiguredStore {
    fn error() -> ProfileError {
        ProfileError::Store {
            code: "backend_unavailable".to_string(),
            message: "backend url or anon key not configured".to_string(),
        }
    }
}

#[async_trait]
impl ProfileStore for UnconfiguredStore {
    async fn fetch(&self, _user_id: &str) -> Result<ProfileLookup, ProfileError> {
        Err(Self::error())
    }

    async fn create_default(&self, _identity: &AuthIdentity) -> Result<ProfileRecord, ProfileError> {
        Err(Self::error())
    }

    async fn update(&self, _user_id: &str, _fields: &ProfileUpdate) -> Result<(), ProfileError> {
        Err(Self::error())
    }
}

/// Wire the HTTP identity client and row store into a controller.
pub fn build_controller(config: &Config) -> SessionController {
    let bearer = BearerToken::new();
    let identity = IdentityAdapter::new(HttpConnector::new(config.backend.clone(), bearer.clone()));
    let profiles: Arc<dyn ProfileStore> =
        match RestProfileStore::from_config(&config.backend, &config.profiles, bearer) {
            Some(store) => Arc::new(store),
            None => {
                tracing::warn!("Backend not configured, profile store disabled");
                Arc::new(UnconfiguredStore)
            }
        };
    SessionController::new(identity, profiles)
}

/// Run a CLI command
pub async fn run_command(cli: &Cli, config: Config) -> Result<()> {
    let controller = build_controller(&config);
    controller.start().await;
    let ctx = controller.context();
    // Profile resolution takes a read and possibly an insert
    let settle = config.backend.request_timeout() * 2;

    let result: Result<()> = async {
        match &cli.command {
            Commands::Status => {
                if cli.email.is_some() {
                    sign_in(&ctx, cli, settle).await?;
                }
                print_state(&ctx.state())
            }
            Commands::SignIn => {
                sign_in(&ctx, cli, settle).await?;
                print_state(&ctx.state())
            }
            Commands::SignUp { name } => cmd_sign_up(&ctx, cli, name.as_deref(), settle).await,
            Commands::SignOut => {
                sign_in(&ctx, cli, settle).await?;
                ctx.sign_out().await;
                print_state(&ctx.state())
            }
            Commands::UpdateProfile(args) => {
                sign_in(&ctx, cli, settle).await?;
                ctx.update_profile(ProfileUpdate::from(args))
                    .await
                    .context("Profile update failed")?;
                print_state(&ctx.state())
            }
            Commands::Watch => cmd_watch(&ctx, cli, settle).await,
        }
    }
    .await;

    controller.stop().await;
    result
}

fn credentials(cli: &Cli) -> Result<(&str, &str)> {
    match (cli.email.as_deref(), cli.password.as_deref()) {
        (Some(email), Some(password)) => Ok((email, password)),
        _ => anyhow::bail!("--email and --password (or AGRI_EMAIL/AGRI_PASSWORD) are required"),
    }
}

async fn sign_in(ctx: &AuthContext, cli: &Cli, settle: Duration) -> Result<()> {
    let (email, password) = credentials(cli)?;
    let (identity, _session) = ctx
        .sign_in(email, password)
        .await
        .context("Sign-in failed")?;
    wait_for_user(ctx, &identity.id, settle).await
}

async fn wait_for_user(ctx: &AuthContext, user_id: &str, settle: Duration) -> Result<()> {
    tokio::time::timeout(settle, ctx.wait_until(|s| s.user_id() == Some(user_id)))
        .await
        .context("Timed out waiting for the profile to load")?;
    Ok(())
}

async fn cmd_sign_up(ctx: &AuthContext, cli: &Cli, name: Option<&str>, settle: Duration) -> Result<()> {
    let (email, password) = credentials(cli)?;
    let metadata = name.map(|name| {
        let mut metadata = Metadata::new();
        metadata.insert("full_name".to_string(), name.into());
        metadata
    });

    let signed_up = ctx
        .sign_up(email, password, metadata)
        .await
        .context("Sign-up failed")?;

    if signed_up.session.is_some() {
        wait_for_user(ctx, &signed_up.identity.id, settle).await?;
    } else {
        eprintln!("Account created; confirm the e-mail address before signing in.");
    }
    print_state(&ctx.state())
}

async fn cmd_watch(ctx: &AuthContext, cli: &Cli, settle: Duration) -> Result<()> {
    let mut changes = ctx.watch();
    print_line(&ctx.state())?;

    if cli.email.is_some() {
        sign_in(ctx, cli, settle).await?;
    }

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to install Ctrl+C handler")?;
                break;
            }
            changed = changes.changed() => {
                if changed.is_err() {
                    break;
                }
                print_line(&ctx.state())?;
            }
        }
    }

    tracing::info!("Watch interrupted");
    Ok(())
}

fn print_state(state: &AuthState) -> Result<()> {
    let json = serde_json::to_string_pretty(state).context("Failed to serialize state")?;
    println!("{}", json);
    Ok(())
}

fn print_line(state: &AuthState) -> Result<()> {
    let json = serde_json::to_string(state).context("Failed to serialize state")?;
    println!("{}", json);
    Ok(())
}
