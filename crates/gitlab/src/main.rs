use std::io::{self, Read};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use gitlab_core::auth::{AuthError, AuthManager, CredentialKind, FileConfigStore, SystemBrowser};
use gitlab_core::config::{default_hostname, normalize_hostname};
use serde_json::json;
use tracing::debug;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use url::Url;

const LOG_ENV: &str = "GLAB_LOG";

#[derive(Parser, Debug)]
#[command(author, version, about = "GitLab terminal CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Authentication related commands
    #[command(subcommand)]
    Auth(AuthCommand),
}

#[derive(Subcommand, Debug)]
enum AuthCommand {
    /// Log in to a GitLab instance with the browser or a personal access token
    Login(LoginArgs),
    /// Forget stored credentials for a host
    Logout(HostArgs),
    /// Show the stored credential for a host, refreshing it if expired
    Status(StatusArgs),
    /// Print the access token for a host, refreshing it if expired
    Token(HostArgs),
}

#[derive(Args, Debug)]
struct HostArgs {
    /// GitLab hostname (defaults to $GITLAB_HOST or gitlab.com)
    #[arg(long)]
    hostname: Option<String>,
}

#[derive(Args, Debug)]
struct LoginArgs {
    #[command(flatten)]
    host: HostArgs,
    /// Store a personal access token instead of using OAuth
    #[arg(long, conflicts_with = "stdin")]
    token: Option<String>,
    /// Read a personal access token from standard input
    #[arg(long)]
    stdin: bool,
}

#[derive(Args, Debug)]
struct StatusArgs {
    #[command(flatten)]
    host: HostArgs,
    /// Output raw JSON
    #[arg(long)]
    json: bool,
}

impl HostArgs {
    fn resolve(&self) -> String {
        self.hostname
            .as_deref()
            .map(normalize_hostname)
            .unwrap_or_else(default_hostname)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.command {
        Commands::Auth(cmd) => match cmd {
            AuthCommand::Login(args) => auth_login(args).await?,
            AuthCommand::Logout(args) => auth_logout(args).await?,
            AuthCommand::Status(args) => auth_status(args).await?,
            AuthCommand::Token(args) => auth_token(args).await?,
        },
    }
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

fn auth_manager() -> Result<AuthManager<FileConfigStore>> {
    let store = FileConfigStore::with_default_locator()
        .context("unable to open the hosts configuration")?;
    debug!(path = %store.path().display(), "using hosts file");
    AuthManager::new(store).context("failed to build HTTP client")
}

async fn auth_login(args: LoginArgs) -> Result<()> {
    let host = args.host.resolve();
    let manager = auth_manager()?;

    let personal_token = match (args.token, args.stdin) {
        (Some(token), _) => Some(token),
        (None, true) => Some(read_token_from_stdin()?),
        (None, false) => None,
    };
    if let Some(token) = personal_token {
        let token = token.trim();
        if token.is_empty() {
            bail!("personal access token must not be empty");
        }
        manager
            .store_personal_token(&host, token)
            .await
            .context("failed to store personal access token")?;
        println!("Personal access token stored for {host}.");
        return Ok(());
    }

    let cancel = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let token = match manager
        .login(&host, &SystemBrowser, print_authorization_url, cancel)
        .await
    {
        Ok(token) => token,
        Err(AuthError::MissingClientId { host }) => bail!(
            "no OAuth application is configured for {host}; set `client_id` for this host in the \
             hosts file or log in with --token"
        ),
        Err(AuthError::Timeout(waited)) => bail!(
            "timed out after {}s waiting for the browser to redirect back",
            waited.as_secs()
        ),
        Err(AuthError::Cancelled) => bail!("login cancelled"),
        Err(err) => return Err(err).context("login failed"),
    };

    println!("Logged in to {host}. Credentials stored.");
    println!("Token expires at {} (UTC).", token.expiry_date);
    Ok(())
}

async fn auth_logout(args: HostArgs) -> Result<()> {
    let host = args.resolve();
    let manager = auth_manager()?;
    let removed = manager
        .logout(&host)
        .await
        .context("failed to remove stored credentials")?;
    if removed {
        println!("Deleted credentials for {host}.");
    } else {
        println!("No credentials stored for {host}.");
    }
    Ok(())
}

async fn auth_status(args: StatusArgs) -> Result<()> {
    let host = args.host.resolve();
    let manager = auth_manager()?;
    let status = manager.status(&host).await.map_err(refresh_hint)?;

    if args.json {
        let value = match &status {
            Some(status) => json!({
                "host": status.host,
                "kind": kind_label(status.kind),
                "expiry_date": status.expiry_date.map(|expiry| expiry.to_rfc3339()),
            }),
            None => json!({ "host": host, "kind": null }),
        };
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let Some(status) = status else {
        println!("Not logged in to {host}. Run `glab auth login --hostname {host}`.");
        return Ok(());
    };
    println!("Host      : {}", status.host);
    println!("Credential: {}", kind_label(status.kind));
    if let Some(expiry) = status.expiry_date {
        let remaining = expiry - Utc::now();
        println!(
            "Expires   : {} (UTC, in {} min)",
            expiry,
            remaining.num_minutes().max(0)
        );
    }
    Ok(())
}

async fn auth_token(args: HostArgs) -> Result<()> {
    let host = args.resolve();
    let manager = auth_manager()?;
    match manager.access_token(&host).await.map_err(refresh_hint)? {
        Some(token) => println!("{token}"),
        None => bail!("not logged in to {host}"),
    }
    Ok(())
}

fn kind_label(kind: CredentialKind) -> &'static str {
    match kind {
        CredentialKind::OAuth2 => "oauth2",
        CredentialKind::PersonalToken => "personal access token",
    }
}

fn refresh_hint(err: AuthError) -> anyhow::Error {
    let refresh_failed = matches!(
        err,
        AuthError::TokenEndpoint { .. } | AuthError::InvalidTokenResponse(_) | AuthError::Http(_)
    );
    let err = anyhow::Error::new(err);
    if refresh_failed {
        err.context("could not refresh the stored token; run `glab auth login` again")
    } else {
        err
    }
}

fn read_token_from_stdin() -> Result<String> {
    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("failed to read token from stdin")?;
    Ok(input)
}

fn print_authorization_url(url: &Url) -> Result<(), AuthError> {
    eprintln!("\nAuthorize glab by visiting:\n  {url}\n");
    Ok(())
}
