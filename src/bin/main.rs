use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use unicity_gateway_auth::{AuthServices, GatewayAuthConfig, serve};

/// Tokens closer than this to expiry are flagged in `tokens list`.
const EXPIRY_WARNING: Duration = Duration::from_secs(300);

#[derive(Parser)]
#[command(name = "unicity-gateway-auth")]
#[command(about = "Authentication and credential lifecycle core for the tool gateway")]
struct Cli {
    /// Config file (default: $GATEWAY_AUTH_CONFIG, XDG config dir, ./gateway-auth.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Keep credentials in memory only
    #[arg(long, global = true, env = "GATEWAY_AUTH_STATELESS")]
    stateless: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the HTTP auth service
    Serve {
        /// Bind address, e.g. 0.0.0.0:3943
        #[arg(long, default_value = "127.0.0.1:3943", env = "GATEWAY_AUTH_BIND")]
        bind: String,
        /// Local single-user deployment: allow identity hints and the single-session default
        #[arg(long, default_value_t = false)]
        single_user: bool,
    },
    /// Check whether endpoints require authentication
    Probe {
        #[arg(required = true)]
        urls: Vec<String>,
        /// Per-URL timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Inspect or manage stored OAuth tokens
    Tokens {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Subcommand)]
enum TokenCommands {
    /// List identities with stored tokens
    List,
    /// Remove the stored tokens for one identity
    Clear { identity: String },
    /// Remove expired tokens that cannot be refreshed
    Cleanup,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("unicity_gateway_auth=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    let mut config = GatewayAuthConfig::load(cli.config.as_deref())?;
    if cli.stateless {
        config.credentials.stateless = true;
    }
    let services = AuthServices::from_config(config).await?;

    match cli.command {
        Commands::Serve { bind, single_user } => {
            info!("Credential store: {}", services.credentials.kind());
            serve(services, &bind, single_user).await?;
        }
        Commands::Probe { urls, timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| services.config.probe.timeout());

            for (url, requires_auth) in services.probe.probe_many(&urls, timeout).await {
                let verdict = if requires_auth { "auth required" } else { "open" };
                println!("{:<15} {}", verdict, url);
            }
        }
        Commands::Tokens { command } => match command {
            TokenCommands::List => {
                let identities = services.credentials.list_identities().await?;
                if identities.is_empty() {
                    println!("No stored tokens found.");
                    return Ok(());
                }

                println!(
                    "{:<40} {:<15} {:<30} {:<10}",
                    "IDENTITY", "STATUS", "EXPIRES", "REFRESH"
                );
                println!("{}", "-".repeat(95));

                for identity in identities {
                    let Some(token) = services.credentials.get_tokens(identity.as_str()).await?
                    else {
                        continue;
                    };
                    let status = if !token.is_valid() {
                        "Expired"
                    } else if token.expires_within(EXPIRY_WARNING) {
                        "Expiring soon"
                    } else {
                        "Valid"
                    };
                    let expires = token
                        .expires_at
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_else(|| "Never".to_string());
                    let refresh = if token.refresh_token.is_some() { "yes" } else { "no" };

                    println!(
                        "{:<40} {:<15} {:<30} {:<10}",
                        identity, status, expires, refresh
                    );
                }
            }
            TokenCommands::Clear { identity } => {
                if services.credentials.clear_tokens(&identity).await? {
                    println!("Cleared stored tokens for {}", identity);
                } else {
                    println!("No stored tokens for {}", identity);
                }
            }
            TokenCommands::Cleanup => {
                let removed = services.credentials.cleanup_expired().await?;
                println!("Removed {} expired token(s)", removed);
            }
        },
    }

    Ok(())
}
