//! grid-auth - Connect social accounts and refresh their tokens

use clap::{Parser, Subcommand};
use libpostgrid::config::Config;
use libpostgrid::error::PostgridError;
use libpostgrid::types::AuthenticateParams;
use libpostgrid::{ProviderRegistry, Result};
use serde::Serialize;
use std::path::PathBuf;
use tracing::debug;

#[derive(Parser, Debug)]
#[command(name = "grid-auth")]
#[command(version)]
#[command(about = "Connect social accounts and refresh their tokens")]
#[command(long_about = "\
grid-auth - Connect social accounts and refresh their tokens

USAGE:
    # List configured providers
    grid-auth providers

    # Start an OAuth flow; open the returned url in a browser
    grid-auth url x

    # Finish the flow with the code from the redirect
    grid-auth connect x --code <CODE> --code-verifier <VERIFIER>

    # Exchange a refresh token for a new access token
    grid-auth refresh linkedin --refresh-token <TOKEN>

All results are printed to stdout as JSON. Logs go to stderr.

EXIT CODES:
    0 - Success
    1 - Provider or configuration error
    2 - Authentication error (rejected code or token, missing scopes)
    3 - Invalid input
")]
struct Cli {
    /// Configuration file
    #[arg(long, env = "POSTGRID_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List enabled providers and their capabilities
    Providers,

    /// Generate the authorization URL for a provider
    Url {
        /// Provider identifier (e.g. x, linkedin, mastodon)
        provider: String,
    },

    /// Exchange an authorization code or credential payload for tokens
    Connect {
        provider: String,

        /// Code from the OAuth redirect, or the credential payload
        #[arg(long)]
        code: String,

        /// PKCE verifier returned by `grid-auth url`
        #[arg(long, default_value = "")]
        code_verifier: String,
    },

    /// Refresh an access token
    Refresh {
        provider: String,

        #[arg(long)]
        refresh_token: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProviderSummary<'a> {
    identifier: &'a str,
    name: &'a str,
    scopes: &'a [&'static str],
    max_concurrent_job: usize,
    supports_refresh: bool,
    is_between_steps: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    libpostgrid::logging::init_default(cli.verbose);

    if let Err(e) = run(cli).await {
        eprintln!("Error: {}", e);
        std::process::exit(e.exit_code());
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_path(path),
        None => Config::load(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PostgridError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = load_config(cli.config.as_ref())?;
    let registry = ProviderRegistry::from_config(&config)?;
    debug!("Loaded {} provider(s)", registry.len());

    match cli.command {
        Command::Providers => {
            let providers: Vec<_> = registry
                .identifiers()
                .into_iter()
                .filter_map(|id| registry.get(&id))
                .collect();
            let summaries: Vec<_> = providers
                .iter()
                .map(|p| ProviderSummary {
                    identifier: p.identifier(),
                    name: p.name(),
                    scopes: p.scopes(),
                    max_concurrent_job: p.max_concurrent_job(),
                    supports_refresh: p.supports_refresh(),
                    is_between_steps: p.is_between_steps(),
                })
                .collect();
            print_json(&summaries)
        }
        Command::Url { provider } => {
            let provider = registry.require(&provider)?;
            print_json(&provider.generate_auth_url()?)
        }
        Command::Connect {
            provider,
            code,
            code_verifier,
        } => {
            if code.trim().is_empty() {
                return Err(PostgridError::InvalidInput("--code must not be empty".to_string()));
            }
            let provider = registry.require(&provider)?;
            let params = AuthenticateParams::code(code).with_verifier(code_verifier);
            print_json(&provider.authenticate(&params).await?)
        }
        Command::Refresh {
            provider,
            refresh_token,
        } => {
            let provider = registry.require(&provider)?;
            print_json(&provider.refresh_token(&refresh_token).await?)
        }
    }
}
