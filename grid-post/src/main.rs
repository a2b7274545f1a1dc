//! grid-post - Publish a chain of posts through a connected integration

use clap::Parser;
use libpostgrid::config::Config;
use libpostgrid::error::PostgridError;
use libpostgrid::service::publishing::PublishJob;
use libpostgrid::types::{Integration, PostDetails};
use libpostgrid::{PostgridService, Result};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "grid-post")]
#[command(version)]
#[command(about = "Publish a chain of posts through a connected integration")]
#[command(long_about = "\
grid-post - Publish a chain of posts through a connected integration

USAGE:
    # Publish a thread read from a file
    grid-post --integration mastodon.json --posts thread.json

    # Read the posts from stdin
    cat thread.json | grid-post --integration mastodon.json

    # Rewrite links through the configured shortener first
    grid-post --integration x.json --posts thread.json --shorten

The integration file holds a connected account (provider, tokens, ids).
The posts file holds a JSON array of posts; each later post is published
as a reply, comment or thread item of the one before it.

The outcome is printed to stdout as JSON. When the provider refreshed the
token, the new token is included as `refreshedToken`.

EXIT CODES:
    0 - Success
    1 - Provider, configuration or database error
    2 - Authentication error (the account must be reconnected)
    3 - Invalid input
")]
struct Cli {
    /// Connected account as JSON
    #[arg(long, value_name = "FILE")]
    integration: PathBuf,

    /// JSON array of posts (reads from stdin if not provided)
    #[arg(long, value_name = "FILE")]
    posts: Option<PathBuf>,

    /// Shorten links before publishing
    #[arg(long)]
    shorten: bool,

    /// Configuration file
    #[arg(long, env = "POSTGRID_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging to stderr
    #[arg(short, long)]
    verbose: bool,
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

fn read_json<T: serde::de::DeserializeOwned>(what: &str, content: &str) -> Result<T> {
    serde_json::from_str(content)
        .map_err(|e| PostgridError::InvalidInput(format!("Invalid {} JSON: {}", what, e)))
}

fn read_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).map_err(|e| {
        PostgridError::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
    })
}

fn read_stdin() -> Result<String> {
    let mut content = String::new();
    std::io::stdin()
        .read_to_string(&mut content)
        .map_err(|e| PostgridError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
    Ok(content)
}

async fn run(cli: Cli) -> Result<()> {
    let integration: Integration = read_json("integration", &read_file(&cli.integration)?)?;
    let posts_json = match &cli.posts {
        Some(path) => read_file(path)?,
        None => read_stdin()?,
    };
    let posts: Vec<PostDetails> = read_json("posts", &posts_json)?;

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let service = PostgridService::from_config(config).await?;

    let mut job = PublishJob::new(integration, posts);
    if cli.shorten {
        job = job.with_short_links();
    }
    info!(
        job_id = %job.job_id,
        provider = %job.integration.provider_identifier,
        items = job.posts.len(),
        "Publishing"
    );

    let outcome = service.publishing().publish(job).await?;
    let json = serde_json::to_string_pretty(&outcome)
        .map_err(|e| PostgridError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);

    Ok(())
}
