//! grid-sso - Manage SSO partner products and run the product monitor

use clap::{Parser, Subcommand};
use libpostgrid::config::Config;
use libpostgrid::error::{PostgridError, SsoError};
use libpostgrid::sso::models::{NewProduct, Product};
use libpostgrid::sso::{sign_request, SsoRequest};
use libpostgrid::{PostgridService, Result};
use serde::Serialize;
use std::io::Read;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "grid-sso")]
#[command(version)]
#[command(about = "Manage SSO partner products and run the product monitor")]
#[command(long_about = "\
grid-sso - Manage SSO partner products and run the product monitor

USAGE:
    # Register a product; the API key and signing secret are shown once
    grid-sso register --name \"Acme Analytics\" --slug acme \\
        --redirect-uri https://acme.example/sso/callback \\
        --health-url https://acme.example/health

    # List active products (or all of them)
    grid-sso list [--all]

    # Issue new credentials, or switch a product off
    grid-sso rotate acme
    grid-sso deactivate acme

    # Sign a sign-in request the way a product would
    grid-sso sign --secret <SECRET> --external-id u-1 --email ada@example.com

    # Sign a user in with a request read from stdin
    echo '{\"apiKey\": ..., \"signature\": ...}' | grid-sso login

    # Check a session token
    grid-sso verify <TOKEN>

    # Check product health and refresh analytics until SIGINT/SIGTERM
    grid-sso monitor

Products can be addressed by id or slug. Results are printed to stdout as
JSON. Logs go to stderr.

SIGNALS (monitor):
    SIGTERM, SIGINT - Graceful shutdown

EXIT CODES:
    0 - Success
    1 - Not found, duplicate, configuration or database error
    2 - Authentication error (bad signature, expired request or token)
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
    /// Register a new product
    Register {
        #[arg(long)]
        name: String,

        /// 3-64 lowercase letters, digits or dashes
        #[arg(long)]
        slug: String,

        /// Allowed redirect URI (repeatable)
        #[arg(long = "redirect-uri", value_name = "URI")]
        redirect_uris: Vec<String>,

        /// URL checked by the monitor
        #[arg(long, value_name = "URL")]
        health_url: Option<String>,
    },

    /// List products
    List {
        /// Include deactivated products
        #[arg(long)]
        all: bool,
    },

    /// Issue a new API key and signing secret
    Rotate {
        /// Product id or slug
        product: String,
    },

    /// Deactivate a product; its users can no longer sign in through it
    Deactivate {
        /// Product id or slug
        product: String,
    },

    /// Show recent audit entries for a product
    Audit {
        /// Product id or slug
        product: String,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Compute the signature for a sign-in request
    Sign {
        #[arg(long)]
        secret: String,

        #[arg(long)]
        external_id: String,

        #[arg(long)]
        email: String,

        /// Unix seconds (defaults to now)
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Sign a user in with a request as JSON
    Login {
        /// Request file (reads from stdin if not provided)
        #[arg(long, value_name = "FILE")]
        request: Option<PathBuf>,
    },

    /// Verify a session token and print its claims
    Verify { token: String },

    /// Check product health and refresh analytics periodically
    Monitor {
        /// Run one health check and one analytics refresh, then exit
        #[arg(long, hide = true)]
        once: bool,
    },
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

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| PostgridError::InvalidInput(format!("Failed to encode output: {}", e)))?;
    println!("{}", json);
    Ok(())
}

fn read_request(path: Option<&PathBuf>) -> Result<SsoRequest> {
    let content = match path {
        Some(path) => std::fs::read_to_string(path).map_err(|e| {
            PostgridError::InvalidInput(format!("Failed to read {}: {}", path.display(), e))
        })?,
        None => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .map_err(|e| PostgridError::InvalidInput(format!("Failed to read stdin: {}", e)))?;
            content
        }
    };
    serde_json::from_str(&content)
        .map_err(|e| PostgridError::InvalidInput(format!("Invalid request JSON: {}", e)))
}

/// Look a product up by id first, then by slug
async fn resolve_product(service: &PostgridService, key: &str) -> Result<Product> {
    let platform = &service.sso().platform;
    if let Some(product) = platform.find_by_id(key).await? {
        return Ok(product);
    }
    platform
        .find_by_slug(key)
        .await?
        .ok_or_else(|| SsoError::ProductNotFound(key.to_string()).into())
}

async fn run(cli: Cli) -> Result<()> {
    // Signing is pure and needs neither config nor database
    if let Command::Sign {
        secret,
        external_id,
        email,
        timestamp,
    } = &cli.command
    {
        let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());
        println!("{}", sign_request(secret, timestamp, external_id, email)?);
        return Ok(());
    }

    let config = match &cli.config {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    let service = PostgridService::from_config(config).await?;
    let sso = service.sso();

    match cli.command {
        Command::Register {
            name,
            slug,
            redirect_uris,
            health_url,
        } => {
            let credentials = sso
                .platform
                .register_product(NewProduct {
                    name,
                    slug,
                    redirect_uris,
                    health_url,
                })
                .await?;
            print_json(&credentials)
        }
        Command::List { all } => {
            let products = if all {
                sso.platform.list_all().await?
            } else {
                sso.platform.list_active().await?
            };
            print_json(&products)
        }
        Command::Rotate { product } => {
            let product = resolve_product(&service, &product).await?;
            print_json(&sso.platform.rotate_credentials(&product.id).await?)
        }
        Command::Deactivate { product } => {
            let product = resolve_product(&service, &product).await?;
            print_json(&sso.platform.deactivate(&product.id).await?)
        }
        Command::Audit { product, limit } => {
            let product = resolve_product(&service, &product).await?;
            print_json(&sso.platform.audit_log(&product.id, limit).await?)
        }
        Command::Login { request } => {
            let request = read_request(request.as_ref())?;
            print_json(&sso.unified.authenticate(request).await?)
        }
        Command::Verify { token } => print_json(&sso.seamless.verify_session(&token)?),
        Command::Monitor { once } => {
            let shutdown = Arc::new(AtomicBool::new(false));
            if once {
                let health = sso.monitor.check_health_once().await?;
                let analytics = sso.monitor.refresh_analytics_once().await?;
                info!(
                    "grid-sso: checked {} product(s), refreshed analytics for {}, exiting",
                    health.len(),
                    analytics.len()
                );
                return Ok(());
            }

            setup_signal_handlers(shutdown.clone())?;
            info!("grid-sso monitor starting");
            sso.monitor.run(shutdown).await?;
            info!("grid-sso monitor stopped");
            Ok(())
        }
        Command::Sign { .. } => Ok(()),
    }
}

/// Set up signal handlers for graceful shutdown
#[cfg(unix)]
fn setup_signal_handlers(shutdown: Arc<AtomicBool>) -> Result<()> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;
    use std::sync::atomic::Ordering;

    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|e| PostgridError::InvalidInput(format!("Signal setup failed: {}", e)))?;

    std::thread::spawn(move || {
        for sig in signals.forever() {
            match sig {
                SIGTERM | SIGINT => {
                    info!("Received shutdown signal, stopping gracefully...");
                    shutdown.store(true, Ordering::Relaxed);
                    break;
                }
                _ => {}
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
fn setup_signal_handlers(_shutdown: Arc<AtomicBool>) -> Result<()> {
    Ok(())
}
