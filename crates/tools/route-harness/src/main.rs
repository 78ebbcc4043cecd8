//! CLI harness for the dialer stack
//!
//! Exercises the layers against live hosts:
//! - Pinned dials with optional proxy failover
//! - DoH candidate lookups
//! - Certificate fingerprinting
//! - Route discovery

use bridge_net::{
    pin_for_certificate, BasicDialer, CancelToken, DialerConfig, DialerStack, DnsProvider,
    DohClient, DohLookup, Route, TlsDialer,
};
use clap::{Parser, Subcommand};
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "route-harness")]
#[command(about = "Pinned dialer and route discovery harness", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Dial the API through the full stack and ping it
    Dial {
        /// API host URL
        #[arg(short = 'u', long, default_value = bridge_net::config::DEFAULT_HOST_URL)]
        host_url: String,

        /// Fail over to discovered routes
        #[arg(short, long)]
        allow_proxy: bool,

        /// Extra trusted pins (`pin-sha256="..."`)
        #[arg(short, long)]
        pin: Vec<String>,
    },

    /// Query every DoH resolver for route hints
    Lookup {
        /// TXT record name
        #[arg(short, long, default_value = bridge_net::config::DEFAULT_PROXY_QUERY)]
        query: String,

        /// Custom resolver URL, replacing the built-in ones
        #[arg(short, long)]
        resolver: Option<String>,

        /// Per-resolver timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Print the pin of the certificate served at an address
    Fingerprint {
        /// `host:port` or URL
        address: String,

        /// Connect timeout in seconds
        #[arg(short, long, default_value = "10")]
        timeout: u64,
    },

    /// Run one route search and print the outcome
    FindRoute {
        /// API host URL
        #[arg(short = 'u', long, default_value = bridge_net::config::DEFAULT_HOST_URL)]
        host_url: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Dial {
            host_url,
            allow_proxy,
            pin,
        } => {
            run_dial(host_url, allow_proxy, pin).await?;
        }
        Commands::Lookup {
            query,
            resolver,
            timeout,
        } => {
            run_lookup(query, resolver, timeout).await?;
        }
        Commands::Fingerprint { address, timeout } => {
            run_fingerprint(address, timeout).await?;
        }
        Commands::FindRoute { host_url } => {
            run_find_route(host_url).await?;
        }
    }

    Ok(())
}

async fn run_dial(host_url: String, allow_proxy: bool, pins: Vec<String>) -> anyhow::Result<()> {
    info!("Dialing {}", host_url);

    let stack = DialerStack::new(DialerConfig::new(host_url.clone()))?;
    for pin in pins {
        stack.trusted_pins().add(pin)?;
    }

    let dialer = stack.proxy_dialer();
    if allow_proxy {
        dialer.allow_proxy();
    }

    let mut issues = stack.subscribe_tls_issues();
    let started = Instant::now();
    let result = stack
        .http_transport()
        .get(
            &CancelToken::new(),
            &format!(
                "{}{}",
                host_url.trim_end_matches('/'),
                stack.config().ping_path
            ),
        )
        .await;

    while let Ok(issue) = issues.try_recv() {
        warn!("Pin mismatch at {}:{}", issue.host, issue.port);
    }

    let response = result?;
    println!("\n=== Dial Complete ===");
    println!("Status: {}", response.status);
    println!("Route: {}", dialer.current_address());
    println!("Proxied: {}", dialer.is_proxied());
    if let Some(revert_at) = dialer.revert_at() {
        println!(
            "Reverts in: {:.0}s",
            revert_at.saturating_duration_since(Instant::now()).as_secs_f64()
        );
    }
    println!("Time: {:.2}s", started.elapsed().as_secs_f64());

    stack.reporter().flush().await;
    Ok(())
}

async fn run_lookup(query: String, resolver: Option<String>, timeout: u64) -> anyhow::Result<()> {
    let client = DohClient::new(Duration::from_secs(timeout))?;
    let providers = match resolver {
        Some(url) => vec![DnsProvider::Custom(url)],
        None => DnsProvider::defaults(),
    };

    for provider in providers {
        let started = Instant::now();
        match client.lookup_txt(&query, &provider).await {
            Ok(records) => {
                println!("\n{} ({:.2}s)", provider, started.elapsed().as_secs_f64());
                for record in records {
                    println!("  {}", record);
                }
            }
            Err(e) => warn!("{} failed: {}", provider, e),
        }
    }

    Ok(())
}

async fn run_fingerprint(address: String, timeout: u64) -> anyhow::Result<()> {
    let address = bridge_net::format_as_address(&address);
    // Empty canonical address: nothing is validated, any certificate is shown.
    let dialer = BasicDialer::new(String::new(), Duration::from_secs(timeout))?;

    let conn = dialer
        .dial_tls(&CancelToken::new(), "tcp", &address)
        .await?;
    let state = conn.connection_state().clone();
    println!("\n=== {} ({}) ===", address, conn.peer_addr()?);

    for (depth, cert) in state.peer_certificates.iter().enumerate() {
        println!("[{}] {}", depth, pin_for_certificate(cert)?);
    }

    conn.close().await?;
    Ok(())
}

async fn run_find_route(host_url: String) -> anyhow::Result<()> {
    let stack = DialerStack::new(DialerConfig::new(host_url))?;
    let provider = stack.proxy_dialer().provider().clone();

    let started = Instant::now();
    let route = provider.find_reachable_route().await;
    let elapsed = started.elapsed();

    let cache = provider.cache();
    println!("\n=== Route Search ===");
    println!("Candidates: {:?}", cache.candidates);
    match route {
        Ok(Route::Primary) => println!("Route: primary"),
        Ok(Route::Candidate(candidate)) => println!("Route: {}", candidate),
        Err(e) => println!("No route: {}", e),
    }
    println!("Time: {:.2}s", elapsed.as_secs_f64());

    stack.reporter().flush().await;
    Ok(())
}
