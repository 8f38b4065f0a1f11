//! expose - Reverse TCP tunnel relay and agent
//!
//! Run a relay that leases public ports, or an agent that exposes a local
//! service through one.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use expose_api::{ApiServer, ApiServerConfig, TlsConfig};
use expose_client::{Agent, AgentConfig};
use expose_control::{Relay, RelayConfig};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::RelayFileConfig;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// expose - Make a local TCP port reachable through a public relay
#[derive(Parser, Debug)]
#[command(name = "expose")]
#[command(about = "expose - Make a local TCP port reachable through a public relay")]
#[command(version, long_version = LONG_VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the relay: HTTP front door, control channel and public listeners
    #[command(long_about = r#"
Run the relay. Agents connect to /tunnel over WebSocket and lease public
ports from the configured range. Only IPs registered through /allow-list
may connect to a leased port.

EXAMPLES:
  expose relay --jwt-secret $SECRET --public-url tcp://relay.example.com

  expose relay --config relay.yaml --tls-cert cert.pem --tls-key key.pem

ENVIRONMENT VARIABLES:
  EXPOSE_LISTEN       Front door address
  APP_URL             Public URL prefix for leased ports
  EXPOSE_JWT_SECRET   Handshake token key
  SSL_CERT_PATH       TLS certificate (PEM)
  SSL_KEY_PATH        TLS private key (PEM)
    "#)]
    Relay {
        /// YAML configuration file; flags override its values
        #[arg(long)]
        config: Option<PathBuf>,

        /// Address for the HTTP front door and control channel [default: 0.0.0.0:3000]
        #[arg(long, env = "EXPOSE_LISTEN")]
        listen: Option<SocketAddr>,

        /// Prefix for public URLs handed to agents [default: tcp://localhost]
        #[arg(long, env = "APP_URL")]
        public_url: Option<String>,

        /// Key used to verify handshake tokens
        #[arg(long, env = "EXPOSE_JWT_SECRET")]
        jwt_secret: Option<String>,

        /// Lowest public port to lease [default: 4456]
        #[arg(long)]
        port_min: Option<u16>,

        /// Highest public port to lease [default: 5456]
        #[arg(long)]
        port_max: Option<u16>,

        /// Address public listeners bind to [default: 0.0.0.0]
        #[arg(long)]
        bind_host: Option<IpAddr>,

        /// TLS certificate for the front door (PEM)
        #[arg(long, env = "SSL_CERT_PATH")]
        tls_cert: Option<PathBuf>,

        /// TLS private key for the front door (PEM)
        #[arg(long, env = "SSL_KEY_PATH")]
        tls_key: Option<PathBuf>,
    },

    /// Expose a local port through a relay
    #[command(long_about = r#"
Connect to a relay and expose a local TCP port. The agent registers the
given IPs on the lease's allow-list and reconnects if the relay goes away.

EXAMPLES:
  # Expose local PostgreSQL as alias "db"
  expose client 5432 --relay https://relay.example.com --token $TOKEN --alias db

  # Allow an extra client IP
  expose client 8080 --relay http://localhost:3000 --jwt-secret dev --allow-ip 10.0.0.7

ENVIRONMENT VARIABLES:
  BASE_URL            Relay front door URL
  EXPOSE_TOKEN        Handshake token
  EXPOSE_JWT_SECRET   Key for issuing a handshake token locally
    "#)]
    Client {
        /// Local port to expose
        #[arg(default_value = "4455")]
        port: u16,

        /// Relay front door URL (e.g., https://relay.example.com)
        #[arg(long, env = "BASE_URL")]
        relay: String,

        /// Handshake token
        #[arg(long, env = "EXPOSE_TOKEN")]
        token: Option<String>,

        /// Issue a handshake token locally with this key when no --token is given
        #[arg(long, env = "EXPOSE_JWT_SECRET")]
        jwt_secret: Option<String>,

        /// Lease secret to request (generated by the relay if omitted)
        #[arg(long)]
        secret: Option<String>,

        /// Alias to request (generated by the relay if omitted or taken)
        #[arg(long)]
        alias: Option<String>,

        /// Host of the local service
        #[arg(long, default_value = "localhost")]
        local_host: String,

        /// IP allowed to connect to the public port (repeatable)
        #[arg(long = "allow-ip", default_values_t = [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)])]
        allow_ips: Vec<IpAddr>,

        /// Maximum reconnection attempts (0 = infinite)
        #[arg(long, default_value = "0")]
        max_reconnect_attempts: usize,

        /// Initial reconnection delay in seconds
        #[arg(long, default_value = "1")]
        reconnect_delay: u64,

        /// Maximum reconnection delay in seconds
        #[arg(long, default_value = "60")]
        max_reconnect_delay: u64,
    },

    /// Issue a handshake token
    Token {
        /// Key shared with the relay
        #[arg(long, env = "EXPOSE_JWT_SECRET")]
        jwt_secret: String,

        /// Principal to embed as the subject
        #[arg(long, default_value = "1")]
        subject: String,

        /// Validity in hours
        #[arg(long, default_value = "24")]
        hours: i64,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

struct RelayArgs {
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    public_url: Option<String>,
    jwt_secret: Option<String>,
    port_min: Option<u16>,
    port_max: Option<u16>,
    bind_host: Option<IpAddr>,
    tls_cert: Option<PathBuf>,
    tls_key: Option<PathBuf>,
}

async fn run_relay(args: RelayArgs) -> Result<()> {
    let file = match &args.config {
        Some(path) => RelayFileConfig::load(path)?,
        None => RelayFileConfig::default(),
    };

    let jwt_secret = args
        .jwt_secret
        .or(file.jwt_secret)
        .context("A JWT secret is required (--jwt-secret or EXPOSE_JWT_SECRET)")?;

    let defaults = RelayConfig::default();
    let relay_config = RelayConfig {
        min_port: args.port_min.or(file.port_min).unwrap_or(defaults.min_port),
        max_port: args.port_max.or(file.port_max).unwrap_or(defaults.max_port),
        public_url: args
            .public_url
            .or(file.public_url)
            .unwrap_or(defaults.public_url),
        bind_host: args
            .bind_host
            .or(file.bind_host)
            .unwrap_or(defaults.bind_host),
    };

    if relay_config.min_port > relay_config.max_port {
        anyhow::bail!(
            "Invalid port range {}-{}",
            relay_config.min_port,
            relay_config.max_port
        );
    }

    let tls = match (args.tls_cert.or(file.tls_cert), args.tls_key.or(file.tls_key)) {
        (Some(cert_path), Some(key_path)) => Some(TlsConfig {
            cert_path,
            key_path,
        }),
        (None, None) => None,
        _ => anyhow::bail!("Both --tls-cert and --tls-key are required to enable TLS"),
    };

    let api_config = ApiServerConfig {
        bind_addr: args
            .listen
            .or(file.listen)
            .unwrap_or(ApiServerConfig::default().bind_addr),
        tls,
    };

    info!(
        "Leasing ports {}-{} on {}, public URL {}",
        relay_config.min_port,
        relay_config.max_port,
        relay_config.bind_host,
        relay_config.public_url
    );

    let relay = Arc::new(Relay::new(relay_config));
    let server = ApiServer::new(api_config, relay, jwt_secret.as_bytes());

    tokio::select! {
        result = server.start() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
            Ok(())
        }
    }
}

/// Connect to relay with automatic reconnection
async fn connect_with_reconnect(
    config: AgentConfig,
    max_attempts: usize,
    initial_delay: Duration,
    max_delay: Duration,
) -> Result<()> {
    let mut attempt = 0;
    let mut current_delay = initial_delay;

    loop {
        attempt += 1;

        if max_attempts > 0 && attempt > max_attempts {
            error!("Maximum reconnection attempts ({}) reached", max_attempts);
            anyhow::bail!("Failed to connect after {} attempts", max_attempts);
        }

        info!(
            "Connection attempt {} (max: {})",
            attempt,
            if max_attempts == 0 {
                "unlimited".to_string()
            } else {
                max_attempts.to_string()
            }
        );

        let agent = Agent::new(config.clone());

        match agent.run().await {
            Ok(()) => {
                info!("Agent stopped normally");
                return Ok(());
            }
            Err(e) if e.is_fatal() => {
                error!("Agent error: {}, not reconnecting", e);
                return Err(e.into());
            }
            Err(e) => {
                error!("Agent error: {}", e);

                // A channel that was up counts as progress
                if e.was_connected() {
                    attempt = 0;
                    current_delay = initial_delay;
                }

                if max_attempts > 0 && attempt >= max_attempts {
                    return Err(e.into());
                }

                warn!("Reconnecting in {} seconds...", current_delay.as_secs());
                tokio::time::sleep(current_delay).await;

                // Exponential backoff with max cap
                current_delay = std::cmp::min(current_delay * 2, max_delay);
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Relay {
            config,
            listen,
            public_url,
            jwt_secret,
            port_min,
            port_max,
            bind_host,
            tls_cert,
            tls_key,
        } => {
            run_relay(RelayArgs {
                config,
                listen,
                public_url,
                jwt_secret,
                port_min,
                port_max,
                bind_host,
                tls_cert,
                tls_key,
            })
            .await
        }
        Commands::Client {
            port,
            relay,
            token,
            jwt_secret,
            secret,
            alias,
            local_host,
            allow_ips,
            max_reconnect_attempts,
            reconnect_delay,
            max_reconnect_delay,
        } => {
            let auth_token = match (token, jwt_secret) {
                (Some(token), _) => token,
                (None, Some(jwt_secret)) => {
                    expose_auth::generate_token("1", jwt_secret.as_bytes(), 24)
                        .context("Failed to issue handshake token")?
                }
                (None, None) => anyhow::bail!(
                    "A handshake token is required (--token, EXPOSE_TOKEN or --jwt-secret)"
                ),
            };

            let config = AgentConfig {
                relay_url: relay.clone(),
                auth_token,
                local_host: local_host.clone(),
                local_port: port,
                secret,
                alias,
                allow_ips,
            };

            info!("Relay: {}", relay);
            info!("Local service: {}:{}", local_host, port);

            tokio::select! {
                result = connect_with_reconnect(
                    config,
                    max_reconnect_attempts,
                    Duration::from_secs(reconnect_delay),
                    Duration::from_secs(max_reconnect_delay),
                ) => result,
                _ = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl+C, shutting down...");
                    Ok(())
                }
            }
        }
        Commands::Token {
            jwt_secret,
            subject,
            hours,
        } => {
            let token = expose_auth::generate_token(&subject, jwt_secret.as_bytes(), hours)
                .context("Failed to issue token")?;
            println!("{}", token);
            Ok(())
        }
    }
}
