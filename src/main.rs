//! Rogue Mock Server - CLI Entry Point

use anyhow::Result;
use clap::Parser;
use rogue_mock_server::config::{AuthConfig, TlsConfig, DEFAULT_TLS_PORT};
use rogue_mock_server::{api, tls, ApiState, MemoryStore, ServerConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser, Debug)]
#[command(
    name = "rogue",
    about = "Mock HTTP endpoint host - ordered handlers, canned responses and match logs",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "rogue.yaml")]
    config: PathBuf,

    /// Address to bind
    #[arg(long, env = "ROGUE_HTTP_BIND")]
    bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, env = "ROGUE_HTTP_PORT")]
    port: Option<u16>,

    /// Port for the HTTPS listener
    #[arg(long, env = "ROGUE_HTTPS_PORT")]
    https_port: Option<u16>,

    /// PEM certificate chain; enables HTTPS together with --https-key
    #[arg(long, env = "ROGUE_HTTPS_CERT", requires = "https_key")]
    https_cert: Option<PathBuf>,

    /// PEM private key for the HTTPS listener
    #[arg(long, env = "ROGUE_HTTPS_KEY", requires = "https_cert")]
    https_key: Option<PathBuf>,

    /// Username for the administration API
    #[arg(long, env = "ROGUE_USERNAME", requires = "password")]
    username: Option<String>,

    /// Password for the administration API
    #[arg(long, env = "ROGUE_PASSWORD", requires = "username", hide_env_values = true)]
    password: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print default configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

impl Args {
    /// Apply command line and environment overrides.
    fn apply(&self, config: &mut ServerConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(port) = self.port.or_else(platform_port) {
            config.listener.port = port;
        }
        if let (Some(cert_path), Some(key_path)) = (&self.https_cert, &self.https_key) {
            config.tls = Some(TlsConfig {
                port: config.tls.as_ref().map_or(DEFAULT_TLS_PORT, |tls| tls.port),
                cert_path: cert_path.clone(),
                key_path: key_path.clone(),
            });
        }
        if let (Some(port), Some(tls)) = (self.https_port, config.tls.as_mut()) {
            tls.port = port;
        }
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            config.auth = Some(AuthConfig {
                username: username.clone(),
                password: password.clone(),
            });
        }
    }
}

/// The conventional `PORT` variable set by hosting platforms.
fn platform_port() -> Option<u16> {
    std::env::var("PORT").ok().and_then(|p| p.parse().ok())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        print!("{}", serde_yaml::to_string(&ServerConfig::default())?);
        return Ok(());
    }

    // Load configuration
    let mut config = if args.config.exists() {
        info!(path = ?args.config, "Loading configuration");
        ServerConfig::from_file(&args.config)?
    } else if args.validate {
        anyhow::bail!("Configuration file not found: {:?}", args.config);
    } else {
        info!("Using default configuration (no apps)");
        ServerConfig::default()
    };
    args.apply(&mut config);
    config.validate()?;

    if args.validate {
        println!(
            "Configuration is valid ({} apps defined)",
            config.apps.len()
        );
        return Ok(());
    }

    if config.auth.is_none() {
        info!("No credentials configured, administration API is open");
    }

    let address = config.listener.address();
    let https = match &config.tls {
        Some(tls_config) => Some((
            tls_config.address(&config.listener),
            tls::load_tls_config(&tls_config.cert_path, &tls_config.key_path).await?,
        )),
        None => None,
    };

    let state = ApiState::new(config, Arc::new(MemoryStore::new()));
    state.register_configured_apps().await?;

    let listener = TcpListener::bind(&address).await?;
    match https {
        Some((https_address, rustls_config)) => {
            tokio::try_join!(
                api::serve(listener, state.clone()),
                tls::serve_tls(&https_address, rustls_config, state),
            )?;
        }
        None => api::serve(listener, state).await?,
    }

    info!("Shutdown complete");
    Ok(())
}
