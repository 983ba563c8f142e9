//! palisade-gateway - authorization gateway daemon.
//!
//! Startup order matters: configuration and key material first, then the
//! ledger (which applies the schema), then the policy compile-and-upload
//! (best effort: an unreachable engine at boot leaves the gateway serving
//! fail-closed denials until a reload succeeds), then the HTTP listener.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use secrecy::ExposeSecret;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use palisade_core::config::GatewayConfig;
use palisade_core::identity::TokenMinter;
use palisade_core::ledger::AuditLedger;
use palisade_core::policy::{compile_source, HttpEngineTransport, PolicyEngineAdapter};
use palisade_core::seal::{SealEngine, SealKeypair};
use palisade_gateway::{routes, AppState};

/// palisade gateway - policy decision point for agent actions
#[derive(Parser, Debug)]
#[command(name = "palisade-gateway")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the gateway configuration file
    #[arg(short, long, default_value = "gateway.toml")]
    config: PathBuf,

    /// Listen address (overrides the config file)
    #[arg(long)]
    listen: Option<String>,

    /// Path to the audit ledger database (overrides the config file)
    #[arg(long)]
    database: Option<PathBuf>,

    /// Path to a declarative policy source to compile and upload at startup
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Runtime::new().context("failed to create Tokio runtime")?;
    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<()> {
    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration; a missing file means defaults.
    let mut config = if args.config.exists() {
        GatewayConfig::from_file(&args.config).context("failed to load configuration")?
    } else {
        info!(path = ?args.config, "no config file found, using defaults");
        GatewayConfig::default()
    };

    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    if let Some(database) = args.database {
        config.database.path = database;
    }
    if let Some(policy) = args.policy {
        config.policy.source_path = Some(policy);
    }

    // Signing key: provisioned out of band, or generated for development.
    let keypair = match &config.seal.signing_key {
        Some(encoded) => SealKeypair::from_base64(encoded.expose_secret())
            .context("invalid seal signing key")?,
        None => {
            warn!("no signing key configured; generated an ephemeral one (seals will not verify across restarts)");
            SealKeypair::generate()
        },
    };
    let seals = SealEngine::new(keypair, config.seal.ttl_minutes);
    info!(public_key = %seals.public_key_base64(), "seal engine initialized");

    // Token secret: same rule.
    let token_secret = match &config.auth.token_secret {
        Some(secret) => secret.clone(),
        None => {
            warn!("no token secret configured; generated an ephemeral one (tokens will not survive restarts)");
            TokenMinter::generate_secret()
        },
    };
    let tokens = TokenMinter::with_expiry(token_secret, config.auth.token_expiry_secs);

    // The ledger applies the schema, including the immutability triggers.
    let ledger =
        AuditLedger::open(&config.database.path).context("failed to open audit ledger")?;
    info!(path = ?config.database.path, "audit ledger open");

    let transport = HttpEngineTransport::new(
        &config.policy.engine_url,
        Duration::from_millis(config.policy.evaluate_deadline_ms),
    )
    .context("failed to build policy engine transport")?;
    let adapter = PolicyEngineAdapter::new(
        Box::new(transport),
        config.policy.entrypoint.clone(),
        config.policy.policy_name.clone(),
    );

    // Compile and upload the configured policy source, when present.
    if let Some(source_path) = &config.policy.source_path {
        let source = std::fs::read_to_string(source_path)
            .with_context(|| format!("failed to read policy source {}", source_path.display()))?;
        let compiled = compile_source(&source).context("policy compilation failed")?;

        match adapter.load(&compiled).await {
            Ok(()) => info!(version = %compiled.version, "policy compiled and uploaded"),
            Err(e) => warn!(
                error = %e,
                "policy upload failed; validations will fail closed until the engine is reachable"
            ),
        }
    } else {
        info!("no policy source configured; relying on policy already loaded in the engine");
    }

    let listen_addr = config.server.listen_addr.clone();
    let state = AppState::new(config, ledger, adapter, seals, tokens);
    let app = routes::router(state)
        .into_make_service_with_connect_info::<std::net::SocketAddr>();

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("failed to bind {listen_addr}"))?;
    info!(addr = %listen_addr, "gateway listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("gateway shutdown complete");
    Ok(())
}

/// Resolves when SIGTERM or SIGINT arrives.
async fn shutdown_signal() {
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to register SIGTERM");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to register SIGINT");

    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }
}
