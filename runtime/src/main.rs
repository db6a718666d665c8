//! Entry point for the `leash-runtime` binary: reads a Cedar-subset policy
//! file, attaches (or stubs out) the kernel enforcement engines, and serves
//! the MITM proxy until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use leash_ca::CertificateAuthority;
use leash_lsm::LSMManager;
use leash_proxy::ProxyState;
use leash_runtime::DEFAULT_LISTEN_ADDR;
use leash_runtime::RuntimeConfig;
use leash_runtime::build_backend;
use leash_runtime::build_logger;
use leash_runtime::install_shutdown_signal;
use leash_runtime::load_initial_policy;
use leash_runtime::run_until_cancelled;

#[derive(Debug, Parser)]
#[command(name = "leash-runtime", about = "Per-cgroup policy enforcement sandbox for untrusted agent workloads")]
struct Cli {
    /// Path to the Cedar-subset policy document to load at startup.
    #[arg(long)]
    policy_path: PathBuf,

    /// Address the MITM proxy listens on for redirected connections.
    #[arg(long, default_value = DEFAULT_LISTEN_ADDR)]
    listen_addr: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = RuntimeConfig::from_env()?;

    let ca = Arc::new(CertificateAuthority::load_or_create(&config.leash_private_dir, &config.leash_dir)?);
    let logger = build_logger(&config)?;
    let secrets = Arc::new(leash_secrets::SecretsManager::new());

    let backend = build_backend();
    let lsm = Arc::new(LSMManager::new(backend));

    let policy_source = std::fs::read_to_string(&cli.policy_path)?;
    load_initial_policy(&policy_source, &lsm)?;

    let proxy_state = Arc::new(ProxyState::new(ca, lsm, secrets, logger));
    let listener = TcpListener::bind(&cli.listen_addr).await?;
    tracing::info!(addr = %cli.listen_addr, "leash-runtime listening");

    let shutdown = CancellationToken::new();
    let signal_task = tokio::spawn(install_shutdown_signal(shutdown.clone()));

    run_until_cancelled(listener, proxy_state, shutdown).await?;
    signal_task.abort();
    Ok(())
}
