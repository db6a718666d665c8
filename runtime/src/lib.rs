//! Glue binary: wires the CA, the three LSM engines, the MCP checker, the
//! secrets manager, and the MITM proxy together behind one process,
//! reconciles the initial policy load, and runs until SIGINT/SIGTERM.

pub mod config;

use std::fs::OpenOptions;
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use leash_ca::CertificateAuthority;
use leash_lsm::KernelBackend;
use leash_lsm::LSMManager;
use leash_lsm::NullBackend;
use leash_logger::SharedLogger;
use leash_proxy::ProxyState;
use leash_secrets::SecretsManager;

pub use config::ConfigError;
pub use config::RuntimeConfig;

/// Default bind address for the proxy's accept loop. Traffic reaches this
/// port only via the enclosing network namespace's `REDIRECT` rule.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:15001";

/// Builds the kernel backend: `AyaBackend` on Linux when `LEASH_BPF_OBJECT`
/// names a loadable object file, `NullBackend` everywhere else. Boxed as a
/// trait object since the two concrete types differ by target.
pub fn build_backend() -> Arc<dyn KernelBackend> {
    #[cfg(target_os = "linux")]
    {
        if let Some(object_path) = std::env::var_os("LEASH_BPF_OBJECT") {
            match leash_lsm::AyaBackend::load(Path::new(&object_path)) {
                Ok(backend) => return Arc::new(backend),
                Err(error) => {
                    tracing::warn!(%error, "failed to load eBPF backend, falling back to NullBackend");
                }
            }
        }
    }
    let _ = Path::new(""); // keeps `Path` import used on non-Linux targets too
    Arc::new(NullBackend::new())
}

pub fn build_logger(config: &RuntimeConfig) -> anyhow::Result<SharedLogger> {
    match config.log_path() {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            Ok(SharedLogger::with_file(file))
        }
        None => Ok(SharedLogger::new()),
    }
}

/// Loads and applies the initial policy document, logging any non-fatal
/// lint warnings through `tracing`.
pub fn load_initial_policy(
    policy_source: &str,
    lsm: &LSMManager<Arc<dyn KernelBackend>>,
) -> anyhow::Result<()> {
    let output = leash_policy::load(policy_source).map_err(|error| anyhow::anyhow!(error))?;
    for issue in &output.issues {
        tracing::warn!(policy_id = %issue.policy_id, code = %issue.code, message = %issue.message, "policy lint warning");
    }
    lsm.update_runtime_rules(&output.policy_set)?;
    Ok(())
}

/// Runs the proxy accept loop until `shutdown` is cancelled.
pub async fn run_until_cancelled(
    listener: TcpListener,
    state: Arc<ProxyState<Arc<dyn KernelBackend>>>,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    tokio::select! {
        result = leash_proxy::run(listener, state) => Ok(result?),
        () = shutdown.cancelled() => {
            tracing::info!("shutdown signal received, stopping accept loop");
            Ok(())
        }
    }
}

/// Resolves once either `ctrl_c` or SIGTERM fires, then cancels `token`.
pub async fn install_shutdown_signal(token: CancellationToken) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(signal) => signal,
            Err(error) => {
                tracing::warn!(%error, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                token.cancel();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
    token.cancel();
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]
    use super::*;

    #[test]
    fn build_backend_defaults_to_null_backend_without_bpf_object() {
        unsafe {
            std::env::remove_var("LEASH_BPF_OBJECT");
        }
        // Construction must succeed even off-Linux / without a kernel.
        let _backend = build_backend();
    }

    #[tokio::test]
    async fn load_initial_policy_applies_rules_to_the_manager() {
        let manager = LSMManager::new(build_backend());
        let policy = r#"
permit(principal, action == Action::"FileOpen", resource == File::"/etc/hosts");
"#;
        load_initial_policy(policy, &manager).unwrap();
        assert_eq!(manager.open().evaluate("/etc/hosts"), leash_policy::ir::RuleEffect::Allow);
    }
}
