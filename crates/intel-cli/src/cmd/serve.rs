use anyhow::{anyhow, Context};
use intel_core::config::WarnLevel;
use intel_core::orchestrator::Orchestrator;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

pub fn run(root: &Path, port: Option<u16>) -> anyhow::Result<()> {
    let (config, store) = super::open_store(root)?;

    let mut errors = Vec::new();
    for w in config.validate() {
        match w.level {
            WarnLevel::Error => errors.push(w.message),
            WarnLevel::Warning => warn!("config: {}", w.message),
        }
    }
    if !errors.is_empty() {
        return Err(anyhow!(
            "invalid {}:\n  {}",
            intel_core::paths::CONFIG_FILE,
            errors.join("\n  ")
        ));
    }

    let executors = config
        .executors
        .build_executor_set()
        .context("failed to build module executors")?;
    let orchestrator = Orchestrator::new(
        Arc::new(store),
        executors,
        config.orchestrator.to_orchestrator_config(),
    );
    let port = port.unwrap_or(config.server.port);

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async move {
        let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{port}")).await?;
        let actual_port = listener.local_addr()?.port();
        println!("intel control server → http://localhost:{actual_port}  (PID {})", std::process::id());

        tokio::select! {
            res = intel_server::serve_on(orchestrator, listener) => res,
            _ = tokio::signal::ctrl_c() => Ok(()),
        }
    })
}
