use std::sync::Arc;

use terrakeep_agent::{SupervisorConfig, TerrariaServer, launch, logging};
use terrakeep_process::ServerState;
use tokio::io::{AsyncBufReadExt, BufReader};

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "ctrl-c handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Forwards operator input to the server console.
async fn operator_console(server: Arc<TerrariaServer>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if !line.is_empty() {
                    let _ = server.enqueue(line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "operator input failed");
                break;
            }
        }
    }
    tracing::debug!("operator input closed");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = logging::init();

    let params = launch::validate_params(&launch::params_from_env())?;
    let config = SupervisorConfig::from_env().with_args(params.to_args());
    tracing::info!(
        program = %config.program,
        port = params.port,
        world = %params.world,
        "terrakeep-agent starting"
    );

    let server = Arc::new(TerrariaServer::new(config));
    server.start().await?;

    tokio::spawn(operator_console(server.clone()));

    let mut states = server.subscribe_state();
    let failed = tokio::select! {
        _ = shutdown_signal() => false,
        _ = states.wait_for(|s| *s == ServerState::Failed) => true,
    };

    if failed {
        anyhow::bail!("server {} exited unexpectedly", server.id());
    }

    tracing::info!("shutdown requested");
    server.stop().await?;
    Ok(())
}
