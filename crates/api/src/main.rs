use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, anyhow};
use tokio::sync::Notify;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use ingest_api::app::{build_app, services::build_services};
use ingest_api::config::AppConfig;
use ingest_infra::workers::{Supervisor, WorkerError, WorkerHandle};

#[tokio::main]
async fn main() -> ExitCode {
    ingest_observability::init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %format!("{err:#}"), "ingest-api stopped");
            ExitCode::FAILURE
        }
    }
}

type WorkerExit = (String, Result<(), WorkerError>);

async fn run() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    let bind_addr = config.bind_addr;
    let supervisor = Supervisor::new(config.restart_policy());

    let services = Arc::new(build_services(config).await?);

    let handles = services.spawn_workers(&supervisor);
    let stop_signals: Vec<Arc<Notify>> = handles.iter().map(WorkerHandle::shutdown_signal).collect();
    let mut workers: JoinSet<WorkerExit> = JoinSet::new();
    for handle in handles {
        let name = handle.name().to_string();
        workers.spawn(async move { (name, handle.join().await) });
    }

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "listening");

    let server_stop = Arc::new(Notify::new());
    let server = {
        let app = build_app(services.clone());
        let server_stop = server_stop.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { server_stop.notified().await })
                .await
        })
    };

    // Serve until ctrl-c or until a worker's restart budget is spent.
    let outcome = loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for ctrl-c")?;
                info!("shutdown requested");
                break Ok(());
            }
            joined = workers.join_next() => match joined {
                Some(joined) => {
                    if let Err(err) = worker_exit(joined) {
                        break Err(err);
                    }
                }
                None => break Err(anyhow!("all workers stopped")),
            },
        }
    };

    server_stop.notify_one();
    for signal in &stop_signals {
        signal.notify_one();
    }
    while let Some(joined) = workers.join_next().await {
        if let Err(err) = worker_exit(joined) {
            warn!(error = %format!("{err:#}"), "worker failed during shutdown");
        }
    }
    server
        .await
        .context("server task panicked")?
        .context("server error")?;

    info!("stopped");
    outcome
}

fn worker_exit(joined: Result<WorkerExit, JoinError>) -> anyhow::Result<()> {
    match joined {
        Ok((name, Ok(()))) => {
            info!(worker = %name, "worker stopped");
            Ok(())
        }
        Ok((name, Err(err))) => Err(anyhow::Error::new(err).context(format!("worker {name} failed"))),
        Err(err) => Err(anyhow!("worker task panicked: {err}")),
    }
}
