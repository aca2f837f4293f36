use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};

use vote_service::api::router;
use vote_service::config::ServiceConfig;
use vote_service::coordinator::VoteCoordinator;
use vote_service::database::Database;
use vote_service::ledger::{JsonRpcClient, SubmissionClient};
use vote_service::logging::init_logging;
use vote_service::repair::RepairJob;
use vote_service::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServiceConfig::from_env()?;
    init_logging(config.log_format, &config.log_level)?;

    info!("Starting Vote Submission Coordinator");

    // Initialize database (create tables, run migrations)
    let db = Database::connect(&config.db_path).await?;

    let rpc = JsonRpcClient::new(&config.ledger.rpc_url, config.ledger.rpc_timeout)?;
    let client = Arc::new(SubmissionClient::new(Arc::new(rpc), &config.ledger));
    info!(
        "Ledger client ready: rpc={} contract={} relayer={}",
        config.ledger.rpc_url,
        config.ledger.contract_address,
        config.ledger.relayer_address
    );

    let coordinator = VoteCoordinator::new(db.pool().clone(), client.clone(), config.commit_timeout);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let repair = RepairJob::new(
        db.pool().clone(),
        client,
        coordinator.writer().clone(),
        config.repair.clone(),
    );
    let repair_handle = tokio::spawn(repair.run(shutdown_rx));

    let app = router(AppState::new(db, coordinator));

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!("Server listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped, waiting for the repair job");
    let _ = shutdown_tx.send(true);
    if let Err(e) = repair_handle.await {
        error!("Repair job ended abnormally: {}", e);
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("Received terminate signal, shutting down");
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
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
