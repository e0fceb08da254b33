use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use kube_leader_election::{LeaseLock, LeaseLockParams};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use pg_cluster_operator::health::{HealthState, run_health_server};
use pg_cluster_operator::{
    Context, OperatorConfig, run_cluster_controller_scoped, run_dbops_controller_scoped,
};

/// Lease configuration
const LEASE_NAME: &str = "pg-cluster-operator-leader";
const LEASE_TTL_SECS: u64 = 15;
const LEASE_RENEW_INTERVAL_SECS: u64 = 5;

/// Grace period for in-flight reconciliations to complete during shutdown
const SHUTDOWN_GRACE_PERIOD_SECS: u64 = 5;

const DEFAULT_LOG_FILTER: &str = "info,kube=warn,pg_cluster_operator=debug";

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_current_span(true)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn lease_lock(client: Client, config: &OperatorConfig) -> LeaseLock {
    LeaseLock::new(
        client,
        &config.pod_namespace,
        LeaseLockParams {
            holder_id: config.pod_name.clone(),
            lease_name: LEASE_NAME.to_string(),
            lease_ttl: Duration::from_secs(LEASE_TTL_SECS),
        },
    )
}

/// Block until this replica holds the lease
async fn acquire_leadership(lock: &LeaseLock) {
    info!("Waiting to acquire leadership...");
    loop {
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {
                info!("Acquired leadership");
                return;
            }
            Ok(_) => info!("Another instance is leader, waiting..."),
            Err(e) => warn!("Failed to acquire lease: {}, retrying...", e),
        }
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
    }
}

/// Renew the lease until it is lost
///
/// Returning ends the operator so Kubernetes restarts it into a new election.
async fn renew_leadership(lock: LeaseLock) {
    loop {
        tokio::time::sleep(Duration::from_secs(LEASE_RENEW_INTERVAL_SECS)).await;
        match lock.try_acquire_or_renew().await {
            Ok(result) if result.acquired_lease => {}
            Ok(_) => {
                error!("Lost leadership! Shutting down...");
                return;
            }
            Err(e) => {
                error!("Failed to renew lease: {}. Shutting down...", e);
                return;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Install the TLS crypto provider before any TLS operations
    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
        && rustls::crypto::CryptoProvider::get_default().is_none()
    {
        return Err(
            "Failed to install rustls crypto provider and no provider is available".into(),
        );
    }

    init_tracing();
    info!("Starting pg-cluster-operator");

    let config = OperatorConfig::from_env();
    info!(?config, "Loaded configuration");

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let health_state = Arc::new(HealthState::new());

    // Probes must answer even while this replica is not the leader
    let health_handle = {
        let health_state = health_state.clone();
        let port = config.health_port;
        tokio::spawn(async move {
            if let Err(e) = run_health_server(health_state, port).await {
                error!("Health server error: {}", e);
            }
        })
    };

    let lease_renewal_handle = if config.leader_election {
        info!(
            holder_id = %config.pod_name,
            namespace = %config.pod_namespace,
            lease_name = LEASE_NAME,
            "Initializing leader election"
        );
        acquire_leadership(&lease_lock(client.clone(), &config)).await;
        Some(tokio::spawn(renew_leadership(lease_lock(
            client.clone(),
            &config,
        ))))
    } else {
        warn!("Leader election disabled, running as the only instance");
        None
    };

    let ctx = Arc::new(
        Context::new(client.clone(), config.clone(), Some(health_state.clone()))?,
    );
    health_state.set_ready(true).await;

    let cluster_controller_handle = {
        let client = client.clone();
        let ctx = ctx.clone();
        let namespace = config.watch_namespace.clone();
        tokio::spawn(async move {
            run_cluster_controller_scoped(client, ctx, namespace.as_deref()).await;
        })
    };

    let dbops_controller_handle = {
        let namespace = config.watch_namespace.clone();
        tokio::spawn(async move {
            run_dbops_controller_scoped(client, ctx, namespace.as_deref()).await;
        })
    };

    let lease_future = async {
        match lease_renewal_handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("Lease renewal task panicked: {}", e);
                }
            }
            None => std::future::pending::<()>().await,
        }
    };

    let mut exit_code = 0;
    tokio::select! {
        result = cluster_controller_handle => {
            if let Err(e) = result {
                error!("Cluster controller task panicked: {}", e);
            }
            exit_code = 1;
        }
        result = dbops_controller_handle => {
            if let Err(e) = result {
                error!("Operation controller task panicked: {}", e);
            }
            exit_code = 1;
        }
        result = health_handle => {
            if let Err(e) = result {
                error!("Health server task panicked: {}", e);
            }
            exit_code = 1;
        }
        _ = lease_future => {
            health_state.set_ready(false).await;
            exit_code = 1;
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, initiating graceful shutdown...");

            // Stop receiving new work
            health_state.set_ready(false).await;
            info!("Marked operator as not ready");

            info!(
                "Waiting {}s for in-flight reconciliations to complete...",
                SHUTDOWN_GRACE_PERIOD_SECS
            );
            tokio::time::sleep(Duration::from_secs(SHUTDOWN_GRACE_PERIOD_SECS)).await;

            info!("Grace period complete, shutting down");
        }
    }

    info!("Operator stopped");
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
