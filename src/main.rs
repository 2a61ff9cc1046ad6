use clap::Parser; // for cli
use std::net::SocketAddr;
use std::sync::Arc;

use finance_gateway::build_router;
use finance_gateway::clock::SystemClock;
use finance_gateway::config::Args;
use finance_gateway::logging::init_logging;
use finance_gateway::rate_limit::PolicyRegistry;
use finance_gateway::state::AppState;

// this is main async function with tokio
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // parse cli arguments
    let args = Args::parse();
    init_logging(&args.log_level, args.log_json);

    let registry = PolicyRegistry::from_table(
        &args.policy_table(),
        args.policy_routes()?,
        Arc::new(SystemClock),
    )?;

    for controller in registry.controllers() {
        let policy = controller.policy();
        tracing::info!(
            policy = %policy.name,
            window_secs = policy.window.as_secs(),
            max_requests = policy.max_requests,
            skip_successful = policy.skip_successful,
            skip_failed = policy.skip_failed,
            "Policy registered"
        );
    }

    // creating shared state
    let mut state = AppState::new(args.upstream_url(), registry);
    state.trust_proxy = args.trust_proxy;
    state.max_body_bytes = args.max_body_bytes;
    let state = Arc::new(state);

    // one sweep task per policy, stopped on shutdown
    let eviction = state.registry.spawn_eviction(args.sweep_every());

    let app = build_router(state.clone());

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!(addr = %addr, upstream = %state.upstream, "Gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    for task in eviction {
        task.shutdown().await;
    }
    tracing::info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
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
    tracing::info!("Shutdown signal received");
}
