//! Entrypoint for the in-container I/O manager.
//!
//! ## Environment variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `ICM_TASK_ID` | `tk-dev` | Task identifier for this container |
//! | `ICM_FUNCTION_ID` | `fn-dev` | Function identifier this container serves |
//! | `ICM_APP_ID` | `ap-dev` | Owning app identifier |
//! | `ICM_METHOD_NAME` | `main` | Entrypoint method name |
//! | `ICM_FUNCTION_SHAPE` | `sync` | `sync`, `async`, `generator`, `async_generator`, `web`, `batched` |
//! | `ICM_MAX_CONCURRENCY` | `1` | Upper bound on concurrent inputs |
//! | `ICM_TARGET_CONCURRENCY` | = max concurrency | Starting concurrency slot count |
//! | `ICM_INPUT_PLANE_URL` | `http://localhost:8000` | Control-plane base URL |
//! | `ICM_RPC_TIMEOUT_MS` | `30000` | Per-attempt RPC timeout |
//! | `ICM_RESTORE_STATE_PATH` | `/__icm/restore-state.json` | Restore handshake file |
//! | `ICM_METRICS_PORT` | `9090` | Metrics/health port |
//! | `LOG_FORMAT` | text | `json` for structured logs |
//! | `RUST_LOG` | `info` | Standard log level filter |

use anyhow::Result;
use icm_common::codec::JsonCodec;
use icm_rpc::{HttpBlobStore, HttpRpcClient};
use icm_runtime::function::{Callable, FinalizedFunction, StaticFunctionLoader};
use icm_runtime::ContainerManager;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::info;

fn env_or_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    icm_common::logging::init_logging("icm-container");

    info!("starting in-container I/O manager");

    let config = icm_common::config::load_from_env();
    let input_plane_url = config
        .input_plane_endpoint
        .clone()
        .unwrap_or_else(|| env_or("ICM_INPUT_PLANE_URL", "http://localhost:8000"));
    let rpc_timeout = Duration::from_millis(env_or_parse("ICM_RPC_TIMEOUT_MS", 30_000));
    let metrics_port: u16 = env_or_parse("ICM_METRICS_PORT", 9090);

    let rpc = Arc::new(HttpRpcClient::new(input_plane_url.clone(), rpc_timeout));
    let blobs = Arc::new(HttpBlobStore::new(input_plane_url));
    let loader = Arc::new(demo_function_loader());
    let codec = Arc::new(JsonCodec);

    let manager = ContainerManager::new(config, rpc, blobs, loader, codec);
    ContainerManager::install(manager.clone());
    manager.start();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install prometheus recorder");

    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], metrics_port));
    info!("metrics server listening on http://{}/metrics", metrics_addr);

    let metrics_app = axum::Router::new()
        .route("/metrics", axum::routing::get(move || render_metrics(prometheus.clone())))
        .route("/healthz", axum::routing::get(healthz))
        .route("/readyz", axum::routing::get(readyz));

    let metrics_listener = tokio::net::TcpListener::bind(metrics_addr).await?;
    let metrics_handle = {
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            axum::serve(metrics_listener, metrics_app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.recv().await;
                })
                .await
                .ok();
        })
    };

    info!("container ready, press Ctrl+C to shut down");
    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight inputs");

    let _ = shutdown_tx.send(());
    let _ = tokio::time::timeout(Duration::from_secs(30), async {
        manager.shutdown().await;
        let _ = metrics_handle.await;
    })
    .await;

    info!("in-container I/O manager shutdown complete");
    Ok(())
}

async fn render_metrics(handle: metrics_exporter_prometheus::PrometheusHandle) -> String {
    handle.render()
}

async fn healthz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "UP" }))
}

async fn readyz() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "READY" }))
}

/// Stand-in user function registry. Real module loading happens upstream of
/// this crate; this just gives the pipeline something to execute.
fn demo_function_loader() -> StaticFunctionLoader {
    StaticFunctionLoader::new().register(FinalizedFunction {
        method_name: "main".into(),
        shape: icm_common::FunctionShape::Sync,
        param_names: vec!["x".into()],
        callable: Callable::Sync(Arc::new(|v| Ok(v))),
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
