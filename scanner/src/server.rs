use std::{env, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

use common::BindError;

use crate::handlers::{self, AppState};
use crate::logroute::{LogRecord, LogRouter};
use crate::registry::JobRegistry;

const DEFAULT_STEP_MS: u64 = 200;

/// Duración de un paso del engine simulado.
/// Se puede sobreescribir con la env var SCANNER_STEP_MS.
fn step_delay() -> Duration {
    let ms = env::var("SCANNER_STEP_MS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_STEP_MS);
    Duration::from_millis(ms)
}

/// Raíz donde van el log global y los directorios por job.
/// Default: el directorio de trabajo.
fn log_root() -> String {
    env::var("SCANNER_LOG_ROOT").unwrap_or_else(|_| ".".to_string())
}

/// Rol worker: enlaza el puerto en loopback, arma el router y sirve
/// hasta que llegue un stop. Un fallo de bind es fatal: se loggea,
/// se flushea el router y el proceso termina con error.
pub async fn run(port: u16) -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter("scanner=debug,axum=info,tower_http=info")
        .init();

    let logs = Arc::new(LogRouter::new(log_root())?);
    logs.route(LogRecord::info(format!("iniciando scanner en el puerto {port}")));

    let registry = JobRegistry::new();
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    let state = AppState {
        registry,
        logs: logs.clone(),
        shutdown: Arc::new(shutdown_tx),
        step_delay: step_delay(),
    };
    let app = handlers::build_router(state);

    // Solo loopback: el worker no debe ser alcanzable desde otros hosts
    let listener = match TcpListener::bind(("127.0.0.1", port)).await {
        Ok(l) => l,
        Err(source) => {
            let err = BindError { port, source };
            error!("{err}");
            logs.route(LogRecord::error(err.to_string()));
            logs.flush();
            return Err(err.into());
        }
    };

    info!("scanner escuchando en {}", listener.local_addr()?);
    logs.route(LogRecord::info(format!("scanner listo en el puerto {port}")));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        })
        .await?;

    logs.route(LogRecord::info("scanner detenido"));
    logs.flush();
    Ok(())
}
