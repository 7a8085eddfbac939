use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use common::{Ack, JobRecord, JobState, ListScansParams, OpAck, RegistryError, ScanRequest};

use crate::engine;
use crate::logroute::{LogRecord, LogRouter};
use crate::registry::JobRegistry;

#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistry,
    pub logs: Arc<LogRouter>,
    /// Canal de apagado del worker (lo dispara /api/v1/admin/stop)
    pub shutdown: Arc<watch::Sender<bool>>,
    /// Duración de un paso del engine simulado
    pub step_delay: Duration,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/scans", post(create_scan).get(list_scans))
        .route("/api/v1/scans/:id", get(get_scan))
        .route("/api/v1/scans/:id/cancel", post(cancel_scan))
        .route("/api/v1/scans/:id/pause", post(pause_scan))
        .route("/api/v1/scans/:id/resume", post(resume_scan))
        .route("/api/v1/scans/:id/progress", get(stream_progress))
        .route("/api/v1/admin/stop", post(stop_worker))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn registry_error(e: RegistryError) -> (StatusCode, String) {
    match e {
        RegistryError::NotFound(_) => (StatusCode::NOT_FOUND, e.to_string()),
        RegistryError::InvalidTransition { .. } => (StatusCode::CONFLICT, e.to_string()),
    }
}

/* ---------------- handlers HTTP ---------------- */

// Probe de liveness del supervisor
async fn health() -> &'static str {
    "ok"
}

// Registra el job y lanza el engine en su propia tarea. Devuelve en
// cuanto el job queda registrado, no cuando termina.
async fn create_scan(
    State(state): State<AppState>,
    Json(req): Json<ScanRequest>,
) -> Result<Json<JobRecord>, (StatusCode, String)> {
    if req.targets.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "el scan necesita al menos un target".to_string(),
        ));
    }

    let (record, control) = state.registry.create(req);

    state.logs.route(
        LogRecord::info(format!("scan '{}' solicitado", record.request.name))
            .with_job(&record.id),
    );

    tokio::spawn(engine::run_scan(
        state.registry.clone(),
        state.logs.clone(),
        record.id.clone(),
        record.request.clone(),
        control,
        state.step_delay,
    ));

    Ok(Json(record))
}

async fn get_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>, (StatusCode, String)> {
    state
        .registry
        .get(&id)
        .map(Json)
        .map_err(registry_error)
}

async fn list_scans(
    State(state): State<AppState>,
    Query(params): Query<ListScansParams>,
) -> Result<Json<Vec<JobRecord>>, (StatusCode, String)> {
    let filter = match params.state {
        Some(s) => Some(
            s.parse::<JobState>()
                .map_err(|e| (StatusCode::BAD_REQUEST, e))?,
        ),
        None => None,
    };

    Ok(Json(state.registry.list(filter)))
}

async fn cancel_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OpAck>, (StatusCode, String)> {
    let record = state.registry.cancel(&id).map_err(registry_error)?;
    state
        .logs
        .route(LogRecord::info("cancelación pedida por el orquestador").with_job(&id));

    Ok(Json(OpAck {
        ok: true,
        job_id: record.id,
        state: record.state,
    }))
}

async fn pause_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OpAck>, (StatusCode, String)> {
    let record = state.registry.pause(&id).map_err(registry_error)?;
    state
        .logs
        .route(LogRecord::info("pausa pedida por el orquestador").with_job(&id));

    Ok(Json(OpAck {
        ok: true,
        job_id: record.id,
        state: record.state,
    }))
}

async fn resume_scan(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OpAck>, (StatusCode, String)> {
    let record = state.registry.resume(&id).map_err(registry_error)?;
    state
        .logs
        .route(LogRecord::info("reanudación pedida por el orquestador").with_job(&id));

    Ok(Json(OpAck {
        ok: true,
        job_id: record.id,
        state: record.state,
    }))
}

// Stream SSE de snapshots del job. Arranca con el snapshot actual (un
// orquestador que se re-engancha no pierde continuidad) y termina tras
// el snapshot terminal.
async fn stream_progress(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let rx = state.registry.subscribe(&id).map_err(registry_error)?;

    let updates = stream::unfold((rx, true, false), |(mut rx, first, done)| async move {
        if done {
            return None;
        }
        if !first && rx.changed().await.is_err() {
            return None;
        }

        let record = rx.borrow_and_update().clone();
        let stop = record.state.is_terminal();
        let event = Event::default().json_data(&record).ok()?;

        Some((Ok::<_, Infallible>(event), (rx, false, stop)))
    });

    Ok(Sse::new(updates).keep_alive(KeepAlive::default()))
}

// Apagado ordenado del worker (el verbo `stop` del orquestador)
async fn stop_worker(State(state): State<AppState>) -> Json<Ack> {
    state.logs.route(LogRecord::info("stop pedido por el orquestador"));
    let _ = state.shutdown.send(true);
    Json(Ack { ok: true })
}
