use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::watch;
use tracing::warn;

use common::{JobId, JobState, ScanRequest, ScanSummary};

use crate::logroute::{LogRecord, LogRouter};
use crate::registry::{ControlSignal, JobRegistry};

/// Engine de scan simulado: recorre la lista de targets, un paso por
/// target, reportando progreso al registry y logs taggeados al router.
/// Observa la señal de control entre pasos (la cancelación y la pausa
/// son cooperativas). Un fallo de este job nunca sale de esta tarea:
/// el resto de jobs del worker sigue como si nada.
///
/// Un target llamado literalmente "fail" hace que el engine reporte un
/// fallo irrecuperable, para poder ejercitar el camino Failed de punta
/// a punta sin un backend de scan real.
pub async fn run_scan(
    registry: JobRegistry,
    logs: Arc<LogRouter>,
    id: JobId,
    request: ScanRequest,
    mut control: watch::Receiver<ControlSignal>,
    step_delay: Duration,
) {
    if *control.borrow() == ControlSignal::Cancel {
        logs.route(LogRecord::info("scan cancelado antes de empezar").with_job(&id));
        return;
    }

    if let Err(e) = registry.update_state(&id, JobState::Running, None) {
        // Carrera legítima: lo cancelaron entre el borrow de arriba y acá
        warn!("job {}: no se pudo pasar a Running: {}", id, e);
        return;
    }

    logs.route(
        LogRecord::info(format!(
            "scan '{}' iniciado ({} targets)",
            request.name,
            request.targets.len()
        ))
        .with_job(&id),
    );

    let start = Instant::now();
    let total = request.targets.len() as u32;
    let mut scanned: u32 = 0;

    for target in &request.targets {
        // Señal de control entre pasos: pausa espera, cancel corta.
        // El registry ya dejó el estado en Cancelled; acá solo paramos.
        loop {
            let sig = *control.borrow_and_update();
            match sig {
                ControlSignal::Cancel => {
                    logs.route(
                        LogRecord::info(format!("scan cancelado tras {scanned}/{total} targets"))
                            .with_job(&id),
                    );
                    return;
                }
                ControlSignal::Pause => {
                    logs.route(LogRecord::info("scan pausado, esperando").with_job(&id));
                    if control.changed().await.is_err() {
                        return;
                    }
                }
                ControlSignal::Run => break,
            }
        }

        if target == "fail" {
            logs.route(
                LogRecord::error(format!("fallo irrecuperable enumerando '{target}'"))
                    .with_job(&id),
            );
            if let Err(e) = registry.update_state(&id, JobState::Failed, None) {
                warn!("job {}: {}", id, e);
            }
            return;
        }

        // Enumeración simulada del target
        tokio::time::sleep(step_delay).await;
        scanned += 1;

        logs.route(
            LogRecord::info(format!("target '{target}' enumerado ({scanned}/{total})"))
                .with_job(&id),
        );

        if let Err(e) = registry.record_progress(&id, scanned) {
            warn!("job {}: {}", id, e);
            return;
        }
    }

    let summary = ScanSummary {
        targets_scanned: scanned,
        duration_ms: start.elapsed().as_millis() as u64,
    };

    match registry.update_state(&id, JobState::Completed, Some(summary)) {
        Ok(_) => {
            logs.route(
                LogRecord::info(format!("scan completado: {scanned}/{total} targets"))
                    .with_job(&id),
            );
        }
        Err(e) => {
            // Cancelado en la última ventana: el estado terminal manda
            warn!("job {}: no se pudo completar: {}", id, e);
        }
    }
}
