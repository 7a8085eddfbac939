use serde::{Deserialize, Serialize};

use crate::job::{JobId, JobState};

/* --------- Payloads HTTP entre orquestador y worker --------- */

/// Ack de una operación de control sobre un job (cancel / pause / resume).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpAck {
    pub ok: bool,
    pub job_id: JobId,
    pub state: JobState,
}

/// Ack genérico sin job asociado (ej: stop del worker).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    pub ok: bool,
}

/// Filtro opcional de `GET /api/v1/scans`. El estado viaja como texto
/// ("RUNNING", "COMPLETED", ...) y se parsea con `JobState::from_str`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ListScansParams {
    pub state: Option<String>,
}
