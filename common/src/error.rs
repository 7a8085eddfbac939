use thiserror::Error;

use crate::job::{JobId, JobState};

/// Errores del registry de jobs (lado worker).
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("job {0} no encontrado")]
    NotFound(JobId),

    /// Violación de la máquina de estados. Indica un bug del colaborador
    /// que pidió la transición: se loggea y se devuelve, nunca se absorbe.
    #[error("transición inválida: {from:?} -> {to:?}")]
    InvalidTransition { from: JobState, to: JobState },
}

/// Errores del supervisor (lado orquestador).
#[derive(Debug, Error)]
pub enum SupervisorError {
    /// El worker no respondió al probe de liveness dentro del límite
    /// de reintentos con backoff.
    #[error("worker inalcanzable en el puerto {port} tras {attempts} intentos")]
    WorkerUnreachable { port: u16, attempts: u32 },

    /// El canal con el worker se rompió a mitad de sesión. Reconectar es
    /// una acción explícita del operador, no un retry implícito.
    #[error("se perdió la conexión con el worker: {0}")]
    WorkerDisconnected(String),

    #[error("no se pudo lanzar el proceso del worker: {0}")]
    Spawn(#[from] std::io::Error),

    /// El worker respondió algo que no es parte del protocolo
    /// (status de error, JSON que no parsea, stream cortado sin terminal).
    #[error("respuesta inesperada del worker: {0}")]
    Protocol(String),
}

/// El puerto pedido no se pudo enlazar: fatal para el arranque del worker.
#[derive(Debug, Error)]
#[error("no se pudo enlazar 127.0.0.1:{port}: {source}")]
pub struct BindError {
    pub port: u16,
    #[source]
    pub source: std::io::Error,
}
