use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::RegistryError;

pub type JobId = String;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRequest {
    pub name: String,

    /// Sitios / tenants a enumerar, ej: ["siteA", "siteB"]
    pub targets: Vec<String>,

    /// Paralelismo deseado (el engine puede tratarlo como sugerencia)
    pub parallelism: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Un estado terminal nunca vuelve a uno no terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed | JobState::Cancelled)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(JobState::Pending),
            "RUNNING" => Ok(JobState::Running),
            "PAUSED" => Ok(JobState::Paused),
            "COMPLETED" => Ok(JobState::Completed),
            "FAILED" => Ok(JobState::Failed),
            "CANCELLED" => Ok(JobState::Cancelled),
            other => Err(format!("estado desconocido: {other}")),
        }
    }
}

/// Valida una transición contra la máquina de estados del job:
///
/// Pending -> Running | Cancelled
/// Running -> Paused | Completed | Failed | Cancelled
/// Paused  -> Running | Cancelled
///
/// Completed / Failed / Cancelled son terminales: no tienen salida.
pub fn validate_transition(from: JobState, to: JobState) -> Result<(), RegistryError> {
    use JobState::*;

    let valid = matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Paused)
            | (Running, Completed)
            | (Running, Failed)
            | (Running, Cancelled)
            | (Paused, Running)
            | (Paused, Cancelled)
    );

    if valid {
        Ok(())
    } else {
        Err(RegistryError::InvalidTransition { from, to })
    }
}

/// Resumen que reporta el engine al completar un scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub targets_scanned: u32,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub state: JobState,

    /// Parámetros con los que se pidió el scan
    pub request: ScanRequest,

    pub started_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,

    /// -------- Progreso --------
    pub targets_total: u32,
    pub targets_scanned: u32,

    /// Solo presente cuando el engine terminó bien
    pub result_summary: Option<ScanSummary>,
}

impl JobRecord {
    pub fn new(id: JobId, request: ScanRequest) -> Self {
        let now = Utc::now();
        let targets_total = request.targets.len() as u32;

        Self {
            id,
            state: JobState::Pending,
            request,
            started_at: now,
            last_updated_at: now,
            targets_total,
            targets_scanned: 0,
            result_summary: None,
        }
    }
}
