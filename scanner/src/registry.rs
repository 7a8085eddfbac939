use chrono::Utc;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use tokio::sync::watch;
use tracing::{info, warn};

use common::{
    validate_transition, JobId, JobRecord, JobState, RegistryError, ScanRequest, ScanSummary,
};

/// Señal cooperativa que el engine observa entre pasos del scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlSignal {
    Run,
    Pause,
    Cancel,
}

/// Una entrada por job. El record vive detrás de su propio mutex para que
/// las mutaciones de jobs distintos no se serialicen entre sí; el mutex
/// exterior solo se toma para buscar la entrada.
struct JobEntry {
    record: Arc<Mutex<JobRecord>>,
    progress_tx: Arc<watch::Sender<JobRecord>>,
    control_tx: Arc<watch::Sender<ControlSignal>>,
}

/// Fuente de verdad de los jobs activos y terminados del worker.
/// Único escritor del estado de los jobs: todo el resto del proceso
/// lee o pide mutaciones a través de estas operaciones.
#[derive(Clone)]
pub struct JobRegistry {
    jobs: Arc<Mutex<HashMap<JobId, JobEntry>>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn entry(
        &self,
        id: &str,
    ) -> Result<
        (
            Arc<Mutex<JobRecord>>,
            Arc<watch::Sender<JobRecord>>,
            Arc<watch::Sender<ControlSignal>>,
        ),
        RegistryError,
    > {
        let jobs = self.jobs.lock().unwrap();
        let entry = jobs
            .get(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        Ok((
            entry.record.clone(),
            entry.progress_tx.clone(),
            entry.control_tx.clone(),
        ))
    }

    /// Crea un job nuevo en estado Pending y devuelve inmediatamente.
    /// El engine se lanza aparte (el caller decide dónde) con el receiver
    /// de la señal de control.
    pub fn create(&self, request: ScanRequest) -> (JobRecord, watch::Receiver<ControlSignal>) {
        let id = uuid::Uuid::new_v4().to_string();
        let record = JobRecord::new(id.clone(), request);

        let (progress_tx, _progress_rx) = watch::channel(record.clone());
        let (control_tx, control_rx) = watch::channel(ControlSignal::Run);

        {
            let mut jobs = self.jobs.lock().unwrap();
            jobs.insert(
                id.clone(),
                JobEntry {
                    record: Arc::new(Mutex::new(record.clone())),
                    progress_tx: Arc::new(progress_tx),
                    control_tx: Arc::new(control_tx),
                },
            );
        }

        info!("job {} creado ({} targets)", id, record.targets_total);
        (record, control_rx)
    }

    pub fn get(&self, id: &str) -> Result<JobRecord, RegistryError> {
        let (record, _, _) = self.entry(id)?;
        let record = record.lock().unwrap();
        Ok(record.clone())
    }

    /// Snapshot punto-en-el-tiempo: copia cada record bajo su propio lock,
    /// así la iteración nunca ve una mutación a medio aplicar.
    pub fn list(&self, filter: Option<JobState>) -> Vec<JobRecord> {
        let records: Vec<Arc<Mutex<JobRecord>>> = {
            let jobs = self.jobs.lock().unwrap();
            jobs.values().map(|e| e.record.clone()).collect()
        };

        let mut out: Vec<JobRecord> = records
            .iter()
            .map(|r| r.lock().unwrap().clone())
            .filter(|r| filter.map(|f| r.state == f).unwrap_or(true))
            .collect();

        out.sort_by(|a, b| a.started_at.cmp(&b.started_at).then(a.id.cmp(&b.id)));
        out
    }

    /// Cancela un job. No-op con éxito si ya está en estado terminal;
    /// NotFound si el id no existe. Además de la transición, avisa al
    /// engine por la señal de control (la cancelación es cooperativa).
    pub fn cancel(&self, id: &str) -> Result<JobRecord, RegistryError> {
        let (record, progress_tx, control_tx) = self.entry(id)?;
        let mut record = record.lock().unwrap();

        if record.state.is_terminal() {
            // Ya terminó: no hay nada que cancelar
            return Ok(record.clone());
        }

        validate_transition(record.state, JobState::Cancelled)?;
        record.state = JobState::Cancelled;
        record.last_updated_at = Utc::now();

        let _ = control_tx.send(ControlSignal::Cancel);
        let _ = progress_tx.send(record.clone());

        info!("job {} cancelado", id);
        Ok(record.clone())
    }

    /// Running -> Paused, avisando al engine para que se detenga entre pasos.
    pub fn pause(&self, id: &str) -> Result<JobRecord, RegistryError> {
        let (record, progress_tx, control_tx) = self.entry(id)?;
        let mut record = record.lock().unwrap();

        validate_transition(record.state, JobState::Paused)?;
        record.state = JobState::Paused;
        record.last_updated_at = Utc::now();

        let _ = control_tx.send(ControlSignal::Pause);
        let _ = progress_tx.send(record.clone());

        info!("job {} pausado", id);
        Ok(record.clone())
    }

    /// Paused -> Running.
    pub fn resume(&self, id: &str) -> Result<JobRecord, RegistryError> {
        let (record, progress_tx, control_tx) = self.entry(id)?;
        let mut record = record.lock().unwrap();

        validate_transition(record.state, JobState::Running)?;
        record.state = JobState::Running;
        record.last_updated_at = Utc::now();

        let _ = control_tx.send(ControlSignal::Run);
        let _ = progress_tx.send(record.clone());

        info!("job {} reanudado", id);
        Ok(record.clone())
    }

    /// Transición reportada por el engine (Running, Completed, Failed...).
    /// Valida contra la máquina de estados; una violación se loggea y se
    /// devuelve al caller, nunca se absorbe en silencio.
    pub fn update_state(
        &self,
        id: &str,
        new_state: JobState,
        summary: Option<ScanSummary>,
    ) -> Result<JobRecord, RegistryError> {
        let (record, progress_tx, _) = self.entry(id)?;
        let mut record = record.lock().unwrap();

        if let Err(e) = validate_transition(record.state, new_state) {
            warn!("job {}: {}", id, e);
            return Err(e);
        }

        record.state = new_state;
        record.last_updated_at = Utc::now();
        if summary.is_some() {
            record.result_summary = summary;
        }

        let _ = progress_tx.send(record.clone());
        Ok(record.clone())
    }

    /// Avance de progreso sin cambio de estado. Si el job ya está en un
    /// estado terminal (ej: lo cancelaron mientras el engine dormía) el
    /// avance se descarta: nada mueve un job fuera de un estado terminal.
    pub fn record_progress(&self, id: &str, targets_scanned: u32) -> Result<(), RegistryError> {
        let (record, progress_tx, _) = self.entry(id)?;
        let mut record = record.lock().unwrap();

        if record.state.is_terminal() {
            return Ok(());
        }

        record.targets_scanned = targets_scanned;
        record.last_updated_at = Utc::now();

        let _ = progress_tx.send(record.clone());
        Ok(())
    }

    /// Receiver del canal de progreso del job: el valor inicial es el
    /// snapshot actual, así un orquestador que se re-engancha no pierde
    /// continuidad.
    pub fn subscribe(&self, id: &str) -> Result<watch::Receiver<JobRecord>, RegistryError> {
        let (_, progress_tx, _) = self.entry(id)?;
        Ok(progress_tx.subscribe())
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
