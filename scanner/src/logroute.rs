use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    fmt,
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};
use tracing::{error, info, warn};

use common::JobId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Un registro de log. El tag opcional de job decide si además del sink
/// global se escribe en el sink dedicado de ese job.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub job_id: Option<JobId>,
    pub message: String,
}

impl LogRecord {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            ts: Utc::now(),
            level: LogLevel::Info,
            job_id: None,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Warn,
            ..Self::info(message)
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            level: LogLevel::Error,
            ..Self::info(message)
        }
    }

    pub fn with_job(mut self, id: &str) -> Self {
        self.job_id = Some(id.to_string());
        self
    }
}

/// Router de logs del worker: todo registro termina en el sink global
/// (un archivo con timestamp de arranque) y, si viene taggeado con un
/// job, también en el archivo dedicado de ese job. Se construye una vez
/// al arrancar el rol y se comparte por Arc, no es un singleton.
pub struct LogRouter {
    root: PathBuf,
    global_path: PathBuf,
    global: Mutex<File>,
    per_job: Mutex<HashMap<JobId, Arc<Mutex<File>>>>,
}

impl LogRouter {
    /// Crea el router con el sink global `log_{yyyyMMdd_HHmm}.txt` bajo
    /// `root`. Los sinks por job se crean lazy en el primer registro
    /// taggeado con ese job.
    pub fn new(root: impl AsRef<Path>) -> io::Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let timestamp = Utc::now().format("%Y%m%d_%H%M");
        let global_path = root.join(format!("log_{timestamp}.txt"));
        let global = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&global_path)?;

        Ok(Self {
            root,
            global_path,
            global: Mutex::new(global),
            per_job: Mutex::new(HashMap::new()),
        })
    }

    pub fn global_path(&self) -> &Path {
        &self.global_path
    }

    /// Ruta del sink dedicado de un job: `{root}/{job_id}/log_{job_id}.txt`.
    pub fn job_path(&self, id: &str) -> PathBuf {
        self.root.join(id).join(format!("log_{id}.txt"))
    }

    /// Enruta un registro. Siempre escribe al sink global; si el registro
    /// viene taggeado, además al sink del job. Un fallo creando el sink
    /// del job se reporta como warning en el global pero el registro
    /// nunca se pierde del sink global.
    pub fn route(&self, record: LogRecord) {
        let line = match &record.job_id {
            Some(id) => format!(
                "{} [{}] [job {}] {}\n",
                record.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level,
                id,
                record.message
            ),
            None => format!(
                "{} [{}] {}\n",
                record.ts.format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level,
                record.message
            ),
        };

        self.write_global(&line);

        if let Some(id) = &record.job_id {
            match self.job_sink(id) {
                Ok(sink) => {
                    let mut f = sink.lock().unwrap();
                    let _ = f.write_all(line.as_bytes());
                    let _ = f.flush();
                }
                Err(e) => {
                    // El registro ya está en el global; solo avisamos
                    let ts = Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    self.write_global(&format!(
                        "{ts} [WARN] no se pudo crear el sink del job {id}: {e}\n"
                    ));
                }
            }
        }

        // Espejo en consola vía tracing
        match record.level {
            LogLevel::Info => info!("{}", record.message),
            LogLevel::Warn => warn!("{}", record.message),
            LogLevel::Error => error!("{}", record.message),
        }
    }

    fn write_global(&self, line: &str) {
        let mut g = self.global.lock().unwrap();
        let _ = g.write_all(line.as_bytes());
        let _ = g.flush();
    }

    fn job_sink(&self, id: &str) -> io::Result<Arc<Mutex<File>>> {
        let mut per_job = self.per_job.lock().unwrap();

        if let Some(sink) = per_job.get(id) {
            return Ok(sink.clone());
        }

        let dir = self.root.join(id);
        fs::create_dir_all(&dir)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(format!("log_{id}.txt")))?;

        let sink = Arc::new(Mutex::new(file));
        per_job.insert(id.to_string(), sink.clone());
        Ok(sink)
    }

    /// Fuerza el flush de todos los sinks (se llama antes de terminar el
    /// proceso, también en el camino de error fatal).
    pub fn flush(&self) {
        let _ = self.global.lock().unwrap().flush();
        let per_job = self.per_job.lock().unwrap();
        for sink in per_job.values() {
            let _ = sink.lock().unwrap().flush();
        }
    }
}
