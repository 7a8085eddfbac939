use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use std::{collections::HashMap, path::PathBuf, process::Stdio, time::Duration};
use tokio::process::{Child, Command};
use tokio::time::{sleep, timeout};

use common::{Ack, JobRecord, OpAck, ScanRequest, SupervisorError};

/// Puerto bien conocido del worker cuando no se pide otro.
pub const DEFAULT_SCANNER_PORT: u16 = 25010;

const PROBE_TIMEOUT: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const SPAWN_MAX_ATTEMPTS: u32 = 8;
const SPAWN_BACKOFF_BASE_MS: u64 = 100;

// Holgado respecto del keep-alive que manda el worker (15s): si pasa
// tanto sin un solo byte, el worker dejó de responder.
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(45);

/// Cómo llegar a un worker. `child` solo está presente si el proceso lo
/// lanzamos nosotros; si nos adjuntamos a uno ya vivo, no somos dueños.
#[derive(Debug)]
pub struct WorkerEndpoint {
    pub host: String,
    pub port: u16,
    pub child: Option<Child>,
}

/// Resultado tipado del probe de liveness.
#[derive(Debug)]
pub enum Discovery {
    Found(WorkerEndpoint),
    NotFound,
    Error(String),
}

/// Lado orquestador: descubre o lanza el worker y reenvía comandos por
/// el canal HTTP. Si el canal se rompe a mitad de sesión devuelve
/// WorkerDisconnected y NO reintenta solo: un retry implícito contra un
/// comando que crea jobs arriesga crear el job dos veces.
pub struct ScannerSupervisor {
    client: reqwest::Client,
    endpoints: HashMap<u16, WorkerEndpoint>,
    /// Ejecutable a lanzar como worker. Default: el propio binario (un
    /// ejecutable, dos roles); inyectable para los tests de integración.
    worker_exe: Option<PathBuf>,
    spawn_attempts: u32,
    stream_idle_timeout: Duration,
}

fn send_error(e: reqwest::Error) -> SupervisorError {
    SupervisorError::WorkerDisconnected(e.to_string())
}

async fn expect_json<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, SupervisorError> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(SupervisorError::Protocol(format!("status {status}: {body}")));
    }
    resp.json::<T>()
        .await
        .map_err(|e| SupervisorError::Protocol(e.to_string()))
}

/// Extrae los payloads `data:` de los frames SSE completos que haya en
/// `buf`, dejando en `buf` el frame a medio llegar. Los comentarios de
/// keep-alive (líneas que empiezan con ':') se descartan.
fn drain_events(buf: &mut String) -> Vec<String> {
    let mut out = Vec::new();

    while let Some(pos) = buf.find("\n\n") {
        let frame = buf[..pos].to_string();
        buf.replace_range(..pos + 2, "");

        let mut data = String::new();
        for line in frame.lines() {
            if let Some(rest) = line.strip_prefix("data:") {
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(rest.trim_start());
            }
        }

        if !data.is_empty() {
            out.push(data);
        }
    }

    out
}

impl ScannerSupervisor {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoints: HashMap::new(),
            worker_exe: None,
            spawn_attempts: SPAWN_MAX_ATTEMPTS,
            stream_idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }

    pub fn with_worker_exe(mut self, exe: impl Into<PathBuf>) -> Self {
        self.worker_exe = Some(exe.into());
        self
    }

    pub fn with_spawn_attempts(mut self, attempts: u32) -> Self {
        self.spawn_attempts = attempts;
        self
    }

    pub fn with_stream_idle_timeout(mut self, idle: Duration) -> Self {
        self.stream_idle_timeout = idle;
        self
    }

    fn base_url(port: u16) -> String {
        format!("http://127.0.0.1:{port}")
    }

    fn worker_exe(&self) -> std::io::Result<PathBuf> {
        match &self.worker_exe {
            Some(exe) => Ok(exe.clone()),
            None => std::env::current_exe(),
        }
    }

    pub fn endpoint(&self, port: u16) -> Option<&WorkerEndpoint> {
        self.endpoints.get(&port)
    }

    /// Backoff exponencial del poll de liveness, con techo.
    fn backoff_delay(attempt: u32) -> Duration {
        Duration::from_millis(SPAWN_BACKOFF_BASE_MS * (1u64 << attempt.min(6)))
    }

    /// Probe de liveness con timeout acotado: nunca cuelga al caller.
    pub async fn discover(&self, port: u16) -> Discovery {
        let url = format!("{}/health", Self::base_url(port));

        match self.client.get(&url).timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) if resp.status().is_success() => Discovery::Found(WorkerEndpoint {
                host: "127.0.0.1".to_string(),
                port,
                child: None,
            }),
            Ok(resp) => Discovery::Error(format!(
                "el puerto {port} respondió status {} (¿no es un worker?)",
                resp.status()
            )),
            Err(e) if e.is_connect() || e.is_timeout() => Discovery::NotFound,
            Err(e) => Discovery::Error(e.to_string()),
        }
    }

    /// Se adjunta a un worker vivo en `port` o lanza uno nuevo
    /// (`<exe> scanner <port>`) y espera a que esté listo, con reintentos
    /// acotados y backoff exponencial. Nunca lanza un segundo worker
    /// para un puerto que ya responde.
    pub async fn ensure_running(&mut self, port: u16) -> Result<(), SupervisorError> {
        match self.discover(port).await {
            Discovery::Found(ep) => {
                // conservar el child si el worker lo lanzamos antes
                self.endpoints.entry(port).or_insert(ep);
                return Ok(());
            }
            Discovery::Error(e) => return Err(SupervisorError::Protocol(e)),
            Discovery::NotFound => {}
        }

        let exe = self.worker_exe()?;
        let mut child = Command::new(exe)
            .arg("scanner")
            .arg(port.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;

        let mut ready = false;
        for attempt in 0..self.spawn_attempts {
            sleep(Self::backoff_delay(attempt)).await;
            if matches!(self.discover(port).await, Discovery::Found(_)) {
                ready = true;
                break;
            }
        }

        if !ready {
            // El proceso nunca quedó listo (ej: puerto ocupado por otra
            // cosa): lo matamos para no dejarlo colgando
            let _ = child.start_kill();
            return Err(SupervisorError::WorkerUnreachable {
                port,
                attempts: self.spawn_attempts,
            });
        }

        self.endpoints.insert(
            port,
            WorkerEndpoint {
                host: "127.0.0.1".to_string(),
                port,
                child: Some(child),
            },
        );
        Ok(())
    }

    /* --------- comandos unarios --------- */

    pub async fn create_scan(
        &self,
        port: u16,
        request: &ScanRequest,
    ) -> Result<JobRecord, SupervisorError> {
        let url = format!("{}/api/v1/scans", Self::base_url(port));
        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .json(request)
            .send()
            .await
            .map_err(send_error)?;
        expect_json(resp).await
    }

    pub async fn status(&self, port: u16, id: &str) -> Result<JobRecord, SupervisorError> {
        let url = format!("{}/api/v1/scans/{id}", Self::base_url(port));
        let resp = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(send_error)?;
        expect_json(resp).await
    }

    pub async fn list(
        &self,
        port: u16,
        state: Option<&str>,
    ) -> Result<Vec<JobRecord>, SupervisorError> {
        let mut url = format!("{}/api/v1/scans", Self::base_url(port));
        if let Some(state) = state {
            url = format!("{url}?state={state}");
        }
        let resp = self
            .client
            .get(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(send_error)?;
        expect_json(resp).await
    }

    async fn post_op(&self, port: u16, id: &str, op: &str) -> Result<OpAck, SupervisorError> {
        let url = format!("{}/api/v1/scans/{id}/{op}", Self::base_url(port));
        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(send_error)?;
        expect_json(resp).await
    }

    pub async fn cancel(&self, port: u16, id: &str) -> Result<OpAck, SupervisorError> {
        self.post_op(port, id, "cancel").await
    }

    pub async fn pause(&self, port: u16, id: &str) -> Result<OpAck, SupervisorError> {
        self.post_op(port, id, "pause").await
    }

    pub async fn resume(&self, port: u16, id: &str) -> Result<OpAck, SupervisorError> {
        self.post_op(port, id, "resume").await
    }

    /// Pide el apagado ordenado del worker y descarta el endpoint: el
    /// endpoint solo existe mientras el worker exista.
    pub async fn stop_worker(&mut self, port: u16) -> Result<Ack, SupervisorError> {
        let url = format!("{}/api/v1/admin/stop", Self::base_url(port));
        let resp = self
            .client
            .post(&url)
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(send_error)?;
        let ack: Ack = expect_json(resp).await?;

        self.endpoints.remove(&port);
        Ok(ack)
    }

    /* --------- comando streaming --------- */

    /// Consume el stream SSE de progreso, invocando `on_update` por cada
    /// snapshot, hasta el snapshot terminal (que devuelve). Si el stream
    /// se corta antes del terminal, eso es una desconexión del worker.
    pub async fn stream_progress<F>(
        &self,
        port: u16,
        id: &str,
        mut on_update: F,
    ) -> Result<JobRecord, SupervisorError>
    where
        F: FnMut(&JobRecord),
    {
        let url = format!("{}/api/v1/scans/{id}/progress", Self::base_url(port));
        let resp = self.client.get(&url).send().await.map_err(send_error)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SupervisorError::Protocol(format!("status {status}: {body}")));
        }

        let mut stream = resp.bytes_stream();
        let mut buf = String::new();

        loop {
            let chunk = match timeout(self.stream_idle_timeout, stream.next()).await {
                Ok(Some(chunk)) => {
                    chunk.map_err(|e| SupervisorError::WorkerDisconnected(e.to_string()))?
                }
                Ok(None) => break,
                // Un worker vivo manda keep-alives; silencio total tan
                // largo significa que dejó de responder.
                Err(_) => {
                    return Err(SupervisorError::WorkerDisconnected(format!(
                        "el stream de progreso quedó mudo por más de {}ms",
                        self.stream_idle_timeout.as_millis()
                    )))
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            for payload in drain_events(&mut buf) {
                let record: JobRecord = serde_json::from_str(&payload)
                    .map_err(|e| SupervisorError::Protocol(e.to_string()))?;

                on_update(&record);
                if record.state.is_terminal() {
                    return Ok(record);
                }
            }
        }

        Err(SupervisorError::WorkerDisconnected(
            "el stream de progreso terminó sin un estado terminal".to_string(),
        ))
    }
}

impl Default for ScannerSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{self, AppState};
    use crate::logroute::LogRouter;
    use crate::registry::JobRegistry;
    use common::JobState;
    use std::sync::Arc;
    use tokio::sync::watch;

    fn test_state(sub: &str) -> AppState {
        let base = std::env::temp_dir().join("supervisor_tests").join(sub);
        let _ = std::fs::remove_dir_all(&base);
        let (shutdown_tx, _rx) = watch::channel(false);

        AppState {
            registry: JobRegistry::new(),
            logs: Arc::new(LogRouter::new(base).unwrap()),
            shutdown: Arc::new(shutdown_tx),
            step_delay: Duration::from_millis(1),
        }
    }

    /// Levanta un worker real en un puerto efímero y devuelve el puerto.
    async fn spawn_worker(sub: &str) -> u16 {
        let app = handlers::build_router(test_state(sub));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        port
    }

    #[test]
    fn drain_events_separa_frames_y_deja_el_resto() {
        let mut buf = "data: uno\n\ndata: dos\n\ndata: incom".to_string();
        let events = drain_events(&mut buf);

        assert_eq!(events, vec!["uno".to_string(), "dos".to_string()]);
        assert_eq!(buf, "data: incom");
    }

    #[test]
    fn drain_events_ignora_comentarios_de_keepalive() {
        let mut buf = ": ping\n\ndata: real\n\n".to_string();
        let events = drain_events(&mut buf);
        assert_eq!(events, vec!["real".to_string()]);
    }

    #[test]
    fn el_backoff_crece_exponencial_con_techo() {
        let d0 = ScannerSupervisor::backoff_delay(0);
        let d1 = ScannerSupervisor::backoff_delay(1);
        let d2 = ScannerSupervisor::backoff_delay(2);

        assert_eq!(d1, d0 * 2);
        assert_eq!(d2, d1 * 2);

        // Con techo: no sigue doblando para siempre
        assert_eq!(
            ScannerSupervisor::backoff_delay(20),
            ScannerSupervisor::backoff_delay(6)
        );
    }

    #[tokio::test]
    async fn discover_sin_listener_es_not_found() {
        // Puerto efímero que liberamos enseguida: nadie escucha ahí
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sup = ScannerSupervisor::new();
        assert!(matches!(sup.discover(port).await, Discovery::NotFound));
    }

    #[tokio::test]
    async fn discover_encuentra_un_worker_vivo() {
        let port = spawn_worker("discover").await;
        let sup = ScannerSupervisor::new();

        match sup.discover(port).await {
            Discovery::Found(ep) => {
                assert_eq!(ep.port, port);
                assert!(ep.child.is_none());
            }
            other => panic!("esperaba Found, fue {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_running_se_adjunta_sin_lanzar_otro_proceso() {
        let port = spawn_worker("adjuntar").await;
        let mut sup = ScannerSupervisor::new();

        sup.ensure_running(port).await.unwrap();

        let ep = sup.endpoint(port).expect("debería registrar el endpoint");
        // child None == nos adjuntamos, no lanzamos nada
        assert!(ep.child.is_none());
    }

    #[tokio::test]
    async fn ciclo_completo_contra_un_worker_real() {
        let port = spawn_worker("e2e").await;
        let sup = ScannerSupervisor::new();

        let record = sup
            .create_scan(
                port,
                &ScanRequest {
                    name: "e2e".to_string(),
                    targets: vec!["siteA".to_string(), "siteB".to_string()],
                    parallelism: 1,
                },
            )
            .await
            .unwrap();

        // El stream entrega snapshots hasta el terminal
        let mut seen = Vec::new();
        let last = sup
            .stream_progress(port, &record.id, |r| seen.push(r.state))
            .await
            .unwrap();

        assert_eq!(last.state, JobState::Completed);
        assert_eq!(last.targets_scanned, 2);
        assert!(last.result_summary.is_some());
        assert!(!seen.is_empty());

        // Y el status unario coincide
        let got = sup.status(port, &record.id).await.unwrap();
        assert_eq!(got.state, JobState::Completed);
    }

    #[tokio::test]
    async fn status_de_id_desconocido_es_error_de_protocolo() {
        let port = spawn_worker("status404").await;
        let sup = ScannerSupervisor::new();

        let res = sup.status(port, "unknown-id").await;
        assert!(matches!(res, Err(SupervisorError::Protocol(_))));
    }

    #[tokio::test]
    async fn un_stream_mudo_termina_en_disconnected() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        // Servidor que acepta la conexión, manda las cabeceras SSE y
        // después no escribe ni un byte más, con el socket abierto.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut discard = [0u8; 1024];
            let _ = sock.read(&mut discard).await;
            sock.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\n",
            )
            .await
            .unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(sock);
        });

        let sup = ScannerSupervisor::new()
            .with_stream_idle_timeout(Duration::from_millis(200));

        let res = sup.stream_progress(port, "job-x", |_| {}).await;
        assert!(matches!(res, Err(SupervisorError::WorkerDisconnected(_))));
    }

    #[tokio::test]
    async fn comando_contra_worker_caido_es_disconnected() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let sup = ScannerSupervisor::new();
        let res = sup.status(port, "lo-que-sea").await;
        assert!(matches!(res, Err(SupervisorError::WorkerDisconnected(_))));
    }
}
