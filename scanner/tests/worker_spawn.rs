//! Arranque de workers de verdad: el supervisor lanza el binario
//! compilado como proceso aparte y habla con él por HTTP.

use std::time::Duration;

use common::{ScanRequest, SupervisorError};
use scanner::supervisor::{Discovery, ScannerSupervisor};

const WORKER_EXE: &str = env!("CARGO_BIN_EXE_scanner");

/// Puerto efímero libre: lo pide al kernel y lo suelta enseguida.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    port
}

fn temp_log_root(sub: &str) -> std::path::PathBuf {
    let base = std::env::temp_dir().join("worker_spawn_tests").join(sub);
    let _ = std::fs::remove_dir_all(&base);
    std::fs::create_dir_all(&base).unwrap();
    base
}

#[tokio::test]
async fn ensure_running_lanza_exactamente_un_worker() {
    // Los logs del proceso hijo van a un directorio temporal
    std::env::set_var("SCANNER_LOG_ROOT", temp_log_root("lanzar"));
    std::env::set_var("SCANNER_STEP_MS", "1");

    let port = free_port().await;
    let mut sup = ScannerSupervisor::new().with_worker_exe(WORKER_EXE);

    sup.ensure_running(port).await.unwrap();

    // child Some == el proceso es nuestro, lo lanzamos nosotros
    let ep = sup.endpoint(port).expect("debería registrar el endpoint");
    assert!(ep.child.is_some());

    // Un segundo supervisor contra el mismo puerto se adjunta al worker
    // ya vivo en vez de lanzar otro proceso
    let mut otro = ScannerSupervisor::new().with_worker_exe(WORKER_EXE);
    otro.ensure_running(port).await.unwrap();
    assert!(otro.endpoint(port).unwrap().child.is_none());

    // Y el worker lanzado atiende comandos de verdad
    let record = sup
        .create_scan(
            port,
            &ScanRequest {
                name: "spawn-e2e".to_string(),
                targets: vec!["siteA".to_string()],
                parallelism: 1,
            },
        )
        .await
        .unwrap();
    assert_eq!(record.targets_total, 1);

    // Apagado ordenado: al rato el puerto deja de responder
    sup.stop_worker(port).await.unwrap();
    let mut gone = false;
    for _ in 0..20 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        if matches!(sup.discover(port).await, Discovery::NotFound) {
            gone = true;
            break;
        }
    }
    assert!(gone, "el worker debería haberse apagado");
}

#[tokio::test]
async fn un_puerto_tomado_por_otra_cosa_agota_los_reintentos() {
    std::env::set_var("SCANNER_LOG_ROOT", temp_log_root("ocupado"));

    // Algo que no es un worker acepta conexiones y nunca responde: los
    // probes de liveness expiran y el worker lanzado no puede bindear
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let mut held = Vec::new();
        loop {
            if let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        }
    });

    let mut sup = ScannerSupervisor::new()
        .with_worker_exe(WORKER_EXE)
        .with_spawn_attempts(2);

    let res = sup.ensure_running(port).await;
    match res {
        Err(SupervisorError::WorkerUnreachable { port: p, attempts }) => {
            assert_eq!(p, port);
            assert_eq!(attempts, 2);
        }
        other => panic!("esperaba WorkerUnreachable, fue {other:?}"),
    }

    // Un intento fallido no deja endpoint a medias
    assert!(sup.endpoint(port).is_none());
}
