use scanner::supervisor::DEFAULT_SCANNER_PORT;
use scanner::{cli, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().collect();

    // El primer argumento elige el rol: "scanner" -> worker (servicio
    // que ejecuta scans), cualquier otra cosa (incluido nada) -> CLI
    // del orquestador.
    let is_worker = args
        .get(1)
        .map(|a| a.eq_ignore_ascii_case("scanner"))
        .unwrap_or(false);

    if is_worker {
        // El segundo argumento, si parsea como puerto, pisa el default
        let port = args
            .get(2)
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(DEFAULT_SCANNER_PORT);

        server::run(port).await
    } else {
        cli::run(&args).await
    }
}
