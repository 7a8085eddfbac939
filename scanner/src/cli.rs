use anyhow::Result;
use clap::{Parser, Subcommand};
use std::env;
use std::io::{self, Write};

use common::{JobRecord, ScanRequest};

use crate::supervisor::{Discovery, ScannerSupervisor, DEFAULT_SCANNER_PORT};

/// Puerto del worker contra el que habla la CLI.
/// Se puede sobreescribir con la env var SCANNER_PORT.
fn scanner_port() -> u16 {
    env::var("SCANNER_PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(DEFAULT_SCANNER_PORT)
}

#[derive(Parser)]
#[command(name = "scanner")]
#[command(about = "CLI para controlar el scanner de sitios")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Gramática explícita de comandos, desacoplada del loop de lectura.
#[derive(Subcommand)]
enum Commands {
    /// Lanza un scan nuevo sobre una lista de targets
    Start {
        #[arg(value_name = "NOMBRE")]
        name: String,

        /// Targets a enumerar (al menos uno)
        #[arg(value_name = "TARGET", required = true)]
        targets: Vec<String>,

        #[arg(long, default_value_t = 2)]
        parallelism: u32,
    },
    /// Consulta el estado de un scan
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Lista los scans del worker
    List {
        /// Filtrar por estado (PENDING, RUNNING, PAUSED, COMPLETED, FAILED, CANCELLED)
        #[arg(long, value_name = "ESTADO")]
        state: Option<String>,
    },
    /// Cancela un scan
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Pausa un scan en ejecución
    Pause {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Reanuda un scan pausado
    Resume {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Sigue el progreso de un scan hasta que termine
    Watch {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },
    /// Verifica que el worker esté vivo
    Ping,
    /// Detiene el worker
    Stop,
}

/// Rol orquestador. Dos modos de entrada:
/// - single-shot: los argumentos del proceso son un comando; sale con
///   código 1 si el comando falla.
/// - interactivo (sin argumentos): lee un comando por línea, línea
///   vacía termina. Un error no corta el loop, se muestra y se sigue.
pub async fn run(args: &[String]) -> Result<()> {
    let mut sup = ScannerSupervisor::new();
    let port = scanner_port();

    if args.len() <= 1 {
        return interactive(&mut sup, port).await;
    }

    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        // clap imprime el uso / help y sale con el código que toca
        Err(e) => e.exit(),
    };

    if let Some(command) = cli.command {
        if let Err(e) = dispatch(&mut sup, port, command).await {
            eprintln!("Error: {e:#}");
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn interactive(sup: &mut ScannerSupervisor, port: u16) -> Result<()> {
    println!("=== scanner: consola del orquestador ===");
    println!("worker en 127.0.0.1:{port}");
    println!();

    loop {
        print!("comando (<enter> para salir): ");
        io::stdout().flush()?;

        let mut line = String::new();
        if io::stdin().read_line(&mut line)? == 0 {
            break; // EOF
        }
        let line = line.trim();
        if line.is_empty() {
            break;
        }

        match parse_line(line) {
            Ok(Some(command)) => {
                // Un solo comando en vuelo: bloqueamos hasta que termine
                // (para watch, hasta el snapshot terminal)
                if let Err(e) = dispatch(sup, port, command).await {
                    eprintln!("Error: {e:#}");
                }
            }
            Ok(None) => {}
            Err(e) => {
                let _ = e.print();
            }
        }

        println!();
    }

    Ok(())
}

/// Parsea una línea de la consola con la misma gramática que el modo
/// single-shot.
fn parse_line(line: &str) -> Result<Option<Commands>, clap::Error> {
    let tokens: Vec<&str> = line.split_whitespace().collect();
    if tokens.is_empty() {
        return Ok(None);
    }

    let cli = Cli::try_parse_from(std::iter::once("scanner").chain(tokens))?;
    Ok(cli.command)
}

async fn dispatch(sup: &mut ScannerSupervisor, port: u16, command: Commands) -> Result<()> {
    // ping y stop no deben lanzar un worker que no existe
    match &command {
        Commands::Ping => {
            match sup.discover(port).await {
                Discovery::Found(ep) => println!("worker vivo en {}:{}", ep.host, ep.port),
                Discovery::NotFound => {
                    println!("no hay worker escuchando en el puerto {port}")
                }
                Discovery::Error(e) => println!("probe falló: {e}"),
            }
            return Ok(());
        }
        Commands::Stop => {
            match sup.discover(port).await {
                Discovery::Found(_) => {
                    sup.stop_worker(port).await?;
                    println!("worker detenido");
                }
                _ => println!("no hay worker que detener en el puerto {port}"),
            }
            return Ok(());
        }
        _ => {}
    }

    // El resto necesita un worker vivo: adjuntarse o lanzarlo
    sup.ensure_running(port).await?;

    match command {
        Commands::Start {
            name,
            targets,
            parallelism,
        } => {
            let record = sup
                .create_scan(
                    port,
                    &ScanRequest {
                        name,
                        targets,
                        parallelism,
                    },
                )
                .await?;

            println!("Scan creado:");
            print_record(&record);
        }

        Commands::Status { id } => {
            let record = sup.status(port, &id).await?;
            println!("Scan:");
            print_record(&record);
        }

        Commands::List { state } => {
            let records = sup.list(port, state.as_deref()).await?;
            if records.is_empty() {
                println!("(sin scans)");
            } else {
                for r in &records {
                    println!(
                        "{}  {:?}  {}/{}  {}",
                        r.id, r.state, r.targets_scanned, r.targets_total, r.request.name
                    );
                }
            }
        }

        Commands::Cancel { id } => {
            let ack = sup.cancel(port, &id).await?;
            println!("cancel: job {} -> {:?}", ack.job_id, ack.state);
        }

        Commands::Pause { id } => {
            let ack = sup.pause(port, &id).await?;
            println!("pause: job {} -> {:?}", ack.job_id, ack.state);
        }

        Commands::Resume { id } => {
            let ack = sup.resume(port, &id).await?;
            println!("resume: job {} -> {:?}", ack.job_id, ack.state);
        }

        Commands::Watch { id } => {
            let last = sup
                .stream_progress(port, &id, |r| {
                    println!("  {:?}  {}/{}", r.state, r.targets_scanned, r.targets_total);
                })
                .await?;

            println!("estado final: {:?}", last.state);
            if let Some(s) = &last.result_summary {
                println!("resumen: {} targets en {} ms", s.targets_scanned, s.duration_ms);
            }
        }

        Commands::Ping | Commands::Stop => unreachable!("manejados arriba"),
    }

    Ok(())
}

fn print_record(record: &JobRecord) {
    println!("  id: {}", record.id);
    println!("  nombre: {}", record.request.name);
    println!("  estado: {:?}", record.state);
    println!("  progreso: {}/{}", record.targets_scanned, record.targets_total);
    println!("  creado: {}", record.started_at);
    println!("  actualizado: {}", record.last_updated_at);
    if let Some(s) = &record.result_summary {
        println!("  resumen: {} targets en {} ms", s.targets_scanned, s.duration_ms);
    }
}
