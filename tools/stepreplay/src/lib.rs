pub mod command;
pub mod config;
pub mod engine;
pub mod errors;
pub mod events;
pub mod field_mapping;
pub mod injector;
pub mod logging;
pub mod pause;
pub mod retry;
pub mod run_record;
pub mod runtime;
pub mod session;
pub mod step_identity;
pub mod store;
pub mod surface;
pub mod types;

use clap::{error::ErrorKind, Parser};
use config::{load_config, require_surface, CliOverrides};
use engine::Engine;
use errors::ReplayError;
use logging::{structured_fallback_line, RunLogger};
use runtime::ProductionRuntime;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use store::SqliteStore;
use surface::ProcessActionSurface;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc};

#[derive(Debug, Clone, Parser)]
#[command(name = "stepreplay")]
#[command(about = "Record/replay engine serving JSON commands over stdio")]
pub struct Cli {
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[arg(long)]
    pub db: Option<PathBuf>,
    #[arg(long)]
    pub driver: Option<String>,
    #[arg(long)]
    pub log: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    pub print_config: bool,
}

pub fn run() -> Result<i32, ReplayError> {
    let args = std::env::args_os().collect::<Vec<_>>();
    let cwd = std::env::current_dir().map_err(|e| ReplayError::Io(e.to_string()))?;
    let runtime = ProductionRuntime::new();
    run_with_runtime(&args, &cwd, &runtime)
}

pub fn run_with_runtime(
    args: &[std::ffi::OsString],
    cwd: &std::path::Path,
    runtime: &ProductionRuntime,
) -> Result<i32, ReplayError> {
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) => match error.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => {
                print!("{error}");
                return Ok(0);
            }
            _ => return Err(ReplayError::Cli(error.to_string())),
        },
    };

    let overrides = CliOverrides {
        config_path: cli.config.clone(),
        db_path: cli.db.clone(),
        driver_program: cli.driver.clone(),
        log_path: cli.log.clone(),
    };
    let cfg = load_config(&overrides, cwd, runtime.file_system.as_ref())?;

    if cli.print_config {
        let rendered =
            toml::to_string_pretty(&cfg).map_err(|e| ReplayError::ConfigParse(e.to_string()))?;
        runtime.terminal.write_line(rendered.trim_end())?;
        return Ok(0);
    }

    require_surface(&cfg)?;
    if let Some(parent) = cfg.logging.path.as_ref().and_then(|path| path.parent()) {
        runtime.file_system.create_dir_all(parent)?;
    }
    let logger = Arc::new(RunLogger::from_config(&cfg.logging));
    let store = Arc::new(SqliteStore::open(&cfg.storage.db_path, logger.clone())?);
    let surface = Arc::new(ProcessActionSurface::new(
        runtime.process_runner.clone(),
        cfg.surface.program.clone(),
        cfg.surface.args.clone(),
    ));
    let engine = Arc::new(Engine::new(
        &cfg,
        store,
        surface,
        runtime.clock.clone(),
        logger.clone(),
    ));

    let async_runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ReplayError::Io(e.to_string()))?;
    async_runtime.block_on(async {
        let restored = engine.restore().await;
        logger.append(
            "info",
            "engine.started",
            json!({
                "db_path": cfg.storage.db_path.display().to_string(),
                "driver": cfg.surface.program,
                "restored": restored,
            }),
        );
        for status in [&restored.recording, &restored.replay].into_iter().flatten() {
            eprintln!(
                "{}",
                structured_fallback_line(
                    status.kind.as_str(),
                    status.status.as_str(),
                    &format!("restored session {}", status.session_id),
                )
            );
        }
        serve(
            engine.clone(),
            BufReader::new(tokio::io::stdin()),
            tokio::io::stdout(),
        )
        .await
    })?;
    logger.append("info", "engine.stopped", json!({}));
    Ok(0)
}

/// Serves the command bus: one JSON command per input line, one JSON response
/// per output line, with engine events interleaved as `{"event": ...}` lines.
pub async fn serve<R, W>(engine: Arc<Engine>, input: R, output: W) -> Result<(), ReplayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
    let writer = tokio::spawn(async move {
        let mut output = output;
        while let Some(line) = line_rx.recv().await {
            output.write_all(line.as_bytes()).await?;
            output.write_all(b"\n").await?;
            output.flush().await?;
        }
        Ok::<(), std::io::Error>(())
    });

    let mut events = engine.subscribe();
    let event_tx = line_tx.clone();
    let forwarder = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    let Ok(line) = serde_json::to_string(&event) else {
                        continue;
                    };
                    if event_tx.send(line).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    let mut lines = input.lines();
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| ReplayError::Io(e.to_string()))?
    {
        if line.trim().is_empty() {
            continue;
        }
        let response = engine.handle_line(&line).await;
        let text = serde_json::to_string(&response)
            .map_err(|e| ReplayError::Transport(e.to_string()))?;
        if line_tx.send(text).await.is_err() {
            break;
        }
    }

    forwarder.abort();
    let _ = forwarder.await;
    drop(line_tx);
    writer
        .await
        .map_err(|e| ReplayError::Io(e.to_string()))?
        .map_err(|e| ReplayError::Io(e.to_string()))
}
