// src/main.rs - Simulated printer speaking the command protocol on stdin/stdout
use std::path::PathBuf;

use clap::Parser;
use tokio::io::AsyncReadExt;

use micro_firmware::config::{self, Config};
use micro_firmware::hardware::{FileStorage, MemoryStorage, Storage};
use micro_firmware::simulator::{Simulator, StdoutTransport};
use micro_firmware::Printer;

#[derive(Parser, Debug)]
#[command(name = "printer-firmware", about = "Printer firmware running against a simulated machine.")]
struct Cli {
    /// Path to a TOML config file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum log level written to stderr
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Execute moves in real time
    #[arg(long)]
    realtime: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    let cli = Cli::parse();

    // stdout carries responses only
    tracing_subscriber::fmt()
        .with_max_level(cli.log_level)
        .with_writer(std::io::stderr)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            tracing::info!("Loading configuration from: {}", path.display());
            config::load_config(path)?
        }
        None => Config::default(),
    };
    config.simulator.realtime |= cli.realtime;

    let storage: Box<dyn Storage> = match &config.storage.path {
        Some(path) => {
            tracing::info!("Persistent storage at {}", path.display());
            Box::new(FileStorage::open(path, config.storage.size)?)
        }
        None => Box::new(MemoryStorage::new(config.storage.size)),
    };

    let simulator = Simulator::new(&config);
    let peripherals = simulator.peripherals(Box::new(StdoutTransport), storage);
    let printer = Printer::new(config, peripherals)?;

    let mut receiver = printer.receiver();
    let (eof_tx, eof_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        let mut buf = [0u8; 256];
        loop {
            match stdin.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => receiver.receive(&buf[..n]),
                Err(e) => {
                    tracing::error!("Failed to read stdin: {}", e);
                    break;
                }
            }
        }
        let _ = eof_tx.send(());
    });

    let shutdown = async {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("Interrupted"),
            _ = eof_rx => tracing::info!("Input closed"),
        }
    };

    printer.run(shutdown).await?;
    Ok(())
}
