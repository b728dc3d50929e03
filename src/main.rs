// ABOUTME: Main entry point for portmapper
//
// Binary: portmapper
// Usage: portmapper [--home DIR] [--format text|json] <COMMAND>
// - run: watch ports and keep frpc in sync until Ctrl-C
// - scan: list listening ports
// - render: print the frpc config for some mappings
// - locate: look for the frpc executable

#![allow(missing_docs)]

use anyhow::Result;
use clap::Parser;

mod cli;

use portmapper::config::Paths;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let paths = match args.home {
        Some(home) => Paths::with_base(home),
        None => Paths::user()?,
    };

    setup_logging(&paths, matches!(args.command, cli::Commands::Run(_)));
    setup_panic_handler();

    match args.command {
        cli::Commands::Run(run_args) => cli::run::execute(run_args, args.format, &paths).await,
        cli::Commands::Scan(scan_args) => cli::scan::execute(scan_args, args.format, &paths).await,
        cli::Commands::Render(render_args) => {
            cli::render::execute(render_args, args.format, &paths).await
        }
        cli::Commands::Locate => cli::locate::execute(args.format, &paths).await,
    }
}

fn setup_logging(paths: &Paths, to_stderr: bool) {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    let log_dir = paths.log_dir();
    let _ = std::fs::create_dir_all(&log_dir);

    // JSONL log file with timestamp
    let log_file = log_dir.join(format!(
        "portmapper-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file_layer = match OpenOptions::new().create(true).append(true).open(&log_file) {
        Ok(file) => Some(
            tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_writer(file)
                .with_ansi(false),
        ),
        Err(e) => {
            eprintln!("Could not open log file {}: {e}", log_file.display());
            None
        }
    };

    let stderr_layer = to_stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "portmapper=info".into()),
        )
        .init();
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
