use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    // Stdout carries command output; logs go to stderr.
    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(env_filter)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = tie_forecast_cli::Cli::parse();
    tie_forecast_cli::run_cli(cli)
}
