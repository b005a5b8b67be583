/*
 * Copyright © 2023 Collabora Ltd.
 * Copyright © 2024 Valve Software
 *
 * SPDX-License-Identifier: MIT
 */

use clap::Parser;
use std::env;
use std::process::ExitCode;
use tracing::error;
use tracing::subscriber::set_global_default;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter, Registry};

use power_profiles_daemon::daemon;

#[derive(Parser)]
struct Args {
    /// Print debug information during command processing
    #[arg(short, long)]
    verbose: bool,

    /// Replace a running instance
    #[arg(short, long)]
    replace: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let default = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    let filter = EnvFilter::builder()
        .with_default_directive(default.into())
        .from_env_lossy();
    let stdout_log = fmt::layer().with_ansi(env::var_os("NO_COLOR").is_none());
    let subscriber = Registry::default().with(stdout_log).with(filter);
    if set_global_default(subscriber).is_err() {
        eprintln!("Failed to set up logging");
        return ExitCode::FAILURE;
    }

    match daemon::run(args.replace).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Error running daemon: {e:#}");
            ExitCode::FAILURE
        }
    }
}
