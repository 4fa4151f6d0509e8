//! Scan runner: environment checks, cancellation wiring, exit-code mapping

use strix_core::config::{ScanConfig, ScanMode, Settings};
use strix_core::scan::ScanSupervisor;
use strix_core::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::args::Args;
use crate::exit_codes;

pub async fn run(args: Args) -> i32 {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(config_error) => {
            error!("{config_error}");
            eprintln!("strix: {config_error}");
            eprintln!("strix: set STRIX_LLM and LLM_API_KEY before running a scan");
            return exit_codes::ENV_NOT_READY;
        }
    };

    let scan_mode: ScanMode = match args.scan_mode.parse() {
        Ok(mode) => mode,
        Err(parse_error) => {
            eprintln!("strix: {parse_error}");
            return exit_codes::MISUSE;
        }
    };

    let config = match ScanConfig::new(&args.target, scan_mode)
        .with_run_name(args.run_name.clone())
        .with_non_interactive(args.non_interactive)
        .with_prompt_modules(args.parse_modules())
    {
        Ok(config) => config,
        Err(config_error) => {
            eprintln!("strix: {config_error}");
            return exit_codes::MISUSE;
        }
    };

    let cancel = CancellationToken::new();
    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("strix: cancellation requested, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    let supervisor = match ScanSupervisor::new(&settings, config, cancel) {
        Ok(supervisor) => supervisor,
        Err(Error::Config(message)) => {
            eprintln!("strix: {message}");
            return exit_codes::ENV_NOT_READY;
        }
        Err(startup_error) => {
            eprintln!("strix: {startup_error}");
            return exit_codes::ENV_NOT_READY;
        }
    };

    info!(run_dir = %supervisor.store().run_dir().display(), "Starting scan");

    match supervisor.run().await {
        Ok(summary) => {
            println!(
                "Scan complete: {} verified, {} rejected, {} still pending, {} agents",
                summary.verified_findings,
                summary.rejected_findings,
                summary.pending_findings,
                summary.agents_spawned,
            );
            println!("Results: {}", supervisor.store().run_dir().display());
            if summary.root_succeeded {
                exit_codes::OK
            } else {
                exit_codes::SCAN_FAILED
            }
        }
        Err(Error::Cancelled) => {
            eprintln!("strix: scan cancelled");
            exit_codes::CANCELLED
        }
        Err(Error::SandboxUnavailable(message)) => {
            eprintln!("strix: environment not ready: {message}");
            exit_codes::ENV_NOT_READY
        }
        Err(scan_error) => {
            error!("{scan_error}");
            eprintln!("strix: scan failed: {scan_error}");
            exit_codes::SCAN_FAILED
        }
    }
}
