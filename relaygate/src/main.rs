//! CLI entry point: `run -f <config>`, `verify -f <config>`, `version`.
//!
//! `clap` derive subcommands, `tracing_subscriber::EnvFilter` initialized
//! from `RUST_LOG` before anything else runs, and a top-level `match` over
//! the exit path that converts failures into the process exit code rather
//! than panicking.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use relaygate::config;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "relaygate", version, about = "Declarative HTTP gateway")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Subcommand)]
enum Command {
	/// Load the configuration, build the gateway, and serve until signalled.
	Run {
		#[arg(short = 'f', long = "config")]
		config: PathBuf,
	},
	/// Load and validate the configuration, then exit without serving.
	Verify {
		#[arg(short = 'f', long = "config")]
		config: PathBuf,
	},
	/// Print the build version.
	Version,
}

/// Exit codes: 0 normal shutdown, 1 configuration error at startup, 2
/// fatal runtime error after startup, 130 received interrupt.
const EXIT_OK: u8 = 0;
const EXIT_CONFIG_ERROR: u8 = 1;
const EXIT_RUNTIME_ERROR: u8 = 2;
const EXIT_INTERRUPTED: u8 = 130;

fn main() -> ExitCode {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();

	let cli = Cli::parse();

	let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
		Ok(rt) => rt,
		Err(e) => {
			tracing::error!(error = %e, "failed to start async runtime");
			return ExitCode::from(EXIT_RUNTIME_ERROR);
		},
	};

	runtime.block_on(async_main(cli))
}

async fn async_main(cli: Cli) -> ExitCode {
	match cli.command {
		Command::Version => {
			println!("relaygate {}", env!("CARGO_PKG_VERSION"));
			ExitCode::from(EXIT_OK)
		},
		Command::Verify { config: path } => match config::load(&path) {
			Ok(raw) => match relaygate::verify(raw) {
				Ok(()) => {
					println!("configuration OK");
					ExitCode::from(EXIT_OK)
				},
				Err(e) => {
					tracing::error!(error = %e, "configuration is invalid");
					ExitCode::from(EXIT_CONFIG_ERROR)
				},
			},
			Err(e) => {
				tracing::error!(error = %e, "failed to load configuration");
				ExitCode::from(EXIT_CONFIG_ERROR)
			},
		},
		Command::Run { config: path } => {
			let raw = match config::load(&path) {
				Ok(raw) => raw,
				Err(e) => {
					tracing::error!(error = %e, "failed to load configuration");
					return ExitCode::from(EXIT_CONFIG_ERROR);
				},
			};
			match relaygate::run(raw).await {
				Ok(relaygate::RunOutcome::Completed) => ExitCode::from(EXIT_OK),
				Ok(relaygate::RunOutcome::Interrupted) => ExitCode::from(EXIT_INTERRUPTED),
				Err(e) => {
					tracing::error!(error = %e, "fatal runtime error");
					ExitCode::from(EXIT_RUNTIME_ERROR)
				},
			}
		},
	}
}
