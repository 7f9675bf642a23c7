use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use clap::Parser;
use incus_agent_wrapper::{Orchestrator, WrapperError, config};
use tracing::{error, info};
use tracing_subscriber::fmt::time::FormatTime;

struct Elapsed(Instant);

impl FormatTime for Elapsed {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> fmt::Result {
        let d = self.0.elapsed();
        let total_secs = d.as_secs();
        let mins = total_secs / 60;
        let secs = total_secs % 60;
        let millis = d.subsec_millis();
        write!(w, "[{mins:02}:{secs:02}:{millis:03}]")
    }
}

#[derive(Parser)]
#[command(name = "incus-agent-wrapper", version)]
struct Cli {
    /// YAML file overriding the built-in device paths, timeouts and agent arguments
    #[arg(long, env = "INCUS_AGENT_WRAPPER_CONFIG")]
    config: Option<PathBuf>,

    /// Print the effective configuration and exit without touching any device
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_timer(Elapsed(Instant::now()))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => return fail(&WrapperError::from(e)),
    };

    if cli.print_config {
        return match config::to_yaml(&config) {
            Ok(yaml) => {
                print!("{yaml}");
                ExitCode::SUCCESS
            }
            Err(e) => fail(&WrapperError::from(e)),
        };
    }

    info!(version = env!("CARGO_PKG_VERSION"), "incus-agent-wrapper starting");
    let err = Orchestrator::new(config).run();
    fail(&err)
}

fn fail(err: &WrapperError) -> ExitCode {
    error!("{}: {err}", err.stage());
    ExitCode::FAILURE
}
