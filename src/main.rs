//! Run a raw real-mode image (the built-in demo by default) and print its serial output.

use std::io;
use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use minivmm::vmm::boot::DEMO_IMAGE;
use minivmm::{run_with_console, Termination, VmConfig};

#[derive(Parser, Debug)]
#[command(name = "minivmm")]
#[command(about = "Run a raw real-mode guest image on KVM and print its serial output", long_about = None)]
#[command(after_help = "Without an image the built-in demo runs: it prints rax + rbx as a digit on COM1 and halts.")]
struct Cli {
    /// JSON VM configuration (memory layout, registers, exit policy)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stop the guest after this many milliseconds (overrides the config)
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Raw guest code, copied to the configured load address
    image: Option<PathBuf>,
}

fn run(cli: Cli) -> Result<Termination> {
    let mut config = match &cli.config {
        Some(path) => VmConfig::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => VmConfig::default(),
    };
    if cli.timeout_ms.is_some() {
        config.timeout_ms = cli.timeout_ms;
    }
    let code = match &cli.image {
        Some(path) => std::fs::read(path).with_context(|| format!("reading image {}", path.display()))?,
        None => DEMO_IMAGE.to_vec(),
    };

    info!("running {} bytes at {:#x}", code.len(), config.load_address);
    let report = run_with_console(&code, &config, io::stdout())?;
    info!("{:?} after {} exits ({:?})", report.termination, report.stats.steps, report.stats);
    Ok(report.termination)
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(termination) => process::exit(termination.exit_status()),
        Err(e) => {
            error!("{:#}", e);
            let code = e.downcast_ref::<minivmm::Error>().map_or(1, |e| e.exit_code());
            process::exit(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn no_arguments_runs_the_demo() {
        let cli = Cli::try_parse_from(["minivmm"]).unwrap();
        assert!(cli.config.is_none());
        assert!(cli.image.is_none());
        assert!(cli.timeout_ms.is_none());
    }

    #[test]
    fn parses_config_image_and_timeout() {
        let cli =
            Cli::try_parse_from(["minivmm", "-c", "vm.json", "--timeout-ms", "500", "guest.bin"]).unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("vm.json")));
        assert_eq!(cli.image, Some(PathBuf::from("guest.bin")));
        assert_eq!(cli.timeout_ms, Some(500));
    }

    #[test]
    fn unknown_options_are_rejected() {
        assert!(Cli::try_parse_from(["minivmm", "--turbo"]).is_err());
        assert!(Cli::try_parse_from(["minivmm", "--timeout-ms", "soon"]).is_err());
    }
}
