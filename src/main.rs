use anyhow::{Context, Result};
use clap::{CommandFactory, error::ErrorKind};
use netfwd::{Cli, Config, Forwarder, load_config};
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args: Vec<_> = std::env::args_os().collect();
    if args.len() == 1 {
        Cli::command().print_long_help()?;
        return Ok(ExitCode::SUCCESS);
    }

    let cli = match Cli::try_parse_args(args) {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            e.print()?;
            return Ok(ExitCode::FAILURE);
        }
    };

    let mut options = cli.options();
    if let Some(path) = &cli.config {
        options = options.or(load_config(path)?);
    }

    init_tracing(options.verbose);
    for setting in options.ignored_settings() {
        warn!("{setting}");
    }

    let config = match Config::resolve(options) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e:#}\n\n{}", Cli::command().render_usage());
            return Ok(ExitCode::FAILURE);
        }
    };

    start(config).await?;
    Ok(ExitCode::SUCCESS)
}

/// Log lines go to stderr; stdout carries dumped traffic.
fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "netfwd=debug,info" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn start(config: Config) -> Result<()> {
    if config.verbose {
        let mode = |tls: bool| if tls { "TLS" } else { "PLAIN" };
        info!(
            listen_addr = %config.listen,
            mode = mode(config.inbound_tls.is_some()),
            "Listen on"
        );
        info!(
            remote_addr = %config.remote,
            mode = mode(config.outbound_tls.is_some()),
            "Connect to"
        );
    }

    let forwarder = Forwarder::from_config(config).context("Invalid TLS configuration")?;
    netfwd::run(forwarder).await
}
