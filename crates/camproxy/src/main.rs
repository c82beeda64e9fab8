mod cli;
mod config;
mod error;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use camproxy_core::{Adapter, IdentityManager};

use crate::cli::{Cli, Command, LogFormat};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_tracing(cli.global.verbose, cli.global.log_format);

    if let Err(err) = run(cli).await {
        let code = err.exit_code();
        eprintln!("{:?}", miette::Report::new(err));
        std::process::exit(code);
    }
}

fn init_tracing(verbosity: u8, format: LogFormat) {
    let level = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.with_target(false).init(),
        LogFormat::Json => builder.json().with_current_span(false).init(),
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    match cli.command {
        Command::Run(args) => {
            let adapter_config = config::for_run(&cli.global, &args)?;
            let adapter = Adapter::new(adapter_config);

            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));
            adapter.run(cancel).await?;
            Ok(())
        }

        Command::Identity(overrides) => {
            let loaded = config::load(&cli.global, &overrides)?;
            let path = loaded
                .identity
                .path
                .unwrap_or_else(camproxy_config::default_identity_path);
            let manager = IdentityManager::new(path);
            manager.ensure_identity()?;
            println!("{}", manager.path().display());
            Ok(())
        }

        Command::Token(overrides) => {
            let adapter_config = config::load(&cli.global, &overrides)?.to_adapter_config()?;
            let token = camproxy_core::resolve_token(&adapter_config).await?;
            println!("{}", secrecy::ExposeSecret::expose_secret(&token));
            Ok(())
        }

        Command::Config(overrides) => {
            let loaded = config::load(&cli.global, &overrides)?;
            print!("{}", camproxy_config::to_toml(&loaded)?);
            Ok(())
        }

        Command::Completions(args) => {
            use clap::CommandFactory;
            use clap_complete::generate;

            let mut cmd = Cli::command();
            generate(args.shell, &mut cmd, "camproxy", &mut std::io::stdout());
            Ok(())
        }
    }
}

/// Cancel on Ctrl-C or SIGTERM.
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown requested");
    cancel.cancel();
}
