mod cli;
mod config;
mod control;
mod logging;
mod signals;
mod supervise;

use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use cli::Cli;
use control::Control;
use logging::DaemonLog;
use signals::DaemonSignal;
use supervise::Supervisor;

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("taskmaster: {error:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = cli.config_path();
    let loaded = config::load_from_path(&config_path)
        .with_context(|| format!("loading configuration from {config_path:?}"))?;

    let global = loaded.config.global.clone();
    let log = DaemonLog::open(global.logfile.clone(), global.loglevel)
        .context("opening the daemon log")?;
    for error in &loaded.rejected {
        log.warning(format!("config: {error}"));
        tracing::warn!(
            program = error.program().unwrap_or("?"),
            %error,
            "ignoring invalid program definition"
        );
    }

    let ctl_listener = TcpListener::bind(global.ctl_listen)
        .await
        .with_context(|| format!("binding control socket on {}", global.ctl_listen))?;
    let http_listener = TcpListener::bind(global.http_listen)
        .await
        .with_context(|| format!("binding http listener on {}", global.http_listen))?;

    let supervisor = Supervisor::new(log.clone());
    log.info(format!(
        "taskmaster {} starting with {} program(s)",
        env!("CARGO_PKG_VERSION"),
        loaded.config.programs.len()
    ));
    supervisor.boot(loaded.config.programs).await;

    let control = Control::new(supervisor.clone(), config_path, global, log.clone());

    let mut daemon_signals =
        signals::install_daemon_handlers().context("installing signal handlers")?;
    {
        let control = control.clone();
        let log = log.clone();
        tokio::spawn(async move {
            while let Some(event) = daemon_signals.recv().await {
                match event {
                    DaemonSignal::Reload => {
                        if let Err(error) = control.reload().await {
                            log.error(format!("reload failed: {error:#}"));
                        }
                    }
                    DaemonSignal::Shutdown => control.begin_shutdown(),
                    DaemonSignal::DumpStatus => control.dump_status().await,
                }
            }
        });
    }

    tokio::spawn(control::socket::serve(ctl_listener, control.clone()));
    tokio::spawn(control::http::serve(http_listener, control.clone()));
    if !cli.daemon {
        tokio::spawn(control::repl::run(control.clone()));
    }

    control.shutdown_token().cancelled().await;
    supervisor.shutdown().await;
    log.info("daemon exited");
    log.flush();
    Ok(())
}
