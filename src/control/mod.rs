//! Control façade shared by the REPL, the line socket and the HTTP API.

pub mod http;
pub mod repl;
pub mod socket;

use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::{
    config::{self, GlobalConfig},
    logging::DaemonLog,
    supervise::{Supervisor, SuperviseError, WorkerSnapshot},
};

/// Thin handle the adapters call into. All lifecycle work is delegated to
/// the supervisor; the façade only adds catalog re-reading for `reload`,
/// the `all` target expansion, and shutdown coordination.
#[derive(Debug)]
pub struct Control {
    supervisor: Arc<Supervisor>,
    config_path: PathBuf,
    boot_global: GlobalConfig,
    log: DaemonLog,
    shutdown: CancellationToken,
}

impl Control {
    pub fn new(
        supervisor: Arc<Supervisor>,
        config_path: PathBuf,
        boot_global: GlobalConfig,
        log: DaemonLog,
    ) -> Arc<Self> {
        Arc::new(Self {
            supervisor,
            config_path,
            boot_global,
            log,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn supervisor(&self) -> &Arc<Supervisor> {
        &self.supervisor
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Signals the daemon to tear down. The actual teardown runs in main,
    /// after every adapter has had a chance to flush its reply.
    pub fn begin_shutdown(&self) {
        self.log.info("shutdown requested");
        self.shutdown.cancel();
    }

    pub async fn start_target(&self, target: &str) -> Result<(), SuperviseError> {
        if target == "all" {
            self.supervisor.start_all().await
        } else {
            self.supervisor.start(target).await
        }
    }

    pub async fn stop_target(&self, target: &str) -> Result<(), SuperviseError> {
        if target == "all" {
            self.supervisor.stop_all().await;
            Ok(())
        } else {
            self.supervisor.stop(target).await
        }
    }

    pub async fn restart_target(&self, target: &str) -> Result<(), SuperviseError> {
        if target == "all" {
            self.supervisor.restart_all().await
        } else {
            self.supervisor.restart(target).await
        }
    }

    /// Re-reads the config file and reconciles the running fleets against
    /// it. Program-level validation failures are warnings; a broken file is
    /// an error and leaves the running catalog untouched.
    pub async fn reload(&self) -> Result<()> {
        let loaded = config::load_from_path(&self.config_path)
            .with_context(|| format!("reloading {:?}", self.config_path))?;
        for error in &loaded.rejected {
            self.log.warning(format!("config: {error}"));
        }
        if loaded.config.global != self.boot_global {
            self.log
                .warning("global settings changed; restart the daemon to apply them");
        }
        self.supervisor.reload(loaded.config.programs).await;
        Ok(())
    }

    /// USR1 binding: one status line per worker into the daemon log.
    pub async fn dump_status(&self) {
        let snapshots = self.supervisor.status().await;
        self.log
            .info(format!("status dump ({} workers)", snapshots.len()));
        for snapshot in &snapshots {
            self.log.info(format_status_line(snapshot));
        }
    }
}

/// `<name>-<index> (pid <pid>): <State>[, up for <duration>]`
pub fn format_status_line(snapshot: &WorkerSnapshot) -> String {
    let ident = format!("{}-{}", snapshot.program, snapshot.index);
    match snapshot.pid {
        Some(pid) => {
            let mut line = format!("{ident} (pid {pid}): {}", snapshot.state.as_str());
            if let Some(uptime) = snapshot.uptime {
                line.push_str(", up for ");
                line.push_str(&format_uptime(uptime));
            }
            line
        }
        None => format!("{ident}: {}", snapshot.state.as_str()),
    }
}

pub fn format_uptime(uptime: Duration) -> String {
    let total = uptime.as_secs();
    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let seconds = total % 60;
    if hours > 0 {
        format!("{hours}h {minutes}m {seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}
