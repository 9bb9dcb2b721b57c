//! The supervision engine: fleets, command dispatch, reload reconciliation.

mod fleet;
mod outputs;
mod worker;

use std::{collections::BTreeMap, io, sync::Arc};

use thiserror::Error;
use tokio::sync::RwLock;

pub use fleet::Fleet;
pub use worker::{WorkerSnapshot, WorkerState};

use crate::{
    config::{ProgramName, ProgramSpec},
    logging::DaemonLog,
};

pub type Catalog = BTreeMap<ProgramName, Arc<ProgramSpec>>;

#[derive(Debug, Error)]
pub enum SuperviseError {
    #[error("unknown program '{0}'")]
    UnknownProgram(String),
    #[error("failed to spawn {program}:{index}: {source}")]
    SpawnFailed {
        program: String,
        index: usize,
        #[source]
        source: io::Error,
    },
    #[error("failed to signal {program}:{index}: {message}")]
    SignalFailed {
        program: String,
        index: usize,
        message: String,
    },
}

/// Owns every fleet and the catalog snapshot. The fleet map is the single
/// serialization point: ordinary commands resolve their fleet handle under
/// a short read guard and then work on the clone, while `reload` and
/// `shutdown` hold the write guard for their full duration so no command
/// ever observes a half-applied catalog.
#[derive(Debug)]
pub struct Supervisor {
    fleets: RwLock<BTreeMap<ProgramName, Arc<Fleet>>>,
    log: DaemonLog,
}

impl Supervisor {
    pub fn new(log: DaemonLog) -> Arc<Self> {
        Arc::new(Self {
            fleets: RwLock::new(BTreeMap::new()),
            log,
        })
    }

    /// Installs the boot catalog and starts every autostart program.
    pub async fn boot(&self, catalog: Catalog) {
        let mut autostarts = Vec::new();
        {
            let mut fleets = self.fleets.write().await;
            for (name, spec) in catalog {
                let autostart = spec.autostart;
                let fleet = Fleet::new(spec, self.log.clone());
                if autostart {
                    autostarts.push(fleet.clone());
                }
                fleets.insert(name, fleet);
            }
        }

        for fleet in autostarts {
            if let Err(error) = fleet.start_all().await {
                self.log
                    .error(format!("autostart of '{}' failed: {error}", fleet.name()));
            }
        }
        self.log.info("supervisor booted");
    }

    pub async fn start(&self, name: &str) -> Result<(), SuperviseError> {
        self.fleet(name).await?.start_all().await
    }

    pub async fn stop(&self, name: &str) -> Result<(), SuperviseError> {
        self.fleet(name).await?.stop_all(false).await;
        Ok(())
    }

    pub async fn restart(&self, name: &str) -> Result<(), SuperviseError> {
        self.fleet(name).await?.restart_all().await
    }

    pub async fn start_all(&self) -> Result<(), SuperviseError> {
        let mut first_error = None;
        for fleet in self.all_fleets().await {
            if let Err(error) = fleet.start_all().await {
                if first_error.is_none() {
                    first_error = Some(error);
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    pub async fn stop_all(&self) {
        let fleets = self.all_fleets().await;
        let mut handles = Vec::with_capacity(fleets.len());
        for fleet in fleets {
            handles.push(tokio::spawn(async move { fleet.stop_all(false).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn restart_all(&self) -> Result<(), SuperviseError> {
        self.stop_all().await;
        self.start_all().await
    }

    /// Snapshots across every fleet, ordered by program name then index.
    pub async fn status(&self) -> Vec<WorkerSnapshot> {
        let fleets = self.all_fleets().await;
        let mut all = Vec::new();
        for fleet in fleets {
            all.extend(fleet.status().await);
        }
        all
    }

    pub async fn status_of(&self, name: &str) -> Result<Vec<WorkerSnapshot>, SuperviseError> {
        Ok(self.fleet(name).await?.status().await)
    }

    pub async fn program_spec(&self, name: &str) -> Result<Arc<ProgramSpec>, SuperviseError> {
        Ok(self.fleet(name).await?.spec())
    }

    pub async fn signal(
        &self,
        name: &str,
        signal: nix::sys::signal::Signal,
    ) -> Result<(), SuperviseError> {
        self.fleet(name).await?.signal_all(signal).await
    }

    /// Reconciles the running fleets against a replacement catalog. Holds
    /// the write guard throughout, so the swap is atomic with respect to
    /// every other control command.
    pub async fn reload(&self, catalog: Catalog) {
        let mut fleets = self.fleets.write().await;

        let removed: Vec<_> = fleets
            .keys()
            .filter(|name| !catalog.contains_key(*name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(fleet) = fleets.remove(&name) {
                self.log.info(format!("removing program '{name}'"));
                fleet.stop_all(true).await;
            }
        }

        for (name, new_spec) in catalog {
            let existing = fleets.get(&name).cloned();
            match existing {
                Some(fleet) => {
                    let old_spec = fleet.spec();
                    if old_spec.as_ref() == new_spec.as_ref() {
                        continue;
                    }

                    if old_spec.differs_only_in_cardinality(&new_spec) {
                        if let Err(error) = fleet.reshape(new_spec).await {
                            self.log
                                .error(format!("reshaping '{name}' failed: {error}"));
                        }
                    } else if old_spec.restart_required_by(&new_spec) {
                        self.log
                            .info(format!("program '{name}' changed; restarting"));
                        fleet.stop_all(false).await;
                        fleet.apply_spec(new_spec.clone()).await;
                        if new_spec.autostart {
                            if let Err(error) = fleet.start_all().await {
                                self.log
                                    .error(format!("restart of '{name}' failed: {error}"));
                            }
                        }
                    } else {
                        let was_autostart = old_spec.autostart;
                        fleet.apply_spec(new_spec.clone()).await;
                        if new_spec.autostart && !was_autostart {
                            if let Err(error) = fleet.start_all().await {
                                self.log
                                    .error(format!("autostart of '{name}' failed: {error}"));
                            }
                        }
                    }
                }
                None => {
                    self.log.info(format!("adding program '{name}'"));
                    let autostart = new_spec.autostart;
                    let fleet = Fleet::new(new_spec, self.log.clone());
                    fleets.insert(name.clone(), fleet.clone());
                    if autostart {
                        if let Err(error) = fleet.start_all().await {
                            self.log
                                .error(format!("autostart of '{name}' failed: {error}"));
                        }
                    }
                }
            }
        }
        self.log.info("configuration reloaded");
    }

    /// Stops everything and drops the catalog. Graceful stops run
    /// concurrently and escalate to SIGKILL at each program's grace
    /// deadline, so no child survives this call.
    pub async fn shutdown(&self) {
        let mut fleets = self.fleets.write().await;
        let all: Vec<_> = fleets.values().cloned().collect();
        fleets.clear();

        let mut handles = Vec::with_capacity(all.len());
        for fleet in all {
            handles.push(tokio::spawn(async move { fleet.stop_all(false).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }

        self.log.info("supervisor stopped");
        self.log.flush();
    }

    async fn fleet(&self, name: &str) -> Result<Arc<Fleet>, SuperviseError> {
        let fleets = self.fleets.read().await;
        fleets
            .get(name)
            .cloned()
            .ok_or_else(|| SuperviseError::UnknownProgram(name.to_string()))
    }

    async fn all_fleets(&self) -> Vec<Arc<Fleet>> {
        let fleets = self.fleets.read().await;
        fleets.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RestartPolicy, StopSignal};
    use crate::logging::LogLevel;
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};
    use std::collections::{BTreeMap, BTreeSet};
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::time::{sleep, timeout};

    fn test_log(dir: &std::path::Path) -> DaemonLog {
        DaemonLog::open(dir.join("daemon.log"), LogLevel::Debug).expect("log opens")
    }

    fn spec(name: &str, command: &str, num_procs: usize, autostart: bool) -> Arc<ProgramSpec> {
        Arc::new(ProgramSpec {
            name: name.to_string(),
            command: command.to_string(),
            num_procs,
            autostart,
            restart_policy: RestartPolicy::OnUnexpected,
            expected_exit_codes: BTreeSet::from([0]),
            start_retries: 2,
            start_secs: 1,
            stop_signal: StopSignal::Term,
            stop_secs: 2,
            working_dir: None,
            umask: None,
            env: BTreeMap::new(),
            stdout_path: None,
            stderr_path: None,
            discard_output: false,
        })
    }

    fn catalog(entries: &[Arc<ProgramSpec>]) -> Catalog {
        entries
            .iter()
            .map(|spec| (spec.name.clone(), spec.clone()))
            .collect()
    }

    async fn wait_running(supervisor: &Arc<Supervisor>, name: &str, count: usize) {
        timeout(Duration::from_secs(10), async {
            loop {
                if let Ok(status) = supervisor.status_of(name).await {
                    let running = status
                        .iter()
                        .filter(|s| s.state == WorkerState::Running)
                        .count();
                    if running == count {
                        return;
                    }
                }
                sleep(Duration::from_millis(25)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("'{name}' never reached {count} running workers"));
    }

    fn assert_process_gone(pid: u32) {
        let result = kill(Pid::from_raw(pid as i32), None);
        assert_eq!(result, Err(Errno::ESRCH), "pid {pid} still exists");
    }

    #[tokio::test]
    async fn boot_starts_only_autostart_programs() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[
                spec("auto", "/bin/sleep 30", 1, true),
                spec("manual", "/bin/sleep 30", 1, false),
            ]))
            .await;
        wait_running(&supervisor, "auto", 1).await;

        let manual = supervisor.status_of("manual").await.expect("known program");
        assert!(manual.iter().all(|s| s.state == WorkerState::Stopped));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_program_is_an_error() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));
        supervisor
            .boot(catalog(&[spec("known", "/bin/sleep 30", 1, false)]))
            .await;

        let error = supervisor.start("missing").await.unwrap_err();
        assert!(matches!(error, SuperviseError::UnknownProgram(_)));

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_with_identical_catalog_restarts_nothing() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));
        let entry = spec("svc", "/bin/sleep 30", 2, true);

        supervisor.boot(catalog(&[entry.clone()])).await;
        wait_running(&supervisor, "svc", 2).await;
        let before: Vec<_> = supervisor
            .status_of("svc")
            .await
            .unwrap()
            .iter()
            .map(|s| s.pid)
            .collect();

        supervisor.reload(catalog(&[entry])).await;
        let after: Vec<_> = supervisor
            .status_of("svc")
            .await
            .unwrap()
            .iter()
            .map(|s| s.pid)
            .collect();
        assert_eq!(before, after);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_grows_num_procs_without_touching_survivors() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[spec("w", "/bin/sleep 30", 2, true)]))
            .await;
        wait_running(&supervisor, "w", 2).await;
        let before: Vec<_> = supervisor
            .status_of("w")
            .await
            .unwrap()
            .iter()
            .map(|s| s.pid)
            .collect();

        supervisor
            .reload(catalog(&[spec("w", "/bin/sleep 30", 4, true)]))
            .await;
        wait_running(&supervisor, "w", 4).await;

        let status = supervisor.status_of("w").await.unwrap();
        assert_eq!(status.len(), 4);
        assert_eq!(status[0].pid, before[0]);
        assert_eq!(status[1].pid, before[1]);
        assert_eq!(status[0].restart_count, 0);
        assert_eq!(status[1].restart_count, 0);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_command_change_restarts_with_new_pids() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[spec("svc", "/bin/sleep 30", 1, true)]))
            .await;
        wait_running(&supervisor, "svc", 1).await;
        let before = supervisor.status_of("svc").await.unwrap()[0]
            .pid
            .expect("running pid");

        supervisor
            .reload(catalog(&[spec("svc", "/bin/sleep 60", 1, true)]))
            .await;
        wait_running(&supervisor, "svc", 1).await;
        let after = supervisor.status_of("svc").await.unwrap()[0]
            .pid
            .expect("running pid");

        assert_ne!(before, after);
        assert_eq!(
            supervisor.program_spec("svc").await.unwrap().command,
            "/bin/sleep 60"
        );

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn reload_removes_dropped_programs() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[
                spec("keep", "/bin/sleep 30", 1, true),
                spec("drop", "/bin/sleep 30", 1, true),
            ]))
            .await;
        wait_running(&supervisor, "keep", 1).await;
        wait_running(&supervisor, "drop", 1).await;
        let dropped_pid = supervisor.status_of("drop").await.unwrap()[0]
            .pid
            .expect("running pid");

        supervisor
            .reload(catalog(&[spec("keep", "/bin/sleep 30", 1, true)]))
            .await;

        assert!(matches!(
            supervisor.status_of("drop").await,
            Err(SuperviseError::UnknownProgram(_))
        ));
        assert_process_gone(dropped_pid);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn autostart_flip_to_true_starts_the_fleet() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[spec("svc", "/bin/sleep 30", 1, false)]))
            .await;
        let idle = supervisor.status_of("svc").await.unwrap();
        assert_eq!(idle[0].state, WorkerState::Stopped);

        supervisor
            .reload(catalog(&[spec("svc", "/bin/sleep 30", 1, true)]))
            .await;
        wait_running(&supervisor, "svc", 1).await;

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_leaves_no_children_behind() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[
                spec("a", "/bin/sleep 30", 2, true),
                spec("b", "/bin/sleep 30", 1, true),
            ]))
            .await;
        wait_running(&supervisor, "a", 2).await;
        wait_running(&supervisor, "b", 1).await;

        let pids: Vec<u32> = supervisor
            .status()
            .await
            .iter()
            .filter_map(|s| s.pid)
            .collect();
        assert_eq!(pids.len(), 3);

        supervisor.shutdown().await;

        for pid in pids {
            assert_process_gone(pid);
        }
        assert!(supervisor.status().await.is_empty());
    }

    #[tokio::test]
    async fn double_stop_is_equivalent_to_one() {
        let dir = tempdir().expect("tempdir");
        let supervisor = Supervisor::new(test_log(dir.path()));

        supervisor
            .boot(catalog(&[spec("svc", "/bin/sleep 30", 1, true)]))
            .await;
        wait_running(&supervisor, "svc", 1).await;

        supervisor.stop("svc").await.expect("first stop");
        supervisor.stop("svc").await.expect("second stop");

        let status = supervisor.status_of("svc").await.unwrap();
        assert_eq!(status[0].state, WorkerState::Stopped);

        supervisor.shutdown().await;
    }
}
