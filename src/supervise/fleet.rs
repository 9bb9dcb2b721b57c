//! The full set of worker slots for one program.

use std::{sync::Arc, time::Duration};

use tokio::time::sleep;

use super::{
    worker::{SpecCell, Worker, WorkerSnapshot},
    SuperviseError,
};
use crate::{config::ProgramSpec, logging::DaemonLog};

/// Spacing between consecutive spawns so a large fleet does not slam shared
/// resources all at once.
const INTER_SPAWN_DELAY: Duration = Duration::from_millis(100);

/// Ordered worker slots for one program; slot N is always instance N. The
/// slot count only changes through `reshape`/`apply_spec`, both driven by
/// the supervisor's reload path.
#[derive(Debug)]
pub struct Fleet {
    program: String,
    spec: Arc<SpecCell>,
    workers: tokio::sync::Mutex<Vec<Arc<Worker>>>,
    log: DaemonLog,
}

impl Fleet {
    pub fn new(spec: Arc<ProgramSpec>, log: DaemonLog) -> Arc<Self> {
        let cell = SpecCell::new(spec.clone());
        let workers = (0..spec.num_procs)
            .map(|index| Worker::new(&spec.name, index, cell.clone(), log.clone()))
            .collect();
        Arc::new(Self {
            program: spec.name.clone(),
            spec: cell,
            workers: tokio::sync::Mutex::new(workers),
            log,
        })
    }

    pub fn name(&self) -> &str {
        &self.program
    }

    pub fn spec(&self) -> Arc<ProgramSpec> {
        self.spec.get()
    }

    /// Starts every idle slot. Slots already Starting/Running are left
    /// alone; the result is success only if every attempted spawn worked.
    pub async fn start_all(&self) -> Result<(), SuperviseError> {
        let workers = self.workers.lock().await.clone();
        let mut first_error = None;
        let mut spawned_previous = false;
        for worker in &workers {
            if spawned_previous {
                sleep(INTER_SPAWN_DELAY).await;
            }
            match worker.start().await {
                Ok(spawned) => spawned_previous = spawned,
                Err(error) => {
                    spawned_previous = false;
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
        }
        match first_error {
            None => Ok(()),
            Some(error) => Err(error),
        }
    }

    /// Stops every active slot, concurrently; returns once all of them have
    /// settled (each stop is internally bounded by the grace period plus the
    /// kill-reap wait).
    pub async fn stop_all(&self, force: bool) {
        let workers = self.workers.lock().await.clone();
        let mut handles = Vec::with_capacity(workers.len());
        for worker in workers {
            handles.push(tokio::spawn(async move { worker.stop(force).await }));
        }
        for handle in handles {
            let _ = handle.await;
        }
    }

    pub async fn restart_all(&self) -> Result<(), SuperviseError> {
        self.stop_all(false).await;
        self.start_all().await
    }

    pub async fn status(&self) -> Vec<WorkerSnapshot> {
        let workers = self.workers.lock().await;
        workers.iter().map(|worker| worker.snapshot()).collect()
    }

    /// Delivers an operator signal to every active slot.
    pub async fn signal_all(&self, signal: nix::sys::signal::Signal) -> Result<(), SuperviseError> {
        let workers = self.workers.lock().await.clone();
        for worker in &workers {
            worker.send_signal(signal)?;
        }
        Ok(())
    }

    /// Applies a cardinality-only spec change: surviving slots keep running
    /// untouched, new slots are created and started, surplus slots are
    /// stopped gracefully and disposed.
    pub async fn reshape(&self, new_spec: Arc<ProgramSpec>) -> Result<(), SuperviseError> {
        self.spec.swap(new_spec.clone());

        let mut workers = self.workers.lock().await;
        let current = workers.len();
        let target = new_spec.num_procs;

        if target > current {
            let mut created = Vec::with_capacity(target - current);
            for index in current..target {
                let worker =
                    Worker::new(&self.program, index, self.spec_cell(), self.log.clone());
                workers.push(worker.clone());
                created.push(worker);
            }
            drop(workers);

            self.log.info(format!(
                "{}: growing from {current} to {target} slots",
                self.program
            ));
            let mut first_error = None;
            for (nth, worker) in created.iter().enumerate() {
                if nth > 0 {
                    sleep(INTER_SPAWN_DELAY).await;
                }
                if let Err(error) = worker.start().await {
                    if first_error.is_none() {
                        first_error = Some(error);
                    }
                }
            }
            match first_error {
                None => Ok(()),
                Some(error) => Err(error),
            }
        } else if target < current {
            let surplus: Vec<_> = workers.drain(target..).collect();
            drop(workers);

            self.log.info(format!(
                "{}: shrinking from {current} to {target} slots",
                self.program
            ));
            let mut handles = Vec::with_capacity(surplus.len());
            for worker in surplus {
                handles.push(tokio::spawn(async move { worker.stop(false).await }));
            }
            for handle in handles {
                let _ = handle.await;
            }
            Ok(())
        } else {
            Ok(())
        }
    }

    /// Installs a replacement spec and resizes the slot vector without
    /// starting anything. Used after a significant-change stop, where the
    /// fleet is idle and the caller decides whether to start it again.
    pub async fn apply_spec(&self, new_spec: Arc<ProgramSpec>) {
        self.spec.swap(new_spec.clone());

        let mut workers = self.workers.lock().await;
        let current = workers.len();
        let target = new_spec.num_procs;
        if target > current {
            for index in current..target {
                workers.push(Worker::new(
                    &self.program,
                    index,
                    self.spec_cell(),
                    self.log.clone(),
                ));
            }
        } else if target < current {
            let surplus: Vec<_> = workers.drain(target..).collect();
            drop(workers);
            // The fleet was stopped before the swap; this only catches
            // stragglers.
            for worker in surplus {
                worker.stop(true).await;
            }
        }
    }

    fn spec_cell(&self) -> Arc<SpecCell> {
        self.spec.clone()
    }
}
