//! Signal plumbing: sending to children and daemon-level bindings.

use anyhow::{anyhow, Result};
use nix::{
    errno::Errno,
    sys::signal::{kill, Signal},
    unistd::Pid,
};
use tokio::{
    signal::unix::{signal, SignalKind},
    sync::mpsc,
};

use crate::config::StopSignal;

pub fn to_unix_signal(stop_signal: StopSignal) -> Signal {
    match stop_signal {
        StopSignal::Hup => Signal::SIGHUP,
        StopSignal::Int => Signal::SIGINT,
        StopSignal::Quit => Signal::SIGQUIT,
        StopSignal::Term => Signal::SIGTERM,
        StopSignal::Usr1 => Signal::SIGUSR1,
        StopSignal::Usr2 => Signal::SIGUSR2,
    }
}

/// Sends `signal` to `pid`. A process that already vanished is not an
/// error; anything else is surfaced to the caller.
pub fn send_signal(pid: u32, signal: Signal) -> Result<()> {
    match kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => Ok(()),
        Err(err) if err == Errno::ESRCH => Ok(()),
        Err(err) => Err(anyhow!(
            "failed to send {:?} to pid {}: {}",
            signal,
            pid,
            err
        )),
    }
}

pub fn force_kill(pid: u32) -> Result<()> {
    send_signal(pid, Signal::SIGKILL)
}

/// Daemon-level reactions to OS signals.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonSignal {
    Reload,
    Shutdown,
    DumpStatus,
}

/// Installs the daemon signal bindings (HUP → reload, TERM/INT → shutdown,
/// USR1 → status dump) and forwards them onto a channel consumed from a
/// normal task context, never inside the OS handler.
pub fn install_daemon_handlers() -> Result<mpsc::Receiver<DaemonSignal>> {
    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = hangup.recv() => DaemonSignal::Reload,
                _ = terminate.recv() => DaemonSignal::Shutdown,
                _ = interrupt.recv() => DaemonSignal::Shutdown,
                _ = user1.recv() => DaemonSignal::DumpStatus,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    Ok(rx)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stop_signals_map_to_their_unix_counterparts() {
        assert_eq!(to_unix_signal(StopSignal::Term), Signal::SIGTERM);
        assert_eq!(to_unix_signal(StopSignal::Hup), Signal::SIGHUP);
        assert_eq!(to_unix_signal(StopSignal::Usr2), Signal::SIGUSR2);
    }

    #[test]
    fn sending_to_a_vanished_pid_is_not_an_error() {
        // Max pid space on Linux defaults to ~4 million; this one is
        // effectively guaranteed unused.
        assert!(send_signal(0x3ffffff1, Signal::SIGTERM).is_ok());
    }
}
