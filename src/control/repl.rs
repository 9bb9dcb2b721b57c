//! Interactive shell attached to the daemon's stdio.

use std::sync::Arc;

use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{format_status_line, Control};
use crate::config::{ProgramSpec, StopSignal};
use crate::signals;

const PROMPT: &str = "taskmaster> ";

/// Runs until `exit`/`quit`, end of input, or daemon shutdown. Leaving the
/// shell does not stop the daemon; `shutdown` does.
pub async fn run(control: Arc<Control>) {
    let mut lines = BufReader::new(io::stdin()).lines();
    let mut stdout = io::stdout();
    let token = control.shutdown_token();

    loop {
        if stdout.write_all(PROMPT.as_bytes()).await.is_err() {
            break;
        }
        let _ = stdout.flush().await;

        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => line,
                Ok(None) | Err(_) => break,
            },
        };

        match execute(&control, line.trim()).await {
            ReplFlow::Continue(output) => {
                if !output.is_empty() {
                    println!("{output}");
                }
            }
            ReplFlow::Leave => break,
        }
    }
}

enum ReplFlow {
    Continue(String),
    Leave,
}

async fn execute(control: &Arc<Control>, input: &str) -> ReplFlow {
    let mut words = input.split_whitespace();
    let Some(command) = words.next() else {
        return ReplFlow::Continue(String::new());
    };
    let first = words.next();
    let second = words.next();

    let output = match (command, first, second) {
        ("status", None, _) => render_status(control, None).await,
        ("status", Some(name), _) => render_status(control, Some(name)).await,
        ("start", Some(target), _) => match control.start_target(target).await {
            Ok(()) => format!("Started {target}"),
            Err(error) => format!("start failed: {error}"),
        },
        ("stop", Some(target), _) => match control.stop_target(target).await {
            Ok(()) => format!("Stopped {target}"),
            Err(error) => format!("stop failed: {error}"),
        },
        ("restart", Some(target), _) => match control.restart_target(target).await {
            Ok(()) => format!("Restarted {target}"),
            Err(error) => format!("restart failed: {error}"),
        },
        ("reload", None, _) => match control.reload().await {
            Ok(()) => "Configuration reloaded".to_string(),
            Err(error) => format!("reload failed: {error:#}"),
        },
        ("config", Some(name), _) => match control.supervisor().program_spec(name).await {
            Ok(spec) => render_spec(&spec),
            Err(error) => format!("config failed: {error}"),
        },
        ("signal", Some(name), Some(signal_name)) => match StopSignal::parse(signal_name) {
            Some(stop_signal) => {
                let signal = signals::to_unix_signal(stop_signal);
                match control.supervisor().signal(name, signal).await {
                    Ok(()) => format!("Sent {} to {name}", stop_signal.as_str()),
                    Err(error) => format!("signal failed: {error}"),
                }
            }
            None => format!("unknown signal '{signal_name}'"),
        },
        ("shutdown", None, _) => {
            control.begin_shutdown();
            return ReplFlow::Leave;
        }
        ("exit", None, _) | ("quit", None, _) => return ReplFlow::Leave,
        ("help", topic, _) => help(topic),
        ("version", None, _) => env!("CARGO_PKG_VERSION").to_string(),
        _ => "Unknown command (try 'help')".to_string(),
    };

    ReplFlow::Continue(output)
}

async fn render_status(control: &Arc<Control>, name: Option<&str>) -> String {
    let snapshots = match name {
        Some(name) => match control.supervisor().status_of(name).await {
            Ok(snapshots) => snapshots,
            Err(error) => return format!("status failed: {error}"),
        },
        None => control.supervisor().status().await,
    };

    if snapshots.is_empty() {
        return "no programs configured".to_string();
    }
    let lines: Vec<_> = snapshots.iter().map(format_status_line).collect();
    lines.join("\n")
}

fn render_spec(spec: &ProgramSpec) -> String {
    let exit_codes: Vec<_> = spec
        .expected_exit_codes
        .iter()
        .map(|code| code.to_string())
        .collect();
    let env: Vec<_> = spec
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    let mut out = vec![
        format!("program {}", spec.name),
        format!("  cmd:           {}", spec.command),
        format!("  numprocs:      {}", spec.num_procs),
        format!("  autostart:     {}", spec.autostart),
        format!("  autorestart:   {}", spec.restart_policy.as_str()),
        format!("  exitcodes:     [{}]", exit_codes.join(", ")),
        format!("  startretries:  {}", spec.start_retries),
        format!("  starttime:     {}s", spec.start_secs),
        format!("  stopsignal:    {}", spec.stop_signal.as_str()),
        format!("  stoptime:      {}s", spec.stop_secs),
    ];
    if let Some(dir) = &spec.working_dir {
        out.push(format!("  workingdir:    {}", dir.display()));
    }
    if let Some(mask) = spec.umask {
        out.push(format!("  umask:         {mask:03o}"));
    }
    if let Some(path) = &spec.stdout_path {
        out.push(format!("  stdout:        {}", path.display()));
    }
    if let Some(path) = &spec.stderr_path {
        out.push(format!("  stderr:        {}", path.display()));
    }
    if spec.discard_output {
        out.push("  discardoutput: true".to_string());
    }
    if !env.is_empty() {
        out.push(format!("  env:           {}", env.join(" ")));
    }
    out.join("\n")
}

fn help(topic: Option<&str>) -> String {
    match topic {
        None => [
            "status [name]          list workers, optionally for one program",
            "start <name|all>       start a program or everything",
            "stop <name|all>        stop a program or everything",
            "restart <name|all>     restart a program or everything",
            "reload                 re-read the configuration file",
            "config <name>          show a program's configuration",
            "signal <name> <SIG>    send a signal to a program's workers",
            "shutdown               stop all programs and exit the daemon",
            "exit | quit            leave this shell",
            "version                print the daemon version",
        ]
        .join("\n"),
        Some("status") => "status [name] — one line per worker: state, pid and uptime".to_string(),
        Some("start") => "start <name|all> — start idle workers; running ones are untouched".to_string(),
        Some("stop") => "stop <name|all> — graceful stop, escalating to SIGKILL after stoptime".to_string(),
        Some("restart") => "restart <name|all> — stop then start".to_string(),
        Some("reload") => {
            "reload — re-read the config; only significantly changed programs restart".to_string()
        }
        Some("config") => "config <name> — print the validated program definition".to_string(),
        Some("signal") => {
            "signal <name> <SIG> — SIG is one of HUP INT QUIT TERM USR1 USR2".to_string()
        }
        Some("shutdown") => "shutdown — stop every program and exit".to_string(),
        Some(other) => format!("no help for '{other}'"),
    }
}
