//! Line-oriented control socket: greeting, `> ` prompt, one command per
//! line, one line per status entry.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    time::sleep,
};

use super::{format_status_line, Control};

const GREETING: &str = "taskmaster control socket";

pub async fn serve(listener: TcpListener, control: Arc<Control>) {
    let token = control.shutdown_token();
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(%peer, "control connection opened");
                    let control = control.clone();
                    tokio::spawn(async move {
                        if let Err(error) = handle_connection(stream, control).await {
                            tracing::debug!(%error, "control connection closed");
                        }
                    });
                }
                Err(error) => {
                    tracing::warn!(%error, "failed to accept control connection");
                    sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn handle_connection(stream: TcpStream, control: Arc<Control>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();
    let token = control.shutdown_token();

    writer.write_all(GREETING.as_bytes()).await?;
    writer.write_all(b"\n").await?;

    loop {
        writer.write_all(b"> ").await?;

        let line = tokio::select! {
            _ = token.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };

        match execute(&control, line.trim()).await {
            Reply::Lines(text) => {
                writer.write_all(text.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
            Reply::Empty => {}
            Reply::Close(text) => {
                if !text.is_empty() {
                    writer.write_all(text.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }
                break;
            }
        }
    }

    Ok(())
}

enum Reply {
    Lines(String),
    Empty,
    Close(String),
}

async fn execute(control: &Arc<Control>, input: &str) -> Reply {
    let mut words = input.split_whitespace();
    let Some(command) = words.next() else {
        return Reply::Empty;
    };
    let argument = words.next();

    match (command, argument) {
        ("status", None) => {
            let snapshots = control.supervisor().status().await;
            if snapshots.is_empty() {
                Reply::Lines("no programs configured".to_string())
            } else {
                let lines: Vec<_> = snapshots.iter().map(format_status_line).collect();
                Reply::Lines(lines.join("\n"))
            }
        }
        ("start", Some(name)) => match control.supervisor().start(name).await {
            Ok(()) => Reply::Lines(format!("Started {name}")),
            Err(_) => Reply::Lines("start failed".to_string()),
        },
        ("stop", Some(name)) => match control.supervisor().stop(name).await {
            Ok(()) => Reply::Lines(format!("Stopped {name}")),
            Err(_) => Reply::Lines("stop failed".to_string()),
        },
        ("restart", Some(name)) => match control.supervisor().restart(name).await {
            Ok(()) => Reply::Lines(format!("Restarted {name}")),
            Err(_) => Reply::Lines("restart failed".to_string()),
        },
        ("reload", None) => match control.reload().await {
            Ok(()) => Reply::Lines("Configuration reloaded".to_string()),
            Err(_) => Reply::Lines("reload failed".to_string()),
        },
        ("shutdown", None) => {
            control.begin_shutdown();
            Reply::Close("shutting down".to_string())
        }
        ("help", None) => Reply::Lines(
            [
                "status                 list every worker",
                "start <name>           start a program",
                "stop <name>            stop a program",
                "restart <name>         restart a program",
                "reload                 re-read the configuration",
                "shutdown               stop the daemon",
                "exit | quit            close this connection",
            ]
            .join("\n"),
        ),
        ("exit", None) | ("quit", None) => Reply::Close(String::new()),
        _ => Reply::Lines("Unknown command".to_string()),
    }
}
