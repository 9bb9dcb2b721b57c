//! Operator diagnostics (tracing) and the daemon's own log file.

use anyhow::{Context, Result};
use chrono::Local;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::PathBuf,
    sync::Arc,
};
use tracing::Level;
use tracing_subscriber::EnvFilter;

static TRACING_INIT: OnceCell<()> = OnceCell::new();

pub fn init_tracing() {
    TRACING_INIT.get_or_init(|| {
        let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::builder()
                .with_default_directive(Level::WARN.into())
                .from_env_lossy()
        });

        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .finish();

        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Error = 0,
    Warning = 1,
    Info = 2,
    Debug = 3,
}

impl LogLevel {
    pub fn label(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
        }
    }
}

/// Append-only line sink for the daemon log. Handles are cheap clones and
/// may be written from any task; entries above the configured verbosity are
/// dropped.
#[derive(Debug, Clone)]
pub struct DaemonLog {
    inner: Arc<Mutex<LogInner>>,
}

impl DaemonLog {
    pub fn open(path: PathBuf, threshold: LogLevel) -> Result<Self> {
        let mut inner = LogInner {
            path,
            threshold,
            file: None,
        };
        inner.ensure_open()?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        let mut guard = self.inner.lock();
        if level > guard.threshold {
            return;
        }
        if let Err(error) = guard.write_line(level, message.as_ref()) {
            tracing::warn!(%error, "failed to write daemon log entry");
        }
    }

    pub fn error(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Error, message);
    }

    pub fn warning(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }

    pub fn flush(&self) {
        let mut guard = self.inner.lock();
        if let Some(file) = guard.file.as_mut() {
            let _ = file.flush();
        }
    }
}

#[derive(Debug)]
struct LogInner {
    path: PathBuf,
    threshold: LogLevel,
    file: Option<File>,
}

impl LogInner {
    fn write_line(&mut self, level: LogLevel, message: &str) -> Result<()> {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let line = format!(
            "[{timestamp}] [{level:<7}] {message}\n",
            level = level.label(),
            message = sanitize_message(message)
        );
        self.ensure_open()?;
        let file = self.file.as_mut().expect("log file open after ensure_open");
        file.write_all(line.as_bytes())
            .with_context(|| format!("writing log line to {:?}", self.path))?;
        Ok(())
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.file.is_some() {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating log directory {:?}", parent.display()))?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening log file {:?}", self.path))?;
        self.file = Some(file);
        Ok(())
    }
}

fn sanitize_message(message: &str) -> String {
    message
        .chars()
        .map(|ch| if ch == '\n' || ch == '\r' { ' ' } else { ch })
        .collect()
}
