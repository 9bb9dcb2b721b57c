//! Child stdout/stderr capture: per-instance sink paths and pump tasks.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{self, AsyncRead},
};

use crate::{config::ProgramSpec, logging::DaemonLog};

/// Opened append handles for one spawn. `None` means the stream is drained
/// and dropped.
#[derive(Debug, Default)]
pub struct SinkSet {
    pub stdout: Option<File>,
    pub stderr: Option<File>,
}

/// Computes the sink path for instance `index`: with more than one slot the
/// `-N` suffix goes before the extension (`web.log` → `web-2.log`); a name
/// without an extension gets the suffix appended.
pub fn instance_path(base: &Path, index: usize, num_procs: usize) -> PathBuf {
    if num_procs <= 1 {
        return base.to_path_buf();
    }

    let file_name = base
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or_default();
    let suffixed = match file_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{index}.{ext}"),
        _ => format!("{file_name}-{index}"),
    };
    base.with_file_name(suffixed)
}

/// Opens the configured sinks for one spawn. Open failures are logged and
/// degrade to discarding that stream; they never fail the spawn.
pub async fn open_sinks(spec: &ProgramSpec, index: usize, log: &DaemonLog) -> SinkSet {
    if spec.discard_output {
        return SinkSet::default();
    }

    let mut sinks = SinkSet::default();
    for (configured, slot, stream) in [
        (&spec.stdout_path, &mut sinks.stdout, "stdout"),
        (&spec.stderr_path, &mut sinks.stderr, "stderr"),
    ] {
        let Some(base) = configured else { continue };
        let path = instance_path(base, index, spec.num_procs);
        match open_append(&path).await {
            Ok(file) => *slot = Some(file),
            Err(error) => log.warning(format!(
                "{}:{index}: cannot open {stream} sink {path:?}: {error:#}",
                spec.name
            )),
        }
    }
    sinks
}

async fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating sink directory {:?}", parent.display()))?;
        }
    }

    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening sink {path:?}"))
}

/// Drains one child stream into its sink (or the void) on its own task so
/// supervision never blocks on child output.
pub fn pump_stream<R>(
    program: &str,
    index: usize,
    stream: &'static str,
    reader: R,
    sink: Option<File>,
    log: DaemonLog,
) where
    R: AsyncRead + Unpin + Send + 'static,
{
    let tag = format!("{program}:{index}");
    tokio::spawn(async move {
        let mut reader = reader;
        let result = match sink {
            Some(mut file) => io::copy(&mut reader, &mut file).await,
            None => io::copy(&mut reader, &mut io::sink()).await,
        };
        if let Err(error) = result {
            log.warning(format!("{tag}: error draining {stream}: {error}"));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_instance_path_is_unchanged() {
        let base = Path::new("/var/log/web.log");
        assert_eq!(instance_path(base, 0, 1), PathBuf::from("/var/log/web.log"));
    }

    #[test]
    fn multi_instance_suffix_goes_before_extension() {
        let base = Path::new("/var/log/web.log");
        assert_eq!(
            instance_path(base, 0, 3),
            PathBuf::from("/var/log/web-0.log")
        );
        assert_eq!(
            instance_path(base, 2, 3),
            PathBuf::from("/var/log/web-2.log")
        );
    }

    #[test]
    fn extensionless_path_gets_suffix_appended() {
        let base = Path::new("/var/log/web");
        assert_eq!(instance_path(base, 1, 2), PathBuf::from("/var/log/web-1"));
    }

    #[test]
    fn hidden_file_without_stem_keeps_whole_name() {
        let base = Path::new("/var/log/.web");
        assert_eq!(instance_path(base, 1, 2), PathBuf::from("/var/log/.web-1"));
    }
}
