use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
};

use serde_yaml::Value;

use super::{
    error::{ConfigError, ConfigResult},
    model::{Config, GlobalConfig, ProgramName, ProgramSpec, RestartPolicy, StopSignal},
    raw::{RawConfig, RawGlobal, RawProgram},
};
use crate::logging::LogLevel;

const MAX_UMASK: u32 = 0o777;

/// A parsed catalog plus the per-program validation failures the loader
/// decided to tolerate. Callers surface `rejected` as warnings.
#[derive(Debug)]
pub struct Loaded {
    pub config: Config,
    pub rejected: Vec<ConfigError>,
}

pub fn load_from_path<P: AsRef<Path>>(path: P) -> ConfigResult<Loaded> {
    let path_ref = path.as_ref();
    let contents = fs::read_to_string(path_ref).map_err(|source| ConfigError::ReadFailure {
        path: path_ref.to_path_buf(),
        source,
    })?;
    load_from_str(path_ref, &contents)
}

pub fn load_from_str(config_path: &Path, contents: &str) -> ConfigResult<Loaded> {
    let raw: RawConfig = serde_yaml::from_str(contents)?;
    convert_raw_config(config_path, raw)
}

fn convert_raw_config(config_path: &Path, raw: RawConfig) -> ConfigResult<Loaded> {
    if raw.programs.is_empty() {
        return Err(ConfigError::NoPrograms);
    }

    let global = convert_global(config_path, raw.global)?;

    let mut programs = BTreeMap::new();
    let mut rejected = Vec::new();
    for (name, raw_program) in raw.programs {
        match convert_program(config_path, &global, name.clone(), raw_program) {
            Ok(spec) => {
                programs.insert(name, Arc::new(spec));
            }
            Err(error) => rejected.push(error),
        }
    }

    if programs.is_empty() {
        return Err(ConfigError::NoValidPrograms);
    }

    Ok(Loaded {
        config: Config { global, programs },
        rejected,
    })
}

fn convert_global(config_path: &Path, raw: RawGlobal) -> ConfigResult<GlobalConfig> {
    let mut global = GlobalConfig::default();

    global.logdir = raw
        .logdir
        .map(|value| resolve_relative_path(config_path, value))
        .unwrap_or_else(|| config_dir(config_path));

    global.logfile = match raw.logfile {
        Some(value) => resolve_relative_path(config_path, value),
        None => global.logdir.join("taskmaster.log"),
    };

    if let Some(level) = raw.loglevel {
        global.loglevel = match level {
            0 => LogLevel::Error,
            1 => LogLevel::Warning,
            2 => LogLevel::Info,
            3 => LogLevel::Debug,
            other => return Err(ConfigError::LogLevelOutOfRange { value: other }),
        };
    }

    if let Some(addr) = raw.ctlserver {
        global.ctl_listen = parse_listen_addr("ctlserver", &addr)?;
    }
    if let Some(addr) = raw.httpserver {
        global.http_listen = parse_listen_addr("httpserver", &addr)?;
    }

    Ok(global)
}

fn parse_listen_addr(field: &'static str, value: &str) -> ConfigResult<SocketAddr> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidListenAddr {
            field,
            value: value.to_string(),
        })
}

fn convert_program(
    config_path: &Path,
    global: &GlobalConfig,
    name: ProgramName,
    raw: RawProgram,
) -> ConfigResult<ProgramSpec> {
    if name.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            program: name.clone(),
            field: "name",
            value: name,
        });
    }

    let command = raw.cmd.ok_or_else(|| ConfigError::MissingField {
        program: name.clone(),
        field: "cmd",
    })?;
    if command.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            program: name,
            field: "cmd",
            value: command,
        });
    }

    let num_procs = raw.numprocs.unwrap_or(1);
    if num_procs < 1 {
        return Err(ConfigError::BelowMinimum {
            program: name,
            field: "numprocs",
            minimum: 1,
        });
    }

    let start_secs = raw.starttime.unwrap_or(1);
    if start_secs < 1 {
        return Err(ConfigError::BelowMinimum {
            program: name,
            field: "starttime",
            minimum: 1,
        });
    }

    let stop_secs = raw.stoptime.unwrap_or(10);
    if stop_secs < 1 {
        return Err(ConfigError::BelowMinimum {
            program: name,
            field: "stoptime",
            minimum: 1,
        });
    }

    let restart_policy = convert_restart_policy(&name, raw.autorestart)?;
    let expected_exit_codes = convert_exit_codes(&name, raw.exitcodes.into_vec())?;
    let stop_signal = convert_stop_signal(&name, raw.stopsignal)?;
    let umask = convert_umask(&name, raw.umask)?;
    let env = convert_env(&name, raw.env)?;

    let working_dir = raw
        .workingdir
        .map(|value| resolve_relative_path(config_path, value));
    let stdout_path = raw
        .stdout
        .map(|value| resolve_under_dir(&global.logdir, value));
    let stderr_path = raw
        .stderr
        .map(|value| resolve_under_dir(&global.logdir, value));

    Ok(ProgramSpec {
        command,
        num_procs: num_procs as usize,
        autostart: raw.autostart.unwrap_or(true),
        restart_policy,
        expected_exit_codes,
        start_retries: raw.startretries.unwrap_or(3) as u32,
        start_secs,
        stop_signal,
        stop_secs,
        working_dir,
        umask,
        env,
        stdout_path,
        stderr_path,
        discard_output: raw.discardoutput.unwrap_or(false),
        name,
    })
}

fn convert_restart_policy(program: &str, value: Option<Value>) -> ConfigResult<RestartPolicy> {
    let Some(value) = value else {
        return Ok(RestartPolicy::OnUnexpected);
    };

    match value {
        Value::Bool(true) => Ok(RestartPolicy::Always),
        Value::Bool(false) => Ok(RestartPolicy::Never),
        Value::String(text) => match text.trim().to_ascii_lowercase().as_str() {
            "true" | "always" => Ok(RestartPolicy::Always),
            "false" | "never" => Ok(RestartPolicy::Never),
            "unexpected" => Ok(RestartPolicy::OnUnexpected),
            other => Err(ConfigError::UnknownRestartPolicy {
                program: program.to_string(),
                value: other.to_string(),
            }),
        },
        other => Err(ConfigError::UnknownRestartPolicy {
            program: program.to_string(),
            value: scalar_to_string(&other),
        }),
    }
}

fn convert_exit_codes(program: &str, codes: Vec<i64>) -> ConfigResult<BTreeSet<i32>> {
    if codes.is_empty() {
        return Ok(BTreeSet::from([0]));
    }

    let mut set = BTreeSet::new();
    for code in codes {
        let code = i32::try_from(code).map_err(|_| ConfigError::InvalidValue {
            program: program.to_string(),
            field: "exitcodes",
            value: code.to_string(),
        })?;
        set.insert(code);
    }
    Ok(set)
}

fn convert_stop_signal(program: &str, value: Option<String>) -> ConfigResult<StopSignal> {
    let Some(value) = value else {
        return Ok(StopSignal::Term);
    };

    StopSignal::parse(&value).ok_or_else(|| ConfigError::UnknownStopSignal {
        program: program.to_string(),
        value,
    })
}

fn convert_umask(program: &str, value: Option<Value>) -> ConfigResult<Option<u32>> {
    let Some(value) = value else {
        return Ok(None);
    };

    let parsed = match &value {
        // Plain YAML numbers lose leading zeros, so they are decimal.
        Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(text) => {
            let trimmed = text.trim();
            if trimmed.len() > 1 && trimmed.starts_with('0') {
                let digits = trimmed.trim_start_matches('0');
                if digits.is_empty() {
                    Some(0)
                } else {
                    u32::from_str_radix(digits, 8).ok()
                }
            } else if trimmed == "0" {
                Some(0)
            } else {
                trimmed.parse::<u32>().ok()
            }
        }
        _ => None,
    };

    let mask = parsed.ok_or_else(|| ConfigError::InvalidValue {
        program: program.to_string(),
        field: "umask",
        value: scalar_to_string(&value),
    })?;

    if mask > MAX_UMASK {
        return Err(ConfigError::UmaskOutOfRange {
            program: program.to_string(),
            value: scalar_to_string(&value),
        });
    }

    Ok(Some(mask))
}

fn convert_env(program: &str, map: BTreeMap<String, Value>) -> ConfigResult<BTreeMap<String, String>> {
    let mut env = BTreeMap::new();
    for (key, value) in map {
        let rendered = match value {
            Value::String(text) => text,
            Value::Number(number) => number.to_string(),
            Value::Bool(flag) => flag.to_string(),
            other => {
                return Err(ConfigError::InvalidValue {
                    program: program.to_string(),
                    field: "env",
                    value: format!("{key}: {}", scalar_to_string(&other)),
                });
            }
        };
        env.insert(key, rendered);
    }
    Ok(env)
}

fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::String(text) => text.clone(),
        other => serde_yaml::to_string(other)
            .unwrap_or_default()
            .trim_end()
            .to_string(),
    }
}

fn config_dir(config_path: &Path) -> PathBuf {
    if config_path.is_dir() {
        config_path.to_path_buf()
    } else {
        config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

fn resolve_relative_path(config_path: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }
    config_dir(config_path).join(path)
}

fn resolve_under_dir(dir: &Path, value: String) -> PathBuf {
    let path = PathBuf::from(value);
    if path.is_absolute() {
        return path;
    }
    dir.join(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture_path() -> &'static Path {
        Path::new("/tmp/taskmaster/taskmaster.yaml")
    }

    #[test]
    fn parses_sample_configuration() {
        let yaml = r#"
global:
  logfile: daemon.log
  loglevel: 3
  logdir: logs
  ctlserver: 127.0.0.1:9191
  httpserver: 127.0.0.1:8181

programs:
  web:
    cmd: /usr/bin/python3 -m http.server 8000
    numprocs: 2
    autostart: true
    autorestart: unexpected
    exitcodes: [0, 2]
    startretries: 5
    starttime: 3
    stopsignal: USR1
    stoptime: 7
    workingdir: /srv/web
    umask: "022"
    stdout: web.out
    stderr: /var/log/web.err
    env:
      PORT: 8000
      DEBUG: "false"
  cleaner:
    cmd: /bin/rm -rf /tmp/cache
    autorestart: never
    autostart: false
    discardoutput: true
"#;

        let loaded = load_from_str(fixture_path(), yaml).expect("config parses");
        assert!(loaded.rejected.is_empty());

        let config = loaded.config;
        assert_eq!(config.global.logdir, PathBuf::from("/tmp/taskmaster/logs"));
        assert_eq!(
            config.global.logfile,
            PathBuf::from("/tmp/taskmaster/daemon.log")
        );
        assert_eq!(config.global.loglevel, LogLevel::Debug);
        assert_eq!(config.global.ctl_listen, "127.0.0.1:9191".parse().unwrap());
        assert_eq!(config.global.http_listen, "127.0.0.1:8181".parse().unwrap());

        let web = &config.programs["web"];
        assert_eq!(web.command, "/usr/bin/python3 -m http.server 8000");
        assert_eq!(web.num_procs, 2);
        assert!(web.autostart);
        assert_eq!(web.restart_policy, RestartPolicy::OnUnexpected);
        assert_eq!(web.expected_exit_codes, BTreeSet::from([0, 2]));
        assert_eq!(web.start_retries, 5);
        assert_eq!(web.start_secs, 3);
        assert_eq!(web.stop_signal, StopSignal::Usr1);
        assert_eq!(web.stop_secs, 7);
        assert_eq!(web.working_dir.as_deref(), Some(Path::new("/srv/web")));
        assert_eq!(web.umask, Some(0o22));
        assert_eq!(
            web.stdout_path.as_deref(),
            Some(Path::new("/tmp/taskmaster/logs/web.out"))
        );
        assert_eq!(
            web.stderr_path.as_deref(),
            Some(Path::new("/var/log/web.err"))
        );
        assert_eq!(web.env["PORT"], "8000");
        assert_eq!(web.env["DEBUG"], "false");
        assert!(!web.discard_output);

        let cleaner = &config.programs["cleaner"];
        assert_eq!(cleaner.restart_policy, RestartPolicy::Never);
        assert!(!cleaner.autostart);
        assert!(cleaner.discard_output);
        // Defaults.
        assert_eq!(cleaner.num_procs, 1);
        assert_eq!(cleaner.expected_exit_codes, BTreeSet::from([0]));
        assert_eq!(cleaner.start_retries, 3);
        assert_eq!(cleaner.start_secs, 1);
        assert_eq!(cleaner.stop_signal, StopSignal::Term);
        assert_eq!(cleaner.stop_secs, 10);
    }

    #[test]
    fn keeps_valid_programs_and_reports_invalid_ones() {
        let yaml = r#"
programs:
  good:
    cmd: /bin/sleep 30
  broken:
    cmd: /bin/sleep 30
    stopsignal: NOPE
  nocmd:
    numprocs: 2
"#;

        let loaded = load_from_str(fixture_path(), yaml).expect("valid subset loads");
        assert_eq!(loaded.config.programs.len(), 1);
        assert!(loaded.config.programs.contains_key("good"));
        assert_eq!(loaded.rejected.len(), 2);

        let mut rejected_programs: Vec<_> = loaded
            .rejected
            .iter()
            .filter_map(|error| error.program())
            .collect();
        rejected_programs.sort();
        assert_eq!(rejected_programs, vec!["broken", "nocmd"]);
    }

    #[test]
    fn fails_when_no_program_validates() {
        let yaml = r#"
programs:
  broken:
    numprocs: 0
"#;
        let error = load_from_str(fixture_path(), yaml).unwrap_err();
        assert!(matches!(error, ConfigError::NoValidPrograms));
    }

    #[test]
    fn fails_without_programs_section() {
        let error = load_from_str(fixture_path(), "global: {}\n").unwrap_err();
        assert!(matches!(error, ConfigError::NoPrograms));
    }

    #[test]
    fn autorestart_accepts_booleans_and_keywords() {
        for (value, expected) in [
            ("true", RestartPolicy::Always),
            ("always", RestartPolicy::Always),
            ("false", RestartPolicy::Never),
            ("never", RestartPolicy::Never),
            ("unexpected", RestartPolicy::OnUnexpected),
        ] {
            let yaml = format!("programs:\n  p:\n    cmd: /bin/true\n    autorestart: {value}\n");
            let loaded = load_from_str(fixture_path(), &yaml).expect("parses");
            assert_eq!(loaded.config.programs["p"].restart_policy, expected);
        }
    }

    #[test]
    fn umask_accepts_decimal_and_octal_strings() {
        let yaml = "programs:\n  p:\n    cmd: /bin/true\n    umask: 18\n";
        let loaded = load_from_str(fixture_path(), yaml).expect("parses");
        assert_eq!(loaded.config.programs["p"].umask, Some(18));

        let yaml = "programs:\n  p:\n    cmd: /bin/true\n    umask: \"077\"\n";
        let loaded = load_from_str(fixture_path(), yaml).expect("parses");
        assert_eq!(loaded.config.programs["p"].umask, Some(0o77));

        let yaml = "programs:\n  p:\n    cmd: /bin/true\n    umask: 512\n";
        let error = load_from_str(fixture_path(), yaml).unwrap_err();
        assert!(matches!(error, ConfigError::NoValidPrograms));
    }

    #[test]
    fn exitcodes_scalar_becomes_singleton_set() {
        let yaml = "programs:\n  p:\n    cmd: /bin/true\n    exitcodes: 2\n";
        let loaded = load_from_str(fixture_path(), yaml).expect("parses");
        assert_eq!(
            loaded.config.programs["p"].expected_exit_codes,
            BTreeSet::from([2])
        );
    }

    #[test]
    fn rejects_malformed_yaml() {
        let error = load_from_str(fixture_path(), "programs: [not a map").unwrap_err();
        assert!(matches!(error, ConfigError::Parse(_)));
    }
}
