//! Runtime settings resolved from CLI flags, a `.env` file and the process
//! environment, in that order of precedence.

use crate::container::DockerConfig;
use crate::error::{Error, Result};
use crate::paths;
use crate::state::{StoreConfig, DEFAULT_MAX_SESSIONS, DEFAULT_SESSION_TTL_SECS, REAP_INTERVAL_SECS};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_IMAGE: &str = "python:3.10-slim";
pub const DEFAULT_CONTAINER_NAME: &str = "mcp-code-interpreter";
pub const CONTAINER_WORKDIR: &str = "/workspace";
pub const SESSIONS_ROOT: &str = "/workspace/sessions";

/// Values given on the command line. `None` means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub workdir_in: Option<String>,
    pub workdir_out: Option<String>,
    pub image: Option<String>,
    pub container_name: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub max_sessions: Option<usize>,
}

/// Key/value lookups with `.env` entries shadowing the process environment.
#[derive(Debug, Clone, Default)]
pub struct Environment {
    file: HashMap<String, String>,
    process: HashMap<String, String>,
}

impl Environment {
    pub fn new(file: HashMap<String, String>, process: HashMap<String, String>) -> Self {
        Self { file, process }
    }

    /// Read `env_file` if it exists (without exporting it) plus the process
    /// environment.
    pub fn load(env_file: Option<&Path>) -> Result<Self> {
        let mut file = HashMap::new();
        if let Some(path) = env_file.filter(|p| p.exists()) {
            let entries = dotenvy::from_path_iter(path)
                .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
            for entry in entries {
                let (key, value) = entry.map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
                file.insert(key, value);
            }
        }
        Ok(Self::new(file, std::env::vars().collect()))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.file
            .get(key)
            .or_else(|| self.process.get(key))
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        match self.get(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| Error::Config(format!("{key} must be a non-negative integer, got '{raw}'"))),
        }
    }
}

/// Everything that decides a host-side root, kept separate so a per-call
/// override can still win at request time.
#[derive(Debug, Clone)]
pub struct WorkdirSources {
    pub cli: Option<String>,
    pub specific_env: Option<String>,
    pub fallback_env: Option<String>,
    pub cwd: PathBuf,
}

impl WorkdirSources {
    pub fn fixed(root: impl Into<PathBuf>) -> Self {
        Self {
            cli: None,
            specific_env: None,
            fallback_env: None,
            cwd: root.into(),
        }
    }

    pub fn root(&self, per_call: Option<&str>) -> PathBuf {
        paths::select_root(
            per_call,
            self.cli.as_deref(),
            self.specific_env.as_deref(),
            self.fallback_env.as_deref(),
            &self.cwd,
        )
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub docker: DockerConfig,
    pub store: StoreConfig,
    pub reap_interval: Duration,
    pub workdir_in: WorkdirSources,
    pub workdir_out: WorkdirSources,
}

impl Settings {
    pub fn resolve(cli: CliOverrides, env: &Environment, cwd: PathBuf) -> Result<Self> {
        let image = cli
            .image
            .or_else(|| env.get("DOCKER_IMAGE").map(str::to_string))
            .unwrap_or_else(|| DEFAULT_IMAGE.to_string());
        let container_name = cli
            .container_name
            .unwrap_or_else(|| DEFAULT_CONTAINER_NAME.to_string());

        let ttl_secs = match cli.session_ttl_secs {
            Some(secs) => secs,
            None => env.parse("PY_EXEC_SESSION_TTL")?.unwrap_or(DEFAULT_SESSION_TTL_SECS),
        };
        let max_sessions = match cli.max_sessions {
            Some(max) => max,
            None => env.parse("PY_EXEC_SESSION_MAX")?.unwrap_or(DEFAULT_MAX_SESSIONS),
        };
        if max_sessions == 0 {
            return Err(Error::Config("PY_EXEC_SESSION_MAX must be at least 1".to_string()));
        }

        let base = env.get("WORKDIR").map(str::to_string);
        let sources = |cli: Option<String>, key: &str| WorkdirSources {
            cli,
            specific_env: env.get(key).map(str::to_string),
            fallback_env: base.clone(),
            cwd: cwd.clone(),
        };

        Ok(Self {
            docker: DockerConfig {
                container_name,
                image,
                workdir: CONTAINER_WORKDIR.to_string(),
                ..DockerConfig::default()
            },
            store: StoreConfig {
                ttl: Duration::from_secs(ttl_secs),
                max_sessions,
                sessions_root: PathBuf::from(SESSIONS_ROOT),
            },
            reap_interval: Duration::from_secs(REAP_INTERVAL_SECS),
            workdir_in: sources(cli.workdir_in, "WORKDIR_IN"),
            workdir_out: sources(cli.workdir_out, "WORKDIR_OUT"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn env(file: &[(&str, &str)], process: &[(&str, &str)]) -> Environment {
        let map = |pairs: &[(&str, &str)]| {
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>()
        };
        Environment::new(map(file), map(process))
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let settings = Settings::resolve(CliOverrides::default(), &env(&[], &[]), "/cwd".into()).unwrap();
        assert_eq!(settings.docker.image, DEFAULT_IMAGE);
        assert_eq!(settings.store.ttl, Duration::from_secs(600));
        assert_eq!(settings.store.max_sessions, 32);
        assert_eq!(settings.store.sessions_root, PathBuf::from("/workspace/sessions"));
        assert_eq!(settings.workdir_in.root(None), PathBuf::from("/cwd"));
        assert_eq!(settings.workdir_out.root(None), PathBuf::from("/cwd"));
    }

    #[test]
    fn workdirs_follow_precedence() {
        let environment = env(
            &[("WORKDIR_IN", "/file-in")],
            &[("WORKDIR_IN", "/proc-in"), ("WORKDIR", "/base")],
        );
        let cli = CliOverrides {
            workdir_out: Some("/cli-out".to_string()),
            ..CliOverrides::default()
        };
        let settings = Settings::resolve(cli, &environment, "/cwd".into()).unwrap();

        assert_eq!(settings.workdir_in.root(None), PathBuf::from("/file-in"));
        assert_eq!(settings.workdir_out.root(None), PathBuf::from("/cli-out"));
        assert_eq!(settings.workdir_in.root(Some("/call")), PathBuf::from("/call"));

        let only_base = Settings::resolve(CliOverrides::default(), &env(&[], &[("WORKDIR", "/base")]), "/cwd".into())
            .unwrap();
        assert_eq!(only_base.workdir_out.root(None), PathBuf::from("/base"));
    }

    #[test]
    fn session_limits_come_from_environment() {
        let environment = env(&[], &[("PY_EXEC_SESSION_TTL", "30"), ("PY_EXEC_SESSION_MAX", "4")]);
        let settings = Settings::resolve(CliOverrides::default(), &environment, "/".into()).unwrap();
        assert_eq!(settings.store.ttl, Duration::from_secs(30));
        assert_eq!(settings.store.max_sessions, 4);

        let cli = CliOverrides {
            max_sessions: Some(2),
            ..CliOverrides::default()
        };
        assert_eq!(Settings::resolve(cli, &environment, "/".into()).unwrap().store.max_sessions, 2);
    }

    #[test]
    fn bad_numbers_are_config_errors() {
        let environment = env(&[], &[("PY_EXEC_SESSION_TTL", "soon")]);
        let err = Settings::resolve(CliOverrides::default(), &environment, "/".into()).unwrap_err();
        assert!(matches!(err, Error::Config(_)));

        let environment = env(&[], &[("PY_EXEC_SESSION_MAX", "0")]);
        assert!(Settings::resolve(CliOverrides::default(), &environment, "/".into()).is_err());
    }

    #[test]
    fn env_file_entries_are_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".env");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "DOCKER_IMAGE=python:3.12-slim").unwrap();
        writeln!(file, "WORKDIR=/from-file").unwrap();

        let loaded = Environment::load(Some(&path)).unwrap();
        assert_eq!(loaded.get("DOCKER_IMAGE"), Some("python:3.12-slim"));
        assert_eq!(loaded.get("WORKDIR"), Some("/from-file"));

        let missing = Environment::load(Some(&dir.path().join("absent.env"))).unwrap();
        assert_eq!(missing.get("PYBOX_SURELY_UNSET_KEY"), None);
    }
}
