//! Operator settings loaded from `config.yaml`.
//!
//! Every field has a default, so an empty or missing file is valid. The SSH
//! secret never lives here.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{HpcError, Result};
use crate::orchestrator::OrchestratorConfig;
use crate::remote::{Credentials, Secret};
use crate::scheduler::JobKind;
use crate::tunnel::{TunnelOptions, TunnelProgram};

/// Environment variable overriding the config file location.
pub const CONFIG_ENV: &str = "HPCSERVE_CONFIG";


/// Login host coordinates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            host: String::new(),
            port: 22,
            username: String::new(),
        }
    }
}


#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cluster: ClusterSettings,

    /// Seconds between scheduler polls.
    pub poll_interval_secs: u64,

    /// Upper bound on one remote command round-trip.
    pub command_timeout_secs: u64,

    pub tunnel_ready_timeout_secs: u64,
    pub tunnel_stop_grace_secs: u64,

    /// Give up on a job that has not started after this long.
    pub queue_timeout_secs: Option<u64>,

    /// Consecutive NotFound polls tolerated right after submission.
    pub max_not_found_polls: u32,

    /// Local forwarding port. Defaults to the kind's service port.
    pub local_port: Option<u16>,

    /// Tunnel subprocess binary. Defaults to `hpcserve-tunnel` next to the
    /// running executable.
    pub tunnel_program: Option<PathBuf>,

    /// Job kinds keyed by name, merged over the built-in `llm` and `notebook`.
    pub kinds: BTreeMap<String, JobKind>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cluster: ClusterSettings::default(),
            poll_interval_secs: 5,
            command_timeout_secs: 60,
            tunnel_ready_timeout_secs: 30,
            tunnel_stop_grace_secs: 3,
            queue_timeout_secs: None,
            max_not_found_polls: 3,
            local_port: None,
            tunnel_program: None,
            kinds: BTreeMap::new(),
        }
    }
}

impl Settings {
    /// Load settings from a YAML file.
    pub fn load(path: &Path) -> Result<Settings> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| HpcError::Config(format!("cannot read '{}': {}", path.display(), e)))?;
        Settings::parse(&content)
    }

    /// Like `load`, but a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Settings> {
        if path.exists() {
            Settings::load(path)
        } else {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            Ok(Settings::default())
        }
    }

    pub fn parse(content: &str) -> Result<Settings> {
        let blank = content
            .lines()
            .map(str::trim)
            .all(|l| l.is_empty() || l.starts_with('#'));
        if blank {
            return Ok(Settings::default());
        }
        let settings: Settings = serde_yaml::from_str(content)
            .map_err(|e| HpcError::Config(format!("invalid config: {}", e)))?;
        if settings.poll_interval_secs == 0 {
            return Err(HpcError::Config("poll_interval_secs must be at least 1".into()));
        }
        if settings.local_port == Some(0) {
            return Err(HpcError::Config("local_port must be between 1 and 65535".into()));
        }
        Ok(settings)
    }

    /// `$HPCSERVE_CONFIG`, else `~/.config/hpcserve/config.yaml`.
    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return PathBuf::from(path);
        }
        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
        PathBuf::from(home)
            .join(".config")
            .join("hpcserve")
            .join("config.yaml")
    }

    /// Resolve a job kind: configured kinds first, then the built-ins.
    pub fn kind(&self, name: &str) -> Result<JobKind> {
        let kind = match self.kinds.get(name) {
            Some(kind) => JobKind {
                name: name.to_string(),
                ..kind.clone()
            },
            None => JobKind::builtin()
                .into_iter()
                .find(|k| k.name == name)
                .ok_or_else(|| {
                    HpcError::Config(format!(
                        "unknown job kind '{}' (known: {})",
                        name,
                        self.kind_names().join(", ")
                    ))
                })?,
        };
        kind.validate()?;
        Ok(kind)
    }

    pub fn kind_names(&self) -> Vec<String> {
        let mut names: Vec<String> = JobKind::builtin().into_iter().map(|k| k.name).collect();
        for name in self.kinds.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    /// Credentials for the configured cluster.
    pub fn credentials(&self, secret: Secret) -> Result<Credentials> {
        if self.cluster.host.is_empty() {
            return Err(HpcError::Config("cluster.host is not set".into()));
        }
        if self.cluster.username.is_empty() {
            return Err(HpcError::Config("cluster.username is not set".into()));
        }
        Ok(Credentials::new(&self.cluster.host, &self.cluster.username, secret)
            .with_port(self.cluster.port))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            queue_timeout: self.queue_timeout_secs.map(Duration::from_secs),
            max_not_found_polls: self.max_not_found_polls,
        }
    }

    pub fn tunnel_options(&self) -> TunnelOptions {
        TunnelOptions {
            ready_timeout: Duration::from_secs(self.tunnel_ready_timeout_secs),
            stop_grace: Duration::from_secs(self.tunnel_stop_grace_secs),
        }
    }

    pub fn tunnel_program(&self) -> Result<TunnelProgram> {
        match self.tunnel_program {
            Some(ref path) => Ok(TunnelProgram::new(path.clone())),
            None => TunnelProgram::sibling_binary(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_config() {
        let yaml = r#"
cluster:
  host: login.hpc.example.edu
  port: 2222
  username: alice
poll_interval_secs: 10
queue_timeout_secs: 1800
local_port: 15001
kinds:
  vllm:
    name: ignored
    job_name: notebook_vllm
    service_port: 8000
    work_dir: $HOME/vllm
    server_command: vllm serve my-model --port {port}
    resources:
      gpus: 2
"#;
        let s = Settings::parse(yaml).unwrap();
        assert_eq!(s.cluster.host, "login.hpc.example.edu");
        assert_eq!(s.cluster.port, 2222);
        assert_eq!(s.poll_interval_secs, 10);
        assert_eq!(s.command_timeout_secs, 60);
        assert_eq!(s.local_port, Some(15001));
        assert_eq!(
            s.orchestrator_config().queue_timeout,
            Some(Duration::from_secs(1800))
        );

        let vllm = s.kind("vllm").unwrap();
        assert_eq!(vllm.name, "vllm");
        assert_eq!(vllm.resources.gpus, 2);
        assert_eq!(vllm.resources.memory, "32G");
    }

    #[test]
    fn parse_empty_is_default() {
        assert_eq!(Settings::parse("").unwrap(), Settings::default());
        assert_eq!(Settings::parse("\n# nothing\n").unwrap(), Settings::default());
    }

    #[test]
    fn parse_rejects_zero_poll_interval() {
        assert!(matches!(
            Settings::parse("poll_interval_secs: 0\n"),
            Err(HpcError::Config(_))
        ));
    }

    #[test]
    fn parse_rejects_local_port_zero() {
        let err = Settings::parse("local_port: 0\n").unwrap_err();
        assert!(err.to_string().contains("local_port"));
    }

    #[test]
    fn parse_rejects_bad_types() {
        let err = Settings::parse("cluster:\n  port: not-a-port\n").unwrap_err();
        assert!(err.to_string().contains("invalid config"));
    }

    #[test]
    fn builtin_kinds_resolve() {
        let s = Settings::default();
        assert_eq!(s.kind("llm").unwrap().service_port, 5001);
        assert_eq!(s.kind("notebook").unwrap().job_name, "notebook_jupyter");
        let err = s.kind("spark").unwrap_err();
        assert!(err.to_string().contains("llm, notebook"));
    }

    #[test]
    fn configured_kind_overrides_builtin() {
        let yaml = r#"
kinds:
  llm:
    name: llm
    job_name: notebook_llm
    service_port: 6001
    work_dir: $HOME/llm2
    server_command: python serve.py --port {port}
"#;
        let s = Settings::parse(yaml).unwrap();
        assert_eq!(s.kind("llm").unwrap().service_port, 6001);
        assert_eq!(s.kind_names(), vec!["llm", "notebook"]);
    }

    #[test]
    fn credentials_need_host_and_user() {
        let mut s = Settings::default();
        assert!(s.credentials(Secret::Password("pw".into())).is_err());
        s.cluster.host = "login".into();
        s.cluster.username = "alice".into();
        s.cluster.port = 2200;
        let c = s.credentials(Secret::Password("pw".into())).unwrap();
        assert_eq!(c.port, 2200);
        assert_eq!(c.user_at_host(), "alice@login");
    }

    #[test]
    fn load_or_default_tolerates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let s = Settings::load_or_default(&dir.path().join("absent.yaml")).unwrap();
        assert_eq!(s, Settings::default());

        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "max_not_found_polls: 7\n").unwrap();
        assert_eq!(Settings::load_or_default(&path).unwrap().max_not_found_polls, 7);
    }

    #[test]
    fn tunnel_program_from_config() {
        let s = Settings {
            tunnel_program: Some(PathBuf::from("/opt/hpcserve/bin/hpcserve-tunnel")),
            ..Settings::default()
        };
        assert_eq!(
            s.tunnel_program().unwrap().program,
            PathBuf::from("/opt/hpcserve/bin/hpcserve-tunnel")
        );
        assert_eq!(s.tunnel_options().ready_timeout, Duration::from_secs(30));
    }
}
