//! Submission script rendering.
//!
//! One template serves every job kind. A `JobKind` declares the fields that
//! vary (job name, service port, modules, environment bootstrap, server
//! command) and `render` fills them in together with a `ResourceRequest`.

use serde::{Deserialize, Serialize};

use crate::error::{HpcError, Result};

/// Placeholder in `server_command` replaced by the kind's service port.
pub const PORT_PLACEHOLDER: &str = "{port}";


// ---------------------------------------------------------------------------
// ResourceRequest
// ---------------------------------------------------------------------------

/// Scheduler resources for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceRequest {
    pub nodes: u32,
    pub tasks_per_node: u32,
    /// CPUs per task.
    pub cpus: u32,
    /// Memory per node in scheduler syntax (e.g. "32G").
    pub memory: String,
    pub gpus: u32,
    /// Wall-clock limit, `HH:MM:SS` or `D-HH:MM:SS`.
    pub time_limit: String,
    pub partition: Option<String>,
}

impl Default for ResourceRequest {
    fn default() -> Self {
        ResourceRequest {
            nodes: 1,
            tasks_per_node: 1,
            cpus: 4,
            memory: "32G".to_string(),
            gpus: 1,
            time_limit: "02:00:00".to_string(),
            partition: None,
        }
    }
}


// ---------------------------------------------------------------------------
// JobKind
// ---------------------------------------------------------------------------

/// A kind of service job: what to run and where it listens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobKind {
    /// Short kind name used on the command line (e.g. "llm"). Taken from
    /// the map key when the kind comes from the config file.
    #[serde(default)]
    pub name: String,
    /// Scheduler job name. One job of this name per user at a time.
    pub job_name: String,
    /// Port the server binds on the compute node.
    pub service_port: u16,
    /// Environment modules loaded before anything else.
    #[serde(default)]
    pub modules: Vec<String>,
    /// Working directory on the cluster, created if missing.
    pub work_dir: String,
    /// Environment directory; `env_create` runs only when it is absent.
    #[serde(default)]
    pub env_dir: Option<String>,
    #[serde(default)]
    pub env_create: Option<String>,
    /// Command that activates the environment (e.g. `source venv/bin/activate`).
    #[serde(default)]
    pub env_activate: Option<String>,
    /// Server start command. `{port}` expands to `service_port`.
    pub server_command: String,
    #[serde(default)]
    pub resources: ResourceRequest,
}

impl JobKind {
    /// HTTP inference server answering `GET /health` and `POST /query`.
    pub fn llm() -> Self {
        JobKind {
            name: "llm".to_string(),
            job_name: "notebook_llm".to_string(),
            service_port: 5001,
            modules: vec!["python/3.11".to_string(), "cuda/12.1".to_string()],
            work_dir: "$HOME/hpcserve/llm".to_string(),
            env_dir: Some("$HOME/hpcserve/llm/venv".to_string()),
            env_create: Some(
                "python -m venv \"$HOME/hpcserve/llm/venv\" && \
                 \"$HOME/hpcserve/llm/venv/bin/pip\" install --quiet flask torch transformers"
                    .to_string(),
            ),
            env_activate: Some("source \"$HOME/hpcserve/llm/venv/bin/activate\"".to_string()),
            server_command: "python server.py --host 0.0.0.0 --port {port}".to_string(),
            resources: ResourceRequest::default(),
        }
    }

    /// Jupyter Lab on a compute node.
    pub fn notebook() -> Self {
        JobKind {
            name: "notebook".to_string(),
            job_name: "notebook_jupyter".to_string(),
            service_port: 8888,
            modules: vec!["python/3.11".to_string()],
            work_dir: "$HOME/hpcserve/notebook".to_string(),
            env_dir: Some("$HOME/hpcserve/notebook/venv".to_string()),
            env_create: Some(
                "python -m venv \"$HOME/hpcserve/notebook/venv\" && \
                 \"$HOME/hpcserve/notebook/venv/bin/pip\" install --quiet jupyterlab"
                    .to_string(),
            ),
            env_activate: Some(
                "source \"$HOME/hpcserve/notebook/venv/bin/activate\"".to_string(),
            ),
            server_command: "jupyter lab --no-browser --ip=0.0.0.0 --port={port}".to_string(),
            resources: ResourceRequest {
                gpus: 0,
                memory: "16G".to_string(),
                ..ResourceRequest::default()
            },
        }
    }

    pub fn builtin() -> Vec<JobKind> {
        vec![JobKind::llm(), JobKind::notebook()]
    }

    /// Check the fields that end up in shell commands.
    pub fn validate(&self) -> Result<()> {
        let name_ok = !self.job_name.is_empty()
            && self
                .job_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "_-.".contains(c));
        if !name_ok {
            return Err(HpcError::Config(format!(
                "job kind '{}': job name '{}' must be non-empty [A-Za-z0-9_.-]",
                self.name, self.job_name
            )));
        }
        if self.service_port == 0 {
            return Err(HpcError::Config(format!(
                "job kind '{}': service port must be non-zero",
                self.name
            )));
        }
        if self.server_command.trim().is_empty() {
            return Err(HpcError::Config(format!(
                "job kind '{}': server command is empty",
                self.name
            )));
        }
        if self.env_create.is_some() && self.env_dir.is_none() {
            return Err(HpcError::Config(format!(
                "job kind '{}': env_create needs env_dir",
                self.name
            )));
        }
        Ok(())
    }

    /// The server command with `{port}` expanded.
    pub fn server_command_line(&self) -> String {
        self.server_command
            .replace(PORT_PLACEHOLDER, &self.service_port.to_string())
    }
}


/// Render the batch script for `kind` with `resources`.
pub fn render(kind: &JobKind, resources: &ResourceRequest) -> String {
    let mut out = String::from("#!/bin/bash\n");
    let mut directive = |flag: &str, value: &str| {
        out.push_str(&format!("#SBATCH --{}={}\n", flag, value));
    };
    directive("job-name", &kind.job_name);
    directive("nodes", &resources.nodes.to_string());
    directive("ntasks-per-node", &resources.tasks_per_node.to_string());
    directive("cpus-per-task", &resources.cpus.to_string());
    directive("mem", &resources.memory);
    if resources.gpus > 0 {
        directive("gres", &format!("gpu:{}", resources.gpus));
    }
    directive("time", &resources.time_limit);
    if let Some(ref partition) = resources.partition {
        directive("partition", partition);
    }
    directive("output", "hpcserve-%x-%j.log");

    out.push_str("\nset -eo pipefail\n\n");

    for module in &kind.modules {
        out.push_str(&format!("module load {}\n", module));
    }
    if !kind.modules.is_empty() {
        out.push('\n');
    }

    out.push_str(&format!("mkdir -p \"{0}\"\ncd \"{0}\"\n\n", kind.work_dir));

    if let (Some(dir), Some(create)) = (&kind.env_dir, &kind.env_create) {
        out.push_str(&format!("if [ ! -d \"{}\" ]; then\n    {}\nfi\n", dir, create));
    }
    if let Some(ref activate) = kind.env_activate {
        out.push_str(activate);
        out.push('\n');
    }

    out.push_str(&format!("\nexport HPCSERVE_PORT={}\n", kind.service_port));
    out.push_str(&format!("exec {}\n", kind.server_command_line()));
    out
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_llm_script_has_directives() {
        let kind = JobKind::llm();
        let script = render(&kind, &kind.resources);
        assert!(script.starts_with("#!/bin/bash\n"));
        assert!(script.contains("#SBATCH --job-name=notebook_llm\n"));
        assert!(script.contains("#SBATCH --nodes=1\n"));
        assert!(script.contains("#SBATCH --ntasks-per-node=1\n"));
        assert!(script.contains("#SBATCH --cpus-per-task=4\n"));
        assert!(script.contains("#SBATCH --mem=32G\n"));
        assert!(script.contains("#SBATCH --gres=gpu:1\n"));
        assert!(script.contains("#SBATCH --time=02:00:00\n"));
        assert!(!script.contains("--partition"));
    }

    #[test]
    fn render_binds_fixed_port() {
        let kind = JobKind::llm();
        let script = render(&kind, &kind.resources);
        assert!(script.contains("export HPCSERVE_PORT=5001\n"));
        assert!(script.contains("exec python server.py --host 0.0.0.0 --port 5001\n"));
    }

    #[test]
    fn render_env_setup_is_guarded() {
        let kind = JobKind::llm();
        let script = render(&kind, &kind.resources);
        let guard = script
            .find("if [ ! -d \"$HOME/hpcserve/llm/venv\" ]; then")
            .expect("guard present");
        let create = script.find("python -m venv").unwrap();
        let activate = script.find("source \"$HOME/hpcserve/llm/venv/bin/activate\"").unwrap();
        assert!(guard < create && create < activate);
    }

    #[test]
    fn render_modules_before_server() {
        let kind = JobKind::llm();
        let script = render(&kind, &kind.resources);
        let module = script.find("module load cuda/12.1").unwrap();
        let exec = script.find("exec python").unwrap();
        assert!(module < exec);
    }

    #[test]
    fn render_omits_gres_without_gpus_and_adds_partition() {
        let kind = JobKind::notebook();
        let resources = ResourceRequest {
            partition: Some("short".into()),
            ..kind.resources.clone()
        };
        let script = render(&kind, &resources);
        assert!(!script.contains("--gres"));
        assert!(script.contains("#SBATCH --partition=short\n"));
        assert!(script.contains("--port=8888"));
    }

    #[test]
    fn validate_rejects_unsafe_job_name() {
        let mut kind = JobKind::llm();
        kind.job_name = "llm; rm -rf ~".into();
        assert!(matches!(kind.validate(), Err(HpcError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_port_and_empty_command() {
        let mut kind = JobKind::llm();
        kind.service_port = 0;
        assert!(kind.validate().is_err());
        let mut kind = JobKind::llm();
        kind.server_command = "  ".into();
        assert!(kind.validate().is_err());
    }

    #[test]
    fn builtin_kinds_validate() {
        for kind in JobKind::builtin() {
            kind.validate().unwrap();
        }
    }

    #[test]
    fn kind_parses_from_yaml_with_defaults() {
        let yaml = r#"
name: vllm
job_name: notebook_vllm
service_port: 8000
work_dir: $HOME/vllm
server_command: vllm serve my-model --port {port}
"#;
        let kind: JobKind = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(kind.resources, ResourceRequest::default());
        assert!(kind.modules.is_empty());
        assert_eq!(kind.server_command_line(), "vllm serve my-model --port 8000");
    }
}
