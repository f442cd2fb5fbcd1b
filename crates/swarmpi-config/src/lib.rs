// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Cluster configuration: the one-shot setup accepted by `configure_infra`.
//!
//! Loading follows the same layered-override shape as a typical gateway
//! config: a base file under `/etc`, a user file under `$XDG_CONFIG_HOME` (or
//! `~/.config`), a project-local `.swarmpi/cluster.yaml`, and finally an
//! explicit `--config` path, each layer overriding the fields it sets on top
//! of the previous one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid_config: {0}")]
    Invalid(String),
    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("failed to parse {path}: {source}")]
    Parse { path: PathBuf, #[source] source: serde_yaml::Error },
}

fn default_per_node_threads() -> Option<u32> {
    None
}

fn default_time_job() -> bool {
    false
}

fn default_progress_to_terminal() -> bool {
    false
}

fn default_log_level() -> Option<String> {
    None
}

/// The exact field set accepted by a one-shot cluster setup. Field names and
/// defaults match the contract of the original configuration surface this
/// crate was distilled from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterConfig {
    pub master_node: String,
    pub per_node_cores: u32,
    #[serde(default = "default_per_node_threads")]
    pub per_node_threads: Option<u32>,
    pub num_worker_nodes: u32,
    pub hosts: Vec<String>,
    pub ssh_user: String,
    pub python_executable: String,
    pub working_dir: String,
    #[serde(default = "default_time_job")]
    pub time_job: bool,
    #[serde(default = "default_progress_to_terminal")]
    pub progress_to_terminal: bool,
    /// Purely logging plumbing (an `EnvFilter` directive string): not a
    /// job-semantics field, not subject to the rejection rules that apply
    /// to the rest of this struct.
    #[serde(default = "default_log_level")]
    pub log_level: Option<String>,
}

/// Partial configuration as read from a single layer; every field optional
/// so later layers can merge over earlier ones field-by-field.
#[derive(Debug, Clone, Default, Deserialize)]
struct PartialClusterConfig {
    master_node: Option<String>,
    per_node_cores: Option<u32>,
    per_node_threads: Option<Option<u32>>,
    num_worker_nodes: Option<u32>,
    hosts: Option<Vec<String>>,
    ssh_user: Option<String>,
    python_executable: Option<String>,
    working_dir: Option<String>,
    time_job: Option<bool>,
    progress_to_terminal: Option<bool>,
    log_level: Option<Option<String>>,
}

impl PartialClusterConfig {
    fn merge_over(self, base: PartialClusterConfig) -> PartialClusterConfig {
        PartialClusterConfig {
            master_node: self.master_node.or(base.master_node),
            per_node_cores: self.per_node_cores.or(base.per_node_cores),
            per_node_threads: self.per_node_threads.or(base.per_node_threads),
            num_worker_nodes: self.num_worker_nodes.or(base.num_worker_nodes),
            hosts: self.hosts.or(base.hosts),
            ssh_user: self.ssh_user.or(base.ssh_user),
            python_executable: self.python_executable.or(base.python_executable),
            working_dir: self.working_dir.or(base.working_dir),
            time_job: self.time_job.or(base.time_job),
            progress_to_terminal: self.progress_to_terminal.or(base.progress_to_terminal),
            log_level: self.log_level.or(base.log_level),
        }
    }

    fn finish(self) -> Result<ClusterConfig, ConfigError> {
        let master_node = self
            .master_node
            .ok_or_else(|| ConfigError::Invalid("missing required field `master_node`".into()))?;
        let per_node_cores = self.per_node_cores.ok_or_else(|| {
            ConfigError::Invalid("missing required field `per_node_cores`".into())
        })?;
        let num_worker_nodes = self.num_worker_nodes.ok_or_else(|| {
            ConfigError::Invalid("missing required field `num_worker_nodes`".into())
        })?;
        let hosts = self
            .hosts
            .ok_or_else(|| ConfigError::Invalid("missing required field `hosts`".into()))?;
        let ssh_user = self
            .ssh_user
            .ok_or_else(|| ConfigError::Invalid("missing required field `ssh_user`".into()))?;
        let python_executable = self.python_executable.ok_or_else(|| {
            ConfigError::Invalid("missing required field `python_executable`".into())
        })?;
        let working_dir = self
            .working_dir
            .ok_or_else(|| ConfigError::Invalid("missing required field `working_dir`".into()))?;

        if hosts.len() as u32 != num_worker_nodes {
            return Err(ConfigError::Invalid(format!(
                "len(hosts) = {} does not match num_worker_nodes = {}",
                hosts.len(),
                num_worker_nodes
            )));
        }

        Ok(ClusterConfig {
            master_node,
            per_node_cores,
            per_node_threads: self.per_node_threads.unwrap_or(None),
            num_worker_nodes,
            hosts,
            ssh_user,
            python_executable,
            working_dir,
            time_job: self.time_job.unwrap_or_else(default_time_job),
            progress_to_terminal: self.progress_to_terminal.unwrap_or_else(default_progress_to_terminal),
            log_level: self.log_level.unwrap_or_else(default_log_level),
        })
    }
}

fn read_layer(path: &Path) -> Result<Option<PartialClusterConfig>, ConfigError> {
    if !path.exists() {
        return Ok(None);
    }
    let text = std::fs::read_to_string(path)
        .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
    let partial: PartialClusterConfig = serde_yaml::from_str(&text)
        .map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })?;
    Ok(Some(partial))
}

/// Search paths in override order (later entries win), matching the
/// conventional system → user → project → explicit layering.
pub fn config_search_paths(explicit: Option<&Path>) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/swarmpi/cluster.yaml")];
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("swarmpi").join("cluster.yaml"));
    }
    paths.push(PathBuf::from(".swarmpi/cluster.yaml"));
    if let Some(explicit) = explicit {
        paths.push(explicit.to_path_buf());
    }
    paths
}

/// Loads and deep-merges every existing layer in `config_search_paths`,
/// then validates the result per the rejection rules (`invalid_config` on a
/// missing required field or a `hosts`/`num_worker_nodes` length mismatch).
pub fn load(explicit: Option<&Path>) -> Result<ClusterConfig, ConfigError> {
    let mut merged = PartialClusterConfig::default();
    for path in config_search_paths(explicit) {
        if let Some(layer) = read_layer(&path)? {
            merged = layer.merge_over(merged);
        }
    }
    merged.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_a_complete_single_layer() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "cluster.yaml",
            r#"
master_node: head.local
per_node_cores: 8
num_worker_nodes: 2
hosts: [w1.local, w2.local]
ssh_user: cluster
python_executable: /usr/bin/swarmpi-worker
working_dir: /srv/swarmpi
"#,
        );
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.master_node, "head.local");
        assert_eq!(cfg.per_node_cores, 8);
        assert_eq!(cfg.hosts, vec!["w1.local", "w2.local"]);
        assert_eq!(cfg.per_node_threads, None);
        assert!(!cfg.time_job);
        assert_eq!(cfg.log_level, None);
    }

    #[test]
    fn log_level_is_logging_plumbing_not_subject_to_validation() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "cluster.yaml",
            r#"
master_node: head.local
per_node_cores: 8
num_worker_nodes: 0
hosts: []
ssh_user: cluster
python_executable: /usr/bin/swarmpi-worker
working_dir: /srv/swarmpi
log_level: "swarmpi=debug,swarmpi_comm=trace"
"#,
        );
        let cfg = load(Some(&path)).unwrap();
        assert_eq!(cfg.log_level.as_deref(), Some("swarmpi=debug,swarmpi_comm=trace"));
    }

    #[test]
    fn rejects_host_count_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "cluster.yaml",
            r#"
master_node: head.local
per_node_cores: 8
num_worker_nodes: 3
hosts: [w1.local, w2.local]
ssh_user: cluster
python_executable: /usr/bin/swarmpi-worker
working_dir: /srv/swarmpi
"#,
        );
        let err = load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_missing_required_field() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "cluster.yaml",
            r#"
per_node_cores: 8
num_worker_nodes: 0
hosts: []
ssh_user: cluster
python_executable: /usr/bin/swarmpi-worker
working_dir: /srv/swarmpi
"#,
        );
        let err = load(Some(&path)).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn defaults_are_applied_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_yaml(
            &dir,
            "cluster.yaml",
            r#"
master_node: head.local
per_node_cores: 4
num_worker_nodes: 0
hosts: []
ssh_user: cluster
python_executable: /usr/bin/swarmpi-worker
working_dir: /srv/swarmpi
time_job: true
"#,
        );
        let cfg = load(Some(&path)).unwrap();
        assert!(cfg.time_job);
        assert!(!cfg.progress_to_terminal);
    }
}
