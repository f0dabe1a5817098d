//! Workload construction from a leased job.
//!
//! Translates a job and its plugin descriptors into an orchestrator-agnostic
//! workload spec. Container order is significant: index 0 is the checkout
//! container, index 1 the command container, and everything after that a
//! sidecar. The index doubles as the participant ID the coordination
//! runner sequences by. Every container's payload is wrapped in
//! `capstan exec --id <n> -- …` so the embedded agent binary drives the
//! coordination protocol before and after the payload runs.

use std::collections::HashMap;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::agent::api::Job;

/// Shared working directory mounted into all containers.
pub const CHECKOUT_PATH_ENV: &str = "BUILDKITE_BUILD_CHECKOUT_PATH";

/// Access token the runner hands back on registration.
pub const ACCESS_TOKEN_ENV: &str = "BUILDKITE_AGENT_ACCESS_TOKEN";

/// Source of the container workload spec, JSON-encoded in the job env.
pub const PLUGINS_ENV: &str = "BUILDKITE_PLUGINS";

/// Participant ID injected into each container.
pub const CONTAINER_ID_ENV: &str = "BUILDKITE_CONTAINER_ID";

/// The user's build command, used when no plugins are configured.
pub const COMMAND_ENV: &str = "BUILDKITE_COMMAND";

/// One container in a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Container name; filled in positionally when the plugin omits it.
    #[serde(default)]
    pub name: String,
    /// Container image.
    pub image: String,
    /// Full command line (entrypoint plus args).
    #[serde(default)]
    pub command: Vec<String>,
    /// Environment variables.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// An orchestrator-agnostic multi-container workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Workload name, derived from the job ID.
    pub name: String,
    /// Containers in participant-ID order.
    pub containers: Vec<ContainerSpec>,
}

impl WorkloadSpec {
    /// Number of participants the coordination runner should expect.
    pub fn participant_count(&self) -> usize {
        self.containers.len()
    }
}

/// Terminal phase of a submitted workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkloadPhase {
    Succeeded,
    Failed,
}

/// The orchestrator surface the controller needs: create a workload and
/// observe its terminal phase. Watch/list plumbing stays on the other side
/// of this trait.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Submit the workload; returns its name/handle.
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<String>;

    /// Block until the workload reaches a terminal phase.
    async fn await_terminal(&self, name: &str) -> Result<WorkloadPhase>;
}

/// Plugin configuration payload: the part of a plugin descriptor this agent
/// understands.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PluginConfig {
    #[serde(default)]
    containers: Vec<ContainerSpec>,
}

/// Builds workload specs from leased jobs.
#[derive(Debug, Clone)]
pub struct WorkloadBuilder {
    /// Image carrying the agent binary, used for checkout and the default
    /// command container.
    pub agent_image: String,
    /// Value injected as [`CHECKOUT_PATH_ENV`].
    pub checkout_path: String,
    /// Payload of the checkout container.
    pub checkout_command: Vec<String>,
    /// Token injected as [`ACCESS_TOKEN_ENV`] into every container.
    pub access_token: String,
}

impl WorkloadBuilder {
    /// Build the workload spec for a job.
    pub fn build(&self, job: &Job) -> Result<WorkloadSpec> {
        let mut containers = Vec::new();
        containers.push(ContainerSpec {
            name: "checkout".to_string(),
            image: self.agent_image.clone(),
            command: self.checkout_command.clone(),
            env: HashMap::new(),
        });
        containers.extend(self.user_containers(job)?);

        for (id, container) in containers.iter_mut().enumerate() {
            if container.name.is_empty() {
                container.name = format!("container-{id}");
            }
            let payload = std::mem::take(&mut container.command);
            container.command = wrap_exec(id as u32, payload);
            container
                .env
                .insert(CONTAINER_ID_ENV.to_string(), id.to_string());
            container
                .env
                .insert(CHECKOUT_PATH_ENV.to_string(), self.checkout_path.clone());
            container
                .env
                .insert(ACCESS_TOKEN_ENV.to_string(), self.access_token.clone());
            for (key, value) in &job.env {
                container
                    .env
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
        }

        Ok(WorkloadSpec {
            name: format!("buildkite-{}", job.id),
            containers,
        })
    }

    /// Containers from the job's plugin descriptors, or the default command
    /// container when no plugins are configured. The first user container
    /// becomes the command participant; the rest are sidecars.
    fn user_containers(&self, job: &Job) -> Result<Vec<ContainerSpec>> {
        match job.env.get(PLUGINS_ENV).filter(|raw| !raw.is_empty()) {
            Some(raw) => {
                let plugins: Vec<HashMap<String, PluginConfig>> =
                    serde_json::from_str(raw).context("parsing BUILDKITE_PLUGINS")?;
                let containers: Vec<ContainerSpec> = plugins
                    .into_iter()
                    .flat_map(|plugin| plugin.into_values())
                    .flat_map(|config| config.containers)
                    .collect();
                if containers.is_empty() {
                    bail!("plugin configuration contained no containers");
                }
                Ok(containers)
            }
            None => {
                let command = job.env.get(COMMAND_ENV).cloned().unwrap_or_default();
                Ok(vec![ContainerSpec {
                    name: "command".to_string(),
                    image: self.agent_image.clone(),
                    command: vec!["/bin/sh".to_string(), "-c".to_string(), command],
                    env: HashMap::new(),
                }])
            }
        }
    }
}

fn wrap_exec(id: u32, payload: Vec<String>) -> Vec<String> {
    let mut command = vec![
        "capstan".to_string(),
        "exec".to_string(),
        "--id".to_string(),
        id.to_string(),
    ];
    if !payload.is_empty() {
        command.push("--".to_string());
        command.extend(payload);
    }
    command
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> WorkloadBuilder {
        WorkloadBuilder {
            agent_image: "example.com/agent:latest".to_string(),
            checkout_path: "/workspace".to_string(),
            checkout_command: vec!["git-checkout".to_string()],
            access_token: "secret-token".to_string(),
        }
    }

    fn job_with_env(pairs: &[(&str, &str)]) -> Job {
        Job {
            id: "job-123".to_string(),
            env: pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_default_workload_without_plugins() {
        let job = job_with_env(&[(COMMAND_ENV, "make test")]);
        let spec = builder().build(&job).unwrap();

        assert_eq!(spec.name, "buildkite-job-123");
        assert_eq!(spec.participant_count(), 2);
        assert_eq!(spec.containers[0].name, "checkout");
        assert_eq!(spec.containers[1].name, "command");

        // The command payload is wrapped in the exec subcommand.
        let command = &spec.containers[1].command;
        assert_eq!(
            &command[..5],
            &["capstan", "exec", "--id", "1", "--"].map(String::from)
        );
        assert!(command.contains(&"make test".to_string()));
    }

    #[test]
    fn test_env_injection() {
        let job = job_with_env(&[(COMMAND_ENV, "true"), ("BUILDKITE_BRANCH", "main")]);
        let spec = builder().build(&job).unwrap();

        for (id, container) in spec.containers.iter().enumerate() {
            assert_eq!(container.env[CONTAINER_ID_ENV], id.to_string());
            assert_eq!(container.env[CHECKOUT_PATH_ENV], "/workspace");
            assert_eq!(container.env[ACCESS_TOKEN_ENV], "secret-token");
            assert_eq!(container.env["BUILDKITE_BRANCH"], "main");
        }
    }

    #[test]
    fn test_plugin_containers_become_sidecars() {
        let plugins = serde_json::json!([
            {
                "github.com/example/compose-plugin": {
                    "containers": [
                        { "image": "example.com/builder", "command": ["make"] },
                        { "name": "postgres", "image": "postgres:16" },
                        { "name": "browser", "image": "selenium:latest" }
                    ]
                }
            }
        ]);
        let job = job_with_env(&[(PLUGINS_ENV, &plugins.to_string())]);
        let spec = builder().build(&job).unwrap();

        // checkout + three plugin containers
        assert_eq!(spec.participant_count(), 4);
        assert_eq!(spec.containers[0].name, "checkout");
        // Unnamed containers are named positionally.
        assert_eq!(spec.containers[1].name, "container-1");
        assert_eq!(spec.containers[2].name, "postgres");
        assert_eq!(spec.containers[3].name, "browser");

        // A sidecar with no payload still gets the exec wrapper.
        assert_eq!(
            spec.containers[2].command,
            ["capstan", "exec", "--id", "2"].map(String::from)
        );
    }

    #[test]
    fn test_empty_plugin_containers_rejected() {
        let job = job_with_env(&[(PLUGINS_ENV, r#"[{"github.com/example/noop": {}}]"#)]);
        let err = builder().build(&job).unwrap_err();
        assert!(err.to_string().contains("no containers"));
    }

    #[test]
    fn test_malformed_plugins_rejected() {
        let job = job_with_env(&[(PLUGINS_ENV, "not json")]);
        assert!(builder().build(&job).is_err());
    }
}
