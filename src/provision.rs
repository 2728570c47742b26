//! Bring-up of the database cluster and server under test.
//!
//! The load run never depends on this module; it only prepares the
//! environment when the harness is asked to.

use std::fmt;
use std::io;
use std::process::{ExitStatus, Stdio};
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Environment variable the database image reads its seed list from.
pub const SEEDS_ENV: &str = "CASSANDRA_SEEDS";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeConfig {
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// `(host, container)` port pairs.
    pub ports: Vec<(u16, u16)>,
}

impl NodeConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            env: vec![],
            ports: vec![],
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn port(mut self, host: u16, container: u16) -> Self {
        self.ports.push((host, container));
        self
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct NodeId(pub String);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProvisionError {
    #[error("failed to launch `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` exited with {status}: {stderr}")]
    Failed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("node {node} cannot reach seed {seed} on network {network}")]
    NotJoined {
        node: String,
        seed: String,
        network: String,
    },
    #[error("no nodes to provision")]
    Empty,
}

/// Starts and stops the processes a benchmark runs against.
#[allow(async_fn_in_trait)]
pub trait Provisioner {
    async fn start_node(&self, config: &NodeConfig) -> Result<NodeId, ProvisionError>;

    async fn stop_node(&self, id: &NodeId) -> Result<(), ProvisionError>;

    /// Makes `node` reachable from the cluster whose seed is `seed_address`.
    async fn join_cluster(&self, node: &NodeId, seed_address: &str) -> Result<(), ProvisionError>;
}

/// Starts the first config as seed and joins every other node to it.
///
/// Non-seed nodes get [`SEEDS_ENV`] pointed at the seed. On failure the
/// nodes started so far are stopped again.
pub async fn bring_up_cluster<P: Provisioner>(
    provisioner: &P,
    configs: &[NodeConfig],
) -> Result<Vec<NodeId>, ProvisionError> {
    let (seed_config, rest) = configs.split_first().ok_or(ProvisionError::Empty)?;
    let seed_address = seed_config.name.clone();

    let seed = provisioner.start_node(seed_config).await?;
    let mut nodes = vec![seed.clone()];
    if let Err(e) = provisioner.join_cluster(&seed, &seed_address).await {
        tear_down(provisioner, &nodes).await;
        return Err(e);
    }

    for config in rest {
        let config = config.clone().env(SEEDS_ENV, seed_address.as_str());
        let joined = match provisioner.start_node(&config).await {
            Ok(node) => {
                nodes.push(node.clone());
                provisioner.join_cluster(&node, &seed_address).await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = joined {
            tear_down(provisioner, &nodes).await;
            return Err(e);
        }
    }

    info!(nodes = nodes.len(), seed = %seed_address, "cluster up");
    Ok(nodes)
}

/// Stops every node, newest first, logging failures instead of returning them.
pub async fn tear_down<P: Provisioner>(provisioner: &P, nodes: &[NodeId]) {
    for node in nodes.iter().rev() {
        if let Err(e) = provisioner.stop_node(node).await {
            warn!(%node, error = %e, "failed to stop node");
        }
    }
}

/// Whether both containers appear in the space separated member list
/// printed by `docker network inspect`.
fn shares_network(members: &str, node: &str, seed: &str) -> bool {
    let on_network = |name: &str| members.split_whitespace().any(|n| n == name);
    on_network(node) && on_network(seed)
}

/// [`Provisioner`] backed by the `docker` CLI.
#[derive(Clone, Debug)]
pub struct DockerProvisioner {
    program: String,
    network: String,
}

impl DockerProvisioner {
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            program: "docker".to_string(),
            network: network.into(),
        }
    }

    /// Creates the bridge network unless it already exists.
    pub async fn ensure_network(&self) -> Result<(), ProvisionError> {
        if self
            .exec(&["network", "inspect", self.network.as_str()])
            .await
            .is_ok()
        {
            return Ok(());
        }
        self.exec(&["network", "create", self.network.as_str()])
            .await
            .map(drop)
    }

    fn run_args(&self, config: &NodeConfig) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            config.name.clone(),
            "--network".to_string(),
            self.network.clone(),
        ];
        for (key, value) in &config.env {
            args.push("-e".to_string());
            args.push(format!("{key}={value}"));
        }
        for (host, container) in &config.ports {
            args.push("-p".to_string());
            args.push(format!("{host}:{container}"));
        }
        args.push(config.image.clone());
        args
    }

    fn inspect_args(&self) -> Vec<String> {
        vec![
            "network".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            "{{range .Containers}}{{.Name}} {{end}}".to_string(),
            self.network.clone(),
        ]
    }

    async fn exec<S: AsRef<str>>(&self, args: &[S]) -> Result<String, ProvisionError> {
        let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
        let command = format!("{} {}", self.program, args.join(" "));
        debug!(%command, "running");

        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| ProvisionError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(ProvisionError::Failed {
                command,
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl Provisioner for DockerProvisioner {
    async fn start_node(&self, config: &NodeConfig) -> Result<NodeId, ProvisionError> {
        self.exec(&self.run_args(config)).await?;
        info!(name = %config.name, image = %config.image, "node started");
        Ok(NodeId(config.name.clone()))
    }

    async fn stop_node(&self, id: &NodeId) -> Result<(), ProvisionError> {
        self.exec(&["rm", "-f", id.0.as_str()]).await?;
        info!(%id, "node stopped");
        Ok(())
    }

    /// Nodes join the network at start, so this only checks that the node
    /// and its seed are both attached to it.
    async fn join_cluster(&self, node: &NodeId, seed_address: &str) -> Result<(), ProvisionError> {
        let members = self.exec(&self.inspect_args()).await?;
        if !shares_network(&members, &node.0, seed_address) {
            return Err(ProvisionError::NotJoined {
                node: node.0.clone(),
                seed: seed_address.to_string(),
                network: self.network.clone(),
            });
        }
        info!(%node, seed = seed_address, network = %self.network, "node joined");
        Ok(())
    }
}
