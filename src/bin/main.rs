use easytrack_bench::*;

use anyhow::Context;
use clap::Parser;
use generator::{PayloadSource, RequestVariableGenerator};
use indicatif::MultiProgress;
use model::{IdentityMode, UploadFormat};
use provision::{DockerProvisioner, NodeConfig, NodeId, Provisioner};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Environment variable the server under test reads its database contact points from.
const SERVER_DB_ENV: &str = "CASSANDRA_IP_ADDRESSES";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the upload endpoint
    url: String,

    /// Path to the payload file (UTF-8 text)
    payload_file: PathBuf,

    /// Number of virtual users; repeat for a concurrency sweep
    #[arg(short = 'u', long, default_value = "1")]
    vus: Vec<usize>,

    /// Duration of each run in seconds
    #[arg(short, long, default_value_t = 30)]
    duration: usize,

    /// Seconds between virtual user starts
    #[arg(short, long, default_value_t = 0)]
    spawn_rate: usize,

    /// Encoding of the upload request
    #[arg(long, value_enum, default_value_t = UploadFormat::Multipart)]
    format: UploadFormat,

    /// How user id and session key are derived
    #[arg(long, value_enum, default_value_t = IdentityMode::Fixed)]
    identity: IdentityMode,

    /// Read and encode the payload once instead of once per request
    #[arg(long)]
    cache_payload: bool,

    /// Request timeout in seconds
    #[arg(long, default_value_t = 30)]
    timeout: usize,

    /// Append the run reports to a JSON array file
    #[arg(long)]
    output_json: Option<PathBuf>,

    /// Number of database nodes to start with docker before the runs
    #[arg(long, default_value_t = 0)]
    provision_nodes: usize,

    /// Image of the database nodes
    #[arg(long, default_value = "cassandra:4.1")]
    node_image: String,

    /// Image of the server under test, started after the database
    #[arg(long)]
    server_image: Option<String>,

    /// Host port the server under test is published on
    #[arg(long, default_value_t = 8000)]
    server_port: u16,

    /// Docker network the provisioned containers join
    #[arg(long, default_value = "easytrack")]
    network: String,
}

async fn provision_environment(args: &Args, docker: &DockerProvisioner) -> anyhow::Result<Vec<NodeId>> {
    docker
        .ensure_network()
        .await
        .context("failed to create docker network")?;

    let configs: Vec<_> = (1..=args.provision_nodes)
        .map(|i| NodeConfig::new(format!("cassandra{i}"), args.node_image.as_str()))
        .collect();
    let mut nodes = provision::bring_up_cluster(docker, &configs)
        .await
        .context("failed to start database cluster")?;

    if let Some(image) = &args.server_image {
        let contact_points = configs
            .iter()
            .map(|c| c.name.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let server = NodeConfig::new("et-server", image.as_str())
            .env(SERVER_DB_ENV, contact_points)
            .port(args.server_port, 8000);
        let started = match docker.start_node(&server).await {
            Ok(id) => docker
                .join_cluster(&id, &nodes[0].0)
                .await
                .map(|_| id),
            Err(e) => Err(e),
        };
        match started {
            Ok(id) => nodes.push(id),
            Err(e) => {
                provision::tear_down(docker, &nodes).await;
                return Err(e).context("failed to start server under test");
            }
        }
    }

    Ok(nodes)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let source = if args.cache_payload {
        PayloadSource::cached(&args.payload_file)?
    } else {
        PayloadSource::per_invocation(&args.payload_file)
    };
    let generator = Arc::new(RequestVariableGenerator::new(source, args.identity));

    let docker = DockerProvisioner::new(args.network.as_str());
    let nodes = if args.provision_nodes > 0 {
        provision_environment(&args, &docker).await?
    } else {
        vec![]
    };

    let mut reports = vec![];
    for &vus in &args.vus {
        let config = model::Config {
            vus,
            duration: args.duration,
            spawn_rate: args.spawn_rate,
            url: args.url.clone(),
            format: args.format,
            identity: args.identity,
            timeout: args.timeout,
            text_width: 50,
        };

        let m = MultiProgress::new();
        let report = runner::run(&config, Arc::clone(&generator), m).await;
        let report = match report {
            Ok(report) => report,
            Err(e) => {
                provision::tear_down(&docker, &nodes).await;
                return Err(e).context("load run failed");
            }
        };
        report.print();
        reports.push(report);
    }

    if let Some(path) = &args.output_json {
        report::append_json(&reports, path)
            .with_context(|| format!("failed to write {}", path.display()))?;
        info!(path = %path.display(), runs = reports.len(), "reports written");
    }

    provision::tear_down(&docker, &nodes).await;

    Ok(())
}
