//! blockhive: coordinator, storage node and client in one binary

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};

use blockhive::client;
use blockhive::coordinator::{Coordinator, CoordinatorConfig};
use blockhive::datanode::{DataNode, DataNodeConfig};
use blockhive::protocol::BlobId;

#[derive(Parser, Debug)]
#[command(name = "blockhive", version, about = "Replicated block storage cluster")]
struct Args {
    /// Log every RPC frame
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the coordinator
    Coordinator {
        #[arg(long, default_value = "0.0.0.0:5050")]
        client_addr: String,

        #[arg(long, default_value = "0.0.0.0:5051")]
        cluster_addr: String,

        #[arg(long, default_value_t = 2)]
        replication_factor: usize,

        #[arg(long, default_value = "metadata.log")]
        blob_log: PathBuf,
    },

    /// Run a storage node
    Datanode {
        #[arg(long, default_value = "_data")]
        data_dir: PathBuf,

        /// Port 0 picks a free port
        #[arg(long, default_value = "0.0.0.0:0")]
        listen_addr: String,

        #[arg(long, default_value = "127.0.0.1:5051")]
        coordinator: String,

        /// Heartbeat interval in seconds
        #[arg(long, default_value_t = 3)]
        heartbeat_secs: u64,
    },

    /// Upload a file and print its blob id
    Upload {
        file: PathBuf,

        #[arg(long, default_value = "127.0.0.1:5050")]
        coordinator: String,
    },

    /// Download a blob into a file
    Download {
        blob: String,

        #[arg(long, short)]
        output: PathBuf,

        #[arg(long, default_value = "127.0.0.1:5050")]
        coordinator: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.cmd {
        Command::Coordinator {
            client_addr,
            cluster_addr,
            replication_factor,
            blob_log,
        } => {
            let config = CoordinatorConfig {
                client_addr,
                cluster_addr,
                replication_factor,
                blob_log_path: blob_log,
                debug: args.debug,
                ..Default::default()
            };
            let coordinator = Coordinator::start(config)
                .await
                .context("starting coordinator")?;
            tokio::signal::ctrl_c().await?;
            log::info!("Shutting down");
            coordinator.stop();
        }

        Command::Datanode {
            data_dir,
            listen_addr,
            coordinator,
            heartbeat_secs,
        } => {
            let config = DataNodeConfig {
                data_dir,
                listen_addr,
                coordinator_addr: coordinator,
                heartbeat_interval: Duration::from_secs(heartbeat_secs),
                debug: args.debug,
                ..Default::default()
            };
            let node = DataNode::start(config).await.context("starting storage node")?;
            tokio::signal::ctrl_c().await?;
            log::info!("Shutting down");
            node.stop();
        }

        Command::Upload { file, coordinator } => {
            let mut input = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("opening {}", file.display()))?;
            let size = input.metadata().await?.len();
            let blob = client::upload(&coordinator, &mut input, size, args.debug).await?;
            println!("Blob ID: {}", blob);
        }

        Command::Download {
            blob,
            output,
            coordinator,
        } => {
            let mut out = tokio::fs::File::create(&output)
                .await
                .with_context(|| format!("creating {}", output.display()))?;
            let n = client::download(&coordinator, &BlobId::from(blob), &mut out, args.debug).await?;
            log::info!("Wrote {} bytes to {}", n, output.display());
        }
    }

    Ok(())
}
