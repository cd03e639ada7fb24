//! tether-node - a client node that connects to a graph server
//!
//! Announces its port capacity, advertises one format on every port the
//! server adds, and answers real-time activations: `ProcessOutput` with
//! `HaveOutput`, `ProcessInput` with `ReuseBuffer`. Useful for exercising a
//! server's negotiation path end to end.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tether::{
    ActivationRecord, ClientNode, ClientSession, ControlChannel, NodeError, NodeHandler,
    PortUpdate, Processor, RecordKind,
};
use tetherconf::TetherConfig;
use tetherproto::{BufferDesc, Direction, FormatFlags, Pod, PortId};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Pod type id used for the advertised format.
const FORMAT_POD_TYPE: u32 = 3;

#[derive(Parser)]
#[command(name = "tether-node")]
#[command(about = "Client node for the tether control protocol")]
#[command(version)]
struct Cli {
    /// Server socket (default: from config)
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Config file, replacing ./tether.toml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input ports the node accepts
    #[arg(long, default_value = "1")]
    max_inputs: u32,

    /// Output ports the node accepts
    #[arg(long, default_value = "1")]
    max_outputs: u32,

    /// Format advertised on every port
    #[arg(short, long, default_value = "F32LE/48000/2")]
    format: String,

    /// Print the effective config and exit
    #[arg(long)]
    show_config: bool,
}

struct LoggingNode {
    format: Pod,
}

impl NodeHandler for LoggingNode {
    fn add_port(
        &mut self,
        direction: Direction,
        port_id: PortId,
    ) -> std::result::Result<Option<PortUpdate>, NodeError> {
        info!("{}:{} added, advertising one format", direction, port_id);
        Ok(Some(
            PortUpdate::default().possible_formats(vec![self.format.clone()]),
        ))
    }

    fn remove_port(&mut self, direction: Direction, port_id: PortId) {
        info!("{}:{} removed", direction, port_id);
    }

    fn set_format(
        &mut self,
        direction: Direction,
        port_id: PortId,
        flags: FormatFlags,
        format: Option<&Pod>,
    ) -> std::result::Result<(), NodeError> {
        match format {
            Some(f) => info!(
                "{}:{} format {:?} ({:?})",
                direction,
                port_id,
                String::from_utf8_lossy(&f.body),
                flags
            ),
            None => info!("{}:{} format cleared", direction, port_id),
        }
        Ok(())
    }

    fn use_buffers(
        &mut self,
        direction: Direction,
        port_id: PortId,
        buffers: &[BufferDesc],
    ) -> std::result::Result<(), NodeError> {
        info!("{}:{} using {} buffer(s)", direction, port_id, buffers.len());
        Ok(())
    }

    fn node_command(&mut self, command: &Pod) -> std::result::Result<(), NodeError> {
        info!("node command {}", command.type_id);
        Ok(())
    }

    fn event(&mut self, event: &Pod) {
        info!("server event type {} ({} bytes)", event.type_id, event.len());
    }

    fn processor(&mut self) -> Option<Box<dyn Processor>> {
        Some(Box::new(Activations::default()))
    }
}

#[derive(Default)]
struct Activations {
    cycles: u64,
}

impl Processor for Activations {
    fn process(&mut self, record: ActivationRecord) -> Option<ActivationRecord> {
        self.cycles += 1;
        let reply = match record.kind()? {
            RecordKind::ProcessOutput => RecordKind::HaveOutput,
            RecordKind::ProcessInput => RecordKind::ReuseBuffer,
            _ => return None,
        };
        Some(ActivationRecord::new(reply, record.port_id, record.buffer_id))
    }

    fn idle(&mut self) {
        warn!("no activations for a while ({} cycles so far)", self.cycles);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = TetherConfig::load_from(cli.config.as_deref()).context("failed to load config")?;
    if cli.show_config {
        print!("{}", config.to_toml());
        return Ok(());
    }

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.telemetry.log_level));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let socket = cli.socket.unwrap_or_else(|| config.paths.socket_path());
    info!("tether-node {} connecting to {}", env!("CARGO_PKG_VERSION"), socket.display());

    let channel = ControlChannel::connect(&socket, &config.session)
        .await
        .with_context(|| format!("failed to connect to {}", socket.display()))?;

    let handler = LoggingNode {
        format: Pod::new(FORMAT_POD_TYPE, cli.format.into_bytes()),
    };
    let node = ClientNode::new(handler, &config);
    let mut session = ClientSession::new(channel, node, &config);
    session
        .announce(cli.max_inputs, cli.max_outputs, None)
        .await
        .context("failed to announce node")?;

    let shutdown = session.shutdown_signal();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted");
            let _ = shutdown.send(());
        }
    });

    let node = session.run().await.context("node session failed")?;
    info!("session over ({} destroyed)", node.is_destroyed());
    Ok(())
}
