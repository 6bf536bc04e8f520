use std::io::BufRead;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use node_app::{load_config, render_event, run_prompt};
use node_mesh::{GroupNode, MulticastTransport, NodeIdentity};

/// Multicast group node with priority-based master election
#[derive(Parser, Debug)]
#[command(name = "groupnode")]
#[command(about = "Join a multicast group, track its members and elect a master")]
struct Args {
    /// Node id, unique across the group
    #[arg(short, long, allow_negative_numbers = true)]
    id: i64,

    /// Election priority; the highest priority member is the master
    #[arg(short, long, allow_negative_numbers = true)]
    priority: i64,

    /// Path to the TOML config file (skipped when missing)
    #[arg(short, long, default_value = "groupnode.toml")]
    config: PathBuf,

    /// Override the multicast group address
    #[arg(long)]
    group: Option<Ipv4Addr>,

    /// Override the multicast port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let mut config = load_config(&args.config)?;
    if let Some(group) = args.group {
        config.multicast.group = group;
    }
    if let Some(port) = args.port {
        config.multicast.port = port;
    }

    tracing::info!("groupnode starting...");
    tracing::info!("id         = {}", args.id);
    tracing::info!("priority   = {}", args.priority);
    tracing::info!("group      = {}", config.multicast.group_addr());
    tracing::info!("tie_break  = {}", config.node.tie_break);

    let identity = NodeIdentity {
        id: args.id,
        priority: args.priority,
    };
    let transport = Arc::new(MulticastTransport::new(config.multicast.clone()));
    let (mut node, mut events) = GroupNode::new(identity, transport, config.node_settings());

    let printer = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            println!("\n{}", render_event(&event));
        }
    });

    let mut lines = spawn_stdin_reader()?;
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("cannot listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };
    let end = run_prompt(&mut node, &mut lines, interrupt).await;
    tracing::debug!("prompt ended: {end:?}");

    drop(node);
    printer.await.ok();
    Ok(())
}

/// Read stdin on a plain thread: a read blocked there never holds up runtime
/// shutdown after Ctrl-C.
fn spawn_stdin_reader() -> Result<mpsc::Receiver<String>> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::Builder::new()
        .name("stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.blocking_send(line).is_err() {
                    break;
                }
            }
        })
        .context("spawn stdin reader")?;
    Ok(rx)
}
