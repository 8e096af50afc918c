use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use tokio::time::{timeout, Duration};
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use gabble::{
    memory_link, Envelope, NodeEvent, NodeId, Overlay, OverlayConfig, PeerConnector,
    PeerDirectory, PeerDto,
};

/// Demo: an in-process line of overlay nodes relaying chat messages
/// hop by hop toward the far end.
#[derive(Parser, Debug)]
#[command(name = "gabble")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the line (2-8).
    #[arg(short, long, default_value = "4")]
    nodes: usize,

    /// Messages to send from the first to the last node.
    #[arg(short, long, default_value = "3")]
    messages: usize,
}

/// Links in this demo are pre-wired memory streams, so discovered
/// peers need no dialing.
struct NullConnector;

#[async_trait]
impl PeerConnector for NullConnector {
    async fn connect(&self, _peer: &PeerDto) -> Result<()> {
        Ok(())
    }
}

struct EmptyDirectory;

#[async_trait]
impl PeerDirectory for EmptyDirectory {
    async fn sample(&self, _limit: usize) -> Vec<PeerDto> {
        Vec::new()
    }
}

/// Ids with strictly shrinking XOR distance to the last node, so
/// forward-to-all-closer makes progress at every hop.
fn line_id(index: usize) -> NodeId {
    let mut bytes = [0u8; 20];
    bytes[0] = 0x80u8 >> index;
    bytes[19] = index as u8;
    NodeId::from_bytes(bytes)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let connector = Arc::new(NullConnector);
    let directory = Arc::new(EmptyDirectory);

    let count = args.nodes.clamp(2, 8);
    let overlays: Vec<Overlay> = (0..count)
        .map(|index| {
            Overlay::spawn(
                OverlayConfig::new(line_id(index)),
                connector.clone(),
                directory.clone(),
            )
        })
        .collect();
    for overlay in &overlays {
        info!("node {}", overlay.self_id());
    }

    // Link neighbours in both directions, chat and peer exchange.
    for window in 0..count - 1 {
        let (left, right) = memory_link("dht");
        overlays[window]
            .attach_link(overlays[window + 1].self_id(), left)
            .await;
        overlays[window + 1]
            .attach_link(overlays[window].self_id(), right)
            .await;

        let (left, right) = memory_link("pex");
        overlays[window]
            .attach_pex(overlays[window + 1].self_id(), left)
            .await;
        overlays[window + 1]
            .attach_pex(overlays[window].self_id(), right)
            .await;
    }

    let first = &overlays[0];
    let last = &overlays[count - 1];
    let mut chat = last.subscribe();

    for seq in 0..args.messages {
        let payload = Envelope::chat(first.self_id())
            .with_field("body", serde_json::Value::from(format!("hello #{seq}")));
        let sent_id = payload.id;
        first.send_message(last.self_id(), payload).await;

        let received = timeout(Duration::from_secs(15), async {
            loop {
                match chat.recv().await {
                    Ok(NodeEvent::ChatMessage { payload }) if payload.id == sent_id => {
                        break payload;
                    }
                    Ok(_) => continue,
                    Err(e) => panic!("event stream ended: {e}"),
                }
            }
        })
        .await;

        match received {
            Ok(payload) => info!(
                body = %payload.extra.get("body").cloned().unwrap_or_default(),
                hops = count - 1,
                "message crossed the line"
            ),
            Err(_) => warn!(seq, "message did not arrive in time"),
        }
    }

    for overlay in &overlays {
        let stats = overlay.stats().await;
        info!(
            node = %overlay.self_id(),
            peers = stats.peers,
            pex_channels = overlay.connected_count().await,
            cached = stats.cached_messages,
            forwarded = stats.forwarded_ids,
            "final stats"
        );
    }

    for overlay in &overlays {
        overlay.shutdown().await;
    }
    Ok(())
}
