//! Connects to an MQTT-over-QUIC server, sends a single PINGREQ, and
//! prints whatever comes back. A minimal smoke test for the transport,
//! not an MQTT client.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use mqtt_quic_transport::{Config, MqttMessage, Pipe, StreamHandle, Transport, TransportError};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
struct Args {
    /// mqtt-quic://HOST:PORT
    #[arg(long, default_value = "mqtt-quic://127.0.0.1:14567")]
    url: String,

    /// Validate the server certificate instead of accepting any cert.
    #[arg(long)]
    secure: bool,
}

struct EchoPipe {
    inbound: mpsc::UnboundedSender<MqttMessage>,
}

impl Pipe for EchoPipe {
    fn init(&self, _stream: StreamHandle) {
        info!("pipe initialized");
    }

    fn start(&self) {
        info!("pipe started");
    }

    fn recv_message(&self, message: MqttMessage) {
        let _ = self.inbound.send(message);
    }

    fn closed(&self, reason: TransportError) {
        info!(%reason, "pipe closed");
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let mut cfg = Config::default();
    cfg.insecure = !args.secure;

    let transport = Transport::new(cfg).context("building transport")?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let pipe = Arc::new(EchoPipe { inbound: tx });

    let stream = transport
        .connect(&args.url, pipe)
        .await
        .context("connecting")?;

    // PINGREQ: type 0xC, flags 0, zero-length body.
    let ping = MqttMessage::new(vec![0xC0, 0x00], Vec::new());
    stream.send(ping).await.wait().await.context("sending PINGREQ")?;
    info!("sent PINGREQ");

    match rx.recv().await {
        Some(reply) => info!(packet_type = reply.packet_type(), "received reply"),
        None => info!("stream closed before a reply arrived"),
    }

    Ok(())
}
