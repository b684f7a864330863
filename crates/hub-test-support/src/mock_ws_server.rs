//! A minimal scripted WebSocket endpoint used to exercise `MockWsClient`
//! itself and to stand in for a device/controller counterpart in tests
//! that don't need the full `hub-server` binary.
//!
//! Behavior: echoes every received envelope back with `udid` stamped,
//! mirroring the hub's own "Default (from device)" fan-out rule — enough
//! to validate wire round-trips without pulling in the whole registry.

use std::net::SocketAddr;

use futures_util::{SinkExt, StreamExt};
use hub_protocol::Envelope;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

pub struct MockWsServer {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockWsServer {
    /// Starts the echo server, binding to a random available port.
    pub async fn start(stamp_udid: impl Into<String>) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let stamp_udid = stamp_udid.into();

        let task = tokio::spawn(async move {
            Self::accept_loop(listener, stamp_udid).await;
        });

        Ok(Self { addr, _task: task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    async fn accept_loop(listener: TcpListener, stamp_udid: String) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let udid = stamp_udid.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, udid).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        udid: String,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();

        while let Some(msg_result) = read.next().await {
            let msg = msg_result?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };

            let mut envelope: Envelope = serde_json::from_str(&text)?;
            envelope.udid = Some(udid.clone());
            let json = serde_json::to_string(&envelope)?;
            write.send(Message::Text(json.into())).await?;
        }

        Ok(())
    }
}
