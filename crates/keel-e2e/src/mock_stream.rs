//! Mock WebSocket app for stream relay tests

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

/// Close reason the mock sends when it ends a stream
pub const CLOSE_REASON: &str = "done";

/// How the mock app behaves once a client connects
#[derive(Clone, Debug)]
pub enum StreamMode {
    /// Echo the first text frame back, then close normally
    EchoThenClose,
    /// Send a ping and the given binary payload, then close normally
    BinaryThenClose(Vec<u8>),
    /// Read client frames but never answer
    Silent,
}

#[derive(Default)]
struct State {
    paths: RwLock<Vec<String>>,
    received: RwLock<Vec<String>>,
    connections: AtomicUsize,
    closed_by_client: AtomicUsize,
}

/// A WebSocket server on an ephemeral local port
pub struct MockStreamApp {
    addr: SocketAddr,
    state: Arc<State>,
}

impl MockStreamApp {
    pub async fn start(mode: StreamMode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock stream app");
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(State::default());

        let server_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = server_state.clone();
                let mode = mode.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve(stream, mode, &state).await {
                        tracing::debug!("Mock stream connection ended: {}", e);
                    }
                });
            }
        });

        Self { addr, state }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Request paths of accepted handshakes
    pub fn paths(&self) -> Vec<String> {
        self.state.paths.read().clone()
    }

    /// Text frames received from clients
    pub fn received(&self) -> Vec<String> {
        self.state.received.read().clone()
    }

    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Connections the client ended with a close frame
    pub fn closed_by_client(&self) -> usize {
        self.state.closed_by_client.load(Ordering::SeqCst)
    }
}

async fn serve(stream: TcpStream, mode: StreamMode, state: &State) -> anyhow::Result<()> {
    let mut path = String::new();
    let callback = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
        path = req.uri().path().to_string();
        Ok(resp)
    };
    let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback).await?;

    state.paths.write().push(path);
    state.connections.fetch_add(1, Ordering::SeqCst);

    let close = Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: CLOSE_REASON.into(),
    }));

    match mode {
        StreamMode::EchoThenClose => {
            let mut first = None;
            while let Some(message) = ws.next().await {
                if let Message::Text(text) = message? {
                    first = Some(text);
                    break;
                }
            }
            if let Some(text) = first {
                state.received.write().push(text.to_string());
                ws.send(Message::Text(text)).await?;
                ws.send(close).await?;
            }
        }
        StreamMode::BinaryThenClose(payload) => {
            ws.send(Message::Ping(Bytes::new())).await?;
            ws.send(Message::Binary(Bytes::from(payload))).await?;
            ws.send(close).await?;
        }
        StreamMode::Silent => {}
    }

    // Drain until the client goes away
    while let Some(message) = ws.next().await {
        match message? {
            Message::Text(text) => state.received.write().push(text.to_string()),
            Message::Close(_) => {
                state.closed_by_client.fetch_add(1, Ordering::SeqCst);
                break;
            }
            _ => {}
        }
    }
    Ok(())
}
