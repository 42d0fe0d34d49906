//! Persistent duplex relay over a tunnel
//!
//! A stream session moves `Connecting -> Open -> (Reading)* -> Closed`. Any
//! error while connecting or reading closes it. A close frame from the peer is
//! reported as [`RelayError::StreamClosed`] so callers can tell it apart from
//! transport failures.

use std::net::{Ipv4Addr, SocketAddr};

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::RelayError;
use crate::session::TunnelSession;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Build the stream URL for a path behind a local port
pub fn ws_url(port: u16, path: &str) -> String {
    ws_url_at(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), path)
}

/// Build the stream URL for a path at any address
pub fn ws_url_at(addr: SocketAddr, path: &str) -> String {
    format!("ws://{}/{}", addr, path.trim_start_matches('/'))
}

/// Control frame kinds; observed but never surfaced as data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Ping,
    Pong,
    /// Raw frame the transport did not classify
    Other,
}

/// One classified inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
    Control(ControlKind),
}

impl Frame {
    pub fn is_data(&self) -> bool {
        !matches!(self, Frame::Control(_))
    }
}

/// How a relay loop ended without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEnd {
    /// The cancellation token fired
    Cancelled,
}

/// Opens duplex connections through ready tunnels
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamRelay;

impl StreamRelay {
    pub fn new() -> Self {
        Self
    }

    /// Dial `ws://<bound-addr>/<path>` through `session`
    pub async fn connect(
        &self,
        session: &TunnelSession,
        path: &str,
    ) -> Result<StreamConnection, RelayError> {
        let addr = session.local_addr().ok_or(RelayError::NotReady)?;
        StreamConnection::connect(&ws_url_at(addr, path)).await
    }

    /// Connect, send `payload` as one text frame, then relay inbound frames
    pub async fn relay<F>(
        &self,
        session: &TunnelSession,
        path: &str,
        payload: &str,
        cancel: &CancellationToken,
        on_frame: F,
    ) -> Result<StreamEnd, RelayError>
    where
        F: FnMut(Frame),
    {
        let mut connection = self.connect(session, path).await?;
        connection.send_text(payload).await?;
        connection.run(cancel, on_frame).await
    }
}

/// An open duplex connection
pub struct StreamConnection {
    url: String,
    stream: WsStream,
}

impl StreamConnection {
    /// Dial a stream URL directly
    pub async fn connect(url: &str) -> Result<Self, RelayError> {
        tracing::debug!("Opening stream {}", url);

        let (stream, _response) =
            connect_async(url)
                .await
                .map_err(|source| RelayError::StreamConnect {
                    url: url.to_string(),
                    source,
                })?;

        Ok(Self {
            url: url.to_string(),
            stream,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), RelayError> {
        self.stream
            .send(Message::Text(text.to_string().into()))
            .await
            .map_err(RelayError::StreamIo)
    }

    /// Read and classify the next frame.
    ///
    /// Blocks until a frame or error arrives. A close frame, or the stream
    /// ending, yields [`RelayError::StreamClosed`]; the close reply is sent
    /// back before returning.
    pub async fn next_frame(&mut self) -> Result<Frame, RelayError> {
        match self.stream.next().await {
            Some(Ok(message)) => {
                let frame = classify(message);
                if matches!(&frame, Err(e) if e.is_close()) {
                    // The reply was queued on receipt; flush it out
                    if let Err(e) = self.stream.close(None).await {
                        tracing::debug!("Stream {} close reply: {}", self.url, e);
                    }
                }
                frame
            }
            Some(Err(e)) => Err(RelayError::StreamIo(e)),
            None => Err(RelayError::StreamClosed {
                code: None,
                reason: String::new(),
            }),
        }
    }

    /// Relay inbound data frames to `on_frame` until error, close or cancel.
    ///
    /// On cancel the connection is closed and `StreamEnd::Cancelled` returned.
    pub async fn run<F>(
        mut self,
        cancel: &CancellationToken,
        mut on_frame: F,
    ) -> Result<StreamEnd, RelayError>
    where
        F: FnMut(Frame),
    {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    if let Err(e) = self.stream.close(None).await {
                        tracing::debug!("Stream {} close: {}", self.url, e);
                    }
                    return Ok(StreamEnd::Cancelled);
                }
                frame = self.next_frame() => frame?,
            };

            match frame {
                Frame::Control(kind) => {
                    tracing::trace!("Stream {} control frame: {:?}", self.url, kind);
                }
                data => on_frame(data),
            }
        }
    }
}

fn classify(message: Message) -> Result<Frame, RelayError> {
    match message {
        Message::Text(text) => Ok(Frame::Text(text.to_string())),
        Message::Binary(data) => Ok(Frame::Binary(data)),
        Message::Ping(_) => Ok(Frame::Control(ControlKind::Ping)),
        Message::Pong(_) => Ok(Frame::Control(ControlKind::Pong)),
        Message::Frame(_) => Ok(Frame::Control(ControlKind::Other)),
        Message::Close(frame) => {
            let (code, reason) = frame
                .map(|f| (Some(u16::from(f.code)), f.reason.to_string()))
                .unwrap_or((None, String::new()));
            Err(RelayError::StreamClosed { code, reason })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
    use tokio_tungstenite::tungstenite::protocol::CloseFrame;

    #[test]
    fn test_ws_url_shape() {
        assert_eq!(ws_url(9000, "events"), "ws://127.0.0.1:9000/events");
        assert_eq!(ws_url(9000, "/events/live"), "ws://127.0.0.1:9000/events/live");

        let v6: SocketAddr = "[::1]:9000".parse().unwrap();
        assert_eq!(ws_url_at(v6, "events"), "ws://[::1]:9000/events");
    }

    #[test]
    fn test_classify_frames() {
        assert_eq!(
            classify(Message::Text("hello".into())).unwrap(),
            Frame::Text("hello".to_string())
        );
        assert_eq!(
            classify(Message::Binary(Bytes::from_static(&[1, 2, 3]))).unwrap(),
            Frame::Binary(Bytes::from_static(&[1, 2, 3]))
        );
        assert_eq!(
            classify(Message::Ping(Bytes::new())).unwrap(),
            Frame::Control(ControlKind::Ping)
        );
        assert!(!classify(Message::Pong(Bytes::new())).unwrap().is_data());
    }

    #[test]
    fn test_close_is_terminal_error() {
        let err = classify(Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "done".into(),
        })))
        .unwrap_err();

        match err {
            RelayError::StreamClosed { code, reason } => {
                assert_eq!(code, Some(1000));
                assert_eq!(reason, "done");
            }
            other => panic!("unexpected error: {:?}", other),
        }

        assert!(classify(Message::Close(None)).unwrap_err().is_close());
    }
}
