// framed_peer: A frame-level WebSocket peer for protocol-conformance tests.
//
// Speaks raw protocol frames against a listening endpoint, with no session
// machinery of its own: tests decide exactly what goes on the wire and in
// which order.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use psc_protocol::{Frame, ProtocolVersion};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct FramedPeer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl FramedPeer {
    pub async fn connect(addr: SocketAddr) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws, _response) = tokio_tungstenite::connect_async(format!("ws://{addr}/")).await?;
        Ok(FramedPeer { ws })
    }

    pub async fn send(&mut self, frame: &Frame) {
        self.ws
            .send(Message::Text(frame.encode().into()))
            .await
            .expect("send failed");
    }

    /// Next protocol frame, answering transport pings along the way.
    /// `None` means the peer closed (close frame, EOF, or transport error).
    pub async fn recv(&mut self) -> Option<Frame> {
        loop {
            let msg = timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for frame")?;
            match msg {
                Ok(Message::Text(raw)) => {
                    return Some(Frame::decode(&raw).expect("peer sent undecodable frame"));
                }
                Ok(Message::Ping(data)) => {
                    let _ = self.ws.send(Message::Pong(data)).await;
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    /// Assert that the peer closes the connection (with or without a close
    /// frame) without sending another protocol frame first.
    pub async fn expect_close(&mut self) {
        if let Some(frame) = self.recv().await {
            panic!("expected close, got frame {frame:?}");
        }
    }

    /// Act as a consumer: declare `versions` and return the producer's
    /// version choice.
    pub async fn declare_versions(&mut self, versions: &[ProtocolVersion]) -> Option<Frame> {
        self.send(&Frame::DeclaredVersions(versions.to_vec())).await;
        self.recv().await
    }

    /// Send a clean close frame.
    pub async fn close(&mut self) {
        let _ = self.ws.send(Message::Close(None)).await;
    }
}
