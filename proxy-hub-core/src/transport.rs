use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use proxy_hub_error::{HubError, HubResult};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    connect_async,
    tungstenite::protocol::Message,
    MaybeTlsStream, WebSocketStream,
};
use tracing::{debug, trace};

/// One open broker socket. Text-frame oriented; protocol-level ping/pong is
/// handled inside the implementation.
#[async_trait]
pub trait BrokerSocket: Send {
    async fn send(&mut self, text: String) -> HubResult<()>;
    /// Next text frame; `None` means the peer closed the socket.
    async fn next(&mut self) -> Option<HubResult<String>>;
    async fn close(&mut self);
}

/// Factory for broker sockets, the seam the connection actor dials through.
#[async_trait]
pub trait BrokerTransport: Send + Sync {
    async fn connect(&self, url: &str) -> HubResult<Box<dyn BrokerSocket>>;
}

/// WebSocket transport over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct WsTransport;

#[async_trait]
impl BrokerTransport for WsTransport {
    async fn connect(&self, url: &str) -> HubResult<Box<dyn BrokerSocket>> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| HubError::Transmission(format!("websocket connect failed: {e}")))?;
        debug!(status = %response.status(), "websocket established");
        Ok(Box::new(WsSocket { inner: stream }))
    }
}

struct WsSocket {
    inner: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl BrokerSocket for WsSocket {
    async fn send(&mut self, text: String) -> HubResult<()> {
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| HubError::Transmission(format!("websocket send failed: {e}")))
    }

    async fn next(&mut self) -> Option<HubResult<String>> {
        loop {
            match self.inner.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text.to_string())),
                Ok(Message::Ping(payload)) => {
                    if let Err(e) = self.inner.send(Message::Pong(payload)).await {
                        return Some(Err(HubError::Transmission(format!(
                            "websocket pong failed: {e}"
                        ))));
                    }
                }
                Ok(Message::Close(_)) => return None,
                Ok(other) => trace!(?other, "ignoring non-text websocket frame"),
                Err(e) => {
                    return Some(Err(HubError::Transmission(format!(
                        "websocket receive failed: {e}"
                    ))))
                }
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.inner.close(None).await;
    }
}
