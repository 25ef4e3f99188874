//! Websocket transport, text and binary messages map to frames one to one.

use futures_util::{future, SinkExt, StreamExt};
use snafu::prelude::*;
use tokio_tungstenite as websocket;
use websocket::tungstenite::{self, Message};

use super::{error, Connector, Frame, Link, TransportError};

pub(crate) type WebsocketClient =
    websocket::WebSocketStream<websocket::MaybeTlsStream<tokio::net::TcpStream>>;

/// Connects to a `ws://` or `wss://` endpoint
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    /// Create connector for websocket url
    pub fn new<S: Into<String>>(url: S) -> Self {
        Self { url: url.into() }
    }

    /// target url
    pub fn url(&self) -> &str {
        &self.url
    }
}

fn to_frame(item: Result<Message, tungstenite::Error>) -> Option<Result<Frame, TransportError>> {
    match item {
        Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
        Ok(Message::Binary(data)) => Some(Ok(Frame::Binary(data.into()))),
        Ok(Message::Close(frame)) => {
            log::debug!("Websocket close frame received: {:?}", frame);
            None
        }
        // ping/pong are answered by tungstenite itself
        Ok(_) => None,
        Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => None,
        Err(source) => Some(Err(TransportError::Websocket { source })),
    }
}

#[async_trait::async_trait]
impl Connector for WsConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        log::debug!("Connecting websocket: {}", self.url);

        let (ws, _): (WebsocketClient, _) = websocket::connect_async(self.url.as_str())
            .await
            .context(error::Websocket)?;

        let (sink, stream) = ws.split();

        let sink = sink
            .sink_map_err(|source| TransportError::Websocket { source })
            .with(|frame: Frame| {
                let message = match frame {
                    Frame::Text(text) => Message::Text(text),
                    Frame::Binary(data) => Message::Binary(data.to_vec()),
                };
                future::ready(Ok::<_, TransportError>(message))
            });
        let stream = stream.filter_map(|item| future::ready(to_frame(item)));

        Ok(Link::new(sink, stream))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_message_to_frame() {
        assert_eq!(
            to_frame(Ok(Message::Text("40".to_string()))).unwrap().unwrap(),
            Frame::Text("40".to_string())
        );
        assert_eq!(
            to_frame(Ok(Message::Binary(vec![1, 2]))).unwrap().unwrap(),
            Frame::from(vec![1u8, 2])
        );
        assert!(to_frame(Ok(Message::Ping(vec![]))).is_none());
        assert!(to_frame(Ok(Message::Close(None))).is_none());
        assert!(to_frame(Err(tungstenite::Error::ConnectionClosed)).is_none());
        assert!(matches!(
            to_frame(Err(tungstenite::Error::Utf8)),
            Some(Err(TransportError::Websocket { .. }))
        ));
    }
}
