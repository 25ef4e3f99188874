//! TCP transport framed by a 4-byte big-endian length prefix.

use futures_util::{future, SinkExt, StreamExt};
use snafu::prelude::*;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::{error, Connector, Frame, Link, TransportError};

/// Largest frame accepted by default
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Length prefixed codec used on the wire
pub fn codec(max_frame_length: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .big_endian()
        .max_frame_length(max_frame_length)
        .new_codec()
}

/// Connects to a TCP endpoint, every frame is written with its length prefix
#[derive(Debug, Clone)]
pub struct TcpConnector {
    addr: String,
    max_frame_length: usize,
}

impl TcpConnector {
    /// Create connector for `host:port`
    pub fn new<S: Into<String>>(addr: S) -> Self {
        Self {
            addr: addr.into(),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    /// Change max frame length
    pub fn max_frame_length(mut self, len: usize) -> Self {
        self.max_frame_length = len;
        self
    }
}

#[async_trait::async_trait]
impl Connector for TcpConnector {
    async fn connect(&self) -> Result<Link, TransportError> {
        log::debug!("Connecting tcp endpoint: {}", self.addr);

        let stream = TcpStream::connect(&self.addr)
            .await
            .with_context(|_| error::Connect { addr: &self.addr })?;
        stream.set_nodelay(true).context(error::Io)?;

        let (sink, stream) = Framed::new(stream, codec(self.max_frame_length)).split();

        let sink = sink
            .sink_map_err(|source| TransportError::Io { source })
            .with(|frame: Frame| future::ready(Ok::<_, TransportError>(frame.into_bytes())));
        let stream = stream.map(|item| {
            item.map(|buf| Frame::Binary(buf.freeze()))
                .map_err(|source| TransportError::Io { source })
        });

        Ok(Link::new(sink, stream))
    }
}

#[cfg(test)]
mod test {
    use bytes::{BufMut, BytesMut};
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    use super::*;

    #[tokio::test]
    async fn test_tcp_length_prefix_on_wire() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();

            let mut buf = [0u8; 7];
            socket.read_exact(&mut buf).await.unwrap();
            assert_eq!(buf, [0, 0, 0, 3, b'a', b'b', b'c']);

            let mut reply = BytesMut::new();
            reply.put_u32(2);
            reply.put_slice(b"ok");
            socket.write_all(&reply).await.unwrap();
        });

        let mut link = TcpConnector::new(addr).connect().await.unwrap();
        link.sink.send(Frame::from(b"abc".to_vec())).await.unwrap();

        let got = link.stream.next().await.unwrap().unwrap();
        assert_eq!(got, Frame::from(b"ok".to_vec()));

        server.await.unwrap();
        assert!(link.stream.next().await.is_none());
    }
}
