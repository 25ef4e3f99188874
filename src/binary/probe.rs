use super::{Header, Packet};
use crate::{
    heartbeat::{Beat, HeartbeatProbe},
    transport::Frame,
};

/// Active heartbeat of the binary protocol.
///
/// Writes a heartbeat header with `isResponse = 0` at every tick, answers the
/// peer's own pings by echoing the header with `isResponse = 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryProbe;

impl HeartbeatProbe for BinaryProbe {
    fn ping(&self) -> Option<Frame> {
        Some(Frame::Binary(
            Packet::new(Header::heartbeat(), bytes::Bytes::new()).encode(),
        ))
    }

    fn classify(&self, frame: &Frame) -> Beat {
        let data = match frame {
            Frame::Binary(data) => data.clone(),
            Frame::Text(_) => return Beat::Data,
        };

        match Packet::decode(data) {
            Ok(packet) if packet.header.is_heartbeat() => {
                if packet.header.is_response {
                    Beat::Pong
                } else {
                    let echo = Packet::new(packet.header.to_response(), packet.payload);
                    Beat::Ping(Some(Frame::Binary(echo.encode())))
                }
            }
            // malformed frames are reported by the client decoder
            _ => Beat::Data,
        }
    }
}
