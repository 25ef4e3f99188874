//! Socket.IO packets to and from transport frames.

use std::mem;

use bytes::Bytes;
use snafu::prelude::*;

use super::{
    engine::{self, PacketType as EngineType},
    error,
    packet::{Packet, PacketType},
    value::{self, Value},
    ProtocolError,
};
use crate::transport::Frame;

/// A decoded packet with its attachments put back in place
#[derive(Debug, Clone, PartialEq)]
pub struct Incoming {
    /// packet type, binary types already merged
    pub packet_type: PacketType,
    /// namespace path
    pub namespace: String,
    /// ack id
    pub ack_id: Option<u32>,
    /// payload
    pub payload: Option<Value>,
}

impl Incoming {
    fn assemble(packet: Packet, attachments: &[Bytes]) -> Result<Self, ProtocolError> {
        let payload = packet
            .payload
            .map(|json| value::reconstruct(json, attachments))
            .transpose()?;

        let packet_type = match packet.packet_type {
            PacketType::BinaryEvent => PacketType::Event,
            PacketType::BinaryAck => PacketType::Ack,
            other => other,
        };

        Ok(Self {
            packet_type,
            namespace: packet.namespace,
            ack_id: packet.ack_id,
            payload,
        })
    }
}

/// Frames of one outbound packet, the text frame first then the attachments.
///
/// Event and Ack turn into their binary types when the payload holds binary data.
pub fn encode(
    packet_type: PacketType,
    namespace: &str,
    ack_id: Option<u32>,
    payload: Option<Value>,
) -> Vec<Frame> {
    let (json, attachments) = match payload {
        Some(value) => {
            let (json, attachments) = value::deconstruct(value);
            (Some(json), attachments)
        }
        None => (None, Vec::new()),
    };

    let packet_type = match packet_type {
        PacketType::Event if !attachments.is_empty() => PacketType::BinaryEvent,
        PacketType::Ack if !attachments.is_empty() => PacketType::BinaryAck,
        other => other,
    };

    let mut packet = Packet::new(packet_type, namespace, ack_id, json);
    packet.attachments = attachments.len();

    let mut frames = Vec::with_capacity(1 + attachments.len());
    frames.push(engine::frame(EngineType::Message, &packet.encode()));
    frames.extend(attachments.into_iter().map(Frame::Binary));
    frames
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Idle,
    Buffering {
        packet: Packet,
        attachments: Vec<Bytes>,
    },
}

/// Reassembles binary packets from a text frame and its attachment frames.
#[derive(Debug, Default)]
pub struct Decoder {
    state: State,
}

impl Decoder {
    /// Create an idle decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// true while waiting attachments
    pub fn is_buffering(&self) -> bool {
        matches!(self.state, State::Buffering { .. })
    }

    /// Discard a partially received packet.
    ///
    /// Called before a new text packet and when the transport closes, an
    /// error tells a packet was lost.
    pub fn interrupt(&mut self) -> Result<(), ProtocolError> {
        match mem::take(&mut self.state) {
            State::Idle => Ok(()),
            State::Buffering {
                packet,
                attachments,
            } => error::Interrupted {
                expected: packet.attachments,
                received: attachments.len(),
            }
            .fail(),
        }
    }

    /// Decode a Socket.IO packet, `None` if it waits attachments
    pub fn decode_text(&mut self, body: &str) -> Result<Option<Incoming>, ProtocolError> {
        let packet = Packet::decode(body)?;

        if packet.attachments == 0 {
            return Incoming::assemble(packet, &[]).map(Some);
        }

        log::trace!("Packet waits {} attachments", packet.attachments);

        self.state = State::Buffering {
            attachments: Vec::new(),
            packet,
        };
        Ok(None)
    }

    /// Take one attachment frame, the packet once complete
    pub fn push_binary(&mut self, data: Bytes) -> Result<Option<Incoming>, ProtocolError> {
        let (packet, mut attachments) = match mem::take(&mut self.state) {
            State::Idle => return error::UnexpectedBinary { len: data.len() }.fail(),
            State::Buffering {
                packet,
                attachments,
            } => (packet, attachments),
        };

        attachments.push(data);

        if attachments.len() < packet.attachments {
            self.state = State::Buffering {
                packet,
                attachments,
            };
            return Ok(None);
        }

        Incoming::assemble(packet, &attachments).map(Some)
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    fn text(frame: &Frame) -> &str {
        match frame {
            Frame::Text(s) => s,
            Frame::Binary(_) => panic!("expected text frame"),
        }
    }

    #[test]
    fn test_binary_event_round_trip() {
        let payload = Value::Array(vec![
            Value::from("upload"),
            Value::from("name.bin"),
            Value::from(vec![0xdeu8, 0xad]),
        ]);
        let frames = encode(PacketType::Event, "/", None, Some(payload.clone()));

        assert_eq!(frames.len(), 2);
        assert_eq!(
            text(&frames[0]),
            r#"451-["upload","name.bin",{"_placeholder":true,"num":0}]"#
        );
        assert_eq!(frames[1], Frame::from(vec![0xdeu8, 0xad]));

        let mut decoder = Decoder::new();
        let body = &text(&frames[0])[1..];
        assert_eq!(decoder.decode_text(body).unwrap(), None);
        assert!(decoder.is_buffering());

        let incoming = decoder
            .push_binary(frames[1].clone().into_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(incoming.packet_type, PacketType::Event);
        assert_eq!(incoming.payload, Some(payload));
        assert!(!decoder.is_buffering());
    }

    #[test]
    fn test_plain_event_has_no_attachments() {
        let frames = encode(
            PacketType::Event,
            "/chat",
            Some(3),
            Some(Value::from(json!(["msg", "hi"]))),
        );
        assert_eq!(frames, vec![Frame::from(r#"42/chat,3["msg","hi"]"#)]);
    }

    #[test]
    fn test_huge_attachment_count_is_rejected() {
        let mut decoder = Decoder::new();
        assert!(matches!(
            decoder.decode_text(r#"51000000000000000000-["x",{"_placeholder":true,"num":0}]"#),
            Err(ProtocolError::BadAttachmentCount)
        ));
        assert!(!decoder.is_buffering());
    }

    #[test]
    fn test_interrupted_packet_is_discarded() {
        let mut decoder = Decoder::new();
        assert_eq!(
            decoder
                .decode_text(r#"52-["two",{"_placeholder":true,"num":0},{"_placeholder":true,"num":1}]"#)
                .unwrap(),
            None
        );
        assert_eq!(decoder.push_binary(Bytes::from_static(b"a")).unwrap(), None);

        assert!(matches!(
            decoder.interrupt(),
            Err(ProtocolError::Interrupted {
                expected: 2,
                received: 1
            })
        ));
        assert!(!decoder.is_buffering());
        assert!(decoder.interrupt().is_ok());

        // a stray attachment is not taken as a packet
        assert!(matches!(
            decoder.push_binary(Bytes::from_static(b"b")),
            Err(ProtocolError::UnexpectedBinary { len: 1 })
        ));
    }
}
