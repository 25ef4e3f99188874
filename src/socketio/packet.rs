use std::fmt::Write;

use snafu::prelude::*;

use super::{error, ProtocolError};

/// Socket.IO packet type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    /// namespace connect request or its acknowledgement
    Connect,
    /// namespace disconnect
    Disconnect,
    /// event
    Event,
    /// acknowledgement of an event
    Ack,
    /// namespace connect refused
    ConnectError,
    /// event with attachments
    BinaryEvent,
    /// acknowledgement with attachments
    BinaryAck,
}

impl PacketType {
    /// wire digit
    pub fn as_char(&self) -> char {
        match self {
            Self::Connect => '0',
            Self::Disconnect => '1',
            Self::Event => '2',
            Self::Ack => '3',
            Self::ConnectError => '4',
            Self::BinaryEvent => '5',
            Self::BinaryAck => '6',
        }
    }

    fn from_char(c: char) -> Option<Self> {
        let t = match c {
            '0' => Self::Connect,
            '1' => Self::Disconnect,
            '2' => Self::Event,
            '3' => Self::Ack,
            '4' => Self::ConnectError,
            '5' => Self::BinaryEvent,
            '6' => Self::BinaryAck,
            _ => return None,
        };
        Some(t)
    }

    /// true for types carrying attachments
    pub fn is_binary(&self) -> bool {
        matches!(self, Self::BinaryEvent | Self::BinaryAck)
    }
}

/// The default namespace
pub const DEFAULT_NAMESPACE: &str = "/";

/// Most attachments one binary packet may declare
pub const MAX_ATTACHMENTS: usize = 1024;

/// A Socket.IO packet with placeholders in place of binary data
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// type
    pub packet_type: PacketType,
    /// namespace path
    pub namespace: String,
    /// ack id
    pub ack_id: Option<u32>,
    /// JSON payload
    pub payload: Option<serde_json::Value>,
    /// attachment frames following this packet
    pub attachments: usize,
}

impl Packet {
    /// Create a packet without attachments
    pub fn new<S: Into<String>>(
        packet_type: PacketType,
        namespace: S,
        ack_id: Option<u32>,
        payload: Option<serde_json::Value>,
    ) -> Self {
        Self {
            packet_type,
            namespace: namespace.into(),
            ack_id,
            payload,
            attachments: 0,
        }
    }

    /// Encode as the body of an Engine.IO message packet
    pub fn encode(&self) -> String {
        let mut s = String::new();
        s.push(self.packet_type.as_char());

        // writing into a String can not fail
        if self.packet_type.is_binary() {
            let _ = write!(s, "{}-", self.attachments);
        }
        if self.namespace != DEFAULT_NAMESPACE {
            s.push_str(&self.namespace);
            s.push(',');
        }
        if let Some(id) = self.ack_id {
            let _ = write!(s, "{}", id);
        }
        if let Some(payload) = &self.payload {
            s.push_str(&payload.to_string());
        }
        s
    }

    /// Decode the body of an Engine.IO message packet
    pub fn decode(s: &str) -> Result<Self, ProtocolError> {
        let mut rest = s;

        let c = rest.chars().next().context(error::Empty)?;
        let packet_type = PacketType::from_char(c).context(error::UnknownPacketType { c })?;
        rest = &rest[c.len_utf8()..];

        let mut attachments = 0;
        if packet_type.is_binary() {
            let dash = rest.find('-').context(error::BadAttachmentCount)?;
            attachments = rest[..dash]
                .parse::<usize>()
                .ok()
                .context(error::BadAttachmentCount)?;
            ensure!(attachments <= MAX_ATTACHMENTS, error::BadAttachmentCount);
            rest = &rest[dash + 1..];
        }

        let mut namespace = DEFAULT_NAMESPACE.to_string();
        if rest.starts_with('/') {
            match rest.find(',') {
                Some(comma) => {
                    namespace = rest[..comma].to_string();
                    rest = &rest[comma + 1..];
                }
                None => {
                    namespace = rest.to_string();
                    rest = "";
                }
            }
        }

        let digits = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let ack_id = match digits {
            0 => None,
            n => Some(rest[..n].parse::<u32>().ok().context(error::BadAckId)?),
        };
        rest = &rest[digits..];

        let payload = match rest {
            "" => None,
            json => Some(serde_json::from_str(json).context(error::Json)?),
        };

        let packet = Self {
            packet_type,
            namespace,
            ack_id,
            payload,
            attachments,
        };
        packet.validate()?;
        Ok(packet)
    }

    fn validate(&self) -> Result<(), ProtocolError> {
        let payload = self.payload.as_ref();
        let valid = match self.packet_type {
            PacketType::Connect => payload.map_or(true, |p| p.is_object()),
            PacketType::Disconnect => payload.is_none(),
            PacketType::ConnectError => payload.map_or(false, |p| p.is_object() || p.is_string()),
            PacketType::Event | PacketType::BinaryEvent => payload
                .and_then(|p| p.as_array())
                .and_then(|items| items.first())
                .map_or(false, |name| name.is_string()),
            PacketType::Ack | PacketType::BinaryAck => {
                self.ack_id.is_some() && payload.map_or(false, |p| p.is_array())
            }
        };

        ensure!(
            valid,
            error::BadPayload {
                packet_type: self.packet_type
            }
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_decode_fields() {
        let p = Packet::decode(r#"2/chat,12["msg","hi"]"#).unwrap();
        assert_eq!(p.packet_type, PacketType::Event);
        assert_eq!(p.namespace, "/chat");
        assert_eq!(p.ack_id, Some(12));
        assert_eq!(p.payload, Some(json!(["msg", "hi"])));
        assert_eq!(p.attachments, 0);

        let p = Packet::decode(r#"51-["up",{"_placeholder":true,"num":0}]"#).unwrap();
        assert_eq!(p.packet_type, PacketType::BinaryEvent);
        assert_eq!(p.namespace, "/");
        assert_eq!(p.attachments, 1);

        let p = Packet::decode("0/admin,").unwrap();
        assert_eq!(p.packet_type, PacketType::Connect);
        assert_eq!(p.namespace, "/admin");
        assert_eq!(p.payload, None);

        let p = Packet::decode(r#"0{"sid":"x"}"#).unwrap();
        assert_eq!(p.payload, Some(json!({"sid": "x"})));

        let p = Packet::decode("1/chat").unwrap();
        assert_eq!(p.packet_type, PacketType::Disconnect);
        assert_eq!(p.namespace, "/chat");
    }

    #[test]
    fn test_encode_matches_decode() {
        let mut p = Packet::new(PacketType::BinaryAck, "/chat", Some(7), Some(json!([1])));
        p.attachments = 2;
        assert_eq!(p.encode(), "62-/chat,7[1]");
        assert_eq!(Packet::decode(&p.encode()).unwrap(), p);

        let p = Packet::new(PacketType::Connect, "/", None, None);
        assert_eq!(p.encode(), "0");
    }

    #[test]
    fn test_decode_errors() {
        assert!(matches!(Packet::decode(""), Err(ProtocolError::Empty)));
        assert!(matches!(
            Packet::decode("9"),
            Err(ProtocolError::UnknownPacketType { c: '9' })
        ));
        assert!(matches!(
            Packet::decode(r#"5x-["a"]"#),
            Err(ProtocolError::BadAttachmentCount)
        ));
        assert!(matches!(
            Packet::decode(r#"2["a""#),
            Err(ProtocolError::Json { .. })
        ));
        assert!(matches!(
            Packet::decode(r#"2[1]"#),
            Err(ProtocolError::BadPayload { .. })
        ));
        assert!(matches!(
            Packet::decode(r#"3["no id"]"#),
            Err(ProtocolError::BadPayload { .. })
        ));
        assert!(matches!(
            Packet::decode("299999999999[\"a\"]"),
            Err(ProtocolError::BadAckId)
        ));
    }

    #[test]
    fn test_attachment_count_is_bounded() {
        let p = Packet::decode(r#"51024-["a"]"#).unwrap();
        assert_eq!(p.attachments, MAX_ATTACHMENTS);

        for count in ["1025", "1000000000000000000", "100000000000000000000"] {
            let body = format!(r#"5{}-["x",{{"_placeholder":true,"num":0}}]"#, count);
            assert!(matches!(
                Packet::decode(&body),
                Err(ProtocolError::BadAttachmentCount)
            ));
        }
    }
}
