//! The wire format shared by the server and the client: a text header
//! followed by a binary body.
//!
//! ```text
//! <type>:<size>:<source>:<payload bytes>
//! ```
//!
//! `type` and `size` are ASCII decimal integers, `source` is the
//! client identity (at most [`MAX_NAME`] bytes, never containing
//! `:`), and the payload is exactly `size` raw bytes that may contain
//! any byte value, including embedded `:` or NUL.

use anyhow::{anyhow, bail, Context};

use crate::consts::{MAX_DATA, MAX_NAME};

/// The packet type tag. Wire values are fixed by the protocol and
/// must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Login = 1,
    LoAck = 2,
    LoNak = 3,
    Exit = 4,
    Join = 5,
    JnAck = 6,
    JnNak = 7,
    LeaveSess = 8,
    LsAck = 9,
    LsNack = 10,
    NewSess = 11,
    NsAck = 12,
    NsNak = 13,
    Message = 14,
    MessageAck = 15,
    MessageNck = 16,
    Query = 17,
    QuAck = 18,
    QuNack = 19,
    Unknown = 20,
}

impl PacketType {
    fn from_u32(v: u32) -> anyhow::Result<Self> {
        use PacketType::*;
        Ok(match v {
            1 => Login,
            2 => LoAck,
            3 => LoNak,
            4 => Exit,
            5 => Join,
            6 => JnAck,
            7 => JnNak,
            8 => LeaveSess,
            9 => LsAck,
            10 => LsNack,
            11 => NewSess,
            12 => NsAck,
            13 => NsNak,
            14 => Message,
            15 => MessageAck,
            16 => MessageNck,
            17 => Query,
            18 => QuAck,
            19 => QuNack,
            20 => Unknown,
            other => bail!("unrecognized packet type {other}"),
        })
    }
}

/// A single unit of wire communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    /// Identity of the originating party. At most [`MAX_NAME`] bytes.
    pub source: String,
    /// Opaque payload bytes; semantics depend on `packet_type`.
    pub data: Vec<u8>,
}

impl Packet {
    pub fn new(packet_type: PacketType, source: impl Into<String>, data: Vec<u8>) -> Self {
        Packet { packet_type, source: source.into(), data }
    }

    /// Declared payload length. Always equal to `data.len()` for a
    /// packet built in-process; kept as a method (rather than a
    /// stored field) so it can never drift from the bytes it
    /// describes.
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Serialize to the wire format described at module level.
    pub fn serialize(&self) -> Vec<u8> {
        let header = format!("{}:{}:{}:", self.packet_type as u32, self.data.len(), self.source);
        let mut out = Vec::with_capacity(header.len() + self.data.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&self.data);
        out
    }

    /// Parse a packet out of a raw byte buffer. Scans for the third
    /// `:` byte; everything after it (up to the declared `size`, or
    /// fewer bytes if the buffer is short) is the payload. Binary
    /// bytes inside the payload, including further `:` characters,
    /// are never mistaken for header delimiters because scanning
    /// stops as soon as the third delimiter is found.
    pub fn parse(buf: &[u8]) -> anyhow::Result<Self> {
        let mut colons_seen = 0;
        let mut header_end = None;
        for (i, b) in buf.iter().enumerate() {
            if *b == b':' {
                colons_seen += 1;
                if colons_seen == 3 {
                    header_end = Some(i);
                    break;
                }
            }
        }
        let header_end = header_end.ok_or_else(|| anyhow!("packet header incomplete: fewer than 3 ':' found"))?;

        let header = std::str::from_utf8(&buf[..header_end]).context("packet header is not valid UTF-8")?;
        let mut parts = header.splitn(3, ':');
        let type_str = parts.next().ok_or_else(|| anyhow!("missing type field"))?;
        let size_str = parts.next().ok_or_else(|| anyhow!("missing size field"))?;
        let source = parts.next().ok_or_else(|| anyhow!("missing source field"))?;

        let type_val: u32 = type_str.parse().with_context(|| format!("invalid type field {type_str:?}"))?;
        let declared_size: usize = size_str.parse().with_context(|| format!("invalid size field {size_str:?}"))?;
        if source.len() > MAX_NAME {
            bail!("source field {} bytes exceeds MAX_NAME={}", source.len(), MAX_NAME);
        }
        if declared_size > MAX_DATA {
            bail!("declared size {declared_size} exceeds MAX_DATA={MAX_DATA}");
        }

        let payload_start = header_end + 1;
        let available = buf.len().saturating_sub(payload_start);
        if available < declared_size {
            bail!(
                "packet declares size {declared_size} but only {available} payload bytes are present"
            );
        }
        let data = buf[payload_start..payload_start + declared_size].to_vec();

        Ok(Packet { packet_type: PacketType::from_u32(type_val)?, source: source.to_string(), data })
    }
}

/// Builds a `LOGIN` request. Body is `"<user>,<pass>"`.
pub fn login_request(client_id: &str, password: &str) -> Packet {
    Packet::new(PacketType::Login, client_id, format!("{client_id},{password}").into_bytes())
}

/// Builds an `EXIT` request. Body is empty.
pub fn exit_request(client_id: &str) -> Packet {
    Packet::new(PacketType::Exit, client_id, Vec::new())
}

/// Builds a `QUERY` request. Body is `"<user>"`, echoed by the caller
/// and ignored by the server.
pub fn query_request(client_id: &str) -> Packet {
    Packet::new(PacketType::Query, client_id, client_id.as_bytes().to_vec())
}

/// Builds a `MESSAGE` request. Body is `"<room>;<text>"`.
pub fn message_request(client_id: &str, room: &str, text: &str) -> Packet {
    Packet::new(PacketType::Message, client_id, format!("{room};{text}").into_bytes())
}

/// Builds a `NEW_SESS` request. Body is `"<room>"`.
pub fn new_session_request(client_id: &str, room: &str) -> Packet {
    Packet::new(PacketType::NewSess, client_id, room.as_bytes().to_vec())
}

/// Builds a `JOIN` request. Body is `"<room>"`.
pub fn join_request(client_id: &str, room: &str) -> Packet {
    Packet::new(PacketType::Join, client_id, room.as_bytes().to_vec())
}

/// Builds a `LEAVE_SESS` request. Body is `"<room>"`.
pub fn leave_request(client_id: &str, room: &str) -> Packet {
    Packet::new(PacketType::LeaveSess, client_id, room.as_bytes().to_vec())
}

/// Splits a `MESSAGE` body of the form `"<room>;<text>"` into its two
/// parts. Returns `None` if there is no `;` delimiter.
pub fn split_message_body(data: &[u8]) -> Option<(&str, &[u8])> {
    let idx = data.iter().position(|b| *b == b';')?;
    let room = std::str::from_utf8(&data[..idx]).ok()?;
    Some((room, &data[idx + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_request_constructor() {
        let cases = vec![
            login_request("alice", "hunter2"),
            exit_request("alice"),
            query_request("alice"),
            message_request("alice", "room1", "hello world"),
            new_session_request("alice", "room1"),
            join_request("alice", "room1"),
            leave_request("alice", "room1"),
        ];
        for packet in cases {
            let bytes = packet.serialize();
            let parsed = Packet::parse(&bytes).expect("parse should succeed");
            assert_eq!(parsed.packet_type, packet.packet_type);
            assert_eq!(parsed.source, packet.source);
            assert_eq!(parsed.data, packet.data);
        }
    }

    #[test]
    fn preserves_binary_payload_with_embedded_colons_and_nuls() {
        let data = b"room;bin:\0ary:data\0with:colons".to_vec();
        let packet = Packet::new(PacketType::Message, "bob", data.clone());
        let bytes = packet.serialize();
        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed.data, data);
        assert_eq!(parsed.size(), data.len());
    }

    #[test]
    fn rejects_header_with_too_few_delimiters() {
        let err = Packet::parse(b"1:2:bob").unwrap_err();
        assert!(err.to_string().contains("fewer than 3"));
    }

    #[test]
    fn rejects_unparsable_integers() {
        let err = Packet::parse(b"abc:2:bob:hi").unwrap_err();
        assert!(err.to_string().contains("invalid type field"));
    }

    #[test]
    fn rejects_source_over_max_name() {
        let long_source = "x".repeat(MAX_NAME + 1);
        let header = format!("1:0:{long_source}:");
        let err = Packet::parse(header.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("MAX_NAME"));
    }

    #[test]
    fn rejects_declared_size_exceeding_available_bytes() {
        // declares 10 bytes of payload but only supplies 2
        let err = Packet::parse(b"1:10:bob:hi").unwrap_err();
        assert!(err.to_string().contains("only 2 payload bytes"));
    }

    #[test]
    fn split_message_body_separates_room_and_text() {
        let (room, text) = split_message_body(b"room1;hello world").unwrap();
        assert_eq!(room, "room1");
        assert_eq!(text, b"hello world");
    }

    #[test]
    fn split_message_body_none_without_semicolon() {
        assert!(split_message_body(b"noroomhere").is_none());
    }
}
