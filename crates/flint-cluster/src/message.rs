//! Binary wire format for the cluster bus.
//!
//! Every message starts with the same fixed header: signature, protocol
//! version, total length, gossip count, type tag, then the sender's identity
//! and its master-view slot bitmap, master identity, client port, node
//! flags, cluster state, message flags, and the three 64-bit counters
//! (currentEpoch, configEpoch, replication offset). A type-specific payload
//! follows. All multi-byte integers are network byte order.
//!
//! Decoding validates that the declared total length matches the expected
//! size for the type; any mismatch is an error and the caller drops the
//! packet without replying.

use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ids::NODE_ID_LEN;
use crate::node::NodeFlags;
use crate::slots::{SlotBitmap, SLOT_BITMAP_LEN};
use crate::NodeId;

/// First four bytes of every bus message.
pub const SIGNATURE: [u8; 4] = *b"RCmb";

/// Protocol version; packets from any other version are dropped.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header length in bytes.
pub const HEADER_LEN: usize = 4 + 2 + 4 + 2 + 2 + NODE_ID_LEN + SLOT_BITMAP_LEN + NODE_ID_LEN + 2 + 2 + 1 + 1 + 8 + 8 + 8;

/// One gossip entry in a PING/PONG/MEET payload.
pub const GOSSIP_ENTRY_LEN: usize = NODE_ID_LEN + 8 + 8 + HOST_LEN + 2 + 2;

/// Fixed width of a host field on the wire (fits an IPv6 literal).
pub const HOST_LEN: usize = 46;

/// Upper bound on a frame; anything larger is treated as a framing error.
pub const MAX_FRAME_LEN: usize = HEADER_LEN + 1024 * GOSSIP_ENTRY_LEN + 64 * 1024;

/// Header flag: sender is a master paused for a manual failover.
pub const MFLAG_PAUSED: u8 = 1 << 0;
/// Header flag: grant the failover vote even though the master is alive
/// (manual failover).
pub const MFLAG_FORCEACK: u8 = 1 << 1;

/// Message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum MessageType {
    Ping = 0,
    Pong = 1,
    Meet = 2,
    Fail = 3,
    Publish = 4,
    FailoverAuthRequest = 5,
    FailoverAuthAck = 6,
    MfStart = 7,
    Update = 8,
}

impl MessageType {
    fn from_u16(v: u16) -> Option<Self> {
        Some(match v {
            0 => Self::Ping,
            1 => Self::Pong,
            2 => Self::Meet,
            3 => Self::Fail,
            4 => Self::Publish,
            5 => Self::FailoverAuthRequest,
            6 => Self::FailoverAuthAck,
            7 => Self::MfStart,
            8 => Self::Update,
            _ => return None,
        })
    }
}

/// The fixed header carried by every bus message.
///
/// For a replica the slot bitmap and configEpoch describe its *master's*
/// claims; the flags still identify the sender as a replica so receivers
/// know the claims are second-hand.
#[derive(Debug, Clone)]
pub struct MessageHeader {
    pub sender: NodeId,
    pub slots: SlotBitmap,
    /// The sender's master, or `None` if the sender is a master itself.
    pub replicates: Option<NodeId>,
    /// Sender's client port; bus port is this plus the cluster offset.
    pub port: u16,
    pub flags: NodeFlags,
    /// Sender's view of the aggregate cluster state.
    pub state_fail: bool,
    pub mflags: u8,
    pub current_epoch: u64,
    pub config_epoch: u64,
    pub repl_offset: u64,
}

/// One peer described in a gossip section.
#[derive(Debug, Clone, PartialEq)]
pub struct GossipEntry {
    pub node: NodeId,
    /// Sender's last ping-sent / pong-received times for that peer.
    pub ping_sent: u64,
    pub pong_received: u64,
    pub host: String,
    pub port: u16,
    pub flags: NodeFlags,
}

/// Type-specific payload.
#[derive(Debug, Clone)]
pub enum MessageBody {
    Ping(Vec<GossipEntry>),
    Pong(Vec<GossipEntry>),
    Meet(Vec<GossipEntry>),
    /// Quorum-confirmed failure of the named node.
    Fail { node: NodeId },
    /// Opaque pub/sub payload relayed across the bus.
    Publish { channel: Bytes, message: Bytes },
    FailoverAuthRequest,
    FailoverAuthAck,
    MfStart,
    /// A master's slot configuration, pushed at peers with a stale view.
    Update {
        node: NodeId,
        config_epoch: u64,
        slots: SlotBitmap,
    },
}

/// A complete bus message.
#[derive(Debug, Clone)]
pub struct Message {
    pub header: MessageHeader,
    pub body: MessageBody,
}

impl Message {
    pub fn kind(&self) -> MessageType {
        match &self.body {
            MessageBody::Ping(_) => MessageType::Ping,
            MessageBody::Pong(_) => MessageType::Pong,
            MessageBody::Meet(_) => MessageType::Meet,
            MessageBody::Fail { .. } => MessageType::Fail,
            MessageBody::Publish { .. } => MessageType::Publish,
            MessageBody::FailoverAuthRequest => MessageType::FailoverAuthRequest,
            MessageBody::FailoverAuthAck => MessageType::FailoverAuthAck,
            MessageBody::MfStart => MessageType::MfStart,
            MessageBody::Update { .. } => MessageType::Update,
        }
    }

    /// Gossip entries, if this is a PING/PONG/MEET.
    pub fn gossip(&self) -> Option<&[GossipEntry]> {
        match &self.body {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => Some(g),
            _ => None,
        }
    }

    /// Serializes the message, filling in the signature, version, count and
    /// total length.
    pub fn encode(&self) -> Bytes {
        let (count, body_len) = match &self.body {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => {
                (g.len() as u16, g.len() * GOSSIP_ENTRY_LEN)
            }
            MessageBody::Fail { .. } => (0, NODE_ID_LEN),
            MessageBody::Publish { channel, message } => (0, 8 + channel.len() + message.len()),
            MessageBody::FailoverAuthRequest
            | MessageBody::FailoverAuthAck
            | MessageBody::MfStart => (0, 0),
            MessageBody::Update { .. } => (0, NODE_ID_LEN + 8 + SLOT_BITMAP_LEN),
        };
        let totlen = HEADER_LEN + body_len;
        let mut buf = BytesMut::with_capacity(totlen);

        buf.put_slice(&SIGNATURE);
        buf.put_u16(PROTOCOL_VERSION);
        buf.put_u32(totlen as u32);
        buf.put_u16(count);
        buf.put_u16(self.kind() as u16);
        buf.put_slice(self.header.sender.as_bytes());
        buf.put_slice(self.header.slots.as_raw());
        match self.header.replicates {
            Some(master) => buf.put_slice(master.as_bytes()),
            None => buf.put_bytes(0, NODE_ID_LEN),
        }
        buf.put_u16(self.header.port);
        buf.put_u16(self.header.flags.bits());
        buf.put_u8(self.header.state_fail as u8);
        buf.put_u8(self.header.mflags);
        buf.put_u64(self.header.current_epoch);
        buf.put_u64(self.header.config_epoch);
        buf.put_u64(self.header.repl_offset);
        debug_assert_eq!(buf.len(), HEADER_LEN);

        match &self.body {
            MessageBody::Ping(g) | MessageBody::Pong(g) | MessageBody::Meet(g) => {
                for entry in g {
                    encode_gossip_entry(&mut buf, entry);
                }
            }
            MessageBody::Fail { node } => buf.put_slice(node.as_bytes()),
            MessageBody::Publish { channel, message } => {
                buf.put_u32(channel.len() as u32);
                buf.put_u32(message.len() as u32);
                buf.put_slice(channel);
                buf.put_slice(message);
            }
            MessageBody::FailoverAuthRequest
            | MessageBody::FailoverAuthAck
            | MessageBody::MfStart => {}
            MessageBody::Update {
                node,
                config_epoch,
                slots,
            } => {
                buf.put_slice(node.as_bytes());
                buf.put_u64(*config_epoch);
                buf.put_slice(slots.as_raw());
            }
        }
        debug_assert_eq!(buf.len(), totlen);
        buf.freeze()
    }

    /// Parses and validates one complete frame.
    pub fn decode(buf: &[u8]) -> io::Result<Message> {
        if buf.len() < HEADER_LEN {
            return Err(err_data("message shorter than header"));
        }
        let mut cur = buf;

        let mut sig = [0u8; 4];
        cur.read_exact(&mut sig)?;
        if sig != SIGNATURE {
            return Err(err_data("bad signature"));
        }
        if cur.get_u16() != PROTOCOL_VERSION {
            return Err(err_data("protocol version mismatch"));
        }
        let totlen = cur.get_u32() as usize;
        if totlen != buf.len() {
            return Err(err_data("total length does not match frame"));
        }
        let count = cur.get_u16() as usize;
        let type_tag = cur.get_u16();
        let Some(kind) = MessageType::from_u16(type_tag) else {
            return Err(err_data("unknown message type"));
        };

        let sender = read_node_id(&mut cur)?;
        let mut slots_raw = [0u8; SLOT_BITMAP_LEN];
        cur.read_exact(&mut slots_raw)?;
        let replicates = read_optional_node_id(&mut cur)?;
        let port = cur.get_u16();
        let flags = NodeFlags::new(cur.get_u16());
        let state_fail = cur.get_u8() != 0;
        let mflags = cur.get_u8();
        let current_epoch = cur.get_u64();
        let config_epoch = cur.get_u64();
        let repl_offset = cur.get_u64();

        // per-type length check before touching the payload
        let expected = match kind {
            MessageType::Ping | MessageType::Pong | MessageType::Meet => {
                HEADER_LEN + count * GOSSIP_ENTRY_LEN
            }
            MessageType::Fail => HEADER_LEN + NODE_ID_LEN,
            MessageType::Publish => {
                if cur.remaining() < 8 {
                    return Err(err_data("truncated publish payload"));
                }
                let channel_len =
                    u32::from_be_bytes(cur[0..4].try_into().expect("sized slice")) as usize;
                let message_len =
                    u32::from_be_bytes(cur[4..8].try_into().expect("sized slice")) as usize;
                HEADER_LEN + 8 + channel_len + message_len
            }
            MessageType::FailoverAuthRequest
            | MessageType::FailoverAuthAck
            | MessageType::MfStart => HEADER_LEN,
            MessageType::Update => HEADER_LEN + NODE_ID_LEN + 8 + SLOT_BITMAP_LEN,
        };
        if totlen != expected {
            return Err(err_data("total length does not match message type"));
        }

        let body = match kind {
            MessageType::Ping | MessageType::Pong | MessageType::Meet => {
                let mut entries = Vec::with_capacity(count);
                for _ in 0..count {
                    entries.push(decode_gossip_entry(&mut cur)?);
                }
                match kind {
                    MessageType::Ping => MessageBody::Ping(entries),
                    MessageType::Pong => MessageBody::Pong(entries),
                    _ => MessageBody::Meet(entries),
                }
            }
            MessageType::Fail => MessageBody::Fail {
                node: read_node_id(&mut cur)?,
            },
            MessageType::Publish => {
                let channel_len = cur.get_u32() as usize;
                let message_len = cur.get_u32() as usize;
                let mut channel = vec![0u8; channel_len];
                cur.read_exact(&mut channel)?;
                let mut message = vec![0u8; message_len];
                cur.read_exact(&mut message)?;
                MessageBody::Publish {
                    channel: channel.into(),
                    message: message.into(),
                }
            }
            MessageType::FailoverAuthRequest => MessageBody::FailoverAuthRequest,
            MessageType::FailoverAuthAck => MessageBody::FailoverAuthAck,
            MessageType::MfStart => MessageBody::MfStart,
            MessageType::Update => {
                let node = read_node_id(&mut cur)?;
                let config_epoch = cur.get_u64();
                let mut raw = [0u8; SLOT_BITMAP_LEN];
                cur.read_exact(&mut raw)?;
                MessageBody::Update {
                    node,
                    config_epoch,
                    slots: SlotBitmap::from_raw(raw),
                }
            }
        };

        Ok(Message {
            header: MessageHeader {
                sender,
                slots: SlotBitmap::from_raw(slots_raw),
                replicates,
                port,
                flags,
                state_fail,
                mflags,
                current_epoch,
                config_epoch,
                repl_offset,
            },
            body,
        })
    }
}

/// Inspects a partially received buffer and returns the full frame length
/// once it can be known, `None` while more bytes are needed.
///
/// Fails fast on a bad signature or an absurd length so a misbehaving peer
/// is cut off instead of buffered.
pub fn frame_length(buf: &[u8]) -> io::Result<Option<usize>> {
    if buf.len() < 10 {
        return Ok(None);
    }
    if buf[0..4] != SIGNATURE {
        return Err(err_data("bad signature"));
    }
    let totlen = u32::from_be_bytes(buf[6..10].try_into().expect("sized slice")) as usize;
    if totlen < HEADER_LEN || totlen > MAX_FRAME_LEN {
        return Err(err_data("bad message length"));
    }
    Ok(Some(totlen))
}

fn encode_gossip_entry(buf: &mut BytesMut, entry: &GossipEntry) {
    buf.put_slice(entry.node.as_bytes());
    buf.put_u64(entry.ping_sent);
    buf.put_u64(entry.pong_received);
    let host = entry.host.as_bytes();
    let n = host.len().min(HOST_LEN);
    buf.put_slice(&host[..n]);
    buf.put_bytes(0, HOST_LEN - n);
    buf.put_u16(entry.port);
    buf.put_u16(entry.flags.bits());
}

fn decode_gossip_entry(cur: &mut &[u8]) -> io::Result<GossipEntry> {
    let node = read_node_id(cur)?;
    if cur.remaining() < GOSSIP_ENTRY_LEN - NODE_ID_LEN {
        return Err(err_data("truncated gossip entry"));
    }
    let ping_sent = cur.get_u64();
    let pong_received = cur.get_u64();
    let mut host_raw = [0u8; HOST_LEN];
    cur.read_exact(&mut host_raw)?;
    let host = read_host(&host_raw)?;
    let port = cur.get_u16();
    let flags = NodeFlags::new(cur.get_u16());
    Ok(GossipEntry {
        node,
        ping_sent,
        pong_received,
        host,
        port,
        flags,
    })
}

fn read_node_id(cur: &mut &[u8]) -> io::Result<NodeId> {
    let mut raw = [0u8; NODE_ID_LEN];
    cur.read_exact(&mut raw)?;
    NodeId::from_raw(raw).map_err(|_| err_data("malformed node id"))
}

/// Reads a node id field where all zeroes means "none".
fn read_optional_node_id(cur: &mut &[u8]) -> io::Result<Option<NodeId>> {
    let mut raw = [0u8; NODE_ID_LEN];
    cur.read_exact(&mut raw)?;
    if raw.iter().all(|&b| b == 0) {
        return Ok(None);
    }
    NodeId::from_raw(raw)
        .map(Some)
        .map_err(|_| err_data("malformed master id"))
}

fn read_host(raw: &[u8; HOST_LEN]) -> io::Result<String> {
    let end = raw.iter().position(|&b| b == 0).unwrap_or(HOST_LEN);
    std::str::from_utf8(&raw[..end])
        .map(|s| s.to_string())
        .map_err(|_| err_data("malformed host"))
}

fn err_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> MessageHeader {
        let mut slots = SlotBitmap::new();
        slots.set(0);
        slots.set(5000);
        MessageHeader {
            sender: NodeId::random(),
            slots,
            replicates: None,
            port: 6379,
            flags: NodeFlags::new(NodeFlags::MASTER),
            state_fail: false,
            mflags: 0,
            current_epoch: 7,
            config_epoch: 3,
            repl_offset: 1234,
        }
    }

    fn entry() -> GossipEntry {
        GossipEntry {
            node: NodeId::random(),
            ping_sent: 111,
            pong_received: 222,
            host: "10.0.0.2".into(),
            port: 6380,
            flags: NodeFlags::new(NodeFlags::MASTER | NodeFlags::PFAIL),
        }
    }

    #[test]
    fn header_len_matches_layout() {
        let msg = Message {
            header: header(),
            body: MessageBody::MfStart,
        };
        assert_eq!(msg.encode().len(), HEADER_LEN);
    }

    #[test]
    fn ping_roundtrip() {
        let msg = Message {
            header: header(),
            body: MessageBody::Ping(vec![entry(), entry()]),
        };
        let encoded = msg.encode();
        let decoded = Message::decode(&encoded).unwrap();
        assert_eq!(decoded.kind(), MessageType::Ping);
        assert_eq!(decoded.header.sender, msg.header.sender);
        assert_eq!(decoded.header.current_epoch, 7);
        assert_eq!(decoded.header.slots.count(), 2);
        assert_eq!(decoded.gossip().unwrap().len(), 2);
        assert_eq!(decoded.gossip().unwrap()[0], msg.gossip().unwrap()[0]);
    }

    #[test]
    fn replica_header_carries_master() {
        let master = NodeId::random();
        let mut h = header();
        h.replicates = Some(master);
        h.flags = NodeFlags::new(NodeFlags::REPLICA);
        let msg = Message {
            header: h,
            body: MessageBody::Pong(vec![]),
        };
        let decoded = Message::decode(&msg.encode()).unwrap();
        assert_eq!(decoded.header.replicates, Some(master));
    }

    #[test]
    fn fail_roundtrip() {
        let about = NodeId::random();
        let msg = Message {
            header: header(),
            body: MessageBody::Fail { node: about },
        };
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded.body {
            MessageBody::Fail { node } => assert_eq!(node, about),
            other => panic!("expected Fail, got {other:?}"),
        }
    }

    #[test]
    fn publish_roundtrip() {
        let msg = Message {
            header: header(),
            body: MessageBody::Publish {
                channel: Bytes::from_static(b"events"),
                message: Bytes::from_static(b"hello"),
            },
        };
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded.body {
            MessageBody::Publish { channel, message } => {
                assert_eq!(&channel[..], b"events");
                assert_eq!(&message[..], b"hello");
            }
            other => panic!("expected Publish, got {other:?}"),
        }
    }

    #[test]
    fn update_roundtrip() {
        let node = NodeId::random();
        let mut slots = SlotBitmap::new();
        slots.set(42);
        let msg = Message {
            header: header(),
            body: MessageBody::Update {
                node,
                config_epoch: 99,
                slots,
            },
        };
        let decoded = Message::decode(&msg.encode()).unwrap();
        match decoded.body {
            MessageBody::Update {
                node: n,
                config_epoch,
                slots,
            } => {
                assert_eq!(n, node);
                assert_eq!(config_epoch, 99);
                assert!(slots.get(42));
                assert_eq!(slots.count(), 1);
            }
            other => panic!("expected Update, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_signature() {
        let msg = Message {
            header: header(),
            body: MessageBody::MfStart,
        };
        let mut bytes = msg.encode().to_vec();
        bytes[0] = b'X';
        assert!(Message::decode(&bytes).is_err());
        assert!(frame_length(&bytes).is_err());
    }

    #[test]
    fn rejects_version_mismatch() {
        let msg = Message {
            header: header(),
            body: MessageBody::MfStart,
        };
        let mut bytes = msg.encode().to_vec();
        bytes[4] = 0xff;
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_length_type_mismatch() {
        // a FAIL frame whose totlen claims header-only
        let msg = Message {
            header: header(),
            body: MessageBody::Fail {
                node: NodeId::random(),
            },
        };
        let mut bytes = msg.encode().to_vec();
        bytes.truncate(HEADER_LEN);
        let fixed = (HEADER_LEN as u32).to_be_bytes();
        bytes[6..10].copy_from_slice(&fixed);
        // now it parses as a FAIL header with no payload: expected len differs
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn rejects_gossip_count_mismatch() {
        let msg = Message {
            header: header(),
            body: MessageBody::Ping(vec![entry()]),
        };
        let mut bytes = msg.encode().to_vec();
        // claim two entries while carrying one
        bytes[10..12].copy_from_slice(&2u16.to_be_bytes());
        assert!(Message::decode(&bytes).is_err());
    }

    #[test]
    fn frame_length_incremental() {
        let msg = Message {
            header: header(),
            body: MessageBody::Ping(vec![entry()]),
        };
        let encoded = msg.encode();
        assert_eq!(frame_length(&encoded[..4]).unwrap(), None);
        assert_eq!(
            frame_length(&encoded[..16]).unwrap(),
            Some(HEADER_LEN + GOSSIP_ENTRY_LEN)
        );
    }

    #[test]
    fn rejects_malformed_sender_id() {
        let msg = Message {
            header: header(),
            body: MessageBody::MfStart,
        };
        let mut bytes = msg.encode().to_vec();
        bytes[14] = b'Z'; // corrupt first byte of sender id
        assert!(Message::decode(&bytes).is_err());
    }
}
