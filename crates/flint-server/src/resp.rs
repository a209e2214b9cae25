//! Reply serialization for the client listener.
//!
//! Clients speak the inline form of the wire protocol (one
//! whitespace-separated command per line); replies use the standard typed
//! frames so redirections like `-MOVED 5000 host:port` come out verbatim.

use bytes::{BufMut, Bytes, BytesMut};

/// A reply frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// `+OK`-style simple string.
    Simple(String),
    /// `-ERR ...` / `-MOVED ...` error line.
    Error(String),
    /// `:N` integer.
    Int(i64),
    /// `$len` bulk payload.
    Bulk(Bytes),
    /// `$-1` null bulk.
    Nil,
    /// `*N` array of frames.
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Simple("OK".to_string())
    }

    pub fn bulk(s: impl Into<Bytes>) -> Self {
        Reply::Bulk(s.into())
    }

    /// Serializes the frame into `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        match self {
            Reply::Simple(s) => {
                buf.put_u8(b'+');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Error(s) => {
                buf.put_u8(b'-');
                buf.put_slice(s.as_bytes());
                buf.put_slice(b"\r\n");
            }
            Reply::Int(n) => {
                buf.put_slice(format!(":{n}\r\n").as_bytes());
            }
            Reply::Bulk(data) => {
                buf.put_slice(format!("${}\r\n", data.len()).as_bytes());
                buf.put_slice(data);
                buf.put_slice(b"\r\n");
            }
            Reply::Nil => {
                buf.put_slice(b"$-1\r\n");
            }
            Reply::Array(items) => {
                buf.put_slice(format!("*{}\r\n", items.len()).as_bytes());
                for item in items {
                    item.encode(buf);
                }
            }
        }
    }
}

/// Splits one inline command line into arguments. No quoting; the operator
/// surface doesn't need it.
pub fn parse_inline(line: &str) -> Vec<Bytes> {
    line.split_whitespace()
        .map(|part| Bytes::copy_from_slice(part.as_bytes()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(reply: Reply) -> String {
        let mut buf = BytesMut::new();
        reply.encode(&mut buf);
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn frames() {
        assert_eq!(encoded(Reply::ok()), "+OK\r\n");
        assert_eq!(
            encoded(Reply::Error("MOVED 5000 10.0.0.2:6379".into())),
            "-MOVED 5000 10.0.0.2:6379\r\n"
        );
        assert_eq!(encoded(Reply::Int(42)), ":42\r\n");
        assert_eq!(encoded(Reply::bulk("hi")), "$2\r\nhi\r\n");
        assert_eq!(encoded(Reply::Nil), "$-1\r\n");
        assert_eq!(
            encoded(Reply::Array(vec![Reply::Int(1), Reply::Nil])),
            "*2\r\n:1\r\n$-1\r\n"
        );
    }

    #[test]
    fn inline_parsing() {
        let args = parse_inline("CLUSTER MEET 10.0.0.2  6379\r");
        assert_eq!(args.len(), 4);
        assert_eq!(&args[0][..], b"CLUSTER");
        assert_eq!(&args[3][..], b"6379");
        assert!(parse_inline("   ").is_empty());
    }
}
