//! RESP frame types.
//!
//! The [`Frame`] enum represents a single parsed RESP value.
//! Blob strings use `Bytes` for reference-counted storage.

use bytes::Bytes;

/// A single RESP protocol frame.
///
/// Covers what a node sends back to an administrative client: status
/// strings, errors, integers, bulk text (INFO reports, CONFIG values),
/// arrays (CONFIG GET pairs, pub/sub pushes), null, and maps.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Simple string response, e.g. `+OK\r\n`.
    Simple(String),

    /// Error response, e.g. `-ERR unknown command\r\n`.
    Error(String),

    /// 64-bit signed integer, e.g. `:42\r\n`.
    Integer(i64),

    /// Bulk (binary-safe) string, e.g. `$5\r\nhello\r\n`.
    Bulk(Bytes),

    /// Ordered array of frames, e.g. `*2\r\n+hello\r\n+world\r\n`.
    Array(Vec<Frame>),

    /// Null value: RESP3 `_\r\n`, or the RESP2 `$-1\r\n` / `*-1\r\n` forms.
    Null,

    /// Ordered map of key-value frame pairs, e.g. `%1\r\n+key\r\n+val\r\n`.
    Map(Vec<(Frame, Frame)>),
}

impl Frame {
    /// Builds a client command: an array of bulk strings.
    pub fn command<S: AsRef<str>>(args: &[S]) -> Frame {
        Frame::Array(
            args.iter()
                .map(|a| Frame::Bulk(Bytes::copy_from_slice(a.as_ref().as_bytes())))
                .collect(),
        )
    }

    /// Returns `true` if this frame is a null value.
    pub fn is_null(&self) -> bool {
        matches!(self, Frame::Null)
    }

    /// Returns `true` for a `+OK` status reply.
    pub fn is_ok(&self) -> bool {
        matches!(self, Frame::Simple(s) if s == "OK")
    }

    /// Returns the textual content of a simple or bulk string.
    ///
    /// Bulk data that isn't valid utf-8 yields `None`.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Simple(s) => Some(s),
            Frame::Bulk(b) => std::str::from_utf8(b).ok(),
            _ => None,
        }
    }
}
